use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{CollectorError, INBOX_HIGH_WATER, REQUEST_LEN, call};
use crate::processor::InvokerHandle;

/// Size report of one bucket shard: bucket count and estimated retained
/// bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BucketSize {
    pub buckets: u64,
    pub bytes: u64,
}

enum BucketRequest {
    AddBuckets {
        batch: Vec<(u64, Vec<u64>)>,
        reply: oneshot::Sender<()>,
    },
    RegisterProcessor {
        invoker: InvokerHandle,
        reply: oneshot::Sender<()>,
    },
    ProcessBuckets {
        reply: oneshot::Sender<Result<(), CollectorError>>,
    },
    GetSize {
        reply: oneshot::Sender<BucketSize>,
    },
}

/// Client handle for one bucket shard. The shard owns the band keys with
/// `band_key mod num_shards == shard`.
#[derive(Clone)]
pub struct BucketCollectorHandle {
    shard: usize,
    tx: mpsc::Sender<BucketRequest>,
}

impl BucketCollectorHandle {
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Appends doc ids into each bucket's id list, deduplicating re-adds of
    /// the same doc within a bucket.
    pub async fn add_buckets(&self, batch: Vec<(u64, Vec<u64>)>) -> Result<(), CollectorError> {
        call("bucket", self.shard, &self.tx, |reply| {
            BucketRequest::AddBuckets {
                batch: batch.clone(),
                reply,
            }
        })
        .await
    }

    /// Attaches the downstream processor invoker; must happen before
    /// [`Self::process_buckets`].
    pub async fn register_processor(&self, invoker: InvokerHandle) -> Result<(), CollectorError> {
        call("bucket", self.shard, &self.tx, |reply| {
            BucketRequest::RegisterProcessor {
                invoker: invoker.clone(),
                reply,
            }
        })
        .await
    }

    /// Walks every bucket with at least two distinct docs and submits them
    /// to the processor invoker in requests of roughly [`REQUEST_LEN`] band
    /// keys. Singleton buckets are discarded. The invoker's bounded window
    /// backpressures this call.
    pub async fn process_buckets(&self) -> Result<(), CollectorError> {
        call("bucket", self.shard, &self.tx, |reply| {
            BucketRequest::ProcessBuckets { reply }
        })
        .await?
    }

    pub async fn get_size(&self) -> Result<BucketSize, CollectorError> {
        call("bucket", self.shard, &self.tx, |reply| {
            BucketRequest::GetSize { reply }
        })
        .await
    }
}

struct BucketShard {
    shard: usize,
    buckets: FxHashMap<u64, Vec<u64>>,
    invoker: Option<InvokerHandle>,
}

impl BucketShard {
    fn add_buckets(&mut self, batch: Vec<(u64, Vec<u64>)>) {
        for (band_key, doc_ids) in batch {
            let bucket = self.buckets.entry(band_key).or_default();
            for doc_id in doc_ids {
                if !bucket.contains(&doc_id) {
                    bucket.push(doc_id);
                }
            }
        }
    }

    async fn process_buckets(&mut self) -> Result<(), CollectorError> {
        let Some(invoker) = self.invoker.clone() else {
            return Err(CollectorError::NoProcessor { shard: self.shard });
        };
        let mut request: Vec<(u64, Vec<u64>)> = Vec::with_capacity(REQUEST_LEN);
        let mut submitted = 0usize;
        for (band_key, doc_ids) in &self.buckets {
            if doc_ids.len() < 2 {
                continue;
            }
            request.push((*band_key, doc_ids.clone()));
            if request.len() >= REQUEST_LEN {
                submitted += request.len();
                invoker.submit(std::mem::take(&mut request)).await?;
            }
        }
        if !request.is_empty() {
            submitted += request.len();
            invoker.submit(request).await?;
        }
        debug!(
            shard = self.shard,
            buckets = self.buckets.len(),
            submitted,
            "bucket shard finished submitting"
        );
        Ok(())
    }

    fn size(&self) -> BucketSize {
        let bytes: usize = self
            .buckets
            .values()
            .map(|ids| 48 + ids.capacity() * std::mem::size_of::<u64>())
            .sum();
        BucketSize {
            buckets: self.buckets.len() as u64,
            bytes: bytes as u64,
        }
    }
}

/// Spawns one bucket shard actor and returns its handle and join handle.
pub fn spawn(shard: usize) -> (BucketCollectorHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(INBOX_HIGH_WATER);
    let join = tokio::spawn(async move {
        let mut state = BucketShard {
            shard,
            buckets: FxHashMap::default(),
            invoker: None,
        };
        while let Some(request) = rx.recv().await {
            match request {
                BucketRequest::AddBuckets { batch, reply } => {
                    state.add_buckets(batch);
                    let _ = reply.send(());
                }
                BucketRequest::RegisterProcessor { invoker, reply } => {
                    state.invoker = Some(invoker);
                    let _ = reply.send(());
                }
                BucketRequest::ProcessBuckets { reply } => {
                    let result = state.process_buckets().await;
                    let _ = reply.send(result);
                }
                BucketRequest::GetSize { reply } => {
                    let _ = reply.send(state.size());
                }
            }
        }
        debug!(shard, "bucket shard stopped");
    });
    (BucketCollectorHandle { shard, tx }, join)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_buckets_dedupes_within_a_bucket() {
        let (handle, join) = spawn(0);
        handle
            .add_buckets(vec![(7, vec![1, 2, 1]), (9, vec![3])])
            .await
            .unwrap();
        handle.add_buckets(vec![(7, vec![2, 4])]).await.unwrap();
        let size = handle.get_size().await.unwrap();
        assert_eq!(size.buckets, 2);
        assert!(size.bytes > 0);
        drop(handle);
        join.await.unwrap();
    }

    #[tokio::test]
    async fn test_process_without_processor_is_an_error() {
        let (handle, join) = spawn(0);
        handle.add_buckets(vec![(7, vec![1, 2])]).await.unwrap();
        let err = handle.process_buckets().await.unwrap_err();
        assert!(matches!(err, CollectorError::NoProcessor { shard: 0 }));
        drop(handle);
        join.await.unwrap();
    }
}
