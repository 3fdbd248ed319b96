use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::error;

use crate::collector::{CollectorError, DocCollectorHandle, MinHashCollectorHandle};
use crate::minhash::{Signature, match_count};

/// Stateless bucket processor: resolves one batch of buckets into cluster
/// assignments and removals. Carries nothing across buckets, so the invoker
/// can run any number of clones in parallel.
#[derive(Clone)]
pub struct BucketProcessor {
    minhashes: Arc<Vec<MinHashCollectorHandle>>,
    docs: Arc<Vec<DocCollectorHandle>>,
    required_matches: usize,
}

impl BucketProcessor {
    pub fn new(
        minhashes: Vec<MinHashCollectorHandle>,
        docs: Vec<DocCollectorHandle>,
        required_matches: usize,
    ) -> Self {
        Self {
            minhashes: Arc::new(minhashes),
            docs: Arc::new(docs),
            required_matches,
        }
    }

    async fn fetch_signatures(
        &self,
        ids: &[u64],
    ) -> Result<Vec<(u64, u64, Signature)>, CollectorError> {
        let shards = self.minhashes.len() as u64;
        let mut per_shard: Vec<Vec<u64>> = vec![Vec::new(); self.minhashes.len()];
        for &id in ids {
            per_shard[(id % shards) as usize].push(id);
        }
        let fetches = per_shard
            .into_iter()
            .enumerate()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(shard, ids)| self.minhashes[shard].get_minhashes(ids));
        let replies = futures::future::try_join_all(fetches).await?;
        Ok(replies.into_iter().flatten().collect())
    }

    /// Processes one batch of `(band_key, doc_ids)` buckets.
    ///
    /// Per bucket: fetch the signatures, order docs longest-first (ties to
    /// the smaller id) and walk them greedily against the current
    /// representative. Docs within the match threshold are assigned to the
    /// rep and removed; everything else opens a new sub-cluster. Keeps and
    /// removals for the whole batch are flushed to the doc shards at the
    /// end.
    pub async fn process_batch(&self, batch: Vec<(u64, Vec<u64>)>) -> Result<(), CollectorError> {
        let doc_shards = self.docs.len() as u64;
        let mut keeps: Vec<Vec<(u64, u64)>> = vec![Vec::new(); self.docs.len()];
        let mut removes: Vec<Vec<u64>> = vec![Vec::new(); self.docs.len()];
        for (_band_key, mut ids) in batch {
            ids.sort_unstable();
            ids.dedup();
            if ids.len() < 2 {
                continue;
            }
            let mut entries = self.fetch_signatures(&ids).await?;
            entries.sort_unstable_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            let mut entries = entries.into_iter();
            let Some((mut rep_id, _, mut rep_sig)) = entries.next() else {
                continue;
            };
            keeps[(rep_id % doc_shards) as usize].push((rep_id, rep_id));
            for (doc_id, _, sig) in entries {
                if match_count(&rep_sig, &sig) >= self.required_matches {
                    keeps[(doc_id % doc_shards) as usize].push((doc_id, rep_id));
                    removes[(doc_id % doc_shards) as usize].push(doc_id);
                } else {
                    rep_id = doc_id;
                    rep_sig = sig;
                    keeps[(rep_id % doc_shards) as usize].push((rep_id, rep_id));
                }
            }
        }
        let keep_calls = keeps
            .into_iter()
            .enumerate()
            .filter(|(_, batch)| !batch.is_empty())
            .map(|(shard, batch)| self.docs[shard].add_clusters(batch));
        futures::future::try_join_all(keep_calls).await?;
        let remove_calls = removes
            .into_iter()
            .enumerate()
            .filter(|(_, batch)| !batch.is_empty())
            .map(|(shard, batch)| self.docs[shard].add_removed(batch));
        futures::future::try_join_all(remove_calls).await?;
        Ok(())
    }
}

struct InvokerInner {
    processor: BucketProcessor,
    /// Outstanding-submission window; acquiring blocks the submitting
    /// bucket shard once `2 * pool_size` batches are in flight.
    window: Arc<Semaphore>,
    /// Execution slots, one per pool worker.
    pool: Arc<Semaphore>,
    tasks: TaskTracker,
    cancel: CancellationToken,
    failure: Mutex<Option<CollectorError>>,
}

/// Fans bucket batches out to a bounded pool of processor runs. Cheap to
/// clone; every bucket shard holds one.
#[derive(Clone)]
pub struct InvokerHandle {
    inner: Arc<InvokerInner>,
}

impl InvokerHandle {
    pub fn new(processor: BucketProcessor, pool_size: usize) -> Self {
        Self {
            inner: Arc::new(InvokerInner {
                processor,
                window: Arc::new(Semaphore::new(pool_size * 2)),
                pool: Arc::new(Semaphore::new(pool_size)),
                tasks: TaskTracker::new(),
                cancel: CancellationToken::new(),
                failure: Mutex::new(None),
            }),
        }
    }

    /// Submits one batch, waiting for window space first.
    pub async fn submit(&self, batch: Vec<(u64, Vec<u64>)>) -> Result<(), CollectorError> {
        let inner = self.inner.clone();
        let Ok(window_permit) = inner.window.clone().acquire_owned().await else {
            return Err(CollectorError::ShardGone {
                family: "processor-invoker",
                shard: 0,
            });
        };
        self.inner.tasks.spawn(async move {
            let _window = window_permit;
            if inner.cancel.is_cancelled() {
                return;
            }
            let Ok(_slot) = inner.pool.clone().acquire_owned().await else {
                return;
            };
            if inner.cancel.is_cancelled() {
                return;
            }
            if let Err(e) = inner.processor.process_batch(batch).await {
                error!(error = %e, "bucket batch processing failed");
                inner.cancel.cancel();
                let mut failure = inner.failure.lock().await;
                if failure.is_none() {
                    *failure = Some(e);
                }
            }
        });
        Ok(())
    }

    /// Waits for the pool to drain; returns the first processing failure if
    /// any batch died.
    pub async fn wait_for_completion(&self) -> Result<(), CollectorError> {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        match self.inner.failure.lock().await.take() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{doc, minhash_store};

    #[tokio::test]
    async fn test_bucket_resolution_keeps_longest_and_removes_matches() {
        let (mh_handle, mh_join) = minhash_store::spawn(0);
        let mh_handles = vec![mh_handle];
        let (doc_handles, doc_joins, tracker) = doc::spawn_shards(1);

        // Docs 1 and 2 share a signature; doc 3 is unrelated but fell into
        // the same bucket (a false candidate).
        mh_handles[0]
            .add_minhashes(vec![
                (1, 50, vec![7, 7, 7, 7]),
                (2, 40, vec![7, 7, 7, 9]),
                (3, 30, vec![1, 2, 3, 4]),
            ])
            .await
            .unwrap();

        let processor =
            BucketProcessor::new(mh_handles.clone(), doc_handles.clone(), 3);
        let invoker = InvokerHandle::new(processor, 2);
        invoker.submit(vec![(99, vec![3, 2, 1, 2])]).await.unwrap();
        invoker.wait_for_completion().await.unwrap();
        tracker.drained().await;

        let survivors = doc_handles[0].filter(vec![1, 2, 3]).await.unwrap();
        let map: std::collections::HashMap<u64, u64> = survivors.into_iter().collect();
        // Doc 1 is longest, so it represents; 2 matched it and was dropped;
        // 3 failed the exact check and opened its own sub-cluster.
        assert_eq!(map.get(&1), Some(&1));
        assert_eq!(map.get(&3), Some(&3));
        assert!(!map.contains_key(&2));

        drop(invoker);
        drop(mh_handles);
        drop(doc_handles);
        mh_join.await.unwrap();
        for join in doc_joins {
            join.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_unknown_doc_id_fails_the_pool() {
        let (mh_handle, mh_join) = minhash_store::spawn(0);
        let (doc_handles, doc_joins, _tracker) = doc::spawn_shards(1);
        let processor = BucketProcessor::new(vec![mh_handle.clone()], doc_handles.clone(), 1);
        let invoker = InvokerHandle::new(processor, 1);
        invoker.submit(vec![(5, vec![10, 11])]).await.unwrap();
        let err = invoker.wait_for_completion().await.unwrap_err();
        assert!(matches!(err, CollectorError::UnknownDocument { .. }));
        drop(invoker);
        drop(mh_handle);
        drop(doc_handles);
        mh_join.await.unwrap();
        for join in doc_joins {
            join.await.unwrap();
        }
    }
}
