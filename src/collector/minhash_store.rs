use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{CollectorError, INBOX_HIGH_WATER, call};
use crate::minhash::Signature;

/// Size report of one minhash shard.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinHashSize {
    pub docs: u64,
    pub bytes: u64,
}

enum MinHashRequest {
    AddMinHashes {
        batch: Vec<(u64, u64, Signature)>,
        reply: oneshot::Sender<()>,
    },
    GetMinHashes {
        ids: Vec<u64>,
        reply: oneshot::Sender<Result<Vec<(u64, u64, Signature)>, CollectorError>>,
    },
    GetSize {
        reply: oneshot::Sender<MinHashSize>,
    },
}

/// Client handle for one minhash shard. The shard owns the docs with
/// `doc_id mod num_shards == shard`.
#[derive(Clone)]
pub struct MinHashCollectorHandle {
    shard: usize,
    tx: mpsc::Sender<MinHashRequest>,
}

impl MinHashCollectorHandle {
    pub fn shard(&self) -> usize {
        self.shard
    }

    pub async fn add_minhashes(
        &self,
        batch: Vec<(u64, u64, Signature)>,
    ) -> Result<(), CollectorError> {
        call("minhash", self.shard, &self.tx, |reply| {
            MinHashRequest::AddMinHashes {
                batch: batch.clone(),
                reply,
            }
        })
        .await
    }

    /// Returns `(doc_id, doc_length, signature)` for every requested id. An
    /// unknown id is an invariant violation: the preprocessor stored a
    /// minhash for every doc it ever put in a bucket.
    pub async fn get_minhashes(
        &self,
        ids: Vec<u64>,
    ) -> Result<Vec<(u64, u64, Signature)>, CollectorError> {
        call("minhash", self.shard, &self.tx, |reply| {
            MinHashRequest::GetMinHashes {
                ids: ids.clone(),
                reply,
            }
        })
        .await?
    }

    pub async fn get_size(&self) -> Result<MinHashSize, CollectorError> {
        call("minhash", self.shard, &self.tx, |reply| {
            MinHashRequest::GetSize { reply }
        })
        .await
    }
}

struct MinHashShard {
    shard: usize,
    docs: FxHashMap<u64, (u64, Signature)>,
}

impl MinHashShard {
    fn get(&self, ids: &[u64]) -> Result<Vec<(u64, u64, Signature)>, CollectorError> {
        let mut out = Vec::with_capacity(ids.len());
        for &doc_id in ids {
            let (length, signature) =
                self.docs
                    .get(&doc_id)
                    .ok_or(CollectorError::UnknownDocument {
                        shard: self.shard,
                        doc_id,
                    })?;
            out.push((doc_id, *length, signature.clone()));
        }
        Ok(out)
    }

    fn size(&self) -> MinHashSize {
        let bytes: usize = self
            .docs
            .values()
            .map(|(_, sig)| 32 + sig.capacity() * std::mem::size_of::<u64>())
            .sum();
        MinHashSize {
            docs: self.docs.len() as u64,
            bytes: bytes as u64,
        }
    }
}

/// Spawns one minhash shard actor.
pub fn spawn(shard: usize) -> (MinHashCollectorHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(INBOX_HIGH_WATER);
    let join = tokio::spawn(async move {
        let mut state = MinHashShard {
            shard,
            docs: FxHashMap::default(),
        };
        while let Some(request) = rx.recv().await {
            match request {
                MinHashRequest::AddMinHashes { batch, reply } => {
                    for (doc_id, length, signature) in batch {
                        state.docs.insert(doc_id, (length, signature));
                    }
                    let _ = reply.send(());
                }
                MinHashRequest::GetMinHashes { ids, reply } => {
                    let _ = reply.send(state.get(&ids));
                }
                MinHashRequest::GetSize { reply } => {
                    let _ = reply.send(state.size());
                }
            }
        }
        debug!(shard, "minhash shard stopped");
    });
    (MinHashCollectorHandle { shard, tx }, join)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_and_strict_lookup() {
        let (handle, join) = spawn(0);
        handle
            .add_minhashes(vec![(1, 10, vec![1, 2, 3]), (3, 20, vec![4, 5, 6])])
            .await
            .unwrap();
        let got = handle.get_minhashes(vec![3, 1]).await.unwrap();
        assert_eq!(got[0], (3, 20, vec![4, 5, 6]));
        assert_eq!(got[1], (1, 10, vec![1, 2, 3]));

        let err = handle.get_minhashes(vec![99]).await.unwrap_err();
        assert!(matches!(
            err,
            CollectorError::UnknownDocument { doc_id: 99, .. }
        ));

        let size = handle.get_size().await.unwrap();
        assert_eq!(size.docs, 2);
        drop(handle);
        join.await.unwrap();
    }
}
