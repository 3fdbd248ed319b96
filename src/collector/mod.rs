pub mod bucket;
pub mod doc;
pub mod minhash_store;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

pub use bucket::{BucketCollectorHandle, BucketSize};
pub use doc::{DocCollectorHandle, DocSize, MergeTracker};
pub use minhash_store::{MinHashCollectorHandle, MinHashSize};

/// Batch flush trigger: preprocessor workers submit once this many buckets
/// are pending locally, and bucket shards pack roughly this many band keys
/// into each processor request.
pub const REQUEST_LEN: usize = 1024;

/// Shard inbox capacity; a full inbox blocks the sender, which is the
/// high-water backpressure of the pipeline.
pub const INBOX_HIGH_WATER: usize = 64;

const RPC_ATTEMPTS: usize = 3;

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("{family} shard {shard} is gone")]
    ShardGone { family: &'static str, shard: usize },
    #[error("{family} shard {shard} kept dropping replies")]
    ReplyLost { family: &'static str, shard: usize },
    #[error("minhash shard {shard} has no signature for doc {doc_id}")]
    UnknownDocument { shard: usize, doc_id: u64 },
    #[error("bucket shard {shard} has no registered processor")]
    NoProcessor { shard: usize },
}

/// One request/reply round against a shard, with a bounded retry on a
/// dropped reply. A closed inbox means the shard is gone for good, so that
/// case is not retried.
pub(crate) async fn call<M, R>(
    family: &'static str,
    shard: usize,
    tx: &mpsc::Sender<M>,
    make: impl Fn(oneshot::Sender<R>) -> M,
) -> Result<R, CollectorError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let (reply_tx, reply_rx) = oneshot::channel();
        if tx.send(make(reply_tx)).await.is_err() {
            return Err(CollectorError::ShardGone { family, shard });
        }
        match reply_rx.await {
            Ok(reply) => return Ok(reply),
            Err(_) if attempt < RPC_ATTEMPTS => {
                warn!(family, shard, attempt, "collector dropped a reply, retrying");
            }
            Err(_) => return Err(CollectorError::ReplyLost { family, shard }),
        }
    }
}
