use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{CollectorError, INBOX_HIGH_WATER, call};

/// Size report of one doc shard: kept and removed doc counts with estimated
/// retained bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocSize {
    pub kept: u64,
    pub kept_bytes: u64,
    pub removed: u64,
    pub removed_bytes: u64,
}

/// Counts merge notices in flight between doc shards. A notice is counted
/// before it is sent and released after the receiving shard applied it, so
/// `drained` returning means every transitively-triggered rewrite has
/// landed.
pub struct MergeTracker {
    outstanding: AtomicUsize,
    notify: Notify,
}

impl MergeTracker {
    fn new() -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    fn inc(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    fn dec(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }

    pub async fn drained(&self) {
        loop {
            let notified = self.notify.notified();
            if self.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Cross-shard merge notice: cluster `loser` collapsed into `winner`.
struct MergeNotice {
    loser: u64,
    winner: u64,
}

enum DocRequest {
    AddClusters {
        batch: Vec<(u64, u64)>,
        reply: oneshot::Sender<()>,
    },
    AddRemoved {
        batch: Vec<u64>,
        reply: oneshot::Sender<()>,
    },
    Filter {
        ids: Vec<u64>,
        reply: oneshot::Sender<Vec<(u64, u64)>>,
    },
    LocalRoots {
        reply: oneshot::Sender<Vec<(u64, u64)>>,
    },
    ApplyCanonical {
        map: Arc<FxHashMap<u64, u64>>,
        reply: oneshot::Sender<()>,
    },
    GetSize {
        reply: oneshot::Sender<DocSize>,
    },
}

/// Client handle for one doc shard. The shard owns the docs with
/// `doc_id mod num_shards == shard`.
#[derive(Clone)]
pub struct DocCollectorHandle {
    shard: usize,
    tx: mpsc::Sender<DocRequest>,
}

impl DocCollectorHandle {
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Sets or updates cluster assignments. A conflicting update collapses
    /// the two clusters: the smaller representative wins, and the losing
    /// cluster id is rewritten everywhere via the merge lane.
    pub async fn add_clusters(&self, batch: Vec<(u64, u64)>) -> Result<(), CollectorError> {
        call("doc", self.shard, &self.tx, |reply| {
            DocRequest::AddClusters {
                batch: batch.clone(),
                reply,
            }
        })
        .await
    }

    /// Marks docs as dropped. Removal is final: the doc never reappears in
    /// `filter` output, though merges keep flowing through its assignments.
    pub async fn add_removed(&self, batch: Vec<u64>) -> Result<(), CollectorError> {
        call("doc", self.shard, &self.tx, |reply| {
            DocRequest::AddRemoved {
                batch: batch.clone(),
                reply,
            }
        })
        .await
    }

    /// Returns `(doc_id, cluster_id)` for every surviving id in `ids`. Ids
    /// this shard has never seen were never bucketed with another doc; they
    /// survive as their own singleton cluster.
    pub async fn filter(&self, ids: Vec<u64>) -> Result<Vec<(u64, u64)>, CollectorError> {
        call("doc", self.shard, &self.tx, |reply| DocRequest::Filter {
            ids: ids.clone(),
            reply,
        })
        .await
    }

    /// Reports, per resolved cluster root, the smallest surviving doc id
    /// held by this shard. Input to the coordinator's canonicalization
    /// barrier.
    pub async fn local_roots(&self) -> Result<Vec<(u64, u64)>, CollectorError> {
        call("doc", self.shard, &self.tx, |reply| DocRequest::LocalRoots {
            reply,
        })
        .await
    }

    /// Installs the global `root -> canonical representative` map computed
    /// by the coordinator.
    pub async fn apply_canonical(
        &self,
        map: Arc<FxHashMap<u64, u64>>,
    ) -> Result<(), CollectorError> {
        call("doc", self.shard, &self.tx, |reply| {
            DocRequest::ApplyCanonical {
                map: map.clone(),
                reply,
            }
        })
        .await
    }

    pub async fn get_size(&self) -> Result<DocSize, CollectorError> {
        call("doc", self.shard, &self.tx, |reply| DocRequest::GetSize {
            reply,
        })
        .await
    }
}

struct DocShard {
    shard: usize,
    entries: FxHashMap<u64, u64>,
    removed: FxHashSet<u64>,
    /// Cluster rewrite memo, `loser -> winner` with `winner < loser`.
    /// Chains always step downward, so resolution cannot cycle.
    merges: FxHashMap<u64, u64>,
    canonical: Arc<FxHashMap<u64, u64>>,
    peers: Vec<mpsc::UnboundedSender<MergeNotice>>,
    tracker: Arc<MergeTracker>,
}

impl DocShard {
    fn resolve(&self, mut id: u64) -> u64 {
        while let Some(&next) = self.merges.get(&id) {
            id = next;
        }
        id
    }

    /// Records that `a` and `b` name the same cluster. New knowledge is
    /// announced to every sibling shard; already-implied unions are not,
    /// which keeps the notice volume proportional to the distinct merges.
    fn apply_union(&mut self, a: u64, b: u64) {
        let ra = self.resolve(a);
        let rb = self.resolve(b);
        if ra == rb {
            return;
        }
        let (winner, loser) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.merges.insert(loser, winner);
        for (peer, tx) in self.peers.iter().enumerate() {
            if peer == self.shard {
                continue;
            }
            self.tracker.inc();
            if tx.send(MergeNotice { loser, winner }).is_err() {
                self.tracker.dec();
            }
        }
    }

    fn add_clusters(&mut self, batch: Vec<(u64, u64)>) {
        for (doc_id, cluster) in batch {
            let cluster = self.resolve(cluster);
            match self.entries.get(&doc_id).copied() {
                Some(current) => {
                    let current = self.resolve(current);
                    if current == cluster {
                        self.entries.insert(doc_id, current);
                    } else {
                        self.entries.insert(doc_id, current.min(cluster));
                        self.apply_union(current, cluster);
                    }
                }
                None => {
                    self.entries.insert(doc_id, cluster);
                }
            }
        }
    }

    fn filter(&self, ids: &[u64]) -> Vec<(u64, u64)> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            if self.removed.contains(&id) {
                continue;
            }
            let cluster = match self.entries.get(&id) {
                Some(&assigned) => {
                    let root = self.resolve(assigned);
                    self.canonical.get(&root).copied().unwrap_or(root)
                }
                // Never shared a bucket with anyone: a singleton cluster.
                None => id,
            };
            out.push((id, cluster));
        }
        out
    }

    fn local_roots(&self) -> Vec<(u64, u64)> {
        let mut mins: FxHashMap<u64, u64> = FxHashMap::default();
        for (&doc_id, &cluster) in &self.entries {
            if self.removed.contains(&doc_id) {
                continue;
            }
            let root = self.resolve(cluster);
            mins.entry(root)
                .and_modify(|min| *min = (*min).min(doc_id))
                .or_insert(doc_id);
        }
        mins.into_iter().collect()
    }

    fn size(&self) -> DocSize {
        let kept = self
            .entries
            .keys()
            .filter(|id| !self.removed.contains(id))
            .count() as u64;
        DocSize {
            kept,
            kept_bytes: kept * 16,
            removed: self.removed.len() as u64,
            removed_bytes: self.removed.len() as u64 * 8,
        }
    }

    fn handle(&mut self, request: DocRequest) {
        match request {
            DocRequest::AddClusters { batch, reply } => {
                self.add_clusters(batch);
                let _ = reply.send(());
            }
            DocRequest::AddRemoved { batch, reply } => {
                self.removed.extend(batch);
                let _ = reply.send(());
            }
            DocRequest::Filter { ids, reply } => {
                let _ = reply.send(self.filter(&ids));
            }
            DocRequest::LocalRoots { reply } => {
                let _ = reply.send(self.local_roots());
            }
            DocRequest::ApplyCanonical { map, reply } => {
                self.canonical = map;
                let _ = reply.send(());
            }
            DocRequest::GetSize { reply } => {
                let _ = reply.send(self.size());
            }
        };
    }
}

async fn run(
    mut state: DocShard,
    mut rx: mpsc::Receiver<DocRequest>,
    mut merge_rx: mpsc::UnboundedReceiver<MergeNotice>,
) {
    loop {
        tokio::select! {
            biased;
            Some(notice) = merge_rx.recv() => {
                state.apply_union(notice.loser, notice.winner);
                state.tracker.dec();
            }
            request = rx.recv() => {
                match request {
                    Some(request) => state.handle(request),
                    None => break,
                }
            }
        }
    }
    debug!(shard = state.shard, "doc shard stopped");
}

/// Spawns the whole doc shard family. Shards get senders to each other's
/// merge lanes; the shared tracker lets the coordinator wait until every
/// in-flight merge notice has been applied.
pub fn spawn_shards(count: usize) -> (Vec<DocCollectorHandle>, Vec<JoinHandle<()>>, Arc<MergeTracker>) {
    let tracker = Arc::new(MergeTracker::new());
    let mut request_channels = Vec::with_capacity(count);
    let mut merge_txs = Vec::with_capacity(count);
    let mut merge_rxs = Vec::with_capacity(count);
    for _ in 0..count {
        request_channels.push(mpsc::channel(INBOX_HIGH_WATER));
        let (merge_tx, merge_rx) = mpsc::unbounded_channel();
        merge_txs.push(merge_tx);
        merge_rxs.push(merge_rx);
    }
    let mut handles = Vec::with_capacity(count);
    let mut joins = Vec::with_capacity(count);
    for (shard, ((tx, rx), merge_rx)) in request_channels
        .into_iter()
        .zip(merge_rxs)
        .enumerate()
    {
        let state = DocShard {
            shard,
            entries: FxHashMap::default(),
            removed: FxHashSet::default(),
            merges: FxHashMap::default(),
            canonical: Arc::new(FxHashMap::default()),
            peers: merge_txs.clone(),
            tracker: tracker.clone(),
        };
        joins.push(tokio::spawn(run(state, rx, merge_rx)));
        handles.push(DocCollectorHandle { shard, tx });
    }
    (handles, joins, tracker)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn filter_map(handle: &DocCollectorHandle, ids: Vec<u64>) -> FxHashMap<u64, u64> {
        handle.filter(ids).await.unwrap().into_iter().collect()
    }

    #[tokio::test]
    async fn test_conflicting_updates_collapse_to_smallest() {
        for first_cluster in [1u64, 3u64] {
            let (handles, joins, tracker) = spawn_shards(1);
            let second_cluster = if first_cluster == 1 { 3 } else { 1 };
            handles[0]
                .add_clusters(vec![(5, first_cluster), (3, 3), (1, 1)])
                .await
                .unwrap();
            handles[0]
                .add_clusters(vec![(5, second_cluster)])
                .await
                .unwrap();
            tracker.drained().await;
            let map = filter_map(&handles[0], vec![1, 3, 5]).await;
            // Both assignment orders converge to cluster 1 for everyone.
            assert_eq!(map.get(&5), Some(&1), "first={first_cluster}");
            assert_eq!(map.get(&3), Some(&1));
            assert_eq!(map.get(&1), Some(&1));
            drop(handles);
            for join in joins {
                join.await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_merges_propagate_across_shards() {
        let (handles, joins, tracker) = spawn_shards(2);
        // doc 4 lives on shard 0, docs 1/3/5 on shard 1
        handles[1].add_clusters(vec![(5, 3), (3, 3)]).await.unwrap();
        handles[0].add_clusters(vec![(4, 3)]).await.unwrap();
        // doc 5 also seen under rep 1: clusters 3 and 1 collapse
        handles[1].add_clusters(vec![(5, 1), (1, 1)]).await.unwrap();
        tracker.drained().await;
        let map0 = filter_map(&handles[0], vec![4]).await;
        assert_eq!(map0.get(&4), Some(&1));
        let map1 = filter_map(&handles[1], vec![1, 3, 5]).await;
        assert_eq!(map1.get(&3), Some(&1));
        drop(handles);
        for join in joins {
            join.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_removed_is_final_but_still_merges() {
        let (handles, joins, tracker) = spawn_shards(1);
        handles[0].add_clusters(vec![(4, 2), (2, 2)]).await.unwrap();
        handles[0].add_removed(vec![4]).await.unwrap();
        // A later keep attempt for doc 4 does not resurrect it, but its new
        // assignment still collapses clusters 2 and 0.
        handles[0].add_clusters(vec![(4, 0), (0, 0)]).await.unwrap();
        tracker.drained().await;
        let map = filter_map(&handles[0], vec![0, 2, 4]).await;
        assert!(!map.contains_key(&4));
        assert_eq!(map.get(&2), Some(&0));
        assert_eq!(map.get(&0), Some(&0));
        drop(handles);
        for join in joins {
            join.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_unseen_ids_survive_as_singletons() {
        let (handles, joins, _tracker) = spawn_shards(1);
        let map = filter_map(&handles[0], vec![8]).await;
        assert_eq!(map.get(&8), Some(&8));
        drop(handles);
        for join in joins {
            join.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_canonicalization_repoints_to_a_survivor() {
        let (handles, joins, tracker) = spawn_shards(1);
        // Bucket with a longer doc 3: rep 3 keeps, member 1 removed.
        handles[0].add_clusters(vec![(3, 3), (1, 3)]).await.unwrap();
        handles[0].add_removed(vec![1]).await.unwrap();
        // Bucket where 1 was the rep: clusters 3 and 1 collapse to root 1,
        // which is itself removed.
        handles[0].add_clusters(vec![(1, 1), (2, 1)]).await.unwrap();
        handles[0].add_removed(vec![2]).await.unwrap();
        tracker.drained().await;

        let roots = handles[0].local_roots().await.unwrap();
        assert_eq!(roots, vec![(1, 3)]); // root 1, smallest survivor 3
        let canonical: FxHashMap<u64, u64> = roots.into_iter().collect();
        handles[0]
            .apply_canonical(Arc::new(canonical))
            .await
            .unwrap();

        let map = filter_map(&handles[0], vec![1, 2, 3]).await;
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&3), Some(&3));

        let size = handles[0].get_size().await.unwrap();
        assert_eq!(size.kept, 1);
        assert_eq!(size.removed, 2);
        drop(handles);
        for join in joins {
            join.await.unwrap();
        }
    }
}
