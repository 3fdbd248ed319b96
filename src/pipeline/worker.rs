use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Int64Array};
use arrow::compute::filter_record_batch;
use arrow::record_batch::RecordBatch;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::PipelineError;
use crate::collector::{
    BucketCollectorHandle, DocCollectorHandle, MinHashCollectorHandle, REQUEST_LEN,
};
use crate::metrics::PipelineGauges;
use crate::minhash::{BandPlan, MinHasher, Signature, band_keys};
use crate::shingle::{Shingler, normalize};
use crate::table::{self, DataAccess};

/// Per-table processing counters, summed across workers and phases.
#[derive(Debug, Default, Clone, Copy)]
pub struct TableStats {
    pub source_documents: u64,
    pub result_documents: u64,
    pub generated_buckets: u64,
    pub generated_minhashes: u64,
}

impl TableStats {
    pub fn merge(&mut self, other: &TableStats) {
        self.source_documents += other.source_documents;
        self.result_documents += other.result_documents;
        self.generated_buckets += other.generated_buckets;
        self.generated_minhashes += other.generated_minhashes;
    }
}

#[derive(Debug, Default)]
pub struct WorkerReport {
    pub stats: TableStats,
    pub skipped_tables: Vec<String>,
}

/// Phase 1 transform: shingle, minhash and band every document, submitting
/// per-shard batches to the bucket and minhash collectors.
pub struct Preprocessor {
    doc_column: String,
    id_column: String,
    shingler: Shingler,
    minhasher: Arc<MinHasher>,
    plan: BandPlan,
    seed: u64,
    buckets: Vec<BucketCollectorHandle>,
    minhashes: Vec<MinHashCollectorHandle>,
    pending_buckets: FxHashMap<u64, Vec<u64>>,
    pending_minhashes: Vec<(u64, u64, Signature)>,
}

impl Preprocessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        doc_column: String,
        id_column: String,
        shingler: Shingler,
        minhasher: Arc<MinHasher>,
        plan: BandPlan,
        seed: u64,
        buckets: Vec<BucketCollectorHandle>,
        minhashes: Vec<MinHashCollectorHandle>,
    ) -> Self {
        Self {
            doc_column,
            id_column,
            shingler,
            minhasher,
            plan,
            seed,
            buckets,
            minhashes,
            pending_buckets: FxHashMap::default(),
            pending_minhashes: Vec::new(),
        }
    }

    /// Flushes pending buckets and minhashes once `limit` buckets are
    /// pending; `limit == 0` forces the end-of-table flush.
    async fn flush(&mut self, limit: usize, stats: &mut TableStats) -> Result<(), PipelineError> {
        if limit > 0 && self.pending_buckets.len() < limit {
            return Ok(());
        }
        if self.pending_buckets.is_empty() && self.pending_minhashes.is_empty() {
            return Ok(());
        }
        stats.generated_buckets += self.pending_buckets.len() as u64;
        stats.generated_minhashes += self.pending_minhashes.len() as u64;

        let bucket_shards = self.buckets.len() as u64;
        let mut bucket_requests: Vec<Vec<(u64, Vec<u64>)>> =
            (0..self.buckets.len()).map(|_| Vec::new()).collect();
        for (band_key, doc_ids) in self.pending_buckets.drain() {
            bucket_requests[(band_key % bucket_shards) as usize].push((band_key, doc_ids));
        }

        let minhash_shards = self.minhashes.len() as u64;
        let mut minhash_requests: Vec<Vec<(u64, u64, Signature)>> =
            (0..self.minhashes.len()).map(|_| Vec::new()).collect();
        for entry in self.pending_minhashes.drain(..) {
            minhash_requests[(entry.0 % minhash_shards) as usize].push(entry);
        }

        let bucket_calls = bucket_requests
            .into_iter()
            .enumerate()
            .filter(|(_, batch)| !batch.is_empty())
            .map(|(shard, batch)| self.buckets[shard].add_buckets(batch));
        futures::future::try_join_all(bucket_calls).await?;

        let minhash_calls = minhash_requests
            .into_iter()
            .enumerate()
            .filter(|(_, batch)| !batch.is_empty())
            .map(|(shard, batch)| self.minhashes[shard].add_minhashes(batch));
        futures::future::try_join_all(minhash_calls).await?;
        Ok(())
    }

    async fn process(
        &mut self,
        path: &Path,
        batch: &RecordBatch,
    ) -> Result<(Vec<RecordBatch>, TableStats), PipelineError> {
        let docs = table::string_column(batch, path, &self.doc_column)?;
        let ids = table::int64_column(batch, path, &self.id_column)?;
        let mut stats = TableStats {
            source_documents: batch.num_rows() as u64,
            ..TableStats::default()
        };
        for row in 0..batch.num_rows() {
            let doc = docs.value(row);
            let doc_id = ids.value(row) as u64;
            let normalized = normalize(doc);
            let shingles = self.shingler.shingles(&normalized);
            if shingles.is_empty() {
                // Nothing to compare against; the doc surfaces as its own
                // singleton cluster at filter time.
                continue;
            }
            let signature = self.minhasher.minhash(&shingles);
            let keys = band_keys(&signature, &self.plan, self.seed);
            self.pending_minhashes
                .push((doc_id, doc.chars().count() as u64, signature));
            for key in keys {
                self.pending_buckets.entry(key).or_default().push(doc_id);
            }
            self.flush(REQUEST_LEN, &mut stats).await?;
        }
        self.flush(0, &mut stats).await?;
        Ok((Vec::new(), stats))
    }
}

/// Phase 3 transform: drop removed docs, annotate survivors with their
/// cluster representative.
pub struct DocFilter {
    doc_column: String,
    id_column: String,
    cluster_column: String,
    docs: Vec<DocCollectorHandle>,
}

impl DocFilter {
    pub fn new(
        doc_column: String,
        id_column: String,
        cluster_column: String,
        docs: Vec<DocCollectorHandle>,
    ) -> Self {
        Self {
            doc_column,
            id_column,
            cluster_column,
            docs,
        }
    }

    async fn process(
        &mut self,
        path: &Path,
        batch: &RecordBatch,
    ) -> Result<(Vec<RecordBatch>, TableStats), PipelineError> {
        // The doc column is required here too: a table that was skipped in
        // preprocessing must also be skipped (not passed through) now.
        table::string_column(batch, path, &self.doc_column)?;
        let ids = table::int64_column(batch, path, &self.id_column)?;

        let doc_shards = self.docs.len() as u64;
        let mut requests: Vec<Vec<u64>> = (0..self.docs.len()).map(|_| Vec::new()).collect();
        for row in 0..batch.num_rows() {
            let doc_id = ids.value(row) as u64;
            requests[(doc_id % doc_shards) as usize].push(doc_id);
        }
        let calls = requests
            .into_iter()
            .enumerate()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(shard, ids)| self.docs[shard].filter(ids));
        let replies = futures::future::try_join_all(calls).await?;
        let survivors: FxHashMap<u64, u64> = replies.into_iter().flatten().collect();

        let mut mask = Vec::with_capacity(batch.num_rows());
        let mut clusters = Vec::new();
        for row in 0..batch.num_rows() {
            let doc_id = ids.value(row) as u64;
            match survivors.get(&doc_id) {
                Some(&cluster) => {
                    mask.push(true);
                    clusters.push(cluster as i64);
                }
                None => mask.push(false),
            }
        }
        let out = filter_record_batch(batch, &BooleanArray::from(mask)).map_err(table::TableError::from)?;
        let clusters: ArrayRef = Arc::new(Int64Array::from(clusters));
        let out = table::add_column(&out, &self.cluster_column, clusters)?;

        let stats = TableStats {
            source_documents: batch.num_rows() as u64,
            result_documents: out.num_rows() as u64,
            ..TableStats::default()
        };
        Ok((vec![out], stats))
    }
}

/// The two table transforms behind one dispatch surface, so the worker loop
/// stays generic over the phase it runs in.
pub enum TableTransform {
    Preprocess(Preprocessor),
    Filter(DocFilter),
}

impl TableTransform {
    pub async fn process(
        &mut self,
        path: &Path,
        batch: &RecordBatch,
    ) -> Result<(Vec<RecordBatch>, TableStats), PipelineError> {
        match self {
            TableTransform::Preprocess(preprocessor) => preprocessor.process(path, batch).await,
            TableTransform::Filter(filter) => filter.process(path, batch).await,
        }
    }
}

/// Pulls tables off the shared queue and runs them through its transform.
/// Schema problems skip the table; anything else aborts the worker and,
/// through it, the run.
pub struct TableWorker {
    worker: usize,
    transform: TableTransform,
    data_access: DataAccess,
    output_folder: Option<PathBuf>,
    gauges: PipelineGauges,
}

impl TableWorker {
    pub fn new(
        worker: usize,
        transform: TableTransform,
        data_access: DataAccess,
        output_folder: Option<PathBuf>,
        gauges: PipelineGauges,
    ) -> Self {
        Self {
            worker,
            transform,
            data_access,
            output_folder,
            gauges,
        }
    }

    pub async fn run(
        mut self,
        queue: Arc<Mutex<VecDeque<PathBuf>>>,
    ) -> Result<WorkerReport, PipelineError> {
        let mut report = WorkerReport::default();
        loop {
            let next = queue.lock().await.pop_front();
            let Some(path) = next else { break };
            self.gauges.files_in_progress.inc();
            let result = self.process_table(&path, &mut report).await;
            self.gauges.files_in_progress.dec();
            self.gauges.files_completed.inc();
            match result {
                Ok(()) => {}
                Err(PipelineError::Table(e)) if e.is_schema_error() => {
                    warn!(table = %path.display(), error = %e, "skipping table");
                    report.skipped_tables.push(format!("{}: {e}", path.display()));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    async fn process_table(
        &mut self,
        path: &Path,
        report: &mut WorkerReport,
    ) -> Result<(), PipelineError> {
        debug!(worker = self.worker, table = %path.display(), "processing table");
        let batch = self.data_access.get_table(path)?;
        let (tables, stats) = self.transform.process(path, &batch).await?;
        if let Some(folder) = &self.output_folder {
            let file_name = path.file_name().unwrap_or(path.as_os_str());
            for table in &tables {
                self.data_access.write_table(&folder.join(file_name), table)?;
            }
        }
        report.stats.merge(&stats);
        Ok(())
    }
}
