pub mod metadata;
pub mod worker;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::RANDOM_SEED;
use crate::app::config::{Config, ConfigError};
use crate::collector::{CollectorError, bucket, doc, minhash_store};
use crate::metrics::PipelineGauges;
use crate::minhash::{MinHasher, optimal_band_plan, required_matches};
use crate::processor::{BucketProcessor, InvokerHandle};
use crate::shingle::{Shingler, ShingleError};
use crate::table::{DataAccess, TableError};

pub use metadata::RunMetadata;
pub use worker::{DocFilter, Preprocessor, TableStats, TableTransform, TableWorker, WorkerReport};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Collector(#[from] CollectorError),
    #[error(transparent)]
    Shingle(#[from] ShingleError),
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("metrics initialization failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Join handles of every actor the pipeline has spawned, so a fatal error
/// can cancel whatever is still running.
#[derive(Default)]
struct Fleet {
    bucket_joins: Vec<JoinHandle<()>>,
    minhash_joins: Vec<JoinHandle<()>>,
    doc_joins: Vec<JoinHandle<()>>,
}

impl Fleet {
    fn abort(&mut self) {
        for join in self
            .bucket_joins
            .drain(..)
            .chain(self.minhash_joins.drain(..))
            .chain(self.doc_joins.drain(..))
        {
            join.abort();
        }
    }
}

/// Coordinates the three phases: preprocessing, bucket resolution and
/// filtering. Owns actor lifecycle, the phase barriers and the final
/// metadata document.
pub struct Pipeline {
    config: Arc<Config>,
    data_access: DataAccess,
    gauges: PipelineGauges,
}

impl Pipeline {
    pub fn new(config: Config) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            data_access: DataAccess::new(),
            gauges: PipelineGauges::new()?,
        })
    }

    pub fn gauges(&self) -> &PipelineGauges {
        &self.gauges
    }

    pub async fn run(&self) -> Result<RunMetadata, PipelineError> {
        let mut fleet = Fleet::default();
        let result = self.execute(&mut fleet).await;
        if result.is_err() {
            fleet.abort();
        }
        result
    }

    async fn execute(&self, fleet: &mut Fleet) -> Result<RunMetadata, PipelineError> {
        let config = &self.config;
        let files = self.data_access.list_files(&config.input_folder)?;
        let plan = optimal_band_plan(config.threshold, config.num_permutations, 0.5, 0.5);
        if plan.rows_used() > config.num_permutations {
            return Err(ConfigError::InvalidConfig(format!(
                "banding layout {}x{} exceeds {} permutations",
                plan.bands, plan.band_length, config.num_permutations
            ))
            .into());
        }
        info!(
            files = files.len(),
            bands = plan.bands,
            band_length = plan.band_length,
            threshold = config.threshold,
            "starting fuzzy dedup run"
        );
        let minhasher = Arc::new(MinHasher::new(config.num_permutations, RANDOM_SEED));
        let required = required_matches(config.threshold, config.num_permutations);

        // Phase 1: preprocessing.
        let mut bucket_handles = Vec::with_capacity(config.num_bucket_actors);
        for shard in 0..config.num_bucket_actors {
            let (handle, join) = bucket::spawn(shard);
            bucket_handles.push(handle);
            fleet.bucket_joins.push(join);
        }
        let mut minhash_handles = Vec::with_capacity(config.num_minhash_actors);
        for shard in 0..config.num_minhash_actors {
            let (handle, join) = minhash_store::spawn(shard);
            minhash_handles.push(handle);
            fleet.minhash_joins.push(join);
        }
        // Doc collectors do not exist yet, so their CPU budget is lent to
        // extra table readers for this phase.
        let n_readers = config.num_preprocessors
            + ((config.num_doc_actors as f64 * config.doc_cpu) / config.worker_cpu) as usize;
        info!(
            bucket_shards = bucket_handles.len(),
            minhash_shards = minhash_handles.len(),
            readers = n_readers,
            "phase 1: preprocessing"
        );
        let mut transforms = Vec::with_capacity(n_readers);
        for _ in 0..n_readers {
            transforms.push(TableTransform::Preprocess(Preprocessor::new(
                config.doc_column.clone(),
                config.id_column.clone(),
                self.build_shingler()?,
                minhasher.clone(),
                plan,
                RANDOM_SEED,
                bucket_handles.clone(),
                minhash_handles.clone(),
            )));
        }
        let (phase1_stats, mut skipped_tables) = self.run_workers(&files, transforms, None).await?;

        // Phase 2: bucket resolution.
        let (doc_handles, mut doc_joins, merge_tracker) = doc::spawn_shards(config.num_doc_actors);
        fleet.doc_joins.append(&mut doc_joins);
        let processor =
            BucketProcessor::new(minhash_handles.clone(), doc_handles.clone(), required);
        let invoker = InvokerHandle::new(processor, config.num_preprocessors);
        for handle in &bucket_handles {
            handle.register_processor(invoker.clone()).await?;
        }
        info!(
            doc_shards = doc_handles.len(),
            pool = config.num_preprocessors,
            "phase 2: bucket resolution"
        );
        futures::future::try_join_all(bucket_handles.iter().map(|b| b.process_buckets())).await?;
        invoker.wait_for_completion().await?;
        // The invoker pool holds minhash and doc handle clones; release them
        // so those shard channels can actually close at teardown.
        drop(invoker);
        merge_tracker.drained().await;

        // Cluster closure barrier: fold per-shard minima into the global
        // root -> canonical-survivor map and hand it back to every shard.
        let mut canonical: FxHashMap<u64, u64> = FxHashMap::default();
        for handle in &doc_handles {
            for (root, min_doc) in handle.local_roots().await? {
                canonical
                    .entry(root)
                    .and_modify(|min| *min = (*min).min(min_doc))
                    .or_insert(min_doc);
            }
        }
        debug!(clusters = canonical.len(), "canonicalized cluster roots");
        let canonical = Arc::new(canonical);
        futures::future::try_join_all(
            doc_handles
                .iter()
                .map(|d| d.apply_canonical(canonical.clone())),
        )
        .await?;

        // Bucket and minhash shards are done; collect sizes and retire them.
        let mut number_of_buckets = 0;
        let mut bucket_memory = 0;
        for handle in &bucket_handles {
            let size = handle.get_size().await?;
            number_of_buckets += size.buckets;
            bucket_memory += size.bytes;
        }
        let mut number_of_min_hashes = 0;
        let mut minhash_memory = 0;
        for handle in &minhash_handles {
            let size = handle.get_size().await?;
            number_of_min_hashes += size.docs;
            minhash_memory += size.bytes;
        }
        self.gauges.bucket_memory_bytes.set(bucket_memory as i64);
        self.gauges.minhash_memory_bytes.set(minhash_memory as i64);
        info!(
            number_of_buckets,
            bucket_memory, number_of_min_hashes, minhash_memory, "retiring bucket and minhash shards"
        );
        drop(bucket_handles);
        drop(minhash_handles);
        for join in fleet.bucket_joins.drain(..).chain(fleet.minhash_joins.drain(..)) {
            join.await?;
        }

        // Phase 3: filtering.
        info!(workers = config.num_preprocessors, "phase 3: filtering");
        let mut transforms = Vec::with_capacity(config.num_preprocessors);
        for _ in 0..config.num_preprocessors {
            transforms.push(TableTransform::Filter(DocFilter::new(
                config.doc_column.clone(),
                config.id_column.clone(),
                config.cluster_column.clone(),
                doc_handles.clone(),
            )));
        }
        let (phase3_stats, mut phase3_skipped) = self
            .run_workers(&files, transforms, Some(config.output_folder.clone()))
            .await?;
        skipped_tables.append(&mut phase3_skipped);

        let mut number_of_docs = 0;
        let mut doc_memory = 0;
        let mut number_of_removed_docs = 0;
        let mut removed_memory = 0;
        for handle in &doc_handles {
            let size = handle.get_size().await?;
            number_of_docs += size.kept;
            doc_memory += size.kept_bytes;
            number_of_removed_docs += size.removed;
            removed_memory += size.removed_bytes;
        }
        self.gauges
            .doc_memory_bytes
            .set((doc_memory + removed_memory) as i64);
        drop(doc_handles);
        for join in fleet.doc_joins.drain(..) {
            join.await?;
        }

        let de_duplication_percent = if phase3_stats.source_documents > 0 {
            100.0
                * (1.0
                    - phase3_stats.result_documents as f64 / phase3_stats.source_documents as f64)
        } else {
            0.0
        };
        let metadata = RunMetadata {
            bands: plan.bands,
            band_length: plan.band_length,
            number_of_buckets,
            number_of_docs,
            number_of_removed_docs,
            number_of_min_hashes,
            overall_hash_memory: bucket_memory + minhash_memory + doc_memory + removed_memory,
            de_duplication_percent,
            source_documents: phase3_stats.source_documents,
            result_documents: phase3_stats.result_documents,
            generated_buckets: phase1_stats.generated_buckets,
            generated_minhashes: phase1_stats.generated_minhashes,
            skipped_tables,
        };
        self.data_access
            .write_metadata(&config.output_folder.join("metadata.json"), &metadata)?;
        info!(
            source = metadata.source_documents,
            result = metadata.result_documents,
            dedup_percent = metadata.de_duplication_percent,
            "fuzzy dedup run complete"
        );
        Ok(metadata)
    }

    fn build_shingler(&self) -> Result<Shingler, PipelineError> {
        let config = &self.config;
        if config.japanese_data {
            Ok(Shingler::with_tokenizer(
                config.shingles_size,
                config.delimiters.clone(),
                &config.tokenizer_model,
            )?)
        } else {
            Ok(Shingler::new(
                config.shingles_size,
                config.delimiters.clone(),
            ))
        }
    }

    /// Runs one worker pool over the whole file list and joins the pool.
    /// The first fatal worker error wins; schema-skips are merged into the
    /// returned warning list.
    async fn run_workers(
        &self,
        files: &[PathBuf],
        transforms: Vec<TableTransform>,
        output_folder: Option<PathBuf>,
    ) -> Result<(TableStats, Vec<String>), PipelineError> {
        self.gauges.files_in_progress.set(0);
        self.gauges.files_completed.set(0);
        let queue: Arc<Mutex<VecDeque<PathBuf>>> =
            Arc::new(Mutex::new(files.iter().cloned().collect()));
        let mut joins = Vec::with_capacity(transforms.len());
        for (index, transform) in transforms.into_iter().enumerate() {
            let worker = TableWorker::new(
                index,
                transform,
                self.data_access.clone(),
                output_folder.clone(),
                self.gauges.clone(),
            );
            joins.push(tokio::spawn(worker.run(queue.clone())));
        }
        let mut stats = TableStats::default();
        let mut skipped = Vec::new();
        let mut failure: Option<PipelineError> = None;
        for join in joins {
            match join.await {
                Ok(Ok(report)) => {
                    stats.merge(&report.stats);
                    skipped.extend(report.skipped_tables);
                }
                Ok(Err(e)) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(e.into());
                    }
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok((stats, skipped)),
        }
    }
}
