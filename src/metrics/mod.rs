use prometheus::{IntGauge, Registry, TextEncoder};

/// Observational gauges for the pipeline. They mirror what an operator
/// watches while a run is in flight and never gate progress.
#[derive(Clone)]
pub struct PipelineGauges {
    registry: Registry,
    pub files_in_progress: IntGauge,
    pub files_completed: IntGauge,
    pub available_cpus: IntGauge,
    pub bucket_memory_bytes: IntGauge,
    pub minhash_memory_bytes: IntGauge,
    pub doc_memory_bytes: IntGauge,
}

impl PipelineGauges {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let files_in_progress = IntGauge::new(
            "fdedup_files_in_progress",
            "Number of tables currently being processed",
        )?;
        let files_completed = IntGauge::new(
            "fdedup_files_completed_total",
            "Number of tables fully processed",
        )?;
        let available_cpus =
            IntGauge::new("fdedup_available_cpus", "CPUs visible to this process")?;
        let bucket_memory_bytes = IntGauge::new(
            "fdedup_bucket_memory_bytes",
            "Estimated bytes retained by bucket shards at teardown",
        )?;
        let minhash_memory_bytes = IntGauge::new(
            "fdedup_minhash_memory_bytes",
            "Estimated bytes retained by minhash shards at teardown",
        )?;
        let doc_memory_bytes = IntGauge::new(
            "fdedup_doc_memory_bytes",
            "Estimated bytes retained by doc shards at teardown",
        )?;
        registry.register(Box::new(files_in_progress.clone()))?;
        registry.register(Box::new(files_completed.clone()))?;
        registry.register(Box::new(available_cpus.clone()))?;
        registry.register(Box::new(bucket_memory_bytes.clone()))?;
        registry.register(Box::new(minhash_memory_bytes.clone()))?;
        registry.register(Box::new(doc_memory_bytes.clone()))?;
        available_cpus.set(num_cpus::get() as i64);
        Ok(Self {
            registry,
            files_in_progress,
            files_completed,
            available_cpus,
            bucket_memory_bytes,
            minhash_memory_bytes,
            doc_memory_bytes,
        })
    }

    /// Renders the current gauge values in the Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}
