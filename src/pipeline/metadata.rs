use serde::Serialize;

/// Process-wide execution report, written beside the output tables at the
/// end of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunMetadata {
    pub bands: usize,
    pub band_length: usize,
    pub number_of_buckets: u64,
    pub number_of_docs: u64,
    pub number_of_removed_docs: u64,
    pub number_of_min_hashes: u64,
    pub overall_hash_memory: u64,
    pub de_duplication_percent: f64,
    pub source_documents: u64,
    pub result_documents: u64,
    pub generated_buckets: u64,
    pub generated_minhashes: u64,
    pub skipped_tables: Vec<String>,
}
