use std::path::PathBuf;

use clap::Parser;

use super::{ConfigError, LogLevel};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Fuzzy document deduplication over columnar tables", long_about = None)]
#[command(rename_all = "snake_case")]
pub struct Config {
    /// Folder holding the input parquet tables
    #[arg(long, env = "FDEDUP_INPUT_FOLDER")]
    pub input_folder: PathBuf,

    /// Folder for the deduplicated output tables and run metadata
    #[arg(long, env = "FDEDUP_OUTPUT_FOLDER")]
    pub output_folder: PathBuf,

    /// Document text column name
    #[arg(long, default_value = "contents")]
    pub doc_column: String,

    /// Integer document id column name
    #[arg(long, default_value = "int_document_id")]
    pub id_column: String,

    /// Output cluster column name
    #[arg(long, default_value = "cluster")]
    pub cluster_column: String,

    /// Number of bucket collector shards
    #[arg(long, default_value = "1")]
    pub num_bucket_actors: usize,

    /// Number of minhash collector shards
    #[arg(long, default_value = "1")]
    pub num_minhash_actors: usize,

    /// Number of doc collector shards
    #[arg(long, default_value = "1")]
    pub num_doc_actors: usize,

    /// Table worker pool size for the preprocessing and filter phases
    #[arg(long, default_value = "1")]
    pub num_preprocessors: usize,

    /// CPU reservation per bucket shard
    #[arg(long, default_value = "0.5")]
    pub bucket_cpu: f64,

    /// CPU reservation per minhash shard
    #[arg(long, default_value = "0.5")]
    pub mhash_cpu: f64,

    /// CPU reservation per doc shard
    #[arg(long, default_value = "0.5")]
    pub doc_cpu: f64,

    /// CPU reservation per table worker
    #[arg(long, default_value = "1.0")]
    pub worker_cpu: f64,

    /// Signature width: number of minhash permutations
    #[arg(long, default_value = "64")]
    pub num_permutations: usize,

    /// Jaccard similarity cutoff for near-duplicates
    #[arg(long, default_value = "0.8")]
    pub threshold: f64,

    /// Number of words per shingle
    #[arg(long, default_value = "5")]
    pub shingles_size: usize,

    /// Token delimiter for splitting documents
    #[arg(long, default_value = " ")]
    pub delimiters: String,

    /// Treat the corpus as Japanese text (subword shingles)
    #[arg(long)]
    pub japanese_data: bool,

    /// Subword tokenizer model, loaded once per worker
    #[arg(long, env = "FDEDUP_TOKENIZER_MODEL", default_value = "./ja.tokenizer.json")]
    pub tokenizer_model: PathBuf,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,
}

impl Config {
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let config = Config::parse_from(args);
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "fdedup",
            "--input_folder",
            "/tmp/in",
            "--output_folder",
            "/tmp/out",
        ]
    }

    #[test]
    fn test_defaults_match_the_documented_cli() {
        let config = Config::from_args(base_args()).unwrap();
        assert_eq!(config.doc_column, "contents");
        assert_eq!(config.id_column, "int_document_id");
        assert_eq!(config.cluster_column, "cluster");
        assert_eq!(config.num_permutations, 64);
        assert_eq!(config.threshold, 0.8);
        assert_eq!(config.shingles_size, 5);
        assert_eq!(config.delimiters, " ");
        assert!(!config.japanese_data);
    }

    #[test]
    fn test_invalid_threshold_is_rejected() {
        let mut args = base_args();
        args.extend(["--threshold", "1.5"]);
        assert!(Config::from_args(args).is_err());
    }

    #[test]
    fn test_zero_shard_count_is_rejected() {
        let mut args = base_args();
        args.extend(["--num_bucket_actors", "0"]);
        assert!(Config::from_args(args).is_err());
    }
}
