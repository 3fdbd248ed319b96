use super::{Config, ConfigError};

impl Config {
    /// Fatal configuration problems, reported before any actor is spawned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(ConfigError::InvalidConfig(format!(
                "threshold must be in (0, 1], got {}",
                self.threshold
            )));
        }
        if self.num_permutations == 0 {
            return Err(ConfigError::InvalidConfig(
                "num_permutations must be at least 1".to_string(),
            ));
        }
        if self.shingles_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "shingles_size must be at least 1".to_string(),
            ));
        }
        if self.delimiters.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "delimiters must not be empty".to_string(),
            ));
        }
        for (name, count) in [
            ("num_bucket_actors", self.num_bucket_actors),
            ("num_minhash_actors", self.num_minhash_actors),
            ("num_doc_actors", self.num_doc_actors),
            ("num_preprocessors", self.num_preprocessors),
        ] {
            if count == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "{name} must be at least 1"
                )));
            }
        }
        for (name, cpu) in [
            ("bucket_cpu", self.bucket_cpu),
            ("mhash_cpu", self.mhash_cpu),
            ("doc_cpu", self.doc_cpu),
            ("worker_cpu", self.worker_cpu),
        ] {
            if !(cpu > 0.0) {
                return Err(ConfigError::InvalidConfig(format!(
                    "{name} must be positive, got {cpu}"
                )));
            }
        }
        Ok(())
    }
}
