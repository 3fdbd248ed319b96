pub mod config;
pub mod logging;

use tracing::{error, info};

pub use config::{Config, ConfigError, LogLevel};
pub use logging::setup_logging;

use crate::pipeline::{Pipeline, RunMetadata};

pub struct App {
    pipeline: Pipeline,
}

impl App {
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        info!(
            "starting fdedup v{} over {}",
            env!("CARGO_PKG_VERSION"),
            config.input_folder.display()
        );
        let pipeline = Pipeline::new(config)?;
        Ok(Self { pipeline })
    }

    pub async fn run(self) -> anyhow::Result<RunMetadata> {
        let metadata = self.pipeline.run().await?;
        Ok(metadata)
    }
}

/// Binary entry point: parse flags, install logging, run the pipeline and
/// print the metadata document.
pub async fn main() -> anyhow::Result<()> {
    let config = match Config::from_args(std::env::args()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };
    setup_logging(config.log_level);
    let app = App::from_config(config)?;
    match app.run().await {
        Ok(metadata) => {
            println!("{}", serde_json::to_string_pretty(&metadata)?);
            Ok(())
        }
        Err(e) => {
            error!("pipeline failed: {e}");
            Err(e)
        }
    }
}
