#![deny(rust_2024_compatibility)]
// Specific pedantic lints enforced (not blanket allow):
#![deny(
    clippy::explicit_iter_loop,
    clippy::manual_let_else,
    clippy::semicolon_if_nothing_returned,
    clippy::inconsistent_struct_constructor
)]
// Noisy pedantic lints suppressed with justification:
#![allow(
    clippy::cast_possible_truncation, // Safe within realistic value bounds (counts, sizes)
    clippy::cast_precision_loss,      // Acceptable for ratios/display
    clippy::cast_sign_loss,           // Doc ids are non-negative by contract
    clippy::missing_errors_doc,       // Internal API
    clippy::missing_panics_doc,       // Internal API
    clippy::module_name_repetitions,  // e.g. CollectorError in collector module
    clippy::must_use_candidate        // Annotated selectively on critical APIs
)]

pub mod app;
pub mod collector;
pub mod metrics;
pub mod minhash;
pub mod pipeline;
pub mod processor;
pub mod shingle;
pub mod table;

// Re-export main types for easy access
pub use app::{App, Config};
pub use pipeline::{Pipeline, PipelineError, RunMetadata};

/// Seed of every hash family in the run. It must be identical across all
/// workers: two workers hashing the same text on different machines have to
/// produce the same signature, bands and buckets. Actors receive it through
/// their construction parameters, never from ambient state.
pub const RANDOM_SEED: u64 = 42;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
