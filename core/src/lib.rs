pub mod context;
pub mod diagnostics;
pub mod error;
pub mod export;
pub mod extractor;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod scanner;
pub mod schema;
pub mod seed;
pub mod source;
pub mod timestamps;

pub use context::{Pass, RunContext, RunSummary};
pub use error::CoreError;
pub use extractor::ExistingFilePolicy;
pub use pipeline::{run_export, run_image_extraction, ExtractConfig};
pub use source::{open_source, SourceDb};
