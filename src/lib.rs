pub mod a1111;
pub mod database;
pub mod error;
pub mod exif;
pub mod export;
pub mod graph;
pub mod ingest;
pub mod params;
pub mod paths;
pub mod prompts;
pub mod record;
pub mod resolve;
pub mod resources;
pub mod text;

pub use database::Database;
pub use error::{PipelineError, Result};
pub use paths::RepoRoot;
pub use record::NormalizedRecord;
