pub mod codec;
pub mod config;
pub mod endian;
pub mod error;
pub mod jpeg;
pub mod ledger;
pub mod media;
pub mod paths;
pub mod raw;
pub mod transcode;
pub mod walk;
pub mod tasks {
    pub mod ingest;
    pub mod transfer;
}

pub use error::IngestError;
pub use tasks::ingest::{IngestPipeline, IngestReport};
