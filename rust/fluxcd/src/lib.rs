pub mod downloader;
pub mod types;

pub use downloader::{ArtifactFetcher, ArtifactRoot};
pub use types::*;
