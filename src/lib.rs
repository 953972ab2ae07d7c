//! Bounded-concurrency feed fetching.
//!
//! Give [`ParallelProcessor`] a list of [`Source`]s and it fetches and parses
//! them with a fixed number of concurrent workers, classifies failures as
//! `retry` or `failure`, and returns one [`ProcessingResult`] per source.
//!
//! ```no_run
//! use feedpool::{Config, ParallelProcessor, Source};
//!
//! # async fn run() -> Result<(), feedpool::FetchError> {
//! let processor = ParallelProcessor::new(Config::default())?;
//! let sources = vec![Source::new("fed", "https://example.com/fed.xml")];
//! for result in processor.process_parallel_feeds(&sources).await {
//!     println!("{}: {:?} ({} items)", result.source_id, result.status, result.items.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod feed;
pub mod processor;

pub use config::{Config, ConfigError};
pub use feed::{
    FeedFormat, FeedItem, FetchError, ProcessingResult, ProcessingStatus, Source, Task,
};
pub use processor::ParallelProcessor;
