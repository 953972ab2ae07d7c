//! Feed data model, HTTP fetching, and body parsing.
//!
//! - [`types`] - sources, tasks, connections, results, and feed items
//! - [`fetcher`] - one bounded, cancellable GET per feed
//! - [`parser`] - RSS/Atom via `quick-xml`, JSON Feed via `serde_json`
//!
//! Scheduling lives in [`crate::processor`]; this module never spawns work.

mod fetcher;
mod parser;
mod types;

pub use fetcher::{build_client, fetch_bytes, FetchError, FEED_ACCEPT};
pub use parser::{parse_feed, parse_json_feed, parse_xml_feed, ParseError, ParseResult};
pub use types::{
    Connection, ConnectionStatus, FeedFormat, FeedItem, ProcessingResult, ProcessingStatus,
    ResourceSnapshot, Source, Task, TaskStatus,
};
