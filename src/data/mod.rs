pub mod backlog;
pub mod bar_aggregator;
pub mod fetcher;
pub mod ingest;
pub mod jsonl_store;
pub mod memory_store;
pub mod store;

pub use backlog::BacklogTracker;
pub use bar_aggregator::{fold_window, Aggregator};
pub use fetcher::{Fetcher, HttpFetcher};
pub use ingest::{normalize_raw_bar, IngestReport, RawBarIngestor};
pub use jsonl_store::JsonlBarStore;
pub use memory_store::InMemoryBarStore;
pub use store::{upsert_bar, BarStore, UpsertOutcome};
