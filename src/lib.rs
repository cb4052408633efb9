//! Pagevault captures a web page and the subtree of pages and resources it
//! links to, producing a self-contained, browser-renderable offline mirror:
//! HTML rewritten to point at a local artifact cache, with the actual bytes
//! persisted alongside it.
//!
//! Resource discovery is best-effort pattern matching over raw markup, not
//! conformant HTML parsing; that limitation is part of the contract.

pub mod cache;
pub mod cli;
pub mod extract;
pub mod fetch;
pub mod quota;
pub mod rewrite;
pub mod session;

// Re-export main types for convenience
pub use cache::{cache_key, CacheEntry, CacheStore, StorageError, INDEX_KEY};
pub use cli::CaptureCommand;
pub use extract::{resolve_url, Extractor, RemoteResource, ResourceKind};
pub use fetch::{FetchError, Fetcher, HttpTransport, Transport, TransportResponse};
pub use quota::{QuotaSignal, QuotaTracker};
pub use rewrite::{merge_script, Rewriter, LOCAL_SCHEME, NAV_SCRIPT};
pub use session::{
    CancelHandle, CaptureFailure, CaptureOptions, CaptureReport, CaptureSession, ResourceState,
    SessionOutcome,
};
