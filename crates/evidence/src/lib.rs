//! Evidence rendering and caching engine.
//!
//! Turns a PDF page plus a normalized bounding box into a cached PNG crop,
//! under a bounded disk budget. Key features:
//!
//! - Two-tier LRU cache (full-page renders and crops) with byte-budgeted
//!   eviction; crops are evicted before full pages
//! - Version-aware caching: a changed source PDF yields a new cache key,
//!   so stale renders simply stop being looked up
//! - Graceful fallback to the full page when a crop operation fails
//! - Crash-recoverable cold start: cache state is rebuilt by scanning the
//!   cache directories

pub mod config;
pub mod error;
pub mod lru;
pub mod manager;
pub mod roi;

pub use config::{ConfigError, EvidenceConfig};
pub use error::EvidenceError;
pub use manager::{CacheStats, EvidenceManager, MaintenanceReport};
pub use roi::{BBoxNorm, RenderedEvidence, RequestedRoi};
