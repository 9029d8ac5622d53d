//! RFID spool-tag decoding and caching
//!
//! Implements the vendor key-derivation schedule (HKDF-SHA256 over the tag
//! UID), the sector-by-sector authentication/read protocol, tag format
//! classification, a two-tier raw-dump cache, and a content-addressable
//! derivation cache whose freshness tracks catalog, config and algorithm
//! versions alongside time.

pub mod authenticator;
pub mod catalog;
pub mod config;
pub mod dependency;
pub mod derivation;
pub mod dump;
pub mod error;
pub mod format;
pub mod interpret;
pub mod keys;
pub mod records;
pub mod service;
pub mod tag_cache;
pub mod transport;
pub mod uid;
pub mod utils;

pub use authenticator::{AuthenticationOutcome, CancellationToken, TagAuthenticator};
pub use catalog::{CatalogSource, StaticCatalog};
pub use config::{CacheSettings, ConfigStore, FsConfigStore, MemoryConfigStore};
pub use dependency::{AuthStateSource, DependencySet, DependencyTracker};
pub use derivation::{DerivationCache, DerivationCacheStats, StageTtls};
pub use dump::RawTagDump;
pub use error::ServiceError;
pub use format::{TagFormat, TagFormatClassification, TagTechnology};
pub use keys::derive_sector_keys;
pub use records::{DerivedRecord, ScanOccurrence, SourceScanRecord, Stage};
pub use service::{OccurrenceContext, RecordScanResult, TagDecodingService};
pub use tag_cache::{TagCacheStats, TagDataCache};
pub use transport::TagTransport;
pub use uid::TagUid;
