//! marketlab-core — domain types and algorithms for the data-integrity
//! layer of a market-data platform.
//!
//! This crate is pure compute: canonical values and SHA-256
//! fingerprinting, the canonical record model, the two-tier validation
//! engine (record-level hard errors + quality flags, frame-level
//! alignment guardrails), the time-series request model with
//! order-invariant hashing, and the universe/session-rule snapshots that
//! pin what a dataset was validated against. Everything that touches the
//! filesystem lives in `marketlab-store`.

pub mod error;
pub mod fingerprint;
pub mod frame;
pub mod lineage;
pub mod quality;
pub mod records;
pub mod request;
pub mod run;
pub mod sessions;
pub mod universe;
pub mod validate;

pub use error::{DataError, ErrorKind, Result};

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: everything the store crate shares across
    /// threads is Send + Sync.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<records::CanonicalRecord>();
        require_sync::<records::CanonicalRecord>();
        require_send::<quality::ValidationReport>();
        require_sync::<quality::ValidationReport>();
        require_send::<quality::QualityReport>();
        require_sync::<quality::QualityReport>();
        require_send::<request::TimeSeriesRequest>();
        require_sync::<request::TimeSeriesRequest>();
        require_send::<frame::AlignedFrame>();
        require_sync::<frame::AlignedFrame>();
        require_send::<lineage::LineageMeta>();
        require_sync::<lineage::LineageMeta>();
        require_send::<universe::UniverseSnapshot>();
        require_sync::<universe::UniverseSnapshot>();
        require_send::<sessions::SessionRulesSnapshot>();
        require_sync::<sessions::SessionRulesSnapshot>();
        require_send::<error::DataError>();
        require_sync::<error::DataError>();
    }
}
