//! Ingest-run metadata: one write-once record per pipeline execution.

use crate::error::{DataError, Result};
use crate::records::require_non_empty;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRunMeta {
    pub ingest_run_id: String,
    pub started_at_ts: DateTime<Utc>,
    pub finished_at_ts: DateTime<Utc>,
    pub config_fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_fingerprint: Option<String>,
}

impl IngestRunMeta {
    pub fn new(
        ingest_run_id: impl Into<String>,
        started_at_ts: DateTime<Utc>,
        finished_at_ts: DateTime<Utc>,
        config_fingerprint: impl Into<String>,
    ) -> Result<Self> {
        let meta = Self {
            ingest_run_id: ingest_run_id.into(),
            started_at_ts,
            finished_at_ts,
            config_fingerprint: config_fingerprint.into(),
            environment_fingerprint: None,
        };
        meta.validate()?;
        Ok(meta)
    }

    pub fn with_environment_fingerprint(mut self, value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        require_non_empty(&value, "environment_fingerprint")?;
        self.environment_fingerprint = Some(value);
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        require_non_empty(&self.ingest_run_id, "ingest_run_id")?;
        require_non_empty(&self.config_fingerprint, "config_fingerprint")?;
        if self.finished_at_ts < self.started_at_ts {
            return Err(DataError::validation(
                "finished_at_ts must be on or after started_at_ts",
            )
            .with("started_at_ts", self.started_at_ts.to_rfc3339())
            .with("finished_at_ts", self.finished_at_ts.to_rfc3339()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn finish_before_start_is_rejected() {
        let start = Utc.with_ymd_and_hms(2024, 1, 3, 6, 0, 0).unwrap();
        let finish = Utc.with_ymd_and_hms(2024, 1, 3, 5, 0, 0).unwrap();
        assert!(IngestRunMeta::new("ing_20240103_060000Z_0001", start, finish, "fp").is_err());
    }

    #[test]
    fn json_roundtrip() {
        let start = Utc.with_ymd_and_hms(2024, 1, 3, 6, 0, 0).unwrap();
        let meta = IngestRunMeta::new("ing_20240103_060000Z_0001", start, start, "fp")
            .unwrap()
            .with_environment_fingerprint("env-1")
            .unwrap();
        let json = serde_json::to_string(&meta).unwrap();
        let back: IngestRunMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(meta, back);
    }
}
