//! Session rules and the calendar seam.
//!
//! Session rules carry per-venue close times and timezones; the trading
//! calendar itself is an external collaborator reached through
//! `CalendarBaseline`. Both are versioned so registry entries can pin the
//! exact rules a dataset was validated against.

use crate::error::{DataError, Result};
use crate::fingerprint::fingerprint_json;
use crate::records::require_non_empty;
use crate::universe::normalize_mic;
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Regular session schedule for one venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRule {
    pub mic: String,
    pub timezone_local: String,
    /// `HH:MM` local wall time.
    pub regular_close_local: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regular_open_local: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_from: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_to: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_note: Option<String>,
}

impl SessionRule {
    pub fn validate(&self) -> Result<()> {
        require_non_empty(&self.mic, "mic")?;
        require_non_empty(&self.timezone_local, "timezone_local")?;
        parse_wall_time(&self.regular_close_local, "regular_close_local")?;
        if let Some(open) = &self.regular_open_local {
            parse_wall_time(open, "regular_open_local")?;
        }
        if let (Some(from), Some(to)) = (self.effective_from, self.effective_to) {
            if to < from {
                return Err(DataError::validation(
                    "effective_to must be on or after effective_from",
                )
                .with("mic", self.mic.clone()));
            }
        }
        Ok(())
    }

    /// True when the rule applies on `date`.
    pub fn in_effect(&self, date: NaiveDate) -> bool {
        if let Some(from) = self.effective_from {
            if date < from {
                return false;
            }
        }
        if let Some(to) = self.effective_to {
            if date > to {
                return false;
            }
        }
        true
    }

    pub fn close_time(&self) -> Result<NaiveTime> {
        parse_wall_time(&self.regular_close_local, "regular_close_local")
    }
}

pub fn parse_wall_time(value: &str, name: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|e| {
        DataError::validation(format!("{name} must be in HH:MM format"))
            .with("value", value)
            .with_cause(e)
    })
}

/// Immutable set of session rules with its version hash.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRulesSnapshot {
    pub version: String,
    pub rules: Vec<SessionRule>,
    pub sessionrules_hash: String,
}

impl SessionRulesSnapshot {
    pub fn new(version: impl Into<String>, rules: Vec<SessionRule>) -> Result<Self> {
        let version = version.into();
        require_non_empty(&version, "version")?;
        if rules.is_empty() {
            return Err(DataError::validation("rules must not be empty"));
        }
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for rule in &rules {
            rule.validate()?;
            if !seen.insert(&rule.mic) {
                return Err(DataError::validation("mic values must be unique")
                    .with("mic", rule.mic.clone()));
            }
        }
        let sessionrules_hash = compute_sessionrules_hash(&rules)?;
        Ok(Self {
            version,
            rules,
            sessionrules_hash,
        })
    }

    pub fn rule_for(&self, mic: &str) -> Option<&SessionRule> {
        self.rules.iter().find(|rule| rule.mic == mic)
    }
}

pub fn compute_sessionrules_hash(rules: &[SessionRule]) -> Result<String> {
    let mut sorted: Vec<&SessionRule> = rules.iter().collect();
    sorted.sort_by(|a, b| a.mic.cmp(&b.mic));
    let payload = serde_json::json!({
        "rules": sorted
            .iter()
            .map(|rule| serde_json::to_value(rule))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| DataError::validation("session rule serialization failed").with_cause(e))?,
    });
    Ok(fingerprint_json(&payload))
}

#[derive(Debug, Deserialize)]
struct SessionRulesSeed {
    version: String,
    #[serde(default)]
    rules: Vec<SessionRule>,
}

/// Load session rules from a JSON seed file; MICs are normalized upper-case.
pub fn load_seed_sessionrules(path: &Path) -> Result<SessionRulesSnapshot> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        DataError::storage("failed to read sessionrules seed")
            .with("path", path.display().to_string())
            .with_cause(e)
    })?;
    let seed: SessionRulesSeed = serde_json::from_str(&raw).map_err(|e| {
        DataError::storage("invalid sessionrules seed")
            .with("path", path.display().to_string())
            .with_cause(e)
    })?;
    let rules = seed
        .rules
        .into_iter()
        .map(|mut rule| {
            rule.mic = normalize_mic(&rule.mic)?;
            rule.timezone_local = rule.timezone_local.trim().to_string();
            Ok(rule)
        })
        .collect::<Result<Vec<_>>>()?;
    SessionRulesSnapshot::new(seed.version, rules)
}

/// Scheduled-session lookup, consumed from an external calendar source.
pub trait CalendarBaseline {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn overrides_hash(&self) -> Option<&str> {
        None
    }

    /// True when the venue is scheduled to trade on the local date.
    fn is_session_day(&self, mic: &str, session_date: NaiveDate) -> bool;
}

/// Version identifier of a calendar baseline: `name:version[+overrides]`.
pub fn calendar_version_id(baseline: &dyn CalendarBaseline) -> String {
    match baseline.overrides_hash() {
        Some(overrides) => format!("{}:{}+{overrides}", baseline.name(), baseline.version()),
        None => format!("{}:{}", baseline.name(), baseline.version()),
    }
}
