use crate::{reference_data::ReferenceData, rule_engine::RuleCatalog};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Timing knobs, in milliseconds on disk.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct EngineSettingsFile {
    scoring_timeout_ms: u64,
    scoring_max_in_flight: usize,
    busy_timeout_ms: u64,
    inflight_wait_ms: u64,
    inflight_poll_ms: u64,
    claim_lease_ms: u64,
}

impl Default for EngineSettingsFile {
    fn default() -> Self {
        Self {
            scoring_timeout_ms: 2_000,
            scoring_max_in_flight: 16,
            busy_timeout_ms: 5_000,
            inflight_wait_ms: 5_000,
            inflight_poll_ms: 25,
            claim_lease_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeskConfig {
    pub reference_data: ReferenceData,
    pub rules: RuleCatalog,
    /// Upper bound on one scorer call; past it the fallback prediction is used.
    pub scoring_timeout: Duration,
    /// Scorer calls allowed to run at once, abandoned late calls included.
    /// Past it, events score as the fallback without calling the scorer.
    pub scoring_max_in_flight: usize,
    /// How long a statement waits on another connection's write lock.
    pub busy_timeout: Duration,
    /// How long a duplicate submitter waits for an in-flight owner to settle.
    pub inflight_wait: Duration,
    pub inflight_poll: Duration,
    /// Age past which a PROCESSING claim is presumed abandoned (crashed
    /// worker, or a failure that could not be recorded) and may be
    /// re-claimed by a new submission.
    pub claim_lease: Duration,
}

impl DeskConfig {
    /// Load from the data/ directory.
    /// In tests, use DeskConfig::default_test().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let ref_path = format!("{data_dir}/reference/reference_data.json");
        let ref_content = std::fs::read_to_string(&ref_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {ref_path}: {e}"))?;
        let reference_data: ReferenceData = serde_json::from_str(&ref_content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {ref_path}: {e}"))?;

        let rules_path = format!("{data_dir}/rules/rule_catalog.json");
        let rules_content = std::fs::read_to_string(&rules_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {rules_path}: {e}"))?;
        let rules: RuleCatalog = serde_json::from_str(&rules_content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {rules_path}: {e}"))?;
        for rule_id in rules.rules_with_unrecognized_conditions() {
            log::warn!("rule '{rule_id}' has an unrecognized condition type and will never match");
        }

        // Optional; defaults apply when absent.
        let settings_path = format!("{data_dir}/engine/engine.json");
        let settings = if Path::new(&settings_path).exists() {
            let content = std::fs::read_to_string(&settings_path)
                .map_err(|e| anyhow::anyhow!("Cannot read {settings_path}: {e}"))?;
            serde_json::from_str(&content)
                .map_err(|e| anyhow::anyhow!("Cannot parse {settings_path}: {e}"))?
        } else {
            EngineSettingsFile::default()
        };

        Ok(Self::assemble(reference_data, rules, settings))
    }

    /// Config with hardcoded defaults for use in unit tests.
    /// Identical to the shipped data/ files.
    pub fn default_test() -> Self {
        Self::assemble(
            ReferenceData::builtin(),
            RuleCatalog::builtin(),
            EngineSettingsFile::default(),
        )
    }

    fn assemble(reference_data: ReferenceData, rules: RuleCatalog, s: EngineSettingsFile) -> Self {
        Self {
            reference_data,
            rules,
            scoring_timeout: Duration::from_millis(s.scoring_timeout_ms),
            scoring_max_in_flight: s.scoring_max_in_flight.max(1),
            busy_timeout: Duration::from_millis(s.busy_timeout_ms),
            inflight_wait: Duration::from_millis(s.inflight_wait_ms),
            inflight_poll: Duration::from_millis(s.inflight_poll_ms.max(1)),
            claim_lease: Duration::from_millis(s.claim_lease_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_dir() -> String {
        format!("{}/../data", env!("CARGO_MANIFEST_DIR"))
    }

    #[test]
    fn shipped_data_matches_builtin() {
        let loaded = DeskConfig::load(&data_dir()).unwrap();
        let builtin = DeskConfig::default_test();
        assert_eq!(loaded.reference_data, builtin.reference_data);
        assert_eq!(loaded.rules, builtin.rules);
        assert_eq!(loaded.scoring_timeout, builtin.scoring_timeout);
        assert_eq!(loaded.scoring_max_in_flight, builtin.scoring_max_in_flight);
        assert_eq!(loaded.claim_lease, builtin.claim_lease);
    }

    #[test]
    fn missing_dir_is_an_error() {
        let err = DeskConfig::load("/definitely/not/here").unwrap_err();
        assert!(err.to_string().contains("reference_data.json"), "{err}");
    }

    #[test]
    fn partial_settings_keep_defaults() {
        let s: EngineSettingsFile = serde_json::from_str(r#"{"scoring_timeout_ms": 50}"#).unwrap();
        assert_eq!(s.scoring_timeout_ms, 50);
        assert_eq!(s.inflight_poll_ms, 25);
        assert_eq!(s.claim_lease_ms, 60_000);
    }
}
