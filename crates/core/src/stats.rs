//! Per-step duration statistics (exponential moving average).
//!
//! The table is a flat JSON object mapping step names to average seconds.
//! It is loaded once when a worker starts and rewritten in full after every
//! completed step. A missing or unreadable file never prevents startup; the
//! seed values below are used instead.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::step::PipelineStep;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Weight given to the newest observation.
pub const EMA_ALPHA: f64 = 0.2;

/// Average used for step names that have neither a seed nor an entry.
pub const FALLBACK_SECS: f64 = 10.0;

/// Seed averages measured on the reference hardware.
pub const SEED_STATS: [(&str, f64); 3] = [
    ("step1_background", 80.0),
    ("step2_text", 35.0),
    ("step3_composite", 5.0),
];

fn seed_for(step_name: &str) -> f64 {
    SEED_STATS
        .iter()
        .find(|(name, _)| *name == step_name)
        .map(|(_, secs)| *secs)
        .unwrap_or(FALLBACK_SECS)
}

fn seed_table() -> BTreeMap<String, f64> {
    SEED_STATS
        .iter()
        .map(|(name, secs)| (name.to_string(), *secs))
        .collect()
}

/// Compute one EMA step: `observed * alpha + previous * (1 - alpha)`.
pub fn ema(previous: f64, observed: f64, alpha: f64) -> f64 {
    observed * alpha + previous * (1.0 - alpha)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("failed to write stats file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize stats: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Durable table of moving-average step durations.
#[derive(Debug, Clone)]
pub struct StatsTracker {
    path: Option<PathBuf>,
    table: BTreeMap<String, f64>,
}

impl StatsTracker {
    /// Load the table from `path`, falling back to seeds if the file is
    /// missing or corrupted. Seed entries absent from the file are filled in.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut table = seed_table();

        match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<BTreeMap<String, f64>>(&raw) {
                Ok(stored) => {
                    tracing::info!(path = %path.display(), entries = stored.len(), "Loaded step stats");
                    table.extend(stored);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Corrupted step stats file, using seed values");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "Step stats file not found, using seed values");
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read step stats, using seed values");
            }
        }

        Self {
            path: Some(path),
            table,
        }
    }

    /// A tracker holding only seed values that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            table: seed_table(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current average for `step_name`, or its seed if never observed.
    pub fn get(&self, step_name: &str) -> f64 {
        self.table
            .get(step_name)
            .copied()
            .unwrap_or_else(|| seed_for(step_name))
    }

    pub fn get_step(&self, step: PipelineStep) -> f64 {
        self.get(step.name())
    }

    /// Expected duration of `step` for progress weighting.
    ///
    /// Stored averages that are zero or negative stay in the table but are
    /// not usable as weights; the seed stands in for them.
    pub fn weight(&self, step: PipelineStep) -> f64 {
        let secs = self.get_step(step);
        if secs.is_finite() && secs > 0.0 {
            secs
        } else {
            seed_for(step.name())
        }
    }

    /// Fold a new observation into the average and persist the table.
    ///
    /// The in-memory value is updated even if persisting fails.
    pub fn update(&mut self, step_name: &str, observed_secs: f64) -> Result<f64, StatsError> {
        let previous = self.get(step_name);
        let updated = if observed_secs.is_finite() && observed_secs >= 0.0 {
            ema(previous, observed_secs, EMA_ALPHA)
        } else {
            previous
        };
        self.table.insert(step_name.to_string(), updated);
        tracing::debug!(
            step = step_name,
            previous_secs = previous,
            observed_secs,
            updated_secs = updated,
            "Updated step stat",
        );
        self.save()?;
        Ok(updated)
    }

    /// Write the full table to disk (temp file + rename).
    pub fn save(&self) -> Result<(), StatsError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.table)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .and_then(|_| fs::rename(&tmp, path))
            .map_err(|source| StatsError::Write {
                path: path.clone(),
                source,
            })
    }

    /// Snapshot of every stored average.
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.table.clone()
    }
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::in_memory()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseen_step_falls_back_to_seed() {
        let stats = StatsTracker::in_memory();
        assert_eq!(stats.get("step1_background"), 80.0);
        assert_eq!(stats.get("something_else"), FALLBACK_SECS);
    }

    #[test]
    fn update_applies_ema() {
        let mut stats = StatsTracker::in_memory();
        let updated = stats.update("step3_composite", 15.0).unwrap();
        // 15 * 0.2 + 5 * 0.8 = 7
        assert!((updated - 7.0).abs() < 1e-9);
        assert!((stats.get("step3_composite") - 7.0).abs() < 1e-9);
    }

    #[test]
    fn repeated_updates_converge() {
        let mut stats = StatsTracker::in_memory();
        for _ in 0..200 {
            stats.update("step2_text", 12.5).unwrap();
        }
        assert!((stats.get("step2_text") - 12.5).abs() < 1e-6);
    }

    #[test]
    fn non_finite_observation_is_ignored() {
        let mut stats = StatsTracker::in_memory();
        stats.update("step2_text", f64::NAN).unwrap();
        assert_eq!(stats.get("step2_text"), 35.0);
    }

    #[test]
    fn update_persists_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("step_stats.json");

        let mut stats = StatsTracker::load(&path);
        stats.update("step1_background", 100.0).unwrap();

        let reloaded = StatsTracker::load(&path);
        // 100 * 0.2 + 80 * 0.8 = 84
        assert!((reloaded.get("step1_background") - 84.0).abs() < 1e-9);
        assert_eq!(reloaded.get("step2_text"), 35.0);
    }

    #[test]
    fn corrupted_file_falls_back_to_seeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("step_stats.json");
        fs::write(&path, "{ not json").unwrap();

        let stats = StatsTracker::load(&path);
        assert_eq!(stats.get("step1_background"), 80.0);
    }

    #[test]
    fn missing_keys_are_filled_from_seeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("step_stats.json");
        fs::write(&path, r#"{"step2_text": 20.0, "custom": 3.0}"#).unwrap();

        let stats = StatsTracker::load(&path);
        assert_eq!(stats.get("step2_text"), 20.0);
        assert_eq!(stats.get("step1_background"), 80.0);
        assert_eq!(stats.get("custom"), 3.0);
    }

    #[test]
    fn entries_are_never_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("step_stats.json");
        fs::write(&path, r#"{"legacy_step": 42.0}"#).unwrap();

        let mut stats = StatsTracker::load(&path);
        stats.update("step1_background", 80.0).unwrap();

        let reloaded = StatsTracker::load(&path);
        assert_eq!(reloaded.get("legacy_step"), 42.0);
    }

    #[test]
    fn non_positive_entries_survive_load_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("step_stats.json");
        fs::write(&path, r#"{"step3_composite": 0.0, "legacy_step": -2.0}"#).unwrap();

        let mut stats = StatsTracker::load(&path);
        assert_eq!(stats.get("step3_composite"), 0.0);
        assert_eq!(stats.weight(PipelineStep::Step3), 5.0);
        stats.update("step2_text", 30.0).unwrap();

        let reloaded = StatsTracker::load(&path);
        assert_eq!(reloaded.get("legacy_step"), -2.0);
        assert_eq!(reloaded.get("step3_composite"), 0.0);
        assert_eq!(reloaded.weight(PipelineStep::Step1), 80.0);
    }

    #[test]
    fn write_failure_is_reported_but_value_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("step_stats.json");

        let mut stats = StatsTracker::load(&path);
        assert!(stats.update("step3_composite", 5.0).is_err());
        assert_eq!(stats.get("step3_composite"), 5.0);
    }
}
