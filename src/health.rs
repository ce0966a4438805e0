use lazy_static::lazy_static;
use parking_lot::RwLock;
use prometheus::{register_gauge_vec, GaugeVec};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

lazy_static! {
    static ref MODEL_HEALTH_SCORE: GaugeVec = register_gauge_vec!(
        "gateway_model_health_score",
        "Current health score (0-100) per model",
        &["model"]
    )
    .unwrap();
    static ref MODEL_FAILURE_SCORE: GaugeVec = register_gauge_vec!(
        "gateway_model_failure_score",
        "Current accumulated failure score per model",
        &["model"]
    )
    .unwrap();
}

/// Per-model failure bookkeeping. Timestamps are wall-clock (`SystemTime`),
/// not monotonic `Instant`, because the store is persisted to disk and must
/// still make sense after a process restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelHealth {
    /// Monotonically increasing; informational only, never consulted for
    /// routing decisions (that's `failure_score`'s job).
    #[serde(default)]
    pub failures: u64,
    #[serde(default)]
    pub success: u64,
    pub failure_score: f64,
    /// Unix seconds of the last recorded success or failure.
    pub last_updated: u64,
    /// Unix seconds until which this model must not be attempted, or `None`.
    pub cooldown_until: Option<u64>,
}

impl Default for ModelHealth {
    fn default() -> Self {
        Self {
            failures: 0,
            success: 0,
            failure_score: 0.0,
            last_updated: now_unix(),
            cooldown_until: None,
        }
    }
}

/// A `ModelHealth` entry plus its derived, externally-visible health score;
/// returned by `HealthStore::snapshot` for diagnostic endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshotEntry {
    #[serde(flatten)]
    pub health: ModelHealth,
    pub health_score: u32,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Tracks per-model failure scores and cooldowns, deriving a 0-100 health
/// score used by the adaptive routing strategy. The time-decayed failure
/// score, cooldown window, and success/failure bookkeeping follow a fixed
/// formula; the storage shape (`parking_lot::RwLock<HashMap<..>>`, persisted
/// snapshots) follows a rate-limit tracker's guarded-map-plus-disk-snapshot
/// pattern.
pub struct HealthStore {
    state: RwLock<HashMap<String, ModelHealth>>,
    decay_rate: f64,
    persist_path: Option<PathBuf>,
}

impl HealthStore {
    pub fn new(decay_rate: f64, persist_path: Option<PathBuf>) -> Self {
        let state = persist_path
            .as_ref()
            .and_then(|p| fs::read_to_string(p).ok())
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        Self {
            state: RwLock::new(state),
            decay_rate,
            persist_path,
        }
    }

    fn decay_locked(&self, entry: &mut ModelHealth) {
        let now = now_unix();
        let elapsed_min = (now.saturating_sub(entry.last_updated)) as f64 / 60.0;
        if elapsed_min > 0.1 {
            let decay_amount = elapsed_min * self.decay_rate;
            entry.failure_score = (entry.failure_score - decay_amount).max(0.0);
            entry.last_updated = now;
        }
    }

    /// 0-100 health score, or 0 if the model is currently cooling down.
    /// `int(100.0 / (1.0 + failure_score * 0.2))`, floored at 0.
    pub fn health_score(&self, model: &str) -> u32 {
        let mut state = self.state.write();
        let entry = state.entry(model.to_string()).or_default();
        self.decay_locked(entry);

        if let Some(until) = entry.cooldown_until {
            if now_unix() < until {
                MODEL_HEALTH_SCORE.with_label_values(&[model]).set(0.0);
                return 0;
            }
        }

        let score = 100.0 / (1.0 + entry.failure_score * 0.2);
        MODEL_HEALTH_SCORE
            .with_label_values(&[model])
            .set(score);
        score as u32
    }

    pub fn failure_score(&self, model: &str) -> f64 {
        let mut state = self.state.write();
        let entry = state.entry(model.to_string()).or_default();
        self.decay_locked(entry);
        entry.failure_score
    }

    pub fn is_cooling_down(&self, model: &str) -> bool {
        let state = self.state.read();
        match state.get(model) {
            Some(entry) => entry
                .cooldown_until
                .map(|until| now_unix() < until)
                .unwrap_or(false),
            None => false,
        }
    }

    /// Subtracts a fixed reward from the failure score and clears any cooldown.
    pub fn record_success(&self, model: &str) {
        let mut state = self.state.write();
        let entry = state.entry(model.to_string()).or_default();
        self.decay_locked(entry);
        entry.success += 1;
        entry.failure_score = (entry.failure_score - 2.0).max(0.0);
        entry.cooldown_until = None;
        entry.last_updated = now_unix();
        MODEL_FAILURE_SCORE
            .with_label_values(&[model])
            .set(entry.failure_score);
        drop(state);
        self.persist();
    }

    /// Adds `penalty` to the failure score and, if `cooldown_secs` is
    /// positive, sets a cooldown that long from now.
    pub fn record_failure(&self, model: &str, penalty: f64, cooldown_secs: u64) {
        let mut state = self.state.write();
        let entry = state.entry(model.to_string()).or_default();
        self.decay_locked(entry);
        entry.failures += 1;
        entry.failure_score += penalty;
        if cooldown_secs > 0 {
            entry.cooldown_until = Some(now_unix() + cooldown_secs);
        }
        entry.last_updated = now_unix();
        MODEL_FAILURE_SCORE
            .with_label_values(&[model])
            .set(entry.failure_score);
        drop(state);
        self.persist();
    }

    /// Drops tracked models that no longer appear in any configured tier,
    /// so a config reload doesn't leak entries for retired models forever.
    pub fn reconcile(&self, known_models: &HashSet<String>) {
        let mut state = self.state.write();
        state.retain(|model, _| known_models.contains(model));
        drop(state);
        self.persist();
    }

    /// Snapshot for the `/v1/health-store` diagnostic endpoint: every known
    /// model with its decay refreshed and its derived health score attached.
    pub fn snapshot(&self) -> HashMap<String, HealthSnapshotEntry> {
        let mut state = self.state.write();
        let now = now_unix();
        state
            .iter_mut()
            .map(|(model, entry)| {
                self.decay_locked(entry);
                let health_score = if entry.cooldown_until.is_some_and(|until| now < until) {
                    0
                } else {
                    (100.0 / (1.0 + entry.failure_score * 0.2)) as u32
                };
                (
                    model.clone(),
                    HealthSnapshotEntry {
                        health: entry.clone(),
                        health_score,
                    },
                )
            })
            .collect()
    }

    fn persist(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let state = self.state.read();
        let Ok(serialized) = serde_json::to_string_pretty(&*state) else {
            return;
        };
        drop(state);
        let tmp = path.with_extension("json.tmp");
        if fs::write(&tmp, serialized).is_ok() {
            if let Err(e) = fs::rename(&tmp, path) {
                tracing::warn!(error = %e, "failed to persist health store");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_model_has_full_health() {
        let store = HealthStore::new(0.05, None);
        assert_eq!(store.health_score("gpt-4"), 100);
    }

    #[test]
    fn failure_lowers_health_score() {
        let store = HealthStore::new(0.05, None);
        store.record_failure("gpt-4", 10.0, 0);
        let score = store.health_score("gpt-4");
        assert!(score < 100, "expected degraded score, got {score}");
        assert_eq!(score, (100.0 / (1.0 + 10.0 * 0.2)) as u32);
    }

    #[test]
    fn cooldown_forces_zero_score() {
        let store = HealthStore::new(0.05, None);
        store.record_failure("gpt-4", 5.0, 3600);
        assert!(store.is_cooling_down("gpt-4"));
        assert_eq!(store.health_score("gpt-4"), 0);
    }

    #[test]
    fn success_reduces_failure_score_and_clears_cooldown() {
        let store = HealthStore::new(0.05, None);
        store.record_failure("gpt-4", 5.0, 60);
        store.record_success("gpt-4");
        assert!(!store.is_cooling_down("gpt-4"));
        assert_eq!(store.failure_score("gpt-4"), 3.0);
    }

    #[test]
    fn success_floors_at_zero() {
        let store = HealthStore::new(0.05, None);
        store.record_success("gpt-4");
        assert_eq!(store.failure_score("gpt-4"), 0.0);
    }

    #[test]
    fn reconcile_drops_unknown_models() {
        let store = HealthStore::new(0.05, None);
        store.record_failure("retired-model", 5.0, 0);
        store.record_failure("gpt-4", 1.0, 0);
        let known: HashSet<String> = ["gpt-4".to_string()].into_iter().collect();
        store.reconcile(&known);
        let snap = store.snapshot();
        assert!(!snap.contains_key("retired-model"));
        assert!(snap.contains_key("gpt-4"));
    }

    #[test]
    fn snapshot_tracks_monotonic_counters_and_health_score() {
        let store = HealthStore::new(0.05, None);
        store.record_failure("gpt-4", 10.0, 0);
        store.record_failure("gpt-4", 10.0, 0);
        store.record_success("gpt-4");
        let snap = store.snapshot();
        let entry = snap.get("gpt-4").unwrap();
        assert_eq!(entry.health.failures, 2);
        assert_eq!(entry.health.success, 1);
        assert_eq!(entry.health_score, store.health_score("gpt-4"));
    }

    #[test]
    fn persists_and_reloads_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("health.json");
        {
            let store = HealthStore::new(0.05, Some(path.clone()));
            store.record_failure("gpt-4", 8.0, 0);
        }
        let reloaded = HealthStore::new(0.05, Some(path));
        assert_eq!(reloaded.failure_score("gpt-4"), 8.0);
    }
}
