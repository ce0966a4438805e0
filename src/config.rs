use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// One of the three complexity tiers a request can be routed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierId {
    T1,
    T2,
    T3,
}

impl TierId {
    pub fn as_str(self) -> &'static str {
        match self {
            TierId::T1 => "t1",
            TierId::T2 => "t2",
            TierId::T3 => "t3",
        }
    }
}

impl std::fmt::Display for TierId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordering policy applied to a tier's model list before attempting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoutingStrategyKind {
    #[default]
    Sequential,
    Random,
    Adaptive,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelsConfig {
    #[serde(default)]
    pub t1: Vec<String>,
    #[serde(default)]
    pub t2: Vec<String>,
    #[serde(default)]
    pub t3: Vec<String>,
    #[serde(default)]
    pub strategies: HashMap<String, RoutingStrategyKind>,
}

impl ModelsConfig {
    pub fn tier(&self, tier: TierId) -> &[String] {
        match tier {
            TierId::T1 => &self.t1,
            TierId::T2 => &self.t2,
            TierId::T3 => &self.t3,
        }
    }

    /// Union of all configured model ids across all tiers, used by HealthStore
    /// reconciliation and the models-list endpoint.
    pub fn all_models(&self) -> HashSet<String> {
        self.t1
            .iter()
            .chain(self.t2.iter())
            .chain(self.t3.iter())
            .cloned()
            .collect()
    }
}

fn default_connect_timeouts() -> HashMap<String, u64> {
    HashMap::from([
        ("t1".to_string(), 5000),
        ("t2".to_string(), 15000),
        ("t3".to_string(), 30000),
    ])
}

fn default_generation_timeouts() -> HashMap<String, u64> {
    HashMap::from([
        ("t1".to_string(), 300_000),
        ("t2".to_string(), 300_000),
        ("t3".to_string(), 300_000),
    ])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_connect_timeouts")]
    pub connect: HashMap<String, u64>,
    #[serde(default = "default_generation_timeouts")]
    pub generation: HashMap<String, u64>,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect: default_connect_timeouts(),
            generation: default_generation_timeouts(),
        }
    }
}

impl TimeoutsConfig {
    pub fn connect_ms(&self, tier: TierId) -> u64 {
        self.connect.get(tier.as_str()).copied().unwrap_or(5000)
    }

    pub fn generation_ms(&self, tier: TierId) -> u64 {
        self.generation
            .get(tier.as_str())
            .copied()
            .unwrap_or(300_000)
    }
}

fn default_status_codes() -> HashSet<u16> {
    [429, 500, 502, 503, 504].into_iter().collect()
}

fn default_error_keywords() -> Vec<String> {
    vec![
        "rate limit".to_string(),
        "quota exceeded".to_string(),
        "overloaded".to_string(),
        "timeout".to_string(),
        "try again".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConditions {
    #[serde(default = "default_status_codes")]
    pub status_codes: HashSet<u16>,
    #[serde(default = "default_error_keywords")]
    pub error_keywords: Vec<String>,
    #[serde(default = "default_true")]
    pub retry_on_empty: bool,
}

impl Default for RetryConditions {
    fn default() -> Self {
        Self {
            status_codes: default_status_codes(),
            error_keywords: default_error_keywords(),
            retry_on_empty: true,
        }
    }
}

fn default_rounds() -> HashMap<String, u32> {
    HashMap::from([
        ("t1".to_string(), 1),
        ("t2".to_string(), 1),
        ("t3".to_string(), 1),
    ])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetriesConfig {
    #[serde(default = "default_rounds")]
    pub rounds: HashMap<String, u32>,
    #[serde(default)]
    pub conditions: RetryConditions,
}

impl Default for RetriesConfig {
    fn default() -> Self {
        Self {
            rounds: default_rounds(),
            conditions: RetryConditions::default(),
        }
    }
}

impl RetriesConfig {
    /// Number of passes over the tier's model list, floored at 1.
    pub fn rounds_for(&self, tier: TierId) -> u32 {
        self.rounds.get(tier.as_str()).copied().unwrap_or(1).max(1)
    }
}

fn default_true() -> bool {
    true
}

fn default_protocol() -> String {
    "openai".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamProviderConfig {
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

impl Default for UpstreamProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            api_key: String::new(),
            verify_ssl: true,
        }
    }
}

/// Protocol spoken by a custom provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    Openai,
    V1Messages,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomProviderConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_protocol_enum")]
    pub protocol: Protocol,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
}

fn default_protocol_enum() -> Protocol {
    Protocol::Openai
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub upstream: UpstreamProviderConfig,
    #[serde(default)]
    pub custom: HashMap<String, CustomProviderConfig>,
    #[serde(default)]
    pub map: HashMap<String, String>,
}

fn default_router_model() -> String {
    "gpt-3.5-turbo".to_string()
}

/// Grounded verbatim in the original's `RouterModelConfig.prompt_template`: a
/// router-model system prompt defining T1/T2/T3 and instructing a bare-label
/// reply. Kept as a fixed default so a fresh config.json without a `router`
/// section still classifies sensibly once `router.enabled` is turned on.
const DEFAULT_PROMPT_TEMPLATE: &str = r#"You are an intelligent router for an LLM system. Your job is to classify the USER'S INTENT into one of three tiers (T1, T2, T3) to select the most appropriate model.

**TIER DEFINITIONS:**

**T1 (Speed / Chat / Simple QA)**:
- Casual conversation, greetings, roleplay.
- Simple factual questions (e.g., "Who is Newton?", "Translate this").
- Summary of short text provided in context.
- **Key:** Low reasoning depth, no external tools needed, safe for smaller/faster models.

**T2 (Reasoning / Coding / Tools)**:
- **Coding:** Writing code, debugging, explaining complex code, SQL queries.
- **Reasoning:** Logic puzzles, math problems, complex analysis.
- **Tool Use:** Explicit requests to search the web, check weather, read files.
- **Creative Writing:** Long stories, detailed emails, nuances.
- **Key:** Requires capabilities of GPT-4/Claude-3.5-Sonnet level models.

**T3 (Complex Agentic / Deep Logic)**:
- **Multi-step Complex Tasks:** "Research topic X, write a report, and save it to a file."
- **Deep Architecting:** System design, complex project planning.
- **High Risk:** Sensitive operations requiring maximum intelligence and safety.
- **Key:** Requires SOTA models (o1, Claude-3-Opus).

**INPUT CONTEXT (User History):**
{history}

**INSTRUCTIONS:**
1. Analyze the *latest* user request in the context of the history.
2. If the user asks for code, IT IS T2.
3. If the user asks for search/internet, IT IS T2.
4. If it's simple chat, IT IS T1.
5. Respond ONLY with the label: "T1", "T2", or "T3"."#;

fn default_prompt_template() -> String {
    DEFAULT_PROMPT_TEMPLATE.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterModelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_router_model")]
    pub model: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,
}

impl Default for RouterModelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: default_router_model(),
            base_url: default_openai_base_url(),
            api_key: String::new(),
            verify_ssl: true,
            prompt_template: default_prompt_template(),
        }
    }
}

fn default_decay_rate() -> f64 {
    0.05
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            decay_rate: default_decay_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ParamsConfig {
    #[serde(default)]
    pub global_params: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub model_params: HashMap<String, serde_json::Map<String, serde_json::Value>>,
}

fn default_log_retention_days() -> u32 {
    7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,
    #[serde(default)]
    pub gateway_api_key: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_retention_days: default_log_retention_days(),
            gateway_api_key: String::new(),
        }
    }
}

fn default_token_expiry_minutes() -> u32 {
    1440
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_token_expiry_minutes")]
    pub access_token_expire_minutes: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            access_token_expire_minutes: default_token_expiry_minutes(),
        }
    }
}

/// The full parsed document, as it is read from and written to `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub retries: RetriesConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub router: RouterModelConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub params: ParamsConfig,
    /// Open-question resolution (b): reject slash-prefixed model entries whose
    /// provider id is unknown at load time, instead of silently falling back
    /// to the upstream default. Off by default for compatibility.
    #[serde(default)]
    pub reject_unknown_provider_prefix: bool,
}

/// Immutable typed view of all tunables. Cheap to clone (wraps an `Arc`);
/// readers never observe a torn configuration because updates replace the
/// whole `Arc` rather than mutating fields in place.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    inner: Arc<ConfigFile>,
}

impl ConfigSnapshot {
    /// Wraps an already-built `ConfigFile`, e.g. one assembled in-process for
    /// tests or constructed programmatically rather than loaded from disk.
    pub fn new(file: ConfigFile) -> Result<Self> {
        Self::validate(&file)?;
        Ok(Self {
            inner: Arc::new(file),
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let raw: serde_json::Value =
            serde_json::from_str(&content).context("failed to parse config JSON")?;

        let file = if raw.get("t1_models").is_some() {
            migrate_legacy_config(path, raw)?
        } else {
            serde_json::from_value(raw).context("failed to parse config document")?
        };

        Self::validate(&file)?;
        Ok(Self {
            inner: Arc::new(file),
        })
    }

    fn validate(file: &ConfigFile) -> Result<()> {
        if !file.reject_unknown_provider_prefix {
            return Ok(());
        }
        for entry in file
            .models
            .t1
            .iter()
            .chain(file.models.t2.iter())
            .chain(file.models.t3.iter())
        {
            if let Some((provider_id, _)) = entry.split_once('/') {
                if !file.providers.custom.contains_key(provider_id) {
                    bail!(
                        "model entry '{entry}' references unknown provider '{provider_id}' \
                         and reject_unknown_provider_prefix is set"
                    );
                }
            }
        }
        Ok(())
    }

    pub fn file(&self) -> &ConfigFile {
        &self.inner
    }

    pub fn models(&self) -> &ModelsConfig {
        &self.inner.models
    }

    pub fn timeouts(&self) -> &TimeoutsConfig {
        &self.inner.timeouts
    }

    pub fn retries(&self) -> &RetriesConfig {
        &self.inner.retries
    }

    pub fn providers(&self) -> &ProvidersConfig {
        &self.inner.providers
    }

    pub fn router(&self) -> &RouterModelConfig {
        &self.inner.router
    }

    pub fn health(&self) -> &HealthConfig {
        &self.inner.health
    }

    pub fn params(&self) -> &ParamsConfig {
        &self.inner.params
    }

    pub fn strategy_for(&self, tier: TierId) -> RoutingStrategyKind {
        self.inner
            .models
            .strategies
            .get(tier.as_str())
            .copied()
            .unwrap_or_default()
    }
}

/// Shared, atomically swappable holder for the active `ConfigSnapshot`.
///
/// Reads clone the inner `Arc` under a brief lock; writes replace it wholesale.
/// This is the systems-language realisation of "the holder returns an atomic
/// pointer to an immutable snapshot; updates swap the pointer" — readers never
/// observe torn configuration.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<parking_lot::RwLock<ConfigSnapshot>>,
}

impl ConfigHandle {
    pub fn new(initial: ConfigSnapshot) -> Self {
        Self {
            current: Arc::new(parking_lot::RwLock::new(initial)),
        }
    }

    pub fn get(&self) -> ConfigSnapshot {
        self.current.read().clone()
    }

    pub fn replace(&self, snapshot: ConfigSnapshot) {
        *self.current.write() = snapshot;
    }
}

/// Migrates a legacy flat config document (top-level `t1_models` etc.) into
/// the nested shape, backing up the original to `config.backup.json` once.
fn migrate_legacy_config(path: &Path, old: serde_json::Value) -> Result<ConfigFile> {
    tracing::info!("detected legacy config format, migrating");

    if let Some(parent) = path.parent() {
        let backup = parent.join("config.backup.json");
        if let Err(e) = fs::copy(path, &backup) {
            tracing::warn!(error = %e, "failed to back up legacy config before migration");
        } else {
            tracing::info!(path = %backup.display(), "backup created");
        }
    }

    let mut file = ConfigFile::default();

    let get = |key: &str| old.get(key).cloned();

    if let Some(v) = get("log_retention_days").and_then(|v| v.as_u64()) {
        file.general.log_retention_days = v as u32;
    }
    if let Some(v) = get("gateway_api_key").and_then(|v| v.as_str().map(str::to_owned)) {
        file.general.gateway_api_key = v;
    }

    if let Some(v) = get("t1_models") {
        file.models.t1 = serde_json::from_value(v).unwrap_or_default();
    }
    if let Some(v) = get("t2_models") {
        file.models.t2 = serde_json::from_value(v).unwrap_or_default();
    }
    if let Some(v) = get("t3_models") {
        file.models.t3 = serde_json::from_value(v).unwrap_or_default();
    }
    if let Some(v) = get("routing_strategies") {
        file.models.strategies = serde_json::from_value(v).unwrap_or_default();
    }

    if let Some(v) = get("timeouts") {
        if let Ok(connect) = serde_json::from_value(v) {
            file.timeouts.connect = connect;
        }
    }
    if let Some(v) = get("stream_timeouts") {
        if let Ok(generation) = serde_json::from_value(v) {
            file.timeouts.generation = generation;
        }
    }

    if let Some(v) = get("retry_rounds") {
        if let Ok(rounds) = serde_json::from_value(v) {
            file.retries.rounds = rounds;
        }
    }
    if let Some(v) = get("retry_config") {
        if let Ok(conditions) = serde_json::from_value(v) {
            file.retries.conditions = conditions;
        }
    }

    if let Some(v) = get("upstream_base_url").and_then(|v| v.as_str().map(str::to_owned)) {
        file.providers.upstream.base_url = v;
    }
    if let Some(v) = get("upstream_api_key").and_then(|v| v.as_str().map(str::to_owned)) {
        file.providers.upstream.api_key = v;
    }
    if let Some(v) = get("providers") {
        if let Ok(custom) = serde_json::from_value(v) {
            file.providers.custom = custom;
        }
    }
    if let Some(v) = get("model_provider_map") {
        if let Ok(map) = serde_json::from_value(v) {
            file.providers.map = map;
        }
    }

    if let Some(v) = get("router_config") {
        if let Ok(router) = serde_json::from_value(v) {
            file.router = router;
        }
    }
    if let Some(v) = get("health_check_config") {
        if let Ok(health) = serde_json::from_value(v) {
            file.health = health;
        }
    }

    if let Some(v) = get("global_params").and_then(|v| v.as_object().cloned()) {
        file.params.global_params = v;
    }
    if let Some(v) = get("model_params") {
        if let Ok(model_params) = serde_json::from_value(v) {
            file.params.model_params = model_params;
        }
    }

    let serialized = serde_json::to_string_pretty(&file)?;
    fs::write(path, serialized).context("failed to write migrated config")?;
    tracing::info!("config migration completed successfully");

    Ok(file)
}

/// Builds the process-wide `reqwest::Client`: a shared connection pool,
/// keepalive caps, and per-request timeouts taking precedence.
pub fn build_http_client(pool_max_idle_per_host: usize) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(30))
        .tcp_nodelay(true)
        .build()?)
}

/// Same pool/keepalive shape as [`build_http_client`], but with certificate
/// verification disabled, for providers/router configs carrying
/// `verify_ssl: false` (e.g. a self-signed upstream). Kept as a distinct
/// client rather than a per-request flag since `reqwest` pins TLS
/// verification at client-construction time.
pub fn build_insecure_http_client(pool_max_idle_per_host: usize) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(30))
        .tcp_nodelay(true)
        .danger_accept_invalid_certs(true)
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_baseline() {
        let file = ConfigFile::default();
        assert_eq!(file.timeouts.connect_ms(TierId::T1), 5000);
        assert_eq!(file.timeouts.connect_ms(TierId::T2), 15000);
        assert_eq!(file.timeouts.connect_ms(TierId::T3), 30000);
        assert_eq!(file.timeouts.generation_ms(TierId::T1), 300_000);
        assert_eq!(file.retries.rounds_for(TierId::T1), 1);
        assert_eq!(file.health.decay_rate, 0.05);
        assert!(file.retries.conditions.retry_on_empty);
        assert!(file.retries.conditions.status_codes.contains(&429));
    }

    #[test]
    fn parses_minimal_document() {
        let json = r#"{
            "models": {"t1": ["gpt-3.5-turbo"], "t2": [], "t3": []},
            "router": {"enabled": false}
        }"#;
        let file: ConfigFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.models.t1, vec!["gpt-3.5-turbo".to_string()]);
        assert!(!file.router.enabled);
        assert!(file.router.prompt_template.contains("{history}"));
    }

    #[test]
    fn parses_custom_provider_with_protocol() {
        let json = r#"{
            "providers": {
                "custom": {
                    "anthropic-direct": {
                        "base_url": "https://api.anthropic.com/v1",
                        "api_key": "sk-ant",
                        "protocol": "v1-messages"
                    }
                }
            }
        }"#;
        let file: ConfigFile = serde_json::from_str(json).unwrap();
        let provider = file.providers.custom.get("anthropic-direct").unwrap();
        assert_eq!(provider.protocol, Protocol::V1Messages);
        assert!(provider.verify_ssl);
    }

    #[test]
    fn all_models_is_union_of_tiers() {
        let mut models = ModelsConfig::default();
        models.t1 = vec!["a".into(), "b".into()];
        models.t2 = vec!["b".into(), "c".into()];
        let set = models.all_models();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn validate_rejects_unknown_prefix_when_flag_set() {
        let mut file = ConfigFile::default();
        file.models.t1 = vec!["ghost/some-model".to_string()];
        file.reject_unknown_provider_prefix = true;
        assert!(ConfigSnapshot::validate(&file).is_err());
    }

    #[test]
    fn validate_allows_unknown_prefix_by_default() {
        let mut file = ConfigFile::default();
        file.models.t1 = vec!["ghost/some-model".to_string()];
        assert!(ConfigSnapshot::validate(&file).is_ok());
    }

    #[test]
    fn migrates_legacy_flat_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let legacy = serde_json::json!({
            "t1_models": ["gpt-3.5-turbo"],
            "t2_models": ["gpt-4"],
            "upstream_base_url": "https://example.test/v1",
            "upstream_api_key": "sk-legacy",
        });
        fs::write(&path, serde_json::to_string(&legacy).unwrap()).unwrap();

        let snapshot = ConfigSnapshot::from_file(&path).unwrap();
        assert_eq!(snapshot.models().t1, vec!["gpt-3.5-turbo".to_string()]);
        assert_eq!(snapshot.models().t2, vec!["gpt-4".to_string()]);
        assert_eq!(snapshot.providers().upstream.api_key, "sk-legacy");
        assert!(dir.path().join("config.backup.json").exists());
    }
}
