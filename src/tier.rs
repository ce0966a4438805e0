//! Classifies an incoming request into a complexity tier (T1/T2/T3), the
//! first step of the routing pipeline: a tool-response shortcut, a
//! router-model call, and a heuristic fallback, in that order. The heuristic
//! keyword list, truncation length, and history-window size below are fixed
//! pinned constants.

use crate::config::{ModelsConfig, RouterModelConfig, TierId};
use crate::protocol::openai::ChatCompletionRequest;
use lazy_static::lazy_static;
use regex::Regex;
use std::time::Duration;

lazy_static! {
    static ref TIER_LABEL: Regex = Regex::new(r"\bT([1-3])\b").unwrap();
}

const HEURISTIC_KEYWORDS: &[&str] = &[
    "code", "function", "complex", "analysis", "summary", "reasoning", "generate", "create",
    "代码", "函数", "分析", "总结", "推理", "生成", "创建", "搜索", "查询",
];

const HISTORY_WINDOW: usize = 3;
const TRUNCATE_CHARS: usize = 800;
const HEURISTIC_LONG_TEXT_CHARS: usize = 2000;

pub struct TierClassifier {
    client: reqwest::Client,
    insecure_client: reqwest::Client,
}

/// Callback invoked to emit `ROUTER_START`/`ROUTER_END`/`ROUTER_FAIL` trace
/// events; kept generic so the orchestrator can wire it to the TraceBus
/// without this module depending on it directly.
pub trait TraceEmitter {
    fn router_start(&self);
    fn router_end(&self, duration_ms: u64);
    fn router_fail(&self);
}

impl TierClassifier {
    pub fn new(client: reqwest::Client, insecure_client: reqwest::Client) -> Self {
        Self {
            client,
            insecure_client,
        }
    }

    pub async fn classify(
        &self,
        req: &ChatCompletionRequest,
        router: &RouterModelConfig,
        models: &ModelsConfig,
        trace: &impl TraceEmitter,
    ) -> TierId {
        if self.is_tool_response(req) {
            return self.tool_response_shortcut_tier(models);
        }

        if !router.enabled {
            return TierId::T1;
        }

        trace.router_start();
        let start = std::time::Instant::now();
        match self.call_router_model(req, router).await {
            Some(tier) => {
                trace.router_end(start.elapsed().as_millis() as u64);
                tier
            }
            None => {
                trace.router_fail();
                self.heuristic_classify(req)
            }
        }
    }

    fn is_tool_response(&self, req: &ChatCompletionRequest) -> bool {
        req.messages.last().is_some_and(|m| m.role == "tool")
    }

    /// First non-empty tier in `{t2, t3, t1}`: continuing a tool-calling
    /// loop requires a tool-capable model, preferring t2, then t3, and only
    /// falling back to t1 if neither has any configured models.
    fn tool_response_shortcut_tier(&self, models: &ModelsConfig) -> TierId {
        for tier in [TierId::T2, TierId::T3, TierId::T1] {
            if !models.tier(tier).is_empty() {
                return tier;
            }
        }
        TierId::T1
    }

    async fn call_router_model(
        &self,
        req: &ChatCompletionRequest,
        router: &RouterModelConfig,
    ) -> Option<TierId> {
        let history = self.build_history(req);
        let prompt = router.prompt_template.replace("{history}", &history);

        let body = serde_json::json!({
            "model": router.model,
            "messages": [{"role": "system", "content": prompt}],
            "max_tokens": 10,
            "temperature": 0.0,
        });

        let url = format!(
            "{}/chat/completions",
            router.base_url.trim_end_matches('/')
        );
        let client = if router.verify_ssl {
            &self.client
        } else {
            &self.insecure_client
        };
        let result = client
            .post(&url)
            .bearer_auth(&router.api_key)
            .json(&body)
            .timeout(Duration::from_secs(5))
            .send()
            .await;

        let response = match result {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::warn!(status = %r.status(), "router model returned non-success status");
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "router model call failed");
                return None;
            }
        };

        let parsed: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "router model returned unparsable response");
                return None;
            }
        };

        let label = parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or("");

        parse_tier_label(&label.to_uppercase())
    }

    /// Last three `user` messages, multimodal text parts concatenated and
    /// image parts rendered as `[图片]`, each truncated to 800 chars.
    fn build_history(&self, req: &ChatCompletionRequest) -> String {
        req.messages
            .iter()
            .filter(|m| m.role == "user")
            .rev()
            .take(HISTORY_WINDOW)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(|m| format!("User: {}", truncate(&render_multimodal(m), TRUNCATE_CHARS)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn heuristic_classify(&self, req: &ChatCompletionRequest) -> TierId {
        let all_text: String = req
            .messages
            .iter()
            .map(|m| render_multimodal(m))
            .collect::<Vec<_>>()
            .join(" ");

        if all_text.chars().count() > HEURISTIC_LONG_TEXT_CHARS {
            return TierId::T3;
        }

        let lower = all_text.to_lowercase();
        if HEURISTIC_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            TierId::T2
        } else {
            TierId::T1
        }
    }
}

fn render_multimodal(msg: &crate::protocol::openai::ChatMessage) -> String {
    match &msg.content {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Array(parts)) => parts
            .iter()
            .map(|p| match p.get("type").and_then(|t| t.as_str()) {
                Some("text") => p.get("text").and_then(|t| t.as_str()).unwrap_or("").to_string(),
                Some("image_url") | Some("image") => "[图片]".to_string(),
                _ => String::new(),
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}...")
}

fn parse_tier_label(label: &str) -> Option<TierId> {
    let caps = TIER_LABEL.captures(label)?;
    match &caps[1] {
        "1" => Some(TierId::T1),
        "2" => Some(TierId::T2),
        "3" => Some(TierId::T3),
        _ => None,
    }
}
