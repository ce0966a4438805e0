//! Makes the actual HTTP call to a model provider and returns a fully
//! aggregated response, whether or not the provider streamed it: payload
//! merge precedence, dual connect/generation timeouts, manual
//! `\n`-delimited SSE buffering (rather than a line-iterator adapter, to
//! tolerate providers that split SSE frames across TCP reads), and
//! v1-messages response translation.

use crate::config::{ConfigSnapshot, Protocol, RetryConditions, TierId};
use crate::error::UpstreamError;
use crate::protocol::{anthropic, anthropic_response_to_chat, chat_to_anthropic, openai};
use crate::tokenizer::Tokenizer;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::time::timeout;

pub struct UpstreamCaller {
    client: reqwest::Client,
    insecure_client: reqwest::Client,
    tokenizer: Tokenizer,
}

/// Trace hook for the events `UpstreamCaller` is positioned to emit itself:
/// `FIRST_TOKEN`, the moment response headers arrive (and the `Instant` it
/// arrived at, so the orchestrator can later report `FULL_RESPONSE`'s
/// generation-only duration relative to it rather than the whole attempt).
/// Every other stage (`MODEL_CALL_START`, `MODEL_FAIL`, `FULL_RESPONSE`) is
/// emitted by the orchestrator, which has the surrounding round/model
/// context.
pub trait AttemptTrace {
    fn first_token(&self, duration_ms: u64, at: Instant);
}

pub struct NoopTrace;
impl AttemptTrace for NoopTrace {
    fn first_token(&self, _duration_ms: u64, _at: Instant) {}
}

#[derive(Debug, Clone, Copy)]
struct ResolvedProvider<'a> {
    base_url: &'a str,
    api_key: &'a str,
    protocol: Protocol,
    verify_ssl: bool,
}

impl UpstreamCaller {
    pub fn new(client: reqwest::Client, insecure_client: reqwest::Client) -> Self {
        Self {
            client,
            insecure_client,
            tokenizer: Tokenizer::new(),
        }
    }

    /// The client honoring `provider.verify_ssl`: the regular
    /// certificate-verifying client by default, or the
    /// `danger_accept_invalid_certs` client when the resolved provider
    /// (or router config) has disabled verification.
    fn client_for(&self, verify_ssl: bool) -> &reqwest::Client {
        if verify_ssl {
            &self.client
        } else {
            &self.insecure_client
        }
    }

    /// Resolves which provider serves `model`, honoring an explicit
    /// `provider/model` prefix, the `providers.map` override table, and
    /// falling back to `providers.upstream`. Returns the resolved provider
    /// plus the outbound model name and a display label for traces/logs.
    fn resolve_provider<'a>(
        &self,
        model: &'a str,
        config: &'a ConfigSnapshot,
    ) -> (ResolvedProvider<'a>, String, String) {
        let providers = config.providers();

        if let Some((provider_id, bare_model)) = model.split_once('/') {
            if let Some(custom) = providers.custom.get(provider_id) {
                return (
                    ResolvedProvider {
                        base_url: &custom.base_url,
                        api_key: &custom.api_key,
                        protocol: custom.protocol,
                        verify_ssl: custom.verify_ssl,
                    },
                    bare_model.to_string(),
                    format!("{provider_id}/{bare_model}"),
                );
            }
            return (
                ResolvedProvider {
                    base_url: &providers.upstream.base_url,
                    api_key: &providers.upstream.api_key,
                    protocol: Protocol::Openai,
                    verify_ssl: providers.upstream.verify_ssl,
                },
                model.to_string(),
                model.to_string(),
            );
        }

        if let Some(provider_id) = providers.map.get(model) {
            if let Some(custom) = providers.custom.get(provider_id) {
                return (
                    ResolvedProvider {
                        base_url: &custom.base_url,
                        api_key: &custom.api_key,
                        protocol: custom.protocol,
                        verify_ssl: custom.verify_ssl,
                    },
                    model.to_string(),
                    format!("{provider_id}/{model}"),
                );
            }
        }

        (
            ResolvedProvider {
                base_url: &providers.upstream.base_url,
                api_key: &providers.upstream.api_key,
                protocol: Protocol::Openai,
                verify_ssl: providers.upstream.verify_ssl,
            },
            model.to_string(),
            model.to_string(),
        )
    }

    /// Merges global, per-model, and per-request parameter overrides. A
    /// request field only overrides when the caller supplied it with a
    /// non-null value, matching the precedence global < model < request.
    fn merge_payload(&self, model: &str, request: &openai::ChatCompletionRequest, config: &ConfigSnapshot) -> Value {
        let params = config.params();
        let mut merged = Map::new();
        for (k, v) in &params.global_params {
            merged.insert(k.clone(), v.clone());
        }
        if let Some(model_overrides) = params.model_params.get(model) {
            for (k, v) in model_overrides {
                merged.insert(k.clone(), v.clone());
            }
        }

        let request_value = serde_json::to_value(request).unwrap_or(Value::Object(Map::new()));
        if let Value::Object(request_map) = request_value {
            for (k, v) in request_map {
                if !v.is_null() {
                    merged.insert(k, v);
                }
            }
        }
        merged.insert("model".to_string(), Value::String(model.to_string()));
        Value::Object(merged)
    }

    /// Display name for the resolved outbound model, used in traces.
    pub fn display_name(&self, model: &str, config: &ConfigSnapshot) -> String {
        self.resolve_provider(model, config).2
    }

    pub async fn call(
        &self,
        model: &str,
        tier: TierId,
        request: &openai::ChatCompletionRequest,
        config: &ConfigSnapshot,
        trace: &impl AttemptTrace,
    ) -> Result<openai::ChatCompletionResponse, UpstreamError> {
        let (provider, bare_model, _display) = self.resolve_provider(model, config);
        let conditions = &config.retries().conditions;

        let ttft_budget = Duration::from_millis(config.timeouts().connect_ms(tier));
        let generation_timeout = Duration::from_millis(config.timeouts().generation_ms(tier));

        match provider.protocol {
            Protocol::Openai => {
                let mut payload = self.merge_payload(&bare_model, request, config);
                if let Value::Object(map) = &mut payload {
                    map.insert("stream".to_string(), Value::Bool(true));
                    map.insert(
                        "stream_options".to_string(),
                        serde_json::json!({"include_usage": true}),
                    );
                }
                self.call_openai(
                    &provider,
                    &payload,
                    ttft_budget,
                    generation_timeout,
                    conditions,
                    request,
                    trace,
                )
                .await
            }
            Protocol::V1Messages => {
                self.call_v1_messages(
                    &provider,
                    request,
                    ttft_budget,
                    generation_timeout,
                    conditions,
                    trace,
                )
                .await
            }
        }
    }

    async fn send(
        &self,
        provider: &ResolvedProvider<'_>,
        path: &str,
        body: &Value,
        ttft_budget: Duration,
        conditions: &RetryConditions,
        trace: &impl AttemptTrace,
        attempt_start: Instant,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = format!("{}/{}", provider.base_url.trim_end_matches('/'), path);
        let send = self
            .client_for(provider.verify_ssl)
            .post(&url)
            .bearer_auth(provider.api_key)
            .json(body)
            .send();

        // `ttft_budget` (`timeouts.connect[tier]`) is the deadline from
        // dispatch to response headers, not a raw TCP connect timeout; a
        // genuine transport-level failure (DNS, refused, TLS) is classified
        // separately below as `ConnectTimeout`.
        let response = match timeout(ttft_budget, send).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => return Err(classify_transport_error(&e)),
            Err(_) => return Err(UpstreamError::FirstTokenTimeout),
        };

        let first_token_at = Instant::now();
        trace.first_token(attempt_start.elapsed().as_millis() as u64, first_token_at);

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let body_budget = Duration::from_secs(10);
        let body_text = timeout(body_budget, response.text())
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_default();
        let lowered = body_text.to_lowercase();

        if status == 429 || status == 401 || status == 403 || status == 404 {
            return Err(UpstreamError::StatusCode(status));
        }
        if conditions.status_codes.contains(&status) {
            return Err(UpstreamError::StatusCode(status));
        }
        if let Some(keyword) = conditions
            .error_keywords
            .iter()
            .find(|kw| lowered.contains(&kw.to_lowercase()))
        {
            return Err(UpstreamError::Keyword(keyword.clone()));
        }
        Err(UpstreamError::Other(format!("status {status}: {body_text}")))
    }

    async fn call_openai(
        &self,
        provider: &ResolvedProvider<'_>,
        payload: &Value,
        ttft_budget: Duration,
        generation_timeout: Duration,
        conditions: &RetryConditions,
        request: &openai::ChatCompletionRequest,
        trace: &impl AttemptTrace,
    ) -> Result<openai::ChatCompletionResponse, UpstreamError> {
        let attempt_start = Instant::now();
        let response = self
            .send(
                provider,
                "chat/completions",
                payload,
                ttft_budget,
                conditions,
                trace,
                attempt_start,
            )
            .await?;

        let remaining = generation_timeout.saturating_sub(attempt_start.elapsed());
        let aggregated = match timeout(remaining, aggregate_sse_stream(response)).await {
            Ok(inner) => inner?,
            Err(_) => return Err(UpstreamError::TotalTimeout),
        };

        self.finalize(aggregated, conditions, request)
    }

    async fn call_v1_messages(
        &self,
        provider: &ResolvedProvider<'_>,
        request: &openai::ChatCompletionRequest,
        ttft_budget: Duration,
        generation_timeout: Duration,
        conditions: &RetryConditions,
        trace: &impl AttemptTrace,
    ) -> Result<openai::ChatCompletionResponse, UpstreamError> {
        let mut anthropic_request = chat_to_anthropic(request);
        anthropic_request.stream = false;
        let body =
            serde_json::to_value(&anthropic_request).map_err(|e| UpstreamError::Other(e.to_string()))?;

        let attempt_start = Instant::now();
        let response = self
            .send(
                provider,
                "messages",
                &body,
                ttft_budget,
                conditions,
                trace,
                attempt_start,
            )
            .await?;

        let remaining = generation_timeout.saturating_sub(attempt_start.elapsed());
        let parse = async {
            response
                .json::<anthropic::MessagesResponse>()
                .await
                .map_err(|e| UpstreamError::Other(e.to_string()))
        };
        let parsed = match timeout(remaining, parse).await {
            Ok(inner) => inner?,
            Err(_) => return Err(UpstreamError::TotalTimeout),
        };

        let chat_response = anthropic_response_to_chat(&parsed);
        self.finalize(chat_response, conditions, request)
    }

    /// Applies the empty-response rule and fills in locally computed usage
    /// when the upstream didn't report any.
    fn finalize(
        &self,
        mut response: openai::ChatCompletionResponse,
        conditions: &RetryConditions,
        request: &openai::ChatCompletionRequest,
    ) -> Result<openai::ChatCompletionResponse, UpstreamError> {
        let is_empty = response
            .choices
            .first()
            .map(|c| c.message.text().is_empty() && c.message.tool_calls.is_none())
            .unwrap_or(true);

        if is_empty && conditions.retry_on_empty {
            return Err(UpstreamError::EmptyResponse);
        }

        if response.usage.is_none() {
            let prompt_tokens = self.tokenizer.count_messages(
                request.messages.iter().map(|m| m.text()),
            ) as u32;
            let completion_tokens = response
                .choices
                .first()
                .map(|c| self.tokenizer.count(&c.message.text()) as u32)
                .unwrap_or(0);
            response.usage = Some(openai::Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            });
        }

        Ok(response)
    }
}

fn classify_transport_error(e: &reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::ConnectTimeout
    } else if let Some(status) = e.status() {
        UpstreamError::StatusCode(status.as_u16())
    } else {
        UpstreamError::Other(e.to_string())
    }
}

#[derive(Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    arguments: String,
}

/// Scans the SSE byte stream manually, splitting on `\n` rather than relying
/// on a line-framing adapter, since some providers split a single SSE frame
/// across multiple TCP reads. Invalid UTF-8 bytes are replaced rather than
/// abandoning the stream; malformed JSON chunks are skipped. Stops at the
/// `[DONE]` sentinel.
async fn aggregate_sse_stream(
    response: reqwest::Response,
) -> Result<openai::ChatCompletionResponse, UpstreamError> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut content = String::new();
    let mut tool_calls: HashMap<usize, ToolCallBuilder> = HashMap::new();
    let mut usage: Option<openai::Usage> = None;
    let mut finish_reason: Option<String> = None;
    let mut model = String::new();
    let mut id = String::new();
    let mut created = 0u64;
    let mut done = false;

    'outer: while let Some(chunk) = stream.next().await {
        let chunk: Bytes = chunk.map_err(|e| classify_transport_error(&e))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline_pos) = buffer.find('\n') {
            let line = buffer[..newline_pos].trim_end_matches('\r').to_string();
            buffer.drain(..=newline_pos);

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                done = true;
                break 'outer;
            }

            let Ok(value) = serde_json::from_str::<Value>(data) else {
                continue;
            };

            if let Some(m) = value.get("model").and_then(Value::as_str) {
                model = m.to_string();
            }
            if let Some(i) = value.get("id").and_then(Value::as_str) {
                id = i.to_string();
            }
            if let Some(c) = value.get("created").and_then(Value::as_u64) {
                created = c;
            }
            if let Some(u) = value.get("usage") {
                if !u.is_null() {
                    if let Ok(parsed) = serde_json::from_value::<openai::Usage>(u.clone()) {
                        usage = Some(parsed);
                    }
                }
            }

            let Some(choice) = value.get("choices").and_then(|c| c.get(0)) else {
                continue;
            };
            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                finish_reason = Some(reason.to_string());
            }
            let Some(delta) = choice.get("delta") else {
                continue;
            };
            if let Some(text) = delta.get("content").and_then(Value::as_str) {
                content.push_str(text);
            }
            if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                for call in calls {
                    let index = call.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                    let builder = tool_calls.entry(index).or_default();
                    if let Some(call_id) = call.get("id").and_then(Value::as_str) {
                        builder.id = call_id.to_string();
                    }
                    if let Some(func) = call.get("function") {
                        if let Some(name) = func.get("name").and_then(Value::as_str) {
                            builder.name.push_str(name);
                        }
                        if let Some(args) = func.get("arguments").and_then(Value::as_str) {
                            builder.arguments.push_str(args);
                        }
                    }
                }
            }
        }
    }
    let _ = done;

    let mut sorted_indices: Vec<_> = tool_calls.keys().copied().collect();
    sorted_indices.sort_unstable();
    let tool_calls = sorted_indices
        .into_iter()
        .map(|i| {
            let builder = tool_calls.remove(&i).unwrap();
            openai::ToolCall {
                id: builder.id,
                kind: "function".to_string(),
                function: openai::FunctionCall {
                    name: builder.name,
                    arguments: builder.arguments,
                },
            }
        })
        .collect::<Vec<_>>();

    let message = openai::ChatMessage {
        role: "assistant".to_string(),
        content: if content.is_empty() {
            None
        } else {
            Some(Value::String(content))
        },
        name: None,
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
        tool_call_id: None,
    };

    if created == 0 {
        created = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
    }

    Ok(openai::ChatCompletionResponse {
        id,
        object: "chat.completion".to_string(),
        created,
        model,
        choices: vec![openai::Choice {
            index: 0,
            message,
            finish_reason,
        }],
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFile;

    fn empty_request(model: &str) -> openai::ChatCompletionRequest {
        openai::ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![],
            stream: false,
            tools: None,
            tool_choice: None,
            temperature: Some(0.9),
            max_tokens: None,
            extra: Default::default(),
        }
    }

    #[test]
    fn merge_payload_precedence_request_over_model_over_global() {
        let mut file = ConfigFile::default();
        file.params
            .global_params
            .insert("temperature".to_string(), Value::from(0.2));
        file.params.model_params.insert(
            "gpt-4".to_string(),
            Map::from_iter([("temperature".to_string(), Value::from(0.5))]),
        );
        let config = ConfigSnapshot::new(file).unwrap();

        let request = empty_request("gpt-4");
        let caller = UpstreamCaller::new(reqwest::Client::new(), reqwest::Client::new());
        let merged = caller.merge_payload("gpt-4", &request, &config);
        assert_eq!(merged.get("temperature").unwrap(), &Value::from(0.9));
    }

    #[test]
    fn merge_payload_falls_back_to_model_then_global() {
        let mut file = ConfigFile::default();
        file.params
            .global_params
            .insert("top_p".to_string(), Value::from(0.3));
        let config = ConfigSnapshot::new(file).unwrap();

        let mut request = empty_request("gpt-4");
        request.temperature = None;
        let caller = UpstreamCaller::new(reqwest::Client::new(), reqwest::Client::new());
        let merged = caller.merge_payload("gpt-4", &request, &config);
        assert_eq!(merged.get("top_p").unwrap(), &Value::from(0.3));
        assert!(merged.get("temperature").is_none());
    }

    #[test]
    fn resolve_provider_splits_prefix_and_resolves_custom_provider() {
        let mut file = ConfigFile::default();
        file.providers.custom.insert(
            "anthropic-direct".to_string(),
            crate::config::CustomProviderConfig {
                base_url: "https://api.anthropic.com/v1".to_string(),
                api_key: "sk-ant".to_string(),
                protocol: Protocol::V1Messages,
                verify_ssl: true,
            },
        );
        let config = ConfigSnapshot::new(file).unwrap();
        let caller = UpstreamCaller::new(reqwest::Client::new(), reqwest::Client::new());
        let (provider, bare_model, display) =
            caller.resolve_provider("anthropic-direct/claude-3-opus", &config);
        assert_eq!(bare_model, "claude-3-opus");
        assert_eq!(display, "anthropic-direct/claude-3-opus");
        assert_eq!(provider.protocol, Protocol::V1Messages);
    }

    #[test]
    fn resolve_provider_falls_back_to_upstream_for_unknown_prefix() {
        let config = ConfigSnapshot::new(ConfigFile::default()).unwrap();
        let caller = UpstreamCaller::new(reqwest::Client::new(), reqwest::Client::new());
        let (provider, bare_model, display) = caller.resolve_provider("ghost/some-model", &config);
        assert_eq!(bare_model, "ghost/some-model");
        assert_eq!(display, "ghost/some-model");
        assert_eq!(provider.protocol, Protocol::Openai);
    }
}
