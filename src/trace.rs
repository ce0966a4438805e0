//! Per-request trace events plus the live trace bus: a bounded ring buffer of
//! formatted lines fanned out to connected subscribers, with replay-on-
//! connect and a fixed-width line format built from a localized stage table.

use chrono::Local;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

const RING_BUFFER_CAPACITY: usize = 10_000;
const REPLAY_LINES: usize = 1_000;
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    ReqReceived,
    RouterStart,
    RouterEnd,
    RouterFail,
    ModelCallStart,
    FirstToken,
    FullResponse,
    ModelFail,
    AllFailed,
}

impl Stage {
    fn localized(self) -> &'static str {
        match self {
            Stage::ReqReceived => "请求接收",
            Stage::RouterStart => "路由开始",
            Stage::RouterEnd => "路由完成",
            Stage::RouterFail => "路由失败",
            Stage::ModelCallStart => "模型调用开始",
            Stage::FirstToken => "首Token",
            Stage::FullResponse => "完整响应",
            Stage::ModelFail => "模型失败",
            Stage::AllFailed => "全部失败",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Success,
    Fail,
}

impl EventStatus {
    fn localized(self) -> &'static str {
        match self {
            EventStatus::Success => "成功",
            EventStatus::Fail => "失败",
        }
    }
}

/// One immutable record in a request's trace timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub stage: Stage,
    pub timestamp_unix_ms: u64,
    pub duration_ms: u64,
    pub status: EventStatus,
    pub retry_count: u32,
    pub model: Option<String>,
    pub reason: Option<String>,
    pub details: Option<String>,
    pub trace_id: String,
}

impl TraceEvent {
    pub fn format_line(&self) -> String {
        let local = chrono::DateTime::<Local>::from(
            UNIX_EPOCH + std::time::Duration::from_millis(self.timestamp_unix_ms),
        );
        let short_id: String = self.trace_id.chars().take(8).collect();
        let mut line = format!(
            "[{}] 【{}】 {} (耗时: {}ms) [重试: {}]",
            local.format("%H:%M:%S%.3f"),
            self.stage.localized(),
            self.status.localized(),
            self.duration_ms,
            self.retry_count,
        );
        let mut details = Vec::new();
        if let Some(model) = &self.model {
            details.push(model.clone());
        }
        if let Some(reason) = &self.reason {
            details.push(reason.clone());
        }
        if let Some(extra) = &self.details {
            details.push(extra.clone());
        }
        if !details.is_empty() {
            line.push_str(" | ");
            line.push_str(&details.join(" "));
        }
        line.push_str(&format!(" <{short_id}>"));
        line
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct Subscriber {
    sender: mpsc::Sender<String>,
}

/// Bounded ring buffer of formatted lines plus best-effort fan-out to
/// connected subscribers. A subscriber whose queue is full is dropped rather
/// than allowed to block the producer; a new subscriber is replayed the last
/// 1,000 lines before live lines start arriving.
pub struct TraceBus {
    buffer: Mutex<VecDeque<String>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl TraceBus {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(RING_BUFFER_CAPACITY)),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn publish(&self, event: &TraceEvent) {
        let line = event.format_line();
        println!("{line}");

        let mut buffer = self.buffer.lock();
        if buffer.len() >= RING_BUFFER_CAPACITY {
            buffer.pop_front();
        }
        buffer.push_back(line.clone());
        drop(buffer);

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| sub.sender.try_send(line.clone()).is_ok());
    }

    /// Subscribes a new live listener, returning a receiver already primed
    /// with the last 1,000 buffered lines.
    pub fn subscribe(&self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let buffer = self.buffer.lock();
        let replay: Vec<String> = buffer
            .iter()
            .rev()
            .take(REPLAY_LINES)
            .rev()
            .cloned()
            .collect();
        drop(buffer);
        for line in replay {
            let _ = tx.try_send(line);
        }
        self.subscribers.lock().push(Subscriber { sender: tx });
        rx
    }

    pub fn recent_lines(&self, limit: usize) -> Vec<String> {
        let buffer = self.buffer.lock();
        buffer.iter().rev().take(limit).rev().cloned().collect()
    }
}

impl Default for TraceBus {
    fn default() -> Self {
        Self::new()
    }
}
