use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

pub const DEFAULT_RING_CAPACITY: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RingLine {
    pub seq: u64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub text: String,
}

/// Bounded in-memory tail of recent log lines for an in-app log viewer.
#[derive(Debug)]
pub struct LogRingBuffer {
    max_lines: usize,
    seq: AtomicU64,
    dropped_total: AtomicU64,
    lines: RwLock<VecDeque<RingLine>>,
}

impl Default for LogRingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

impl LogRingBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            seq: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            lines: RwLock::new(VecDeque::new()),
        }
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    pub fn push(&self, level: &str, target: &str, text: String) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let line = RingLine {
            seq,
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: level.to_string(),
            target: target.to_string(),
            text,
        };
        let mut guard = self.lines.write().unwrap_or_else(|e| e.into_inner());
        guard.push_back(line);
        while guard.len() > self.max_lines {
            guard.pop_front();
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
        }
        seq
    }

    pub fn snapshot(&self, last_n: usize) -> Vec<RingLine> {
        let guard = self.lines.read().unwrap_or_else(|e| e.into_inner());
        let start = guard.len().saturating_sub(last_n);
        guard.iter().skip(start).cloned().collect()
    }

    pub fn since(&self, seq: u64) -> Vec<RingLine> {
        let guard = self.lines.read().unwrap_or_else(|e| e.into_inner());
        guard.iter().filter(|l| l.seq > seq).cloned().collect()
    }

    pub fn layer(self: &Arc<Self>) -> RingLayer {
        RingLayer {
            ring: Arc::clone(self),
        }
    }
}

/// `tracing` layer that mirrors every event into a [`LogRingBuffer`].
pub struct RingLayer {
    ring: Arc<LogRingBuffer>,
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else if !value.is_empty() {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for RingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let meta = event.metadata();
        self.ring.push(
            meta.level().as_str(),
            meta.target(),
            format!("{}{}", visitor.message, visitor.fields),
        );
    }
}
