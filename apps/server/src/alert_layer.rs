//! Tracing layer that forwards ERROR events to the shop owner's chat.
//!
//! At most one alert per `MIN_INTERVAL`, and an identical message is
//! suppressed for `DEDUP_WINDOW`. Delivery goes through [`Notifier`], so it
//! never blocks the logging call site.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::notify::{escape_html, Notifier};

const MIN_INTERVAL: Duration = Duration::from_secs(10);
const DEDUP_WINDOW: Duration = Duration::from_secs(60);

// ── Throttle ──

/// Rate limit + dedup bookkeeping, keyed by message hash.
#[derive(Debug)]
struct AlertThrottle {
    last_sent: Option<Instant>,
    recent: Vec<(u64, Instant)>,
}

impl AlertThrottle {
    fn new() -> Self {
        Self {
            last_sent: None,
            recent: Vec::new(),
        }
    }

    /// Decide whether an alert with `hash` goes out at `now`, and record it if so.
    fn admit(&mut self, hash: u64, now: Instant) -> bool {
        self.recent
            .retain(|(_, ts)| now.duration_since(*ts) < DEDUP_WINDOW);

        let is_dup = self.recent.iter().any(|(h, _)| *h == hash);
        let too_soon = self
            .last_sent
            .is_some_and(|last| now.duration_since(last) < MIN_INTERVAL);
        if is_dup || too_soon {
            return false;
        }

        self.last_sent = Some(now);
        self.recent.push((hash, now));
        true
    }
}

// ── Layer ──

pub struct AlertLayer {
    notifier: Notifier,
    throttle: Mutex<AlertThrottle>,
}

impl AlertLayer {
    pub fn new(notifier: Notifier) -> Self {
        Self {
            notifier,
            throttle: Mutex::new(AlertThrottle::new()),
        }
    }
}

impl<S: Subscriber> Layer<S> for AlertLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() != Level::ERROR {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let message = visitor.message();

        let hash = {
            let mut h = DefaultHasher::new();
            message.hash(&mut h);
            h.finish()
        };
        let admitted = match self.throttle.lock() {
            Ok(mut throttle) => throttle.admit(hash, Instant::now()),
            Err(_) => false,
        };
        if !admitted {
            return;
        }

        let meta = event.metadata();
        let location = match (meta.file(), meta.line()) {
            (Some(file), Some(line)) => format!("{file}:{line}"),
            _ => "?".into(),
        };
        let message = escape_html(&message);
        let now_utc = chrono::Utc::now().format("%H:%M:%S UTC");
        self.notifier.dispatch(format!(
            "\u{1f6a8} <b>Error en el servidor</b>\n\
             <code>{message}</code>\n\
             \u{1f4cd} {} ({location})\n\
             \u{1f550} {now_utc}",
            escape_html(meta.target())
        ));
    }
}

// ── Field visitor ──

/// Collects the `message` field plus any structured fields of an event.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl MessageVisitor {
    fn message(&self) -> String {
        if self.fields.is_empty() {
            return self.message.clone();
        }
        let extras = self
            .fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        if self.message.is_empty() {
            extras
        } else {
            format!("{} ({})", self.message, extras)
        }
    }

    fn push(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.push((field.name().to_string(), value));
        }
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.push(field, format!("{:?}", value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_alert_allowed() {
        let mut t = AlertThrottle::new();
        assert!(t.admit(111, Instant::now()));
    }

    #[test]
    fn test_rate_limit_suppresses_second() {
        let mut t = AlertThrottle::new();
        let now = Instant::now();
        assert!(t.admit(111, now));
        assert!(!t.admit(222, now + Duration::from_secs(1)));
    }

    #[test]
    fn test_dedup_within_window() {
        let mut t = AlertThrottle::new();
        let now = Instant::now();
        assert!(t.admit(111, now));
        assert!(!t.admit(111, now + MIN_INTERVAL));
    }

    #[test]
    fn test_other_error_after_interval() {
        let mut t = AlertThrottle::new();
        let now = Instant::now();
        assert!(t.admit(111, now));
        assert!(t.admit(222, now + MIN_INTERVAL));
    }

    #[test]
    fn test_dedup_expires() {
        let mut t = AlertThrottle::new();
        let now = Instant::now();
        assert!(t.admit(111, now));
        assert!(t.admit(111, now + DEDUP_WINDOW));
    }

    #[test]
    fn test_message_with_fields() {
        let v = MessageVisitor {
            message: "DB error".into(),
            fields: vec![("reservation_id".into(), "42".into())],
        };
        assert_eq!(v.message(), "DB error (reservation_id=42)");
    }

    #[test]
    fn test_message_fields_only() {
        let v = MessageVisitor {
            message: String::new(),
            fields: vec![("error".into(), "timeout".into())],
        };
        assert_eq!(v.message(), "error=timeout");
    }
}
