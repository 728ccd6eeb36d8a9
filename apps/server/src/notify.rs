//! Fire-and-forget Telegram messages to the shop owner.

use crate::models::{Reservation, ReservationStatus};

/// Sends messages to one Telegram chat. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct Notifier {
    http: reqwest::Client,
    bot_token: String,
    chat_id: i64,
}

impl Notifier {
    pub fn new(bot_token: impl Into<String>, chat_id: i64) -> Self {
        Self {
            http: reqwest::Client::new(),
            bot_token: bot_token.into(),
            chat_id,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.bot_token.is_empty()
    }

    /// Queue a message and return immediately. Delivery failures are logged
    /// at WARN (not ERROR, which would feed back into the alert layer).
    pub fn dispatch(&self, text: impl Into<String>) {
        let text = text.into();
        if !self.is_enabled() {
            tracing::debug!("notifications disabled, dropping: {}", text);
            return;
        }

        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let client = self.http.clone();
        let chat_id = self.chat_id;

        tokio::spawn(async move {
            let sent = client
                .post(&url)
                .json(&serde_json::json!({
                    "chat_id": chat_id,
                    "text": text,
                    "parse_mode": "HTML"
                }))
                .send()
                .await
                .and_then(|r| r.error_for_status());
            if let Err(e) = sent {
                tracing::warn!("Telegram notification failed: {}", e);
            }
        });
    }
}

// ── Message texts ──

/// Escape text for Telegram's HTML parse mode.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn reservation_created(r: &Reservation) -> String {
    format!(
        "✂️ Nueva reserva\n\n👤 {} ({})\n💈 {}\n📅 {} a las {}",
        escape_html(&r.customer_name),
        escape_html(&r.customer_phone),
        escape_html(&r.service_name),
        r.date,
        r.time
    )
}

pub fn reservation_cancelled(r: &Reservation, by_customer: bool) -> String {
    let who = if by_customer { "el cliente" } else { "el local" };
    format!(
        "❌ Reserva cancelada por {}\n\n👤 {} ({})\n📅 {} a las {}",
        who,
        escape_html(&r.customer_name),
        escape_html(&r.customer_phone),
        r.date,
        r.time
    )
}

pub fn status_changed(r: &Reservation, from: ReservationStatus) -> String {
    format!(
        "🔄 Reserva {} {} a las {}: {} → {}",
        r.id,
        r.date,
        r.time,
        from.label(),
        r.status.label()
    )
}
