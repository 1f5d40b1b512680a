// pgkeeper/src/notifier/mod.rs
//
// Best-effort status messages. A failed notification never affects the
// batch; transport errors are dropped on purpose.

use async_trait::async_trait;
use chrono::Local;

use crate::config::NotifyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyStatus {
    Note,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct AlertRequest {
    pub status: NotifyStatus,
    pub message: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, request: &AlertRequest);
}

/// Builds the configured notifier, if any.
pub fn new_notifier(cfg: &NotifyConfig) -> Option<Box<dyn Notifier>> {
    if !cfg.enable || !cfg.telegram.enable {
        return None;
    }
    Some(Box::new(TelegramNotifier {
        token: cfg.telegram.token.clone(),
        chat_id: cfg.telegram.chat_id.clone(),
        client: reqwest::Client::new(),
    }))
}

pub struct TelegramNotifier {
    token: String,
    chat_id: String,
    client: reqwest::Client,
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_message(&self, request: &AlertRequest) {
        if request.message.is_empty() {
            return;
        }

        let endpoint = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let text = render_message(request);
        let form = [
            ("chat_id", self.chat_id.as_str()),
            ("parse_mode", "html"),
            ("text", text.as_str()),
        ];

        let _ = self.client.post(&endpoint).form(&form).send().await;
    }
}

fn render_message(request: &AlertRequest) -> String {
    let ts = Local::now().format("%Y-%m-%d %H:%M:%S");
    let (badge, label) = match request.status {
        NotifyStatus::Note => ("⚪", "NOTE"),
        NotifyStatus::Info => ("🟢", "INFO"),
        NotifyStatus::Warn => ("🟡", "WARNING"),
        NotifyStatus::Error => ("🔴", "ERROR"),
    };
    format!(
        "<b>{badge} {label} {badge}</b>\n\n{}\n\nDate: {ts}\n",
        request.message
    )
}
