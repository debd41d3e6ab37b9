// src/webhooks/mod.rs

mod dispatch;
mod log;
mod store;

pub use dispatch::Dispatcher;
pub use log::{DeliveryLog, DeliveryStatus};
pub use store::WebhookStore;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A configured delivery target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: u64,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub created_at: String,
}

/// On-disk shape of the webhook config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookFile {
    #[serde(default)]
    pub webhooks: Vec<Webhook>,
    /// Next id to hand out; never goes backwards, so deleted ids stay retired.
    #[serde(default)]
    pub next_id: u64,
}

impl WebhookFile {
    fn allocate_id(&mut self) -> u64 {
        let after_max = self.webhooks.iter().map(|w| w.id).max().unwrap_or(0) + 1;
        let id = self.next_id.max(after_max);
        self.next_id = id + 1;
        id
    }
}

/// Fields accepted when registering a webhook.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewWebhook {
    #[serde(default)]
    pub url: String,
    pub name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

/// RFC 3339 UTC timestamp for records and log entries.
pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}
