// src/state.rs

use crate::config::{Config, ServerSection};
use crate::llm_extract::{ExtractionClient, ExtractionResult};
use crate::webhooks::{DeliveryLog, Dispatcher, WebhookStore, now_rfc3339};
use serde::Serialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;

pub const EXTRACTION_EVENT: &str = "invoice.extracted";

/// The most recent result, with when it arrived.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceivedData {
    pub timestamp: String,
    pub data: Value,
}

/// Holds only the latest received result; updates overwrite.
#[derive(Default)]
pub struct ReceivedSlot {
    slot: Mutex<Option<ReceivedData>>,
}

impl ReceivedSlot {
    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ReceivedData>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, data: Value) {
        *self.lock() = Some(ReceivedData {
            timestamp: now_rfc3339(),
            data,
        });
    }

    /// Overwrite unless `data` equals what is stored. Returns whether it wrote.
    pub fn set_if_changed(&self, data: Value) -> bool {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|r| r.data == data) {
            return false;
        }
        *slot = Some(ReceivedData {
            timestamp: now_rfc3339(),
            data,
        });
        true
    }

    pub fn get(&self) -> Option<ReceivedData> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }
}

/// Everything the handlers share, owned by the router.
pub struct AppState {
    pub extractor: ExtractionClient,
    pub webhooks: WebhookStore,
    pub dispatcher: Dispatcher,
    pub received: ReceivedSlot,
    pub upload_dir: PathBuf,
    pub public_url: String,
    /// Request body cap in bytes; the router enforces it and 413s quote it.
    pub max_body_bytes: usize,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        extractor: ExtractionClient,
        webhooks: WebhookStore,
        dispatcher: Dispatcher,
        upload_dir: PathBuf,
        public_url: String,
    ) -> Self {
        Self {
            extractor,
            webhooks,
            dispatcher,
            received: ReceivedSlot::default(),
            upload_dir,
            public_url,
            max_body_bytes: ServerSection::default().max_body_bytes,
        }
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Wire up state from config. Must run inside the tokio runtime.
    pub fn from_config(cfg: &Config) -> Result<Self, Box<dyn std::error::Error>> {
        std::fs::create_dir_all(&cfg.server.upload_dir)?;
        let dispatcher = Dispatcher::spawn(
            cfg.webhooks.workers.max(1),
            cfg.webhooks.queue_capacity,
            DeliveryLog::new(),
        )?;
        let webhooks = WebhookStore::new(&cfg.webhooks.store_path);
        info!(
            path = %webhooks.path().display(),
            configured = webhooks.list().len(),
            "Webhook store opened"
        );
        Ok(Self::new(
            ExtractionClient::from_config(&cfg.model),
            webhooks,
            dispatcher,
            cfg.server.upload_dir.clone(),
            cfg.server.public_url(),
        )
        .with_max_body_bytes(cfg.server.max_body_bytes))
    }

    /// Remember the result, then fan it out to every enabled webhook.
    pub fn record_extraction(&self, data: &ExtractionResult) {
        let data = Value::Object(data.clone());
        self.received.set(data.clone());

        let event = json!({
            "event": EXTRACTION_EVENT,
            "timestamp": now_rfc3339(),
            "data": data,
        });
        let targets = self.webhooks.enabled();
        info!(targets = targets.len(), "Dispatching extraction to webhooks");
        for webhook in targets {
            self.dispatcher
                .dispatch(&webhook.url, event.clone(), webhook.headers);
        }
    }

    /// Handle a payload posted to the demo receiver. Extraction events are
    /// unwrapped so the slot holds the result itself.
    pub fn receive_demo(&self, payload: Value) -> bool {
        let data = match payload {
            Value::Object(mut map)
                if map.get("event").and_then(Value::as_str) == Some(EXTRACTION_EVENT)
                    && map.contains_key("data") =>
            {
                map.remove("data").unwrap_or(Value::Null)
            }
            other => other,
        };

        let (keys, items) = summarize(&data);
        let updated = self.received.set_if_changed(data);
        info!(keys = %keys, items, updated, "Demo webhook received");
        updated
    }

    pub fn clear_webhook_data(&self) {
        self.dispatcher.log().clear();
        self.received.clear();
        info!("Webhook logs and received data cleared");
    }
}

fn summarize(data: &Value) -> (String, usize) {
    match data {
        Value::Object(map) => {
            let keys = map.keys().cloned().collect::<Vec<_>>().join(",");
            let items = map.get("items").and_then(Value::as_array).map_or(0, Vec::len);
            (keys, items)
        }
        _ => (String::new(), 0),
    }
}
