// src/webhooks/store.rs

use super::{NewWebhook, Webhook, WebhookFile, now_rfc3339};
use crate::error::StoreError;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Webhook targets persisted to a flat JSON file.
///
/// The file is read fully before every operation and rewritten after every
/// mutation. Mutations hold a lock across load-modify-save so concurrent
/// requests in this process do not lose each other's updates.
pub struct WebhookStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl WebhookStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current contents; a missing or corrupt file reads as empty.
    pub fn load(&self) -> WebhookFile {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Could not read webhook config");
                }
                return WebhookFile::default();
            }
        };
        match serde_json::from_str(&content) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Corrupt webhook config, treating as empty");
                WebhookFile::default()
            }
        }
    }

    pub fn save(&self, file: &WebhookFile) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(file)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, json)?;
        Ok(())
    }

    pub fn list(&self) -> Vec<Webhook> {
        self.load().webhooks
    }

    pub fn enabled(&self) -> Vec<Webhook> {
        self.list().into_iter().filter(|w| w.enabled).collect()
    }

    /// Register a target. Returns `Ok(None)` when the URL is blank.
    pub fn add(&self, new: NewWebhook) -> Result<Option<Webhook>, StoreError> {
        if new.url.trim().is_empty() {
            return Ok(None);
        }

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = self.load();
        self.insert(&mut file, new).map(Some)
    }

    /// Append to `file` and persist it. Caller holds the lock.
    fn insert(&self, file: &mut WebhookFile, new: NewWebhook) -> Result<Webhook, StoreError> {
        let id = file.allocate_id();
        let webhook = Webhook {
            id,
            name: new
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format!("Webhook {id}")),
            url: new.url.trim().to_string(),
            enabled: new.enabled,
            headers: new.headers,
            created_at: now_rfc3339(),
        };
        file.webhooks.push(webhook.clone());
        self.save(file)?;

        info!(id, url = %webhook.url, enabled = webhook.enabled, "Webhook added");
        Ok(webhook)
    }

    /// Remove by id. Missing ids are a no-op; returns whether one was removed.
    pub fn delete(&self, id: u64) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = self.load();
        let before = file.webhooks.len();
        file.webhooks.retain(|w| w.id != id);
        let removed = file.webhooks.len() != before;
        self.save(&file)?;

        info!(id, removed, "Webhook delete");
        Ok(removed)
    }

    /// Flip `enabled` on the matching webhook and return it.
    pub fn toggle(&self, id: u64) -> Result<Option<Webhook>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = self.load();
        let Some(webhook) = file.webhooks.iter_mut().find(|w| w.id == id) else {
            return Ok(None);
        };
        webhook.enabled = !webhook.enabled;
        let toggled = webhook.clone();
        self.save(&file)?;

        info!(id, enabled = toggled.enabled, "Webhook toggled");
        Ok(Some(toggled))
    }

    /// Register `url` unless a webhook with that URL already exists. The
    /// lookup and the insert happen under one lock.
    pub fn ensure(&self, url: &str, name: &str) -> Result<Webhook, StoreError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(StoreError::MissingUrl);
        }

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = self.load();
        if let Some(existing) = file.webhooks.iter().find(|w| w.url == url) {
            return Ok(existing.clone());
        }
        let new = NewWebhook {
            url: url.to_string(),
            name: Some(name.to_string()),
            enabled: true,
            ..Default::default()
        };
        self.insert(&mut file, new)
    }
}
