// src/webhooks/dispatch.rs

use super::log::{DeliveryLog, DeliveryStatus};
use super::now_rfc3339;
use reqwest::Client;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

/// Per-delivery network timeout.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Response bodies are kept in the log up to this many characters.
const MAX_LOGGED_BODY_CHARS: usize = 500;

struct DeliveryJob {
    log_id: u64,
    url: String,
    payload: Value,
    headers: BTreeMap<String, String>,
}

/// Best-effort webhook delivery on a fixed pool of workers.
///
/// `dispatch` never blocks and never fails the caller: every delivery gets
/// a log entry that starts `pending` and ends `success`, `failed` or `error`.
/// At most once, no retries.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<DeliveryJob>,
    // Keeps the queue open for as long as any handle lives.
    _rx: Arc<Mutex<mpsc::Receiver<DeliveryJob>>>,
    log: DeliveryLog,
    in_flight: Arc<AtomicUsize>,
}

impl Dispatcher {
    /// Start `workers` delivery tasks draining a queue of `capacity` jobs.
    /// Must be called inside a tokio runtime.
    pub fn spawn(workers: usize, capacity: usize, log: DeliveryLog) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(DELIVERY_TIMEOUT).build()?;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let in_flight = Arc::new(AtomicUsize::new(0));

        for n in 0..workers {
            tokio::spawn(run_worker(
                n,
                Arc::clone(&rx),
                client.clone(),
                log.clone(),
                Arc::clone(&in_flight),
            ));
        }
        info!(workers, capacity, "Webhook dispatcher started");

        Ok(Self {
            tx,
            _rx: rx,
            log,
            in_flight,
        })
    }

    /// Queue one POST of `payload` to `url`.
    pub fn dispatch(&self, url: &str, payload: Value, headers: BTreeMap<String, String>) {
        let log_id = self.log.begin(url, now_rfc3339());
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let job = DeliveryJob {
            log_id,
            url: url.to_string(),
            payload,
            headers,
        };
        if let Err(e) = self.tx.try_send(job) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "dispatch queue full",
                mpsc::error::TrySendError::Closed(_) => "dispatcher stopped",
            };
            warn!(url = %url, reason, "Webhook not queued");
            self.log.finish(log_id, |entry| {
                entry.status = DeliveryStatus::Error;
                entry.error = Some(reason.to_string());
            });
        }
    }

    /// Deliveries queued or running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> &DeliveryLog {
        &self.log
    }
}

async fn run_worker(
    n: usize,
    rx: Arc<Mutex<mpsc::Receiver<DeliveryJob>>>,
    client: Client,
    log: DeliveryLog,
    in_flight: Arc<AtomicUsize>,
) {
    loop {
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else {
            info!(worker = n, "Dispatcher queue closed, worker exiting");
            break;
        };
        deliver(&client, &log, job).await;
        in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn deliver(client: &Client, log: &DeliveryLog, job: DeliveryJob) {
    let mut request = client.post(&job.url).json(&job.payload);
    for (name, value) in &job.headers {
        request = request.header(name.as_str(), value.as_str());
    }

    match request.send().await {
        Ok(response) => {
            let code = response.status();
            let body: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(MAX_LOGGED_BODY_CHARS)
                .collect();
            let status = if code.is_success() {
                info!(url = %job.url, code = code.as_u16(), "Webhook delivered");
                DeliveryStatus::Success
            } else {
                warn!(url = %job.url, code = code.as_u16(), "Webhook rejected");
                DeliveryStatus::Failed
            };
            log.finish(job.log_id, |entry| {
                entry.status = status;
                entry.response_code = Some(code.as_u16());
                entry.response_body = Some(body);
            });
        }
        Err(e) => {
            warn!(url = %job.url, error = %e, "Webhook delivery error");
            log.finish(job.log_id, |entry| {
                entry.status = DeliveryStatus::Error;
                entry.error = Some(e.to_string());
            });
        }
    }
}
