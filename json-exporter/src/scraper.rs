//! Periodic HTTP fetcher with multi-subscriber fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::registry::{Counter, Registry};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_MAX: u32 = 1;
const DEFAULT_RETRY_WAIT_MAX: Duration = Duration::from_secs(30);
const RETRY_WAIT_MIN: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised by [`Scraper::get`] once retries are exhausted.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} returned status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
}

struct State {
    interval: Duration,
    headers: HashMap<String, String>,
    retry_max: u32,
    retry_wait_max: Duration,
    last: Option<String>,
    subscribers: Vec<mpsc::Sender<String>>,
}

struct Inner {
    url: String,
    client: reqwest::Client,
    state: Mutex<State>,
    fetches: Counter,
    errors: Counter,
}

impl Inner {
    /// One fetch with configured headers and bounded retries. The body of a
    /// successful response is stored as the last payload and returned.
    async fn get(&self) -> Result<String, FetchError> {
        self.fetches.inc();
        let (headers, retry_max, retry_wait_max) = {
            let state = self.state.lock();
            (state.headers.clone(), state.retry_max, state.retry_wait_max)
        };

        let mut attempt = 0;
        let mut backoff = RETRY_WAIT_MIN;
        loop {
            match self.fetch_once(&headers).await {
                Ok(body) => {
                    self.state.lock().last = Some(body.clone());
                    return Ok(body);
                }
                Err(e) if attempt < retry_max => {
                    attempt += 1;
                    warn!(url = %self.url, attempt, error = %e, "fetch failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(retry_wait_max);
                }
                Err(e) => {
                    self.errors.inc();
                    return Err(e);
                }
            }
        }
    }

    async fn fetch_once(&self, headers: &HashMap<String, String>) -> Result<String, FetchError> {
        let mut request = self.client.get(&self.url).timeout(REQUEST_TIMEOUT);
        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(|source| FetchError::Transport {
            url: self.url.clone(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: self.url.clone(),
                status,
            });
        }

        response.text().await.map_err(|source| FetchError::Transport {
            url: self.url.clone(),
            source,
        })
    }

    /// Deliver a payload to every live subscriber without blocking: a full
    /// queue drops that delivery, and closed subscribers are pruned.
    fn broadcast(&self, payload: &str) {
        let mut state = self.state.lock();
        state.subscribers.retain(|sub| !sub.is_closed());
        for sub in &state.subscribers {
            if let Err(mpsc::error::TrySendError::Full(_)) = sub.try_send(payload.to_string()) {
                warn!(url = %self.url, "subscriber queue full, dropping payload");
            }
        }
    }
}

/// Per-target poller: fetches a URL on a target cadence and broadcasts each
/// successful payload to all subscribers.
pub struct Scraper {
    inner: Arc<Inner>,
    stop: watch::Sender<bool>,
}

impl Scraper {
    /// Create a scraper and start its poll loop. The first fetch happens
    /// immediately; the cadence applies from there on.
    pub fn new(url: impl Into<String>, client: reqwest::Client, registry: &Registry) -> Self {
        let url = url.into();
        let fetches = registry.counter(
            "json_exporter_scraper_fetches_total",
            "Fetch attempts per scrape target",
            &[("url", url.as_str())],
        );
        let errors = registry.counter(
            "json_exporter_scraper_errors_total",
            "Failed fetches per scrape target",
            &[("url", url.as_str())],
        );

        let inner = Arc::new(Inner {
            url,
            client,
            state: Mutex::new(State {
                interval: DEFAULT_INTERVAL,
                headers: HashMap::new(),
                retry_max: DEFAULT_RETRY_MAX,
                retry_wait_max: DEFAULT_RETRY_WAIT_MAX,
                last: None,
                subscribers: Vec::new(),
            }),
            fetches,
            errors,
        });

        let (stop, stop_rx) = watch::channel(false);
        tokio::spawn(poll(Arc::clone(&inner), stop_rx));

        Self { inner, stop }
    }

    /// One immediate fetch, independent of the poll cadence.
    pub async fn get(&self) -> Result<String, FetchError> {
        self.inner.get().await
    }

    /// Register a new capacity-1 subscription. When a payload has already
    /// been fetched it is delivered immediately, so late subscribers are not
    /// starved until the next cycle.
    pub fn subscribe(&self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(1);
        let mut state = self.inner.state.lock();
        if let Some(last) = &state.last {
            // A fresh capacity-1 channel always has room.
            let _ = tx.try_send(last.clone());
        }
        state.subscribers.push(tx);
        rx
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Change the poll cadence; effective from the next cycle.
    pub fn set_interval(&self, interval: Duration) {
        self.inner.state.lock().interval = interval;
    }

    /// Add a header sent with every request.
    pub fn set_header(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .state
            .lock()
            .headers
            .insert(key.into(), value.into());
    }

    /// Change the per-fetch retry limit.
    pub fn set_retries(&self, retries: u32) {
        self.inner.state.lock().retry_max = retries;
    }

    /// Change the backoff cap between retries.
    pub fn set_retry_wait_max(&self, wait: Duration) {
        self.inner.state.lock().retry_wait_max = wait;
    }

    /// Stop the poll loop at its next suspension point. Further calls are
    /// no-ops.
    pub fn close(&self) {
        let _ = self.stop.send(true);
    }
}

async fn poll(inner: Arc<Inner>, mut stop: watch::Receiver<bool>) {
    info!(url = %inner.url, "starting poll loop");
    let mut wait = Duration::ZERO;
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(wait) => {
                let started = Instant::now();
                let result = inner.get().await;
                // Aim the cadence at wall-clock alignment rather than fixed
                // spacing after each fetch.
                let interval = inner.state.lock().interval;
                wait = interval.saturating_sub(started.elapsed());
                match result {
                    Ok(payload) => inner.broadcast(&payload),
                    // This cycle is skipped; the next one runs on schedule.
                    Err(e) => warn!(url = %inner.url, error = %e, "fetch failed"),
                }
            }
        }
    }
    debug!(url = %inner.url, "poll loop stopped");
}
