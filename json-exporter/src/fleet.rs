//! Fleet orchestration: keeps the running target pipelines in sync with the
//! latest configuration snapshot.

use std::sync::Arc;

use json_exporter_common::ConfigSnapshot;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::{ExporterConfig, Target};
use crate::export::TargetMetrics;
use crate::registry::{Counter, Gauge, Registry, RegistryError};
use crate::scraper::Scraper;

/// One running target: a scraper, its metric set, and the forwarding task
/// wiring them together.
struct TargetPipeline {
    name: String,
    scraper: Scraper,
    metrics: Arc<TargetMetrics>,
    stop: watch::Sender<bool>,
}

impl TargetPipeline {
    fn start(
        target: &Target,
        client: reqwest::Client,
        registry: Arc<Registry>,
    ) -> Result<Self, RegistryError> {
        let scraper = Scraper::new(&target.url, client, &registry);
        if let Some(interval) = target.interval {
            scraper.set_interval(interval);
        }
        for (key, value) in &target.headers {
            scraper.set_header(key, value);
        }
        if let Some(retries) = target.retries {
            scraper.set_retries(retries);
        }

        let metrics = Arc::new(TargetMetrics::new(registry));
        for spec in &target.metrics {
            if let Err(e) = metrics.add_metric(&spec.path, &spec.name, &spec.help) {
                // Partial registrations are torn down before the error goes up.
                metrics.close();
                scraper.close();
                return Err(e);
            }
        }

        let name = if target.name.is_empty() {
            target.url.clone()
        } else {
            target.name.clone()
        };

        let mut subscription = scraper.subscribe();
        let (stop, mut stop_rx) = watch::channel(false);
        let forward_name = name.clone();
        let forward_metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    payload = subscription.recv() => match payload {
                        None => break,
                        Some(payload) => {
                            debug!(target = %forward_name, bytes = payload.len(), "payload received");
                            forward_metrics.export(&payload);
                        }
                    }
                }
            }
            debug!(target = %forward_name, "forwarder stopped");
        });

        info!(
            target = %name,
            url = %target.url,
            metrics = target.metrics.len(),
            "target started"
        );
        Ok(Self {
            name,
            scraper,
            metrics,
            stop,
        })
    }

    fn close(self) {
        info!(target = %self.name, "stopping target");
        self.scraper.close();
        let _ = self.stop.send(true);
        self.metrics.close();
    }
}

/// Orchestrator owning the lifecycle of every target pipeline.
pub struct Fleet {
    registry: Arc<Registry>,
    client: reqwest::Client,
    reloads: Counter,
    active: Gauge,
}

impl Fleet {
    pub fn new(registry: Arc<Registry>, client: reqwest::Client) -> Self {
        let reloads = registry.counter(
            "json_exporter_config_reloads_total",
            "Configuration snapshots applied",
            &[],
        );
        let active = registry.gauge(
            "json_exporter_fleet_targets",
            "Currently active scrape targets",
            &[],
        );
        Self {
            registry,
            client,
            reloads,
            active,
        }
    }

    /// Process configuration snapshots strictly sequentially until shutdown;
    /// two rebuilds never overlap.
    pub async fn run(
        self,
        mut configs: watch::Receiver<Option<ConfigSnapshot<ExporterConfig>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut pipelines: Vec<TargetPipeline> = Vec::new();

        let initial = configs.borrow_and_update().clone();
        if let Some(snapshot) = initial {
            self.rebuild(&mut pipelines, &snapshot);
        }

        loop {
            tokio::select! {
                changed = configs.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = configs.borrow_and_update().clone();
                    if let Some(snapshot) = snapshot {
                        self.rebuild(&mut pipelines, &snapshot);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(targets = pipelines.len(), "stopping all targets");
        for pipeline in pipelines.drain(..) {
            pipeline.close();
        }
        self.active.set(0.0);
    }

    /// Full replacement: every running pipeline is closed before the new
    /// target set is built. A target whose registration fails is skipped so
    /// the rest of the fleet still comes up.
    fn rebuild(
        &self,
        pipelines: &mut Vec<TargetPipeline>,
        snapshot: &ConfigSnapshot<ExporterConfig>,
    ) {
        info!(
            fingerprint = %snapshot.fingerprint,
            targets = snapshot.config.targets.len(),
            "new configuration, resetting targets"
        );

        for pipeline in pipelines.drain(..) {
            pipeline.close();
        }

        for target in &snapshot.config.targets {
            match TargetPipeline::start(target, self.client.clone(), Arc::clone(&self.registry)) {
                Ok(pipeline) => pipelines.push(pipeline),
                Err(e) => error!(
                    target = %target.name,
                    url = %target.url,
                    error = %e,
                    "target setup failed, skipping"
                ),
            }
        }

        self.reloads.inc();
        self.active.set(pipelines.len() as f64);
    }
}
