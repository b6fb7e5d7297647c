//! Prometheus exporter for arbitrary JSON-emitting HTTP services.
//!
//! This crate polls configured HTTP endpoints, extracts scalar values from
//! their JSON payloads via path expressions, and exposes them as gauges on an
//! HTTP `/metrics` endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │  JSON endpoint  │────>│ Scraper + paths │────>│   HTTP Server   │
//! │  (polled HTTP)  │     │   (registry)    │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! One [`fleet::Fleet`] task follows configuration snapshots from a
//! [`json_exporter_common::ConfigWatcher`] and rebuilds the whole set of
//! scraper/metric-set pairs whenever the file changes.
//!
//! # Usage
//!
//! Run the exporter binary with a configuration file:
//!
//! ```bash
//! json-exporter --config config.yaml
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for the file format.

pub mod config;
pub mod export;
pub mod fleet;
pub mod http;
pub mod registry;
pub mod scraper;

pub use config::ExporterConfig;
pub use export::TargetMetrics;
pub use fleet::Fleet;
pub use http::HttpServer;
pub use registry::{Registry, RegistryError};
pub use scraper::{FetchError, Scraper};
