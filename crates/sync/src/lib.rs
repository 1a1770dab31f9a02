//! kvop sync: ensure-exists for dependent dashboards and monitors.
//!
//! Each dependent object is read by its canonical name and created only when
//! absent. An existing object is never overwritten, and a create that loses a
//! race (`AlreadyExists`) counts as success.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use kvop_core::{names, MonitorTarget, ObjectKind, StoreError, StoreResult, Topology};
use kvop_kubehub::{CallCtx, ObjectStore};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, error, info};

pub mod objects;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty()).unwrap_or_else(|| default.to_string())
}

/// Settings that shape generated objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// `app` label placed on dashboards so the Grafana instance selects them.
    pub grafana_app_label: String,
    /// Named service port scraped by monitors.
    pub exporter_port: String,
    /// Owner annotation used when the workload carries none.
    pub default_owner: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { grafana_app_label: "grafana".into(), exporter_port: "redis-exporter".into(), default_owner: "kvop".into() }
    }
}

impl SyncConfig {
    /// Defaults overridden by `KVOP_GRAFANA_APP_LABEL`, `KVOP_EXPORTER_PORT`, `KVOP_DEFAULT_OWNER`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            grafana_app_label: env_or("KVOP_GRAFANA_APP_LABEL", &d.grafana_app_label),
            exporter_port: env_or("KVOP_EXPORTER_PORT", &d.exporter_port),
            default_owner: env_or("KVOP_DEFAULT_OWNER", &d.default_owner),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnsureOutcome {
    Created,
    AlreadyPresent,
}

/// A fully built object to ensure.
#[derive(Debug, Clone)]
pub struct Desired {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
    pub body: Json,
}

pub struct Synchronizer {
    store: Arc<dyn ObjectStore>,
    cfg: SyncConfig,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn ObjectStore>, cfg: SyncConfig) -> Self { Self { store, cfg } }

    pub fn config(&self) -> &SyncConfig { &self.cfg }

    fn owner<'a>(&'a self, owner: Option<&'a str>) -> &'a str {
        owner.filter(|o| !o.is_empty()).unwrap_or(&self.cfg.default_owner)
    }

    /// Ensure the workload's dashboard exists.
    pub async fn ensure_dashboard(
        &self,
        ctx: &CallCtx,
        namespace: &str,
        owner: Option<&str>,
        workload: &str,
        topology: Topology,
    ) -> StoreResult<EnsureOutcome> {
        let desired = objects::dashboard(&self.cfg, namespace, self.owner(owner), workload, topology);
        let outcome = self.ensure(ctx, &desired).await?;
        info!(ns = %namespace, name = %desired.name, "GrafanaDashboard is in-sync");
        Ok(outcome)
    }

    /// Ensure every monitor of the topology exists, leader before follower.
    /// Stops at the first error; a later call picks up what is still missing.
    pub async fn ensure_monitor(
        &self,
        ctx: &CallCtx,
        namespace: &str,
        owner: Option<&str>,
        workload: &str,
        topology: Topology,
    ) -> StoreResult<Vec<(MonitorTarget, EnsureOutcome)>> {
        let owner = self.owner(owner);
        let mut out = Vec::with_capacity(2);
        for target in names::monitor_targets(topology) {
            let desired = objects::monitor(&self.cfg, namespace, owner, workload, target);
            out.push((target, self.ensure(ctx, &desired).await?));
        }
        info!(ns = %namespace, workload = %workload, monitors = out.len(), "ServiceMonitor is in-sync");
        Ok(out)
    }

    /// Read by name; create when absent. Never updates an existing object.
    pub async fn ensure(&self, ctx: &CallCtx, desired: &Desired) -> StoreResult<EnsureOutcome> {
        let t0 = Instant::now();
        counter!("sync_ensure_total", 1u64, "kind" => desired.kind.kind());
        let res = self.ensure_inner(ctx, desired).await;
        histogram!("sync_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(EnsureOutcome::Created) => counter!("sync_created_total", 1u64, "kind" => desired.kind.kind()),
            Ok(EnsureOutcome::AlreadyPresent) => {}
            Err(e) => {
                counter!("sync_errors_total", 1u64, "kind" => desired.kind.kind());
                error!(kind = %desired.kind, ns = %desired.namespace, name = %desired.name, error = %e, "ensure failed");
            }
        }
        res
    }

    async fn ensure_inner(&self, ctx: &CallCtx, d: &Desired) -> StoreResult<EnsureOutcome> {
        match self.store.get(ctx, d.kind, &d.namespace, &d.name).await {
            Ok(_) => {
                debug!(kind = %d.kind, ns = %d.namespace, name = %d.name, "already present");
                return Ok(EnsureOutcome::AlreadyPresent);
            }
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        match self.store.create(ctx, d.kind, &d.namespace, &d.body).await {
            Ok(_) => {
                info!(kind = %d.kind, ns = %d.namespace, name = %d.name, "created");
                Ok(EnsureOutcome::Created)
            }
            Err(StoreError::AlreadyExists(_)) => {
                debug!(kind = %d.kind, ns = %d.namespace, name = %d.name, "created concurrently; treating as present");
                Ok(EnsureOutcome::AlreadyPresent)
            }
            Err(e) => Err(e),
        }
    }
}
