//! kvop reconcile: one-shot reconcile of a single workload key.
//!
//! This is what an external controller loop calls on every event for a
//! workload. It re-reads the descriptor, lets the finalizer orchestrator act
//! on it and, for a live workload, ensures its dashboard and monitors exist.
//! Errors are returned untouched for the caller's retry policy.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use kvop_core::{MonitorTarget, StoreError, StoreResult, WorkloadKind};
use kvop_finalize::{FinalizeOutcome, Finalizer, TeardownReport};
use kvop_kubehub::{CallCtx, ObjectStore, WorkloadStore};
use kvop_sync::{EnsureOutcome, SyncConfig, Synchronizer};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileOutcome {
    /// The workload no longer exists.
    Gone,
    /// Live workload: finalizer attached and dependents ensured.
    Synced {
        finalizer_attached: bool,
        dashboard: EnsureOutcome,
        monitors: Vec<(MonitorTarget, EnsureOutcome)>,
    },
    /// Teardown finished and the finalizer was released.
    Released(TeardownReport),
    /// Marked for deletion but not holding our finalizer.
    Untouched,
}

pub struct Reconciler {
    workloads: Arc<dyn WorkloadStore>,
    sync: Synchronizer,
    finalizer: Finalizer,
}

impl Reconciler {
    pub fn new(objects: Arc<dyn ObjectStore>, workloads: Arc<dyn WorkloadStore>, cfg: SyncConfig) -> Self {
        Self {
            workloads: workloads.clone(),
            sync: Synchronizer::new(objects.clone(), cfg),
            finalizer: Finalizer::new(objects, workloads),
        }
    }

    pub fn synchronizer(&self) -> &Synchronizer { &self.sync }

    pub fn finalizer(&self) -> &Finalizer { &self.finalizer }

    pub async fn reconcile(&self, ctx: &CallCtx, kind: WorkloadKind, namespace: &str, name: &str) -> StoreResult<ReconcileOutcome> {
        let t0 = Instant::now();
        let workload = match self.workloads.get_workload(ctx, kind, namespace, name).await {
            Ok(w) => w,
            Err(StoreError::NotFound(_)) => {
                info!(ns = %namespace, name = %name, "workload gone");
                return Ok(ReconcileOutcome::Gone);
            }
            Err(e) => return Err(e),
        };

        let outcome = match self.finalizer.handle(ctx, &workload).await? {
            FinalizeOutcome::Active { attached, workload } => {
                let owner = workload.owner.as_deref();
                let topology = workload.topology();
                let dashboard = self.sync.ensure_dashboard(ctx, namespace, owner, name, topology).await?;
                let monitors = self.sync.ensure_monitor(ctx, namespace, owner, name, topology).await?;
                ReconcileOutcome::Synced { finalizer_attached: attached, dashboard, monitors }
            }
            FinalizeOutcome::Released(report) => ReconcileOutcome::Released(report),
            FinalizeOutcome::Untouched => ReconcileOutcome::Untouched,
        };
        info!(ns = %namespace, name = %name, kind = %kind.kind(), took_ms = %t0.elapsed().as_millis(), "reconciled");
        Ok(outcome)
    }
}
