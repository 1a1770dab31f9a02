//! kvop finalize: finalizer-gated teardown of everything a workload owns.
//!
//! A workload moves through three phases. While `Active` the orchestrator
//! attaches its finalizer token. Once the deletion marker shows up with the
//! token still attached it is `TeardownInProgress`: services, claims, the
//! dashboard and the monitors are deleted strictly in that order, each step
//! treating `NotFound` as done, and only then is the token removed. Without
//! the token a marked workload is `Released` and left alone.
//!
//! Any other failure aborts the sequence with the token still attached, so a
//! later call restarts from the first step.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use kvop_core::{names, ObjectRef, StoreError, StoreResult, Workload};
use kvop_kubehub::{CallCtx, ObjectStore, WorkloadStore};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub mod plan;

pub use plan::{teardown_plan, PlannedStep, TeardownPlan, TeardownStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalizerPhase {
    Active,
    TeardownInProgress,
    Released,
}

pub fn phase_of(workload: &Workload) -> FinalizerPhase {
    let token = names::finalizer_token(workload.topology());
    match (workload.deletion_requested, workload.has_finalizer(token)) {
        (false, _) => FinalizerPhase::Active,
        (true, true) => FinalizerPhase::TeardownInProgress,
        (true, false) => FinalizerPhase::Released,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyAbsent,
}

/// Per-step counts of a finished teardown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    pub steps: Vec<StepReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub step: TeardownStep,
    pub deleted: usize,
    pub absent: usize,
}

impl TeardownReport {
    pub fn deleted(&self) -> usize { self.steps.iter().map(|s| s.deleted).sum() }
    pub fn absent(&self) -> usize { self.steps.iter().map(|s| s.absent).sum() }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalizeOutcome {
    /// Workload is live; `attached` is true when this call added the token.
    Active { attached: bool, workload: Workload },
    /// Teardown ran to completion and the token was removed.
    Released(TeardownReport),
    /// Marked for deletion without our token: nothing to do.
    Untouched,
}

pub struct Finalizer {
    objects: Arc<dyn ObjectStore>,
    workloads: Arc<dyn WorkloadStore>,
}

impl Finalizer {
    pub fn new(objects: Arc<dyn ObjectStore>, workloads: Arc<dyn WorkloadStore>) -> Self { Self { objects, workloads } }

    /// Drive the workload one step through its phase machine.
    pub async fn handle(&self, ctx: &CallCtx, workload: &Workload) -> StoreResult<FinalizeOutcome> {
        match phase_of(workload) {
            FinalizerPhase::Active => {
                let (workload, attached) = self.ensure_attached(ctx, workload).await?;
                Ok(FinalizeOutcome::Active { attached, workload })
            }
            FinalizerPhase::TeardownInProgress => Ok(FinalizeOutcome::Released(self.teardown(ctx, workload).await?)),
            FinalizerPhase::Released => {
                debug!(ns = %workload.namespace, name = %workload.name, "no finalizer token; skipping teardown");
                Ok(FinalizeOutcome::Untouched)
            }
        }
    }

    /// Attach the topology's finalizer token when missing. Returns the
    /// (possibly updated) descriptor and whether it changed.
    pub async fn ensure_attached(&self, ctx: &CallCtx, workload: &Workload) -> StoreResult<(Workload, bool)> {
        let token = names::finalizer_token(workload.topology());
        if workload.has_finalizer(token) {
            return Ok((workload.clone(), false));
        }
        let mut finalizers = workload.finalizers.clone();
        finalizers.push(token.to_string());
        let updated = self.workloads.update_finalizers(ctx, workload, &finalizers).await?;
        info!(ns = %workload.namespace, name = %workload.name, finalizer = %token, "finalizer attached");
        Ok((updated, true))
    }

    /// Delete one object, counting an absent object as done.
    pub async fn delete_tolerant(&self, ctx: &CallCtx, object: &ObjectRef) -> StoreResult<DeleteOutcome> {
        match self.objects.delete(ctx, object.kind, &object.namespace, &object.name).await {
            Ok(()) => {
                counter!("finalize_deleted_total", 1u64, "kind" => object.kind.kind());
                info!(object = %object, "deleted");
                Ok(DeleteOutcome::Deleted)
            }
            Err(StoreError::NotFound(_)) => {
                counter!("finalize_absent_total", 1u64, "kind" => object.kind.kind());
                debug!(object = %object, "already absent");
                Ok(DeleteOutcome::AlreadyAbsent)
            }
            Err(e) => {
                counter!("finalize_errors_total", 1u64, "kind" => object.kind.kind());
                error!(object = %object, error = %e, "could not delete");
                Err(e)
            }
        }
    }

    /// Run the full teardown sequence for a marked workload holding our token.
    /// Any other workload is left alone. Safe to call again after any failure.
    pub async fn teardown(&self, ctx: &CallCtx, workload: &Workload) -> StoreResult<TeardownReport> {
        let t0 = Instant::now();
        let phase = phase_of(workload);
        if phase != FinalizerPhase::TeardownInProgress {
            // Only a marked workload still holding our token has objects for us to remove.
            debug!(ns = %workload.namespace, name = %workload.name, phase = ?phase, "not tearing down; teardown is a no-op");
            return Ok(TeardownReport::default());
        }
        let plan = teardown_plan(workload);
        info!(ns = %workload.namespace, name = %workload.name, kind = %workload.kind.kind(), "teardown starting");

        let mut report = TeardownReport::default();
        for planned in &plan.steps {
            if planned.step == TeardownStep::ReleaseFinalizer {
                self.release(ctx, workload, &plan.finalizer).await?;
                report.steps.push(StepReport { step: planned.step, deleted: 0, absent: 0 });
                continue;
            }
            let mut step = StepReport { step: planned.step, deleted: 0, absent: 0 };
            for target in &planned.targets {
                match self.delete_tolerant(ctx, target).await {
                    Ok(DeleteOutcome::Deleted) => step.deleted += 1,
                    Ok(DeleteOutcome::AlreadyAbsent) => step.absent += 1,
                    Err(e) => {
                        warn!(ns = %workload.namespace, name = %workload.name, step = %planned.step, "teardown aborted; finalizer kept");
                        return Err(e);
                    }
                }
            }
            debug!(step = %planned.step, deleted = step.deleted, absent = step.absent, "teardown step done");
            report.steps.push(step);
        }

        counter!("finalize_released_total", 1u64);
        histogram!("finalize_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(ns = %workload.namespace, name = %workload.name, deleted = report.deleted(), absent = report.absent(), "teardown complete");
        Ok(report)
    }

    async fn release(&self, ctx: &CallCtx, workload: &Workload, token: &str) -> StoreResult<()> {
        let remaining: Vec<String> = workload.finalizers.iter().filter(|f| f.as_str() != token).cloned().collect();
        match self.workloads.update_finalizers(ctx, workload, &remaining).await {
            Ok(_) => {
                info!(ns = %workload.namespace, name = %workload.name, finalizer = %token, "finalizer released");
                Ok(())
            }
            Err(e) => {
                error!(ns = %workload.namespace, name = %workload.name, finalizer = %token, error = %e, "could not remove finalizer");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvop_core::{Replicas, WorkloadKind};

    fn wl(deletion_requested: bool, finalizers: &[&str]) -> Workload {
        Workload {
            namespace: "ns".into(),
            name: "w".into(),
            kind: WorkloadKind::RedisCluster,
            replicas: Replicas::new(1, 1),
            owner: None,
            deletion_requested,
            finalizers: finalizers.iter().map(|s| s.to_string()).collect(),
            resource_version: None,
        }
    }

    #[test]
    fn phases_follow_marker_and_token() {
        assert_eq!(phase_of(&wl(false, &[])), FinalizerPhase::Active);
        assert_eq!(phase_of(&wl(false, &["redisClusterFinalizer"])), FinalizerPhase::Active);
        assert_eq!(phase_of(&wl(true, &["redisClusterFinalizer"])), FinalizerPhase::TeardownInProgress);
        assert_eq!(phase_of(&wl(true, &[])), FinalizerPhase::Released);
        // The standalone token does not gate a cluster workload.
        assert_eq!(phase_of(&wl(true, &["redisFinalizer"])), FinalizerPhase::Released);
    }

    #[test]
    fn report_totals() {
        let r = TeardownReport {
            steps: vec![
                StepReport { step: TeardownStep::Endpoints, deleted: 2, absent: 0 },
                StepReport { step: TeardownStep::Claims, deleted: 1, absent: 3 },
            ],
        };
        assert_eq!(r.deleted(), 3);
        assert_eq!(r.absent(), 3);
    }
}
