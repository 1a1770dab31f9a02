//! kvop kubehub: store access for dependent objects and workload descriptors.
//!
//! Two capabilities are injected into the synchronizer and the orchestrator:
//! [`ObjectStore`] (get/create/delete by kind + namespace + name) and
//! [`WorkloadStore`] (read a descriptor, update its finalizers with optimistic
//! concurrency). [`KubeStore`] backs both with kube-rs; [`MemStore`] keeps
//! everything in memory for tests and dry runs.

#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use kube::error::ErrorResponse;
use kvop_core::{ObjectKind, StoreError, StoreResult, Workload, WorkloadKind};
use serde_json::Value as Json;
use tokio::time::Instant;

mod kube_store;
mod mem;

pub use kube_store::KubeStore;
pub use mem::{Call, MemStore, Op};

/// Per-call context: an optional deadline every store round trip honors.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallCtx {
    deadline: Option<Instant>,
}

impl CallCtx {
    /// No deadline.
    pub fn background() -> Self { Self::default() }

    pub fn with_timeout(timeout: Duration) -> Self { Self { deadline: Some(Instant::now() + timeout) } }

    pub fn with_deadline(deadline: Instant) -> Self { Self { deadline: Some(deadline) } }

    pub fn deadline(&self) -> Option<Instant> { self.deadline }

    pub fn expired(&self) -> bool { self.deadline.map(|d| Instant::now() >= d).unwrap_or(false) }

    /// Fail fast before starting `op` when the deadline already passed.
    pub fn check(&self, op: &str) -> StoreResult<()> {
        if self.expired() {
            return Err(StoreError::Transient(format!("deadline exceeded before {}", op)));
        }
        Ok(())
    }

    /// Run one store round trip under the deadline. An elapsed deadline drops
    /// the in-flight future and reports a transient error.
    pub async fn run<T, F>(&self, op: &str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        self.check(op)?;
        match self.deadline {
            None => fut.await,
            Some(deadline) => match tokio::time::timeout_at(deadline, fut).await {
                Ok(res) => res,
                Err(_) => Err(StoreError::Transient(format!("deadline exceeded during {}", op))),
            },
        }
    }
}

/// Namespaced object access used by the synchronizer and the teardown steps.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object; `NotFound` when absent.
    async fn get(&self, ctx: &CallCtx, kind: ObjectKind, namespace: &str, name: &str) -> StoreResult<Json>;

    /// Create an object from its full JSON body; `AlreadyExists` when the name is taken.
    async fn create(&self, ctx: &CallCtx, kind: ObjectKind, namespace: &str, body: &Json) -> StoreResult<Json>;

    /// Delete an object; `NotFound` when absent.
    async fn delete(&self, ctx: &CallCtx, kind: ObjectKind, namespace: &str, name: &str) -> StoreResult<()>;
}

/// Workload descriptor access.
#[async_trait::async_trait]
pub trait WorkloadStore: Send + Sync {
    async fn get_workload(&self, ctx: &CallCtx, kind: WorkloadKind, namespace: &str, name: &str) -> StoreResult<Workload>;

    /// Replace the finalizer list of `workload`. Fails with `Conflict` when the
    /// stored descriptor changed since `workload` was read.
    async fn update_finalizers(&self, ctx: &CallCtx, workload: &Workload, finalizers: &[String]) -> StoreResult<Workload>;
}

/// Map a kube client error into the closed store taxonomy.
pub fn map_kube_error(err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ErrorResponse { code: 404, message, .. }) => StoreError::NotFound(message),
        kube::Error::Api(ErrorResponse { code: 409, reason, message, .. }) if reason == "AlreadyExists" => {
            StoreError::AlreadyExists(message)
        }
        kube::Error::Api(ErrorResponse { code: 409, message, .. }) => StoreError::Conflict(message),
        kube::Error::SerdeError(e) => StoreError::Malformed(e.to_string()),
        other => StoreError::Transient(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{} happened", reason),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn maps_api_status_codes() {
        assert!(map_kube_error(api_err(404, "NotFound")).is_not_found());
        assert!(map_kube_error(api_err(409, "AlreadyExists")).is_already_exists());
        assert!(map_kube_error(api_err(409, "Conflict")).is_conflict());
        assert!(matches!(map_kube_error(api_err(500, "InternalError")), StoreError::Transient(_)));
        assert!(matches!(map_kube_error(api_err(403, "Forbidden")), StoreError::Transient(_)));
    }

    #[test]
    fn maps_decode_failures_to_malformed() {
        let e = serde_json::from_str::<Json>("{not json").unwrap_err();
        assert!(matches!(map_kube_error(kube::Error::SerdeError(e)), StoreError::Malformed(_)));
    }

    #[tokio::test]
    async fn expired_deadline_fails_before_running() {
        let ctx = CallCtx::with_timeout(Duration::ZERO);
        let mut ran = false;
        let res: StoreResult<()> = ctx.run("get", async { ran = true; Ok(()) }).await;
        assert!(matches!(res, Err(StoreError::Transient(_))));
        assert!(!ran);
    }

    #[tokio::test]
    async fn deadline_aborts_slow_call() {
        let ctx = CallCtx::with_timeout(Duration::from_millis(20));
        let res: StoreResult<()> = ctx
            .run("delete", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        let err = res.unwrap_err();
        assert!(err.to_string().contains("deadline exceeded during delete"), "err={}", err);
    }

    #[tokio::test]
    async fn background_ctx_never_expires() {
        let ctx = CallCtx::background();
        assert!(!ctx.expired());
        assert_eq!(ctx.run("get", async { Ok(7) }).await, Ok(7));
    }
}
