use std::sync::{Mutex, MutexGuard};

use kvop_core::{ObjectKind, ObjectRef, StoreError, StoreResult, Workload, WorkloadKind};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use uuid::Uuid;

use crate::{CallCtx, ObjectStore, WorkloadStore};

/// Store operation, used for fault injection and the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    Create,
    Delete,
    GetWorkload,
    UpdateWorkload,
}

/// One recorded store call: operation and target name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub kind: Option<ObjectKind>,
    pub name: String,
}

struct Fault {
    op: Op,
    name: String,
    error: StoreError,
}

type ObjKey = (ObjectKind, String, String);
type WlKey = (WorkloadKind, String, String);

#[derive(Default)]
struct Inner {
    objects: FxHashMap<ObjKey, Json>,
    workloads: FxHashMap<WlKey, Json>,
    rv: u64,
    faults: Vec<Fault>,
    calls: Vec<Call>,
}

impl Inner {
    fn next_rv(&mut self) -> String {
        self.rv += 1;
        self.rv.to_string()
    }

    fn record(&mut self, op: Op, kind: Option<ObjectKind>, name: &str) -> StoreResult<()> {
        self.calls.push(Call { op, kind, name: name.to_string() });
        match self.faults.iter().position(|f| f.op == op && f.name == name) {
            Some(i) => Err(self.faults.remove(i).error),
            None => Ok(()),
        }
    }
}

/// In-memory object and workload store.
///
/// Mutations apply atomically under one lock. Workloads behave like the
/// apiserver: every write bumps `resourceVersion`, stale writers get
/// `Conflict`, and a deletion-marked workload disappears once its last
/// finalizer is removed.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test thread must not hide the store from the others.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Seed an object directly, bypassing faults and the call log.
    pub fn put(&self, kind: ObjectKind, namespace: &str, name: &str) {
        let mut inner = self.lock();
        let rv = inner.next_rv();
        let body = serde_json::json!({
            "apiVersion": kind.api_version(),
            "kind": kind.kind(),
            "metadata": { "name": name, "namespace": namespace, "resourceVersion": rv },
        });
        inner.objects.insert((kind, namespace.to_string(), name.to_string()), body);
    }

    /// Seed a workload custom resource from its raw document.
    pub fn put_workload(&self, kind: WorkloadKind, mut raw: Json) -> StoreResult<Workload> {
        let parsed = Workload::from_object(kind, &raw)?;
        let mut inner = self.lock();
        let rv = inner.next_rv();
        raw["metadata"]["resourceVersion"] = Json::String(rv);
        let stored = Workload::from_object(kind, &raw)?;
        inner.workloads.insert((kind, parsed.namespace, parsed.name), raw);
        Ok(stored)
    }

    /// Set the deletion marker on a stored workload, as the apiserver does on delete.
    pub fn mark_for_deletion(&self, kind: WorkloadKind, namespace: &str, name: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        let rv = inner.next_rv();
        let raw = inner
            .workloads
            .get_mut(&(kind, namespace.to_string(), name.to_string()))
            .ok_or_else(|| StoreError::NotFound(format!("{} {}/{}", kind.kind(), namespace, name)))?;
        raw["metadata"]["deletionTimestamp"] = Json::String(chrono::Utc::now().to_rfc3339());
        raw["metadata"]["resourceVersion"] = Json::String(rv);
        Ok(())
    }

    /// Bump a workload's resourceVersion as if another writer touched it.
    pub fn touch_workload(&self, kind: WorkloadKind, namespace: &str, name: &str) {
        self.edit_workload(kind, namespace, name, |_| {});
    }

    /// Rewrite a stored workload document in place, as another writer would.
    /// The result is not validated, so later reads see whatever `edit` left.
    pub fn edit_workload(&self, kind: WorkloadKind, namespace: &str, name: &str, edit: impl FnOnce(&mut Json)) {
        let mut inner = self.lock();
        let rv = inner.next_rv();
        if let Some(raw) = inner.workloads.get_mut(&(kind, namespace.to_string(), name.to_string())) {
            edit(raw);
            if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                meta.insert("resourceVersion".to_string(), Json::String(rv));
            }
        }
    }

    /// Make the next `op` against `name` fail with `error`.
    pub fn fail_next(&self, op: Op, name: &str, error: StoreError) {
        self.lock().faults.push(Fault { op, name: name.to_string(), error });
    }

    pub fn contains(&self, kind: ObjectKind, namespace: &str, name: &str) -> bool {
        self.lock().objects.contains_key(&(kind, namespace.to_string(), name.to_string()))
    }

    pub fn object(&self, kind: ObjectKind, namespace: &str, name: &str) -> Option<Json> {
        self.lock().objects.get(&(kind, namespace.to_string(), name.to_string())).cloned()
    }

    pub fn contains_workload(&self, kind: WorkloadKind, namespace: &str, name: &str) -> bool {
        self.lock().workloads.contains_key(&(kind, namespace.to_string(), name.to_string()))
    }

    /// All stored objects, sorted by kind/namespace/name.
    pub fn refs(&self) -> Vec<ObjectRef> {
        let inner = self.lock();
        let mut out: Vec<ObjectRef> = inner.objects.keys().map(|(k, ns, n)| ObjectRef::new(*k, ns, n.clone())).collect();
        out.sort_by(|a, b| {
            a.kind.kind().cmp(b.kind.kind()).then_with(|| a.namespace.cmp(&b.namespace)).then_with(|| a.name.cmp(&b.name))
        });
        out
    }

    pub fn calls(&self) -> Vec<Call> { self.lock().calls.clone() }

    pub fn count_calls(&self, op: Op) -> usize { self.lock().calls.iter().filter(|c| c.op == op).count() }

    pub fn clear_calls(&self) { self.lock().calls.clear(); }
}

fn label(kind: ObjectKind, namespace: &str, name: &str) -> String {
    format!("{} {}/{}", kind, namespace, name)
}

#[async_trait::async_trait]
impl ObjectStore for MemStore {
    async fn get(&self, ctx: &CallCtx, kind: ObjectKind, namespace: &str, name: &str) -> StoreResult<Json> {
        ctx.check("get")?;
        let mut inner = self.lock();
        inner.record(Op::Get, Some(kind), name)?;
        inner
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(label(kind, namespace, name)))
    }

    async fn create(&self, ctx: &CallCtx, kind: ObjectKind, namespace: &str, body: &Json) -> StoreResult<Json> {
        ctx.check("create")?;
        let name = body
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| StoreError::Malformed(format!("{} body missing metadata.name", kind)))?
            .to_string();
        let mut inner = self.lock();
        inner.record(Op::Create, Some(kind), &name)?;
        let key = (kind, namespace.to_string(), name.clone());
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(label(kind, namespace, &name)));
        }
        let rv = inner.next_rv();
        let mut stored = body.clone();
        let meta = &mut stored["metadata"];
        meta["namespace"] = Json::String(namespace.to_string());
        meta["uid"] = Json::String(Uuid::new_v4().to_string());
        meta["resourceVersion"] = Json::String(rv);
        meta["creationTimestamp"] = Json::String(chrono::Utc::now().to_rfc3339());
        inner.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, ctx: &CallCtx, kind: ObjectKind, namespace: &str, name: &str) -> StoreResult<()> {
        ctx.check("delete")?;
        let mut inner = self.lock();
        inner.record(Op::Delete, Some(kind), name)?;
        inner
            .objects
            .remove(&(kind, namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(label(kind, namespace, name)))
    }
}

#[async_trait::async_trait]
impl WorkloadStore for MemStore {
    async fn get_workload(&self, ctx: &CallCtx, kind: WorkloadKind, namespace: &str, name: &str) -> StoreResult<Workload> {
        ctx.check("get_workload")?;
        let mut inner = self.lock();
        inner.record(Op::GetWorkload, None, name)?;
        let raw = inner
            .workloads
            .get(&(kind, namespace.to_string(), name.to_string()))
            .ok_or_else(|| StoreError::NotFound(format!("{} {}/{}", kind.kind(), namespace, name)))?;
        Workload::from_object(kind, raw)
    }

    async fn update_finalizers(&self, ctx: &CallCtx, workload: &Workload, finalizers: &[String]) -> StoreResult<Workload> {
        ctx.check("update_finalizers")?;
        let mut inner = self.lock();
        inner.record(Op::UpdateWorkload, None, &workload.name)?;
        let key = (workload.kind, workload.namespace.clone(), workload.name.clone());
        let current = inner
            .workloads
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(format!("{} {}/{}", workload.kind.kind(), workload.namespace, workload.name)))?;
        let current_rv = current.get("metadata").and_then(|m| m.get("resourceVersion")).and_then(|v| v.as_str());
        if workload.resource_version.is_some() && current_rv != workload.resource_version.as_deref() {
            return Err(StoreError::Conflict(format!(
                "{} {}/{} changed (rv {:?} -> {:?})",
                workload.kind.kind(),
                workload.namespace,
                workload.name,
                workload.resource_version,
                current_rv
            )));
        }
        let rv = inner.next_rv();
        let Some(raw) = inner.workloads.get_mut(&key) else {
            return Err(StoreError::NotFound(workload.name.clone()));
        };
        raw["metadata"]["finalizers"] = serde_json::json!(finalizers);
        raw["metadata"]["resourceVersion"] = Json::String(rv);
        let updated = Workload::from_object(workload.kind, raw)?;
        if updated.deletion_requested && updated.finalizers.is_empty() {
            inner.workloads.remove(&key);
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn body(name: &str) -> Json {
        serde_json::json!({ "apiVersion": "v1", "kind": "Service", "metadata": { "name": name } })
    }

    #[tokio::test]
    async fn create_then_get_and_duplicate_create() {
        let store = MemStore::new();
        let ctx = CallCtx::background();
        let created = store.create(&ctx, ObjectKind::Service, "ns", &body("a")).await.unwrap();
        assert_eq!(created["metadata"]["namespace"], "ns");
        assert!(created["metadata"]["uid"].is_string());
        assert!(store.get(&ctx, ObjectKind::Service, "ns", "a").await.is_ok());
        let dup = store.create(&ctx, ObjectKind::Service, "ns", &body("a")).await.unwrap_err();
        assert!(dup.is_already_exists());
    }

    #[tokio::test]
    async fn kinds_do_not_share_names() {
        let store = MemStore::new();
        store.put(ObjectKind::ServiceMonitor, "ns", "x");
        let err = store.get(&CallCtx::background(), ObjectKind::GrafanaDashboard, "ns", "x").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let store = MemStore::new();
        let err = store.delete(&CallCtx::background(), ObjectKind::Service, "ns", "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn injected_fault_fires_once() {
        let store = MemStore::new();
        store.put(ObjectKind::Service, "ns", "a");
        store.fail_next(Op::Delete, "a", StoreError::Transient("boom".into()));
        let ctx = CallCtx::background();
        assert!(matches!(store.delete(&ctx, ObjectKind::Service, "ns", "a").await, Err(StoreError::Transient(_))));
        assert!(store.contains(ObjectKind::Service, "ns", "a"));
        store.delete(&ctx, ObjectKind::Service, "ns", "a").await.unwrap();
        assert!(!store.contains(ObjectKind::Service, "ns", "a"));
        assert_eq!(store.count_calls(Op::Delete), 2);
    }

    #[tokio::test]
    async fn expired_ctx_mutates_nothing() {
        let store = MemStore::new();
        let ctx = CallCtx::with_timeout(Duration::ZERO);
        assert!(store.create(&ctx, ObjectKind::Service, "ns", &body("a")).await.is_err());
        assert!(!store.contains(ObjectKind::Service, "ns", "a"));
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn stale_finalizer_update_conflicts() {
        let store = MemStore::new();
        let w = store
            .put_workload(WorkloadKind::Redis, serde_json::json!({ "metadata": { "name": "r", "namespace": "ns" } }))
            .unwrap();
        store.touch_workload(WorkloadKind::Redis, "ns", "r");
        let err = store.update_finalizers(&CallCtx::background(), &w, &["t".to_string()]).await.unwrap_err();
        assert!(err.is_conflict(), "err={}", err);
    }

    #[tokio::test]
    async fn releasing_last_finalizer_removes_marked_workload() {
        let store = MemStore::new();
        let raw = serde_json::json!({ "metadata": { "name": "r", "namespace": "ns", "finalizers": ["redisFinalizer"] } });
        store.put_workload(WorkloadKind::Redis, raw).unwrap();
        store.mark_for_deletion(WorkloadKind::Redis, "ns", "r").unwrap();
        let ctx = CallCtx::background();
        let w = store.get_workload(&ctx, WorkloadKind::Redis, "ns", "r").await.unwrap();
        assert!(w.deletion_requested);
        store.update_finalizers(&ctx, &w, &[]).await.unwrap();
        assert!(!store.contains_workload(WorkloadKind::Redis, "ns", "r"));
    }
}
