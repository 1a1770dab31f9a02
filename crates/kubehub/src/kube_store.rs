use std::time::Instant;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use kvop_core::{ObjectKind, StoreError, StoreResult, Workload, WorkloadKind, WORKLOAD_GROUP, WORKLOAD_VERSION};
use metrics::histogram;
use serde_json::Value as Json;
use tracing::debug;

use crate::{map_kube_error, CallCtx, ObjectStore, WorkloadStore};

/// kube-rs backed store. The client is injected; nothing is cached between calls.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    /// Build a client from the current kube context.
    pub async fn try_default() -> anyhow::Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn objects(&self, kind: ObjectKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &object_resource(kind))
    }

    fn workloads(&self, kind: WorkloadKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &workload_resource(kind))
    }
}

fn object_resource(kind: ObjectKind) -> ApiResource {
    match kind {
        ObjectKind::Service => ApiResource::erase::<Service>(&()),
        ObjectKind::PersistentVolumeClaim => ApiResource::erase::<PersistentVolumeClaim>(&()),
        ObjectKind::GrafanaDashboard | ObjectKind::ServiceMonitor => {
            let gvk = GroupVersionKind::gvk(kind.group(), kind.version(), kind.kind());
            ApiResource::from_gvk_with_plural(&gvk, kind.plural())
        }
    }
}

fn workload_resource(kind: WorkloadKind) -> ApiResource {
    let gvk = GroupVersionKind::gvk(WORKLOAD_GROUP, WORKLOAD_VERSION, kind.kind());
    ApiResource::from_gvk_with_plural(&gvk, kind.plural())
}

fn to_json(obj: &DynamicObject) -> StoreResult<Json> {
    serde_json::to_value(obj).map_err(|e| StoreError::Malformed(e.to_string()))
}

fn observe(op: &'static str, t0: Instant) {
    histogram!("store_call_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, ctx: &CallCtx, kind: ObjectKind, namespace: &str, name: &str) -> StoreResult<Json> {
        let t0 = Instant::now();
        debug!(path = %kind.object_path(namespace, name), "store: get");
        let api = self.objects(kind, namespace);
        let res = ctx.run("get", async { api.get(name).await.map_err(map_kube_error) }).await;
        observe("get", t0);
        to_json(&res?)
    }

    async fn create(&self, ctx: &CallCtx, kind: ObjectKind, namespace: &str, body: &Json) -> StoreResult<Json> {
        let t0 = Instant::now();
        debug!(path = %kind.collection_path(namespace), "store: create");
        let obj: DynamicObject =
            serde_json::from_value(body.clone()).map_err(|e| StoreError::Malformed(format!("{} body: {}", kind, e)))?;
        let api = self.objects(kind, namespace);
        let res = ctx
            .run("create", async { api.create(&PostParams::default(), &obj).await.map_err(map_kube_error) })
            .await;
        observe("create", t0);
        to_json(&res?)
    }

    async fn delete(&self, ctx: &CallCtx, kind: ObjectKind, namespace: &str, name: &str) -> StoreResult<()> {
        let t0 = Instant::now();
        debug!(path = %kind.object_path(namespace, name), "store: delete");
        let api = self.objects(kind, namespace);
        let res = ctx
            .run("delete", async { api.delete(name, &DeleteParams::default()).await.map(|_| ()).map_err(map_kube_error) })
            .await;
        observe("delete", t0);
        res
    }
}

#[async_trait::async_trait]
impl WorkloadStore for KubeStore {
    async fn get_workload(&self, ctx: &CallCtx, kind: WorkloadKind, namespace: &str, name: &str) -> StoreResult<Workload> {
        let t0 = Instant::now();
        let api = self.workloads(kind, namespace);
        let res = ctx.run("get_workload", async { api.get(name).await.map_err(map_kube_error) }).await;
        observe("get_workload", t0);
        Workload::from_object(kind, &to_json(&res?)?)
    }

    async fn update_finalizers(&self, ctx: &CallCtx, workload: &Workload, finalizers: &[String]) -> StoreResult<Workload> {
        let t0 = Instant::now();
        let api = self.workloads(workload.kind, &workload.namespace);
        // resourceVersion in a merge patch makes the apiserver reject stale writers with 409.
        let mut patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        if let Some(rv) = &workload.resource_version {
            patch["metadata"]["resourceVersion"] = Json::String(rv.clone());
        }
        let res = ctx
            .run("update_finalizers", async {
                api.patch(&workload.name, &PatchParams::default(), &Patch::Merge(&patch)).await.map_err(map_kube_error)
            })
            .await;
        observe("update_finalizers", t0);
        Workload::from_object(workload.kind, &to_json(&res?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resources_match_object_kinds() {
        let ar = object_resource(ObjectKind::ServiceMonitor);
        assert_eq!(ar.group, "monitoring.coreos.com");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.plural, "servicemonitors");

        let ar = object_resource(ObjectKind::GrafanaDashboard);
        assert_eq!(ar.api_version, "integreatly.org/v1alpha1");
        assert_eq!(ar.plural, "grafanadashboards");

        let ar = object_resource(ObjectKind::PersistentVolumeClaim);
        assert_eq!(ar.group, "");
        assert_eq!(ar.plural, "persistentvolumeclaims");
    }

    #[test]
    fn workload_resources_use_crd_plurals() {
        let ar = workload_resource(WorkloadKind::RedisCluster);
        assert_eq!(ar.api_version, "redis.redis.opstreelabs.in/v1beta1");
        assert_eq!(ar.kind, "RedisCluster");
        assert_eq!(ar.plural, "redisclusters");
    }
}
