//! kvop core types: workload descriptor, object kinds and the store error taxonomy.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod names;

pub use names::MonitorTarget;

/// Deployment shape of a managed key-value workload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    Standalone,
    Cluster,
}

impl Topology {
    /// Value of the `redis_setup_type` label.
    pub fn setup_type(self) -> &'static str {
        match self {
            Topology::Standalone => "standalone",
            Topology::Cluster => "cluster",
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.setup_type()) }
}

/// Cluster member role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
}

impl Role {
    /// Leader first; teardown and monitor ordering rely on it.
    pub const ALL: [Role; 2] = [Role::Leader, Role::Follower];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Follower => "follower",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Per-role replica counts. Ignored for Standalone workloads.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Replicas {
    pub leader: u32,
    pub follower: u32,
}

impl Replicas {
    pub fn new(leader: u32, follower: u32) -> Self { Self { leader, follower } }

    pub fn count(&self, role: Role) -> u32 {
        match role {
            Role::Leader => self.leader,
            Role::Follower => self.follower,
        }
    }
}

/// API group/version of the workload custom resources.
pub const WORKLOAD_GROUP: &str = "redis.redis.opstreelabs.in";
pub const WORKLOAD_VERSION: &str = "v1beta1";

/// Custom resource kind describing a workload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Redis,
    RedisCluster,
}

impl WorkloadKind {
    pub fn topology(self) -> Topology {
        match self {
            WorkloadKind::Redis => Topology::Standalone,
            WorkloadKind::RedisCluster => Topology::Cluster,
        }
    }

    pub fn kind(self) -> &'static str {
        match self {
            WorkloadKind::Redis => "Redis",
            WorkloadKind::RedisCluster => "RedisCluster",
        }
    }

    pub fn plural(self) -> &'static str {
        match self {
            WorkloadKind::Redis => "redis",
            WorkloadKind::RedisCluster => "redisclusters",
        }
    }

    /// Parse a user supplied kind name (case-insensitive, plural accepted).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Some(WorkloadKind::Redis),
            "rediscluster" | "redisclusters" => Some(WorkloadKind::RedisCluster),
            _ => None,
        }
    }
}

/// Kinds of objects this core reads, creates or deletes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Service,
    PersistentVolumeClaim,
    GrafanaDashboard,
    ServiceMonitor,
}

impl ObjectKind {
    pub fn group(self) -> &'static str {
        match self {
            ObjectKind::Service | ObjectKind::PersistentVolumeClaim => "",
            ObjectKind::GrafanaDashboard => "integreatly.org",
            ObjectKind::ServiceMonitor => "monitoring.coreos.com",
        }
    }

    pub fn version(self) -> &'static str {
        match self {
            ObjectKind::GrafanaDashboard => "v1alpha1",
            _ => "v1",
        }
    }

    pub fn kind(self) -> &'static str {
        match self {
            ObjectKind::Service => "Service",
            ObjectKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ObjectKind::GrafanaDashboard => "GrafanaDashboard",
            ObjectKind::ServiceMonitor => "ServiceMonitor",
        }
    }

    pub fn plural(self) -> &'static str {
        match self {
            ObjectKind::Service => "services",
            ObjectKind::PersistentVolumeClaim => "persistentvolumeclaims",
            ObjectKind::GrafanaDashboard => "grafanadashboards",
            ObjectKind::ServiceMonitor => "servicemonitors",
        }
    }

    /// `apiVersion` field value, e.g. `monitoring.coreos.com/v1` or `v1`.
    pub fn api_version(self) -> String {
        if self.group().is_empty() { self.version().to_string() } else { format!("{}/{}", self.group(), self.version()) }
    }

    /// REST collection path in a namespace.
    pub fn collection_path(self, namespace: &str) -> String {
        let prefix = if self.group().is_empty() { "/api".to_string() } else { "/apis".to_string() };
        format!("{}/{}/namespaces/{}/{}", prefix, self.api_version(), namespace, self.plural())
    }

    pub fn object_path(self, namespace: &str, name: &str) -> String {
        format!("{}/{}", self.collection_path(namespace), name)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.kind()) }
}

/// Reference to a namespaced object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, namespace: &str, name: impl Into<String>) -> Self {
        Self { kind, namespace: namespace.to_string(), name: name.into() }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Errors reported by the object and workload stores.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("malformed: {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, StoreError::AlreadyExists(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict(_)) }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Workload descriptor as observed in the store. Read-only to this core
/// apart from its finalizer list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workload {
    pub namespace: String,
    pub name: String,
    pub kind: WorkloadKind,
    pub replicas: Replicas,
    /// Owner recorded on dependent objects (`owner` annotation, then `creator`).
    pub owner: Option<String>,
    pub deletion_requested: bool,
    pub finalizers: Vec<String>,
    pub resource_version: Option<String>,
}

impl Workload {
    pub fn topology(&self) -> Topology { self.kind.topology() }

    pub fn has_finalizer(&self, token: &str) -> bool { self.finalizers.iter().any(|f| f == token) }

    /// Parse a raw custom resource document.
    pub fn from_object(kind: WorkloadKind, raw: &Json) -> StoreResult<Self> {
        let meta = raw
            .get("metadata")
            .and_then(|m| m.as_object())
            .ok_or_else(|| StoreError::Malformed(format!("{} missing metadata", kind.kind())))?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| StoreError::Malformed(format!("{} missing metadata.name", kind.kind())))?
            .to_string();
        let namespace = meta
            .get("namespace")
            .and_then(|v| v.as_str())
            .ok_or_else(|| StoreError::Malformed(format!("{} {} missing metadata.namespace", kind.kind(), name)))?
            .to_string();
        let finalizers = match meta.get("finalizers") {
            None | Some(Json::Null) => Vec::new(),
            Some(Json::Array(items)) => items
                .iter()
                .map(|v| v.as_str().map(|s| s.to_string()))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| StoreError::Malformed(format!("{} {}: non-string finalizer", kind.kind(), name)))?,
            Some(_) => return Err(StoreError::Malformed(format!("{} {}: finalizers is not a list", kind.kind(), name))),
        };
        let annotation = |key: &str| meta.get("annotations").and_then(|a| a.get(key)).and_then(|v| v.as_str()).map(|s| s.to_string());
        let owner = annotation("owner").or_else(|| annotation("creator"));
        let deletion_requested = meta.get("deletionTimestamp").map(|v| !v.is_null()).unwrap_or(false);
        let resource_version = meta.get("resourceVersion").and_then(|v| v.as_str()).map(|s| s.to_string());

        let replicas = match kind.topology() {
            Topology::Standalone => Replicas::default(),
            Topology::Cluster => {
                // Claims are derived from these counts, so a count we cannot read
                // must fail the read rather than shrink the teardown.
                let spec = raw.get("spec").filter(|s| !s.is_null());
                let count = |path: &str, v: Option<&Json>| -> StoreResult<Option<u32>> {
                    match v {
                        None | Some(Json::Null) => Ok(None),
                        Some(v) => v.as_u64().and_then(|n| u32::try_from(n).ok()).map(Some).ok_or_else(|| {
                            StoreError::Malformed(format!("{} {}: spec.{} is not a replica count: {}", kind.kind(), name, path, v))
                        }),
                    }
                };
                let role_replicas = |role: &str| spec.and_then(|s| s.get(role)).and_then(|r| r.get("replicas"));
                let cluster_size = count("clusterSize", spec.and_then(|s| s.get("clusterSize")))?;
                let leader = count("redisLeader.replicas", role_replicas("redisLeader"))?.or(cluster_size);
                let follower = count("redisFollower.replicas", role_replicas("redisFollower"))?.or(cluster_size);
                match (leader, follower) {
                    (Some(leader), Some(follower)) => Replicas::new(leader, follower),
                    _ => {
                        return Err(StoreError::Malformed(format!(
                            "{} {}: spec has neither clusterSize nor per-role replicas",
                            kind.kind(),
                            name
                        )))
                    }
                }
            }
        };

        Ok(Self { namespace, name, kind, replicas, owner, deletion_requested, finalizers, resource_version })
    }
}

pub mod prelude {
    pub use super::{
        names, MonitorTarget, ObjectKind, ObjectRef, Replicas, Role, StoreError, StoreResult, Topology, Workload,
        WorkloadKind,
    };
}
