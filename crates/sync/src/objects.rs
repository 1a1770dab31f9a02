//! Desired dashboard and monitor documents.

use kvop_core::{names, MonitorTarget, ObjectKind, Topology};
use serde_json::{json, Map, Value as Json};

use crate::{Desired, SyncConfig};

/// Grafana dashboard for a workload, named `<workload>-<topology>`.
pub fn dashboard(cfg: &SyncConfig, namespace: &str, owner: &str, workload: &str, topology: Topology) -> Desired {
    let kind = ObjectKind::GrafanaDashboard;
    let name = names::dashboard_name(workload, topology);
    let body = json!({
        "apiVersion": kind.api_version(),
        "kind": kind.kind(),
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": { "app": cfg.grafana_app_label },
            "annotations": { "creator": owner, "owner": owner, "userId": owner },
        },
        "spec": {
            "json": dashboard_json(namespace, workload, topology),
        },
    });
    Desired { kind, namespace: namespace.to_string(), name, body }
}

/// Prometheus ServiceMonitor for one monitor target.
pub fn monitor(cfg: &SyncConfig, namespace: &str, owner: &str, workload: &str, target: MonitorTarget) -> Desired {
    let kind = ObjectKind::ServiceMonitor;
    let name = names::monitor_name(workload, target);
    let match_labels: Map<String, Json> =
        names::monitor_selector(workload, target).into_iter().map(|(k, v)| (k, Json::String(v))).collect();
    let body = json!({
        "apiVersion": kind.api_version(),
        "kind": kind.kind(),
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": { "app": names::match_app(workload, target) },
            "annotations": { "creator": owner, "owner": owner },
        },
        "spec": {
            "selector": { "matchLabels": match_labels },
            "endpoints": [ { "port": cfg.exporter_port } ],
            "namespaceSelector": { "matchNames": [namespace] },
        },
    });
    Desired { kind, namespace: namespace.to_string(), name, body }
}

/// (title, PromQL expression template, panel unit). `$sel` is replaced by the
/// workload's label matcher.
const PANELS: &[(&str, &str, &str)] = &[
    ("Uptime", "max(redis_uptime_in_seconds{$sel})", "s"),
    ("Connected clients", "sum(redis_connected_clients{$sel})", "short"),
    ("Memory used", "sum(redis_memory_used_bytes{$sel})", "bytes"),
    ("Commands / sec", "sum(rate(redis_commands_processed_total{$sel}[1m]))", "ops"),
    (
        "Keyspace hit ratio",
        "sum(rate(redis_keyspace_hits_total{$sel}[5m])) / (sum(rate(redis_keyspace_hits_total{$sel}[5m])) + sum(rate(redis_keyspace_misses_total{$sel}[5m])))",
        "percentunit",
    ),
];

/// Grafana dashboard model serialized as the string the GrafanaDashboard CRD expects.
pub fn dashboard_json(namespace: &str, workload: &str, topology: Topology) -> String {
    let selector = match topology {
        Topology::Standalone => format!("namespace=\"{}\",service=~\"{}(-headless)?\"", namespace, workload),
        Topology::Cluster => format!("namespace=\"{}\",service=~\"{}-(leader|follower).*\"", namespace, workload),
    };
    let panels: Vec<Json> = PANELS
        .iter()
        .enumerate()
        .map(|(i, (title, expr, unit))| {
            json!({
                "id": i + 1,
                "type": "timeseries",
                "title": title,
                "gridPos": { "h": 8, "w": 12, "x": (i % 2) * 12, "y": (i / 2) * 8 },
                "fieldConfig": { "defaults": { "unit": unit }, "overrides": [] },
                "targets": [ { "expr": expr.replace("$sel", &selector), "refId": "A" } ],
            })
        })
        .collect();
    let model = json!({
        "title": format!("Redis {} / {}/{}", topology, namespace, workload),
        "uid": format!("{}-{}", workload, topology).chars().take(40).collect::<String>(),
        "tags": ["redis", topology.setup_type()],
        "timezone": "browser",
        "schemaVersion": 36,
        "refresh": "30s",
        "time": { "from": "now-1h", "to": "now" },
        "panels": panels,
    });
    model.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvop_core::Role;

    #[test]
    fn cluster_monitor_selects_role_pods() {
        let d = monitor(&SyncConfig::default(), "ns1", "alice", "cache1", MonitorTarget::Cluster(Role::Leader));
        assert_eq!(d.name, "cache1-leader");
        assert_eq!(d.body["apiVersion"], "monitoring.coreos.com/v1");
        assert_eq!(d.body["spec"]["selector"]["matchLabels"]["app"], "cache1-leader");
        assert_eq!(d.body["spec"]["selector"]["matchLabels"]["redis_setup_type"], "cluster");
        assert_eq!(d.body["spec"]["endpoints"][0]["port"], "redis-exporter");
        assert_eq!(d.body["spec"]["namespaceSelector"]["matchNames"][0], "ns1");
        assert_eq!(d.body["metadata"]["annotations"]["owner"], "alice");
    }

    #[test]
    fn standalone_monitor_matches_bare_workload() {
        let d = monitor(&SyncConfig::default(), "ns1", "o", "r", MonitorTarget::Standalone);
        assert_eq!(d.name, "r-standalone");
        assert_eq!(d.body["metadata"]["labels"]["app"], "r");
        assert_eq!(d.body["spec"]["selector"]["matchLabels"]["app"], "r");
        assert_eq!(d.body["spec"]["selector"]["matchLabels"]["redis_setup_type"], "standalone");
    }

    #[test]
    fn dashboard_carries_ownership_and_model() {
        let cfg = SyncConfig { grafana_app_label: "grafana-main".into(), ..SyncConfig::default() };
        let d = dashboard(&cfg, "ns1", "bob", "cache1", Topology::Cluster);
        assert_eq!(d.kind, ObjectKind::GrafanaDashboard);
        assert_eq!(d.name, "cache1-cluster");
        assert_eq!(d.body["apiVersion"], "integreatly.org/v1alpha1");
        assert_eq!(d.body["metadata"]["labels"]["app"], "grafana-main");
        assert_eq!(d.body["metadata"]["annotations"]["creator"], "bob");
        assert_eq!(d.body["metadata"]["annotations"]["userId"], "bob");

        let model: Json = serde_json::from_str(d.body["spec"]["json"].as_str().unwrap()).unwrap();
        assert_eq!(model["panels"].as_array().unwrap().len(), PANELS.len());
        let expr = model["panels"][0]["targets"][0]["expr"].as_str().unwrap();
        assert!(expr.contains("namespace=\"ns1\""), "expr={}", expr);
        assert!(!expr.contains("$sel"));
    }
}
