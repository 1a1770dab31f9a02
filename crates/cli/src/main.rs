use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kvop_core::{names, ObjectRef, Replicas, Topology, Workload, WorkloadKind};
use kvop_finalize::{teardown_plan, TeardownStep};
use kvop_kubehub::{CallCtx, KubeStore, MemStore};
use kvop_reconcile::{ReconcileOutcome, Reconciler};
use kvop_sync::SyncConfig;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use serde_json::Value as Json;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kvopctl", version, about = "kvop reconciliation core CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: "default")
    #[arg(long = "ns", global = true, env = "KVOP_NAMESPACE")]
    namespace: Option<String>,

    /// Serve Prometheus metrics on this address (host:port)
    #[arg(long = "metrics-addr", global = true, env = "KVOP_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum TopologyArg { Standalone, Cluster }

impl From<TopologyArg> for Topology {
    fn from(t: TopologyArg) -> Self {
        match t {
            TopologyArg::Standalone => Topology::Standalone,
            TopologyArg::Cluster => Topology::Cluster,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the canonical names derived from a workload
    Names {
        /// Workload name
        workload: String,
        #[arg(long = "topology", value_enum, default_value_t = TopologyArg::Standalone)]
        topology: TopologyArg,
        /// Leader replicas (cluster only)
        #[arg(long = "leaders", default_value_t = 3)]
        leaders: u32,
        /// Follower replicas (cluster only)
        #[arg(long = "followers", default_value_t = 3)]
        followers: u32,
    },
    /// Show the teardown plan for a workload manifest
    Plan {
        /// YAML manifest of a Redis or RedisCluster resource
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Reconcile one workload against the current kube context
    Reconcile {
        /// Workload kind: redis | rediscluster
        #[arg(required_unless_present = "mem")]
        kind: Option<String>,
        /// Workload name
        #[arg(required_unless_present = "mem")]
        name: Option<String>,
        /// Dry run against an in-memory store seeded from --file
        #[arg(long = "mem", requires = "file")]
        mem: bool,
        /// Workload manifest for --mem runs
        #[arg(short = 'f', long = "file")]
        file: Option<PathBuf>,
        /// With --mem, also seed the services and claims the workload's controllers create
        #[arg(long = "with-owned", requires = "mem")]
        with_owned: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("KVOP_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics(addr: Option<SocketAddr>) {
    let Some(addr) = addr else { return };
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => info!(%addr, "serving Prometheus metrics"),
        Err(e) => warn!(%addr, error = %e, "metrics exporter not installed"),
    }
}

fn call_timeout() -> Duration {
    let secs = std::env::var("KVOP_CALL_TIMEOUT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(30);
    Duration::from_secs(secs)
}

#[derive(Debug, Serialize)]
struct MonitorNames {
    name: String,
    selector: Vec<(String, String)>,
}

#[derive(Debug, Serialize)]
struct NameSet {
    dashboard: String,
    monitors: Vec<MonitorNames>,
    services: Vec<String>,
    claims: Vec<String>,
    finalizer: &'static str,
}

fn name_set(workload: &str, topology: Topology, replicas: Replicas) -> NameSet {
    NameSet {
        dashboard: names::dashboard_name(workload, topology),
        monitors: names::monitor_targets(topology)
            .into_iter()
            .map(|t| MonitorNames { name: names::monitor_name(workload, t), selector: names::monitor_selector(workload, t).into_vec() })
            .collect(),
        services: names::service_names(workload).to_vec(),
        claims: names::claim_names(workload, topology, replicas),
        finalizer: names::finalizer_token(topology),
    }
}

/// Read a workload manifest into its kind and JSON document. The namespace
/// comes from `ns_override`, then the document, then `default`.
fn load_manifest(yaml: &str, ns_override: Option<&str>) -> Result<(WorkloadKind, Json)> {
    let val: serde_yaml::Value = serde_yaml::from_str(yaml).context("parsing YAML")?;
    let mut json = serde_json::to_value(val).context("converting YAML to JSON")?;
    let kind_s = json.get("kind").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("YAML missing kind"))?;
    let kind = WorkloadKind::parse(kind_s).ok_or_else(|| anyhow!("unsupported kind: {} (expect Redis or RedisCluster)", kind_s))?;
    let meta = json
        .get_mut("metadata")
        .ok_or_else(|| anyhow!("YAML missing metadata"))?
        .as_object_mut()
        .ok_or_else(|| anyhow!("metadata is not a mapping"))?;
    match ns_override {
        Some(ns) => {
            meta.insert("namespace".to_string(), Json::String(ns.to_string()));
        }
        None => {
            meta.entry("namespace").or_insert_with(|| Json::String("default".to_string()));
        }
    }
    Ok((kind, json))
}

fn parse_workload_yaml(yaml: &str, ns_override: Option<&str>) -> Result<Workload> {
    let (kind, json) = load_manifest(yaml, ns_override)?;
    Ok(Workload::from_object(kind, &json)?)
}

#[derive(Debug, Serialize)]
struct DryRun {
    outcome: ReconcileOutcome,
    /// Objects left in the store afterwards.
    objects: Vec<ObjectRef>,
}

/// Reconcile a manifest against a fresh in-memory store.
async fn dry_run(kind: WorkloadKind, raw: Json, with_owned: bool, cfg: SyncConfig) -> Result<DryRun> {
    let store = Arc::new(MemStore::new());
    let workload = store.put_workload(kind, raw)?;
    if with_owned {
        let plan = teardown_plan(&workload);
        let owned = plan.steps.iter().filter(|s| matches!(s.step, TeardownStep::Endpoints | TeardownStep::Claims));
        for target in owned.flat_map(|s| s.targets.iter()) {
            store.put(target.kind, &target.namespace, &target.name);
        }
    }
    let reconciler = Reconciler::new(store.clone(), store.clone(), cfg);
    let outcome = reconciler.reconcile(&CallCtx::background(), kind, &workload.namespace, &workload.name).await?;
    Ok(DryRun { outcome, objects: store.refs() })
}

fn print_outcome(ns: &str, name: &str, outcome: &ReconcileOutcome) {
    match outcome {
        ReconcileOutcome::Gone => println!("{}/{}: gone", ns, name),
        ReconcileOutcome::Untouched => println!("{}/{}: marked for deletion without finalizer; untouched", ns, name),
        ReconcileOutcome::Synced { finalizer_attached, dashboard, monitors } => {
            println!("{}/{}: synced (finalizer attached: {})", ns, name, finalizer_attached);
            println!("  dashboard: {:?}", dashboard);
            for (t, o) in monitors { println!("  monitor {:?}: {:?}", t, o); }
        }
        ReconcileOutcome::Released(report) => {
            println!("{}/{}: released ({} deleted, {} already absent)", ns, name, report.deleted(), report.absent());
        }
    }
}

fn print_names(set: &NameSet) {
    println!("dashboard  {}", set.dashboard);
    for m in &set.monitors {
        let sel: Vec<String> = m.selector.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        println!("monitor    {} ({})", m.name, sel.join(","));
    }
    for s in &set.services { println!("service    {}", s); }
    for c in &set.claims { println!("claim      {}", c); }
    println!("finalizer  {}", set.finalizer);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    init_metrics(cli.metrics_addr);

    match cli.command {
        Commands::Names { workload, topology, leaders, followers } => {
            let set = name_set(&workload, topology.into(), Replicas::new(leaders, followers));
            match cli.output {
                Output::Human => print_names(&set),
                Output::Json => println!("{}", serde_json::to_string_pretty(&set)?),
            }
        }
        Commands::Plan { file } => {
            let yaml = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let workload = parse_workload_yaml(&yaml, cli.namespace.as_deref())?;
            let plan = teardown_plan(&workload);
            match cli.output {
                Output::Human => {
                    for (i, step) in plan.steps.iter().enumerate() {
                        println!("{}. {}", i + 1, step.step);
                        for t in &step.targets { println!("     {}", t); }
                    }
                    println!("finalizer: {}", plan.finalizer);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
            }
        }
        Commands::Reconcile { mem: true, file, with_owned, .. } => {
            let file = file.ok_or_else(|| anyhow!("--mem needs --file"))?;
            let yaml = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let (kind, raw) = load_manifest(&yaml, cli.namespace.as_deref())?;
            let workload = Workload::from_object(kind, &raw)?;
            info!(kind = %kind.kind(), ns = %workload.namespace, name = %workload.name, with_owned, "dry-run reconcile invoked");
            let run = dry_run(kind, raw, with_owned, SyncConfig::from_env()).await?;
            match cli.output {
                Output::Human => {
                    print_outcome(&workload.namespace, &workload.name, &run.outcome);
                    for obj in &run.objects { println!("  store: {}", obj); }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&run)?),
            }
        }
        Commands::Reconcile { kind, name, .. } => {
            let kind = kind.ok_or_else(|| anyhow!("missing workload kind"))?;
            let name = name.ok_or_else(|| anyhow!("missing workload name"))?;
            let kind = WorkloadKind::parse(&kind).ok_or_else(|| anyhow!("unsupported kind: {} (expect redis or rediscluster)", kind))?;
            let ns = cli.namespace.clone().unwrap_or_else(|| "default".to_string());
            info!(kind = %kind.kind(), ns = %ns, name = %name, "reconcile invoked");
            let store = Arc::new(KubeStore::try_default().await?);
            let reconciler = Reconciler::new(store.clone(), store, SyncConfig::from_env());
            let ctx = CallCtx::with_timeout(call_timeout());
            let outcome = match reconciler.reconcile(&ctx, kind, &ns, &name).await {
                Ok(o) => o,
                Err(e) => {
                    error!(error = %e, "reconcile failed");
                    return Err(e.into());
                }
            };
            match cli.output {
                Output::Human => print_outcome(&ns, &name, &outcome),
                Output::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cluster_manifest() {
        let y = "apiVersion: redis.redis.opstreelabs.in/v1beta1\nkind: RedisCluster\nmetadata:\n  name: cache1\n  namespace: ns1\nspec:\n  clusterSize: 2\n";
        let w = parse_workload_yaml(y, None).unwrap();
        assert_eq!(w.kind, WorkloadKind::RedisCluster);
        assert_eq!(w.replicas, Replicas::new(2, 2));
        assert_eq!(teardown_plan(&w).objects().count(), 2 + 4 + 1 + 2);
    }

    #[test]
    fn namespace_defaults_and_overrides() {
        let y = "kind: Redis\nmetadata:\n  name: r\n";
        assert_eq!(parse_workload_yaml(y, None).unwrap().namespace, "default");
        assert_eq!(parse_workload_yaml(y, Some("prod")).unwrap().namespace, "prod");
    }

    #[test]
    fn manifest_errors_are_friendly() {
        let e = parse_workload_yaml("metadata:\n  name: x\n", None).unwrap_err().to_string();
        assert!(e.contains("missing kind"), "e={}", e);
        let e = parse_workload_yaml("kind: Memcached\nmetadata:\n  name: x\n", None).unwrap_err().to_string();
        assert!(e.contains("unsupported kind"), "e={}", e);
    }

    #[test]
    fn scalar_metadata_is_an_error() {
        let e = parse_workload_yaml("kind: Redis\nmetadata: oops\n", None).unwrap_err().to_string();
        assert!(e.contains("metadata is not a mapping"), "e={}", e);
        let e = parse_workload_yaml("kind: Redis\n", Some("prod")).unwrap_err().to_string();
        assert!(e.contains("missing metadata"), "e={}", e);
    }

    #[test]
    fn cli_accepts_mem_dry_run() {
        let cli = Cli::try_parse_from(["kvopctl", "reconcile", "--mem", "-f", "cache1.yaml"]).unwrap();
        assert!(matches!(cli.command, Commands::Reconcile { mem: true, kind: None, .. }));
        assert!(Cli::try_parse_from(["kvopctl", "reconcile", "--mem"]).is_err());
        assert!(Cli::try_parse_from(["kvopctl", "reconcile"]).is_err());
        assert!(Cli::try_parse_from(["kvopctl", "reconcile", "redis", "r"]).is_ok());
    }

    #[tokio::test]
    async fn dry_run_creates_dependents() {
        let y = "kind: RedisCluster\nmetadata:\n  name: cache1\n  namespace: ns1\nspec:\n  clusterSize: 1\n";
        let (kind, raw) = load_manifest(y, None).unwrap();
        let run = dry_run(kind, raw, false, SyncConfig::default()).await.unwrap();
        let ReconcileOutcome::Synced { finalizer_attached, monitors, .. } = &run.outcome else {
            panic!("expected synced, got {:?}", run.outcome)
        };
        assert!(*finalizer_attached);
        assert_eq!(monitors.len(), 2);
        let objects: Vec<String> = run.objects.iter().map(|o| o.to_string()).collect();
        assert_eq!(
            objects,
            vec!["GrafanaDashboard ns1/cache1-cluster", "ServiceMonitor ns1/cache1-follower", "ServiceMonitor ns1/cache1-leader"]
        );
    }

    #[tokio::test]
    async fn dry_run_of_marked_manifest_tears_down() {
        let y = "kind: RedisCluster\nmetadata:\n  name: cache1\n  namespace: ns1\n  deletionTimestamp: \"2024-01-01T00:00:00Z\"\n  finalizers: [redisClusterFinalizer]\nspec:\n  clusterSize: 1\n";
        let (kind, raw) = load_manifest(y, None).unwrap();
        let run = dry_run(kind, raw, true, SyncConfig::default()).await.unwrap();
        let ReconcileOutcome::Released(report) = &run.outcome else { panic!("expected release, got {:?}", run.outcome) };
        assert_eq!(report.deleted(), 4);
        assert_eq!(report.absent(), 3);
        assert!(run.objects.is_empty());
    }

    #[test]
    fn name_set_for_cluster() {
        let set = name_set("cache1", Topology::Cluster, Replicas::new(1, 1));
        assert_eq!(set.dashboard, "cache1-cluster");
        assert_eq!(set.monitors.len(), 2);
        assert_eq!(set.monitors[1].selector[0], ("app".to_string(), "cache1-follower".to_string()));
        assert_eq!(set.claims, vec!["cache1-leader-cache1-leader-0", "cache1-follower-cache1-follower-0"]);
        assert_eq!(set.finalizer, "redisClusterFinalizer");
    }
}
