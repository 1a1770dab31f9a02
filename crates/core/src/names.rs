//! Canonical names and labels for objects derived from a workload.
//!
//! Every function here is pure: get, create and delete paths recompute the
//! same identity from `(workload, topology, role)` instead of storing it.

use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

use crate::{Replicas, Role, Topology};

/// Finalizer tokens, one per workload topology.
pub const STANDALONE_FINALIZER: &str = "redisFinalizer";
pub const CLUSTER_FINALIZER: &str = "redisClusterFinalizer";

/// Label key carrying the topology on pods and monitor selectors.
pub const SETUP_TYPE_LABEL: &str = "redis_setup_type";

/// Ordered label pairs, small enough to stay inline.
pub type Labels = SmallVec<[(String, String); 4]>;

/// What a single monitor watches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MonitorTarget {
    Standalone,
    Cluster(Role),
}

impl MonitorTarget {
    pub fn topology(self) -> Topology {
        match self {
            MonitorTarget::Standalone => Topology::Standalone,
            MonitorTarget::Cluster(_) => Topology::Cluster,
        }
    }

    pub fn role(self) -> Option<Role> {
        match self {
            MonitorTarget::Standalone => None,
            MonitorTarget::Cluster(role) => Some(role),
        }
    }
}

pub fn finalizer_token(topology: Topology) -> &'static str {
    match topology {
        Topology::Standalone => STANDALONE_FINALIZER,
        Topology::Cluster => CLUSTER_FINALIZER,
    }
}

pub fn dashboard_name(workload: &str, topology: Topology) -> String {
    format!("{}-{}", workload, topology.setup_type())
}

/// Monitors a topology needs, leader before follower.
pub fn monitor_targets(topology: Topology) -> SmallVec<[MonitorTarget; 2]> {
    match topology {
        Topology::Standalone => smallvec![MonitorTarget::Standalone],
        Topology::Cluster => Role::ALL.iter().map(|r| MonitorTarget::Cluster(*r)).collect(),
    }
}

pub fn monitor_name(workload: &str, target: MonitorTarget) -> String {
    match target {
        MonitorTarget::Standalone => format!("{}-standalone", workload),
        MonitorTarget::Cluster(role) => format!("{}-{}", workload, role),
    }
}

/// Value of the `app` label the monitor matches.
pub fn match_app(workload: &str, target: MonitorTarget) -> String {
    match target {
        MonitorTarget::Standalone => workload.to_string(),
        MonitorTarget::Cluster(role) => format!("{}-{}", workload, role),
    }
}

pub fn monitor_selector(workload: &str, target: MonitorTarget) -> Labels {
    smallvec![
        ("app".to_string(), match_app(workload, target)),
        (SETUP_TYPE_LABEL.to_string(), target.topology().setup_type().to_string()),
    ]
}

/// Primary and headless service names.
pub fn service_names(workload: &str) -> [String; 2] {
    [workload.to_string(), format!("{}-headless", workload)]
}

/// Number of claims [`claim_names`] yields.
pub fn claim_count(topology: Topology, replicas: Replicas) -> u64 {
    match topology {
        Topology::Standalone => 1,
        Topology::Cluster => u64::from(replicas.leader) + u64::from(replicas.follower),
    }
}

/// Persistent volume claims created by the workload's stateful sets.
pub fn claim_names(workload: &str, topology: Topology, replicas: Replicas) -> Vec<String> {
    match topology {
        Topology::Standalone => vec![format!("{0}-{0}-0", workload)],
        Topology::Cluster => {
            let mut out = Vec::with_capacity(claim_count(topology, replicas).min(1024) as usize);
            for role in Role::ALL {
                let set = format!("{}-{}", workload, role);
                for i in 0..replicas.count(role) {
                    out.push(format!("{0}-{0}-{1}", set, i));
                }
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dashboard_names_by_topology() {
        assert_eq!(dashboard_name("cache1", Topology::Cluster), "cache1-cluster");
        assert_eq!(dashboard_name("cache1", Topology::Standalone), "cache1-standalone");
    }

    #[test]
    fn monitor_names_never_collide() {
        let standalone = monitor_name("w", MonitorTarget::Standalone);
        let leader = monitor_name("w", MonitorTarget::Cluster(Role::Leader));
        let follower = monitor_name("w", MonitorTarget::Cluster(Role::Follower));
        assert_eq!(standalone, "w-standalone");
        assert_eq!(leader, "w-leader");
        assert_eq!(follower, "w-follower");
        assert_ne!(leader, follower);
        assert_ne!(leader, standalone);
        assert_ne!(follower, standalone);
    }

    #[test]
    fn names_are_deterministic() {
        for topology in [Topology::Standalone, Topology::Cluster] {
            for target in monitor_targets(topology) {
                assert_eq!(monitor_name("db", target), monitor_name("db", target));
                assert_eq!(monitor_selector("db", target), monitor_selector("db", target));
            }
            assert_eq!(dashboard_name("db", topology), dashboard_name("db", topology));
        }
    }

    #[test]
    fn selectors_match_role_qualified_app() {
        let sel = monitor_selector("cache1", MonitorTarget::Cluster(Role::Follower));
        assert_eq!(sel[0], ("app".to_string(), "cache1-follower".to_string()));
        assert_eq!(sel[1], ("redis_setup_type".to_string(), "cluster".to_string()));

        let sel = monitor_selector("cache1", MonitorTarget::Standalone);
        assert_eq!(sel[0].1, "cache1");
        assert_eq!(sel[1].1, "standalone");
    }

    #[test]
    fn cluster_targets_are_leader_then_follower() {
        let t = monitor_targets(Topology::Cluster);
        assert_eq!(t.as_slice(), &[MonitorTarget::Cluster(Role::Leader), MonitorTarget::Cluster(Role::Follower)]);
        assert_eq!(monitor_targets(Topology::Standalone).as_slice(), &[MonitorTarget::Standalone]);
    }

    #[test]
    fn claim_names_per_role_and_index() {
        let claims = claim_names("cache1", Topology::Cluster, Replicas::new(2, 1));
        assert_eq!(
            claims,
            vec![
                "cache1-leader-cache1-leader-0",
                "cache1-leader-cache1-leader-1",
                "cache1-follower-cache1-follower-0",
            ]
        );
        assert_eq!(claim_names("r", Topology::Standalone, Replicas::new(9, 9)), vec!["r-r-0"]);
        assert!(claim_names("r", Topology::Cluster, Replicas::default()).is_empty());
    }

    #[test]
    fn claim_count_does_not_overflow() {
        assert_eq!(claim_count(Topology::Cluster, Replicas::new(u32::MAX, 1)), u64::from(u32::MAX) + 1);
        assert_eq!(claim_count(Topology::Cluster, Replicas::new(u32::MAX, u32::MAX)), 2 * u64::from(u32::MAX));
        assert_eq!(claim_count(Topology::Standalone, Replicas::new(u32::MAX, u32::MAX)), 1);
        assert_eq!(claim_count(Topology::Cluster, Replicas::new(2, 1)), claim_names("c", Topology::Cluster, Replicas::new(2, 1)).len() as u64);
    }

    #[test]
    fn services_and_finalizers() {
        assert_eq!(service_names("cache1"), ["cache1".to_string(), "cache1-headless".to_string()]);
        assert_eq!(finalizer_token(Topology::Standalone), "redisFinalizer");
        assert_eq!(finalizer_token(Topology::Cluster), "redisClusterFinalizer");
    }
}
