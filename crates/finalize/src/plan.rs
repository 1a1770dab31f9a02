//! Teardown plan: the ordered list of objects a deletion removes.

use std::fmt;

use kvop_core::{names, ObjectKind, ObjectRef, Workload};
use serde::{Deserialize, Serialize};

/// Teardown steps in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TeardownStep {
    Endpoints,
    Claims,
    Dashboard,
    Monitors,
    ReleaseFinalizer,
}

impl TeardownStep {
    pub const ORDER: [TeardownStep; 5] = [
        TeardownStep::Endpoints,
        TeardownStep::Claims,
        TeardownStep::Dashboard,
        TeardownStep::Monitors,
        TeardownStep::ReleaseFinalizer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TeardownStep::Endpoints => "endpoints",
            TeardownStep::Claims => "claims",
            TeardownStep::Dashboard => "dashboard",
            TeardownStep::Monitors => "monitors",
            TeardownStep::ReleaseFinalizer => "release-finalizer",
        }
    }
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub step: TeardownStep,
    /// Objects deleted by this step. Empty for the finalizer release.
    pub targets: Vec<ObjectRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownPlan {
    pub finalizer: String,
    pub steps: Vec<PlannedStep>,
}

impl TeardownPlan {
    /// Every object the plan deletes, in order.
    pub fn objects(&self) -> impl Iterator<Item = &ObjectRef> {
        self.steps.iter().flat_map(|s| s.targets.iter())
    }
}

/// Compute the teardown plan for a workload. Pure: the same descriptor always
/// yields the same plan.
pub fn teardown_plan(workload: &Workload) -> TeardownPlan {
    let ns = workload.namespace.as_str();
    let w = workload.name.as_str();
    let topology = workload.topology();
    let steps = TeardownStep::ORDER
        .iter()
        .map(|&step| {
            let targets = match step {
                TeardownStep::Endpoints => {
                    names::service_names(w).into_iter().map(|n| ObjectRef::new(ObjectKind::Service, ns, n)).collect()
                }
                TeardownStep::Claims => names::claim_names(w, topology, workload.replicas)
                    .into_iter()
                    .map(|n| ObjectRef::new(ObjectKind::PersistentVolumeClaim, ns, n))
                    .collect(),
                TeardownStep::Dashboard => {
                    vec![ObjectRef::new(ObjectKind::GrafanaDashboard, ns, names::dashboard_name(w, topology))]
                }
                TeardownStep::Monitors => names::monitor_targets(topology)
                    .into_iter()
                    .map(|t| ObjectRef::new(ObjectKind::ServiceMonitor, ns, names::monitor_name(w, t)))
                    .collect(),
                TeardownStep::ReleaseFinalizer => Vec::new(),
            };
            PlannedStep { step, targets }
        })
        .collect();
    TeardownPlan { finalizer: names::finalizer_token(topology).to_string(), steps }
}
