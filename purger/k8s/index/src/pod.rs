use k8s_openapi::api::core::v1 as k8s;
use purger_core::{PodStatus, INSTANCE_LABEL, MANAGEMENT_PORT_NAME};
use std::fmt;

/// Identifies a pod within the cluster.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct PodRef {
    namespace: String,
    name: String,
}

/// Holds the state of an individual pod.
#[derive(Clone, Debug)]
pub(crate) struct Pod {
    pub(crate) status: PodStatus,

    /// The port named [`MANAGEMENT_PORT_NAME`] on the pod's first container, if one is declared.
    pub(crate) management_port: Option<i32>,
}

/// Returns the instance a pod belongs to, if any.
pub(crate) fn instance(pod: &k8s::Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()?
        .get(INSTANCE_LABEL)
        .map(String::as_str)
        .filter(|name| !name.is_empty())
}

// === impl PodRef ===

impl PodRef {
    pub(crate) fn new(namespace: String, name: String) -> Self {
        Self { namespace, name }
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl Pod ===

impl Pod {
    pub(crate) fn from_resource(pod: k8s::Pod) -> Self {
        let management_port = pod.spec.as_ref().and_then(management_port);

        let status = pod.status.unwrap_or_default();
        let running = status
            .container_statuses
            .iter()
            .flatten()
            .all(|cs| cs.ready);

        Self {
            status: PodStatus {
                address: status.pod_ip.unwrap_or_default(),
                running,
            },
            management_port,
        }
    }
}

fn management_port(spec: &k8s::PodSpec) -> Option<i32> {
    spec.containers
        .first()?
        .ports
        .iter()
        .flatten()
        .find(|port| port.name.as_deref() == Some(MANAGEMENT_PORT_NAME))
        .map(|port| port.container_port)
}
