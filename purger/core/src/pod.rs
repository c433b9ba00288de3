use anyhow::Result;

/// The purger's view of a single replica pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodStatus {
    /// The pod's routable IP.
    pub address: String,

    /// Set iff every container in the pod reports ready.
    pub running: bool,
}

/// The replicas of an instance, along with the port on which their management endpoint listens.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstancePods {
    pub pods: Vec<PodStatus>,
    pub management_port: i32,
}

/// Models replica pod discovery for an instance.
///
/// Implementations must return owned data so that callers never hold an index lock across network
/// I/O.
pub trait ListPods {
    fn list_pods(&self, instance: &str) -> Result<InstancePods>;
}

impl<L: ListPods + ?Sized> ListPods for std::sync::Arc<L> {
    fn list_pods(&self, instance: &str) -> Result<InstancePods> {
        (**self).list_pods(instance)
    }
}
