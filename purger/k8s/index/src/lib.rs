//! Replica pod discovery.
//!
//! The index watches pods labeled with [`INSTANCE_LABEL`] and groups them by the label's value so
//! that the pods of an instance can be listed without querying the API server:
//!
//! ```text
//! [ Pod ] -(instance label)-> [ Instance ] -> ListPods
//! ```
//!
//! The index is only written by the watch task and is read concurrently by purge requests, so it
//! is shared behind a readers-writer lock. Lookups copy the pods they return.
//!
//! [`INSTANCE_LABEL`]: purger_core::INSTANCE_LABEL

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod metrics;
mod pod;

#[cfg(test)]
mod tests;

use self::pod::{Pod, PodRef};
use anyhow::{anyhow, Result};
use k8s_openapi::api::core::v1 as k8s;
use kube::ResourceExt;
use parking_lot::RwLock;
use purger_core::{InstancePods, MANAGEMENT_PORT_NAME};
use std::{
    collections::{hash_map::Entry, BTreeMap, HashMap},
    sync::Arc,
};
use tracing::{debug, trace};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Holds the pods of every instance.
#[derive(Debug, Default)]
pub struct Index {
    /// Pods by instance name, ordered by namespace and pod name.
    instances: HashMap<String, BTreeMap<PodRef, Pod>>,

    /// The instance under which each pod is currently indexed.
    ///
    /// Deletions only identify a pod by namespace and name, and a pod's labels may change between
    /// updates.
    pod_instances: HashMap<PodRef, String>,
}

// === impl Index ===

impl Index {
    pub fn shared() -> SharedIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Returns the number of indexed pods across all instances.
    pub fn len(&self) -> usize {
        self.pod_instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pod_instances.is_empty()
    }

    /// Lists the pods of `instance` along with the port of their management endpoint.
    ///
    /// All replicas of an instance share a pod template, so the port is read from the first pod.
    pub fn list_pods(&self, instance: &str) -> Result<InstancePods> {
        let pods = self
            .instances
            .get(instance)
            .ok_or_else(|| anyhow!("no pods found for instance {instance}"))?;
        let (first_ref, first) = pods
            .iter()
            .next()
            .ok_or_else(|| anyhow!("no pods found for instance {instance}"))?;

        let management_port = first.management_port.ok_or_else(|| {
            anyhow!(
                "pod {} of instance {instance} has no {MANAGEMENT_PORT_NAME} port",
                first_ref
            )
        })?;

        // Pods that have not been assigned an IP cannot be reached yet.
        let pods = pods
            .values()
            .filter(|pod| !pod.status.address.is_empty())
            .map(|pod| pod.status.clone())
            .collect::<Vec<_>>();
        if pods.is_empty() {
            return Err(anyhow!("no pods found for instance {instance}"));
        }

        Ok(InstancePods {
            pods,
            management_port,
        })
    }

    pub(crate) fn apply_pod(&mut self, pod: k8s::Pod) {
        let pod_ref = PodRef::new(pod.namespace().unwrap_or_default(), pod.name_any());

        let Some(instance) = pod::instance(&pod).map(str::to_string) else {
            // The pod may have been relabeled away from an instance.
            trace!(pod = %pod_ref, "Ignoring pod without an instance");
            self.delete_pod(&pod_ref);
            return;
        };

        let pod = Pod::from_resource(pod);
        match self.pod_instances.entry(pod_ref.clone()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() != instance {
                    let prior = entry.insert(instance.clone());
                    debug!(pod = %pod_ref, %prior, %instance, "Pod moved to another instance");
                    self.remove_from_instance(&prior, &pod_ref);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(instance.clone());
            }
        }

        debug!(
            pod = %pod_ref,
            %instance,
            address = %pod.status.address,
            running = pod.status.running,
            "Indexed pod"
        );
        self.instances
            .entry(instance)
            .or_default()
            .insert(pod_ref, pod);
    }

    pub(crate) fn delete_pod(&mut self, pod_ref: &PodRef) {
        if let Some(instance) = self.pod_instances.remove(pod_ref) {
            debug!(pod = %pod_ref, %instance, "Removed pod");
            self.remove_from_instance(&instance, pod_ref);
        }
    }

    fn remove_from_instance(&mut self, instance: &str, pod_ref: &PodRef) {
        if let Some(pods) = self.instances.get_mut(instance) {
            pods.remove(pod_ref);
            if pods.is_empty() {
                self.instances.remove(instance);
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, pod: k8s::Pod) {
        self.apply_pod(pod);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_pod(&PodRef::new(namespace, name));
    }
}
