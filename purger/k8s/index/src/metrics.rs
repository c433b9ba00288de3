use crate::{pod::PodRef, SharedIndex};
use k8s_openapi::api::core::v1::Pod;
use parking_lot::RwLock;
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use std::sync::Arc;

/// Instruments pod index updates.
pub struct IndexMetrics {
    inner: SharedIndex,

    pods: Gauge,
    applies: Counter,
    deletes: Counter,
}

impl IndexMetrics {
    pub fn register(inner: SharedIndex, prom: &mut Registry) -> Self {
        let pods = Gauge::default();
        prom.register("pods", "Gauge of the number of indexed pods", pods.clone());

        let applies = Counter::default();
        prom.register(
            "pod_applies",
            "Count of pod updates applied to the index",
            applies.clone(),
        );

        let deletes = Counter::default();
        prom.register(
            "pod_deletes",
            "Count of pod deletions applied to the index",
            deletes.clone(),
        );

        Self {
            inner,
            pods,
            applies,
            deletes,
        }
    }

    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }
}

impl kubert::index::IndexNamespacedResource<Pod> for IndexMetrics {
    fn apply(&mut self, pod: Pod) {
        self.applies.inc();
        let mut index = self.inner.write();
        index.apply_pod(pod);
        self.pods.set(index.len() as i64);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.deletes.inc();
        let mut index = self.inner.write();
        index.delete_pod(&PodRef::new(namespace, name));
        self.pods.set(index.len() as i64);
    }
}
