#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use purger_api as api;
pub use purger_core as core;
pub use purger_k8s_index as index;
pub use purger_nginx as nginx;

mod args;

pub use self::args::Args;

/// Lists an instance's pods from the shared pod index.
#[derive(Clone, Debug)]
struct PodLister(index::SharedIndex);

impl PodLister {
    pub fn new(index: index::SharedIndex) -> Self {
        Self(index)
    }
}

impl core::ListPods for PodLister {
    fn list_pods(&self, instance: &str) -> anyhow::Result<core::InstancePods> {
        self.0.read().list_pods(instance)
    }
}
