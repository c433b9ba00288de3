//! Reverse-proxy cache purger core.
//!
//! An instance is a logical reverse-proxy deployment backed by one or more replica pods, each of
//! which holds an independent local cache. Purging an object means reaching every running replica
//! of the instance on its management port and asking it to drop the cached entry:
//!
//! ```text
//! [ Purger ] -> [ ListPods ] (instance -> pods, management port)
//!            -> [ CacheManager ] (per pod)
//! ```
//!
//! Both collaborators are traits so that the Kubernetes-backed index and the nginx client can be
//! swapped for in-memory fakes.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cache;
mod errors;
pub mod pod;
pub mod purge;

pub use self::{
    cache::{CacheError, CacheManager},
    errors::MultiError,
    pod::{InstancePods, ListPods, PodStatus},
    purge::{Error, PurgeCacheArgs, PurgeCacheBulkResult, Purger},
};

/// The label that declares which instance a pod belongs to.
pub const INSTANCE_LABEL: &str = "rpaas.extensions.tsuru.io/instance-name";

/// The name of the container port that exposes the proxy's management endpoint.
pub const MANAGEMENT_PORT_NAME: &str = "nginx-metrics";
