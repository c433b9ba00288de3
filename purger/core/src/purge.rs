use crate::{CacheManager, InstancePods, ListPods, MultiError, PodStatus};
use futures::prelude::*;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// The number of pods purged concurrently for a single object.
const DEFAULT_MAX_CONCURRENCY: NonZeroUsize = match NonZeroUsize::new(8) {
    Some(n) => n,
    None => unreachable!(),
};

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PurgeCacheArgs {
    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub preserve_path: bool,
}

/// The outcome of purging a single path, as reported to API clients.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PurgeCacheBulkResult {
    pub path: String,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub instances_purged: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum Error {
    /// The caller supplied invalid arguments. No pods were contacted.
    #[error("{0}")]
    Validation(String),

    /// The instance's pods could not be discovered. No pods were contacted.
    #[error("{0}")]
    NotFound(String),

    /// Purging failed on at least one pod.
    #[error("{errors}")]
    Upstream { purged: usize, errors: MultiError },
}

/// Purges objects from every running replica of an instance.
#[derive(Clone, Debug)]
pub struct Purger<L, C> {
    lister: L,
    cache: C,
    max_concurrency: NonZeroUsize,
}

// === impl Purger ===

impl<L, C> Purger<L, C>
where
    L: ListPods,
    C: CacheManager,
{
    pub fn new(lister: L, cache: C) -> Self {
        Self {
            lister,
            cache,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    pub fn with_max_concurrency(mut self, max: NonZeroUsize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Purges `args.path` from every running pod of `instance`, returning the number of pods on
    /// which the object was cached.
    ///
    /// Per-pod failures do not interrupt the purge of the remaining pods; they are collected, in
    /// pod order, into an [`Error::Upstream`] that also carries the number of successful purges.
    #[instrument(skip(self, args), fields(path = %args.path))]
    pub async fn purge_cache(&self, instance: &str, args: &PurgeCacheArgs) -> Result<usize, Error> {
        if args.path.is_empty() {
            return Err(Error::Validation("path is required".to_string()));
        }

        let InstancePods {
            pods,
            management_port: port,
        } = self
            .lister
            .list_pods(instance)
            .map_err(|error| Error::NotFound(error.to_string()))?;

        let outcomes = stream::iter(pods.into_iter().filter(|pod| pod.running))
            .map(|pod| self.purge_pod(pod, port, args))
            .buffered(self.max_concurrency.get())
            .collect::<Vec<_>>()
            .await;

        let mut purged = 0;
        let mut errors = MultiError::default();
        for outcome in outcomes {
            match outcome {
                Ok(true) => purged += 1,
                Ok(false) => {}
                Err(error) => errors.push(error),
            }
        }

        debug!(purged, failed = errors.len(), "Purged");
        if errors.is_empty() {
            Ok(purged)
        } else {
            Err(Error::Upstream { purged, errors })
        }
    }

    async fn purge_pod(
        &self,
        pod: PodStatus,
        port: i32,
        args: &PurgeCacheArgs,
    ) -> Result<bool, String> {
        match self
            .cache
            .purge_cache(&pod.address, &args.path, port, args.preserve_path)
            .await
        {
            Ok(hit) => {
                debug!(pod = %pod.address, hit, "Purge completed");
                Ok(hit)
            }
            Err(error) => {
                warn!(pod = %pod.address, %error, "Purge failed");
                Err(format!("pod {}:{} failed: {}", pod.address, port, error))
            }
        }
    }
}

// === impl Error ===

impl Error {
    /// The number of pods purged before or despite the error.
    pub fn purged(&self) -> usize {
        match self {
            Self::Upstream { purged, .. } => *purged,
            Self::Validation(_) | Self::NotFound(_) => 0,
        }
    }
}

// === impl PurgeCacheBulkResult ===

impl PurgeCacheBulkResult {
    pub fn new(path: impl Into<String>, outcome: &Result<usize, Error>) -> Self {
        let (instances_purged, error) = match outcome {
            Ok(purged) => (*purged, None),
            Err(error) => (error.purged(), Some(error.to_string())),
        };
        Self {
            path: path.into(),
            instances_purged,
            error,
        }
    }
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}
