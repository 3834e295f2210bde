//! `ContainerLister` collaborator interface consumed by the population
//! watcher, and a `bollard`-backed implementation of it.

use async_trait::async_trait;
use bollard::query_parameters::ListContainersOptionsBuilder;
use bollard::Docker;

use crate::error::{ClawkerError, Result};

/// A container as reported by the lister: just enough to log about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    pub names: Vec<String>,
}

/// Label-based filter the watcher applies: managed-label present AND
/// monitoring-label absent. The exact label names are a configuration
/// concern, not part of the core's contract.
#[derive(Clone, Debug)]
pub struct ContainerFilter {
    pub managed_label: String,
    pub monitoring_label: String,
}

impl Default for ContainerFilter {
    fn default() -> Self {
        Self {
            managed_label: "clawker.managed=true".to_string(),
            monitoring_label: "clawker.monitoring=true".to_string(),
        }
    }
}

/// Collaborator interface the population watcher depends on. Injectable for
/// tests; the only production implementation is `BollardContainerLister`.
#[async_trait]
pub trait ContainerLister: Send + Sync {
    async fn list(&self, filter: &ContainerFilter) -> Result<Vec<Container>>;
    async fn close(&self);
}

/// Docker-API-backed `ContainerLister`, using `bollard` over the local
/// Docker socket.
pub struct BollardContainerLister {
    docker: Docker,
}

impl BollardContainerLister {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ClawkerError::dependency(format!("connecting to Docker: {e}")))?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerLister for BollardContainerLister {
    async fn list(&self, filter: &ContainerFilter) -> Result<Vec<Container>> {
        let mut filters = std::collections::HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![filter.managed_label.clone()],
        );

        let options = ListContainersOptionsBuilder::default()
            .all(false)
            .filters(&filters)
            .build();

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| ClawkerError::dependency(format!("listing containers: {e}")))?;

        Ok(containers
            .into_iter()
            .filter(|c| {
                let labels = c.labels.clone().unwrap_or_default();
                !label_matches(&labels, &filter.monitoring_label)
            })
            .map(|c| Container {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
            })
            .collect())
    }

    async fn close(&self) {}
}

fn label_matches(labels: &std::collections::HashMap<String, String>, spec: &str) -> bool {
    match spec.split_once('=') {
        Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
        None => labels.contains_key(spec),
    }
}

/// A fake lister used by daemon tests to exercise the population watcher's
/// shutdown and error-threshold behavior without Docker.
#[cfg(test)]
pub struct FakeLister {
    pub containers: std::sync::Mutex<Vec<Container>>,
    pub always_err: bool,
    pub calls: std::sync::atomic::AtomicU32,
}

#[cfg(test)]
#[async_trait]
impl ContainerLister for FakeLister {
    async fn list(&self, _filter: &ContainerFilter) -> Result<Vec<Container>> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.always_err {
            return Err(ClawkerError::dependency("fake lister error"));
        }
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn label_matches_key_value() {
        let mut labels = std::collections::HashMap::new();
        labels.insert("clawker.monitoring".to_string(), "true".to_string());
        assert!(label_matches(&labels, "clawker.monitoring=true"));
        assert!(!label_matches(&labels, "clawker.monitoring=false"));
    }

    #[tokio::test]
    async fn fake_lister_counts_calls() {
        let lister = Arc::new(FakeLister {
            containers: std::sync::Mutex::new(vec![]),
            always_err: false,
            calls: AtomicU32::new(0),
        });
        let _ = lister.list(&ContainerFilter::default()).await.unwrap();
        assert_eq!(lister.calls.load(Ordering::SeqCst), 1);
    }
}
