//! Container preparation
//!
//! Network namespace creation and root filesystem mounting run
//! concurrently. Their results are applied to the container's state only
//! after both have finished, and the state is saved even when one of them
//! failed so that a later cleanup finds whatever was set up.

use crate::container::runtime::Container;
use crate::container::store::StateStore;
use crate::error::{EngineError, ErrorAccumulator, Result};
use crate::network::NetworkManager;
use crate::storage::StorageBackend;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

/// Await a future and note when it finished
async fn timed<T>(fut: impl Future<Output = Result<T>>) -> (Result<T>, Instant) {
    let result = fut.await;
    (result, Instant::now())
}

/// Brings containers to the point where their runtime spec can be generated
pub struct Preparer {
    network: Arc<NetworkManager>,
    storage: Arc<dyn StorageBackend>,
    store: Arc<StateStore>,
}

impl Preparer {
    pub fn new(network: Arc<NetworkManager>, storage: Arc<dyn StorageBackend>, store: Arc<StateStore>) -> Self {
        Self {
            network,
            storage,
            store,
        }
    }

    /// Create the network namespace and mount the root filesystem.
    ///
    /// When both fail, the failure that happened first is returned and the
    /// other is logged. Nothing that succeeded is undone; callers clean up
    /// with [`Preparer::cleanup`] before retrying.
    pub async fn prepare(&self, container: &mut Container) -> Result<()> {
        let needs_network = container.config.creates_net_ns() && container.state.net_ns.is_none();
        let needs_storage = !container.state.mounted;

        let ctr: &Container = container;
        let network = async {
            if !needs_network {
                return Ok(None);
            }
            self.network.create_net_ns(ctr).await.map(Some)
        };
        let storage = async {
            if !needs_storage {
                return Ok(None);
            }
            self.storage.mount(&ctr.config).await.map(Some)
        };
        let ((network, network_done), (storage, storage_done)) = tokio::join!(timed(network), timed(storage));

        let mut failures: Vec<(Instant, EngineError)> = Vec::new();
        match network {
            Ok(Some(setup)) => {
                tracing::debug!("Network namespace of {} is {}", container.id(), setup.handle);
                container.state.net_ns = Some(setup.handle);
                container.state.network_status = setup.status;
                container.state.network_override = None;
            }
            Ok(None) => {}
            Err(e) => failures.push((network_done, e)),
        }
        match storage {
            Ok(Some(mountpoint)) => {
                tracing::debug!("Root filesystem of {} mounted at {}", container.id(), mountpoint.display());
                container.state.mounted = true;
                container.state.mountpoint = Some(mountpoint);
            }
            Ok(None) => {}
            Err(e) => failures.push((storage_done, e)),
        }
        failures.sort_by_key(|(done, _)| *done);

        let mut errors = ErrorAccumulator::new(format!("preparing container {}", container.id()));
        for (_, err) in failures {
            errors.push(err);
        }
        errors.record(self.store.save(container));
        errors.finish()
    }

    /// Tear down the network and unmount the root filesystem, then save the
    /// state. Every step runs even when an earlier one failed.
    pub async fn cleanup(&self, container: &mut Container) -> Result<()> {
        let mut errors = ErrorAccumulator::new(format!("cleaning up container {}", container.id()));

        if container.state.net_ns.is_some() && errors.record(self.network.teardown(container).await).is_some() {
            container.state.net_ns = None;
            container.state.network_status.clear();
        }
        if container.state.mounted && errors.record(self.storage.unmount(container.id()).await).is_some() {
            container.state.mounted = false;
            container.state.mountpoint = None;
        }

        errors.record(self.store.save(container));
        errors.finish()
    }
}
