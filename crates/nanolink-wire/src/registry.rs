//! Discovery registry: where services advertise themselves and find each other.
//!
//! The registry runs two background tasks:
//!
//! - **listener**: accepts one registration per TCP connection. A client that
//!   writes a descriptor batch and half-closes is merged into the index; a
//!   client that writes nothing and half-closes receives the full export.
//! - **sweeper**: every sweep interval, probes each descriptor with a
//!   connect-and-close. Reachable services get a fresh liveness epoch,
//!   unreachable ones are flagged, and flagged descriptors are removed.
//!
//! Both indices live behind one lock so they are always updated together.

use crate::codec;
use crate::service::probe_address;
use nanolink_types::{
    DescriptorBatch, RegistryConfig, ServiceDescriptor, WireError, WireResult, ALL_SERVICES,
};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// The two views of the registry contents.
///
/// `by_name` is authoritative. `by_type` lists the names of each type in the
/// order they were first registered under it.
#[derive(Debug, Default)]
struct Indices {
    by_name: HashMap<String, ServiceDescriptor>,
    by_type: BTreeMap<String, Vec<String>>,
}

impl Indices {
    fn insert(&mut self, descriptor: ServiceDescriptor) {
        let name = descriptor.name.clone();
        let service_type = descriptor.service_type.clone();
        match self.by_name.insert(name.clone(), descriptor) {
            Some(previous) if previous.service_type == service_type => {}
            Some(previous) => {
                self.unlink(&previous.service_type, &name);
                self.by_type.entry(service_type).or_default().push(name);
            }
            None => self.by_type.entry(service_type).or_default().push(name),
        }
    }

    fn unlink(&mut self, service_type: &str, name: &str) {
        if let Some(names) = self.by_type.get_mut(service_type) {
            names.retain(|n| n != name);
            if names.is_empty() {
                self.by_type.remove(service_type);
            }
        }
    }

    fn of_type(&self, service_type: &str) -> Vec<ServiceDescriptor> {
        self.by_type
            .get(service_type)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| self.by_name.get(n).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn all(&self) -> Vec<ServiceDescriptor> {
        self.by_type
            .keys()
            .flat_map(|t| self.of_type(t))
            .collect()
    }

    fn remove_expired(&mut self) -> Vec<ServiceDescriptor> {
        let expired: Vec<String> = self
            .by_name
            .values()
            .filter(|d| d.is_expired())
            .map(|d| d.name.clone())
            .collect();
        let mut removed = Vec::with_capacity(expired.len());
        for name in expired {
            if let Some(descriptor) = self.by_name.remove(&name) {
                self.unlink(&descriptor.service_type, &name);
                removed.push(descriptor);
            }
        }
        removed
    }
}

/// State shared between the registry handle and its background tasks.
struct RegistryState {
    indices: RwLock<Indices>,
    stale: AtomicBool,
    config: RegistryConfig,
}

impl RegistryState {
    fn ensure_live(&self) -> WireResult<()> {
        if self.stale.load(Ordering::SeqCst) {
            return Err(WireError::RegistryShutdown);
        }
        Ok(())
    }

    fn merge(&self, batch: DescriptorBatch) -> WireResult<usize> {
        self.ensure_live()?;
        if batch.service_type.is_empty() {
            debug!("Ignoring registration batch without a service type");
            return Ok(0);
        }
        let count = batch.services.len();
        let mut indices = self.indices.write().unwrap_or_else(|e| e.into_inner());
        for descriptor in batch.services {
            debug!(service = %descriptor, "Registered");
            indices.insert(descriptor);
        }
        Ok(count)
    }

    fn export(&self, service_type: Option<&str>) -> WireResult<DescriptorBatch> {
        self.ensure_live()?;
        let indices = self.indices.read().unwrap_or_else(|e| e.into_inner());
        Ok(match service_type {
            Some(t) if t != ALL_SERVICES => DescriptorBatch::new(t, indices.of_type(t)),
            _ => DescriptorBatch::new(ALL_SERVICES, indices.all()),
        })
    }

    /// Probe every descriptor, then drop the ones flagged as expired.
    async fn sweep(&self) -> WireResult<usize> {
        self.ensure_live()?;
        let snapshot = {
            let indices = self.indices.read().unwrap_or_else(|e| e.into_inner());
            indices.all()
        };

        let timeout = self.config.probe_timeout();
        let mut probes = JoinSet::new();
        for descriptor in snapshot.into_iter().filter(|d| !d.is_expired()) {
            probes.spawn(async move {
                let alive = probe_address(&descriptor.address(), timeout).await;
                (descriptor, alive)
            });
        }
        let mut results = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "Liveness probe task failed"),
            }
        }

        let mut indices = self.indices.write().unwrap_or_else(|e| e.into_inner());
        for (probed, alive) in results {
            let Some(current) = indices.by_name.get_mut(&probed.name) else {
                continue;
            };
            // Re-registered at another address while the probe was running.
            if current.host != probed.host || current.port != probed.port {
                continue;
            }
            if alive {
                current.refresh();
            } else {
                debug!(service = %current, "Service unreachable, marking expired");
                current.mark_expired();
            }
        }
        let removed = indices.remove_expired();
        for descriptor in &removed {
            info!(service = %descriptor, "Removed expired service");
        }
        Ok(removed.len())
    }
}

/// A running discovery registry.
pub struct DiscoveryRegistry {
    state: Arc<RegistryState>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    loops: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl DiscoveryRegistry {
    /// Bind the registration listener and start both background tasks.
    ///
    /// Port 0 in `listen_addr` picks an ephemeral port; see [`local_addr`](Self::local_addr).
    pub async fn start(config: RegistryConfig) -> WireResult<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen_addr).await.map_err(|e| {
            error!(addr = %config.listen_addr, error = %e, "Registry bind failed");
            WireError::Transport(e)
        })?;
        let local_addr = listener.local_addr()?;

        let state = Arc::new(RegistryState {
            indices: RwLock::new(Indices::default()),
            stale: AtomicBool::new(false),
            config,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let listener_task = tokio::spawn(listener_loop(
            listener,
            Arc::clone(&state),
            shutdown_rx.clone(),
        ));
        let sweep_task = tokio::spawn(sweep_loop(Arc::clone(&state), shutdown_rx));

        info!(addr = %local_addr, "Discovery registry started");
        Ok(Self {
            state,
            local_addr,
            shutdown_tx,
            loops: Mutex::new(Some((listener_task, sweep_task))),
        })
    }

    /// The address the registration listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.stale.load(Ordering::SeqCst)
    }

    /// Every descriptor of `service_type`, in registration order.
    pub fn lookup_by_type(&self, service_type: &str) -> WireResult<Vec<ServiceDescriptor>> {
        self.state.ensure_live()?;
        let indices = self.state.indices.read().unwrap_or_else(|e| e.into_inner());
        Ok(indices.of_type(service_type))
    }

    pub fn lookup_by_name(&self, name: &str) -> WireResult<Option<ServiceDescriptor>> {
        self.state.ensure_live()?;
        let indices = self.state.indices.read().unwrap_or_else(|e| e.into_inner());
        Ok(indices.by_name.get(name).cloned())
    }

    /// Insert or overwrite every descriptor of `batch`. Returns how many were
    /// applied; a batch without a service type is ignored.
    pub fn merge(&self, batch: DescriptorBatch) -> WireResult<usize> {
        self.state.merge(batch)
    }

    /// Snapshot of one type, or of everything under `ALL` when `service_type`
    /// is `None` or `"ALL"`.
    pub fn export(&self, service_type: Option<&str>) -> WireResult<DescriptorBatch> {
        self.state.export(service_type)
    }

    /// Number of registered descriptors.
    pub fn count(&self) -> WireResult<usize> {
        self.state.ensure_live()?;
        let indices = self.state.indices.read().unwrap_or_else(|e| e.into_inner());
        Ok(indices.by_name.len())
    }

    /// Run one liveness sweep now. Returns the number of removed descriptors.
    pub async fn sweep_now(&self) -> WireResult<usize> {
        self.state.sweep().await
    }

    /// Stop both background tasks and wait for them. Idempotent.
    ///
    /// Afterwards every lookup, merge and export fails with
    /// [`WireError::RegistryShutdown`].
    pub async fn shutdown(&self) {
        if self.state.stale.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);

        let loops = self.loops.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((listener_task, sweep_task)) = loops {
            if let Err(e) = listener_task.await {
                warn!(error = %e, "Registry listener ended abnormally");
            }
            info!(addr = %self.local_addr, "Registration listener is shut down");
            if let Err(e) = sweep_task.await {
                warn!(error = %e, "Liveness sweep ended abnormally");
            }
            info!("Liveness sweep is shut down");
        }
    }
}

impl Drop for DiscoveryRegistry {
    fn drop(&mut self) {
        self.state.stale.store(true, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);
    }
}

impl std::fmt::Display for DiscoveryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_shutdown() {
            return write!(f, "DiscoveryRegistry(addr={}, shut_down=true)", self.local_addr);
        }
        let (services, types) = {
            let indices = self.state.indices.read().unwrap_or_else(|e| e.into_inner());
            (indices.by_name.len(), indices.by_type.len())
        };
        write!(
            f,
            "DiscoveryRegistry(addr={}, services={}, types={}, shut_down=false)",
            self.local_addr, services, types
        )
    }
}

impl std::fmt::Debug for DiscoveryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

async fn listener_loop(
    listener: TcpListener,
    state: Arc<RegistryState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let accept_timeout = state.config.accept_timeout();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = tokio::time::timeout(accept_timeout, listener.accept()) => accepted,
        };
        match accepted {
            Err(_) => continue,
            Ok(Ok((stream, peer))) => {
                debug!(%peer, "Registry connection accepted");
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, &state).await {
                        warn!(%peer, error = %e, "Registry client failed");
                    }
                });
            }
            Ok(Err(e)) => {
                error!(error = %e, "Registry accept error");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!("Registry listener loop stopped");
}

/// Serve one registry client: merge its batch, or answer with the export.
async fn handle_client(mut stream: TcpStream, state: &RegistryState) -> WireResult<()> {
    let limit = state.config.max_registration_size;
    let deadline = state.config.registration_timeout();

    let mut payload = Vec::new();
    let mut limited = (&mut stream).take(limit + 1);
    tokio::time::timeout(deadline, limited.read_to_end(&mut payload))
        .await
        .map_err(|_| WireError::Timeout(deadline))??;

    if payload.len() as u64 > limit {
        return Err(WireError::Protocol(format!(
            "registration exceeds {limit} bytes"
        )));
    }

    if payload.is_empty() {
        let export = state.export(None)?;
        let bytes = codec::encode_batch(&export)?;
        stream.write_all(&bytes).await?;
        stream.shutdown().await?;
        debug!(services = export.len(), "Served registry export");
        return Ok(());
    }

    let batch = codec::decode_batch(&payload)?;
    state.merge(batch)?;
    Ok(())
}

async fn sweep_loop(state: Arc<RegistryState>, mut shutdown: watch::Receiver<bool>) {
    let interval = state.config.sweep_interval();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        // A started sweep runs to completion; shutdown is observed between sweeps.
        match state.sweep().await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Liveness sweep finished"),
            Err(_) => break,
        }
    }
    debug!("Liveness sweep loop stopped");
}
