//! Network operations on a [`ServiceDescriptor`].

use crate::builder::ConnectionBuilder;
use crate::codec;
use async_trait::async_trait;
use nanolink_types::{DescriptorBatch, ServiceDescriptor, WireError, WireResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Deadline for a registration or registry fetch round trip.
pub const REGISTRY_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a fetched registry export.
const MAX_EXPORT_SIZE: u64 = 16 * 1024 * 1024;

/// What a process can do with the descriptor of a service.
#[async_trait]
pub trait ServiceEndpoint {
    /// Bind a listener on the descriptor's host and port.
    async fn listen(&self) -> WireResult<TcpListener>;

    /// Open a raw TCP stream to the service.
    async fn dial_tcp(&self) -> WireResult<TcpStream>;

    /// True when a TCP connect succeeds within `timeout`. The probe
    /// connection is closed immediately.
    async fn probe(&self, timeout: Duration) -> bool;

    /// Advertise this descriptor to the registry at `registry_addr`.
    ///
    /// Returns once the registry has ingested the registration and closed
    /// its side of the connection.
    async fn register_with(&self, registry_addr: &str) -> WireResult<()>;

    /// Start building a secure connection to the service.
    fn connect<M>(&self) -> ConnectionBuilder<M>
    where
        M: Serialize + DeserializeOwned + Send + 'static;
}

#[async_trait]
impl ServiceEndpoint for ServiceDescriptor {
    async fn listen(&self) -> WireResult<TcpListener> {
        let listener = TcpListener::bind(self.address()).await?;
        info!(service = %self.name, addr = %self.address(), "Service listening");
        Ok(listener)
    }

    async fn dial_tcp(&self) -> WireResult<TcpStream> {
        Ok(TcpStream::connect(self.address()).await?)
    }

    async fn probe(&self, timeout: Duration) -> bool {
        probe_address(&self.address(), timeout).await
    }

    async fn register_with(&self, registry_addr: &str) -> WireResult<()> {
        let payload = codec::encode_batch(&DescriptorBatch::single(self.clone()))?;
        let exchange = async {
            let mut stream = TcpStream::connect(registry_addr).await?;
            stream.write_all(&payload).await?;
            stream.shutdown().await?;
            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).await?;
            Ok::<_, WireError>(())
        };
        tokio::time::timeout(REGISTRY_TIMEOUT, exchange)
            .await
            .map_err(|_| WireError::Timeout(REGISTRY_TIMEOUT))??;

        info!(service = %self, registry = registry_addr, "Registered service");
        Ok(())
    }

    fn connect<M>(&self) -> ConnectionBuilder<M>
    where
        M: Serialize + DeserializeOwned + Send + 'static,
    {
        ConnectionBuilder::new(self.clone())
    }
}

/// Connect-and-close liveness check.
pub(crate) async fn probe_address(address: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!(%address, error = %e, "Probe failed");
            false
        }
        Err(_) => {
            debug!(%address, "Probe timed out");
            false
        }
    }
}

/// Download the full export of the registry at `registry_addr`.
///
/// Sends an empty registration, which the registry answers with every
/// descriptor it holds under the `ALL` type.
pub async fn fetch_registry(registry_addr: &str) -> WireResult<DescriptorBatch> {
    let exchange = async {
        let mut stream = TcpStream::connect(registry_addr).await?;
        stream.shutdown().await?;
        let mut payload = Vec::new();
        (&mut stream)
            .take(MAX_EXPORT_SIZE + 1)
            .read_to_end(&mut payload)
            .await?;
        Ok::<_, WireError>(payload)
    };
    let payload = tokio::time::timeout(REGISTRY_TIMEOUT, exchange)
        .await
        .map_err(|_| WireError::Timeout(REGISTRY_TIMEOUT))??;

    if payload.len() as u64 > MAX_EXPORT_SIZE {
        return Err(WireError::Protocol(format!(
            "registry export exceeds {MAX_EXPORT_SIZE} bytes"
        )));
    }
    if payload.is_empty() {
        return Err(WireError::Protocol("registry sent an empty export".into()));
    }
    codec::decode_batch(&payload)
}
