//! Fluent assembly of a [`SecureConnection`].

use crate::codec::FrameCodec;
use crate::connection::{ConnectionSettings, SecureConnection};
use crate::keys::{SessionKeys, WireKey};
use nanolink_types::{ServiceDescriptor, TransportConfig, WireError, WireResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tokio::net::TcpStream;
use tracing::{info, warn};

/// Collects connection parameters, validates them and dials the service.
///
/// ```no_run
/// # async fn demo() -> nanolink_wire::WireResult<()> {
/// use nanolink_wire::{ServiceDescriptor, ServiceEndpoint, SessionKeys};
///
/// let chat = ServiceDescriptor::new("chat-1", "Chat", "127.0.0.1", 6000);
/// let conn = chat
///     .connect::<String>()
///     .keys(SessionKeys::generate())
///     .send_buffer(16)
///     .write_deadline(true)
///     .build()
///     .await?;
/// conn.send("hi".to_string()).await?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionBuilder<M> {
    service: ServiceDescriptor,
    encrypt_key: Option<WireKey>,
    auth_key: Option<WireKey>,
    send_buffer: usize,
    receive_buffer: usize,
    write_deadline: bool,
    transport: TransportConfig,
    _message: PhantomData<fn() -> M>,
}

impl<M> ConnectionBuilder<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    /// Plaintext, unbuffered, no write deadline, default transport settings.
    pub fn new(service: ServiceDescriptor) -> Self {
        Self {
            service,
            encrypt_key: None,
            auth_key: None,
            send_buffer: 0,
            receive_buffer: 0,
            write_deadline: false,
            transport: TransportConfig::default(),
            _message: PhantomData,
        }
    }

    /// Set both keys at once.
    pub fn keys(mut self, keys: SessionKeys) -> Self {
        self.encrypt_key = Some(keys.encrypt.clone());
        self.auth_key = Some(keys.auth.clone());
        self
    }

    pub fn encryption_key(mut self, key: WireKey) -> Self {
        self.encrypt_key = Some(key);
        self
    }

    pub fn auth_key(mut self, key: WireKey) -> Self {
        self.auth_key = Some(key);
        self
    }

    pub fn send_buffer(mut self, depth: usize) -> Self {
        self.send_buffer = depth;
        self
    }

    pub fn receive_buffer(mut self, depth: usize) -> Self {
        self.receive_buffer = depth;
        self
    }

    /// Bound every frame write by the transport's write timeout.
    pub fn write_deadline(mut self, enabled: bool) -> Self {
        self.write_deadline = enabled;
        self
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Check the collected options without touching the network.
    pub fn settings(&self) -> WireResult<ConnectionSettings> {
        let keys = match (&self.encrypt_key, &self.auth_key) {
            (Some(encrypt), Some(auth)) => Some(SessionKeys::new(encrypt.clone(), auth.clone())),
            (None, None) => None,
            _ => {
                return Err(WireError::Configuration(
                    "encryption and authentication keys must be set together".into(),
                ))
            }
        };
        self.transport.validate()?;

        Ok(ConnectionSettings {
            codec: FrameCodec::from_config(&self.transport)?,
            keys,
            send_buffer: self.send_buffer,
            receive_buffer: self.receive_buffer,
            read_poll: self.transport.read_poll(),
            frame_timeout: self.transport.frame_timeout(),
            write_deadline: self
                .write_deadline
                .then(|| self.transport.write_timeout()),
        })
    }

    /// Validate, dial the service and start the connection loops.
    ///
    /// Failure yields only the error. Use [`build_or_closed`](Self::build_or_closed)
    /// when a handle is wanted either way.
    pub async fn build(self) -> WireResult<SecureConnection<M>> {
        let settings = self.settings()?;
        let address = self.service.address();
        let dial_timeout = self.transport.frame_timeout();

        let stream = match tokio::time::timeout(dial_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(service = %self.service.name, %address, error = %e, "Dial failed");
                return Err(WireError::Transport(e));
            }
            Err(_) => {
                warn!(service = %self.service.name, %address, "Dial timed out");
                return Err(WireError::Timeout(dial_timeout));
            }
        };
        stream.set_nodelay(true)?;

        info!(service = %self.service.name, %address, "Dialed service");
        Ok(SecureConnection::start(
            self.service.name.clone(),
            stream,
            settings,
        ))
    }

    /// Like [`build`](Self::build), but always returns a handle: on failure it
    /// is already closed and the error comes alongside it.
    pub async fn build_or_closed(self) -> (SecureConnection<M>, Option<WireError>) {
        let name = self.service.name.clone();
        match self.build().await {
            Ok(conn) => (conn, None),
            Err(e) => (SecureConnection::closed(name), Some(e)),
        }
    }
}
