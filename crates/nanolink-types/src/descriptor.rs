//! Service descriptors: identity, location and health of one advertised process.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Grouping type used for a registry's full export.
pub const ALL_SERVICES: &str = "ALL";

/// An advertised service endpoint.
///
/// `(service_type, name)` is the identity within a registry; equality compares
/// every field, including the liveness epoch and the expired flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Unique key within a type (and within a registry's name index).
    pub name: String,
    /// Grouping key.
    pub service_type: String,
    /// Host name or IP the service listens on.
    pub host: String,
    /// TCP port the service listens on.
    pub port: u16,
    /// Liveness epoch, unix seconds. Reset by [`refresh`](Self::refresh).
    pub start_time: i64,
    /// Marks the descriptor for removal at the next registry sweep.
    #[serde(default)]
    pub expired: bool,
}

impl ServiceDescriptor {
    /// Create a live descriptor whose epoch is now.
    pub fn new(
        name: impl Into<String>,
        service_type: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
            host: host.into(),
            port,
            start_time: Utc::now().timestamp(),
            expired: false,
        }
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reset the liveness epoch to now.
    pub fn refresh(&mut self) {
        self.start_time = Utc::now().timestamp();
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// Flag the descriptor so the next sweep removes it.
    pub fn mark_expired(&mut self) {
        self.expired = true;
    }
}

impl std::fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} @ {}:{}{}",
            self.service_type,
            self.name,
            self.host,
            self.port,
            if self.expired { " (expired)" } else { "" }
        )
    }
}

/// A batch of descriptors under one grouping type.
///
/// This is the unit of registration and of registry export. Registration
/// batches name the type of the descriptors they carry; exports of the whole
/// registry use [`ALL_SERVICES`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DescriptorBatch {
    pub service_type: String,
    pub services: Vec<ServiceDescriptor>,
}

impl DescriptorBatch {
    pub fn new(service_type: impl Into<String>, services: Vec<ServiceDescriptor>) -> Self {
        Self {
            service_type: service_type.into(),
            services,
        }
    }

    /// A batch carrying exactly one descriptor, typed by that descriptor.
    pub fn single(descriptor: ServiceDescriptor) -> Self {
        Self {
            service_type: descriptor.service_type.clone(),
            services: vec![descriptor],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }
}
