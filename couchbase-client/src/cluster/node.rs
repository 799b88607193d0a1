//! Cluster nodes and their service surface.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::io::{FailureWindow, IoService};

/// A node's data endpoint: host plus data port.
///
/// The endpoint is immutable for the lifetime of a node and is the identity
/// under which nodes are reused across reconfigurations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeEndpoint {
    host: String,
    port: u16,
}

impl NodeEndpoint {
    /// Creates an endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns the host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the data port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for NodeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The plain and TLS ports a node exposes per service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServicePorts {
    /// Data service port.
    pub kv: Option<u16>,
    /// Data service TLS port.
    pub kv_tls: Option<u16>,
    /// Management port.
    pub mgmt: Option<u16>,
    /// Management TLS port.
    pub mgmt_tls: Option<u16>,
    /// View engine port.
    pub views: Option<u16>,
    /// View engine TLS port.
    pub views_tls: Option<u16>,
    /// N1QL query port.
    pub query: Option<u16>,
    /// N1QL query TLS port.
    pub query_tls: Option<u16>,
    /// Full-text search port.
    pub search: Option<u16>,
    /// Full-text search TLS port.
    pub search_tls: Option<u16>,
    /// Analytics port.
    pub analytics: Option<u16>,
    /// Analytics TLS port.
    pub analytics_tls: Option<u16>,
}

/// Which services a node participates in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCapabilities {
    /// Serves the key/value data path.
    pub data: bool,
    /// Serves view queries.
    pub views: bool,
    /// Serves N1QL queries.
    pub query: bool,
    /// Serves the index service.
    pub index: bool,
    /// Serves full-text search.
    pub search: bool,
    /// Serves analytics queries.
    pub analytics: bool,
    /// Serves the management API.
    pub mgmt: bool,
}

/// One cluster node with its attached IO service.
///
/// The cluster view is the sole strong owner of nodes; operation handles
/// keep a node alive only while they are in flight against it, and the last
/// holder dropping triggers teardown of the node's connections.
pub struct Node {
    endpoint: NodeEndpoint,
    services: ServicePorts,
    capabilities: NodeCapabilities,
    revision: AtomicU64,
    down: AtomicBool,
    failures: FailureWindow,
    io: Arc<dyn IoService>,
}

impl Node {
    /// Creates a node around an IO service.
    pub fn new(
        endpoint: NodeEndpoint,
        services: ServicePorts,
        capabilities: NodeCapabilities,
        revision: u64,
        failures: FailureWindow,
        io: Arc<dyn IoService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            services,
            capabilities,
            revision: AtomicU64::new(revision),
            down: AtomicBool::new(false),
            failures,
            io,
        })
    }

    /// Returns the node's data endpoint.
    pub fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }

    /// Returns the node's service ports.
    pub fn services(&self) -> &ServicePorts {
        &self.services
    }

    /// Returns the node's capability bits.
    pub fn capabilities(&self) -> NodeCapabilities {
        self.capabilities
    }

    /// Returns the topology revision this node was last confirmed in.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Records the topology revision the node was confirmed in.
    pub fn set_revision(&self, revision: u64) {
        self.revision.store(revision, Ordering::Release);
    }

    /// Returns the node's IO service.
    pub fn io(&self) -> &Arc<dyn IoService> {
        &self.io
    }

    /// Returns `true` if the node is quarantined.
    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }

    /// Quarantines the node.
    pub fn mark_down(&self) {
        if !self.down.swap(true, Ordering::AcqRel) {
            tracing::warn!(endpoint = %self.endpoint, "node quarantined");
        }
    }

    /// Clears the quarantine flag.
    pub fn mark_up(&self) {
        if self.down.swap(false, Ordering::AcqRel) {
            self.failures.reset();
            tracing::info!(endpoint = %self.endpoint, "node recovered");
        }
    }

    /// Counts a transport error against the rolling window.
    ///
    /// Returns `true` if the window threshold was breached; the node is
    /// quarantined in that case.
    pub fn record_io_failure(&self) -> bool {
        let breached = self.failures.record();
        if breached {
            self.mark_down();
        }
        breached
    }

    /// Resets the failure window after a successful round trip.
    pub fn record_io_success(&self) {
        self.failures.reset();
    }

    /// Tears down the node's connections.
    ///
    /// Called from the disposal queue after the node left the topology.
    pub async fn dispose(&self) {
        tracing::debug!(endpoint = %self.endpoint, "disposing node");
        self.io.dispose().await;
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("endpoint", &self.endpoint)
            .field("capabilities", &self.capabilities)
            .field("revision", &self.revision())
            .field("down", &self.is_down())
            .finish()
    }
}
