//! The cluster entry point.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use url::Url;

use couchbase_core::protocol::Opcode;
use couchbase_core::{CouchbaseError, OperationFrame, Result};

use crate::bucket::Bucket;
use crate::cluster::{ClusterMap, Node, NodeFactory};
use crate::config::ClientConfig;
use crate::connection::{ConnectionPool, KvConnection};
use crate::http::HttpDispatcher;
use crate::io::{FailureWindow, IoService, MultiplexedIoService, PooledIoService};
use crate::provider::parser::NodeInfo;
use crate::provider::ConfigProvider;
use crate::runtime::{Runtime, TokioRuntime};

/// Default data port for bootstrap when none is negotiated yet.
const BOOTSTRAP_KV_PORT: u16 = 11210;
/// Default TLS data port for bootstrap.
const BOOTSTRAP_KV_TLS_PORT: u16 = 11207;

/// Which source produced the bootstrap topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootstrapSource {
    /// Carrier publication over the data channel.
    Carrier,
    /// Terse config from the management endpoint.
    Http,
}

/// Creates data-path nodes wired to the configured IO service mode.
struct KvNodeFactory {
    config: Arc<ClientConfig>,
    bucket: String,
}

impl NodeFactory for KvNodeFactory {
    fn create(&self, info: &NodeInfo, revision: u64) -> Arc<Node> {
        let io: Arc<dyn IoService> = if self.config.use_connection_pooling() {
            let pool = ConnectionPool::new(
                info.endpoint.clone(),
                self.bucket.clone(),
                Arc::clone(&self.config),
            );
            if let Ok(handle) = Handle::try_current() {
                let pool = Arc::clone(&pool);
                handle.spawn(async move { pool.initialize().await });
            }
            Arc::new(PooledIoService::new(pool))
        } else {
            Arc::new(MultiplexedIoService::new(
                info.endpoint.clone(),
                self.bucket.clone(),
                Arc::clone(&self.config),
            ))
        };

        Node::new(
            info.endpoint.clone(),
            info.services.clone(),
            info.capabilities,
            revision,
            FailureWindow::new(
                self.config.io_error_threshold(),
                self.config.io_error_check_interval(),
            ),
            io,
        )
    }
}

/// A connected Couchbase cluster.
///
/// The cluster is cheap state: configuration, the shared HTTP client and the
/// shutdown signal. Each opened bucket bootstraps its own topology and runs
/// its own reconfiguration loop.
pub struct Cluster {
    config: Arc<ClientConfig>,
    http: reqwest::Client,
    runtime: TokioRuntime,
    shutdown: watch::Sender<bool>,
    maps: Mutex<Vec<Arc<ClusterMap>>>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("servers", &self.config.servers().len())
            .field("buckets_open", &self.maps.lock().len())
            .finish()
    }
}

impl Cluster {
    /// Creates a cluster handle from the configuration.
    ///
    /// No connections are made until a bucket is opened.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = HttpDispatcher::build_client(&config)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            http,
            runtime: TokioRuntime,
            shutdown,
            maps: Mutex::new(Vec::new()),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Opens a bucket: bootstraps its topology and starts its
    /// reconfiguration loop.
    #[tracing::instrument(name = "cluster.open_bucket", skip(self))]
    pub async fn open_bucket(&self, name: &str) -> Result<Bucket> {
        if *self.shutdown.borrow() {
            return Err(CouchbaseError::Shutdown);
        }

        let map = Arc::new(ClusterMap::new());
        let factory: Arc<dyn NodeFactory> = Arc::new(KvNodeFactory {
            config: Arc::clone(&self.config),
            bucket: name.to_string(),
        });
        let provider = ConfigProvider::new(
            Arc::clone(&map),
            factory,
            Arc::clone(&self.config),
            name,
            self.http.clone(),
        );

        let source = self.bootstrap(&provider, name).await?;
        tracing::info!(
            bucket = name,
            source = ?source,
            revision = map.current().revision(),
            nodes = map.current().nodes().len(),
            "bucket opened"
        );

        match source {
            BootstrapSource::Carrier => {
                self.runtime
                    .spawn(Arc::clone(&provider).run_poller(self.shutdown.subscribe()));
            }
            BootstrapSource::Http => {
                // nodes that never answered CCCP keep the streaming feed;
                // the poller would only duplicate it
                for server in self.config.servers() {
                    self.runtime.spawn(
                        Arc::clone(&provider)
                            .run_stream(server.clone(), self.shutdown.subscribe()),
                    );
                    break;
                }
            }
        }

        self.maps.lock().push(Arc::clone(&map));

        let dispatcher = Arc::new(HttpDispatcher::new(
            Arc::clone(&map),
            Arc::clone(&self.config),
            self.http.clone(),
        ));
        Ok(Bucket::new(name, map, provider, dispatcher, Arc::clone(&self.config)))
    }

    /// Stops the background loops and disposes every node.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);

        let maps: Vec<Arc<ClusterMap>> = self.maps.lock().drain(..).collect();
        for map in maps {
            for node in map.current().nodes() {
                node.dispose().await;
            }
        }
        tracing::info!("cluster shut down");
    }

    /// Tries each bootstrap server with carrier publication first, then the
    /// management endpoint.
    async fn bootstrap(
        &self,
        provider: &Arc<ConfigProvider>,
        bucket: &str,
    ) -> Result<BootstrapSource> {
        let mut last_error = None;

        for server in self.config.servers() {
            match self.bootstrap_carrier(server, provider, bucket).await {
                Ok(()) => return Ok(BootstrapSource::Carrier),
                Err(e) => {
                    tracing::debug!(server = %server, error = %e, "carrier bootstrap failed");
                    last_error = Some(e);
                }
            }

            match provider.fetch_http_once(server).await {
                Ok(_) => return Ok(BootstrapSource::Http),
                Err(e) => {
                    tracing::debug!(server = %server, error = %e, "HTTP bootstrap failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            CouchbaseError::Configuration("no bootstrap servers configured".to_string())
        }))
    }

    async fn bootstrap_carrier(
        &self,
        server: &Url,
        provider: &Arc<ConfigProvider>,
        bucket: &str,
    ) -> Result<()> {
        let host = server
            .host_str()
            .ok_or_else(|| CouchbaseError::Configuration(format!("{} has no host", server)))?;
        // couchbase:// URIs address the data port directly; management URIs
        // imply the well-known data port
        let default_port = if self.config.use_ssl() {
            BOOTSTRAP_KV_TLS_PORT
        } else {
            BOOTSTRAP_KV_PORT
        };
        let port = match server.scheme() {
            "couchbase" | "couchbases" => server.port().unwrap_or(default_port),
            _ => default_port,
        };
        let endpoint = crate::cluster::NodeEndpoint::new(host, port);

        let mut conn = KvConnection::connect(&endpoint, &self.config).await?;
        conn.initialize(bucket, &self.config).await?;

        let response = conn
            .roundtrip(OperationFrame::request(Opcode::GetClusterConfig, 0))
            .await?;
        if !response.status().is_success() {
            return Err(CouchbaseError::from_status(
                response.status(),
                "bootstrap GetClusterConfig rejected",
            ));
        }

        let raw = std::str::from_utf8(&response.value).map_err(|e| {
            CouchbaseError::Protocol(format!("bootstrap topology is not UTF-8: {}", e))
        })?;
        provider.apply_raw(raw, host)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_new_makes_no_connections() {
        let cluster = Cluster::new(ClientConfig::builder().build().unwrap()).unwrap();
        assert_eq!(cluster.maps.lock().len(), 0);
    }

    #[tokio::test]
    async fn test_open_bucket_fails_without_servers() {
        let config = ClientConfig::builder()
            .add_server(Url::parse("http://127.0.0.1:1").unwrap())
            .build()
            .unwrap();
        let cluster = Cluster::new(config).unwrap();
        assert!(cluster.open_bucket("default").await.is_err());
    }

    #[tokio::test]
    async fn test_open_bucket_after_shutdown() {
        let cluster = Cluster::new(ClientConfig::builder().build().unwrap()).unwrap();
        cluster.shutdown().await;
        assert!(matches!(
            cluster.open_bucket("default").await.unwrap_err(),
            CouchbaseError::Shutdown
        ));
    }
}
