//! Topology sources and reconfiguration driving.
//!
//! The provider keeps the cluster map fresh from three sources, in priority
//! order: carrier publication (`GetClusterConfig` on a data connection),
//! HTTP streaming from the management endpoint, and periodic carrier polls.
//! Every raw document funnels through [`ConfigProvider::apply_raw`], which
//! normalizes it and installs it exactly when its revision is fresher than
//! the current view's.

pub mod parser;

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use url::Url;

use couchbase_core::protocol::Opcode;
use couchbase_core::{CouchbaseError, OperationFrame, Result};

use crate::cluster::{ClusterMap, NodeFactory};
use crate::config::ClientConfig;

/// Pause before reconnecting a broken streaming feed.
const STREAM_RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// Drives reconfiguration of a bucket's cluster map.
pub struct ConfigProvider {
    map: Arc<ClusterMap>,
    factory: Arc<dyn NodeFactory>,
    config: Arc<ClientConfig>,
    bucket: String,
    http: reqwest::Client,
    last_poll: Mutex<Option<Instant>>,
    refresh: Notify,
}

impl std::fmt::Debug for ConfigProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigProvider")
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl ConfigProvider {
    /// Creates a provider for one bucket.
    pub fn new(
        map: Arc<ClusterMap>,
        factory: Arc<dyn NodeFactory>,
        config: Arc<ClientConfig>,
        bucket: impl Into<String>,
        http: reqwest::Client,
    ) -> Arc<Self> {
        Arc::new(Self {
            map,
            factory,
            config,
            bucket: bucket.into(),
            http,
            last_poll: Mutex::new(None),
            refresh: Notify::new(),
        })
    }

    /// Returns the bucket this provider maintains.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Returns the cluster map this provider drives.
    pub fn map(&self) -> &Arc<ClusterMap> {
        &self.map
    }

    /// Normalizes a raw topology document and installs it if fresher.
    ///
    /// `origin_host` rewrites the `$HOST` placeholder carried by documents
    /// published over the data channel.
    pub fn apply_raw(&self, raw: &str, origin_host: &str) -> Result<bool> {
        let doc = parser::parse_topology(raw, origin_host, self.config.use_ssl())?;
        let installed = self.map.install(&doc, self.factory.as_ref())?;
        if installed {
            tracing::debug!(
                bucket = %self.bucket,
                revision = doc.revision,
                "applied topology document"
            );
        }
        Ok(installed)
    }

    /// Asks the poller to refresh ahead of schedule.
    ///
    /// Used after stale-partition responses that carried no document. The
    /// request is coalesced and floored so refresh storms collapse into one
    /// poll per floor interval.
    pub fn trigger_refresh(&self) {
        self.refresh.notify_one();
    }

    /// Fetches the topology once over the data channel.
    #[tracing::instrument(name = "provider.poll_cccp", skip(self), fields(bucket = %self.bucket))]
    pub async fn poll_cccp_once(&self) -> Result<bool> {
        let view = self.map.current();
        let node = view.random_data_node().ok_or(CouchbaseError::NoAvailableNode)?;

        let frame = OperationFrame::request(Opcode::GetClusterConfig, 0);
        let deadline = Instant::now() + self.config.operation_lifespan();
        let response = node.io().execute(frame, deadline).await?;

        if !response.status().is_success() {
            return Err(CouchbaseError::from_status(
                response.status(),
                "GetClusterConfig rejected",
            ));
        }

        let raw = std::str::from_utf8(&response.value).map_err(|e| {
            CouchbaseError::Protocol(format!("topology document is not UTF-8: {}", e))
        })?;
        self.apply_raw(raw, node.endpoint().host())
    }

    /// Fetches the terse bucket config once from a management endpoint.
    pub async fn fetch_http_once(&self, base: &Url) -> Result<bool> {
        let host = base
            .host_str()
            .ok_or_else(|| CouchbaseError::Configuration(format!("{} has no host", base)))?
            .to_string();
        let url = join_path(base, &format!("/pools/default/b/{}", self.bucket))?;

        let response = self
            .with_auth(self.http.get(url))
            .send()
            .await
            .map_err(|e| CouchbaseError::Http(format!("bucket config fetch: {}", e)))?;

        if !response.status().is_success() {
            return Err(CouchbaseError::Http(format!(
                "bucket config fetch returned {}",
                response.status()
            )));
        }

        let raw = response
            .text()
            .await
            .map_err(|e| CouchbaseError::Http(format!("bucket config body: {}", e)))?;
        self.apply_raw(&raw, &host)
    }

    /// Runs the periodic carrier poll until shutdown.
    ///
    /// The cadence is `config_poll_interval`, floored by
    /// `config_poll_check_floor`; explicit refresh requests wake the loop
    /// early but still respect the floor. Carrier failures fall back to an
    /// HTTP fetch against the bootstrap servers.
    pub async fn run_poller(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.config_poll_enabled() {
            tracing::debug!(bucket = %self.bucket, "topology polling disabled");
            return;
        }

        let interval = self
            .config
            .config_poll_interval()
            .max(self.config.config_poll_check_floor());

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.refresh.notified() => {
                    if let Some(wait) = self.floor_wait() {
                        tokio::time::sleep(wait).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::debug!(bucket = %self.bucket, "poller stopping");
                        return;
                    }
                }
            }

            *self.last_poll.lock() = Some(Instant::now());

            match self.poll_cccp_once().await {
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(bucket = %self.bucket, error = %e, "carrier poll failed");
                    self.http_fallback().await;
                }
            }
        }
    }

    /// Streams topology documents from a management endpoint until shutdown.
    ///
    /// The feed is line-delimited JSON over a long-lived response; a broken
    /// feed reconnects after a short pause.
    pub async fn run_stream(self: Arc<Self>, base: Url, mut shutdown: watch::Receiver<bool>) {
        let host = match base.host_str() {
            Some(host) => host.to_string(),
            None => {
                tracing::error!(uri = %base, "streaming endpoint has no host");
                return;
            }
        };

        loop {
            if *shutdown.borrow() {
                return;
            }

            let url = match join_path(&base, &format!("/pools/default/bs/{}", self.bucket)) {
                Ok(url) => url,
                Err(e) => {
                    tracing::error!(error = %e, "cannot build streaming URI");
                    return;
                }
            };

            match self.with_auth(self.http.get(url)).send().await {
                Ok(response) if response.status().is_success() => {
                    let mut body = response.bytes_stream();
                    let mut buffer = Vec::new();

                    loop {
                        tokio::select! {
                            chunk = body.next() => match chunk {
                                Some(Ok(bytes)) => {
                                    buffer.extend_from_slice(&bytes);
                                    self.drain_lines(&mut buffer, &host);
                                }
                                Some(Err(e)) => {
                                    tracing::warn!(error = %e, "streaming feed broke");
                                    break;
                                }
                                None => break,
                            },
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    return;
                                }
                            }
                        }
                    }
                }
                Ok(response) => {
                    tracing::warn!(status = %response.status(), "streaming feed rejected");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "streaming feed connect failed");
                }
            }

            tokio::time::sleep(STREAM_RECONNECT_DELAY).await;
        }
    }

    fn drain_lines(&self, buffer: &mut Vec<u8>, origin_host: &str) {
        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Err(e) = self.apply_raw(line, origin_host) {
                tracing::warn!(error = %e, "discarding bad streamed topology");
            }
        }
    }

    fn floor_wait(&self) -> Option<std::time::Duration> {
        let floor = self.config.config_poll_check_floor();
        let last = (*self.last_poll.lock())?;
        let elapsed = last.elapsed();
        if elapsed < floor {
            Some(floor - elapsed)
        } else {
            None
        }
    }

    async fn http_fallback(&self) {
        for server in self.config.servers() {
            match self.fetch_http_once(server).await {
                Ok(_) => return,
                Err(e) => {
                    tracing::debug!(server = %server, error = %e, "HTTP topology fallback failed");
                }
            }
        }
    }

    fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(username) = self.config.username() {
            request.basic_auth(username, self.config.password())
        } else {
            let password = self.config.bucket_password(&self.bucket);
            request.basic_auth(&self.bucket, password)
        }
    }
}

fn join_path(base: &Url, path: &str) -> Result<Url> {
    let raw = format!("{}{}", base.as_str().trim_end_matches('/'), path);
    Url::parse(&raw).map_err(|e| CouchbaseError::Configuration(format!("bad URI {}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Node, NodeFactory};
    use crate::io::testing::NullIoService;
    use crate::io::FailureWindow;
    use std::time::Duration;

    struct TestFactory;

    impl NodeFactory for TestFactory {
        fn create(&self, info: &parser::NodeInfo, revision: u64) -> Arc<Node> {
            Node::new(
                info.endpoint.clone(),
                info.services.clone(),
                info.capabilities,
                revision,
                FailureWindow::new(10, Duration::from_millis(500)),
                Arc::new(NullIoService),
            )
        }
    }

    fn provider() -> Arc<ConfigProvider> {
        ConfigProvider::new(
            Arc::new(ClusterMap::new()),
            Arc::new(TestFactory),
            Arc::new(ClientConfig::builder().build().unwrap()),
            "default",
            reqwest::Client::new(),
        )
    }

    fn raw_doc(rev: u64) -> String {
        format!(
            r#"{{
                "rev": {},
                "name": "default",
                "nodesExt": [{{"hostname": "$HOST", "services": {{"kv": 11210, "mgmt": 8091}}}}],
                "vBucketServerMap": {{
                    "hashAlgorithm": "CRC",
                    "numReplicas": 0,
                    "serverList": ["$HOST:11210"],
                    "vBucketMap": [[0], [0], [0], [0]]
                }}
            }}"#,
            rev
        )
    }

    #[test]
    fn test_apply_installs_fresher_revision() {
        let provider = provider();
        assert!(provider.apply_raw(&raw_doc(5), "127.0.0.1").unwrap());
        assert_eq!(provider.map().current().revision(), 5);

        assert!(!provider.apply_raw(&raw_doc(5), "127.0.0.1").unwrap());
        assert!(!provider.apply_raw(&raw_doc(4), "127.0.0.1").unwrap());
        assert!(provider.apply_raw(&raw_doc(6), "127.0.0.1").unwrap());
        assert_eq!(provider.map().current().revision(), 6);
    }

    #[test]
    fn test_apply_rewrites_host_placeholder() {
        let provider = provider();
        provider.apply_raw(&raw_doc(1), "10.9.9.9").unwrap();
        let view = provider.map().current();
        assert_eq!(view.nodes()[0].endpoint().host(), "10.9.9.9");
    }

    #[test]
    fn test_apply_rejects_garbage() {
        let provider = provider();
        assert!(provider.apply_raw("{broken", "h").is_err());
    }

    #[tokio::test]
    async fn test_poll_without_nodes_fails() {
        let provider = provider();
        let err = provider.poll_cccp_once().await.unwrap_err();
        assert!(matches!(err, CouchbaseError::NoAvailableNode));
    }

    #[test]
    fn test_join_path() {
        let base = Url::parse("http://10.0.0.1:8091").unwrap();
        let joined = join_path(&base, "/pools/default/b/default").unwrap();
        assert_eq!(
            joined.as_str(),
            "http://10.0.0.1:8091/pools/default/b/default"
        );
    }
}
