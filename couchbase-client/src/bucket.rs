//! The bucket facade: key/value operations with routing and retries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use couchbase_core::protocol::Opcode;
use couchbase_core::{
    CouchbaseError, DefaultTranscoder, OperationFrame, PayloadValue, ResponseStatus, Result,
    Transcoder,
};

use crate::cluster::{spawn_liveness_probe, ClusterMap, ClusterView, Node, ServiceKind};
use crate::config::ClientConfig;
use crate::http::{HttpDispatcher, HttpRequest, ViewQuery};
use crate::keymap::MappedKey;
use crate::ops::{self, LookupInSpec, MutateInSpec};
use crate::provider::ConfigProvider;

/// Cap on the exponential backoff doubling.
const MAX_BACKOFF_SHIFT: u32 = 8;

/// The outcome of one key/value operation.
///
/// Results carry the server status and CAS even on failure where the server
/// supplied them; transport, auth and client failures carry the error
/// instead.
#[derive(Debug, Clone)]
pub struct OperationResult {
    /// `true` when the server answered with success.
    pub success: bool,
    /// The server status, absent when no response was received.
    pub status: Option<ResponseStatus>,
    /// The CAS token, zero when the server supplied none.
    pub cas: u64,
    /// The response payload, present on successful fetches.
    pub value: Option<Bytes>,
    /// The payload flags word from the response extras.
    pub flags: u32,
    /// The failure, for operations that never got a server answer or were
    /// rejected outright.
    pub error: Option<CouchbaseError>,
    /// Diagnostic message; empty on success.
    pub message: String,
    /// The node the final attempt was dispatched to.
    pub endpoint: Option<String>,
    /// Wall time from submit to completion.
    pub elapsed: Duration,
}

impl OperationResult {
    fn from_frame(frame: OperationFrame, endpoint: String, started: Instant) -> Self {
        let status = frame.status();
        let success = status.is_success();

        let flags = if frame.extras.len() >= 4 {
            u32::from_be_bytes([frame.extras[0], frame.extras[1], frame.extras[2], frame.extras[3]])
        } else {
            0
        };

        let message = if success {
            String::new()
        } else if frame.value.is_empty() {
            status.to_string()
        } else {
            format!("{}: {}", status, String::from_utf8_lossy(&frame.value))
        };

        Self {
            success,
            status: Some(status),
            cas: frame.cas,
            value: if success && !frame.value.is_empty() {
                Some(frame.value)
            } else {
                None
            },
            flags,
            error: if success {
                None
            } else {
                Some(CouchbaseError::from_status(status, message.clone()))
            },
            message,
            endpoint: Some(endpoint),
            elapsed: started.elapsed(),
        }
    }

    fn from_error(error: CouchbaseError, endpoint: Option<String>, started: Instant) -> Self {
        Self {
            success: false,
            status: error.server_status(),
            cas: 0,
            value: None,
            flags: 0,
            message: error.to_string(),
            error: Some(error),
            endpoint,
            elapsed: started.elapsed(),
        }
    }

    /// Decodes the payload through the default transcoder.
    pub fn payload(&self) -> Result<Option<PayloadValue>> {
        match &self.value {
            Some(value) => DefaultTranscoder.decode(self.flags, value).map(Some),
            None => Ok(None),
        }
    }

    /// Reads an arithmetic response's counter value.
    pub fn counter_value(&self) -> Option<u64> {
        let value = self.value.as_ref()?;
        let raw: [u8; 8] = value.as_ref().try_into().ok()?;
        Some(u64::from_be_bytes(raw))
    }
}

/// A bucket's data path.
///
/// Operations map the key to a partition, resolve the responsible node from
/// the current cluster view and dispatch to that node's IO service. Stale
/// routing (`NotMyVbucket`), busy and temporary-failure responses retry with
/// exponential backoff inside the operation's deadline; a topology document
/// piggybacked on a stale-routing response is installed before the retry.
#[derive(Debug)]
pub struct Bucket {
    name: String,
    map: Arc<ClusterMap>,
    provider: Arc<ConfigProvider>,
    dispatcher: Arc<HttpDispatcher>,
    config: Arc<ClientConfig>,
}

impl Bucket {
    pub(crate) fn new(
        name: impl Into<String>,
        map: Arc<ClusterMap>,
        provider: Arc<ConfigProvider>,
        dispatcher: Arc<HttpDispatcher>,
        config: Arc<ClientConfig>,
    ) -> Self {
        Self {
            name: name.into(),
            map,
            provider,
            dispatcher,
            config,
        }
    }

    /// Returns the bucket name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the shared cluster map.
    pub fn cluster_map(&self) -> &Arc<ClusterMap> {
        &self.map
    }

    /// Fetches a document.
    pub async fn get(&self, key: &str) -> OperationResult {
        self.dispatch(key.as_bytes(), ops::get(key.as_bytes())).await
    }

    /// Fetches a document, echoing the key in the response.
    pub async fn get_k(&self, key: &str) -> OperationResult {
        self.dispatch(key.as_bytes(), ops::get_k(key.as_bytes())).await
    }

    /// Fetches a document and bumps its expiry.
    pub async fn get_and_touch(&self, key: &str, expiry: u32) -> OperationResult {
        self.dispatch(key.as_bytes(), ops::get_and_touch(key.as_bytes(), expiry))
            .await
    }

    /// Fetches a document and locks it against writes.
    pub async fn get_and_lock(&self, key: &str, lock_time: u32) -> OperationResult {
        self.dispatch(key.as_bytes(), ops::get_and_lock(key.as_bytes(), lock_time))
            .await
    }

    /// Stores a document unconditionally.
    pub async fn upsert(&self, key: &str, value: impl Into<Bytes>, flags: u32) -> OperationResult {
        self.dispatch(
            key.as_bytes(),
            ops::store(Opcode::Set, key.as_bytes(), value.into(), flags, 0, 0),
        )
        .await
    }

    /// Stores a typed payload through the default transcoder.
    pub async fn upsert_payload(&self, key: &str, value: &PayloadValue) -> OperationResult {
        let started = Instant::now();
        match DefaultTranscoder.encode(value) {
            Ok((body, flags)) => self.upsert(key, body, flags).await,
            Err(e) => OperationResult::from_error(e, None, started),
        }
    }

    /// Stores a document only if the key does not exist.
    pub async fn insert(&self, key: &str, value: impl Into<Bytes>, flags: u32) -> OperationResult {
        self.dispatch(
            key.as_bytes(),
            ops::store(Opcode::Add, key.as_bytes(), value.into(), flags, 0, 0),
        )
        .await
    }

    /// Replaces an existing document, optionally guarded by a CAS token.
    pub async fn replace(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        flags: u32,
        cas: u64,
    ) -> OperationResult {
        self.dispatch(
            key.as_bytes(),
            ops::store(Opcode::Replace, key.as_bytes(), value.into(), flags, 0, cas),
        )
        .await
    }

    /// Removes a document, optionally guarded by a CAS token.
    pub async fn remove(&self, key: &str, cas: u64) -> OperationResult {
        self.dispatch(key.as_bytes(), ops::delete(key.as_bytes(), cas)).await
    }

    /// Atomically adds to a counter document.
    pub async fn increment(
        &self,
        key: &str,
        delta: u64,
        initial: u64,
        expiry: u32,
    ) -> OperationResult {
        self.dispatch(
            key.as_bytes(),
            ops::arithmetic(Opcode::Increment, key.as_bytes(), delta, initial, expiry),
        )
        .await
    }

    /// Atomically subtracts from a counter document.
    pub async fn decrement(
        &self,
        key: &str,
        delta: u64,
        initial: u64,
        expiry: u32,
    ) -> OperationResult {
        self.dispatch(
            key.as_bytes(),
            ops::arithmetic(Opcode::Decrement, key.as_bytes(), delta, initial, expiry),
        )
        .await
    }

    /// Appends bytes to an existing value.
    pub async fn append(&self, key: &str, value: impl Into<Bytes>, cas: u64) -> OperationResult {
        self.dispatch(
            key.as_bytes(),
            ops::concat(Opcode::Append, key.as_bytes(), value.into(), cas),
        )
        .await
    }

    /// Prepends bytes to an existing value.
    pub async fn prepend(&self, key: &str, value: impl Into<Bytes>, cas: u64) -> OperationResult {
        self.dispatch(
            key.as_bytes(),
            ops::concat(Opcode::Prepend, key.as_bytes(), value.into(), cas),
        )
        .await
    }

    /// Updates a document's expiry.
    pub async fn touch(&self, key: &str, expiry: u32) -> OperationResult {
        self.dispatch(key.as_bytes(), ops::touch(key.as_bytes(), expiry)).await
    }

    /// Queries the keystate of a document on its partition.
    pub async fn observe(&self, key: &str) -> OperationResult {
        let mapped = self.map.current().key_mapper().map(key.as_bytes());
        self.dispatch(key.as_bytes(), ops::observe(mapped.partition_id, key.as_bytes()))
            .await
    }

    /// Queries a partition's sequence state; the key picks the partition.
    pub async fn observe_seqno(&self, key: &str, partition_uuid: u64) -> OperationResult {
        self.dispatch(key.as_bytes(), ops::observe_seqno(partition_uuid)).await
    }

    /// Sends a liveness `NoOp` through the data path.
    pub async fn noop(&self, key: &str) -> OperationResult {
        self.dispatch(key.as_bytes(), ops::noop()).await
    }

    /// Reads one subdocument path.
    pub async fn subdoc_get(&self, key: &str, path: &str) -> OperationResult {
        self.dispatch(
            key.as_bytes(),
            ops::subdoc_lookup(key.as_bytes(), &LookupInSpec::get(path)),
        )
        .await
    }

    /// Mutates one subdocument path.
    pub async fn subdoc_mutate(
        &self,
        key: &str,
        spec: &MutateInSpec,
        expiry: u32,
        cas: u64,
    ) -> OperationResult {
        self.dispatch(
            key.as_bytes(),
            ops::subdoc_mutate(key.as_bytes(), spec, expiry, cas),
        )
        .await
    }

    /// Runs multiple subdocument reads against one document.
    pub async fn lookup_in(&self, key: &str, specs: &[LookupInSpec]) -> OperationResult {
        self.dispatch(key.as_bytes(), ops::multi_lookup(key.as_bytes(), specs))
            .await
    }

    /// Runs multiple subdocument mutations against one document.
    pub async fn mutate_in(
        &self,
        key: &str,
        specs: &[MutateInSpec],
        expiry: u32,
        cas: u64,
    ) -> OperationResult {
        self.dispatch(
            key.as_bytes(),
            ops::multi_mutation(key.as_bytes(), specs, expiry, cas),
        )
        .await
    }

    /// Issues a rendered N1QL request and returns the raw response.
    pub async fn query_raw(&self, body: serde_json::Value) -> Result<reqwest::Response> {
        let request = HttpRequest::post_json("/query/service", &body)?;
        self.dispatcher.dispatch(ServiceKind::Query, request).await
    }

    /// Issues a rendered full-text search request against an index.
    pub async fn search_raw(
        &self,
        index: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response> {
        let request = HttpRequest::post_json(&format!("/api/index/{}/query", index), &body)?;
        self.dispatcher.dispatch(ServiceKind::Search, request).await
    }

    /// Issues a rendered analytics request; `priority` 0 means unset.
    pub async fn analytics_raw(
        &self,
        body: serde_json::Value,
        priority: i32,
    ) -> Result<reqwest::Response> {
        let request = HttpRequest::post_json("/analytics/service", &body)?.priority(priority);
        self.dispatcher.dispatch(ServiceKind::Analytics, request).await
    }

    /// Issues a view query and returns the raw response.
    pub async fn view_query(&self, query: &ViewQuery) -> Result<reqwest::Response> {
        let request = HttpRequest::get(query.render_path());
        self.dispatcher.dispatch(ServiceKind::Views, request).await
    }

    /// The dispatch loop shared by every key/value operation.
    async fn dispatch(&self, key: &[u8], mut frame: OperationFrame) -> OperationResult {
        let started = Instant::now();
        let deadline = started + self.config.operation_lifespan();
        let mut attempt: u32 = 0;
        let mut last_endpoint = None;

        loop {
            let view = self.map.current();
            let mapped = view.key_mapper().map(key);
            frame.vbucket_or_status = mapped.partition_id;

            let Some(node) = self.resolve_node(&view, &mapped) else {
                return OperationResult::from_error(
                    CouchbaseError::NoAvailableNode,
                    last_endpoint,
                    started,
                );
            };
            let endpoint = node.endpoint().to_string();
            last_endpoint = Some(endpoint.clone());

            match node.io().execute(frame.clone(), deadline).await {
                Ok(response) => {
                    node.record_io_success();
                    let status = response.status();

                    if status == ResponseStatus::NotMyVbucket {
                        self.install_piggybacked_topology(&response, &node);
                        if Instant::now() < deadline {
                            attempt += 1;
                            self.backoff(attempt, deadline).await;
                            continue;
                        }
                        return OperationResult::from_error(
                            CouchbaseError::NotMyVbucket {
                                partition: mapped.partition_id,
                            },
                            last_endpoint,
                            started,
                        );
                    }

                    if status.is_retryable() && Instant::now() < deadline {
                        attempt += 1;
                        tracing::debug!(
                            endpoint = %endpoint,
                            status = %status,
                            attempt = attempt,
                            "retrying transient server status"
                        );
                        self.backoff(attempt, deadline).await;
                        continue;
                    }

                    let result = OperationResult::from_frame(response, endpoint, started);
                    tracing::debug!(
                        opcode = %frame.opcode,
                        success = result.success,
                        elapsed = ?result.elapsed,
                        "operation completed"
                    );
                    return result;
                }
                Err(error) => {
                    if matches!(
                        error,
                        CouchbaseError::Connect(_) | CouchbaseError::Io(_)
                    ) && node.record_io_failure()
                    {
                        spawn_liveness_probe(&node, self.config.io_error_check_interval());
                        self.provider.trigger_refresh();
                    }

                    if error.is_retryable() && Instant::now() < deadline {
                        attempt += 1;
                        tracing::debug!(
                            endpoint = %endpoint,
                            error = %error,
                            attempt = attempt,
                            "retrying after dispatch failure"
                        );
                        self.backoff(attempt, deadline).await;
                        continue;
                    }

                    return OperationResult::from_error(error, last_endpoint, started);
                }
            }
        }
    }

    /// Resolves the node for a mapped key.
    ///
    /// A valid, live primary wins; a negative or out-of-range index and a
    /// quarantined primary all fall back to a random live data node.
    fn resolve_node(&self, view: &ClusterView, mapped: &MappedKey) -> Option<Arc<Node>> {
        if mapped.primary >= 0 {
            if let Some(node) = view.node(mapped.primary as usize) {
                if !node.is_down() {
                    return Some(Arc::clone(node));
                }
            }
        }
        view.random_data_node()
    }

    fn install_piggybacked_topology(&self, response: &OperationFrame, node: &Node) {
        if response.value.is_empty() {
            self.provider.trigger_refresh();
            return;
        }
        match std::str::from_utf8(&response.value) {
            Ok(raw) => {
                if let Err(e) = self.provider.apply_raw(raw, node.endpoint().host()) {
                    tracing::warn!(error = %e, "stale-routing response carried a bad topology");
                    self.provider.trigger_refresh();
                }
            }
            Err(_) => self.provider.trigger_refresh(),
        }
    }

    async fn backoff(&self, attempt: u32, deadline: Instant) {
        let base = self.config.vbucket_retry_sleep();
        let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        let sleep = base.saturating_mul(1 << shift);
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(sleep.min(remaining)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{NodeCapabilities, NodeEndpoint, NodeFactory, PartitionTable, ServicePorts};
    use crate::io::testing::NullIoService;
    use crate::io::FailureWindow;
    use crate::provider::parser::{Locator, NodeInfo, TopologyDocument};

    struct TestFactory;

    impl NodeFactory for TestFactory {
        fn create(&self, info: &NodeInfo, revision: u64) -> Arc<Node> {
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

    fn test_bucket(primaries: &[i32], hosts: &[&str]) -> Bucket {
        let map = Arc::new(ClusterMap::new());
        let config = Arc::new(ClientConfig::builder().build().unwrap());

        if !hosts.is_empty() {
            let table =
                PartitionTable::new(primaries.iter().map(|p| vec![*p]).collect(), 0).unwrap();
            let doc = TopologyDocument {
                revision: 1,
                bucket: "default".to_string(),
                use_ssl: false,
                locator: Locator::Vbucket(Arc::new(table)),
                nodes: hosts
                    .iter()
                    .map(|h| NodeInfo {
                        endpoint: NodeEndpoint::new(*h, 11210),
                        services: ServicePorts {
                            kv: Some(11210),
                            ..Default::default()
                        },
                        capabilities: NodeCapabilities {
                            data: true,
                            ..Default::default()
                        },
                    })
                    .collect(),
            };
            map.install(&doc, &TestFactory).unwrap();
        }

        let client = reqwest::Client::new();
        let provider = ConfigProvider::new(
            Arc::clone(&map),
            Arc::new(TestFactory),
            Arc::clone(&config),
            "default",
            client.clone(),
        );
        let dispatcher = Arc::new(HttpDispatcher::new(
            Arc::clone(&map),
            Arc::clone(&config),
            client,
        ));
        Bucket::new("default", map, provider, dispatcher, config)
    }

    #[tokio::test]
    async fn test_unowned_partition_falls_back_to_random_live_node() {
        // every partition reports "no current owner"
        let bucket = test_bucket(&[-1, -1, -1, -1], &["n1", "n2"]);
        let result = bucket.get("anything").await;
        assert!(result.success, "fallback dispatch failed: {}", result.message);
        assert!(result.endpoint.is_some());
    }

    #[tokio::test]
    async fn test_out_of_range_primary_falls_back() {
        // every primary references index 5 in a two-node roster; such a
        // table installs (the provider only flags it) and dispatch resolves
        // through the random-live-node fallback
        let bucket = test_bucket(&[5, 5, 5, 5], &["n1", "n2"]);
        let result = bucket.get("anything").await;
        assert!(result.success, "fallback dispatch failed: {}", result.message);
        assert!(result.endpoint.is_some());
    }

    #[tokio::test]
    async fn test_quarantined_primary_falls_back() {
        let bucket = test_bucket(&[0, 0, 0, 0], &["n1", "n2"]);
        bucket.map.current().node(0).unwrap().mark_down();

        let result = bucket.get("anything").await;
        assert!(result.success);
        assert_eq!(result.endpoint.as_deref(), Some("n2:11210"));
    }

    #[tokio::test]
    async fn test_empty_roster_yields_no_available_node() {
        let bucket = test_bucket(&[], &[]);
        let result = bucket.get("anything").await;
        assert!(!result.success);
        assert!(matches!(result.error, Some(CouchbaseError::NoAvailableNode)));
    }

    #[test]
    fn test_result_from_success_frame() {
        let mut frame = OperationFrame::response(Opcode::Get, ResponseStatus::Success)
            .with_extras(vec![0x04u8, 0x00, 0x00, 0x00])
            .with_value(&b"\"doc\""[..]);
        frame.cas = 42;

        let result =
            OperationResult::from_frame(frame, "n1:11210".to_string(), Instant::now());
        assert!(result.success);
        assert_eq!(result.status, Some(ResponseStatus::Success));
        assert_eq!(result.cas, 42);
        assert_eq!(result.flags, 0x04000000);
        assert!(result.value.is_some());
        assert!(result.error.is_none());
        assert!(result.message.is_empty());
        assert_eq!(result.endpoint.as_deref(), Some("n1:11210"));
    }

    #[test]
    fn test_result_from_failure_frame_keeps_status_and_cas() {
        let mut frame = OperationFrame::response(Opcode::Replace, ResponseStatus::KeyExists)
            .with_value(&b"Data exists for key"[..]);
        frame.cas = 9;

        let result =
            OperationResult::from_frame(frame, "n1:11210".to_string(), Instant::now());
        assert!(!result.success);
        assert_eq!(result.status, Some(ResponseStatus::KeyExists));
        assert_eq!(result.cas, 9);
        assert!(result.value.is_none());
        assert!(result.message.contains("KEY_EXISTS"));
        assert!(result.message.contains("Data exists for key"));
    }

    #[test]
    fn test_result_from_error() {
        let result = OperationResult::from_error(
            CouchbaseError::NoAvailableNode,
            None,
            Instant::now(),
        );
        assert!(!result.success);
        assert!(result.status.is_none());
        assert!(matches!(result.error, Some(CouchbaseError::NoAvailableNode)));
    }

    #[test]
    fn test_payload_decoding() {
        let payload = PayloadValue::Utf8("hello".to_string());
        let (body, flags) = DefaultTranscoder.encode(&payload).unwrap();

        let mut extras = Vec::new();
        extras.extend_from_slice(&flags.to_be_bytes());
        let frame = OperationFrame::response(Opcode::Get, ResponseStatus::Success)
            .with_extras(extras)
            .with_value(body);

        let result = OperationResult::from_frame(frame, "n1:11210".to_string(), Instant::now());
        assert_eq!(result.payload().unwrap(), Some(payload));
    }

    #[test]
    fn test_counter_value() {
        let frame = OperationFrame::response(Opcode::Increment, ResponseStatus::Success)
            .with_value(vec![0u8, 0, 0, 0, 0, 0, 0, 12]);
        let result = OperationResult::from_frame(frame, "n1:11210".to_string(), Instant::now());
        assert_eq!(result.counter_value(), Some(12));
    }
}
