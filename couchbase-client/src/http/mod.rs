//! HTTP dispatch for the view, query, search and analytics services.
//!
//! One dispatcher serves a bucket's HTTP surfaces off the shared cluster
//! view. Query and analytics requests round-robin over healthy service URIs;
//! view and search requests pick at random. Transport errors and 5xx
//! responses count against the chosen URI, retiring it at the failure
//! threshold; when every URI of a service is unhealthy the counters are
//! cleared and one attempt runs against the full set.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use url::Url;

use couchbase_core::{CouchbaseError, Result};

use crate::cluster::{ClusterMap, FailureCountingUri, ServiceKind};
use crate::config::ClientConfig;

/// Quiet period after which a retired URI becomes eligible again.
const URI_REHAB_INTERVAL: Duration = Duration::from_secs(30);

/// A rendered request for one of the HTTP services.
///
/// The dispatcher treats the path and body as opaque; builders elsewhere
/// render them.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: reqwest::Method,
    path: String,
    body: Option<Bytes>,
    content_type: Option<&'static str>,
    priority: i32,
}

impl HttpRequest {
    /// Creates a GET request for a service path.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: reqwest::Method::GET,
            path: path.into(),
            body: None,
            content_type: None,
            priority: 0,
        }
    }

    /// Creates a POST request with a JSON body.
    pub fn post_json(path: impl Into<String>, body: &serde_json::Value) -> Result<Self> {
        let body = serde_json::to_vec(body)
            .map_err(|e| CouchbaseError::Serialization(format!("request body: {}", e)))?;
        Ok(Self {
            method: reqwest::Method::POST,
            path: path.into(),
            body: Some(Bytes::from(body)),
            content_type: Some("application/json"),
            priority: 0,
        })
    }

    /// Sets the analytics priority (0 means unset).
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Returns the service-relative path.
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Dispatches rendered requests to a bucket's HTTP services.
pub struct HttpDispatcher {
    client: reqwest::Client,
    map: Arc<ClusterMap>,
    config: Arc<ClientConfig>,
    query_cursor: AtomicUsize,
    analytics_cursor: AtomicUsize,
}

impl std::fmt::Debug for HttpDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpDispatcher").finish()
    }
}

impl HttpDispatcher {
    /// Creates a dispatcher over the shared cluster view.
    pub fn new(
        map: Arc<ClusterMap>,
        config: Arc<ClientConfig>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            client,
            map,
            config,
            query_cursor: AtomicUsize::new(0),
            analytics_cursor: AtomicUsize::new(0),
        }
    }

    /// Builds the shared HTTP client honoring the TLS options.
    pub fn build_client(config: &ClientConfig) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder();
        if config.use_ssl() && config.tls().ignore_remote_certificate_name_mismatch() {
            builder = builder.danger_accept_invalid_certs(true);
        }
        builder
            .build()
            .map_err(|e| CouchbaseError::Configuration(format!("HTTP client: {}", e)))
    }

    /// Issues one request against a healthy URI of the service.
    ///
    /// The response is returned whatever its status code; the caller streams
    /// the body. Failure accounting happens here: transport errors and 5xx
    /// count against the URI, 2xx clears it.
    pub async fn dispatch(
        &self,
        service: ServiceKind,
        request: HttpRequest,
    ) -> Result<reqwest::Response> {
        let uri = self.select_uri(service)?;
        let url = join_path(uri.uri(), request.path())?;

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .timeout(self.deadline_for(service));
        if let Some(content_type) = request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        if service == ServiceKind::Analytics && request.priority != 0 {
            builder = builder.header("Analytics-Priority", request.priority);
        }
        if let Some(username) = self.config.username() {
            builder = builder.basic_auth(username, self.config.password());
        } else {
            let bucket = self.map.current().bucket().to_string();
            let password = self.config.bucket_password(&bucket).map(str::to_string);
            builder = builder.basic_auth(bucket, password);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        match builder.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_server_error() {
                    uri.record_failure();
                    tracing::warn!(
                        service = %service,
                        uri = %uri.uri(),
                        status = %status,
                        failures = uri.failures(),
                        "service URI answered 5xx"
                    );
                } else if status.is_success() {
                    uri.record_success();
                }
                Ok(response)
            }
            Err(e) => {
                uri.record_failure();
                tracing::warn!(
                    service = %service,
                    uri = %uri.uri(),
                    error = %e,
                    failures = uri.failures(),
                    "service request failed"
                );
                Err(CouchbaseError::Http(format!("{} request: {}", service, e)))
            }
        }
    }

    /// Picks a URI per the service's selection policy.
    ///
    /// Query and analytics round-robin; views and search pick at random. An
    /// all-unhealthy bag fails open: every counter is cleared and the full
    /// set is eligible for one attempt.
    pub(crate) fn select_uri(&self, service: ServiceKind) -> Result<Arc<FailureCountingUri>> {
        let view = self.map.current();
        let uris = view.service_uris(service);
        if uris.is_empty() {
            return Err(CouchbaseError::Http(format!(
                "no {} endpoints in the current topology",
                service
            )));
        }

        let threshold = self.config.query_failed_threshold();
        let healthy: Vec<&Arc<FailureCountingUri>> = uris
            .iter()
            .filter(|u| u.is_healthy(threshold, URI_REHAB_INTERVAL))
            .collect();

        let eligible: Vec<&Arc<FailureCountingUri>> = if healthy.is_empty() {
            tracing::warn!(service = %service, "all service URIs unhealthy; failing open");
            for uri in uris {
                uri.reset();
            }
            uris.iter().collect()
        } else {
            healthy
        };

        let picked = match service {
            ServiceKind::Query => {
                let cursor = self.query_cursor.fetch_add(1, Ordering::Relaxed);
                eligible[cursor % eligible.len()]
            }
            ServiceKind::Analytics => {
                let cursor = self.analytics_cursor.fetch_add(1, Ordering::Relaxed);
                eligible[cursor % eligible.len()]
            }
            ServiceKind::Views | ServiceKind::Search => {
                eligible[rand::thread_rng().gen_range(0..eligible.len())]
            }
        };

        Ok(Arc::clone(picked))
    }

    fn deadline_for(&self, service: ServiceKind) -> Duration {
        match service {
            ServiceKind::Views => self.config.view_request_timeout(),
            ServiceKind::Query => self.config.query_request_timeout(),
            ServiceKind::Search => self.config.search_request_timeout(),
            ServiceKind::Analytics => self.config.analytics_request_timeout(),
        }
    }
}

fn join_path(base: &Url, path: &str) -> Result<Url> {
    let raw = format!("{}{}", base.as_str().trim_end_matches('/'), path);
    Url::parse(&raw).map_err(|e| CouchbaseError::BadRequest(format!("bad URI {}: {}", raw, e)))
}

/// A rendered view query: design document, view name and parameters.
///
/// Only the parameter rendering lives here; result handling stays with the
/// caller, which receives the raw response stream.
#[derive(Debug, Clone)]
pub struct ViewQuery {
    design_document: String,
    view_name: String,
    spatial: bool,
    params: Vec<(String, String)>,
}

impl ViewQuery {
    /// Creates a query against a design document's view.
    pub fn new(design_document: impl Into<String>, view_name: impl Into<String>) -> Self {
        Self {
            design_document: design_document.into(),
            view_name: view_name.into(),
            spatial: false,
            params: Vec::new(),
        }
    }

    /// Targets a spatial view instead of a map/reduce view.
    pub fn spatial(mut self) -> Self {
        self.spatial = true;
        self
    }

    /// Limits the number of returned rows.
    pub fn limit(mut self, limit: u64) -> Self {
        self.params.push(("limit".to_string(), limit.to_string()));
        self
    }

    /// Skips rows before returning results.
    pub fn skip(mut self, skip: u64) -> Self {
        self.params.push(("skip".to_string(), skip.to_string()));
        self
    }

    /// Requests descending key order.
    pub fn descending(mut self, descending: bool) -> Self {
        self.params
            .push(("descending".to_string(), descending.to_string()));
        self
    }

    /// Controls whether the view engine stops on an indexing error.
    ///
    /// `stop = true` renders `on_error=stop`; `false` renders
    /// `on_error=continue`.
    pub fn on_error(mut self, stop: bool) -> Self {
        let value = if stop { "stop" } else { "continue" };
        self.params.push(("on_error".to_string(), value.to_string()));
        self
    }

    /// Adds a raw parameter.
    pub fn raw(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Renders the service-relative path (the bucket lives in the base URI).
    pub fn render_path(&self) -> String {
        let kind = if self.spatial { "_spatial" } else { "_view" };
        let mut path = format!(
            "/_design/{}/{}/{}",
            self.design_document, kind, self.view_name
        );
        if !self.params.is_empty() {
            let query: Vec<String> = self
                .params
                .iter()
                .map(|(k, v)| format!("{}={}", k, urlencode(v)))
                .collect();
            path.push('?');
            path.push_str(&query.join("&"));
        }
        path
    }
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
