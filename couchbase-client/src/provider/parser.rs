//! Topology document parsing and normalization.
//!
//! Bucket configuration documents arrive from two sources: the body of a
//! `GetClusterConfig` response on the data channel and the management
//! endpoint's streaming feed. Both carry the same JSON shape. Documents
//! published over the data channel use the `$HOST` placeholder for the
//! contacted node, which is rewritten to the host the client actually
//! bootstrapped from.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use couchbase_core::{CouchbaseError, Result};

use crate::cluster::{NodeCapabilities, NodeEndpoint, PartitionTable, ServicePorts};

/// Default data port when a topology omits it.
const DEFAULT_KV_PORT: u16 = 11210;
/// Default TLS data port when a topology omits it.
const DEFAULT_KV_TLS_PORT: u16 = 11207;

/// How keys are located on this bucket.
#[derive(Debug, Clone)]
pub enum Locator {
    /// Hash-partitioned through the published partition table.
    Vbucket(Arc<PartitionTable>),
    /// Consistent-hash ring over the live data nodes.
    Ketama,
}

/// One normalized node entry.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// The node's data endpoint (plain or TLS port per the SSL setting).
    pub endpoint: NodeEndpoint,
    /// Every service port the node advertises.
    pub services: ServicePorts,
    /// The services the node participates in.
    pub capabilities: NodeCapabilities,
}

/// A normalized topology document.
#[derive(Debug, Clone)]
pub struct TopologyDocument {
    /// Monotonic revision.
    pub revision: u64,
    /// The bucket this topology belongs to.
    pub bucket: String,
    /// Whether TLS ports were selected during normalization.
    pub use_ssl: bool,
    /// The key-location scheme.
    pub locator: Locator,
    /// Node roster; data nodes come first, in server-list order.
    pub nodes: Vec<NodeInfo>,
}

impl TopologyDocument {
    /// Returns how many roster entries serve the data path.
    pub fn data_node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.capabilities.data).count()
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    rev: u64,
    name: String,
    #[serde(rename = "nodeLocator", default)]
    node_locator: Option<String>,
    #[serde(rename = "nodesExt", default)]
    nodes_ext: Vec<RawNodeExt>,
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(rename = "vBucketServerMap", default)]
    vbucket_server_map: Option<RawVbucketServerMap>,
}

#[derive(Debug, Deserialize)]
struct RawNodeExt {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    services: HashMap<String, u16>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    hostname: String,
    #[serde(default)]
    ports: HashMap<String, u16>,
}

#[derive(Debug, Deserialize)]
struct RawVbucketServerMap {
    #[serde(rename = "numReplicas", default)]
    num_replicas: usize,
    #[serde(rename = "serverList")]
    server_list: Vec<String>,
    #[serde(rename = "vBucketMap")]
    vbucket_map: Vec<Vec<i32>>,
}

/// Parses a raw topology document.
///
/// `origin_host` replaces the `$HOST` placeholder; `use_ssl` selects the
/// TLS port set for data endpoints and service URIs.
pub fn parse_topology(raw: &str, origin_host: &str, use_ssl: bool) -> Result<TopologyDocument> {
    let raw = raw.replace("$HOST", origin_host);
    let config: RawConfig = serde_json::from_str(&raw)
        .map_err(|e| CouchbaseError::Protocol(format!("invalid topology document: {}", e)))?;

    let ext_by_host = index_ext_nodes(&config, origin_host);

    let mut nodes = Vec::new();
    let locator = match (&config.vbucket_server_map, config.node_locator.as_deref()) {
        (Some(map), _) => {
            build_data_nodes(map, &ext_by_host, use_ssl, &mut nodes)?;
            let table = PartitionTable::new(map.vbucket_map.clone(), map.num_replicas)?;
            table.validate_indices(map.server_list.len())?;
            Locator::Vbucket(Arc::new(table))
        }
        (None, Some("ketama")) => {
            build_ring_nodes(&config, &ext_by_host, origin_host, use_ssl, &mut nodes)?;
            Locator::Ketama
        }
        (None, locator) => {
            return Err(CouchbaseError::Protocol(format!(
                "topology has no partition map and locator {:?}",
                locator
            )));
        }
    };

    append_service_only_nodes(&ext_by_host, use_ssl, &mut nodes);

    Ok(TopologyDocument {
        revision: config.rev,
        bucket: config.name,
        use_ssl,
        locator,
        nodes,
    })
}

/// Indexes `nodesExt` entries by host, resolving absent hostnames to the
/// bootstrap origin (single-node clusters omit them).
fn index_ext_nodes<'a>(config: &'a RawConfig, origin_host: &str) -> Vec<(String, &'a RawNodeExt)> {
    config
        .nodes_ext
        .iter()
        .map(|ext| {
            let host = ext
                .hostname
                .clone()
                .unwrap_or_else(|| origin_host.to_string());
            (host, ext)
        })
        .collect()
}

fn service_ports(services: &HashMap<String, u16>) -> ServicePorts {
    ServicePorts {
        kv: services.get("kv").copied(),
        kv_tls: services.get("kvSSL").copied(),
        mgmt: services.get("mgmt").copied(),
        mgmt_tls: services.get("mgmtSSL").copied(),
        views: services.get("capi").copied(),
        views_tls: services.get("capiSSL").copied(),
        query: services.get("n1ql").copied(),
        query_tls: services.get("n1qlSSL").copied(),
        search: services.get("fts").copied(),
        search_tls: services.get("ftsSSL").copied(),
        analytics: services.get("cbas").copied(),
        analytics_tls: services.get("cbasSSL").copied(),
    }
}

fn capabilities(ports: &ServicePorts) -> NodeCapabilities {
    NodeCapabilities {
        data: ports.kv.is_some() || ports.kv_tls.is_some(),
        views: ports.views.is_some() || ports.views_tls.is_some(),
        query: ports.query.is_some() || ports.query_tls.is_some(),
        index: false,
        search: ports.search.is_some() || ports.search_tls.is_some(),
        analytics: ports.analytics.is_some() || ports.analytics_tls.is_some(),
        mgmt: ports.mgmt.is_some() || ports.mgmt_tls.is_some(),
    }
}

/// Builds the data-node roster in server-list order, so node indices in the
/// partition table line up with roster positions.
fn build_data_nodes(
    map: &RawVbucketServerMap,
    ext_by_host: &[(String, &RawNodeExt)],
    use_ssl: bool,
    nodes: &mut Vec<NodeInfo>,
) -> Result<()> {
    for server in &map.server_list {
        let (host, plain_port) = split_host_port(server)?;

        let ext = ext_by_host
            .iter()
            .find(|(h, _)| h == &host)
            .map(|(_, ext)| *ext);

        let mut ports = match ext {
            Some(ext) => service_ports(&ext.services),
            None => ServicePorts::default(),
        };
        if ports.kv.is_none() {
            ports.kv = Some(plain_port);
        }
        if use_ssl && ports.kv_tls.is_none() {
            ports.kv_tls = Some(DEFAULT_KV_TLS_PORT);
        }

        let data_port = if use_ssl {
            ports.kv_tls.unwrap_or(DEFAULT_KV_TLS_PORT)
        } else {
            ports.kv.unwrap_or(plain_port)
        };

        let mut caps = capabilities(&ports);
        caps.data = true;

        nodes.push(NodeInfo {
            endpoint: NodeEndpoint::new(host, data_port),
            services: ports,
            capabilities: caps,
        });
    }
    Ok(())
}

/// Builds the roster for ring-mapped buckets from the legacy `nodes` array.
fn build_ring_nodes(
    config: &RawConfig,
    ext_by_host: &[(String, &RawNodeExt)],
    origin_host: &str,
    use_ssl: bool,
    nodes: &mut Vec<NodeInfo>,
) -> Result<()> {
    for raw in &config.nodes {
        let (host, _) = split_host_port(&raw.hostname).unwrap_or_else(|_| {
            (
                if raw.hostname.is_empty() {
                    origin_host.to_string()
                } else {
                    raw.hostname.clone()
                },
                0,
            )
        });

        let ext = ext_by_host
            .iter()
            .find(|(h, _)| h == &host)
            .map(|(_, ext)| *ext);
        let mut ports = match ext {
            Some(ext) => service_ports(&ext.services),
            None => ServicePorts::default(),
        };
        if ports.kv.is_none() {
            ports.kv = raw.ports.get("direct").copied().or(Some(DEFAULT_KV_PORT));
        }

        let data_port = if use_ssl {
            ports.kv_tls.unwrap_or(DEFAULT_KV_TLS_PORT)
        } else {
            ports.kv.unwrap_or(DEFAULT_KV_PORT)
        };

        let mut caps = capabilities(&ports);
        caps.data = true;

        nodes.push(NodeInfo {
            endpoint: NodeEndpoint::new(host, data_port),
            services: ports,
            capabilities: caps,
        });
    }

    if nodes.is_empty() {
        return Err(CouchbaseError::Protocol(
            "ketama topology has no nodes".to_string(),
        ));
    }
    Ok(())
}

/// Appends roster entries for nodes that run HTTP services but no data
/// service (query-only or analytics-only nodes).
fn append_service_only_nodes(
    ext_by_host: &[(String, &RawNodeExt)],
    use_ssl: bool,
    nodes: &mut Vec<NodeInfo>,
) {
    for (host, ext) in ext_by_host {
        if ext.services.contains_key("kv") {
            continue;
        }
        let ports = service_ports(&ext.services);
        let caps = capabilities(&ports);
        if !caps.views && !caps.query && !caps.search && !caps.analytics && !caps.mgmt {
            continue;
        }

        let placeholder_port = if use_ssl {
            DEFAULT_KV_TLS_PORT
        } else {
            DEFAULT_KV_PORT
        };
        let endpoint = NodeEndpoint::new(host.clone(), placeholder_port);
        if nodes.iter().any(|n| n.endpoint.host() == host) {
            continue;
        }

        nodes.push(NodeInfo {
            endpoint,
            services: ports,
            capabilities: caps,
        });
    }
}

fn split_host_port(raw: &str) -> Result<(String, u16)> {
    let (host, port) = raw.rsplit_once(':').ok_or_else(|| {
        CouchbaseError::Protocol(format!("server entry {:?} has no port", raw))
    })?;
    let port = port.parse::<u16>().map_err(|_| {
        CouchbaseError::Protocol(format!("server entry {:?} has a bad port", raw))
    })?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUCHBASE_CONFIG: &str = r#"{
        "rev": 11,
        "name": "default",
        "nodeLocator": "vbucket",
        "nodesExt": [
            {"hostname": "10.0.0.1", "services": {"kv": 11210, "kvSSL": 11207, "mgmt": 8091, "capi": 8092, "capiSSL": 18092, "n1ql": 8093, "n1qlSSL": 18093}},
            {"hostname": "10.0.0.2", "services": {"kv": 11210, "mgmt": 8091, "capi": 8092, "fts": 8094}},
            {"hostname": "10.0.0.3", "services": {"n1ql": 8093, "cbas": 8095, "mgmt": 8091}}
        ],
        "vBucketServerMap": {
            "hashAlgorithm": "CRC",
            "numReplicas": 1,
            "serverList": ["10.0.0.1:11210", "10.0.0.2:11210"],
            "vBucketMap": [[0, 1], [1, 0], [0, -1], [-1, 1]]
        }
    }"#;

    #[test]
    fn test_parse_couchbase_topology() {
        let doc = parse_topology(COUCHBASE_CONFIG, "bootstrap.local", false).unwrap();
        assert_eq!(doc.revision, 11);
        assert_eq!(doc.bucket, "default");
        assert_eq!(doc.nodes.len(), 3);
        assert_eq!(doc.data_node_count(), 2);

        let first = &doc.nodes[0];
        assert_eq!(first.endpoint.host(), "10.0.0.1");
        assert_eq!(first.endpoint.port(), 11210);
        assert!(first.capabilities.data);
        assert!(first.capabilities.query);
        assert_eq!(first.services.query, Some(8093));

        let query_only = &doc.nodes[2];
        assert!(!query_only.capabilities.data);
        assert!(query_only.capabilities.query);
        assert!(query_only.capabilities.analytics);

        match &doc.locator {
            Locator::Vbucket(table) => {
                assert_eq!(table.partition_count(), 4);
                assert_eq!(table.partition(3).primary, -1);
            }
            Locator::Ketama => panic!("expected a vbucket locator"),
        }
    }

    #[test]
    fn test_ssl_port_selection() {
        let doc = parse_topology(COUCHBASE_CONFIG, "bootstrap.local", true).unwrap();
        let first = &doc.nodes[0];
        assert_eq!(first.endpoint.port(), 11207);
        // node 2 advertises no kvSSL; the default TLS data port is assumed
        assert_eq!(doc.nodes[1].endpoint.port(), 11207);
    }

    #[test]
    fn test_host_placeholder_rewrite() {
        let raw = r#"{
            "rev": 3,
            "name": "default",
            "nodesExt": [{"hostname": "$HOST", "services": {"kv": 11210, "mgmt": 8091}}],
            "vBucketServerMap": {
                "hashAlgorithm": "CRC",
                "numReplicas": 0,
                "serverList": ["$HOST:11210"],
                "vBucketMap": [[0], [0]]
            }
        }"#;
        let doc = parse_topology(raw, "192.168.7.9", false).unwrap();
        assert_eq!(doc.nodes[0].endpoint.host(), "192.168.7.9");
    }

    #[test]
    fn test_ketama_topology() {
        let raw = r#"{
            "rev": 5,
            "name": "cache",
            "nodeLocator": "ketama",
            "nodes": [
                {"hostname": "10.0.0.1:8091", "ports": {"direct": 11211}},
                {"hostname": "10.0.0.2:8091", "ports": {"direct": 11211}}
            ]
        }"#;
        let doc = parse_topology(raw, "bootstrap.local", false).unwrap();
        assert!(matches!(doc.locator, Locator::Ketama));
        assert_eq!(doc.nodes.len(), 2);
        assert_eq!(doc.nodes[0].endpoint.port(), 11211);
    }

    #[test]
    fn test_out_of_range_index_tolerated() {
        // stale or mid-rebalance tables can reference indices past the
        // server list; the document still installs and dispatch falls back
        let raw = r#"{
            "rev": 2,
            "name": "default",
            "vBucketServerMap": {
                "hashAlgorithm": "CRC",
                "numReplicas": 0,
                "serverList": ["10.0.0.1:11210"],
                "vBucketMap": [[0], [3]]
            }
        }"#;
        let doc = parse_topology(raw, "h", false).unwrap();
        match &doc.locator {
            Locator::Vbucket(table) => assert_eq!(table.partition(1).primary, 3),
            Locator::Ketama => panic!("expected a vbucket locator"),
        }
    }

    #[test]
    fn test_malformed_index_rejected() {
        let raw = r#"{
            "rev": 2,
            "name": "default",
            "vBucketServerMap": {
                "hashAlgorithm": "CRC",
                "numReplicas": 0,
                "serverList": ["10.0.0.1:11210"],
                "vBucketMap": [[0], [-2]]
            }
        }"#;
        assert!(parse_topology(raw, "h", false).is_err());
    }

    #[test]
    fn test_missing_locator_rejected() {
        let raw = r#"{"rev": 1, "name": "default"}"#;
        assert!(parse_topology(raw, "h", false).is_err());
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(parse_topology("{nope", "h", false).is_err());
    }

    #[test]
    fn test_absent_ext_hostname_uses_origin() {
        let raw = r#"{
            "rev": 4,
            "name": "default",
            "nodesExt": [{"services": {"kv": 11210, "mgmt": 8091}}],
            "vBucketServerMap": {
                "hashAlgorithm": "CRC",
                "numReplicas": 0,
                "serverList": ["127.0.0.1:11210"],
                "vBucketMap": [[0], [0]]
            }
        }"#;
        let doc = parse_topology(raw, "127.0.0.1", false).unwrap();
        assert_eq!(doc.nodes[0].endpoint.host(), "127.0.0.1");
        assert!(doc.nodes[0].capabilities.mgmt);
    }
}
