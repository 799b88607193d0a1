//! A single framed connection to a node's data port.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};

use couchbase_core::protocol::constants::ServerFeature;
use couchbase_core::protocol::{ErrorMap, FrameCodec, Opcode};
use couchbase_core::{CouchbaseError, OperationFrame, Result};

use crate::cluster::NodeEndpoint;
use crate::config::ClientConfig;

use super::sasl::{SaslMechanism, SaslSession};

/// Client identifier sent in the `Hello` key.
const HELLO_CLIENT_ID: &str = concat!("couchbase-rust/", env!("CARGO_PKG_VERSION"));

/// Byte stream a connection runs over: plain TCP or TLS.
pub(crate) trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T {}

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generates a new unique connection ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A connection to a node's data port.
///
/// Bring-up runs `Hello`, fetches the error map when advertised,
/// authenticates through SASL and binds the bucket. All of that happens
/// with one request in flight at a time; afterwards the connection serves
/// either one pooled operation at a time or is split for multiplexing.
pub struct KvConnection {
    id: ConnectionId,
    endpoint: NodeEndpoint,
    stream: Box<dyn RawStream>,
    codec: FrameCodec,
    read_buffer: BytesMut,
    features: Vec<ServerFeature>,
    error_map: Option<ErrorMap>,
    authenticated: bool,
    opaque: AtomicU32,
    created_at: Instant,
    last_used_at: Instant,
}

impl std::fmt::Debug for KvConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvConnection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("authenticated", &self.authenticated)
            .field("features", &self.features)
            .finish()
    }
}

impl KvConnection {
    /// Dials the endpoint and applies the socket options.
    ///
    /// With `use_ssl` set this also runs the TLS handshake against the node
    /// hostname (requires the `tls` feature).
    pub async fn connect(endpoint: &NodeEndpoint, config: &ClientConfig) -> Result<Self> {
        let stream = TcpStream::connect((endpoint.host(), endpoint.port()))
            .await
            .map_err(|e| {
                CouchbaseError::Connect(format!("failed to connect to {}: {}", endpoint, e))
            })?;

        stream.set_nodelay(true).map_err(|e| {
            CouchbaseError::Connect(format!("failed to set TCP_NODELAY on {}: {}", endpoint, e))
        })?;
        apply_keepalive(&stream, config)?;

        let stream: Box<dyn RawStream> = if config.use_ssl() {
            Box::new(super::tls::handshake(stream, endpoint.host(), config).await?)
        } else {
            Box::new(stream)
        };

        tracing::debug!(endpoint = %endpoint, tls = config.use_ssl(), "established connection");

        let now = Instant::now();
        Ok(Self {
            id: ConnectionId::new(),
            endpoint: endpoint.clone(),
            stream,
            codec: FrameCodec::new(),
            read_buffer: BytesMut::with_capacity(8192),
            features: Vec::new(),
            error_map: None,
            authenticated: false,
            opaque: AtomicU32::new(1),
            created_at: now,
            last_used_at: now,
        })
    }

    /// Returns the connection's unique identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the endpoint this connection is bound to.
    pub fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }

    /// Returns `true` once SASL authentication has completed.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Returns `true` if the server acknowledged the feature.
    pub fn supports(&self, feature: ServerFeature) -> bool {
        self.features.contains(&feature)
    }

    /// Returns the cached error map, if the server published one.
    pub fn error_map(&self) -> Option<&ErrorMap> {
        self.error_map.as_ref()
    }

    /// Returns when this connection was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Returns how long the connection has been idle.
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_used_at.elapsed()
    }

    /// Sends one frame.
    pub async fn send(&mut self, frame: OperationFrame) -> Result<()> {
        let mut buf = BytesMut::new();
        self.codec.encode(frame, &mut buf)?;
        self.stream.write_all(&buf).await.map_err(|e| {
            CouchbaseError::Io(std::sync::Arc::new(std::io::Error::new(
                e.kind(),
                format!("write to {}: {}", self.endpoint, e),
            )))
        })?;
        self.last_used_at = Instant::now();
        Ok(())
    }

    /// Receives one frame.
    ///
    /// Returns `None` if the peer closed the connection cleanly.
    pub async fn receive(&mut self) -> Result<Option<OperationFrame>> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.read_buffer)? {
                self.last_used_at = Instant::now();
                return Ok(Some(frame));
            }

            let read = self
                .stream
                .read_buf(&mut self.read_buffer)
                .await
                .map_err(|e| {
                    CouchbaseError::Io(std::sync::Arc::new(std::io::Error::new(
                        e.kind(),
                        format!("read from {}: {}", self.endpoint, e),
                    )))
                })?;

            if read == 0 {
                if self.read_buffer.is_empty() {
                    return Ok(None);
                }
                return Err(CouchbaseError::Protocol(format!(
                    "connection to {} closed mid-frame",
                    self.endpoint
                )));
            }
        }
    }

    /// Sends a request and waits for its response, matching by opaque.
    pub async fn roundtrip(&mut self, mut frame: OperationFrame) -> Result<OperationFrame> {
        let opaque = self.opaque.fetch_add(1, Ordering::Relaxed);
        frame.opaque = opaque;
        self.send(frame).await?;

        loop {
            let response = self.receive().await?.ok_or_else(|| {
                CouchbaseError::Io(std::sync::Arc::new(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("{} closed during a round trip", self.endpoint),
                )))
            })?;
            if response.opaque == opaque {
                return Ok(response);
            }
            tracing::debug!(
                endpoint = %self.endpoint,
                opaque = response.opaque,
                "discarding reply with unknown opaque"
            );
        }
    }

    /// Runs the bring-up sequence: `Hello`, error map, SASL, `SelectBucket`.
    ///
    /// With cluster-wide credentials and a server that supports
    /// `SelectBucket`, the connection authenticates once and then binds the
    /// bucket; otherwise it authenticates with the bucket's own credentials.
    pub async fn initialize(&mut self, bucket: &str, config: &ClientConfig) -> Result<()> {
        self.hello().await?;

        if self.supports(ServerFeature::Xerror) {
            self.fetch_error_map().await?;
        }

        let enhanced = config.username().is_some() && self.supports(ServerFeature::SelectBucket);
        if enhanced {
            let username = config.username().unwrap_or_default().to_string();
            let password = config.password().unwrap_or_default().to_string();
            self.authenticate(&username, &password, config.force_sasl_plain())
                .await?;
            self.select_bucket(bucket).await?;
        } else {
            let password = config.bucket_password(bucket).unwrap_or_default().to_string();
            self.authenticate(bucket, &password, config.force_sasl_plain())
                .await?;
        }

        self.authenticated = true;
        tracing::debug!(
            id = %self.id,
            endpoint = %self.endpoint,
            bucket = bucket,
            "connection initialized"
        );
        Ok(())
    }

    async fn hello(&mut self) -> Result<()> {
        let request = OperationFrame::request(Opcode::Hello, 0)
            .with_key(Bytes::copy_from_slice(HELLO_CLIENT_ID.as_bytes()))
            .with_value(encode_feature_list(ServerFeature::desired()));
        let response = self.roundtrip(request).await?;

        if response.status().is_success() {
            self.features = decode_feature_list(&response.value);
        } else {
            // pre-HELLO servers reject the opcode; carry on featureless
            tracing::debug!(
                endpoint = %self.endpoint,
                status = %response.status(),
                "server declined HELLO"
            );
        }
        Ok(())
    }

    async fn fetch_error_map(&mut self) -> Result<()> {
        let mut version = BytesMut::with_capacity(2);
        version.put_u16(1);
        let request = OperationFrame::request(Opcode::GetErrorMap, 0).with_value(version.freeze());
        let response = self.roundtrip(request).await?;

        if response.status().is_success() {
            match ErrorMap::parse(&response.value) {
                Ok(map) => self.error_map = Some(map),
                Err(e) => {
                    tracing::warn!(endpoint = %self.endpoint, error = %e, "ignoring bad error map")
                }
            }
        }
        Ok(())
    }

    async fn authenticate(
        &mut self,
        username: &str,
        password: &str,
        force_plain: bool,
    ) -> Result<()> {
        let list = self
            .roundtrip(OperationFrame::request(Opcode::SaslList, 0))
            .await?;
        if !list.status().is_success() {
            return Err(CouchbaseError::Authentication(format!(
                "SASLList rejected with {}",
                list.status()
            )));
        }
        let mechanisms = String::from_utf8_lossy(&list.value).to_string();
        let mechanism = SaslMechanism::negotiate(&mechanisms, force_plain)?;

        let mut session = SaslSession::new(mechanism, username, password);
        let auth = OperationFrame::request(Opcode::SaslAuth, 0)
            .with_key(Bytes::copy_from_slice(mechanism.as_str().as_bytes()))
            .with_value(session.initial_response());
        let mut response = self.roundtrip(auth).await?;

        while response.status() == couchbase_core::ResponseStatus::AuthContinue {
            let step_payload = session.continue_response(&response.value)?;
            let step = OperationFrame::request(Opcode::SaslStep, 0)
                .with_key(Bytes::copy_from_slice(mechanism.as_str().as_bytes()))
                .with_value(step_payload);
            response = self.roundtrip(step).await?;
        }

        if !response.status().is_success() {
            return Err(CouchbaseError::Authentication(format!(
                "SASL {} rejected with {}",
                mechanism.as_str(),
                response.status()
            )));
        }
        session.verify_final(&response.value)?;

        tracing::debug!(
            endpoint = %self.endpoint,
            mechanism = mechanism.as_str(),
            "authenticated"
        );
        Ok(())
    }

    async fn select_bucket(&mut self, bucket: &str) -> Result<()> {
        let request = OperationFrame::request(Opcode::SelectBucket, 0)
            .with_key(Bytes::copy_from_slice(bucket.as_bytes()));
        let response = self.roundtrip(request).await?;

        if !response.status().is_success() {
            return Err(CouchbaseError::Authentication(format!(
                "SelectBucket {:?} rejected with {}",
                bucket,
                response.status()
            )));
        }
        Ok(())
    }

    /// Tears the connection apart for the multiplexed IO service.
    ///
    /// Returns the raw stream plus any bytes already read past the last
    /// bring-up response.
    pub(crate) fn into_parts(self) -> (ConnectionId, Box<dyn RawStream>, BytesMut) {
        (self.id, self.stream, self.read_buffer)
    }
}

fn apply_keepalive(stream: &TcpStream, config: &ClientConfig) -> Result<()> {
    let options = config.keep_alive();
    if !options.enabled() {
        return Ok(());
    }

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(options.time())
        .with_interval(options.interval());
    socket2::SockRef::from(stream)
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| CouchbaseError::Connect(format!("failed to set TCP keep-alive: {}", e)))?;
    Ok(())
}

/// Encodes the `Hello` feature list: one big-endian u16 per feature.
fn encode_feature_list(features: &[ServerFeature]) -> Bytes {
    let mut buf = BytesMut::with_capacity(features.len() * 2);
    for feature in features {
        buf.put_u16(feature.value());
    }
    buf.freeze()
}

/// Decodes the server-acknowledged feature subset, skipping unknown codes.
fn decode_feature_list(raw: &[u8]) -> Vec<ServerFeature> {
    raw.chunks_exact(2)
        .filter_map(|pair| ServerFeature::from_value(u16::from_be_bytes([pair[0], pair[1]])))
        .collect()
}
