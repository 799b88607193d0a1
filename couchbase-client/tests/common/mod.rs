//! In-process mock data node speaking the memcached binary protocol.

// each integration binary uses a different slice of this helper
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use couchbase_core::protocol::{Opcode, ResponseStatus};
use couchbase_core::OperationFrame;

/// How the mock answers data operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Serve from the in-memory store.
    Normal,
    /// Swallow data requests, then close the socket after this many.
    BlackHoleThenClose(usize),
}

#[derive(Debug, Default)]
struct Stored {
    value: Vec<u8>,
    flags: u32,
    cas: u64,
}

struct State {
    store: Mutex<HashMap<Vec<u8>, Stored>>,
    cas_counter: Mutex<u64>,
    mode: Mutex<Mode>,
    /// Raw topology doc returned once with the next `NotMyVbucket`.
    nmv_redirect: Mutex<Option<String>>,
    config_doc: Mutex<String>,
}

/// A mock data node bound to an ephemeral port.
pub struct MockKvServer {
    addr: SocketAddr,
    state: Arc<State>,
}

impl MockKvServer {
    /// Starts a server whose topology maps every partition to itself.
    pub async fn start(revision: u64) -> MockKvServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let state = Arc::new(State {
            store: Mutex::new(HashMap::new()),
            cas_counter: Mutex::new(1),
            mode: Mutex::new(Mode::Normal),
            nmv_redirect: Mutex::new(None),
            config_doc: Mutex::new(config_doc(revision, addr.port())),
        });

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve(stream, Arc::clone(&accept_state)));
            }
        });

        MockKvServer { addr, state }
    }

    /// Returns the bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns a `couchbase://` bootstrap URI for this server.
    pub fn bootstrap_uri(&self) -> url::Url {
        url::Url::parse(&format!("couchbase://127.0.0.1:{}", self.addr.port())).unwrap()
    }

    /// Switches the data-path answering mode.
    pub fn set_mode(&self, mode: Mode) {
        *self.state.mode.lock() = mode;
    }

    /// Arms a one-shot `NotMyVbucket` response carrying a topology that maps
    /// every partition to `target`.
    pub fn redirect_once_to(&self, target: &MockKvServer, revision: u64) {
        *self.state.nmv_redirect.lock() = Some(config_doc(revision, target.addr().port()));
    }

    /// Returns the stored bytes for a key, if present.
    pub fn stored_value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state
            .store
            .lock()
            .get(key)
            .map(|entry| entry.value.clone())
    }
}

/// Renders a single-node topology document with a `$HOST` placeholder.
pub fn config_doc(revision: u64, kv_port: u16) -> String {
    format!(
        r#"{{
            "rev": {rev},
            "name": "default",
            "nodeLocator": "vbucket",
            "nodesExt": [{{"hostname": "127.0.0.1", "services": {{"kv": {port}, "mgmt": 8091}}}}],
            "vBucketServerMap": {{
                "hashAlgorithm": "CRC",
                "numReplicas": 0,
                "serverList": ["127.0.0.1:{port}"],
                "vBucketMap": [[0], [0], [0], [0], [0], [0], [0], [0]]
            }}
        }}"#,
        rev = revision,
        port = kv_port
    )
}

async fn serve(mut stream: TcpStream, state: Arc<State>) {
    let mut buffer = BytesMut::with_capacity(8192);
    let mut swallowed = 0usize;

    loop {
        let request = loop {
            match OperationFrame::read_from(&mut buffer) {
                Ok(Some(frame)) => break frame,
                Ok(None) => {}
                Err(_) => return,
            }
            match stream.read_buf(&mut buffer).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        };

        let response = match request.opcode {
            Opcode::Hello => {
                // acknowledge everything the client asked for
                respond(&request, ResponseStatus::Success).with_value(request.value.clone())
            }
            Opcode::SaslList => {
                respond(&request, ResponseStatus::Success).with_value(&b"PLAIN"[..])
            }
            Opcode::SaslAuth | Opcode::SaslStep | Opcode::SelectBucket => {
                respond(&request, ResponseStatus::Success)
            }
            Opcode::GetErrorMap => respond(&request, ResponseStatus::Success)
                .with_value(&br#"{"version":1,"revision":1,"errors":{}}"#[..]),
            Opcode::GetClusterConfig => {
                let doc = state.config_doc.lock().clone();
                respond(&request, ResponseStatus::Success).with_value(doc.into_bytes())
            }
            Opcode::NoOp => respond(&request, ResponseStatus::Success),
            Opcode::Get | Opcode::Set => {
                let mode = *state.mode.lock();
                if let Mode::BlackHoleThenClose(limit) = mode {
                    swallowed += 1;
                    if swallowed >= limit {
                        return;
                    }
                    continue;
                }
                data_op(&request, &state)
            }
            _ => respond(&request, ResponseStatus::UnknownCommand),
        };

        let mut out = BytesMut::new();
        response.write_to(&mut out);
        if stream.write_all(&out).await.is_err() {
            return;
        }
    }
}

fn data_op(request: &OperationFrame, state: &State) -> OperationFrame {
    match request.opcode {
        Opcode::Set => {
            if let Some(doc) = state.nmv_redirect.lock().take() {
                return respond(request, ResponseStatus::NotMyVbucket)
                    .with_value(doc.into_bytes());
            }

            let cas = {
                let mut counter = state.cas_counter.lock();
                *counter += 1;
                *counter
            };
            let flags = if request.extras.len() >= 4 {
                u32::from_be_bytes([
                    request.extras[0],
                    request.extras[1],
                    request.extras[2],
                    request.extras[3],
                ])
            } else {
                0
            };
            state.store.lock().insert(
                request.key.to_vec(),
                Stored {
                    value: request.value.to_vec(),
                    flags,
                    cas,
                },
            );
            respond(request, ResponseStatus::Success).with_cas(cas)
        }
        Opcode::Get => match state.store.lock().get(request.key.as_ref()) {
            Some(entry) => {
                let mut extras = BytesMut::with_capacity(4);
                extras.put_u32(entry.flags);
                respond(request, ResponseStatus::Success)
                    .with_extras(extras.freeze())
                    .with_value(Bytes::from(entry.value.clone()))
                    .with_cas(entry.cas)
            }
            None => respond(request, ResponseStatus::KeyNotFound)
                .with_value(&b"Not found"[..]),
        },
        _ => respond(request, ResponseStatus::UnknownCommand),
    }
}

fn respond(request: &OperationFrame, status: ResponseStatus) -> OperationFrame {
    let mut response = OperationFrame::response(request.opcode, status);
    response.opaque = request.opaque;
    response
}
