//! Multiplexed IO service behavior under load, cancellation and socket loss.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use couchbase_client::io::IoService;
use couchbase_client::{ClientConfig, MultiplexedIoService, NodeEndpoint};
use couchbase_core::protocol::Opcode;
use couchbase_core::OperationFrame;

use common::{Mode, MockKvServer};

fn service_for(server: &MockKvServer) -> Arc<MultiplexedIoService> {
    let config = Arc::new(ClientConfig::builder().build().unwrap());
    Arc::new(MultiplexedIoService::new(
        NodeEndpoint::new("127.0.0.1", server.addr().port()),
        "default",
        config,
    ))
}

#[tokio::test]
async fn test_concurrent_operations_share_one_connection() {
    let server = MockKvServer::start(10).await;
    let service = service_for(&server);

    // seed a document through the same service
    let deadline = Instant::now() + Duration::from_secs(5);
    let seed = OperationFrame::request(Opcode::Set, 3)
        .with_key(&b"shared"[..])
        .with_value(&b"payload"[..]);
    let stored = service.execute(seed, deadline).await.unwrap();
    assert!(stored.status().is_success());

    let mut handles = Vec::new();
    for _ in 0..64 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            let frame = OperationFrame::request(Opcode::Get, 3).with_key(&b"shared"[..]);
            service
                .execute(frame, Instant::now() + Duration::from_secs(5))
                .await
        }));
    }

    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert!(response.status().is_success());
        assert_eq!(&response.value[..], &b"payload"[..]);
    }
    assert_eq!(service.in_flight_len(), 0);

    service.dispose().await;
}

#[tokio::test]
async fn test_socket_close_fails_all_outstanding_operations() {
    let server = MockKvServer::start(10).await;
    let service = service_for(&server);

    // warm the connection up while the server still answers
    let warmup = OperationFrame::request(Opcode::Get, 0).with_key(&b"warm"[..]);
    let _ = service
        .execute(warmup, Instant::now() + Duration::from_secs(5))
        .await;

    // swallow every data request, closing the socket at the thousandth
    server.set_mode(Mode::BlackHoleThenClose(1000));

    let deadline = Instant::now() + Duration::from_secs(1);
    let mut handles = Vec::new();
    for i in 0..1000u32 {
        let service = Arc::clone(&service);
        let key = format!("doomed-{}", i).into_bytes();
        handles.push(tokio::spawn(async move {
            service
                .execute(OperationFrame::request(Opcode::Get, 0).with_key(key), deadline)
                .await
        }));
    }

    for handle in handles {
        let result = handle.await.unwrap();
        assert!(result.is_err(), "an operation survived the socket close");
    }

    // the in-flight table drains completely
    assert_eq!(service.in_flight_len(), 0);

    service.dispose().await;
}

#[tokio::test]
async fn test_cancellation_removes_in_flight_entry() {
    let server = MockKvServer::start(10).await;
    let service = service_for(&server);

    // warm up so the cancelled operation is actually written
    let warmup = OperationFrame::request(Opcode::Get, 0).with_key(&b"warm"[..]);
    let _ = service
        .execute(warmup, Instant::now() + Duration::from_secs(5))
        .await;

    server.set_mode(Mode::BlackHoleThenClose(usize::MAX));

    let hung = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            let frame = OperationFrame::request(Opcode::Get, 0).with_key(&b"hung"[..]);
            service
                .execute(frame, Instant::now() + Duration::from_secs(60))
                .await
        })
    };

    // give the submission a moment to land in the table
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(service.in_flight_len(), 1);

    hung.abort();
    let _ = hung.await;

    assert_eq!(service.in_flight_len(), 0);

    service.dispose().await;
}

#[tokio::test]
async fn test_submit_deadline_covers_connection_bring_up() {
    // a peer that accepts the TCP connection but never answers the
    // handshake; the operation deadline must still hold
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let _held_open = stream;
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }
    });

    let config = Arc::new(ClientConfig::builder().build().unwrap());
    let service = MultiplexedIoService::new(
        NodeEndpoint::new("127.0.0.1", addr.port()),
        "default",
        config,
    );

    let started = Instant::now();
    let result = service
        .execute(
            OperationFrame::request(Opcode::Get, 0).with_key(&b"k"[..]),
            Instant::now() + Duration::from_millis(200),
        )
        .await;

    assert!(matches!(
        result,
        Err(couchbase_core::CouchbaseError::OperationTimeout(_))
    ));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(service.in_flight_len(), 0);

    service.dispose().await;
}

#[tokio::test]
async fn test_expired_deadline_is_swept() {
    let server = MockKvServer::start(10).await;
    let service = service_for(&server);

    let warmup = OperationFrame::request(Opcode::Get, 0).with_key(&b"warm"[..]);
    let _ = service
        .execute(warmup, Instant::now() + Duration::from_secs(5))
        .await;

    server.set_mode(Mode::BlackHoleThenClose(usize::MAX));

    let frame = OperationFrame::request(Opcode::Get, 0).with_key(&b"slow"[..]);
    let result = service
        .execute(frame, Instant::now() + Duration::from_millis(100))
        .await;

    assert!(matches!(
        result,
        Err(couchbase_core::CouchbaseError::OperationTimeout(_))
    ));
    assert_eq!(service.in_flight_len(), 0);

    service.dispose().await;
}
