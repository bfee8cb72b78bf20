use std::sync::Arc;

use std::time::Duration;

use tether_core::crypto::{CryptoError, KeyPair};
use tether_core::message::WorkItem;
use tether_core::{Envelope, RequestId, TypedValue, WorkerId};
use tether_worker::transport::ChannelKeys;
use tether_worker::{
    EchoProcessor, Endpoint, NetTransport, RunOutcome, SessionError, TransportError,
    WorkerSession,
};

use crate::*;

#[tokio::test]
async fn test_sealed_session_with_pinned_daemon() {
    let (requests, request_addr) = listen().await.unwrap();
    let (broadcasts, broadcast_addr) = listen().await.unwrap();
    let daemon_keys = Arc::new(KeyPair::generate());
    let worker_keys = Arc::new(KeyPair::generate());
    let daemon_public = daemon_keys.public;
    let worker_public = worker_keys.public;

    let daemon = tokio::spawn(async move {
        let (stream, _) = requests.accept().await?;
        let (mut req, remote) = Connection::respond(Box::new(stream), &daemon_keys).await?;
        anyhow::ensure!(remote == worker_public, "worker presented an unknown key");
        recv_envelope(&mut req).await?;
        reply(&mut req, &Envelope::Attached).await?;

        let mut sub = accept(&broadcasts, Some(&daemon_keys)).await?;
        expect_subscribe(&mut sub).await?;
        publish(&mut sub, &Envelope::Ping).await?;
        let (_, pong) = recv_envelope(&mut req).await?;
        reply(&mut req, &Envelope::Ack).await?;
        publish(&mut sub, &Envelope::Terminate { target: None }).await?;
        anyhow::Ok(pong)
    });

    let transport = NetTransport::new(
        Endpoint::parse(&request_addr).unwrap(),
        Endpoint::parse(&broadcast_addr).unwrap(),
    )
    .sealed(ChannelKeys {
        local: worker_keys,
        daemon_public,
    });
    let worker_id = WorkerId::new_random();
    let mut session = WorkerSession::new(transport, worker_id, "echo");
    session.attach().await.unwrap();
    session.subscribe().await.unwrap();
    assert_eq!(
        session.run(&mut EchoProcessor).await.unwrap(),
        RunOutcome::Terminated
    );

    let pong = daemon.await.unwrap().unwrap();
    assert!(matches!(pong, Envelope::Pong { worker_id: id, .. } if id == worker_id));
}

#[tokio::test]
async fn test_sealed_result_larger_than_one_noise_message() {
    let (requests, request_addr) = listen().await.unwrap();
    let (broadcasts, broadcast_addr) = listen().await.unwrap();
    let daemon_keys = Arc::new(KeyPair::generate());
    let daemon_public = daemon_keys.public;
    let worker_id = WorkerId::new_random();
    let request_id = RequestId::new_random();
    let big = "x".repeat(100_000);

    let payload = big.clone();
    let daemon = tokio::spawn(async move {
        let (mut req, mut sub) = accept_worker(&requests, &broadcasts, Some(&daemon_keys)).await?;
        let item = WorkItem {
            request_id,
            destination: worker_id,
            arguments: vec![TypedValue::str(payload)],
            timeout: Some(Duration::from_secs(5)),
        };
        publish(&mut sub, &Envelope::WorkRequest(item)).await?;
        let (_, result) = recv_envelope(&mut req).await?;
        reply(&mut req, &Envelope::Ack).await?;
        publish(&mut sub, &Envelope::Terminate { target: None }).await?;
        anyhow::Ok(result)
    });

    let transport = NetTransport::new(
        Endpoint::parse(&request_addr).unwrap(),
        Endpoint::parse(&broadcast_addr).unwrap(),
    )
    .sealed(ChannelKeys {
        local: Arc::new(KeyPair::generate()),
        daemon_public,
    });
    let mut session = WorkerSession::new(transport, worker_id, "echo");
    session.attach().await.unwrap();
    session.subscribe().await.unwrap();
    assert_eq!(
        session.run(&mut EchoProcessor).await.unwrap(),
        RunOutcome::Terminated
    );

    let result = daemon.await.unwrap().unwrap();
    assert_eq!(
        result,
        Envelope::WorkResult {
            worker_id,
            request_id,
            result: TypedValue::List(vec![TypedValue::str("echo_response"), TypedValue::str(big)]),
        }
    );
}

#[tokio::test]
async fn test_impostor_daemon_is_refused() {
    let (requests, request_addr) = listen().await.unwrap();
    let (_broadcasts, broadcast_addr) = listen().await.unwrap();
    let impostor = Arc::new(KeyPair::generate());
    let enrolled_daemon = KeyPair::generate();

    let daemon = tokio::spawn(async move {
        // The worker aborts the handshake, so this side fails too.
        let _ = accept(&requests, Some(&impostor)).await;
    });

    let transport = NetTransport::new(
        Endpoint::parse(&request_addr).unwrap(),
        Endpoint::parse(&broadcast_addr).unwrap(),
    )
    .sealed(ChannelKeys {
        local: Arc::new(KeyPair::generate()),
        daemon_public: enrolled_daemon.public,
    });
    let mut session = WorkerSession::new(transport, WorkerId::new_random(), "echo");
    match session.attach().await {
        Err(SessionError::Transport(TransportError::Crypto(CryptoError::UnexpectedPeer(_)))) => {}
        other => panic!("expected UnexpectedPeer, got {other:?}"),
    }
    daemon.await.unwrap();
}
