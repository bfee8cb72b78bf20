use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_util::codec::Framed;

use tether_core::message::WorkItem;
use tether_core::{Envelope, RequestId, TypedValue, WorkErrorKind, WorkerId};
use tether_worker::transport::frame::{encode_parts, record_codec};
use tether_worker::{
    EchoProcessor, Endpoint, NetTransport, RunOutcome, SessionError, SessionState, WorkError,
    WorkerSession,
};

use crate::*;

fn work(destination: WorkerId, request_id: RequestId, args: Vec<TypedValue>) -> Envelope {
    Envelope::WorkRequest(WorkItem {
        request_id,
        destination,
        arguments: args,
        timeout: Some(Duration::from_secs(5)),
    })
}

#[tokio::test]
async fn test_echo_round_trip_over_tcp() {
    let (requests, request_addr) = listen().await.unwrap();
    let (broadcasts, broadcast_addr) = listen().await.unwrap();
    let worker_id = WorkerId::new_random();
    let request_id = RequestId::new_random();

    let daemon = tokio::spawn(async move {
        let (mut req, mut sub) = accept_worker(&requests, &broadcasts, None).await?;

        // Noise the worker must ignore.
        publish_on(&mut sub, b"hosts", &Envelope::Terminate { target: None }).await?;
        publish(
            &mut sub,
            &work(WorkerId::new_random(), RequestId::new_random(), vec![]),
        )
        .await?;

        publish(&mut sub, &Envelope::Ping).await?;
        let (_, pong) = recv_envelope(&mut req).await?;
        reply(&mut req, &Envelope::Ack).await?;

        publish(
            &mut sub,
            &work(worker_id, request_id, vec![TypedValue::str("hello")]),
        )
        .await?;
        let (parts, result) = recv_envelope(&mut req).await?;
        reply(&mut req, &Envelope::Ack).await?;

        publish(&mut sub, &Envelope::Terminate { target: Some(worker_id) }).await?;
        anyhow::Ok((pong, parts, result))
    });

    let transport = NetTransport::new(
        Endpoint::parse(&request_addr).unwrap(),
        Endpoint::parse(&broadcast_addr).unwrap(),
    );
    let mut session = WorkerSession::new(transport, worker_id, "echo");
    session.attach().await.unwrap();
    session.subscribe().await.unwrap();

    let outcome = session.run(&mut EchoProcessor).await.unwrap();
    assert_eq!(outcome, RunOutcome::Terminated);
    assert_eq!(session.state(), SessionState::Terminated);
    session.shutdown();

    let (pong, parts, result) = daemon.await.unwrap().unwrap();
    assert_eq!(
        pong,
        Envelope::Pong {
            worker_id,
            worker_type: "echo".into(),
        }
    );
    assert_eq!(&parts[0][..], worker_id.as_bytes());
    assert_eq!(
        result,
        Envelope::WorkResult {
            worker_id,
            request_id,
            result: TypedValue::List(vec![
                TypedValue::str("echo_response"),
                TypedValue::str("hello"),
            ]),
        }
    );
}

#[tokio::test]
async fn test_rejected_attach_is_fatal() {
    let (requests, request_addr) = listen().await.unwrap();
    let (_broadcasts, broadcast_addr) = listen().await.unwrap();

    let daemon = tokio::spawn(async move {
        let mut req = accept(&requests, None).await?;
        recv_envelope(&mut req).await?;
        reply(
            &mut req,
            &Envelope::Rejected {
                reason: "unknown worker type".into(),
            },
        )
        .await?;
        anyhow::Ok(())
    });

    let transport = NetTransport::new(
        Endpoint::parse(&request_addr).unwrap(),
        Endpoint::parse(&broadcast_addr).unwrap(),
    );
    let mut session = WorkerSession::new(transport, WorkerId::new_random(), "echo");
    match session.attach().await {
        Err(SessionError::Rejected(reason)) => assert_eq!(reason, "unknown worker type"),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Rejected);
    daemon.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_daemon_disconnect_ends_session() {
    let (requests, request_addr) = listen().await.unwrap();
    let (broadcasts, broadcast_addr) = listen().await.unwrap();

    let daemon = tokio::spawn(async move {
        let (req, sub) = accept_worker(&requests, &broadcasts, None).await?;
        drop(sub);
        drop(req);
        anyhow::Ok(())
    });

    let transport = NetTransport::new(
        Endpoint::parse(&request_addr).unwrap(),
        Endpoint::parse(&broadcast_addr).unwrap(),
    );
    let mut session = WorkerSession::new(transport, WorkerId::new_random(), "echo");
    session.attach().await.unwrap();
    session.subscribe().await.unwrap();
    daemon.await.unwrap().unwrap();

    assert!(matches!(
        session.run(&mut EchoProcessor).await,
        Err(SessionError::Transport(_))
    ));
}

#[tokio::test]
async fn test_malformed_broadcast_record_is_skipped() {
    let (requests, request_addr) = listen().await.unwrap();
    let (broadcasts, broadcast_addr) = listen().await.unwrap();
    let worker_id = WorkerId::new_random();

    let daemon = tokio::spawn(async move {
        let mut req = accept(&requests, None).await?;
        recv_envelope(&mut req).await?;
        reply(&mut req, &Envelope::Attached).await?;

        // Drive the broadcast side at the record layer.
        let (stream, _) = broadcasts.accept().await?;
        let mut raw = Framed::new(stream, record_codec());
        raw.next().await.context("no subscribe frame")??;

        // Two parts announced, one present.
        raw.send(Bytes::from_static(&[2, 0, 3, 0, 0, 0, b'a', b'b', b'c']))
            .await?;
        let topic = Bytes::from_static(WORKER_BROADCAST_TOPIC);
        raw.send(encode_parts(&[topic.clone(), wire::encode(&Envelope::Ping)])?)
            .await?;
        let (_, pong) = recv_envelope(&mut req).await?;
        reply(&mut req, &Envelope::Ack).await?;

        let stop = wire::encode(&Envelope::Terminate { target: None });
        raw.send(encode_parts(&[topic, stop])?).await?;
        anyhow::Ok(pong)
    });

    let transport = NetTransport::new(
        Endpoint::parse(&request_addr).unwrap(),
        Endpoint::parse(&broadcast_addr).unwrap(),
    );
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
async fn test_panicking_processor_keeps_serving() {
    let (requests, request_addr) = listen().await.unwrap();
    let (broadcasts, broadcast_addr) = listen().await.unwrap();
    let worker_id = WorkerId::new_random();
    let request_id = RequestId::new_random();

    let daemon = tokio::spawn(async move {
        let (mut req, mut sub) = accept_worker(&requests, &broadcasts, None).await?;

        publish(&mut sub, &work(worker_id, request_id, vec![])).await?;
        let (_, failure) = recv_envelope(&mut req).await?;
        reply(&mut req, &Envelope::Ack).await?;

        publish(&mut sub, &Envelope::Ping).await?;
        let (_, pong) = recv_envelope(&mut req).await?;
        reply(&mut req, &Envelope::Ack).await?;

        publish(&mut sub, &Envelope::Terminate { target: None }).await?;
        anyhow::Ok((failure, pong))
    });

    let transport = NetTransport::new(
        Endpoint::parse(&request_addr).unwrap(),
        Endpoint::parse(&broadcast_addr).unwrap(),
    );
    let mut session = WorkerSession::new(transport, worker_id, "echo");
    session.attach().await.unwrap();
    session.subscribe().await.unwrap();

    let mut first_arg =
        |args: Vec<TypedValue>, _: Option<Duration>| Ok::<_, WorkError>(args[0].clone());
    assert_eq!(
        session.run(&mut first_arg).await.unwrap(),
        RunOutcome::Terminated
    );

    let (failure, pong) = daemon.await.unwrap().unwrap();
    match failure {
        Envelope::WorkError {
            request_id: id,
            kind,
            message,
            ..
        } => {
            assert_eq!(id, request_id);
            assert_eq!(kind, WorkErrorKind::InternalError);
            assert!(message.contains("panicked"), "{message}");
        }
        other => panic!("expected WorkError, got {other:?}"),
    }
    assert!(matches!(pong, Envelope::Pong { .. }));
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_endpoints() {
    use tokio::net::UnixListener;
    use tether_worker::transport::Connection;

    let dir = tempfile::tempdir().unwrap();
    let request_path = dir.path().join("rpc.sock");
    let broadcast_path = dir.path().join("events.sock");
    let requests = UnixListener::bind(&request_path).unwrap();
    let broadcasts = UnixListener::bind(&broadcast_path).unwrap();

    let daemon = tokio::spawn(async move {
        let (stream, _) = requests.accept().await?;
        let mut req = Connection::plain(Box::new(stream));
        let (_, attach) = recv_envelope(&mut req).await?;
        reply(&mut req, &Envelope::Attached).await?;

        let (stream, _) = broadcasts.accept().await?;
        let mut sub = Connection::plain(Box::new(stream));
        expect_subscribe(&mut sub).await?;
        publish(&mut sub, &Envelope::Terminate { target: None }).await?;
        anyhow::Ok(attach)
    });

    let request = Endpoint::parse(&format!("ipc://{}", request_path.display())).unwrap();
    assert!(request.is_local());
    let broadcast = Endpoint::parse(&format!("ipc://{}", broadcast_path.display())).unwrap();

    let worker_id = WorkerId::new_random();
    let mut session = WorkerSession::new(NetTransport::new(request, broadcast), worker_id, "echo");
    session.attach().await.unwrap();
    session.subscribe().await.unwrap();
    assert_eq!(
        session.run(&mut EchoProcessor).await.unwrap(),
        RunOutcome::Terminated
    );

    let attach = daemon.await.unwrap().unwrap();
    assert!(matches!(attach, Envelope::AttachWorker { worker_id: id, .. } if id == worker_id));
}
