use std::time::Duration;

use tether_core::crypto::KeyPair;
use tether_core::identity::KeyStore;
use tether_core::message::EnrollmentResponse;
use tether_core::Envelope;
use tether_worker::{
    EnrollmentClient, EnrollmentError, Endpoint, NetEnroller, RetryPolicy, TokenResolver,
};

use crate::*;

fn quick_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        max_attempts,
    }
}

#[tokio::test]
async fn test_enroll_then_reuse_identity() {
    let dir = tempfile::tempdir().unwrap();
    let (listener, addr) = listen().await.unwrap();
    let daemon = KeyPair::generate();
    let daemon_key = daemon.public_z85();

    let expected_key = daemon_key.clone();
    let daemon_task = tokio::spawn(async move {
        let mut conn = accept(&listener, None).await?;
        let (_, envelope) = recv_envelope(&mut conn).await?;
        let Envelope::EnrollmentRequest(request) = envelope else {
            anyhow::bail!("expected EnrollmentRequest, got {envelope:?}");
        };
        reply(
            &mut conn,
            &Envelope::EnrollmentResponse(EnrollmentResponse::accepted(expected_key, "w-1")),
        )
        .await?;
        anyhow::Ok(request)
    });

    let store = KeyStore::new(dir.path(), "echo-worker");
    let mut client = EnrollmentClient::new(
        store.clone(),
        NetEnroller::new(Endpoint::parse(&addr).unwrap()),
        TokenResolver::default().explicit("tok-123"),
        "it-host",
    )
    .with_policy(quick_policy(3));

    let enrolled = client.ensure_enrolled().await.unwrap();
    assert_eq!(enrolled.worker_identifier, "w-1");
    assert_eq!(enrolled.daemon_public_key, daemon_key);

    let request = daemon_task.await.unwrap().unwrap();
    assert_eq!(request.token, "tok-123");
    assert_eq!(request.service_type, "echo-worker");
    assert_eq!(request.hostname, "it-host");
    assert_eq!(
        request.public_key,
        store.load_or_generate_keypair().unwrap().public_z85()
    );

    // The daemon is gone; a restarted worker must not need it.
    let mut restarted = EnrollmentClient::new(
        store.clone(),
        NetEnroller::new(Endpoint::parse(&addr).unwrap()),
        TokenResolver::default(),
        "it-host",
    )
    .with_policy(quick_policy(1));
    assert_eq!(restarted.ensure_enrolled().await.unwrap(), enrolled);
}

#[tokio::test]
async fn test_refused_then_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let (listener, addr) = listen().await.unwrap();
    let daemon_key = KeyPair::generate().public_z85();

    let key = daemon_key.clone();
    let daemon_task = tokio::spawn(async move {
        // One connection per attempt.
        let mut first = accept(&listener, None).await?;
        recv_envelope(&mut first).await?;
        reply(
            &mut first,
            &Envelope::EnrollmentResponse(EnrollmentResponse::refused("token not yet valid")),
        )
        .await?;

        let mut second = accept(&listener, None).await?;
        recv_envelope(&mut second).await?;
        reply(
            &mut second,
            &Envelope::EnrollmentResponse(EnrollmentResponse::accepted(key, "w-2")),
        )
        .await?;
        anyhow::Ok(())
    });

    let mut client = EnrollmentClient::new(
        KeyStore::new(dir.path(), "echo-worker"),
        NetEnroller::new(Endpoint::parse(&addr).unwrap()),
        TokenResolver::default().explicit("tok-123"),
        "it-host",
    )
    .with_policy(quick_policy(5));

    let enrolled = client.ensure_enrolled().await.unwrap();
    assert_eq!(enrolled.worker_identifier, "w-2");
    daemon_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unreachable_daemon_exhausts_retries() {
    let dir = tempfile::tempdir().unwrap();
    // Bind then drop so the port is (almost certainly) closed.
    let (listener, addr) = listen().await.unwrap();
    drop(listener);

    let mut client = EnrollmentClient::new(
        KeyStore::new(dir.path(), "echo-worker"),
        NetEnroller::new(Endpoint::parse(&addr).unwrap()),
        TokenResolver::default().explicit("tok-123"),
        "it-host",
    )
    .with_policy(quick_policy(3));

    match client.ensure_enrolled().await {
        Err(EnrollmentError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert!(KeyStore::new(dir.path(), "echo-worker")
        .load_identity()
        .unwrap()
        .is_none());
}
