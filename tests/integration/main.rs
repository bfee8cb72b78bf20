//! tether integration test harness.
//!
//! Every test runs an in-process stub daemon on loopback sockets and drives
//! a real worker against it through the socket transport:
//!
//!   cargo test --test integration
//!
//! Daemon halves run in spawned tasks; the worker runs on the test task.

mod enrollment;
mod secure;
mod session;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::net::TcpListener;

use tether_core::crypto::KeyPair;
use tether_core::message::WORKER_BROADCAST_TOPIC;
use tether_core::wire;
use tether_core::Envelope;
use tether_worker::transport::net::SUBSCRIBE_COMMAND;
use tether_worker::transport::Connection;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Bind a loopback listener. Returns it with its `tcp://` address.
pub async fn listen() -> Result<(TcpListener, String)> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind loopback listener")?;
    let addr = listener.local_addr()?;
    Ok((listener, format!("tcp://{addr}")))
}

/// Accept one worker connection, running the daemon side of the
/// handshake when `keys` is set.
pub async fn accept(listener: &TcpListener, keys: Option<&KeyPair>) -> Result<Connection> {
    let (stream, _) = listener.accept().await.context("accept failed")?;
    stream.set_nodelay(true)?;
    match keys {
        Some(keys) => {
            let (conn, _remote) = Connection::respond(Box::new(stream), keys)
                .await
                .context("daemon-side handshake failed")?;
            Ok(conn)
        }
        None => Ok(Connection::plain(Box::new(stream))),
    }
}

/// Receive one message; returns its parts and the decoded final part.
pub async fn recv_envelope(conn: &mut Connection) -> Result<(Vec<Bytes>, Envelope)> {
    let parts = conn.recv().await.context("daemon recv failed")?;
    let body = parts.last().context("empty message")?;
    let envelope = wire::decode(body).context("daemon could not decode message")?;
    Ok((parts, envelope))
}

/// Answer on the correlated channel.
pub async fn reply(conn: &mut Connection, envelope: &Envelope) -> Result<()> {
    conn.send(&[wire::encode(envelope)])
        .await
        .context("daemon reply failed")?;
    Ok(())
}

/// Publish on the worker topic.
pub async fn publish(conn: &mut Connection, envelope: &Envelope) -> Result<()> {
    publish_on(conn, WORKER_BROADCAST_TOPIC, envelope).await
}

pub async fn publish_on(conn: &mut Connection, topic: &[u8], envelope: &Envelope) -> Result<()> {
    conn.send(&[Bytes::copy_from_slice(topic), wire::encode(envelope)])
        .await
        .context("daemon publish failed")?;
    Ok(())
}

/// Consume the subscriber's opening frame and check the topic.
pub async fn expect_subscribe(conn: &mut Connection) -> Result<()> {
    let parts = conn.recv().await.context("no subscribe frame")?;
    if parts.len() != 2 || &parts[0][..] != SUBSCRIBE_COMMAND {
        bail!("malformed subscribe frame: {parts:?}");
    }
    if &parts[1][..] != WORKER_BROADCAST_TOPIC {
        bail!("worker subscribed to {:?}", String::from_utf8_lossy(&parts[1]));
    }
    Ok(())
}

/// Accept the attach on `requests`, answer `Attached`, then accept the
/// subscription on `broadcasts`. Returns both daemon-side connections.
pub async fn accept_worker(
    requests: &TcpListener,
    broadcasts: &TcpListener,
    keys: Option<&KeyPair>,
) -> Result<(Connection, Connection)> {
    let mut req = accept(requests, keys).await?;
    let (parts, envelope) = recv_envelope(&mut req).await?;
    match envelope {
        Envelope::AttachWorker { worker_id, .. } if &parts[0][..] == worker_id.as_bytes() => {}
        other => bail!("expected AttachWorker, got {other:?}"),
    }
    reply(&mut req, &Envelope::Attached).await?;

    let mut sub = accept(broadcasts, keys).await?;
    expect_subscribe(&mut sub).await?;
    Ok((req, sub))
}
