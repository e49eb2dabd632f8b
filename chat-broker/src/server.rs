//! TCP session layer in front of a [`Broker`].
//!
//! Each connection becomes one subscriber: after a `hello` handshake the
//! session claims its identity with a fresh bounded outbox, forwards the
//! client's frames into the broker, and drains the outbox back onto the
//! socket. The session unregisters itself when the connection ends.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::{
    io::AsyncRead,
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    broker::Broker,
    config::SessionConfig,
    error::BrokerError,
    identity::validate_identity,
    message::{ClientFrame, FrameReader, Message, ServerFrame, write_frame},
    registry::Outbox,
};

pub struct Server {
    listener: TcpListener,
    broker: Broker,
    config: SessionConfig,
}

impl Server {
    pub fn new(listener: TcpListener, broker: Broker, config: SessionConfig) -> Self {
        Self {
            listener,
            broker,
            config,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Starts the broker's dispatch loop and accepts connections until the
    /// broker's cancellation token fires.
    pub async fn run(self) -> Result<()> {
        let Server {
            listener,
            broker,
            config,
        } = self;

        let dispatcher = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.run().await })
        };

        loop {
            select! {
                _ = broker.closed() => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &broker, config);
                }
            }
        }

        info!("listener closed; waiting for dispatcher");
        dispatcher
            .await
            .context("dispatcher task panicked")?
            .context("dispatcher failed to start")?;
        Ok(())
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    broker: &Broker,
    config: SessionConfig,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, broker, config),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, broker: &Broker, config: SessionConfig) {
    let broker = broker.clone();
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, broker, config).await {
            warn!(peer = %peer, error = ?err, "session closed with error");
        }
    });
}

async fn handle_connection(stream: TcpStream, broker: Broker, config: SessionConfig) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, mut writer) = stream.into_split();
    let mut frames = FrameReader::new(reader);

    let id = select! {
        handshake = perform_handshake(&mut frames, &mut writer) => handshake?,
        _ = broker.closed() => {
            let _ = send_error(&mut writer, "broker shutting down").await;
            anyhow::bail!("broker closed during handshake");
        }
    };
    let (outbox, mut inbox) = mpsc::channel(config.outbox_capacity);
    claim_and_welcome(&broker, &mut writer, &id, outbox.clone()).await?;
    info!(?peer, id = %id, "session joined");

    let result = run_session(&broker, &mut frames, &mut writer, &id, &mut inbox).await;

    if broker.unregister_user_if_current(&id, &outbox) {
        info!(?peer, id = %id, "session left");
    }
    result
}

async fn perform_handshake<R, W>(frames: &mut FrameReader<R>, writer: &mut W) -> Result<String>
where
    R: AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let hello = match frames.next_frame::<ClientFrame>().await? {
        Some(frame) => frame,
        None => anyhow::bail!("connection closed before handshake"),
    };

    let raw = match hello {
        ClientFrame::Hello { id } => id,
        _ => {
            send_error(writer, "expected hello first").await?;
            anyhow::bail!("expected hello frame first");
        }
    };

    match validate_identity(&raw) {
        Ok(id) => Ok(id),
        Err(err) => {
            send_error(writer, &err.to_string()).await?;
            anyhow::bail!("rejected identity: {err}");
        }
    }
}

async fn claim_and_welcome<W>(broker: &Broker, writer: &mut W, id: &str, outbox: Outbox) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    if let Err(err) = broker.claim_user(id, outbox) {
        warn!(id, error = err.as_label(), "identity claim refused");
        send_error(writer, &err.to_string()).await?;
        anyhow::bail!(err);
    }

    write_frame(writer, &ServerFrame::Welcome { id: id.to_string() }).await?;
    Ok(())
}

async fn run_session<R, W>(
    broker: &Broker,
    frames: &mut FrameReader<R>,
    writer: &mut W,
    id: &str,
    inbox: &mut mpsc::Receiver<Message>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    loop {
        select! {
            _ = broker.closed() => {
                // Best effort: the peer may already be gone.
                let _ = send_error(writer, "broker shutting down").await;
                break;
            }
            frame = frames.next_frame::<ClientFrame>() => {
                if !handle_client_frame(frame, writer, broker, id).await? {
                    break;
                }
            }
            delivery = inbox.recv() => {
                let Some(message) = delivery else { break };
                if let Err(err) = write_frame(writer, &ServerFrame::Delivery { message }).await {
                    debug!(?err, "failed to deliver message to client");
                    break;
                }
            }
        }
    }

    Ok(())
}

async fn handle_client_frame<W>(
    frame: std::io::Result<Option<ClientFrame>>,
    writer: &mut W,
    broker: &Broker,
    id: &str,
) -> Result<bool>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let message = match frame? {
        Some(ClientFrame::Say { text }) => {
            if text.trim().is_empty() {
                return Ok(true);
            }
            Message::broadcast(id, text)
        }
        Some(ClientFrame::Whisper { to, text }) => match validate_identity(&to) {
            Ok(to) => Message::private(id, to, text),
            Err(err) => {
                send_error(writer, &format!("cannot whisper to '{to}': {err}")).await?;
                return Ok(true);
            }
        },
        Some(ClientFrame::Hello { .. }) => {
            send_error(writer, "already connected").await?;
            return Ok(true);
        }
        None => return Ok(false),
    };

    match broker.send_message(message).await {
        Ok(()) => Ok(true),
        Err(BrokerError::Closed) => {
            let _ = send_error(writer, "broker shutting down").await;
            Ok(false)
        }
        Err(err) => {
            warn!(id, error = err.as_label(), "failed to forward message");
            Err(err.into())
        }
    }
}

async fn send_error<W>(writer: &mut W, message: &str) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    write_frame(
        writer,
        &ServerFrame::Error {
            message: message.to_string(),
        },
    )
    .await
}
