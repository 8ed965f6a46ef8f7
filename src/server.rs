//! TCP edge of the receiver.
//!
//! Accepts client connections, reads length-prefixed protocol-buffer
//! frames, and feeds each decoded message together with its original
//! bytes to the connection's dispatch switch. Outbound server messages
//! are queued on a channel and written by a dedicated task, so handlers
//! never touch the socket. Handlers run to completion per message; their
//! only blocking calls are local file I/O.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use prost::Message;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GlobalConfig;
use crate::connection::ConnectionClosure;
use crate::eventlog::EventLogger;
use crate::protocol::{client_message, server_message, ClientMessage, ServerHello, ServerMessage,
    MESSAGE_SIZE_MAX};
use crate::{AppError, Result};

/// Run the accept loop until `ct` is cancelled.
///
/// # Errors
///
/// Returns [`AppError::Io`] if the listener cannot be bound.
pub async fn run_server(
    config: Arc<GlobalConfig>,
    evlogger: Arc<dyn EventLogger>,
    ct: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(&config.server.listen_address)
        .await
        .map_err(|err| {
            AppError::Io(format!(
                "unable to bind {}: {err}",
                config.server.listen_address
            ))
        })?;
    info!(
        addr = %config.server.listen_address,
        sink = ?config.sink,
        "audit log receiver listening"
    );

    loop {
        tokio::select! {
            () = ct.cancelled() => {
                info!("server shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let config = Arc::clone(&config);
                    let evlogger = Arc::clone(&evlogger);
                    let ct = ct.child_token();
                    tokio::spawn(async move {
                        if let Err(err) =
                            handle_connection(stream, peer, config, evlogger, ct).await
                        {
                            debug!(%peer, %err, "connection closed with error");
                        }
                    });
                }
                Err(err) => warn!(%err, "accept failed"),
            }
        }
    }
    Ok(())
}

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .max_frame_length(MESSAGE_SIZE_MAX as usize)
        .new_codec()
}

/// Drive one client connection to completion.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<GlobalConfig>,
    evlogger: Arc<dyn EventLogger>,
    ct: CancellationToken,
) -> Result<()> {
    debug!(%peer, "client connected");
    let timeout = config.server_timeout();
    let (read_half, write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, frame_codec());
    let mut sink = FramedWrite::new(write_half, frame_codec());

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let bytes = Bytes::from(msg.encode_to_vec());
            if let Err(err) = sink.send(bytes).await {
                debug!(%err, "outbound write failed");
                break;
            }
        }
    });

    let mut closure = ConnectionClosure::new(config, evlogger, outbound_tx);
    closure.send(ServerMessage {
        r#type: Some(server_message::Type::Hello(ServerHello {
            server_version: env!("CARGO_PKG_VERSION").to_owned(),
        })),
    });

    let result = connection_loop(&mut frames, &mut closure, peer, timeout, &ct).await;

    // Dropping the closure releases every session handle and closes the
    // outbound queue; wait for queued responses to drain.
    drop(closure);
    let _ = writer.await;
    result
}

async fn connection_loop(
    frames: &mut FramedRead<tokio::net::tcp::OwnedReadHalf, LengthDelimitedCodec>,
    closure: &mut ConnectionClosure,
    peer: SocketAddr,
    timeout: std::time::Duration,
    ct: &CancellationToken,
) -> Result<()> {
    loop {
        let frame = tokio::select! {
            () = ct.cancelled() => {
                debug!(%peer, "closing connection on shutdown");
                return Ok(());
            }
            next = tokio::time::timeout(timeout, frames.next()) => match next {
                Err(_) => {
                    debug!(%peer, "client timed out");
                    return Ok(());
                }
                Ok(None) => {
                    debug!(%peer, "client disconnected");
                    return Ok(());
                }
                Ok(Some(Err(err))) => return Err(err.into()),
                Ok(Some(Ok(frame))) => frame,
            },
        };

        let msg = ClientMessage::decode(&frame[..])?;

        // The hello exchange belongs to the connection layer, not the
        // dispatch table.
        if let Some(client_message::Type::HelloMsg(hello)) = &msg.r#type {
            if !closure.started() {
                debug!(%peer, version = %hello.client_version, "client hello");
                continue;
            }
        }

        let is_iobuf = matches!(
            msg.r#type,
            Some(
                client_message::Type::TtyinBuf(_)
                    | client_message::Type::TtyoutBuf(_)
                    | client_message::Type::StdinBuf(_)
                    | client_message::Type::StdoutBuf(_)
                    | client_message::Type::StderrBuf(_)
            )
        );

        match closure.dispatch(&msg, &frame) {
            Ok(()) => {
                if is_iobuf {
                    // Acknowledge durable storage so the client knows
                    // where a restart may resume from.
                    closure.send_commit_point();
                }
            }
            Err(err) => {
                let errstr = closure
                    .errstr
                    .take()
                    .unwrap_or(std::borrow::Cow::Borrowed("unable to process message"));
                info!(%peer, %errstr, "closing connection");
                debug!(%peer, %err, "handler failure detail");
                return Err(err);
            }
        }
    }
}
