// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Client end of the coordinator socket.
//!
//! Requests are matched to responses by `correlationId`; every other frame
//! (agent commands, panel events) is handed to the caller as it arrives.

use futures::future::BoxFuture;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tabmix_ipc::{
    decode_frame, encode_frame, AgentCommand, AgentReply, AgentRequest, Command, CommandEnvelope,
    ContextId, ContextPayload, Frame, ResponseEnvelope, TabmixError, MAX_FRAME_BYTES,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, warn};
use uuid::Uuid;

/// Reply slots by correlation id; `None` once the reader has stopped.
type Pending = Arc<Mutex<Option<HashMap<String, oneshot::Sender<ResponseEnvelope>>>>>;

enum Outgoing {
    Frame(Frame),
    Close,
}

pub struct Connection {
    out: mpsc::UnboundedSender<Outgoing>,
    pending: Pending,
}

impl Connection {
    pub async fn connect(
        path: &Path,
    ) -> Result<(Arc<Connection>, mpsc::UnboundedReceiver<CommandEnvelope>), TabmixError> {
        let stream = UnixStream::connect(path).await.map_err(|e| {
            TabmixError::Unavailable(format!("coordinator at {}: {}", path.display(), e))
        })?;
        Ok(Self::over(stream))
    }

    /// Run the protocol over an already connected stream.
    pub fn over<S>(stream: S) -> (Arc<Connection>, mpsc::UnboundedReceiver<CommandEnvelope>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let (out, mut frames) = mpsc::unbounded_channel::<Outgoing>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));

        tokio::spawn(async move {
            while let Some(outgoing) = frames.recv().await {
                let frame = match outgoing {
                    Outgoing::Frame(frame) => frame,
                    Outgoing::Close => {
                        let _ = writer.shutdown().await;
                        break;
                    }
                };
                let line = match encode_frame(&frame) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Dropping unencodable frame: {}", e);
                        continue;
                    }
                };
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let routes = pending.clone();
        tokio::spawn(async move {
            let mut lines =
                FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Dropping coordinator connection: {}", e);
                        break;
                    }
                };
                match decode_frame(&line) {
                    Ok(Some(Frame::Response(response))) => {
                        let waiter = response
                            .correlation_id
                            .as_ref()
                            .and_then(|id| routes.lock().as_mut()?.remove(id));
                        match waiter {
                            Some(waiter) => {
                                let _ = waiter.send(response);
                            }
                            None => debug!("Unmatched response: {:?}", response.error),
                        }
                    }
                    Ok(Some(Frame::Command(envelope))) => {
                        if inbound_tx.send(envelope).is_err() {
                            debug!("Inbound frame with no listener");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Bad frame from coordinator: {}", e),
                }
            }
            // Waiters see their sender dropped.
            routes.lock().take();
            debug!("Coordinator connection closed");
        });

        (Arc::new(Connection { out, pending }), inbound)
    }

    /// Send a command. The send happens before this returns; the returned
    /// future only waits for the reply.
    pub fn request(
        &self,
        envelope: CommandEnvelope,
    ) -> impl Future<Output = Result<ResponseEnvelope, TabmixError>> + Send + 'static {
        let id = Uuid::new_v4().to_string();
        let (reply, response) = oneshot::channel();
        let registered = match self.pending.lock().as_mut() {
            Some(pending) => {
                pending.insert(id.clone(), reply);
                true
            }
            None => false,
        };
        let sent = registered
            && self
                .out
                .send(Outgoing::Frame(
                    envelope.with_correlation_id(id.clone()).into(),
                ))
                .is_ok();
        if registered && !sent {
            if let Some(pending) = self.pending.lock().as_mut() {
                pending.remove(&id);
            }
        }
        async move {
            if !sent {
                return Err(closed());
            }
            response.await.map_err(|_| closed())
        }
    }

    /// Send a reply to a command the coordinator issued.
    pub fn respond(&self, response: ResponseEnvelope) -> Result<(), TabmixError> {
        self.out
            .send(Outgoing::Frame(response.into()))
            .map_err(|_| closed())
    }

    /// Finish writing queued frames, then close the write side. The
    /// coordinator sees the disconnect and replies stop arriving.
    pub fn close(&self) {
        let _ = self.out.send(Outgoing::Close);
    }
}

fn closed() -> TabmixError {
    TabmixError::Unavailable("coordinator connection closed".into())
}

/// Anything that can deliver a coordinator command and return its result.
pub trait CommandSink: Send + Sync {
    fn send(&self, command: Command) -> BoxFuture<'static, Result<serde_json::Value, TabmixError>>;
}

impl CommandSink for Connection {
    fn send(&self, command: Command) -> BoxFuture<'static, Result<serde_json::Value, TabmixError>> {
        let kind = command.kind();
        let reply = self.request(command.to_envelope());
        Box::pin(async move {
            let response = reply.await?;
            if let Some(warning) = &response.warning {
                warn!("{} succeeded with warning: {}", kind.as_str(), warning.message);
            }
            response.into_result()
        })
    }
}

/// Connect as the agent for `context_id`.
///
/// Returns the connection and the queue of commands the coordinator sends
/// to this agent. Replies go back as each request's reply slot is filled.
pub async fn connect_agent(
    path: &Path,
    context_id: ContextId,
) -> Result<(Arc<Connection>, mpsc::UnboundedReceiver<AgentRequest>), TabmixError> {
    let (connection, inbound) = Connection::connect(path).await?;
    let requests = register_agent(connection.clone(), inbound, context_id).await?;
    Ok((connection, requests))
}

/// Announce the agent on an open connection and start routing commands.
pub async fn register_agent(
    connection: Arc<Connection>,
    mut inbound: mpsc::UnboundedReceiver<CommandEnvelope>,
    context_id: ContextId,
) -> Result<mpsc::UnboundedReceiver<AgentRequest>, TabmixError> {
    connection
        .send(Command::AgentHello(ContextPayload { context_id }))
        .await?;

    let (requests_tx, requests) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(envelope) = inbound.recv().await {
            let correlation_id = envelope.correlation_id.clone();
            let command = match AgentCommand::from_envelope(&envelope) {
                Ok(command) => command,
                Err(e) => {
                    let _ = connection.respond(ResponseEnvelope::failure(&e, None, correlation_id));
                    continue;
                }
            };
            let (reply, result) = oneshot::channel::<AgentReply>();
            if requests_tx.send(AgentRequest { command, reply }).is_err() {
                break;
            }
            let connection = connection.clone();
            tokio::spawn(async move {
                let response = match result.await {
                    Ok(Ok(data)) => ResponseEnvelope::success(data, correlation_id),
                    Ok(Err(message)) => ResponseEnvelope::failure(
                        &TabmixError::Internal(message),
                        None,
                        correlation_id,
                    ),
                    Err(_) => return,
                };
                let _ = connection.respond(response);
            });
        }
    });
    Ok(requests)
}
