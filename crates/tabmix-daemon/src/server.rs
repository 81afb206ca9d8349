// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Unix socket front end: one JSON frame per line.
//!
//! A connection may carry panel commands, an agent (after `AgentHello`) or
//! an event subscription (after `Subscribe`). The reader never waits on the
//! coordinator inline, so an agent can answer a command the coordinator
//! sends it while its own report is still being handled.

use crate::actor::CoordinatorHandle;
use crate::agents::AgentRegistry;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabmix_ipc::{
    decode_frame, encode_frame, AgentReply, AgentRequest, CommandEnvelope, CommandKind,
    ContextId, Frame, ResponseEnvelope, TabmixError, MAX_FRAME_BYTES,
};
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};
use uuid::Uuid;

type PendingReplies = Arc<Mutex<HashMap<String, oneshot::Sender<AgentReply>>>>;

/// Bind the socket, replacing a leftover file from an earlier run.
pub fn bind(path: &Path) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    UnixListener::bind(path)
}

/// Accept connections until `shutdown` flips to true.
pub async fn run(
    listener: UnixListener,
    socket_path: PathBuf,
    handle: CoordinatorHandle,
    agents: Arc<AgentRegistry>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    info!("Listening on {}", socket_path.display());
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => match accept {
                Ok((stream, _)) => {
                    let connection = Connection::new(handle.clone(), agents.clone());
                    tokio::spawn(connection.serve(stream));
                }
                Err(e) => warn!("Accept failed: {}", e),
            }
        }
    }
    let _ = std::fs::remove_file(&socket_path);
    info!("Socket server stopped");
    Ok(())
}

struct Connection {
    handle: CoordinatorHandle,
    agents: Arc<AgentRegistry>,
    pending: PendingReplies,
    agent: Option<(ContextId, u64)>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    fn new(handle: CoordinatorHandle, agents: Arc<AgentRegistry>) -> Self {
        Self {
            handle,
            agents,
            pending: Arc::new(Mutex::new(HashMap::new())),
            agent: None,
            tasks: Vec::new(),
        }
    }

    async fn serve(mut self, stream: UnixStream) {
        let (reader, writer) = stream.into_split();
        let (out, frames) = mpsc::unbounded_channel::<Frame>();
        let writer_task = tokio::spawn(write_loop(writer, frames));

        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => self.on_line(&line, &out),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!("Closing connection that sent a frame over {} bytes", MAX_FRAME_BYTES);
                    let e = TabmixError::Validation(format!("frame exceeds {} bytes", MAX_FRAME_BYTES));
                    let _ = out.send(ResponseEnvelope::failure(&e, None, None).into());
                    break;
                }
                Err(LinesCodecError::Io(e)) => {
                    debug!("Connection read failed: {}", e);
                    break;
                }
            }
        }

        self.close();
        drop(out);
        let _ = writer_task.await;
    }

    fn on_line(&mut self, line: &str, out: &mpsc::UnboundedSender<Frame>) {
        match decode_frame(line) {
            Ok(Some(Frame::Command(envelope))) => self.on_command(envelope, out),
            Ok(Some(Frame::Response(response))) => self.on_agent_reply(response),
            Ok(None) => {}
            Err(e) => {
                debug!("Dropping bad frame: {}", e);
                let _ = out.send(ResponseEnvelope::failure(&e, None, None).into());
            }
        }
    }

    fn on_command(&mut self, envelope: CommandEnvelope, out: &mpsc::UnboundedSender<Frame>) {
        match CommandKind::parse(&envelope.kind) {
            Some(CommandKind::AgentHello) => self.register_agent(&envelope, out),
            Some(CommandKind::Subscribe) => self.subscribe(out),
            _ => {}
        }
        self.forward(envelope, out);
    }

    /// Hand a command to the coordinator and write the reply when it comes.
    fn forward(&self, envelope: CommandEnvelope, out: &mpsc::UnboundedSender<Frame>) {
        let correlation_id = envelope.correlation_id.clone();
        match self.handle.submit(envelope) {
            Ok(reply) => {
                let out = out.clone();
                tokio::spawn(async move {
                    let response = reply.await.unwrap_or_else(|_| {
                        let e = TabmixError::Internal("coordinator stopped".into());
                        ResponseEnvelope::failure(&e, None, correlation_id)
                    });
                    let _ = out.send(response.into());
                });
            }
            Err(e) => {
                let _ = out.send(ResponseEnvelope::failure(&e, None, correlation_id).into());
            }
        }
    }

    fn register_agent(&mut self, envelope: &CommandEnvelope, out: &mpsc::UnboundedSender<Frame>) {
        let Some(context_id) = envelope
            .payload
            .get("contextId")
            .and_then(|v| v.as_u64())
            .and_then(|v| ContextId::try_from(v).ok())
            .filter(|id| *id != 0)
        else {
            // The coordinator produces the validation error.
            return;
        };
        if let Some((previous, generation)) = self.agent.take() {
            if self.agents.disconnect(previous, generation) && previous != context_id {
                info!("Connection switched from context {} to {}", previous, context_id);
                self.report_closed(previous);
            }
        }

        let (generation, requests) = self.agents.connect(context_id);
        self.agent = Some((context_id, generation));
        info!("Agent connected for context {}", context_id);

        let task = tokio::spawn(forward_agent_requests(
            requests,
            self.pending.clone(),
            out.clone(),
        ));
        self.tasks.push(task);
    }

    fn subscribe(&mut self, out: &mpsc::UnboundedSender<Frame>) {
        let mut events = self.handle.subscribe();
        let out = out.clone();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if out.send(Frame::from(&event)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Subscriber lagged, skipped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.tasks.push(task);
    }

    fn on_agent_reply(&self, response: ResponseEnvelope) {
        let Some(id) = response.correlation_id.clone() else {
            debug!("Agent reply without correlation id");
            return;
        };
        let Some(reply) = self.pending.lock().remove(&id) else {
            debug!("No pending request for reply {}", id);
            return;
        };
        let result = if response.ok {
            Ok(response.data.unwrap_or_default())
        } else {
            Err(response
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "agent failure".to_string()))
        };
        let _ = reply.send(result);
    }

    fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.pending.lock().clear();

        if let Some((context_id, generation)) = self.agent.take() {
            if self.agents.disconnect(context_id, generation) {
                info!("Agent for context {} disconnected", context_id);
                self.report_closed(context_id);
            }
        }
    }

    /// The page is gone; drop it without waiting out the grace window.
    fn report_closed(&self, context_id: ContextId) {
        let closed = CommandEnvelope::new(
            CommandKind::ContextClosed.as_str(),
            serde_json::json!({ "contextId": context_id }),
        );
        if let Err(e) = self.handle.submit(closed) {
            debug!("Could not report closed context {}: {}", context_id, e);
        }
    }
}

async fn forward_agent_requests(
    mut requests: mpsc::UnboundedReceiver<AgentRequest>,
    pending: PendingReplies,
    out: mpsc::UnboundedSender<Frame>,
) {
    while let Some(request) = requests.recv().await {
        let id = Uuid::new_v4().to_string();
        {
            let mut pending = pending.lock();
            // Requests that timed out on the coordinator side.
            pending.retain(|_, reply| !reply.is_closed());
            pending.insert(id.clone(), request.reply);
        }
        let envelope = request.command.to_envelope().with_correlation_id(id);
        if out.send(envelope.into()).is_err() {
            break;
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut frames: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = frames.recv().await {
        let line = match encode_frame(&frame) {
            Ok(line) => line,
            Err(e) => {
                warn!("Dropping unencodable frame: {}", e);
                continue;
            }
        };
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!("Connection write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}
