// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Unix socket server speaking the remotefs frame protocol.
//!
//! Each connection starts with a handshake. Afterwards every request runs in
//! its own task, so responses are written in completion order and the layer
//! matches them up by correlation identifier.

use crate::fs::{FsService, Session};
use remotefs_proto::{
    decode_frame_len, decode_payload, encode_frame, validate_request, FrameError, Request,
    RequestFrame, Response, ResponseFrame, FRAME_HEADER_LEN,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Agent bound to a socket path; the socket file is removed on drop.
pub struct AgentServer {
    socket_path: PathBuf,
    service: Arc<FsService>,
}

impl AgentServer {
    pub fn new(socket_path: impl AsRef<Path>, service: FsService) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            service: Arc::new(service),
        }
    }

    pub fn service(&self) -> &Arc<FsService> {
        &self.service
    }

    /// Bind the socket, replacing a stale socket file.
    pub fn bind(&self) -> Result<UnixListener, AgentError> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        Ok(UnixListener::bind(&self.socket_path)?)
    }

    /// Serve until `shutdown` fires or its sender is dropped.
    pub async fn run(&self, shutdown: oneshot::Receiver<()>) -> Result<(), AgentError> {
        let listener = self.bind()?;
        info!(
            socket = %self.socket_path.display(),
            root = %self.service.root().display(),
            "agent listening"
        );
        serve(listener, Arc::clone(&self.service), shutdown).await
    }
}

impl Drop for AgentServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

/// Accept connections on `listener` until shutdown.
pub async fn serve(
    listener: UnixListener,
    service: Arc<FsService>,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<(), AgentError> {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("agent shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, service).await {
                        warn!(%err, "connection ended with error");
                    }
                });
            }
        }
    }
}

async fn read_request(reader: &mut OwnedReadHalf) -> Result<Option<RequestFrame>, AgentError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = decode_frame_len(header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(decode_payload(&payload)?))
}

async fn write_responses(
    mut writer: OwnedWriteHalf,
    mut responses: mpsc::UnboundedReceiver<ResponseFrame>,
) -> Result<(), AgentError> {
    while let Some(frame) = responses.recv().await {
        let bytes = encode_frame(&frame)?;
        writer.write_all(&bytes).await?;
    }
    writer.flush().await?;
    Ok(())
}

async fn handshake(
    reader: &mut OwnedReadHalf,
    responses: &mpsc::UnboundedSender<ResponseFrame>,
) -> Result<bool, AgentError> {
    let Some(frame) = read_request(reader).await? else {
        return Ok(false);
    };
    let correlation_id = frame.correlation_id;
    let rejection = match &frame.request {
        Request::Handshake(hello) => match validate_request(&frame.request) {
            Ok(()) => {
                info!(
                    client = %String::from_utf8_lossy(&hello.client_name),
                    pid = hello.process.pid,
                    "client connected"
                );
                None
            }
            Err(err) => Some(err.to_string()),
        },
        other => Some(format!("expected handshake, got {}", other.operation())),
    };

    let response = match &rejection {
        None => Response::handshake(crate::fs::AGENT_NAME),
        Some(reason) => Response::error(libc::EPROTO, reason.clone()),
    };
    let _ = responses.send(ResponseFrame {
        correlation_id,
        response,
    });
    match rejection {
        None => Ok(true),
        Some(reason) => Err(AgentError::Handshake(reason)),
    }
}

async fn handle_connection(stream: UnixStream, service: Arc<FsService>) -> Result<(), AgentError> {
    let (mut reader, writer) = stream.into_split();
    let (responses, queue) = mpsc::unbounded_channel();
    let session = Arc::new(Session::default());
    let mut requests = JoinSet::new();
    let writer_task = tokio::spawn(write_responses(writer, queue));

    let result = async {
        if !handshake(&mut reader, &responses).await? {
            return Ok(());
        }
        while let Some(frame) = read_request(&mut reader).await? {
            while requests.try_join_next().is_some() {}
            let service = Arc::clone(&service);
            let session = Arc::clone(&session);
            let responses = responses.clone();
            requests.spawn(async move {
                let correlation_id = frame.correlation_id;
                let operation = frame.request.operation();
                let request = frame.request;
                let response =
                    match tokio::task::spawn_blocking(move || service.handle_in(&session, request))
                        .await
                    {
                        Ok(response) => response,
                        Err(err) => Response::error(libc::EIO, format!("request task failed: {err}")),
                    };
                debug!(correlation_id, operation, "request served");
                let _ = responses.send(ResponseFrame {
                    correlation_id,
                    response,
                });
            });
        }
        Ok::<(), AgentError>(())
    }
    .await;

    while requests.join_next().await.is_some() {}
    drop(responses);
    match writer_task.await {
        Ok(Err(err)) => debug!(%err, "response writer stopped"),
        Err(err) => debug!(%err, "response writer task failed"),
        Ok(Ok(())) => {}
    }
    let released = service.end_session(&session);
    if released > 0 {
        debug!(released, "closed handles left open by client");
    }
    debug!("client disconnected");
    result
}
