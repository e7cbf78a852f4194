// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! High-level client for the remote filesystem agent.
//!
//! One socket carries every request of the process. Each request gets a
//! correlation identifier and a response slot; a dedicated reader thread
//! routes incoming frames to their slots, so callers on different threads
//! block independently and the agent may answer in any order.

pub mod io_trait;

use anyhow::{anyhow, Context, Result};
use io_trait::SocketIo;
use remotefs_proto::{
    decode_frame_len, decode_payload, encode_frame, validate_response, ProcessInfo, Request,
    RequestFrame, Response, ResponseFrame, FRAME_HEADER_LEN, PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Per-request timeout used when none is configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);

/// Correlation identifier reserved for the handshake.
const HANDSHAKE_CORRELATION_ID: u64 = 0;

/// Failure of a single request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("request {correlation_id} timed out after {timeout:?}")]
    Timeout {
        correlation_id: u64,
        timeout: Duration,
    },
    #[error("client is closed")]
    Closed,
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Anything that can carry a request to the agent and return its answer.
///
/// `Response::Error` is a successful round trip; only failures of the
/// channel itself surface as [`ClientError`].
pub trait Transport: Send + Sync {
    fn send(&self, request: Request) -> Result<Response, ClientError>;

    /// Release the channel; later sends fail.
    fn shutdown(&self) {}
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, request: Request) -> Result<Response, ClientError> {
        (**self).send(request)
    }

    fn shutdown(&self) {
        (**self).shutdown()
    }
}

/// Configuration describing how a client should identify itself to the agent.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    handshake_version: String,
    client_name: String,
    client_version: String,
    process: ProcessConfig,
    request_timeout: Duration,
    write_timeout: Option<Duration>,
}

impl ClientConfig {
    /// Start building configuration for a client.
    pub fn builder(
        client_name: impl Into<String>,
        client_version: impl Into<String>,
    ) -> ClientConfigBuilder {
        ClientConfigBuilder {
            handshake_version: Some(String::from_utf8_lossy(PROTOCOL_VERSION).into_owned()),
            client_name: Some(client_name.into()),
            client_version: Some(client_version.into()),
            process: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            write_timeout: None,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

/// Builder for [`ClientConfig`].
pub struct ClientConfigBuilder {
    handshake_version: Option<String>,
    client_name: Option<String>,
    client_version: Option<String>,
    process: Option<ProcessConfig>,
    request_timeout: Duration,
    write_timeout: Option<Duration>,
}

impl ClientConfigBuilder {
    /// Override the handshake protocol version (defaults to `1`).
    pub fn handshake_version(mut self, version: impl Into<String>) -> Self {
        self.handshake_version = Some(version.into());
        self
    }

    /// Provide explicit process metadata used during the handshake.
    pub fn process(mut self, process: ProcessConfig) -> Self {
        self.process = Some(process);
        self
    }

    /// How long `send` waits for the matching response.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the write timeout applied to the underlying socket.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Finalise the configuration.
    pub fn build(self) -> Result<ClientConfig> {
        let handshake_version =
            self.handshake_version.ok_or_else(|| anyhow!("handshake version missing"))?;
        let client_name = self.client_name.ok_or_else(|| anyhow!("client name missing"))?;
        let client_version =
            self.client_version.ok_or_else(|| anyhow!("client version missing"))?;
        if self.request_timeout.is_zero() {
            return Err(anyhow!("request timeout must be positive"));
        }

        let process = match self.process {
            Some(process) => process,
            None => ProcessConfig::current_process()
                .context("failed to gather current process metadata")?,
        };

        Ok(ClientConfig {
            handshake_version,
            client_name,
            client_version,
            process,
            request_timeout: self.request_timeout,
            write_timeout: self.write_timeout,
        })
    }
}

/// Process metadata used during handshake.
#[derive(Clone, Debug)]
pub struct ProcessConfig {
    pub pid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub gid: u32,
    pub exe_path: String,
}

impl ProcessConfig {
    pub fn new(pid: u32, ppid: u32, uid: u32, gid: u32, exe_path: impl Into<String>) -> Self {
        Self {
            pid,
            ppid,
            uid,
            gid,
            exe_path: exe_path.into(),
        }
    }

    pub fn current_process() -> Result<Self> {
        let pid = std::process::id();
        let ppid = unsafe { libc::getppid() as u32 };
        let uid = unsafe { libc::geteuid() as u32 };
        let gid = unsafe { libc::getegid() as u32 };

        let exe_path =
            std::env::current_exe().context("failed to resolve current executable path")?;

        Ok(Self {
            pid,
            ppid,
            uid,
            gid,
            exe_path: exe_path.display().to_string(),
        })
    }

    fn to_wire(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            ppid: self.ppid,
            uid: self.uid,
            gid: self.gid,
            exe_path: self.exe_path.as_bytes().to_vec(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Response slot of one in-flight request
struct Slot {
    state: Mutex<Option<Result<Response, ClientError>>>,
    ready: Condvar,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn complete(&self, result: Result<Response, ClientError>) {
        let mut state = lock(&self.state);
        if state.is_none() {
            *state = Some(result);
            self.ready.notify_all();
        }
    }
}

#[derive(Default)]
struct PendingTable {
    slots: HashMap<u64, Arc<Slot>>,
    /// Set once the channel is unusable; every later send fails with it
    failure: Option<ClientError>,
}

struct Shared {
    io: Box<dyn SocketIo>,
    fd: RawFd,
    write_lock: Mutex<()>,
    pending: Mutex<PendingTable>,
}

impl Shared {
    fn fail_all(&self, error: ClientError) {
        let slots = {
            let mut pending = lock(&self.pending);
            if pending.failure.is_none() {
                pending.failure = Some(error.clone());
            }
            std::mem::take(&mut pending.slots)
        };
        for slot in slots.into_values() {
            slot.complete(Err(error.clone()));
        }
    }

    fn is_closed(&self) -> bool {
        matches!(lock(&self.pending).failure, Some(ClientError::Closed))
    }

    fn dispatch(&self, frame: ResponseFrame) {
        let correlation_id = frame.correlation_id;
        let slot = lock(&self.pending).slots.remove(&correlation_id);
        let Some(slot) = slot else {
            warn!(correlation_id, "dropping response for unknown or reclaimed request");
            return;
        };

        let result = match validate_response(&frame.response) {
            Ok(()) => Ok(frame.response),
            Err(err) => {
                warn!(correlation_id, %err, "agent sent an invalid response");
                Err(ClientError::Protocol(err.to_string()))
            }
        };
        slot.complete(result);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let _ = self.io.close(self.fd);
    }
}

fn read_response(io: &dyn SocketIo, fd: RawFd) -> Result<ResponseFrame, ClientError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    io.read_exact(fd, &mut header)
        .map_err(|err| ClientError::Transport(err.to_string()))?;
    let len = decode_frame_len(header).map_err(|err| ClientError::Protocol(err.to_string()))?;
    let mut payload = vec![0u8; len];
    io.read_exact(fd, &mut payload)
        .map_err(|err| ClientError::Transport(err.to_string()))?;
    decode_payload(&payload).map_err(|err| ClientError::Protocol(err.to_string()))
}

fn reader_loop(shared: Arc<Shared>) {
    loop {
        match read_response(shared.io.as_ref(), shared.fd) {
            Ok(frame) => shared.dispatch(frame),
            Err(err) => {
                if !shared.is_closed() {
                    warn!(%err, "agent channel failed");
                }
                shared.fail_all(err);
                let _ = shared.io.shutdown(shared.fd);
                debug!("response reader stopped");
                return;
            }
        }
    }
}

fn build_handshake(config: &ClientConfig) -> Request {
    let mut request = Request::handshake(
        config.process.to_wire(),
        &config.client_name,
        &config.client_version,
    );
    if let Request::Handshake(handshake) = &mut request {
        handshake.version = config.handshake_version.as_bytes().to_vec();
    }
    request
}

fn handshake(io: &dyn SocketIo, fd: RawFd, config: &ClientConfig) -> Result<()> {
    if let Some(timeout) = config.write_timeout {
        io.set_write_timeout(fd, timeout)
            .context("failed to set write timeout")?;
    }
    // The reader thread is not running yet, so bound the blocking read here.
    io_trait::set_timeout(fd, libc::SO_RCVTIMEO, config.request_timeout)
        .context("failed to set handshake read timeout")?;

    let frame = RequestFrame {
        correlation_id: HANDSHAKE_CORRELATION_ID,
        request: build_handshake(config),
    };
    let bytes = encode_frame(&frame).context("failed to encode handshake")?;
    io.write_all(fd, &bytes).context("failed to send handshake")?;

    let response = read_response(io, fd).context("failed to read handshake response")?;
    io_trait::set_timeout(fd, libc::SO_RCVTIMEO, Duration::ZERO)
        .context("failed to clear handshake read timeout")?;

    if response.correlation_id != HANDSHAKE_CORRELATION_ID {
        return Err(anyhow!(
            "handshake answered with correlation id {}",
            response.correlation_id
        ));
    }
    match response.response {
        Response::Handshake(ack) if ack.version == PROTOCOL_VERSION => {
            debug!(
                agent = %String::from_utf8_lossy(&ack.agent_name),
                "handshake complete"
            );
            Ok(())
        }
        Response::Handshake(ack) => Err(anyhow!(
            "agent speaks protocol version {:?}",
            String::from_utf8_lossy(&ack.version)
        )),
        Response::Error(err) => Err(anyhow!("agent rejected handshake: {}", err.message_lossy())),
        other => Err(anyhow!("unexpected handshake response: {other:?}")),
    }
}

/// Connection to the agent shared by every thread of the process.
pub struct RemoteClient {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteClient {
    /// Connect, perform the handshake and start the response reader.
    pub fn connect(socket_path: &Path, config: &ClientConfig, io: impl SocketIo) -> Result<Self> {
        let socket_display = socket_path.display();
        let fd = io
            .connect(socket_path)
            .with_context(|| format!("failed to connect to {}", socket_display))?;

        if let Err(err) = handshake(&io, fd, config) {
            let _ = io.close(fd);
            return Err(err.context(format!("handshake with {} failed", socket_display)));
        }

        let shared = Arc::new(Shared {
            io: Box::new(io),
            fd,
            write_lock: Mutex::new(()),
            pending: Mutex::new(PendingTable::default()),
        });

        let reader_shared = Arc::clone(&shared);
        let reader = std::thread::Builder::new()
            .name("remotefs-reader".to_string())
            .spawn(move || reader_loop(reader_shared))
            .context("failed to spawn response reader thread")?;

        Ok(Self {
            shared,
            next_id: AtomicU64::new(HANDSHAKE_CORRELATION_ID + 1),
            timeout: config.request_timeout,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Number of requests currently waiting for a response.
    pub fn pending_requests(&self) -> usize {
        lock(&self.shared.pending).slots.len()
    }

    /// Fail every pending request with [`ClientError::Closed`] and stop the reader.
    pub fn shutdown(&self) {
        self.shared.fail_all(ClientError::Closed);
        let _ = self.shared.io.shutdown(self.shared.fd);
        if let Some(handle) = lock(&self.reader).take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn wait(&self, correlation_id: u64, slot: &Slot) -> Result<Response, ClientError> {
        let state = lock(&slot.state);
        let (mut state, _) = slot
            .ready
            .wait_timeout_while(state, self.timeout, |state| state.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(result) = state.take() {
            return result;
        }
        drop(state);

        lock(&self.shared.pending).slots.remove(&correlation_id);
        // The reader may have filled the slot between the wait and the removal.
        if let Some(result) = lock(&slot.state).take() {
            return result;
        }
        warn!(
            correlation_id,
            timeout_ms = self.timeout.as_millis() as u64,
            "request timed out"
        );
        Err(ClientError::Timeout {
            correlation_id,
            timeout: self.timeout,
        })
    }
}

impl Transport for RemoteClient {
    fn send(&self, request: Request) -> Result<Response, ClientError> {
        let correlation_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let operation = request.operation();
        let slot = Arc::new(Slot::new());
        {
            let mut pending = lock(&self.shared.pending);
            if let Some(failure) = &pending.failure {
                return Err(failure.clone());
            }
            pending.slots.insert(correlation_id, Arc::clone(&slot));
        }

        let bytes = match encode_frame(&RequestFrame {
            correlation_id,
            request,
        }) {
            Ok(bytes) => bytes,
            Err(err) => {
                lock(&self.shared.pending).slots.remove(&correlation_id);
                return Err(ClientError::Protocol(err.to_string()));
            }
        };

        trace!(correlation_id, operation, "sending request");
        let written = {
            let _guard = lock(&self.shared.write_lock);
            self.shared.io.write_all(self.shared.fd, &bytes)
        };
        if let Err(err) = written {
            let error = ClientError::Transport(format!("failed to send {operation} request: {err}"));
            warn!(correlation_id, %error, "agent channel failed");
            self.shared.fail_all(error.clone());
            let _ = self.shared.io.shutdown(self.shared.fd);
            return Err(error);
        }

        self.wait(correlation_id, &slot)
    }

    fn shutdown(&self) {
        RemoteClient::shutdown(self);
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
