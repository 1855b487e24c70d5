//! Unix domain socket transport
//!
//! The server accepts connections from a `mio` poll loop so that it notices
//! shutdown requests promptly, and serves each connection on its own thread.
//! Every connection is one session of the context. `MapHead` replies carry
//! the arena's read-only descriptor as `SCM_RIGHTS` ancillary data on their
//! first byte. Connection reads time out every poll interval so that a client
//! stalled mid-frame cannot hold up shutdown.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use mio::{unix::SourceFd, Events, Interest, Poll, Token};
use nix::{
    cmsg_space,
    poll::{poll, PollFd, PollFlags},
    sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags},
};

use crate::error::{Result, XferError};
use crate::mapping::{MappedRegion, SessionId};
use crate::memory::page_size;
use crate::protocol::{
    codec::{self, HEADER_LEN},
    ControlOp, ControlReply, Request, Response,
};
use crate::subsystem::XferContext;
use crate::sync::ShutdownFlag;

use super::{ControlChannel, Connector};

const LISTENER_TOKEN: Token = Token(0);

/// Settings for a control server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Filesystem path of the listening socket
    pub socket_path: PathBuf,
    /// How often idle loops re-check the shutdown flag
    pub poll_interval: Duration,
    /// Longest a single `WaitReadable` request may block
    pub max_wait: Duration,
}

impl ServerConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            poll_interval: Duration::from_millis(100),
            max_wait: Duration::from_secs(5),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(XferError::invalid_parameter(
                "socket_path",
                "Socket path cannot be empty",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(XferError::invalid_parameter(
                "poll_interval",
                "Poll interval must be positive",
            ));
        }
        Ok(())
    }
}

/// Snapshot of server activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub connections: u64,
    pub requests: u64,
    pub failed_requests: u64,
}

#[derive(Debug, Default)]
struct AtomicServerStats {
    connections: AtomicU64,
    requests: AtomicU64,
    failed_requests: AtomicU64,
}

impl AtomicServerStats {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            connections: self.connections.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
        }
    }
}

/// Serves a context's control protocol on a Unix socket
#[derive(Debug)]
pub struct ControlServer {
    ctx: Arc<XferContext>,
    listener: UnixListener,
    config: ServerConfig,
    shutdown: ShutdownFlag,
    stats: Arc<AtomicServerStats>,
}

impl ControlServer {
    /// Bind the listening socket, replacing a stale socket file
    pub fn bind(ctx: Arc<XferContext>, config: ServerConfig) -> Result<Self> {
        config.validate()?;

        if config.socket_path.exists() {
            std::fs::remove_file(&config.socket_path)
                .map_err(|e| XferError::from_io(e, "Failed to remove stale socket"))?;
        }
        let listener = UnixListener::bind(&config.socket_path)
            .map_err(|e| XferError::from_io(e, "Failed to bind control socket"))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| XferError::from_io(e, "Failed to configure control socket"))?;

        info!("control server listening on {}", config.socket_path.display());
        Ok(Self {
            ctx,
            listener,
            config,
            shutdown: ShutdownFlag::new(),
            stats: Arc::new(AtomicServerStats::default()),
        })
    }

    /// Flag that stops the accept loop and every connection
    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Accept and serve connections until shutdown is requested
    pub fn run(self) -> Result<ServerStats> {
        let mut poll =
            Poll::new().map_err(|e| XferError::from_io(e, "Failed to create poll instance"))?;
        let fd = self.listener.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), LISTENER_TOKEN, Interest::READABLE)
            .map_err(|e| XferError::from_io(e, "Failed to register control socket"))?;

        let mut events = Events::with_capacity(8);
        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        while !self.shutdown.is_requested() {
            if let Err(e) = poll.poll(&mut events, Some(self.config.poll_interval)) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(XferError::from_io(e, "Control socket poll failed"));
            }

            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    self.accept_pending(&mut workers);
                }
            }
            workers.retain(|worker| !worker.is_finished());
        }

        debug!("control server stopping, joining {} connections", workers.len());
        for worker in workers {
            if worker.join().is_err() {
                error!("connection thread panicked");
            }
        }
        let _ = std::fs::remove_file(&self.config.socket_path);
        let stats = self.stats.snapshot();
        info!(
            "control server stopped after {} connections, {} requests",
            stats.connections, stats.requests
        );
        Ok(stats)
    }

    fn accept_pending(&self, workers: &mut Vec<JoinHandle<()>>) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    self.stats.connections.fetch_add(1, Ordering::Relaxed);
                    let connection = Connection {
                        ctx: Arc::clone(&self.ctx),
                        stream,
                        session: self.ctx.open_session(),
                        config: self.config.clone(),
                        shutdown: self.shutdown.clone(),
                        stats: Arc::clone(&self.stats),
                    };
                    let spawned = thread::Builder::new()
                        .name(format!("pagebridge-{}", connection.session))
                        .spawn(move || connection.serve());
                    match spawned {
                        Ok(handle) => workers.push(handle),
                        Err(e) => error!("failed to spawn connection thread: {}", e),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Run the server on a background thread
    pub fn spawn(self) -> Result<ServerHandle> {
        let shutdown = self.shutdown_flag();
        let path = self.config.socket_path.clone();
        let thread = thread::Builder::new()
            .name("pagebridge-server".to_string())
            .spawn(move || self.run())
            .map_err(|e| XferError::from_io(e, "Failed to spawn server thread"))?;
        Ok(ServerHandle {
            shutdown,
            path,
            thread: Some(thread),
        })
    }
}

/// A server running on its own thread; stopped on drop
#[derive(Debug)]
pub struct ServerHandle {
    shutdown: ShutdownFlag,
    path: PathBuf,
    thread: Option<JoinHandle<Result<ServerStats>>>,
}

impl ServerHandle {
    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Request shutdown and wait for the server to finish
    pub fn stop(mut self) -> Result<ServerStats> {
        self.join()
    }

    fn join(&mut self) -> Result<ServerStats> {
        self.shutdown.request();
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| XferError::platform("Control server thread panicked"))?,
            None => Ok(ServerStats::default()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.join() {
            warn!("control server ended with error: {}", e);
        }
    }
}

struct Connection {
    ctx: Arc<XferContext>,
    stream: UnixStream,
    session: SessionId,
    config: ServerConfig,
    shutdown: ShutdownFlag,
    stats: Arc<AtomicServerStats>,
}

impl Connection {
    fn serve(mut self) {
        if let Err(e) = self.configure_stream() {
            warn!("{}: failed to configure stream: {}", self.session, e);
            self.ctx.close_session(self.session);
            return;
        }
        debug!("{} connected", self.session);

        while !self.shutdown.is_requested() {
            match self.readable() {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!("{}: poll failed: {}", self.session, e);
                    break;
                }
            }

            match self.serve_one() {
                Ok(()) => {}
                Err(e) if e.is_disconnect() => {
                    debug!("{} disconnected: {}", self.session, e);
                    break;
                }
                Err(e) => {
                    warn!("{}: closing connection: {}", self.session, e);
                    break;
                }
            }
        }

        self.ctx.close_session(self.session);
    }

    fn configure_stream(&self) -> io::Result<()> {
        self.stream.set_nonblocking(false)?;
        self.stream.set_read_timeout(Some(self.config.poll_interval))?;
        // A client that stops reading replies is dropped rather than waited on
        self.stream
            .set_write_timeout(Some(self.config.max_wait.max(self.config.poll_interval)))
    }

    fn readable(&self) -> Result<bool> {
        let timeout = self.config.poll_interval.as_millis().min(i32::MAX as u128) as i32;
        let mut fds = [PollFd::new(&self.stream, PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(nix::errno::Errno::EINTR) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn serve_one(&mut self) -> Result<()> {
        let mut reader = StoppableReader {
            stream: &mut self.stream,
            shutdown: &self.shutdown,
        };
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header)?;
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        let body = match codec::read_body(&mut reader, header) {
            Ok(body) => body,
            Err(e @ XferError::Malformed { .. }) => {
                // The stream cannot be resynchronised after a bad length
                self.reject(&e)?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let request: Request = match codec::decode(&body) {
            Ok(request) => request,
            Err(e) => return self.reject(&e),
        };

        match request {
            Request::MapHead { length } => self.serve_map(length),
            other => {
                let response = self.dispatch(other);
                codec::write_frame(&mut self.stream, &response)
            }
        }
    }

    fn reject(&mut self, err: &XferError) -> Result<()> {
        self.ctx.record_control_error();
        self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
        warn!("{}: rejected request: {}", self.session, err);
        codec::write_frame(&mut self.stream, &Response::error(err))
    }

    fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::Control(op) => match self.ctx.control(op) {
                Ok(reply) => Response::Control(reply),
                Err(e) => self.failed(e, |ctx| ctx.record_control_error()),
            },
            Request::Unmap => Response::Unmapped {
                was_mapped: self.ctx.unmap(self.session),
            },
            Request::Read { pos, len } => {
                let mut buf = vec![0u8; (len as usize).min(page_size())];
                match self.ctx.read_head(pos, &mut buf) {
                    Ok(n) => {
                        buf.truncate(n);
                        Response::Data(buf)
                    }
                    Err(e) => self.failed(e, |ctx| ctx.record_read_error()),
                }
            }
            Request::WaitReadable { timeout_ms } => {
                let timeout = Duration::from_millis(timeout_ms).min(self.config.max_wait);
                Response::Readable(self.ctx.wait_readable(timeout))
            }
            Request::Ping => Response::Pong,
            Request::MapHead { .. } => {
                Response::error(&XferError::malformed("MapHead must be served with a descriptor"))
            }
        }
    }

    fn failed(&self, err: XferError, record: impl FnOnce(&XferContext)) -> Response {
        // An empty queue is a race, not a failure
        if !matches!(err, XferError::NoItem) {
            record(self.ctx.as_ref());
            self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        Response::error(&err)
    }

    fn serve_map(&mut self, length: u64) -> Result<()> {
        let grant = match self.ctx.grant_head(self.session, length as usize) {
            Ok(grant) => grant,
            Err(e) => {
                let response = self.failed(e, |_| {});
                return codec::write_frame(&mut self.stream, &response);
            }
        };

        let frame = codec::encode(&Response::Mapped(grant))?;
        if grant.is_empty() {
            self.stream.write_all(&frame)?;
            return Ok(());
        }

        let arena_fd = self.ctx.arena().consumer_fd().as_raw_fd();
        if let Err(e) = send_with_fd(&mut self.stream, &frame, arena_fd) {
            // Nobody will map this grant
            self.ctx.unmap(self.session);
            return Err(e);
        }
        Ok(())
    }
}

/// Blocking reads that give up once shutdown is requested
///
/// The stream's read timeout bounds each attempt; a timeout is retried until
/// the shutdown flag is raised.
struct StoppableReader<'a> {
    stream: &'a mut UnixStream,
    shutdown: &'a ShutdownFlag,
}

impl Read for StoppableReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.stream.read(buf) {
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    if self.shutdown.is_requested() {
                        return Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "server shutting down mid-request",
                        ));
                    }
                }
                other => return other,
            }
        }
    }
}

fn send_with_fd(stream: &mut UnixStream, frame: &[u8], fd: RawFd) -> Result<()> {
    let iov = [IoSlice::new(frame)];
    let fds = [fd];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    let sent = sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)?;
    if sent < frame.len() {
        stream.write_all(&frame[sent..])?;
    }
    Ok(())
}

/// Client end of the Unix socket transport
#[derive(Debug)]
pub struct UnixChannel {
    stream: UnixStream,
}

impl UnixChannel {
    /// Connect to a control server
    pub fn connect(path: impl AsRef<Path>, timeout: Option<Duration>) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref()).map_err(|e| {
            XferError::channel_closed(format!(
                "Failed to connect to {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        stream
            .set_read_timeout(timeout)
            .map_err(|e| XferError::from_io(e, "Failed to set read timeout"))?;
        Ok(Self { stream })
    }

    fn request(&mut self, request: &Request) -> Result<(Response, Option<OwnedFd>)> {
        codec::write_frame(&mut self.stream, request)?;
        let (response, fd) = self.receive()?;
        match response {
            Response::Error(err) => Err(err.into()),
            response => Ok((response, fd)),
        }
    }

    fn receive(&mut self) -> Result<(Response, Option<OwnedFd>)> {
        let mut header = [0u8; HEADER_LEN];
        let mut passed: Option<OwnedFd> = None;

        let received = {
            let mut iov = [IoSliceMut::new(&mut header)];
            let mut cmsg_buf = cmsg_space!([RawFd; 1]);
            let msg = recvmsg::<()>(
                self.stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_CMSG_CLOEXEC,
            )?;
            for cmsg in msg.cmsgs() {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    for raw in fds {
                        // Take ownership of every descriptor so extras are closed
                        let owned = unsafe { OwnedFd::from_raw_fd(raw) };
                        if passed.is_none() {
                            passed = Some(owned);
                        }
                    }
                }
            }
            msg.bytes
        };

        if received == 0 {
            return Err(XferError::channel_closed("Control server closed the connection"));
        }
        if received < HEADER_LEN {
            self.stream.read_exact(&mut header[received..])?;
        }
        let body = codec::read_body(&mut self.stream, header)?;
        Ok((codec::decode(&body)?, passed))
    }

    fn unexpected(request: &str, response: &Response) -> XferError {
        XferError::malformed(format!("Unexpected response {:?} to {}", response, request))
    }
}

impl ControlChannel for UnixChannel {
    fn control(&mut self, op: ControlOp) -> Result<ControlReply> {
        match self.request(&Request::Control(op))? {
            (Response::Control(reply), _) => Ok(reply),
            (other, _) => Err(Self::unexpected("Control", &other)),
        }
    }

    fn map_head(&mut self, length: usize) -> Result<MappedRegion> {
        match self.request(&Request::MapHead {
            length: length as u64,
        })? {
            (Response::Mapped(grant), _) if grant.is_empty() => Ok(MappedRegion::empty()),
            (Response::Mapped(grant), Some(fd)) => MappedRegion::from_grant(fd.as_fd(), &grant),
            (Response::Mapped(_), None) => Err(XferError::map_failure(
                "Mapping grant arrived without the arena descriptor",
            )),
            (other, _) => Err(Self::unexpected("MapHead", &other)),
        }
    }

    fn unmap(&mut self) -> Result<bool> {
        match self.request(&Request::Unmap)? {
            (Response::Unmapped { was_mapped }, _) => Ok(was_mapped),
            (other, _) => Err(Self::unexpected("Unmap", &other)),
        }
    }

    fn read_head(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let len = buf.len().min(u32::MAX as usize) as u32;
        match self.request(&Request::Read { pos, len })? {
            (Response::Data(data), _) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            (other, _) => Err(Self::unexpected("Read", &other)),
        }
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<bool> {
        let timeout_ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        match self.request(&Request::WaitReadable { timeout_ms })? {
            (Response::Readable(readable), _) => Ok(readable),
            (other, _) => Err(Self::unexpected("WaitReadable", &other)),
        }
    }

    fn ping(&mut self) -> Result<()> {
        match self.request(&Request::Ping)? {
            (Response::Pong, _) => Ok(()),
            (other, _) => Err(Self::unexpected("Ping", &other)),
        }
    }
}

/// Opens [`UnixChannel`]s to one socket path
#[derive(Debug, Clone)]
pub struct UnixConnector {
    path: PathBuf,
    timeout: Option<Duration>,
}

impl UnixConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: Some(Duration::from_secs(10)),
        }
    }

    /// Set the per-response read timeout; `None` blocks indefinitely
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Connector for UnixConnector {
    type Channel = UnixChannel;

    fn connect(&mut self) -> Result<UnixChannel> {
        UnixChannel::connect(&self.path, self.timeout)
    }
}
