//! Background TCP client that streams tracker state to a consumer.
//!
//! One worker thread owns one outbound connection. While connected it pushes a
//! `SUMMARY` frame every metrics interval and answers each `SNAPSHOT` line with
//! a `LIVE_ALLOCS` frame. Any I/O failure drops the connection and the worker
//! goes back to reconnecting with exponential backoff until stopped.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::process;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::api;
use crate::config::TransportConfig;
use crate::guard::ReentryGuard;
use crate::wire::Command;

const READ_CHUNK: usize = 4096;

// A consumer that never sends a newline cannot make us buffer forever.
const MAX_PENDING_INPUT: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    Stopped,
    Disconnected,
    Connected,
}

impl TransportState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => TransportState::Disconnected,
            2 => TransportState::Connected,
            _ => TransportState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TransportState::Stopped => 0,
            TransportState::Disconnected => 1,
            TransportState::Connected => 2,
        }
    }
}

// Stop request the worker can sleep on.
struct StopSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        StopSignal {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn is_set(&self) -> bool {
        *self.stopped.lock()
    }

    fn set(&self) {
        *self.stopped.lock() = true;
        self.cv.notify_all();
    }

    fn reset(&self) {
        *self.stopped.lock() = false;
    }

    /// Sleeps for `timeout` or until stop is requested. Returns `true` if stop
    /// was requested.
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.cv.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

struct Shared {
    stop: StopSignal,
    state: AtomicU8,
    // Process that spawned the worker. A forked child inherits the handle but
    // not the thread.
    owner_pid: AtomicU32,
}

impl Shared {
    fn set_state(&self, state: TransportState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }
}

/// Handle to the streaming worker. Dropping the handle stops the worker.
pub struct Transport {
    config: TransportConfig,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        Transport {
            config,
            shared: Arc::new(Shared {
                stop: StopSignal::new(),
                state: AtomicU8::new(TransportState::Stopped.as_u8()),
                owner_pid: AtomicU32::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Starts streaming to `host:port`. Returns immediately; does nothing if
    /// the worker is already running.
    pub fn start(&self, host: &str, port: u16) {
        let mut config = self.config.clone();
        config.host = host.to_owned();
        config.port = port;
        self.spawn(config);
    }

    /// Starts streaming to the endpoint in the configuration.
    pub fn start_configured(&self) {
        self.spawn(self.config.clone());
    }

    fn spawn(&self, config: TransportConfig) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        self.shared.stop.reset();
        self.shared.owner_pid.store(process::id(), Ordering::SeqCst);
        self.shared.set_state(TransportState::Disconnected);
        let job = Worker {
            config,
            shared: Arc::clone(&self.shared),
        };
        match thread::Builder::new()
            .name("memprof-transport".to_owned())
            .spawn(move || job.run())
        {
            Ok(handle) => *worker = Some(handle),
            Err(e) => {
                warn!("failed to spawn transport worker: {}", e);
                self.shared.set_state(TransportState::Stopped);
            }
        }
    }

    /// Stops the worker and waits for it to exit; the connection, if any, is
    /// closed by then. Safe to call repeatedly, before [`Transport::start`], and
    /// in the child of a `fork()`, where it only marks the transport stopped.
    pub fn stop(&self) {
        let mut worker = self.worker.lock();
        let handle = match worker.take() {
            Some(handle) => handle,
            None => return,
        };
        if self.shared.owner_pid.load(Ordering::SeqCst) != process::id() {
            // Forked child: the worker thread does not exist here, and joining
            // or detaching its handle would fail.
            std::mem::forget(handle);
            self.shared.set_state(TransportState::Stopped);
            debug!("transport inherited across fork; not joining");
            return;
        }
        self.shared.stop.set();
        if handle.join().is_err() {
            warn!("transport worker panicked");
        }
        self.shared.set_state(TransportState::Stopped);
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    pub fn state(&self) -> TransportState {
        TransportState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

// Why a connected session ended.
#[derive(Debug)]
enum SessionEnd {
    Stopped,
    PeerClosed,
    Io(io::Error),
}

impl From<io::Error> for SessionEnd {
    fn from(e: io::Error) -> Self {
        SessionEnd::Io(e)
    }
}

struct Worker {
    config: TransportConfig,
    shared: Arc<Shared>,
}

impl Worker {
    fn run(self) {
        // Everything this thread allocates (frames, buffers, resolver results)
        // belongs to the profiler, not the program being profiled.
        let _guard = ReentryGuard::new();

        let endpoint = format!("{}:{}", self.config.host, self.config.port);
        let mut backoff = self.config.backoff_initial;

        while !self.shared.stop.is_set() {
            self.shared.set_state(TransportState::Disconnected);
            debug!("connecting to {}", endpoint);

            let stream = match self.connect() {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("connect to {} failed: {}; retrying in {:?}", endpoint, e, backoff);
                    if self.shared.stop.wait(backoff) {
                        break;
                    }
                    backoff = self.config.next_backoff(backoff);
                    continue;
                }
            };

            backoff = self.config.backoff_initial;
            self.shared.set_state(TransportState::Connected);
            info!("connected to {}", endpoint);

            match self.serve(stream) {
                SessionEnd::Stopped => break,
                SessionEnd::PeerClosed => info!("{} closed the connection", endpoint),
                SessionEnd::Io(e) => warn!("connection to {} failed: {}", endpoint, e),
            }
        }

        self.shared.set_state(TransportState::Stopped);
        debug!("transport worker exiting");
    }

    fn connect(&self) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in (self.config.host.as_str(), self.config.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    // A peer that stops reading must not wedge the worker.
                    stream.set_write_timeout(Some(self.config.connect_timeout))?;
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(ErrorKind::NotFound, "host resolved to no addresses")
        }))
    }

    fn serve(&self, mut stream: TcpStream) -> SessionEnd {
        let mut pending: Vec<u8> = Vec::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];
        // The first summary goes out as soon as the connection is up.
        let mut next_metrics = Instant::now();

        loop {
            if self.shared.stop.is_set() {
                return SessionEnd::Stopped;
            }

            let now = Instant::now();
            if now >= next_metrics {
                if let Err(e) = send_frame(&mut stream, api::summary_message_json()) {
                    return e.into();
                }
                next_metrics = now + self.config.metrics_interval;
                continue;
            }

            // One bounded wait covers both inbound data and the next deadline.
            let wait = (next_metrics - now).min(self.config.poll_tick);
            if let Err(e) = stream.set_read_timeout(Some(wait.max(Duration::from_millis(1)))) {
                return e.into();
            }

            match stream.read(&mut chunk) {
                Ok(0) => return SessionEnd::PeerClosed,
                Ok(n) => {
                    pending.extend_from_slice(&chunk[..n]);
                    if let Err(e) = self.handle_commands(&mut stream, &mut pending) {
                        return e.into();
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) => {}
                Err(e) => return e.into(),
            }
        }
    }

    fn handle_commands(&self, stream: &mut TcpStream, pending: &mut Vec<u8>) -> io::Result<()> {
        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            match Command::parse(&line) {
                Some(Command::Snapshot) => {
                    debug!("snapshot requested");
                    send_frame(stream, api::live_allocs_message_json())?;
                }
                None => trace!("ignoring line {:?}", line.trim()),
            }
        }

        if pending.len() > MAX_PENDING_INPUT {
            debug!("discarding {} bytes of unterminated input", pending.len());
            pending.clear();
        }
        Ok(())
    }
}

// Writes one frame and its newline terminator in full.
fn send_frame(stream: &mut TcpStream, mut frame: String) -> io::Result<()> {
    frame.push('\n');
    stream.write_all(frame.as_bytes())
}
