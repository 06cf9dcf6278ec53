//! Stream ingestion: one reader thread per tuned frontend.
//!
//! The thread owns the DVR device (and the wide demux filter in full mux
//! mode). It waits on the DVR and a private shutdown socket with a short
//! timeout, appends what it reads after any partial packet left over from
//! the previous read, and hands the buffer to a [`TsSink`].

use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dvb_protocol::PID_WILDCARD;
use log::{debug, error, info, trace, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::{Condvar, Mutex};

use crate::demux;
use crate::device::{DeviceBackend, FrontendPaths};
use crate::ts_sync::TS_PACKET_SIZE;

/// Read buffer size (100 packets).
pub const READ_BUFFER_SIZE: usize = 18800;

/// Readiness wait timeout in milliseconds. Bounds shutdown latency.
pub const POLL_TIMEOUT_MS: u16 = 10;

/// The mux instance a reader was started for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSnapshot {
    pub instance: String,
    pub mux: String,
    pub mux_name: String,
    /// Frontend display name.
    pub frontend: String,
}

/// Consumer of raw transport stream bytes.
pub trait TsSink: Send + Sync {
    /// Consume the complete packets in `buf` and return how many trailing
    /// bytes were left unconsumed.
    fn recv_packets(&self, instance: &InstanceSnapshot, buf: &[u8]) -> usize;
}

#[derive(Debug, Default)]
struct DvrSlot {
    active: Option<InstanceSnapshot>,
    full_mux: bool,
    captured: bool,
}

/// State shared between a frontend and its reader thread.
#[derive(Debug, Default)]
pub struct DvrShared {
    slot: Mutex<DvrSlot>,
    cond: Condvar,
    bytes: AtomicU64,
}

impl DvrShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bytes read since the last call.
    pub fn take_bytes(&self) -> u64 {
        self.bytes.swap(0, Ordering::AcqRel)
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }
}

/// Why a reader thread returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    Shutdown,
    EndOfStream,
    ReadError,
    OpenFailed,
    NoInstance,
}

/// Handle to a running reader thread.
pub struct IngestHandle {
    name: String,
    shutdown: UnixStream,
    thread: Option<JoinHandle<ReaderExit>>,
}

/// Everything the reader needs besides the handshake.
pub struct ReaderParams {
    pub name: String,
    pub backend: Arc<dyn DeviceBackend>,
    pub sink: Arc<dyn TsSink>,
    pub paths: FrontendPaths,
}

/// Start the reader and wait until it has captured `instance`.
pub fn start(
    params: ReaderParams,
    shared: &Arc<DvrShared>,
    instance: Option<InstanceSnapshot>,
    full_mux: bool,
) -> io::Result<IngestHandle> {
    let (shutdown, shutdown_rx) = UnixStream::pair()?;
    shutdown_rx.set_nonblocking(true)?;

    let name = params.name.clone();
    let thread_shared = Arc::clone(shared);

    let mut slot = shared.slot.lock();
    slot.active = instance;
    slot.full_mux = full_mux;
    slot.captured = false;

    let thread = thread::Builder::new()
        .name(format!("dvr-{}", name))
        .spawn(move || run(params, thread_shared, shutdown_rx))?;

    while !slot.captured {
        shared.cond.wait(&mut slot);
    }
    drop(slot);

    debug!("{} - dvr thread started", name);
    Ok(IngestHandle {
        name,
        shutdown,
        thread: Some(thread),
    })
}

impl IngestHandle {
    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Signal the reader and wait for it to exit.
    pub fn stop(mut self) -> Option<ReaderExit> {
        self.shutdown_and_join()
    }

    fn shutdown_and_join(&mut self) -> Option<ReaderExit> {
        let thread = self.thread.take()?;
        if let Err(e) = (&self.shutdown).write_all(&[0]) {
            // the reader may already be gone
            debug!("{} - shutdown signal not delivered: {}", self.name, e);
        }
        trace!("{} - waiting for dvr thread", self.name);
        let exit = match thread.join() {
            Ok(exit) => Some(exit),
            Err(_) => {
                error!("{} - dvr thread panicked", self.name);
                None
            }
        };
        debug!("{} - stopped dvr thread", self.name);
        exit
    }
}

impl Drop for IngestHandle {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

fn is_ready(fd: &PollFd<'_>) -> bool {
    fd.revents().map_or(false, |r| !r.is_empty())
}

fn run(params: ReaderParams, shared: Arc<DvrShared>, shutdown: UnixStream) -> ReaderExit {
    let ReaderParams {
        name,
        backend,
        sink,
        paths,
    } = params;

    let (instance, full_mux) = {
        let mut slot = shared.slot.lock();
        let captured = (slot.active.clone(), slot.full_mux);
        slot.captured = true;
        shared.cond.notify_one();
        captured
    };
    let Some(instance) = instance else {
        return ReaderExit::NoInstance;
    };

    let _wide = if full_mux {
        match demux::open_pid(backend.as_ref(), &name, &paths.demux, PID_WILDCARD) {
            Ok(handle) => Some(handle),
            Err(_) => {
                error!("{} - open raw filter failed", name);
                return ReaderExit::OpenFailed;
            }
        }
    } else {
        None
    };

    let mut stream = match backend.open_stream(&paths.dvr) {
        Ok(stream) => stream,
        Err(e) => {
            error!("{} - failed to open {}: {}", name, paths.dvr.display(), e);
            return ReaderExit::OpenFailed;
        }
    };

    info!("{} - reading {}", name, instance.mux_name);

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut pos = 0usize;

    let exit = loop {
        let (data_ready, stop) = {
            let mut fds = [
                PollFd::new(stream.as_fd(), PollFlags::POLLIN),
                PollFd::new(shutdown.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!("{} - poll() error {}", name, e);
                    break ReaderExit::ReadError;
                }
            }
            (is_ready(&fds[0]), is_ready(&fds[1]))
        };

        if stop {
            break ReaderExit::Shutdown;
        }
        if !data_ready {
            continue;
        }

        let n = match stream.read(&mut buf[pos..]) {
            Ok(0) => {
                debug!("{} - end of stream", name);
                break ReaderExit::EndOfStream;
            }
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                continue;
            }
            Err(e) if e.raw_os_error() == Some(Errno::EOVERFLOW as i32) => {
                warn!("{} - read() EOVERFLOW", name);
                continue;
            }
            Err(e) => {
                error!("{} - read() error {}", name, e);
                break ReaderExit::ReadError;
            }
        };
        shared.add_bytes(n as u64);

        let filled = pos + n;
        if filled < TS_PACKET_SIZE {
            pos = filled;
            continue;
        }

        let rem = sink.recv_packets(&instance, &buf[..filled]).min(filled);
        if rem >= buf.len() {
            warn!("{} - no packets in full buffer, dropping", name);
            pos = 0;
            continue;
        }
        buf.copy_within(filled - rem..filled, 0);
        pos = rem;
    };

    info!("{} - dvr thread exiting ({:?})", name, exit);
    exit
}
