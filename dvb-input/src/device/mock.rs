//! Scripted device backend for tests.

use std::collections::{HashSet, VecDeque};
use std::io::{self, Read};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dvb_protocol::{DtvCommand, FeStatus};
use parking_lot::Mutex;

use super::{DeviceBackend, FilterHandle, FrontendDevice, PidFilter, TsStream};

#[derive(Default)]
pub(crate) struct MockState {
    pub inaccessible: bool,
    pub frontend_open_error: Option<i32>,
    pub commit_error: Option<i32>,
    pub status: u32,
    pub status_error: Option<i32>,
    pub frontend_opens: usize,
    pub clears: usize,
    pub commits: Vec<Vec<DtvCommand>>,
    pub status_reads: usize,
    /// Every filter ever opened, in order, with the demux path.
    pub filter_opens: Vec<(PathBuf, u16)>,
    /// Filters currently open.
    pub open_filters: Vec<u16>,
    pub failing_pids: HashSet<u16>,
    /// Readers handed out by `open_stream` before creating fresh pairs.
    pub pending_streams: VecDeque<UnixStream>,
    /// Writer ends of pairs created by `open_stream`.
    pub stream_writers: Vec<UnixStream>,
    pub stream_opens: usize,
    /// Errors returned by DVR reads, one per read, before any data.
    pub read_errors: VecDeque<i32>,
}

#[derive(Clone, Default)]
pub(crate) struct MockDevices {
    pub state: Arc<Mutex<MockState>>,
}

impl MockDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, bits: u32) {
        self.state.lock().status = bits;
    }

    pub fn open_filters(&self) -> Vec<u16> {
        let mut pids = self.state.lock().open_filters.clone();
        pids.sort_unstable();
        pids
    }

    pub fn commit_count(&self) -> usize {
        self.state.lock().commits.len()
    }
}

#[derive(Debug)]
struct MockFilter {
    pid: u16,
    state: Arc<Mutex<MockState>>,
}

impl PidFilter for MockFilter {}

impl Drop for MockFilter {
    fn drop(&mut self) {
        let mut st = self.state.lock();
        if let Some(idx) = st.open_filters.iter().position(|p| *p == self.pid) {
            st.open_filters.remove(idx);
        }
    }
}

impl std::fmt::Debug for MockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockState").field("open_filters", &self.open_filters).finish()
    }
}

struct MockStream {
    inner: UnixStream,
    state: Arc<Mutex<MockState>>,
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(errno) = self.state.lock().read_errors.pop_front() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        self.inner.read(buf)
    }
}

impl AsFd for MockStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

struct MockFrontend {
    state: Arc<Mutex<MockState>>,
}

impl FrontendDevice for MockFrontend {
    fn clear(&mut self) -> io::Result<()> {
        self.state.lock().clears += 1;
        Ok(())
    }

    fn discard_events(&mut self) -> io::Result<usize> {
        Ok(0)
    }

    fn commit(&mut self, cmds: &[DtvCommand]) -> io::Result<()> {
        let mut st = self.state.lock();
        st.commits.push(cmds.to_vec());
        match st.commit_error {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(()),
        }
    }

    fn read_status(&mut self) -> io::Result<FeStatus> {
        let mut st = self.state.lock();
        st.status_reads += 1;
        match st.status_error {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(FeStatus(st.status)),
        }
    }
}

impl DeviceBackend for MockDevices {
    fn is_accessible(&self, _path: &Path) -> bool {
        !self.state.lock().inaccessible
    }

    fn open_frontend(&self, _path: &Path) -> io::Result<Box<dyn FrontendDevice>> {
        let mut st = self.state.lock();
        if let Some(errno) = st.frontend_open_error {
            return Err(io::Error::from_raw_os_error(errno));
        }
        st.frontend_opens += 1;
        Ok(Box::new(MockFrontend {
            state: Arc::clone(&self.state),
        }))
    }

    fn open_filter(&self, demux: &Path, pid: u16) -> io::Result<FilterHandle> {
        let mut st = self.state.lock();
        st.filter_opens.push((demux.to_path_buf(), pid));
        if st.failing_pids.contains(&pid) {
            return Err(io::Error::from_raw_os_error(16));
        }
        st.open_filters.push(pid);
        Ok(Box::new(MockFilter {
            pid,
            state: Arc::clone(&self.state),
        }))
    }

    fn open_stream(&self, _dvr: &Path) -> io::Result<Box<dyn TsStream>> {
        let mut st = self.state.lock();
        st.stream_opens += 1;
        let reader = match st.pending_streams.pop_front() {
            Some(reader) => reader,
            None => {
                let (reader, writer) = UnixStream::pair()?;
                st.stream_writers.push(writer);
                reader
            }
        };
        reader.set_nonblocking(true)?;
        Ok(Box::new(MockStream {
            inner: reader,
            state: Arc::clone(&self.state),
        }))
    }
}
