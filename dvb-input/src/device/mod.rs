//! Device boundary: frontend control, demux filters and the DVR stream.
//!
//! Linux builds talk to `/dev/dvb/adapterN/*` through ioctls. Other
//! platforms get a backend that fails every open with `Unsupported`.

use std::fmt;
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use dvb_protocol::{DtvCommand, FeStatus};

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::LinuxDevices;

#[cfg(not(target_os = "linux"))]
mod stub {
    //! Stub implementation for non-Linux platforms.

    use std::io;
    use std::path::Path;

    use super::{DeviceBackend, FilterHandle, FrontendDevice, TsStream};

    fn unsupported() -> io::Error {
        io::Error::new(
            io::ErrorKind::Unsupported,
            "Linux DVB devices are only supported on Linux",
        )
    }

    #[derive(Debug, Default, Clone, Copy)]
    pub struct LinuxDevices;

    impl LinuxDevices {
        pub fn new() -> Self {
            Self
        }
    }

    impl DeviceBackend for LinuxDevices {
        fn is_accessible(&self, _path: &Path) -> bool {
            false
        }

        fn open_frontend(&self, _path: &Path) -> io::Result<Box<dyn FrontendDevice>> {
            Err(unsupported())
        }

        fn open_filter(&self, _demux: &Path, _pid: u16) -> io::Result<FilterHandle> {
            Err(unsupported())
        }

        fn open_stream(&self, _dvr: &Path) -> io::Result<Box<dyn TsStream>> {
            Err(unsupported())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use stub::LinuxDevices;

#[cfg(test)]
pub(crate) mod mock;

/// Device nodes belonging to one frontend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontendPaths {
    pub frontend: PathBuf,
    pub demux: PathBuf,
    pub dvr: PathBuf,
}

impl FrontendPaths {
    /// Standard layout below `/dev/dvb`.
    pub fn for_adapter(adapter: u32, number: u32) -> Self {
        let dir = PathBuf::from(format!("/dev/dvb/adapter{}", adapter));
        Self {
            frontend: dir.join(format!("frontend{}", number)),
            demux: dir.join(format!("demux{}", number)),
            dvr: dir.join(format!("dvr{}", number)),
        }
    }
}

/// An open frontend control device.
pub trait FrontendDevice: Send {
    /// Reset the driver's property cache (`DTV_CLEAR`).
    fn clear(&mut self) -> io::Result<()>;

    /// Drop queued frontend events. Returns how many were discarded.
    fn discard_events(&mut self) -> io::Result<usize>;

    /// Submit the whole sequence as one property batch.
    fn commit(&mut self, cmds: &[DtvCommand]) -> io::Result<()>;

    fn read_status(&mut self) -> io::Result<FeStatus>;
}

/// A programmed demux filter. Dropping it closes the filter.
pub trait PidFilter: Send + fmt::Debug {}

impl PidFilter for std::fs::File {}

pub type FilterHandle = Box<dyn PidFilter>;

/// Raw transport stream source, opened non-blocking.
pub trait TsStream: Read + AsFd + Send {}

impl<T: Read + AsFd + Send> TsStream for T {}

/// Opens devices. Shared between the controller and reader threads.
pub trait DeviceBackend: Send + Sync {
    /// Whether the path can be opened read/write.
    fn is_accessible(&self, path: &Path) -> bool;

    fn open_frontend(&self, path: &Path) -> io::Result<Box<dyn FrontendDevice>>;

    /// Open the demux and program a pass-through filter for `pid`
    /// (`PID_WILDCARD` passes every PID).
    fn open_filter(&self, demux: &Path, pid: u16) -> io::Result<FilterHandle>;

    fn open_stream(&self, dvr: &Path) -> io::Result<Box<dyn TsStream>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_paths() {
        let p = FrontendPaths::for_adapter(1, 0);
        assert_eq!(p.frontend, PathBuf::from("/dev/dvb/adapter1/frontend0"));
        assert_eq!(p.demux, PathBuf::from("/dev/dvb/adapter1/demux0"));
        assert_eq!(p.dvr, PathBuf::from("/dev/dvb/adapter1/dvr0"));
    }
}
