//! Linux DVB API v5 backend.

use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use dvb_protocol::{DtvCommand, FeStatus};
use log::trace;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd::AccessFlags;

use super::{DeviceBackend, FilterHandle, FrontendDevice, TsStream};

const DMX_IN_FRONTEND: u32 = 0;
const DMX_OUT_TS_TAP: u32 = 2;
const DMX_PES_OTHER: u32 = 20;
const DMX_IMMEDIATE_START: u32 = 4;

/// Upper bound on stale events drained before a tune.
const MAX_STALE_EVENTS: usize = 256;

/// `struct dtv_property`. The union is represented by its `data` member plus padding.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct DtvProperty {
    cmd: u32,
    reserved: [u32; 3],
    data: u32,
    padding: [u8; 44 + mem::size_of::<usize>()],
    result: i32,
}

impl DtvProperty {
    fn new(cmd: &DtvCommand) -> Self {
        Self {
            cmd: cmd.cmd as u32,
            reserved: [0; 3],
            data: cmd.data,
            padding: [0; 44 + mem::size_of::<usize>()],
            result: 0,
        }
    }
}

#[repr(C)]
struct DtvProperties {
    num: u32,
    props: *mut DtvProperty,
}

/// `struct dvb_frontend_event`. Only drained, never inspected.
#[repr(C)]
struct FrontendEvent {
    status: u32,
    frequency: u32,
    inversion: u32,
    params: [u32; 7],
}

#[repr(C)]
struct DmxPesFilterParams {
    pid: u16,
    input: u32,
    output: u32,
    pes_type: u32,
    flags: u32,
}

nix::ioctl_write_ptr!(fe_set_property, b'o', 82, DtvProperties);
nix::ioctl_read!(fe_read_status, b'o', 69, u32);
nix::ioctl_read!(fe_get_event, b'o', 78, FrontendEvent);
nix::ioctl_write_ptr!(dmx_set_pes_filter, b'o', 44, DmxPesFilterParams);

/// Device backend for `/dev/dvb` nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxDevices;

impl LinuxDevices {
    pub fn new() -> Self {
        Self
    }
}

struct LinuxFrontend {
    file: File,
}

impl LinuxFrontend {
    fn set_properties(&self, cmds: &[DtvCommand]) -> io::Result<()> {
        let mut props: Vec<DtvProperty> = cmds.iter().map(DtvProperty::new).collect();
        let seq = DtvProperties {
            num: props.len() as u32,
            props: props.as_mut_ptr(),
        };
        // SAFETY: `seq` points at `props`, which outlives the call.
        unsafe { fe_set_property(self.file.as_raw_fd(), &seq) }?;
        Ok(())
    }
}

impl FrontendDevice for LinuxFrontend {
    fn clear(&mut self) -> io::Result<()> {
        self.set_properties(&[DtvCommand::clear()])
    }

    fn discard_events(&mut self) -> io::Result<usize> {
        let mut ev = FrontendEvent {
            status: 0,
            frequency: 0,
            inversion: 0,
            params: [0; 7],
        };
        let mut count = 0;
        while count < MAX_STALE_EVENTS {
            // SAFETY: `ev` is a valid, writable dvb_frontend_event.
            match unsafe { fe_get_event(self.file.as_raw_fd(), &mut ev) } {
                Ok(_) => count += 1,
                Err(Errno::EAGAIN) => break,
                Err(e) => {
                    trace!("FE_GET_EVENT stopped: {}", e);
                    break;
                }
            }
        }
        Ok(count)
    }

    fn commit(&mut self, cmds: &[DtvCommand]) -> io::Result<()> {
        self.set_properties(cmds)
    }

    fn read_status(&mut self) -> io::Result<FeStatus> {
        let mut status: u32 = 0;
        // SAFETY: `status` is a valid u32 for fe_status_t.
        unsafe { fe_read_status(self.file.as_raw_fd(), &mut status) }?;
        Ok(FeStatus(status))
    }
}

impl DeviceBackend for LinuxDevices {
    fn is_accessible(&self, path: &Path) -> bool {
        nix::unistd::access(path, AccessFlags::R_OK | AccessFlags::W_OK).is_ok()
    }

    fn open_frontend(&self, path: &Path) -> io::Result<Box<dyn FrontendDevice>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(path)?;
        Ok(Box::new(LinuxFrontend { file }))
    }

    fn open_filter(&self, demux: &Path, pid: u16) -> io::Result<FilterHandle> {
        let file = OpenOptions::new().read(true).write(true).open(demux)?;
        let params = DmxPesFilterParams {
            pid,
            input: DMX_IN_FRONTEND,
            output: DMX_OUT_TS_TAP,
            pes_type: DMX_PES_OTHER,
            flags: DMX_IMMEDIATE_START,
        };
        // SAFETY: `params` is a valid dmx_pes_filter_params for the call.
        unsafe { dmx_set_pes_filter(file.as_raw_fd(), &params) }?;
        Ok(Box::new(file))
    }

    fn open_stream(&self, dvr: &Path) -> io::Result<Box<dyn TsStream>> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(dvr)?;
        Ok(Box::new(file))
    }
}
