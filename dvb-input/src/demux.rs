//! Demux filter management.
//!
//! Every elementary stream and PSI table is received through its own
//! single-PID pass-through filter on the frontend's demux device. A
//! multiplex remembers which table PIDs it has asked for in a bitmap that
//! covers the full 13-bit PID space; the bitmap only drives logging, the
//! filters themselves are tracked by their owners.

use std::collections::HashMap;
use std::path::Path;

use dvb_protocol::{TableDef, PID_COUNT, PID_WILDCARD};
use log::{error, trace, warn};

use crate::device::{DeviceBackend, FilterHandle};

/// Open a pass-through filter for one PID on `demux`.
///
/// Callers are responsible for not opening the same PID twice.
pub fn open_pid(
    backend: &dyn DeviceBackend,
    name: &str,
    demux: &Path,
    pid: u16,
) -> std::io::Result<FilterHandle> {
    match backend.open_filter(demux, pid) {
        Ok(handle) => {
            trace!("{} - open PID {:04X} ({})", name, pid, pid);
            Ok(handle)
        }
        Err(e) => {
            error!(
                "{} - failed to open dmx {} for pid {} [e={}]",
                name,
                demux.display(),
                pid,
                e
            );
            Err(e)
        }
    }
}

/// One bit per PID.
#[derive(Clone, PartialEq, Eq)]
pub struct PidBitmap {
    words: [u64; PID_COUNT / 64],
}

impl Default for PidBitmap {
    fn default() -> Self {
        Self {
            words: [0; PID_COUNT / 64],
        }
    }
}

impl std::fmt::Debug for PidBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl PidBitmap {
    pub const CAPACITY: usize = PID_COUNT;

    pub fn new() -> Self {
        Self::default()
    }

    fn index(pid: u16) -> Option<(usize, u64)> {
        let pid = pid as usize;
        (pid < PID_COUNT).then(|| (pid / 64, 1u64 << (pid % 64)))
    }

    pub fn contains(&self, pid: u16) -> bool {
        Self::index(pid).map_or(false, |(w, bit)| self.words[w] & bit != 0)
    }

    /// Set the bit. Returns true on the 0 -> 1 edge.
    pub fn insert(&mut self, pid: u16) -> bool {
        match Self::index(pid) {
            Some((w, bit)) => {
                let was = self.words[w] & bit != 0;
                self.words[w] |= bit;
                !was
            }
            None => false,
        }
    }

    /// Clear the bit. Returns true on the 1 -> 0 edge.
    pub fn remove(&mut self, pid: u16) -> bool {
        match Self::index(pid) {
            Some((w, bit)) => {
                let was = self.words[w] & bit != 0;
                self.words[w] &= !bit;
                was
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (0..PID_COUNT as u16).filter(move |pid| self.contains(*pid))
    }
}

/// Where table filters are opened while a multiplex is tuned.
pub struct DemuxTarget<'a> {
    pub backend: &'a dyn DeviceBackend,
    /// Frontend display name, for logging.
    pub frontend: &'a str,
    pub demux: &'a Path,
}

/// Table filters of one multiplex.
#[derive(Debug, Default)]
pub struct MuxTables {
    installed: PidBitmap,
    tables: Vec<TableDef>,
    filters: HashMap<u16, FilterHandle>,
}

impl MuxTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn installed(&self) -> &PidBitmap {
        &self.installed
    }

    pub fn tables(&self) -> &[TableDef] {
        &self.tables
    }

    #[cfg(test)]
    pub(crate) fn open_filter_count(&self) -> usize {
        self.filters.len()
    }

    #[cfg(test)]
    pub(crate) fn has_filter(&self, pid: u16) -> bool {
        self.filters.contains_key(&pid)
    }

    /// Register a table and, when tuned, open its filter.
    ///
    /// Tables sharing a PID share one filter.
    pub fn install(&mut self, mux: &str, table: &TableDef, target: Option<&DemuxTarget<'_>>) {
        if table.pid >= PID_WILDCARD {
            return;
        }
        if self.installed.insert(table.pid) {
            trace!(
                "{} - opened table {} pid {:04X} ({})",
                mux,
                table.name,
                table.pid,
                table.pid
            );
        }
        if !self.tables.iter().any(|t| t.name == table.name) {
            self.tables.push(*table);
        }

        if let Some(target) = target {
            if self.filters.contains_key(&table.pid) {
                return;
            }
            match open_pid(target.backend, target.frontend, target.demux, table.pid) {
                Ok(handle) => {
                    self.filters.insert(table.pid, handle);
                }
                Err(_) => {
                    warn!("{} - table {} will not receive data", mux, table.name);
                }
            }
        }
    }

    /// Open the filters of tables registered while nothing was tuned.
    pub fn open_installed(&mut self, mux: &str, target: &DemuxTarget<'_>) {
        let pending: Vec<TableDef> = self
            .tables
            .iter()
            .filter(|t| !self.filters.contains_key(&t.pid))
            .copied()
            .collect();
        for table in pending {
            self.install(mux, &table, Some(target));
        }
    }

    /// Remove every table on `pid` and close its filter.
    pub fn uninstall(&mut self, mux: &str, pid: u16) {
        if pid >= PID_WILDCARD {
            return;
        }
        for table in self.tables.iter().filter(|t| t.pid == pid) {
            trace!("{} - closed table {} pid {:04X} ({})", mux, table.name, pid, pid);
        }
        self.installed.remove(pid);
        self.tables.retain(|t| t.pid != pid);
        self.filters.remove(&pid);
    }

    pub fn uninstall_all(&mut self, mux: &str) {
        let pids: Vec<u16> = self.installed.iter().collect();
        for pid in pids {
            self.uninstall(mux, pid);
        }
    }
}
