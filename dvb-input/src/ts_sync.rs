//! Transport stream packet synchronisation.
//!
//! The reader hands over whatever it has buffered; this sink locates
//! packet boundaries, publishes complete packets and reports how many
//! trailing bytes belong to a packet that is not complete yet.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use log::{debug, trace};
use tokio::sync::broadcast;

use crate::ingest::{InstanceSnapshot, TsSink};

/// TS packet size.
pub const TS_PACKET_SIZE: usize = 188;
/// TS sync byte.
pub const SYNC_BYTE: u8 = 0x47;

const PACKET_CAPACITY: usize = 1024;

/// A run of complete, aligned packets from one multiplex.
#[derive(Debug, Clone)]
pub struct MuxPackets {
    pub mux: String,
    pub instance: String,
    pub data: Bytes,
}

impl MuxPackets {
    pub fn packets(&self) -> impl Iterator<Item = &[u8]> {
        self.data.chunks_exact(TS_PACKET_SIZE)
    }
}

pub fn packet_pid(packet: &[u8]) -> u16 {
    ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16
}

/// Offset of the first byte that starts two consecutive packets (or the
/// last possible packet start when only one fits).
fn find_sync(data: &[u8]) -> Option<usize> {
    (0..data.len()).find(|&i| {
        data[i] == SYNC_BYTE
            && (i + TS_PACKET_SIZE >= data.len() || data[i + TS_PACKET_SIZE] == SYNC_BYTE)
    })
}

/// Default sink: aligns packets and broadcasts them.
pub struct PacketSync {
    tx: broadcast::Sender<MuxPackets>,
    packets: AtomicU64,
    skipped: AtomicU64,
}

impl Default for PacketSync {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketSync {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(PACKET_CAPACITY);
        Self {
            tx,
            packets: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MuxPackets> {
        self.tx.subscribe()
    }

    pub fn packet_count(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    /// Bytes discarded while searching for sync.
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

impl TsSink for PacketSync {
    fn recv_packets(&self, instance: &InstanceSnapshot, buf: &[u8]) -> usize {
        let mut pos = 0;
        let mut aligned = Vec::with_capacity(buf.len());

        while buf.len() - pos >= TS_PACKET_SIZE {
            if buf[pos] != SYNC_BYTE {
                match find_sync(&buf[pos..]) {
                    Some(off) => {
                        trace!("{} - resync after {} bytes", instance.frontend, off);
                        self.skipped.fetch_add(off as u64, Ordering::Relaxed);
                        pos += off;
                        continue;
                    }
                    None => {
                        // keep the tail, a sync byte may still arrive
                        let keep = (TS_PACKET_SIZE - 1).min(buf.len() - pos);
                        let drop = buf.len() - pos - keep;
                        self.skipped.fetch_add(drop as u64, Ordering::Relaxed);
                        pos += drop;
                        break;
                    }
                }
            }
            aligned.extend_from_slice(&buf[pos..pos + TS_PACKET_SIZE]);
            pos += TS_PACKET_SIZE;
        }

        if !aligned.is_empty() {
            let count = aligned.len() / TS_PACKET_SIZE;
            self.packets.fetch_add(count as u64, Ordering::Relaxed);
            let batch = MuxPackets {
                mux: instance.mux.clone(),
                instance: instance.instance.clone(),
                data: Bytes::from(aligned),
            };
            if self.tx.send(batch).is_err() {
                trace!("{} - no packet subscribers", instance.frontend);
            }
        }

        let rem = buf.len() - pos;
        if rem >= TS_PACKET_SIZE {
            debug!("{} - unexpected remainder {}", instance.frontend, rem);
        }
        rem
    }
}
