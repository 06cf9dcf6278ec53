//! Frontend status bits and signal classification.

use serde::Serialize;

/// Bitmask returned by `FE_READ_STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeStatus(pub u32);

impl FeStatus {
    pub const HAS_SIGNAL: u32 = 0x01;
    pub const HAS_CARRIER: u32 = 0x02;
    pub const HAS_VITERBI: u32 = 0x04;
    pub const HAS_SYNC: u32 = 0x08;
    pub const HAS_LOCK: u32 = 0x10;
    pub const TIMEDOUT: u32 = 0x20;
    pub const REINIT: u32 = 0x40;

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains_any(self, mask: u32) -> bool {
        self.0 & mask != 0
    }

    /// Classify the status bits into a signal state.
    ///
    /// Precedence: LOCK > (SYNC | VITERBI | CARRIER) > SIGNAL > nothing.
    pub fn classify(self) -> SignalState {
        if self.contains_any(Self::HAS_LOCK) {
            SignalState::Good
        } else if self.contains_any(Self::HAS_SYNC | Self::HAS_VITERBI | Self::HAS_CARRIER) {
            SignalState::Bad
        } else if self.contains_any(Self::HAS_SIGNAL) {
            SignalState::Faint
        } else {
            SignalState::None
        }
    }
}

/// Signal quality as seen by the lock monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalState {
    None,
    Faint,
    Bad,
    Good,
}
