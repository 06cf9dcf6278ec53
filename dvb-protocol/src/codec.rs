//! Tuning parameters to frontend property commands.
//!
//! The command sequence is what `FE_SET_PROPERTY` receives in one
//! `dtv_properties` batch:
//!
//! ```text
//! DELIVERY_SYSTEM, FREQUENCY, INVERSION, <family fields...>, TUNE
//! ```
//!
//! Building the sequence performs no I/O.

use std::fmt;

use crate::types::*;

/// `DTV_*` property command identifiers from `linux/dvb/frontend.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DtvCmd {
    Tune = 1,
    Clear = 2,
    Frequency = 3,
    Modulation = 4,
    BandwidthHz = 5,
    Inversion = 6,
    SymbolRate = 8,
    InnerFec = 9,
    Rolloff = 13,
    DeliverySystem = 17,
    CodeRateHp = 36,
    CodeRateLp = 37,
    GuardInterval = 38,
    TransmissionMode = 39,
    Hierarchy = 40,
}

impl DtvCmd {
    pub fn name(self) -> &'static str {
        match self {
            DtvCmd::Tune => "DTV_TUNE",
            DtvCmd::Clear => "DTV_CLEAR",
            DtvCmd::Frequency => "DTV_FREQUENCY",
            DtvCmd::Modulation => "DTV_MODULATION",
            DtvCmd::BandwidthHz => "DTV_BANDWIDTH_HZ",
            DtvCmd::Inversion => "DTV_INVERSION",
            DtvCmd::SymbolRate => "DTV_SYMBOL_RATE",
            DtvCmd::InnerFec => "DTV_INNER_FEC",
            DtvCmd::Rolloff => "DTV_ROLLOFF",
            DtvCmd::DeliverySystem => "DTV_DELIVERY_SYSTEM",
            DtvCmd::CodeRateHp => "DTV_CODE_RATE_HP",
            DtvCmd::CodeRateLp => "DTV_CODE_RATE_LP",
            DtvCmd::GuardInterval => "DTV_GUARD_INTERVAL",
            DtvCmd::TransmissionMode => "DTV_TRANSMISSION_MODE",
            DtvCmd::Hierarchy => "DTV_HIERARCHY",
        }
    }
}

/// One property command: identifier plus its 32-bit payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtvCommand {
    pub cmd: DtvCmd,
    pub data: u32,
}

impl DtvCommand {
    pub const fn new(cmd: DtvCmd, data: u32) -> Self {
        Self { cmd, data }
    }

    /// The commit marker that ends every sequence.
    pub const fn tune() -> Self {
        Self::new(DtvCmd::Tune, 0)
    }

    /// Resets the driver's cached properties.
    pub const fn clear() -> Self {
        Self::new(DtvCmd::Clear, 0)
    }
}

impl fmt::Display for DtvCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {}", self.cmd.name(), self.data)
    }
}

/// Build the ordered command sequence for `params`.
///
/// `frequency` replaces the multiplex frequency when set.
pub fn build_commands(params: &TuningParameters, frequency: Option<u32>) -> Vec<DtvCommand> {
    let mut cmds = Vec::with_capacity(12);
    let mut push = |cmd, data| cmds.push(DtvCommand::new(cmd, data));

    push(DtvCmd::DeliverySystem, params.delivery_system.raw());
    push(DtvCmd::Frequency, frequency.unwrap_or(params.frequency));
    push(DtvCmd::Inversion, params.inversion.raw());

    match &params.delivery {
        DeliveryParams::Terrestrial(t) => {
            push(DtvCmd::BandwidthHz, t.bandwidth.raw());
            push(DtvCmd::CodeRateHp, t.code_rate_hp.raw());
            push(DtvCmd::CodeRateLp, t.code_rate_lp.raw());
            push(DtvCmd::Modulation, t.constellation.raw());
            push(DtvCmd::TransmissionMode, t.transmission_mode.raw());
            push(DtvCmd::GuardInterval, t.guard_interval.raw());
            push(DtvCmd::Hierarchy, t.hierarchy.raw());
        }
        DeliveryParams::Cable(c) => {
            push(DtvCmd::SymbolRate, c.symbol_rate);
            push(DtvCmd::Modulation, c.modulation.raw());
            push(DtvCmd::InnerFec, c.fec_inner.raw());
        }
        DeliveryParams::Satellite(s) => {
            push(DtvCmd::SymbolRate, s.symbol_rate);
            push(DtvCmd::InnerFec, s.fec_inner.raw());
            push(DtvCmd::Modulation, s.modulation.raw());
            push(DtvCmd::Rolloff, s.rolloff.raw());
        }
        DeliveryParams::Atsc(a) => {
            push(DtvCmd::Modulation, a.modulation.raw());
        }
    }

    cmds.push(DtvCommand::tune());
    cmds
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(cmds: &[DtvCommand]) -> Vec<DtvCmd> {
        cmds.iter().map(|c| c.cmd).collect()
    }

    #[test]
    fn test_terrestrial_sequence() {
        let mut params = TuningParameters::new(FrontendType::Dvbt, 498_000_000);
        if let DeliveryParams::Terrestrial(ref mut t) = params.delivery {
            t.bandwidth = Bandwidth::Bw8Mhz;
            t.constellation = Modulation::Auto;
        }

        let cmds = build_commands(&params, None);
        assert_eq!(
            ids(&cmds),
            vec![
                DtvCmd::DeliverySystem,
                DtvCmd::Frequency,
                DtvCmd::Inversion,
                DtvCmd::BandwidthHz,
                DtvCmd::CodeRateHp,
                DtvCmd::CodeRateLp,
                DtvCmd::Modulation,
                DtvCmd::TransmissionMode,
                DtvCmd::GuardInterval,
                DtvCmd::Hierarchy,
                DtvCmd::Tune,
            ]
        );
        assert_eq!(cmds[0].data, DeliverySystem::Dvbt.raw());
        assert_eq!(cmds[1].data, 498_000_000);
        assert_eq!(cmds[3].data, 8_000_000);
        assert_eq!(cmds[6].data, Modulation::Auto.raw());
    }

    #[test]
    fn test_frequency_override() {
        let params = TuningParameters::new(FrontendType::Dvbt, 498_000_000);
        let cmds = build_commands(&params, Some(506_000_000));
        assert_eq!(cmds[1], DtvCommand::new(DtvCmd::Frequency, 506_000_000));
        assert_eq!(params.frequency, 498_000_000);
    }

    #[test]
    fn test_cable_sequence() {
        let mut params = TuningParameters::new(FrontendType::Dvbc, 346_000_000);
        if let DeliveryParams::Cable(ref mut c) = params.delivery {
            c.symbol_rate = 6_900_000;
            c.modulation = Modulation::Qam256;
        }

        let cmds = build_commands(&params, None);
        assert_eq!(
            ids(&cmds[3..]),
            vec![DtvCmd::SymbolRate, DtvCmd::Modulation, DtvCmd::InnerFec, DtvCmd::Tune]
        );
        assert_eq!(cmds[3].data, 6_900_000);
        assert_eq!(cmds[4].data, 5);
    }

    #[test]
    fn test_satellite_sequence() {
        let params = TuningParameters::new(FrontendType::Dvbs, 11_778_000);
        let cmds = build_commands(&params, None);
        assert_eq!(
            ids(&cmds[3..]),
            vec![
                DtvCmd::SymbolRate,
                DtvCmd::InnerFec,
                DtvCmd::Modulation,
                DtvCmd::Rolloff,
                DtvCmd::Tune
            ]
        );
    }

    #[test]
    fn test_atsc_sequence() {
        let params = TuningParameters::new(FrontendType::Atsc, 57_000_000);
        let cmds = build_commands(&params, None);
        assert_eq!(cmds.len(), 5);
        assert_eq!(cmds[3], DtvCommand::new(DtvCmd::Modulation, Modulation::Vsb8.raw()));
        assert_eq!(cmds[4], DtvCommand::tune());
    }

    #[test]
    fn test_display() {
        let c = DtvCommand::new(DtvCmd::Frequency, 498_000_000);
        assert_eq!(c.to_string(), "DTV_FREQUENCY => 498000000");
    }
}
