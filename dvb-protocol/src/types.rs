//! Tuning parameter definitions for Linux DVB frontends.
//!
//! Every enumeration carries two representations: the value the kernel
//! expects in a `dtv_property` command, and the canonical string stored in
//! persisted multiplex configuration (`"8MHz"`, `"QAM/64"`, `"3/4"`, ...).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Persisted configuration map (one JSON object per entity).
pub type ConfigMap = Map<String, Value>;

macro_rules! dvb_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = ($raw:expr, $text:literal) ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// All values in listing order.
            pub const ALL: &'static [$name] = &[ $( $name::$variant ),+ ];

            /// Value passed to the kernel.
            pub fn raw(self) -> u32 {
                match self {
                    $( $name::$variant => $raw ),+
                }
            }

            /// Canonical string form.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ProtocolError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok($name::$variant), )+
                    _ => Err(ProtocolError::UnknownValue {
                        kind: stringify!($name),
                        value: s.to_string(),
                    }),
                }
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

dvb_enum! {
    /// Frontend capability family (`fe_type_t`).
    pub enum FrontendType {
        /// Satellite (QPSK family).
        Dvbs = (0, "DVB-S"),
        /// Cable (QAM family).
        Dvbc = (1, "DVB-C"),
        /// Terrestrial (OFDM family).
        Dvbt = (2, "DVB-T"),
        Atsc = (3, "ATSC"),
    }
}

dvb_enum! {
    /// `fe_delivery_system`.
    pub enum DeliverySystem {
        Undefined = (0, "UNDEFINED"),
        DvbcAnnexAc = (1, "DVBC_ANNEX_AC"),
        DvbcAnnexB = (2, "DVBC_ANNEX_B"),
        Dvbt = (3, "DVBT"),
        Dss = (4, "DSS"),
        Dvbs = (5, "DVBS"),
        Dvbs2 = (6, "DVBS2"),
        Dvbh = (7, "DVBH"),
        Isdbt = (8, "ISDBT"),
        Isdbs = (9, "ISDBS"),
        Isdbc = (10, "ISDBC"),
        Atsc = (11, "ATSC"),
        AtscMh = (12, "ATSCMH"),
        Dtmb = (13, "DTMB"),
        Cmmb = (14, "CMMB"),
        Dab = (15, "DAB"),
        Dvbt2 = (16, "DVBT2"),
        Turbo = (17, "TURBO"),
    }
}

dvb_enum! {
    /// `fe_spectral_inversion`.
    pub enum Inversion {
        Off = (0, "OFF"),
        On = (1, "ON"),
        Auto = (2, "AUTO"),
    }
}

dvb_enum! {
    /// `fe_code_rate`.
    pub enum CodeRate {
        None = (0, "NONE"),
        Fec1_2 = (1, "1/2"),
        Fec2_3 = (2, "2/3"),
        Fec3_4 = (3, "3/4"),
        Fec4_5 = (4, "4/5"),
        Fec5_6 = (5, "5/6"),
        Fec6_7 = (6, "6/7"),
        Fec7_8 = (7, "7/8"),
        Fec8_9 = (8, "8/9"),
        Auto = (9, "AUTO"),
        Fec3_5 = (10, "3/5"),
        Fec9_10 = (11, "9/10"),
    }
}

dvb_enum! {
    /// `fe_modulation`.
    pub enum Modulation {
        Qpsk = (0, "QPSK"),
        Qam16 = (1, "QAM/16"),
        Qam32 = (2, "QAM/32"),
        Qam64 = (3, "QAM/64"),
        Qam128 = (4, "QAM/128"),
        Qam256 = (5, "QAM/256"),
        Auto = (6, "AUTO"),
        Vsb8 = (7, "8VSB"),
        Vsb16 = (8, "16VSB"),
        Psk8 = (9, "PSK/8"),
        Apsk16 = (10, "APSK/16"),
        Apsk32 = (11, "APSK/32"),
    }
}

dvb_enum! {
    /// Channel bandwidth. The raw value is in Hz, as `DTV_BANDWIDTH_HZ` expects.
    pub enum Bandwidth {
        Auto = (0, "AUTO"),
        Bw8Mhz = (8_000_000, "8MHz"),
        Bw7Mhz = (7_000_000, "7MHz"),
        Bw6Mhz = (6_000_000, "6MHz"),
        Bw5Mhz = (5_000_000, "5MHz"),
        Bw10Mhz = (10_000_000, "10MHz"),
        Bw1712Khz = (1_712_000, "1712kHz"),
    }
}

dvb_enum! {
    /// `fe_transmit_mode`.
    pub enum TransmissionMode {
        Mode2k = (0, "2k"),
        Mode8k = (1, "8k"),
        Auto = (2, "AUTO"),
        Mode4k = (3, "4k"),
        Mode1k = (4, "1k"),
        Mode16k = (5, "16k"),
        Mode32k = (6, "32k"),
    }
}

dvb_enum! {
    /// `fe_guard_interval`.
    pub enum GuardInterval {
        Gi1_32 = (0, "1/32"),
        Gi1_16 = (1, "1/16"),
        Gi1_8 = (2, "1/8"),
        Gi1_4 = (3, "1/4"),
        Auto = (4, "AUTO"),
        Gi1_128 = (5, "1/128"),
        Gi19_128 = (6, "19/128"),
        Gi19_256 = (7, "19/256"),
    }
}

dvb_enum! {
    /// `fe_hierarchy`.
    pub enum Hierarchy {
        None = (0, "NONE"),
        H1 = (1, "1"),
        H2 = (2, "2"),
        H4 = (3, "4"),
        Auto = (4, "AUTO"),
    }
}

dvb_enum! {
    /// `fe_rolloff`.
    pub enum Rolloff {
        R35 = (0, "35"),
        R20 = (1, "20"),
        R25 = (2, "25"),
        Auto = (3, "AUTO"),
    }
}

dvb_enum! {
    /// LNB polarisation. Not sent to the frontend; selects the LNB voltage upstream.
    pub enum Polarisation {
        Horizontal = (0, "H"),
        Vertical = (1, "V"),
        CircularLeft = (2, "L"),
        CircularRight = (3, "R"),
    }
}

impl FrontendType {
    /// Delivery systems a multiplex of this family may use.
    pub fn delivery_systems(self) -> &'static [DeliverySystem] {
        match self {
            FrontendType::Dvbt => &[DeliverySystem::Dvbt, DeliverySystem::Dvbt2, DeliverySystem::Turbo],
            FrontendType::Dvbc => &[DeliverySystem::DvbcAnnexAc, DeliverySystem::DvbcAnnexB],
            FrontendType::Dvbs => &[DeliverySystem::Dvbs, DeliverySystem::Dvbs2],
            FrontendType::Atsc => &[DeliverySystem::Atsc, DeliverySystem::AtscMh],
        }
    }

    /// Delivery system used when a configuration omits `delsys`.
    pub fn default_delivery_system(self) -> DeliverySystem {
        self.delivery_systems()[0]
    }

    /// Property class name of multiplexes of this family.
    pub fn mux_class(self) -> &'static str {
        match self {
            FrontendType::Dvbt => "linuxdvb_mux_dvbt",
            FrontendType::Dvbc => "linuxdvb_mux_dvbc",
            FrontendType::Dvbs => "linuxdvb_mux_dvbs",
            FrontendType::Atsc => "linuxdvb_mux_atsc",
        }
    }

    /// Property class name of frontends of this family.
    pub fn frontend_class(self) -> &'static str {
        match self {
            FrontendType::Dvbt => "linuxdvb_frontend_dvbt",
            FrontendType::Dvbc => "linuxdvb_frontend_dvbc",
            FrontendType::Dvbs => "linuxdvb_frontend_dvbs",
            FrontendType::Atsc => "linuxdvb_frontend_atsc",
        }
    }
}

/// Terrestrial (DVB-T/T2) parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrestrialParams {
    pub bandwidth: Bandwidth,
    pub constellation: Modulation,
    #[serde(rename = "fec_hi")]
    pub code_rate_hp: CodeRate,
    #[serde(rename = "fec_lo")]
    pub code_rate_lp: CodeRate,
    pub transmission_mode: TransmissionMode,
    pub guard_interval: GuardInterval,
    pub hierarchy: Hierarchy,
}

impl Default for TerrestrialParams {
    fn default() -> Self {
        Self {
            bandwidth: Bandwidth::Auto,
            constellation: Modulation::Auto,
            code_rate_hp: CodeRate::Auto,
            code_rate_lp: CodeRate::Auto,
            transmission_mode: TransmissionMode::Auto,
            guard_interval: GuardInterval::Auto,
            hierarchy: Hierarchy::Auto,
        }
    }
}

/// Cable (DVB-C) parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CableParams {
    #[serde(rename = "symbolrate")]
    pub symbol_rate: u32,
    #[serde(rename = "constellation")]
    pub modulation: Modulation,
    #[serde(rename = "fec")]
    pub fec_inner: CodeRate,
}

impl Default for CableParams {
    fn default() -> Self {
        Self {
            symbol_rate: 0,
            modulation: Modulation::Auto,
            fec_inner: CodeRate::Auto,
        }
    }
}

/// Satellite (DVB-S/S2) parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SatelliteParams {
    #[serde(rename = "symbolrate")]
    pub symbol_rate: u32,
    #[serde(rename = "fec")]
    pub fec_inner: CodeRate,
    pub modulation: Modulation,
    pub rolloff: Rolloff,
    pub polarisation: Polarisation,
}

impl Default for SatelliteParams {
    fn default() -> Self {
        Self {
            symbol_rate: 0,
            fec_inner: CodeRate::Auto,
            modulation: Modulation::Auto,
            rolloff: Rolloff::Auto,
            polarisation: Polarisation::Horizontal,
        }
    }
}

/// ATSC parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtscParams {
    pub modulation: Modulation,
}

impl Default for AtscParams {
    fn default() -> Self {
        Self {
            modulation: Modulation::Vsb8,
        }
    }
}

/// Delivery-family specific part of [`TuningParameters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryParams {
    Terrestrial(TerrestrialParams),
    Cable(CableParams),
    Satellite(SatelliteParams),
    Atsc(AtscParams),
}

impl DeliveryParams {
    /// Family defaults.
    pub fn default_for(kind: FrontendType) -> Self {
        match kind {
            FrontendType::Dvbt => DeliveryParams::Terrestrial(TerrestrialParams::default()),
            FrontendType::Dvbc => DeliveryParams::Cable(CableParams::default()),
            FrontendType::Dvbs => DeliveryParams::Satellite(SatelliteParams::default()),
            FrontendType::Atsc => DeliveryParams::Atsc(AtscParams::default()),
        }
    }

    /// The frontend family these parameters belong to.
    pub fn family(&self) -> FrontendType {
        match self {
            DeliveryParams::Terrestrial(_) => FrontendType::Dvbt,
            DeliveryParams::Cable(_) => FrontendType::Dvbc,
            DeliveryParams::Satellite(_) => FrontendType::Dvbs,
            DeliveryParams::Atsc(_) => FrontendType::Atsc,
        }
    }
}

/// Write-once configuration keys. Once non-zero they cannot be changed.
pub const WRITE_ONCE_FIELDS: &[&str] = &["frequency", "symbolrate"];

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CommonFields {
    delsys: Option<DeliverySystem>,
    frequency: u32,
    inversion: Option<Inversion>,
}

/// Complete tuning description of one multiplex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuningParameters {
    pub delivery_system: DeliverySystem,
    /// Hz for terrestrial/cable/ATSC, kHz for satellite.
    pub frequency: u32,
    pub inversion: Inversion,
    pub delivery: DeliveryParams,
}

impl TuningParameters {
    /// Family defaults at the given frequency.
    pub fn new(kind: FrontendType, frequency: u32) -> Self {
        Self {
            delivery_system: kind.default_delivery_system(),
            frequency,
            inversion: Inversion::Auto,
            delivery: DeliveryParams::default_for(kind),
        }
    }

    pub fn family(&self) -> FrontendType {
        self.delivery.family()
    }

    /// Symbol rate for cable and satellite, `None` otherwise.
    pub fn symbol_rate(&self) -> Option<u32> {
        match &self.delivery {
            DeliveryParams::Cable(c) => Some(c.symbol_rate),
            DeliveryParams::Satellite(s) => Some(s.symbol_rate),
            _ => None,
        }
    }

    pub fn polarisation(&self) -> Option<Polarisation> {
        match &self.delivery {
            DeliveryParams::Satellite(s) => Some(s.polarisation),
            _ => None,
        }
    }

    /// Serialize into the flat persisted form.
    pub fn to_config(&self) -> ConfigMap {
        let family = match &self.delivery {
            DeliveryParams::Terrestrial(p) => serde_json::to_value(p),
            DeliveryParams::Cable(p) => serde_json::to_value(p),
            DeliveryParams::Satellite(p) => serde_json::to_value(p),
            DeliveryParams::Atsc(p) => serde_json::to_value(p),
        };

        let mut map = match family {
            Ok(Value::Object(map)) => map,
            _ => ConfigMap::new(),
        };
        map.insert("delsys".into(), Value::from(self.delivery_system.as_str()));
        map.insert("frequency".into(), Value::from(self.frequency));
        map.insert("inversion".into(), Value::from(self.inversion.as_str()));
        map
    }

    /// Rebuild from the flat persisted form. Missing fields take family defaults.
    pub fn from_config(kind: FrontendType, conf: &ConfigMap) -> Result<Self, ProtocolError> {
        let value = Value::Object(conf.clone());
        let common: CommonFields = serde_json::from_value(value.clone())?;

        let delivery_system = common.delsys.unwrap_or_else(|| kind.default_delivery_system());
        if !kind.delivery_systems().contains(&delivery_system) {
            return Err(ProtocolError::DeliverySystemMismatch {
                delsys: delivery_system.to_string(),
                family: kind.to_string(),
            });
        }

        let delivery = match kind {
            FrontendType::Dvbt => DeliveryParams::Terrestrial(serde_json::from_value(value)?),
            FrontendType::Dvbc => DeliveryParams::Cable(serde_json::from_value(value)?),
            FrontendType::Dvbs => DeliveryParams::Satellite(serde_json::from_value(value)?),
            FrontendType::Atsc => DeliveryParams::Atsc(serde_json::from_value(value)?),
        };

        Ok(Self {
            delivery_system,
            frequency: common.frequency,
            inversion: common.inversion.unwrap_or(Inversion::Auto),
            delivery,
        })
    }

    /// Apply a partial configuration update.
    ///
    /// Write-once fields that already hold a non-zero value are left untouched;
    /// their keys are returned so the caller can report them.
    pub fn update(&mut self, conf: &ConfigMap) -> Result<Vec<String>, ProtocolError> {
        let mut merged = self.to_config();
        let mut rejected = Vec::new();

        for (key, value) in conf {
            if WRITE_ONCE_FIELDS.contains(&key.as_str()) {
                let current = merged.get(key).and_then(Value::as_u64).unwrap_or(0);
                if current != 0 {
                    rejected.push(key.clone());
                    continue;
                }
            }
            merged.insert(key.clone(), value.clone());
        }

        *self = Self::from_config(self.family(), &merged)?;
        Ok(rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conf(v: Value) -> ConfigMap {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_enum_strings() {
        assert_eq!(Bandwidth::Bw8Mhz.as_str(), "8MHz");
        assert_eq!(Bandwidth::Bw8Mhz.raw(), 8_000_000);
        assert_eq!("QAM/64".parse::<Modulation>().unwrap(), Modulation::Qam64);
        assert_eq!("3/4".parse::<CodeRate>().unwrap().raw(), 3);
        assert!(matches!(
            "QAM/63".parse::<Modulation>(),
            Err(ProtocolError::UnknownValue { kind: "Modulation", .. })
        ));
    }

    #[test]
    fn test_terrestrial_from_config() {
        let c = conf(json!({
            "delsys": "DVBT",
            "frequency": 498000000,
            "bandwidth": "8MHz",
            "constellation": "AUTO",
            "guard_interval": "1/4",
        }));
        let p = TuningParameters::from_config(FrontendType::Dvbt, &c).unwrap();
        assert_eq!(p.frequency, 498_000_000);
        match p.delivery {
            DeliveryParams::Terrestrial(t) => {
                assert_eq!(t.bandwidth, Bandwidth::Bw8Mhz);
                assert_eq!(t.guard_interval, GuardInterval::Gi1_4);
                assert_eq!(t.hierarchy, Hierarchy::Auto);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_config_round_trip_satellite() {
        let mut p = TuningParameters::new(FrontendType::Dvbs, 11_778_000);
        if let DeliveryParams::Satellite(ref mut s) = p.delivery {
            s.symbol_rate = 27_500_000;
            s.polarisation = Polarisation::Vertical;
            s.fec_inner = CodeRate::Fec2_3;
        }
        p.delivery_system = DeliverySystem::Dvbs2;

        let c = p.to_config();
        assert_eq!(c.get("polarisation"), Some(&json!("V")));
        assert_eq!(c.get("symbolrate"), Some(&json!(27_500_000)));

        let back = TuningParameters::from_config(FrontendType::Dvbs, &c).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_delsys_must_match_family() {
        let c = conf(json!({ "delsys": "DVBS2", "frequency": 1 }));
        let r = TuningParameters::from_config(FrontendType::Dvbc, &c);
        assert!(matches!(r, Err(ProtocolError::DeliverySystemMismatch { .. })));
    }

    #[test]
    fn test_write_once_update() {
        let mut p = TuningParameters::new(FrontendType::Dvbc, 0);
        let rejected = p
            .update(&conf(json!({ "frequency": 346000000, "symbolrate": 6900000 })))
            .unwrap();
        assert!(rejected.is_empty());
        assert_eq!(p.frequency, 346_000_000);
        assert_eq!(p.symbol_rate(), Some(6_900_000));

        let rejected = p
            .update(&conf(json!({ "frequency": 1, "constellation": "QAM/256" })))
            .unwrap();
        assert_eq!(rejected, vec!["frequency".to_string()]);
        assert_eq!(p.frequency, 346_000_000);
        match p.delivery {
            DeliveryParams::Cable(c) => assert_eq!(c.modulation, Modulation::Qam256),
            other => panic!("unexpected {:?}", other),
        }
    }
}
