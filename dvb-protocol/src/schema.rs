//! Editable multiplex properties per delivery family.

use serde::Serialize;

use crate::types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyKind {
    Str,
    U32,
}

/// One editable property of a multiplex class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyDef {
    pub id: &'static str,
    pub caption: &'static str,
    #[serde(rename = "type")]
    pub kind: PropertyKind,
    #[serde(rename = "wronce")]
    pub write_once: bool,
    /// Allowed values for enumerated string properties.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<&'static str>,
}

impl PropertyDef {
    fn list<T: Copy>(id: &'static str, caption: &'static str, values: &[T], f: fn(T) -> &'static str) -> Self {
        Self {
            id,
            caption,
            kind: PropertyKind::Str,
            write_once: false,
            options: values.iter().map(|v| f(*v)).collect(),
        }
    }

    fn number(id: &'static str, caption: &'static str) -> Self {
        Self {
            id,
            caption,
            kind: PropertyKind::U32,
            write_once: true,
            options: Vec::new(),
        }
    }
}

/// Mux class description returned to configuration front-ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MuxClass {
    pub class: &'static str,
    pub caption: &'static str,
    pub properties: Vec<PropertyDef>,
}

pub(crate) fn mux_class(kind: FrontendType) -> MuxClass {
    use CodeRate as F;
    use Modulation as M;

    let delsys = PropertyDef::list("delsys", "Delivery System", kind.delivery_systems(), DeliverySystem::as_str);

    match kind {
        FrontendType::Dvbt => MuxClass {
            class: kind.mux_class(),
            caption: "Linux DVB-T Multiplex",
            properties: vec![
                delsys,
                PropertyDef::number("frequency", "Frequency (Hz)"),
                PropertyDef::list("bandwidth", "Bandwidth", Bandwidth::ALL, Bandwidth::as_str),
                PropertyDef::list(
                    "constellation",
                    "Constellation",
                    &[M::Auto, M::Qpsk, M::Qam16, M::Qam64, M::Qam256],
                    Modulation::as_str,
                ),
                PropertyDef::list(
                    "transmission_mode",
                    "Transmission Mode",
                    &[
                        TransmissionMode::Auto,
                        TransmissionMode::Mode2k,
                        TransmissionMode::Mode8k,
                        TransmissionMode::Mode1k,
                        TransmissionMode::Mode16k,
                        TransmissionMode::Mode32k,
                    ],
                    TransmissionMode::as_str,
                ),
                PropertyDef::list("guard_interval", "Guard Interval", GuardInterval::ALL, GuardInterval::as_str),
                PropertyDef::list("hierarchy", "Hierarchy", Hierarchy::ALL, Hierarchy::as_str),
                PropertyDef::list("fec_hi", "FEC High", &TERRESTRIAL_FEC, CodeRate::as_str),
                PropertyDef::list("fec_lo", "FEC Low", &TERRESTRIAL_FEC, CodeRate::as_str),
            ],
        },
        FrontendType::Dvbc => MuxClass {
            class: kind.mux_class(),
            caption: "Linux DVB-C Multiplex",
            properties: vec![
                delsys,
                PropertyDef::number("frequency", "Frequency (Hz)"),
                PropertyDef::number("symbolrate", "Symbol Rate (Sym/s)"),
                PropertyDef::list(
                    "constellation",
                    "Constellation",
                    &[M::Auto, M::Qam16, M::Qam32, M::Qam64, M::Qam128, M::Qam256],
                    Modulation::as_str,
                ),
                PropertyDef::list(
                    "fec",
                    "FEC",
                    &[F::Auto, F::None, F::Fec1_2, F::Fec2_3, F::Fec3_4, F::Fec4_5, F::Fec5_6, F::Fec8_9, F::Fec9_10],
                    CodeRate::as_str,
                ),
            ],
        },
        FrontendType::Dvbs => MuxClass {
            class: kind.mux_class(),
            caption: "Linux DVB-S Multiplex",
            properties: vec![
                delsys,
                PropertyDef::number("frequency", "Frequency (kHz)"),
                PropertyDef::number("symbolrate", "Symbol Rate (Sym/s)"),
                PropertyDef::list(
                    "polarisation",
                    "Polarisation",
                    &[
                        Polarisation::Vertical,
                        Polarisation::Horizontal,
                        Polarisation::CircularLeft,
                        Polarisation::CircularRight,
                    ],
                    Polarisation::as_str,
                ),
                PropertyDef::list(
                    "modulation",
                    "Modulation",
                    &[M::Auto, M::Qpsk, M::Qam16, M::Psk8, M::Apsk16, M::Apsk32],
                    Modulation::as_str,
                ),
                PropertyDef::list(
                    "fec",
                    "FEC",
                    &[
                        F::Auto, F::None, F::Fec1_2, F::Fec2_3, F::Fec3_4, F::Fec4_5, F::Fec5_6, F::Fec7_8, F::Fec8_9,
                        F::Fec3_5, F::Fec9_10,
                    ],
                    CodeRate::as_str,
                ),
                PropertyDef::list("rolloff", "Rolloff", Rolloff::ALL, Rolloff::as_str),
            ],
        },
        FrontendType::Atsc => MuxClass {
            class: kind.mux_class(),
            caption: "Linux ATSC Multiplex",
            properties: vec![delsys],
        },
    }
}

const TERRESTRIAL_FEC: [CodeRate; 8] = [
    CodeRate::Auto,
    CodeRate::Fec1_2,
    CodeRate::Fec2_3,
    CodeRate::Fec3_4,
    CodeRate::Fec4_5,
    CodeRate::Fec5_6,
    CodeRate::Fec7_8,
    CodeRate::Fec3_5,
];
