//! Tuning definitions for Linux DVB frontends.
//!
//! This crate holds everything about a tune that does not touch a device:
//! the parameter enumerations and their persisted string forms, the
//! `FE_SET_PROPERTY` command sequence built from them, frontend status
//! classification, the default PSI/SI tables, and the per-family property
//! schema.
//!
//! # Command sequence
//!
//! ```text
//! DELIVERY_SYSTEM, FREQUENCY, INVERSION, <family fields...>, TUNE
//! ```
//!
//! # Example
//!
//! ```rust
//! use dvb_protocol::{build_commands, DtvCmd, FrontendType, TuningParameters};
//!
//! let params = TuningParameters::new(FrontendType::Dvbt, 498_000_000);
//! let cmds = build_commands(&params, None);
//!
//! assert_eq!(cmds[1].cmd, DtvCmd::Frequency);
//! assert_eq!(cmds[1].data, 498_000_000);
//! assert_eq!(cmds.last().map(|c| c.cmd), Some(DtvCmd::Tune));
//! ```

pub mod codec;
pub mod error;
pub mod family;
pub mod schema;
pub mod status;
pub mod tables;
pub mod types;

pub use codec::{build_commands, DtvCmd, DtvCommand};
pub use error::ProtocolError;
pub use family::DeliveryFamily;
pub use schema::{MuxClass, PropertyDef, PropertyKind};
pub use status::{FeStatus, SignalState};
pub use tables::{TableDef, PID_COUNT, PID_WILDCARD};
pub use types::{
    AtscParams, Bandwidth, CableParams, CodeRate, ConfigMap, DeliveryParams, DeliverySystem,
    FrontendType, GuardInterval, Hierarchy, Inversion, Modulation, Polarisation, Rolloff,
    SatelliteParams, TerrestrialParams, TransmissionMode, TuningParameters, WRITE_ONCE_FIELDS,
};
