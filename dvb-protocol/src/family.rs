//! Per delivery family capabilities.

use crate::codec::{self, DtvCommand};
use crate::schema::{self, MuxClass};
use crate::tables::{TableDef, ATSC_DEFAULT_TABLES, DVB_DEFAULT_TABLES};
use crate::types::{FrontendType, TuningParameters};

/// Behaviour that differs between terrestrial, cable, satellite and ATSC.
pub trait DeliveryFamily {
    /// Command sequence for a tune.
    fn build_commands(&self, params: &TuningParameters, frequency: Option<u32>) -> Vec<DtvCommand>;

    /// Tables installed as soon as a frontend locks.
    fn default_tables(&self) -> &'static [TableDef];

    /// Editable multiplex properties.
    fn property_schema(&self) -> MuxClass;
}

impl DeliveryFamily for FrontendType {
    fn build_commands(&self, params: &TuningParameters, frequency: Option<u32>) -> Vec<DtvCommand> {
        codec::build_commands(params, frequency)
    }

    fn default_tables(&self) -> &'static [TableDef] {
        match self {
            FrontendType::Atsc => ATSC_DEFAULT_TABLES,
            _ => DVB_DEFAULT_TABLES,
        }
    }

    fn property_schema(&self) -> MuxClass {
        schema::mux_class(*self)
    }
}
