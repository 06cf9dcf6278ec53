//! Linux DVB input.
//!
//! Tunes DVB-S/C/T and ATSC frontends through the Linux DVB API, watches
//! for signal lock, programs demux filters for PSI tables and service
//! streams, and reads the resulting transport stream on a dedicated
//! thread per frontend.
//!
//! Everything hangs off a [`Context`]: networks own multiplexes,
//! multiplexes own services, and a mux instance binds a multiplex to the
//! frontend that will tune it.

#[cfg(not(unix))]
compile_error!("dvb-input requires a Unix target");

pub mod config;
pub mod context;
pub mod demux;
pub mod device;
pub mod error;
pub mod frontend;
pub mod ingest;
pub mod logging;
pub mod mux;
pub mod notify;
pub mod settings;
pub mod timer;
pub mod ts_sync;

pub use context::{Context, LoadSummary};
pub use error::{InputError, Result, TuneError};
pub use frontend::FrontendInfo;
pub use mux::{MuxInstance, NetworkRef};
pub use notify::InputStatus;
