//! PSI/SI table filters installed on a freshly locked multiplex.

/// Number of addressable PIDs (13-bit PID space).
pub const PID_COUNT: usize = 8192;

/// Null/stuffing PID, also used as the "all PIDs" demux wildcard.
pub const PID_WILDCARD: u16 = 0x2000;

pub mod pid {
    pub const PAT: u16 = 0x0000;
    pub const CAT: u16 = 0x0001;
    pub const NIT: u16 = 0x0010;
    pub const SDT: u16 = 0x0011;
    pub const BAT: u16 = 0x0011;
    pub const NULL: u16 = 0x1FFF;
}

/// Request the table as soon as possible after lock.
pub const TABLE_QUICKREQ: u32 = 0x01;
/// Sections carry a CRC32 that must be verified.
pub const TABLE_CRC: u32 = 0x02;

/// Description of one table handler bound to a PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDef {
    pub name: &'static str,
    pub pid: u16,
    pub table_id: u8,
    pub mask: u8,
    pub flags: u32,
}

pub const PAT: TableDef = TableDef {
    name: "pat",
    pid: pid::PAT,
    table_id: 0x00,
    mask: 0xFF,
    flags: TABLE_QUICKREQ | TABLE_CRC,
};

pub const CAT: TableDef = TableDef {
    name: "cat",
    pid: pid::CAT,
    table_id: 0x01,
    mask: 0xFF,
    flags: TABLE_QUICKREQ | TABLE_CRC,
};

pub const NIT: TableDef = TableDef {
    name: "nit",
    pid: pid::NIT,
    table_id: 0x40,
    mask: 0xF0,
    flags: TABLE_QUICKREQ | TABLE_CRC,
};

pub const SDT: TableDef = TableDef {
    name: "sdt",
    pid: pid::SDT,
    table_id: 0x42,
    mask: 0xF8,
    flags: TABLE_QUICKREQ | TABLE_CRC,
};

pub const BAT: TableDef = TableDef {
    name: "bat",
    pid: pid::BAT,
    table_id: 0x4A,
    mask: 0xFF,
    flags: TABLE_CRC,
};

/// DVB families: PAT first, then CAT, NIT, SDT, BAT.
pub const DVB_DEFAULT_TABLES: &[TableDef] = &[PAT, CAT, NIT, SDT, BAT];

/// ATSC: PAT only. VCT handling is not wired up.
pub const ATSC_DEFAULT_TABLES: &[TableDef] = &[PAT];
