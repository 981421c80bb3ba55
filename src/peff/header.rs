//! On-disk layout structs for the PEFF container header and section table.
//!
//! Every struct here is read with `scroll`'s `BE` context, since PEFF (like
//! the classic Mac OS it targets) is entirely big-endian. Field names match
//! the architecture's own terminology rather than being renamed for Rust
//! conventions, since that's what a reader cross-referencing Apple's old
//! runtime architecture documentation will be looking for.

use scroll::{Pread, Pwrite, SizeWith};

pub const MAGIC1: u32 = 0x4A6F_7921; // "Joy!"
pub const MAGIC2: u32 = 0x7065_6666; // "peff"
pub const ARCH_PPC: u32 = 0x7077_7063; // "pwpc"
pub const ARCH_M68K: u32 = 0x6D36_386B; // "m68k"
pub const FORMAT_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct PeffHeader {
    pub magic1: u32,
    pub magic2: u32,
    pub arch: u32,
    pub format_version: u32,
    pub timestamp: u32,
    pub old_def_version: u32,
    pub old_imp_version: u32,
    pub current_version: u32,
    pub section_count: u16,
    pub inst_section_count: u16,
    pub reserved: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    ExecutableReadOnly,
    UnpackedData,
    PatternData,
    Constant,
    Loader,
    DebugReserved,
    ExecutableReadWrite,
    ExceptionReserved,
    TracebackReserved,
    Unknown(u8),
}

impl SectionKind {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => SectionKind::ExecutableReadOnly,
            1 => SectionKind::UnpackedData,
            2 => SectionKind::PatternData,
            3 => SectionKind::Constant,
            4 => SectionKind::Loader,
            5 => SectionKind::DebugReserved,
            6 => SectionKind::ExecutableReadWrite,
            7 => SectionKind::ExceptionReserved,
            8 => SectionKind::TracebackReserved,
            other => SectionKind::Unknown(other),
        }
    }

    pub fn is_executable(&self) -> bool {
        matches!(self, SectionKind::ExecutableReadOnly | SectionKind::ExecutableReadWrite)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SectionKind::ExecutableReadOnly => "EXECUTABLE_READONLY",
            SectionKind::UnpackedData => "UNPACKED_DATA",
            SectionKind::PatternData => "PATTERN_DATA",
            SectionKind::Constant => "CONSTANT",
            SectionKind::Loader => "LOADER",
            SectionKind::DebugReserved => "DEBUG_RESERVED",
            SectionKind::ExecutableReadWrite => "EXECUTABLE_READWRITE",
            SectionKind::ExceptionReserved => "EXCEPTION_RESERVED",
            SectionKind::TracebackReserved => "TRACEBACK_RESERVED",
            SectionKind::Unknown(_) => "__UNKNOWN__",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareKind {
    Process,
    Global,
    Protected,
    Unknown(u8),
}

impl ShareKind {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => ShareKind::Process,
            4 => ShareKind::Global,
            5 => ShareKind::Protected,
            other => ShareKind::Unknown(other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ShareKind::Process => "PROCESS",
            ShareKind::Global => "GLOBAL",
            ShareKind::Protected => "PROTECTED",
            ShareKind::Unknown(_) => "__UNKNOWN__",
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct PeffSectionHeader {
    pub name_offset: i32,
    pub default_address: u32,
    pub total_size: u32,
    pub unpacked_size: u32,
    pub packed_size: u32,
    pub container_offset: u32,
    pub section_kind: u8,
    pub share_kind: u8,
    pub alignment: u8,
    pub reserved: u8,
}
