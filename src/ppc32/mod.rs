//! A PowerPC 32-bit register file, disassembler, and interpreter for the
//! instruction subset the native and PPC32-emulated resource decompressors
//! exercise.

pub mod decode;
pub mod disasm;
pub mod emulator;
pub mod registers;

pub use disasm::{disassemble, disassemble_one};
pub use emulator::{InterruptManager, PPC32Emulator, SyscallHandler, TerminateEmulation};
pub use registers::{ConditionField, NamedSpr, Registers, Xer};
