//! Resource-fork decompression, PEFF loading, and a PPC32 disassembler/interpreter
//! for classic Mac OS preservation tooling.
//!
//! This crate models the four subsystems a format-accurate reimplementation of
//! the classic Mac OS resource-compression story needs:
//!
//! - [`memory`]: a 32-bit guest address space (page-granular host backing, a
//!   sub-page allocator, byte-swapped typed access, a symbol table).
//! - [`ppc32`]: a PowerPC 32-bit register file, disassembler, and interpreter
//!   for the instruction subset the native/emulated decompressors exercise.
//! - [`peff`]: a parser and loader for the Preferred Executable Format PowerPC
//!   container (pattern-compressed sections, imports/exports, relocations).
//! - [`decompress`]: the `dcmp`/`ncmp` resource decompression pipeline, with
//!   native System 0/1/2/3 decoders and a PPC32-emulated fallback.
//!
//! Decoding the resource fork's own index, and the dozens of format-specific
//! resource types it contains (icons, sounds, fonts, ...), is out of scope;
//! this crate hands back plain byte buffers.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
pub mod error;

#[cfg(feature = "alloc")]
pub mod memory;
#[cfg(feature = "alloc")]
pub mod ppc32;
#[cfg(feature = "alloc")]
pub mod peff;
#[cfg(feature = "alloc")]
pub mod decompress;

#[cfg(feature = "alloc")]
pub use error::{Error, Result};
