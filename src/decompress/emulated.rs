//! Runs a PowerPC (`ncmp`) user decoder through the PPC32 emulator.
//!
//! The decoder is a PEFF container whose `main` entry point follows the
//! calling convention this crate assumes for decompressors: GPR3 points at
//! the compressed input, GPR4 at the output buffer, GPR5 at a scratch
//! working buffer, and GPR6 at the raw compressed-resource header bytes.
//! LR is seeded with a sentinel return address backed by a single `sc`
//! instruction, so returning from `main` immediately traps into
//! [`TerminateEmulation`] instead of running off into unmapped memory.
//!
//! Decoders are not expected to import anything beyond a handful of
//! trivial runtime helpers (block moves, simple math). Since this crate
//! does not carry the classic Mac OS shared libraries those imports would
//! normally resolve against, every import the decoder's `PeffFile`
//! declares is instead bound to a tiny stub: a single `blr` instruction
//! that returns immediately. An import the decoder actually depends on for
//! real work will misbehave the same way it would against an unemulated
//! stub library; this mirrors the "tiny built-in stub library" the
//! original pipeline also relies on here.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use crate::error::{Error, Result};
use crate::memory::MemoryContext;
use crate::peff::PeffFile;
use crate::ppc32::{PPC32Emulator, SyscallHandler, TerminateEmulation};

use super::header::CompressedResourceHeader;

const STUB_LIBRARY_NAME: &str = "StubImports";

/// `sc` with no fields set; any LR-triggered fetch here means the decoder
/// has returned.
const TRAP_INSTRUCTION: u32 = 17u32 << 26;

/// `blr`: branch to the address in LR, used as the body of every stub
/// import so an unresolved call returns to its caller instead of faulting.
const BLR_INSTRUCTION: u32 = (19u32 << 26) | (0x010 << 1);

struct TerminateOnAnySyscall;

impl SyscallHandler for TerminateOnAnySyscall {
    fn handle_syscall(
        &mut self,
        _registers: &mut crate::ppc32::Registers,
        _memory: &Rc<RefCell<MemoryContext>>,
    ) -> core::result::Result<(), TerminateEmulation> {
        Err(TerminateEmulation)
    }
}

/// Binds every import the decoder declares to a one-instruction `blr` stub,
/// so `PeffFile::load_into`'s relocation pass never fails on an unresolved
/// non-weak import.
fn install_stub_imports(peff: &PeffFile, memory: &Rc<RefCell<MemoryContext>>) -> Result<()> {
    let mut seen = alloc::collections::BTreeSet::new();
    for import in &peff.imports {
        let name = alloc::format!("{}:{}", import.lib_name, import.name);
        if !seen.insert(name.clone()) {
            continue;
        }
        let mut mem = memory.borrow_mut();
        if mem.get_symbol_addr(&name).is_ok() {
            continue;
        }
        let stub_addr = mem.allocate(4, false);
        if stub_addr == 0 {
            return Err(Error::AllocationFailure);
        }
        mem.write_u32(stub_addr, BLR_INSTRUCTION)?;
        mem.set_symbol_addr(&name, stub_addr)?;
    }
    Ok(())
}

/// Decompresses `source` (the bytes following the compressed-resource
/// header) by running the PowerPC decoder in `ncmp_data` through the
/// emulator.
pub fn decompress_with_ncmp(
    header: &CompressedResourceHeader,
    header_bytes: &[u8],
    source: &[u8],
    ncmp_data: &[u8],
    strict_memory: bool,
) -> Result<Vec<u8>> {
    let memory = Rc::new(RefCell::new(MemoryContext::with_default_page_size()));
    memory.borrow_mut().set_strict(strict_memory);

    let peff = PeffFile::parse(ncmp_data)?;
    install_stub_imports(&peff, &memory)?;
    peff.load_into(STUB_LIBRARY_NAME, &memory, None)?;

    let entry = memory.borrow().get_symbol_addr(&alloc::format!("{STUB_LIBRARY_NAME}:[main]"))?;

    let working_buffer_size = header.decompressed_size + header.output_extra_bytes();

    let (input_addr, output_addr, working_addr, header_addr, trap_addr) = {
        let mut mem = memory.borrow_mut();

        let input_addr = mem.allocate(source.len().max(1) as u32, false);
        let output_addr = mem.allocate(header.decompressed_size.max(1), false);
        let working_addr = mem.allocate(working_buffer_size.max(1), false);
        let header_addr = mem.allocate(header_bytes.len() as u32, false);
        let trap_addr = mem.allocate(4, false);
        if input_addr == 0 || output_addr == 0 || working_addr == 0 || header_addr == 0 || trap_addr == 0 {
            return Err(Error::AllocationFailure);
        }

        mem.at_mut(input_addr, source.len() as u32)?.copy_from_slice(source);
        mem.at_mut(header_addr, header_bytes.len() as u32)?.copy_from_slice(header_bytes);
        mem.write_u32(trap_addr, TRAP_INSTRUCTION)?;

        (input_addr, output_addr, working_addr, header_addr, trap_addr)
    };

    let stack_size: u32 = 0x1_0000;
    let stack_top = {
        let mut mem = memory.borrow_mut();
        let stack_base = mem.allocate(stack_size, false);
        if stack_base == 0 {
            return Err(Error::AllocationFailure);
        }
        stack_base + stack_size - 0x10
    };

    let mut emulator = PPC32Emulator::new(Rc::clone(&memory));
    emulator.registers.pc = entry;
    emulator.registers.lr = trap_addr;
    emulator.registers.r[1] = stack_top;
    emulator.registers.r[3] = input_addr;
    emulator.registers.r[4] = output_addr;
    emulator.registers.r[5] = working_addr;
    emulator.registers.r[6] = header_addr;
    emulator.syscall_handler = Some(alloc::boxed::Box::new(TerminateOnAnySyscall));

    emulator.execute()?;

    let mem = memory.borrow();
    let mut out = mem.at(output_addr, header.decompressed_size)?.to_vec();
    if out.len() > header.decompressed_size as usize {
        out.truncate(header.decompressed_size as usize);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompress::header::HeaderTail;

    fn header(decompressed_size: u32) -> CompressedResourceHeader {
        CompressedResourceHeader {
            header_size: 12,
            header_version: 8,
            attributes: 1,
            decompressed_size,
            tail: HeaderTail::V8 { working_buffer_fractional_size: 0, output_extra_bytes: 0, dcmp_resource_id: 0 },
        }
    }

    #[test]
    fn rejects_a_non_peff_decoder_image() {
        let h = header(4);
        let result = decompress_with_ncmp(&h, &[0u8; 18], &[0u8; 4], &[0u8; 8], false);
        assert!(result.is_err());
    }
}
