//! End-to-end fixtures that exercise more than one module together: a
//! hand-built PEFF container loaded into guest memory, and a tiny PPC32
//! program (also loaded from a PEFF section) run to completion through the
//! emulator.

use std::cell::RefCell;
use std::rc::Rc;

use mac_resource_core::memory::MemoryContext;
use mac_resource_core::peff::PeffFile;
use mac_resource_core::ppc32::{PPC32Emulator, Registers, SyscallHandler, TerminateEmulation};

const SECTION_HEADER_LEN: usize = 28;
const PEFF_HEADER_LEN: usize = 40;

/// Builds a minimal, loader-less PEFF container: a 40-byte header followed
/// by one `PeffSectionHeader` per entry in `sections`, then each section's
/// raw bytes back-to-back (no pattern compression, no name table).
fn build_peff(arch_ppc: bool, sections: &[(u8, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();

    out.extend_from_slice(&0x4A6F_7921u32.to_be_bytes()); // "Joy!"
    out.extend_from_slice(&0x7065_6666u32.to_be_bytes()); // "peff"
    out.extend_from_slice(&(if arch_ppc { 0x7077_7063u32 } else { 0x6D36_386Bu32 }).to_be_bytes());
    out.extend_from_slice(&1u32.to_be_bytes()); // format_version
    out.extend_from_slice(&0u32.to_be_bytes()); // timestamp
    out.extend_from_slice(&0u32.to_be_bytes()); // old_def_version
    out.extend_from_slice(&0u32.to_be_bytes()); // old_imp_version
    out.extend_from_slice(&0u32.to_be_bytes()); // current_version
    out.extend_from_slice(&(sections.len() as u16).to_be_bytes()); // section_count
    out.extend_from_slice(&(sections.len() as u16).to_be_bytes()); // inst_section_count
    out.extend_from_slice(&0u32.to_be_bytes()); // reserved
    assert_eq!(out.len(), PEFF_HEADER_LEN);

    let data_start = PEFF_HEADER_LEN + sections.len() * SECTION_HEADER_LEN;
    let mut container_offset = data_start;
    for &(kind, data) in sections {
        out.extend_from_slice(&(-1i32).to_be_bytes()); // name_offset: no name
        out.extend_from_slice(&0u32.to_be_bytes()); // default_address
        out.extend_from_slice(&(data.len() as u32).to_be_bytes()); // total_size
        out.extend_from_slice(&(data.len() as u32).to_be_bytes()); // unpacked_size
        out.extend_from_slice(&(data.len() as u32).to_be_bytes()); // packed_size
        out.extend_from_slice(&(container_offset as u32).to_be_bytes());
        out.push(kind); // section_kind
        out.push(1); // share_kind: PROCESS
        out.push(0); // alignment
        out.push(0); // reserved
        container_offset += data.len();
    }
    for &(_, data) in sections {
        out.extend_from_slice(data);
    }
    out
}

#[test]
fn peff_load_into_places_sections_and_registers_symbols() {
    let data0 = [0x11u8, 0x22, 0x33, 0x44];
    let data1 = [0xAAu8, 0xBB, 0xCC, 0xDD, 0xEE];
    let bytes = build_peff(true, &[(1, &data0), (1, &data1)]); // kind 1 = UNPACKED_DATA

    let peff = PeffFile::parse(&bytes).expect("parses a well-formed loader-less PEFF container");
    assert!(peff.arch_is_ppc);
    assert_eq!(peff.sections.len(), 2);
    assert_eq!(peff.sections[0].data, data0);
    assert_eq!(peff.sections[1].data, data1);

    let memory = Rc::new(RefCell::new(MemoryContext::with_default_page_size()));
    let section_addrs = peff.load_into("testlib", &memory, None).expect("load_into succeeds with no relocations or imports");
    assert_eq!(section_addrs.len(), 2);

    {
        let mem = memory.borrow();
        assert_eq!(mem.at(section_addrs[0], data0.len() as u32).unwrap(), &data0[..]);
        assert_eq!(mem.at(section_addrs[1], data1.len() as u32).unwrap(), &data1[..]);

        assert_eq!(mem.get_symbol_addr("testlib:section:0").unwrap(), section_addrs[0]);
        assert_eq!(mem.get_symbol_addr("testlib:section:1").unwrap(), section_addrs[1]);
    }
}

#[test]
fn peff_rejects_section_data_that_runs_past_end_of_file() {
    let mut bytes = build_peff(true, &[(1, &[0x01, 0x02, 0x03, 0x04])]);
    bytes.truncate(bytes.len() - 2); // chop off the last two data bytes
    assert!(PeffFile::parse(&bytes).is_err());
}

struct RecordingSyscallHandler {
    terminated: Rc<RefCell<Option<u32>>>,
}

impl SyscallHandler for RecordingSyscallHandler {
    fn handle_syscall(&mut self, registers: &mut Registers, _memory: &Rc<RefCell<MemoryContext>>) -> Result<(), TerminateEmulation> {
        *self.terminated.borrow_mut() = Some(registers.r[3]);
        Err(TerminateEmulation)
    }
}

#[test]
fn ppc32_program_loaded_from_a_peff_section_runs_to_a_syscall_trap() {
    // addi r3, r0, 42 ; sc
    let addi: u32 = (14 << 26) | (3 << 21) | (0 << 16) | 42;
    let sc: u32 = 17 << 26;
    let mut code = Vec::new();
    code.extend_from_slice(&addi.to_be_bytes());
    code.extend_from_slice(&sc.to_be_bytes());

    let bytes = build_peff(true, &[(0, &code)]); // kind 0 = EXECUTABLE_READONLY
    let peff = PeffFile::parse(&bytes).unwrap();

    let memory = Rc::new(RefCell::new(MemoryContext::with_default_page_size()));
    let section_addrs = peff.load_into("decoder", &memory, None).unwrap();

    let mut emulator = PPC32Emulator::new(Rc::clone(&memory));
    emulator.registers.pc = section_addrs[0];
    let result = Rc::new(RefCell::new(None));
    emulator.syscall_handler = Some(Box::new(RecordingSyscallHandler { terminated: Rc::clone(&result) }));

    emulator.execute().expect("execution stops cleanly at the sc trap");
    assert_eq!(*result.borrow(), Some(42));
}
