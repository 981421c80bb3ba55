//! Text disassembly of the instruction subset this crate decodes.
//!
//! Every opcode the emulator recognizes (whether or not it executes it)
//! disassembles to a line of text; [`disassemble`] additionally synthesizes
//! `labelNNNNNNNN:` markers at every branch target found within the range
//! being disassembled, the same two-pass shape the original tool uses so a
//! dump reads like hand-written assembly rather than a flat instruction
//! list.

use alloc::collections::BTreeSet;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use super::decode::*;
use super::registers::NamedSpr;

fn reg(n: u8) -> String {
    format!("r{n}")
}

fn freg(n: u8) -> String {
    format!("f{n}")
}

fn spr_name(spr_number: u16) -> String {
    match NamedSpr::from_spr_number(spr_number) {
        Some(named) => named.name().to_string(),
        None => format!("spr{spr_number}"),
    }
}

fn branch_target(pc: u32, instruction: u32) -> Option<u32> {
    match op(instruction) {
        18 => Some(if aa(instruction) { li(instruction) as u32 } else { pc.wrapping_add(li(instruction) as u32) }),
        16 => Some(if aa(instruction) { bd(instruction) as i32 as u32 } else { pc.wrapping_add(bd(instruction) as i32 as u32) }),
        _ => None,
    }
}

/// Disassembles one instruction at `pc`. `label_for` resolves an address to
/// a synthetic label name for use in branch-target comments; pass a closure
/// returning `None` to suppress label substitution (used by
/// [`disassemble_one`] in isolation, where no label set has been built yet).
pub fn disassemble_one_with_labels(pc: u32, instruction: u32, label_for: impl Fn(u32) -> Option<String>) -> String {
    let opcode = op(instruction);
    let text = match opcode {
        14 => format!("addi       {}, {}, {}", reg(rd(instruction)), reg(ra(instruction)), imm_s16(instruction)),
        15 => format!("addis      {}, {}, {}", reg(rd(instruction)), reg(ra(instruction)), imm_s16(instruction)),
        20 => format!(
            "rlwimi{}    {}, {}, {}, {}, {}",
            if rc(instruction) { "." } else { " " },
            reg(ra(instruction)),
            reg(rs(instruction)),
            sh(instruction),
            mb(instruction),
            me(instruction)
        ),
        21 => format!(
            "rlwinm{}    {}, {}, {}, {}, {}",
            if rc(instruction) { "." } else { " " },
            reg(ra(instruction)),
            reg(rs(instruction)),
            sh(instruction),
            mb(instruction),
            me(instruction)
        ),
        23 => format!(
            "rlwnm{}     {}, {}, {}, {}, {}",
            if rc(instruction) { "." } else { " " },
            reg(ra(instruction)),
            reg(rs(instruction)),
            reg(rb(instruction)),
            mb(instruction),
            me(instruction)
        ),
        7 => format!("mulli      {}, {}, {}", reg(rd(instruction)), reg(ra(instruction)), imm_s16(instruction)),
        8 => format!("subfic     {}, {}, {}", reg(rd(instruction)), reg(ra(instruction)), imm_s16(instruction)),
        12 => format!("addic      {}, {}, {}", reg(rd(instruction)), reg(ra(instruction)), imm_s16(instruction)),
        13 => format!("addic.     {}, {}, {}", reg(rd(instruction)), reg(ra(instruction)), imm_s16(instruction)),
        11 => format!("cmpi       cr{}, {}, {}", crf_d(instruction), reg(ra(instruction)), imm_s16(instruction)),
        10 => format!("cmpli      cr{}, {}, {}", crf_d(instruction), reg(ra(instruction)), imm_u16(instruction)),
        16 => {
            let target = branch_target(pc, instruction);
            let target_text = target.and_then(&label_for).unwrap_or_else(|| format!("{:#010x}", target.unwrap_or(0)));
            format!(
                "bc{}{}      {}, {}, {}",
                if lk(instruction) { "l" } else { " " },
                if aa(instruction) { "a" } else { " " },
                bo(instruction),
                bi(instruction),
                target_text
            )
        }
        18 => {
            let target = branch_target(pc, instruction).unwrap_or(0);
            let target_text = label_for(target).unwrap_or_else(|| format!("{target:#010x}"));
            format!("b{}{}       {}", if lk(instruction) { "l" } else { " " }, if aa(instruction) { "a" } else { " " }, target_text)
        }
        19 => match ext_op(instruction) {
            0x010 => format!("bclr{}      {}, {}", if lk(instruction) { "l" } else { " " }, bo(instruction), bi(instruction)),
            0x210 => format!("bcctr{}     {}, {}", if lk(instruction) { "l" } else { " " }, bo(instruction), bi(instruction)),
            0x000 => format!("mcrf       cr{}, cr{}", crf_d(instruction), crf_a(instruction)),
            0x033 => format!("rfi"),
            0x096 => format!("isync"),
            ext => format!("cr-op      ext={ext:#x}"),
        },
        31 => match ext_op(instruction) {
            0x01B => format!(
                "and{}       {}, {}, {}",
                if rc(instruction) { "." } else { " " },
                reg(ra(instruction)),
                reg(rs(instruction)),
                reg(rb(instruction))
            ),
            0x1BC => {
                if rs(instruction) == rb(instruction) {
                    format!("mr{}        {}, {}", if rc(instruction) { "." } else { " " }, reg(ra(instruction)), reg(rs(instruction)))
                } else {
                    format!(
                        "or{}        {}, {}, {}",
                        if rc(instruction) { "." } else { " " },
                        reg(ra(instruction)),
                        reg(rs(instruction)),
                        reg(rb(instruction))
                    )
                }
            }
            0x13C => format!(
                "xor{}       {}, {}, {}",
                if rc(instruction) { "." } else { " " },
                reg(ra(instruction)),
                reg(rs(instruction)),
                reg(rb(instruction))
            ),
            0x153 => format!("mfspr      {}, {}", reg(rd(instruction)), spr_name(spr(instruction))),
            0x1D3 => format!("mtspr      {}, {}", spr_name(spr(instruction)), reg(rs(instruction))),
            0x255 => format!("lswi       {}, {}, {}", reg(rd(instruction)), reg(ra(instruction)), mb(instruction)),
            0x2D5 => format!("lswx       {}, {}, {}", reg(rd(instruction)), reg(ra(instruction)), reg(rb(instruction))),
            0x2E5 => format!("stswi      {}, {}, {}", reg(rs(instruction)), reg(ra(instruction)), mb(instruction)),
            0x365 => format!("stswx      {}, {}, {}", reg(rs(instruction)), reg(ra(instruction)), reg(rb(instruction))),
            0x3D6 => format!("dcbz       {}, {}", reg(ra(instruction)), reg(rb(instruction))),
            0x056 => format!("dcbf       {}, {}", reg(ra(instruction)), reg(rb(instruction))),
            0x096 => format!("dcbst      {}, {}", reg(ra(instruction)), reg(rb(instruction))),
            0x3AC => format!("icbi       {}, {}", reg(ra(instruction)), reg(rb(instruction))),
            ext => format!("ext31      ext={ext:#x}"),
        },
        32 => format!("lwz        {}, {}({})", reg(rd(instruction)), imm_s16(instruction), reg(ra(instruction))),
        33 => format!("lwzu       {}, {}({})", reg(rd(instruction)), imm_s16(instruction), reg(ra(instruction))),
        34 => format!("lbz        {}, {}({})", reg(rd(instruction)), imm_s16(instruction), reg(ra(instruction))),
        35 => format!("lbzu       {}, {}({})", reg(rd(instruction)), imm_s16(instruction), reg(ra(instruction))),
        40 => format!("lhz        {}, {}({})", reg(rd(instruction)), imm_s16(instruction), reg(ra(instruction))),
        41 => format!("lhzu       {}, {}({})", reg(rd(instruction)), imm_s16(instruction), reg(ra(instruction))),
        42 => format!("lha        {}, {}({})", reg(rd(instruction)), imm_s16(instruction), reg(ra(instruction))),
        43 => format!("lhau       {}, {}({})", reg(rd(instruction)), imm_s16(instruction), reg(ra(instruction))),
        36 => format!("stw        {}, {}({})", reg(rs(instruction)), imm_s16(instruction), reg(ra(instruction))),
        37 => format!("stwu       {}, {}({})", reg(rs(instruction)), imm_s16(instruction), reg(ra(instruction))),
        38 => format!("stb        {}, {}({})", reg(rs(instruction)), imm_s16(instruction), reg(ra(instruction))),
        39 => format!("stbu       {}, {}({})", reg(rs(instruction)), imm_s16(instruction), reg(ra(instruction))),
        44 => format!("sth        {}, {}({})", reg(rs(instruction)), imm_s16(instruction), reg(ra(instruction))),
        45 => format!("sthu       {}, {}({})", reg(rs(instruction)), imm_s16(instruction), reg(ra(instruction))),
        46 => format!("lmw        {}, {}({})", reg(rd(instruction)), imm_s16(instruction), reg(ra(instruction))),
        47 => format!("stmw       {}, {}({})", reg(rs(instruction)), imm_s16(instruction), reg(ra(instruction))),
        17 => format!("sc"),
        _ => format!(".long      {instruction:#010x}"),
    };
    format!("{pc:#010x}  {text}")
}

/// Disassembles one instruction without label substitution.
pub fn disassemble_one(pc: u32, instruction: u32) -> String {
    disassemble_one_with_labels(pc, instruction, |_| None)
}

/// Disassembles every instruction in `instructions` (already fetched as a
/// big-endian `u32` per slot, base address `start_addr`), synthesizing a
/// `labelNNNNNNNN:` line before any instruction that is the target of a
/// branch found within the same range.
pub fn disassemble(start_addr: u32, instructions: &[u32]) -> String {
    let mut targets = BTreeSet::new();
    for (i, &instruction) in instructions.iter().enumerate() {
        let pc = start_addr.wrapping_add((i as u32) * 4);
        if let Some(target) = branch_target(pc, instruction) {
            targets.insert(target);
        }
    }

    let label_for = |addr: u32| -> Option<String> { if targets.contains(&addr) { Some(format!("label{addr:08x}")) } else { None } };

    let mut out = String::new();
    for (i, &instruction) in instructions.iter().enumerate() {
        let pc = start_addr.wrapping_add((i as u32) * 4);
        if targets.contains(&pc) {
            out.push_str(&format!("label{pc:08x}:\n"));
        }
        out.push_str(&disassemble_one_with_labels(pc, instruction, label_for));
        out.push('\n');
    }
    out
}
