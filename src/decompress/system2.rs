//! The System 2 native decoder.
//!
//! System 2 shares System 0/1's per-byte command dispatch shape exactly —
//! literal runs, memoized recall slots, constant-table lookups, and the
//! same seven `0xFE` extension subcommands — but does not hard-code which
//! constant table or byte/word orientation it uses. Both are read from the
//! version-9 compressed-resource header's two free parameter bytes:
//! `param1` selects the orientation (0 = word-oriented like System 0, 1 =
//! byte-oriented like System 1) and `param2` gives the number of 16-bit
//! constant-table entries embedded immediately ahead of the command stream
//! in the source data. Any command whose table index runs past that
//! embedded table falls back to System 1's constant table, indexed from
//! where the embedded table left off.
//!
//! Only a version-9 header carries a System 2 resource; a version-8 header
//! has nowhere to store the orientation and table-size parameters.

use alloc::vec::Vec;

use crate::error::{Error, Result};

use super::header::{CompressedResourceHeader, HeaderTail};
use super::system01::{bad_memo_slot, execute_extension_command, put_u16, Reader, CONST_TABLE_1};

fn lookup_const(embedded: &[u16], command_index: usize) -> Result<u16> {
    if let Some(&value) = embedded.get(command_index) {
        return Ok(value);
    }
    let fallback_index = command_index - embedded.len();
    CONST_TABLE_1
        .get(fallback_index)
        .copied()
        .ok_or_else(|| Error::Malformed("System 2 stream indexed past both its embedded table and System 1's fallback table".into()))
}

pub fn decompress_system2(header: &CompressedResourceHeader, source: &[u8]) -> Result<Vec<u8>> {
    let (param1, param2) = match header.tail {
        HeaderTail::V9 { param1, param2, .. } => (param1, param2),
        HeaderTail::V8 { .. } => return Err(Error::Malformed("System 2 requires a version 9 compressed resource header".into())),
    };
    let is_byte_oriented = param1 != 0;
    let embedded_table_len = param2 as usize;

    let mut r = Reader::new(source);
    let embedded_table: Vec<u16> = (0..embedded_table_len).map(|_| r.u16()).collect::<Result<_>>()?;

    let mut out = Vec::with_capacity(header.decompressed_size as usize + 1);
    let mut memo: Vec<Vec<u8>> = Vec::new();

    loop {
        let command = r.u8()?;
        if is_byte_oriented {
            if command < 0x10 {
                out.extend_from_slice(r.take(command as usize + 1)?);
            } else if command < 0x20 {
                let bytes = r.take(command as usize - 0x0F)?.to_vec();
                out.extend_from_slice(&bytes);
                memo.push(bytes);
            } else if command < 0xD0 {
                let slot = command as usize - 0x20;
                let bytes = memo.get(slot).ok_or_else(|| bad_memo_slot(slot))?.clone();
                out.extend_from_slice(&bytes);
            } else if command == 0xD0 {
                let size = r.encoded_int()? as usize;
                out.extend_from_slice(r.take(size)?);
            } else if command == 0xD1 {
                let size = r.encoded_int()? as usize;
                let bytes = r.take(size)?.to_vec();
                out.extend_from_slice(&bytes);
                memo.push(bytes);
            } else if command == 0xD2 {
                let slot = r.u8()? as usize + 0xB0;
                let bytes = memo.get(slot).ok_or_else(|| bad_memo_slot(slot))?.clone();
                out.extend_from_slice(&bytes);
            } else if command == 0xD3 {
                let slot = r.u8()? as usize + 0x1B0;
                let bytes = memo.get(slot).ok_or_else(|| bad_memo_slot(slot))?.clone();
                out.extend_from_slice(&bytes);
            } else if command == 0xD4 {
                let slot = r.u16()? as usize + 0xB0;
                let bytes = memo.get(slot).ok_or_else(|| bad_memo_slot(slot))?.clone();
                out.extend_from_slice(&bytes);
            } else if command < 0xFE {
                put_u16(&mut out, lookup_const(&embedded_table, command as usize - 0xD5)?);
            } else if command == 0xFE {
                execute_extension_command(&mut r, &mut out)?;
            } else {
                break;
            }
        } else if command == 0 {
            let words = r.encoded_int()? as usize;
            out.extend_from_slice(r.take(words * 2)?);
        } else if command < 0x10 {
            out.extend_from_slice(r.take(command as usize * 2)?);
        } else if command == 0x10 {
            let words = r.encoded_int()? as usize;
            let bytes = r.take(words * 2)?.to_vec();
            out.extend_from_slice(&bytes);
            memo.push(bytes);
        } else if command < 0x20 {
            let bytes = r.take((command as usize - 0x10) * 2)?.to_vec();
            out.extend_from_slice(&bytes);
            memo.push(bytes);
        } else if command == 0x20 {
            let slot = r.u8()? as usize + 0x28;
            let bytes = memo.get(slot).ok_or_else(|| bad_memo_slot(slot))?.clone();
            out.extend_from_slice(&bytes);
        } else if command == 0x21 {
            let slot = r.u8()? as usize + 0x128;
            let bytes = memo.get(slot).ok_or_else(|| bad_memo_slot(slot))?.clone();
            out.extend_from_slice(&bytes);
        } else if command == 0x22 {
            let slot = r.u16()? as usize + 0x28;
            let bytes = memo.get(slot).ok_or_else(|| bad_memo_slot(slot))?.clone();
            out.extend_from_slice(&bytes);
        } else if command < 0x4B {
            let slot = command as usize - 0x23;
            let bytes = memo.get(slot).ok_or_else(|| bad_memo_slot(slot))?.clone();
            out.extend_from_slice(&bytes);
        } else if command < 0xFE {
            put_u16(&mut out, lookup_const(&embedded_table, command as usize - 0x4B)?);
        } else if command == 0xFE {
            execute_extension_command(&mut r, &mut out)?;
        } else {
            break;
        }
    }

    if out.len() > header.decompressed_size as usize {
        log::warn!("System 2 decoder produced {} bytes, trimming to the declared {}", out.len(), header.decompressed_size);
        out.truncate(header.decompressed_size as usize);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_v9(decompressed_size: u32, param1: u8, param2: u8) -> CompressedResourceHeader {
        CompressedResourceHeader {
            header_size: 16,
            header_version: 9,
            attributes: 1,
            decompressed_size,
            tail: HeaderTail::V9 { dcmp_resource_id: 2, output_extra_bytes: 0, param1, param2 },
        }
    }

    #[test]
    fn rejects_version_8_header() {
        let header = CompressedResourceHeader {
            header_size: 12,
            header_version: 8,
            attributes: 1,
            decompressed_size: 4,
            tail: HeaderTail::V8 { working_buffer_fractional_size: 0, output_extra_bytes: 0, dcmp_resource_id: 2 },
        };
        assert!(decompress_system2(&header, &[0xFF]).is_err());
    }

    #[test]
    fn byte_oriented_literal_then_terminator() {
        let header = header_v9(1, 1, 0);
        let data = [0x00, 0x42, 0xFF];
        let out = decompress_system2(&header, &data).unwrap();
        assert_eq!(out, vec![0x42]);
    }

    #[test]
    fn word_oriented_literal_then_terminator() {
        let header = header_v9(2, 0, 0);
        let data = [0x01, 0xAB, 0xCD, 0xFF];
        let out = decompress_system2(&header, &data).unwrap();
        assert_eq!(out, vec![0xAB, 0xCD]);
    }

    #[test]
    fn falls_back_to_system1_const_table_past_embedded_table() {
        // No embedded table entries, byte-oriented, so command 0xD5
        // (index 0 past the empty embedded table) resolves to
        // System 1's const_table_1[0] == 0x0000.
        let header = header_v9(2, 1, 0);
        let data = [0xD5, 0xFF];
        let out = decompress_system2(&header, &data).unwrap();
        assert_eq!(out, vec![0x00, 0x00]);
    }

    #[test]
    fn uses_embedded_table_entry_before_falling_back() {
        // One embedded entry (0x1234), byte-oriented. Command 0xD5 hits the
        // embedded entry directly.
        let header = header_v9(2, 1, 1);
        let mut data = Vec::new();
        data.extend_from_slice(&0x1234u16.to_be_bytes());
        data.push(0xD5);
        data.push(0xFF);
        let out = decompress_system2(&header, &data).unwrap();
        assert_eq!(out, vec![0x12, 0x34]);
    }
}
