//! The pattern-data section decompressor: a tiny byte-code VM for the
//! "repeat this block of zeroes/bytes N times" runs that make PEFF data
//! sections compress well. Five opcodes, no backreferences, no state beyond
//! the output buffer — simpler than any of the resource decompression
//! schemes, since it only ever has to describe regular repetition.

use alloc::string::ToString;
use alloc::vec::Vec;

use crate::error::{Error, Result};

fn read_varint(data: &[u8], offset: &mut usize) -> Result<u64> {
    let mut ret: u64 = 0;
    loop {
        let byte = *data.get(*offset).ok_or_else(|| Error::Malformed("pattern data ends mid-varint".to_string()))?;
        *offset += 1;
        ret = (ret << 7) | (byte & 0x7F) as u64;
        if byte & 0x80 == 0 {
            break;
        }
    }
    Ok(ret)
}

fn take<'a>(data: &'a [u8], offset: &mut usize, count: usize) -> Result<&'a [u8]> {
    let end = offset.checked_add(count).ok_or_else(|| Error::Malformed("pattern data block length overflows".to_string()))?;
    let slice = data.get(*offset..end).ok_or_else(|| Error::Malformed("pattern data block runs past end of section".to_string()))?;
    *offset = end;
    Ok(slice)
}

/// Runs the pattern-data byte code in `data` and returns the unpacked
/// section contents.
pub fn decompress_pattern_data(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut offset = 0usize;

    while offset < data.len() {
        let b = data[offset];
        offset += 1;
        let op = (b >> 5) & 0x07;
        let mut count = (b & 0x1F) as u64;
        if count == 0 {
            count = read_varint(data, &mut offset)?;
        }
        let count = count as usize;

        match op {
            0 => out.resize(out.len() + count, 0),
            1 => out.extend_from_slice(take(data, &mut offset, count)?),
            2 => {
                let repeat_count = read_varint(data, &mut offset)? + 1;
                let block = take(data, &mut offset, count)?.to_vec();
                for _ in 0..repeat_count {
                    out.extend_from_slice(&block);
                }
            }
            3 => {
                let common_size = count;
                let custom_size = read_varint(data, &mut offset)? as usize;
                let custom_section_count = read_varint(data, &mut offset)?;
                let common_data = take(data, &mut offset, common_size)?.to_vec();
                for _ in 0..custom_section_count {
                    out.extend_from_slice(&common_data);
                    out.extend_from_slice(take(data, &mut offset, custom_size)?);
                }
                out.extend_from_slice(&common_data);
            }
            4 => {
                let zero_size = count;
                let custom_size = read_varint(data, &mut offset)? as usize;
                let custom_section_count = read_varint(data, &mut offset)?;
                for _ in 0..custom_section_count {
                    out.resize(out.len() + zero_size, 0);
                    out.extend_from_slice(take(data, &mut offset, custom_size)?);
                }
                out.resize(out.len() + zero_size, 0);
            }
            _ => return Err(Error::Malformed("invalid opcode in pattern data".to_string())),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op0_zero_fill() {
        // op 0, count 4 -> four zero bytes
        let data = [0b000_00100];
        assert_eq!(decompress_pattern_data(&data).unwrap(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn op1_write_block() {
        // op 1, count 3 -> literal 3 bytes
        let data = [0b001_00011, 0xAA, 0xBB, 0xCC];
        assert_eq!(decompress_pattern_data(&data).unwrap(), vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn op2_repeat_block() {
        // op 2, count 2, varint repeat_count-1 = 2 (so 3 repeats) -> AB AB AB
        let data = [0b010_00010, 0x02, 0xAB, 0xCD];
        assert_eq!(decompress_pattern_data(&data).unwrap(), vec![0xAB, 0xCD, 0xAB, 0xCD, 0xAB, 0xCD]);
    }

    #[test]
    fn op0_zero_fill_packed_count_and_varint_count_agree() {
        // Opcode byte 0x05 (op=0, count=5) expands to five zero bytes...
        let packed = [0x05];
        assert_eq!(decompress_pattern_data(&packed).unwrap(), vec![0u8; 5]);

        // ...and opcode 0x00 followed by varint 0x03 expands to three zero bytes.
        let varint = [0x00, 0x03];
        assert_eq!(decompress_pattern_data(&varint).unwrap(), vec![0u8; 3]);
    }
}
