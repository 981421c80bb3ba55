//! The resource decompression pipeline: detects a compressed `dcmp`/`ncmp`
//! resource, dispatches to one of the four native decoders or falls back to
//! a user-supplied decoder looked up by ID and run either natively (68K,
//! out of scope — see [`Error::Unimplemented`]) or through the PPC32
//! emulator (`ncmp`).

mod emulated;
mod header;
mod system01;
mod system2;
mod system3;

pub use header::{CompressedResourceHeader, HeaderTail};

use alloc::string::ToString;
use alloc::vec::Vec;

use crate::error::{Error, Result};

/// A four-character classic Mac OS resource type code, as a big-endian u32.
pub const RESOURCE_TYPE_DCMP: u32 = 0x64636D70; // "dcmp"
pub const RESOURCE_TYPE_NCMP: u32 = 0x6E636D70; // "ncmp"

/// Something `decompress_resource` can ask for a `dcmp`/`ncmp` resource by
/// ID: a context resource file (the file the compressed resource itself
/// came from) or the system resource file. The full `ResourceFile` index
/// parser is out of scope for this crate; callers adapt whatever resource
/// container they have to this one narrow lookup.
pub trait ResourceSource {
    fn get_resource(&self, resource_type: u32, id: i16) -> Option<&[u8]>;
}

/// Runtime-tunable knobs for [`decompress_resource`]: a bitmask of
/// independent decompression flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecompressionFlags(u32);

impl DecompressionFlags {
    pub const NONE: DecompressionFlags = DecompressionFlags(0);
    pub const DISABLED: DecompressionFlags = DecompressionFlags(0x0001);
    pub const VERBOSE: DecompressionFlags = DecompressionFlags(0x0002);
    pub const TRACE_EXECUTION: DecompressionFlags = DecompressionFlags(0x0004);
    pub const DEBUG_EXECUTION: DecompressionFlags = DecompressionFlags(0x0008);
    pub const SKIP_FILE_DCMP: DecompressionFlags = DecompressionFlags(0x0010);
    pub const SKIP_FILE_NCMP: DecompressionFlags = DecompressionFlags(0x0020);
    pub const SKIP_SYSTEM_DCMP: DecompressionFlags = DecompressionFlags(0x0040);
    pub const SKIP_SYSTEM_NCMP: DecompressionFlags = DecompressionFlags(0x0080);
    pub const SKIP_NATIVE: DecompressionFlags = DecompressionFlags(0x0100);
    pub const RETRY: DecompressionFlags = DecompressionFlags(0x0200);
    pub const STRICT_MEMORY: DecompressionFlags = DecompressionFlags(0x0400);

    pub fn contains(self, other: DecompressionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> DecompressionFlags {
        DecompressionFlags(bits)
    }
}

impl core::ops::BitOr for DecompressionFlags {
    type Output = DecompressionFlags;
    fn bitor(self, rhs: DecompressionFlags) -> DecompressionFlags {
        DecompressionFlags(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for DecompressionFlags {
    fn bitor_assign(&mut self, rhs: DecompressionFlags) {
        self.0 |= rhs.0;
    }
}

enum DecoderCandidate {
    FileDcmp,
    FileNcmp,
    SystemDcmp,
    SystemNcmp,
}

impl DecoderCandidate {
    fn resource_type(&self) -> u32 {
        match self {
            DecoderCandidate::FileDcmp | DecoderCandidate::SystemDcmp => RESOURCE_TYPE_DCMP,
            DecoderCandidate::FileNcmp | DecoderCandidate::SystemNcmp => RESOURCE_TYPE_NCMP,
        }
    }

    fn skip_flag(&self) -> DecompressionFlags {
        match self {
            DecoderCandidate::FileDcmp => DecompressionFlags::SKIP_FILE_DCMP,
            DecoderCandidate::FileNcmp => DecompressionFlags::SKIP_FILE_NCMP,
            DecoderCandidate::SystemDcmp => DecompressionFlags::SKIP_SYSTEM_DCMP,
            DecoderCandidate::SystemNcmp => DecompressionFlags::SKIP_SYSTEM_NCMP,
        }
    }

    fn is_ncmp(&self) -> bool {
        matches!(self, DecoderCandidate::FileNcmp | DecoderCandidate::SystemNcmp)
    }
}

const CANDIDATE_ORDER: [DecoderCandidate; 4] =
    [DecoderCandidate::FileDcmp, DecoderCandidate::FileNcmp, DecoderCandidate::SystemDcmp, DecoderCandidate::SystemNcmp];

/// Decompresses a single resource buffer.
///
/// `data` is the resource's raw bytes, including the compressed-resource
/// header if present. `context_file` is the resource file the compressed
/// resource itself came from (checked first for a matching `dcmp`/`ncmp`);
/// `system_file` is the system resource file (checked second). Either may
/// be omitted when unavailable.
///
/// Returns `data` unchanged when it is not a recognizably compressed
/// resource, or when [`DecompressionFlags::DISABLED`] is set.
pub fn decompress_resource(
    data: &[u8],
    flags: DecompressionFlags,
    context_file: Option<&dyn ResourceSource>,
    system_file: Option<&dyn ResourceSource>,
) -> Result<Vec<u8>> {
    if flags.contains(DecompressionFlags::DISABLED) {
        return Ok(data.to_vec());
    }
    if !header::CompressedResourceHeader::looks_compressed(data) {
        return Ok(data.to_vec());
    }

    let header_bytes = &data[..header::HEADER_LEN];
    let header = header::CompressedResourceHeader::parse(data)?;
    let source = &data[header::HEADER_LEN..];
    let strict_memory = flags.contains(DecompressionFlags::STRICT_MEMORY);

    if flags.contains(DecompressionFlags::VERBOSE) {
        log::debug!(
            "decompressing resource: version={}, dcmp_id={}, decompressed_size={}",
            header.header_version,
            header.tail.dcmp_resource_id(),
            header.decompressed_size
        );
    }

    if !flags.contains(DecompressionFlags::SKIP_NATIVE) {
        match header.tail.dcmp_resource_id() {
            0 => return system01::decompress_system0(&header, source),
            1 => return system01::decompress_system1(&header, source),
            2 => return system2::decompress_system2(&header, source),
            3 => return system3::decompress_system3(&header, source),
            _ => {}
        }
    }

    let dcmp_id = header.tail.dcmp_resource_id();
    let mut last_err: Option<Error> = None;

    for candidate in &CANDIDATE_ORDER {
        if flags.contains(candidate.skip_flag()) {
            continue;
        }
        let source_file = match candidate {
            DecoderCandidate::FileDcmp | DecoderCandidate::FileNcmp => context_file,
            DecoderCandidate::SystemDcmp | DecoderCandidate::SystemNcmp => system_file,
        };
        let Some(source_file) = source_file else { continue };
        let Some(decoder_data) = source_file.get_resource(candidate.resource_type(), dcmp_id) else { continue };

        let attempt = if candidate.is_ncmp() {
            emulated::decompress_with_ncmp(&header, header_bytes, source, decoder_data, strict_memory)
        } else {
            Err(Error::Unimplemented("68K dcmp decoder execution is not supported".to_string()))
        };

        match attempt {
            Ok(result) => return Ok(result),
            Err(err) => {
                if flags.contains(DecompressionFlags::VERBOSE) {
                    log::warn!("decoder candidate failed: {err}");
                }
                last_err = Some(err);
                if !flags.contains(DecompressionFlags::RETRY) {
                    break;
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| Error::Malformed("no decoder available for this resource's dcmp_resource_id".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_through_uncompressed_data() {
        let data = [1u8, 2, 3, 4];
        let out = decompress_resource(&data, DecompressionFlags::NONE, None, None).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn disabled_flag_skips_everything() {
        let mut data = vec![0u8; 18];
        data[0..4].copy_from_slice(&header::MAGIC.to_be_bytes());
        data[7] = 1;
        let out = decompress_resource(&data, DecompressionFlags::DISABLED, None, None).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn dispatches_to_native_system0() {
        let mut data = vec![0u8; header::HEADER_LEN];
        data[0..4].copy_from_slice(&header::MAGIC.to_be_bytes());
        data[4..6].copy_from_slice(&12u16.to_be_bytes());
        data[6] = 8; // header_version 8
        data[7] = 1; // compressed
        data[8..12].copy_from_slice(&2u32.to_be_bytes()); // decompressed_size
        data[12] = 0;
        data[13] = 0;
        data[14..16].copy_from_slice(&0i16.to_be_bytes()); // dcmp_resource_id = 0
        data[16..18].copy_from_slice(&0u16.to_be_bytes());
        // command: one literal word 0xAB 0xCD, then terminator
        data.extend_from_slice(&[0x01, 0xAB, 0xCD, 0xFF]);

        let out = decompress_resource(&data, DecompressionFlags::NONE, None, None).unwrap();
        assert_eq!(out, vec![0xAB, 0xCD]);
    }

    #[test]
    fn unresolvable_user_decoder_is_an_error() {
        let mut data = vec![0u8; header::HEADER_LEN];
        data[0..4].copy_from_slice(&header::MAGIC.to_be_bytes());
        data[6] = 8;
        data[7] = 1;
        data[8..12].copy_from_slice(&2u32.to_be_bytes());
        data[14..16].copy_from_slice(&99i16.to_be_bytes()); // not 0-3, no sources given
        data.extend_from_slice(&[0xFF]);
        assert!(decompress_resource(&data, DecompressionFlags::NONE, None, None).is_err());
    }
}
