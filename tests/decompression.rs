//! End-to-end fixtures for the resource decompression pipeline, exercised
//! through its public entry point rather than any one decoder's internals.

use mac_resource_core::decompress::{decompress_resource, DecompressionFlags};

const MAGIC: u32 = 0xA89F_6572;

/// Builds a version-8 compressed-resource header (12 bytes of preamble plus
/// the 6-byte v8 tail) for the given `dcmp_id` and `decompressed_size`.
fn header8(dcmp_id: i16, decompressed_size: u32) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&MAGIC.to_be_bytes());
    data.extend_from_slice(&12u16.to_be_bytes()); // header_size
    data.push(8); // header_version
    data.push(1); // attributes: compressed
    data.extend_from_slice(&decompressed_size.to_be_bytes());
    data.push(0); // working_buffer_fractional_size
    data.push(0); // output_extra_bytes
    data.extend_from_slice(&dcmp_id.to_be_bytes());
    data.extend_from_slice(&0u16.to_be_bytes()); // unused
    data
}

#[test]
fn system1_memo_reference_round_trips_through_the_public_pipeline() {
    let mut data = header8(1, 2); // dcmp_id 1 = System 1 (byte-oriented)
    // 0x10: memoized literal of length 1, byte 0x99; 0x20: memo-slot-0
    // reference copies it back out; 0xFF terminates the stream.
    data.extend_from_slice(&[0x10, 0x99, 0x20, 0xFF]);

    let out = decompress_resource(&data, DecompressionFlags::NONE, None, None).unwrap();
    assert_eq!(out, vec![0x99, 0x99]);
}

#[test]
fn uncompressed_input_passes_through_unchanged() {
    let data = vec![1u8, 2, 3, 4, 5];
    let out = decompress_resource(&data, DecompressionFlags::NONE, None, None).unwrap();
    assert_eq!(out, data);
}

#[test]
fn skip_native_forces_emulation_even_for_a_builtin_dcmp_id() {
    let mut data = header8(0, 2);
    data.extend_from_slice(&[0xFF]);
    // No context/system resource file supplied, so there's nowhere to find
    // an `ncmp`/`dcmp` resource once native decoding is disabled - this
    // must fail rather than silently fall back to the native System 0 path.
    let err = decompress_resource(&data, DecompressionFlags::SKIP_NATIVE, None, None).unwrap_err();
    let msg = err.to_string();
    assert!(!msg.is_empty());
}
