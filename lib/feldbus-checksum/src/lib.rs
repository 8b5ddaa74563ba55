//! Checksum algorithms used over TURAG Feldbus frames.
//!
//! Two algorithms are supported, selected per device at discovery time: a
//! plain XOR fold, and CRC-8/I-CODE (poly `0x1D`, init `0xFD`, no reflection,
//! no final XOR). Master and slave must agree on which one a given device
//! uses; that agreement lives in [`ChecksumKind`].

#![no_std]

use crc::{Algorithm, Crc};
use num_derive::FromPrimitive;

/// CRC-8/I-CODE as used on the wire: poly 0x1D, init 0xFD, no reflection, no
/// final xor. Matches the parameters in spec §6.
const CRC8_ICODE: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x1D,
    init: 0xFD,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0x7E,
    residue: 0x00,
};

static CRC8: Crc<u8> = Crc::<u8>::new(&CRC8_ICODE);

/// Which checksum algorithm a device's frames use. Determined per-device
/// from the device-info byte at discovery time (spec §3).
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum ChecksumKind {
    Xor = 0,
    Crc8ICode = 1,
    /// No checksum at all — used by transports (e.g. simulation/test
    /// harnesses) that don't want wire-level integrity checking. Never sent
    /// as a wire value; not one of the two bits the `crc_field` byte's
    /// checksum-kind bits (0..2) actually carry on real hardware.
    None = 7,
}

/// Compute the checksum of `bytes` under `kind`.
///
/// For [`ChecksumKind::None`] this always returns `0`; callers that need to
/// omit the checksum byte entirely should check `kind` themselves, since a
/// frame with `None` checksum has no trailing checksum byte at all.
pub fn compute(kind: ChecksumKind, bytes: &[u8]) -> u8 {
    match kind {
        ChecksumKind::None => 0,
        ChecksumKind::Xor => xor(bytes),
        ChecksumKind::Crc8ICode => crc8_icode(bytes),
    }
}

/// Verify that `claimed` is the checksum of `bytes` under `kind`.
pub fn verify(kind: ChecksumKind, bytes: &[u8], claimed: u8) -> bool {
    kind == ChecksumKind::None || compute(kind, bytes) == claimed
}

/// XOR fold of `bytes`: `c = 0; for b in bytes { c ^= b }`.
pub fn xor(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// CRC-8/I-CODE over `bytes`, using the `crc` crate's table-driven engine.
pub fn crc8_icode(bytes: &[u8]) -> u8 {
    CRC8.checksum(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Bitwise reference implementation, used only to verify that the
    // table-driven `crc` crate above agrees with the naive shift-and-xor
    // loop on every single-byte input (spec §8: "table-based and bitwise
    // implementations produce identical results").
    fn crc8_icode_bitwise(bytes: &[u8]) -> u8 {
        let mut crc: u8 = 0xFD;
        for &byte in bytes {
            crc ^= byte;
            for _ in 0..8 {
                if crc & 0x80 != 0 {
                    crc = (crc << 1) ^ 0x1D;
                } else {
                    crc <<= 1;
                }
            }
        }
        crc
    }

    #[test]
    fn crc8_icode_known_values() {
        assert_eq!(crc8_icode(&[]), 0xFD);
        assert_eq!(crc8_icode(&[0x00]), 0xFE);
        assert_eq!(crc8_icode(&[0xFF]), 0x3A);
    }

    #[test]
    fn crc8_icode_table_matches_bitwise_on_every_byte() {
        for b in 0u8..=255 {
            assert_eq!(crc8_icode(&[b]), crc8_icode_bitwise(&[b]), "byte {b:#x}");
        }
    }

    #[test]
    fn crc8_icode_table_matches_bitwise_on_sequences() {
        let sequences: &[&[u8]] = &[
            &[0x01, 0x02, 0x03],
            &[0xAA, 0x55, 0x00, 0xFF],
            &[0x05, 0x00, 0x42, 0x01, 0x40],
        ];
        for seq in sequences {
            assert_eq!(crc8_icode(seq), crc8_icode_bitwise(seq));
        }
    }

    #[test]
    fn xor_folds_bytes() {
        assert_eq!(xor(&[]), 0);
        assert_eq!(xor(&[0x05]), 0x05);
        assert_eq!(xor(&[0x05, 0x05]), 0x00);
        assert_eq!(xor(&[0x12, 0x34, 0x56]), 0x12 ^ 0x34 ^ 0x56);
    }

    #[test]
    fn verify_round_trips_for_both_kinds() {
        let payload = [0x05u8, 0x01, 0x02, 0x03];
        let xor_sum = compute(ChecksumKind::Xor, &payload);
        assert!(verify(ChecksumKind::Xor, &payload, xor_sum));
        assert!(!verify(ChecksumKind::Xor, &payload, xor_sum ^ 0x01));

        let crc_sum = compute(ChecksumKind::Crc8ICode, &payload);
        assert!(verify(ChecksumKind::Crc8ICode, &payload, crc_sum));
        assert!(!verify(ChecksumKind::Crc8ICode, &payload, crc_sum ^ 0x01));
    }
}
