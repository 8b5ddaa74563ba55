//! Wire data model and frame codec shared by the master and slave sides of
//! the TURAG Feldbus.
//!
//! This crate owns everything both ends of the bus must agree on: address
//! width and special addresses, the `address | payload… | checksum` frame
//! layout, the `DeviceInfo`/`ExtendedDeviceInfo` wire layout, and the
//! [`BusTransport`] contract the platform UART/RS-485 driver must satisfy.
//! It does not know how to *drive* a UART — see `feldbus-slave` and
//! `feldbus-host` for the state machines built on top of it.

#![no_std]

use feldbus_checksum::ChecksumKind;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

pub use feldbus_checksum::{self as checksum, compute as checksum_compute, verify as checksum_verify};

/// Number of bytes used to address a slave on the wire. Fixed per bus at
/// compile time on the slave side, but the host may talk to buses of either
/// width, so it is a runtime value there.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum AddressWidth {
    One = 1,
    Two = 2,
}

impl AddressWidth {
    pub const fn len(self) -> usize {
        match self {
            AddressWidth::One => 1,
            AddressWidth::Two => 2,
        }
    }

    /// The reserved master address for this width (`0x80` / `0x8000`).
    pub const fn master_address(self) -> u16 {
        match self {
            AddressWidth::One => 0x80,
            AddressWidth::Two => 0x8000,
        }
    }
}

/// A bus address. `0` is always the broadcast address; the value with the
/// high bit set (relative to the configured width) is the master; anything
/// else addresses a single slave.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Address(pub u16);

impl Address {
    pub const BROADCAST: Address = Address(0);

    pub fn master(width: AddressWidth) -> Address {
        Address(width.master_address())
    }

    pub fn is_broadcast(self) -> bool {
        self.0 == 0
    }

    pub fn is_master(self, width: AddressWidth) -> bool {
        self.0 == width.master_address()
    }

    /// Write this address into the first `width` bytes of `buf`, little-endian.
    pub fn write_le(self, width: AddressWidth, buf: &mut [u8]) {
        match width {
            AddressWidth::One => buf[0] = self.0 as u8,
            AddressWidth::Two => {
                buf[0] = (self.0 & 0xff) as u8;
                buf[1] = (self.0 >> 8) as u8;
            }
        }
    }

    /// Read an address out of the first `width` bytes of `buf`, little-endian.
    pub fn read_le(width: AddressWidth, buf: &[u8]) -> Address {
        match width {
            AddressWidth::One => Address(buf[0] as u16),
            AddressWidth::Two => Address(buf[0] as u16 | ((buf[1] as u16) << 8)),
        }
    }
}

/// Application protocol identifier carried in device-info and broadcasts.
/// `AllDevices` (`0x00`) is special: a broadcast tagged with it is delivered
/// to every slave's application layer regardless of that slave's configured
/// protocol.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum ProtocolId {
    AllDevices = 0x00,
    Stellantriebe = 0x01,
    Lokalisierungssensoren = 0x02,
    Aseb = 0x03,
    Bootloader = 0x04,
    Escon = 0x05,
}

impl ProtocolId {
    pub fn from_u8(v: u8) -> Option<ProtocolId> {
        <Self as FromPrimitive>::from_u8(v)
    }
}

/// The cached reserved device-info reply (spec §3). Decoded lazily by the
/// host on first `get_device_info` call; never mutates once populated.
#[derive(Copy, Clone, Debug)]
pub struct DeviceInfo {
    pub protocol_id: u8,
    pub device_type_id: u8,
    pub checksum_kind: ChecksumKind,
    pub statistics_available: bool,
    pub new_variant: bool,
    /// Legacy layout: buffer size. New-variant layout: extended-info packet size.
    pub buffer_or_extended_info_size: u16,
    /// Only meaningful when `new_variant` is set.
    pub uuid_low_bits: u32,
    pub uptime_frequency: u16,
    /// Legacy layout only: name/versioninfo lengths carried inline in the
    /// `variable` region. New-variant devices learn these from a dedicated
    /// extended-info query instead (see [`ExtendedDeviceInfo`]).
    pub name_length: u8,
    pub versioninfo_length: u8,
}

impl DeviceInfo {
    /// Decode the 12-byte reserved device-info payload (spec §6). `payload`
    /// must be exactly the 11 (legacy) or 12 bytes following the `0x00,
    /// 0x00` command prefix and address — i.e. the bytes the wire table in
    /// §3/§6 enumerates starting at `[0] protocol_id`.
    pub fn decode(payload: &[u8]) -> Option<DeviceInfo> {
        if payload.len() < 11 {
            return None;
        }
        let crc_field = payload[2];
        let checksum_kind = ChecksumKind::from_u8(crc_field & 0x07)?;
        let new_variant = crc_field & 0x08 != 0;
        let statistics_available = crc_field & 0x80 != 0;
        let buffer_or_extended_info_size = u16::from_le_bytes([payload[3], payload[4]]);
        let (uuid_low_bits, name_length, versioninfo_length) = if new_variant {
            (u32::from_le_bytes([payload[3], payload[4], payload[5], payload[6]]), 0, 0)
        } else {
            (0, payload[7], payload[8])
        };
        let uptime_frequency = u16::from_le_bytes([payload[9], payload[10]]);
        Some(DeviceInfo {
            protocol_id: payload[0],
            device_type_id: payload[1],
            checksum_kind,
            statistics_available,
            new_variant,
            buffer_or_extended_info_size,
            uuid_low_bits,
            uptime_frequency,
            name_length,
            versioninfo_length,
        })
    }
}

/// Lazily-queried extended device info (spec §3), populated either from a
/// dedicated reserved command (new-variant devices) or the legacy
/// device-info's `variable` region (legacy devices).
#[derive(Copy, Clone, Debug, Default)]
pub struct ExtendedDeviceInfo {
    pub name_length: u8,
    pub versioninfo_length: u8,
    pub buffer_size: u16,
}

impl ExtendedDeviceInfo {
    pub fn is_valid(&self) -> bool {
        self.buffer_size > 0
    }
}

/// Outcome of a single `BusTransport::transceive` call. The three-way split
/// (as opposed to a plain bool) is load-bearing: the auto-address
/// bus-assertion heuristic in `feldbus-locator` distinguishes "nobody
/// answered" (`TransmissionError`) from "somebody answered, possibly with
/// garbage" (`Success` or `ChecksumError`) — see spec §4.H / §9.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransceiveOutcome {
    Success,
    TransmissionError,
    ChecksumError,
}

/// The platform-provided byte transport a bus transaction runs over. Out of
/// scope for this crate is everything below this trait: UART framing, RTS
/// toggling, the inter-character timer. Exactly one call to `transceive` may
/// be in flight at a time; the caller is responsible for not interleaving
/// transactions.
pub trait BusTransport {
    /// Send `tx` and then read back exactly `rx.len()` bytes into `rx`.
    ///
    /// On `TransmissionError`, `*transferred` should be set to however many
    /// bytes were actually sent/received, so the caller can classify the
    /// failure (short write vs. no answer vs. partial read).
    fn transceive(
        &mut self,
        tx: &[u8],
        rx: &mut [u8],
        transferred: &mut usize,
    ) -> TransceiveOutcome;

    /// Discard any bytes sitting in the receive buffer before starting a new
    /// attempt.
    fn clear_buffer(&mut self);
}

/// Errors produced while decoding an inbound frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameError {
    TooShort,
    ChecksumMismatch,
    NotForUs,
}

/// Write `address` into the first bytes of `buf` and the checksum of
/// `buf[..len-1]` into `buf[len-1]`. `buf` must already contain the payload
/// in between those two reserved regions (spec §4.C).
pub fn encode_frame(buf: &mut [u8], width: AddressWidth, address: Address, checksum: ChecksumKind) {
    address.write_le(width, buf);
    let last = buf.len() - 1;
    let sum = checksum_compute(checksum, &buf[..last]);
    buf[last] = sum;
}

/// Verify and strip an inbound frame. `my_address` is the slave's own
/// address (ignored on the host side, where any non-broadcast reply is
/// accepted) — pass `None` to accept any address, or `Some(addr)` to reject
/// frames not addressed to `addr` or to broadcast.
pub fn decode_frame<'a>(
    buf: &'a [u8],
    width: AddressWidth,
    checksum: ChecksumKind,
    my_address: Option<Address>,
) -> Result<&'a [u8], FrameError> {
    let min_len = width.len() + 1;
    if buf.len() < min_len {
        return Err(FrameError::TooShort);
    }
    let last = buf.len() - 1;
    if !checksum_verify(checksum, &buf[..last], buf[last]) {
        return Err(FrameError::ChecksumMismatch);
    }
    if let Some(expected) = my_address {
        let got = Address::read_le(width, buf);
        if got != expected && !got.is_broadcast() {
            return Err(FrameError::NotForUs);
        }
    }
    Ok(&buf[width.len()..last])
}

#[cfg(test)]
mod tests {
    use super::*;
    use feldbus_checksum::ChecksumKind;

    #[test]
    fn address_round_trips_both_widths() {
        let mut buf = [0u8; 2];
        Address(0x42).write_le(AddressWidth::One, &mut buf[..1]);
        assert_eq!(Address::read_le(AddressWidth::One, &buf[..1]), Address(0x42));

        let mut buf2 = [0u8; 2];
        Address(0x1234).write_le(AddressWidth::Two, &mut buf2);
        assert_eq!(Address::read_le(AddressWidth::Two, &buf2), Address(0x1234));
    }

    #[test]
    fn frame_round_trip_xor_one_byte_address() {
        for payload_len in 0..8usize {
            let mut buf = vec![0u8; 1 + payload_len + 1];
            for (i, b) in buf[1..1 + payload_len].iter_mut().enumerate() {
                *b = i as u8 + 1;
            }
            encode_frame(&mut buf, AddressWidth::One, Address(0x05), ChecksumKind::Xor);
            let payload = decode_frame(&buf, AddressWidth::One, ChecksumKind::Xor, Some(Address(0x05)))
                .expect("frame should decode");
            assert_eq!(payload, &buf[1..1 + payload_len]);
        }
    }

    #[test]
    fn frame_round_trip_crc_two_byte_address() {
        let mut buf = vec![0u8; 2 + 3 + 1];
        buf[2..5].copy_from_slice(&[0xAA, 0xBB, 0xCC]);
        encode_frame(&mut buf, AddressWidth::Two, Address(0x1234), ChecksumKind::Crc8ICode);
        let payload = decode_frame(&buf, AddressWidth::Two, ChecksumKind::Crc8ICode, Some(Address(0x1234)))
            .expect("frame should decode");
        assert_eq!(payload, &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn broadcast_is_accepted_regardless_of_my_address() {
        let mut buf = [0u8; 3];
        encode_frame(&mut buf, AddressWidth::One, Address::BROADCAST, ChecksumKind::Xor);
        assert!(decode_frame(&buf, AddressWidth::One, ChecksumKind::Xor, Some(Address(0x05))).is_ok());
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let mut buf = [0u8; 3];
        encode_frame(&mut buf, AddressWidth::One, Address(0x05), ChecksumKind::Xor);
        buf[2] ^= 0xFF;
        assert_eq!(
            decode_frame(&buf, AddressWidth::One, ChecksumKind::Xor, Some(Address(0x05))),
            Err(FrameError::ChecksumMismatch)
        );
    }

    #[test]
    fn foreign_address_is_rejected() {
        let mut buf = [0u8; 3];
        encode_frame(&mut buf, AddressWidth::One, Address(0x06), ChecksumKind::Xor);
        assert_eq!(
            decode_frame(&buf, AddressWidth::One, ChecksumKind::Xor, Some(Address(0x05))),
            Err(FrameError::NotForUs)
        );
    }

    #[test]
    fn device_info_decodes_legacy_layout() {
        // protocol=0x01 type=0x42 crc_field=0x01 (crc8, stats bit clear, new-variant bit clear)
        // buffer_size=64 LE, reserved 0,0, name_len=3, versioninfo_len=2, uptime=1000Hz LE
        let payload: [u8; 11] = [0x01, 0x42, 0x01, 0x40, 0x00, 0x00, 0x00, 0x03, 0x02, 0xE8, 0x03];
        let info = DeviceInfo::decode(&payload).unwrap();
        assert_eq!(info.protocol_id, 0x01);
        assert_eq!(info.device_type_id, 0x42);
        assert_eq!(info.checksum_kind, ChecksumKind::Crc8ICode);
        assert!(!info.new_variant);
        assert_eq!(info.buffer_or_extended_info_size, 64);
        assert_eq!(info.uptime_frequency, 1000);
    }
}
