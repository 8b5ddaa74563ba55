//! Slave-side receive state machine and reserved command dispatcher.
//!
//! The bus is half-duplex and a slave has no notion of "transaction start" —
//! it only sees bytes arriving and an inter-character timer running out. This
//! crate models exactly that split: [`SlaveCore::on_byte`] is meant to be
//! called from the byte-received interrupt (single producer, never blocks),
//! [`SlaveCore::on_timeout`] from the inter-character timeout interrupt, and
//! [`SlaveCore::dispatch`] from the main loop once
//! [`SlaveCore::has_complete_packet`] says there's something to do.
//!
//! No locking is used anywhere. The byte-arrival and timeout paths only ever
//! touch the receive buffer; the worker only reads it after the timeout path
//! has latched `has_complete_packet`, and the byte-arrival path is free to
//! start filling a new packet underneath the worker because it writes through
//! `offset`, not through the latched flag.

#![no_std]

use feldbus_checksum::ChecksumKind;
use feldbus_protocol::{Address, AddressWidth, ProtocolId};

pub mod diag;

use diag::{Event, Log};

/// Compile-time identity and wire parameters of a slave device.
///
/// Implemented once per firmware, typically on a unit struct, and threaded
/// through [`SlaveCore`] as a type parameter so every constant folds away at
/// compile time instead of living in RAM.
pub trait SlaveConfig {
    const ADDRESS_WIDTH: AddressWidth;
    const MY_ADDRESS: u16;
    const CHECKSUM_KIND: ChecksumKind;
    const UPTIME_FREQUENCY_HZ: u16;
    const PACKAGE_STATISTICS_AVAILABLE: bool;
    const BROADCASTS_AVAILABLE: bool;
    const DEVICE_PROTOCOL_ID: ProtocolId;
    const DEVICE_TYPE_ID: u8;
    const DEVICE_NAME: &'static [u8];
    const DEVICE_VERSIONINFO: &'static [u8];
    const UUID: u32;

    /// Whether the reserved bootloader-enter broadcast resets the board.
    /// Devices without a bootloader should set this to `false` so the
    /// broadcast is silently ignored instead of rebooting into nothing.
    const BOOTLOADER_RESET: bool = true;

    /// Hook invoked when a bootloader-enter broadcast is accepted. The
    /// default does nothing; a real board overrides this to jump to the
    /// bootloader (it will not return).
    fn enter_bootloader() {}

    /// Optional static-data-storage backend for reserved commands
    /// `0x0B..0x0D`. Devices without persistent storage leave this `None`.
    fn static_storage() -> Option<&'static dyn StaticStorage> {
        None
    }
}

/// Backend for the optional static-data-storage reserved commands.
pub trait StaticStorage: Sync {
    /// Size in bytes of the storage area.
    fn size(&self) -> u16;
    fn read(&self, offset: u16, out: &mut [u8]) -> bool;
    fn write(&self, offset: u16, data: &[u8]) -> bool;
}

/// Outcome of handing a unicast application packet to a [`PacketProcessor`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PacketResult {
    /// Reply with the first `n` bytes the processor wrote into the response
    /// buffer it was given.
    Reply(usize),
    /// Drop the packet: no reply is sent at all, not even an empty one.
    IgnorePacket,
}

/// Application-layer hook for unicast packets that aren't ping or a reserved
/// command.
pub trait PacketProcessor {
    fn process_packet(&mut self, request: &[u8], response: &mut [u8]) -> PacketResult;
}

/// Application-layer hook for broadcasts addressed to this device's protocol.
pub trait BroadcastProcessor {
    fn process_broadcast(&mut self, protocol_id: ProtocolId, payload: &[u8]);
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PacketStatistics {
    pub correct: u32,
    pub buffer_overflow: u32,
    pub lost: u32,
    pub chksum_mismatch: u32,
}

/// Reserved (protocol-id-less) base commands, recognized whenever the first
/// payload byte is `0x00` and the payload is exactly 3 bytes long.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
enum ReservedCommand {
    DeviceName = 0x00,
    Uptime = 0x01,
    VersionInfo = 0x02,
    PacketCountCorrect = 0x03,
    PacketCountBufferOverflow = 0x04,
    PacketCountLost = 0x05,
    PacketCountChecksumMismatch = 0x06,
    PacketCountAll = 0x07,
    ResetPacketCount = 0x08,
    Uuid = 0x09,
    ExtendedInfo = 0x0A,
    StaticStorageInfo = 0x0B,
    StaticStorageRead = 0x0C,
    StaticStorageWrite = 0x0D,
}

impl ReservedCommand {
    fn from_u8(v: u8) -> Option<Self> {
        use ReservedCommand::*;
        Some(match v {
            0x00 => DeviceName,
            0x01 => Uptime,
            0x02 => VersionInfo,
            0x03 => PacketCountCorrect,
            0x04 => PacketCountBufferOverflow,
            0x05 => PacketCountLost,
            0x06 => PacketCountChecksumMismatch,
            0x07 => PacketCountAll,
            0x08 => ResetPacketCount,
            0x09 => Uuid,
            0x0A => ExtendedInfo,
            0x0B => StaticStorageInfo,
            0x0C => StaticStorageRead,
            0x0D => StaticStorageWrite,
            _ => return None,
        })
    }
}

/// Bootloader protocol's reserved enter-bootloader command, sent as a plain
/// broadcast rather than through the reserved-command table above.
const BOOTLOADER_ENTER_COMMAND: u8 = 0x00;

/// Receive-side state machine plus reserved command dispatcher for a slave
/// with an `N`-byte receive buffer.
///
/// `C` carries the device's compile-time identity (see [`SlaveConfig`]); `N`
/// must be at least `ADDRESS_WIDTH::len() + 1` to hold a ping, and large
/// enough to hold the device's largest application packet.
pub struct SlaveCore<C: SlaveConfig, const N: usize> {
    buffer: [u8; N],
    offset: usize,
    overflow: bool,
    has_complete_packet: bool,
    complete_len: usize,
    stats: PacketStatistics,
    uptime_counter: u32,
    diag: Log,
    _config: core::marker::PhantomData<C>,
}

impl<C: SlaveConfig, const N: usize> Default for SlaveCore<C, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: SlaveConfig, const N: usize> SlaveCore<C, N> {
    pub fn new() -> Self {
        SlaveCore {
            buffer: [0u8; N],
            offset: 0,
            overflow: false,
            has_complete_packet: false,
            complete_len: 0,
            stats: PacketStatistics::default(),
            uptime_counter: 0,
            diag: Log::new(),
            _config: core::marker::PhantomData,
        }
    }

    pub fn statistics(&self) -> PacketStatistics {
        self.stats
    }

    pub fn has_complete_packet(&self) -> bool {
        self.has_complete_packet
    }

    pub fn diagnostics(&self) -> &Log {
        &self.diag
    }

    /// Called from the byte-received interrupt. Never blocks, never drops a
    /// byte silently: an overrun packet is still counted, just flagged.
    ///
    /// The caller is responsible for (re)starting the inter-character
    /// timeout timer after this call returns.
    pub fn on_byte(&mut self, byte: u8) {
        if self.has_complete_packet {
            // Worker hasn't picked up the previous packet yet; it is
            // overwritten and counted as lost.
            self.has_complete_packet = false;
            self.stats.lost += 1;
            self.diag.record(Event::PacketLost);
        }
        if self.offset < N {
            self.buffer[self.offset] = byte;
            self.offset += 1;
        } else {
            self.overflow = true;
        }
    }

    /// Called from the inter-character timeout interrupt. Evaluates the
    /// frame received since the last timeout and latches
    /// [`Self::has_complete_packet`] if it is addressed to us or a broadcast.
    /// Checksum verification happens later, in [`Self::dispatch`].
    pub fn on_timeout(&mut self) {
        if self.offset == 0 {
            self.overflow = false;
            return;
        }

        let addr_len = C::ADDRESS_WIDTH.len();
        let received_addr = Address::read_le(C::ADDRESS_WIDTH, &self.buffer);
        let addressed_to_us = self.offset > addr_len && received_addr.0 == C::MY_ADDRESS;
        let is_broadcast = received_addr.is_broadcast();

        if self.overflow {
            if addressed_to_us {
                self.stats.buffer_overflow += 1;
                self.diag.record(Event::BufferOverflow);
            }
        } else if addressed_to_us || (C::BROADCASTS_AVAILABLE && is_broadcast) {
            self.has_complete_packet = true;
            self.complete_len = self.offset;
            self.diag.record(Event::PacketLatched {
                len: self.offset as u16,
            });
        }

        self.offset = 0;
        self.overflow = false;
    }

    /// Advances the periodic uptime counter. Call at `UPTIME_FREQUENCY_HZ`.
    pub fn tick_uptime(&mut self) {
        if C::UPTIME_FREQUENCY_HZ > 0 {
            self.uptime_counter = self.uptime_counter.wrapping_add(1);
        }
    }

    /// Processes a latched packet, if any, writing a reply (if one is
    /// warranted) into `tx` and returning its length. `tx` must be at least
    /// `N` bytes long.
    ///
    /// Does nothing and returns `None` if no packet is waiting.
    pub fn dispatch<P, B>(&mut self, processor: &mut P, broadcaster: &mut B, tx: &mut [u8]) -> Option<usize>
    where
        P: PacketProcessor,
        B: BroadcastProcessor,
    {
        if !self.has_complete_packet {
            return None;
        }
        self.has_complete_packet = false;
        let len = self.complete_len;
        let frame = &self.buffer[..len];

        if len < 2 {
            // Too short to carry even an address and checksum byte; nothing
            // sane to verify.
            return None;
        }
        let (body, claimed) = frame.split_at(len - 1);
        let claimed = claimed[0];
        if !feldbus_checksum::verify(C::CHECKSUM_KIND, body, claimed) {
            self.stats.chksum_mismatch += 1;
            self.diag.record(Event::ChecksumMismatch);
            return None;
        }
        self.stats.correct += 1;

        let addr_len = C::ADDRESS_WIDTH.len();
        let address = Address::read_le(C::ADDRESS_WIDTH, body);
        let payload = &body[addr_len..];

        if address.is_broadcast() {
            self.dispatch_broadcast(broadcaster, payload);
            return None;
        }

        if payload.is_empty() {
            // Ping.
            let reply_addr = Address(C::MY_ADDRESS);
            reply_addr.write_le(C::ADDRESS_WIDTH, tx);
            return Some(self.finish_reply(tx, addr_len, 0));
        }

        if payload[0] == 0 {
            return self.dispatch_reserved(payload, tx).map(|n| {
                let addr = Address(C::MY_ADDRESS);
                addr.write_le(C::ADDRESS_WIDTH, tx);
                self.finish_reply(tx, addr_len, n)
            });
        }

        match processor.process_packet(payload, &mut tx[addr_len..]) {
            PacketResult::Reply(n) => {
                let addr = Address(C::MY_ADDRESS);
                addr.write_le(C::ADDRESS_WIDTH, tx);
                Some(self.finish_reply(tx, addr_len, n))
            }
            PacketResult::IgnorePacket => None,
        }
    }

    fn dispatch_broadcast<B: BroadcastProcessor>(&mut self, broadcaster: &mut B, payload: &[u8]) {
        if !C::BROADCASTS_AVAILABLE {
            return;
        }
        if payload.is_empty() {
            // Legacy broadcast with no protocol id: deliver for backward
            // compatibility under the sensor protocol.
            broadcaster.process_broadcast(ProtocolId::Lokalisierungssensoren, payload);
            return;
        }
        if payload[0] == ProtocolId::Bootloader as u8
            && payload.len() >= 2
            && payload[1] == BOOTLOADER_ENTER_COMMAND
        {
            if C::BOOTLOADER_RESET {
                C::enter_bootloader();
            }
            return;
        }
        if payload[0] == 0x00 || payload[0] == C::DEVICE_PROTOCOL_ID as u8 {
            broadcaster.process_broadcast(C::DEVICE_PROTOCOL_ID, &payload[1..]);
        }
    }

    /// Handles the reserved (protocol-id-less) command table. Returns the
    /// payload length written into `tx[addr_len..]`, or `None` to ignore.
    fn dispatch_reserved(&mut self, payload: &[u8], tx: &mut [u8]) -> Option<usize> {
        let addr_len = C::ADDRESS_WIDTH.len();
        let out = &mut tx[addr_len..];

        if payload.len() == 2 {
            // Legacy device-info packet: the second byte is unused.
            return Some(self.write_legacy_device_info(out));
        }
        if payload.len() != 3 {
            return None;
        }
        let command = ReservedCommand::from_u8(payload[1])?;

        use ReservedCommand::*;
        match command {
            DeviceName => {
                let name = C::DEVICE_NAME;
                out[..name.len()].copy_from_slice(name);
                Some(name.len())
            }
            Uptime => {
                out[..4].copy_from_slice(&self.uptime_counter.to_le_bytes());
                Some(4)
            }
            VersionInfo => {
                let info = C::DEVICE_VERSIONINFO;
                out[..info.len()].copy_from_slice(info);
                Some(info.len())
            }
            PacketCountCorrect => Some(self.write_counter(out, self.stats.correct)),
            PacketCountBufferOverflow => Some(self.write_counter(out, self.stats.buffer_overflow)),
            PacketCountLost => Some(self.write_counter(out, self.stats.lost)),
            PacketCountChecksumMismatch => Some(self.write_counter(out, self.stats.chksum_mismatch)),
            PacketCountAll => {
                if C::PACKAGE_STATISTICS_AVAILABLE {
                    out[0..4].copy_from_slice(&self.stats.correct.to_le_bytes());
                    out[4..8].copy_from_slice(&self.stats.buffer_overflow.to_le_bytes());
                    out[8..12].copy_from_slice(&self.stats.lost.to_le_bytes());
                    out[12..16].copy_from_slice(&self.stats.chksum_mismatch.to_le_bytes());
                } else {
                    out[0..16].fill(0);
                }
                Some(16)
            }
            ResetPacketCount => {
                self.stats = PacketStatistics::default();
                Some(0)
            }
            Uuid => {
                out[..4].copy_from_slice(&C::UUID.to_le_bytes());
                Some(4)
            }
            ExtendedInfo => {
                out[0] = C::DEVICE_NAME.len() as u8;
                out[1] = C::DEVICE_VERSIONINFO.len() as u8;
                out[2..4].copy_from_slice(&(N as u16).to_le_bytes());
                Some(4)
            }
            StaticStorageInfo => {
                let size = C::static_storage().map(|s| s.size()).unwrap_or(0);
                out[..2].copy_from_slice(&size.to_le_bytes());
                Some(2)
            }
            // The fixed 3-byte reserved framing leaves one byte of payload
            // beyond the command itself, so reads/writes here only address a
            // single byte at a time; devices needing bulk transfer expose
            // their own protocol-id for it instead.
            StaticStorageRead => {
                let storage = C::static_storage()?;
                let offset = payload[2] as u16;
                let mut byte = [0u8; 1];
                if storage.read(offset, &mut byte) {
                    out[0] = byte[0];
                    Some(1)
                } else {
                    None
                }
            }
            StaticStorageWrite => {
                let storage = C::static_storage()?;
                let offset = payload[2] as u16;
                storage.write(offset, &[]).then_some(0)
            }
        }
    }

    fn write_counter(&self, out: &mut [u8], value: u32) -> usize {
        if C::PACKAGE_STATISTICS_AVAILABLE {
            out[..4].copy_from_slice(&value.to_le_bytes());
        } else {
            out[..4].fill(0);
        }
        4
    }

    fn write_legacy_device_info(&self, out: &mut [u8]) -> usize {
        out[0] = C::DEVICE_PROTOCOL_ID as u8;
        out[1] = C::DEVICE_TYPE_ID;
        let mut crc_field = C::CHECKSUM_KIND as u8;
        if C::PACKAGE_STATISTICS_AVAILABLE {
            crc_field |= 0x80;
        }
        out[2] = crc_field;
        out[3..5].copy_from_slice(&(N as u16).to_le_bytes());
        out[5] = 0;
        out[6] = 0;
        out[7] = C::DEVICE_NAME.len() as u8;
        out[8] = C::DEVICE_VERSIONINFO.len() as u8;
        out[9..11].copy_from_slice(&C::UPTIME_FREQUENCY_HZ.to_le_bytes());
        11
    }

    fn finish_reply(&self, tx: &mut [u8], addr_len: usize, payload_len: usize) -> usize {
        let len = addr_len + payload_len + 1;
        let checksum = feldbus_checksum::compute(C::CHECKSUM_KIND, &tx[..len - 1]);
        tx[len - 1] = checksum;
        len
    }
}
