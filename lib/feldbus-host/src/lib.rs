//! Master-side transceive retry loop and per-device session state.
//!
//! This crate mirrors the split the original C++ implementation draws
//! between a stateless `BaseDevice::transceive` retry loop and a `Device`
//! that layers caching, a dysfunctional gate and convenience queries on top
//! of it. `transceive_with_retry` is that stateless loop; [`Device`] is the
//! stateful session.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use feldbus_checksum::ChecksumKind;
use feldbus_protocol::{Address, AddressWidth, BusTransport, DeviceInfo, ExtendedDeviceInfo, TransceiveOutcome};

/// Accumulated transmission statistics for one device, reported by
/// `receive_all_slave_error_count` and friends on the *slave* side — this is
/// the master's own view of how its transmissions have been going.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TransmissionStatistics {
    pub total_transmissions: u64,
    pub transmit_errors: u32,
    pub no_answer_errors: u32,
    pub missing_data_errors: u32,
    pub checksum_errors: u32,
}

impl TransmissionStatistics {
    pub fn total_errors(&self) -> u32 {
        self.transmit_errors + self.no_answer_errors + self.missing_data_errors + self.checksum_errors
    }
}

/// Component F: the stateless retry loop every transaction funnels through.
///
/// `tx` must already hold the payload in `tx[width.len()..tx.len()-1]`; this
/// function fills in the address and checksum on every attempt (recomputing
/// the checksum each time is wasted work but keeps this function free of
/// assumptions about whether the caller mutates `tx` between retries).
/// `rx` is sized to the exact expected reply length.
pub fn transceive_with_retry(
    transport: &mut dyn BusTransport,
    width: AddressWidth,
    address: Address,
    checksum_kind: ChecksumKind,
    tx: &mut [u8],
    rx: &mut [u8],
    max_attempts: u32,
    stats: &mut TransmissionStatistics,
) -> TransceiveOutcome {
    feldbus_protocol::encode_frame(tx, width, address, checksum_kind);

    let mut status = TransceiveOutcome::TransmissionError;
    let mut attempts = 0u32;

    while attempts < max_attempts && status != TransceiveOutcome::Success {
        let mut transferred = 0usize;
        transport.clear_buffer();
        status = transport.transceive(tx, rx, &mut transferred);

        match status {
            TransceiveOutcome::TransmissionError => {
                if transferred < tx.len() {
                    stats.transmit_errors += 1;
                } else if transferred == tx.len() {
                    stats.no_answer_errors += 1;
                } else {
                    stats.missing_data_errors += 1;
                }
            }
            TransceiveOutcome::ChecksumError => stats.checksum_errors += 1,
            TransceiveOutcome::Success => {}
        }
        attempts += 1;
    }
    stats.total_transmissions += attempts as u64;
    status
}

/// Throttled warning log, grounded on the original `CheapErrorObserver`:
/// logs at most once per `window`, then swallows further occurrences until
/// the window has passed, reporting how many were swallowed.
pub struct RateLimitedLog {
    window: Duration,
    last_logged: Option<Instant>,
    swallowed_since_last_log: u32,
}

impl RateLimitedLog {
    pub fn new(window: Duration) -> Self {
        RateLimitedLog {
            window,
            last_logged: None,
            swallowed_since_last_log: 0,
        }
    }

    /// Call on every occurrence of the condition being throttled. Returns
    /// `Some(count)` the first time in a window (where `count` includes any
    /// occurrences swallowed since the previous log line), `None` otherwise.
    pub fn note(&mut self) -> Option<u32> {
        let now = Instant::now();
        let due = match self.last_logged {
            None => true,
            Some(last) => now.duration_since(last) >= self.window,
        };
        if due {
            let count = self.swallowed_since_last_log + 1;
            self.swallowed_since_last_log = 0;
            self.last_logged = Some(now);
            Some(count)
        } else {
            self.swallowed_since_last_log += 1;
            None
        }
    }

    /// Resets the window, so the next occurrence logs immediately. Called
    /// whenever a device transitions back to functional.
    pub fn reset(&mut self) {
        self.last_logged = None;
        self.swallowed_since_last_log = 0;
    }
}

/// Per-device session: dysfunctional gate, cached `DeviceInfo`, and the
/// convenience queries built on the reserved command table.
///
/// Generic over the transport so callers can plug in a real serial port or
/// [`feldbus_sim`]'s in-memory loopback.
pub struct Device<T: BusTransport> {
    transport: Rc<RefCell<T>>,
    name: &'static str,
    address: Address,
    width: AddressWidth,
    checksum_kind: ChecksumKind,
    max_transmission_attempts: u32,
    max_transmission_errors: u32,

    stats: TransmissionStatistics,
    consecutive_error_count: u32,
    has_probed_availability: bool,
    dysfunctional_log: RateLimitedLog,

    cached_device_info: Option<DeviceInfo>,
    cached_extended_device_info: Option<ExtendedDeviceInfo>,
    cached_uuid: Option<u32>,
}

const DEFAULT_MAX_TRANSMISSION_ATTEMPTS: u32 = 2;
const DEFAULT_MAX_TRANSMISSION_ERRORS: u32 = 7;

impl<T: BusTransport> Device<T> {
    pub fn new(
        name: &'static str,
        address: Address,
        width: AddressWidth,
        checksum_kind: ChecksumKind,
        transport: Rc<RefCell<T>>,
    ) -> Self {
        Device {
            transport,
            name,
            address,
            width,
            checksum_kind,
            max_transmission_attempts: DEFAULT_MAX_TRANSMISSION_ATTEMPTS,
            max_transmission_errors: DEFAULT_MAX_TRANSMISSION_ERRORS,
            stats: TransmissionStatistics::default(),
            consecutive_error_count: 0,
            has_probed_availability: false,
            dysfunctional_log: RateLimitedLog::new(Duration::from_secs(5)),
            cached_device_info: None,
            cached_extended_device_info: None,
            cached_uuid: None,
        }
    }

    pub fn with_transmission_limits(mut self, max_attempts: u32, max_errors: u32) -> Self {
        self.max_transmission_attempts = max_attempts;
        self.max_transmission_errors = max_errors;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn statistics(&self) -> TransmissionStatistics {
        self.stats
    }

    /// `consecutive_error_count >= max_errors`: see spec §4.G.
    pub fn is_dysfunctional(&self) -> bool {
        self.consecutive_error_count >= self.max_transmission_errors
    }

    /// Resets every counter and the dysfunctional gate. Transmissions are
    /// retried from scratch after this call.
    pub fn clear_transmission_counters(&mut self) {
        self.stats = TransmissionStatistics::default();
        self.consecutive_error_count = 0;
        self.has_probed_availability = false;
        self.dysfunctional_log.reset();
    }

    /// `ping` always issues a real packet, bypassing the dysfunctional gate.
    pub fn send_ping(&mut self) -> bool {
        self.transceive_payload(0, 0, true).is_some()
    }

    /// On first call or when `force`, keeps retrying `ping` until one
    /// succeeds or the device becomes dysfunctional. Afterwards returns the
    /// cached negative of `dysfunctional` without touching the bus.
    pub fn is_available(&mut self, force: bool) -> bool {
        if !self.has_probed_availability || force {
            while !self.is_dysfunctional() {
                if self.send_ping() {
                    break;
                }
            }
            self.has_probed_availability = true;
        }
        !self.is_dysfunctional()
    }

    /// Runs one transaction, honoring the dysfunctional gate and bookkeeping
    /// the consecutive-error counter and throttled log. `fill` writes the
    /// request payload into `tx[addr_len..tx.len()-1]`; `expected_rx_payload_len`
    /// is the expected reply payload length (excluding address and checksum).
    ///
    /// Returns just the reply payload on success.
    fn transceive_with_payload(
        &mut self,
        fill: impl FnOnce(&mut [u8]),
        payload_len: usize,
        expected_rx_payload_len: usize,
        ignore_dysfunctional: bool,
    ) -> Option<Vec<u8>> {
        let bail_out = self.is_dysfunctional() && !ignore_dysfunctional;
        if bail_out {
            if let Some(swallowed) = self.dysfunctional_log.note() {
                log::warn!(
                    "device \"{}\" dysfunctional, packet dropped ({} swallowed)",
                    self.name,
                    swallowed
                );
            }
            return None;
        }

        let addr_len = self.width.len();
        let mut tx = vec![0u8; addr_len + payload_len + 1];
        fill(&mut tx[addr_len..addr_len + payload_len]);
        let mut rx = vec![0u8; addr_len + expected_rx_payload_len + 1];

        // A single-attempt transceive is used once the device is known
        // dysfunctional: if it was broken a moment ago, retrying harder is
        // unlikely to help, and a success should immediately clear the
        // counter rather than require a streak.
        let max_attempts = if self.is_dysfunctional() {
            1
        } else {
            self.max_transmission_attempts
        };

        let mut transport = self.transport.borrow_mut();
        let outcome = transceive_with_retry(
            &mut *transport,
            self.width,
            self.address,
            self.checksum_kind,
            &mut tx,
            &mut rx,
            max_attempts,
            &mut self.stats,
        );
        drop(transport);

        match outcome {
            TransceiveOutcome::Success => {
                self.consecutive_error_count = 0;
                self.dysfunctional_log.reset();
                log::debug!("device \"{}\": transceive successful", self.name);
                let last = rx.len() - 1;
                Some(rx[addr_len..last].to_vec())
            }
            TransceiveOutcome::TransmissionError => {
                self.consecutive_error_count += 1;
                log::warn!("device \"{}\": transceive failed: transmission error", self.name);
                None
            }
            TransceiveOutcome::ChecksumError => {
                self.consecutive_error_count += 1;
                log::warn!("device \"{}\": transceive failed: checksum error", self.name);
                None
            }
        }
    }

    /// Public door into the same transceive-with-retry machinery for
    /// protocols layered above the base device commands (Stellantriebe and
    /// friends), which need to send payloads this crate has no fixed shape
    /// for. `fill` writes exactly `payload_len` bytes; the reply payload is
    /// expected to be `expected_rx_payload_len` bytes.
    pub fn transceive_raw(
        &mut self,
        fill: impl FnOnce(&mut [u8]),
        payload_len: usize,
        expected_rx_payload_len: usize,
    ) -> Option<Vec<u8>> {
        self.transceive_with_payload(fill, payload_len, expected_rx_payload_len, false)
    }

    /// Convenience wrapper for the common case: a request made only of a
    /// reserved `key` byte (plus the leading `0x00`), expecting
    /// `expected_rx_len` bytes of reply payload. `key == 0` with
    /// `expected_rx_len == 0` is the bare ping.
    fn transceive_payload(&mut self, key: u8, expected_rx_len: usize, ignore_dysfunctional: bool) -> Option<Vec<u8>> {
        if key == 0 && expected_rx_len == 0 {
            return self.transceive_with_payload(|_| {}, 0, 0, ignore_dysfunctional);
        }
        self.transceive_with_payload(
            |payload| {
                payload[0] = 0x00;
                payload[1] = key;
            },
            2,
            expected_rx_len,
            ignore_dysfunctional,
        )
    }

    /// Memoized: populated on first successful call, invalidated only by
    /// [`Self::clear_transmission_counters`]… no — invalidated never, per
    /// spec (device identity doesn't change at runtime). Only a fresh
    /// `Device` clears it.
    pub fn get_device_info(&mut self) -> Option<DeviceInfo> {
        if let Some(info) = self.cached_device_info {
            return Some(info);
        }
        let rx = self.transceive_with_payload(|payload| payload[0] = 0x00, 1, 11, false)?;
        let info = DeviceInfo::decode(&rx)?;
        if !info.new_variant {
            // Legacy wiring stores UUID behind its own reserved command.
            let uuid_rx = self.transceive_payload(0x09, 4, false)?;
            self.cached_uuid = Some(u32::from_le_bytes(uuid_rx[..4].try_into().ok()?));
            self.cached_extended_device_info = Some(ExtendedDeviceInfo {
                name_length: info.name_length,
                versioninfo_length: info.versioninfo_length,
                buffer_size: info.buffer_or_extended_info_size,
            });
        } else {
            self.cached_uuid = Some(info.uuid_low_bits);
        }
        self.cached_device_info = Some(info);
        Some(info)
    }

    pub fn get_extended_device_info(&mut self) -> Option<ExtendedDeviceInfo> {
        self.get_device_info()?;
        if let Some(ext) = self.cached_extended_device_info {
            return Some(ext);
        }
        let rx = self.transceive_payload(0x0A, 4, false)?;
        let ext = ExtendedDeviceInfo {
            name_length: rx[0],
            versioninfo_length: rx[1],
            buffer_size: u16::from_le_bytes([rx[2], rx[3]]),
        };
        self.cached_extended_device_info = Some(ext);
        Some(ext)
    }

    pub fn get_uuid(&mut self) -> Option<u32> {
        self.get_device_info()?;
        self.cached_uuid
    }

    /// Forces `DeviceInfo` population to learn the string length, then
    /// reads `DEVICE_NAME` into a buffer of exactly that length.
    pub fn receive_device_real_name(&mut self) -> Option<String> {
        let ext = self.get_extended_device_info()?;
        self.receive_string(0x00, ext.name_length)
    }

    pub fn receive_version_info(&mut self) -> Option<String> {
        let ext = self.get_extended_device_info()?;
        self.receive_string(0x02, ext.versioninfo_length)
    }

    fn receive_string(&mut self, key: u8, length: u8) -> Option<String> {
        let rx = self.transceive_payload(key, length as usize, false)?;
        String::from_utf8(rx).ok()
    }

    pub fn receive_uptime(&mut self) -> Option<f32> {
        let info = self.get_device_info()?;
        if info.uptime_frequency == 0 {
            return Some(f32::NAN);
        }
        let count = self.receive_counter(0x01)?;
        Some(count as f32 / info.uptime_frequency as f32)
    }

    pub fn receive_number_of_accepted_packages(&mut self) -> Option<u32> {
        self.receive_counter(0x03)
    }

    pub fn receive_number_of_overflows(&mut self) -> Option<u32> {
        self.receive_counter(0x04)
    }

    pub fn receive_number_of_lost_packages(&mut self) -> Option<u32> {
        self.receive_counter(0x05)
    }

    pub fn receive_number_of_checksum_errors(&mut self) -> Option<u32> {
        self.receive_counter(0x06)
    }

    fn receive_counter(&mut self, key: u8) -> Option<u32> {
        let rx = self.transceive_payload(key, 4, false)?;
        Some(u32::from_le_bytes(rx[..4].try_into().ok()?))
    }

    pub fn receive_all_slave_error_count(&mut self) -> Option<[u32; 4]> {
        let rx = self.transceive_payload(0x07, 16, false)?;
        Some([
            u32::from_le_bytes(rx[0..4].try_into().ok()?),
            u32::from_le_bytes(rx[4..8].try_into().ok()?),
            u32::from_le_bytes(rx[8..12].try_into().ok()?),
            u32::from_le_bytes(rx[12..16].try_into().ok()?),
        ])
    }

    pub fn reset_slave_errors(&mut self) -> bool {
        self.transceive_payload(0x08, 0, false).is_some()
    }
}
