//! UUID-based automatic address assignment.
//!
//! [`DeviceLocator`] issues the well-known broadcast commands (spec §4.H);
//! [`BinaryAddressSearcher`] drives a full discovery cycle by walking the
//! 32-bit UUID space as a binary tree, using the locator's
//! `request_bus_assertion` broadcast as the tree's branch test.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use feldbus_checksum::ChecksumKind;
use feldbus_host::TransmissionStatistics;
use feldbus_protocol::{Address, AddressWidth, BusTransport, TransceiveOutcome};

const PROTOCOL_LOCATOR: u8 = 0x00;
const KEY_META: u8 = 0x00;
const KEY_ENABLE_NEIGHBORS: u8 = 0x01;
const KEY_DISABLE_NEIGHBORS: u8 = 0x02;
const KEY_RESET_ALL_ADDRESSES: u8 = 0x03;
const KEY_REQUEST_BUS_ASSERTION: u8 = 0x04;
const KEY_REQUEST_BUS_ASSERTION_UNADDRESSED: u8 = 0x05;
const KEY_GO_TO_SLEEP: u8 = 0x06;

const META_KEY2_GET_ADDRESS: u8 = 0x00;
const META_KEY2_RESET_ADDRESS: u8 = 0x01;

/// Default number of transport-level retries for locator commands other
/// than the bus-assertion probe, which is always single-attempt (see
/// [`DeviceLocator::request_bus_assertion`]).
const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// Issues the reserved, protocol-0 broadcast commands used for UUID-based
/// device discovery. Every method here talks to the broadcast address;
/// there is no per-device dysfunctional gate the way [`feldbus_host::Device`]
/// has one, since these are one-shot broadcasts, not a session with a
/// specific slave.
pub struct DeviceLocator<T: BusTransport> {
    transport: T,
    width: AddressWidth,
    checksum_kind: ChecksumKind,
    max_attempts: u32,
    stats: TransmissionStatistics,
}

impl<T: BusTransport> DeviceLocator<T> {
    pub fn new(transport: T, width: AddressWidth, checksum_kind: ChecksumKind) -> Self {
        DeviceLocator {
            transport,
            width,
            checksum_kind,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            stats: TransmissionStatistics::default(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn statistics(&self) -> TransmissionStatistics {
        self.stats
    }

    fn addr_len(&self) -> usize {
        self.width.len()
    }

    /// Runs one broadcast transaction: `payload` is written starting right
    /// after the address bytes; `expected_rx_payload_len` is the reply
    /// payload length expected back (broadcasts are usually answered by at
    /// most one matching slave). `max_attempts` overrides the locator's
    /// default for this one call (used by the bus-assertion probe).
    fn transceive(
        &mut self,
        payload: &[u8],
        expected_rx_payload_len: usize,
        max_attempts: u32,
    ) -> (TransceiveOutcome, Vec<u8>) {
        let addr_len = self.addr_len();
        let mut tx = vec![0u8; addr_len + payload.len() + 1];
        tx[addr_len..addr_len + payload.len()].copy_from_slice(payload);
        let mut rx = vec![0u8; addr_len + expected_rx_payload_len + 1];

        let outcome = feldbus_host::transceive_with_retry(
            &mut self.transport,
            self.width,
            Address::BROADCAST,
            self.checksum_kind,
            &mut tx,
            &mut rx,
            max_attempts,
            &mut self.stats,
        );
        let last = rx.len() - 1;
        (outcome, rx[addr_len..last].to_vec())
    }

    /// Gets the UUID of whichever single device currently asserts the bus in
    /// response (normally meaningful only when exactly one device is
    /// listening, e.g. right after power-up on an otherwise empty bus).
    pub fn get_uuid(&mut self) -> Option<u32> {
        let (outcome, rx) = self.transceive(&[PROTOCOL_LOCATOR, KEY_META], 4, self.max_attempts);
        (outcome == TransceiveOutcome::Success).then(|| u32::from_le_bytes(rx[..4].try_into().unwrap()))
    }

    /// Broadcasts a ping that only the device whose UUID matches answers.
    pub fn ping_by_uuid(&mut self, uuid: u32) -> bool {
        let mut payload = vec![PROTOCOL_LOCATOR, KEY_META];
        payload.extend_from_slice(&uuid.to_le_bytes());
        self.transceive(&payload, 0, self.max_attempts).0 == TransceiveOutcome::Success
    }

    pub fn get_bus_address(&mut self, uuid: u32) -> Option<u16> {
        let mut payload = vec![PROTOCOL_LOCATOR, KEY_META];
        payload.extend_from_slice(&uuid.to_le_bytes());
        payload.push(META_KEY2_GET_ADDRESS);
        let (outcome, rx) = self.transceive(&payload, 1, self.max_attempts);
        (outcome == TransceiveOutcome::Success).then(|| rx[0] as u16)
    }

    pub fn set_bus_address(&mut self, uuid: u32, new_address: u16) -> bool {
        let mut payload = vec![PROTOCOL_LOCATOR, KEY_META];
        payload.extend_from_slice(&uuid.to_le_bytes());
        payload.push(META_KEY2_GET_ADDRESS);
        match self.width {
            AddressWidth::One => payload.push(new_address as u8),
            AddressWidth::Two => payload.extend_from_slice(&new_address.to_le_bytes()),
        }
        let (outcome, rx) = self.transceive(&payload, 1, self.max_attempts);
        outcome == TransceiveOutcome::Success && rx[0] == 1
    }

    pub fn reset_bus_address(&mut self, uuid: u32) -> bool {
        let mut payload = vec![PROTOCOL_LOCATOR, KEY_META];
        payload.extend_from_slice(&uuid.to_le_bytes());
        payload.push(META_KEY2_RESET_ADDRESS);
        self.transceive(&payload, 0, self.max_attempts).0 == TransceiveOutcome::Success
    }

    pub fn enable_bus_neighbors(&mut self) -> bool {
        self.transceive(&[PROTOCOL_LOCATOR, KEY_ENABLE_NEIGHBORS], 0, self.max_attempts).0 == TransceiveOutcome::Success
    }

    pub fn disable_bus_neighbors(&mut self) -> bool {
        self.transceive(&[PROTOCOL_LOCATOR, KEY_DISABLE_NEIGHBORS], 0, self.max_attempts).0 == TransceiveOutcome::Success
    }

    pub fn reset_all_bus_addresses(&mut self) -> bool {
        self.transceive(&[PROTOCOL_LOCATOR, KEY_RESET_ALL_ADDRESSES], 0, self.max_attempts).0 == TransceiveOutcome::Success
    }

    pub fn go_to_sleep(&mut self) -> bool {
        self.transceive(&[PROTOCOL_LOCATOR, KEY_GO_TO_SLEEP], 0, self.max_attempts).0 == TransceiveOutcome::Success
    }

    /// Asks every device whose UUID's top `mask_len` bits equal
    /// `search_addr`'s top `mask_len` bits to assert the bus; if
    /// `only_unaddressed` is set, only devices with no bus address yet
    /// participate. Always single-attempt: the transport reports
    /// `TransmissionError` precisely when nobody asserted, which is data, not
    /// a failure to retry around (spec §4.H, §9).
    pub fn request_bus_assertion(&mut self, mask_len: u8, search_addr: u32, only_unaddressed: bool) -> bool {
        let key = if only_unaddressed {
            KEY_REQUEST_BUS_ASSERTION_UNADDRESSED
        } else {
            KEY_REQUEST_BUS_ASSERTION
        };
        let mut payload = vec![PROTOCOL_LOCATOR, key, mask_len];
        payload.extend_from_slice(&search_addr.to_le_bytes());
        let (outcome, _rx) = self.transceive(&payload, 1, 1);
        outcome != TransceiveOutcome::TransmissionError
    }
}

/// One node of the binary-tree UUID search: `addr`'s top `level` bits are
/// fixed, the remaining `32 - level` bits are still undetermined.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct SearchAddress {
    addr: u32,
    level: u8,
}

/// Drives [`DeviceLocator::request_bus_assertion`] over the full 32-bit UUID
/// space, isolating one UUID at a time (spec §4.H). Call
/// [`Self::try_find_next_device`] in a loop; each call issues at most one
/// bus transaction.
pub struct BinaryAddressSearcher<T: BusTransport> {
    locator: DeviceLocator<T>,
    queue: VecDeque<SearchAddress>,
    only_unaddressed: bool,
    min_request_delay: Duration,
    last_request_at: Option<Instant>,
}

/// Outcome of a single [`BinaryAddressSearcher::try_find_next_device`] step.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SearchStep {
    /// A UUID was isolated at this step.
    Found(u32),
    /// The probe ran (possibly narrowing the tree further) but isolated
    /// nothing yet.
    NotFound,
    /// The search queue is empty: discovery is complete.
    Done,
    /// The transport reported a hard failure unrelated to the bus-assertion
    /// semantic (spec §7: "aborts the search cycle").
    TransportError,
}

impl<T: BusTransport> BinaryAddressSearcher<T> {
    pub fn new(locator: DeviceLocator<T>, only_unaddressed: bool) -> Self {
        let mut queue = VecDeque::new();
        queue.push_back(SearchAddress { addr: 0, level: 0 });
        BinaryAddressSearcher {
            locator,
            queue,
            only_unaddressed,
            min_request_delay: Duration::from_millis(5),
            last_request_at: None,
        }
    }

    pub fn with_min_request_delay(mut self, delay: Duration) -> Self {
        self.min_request_delay = delay;
        self
    }

    pub fn into_locator(self) -> DeviceLocator<T> {
        self.locator
    }

    /// Advances the search by exactly one probe. See spec §4.H for the full
    /// branching derivation.
    pub fn try_find_next_device(&mut self) -> SearchStep {
        let Some(sa) = self.queue.pop_front() else {
            return SearchStep::Done;
        };

        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < self.min_request_delay {
                std::thread::sleep(self.min_request_delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());

        let hit = self
            .locator
            .request_bus_assertion(sa.level, sa.addr, self.only_unaddressed);

        let mut detected_device = None;

        if sa.level == 0 {
            if hit {
                self.queue.push_front(SearchAddress { addr: 0, level: 1 });
            }
        } else {
            let left_branch = sa.addr & (1u32 << (sa.level - 1)) == 0;

            if hit {
                let one_level_deeper = SearchAddress {
                    addr: sa.addr,
                    level: sa.level + 1,
                };
                if one_level_deeper.level > 32 {
                    detected_device = Some(one_level_deeper.addr);
                } else {
                    self.queue.push_front(one_level_deeper);
                }
                if left_branch {
                    let sibling = SearchAddress {
                        addr: sa.addr | (1u32 << (sa.level - 1)),
                        level: sa.level,
                    };
                    self.queue.push_back(sibling);
                }
            } else if left_branch {
                let sibling = SearchAddress {
                    addr: sa.addr | (1u32 << (sa.level - 1)),
                    level: sa.level,
                };
                if sibling.level > 32 {
                    detected_device = Some(sibling.addr);
                } else {
                    self.queue.push_front(sibling);
                }
            }
        }

        match detected_device {
            Some(uuid) => SearchStep::Found(uuid),
            None => SearchStep::NotFound,
        }
    }

    /// Runs the search to completion, returning every UUID isolated. Bounded
    /// at `2 * (expected_devices) * 32` probes per spec §4.H's invariant;
    /// `expected_devices` only sizes the bound, it need not be exact.
    pub fn find_all(&mut self, expected_devices: usize) -> Vec<u32> {
        let mut found = Vec::new();
        let budget = 2 * expected_devices.max(1) * 32;
        for _ in 0..budget {
            match self.try_find_next_device() {
                SearchStep::Found(uuid) => found.push(uuid),
                SearchStep::NotFound => {}
                SearchStep::Done => break,
                SearchStep::TransportError => break,
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fake transport that reports a bus assertion whenever any of
    /// `uuids` has its top `mask_len` bits equal to `search_addr`'s.
    struct AssertionTransport {
        uuids: Vec<u32>,
    }

    impl BusTransport for AssertionTransport {
        fn transceive(&mut self, tx: &[u8], rx: &mut [u8], transferred: &mut usize) -> TransceiveOutcome {
            // tx = [addr(1), protocol(1)=0, key(1), mask_len(1), search_addr(4), chk(1)]
            let key = tx[2];
            if key != KEY_REQUEST_BUS_ASSERTION && key != KEY_REQUEST_BUS_ASSERTION_UNADDRESSED {
                *transferred = tx.len();
                return TransceiveOutcome::TransmissionError;
            }
            let mask_len = tx[3];
            let search_addr = u32::from_le_bytes(tx[4..8].try_into().unwrap());
            let mask = if mask_len == 0 { 0 } else { u32::MAX << (32 - mask_len) };
            let hit = self.uuids.iter().any(|u| u & mask == search_addr & mask);
            if hit {
                *transferred = rx.len();
                TransceiveOutcome::ChecksumError
            } else {
                *transferred = 0;
                TransceiveOutcome::TransmissionError
            }
        }

        fn clear_buffer(&mut self) {}
    }

    #[test]
    fn finds_both_uuids_without_duplicates() {
        let transport = AssertionTransport {
            uuids: vec![0x0000_0001, 0x8000_0000],
        };
        let locator = DeviceLocator::new(transport, AddressWidth::One, ChecksumKind::Xor)
            .with_max_attempts(1);
        let mut searcher = BinaryAddressSearcher::new(locator, false)
            .with_min_request_delay(Duration::from_millis(0));

        let found = searcher.find_all(2);
        assert_eq!(found.len(), 2, "found: {found:0>8x?}");
        assert!(found.contains(&0x0000_0001));
        assert!(found.contains(&0x8000_0000));

        let mut dedup = found.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(dedup.len(), found.len(), "no duplicate UUIDs expected");
    }

    #[test]
    fn single_device_found_at_its_full_uuid() {
        let transport = AssertionTransport {
            uuids: vec![0xDEAD_BEEF],
        };
        let locator = DeviceLocator::new(transport, AddressWidth::One, ChecksumKind::Xor)
            .with_max_attempts(1);
        let mut searcher = BinaryAddressSearcher::new(locator, false)
            .with_min_request_delay(Duration::from_millis(0));

        let found = searcher.find_all(1);
        assert_eq!(found, vec![0xDEAD_BEEF]);
    }

    #[test]
    fn empty_bus_finds_nothing() {
        let transport = AssertionTransport { uuids: vec![] };
        let locator = DeviceLocator::new(transport, AddressWidth::One, ChecksumKind::Xor)
            .with_max_attempts(1);
        let mut searcher = BinaryAddressSearcher::new(locator, false)
            .with_min_request_delay(Duration::from_millis(0));

        assert!(searcher.find_all(1).is_empty());
    }

    #[test]
    fn unmatched_assertion_request_is_a_miss_not_an_abort() {
        let transport = AssertionTransport { uuids: vec![0x1234_5678] };
        let mut locator = DeviceLocator::new(transport, AddressWidth::One, ChecksumKind::Xor)
            .with_max_attempts(1);
        assert!(!locator.request_bus_assertion(32, 0xFFFF_FFFF, false));
        assert!(locator.request_bus_assertion(32, 0x1234_5678, false));
    }
}
