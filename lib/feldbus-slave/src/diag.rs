//! A tiny fixed-size diagnostic ring buffer.
//!
//! Playing the role `ringbuf!` plays on Hubris proper, minus the macro: a
//! `no_std` slave has no logging facade to reach for, so receive-path events
//! (lost packets, overflows, checksum failures) are recorded here instead,
//! where a debugger or a host-side tool can read them back out of RAM.

const CAPACITY: usize = 16;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Event {
    PacketLatched { len: u16 },
    PacketLost,
    BufferOverflow,
    ChecksumMismatch,
}

/// Fixed-capacity ring of the last [`CAPACITY`] events, oldest overwritten
/// first.
pub struct Log {
    entries: [Option<Event>; CAPACITY],
    next: usize,
    total: u32,
}

impl Log {
    pub const fn new() -> Self {
        Log {
            entries: [None; CAPACITY],
            next: 0,
            total: 0,
        }
    }

    pub fn record(&mut self, event: Event) {
        self.entries[self.next] = Some(event);
        self.next = (self.next + 1) % CAPACITY;
        self.total = self.total.wrapping_add(1);
    }

    /// Total number of events ever recorded, including ones since
    /// overwritten.
    pub fn total_recorded(&self) -> u32 {
        self.total
    }

    /// Iterates the retained entries oldest-first.
    pub fn entries(&self) -> impl Iterator<Item = Event> + '_ {
        let start = if (self.total as usize) < CAPACITY { 0 } else { self.next };
        (0..CAPACITY.min(self.total as usize)).map(move |i| self.entries[(start + i) % CAPACITY].unwrap())
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order_until_wraparound() {
        let mut log = Log::new();
        log.record(Event::PacketLost);
        log.record(Event::BufferOverflow);
        let mut entries = log.entries();
        assert_eq!(entries.next(), Some(Event::PacketLost));
        assert_eq!(entries.next(), Some(Event::BufferOverflow));
        assert_eq!(entries.next(), None);
    }

    #[test]
    fn wraps_after_capacity_and_keeps_total_count() {
        let mut log = Log::new();
        for i in 0..(CAPACITY as u16 + 3) {
            log.record(Event::PacketLatched { len: i });
        }
        assert_eq!(log.total_recorded(), CAPACITY as u32 + 3);
        let entries: [Event; CAPACITY] = {
            let mut it = log.entries();
            core::array::from_fn(|_| it.next().unwrap())
        };
        // Oldest retained entry is the 4th one recorded (index 3), since the
        // first three were overwritten.
        assert_eq!(entries[0], Event::PacketLatched { len: 3 });
        assert_eq!(entries[CAPACITY - 1], Event::PacketLatched { len: CAPACITY as u16 + 2 });
    }
}
