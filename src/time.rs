//! Protocol time is a wrapping `u32` millisecond counter. Comparisons treat two values as
//!  ordered if they are less than [TIME_OVERFLOW] apart, so the counter may wrap around
//!  without confusing timeouts or RTT samples.

use std::time::Duration;
use tokio::time::Instant;

pub const TIME_OVERFLOW: u32 = 86_400_000;

pub fn time_less(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) >= TIME_OVERFLOW
}

pub fn time_greater(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) >= TIME_OVERFLOW
}

pub fn time_less_equal(a: u32, b: u32) -> bool {
    !time_greater(a, b)
}

pub fn time_greater_equal(a: u32, b: u32) -> bool {
    !time_less(a, b)
}

pub fn time_difference(a: u32, b: u32) -> u32 {
    if a.wrapping_sub(b) >= TIME_OVERFLOW {
        b.wrapping_sub(a)
    }
    else {
        a.wrapping_sub(b)
    }
}

/// Only the lower 16 bits of a sent time are echoed in acknowledgements. This reconstructs the
///  full value relative to the current service time, assuming the echoed time lies in the
///  past (at most 65 seconds).
pub fn expand_sent_time(service_time: u32, received_sent_time: u16) -> u32 {
    let expanded = (service_time & 0xFFFF_0000) | received_sent_time as u32;
    if (expanded & 0x8000) > (service_time & 0x8000) {
        expanded.wrapping_sub(0x10000)
    }
    else {
        expanded
    }
}

pub fn duration_to_millis(duration: Duration) -> u32 {
    duration.as_millis().try_into().unwrap_or(u32::MAX)
}

/// Source of protocol time for a host, based on the tokio clock so that tests can run with
///  paused time.
pub struct ServiceClock {
    epoch: Instant,
}

impl ServiceClock {
    pub fn new() -> ServiceClock {
        ServiceClock {
            epoch: Instant::now(),
        }
    }

    /// Milliseconds since the clock's creation, offset by one: a time value of `0` is used
    ///  as a marker for 'not set' throughout the protocol.
    pub fn now(&self) -> u32 {
        (self.epoch.elapsed().as_millis() as u32).wrapping_add(1)
    }
}

impl Default for ServiceClock {
    fn default() -> Self {
        ServiceClock::new()
    }
}
