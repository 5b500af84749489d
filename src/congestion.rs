//! Per-peer round-trip-time estimation and packet throttling.
//!
//! The packet throttle is a value in `[0, PACKET_THROTTLE_SCALE]`. It scales the peer's window
//!  for reliable data in flight, and it is the probability (in 32ths) that an unreliable packet
//!  is actually sent rather than dropped when the peer is congested.
//!
//! The throttle is driven by RTT samples: a sample at or below the RTT of the previous throttle
//!  epoch accelerates it towards its limit, a sample significantly above it (more than twice
//!  the variance) decelerates it. The limit itself is set by host-wide bandwidth allocation,
//!  see [crate::bandwidth].

use crate::time::time_difference;
use tracing::trace;

pub const DEFAULT_ROUND_TRIP_TIME: u32 = 500;
pub const PACKET_THROTTLE_SCALE: u32 = 32;
pub const DEFAULT_PACKET_THROTTLE: u32 = 32;
pub const PACKET_THROTTLE_COUNTER: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleAdjustment {
    Accelerated,
    Decelerated,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct Congestion {
    pub round_trip_time: u32,
    pub round_trip_time_variance: u32,
    pub lowest_round_trip_time: u32,
    pub highest_round_trip_time_variance: u32,
    /// RTT reference of the current throttle epoch (the lowest RTT of the previous one)
    pub last_round_trip_time: u32,
    pub last_round_trip_time_variance: u32,

    pub packet_throttle: u32,
    pub packet_throttle_limit: u32,
    pub packet_throttle_counter: u32,
    pub packet_throttle_epoch: u32,
    pub packet_throttle_interval: u32,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,
}

impl Congestion {
    pub fn new(packet_throttle_interval: u32, packet_throttle_acceleration: u32, packet_throttle_deceleration: u32) -> Congestion {
        Congestion {
            round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            round_trip_time_variance: 0,
            lowest_round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            highest_round_trip_time_variance: 0,
            last_round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            last_round_trip_time_variance: 0,
            packet_throttle: DEFAULT_PACKET_THROTTLE,
            packet_throttle_limit: PACKET_THROTTLE_SCALE,
            packet_throttle_counter: 0,
            packet_throttle_epoch: 0,
            packet_throttle_interval,
            packet_throttle_acceleration,
            packet_throttle_deceleration,
        }
    }

    pub fn configure(&mut self, interval: u32, acceleration: u32, deceleration: u32) {
        self.packet_throttle_interval = interval;
        self.packet_throttle_acceleration = acceleration;
        self.packet_throttle_deceleration = deceleration;
    }

    /// Adjusts the throttle for an RTT sample, relative to the previous epoch's RTT
    pub fn throttle(&mut self, rtt: u32) -> ThrottleAdjustment {
        if self.last_round_trip_time <= self.last_round_trip_time_variance {
            self.packet_throttle = self.packet_throttle_limit;
            ThrottleAdjustment::Unchanged
        }
        else if rtt <= self.last_round_trip_time {
            self.packet_throttle = (self.packet_throttle + self.packet_throttle_acceleration).min(self.packet_throttle_limit);
            ThrottleAdjustment::Accelerated
        }
        else if rtt > self.last_round_trip_time + 2 * self.last_round_trip_time_variance {
            self.packet_throttle = self.packet_throttle.saturating_sub(self.packet_throttle_deceleration);
            ThrottleAdjustment::Decelerated
        }
        else {
            ThrottleAdjustment::Unchanged
        }
    }

    /// Feeds an RTT sample from an acknowledgement. The very first sample of a connection
    ///  initializes the estimate instead of being smoothed into the default.
    pub fn on_round_trip_sample(&mut self, rtt: u32, is_first_sample: bool, service_time: u32) -> ThrottleAdjustment {
        let rtt = rtt.max(1);

        let adjustment = if is_first_sample {
            self.round_trip_time = rtt;
            self.round_trip_time_variance = (rtt + 1) / 2;
            ThrottleAdjustment::Unchanged
        }
        else {
            let adjustment = self.throttle(rtt);

            self.round_trip_time_variance -= self.round_trip_time_variance / 4;
            if rtt >= self.round_trip_time {
                let diff = rtt - self.round_trip_time;
                self.round_trip_time_variance += diff / 4;
                self.round_trip_time += diff / 8;
            }
            else {
                let diff = self.round_trip_time - rtt;
                self.round_trip_time_variance += diff / 4;
                self.round_trip_time -= diff / 8;
            }
            adjustment
        };

        self.lowest_round_trip_time = self.lowest_round_trip_time.min(self.round_trip_time);
        self.highest_round_trip_time_variance = self.highest_round_trip_time_variance.max(self.round_trip_time_variance);

        if self.packet_throttle_epoch == 0 || time_difference(service_time, self.packet_throttle_epoch) >= self.packet_throttle_interval {
            self.last_round_trip_time = self.lowest_round_trip_time;
            self.last_round_trip_time_variance = self.highest_round_trip_time_variance.max(1);
            self.lowest_round_trip_time = self.round_trip_time;
            self.highest_round_trip_time_variance = self.round_trip_time_variance;
            self.packet_throttle_epoch = service_time;
            trace!("new throttle epoch: reference RTT {} ms, variance {} ms", self.last_round_trip_time, self.last_round_trip_time_variance);
        }

        trace!("RTT sample {} ms: smoothed RTT {} ms, variance {} ms, throttle {}/{}",
            rtt, self.round_trip_time, self.round_trip_time_variance, self.packet_throttle, self.packet_throttle_limit);
        adjustment
    }

    /// The initial retransmission timeout for a reliable command
    pub fn retransmit_timeout(&self) -> u32 {
        self.round_trip_time + 4 * self.round_trip_time_variance
    }

    /// The window for reliable data in flight, scaled by the throttle
    pub fn throttled_window(&self, window_size: u32) -> u32 {
        ((self.packet_throttle as u64 * window_size as u64) / PACKET_THROTTLE_SCALE as u64) as u32
    }

    /// Advances the throttle counter and decides whether the next unreliable packet is dropped
    ///  rather than sent. With a full throttle nothing is dropped.
    pub fn should_drop_unreliable(&mut self) -> bool {
        self.packet_throttle_counter = (self.packet_throttle_counter + PACKET_THROTTLE_COUNTER) % PACKET_THROTTLE_SCALE;
        self.packet_throttle_counter > self.packet_throttle
    }

    /// Sets a new limit from bandwidth allocation, clamping the current throttle to it
    pub fn set_limit(&mut self, limit: u32) {
        self.packet_throttle_limit = limit;
        self.packet_throttle = self.packet_throttle.min(limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn congestion() -> Congestion {
        Congestion::new(5000, 2, 2)
    }

    #[test]
    fn test_first_sample() {
        let mut c = congestion();
        assert_eq!(c.on_round_trip_sample(100, true, 1), ThrottleAdjustment::Unchanged);
        assert_eq!(c.round_trip_time, 100);
        assert_eq!(c.round_trip_time_variance, 50);
        assert_eq!(c.retransmit_timeout(), 300);

        // the first sample also starts the first throttle epoch
        assert_eq!(c.packet_throttle_epoch, 1);
        assert_eq!(c.last_round_trip_time, 100);
        assert_eq!(c.last_round_trip_time_variance, 50);
    }

    #[test]
    fn test_smoothing() {
        let mut c = congestion();
        c.on_round_trip_sample(100, true, 1);
        c.on_round_trip_sample(180, false, 2);
        // variance: 50 - 12 + 20
        assert_eq!(c.round_trip_time_variance, 58);
        assert_eq!(c.round_trip_time, 110);

        c.on_round_trip_sample(30, false, 3);
        // variance: 58 - 14 + 20
        assert_eq!(c.round_trip_time_variance, 64);
        assert_eq!(c.round_trip_time, 100);
    }

    #[test]
    fn test_zero_sample_counts_as_one() {
        let mut c = congestion();
        c.on_round_trip_sample(0, true, 1);
        assert_eq!(c.round_trip_time, 1);
        assert_eq!(c.round_trip_time_variance, 1);
    }

    #[rstest]
    #[case::fast(100, ThrottleAdjustment::Accelerated, 32)]
    #[case::at_reference(200, ThrottleAdjustment::Accelerated, 32)]
    #[case::within_variance(250, ThrottleAdjustment::Unchanged, 20)]
    #[case::spike(301, ThrottleAdjustment::Decelerated, 18)]
    fn test_throttle(#[case] rtt: u32, #[case] expected: ThrottleAdjustment, #[case] expected_throttle: u32) {
        let mut c = congestion();
        c.last_round_trip_time = 200;
        c.last_round_trip_time_variance = 50;
        c.packet_throttle = 20;
        c.packet_throttle_acceleration = 20;

        assert_eq!(c.throttle(rtt), expected);
        assert_eq!(c.packet_throttle, expected_throttle);
    }

    #[test]
    fn test_throttle_decelerates_to_zero() {
        let mut c = congestion();
        c.last_round_trip_time = 100;
        c.last_round_trip_time_variance = 10;
        c.packet_throttle = 1;
        assert_eq!(c.throttle(1000), ThrottleAdjustment::Decelerated);
        assert_eq!(c.packet_throttle, 0);
    }

    #[test]
    fn test_throttle_resets_to_limit_with_unreliable_reference() {
        let mut c = congestion();
        c.last_round_trip_time = 10;
        c.last_round_trip_time_variance = 10;
        c.packet_throttle = 3;
        c.packet_throttle_limit = 17;
        c.throttle(1000);
        assert_eq!(c.packet_throttle, 17);
    }

    #[test]
    fn test_epoch_roll() {
        let mut c = congestion();
        c.on_round_trip_sample(100, true, 1000);
        assert_eq!(c.packet_throttle_epoch, 1000);

        c.on_round_trip_sample(60, false, 3000);
        assert_eq!(c.packet_throttle_epoch, 1000);
        assert_eq!(c.lowest_round_trip_time, 95);

        c.on_round_trip_sample(100, false, 6000);
        assert_eq!(c.packet_throttle_epoch, 6000);
        assert_eq!(c.last_round_trip_time, 95);
    }

    #[rstest]
    #[case::full(32, 65536, 65536)]
    #[case::half(16, 65536, 32768)]
    #[case::stopped(0, 65536, 0)]
    fn test_throttled_window(#[case] throttle: u32, #[case] window: u32, #[case] expected: u32) {
        let mut c = congestion();
        c.packet_throttle = throttle;
        assert_eq!(c.throttled_window(window), expected);
    }

    #[rstest]
    #[case::full(32, 0)]
    #[case::half(16, 15)]
    #[case::stopped(0, 31)]
    fn test_should_drop_unreliable(#[case] throttle: u32, #[case] expected_drops: usize) {
        let mut c = congestion();
        c.packet_throttle = throttle;
        // the counter cycles through all residues mod 32
        let drops = (0..32).filter(|_| c.should_drop_unreliable()).count();
        assert_eq!(drops, expected_drops);
    }

    #[test]
    fn test_set_limit() {
        let mut c = congestion();
        c.set_limit(10);
        assert_eq!(c.packet_throttle, 10);
        c.set_limit(20);
        assert_eq!(c.packet_throttle, 10);
        assert_eq!(c.packet_throttle_limit, 20);
    }
}
