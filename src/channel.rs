use crate::queued_command::IncomingCommand;
use std::collections::VecDeque;

/// Number of reliable windows a channel's sequence space is divided into
pub const RELIABLE_WINDOWS: u16 = 16;
/// Reliable sequence numbers per window
pub const RELIABLE_WINDOW_SIZE: u16 = 0x1000;
/// Number of windows ahead of the current one that must be free before a sender moves into
///  a new window
pub const FREE_RELIABLE_WINDOWS: u16 = 8;

/// The window a reliable sequence number falls into
pub fn reliable_window(reliable_sequence_number: u16) -> u16 {
    reliable_sequence_number / RELIABLE_WINDOW_SIZE
}

/// Per-channel sequencing state of a peer.
///
/// The 16-bit reliable sequence space is split into [RELIABLE_WINDOWS] windows. On the sending
///  side, `reliable_windows` counts unacknowledged commands per window, and `used_reliable_windows`
///  has a bit set for every window with outstanding commands: a sender does not start a new window
///  while commands in the windows ahead of it are still unacknowledged, which bounds how much a
///  receiver has to buffer out of order. The receiver accepts sequence numbers within
///  [FREE_RELIABLE_WINDOWS] - 1 windows of the one it currently expects.
#[derive(Default)]
pub struct Channel {
    pub outgoing_reliable_sequence_number: u16,
    pub outgoing_unreliable_sequence_number: u16,
    pub used_reliable_windows: u16,
    pub reliable_windows: [u16; RELIABLE_WINDOWS as usize],
    pub incoming_reliable_sequence_number: u16,
    pub incoming_unreliable_sequence_number: u16,
    pub incoming_reliable_commands: VecDeque<IncomingCommand>,
    pub incoming_unreliable_commands: VecDeque<IncomingCommand>,
}

impl Channel {
    pub fn new() -> Channel {
        Default::default()
    }

    /// Checks if a received sequence number falls into the range of windows the receiver
    ///  accepts, relative to the next sequence number it expects. Sequence numbers 'behind'
    ///  the expected one are interpreted as having wrapped around.
    pub fn is_in_incoming_window(&self, reliable_sequence_number: u16) -> bool {
        let mut window = reliable_window(reliable_sequence_number);
        let current_window = reliable_window(self.incoming_reliable_sequence_number);

        if reliable_sequence_number < self.incoming_reliable_sequence_number {
            window += RELIABLE_WINDOWS;
        }

        window >= current_window && window < current_window + FREE_RELIABLE_WINDOWS - 1
    }

    /// Acknowledgements for sequence numbers in the windows just past the accepted range are
    ///  not sent: the remote peer cannot have sent them in the current round, so they are
    ///  stale duplicates from the previous trip around the sequence space.
    pub fn is_acknowledgement_suppressed(&self, reliable_sequence_number: u16) -> bool {
        let mut window = reliable_window(reliable_sequence_number);
        let current_window = reliable_window(self.incoming_reliable_sequence_number);

        if reliable_sequence_number < self.incoming_reliable_sequence_number {
            window += RELIABLE_WINDOWS;
        }

        window >= current_window + FREE_RELIABLE_WINDOWS - 1 && window <= current_window + FREE_RELIABLE_WINDOWS
    }

    /// A sender may not send a reliable command that starts a new window if that window is
    ///  still full from the previous round, or if any of the windows ahead of it still has
    ///  unacknowledged commands.
    pub fn is_window_wrapped(&self, reliable_sequence_number: u16) -> bool {
        if reliable_sequence_number % RELIABLE_WINDOW_SIZE != 0 {
            return false;
        }

        let window = reliable_window(reliable_sequence_number);
        if self.reliable_windows[((window + RELIABLE_WINDOWS - 1) % RELIABLE_WINDOWS) as usize] >= RELIABLE_WINDOW_SIZE {
            return true;
        }

        let free_mask: u32 = (1 << (FREE_RELIABLE_WINDOWS + 2)) - 1;
        let used = self.used_reliable_windows as u32;
        (((free_mask << window) | (free_mask >> (RELIABLE_WINDOWS - window))) & used) != 0
    }

    /// registers a reliable command being sent for the first time
    pub fn acquire_reliable_window(&mut self, reliable_sequence_number: u16) {
        let window = reliable_window(reliable_sequence_number);
        self.used_reliable_windows |= 1 << window;
        self.reliable_windows[window as usize] += 1;
    }

    /// releases a reliable command's window slot after it was acknowledged
    pub fn release_reliable_window(&mut self, reliable_sequence_number: u16) {
        let window = reliable_window(reliable_sequence_number);
        let count = &mut self.reliable_windows[window as usize];
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.used_reliable_windows &= !(1 << window);
        }
    }

    pub fn has_pending_incoming(&self) -> bool {
        !self.incoming_reliable_commands.is_empty() || !self.incoming_unreliable_commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn channel_expecting(incoming_reliable_sequence_number: u16) -> Channel {
        let mut channel = Channel::new();
        channel.incoming_reliable_sequence_number = incoming_reliable_sequence_number;
        channel
    }

    #[rstest]
    #[case::next(0, 1, true)]
    #[case::same_window(0, 4095, true)]
    #[case::last_accepted_window(0, 6 * 4096 + 4095, true)]
    #[case::first_rejected_window(0, 7 * 4096, false)]
    #[case::wrapped_into_window(65535, 0, true)]
    #[case::wrapped_just_past(65535, 1, true)]
    #[case::wrapped_far(65535, 6 * 4096, false)]
    #[case::behind_is_far_ahead(10 * 4096, 4096, false)]
    #[case::behind_in_same_window(10 * 4096 + 100, 10 * 4096 + 50, false)]
    fn test_is_in_incoming_window(#[case] incoming: u16, #[case] received: u16, #[case] expected: bool) {
        assert_eq!(channel_expecting(incoming).is_in_incoming_window(received), expected);
    }

    #[rstest]
    #[case::in_window(0, 100, false)]
    #[case::just_past(0, 7 * 4096, true)]
    #[case::two_past(0, 8 * 4096 + 5, true)]
    #[case::far_past(0, 9 * 4096, false)]
    #[case::wrapped(9 * 4096, 0, true)]
    fn test_is_acknowledgement_suppressed(#[case] incoming: u16, #[case] received: u16, #[case] expected: bool) {
        assert_eq!(channel_expecting(incoming).is_acknowledgement_suppressed(received), expected);
    }

    #[test]
    fn test_window_acquire_release() {
        let mut channel = Channel::new();
        channel.acquire_reliable_window(1);
        channel.acquire_reliable_window(2);
        channel.acquire_reliable_window(4096);
        assert_eq!(channel.used_reliable_windows, 0b11);
        assert_eq!(channel.reliable_windows[0], 2);

        channel.release_reliable_window(1);
        assert_eq!(channel.used_reliable_windows, 0b11);
        channel.release_reliable_window(2);
        assert_eq!(channel.used_reliable_windows, 0b10);
        channel.release_reliable_window(4096);
        assert_eq!(channel.used_reliable_windows, 0);

        // releasing an already released window does not underflow
        channel.release_reliable_window(4096);
        assert_eq!(channel.reliable_windows[1], 0);
    }

    #[test]
    fn test_window_wrapped_only_at_window_start() {
        let mut channel = Channel::new();
        for window in 0..RELIABLE_WINDOWS {
            channel.acquire_reliable_window(window * RELIABLE_WINDOW_SIZE);
        }
        assert!(!channel.is_window_wrapped(17));
        assert!(channel.is_window_wrapped(4096));
    }

    #[test]
    fn test_window_wrapped_by_outstanding_windows_ahead() {
        let mut channel = Channel::new();
        channel.acquire_reliable_window(0);
        assert!(!channel.is_window_wrapped(4096));

        // window 0 is 'ahead' of window 7 within the sequence space ring
        assert!(channel.is_window_wrapped(7 * 4096));
        assert!(!channel.is_window_wrapped(6 * 4096));

        channel.release_reliable_window(0);
        assert!(!channel.is_window_wrapped(7 * 4096));
    }

    #[test]
    fn test_window_wrapped_wraparound() {
        let mut channel = Channel::new();
        // commands outstanding in window 15 (sequence numbers near 65535)
        channel.acquire_reliable_window(65535);
        // starting window 0 after wrapping around is allowed: window 15 is behind it
        assert!(!channel.is_window_wrapped(0));

        // but window 15 is ahead of window 6 (with the free windows of the mask)
        assert!(channel.is_window_wrapped(6 * 4096));
    }

    #[test]
    fn test_full_previous_window_blocks() {
        let mut channel = Channel::new();
        channel.reliable_windows[0] = RELIABLE_WINDOW_SIZE;
        assert!(channel.is_window_wrapped(4096));
    }
}
