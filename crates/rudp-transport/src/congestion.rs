//! # Window Adaptation
//!
//! Additive-increase / multiplicative-decrease on a segment-count window,
//! evaluated once per tick:
//!
//! ```text
//!   no timeouts this tick   →  sender_window = min(sender_window + 1, receiver_window)
//!   ≥1 timeout this tick    →  sender_window = max(1, sender_window / 2)
//! ```
//!
//! Invariant: `1 <= sender_window <= receiver_window` at all times.

/// Outcome of a tick's window evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowChange {
    Grew,
    Shrank,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct WindowController {
    sender_window: u16,
    receiver_window: u16,
}

impl WindowController {
    /// Both windows start at `initial` (clamped to at least 1).
    pub fn new(initial: u16) -> Self {
        let initial = initial.max(1);
        WindowController {
            sender_window: initial,
            receiver_window: initial,
        }
    }

    /// Apply one tick's timeout count.
    pub fn on_tick(&mut self, timeouts: usize) -> WindowChange {
        let before = self.sender_window;
        if timeouts == 0 {
            self.sender_window = self
                .sender_window
                .saturating_add(1)
                .min(self.receiver_window);
        } else {
            self.sender_window = (self.sender_window / 2).max(1);
        }

        match self.sender_window.cmp(&before) {
            std::cmp::Ordering::Greater => WindowChange::Grew,
            std::cmp::Ordering::Less => WindowChange::Shrank,
            std::cmp::Ordering::Equal => WindowChange::Unchanged,
        }
    }

    /// Record the window the peer advertised in its latest ack.
    pub fn set_receiver_window(&mut self, advertised: u16) {
        self.receiver_window = advertised.max(1);
        self.sender_window = self.sender_window.min(self.receiver_window);
    }

    pub fn sender_window(&self) -> u16 {
        self.sender_window
    }

    pub fn receiver_window(&self) -> u16 {
        self.receiver_window
    }

    /// How many more segments may be released given `in_flight` outstanding.
    pub fn release_budget(&self, in_flight: usize) -> usize {
        (self.sender_window as usize).saturating_sub(in_flight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn grows_by_one_up_to_receiver_window() {
        let mut w = WindowController::new(8);
        w.on_tick(1);
        assert_eq!(w.sender_window(), 4);
        for expected in 5..=8 {
            assert_eq!(w.on_tick(0), WindowChange::Grew);
            assert_eq!(w.sender_window(), expected);
        }
        assert_eq!(w.on_tick(0), WindowChange::Unchanged);
        assert_eq!(w.sender_window(), 8);
    }

    #[test]
    fn halves_once_per_tick_regardless_of_count() {
        let mut w = WindowController::new(8);
        assert_eq!(w.on_tick(5), WindowChange::Shrank);
        assert_eq!(w.sender_window(), 4);
    }

    #[test]
    fn never_below_one() {
        let mut w = WindowController::new(2);
        w.on_tick(1);
        w.on_tick(1);
        w.on_tick(1);
        assert_eq!(w.sender_window(), 1);
    }

    #[test]
    fn smaller_advertised_window_clamps_sender() {
        let mut w = WindowController::new(8);
        w.set_receiver_window(3);
        assert_eq!(w.sender_window(), 3);
        w.set_receiver_window(0);
        assert_eq!(w.receiver_window(), 1);
        assert_eq!(w.sender_window(), 1);
    }

    #[test]
    fn larger_advertised_window_allows_growth() {
        let mut w = WindowController::new(8);
        w.set_receiver_window(10);
        w.on_tick(0);
        w.on_tick(0);
        w.on_tick(0);
        assert_eq!(w.sender_window(), 10);
    }

    #[test]
    fn release_budget_accounts_for_in_flight() {
        let w = WindowController::new(8);
        assert_eq!(w.release_budget(3), 5);
        assert_eq!(w.release_budget(12), 0);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Tick(usize),
        Advertise(u16),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0usize..4).prop_map(Step::Tick),
            any::<u16>().prop_map(Step::Advertise),
        ]
    }

    proptest! {
        #[test]
        fn proptest_window_bounds(initial in 1u16..64, steps in proptest::collection::vec(step(), 0..200)) {
            let mut w = WindowController::new(initial);
            for s in steps {
                match s {
                    Step::Tick(n) => { w.on_tick(n); }
                    Step::Advertise(a) => w.set_receiver_window(a),
                }
                prop_assert!(w.sender_window() >= 1);
                prop_assert!(w.sender_window() <= w.receiver_window());
            }
        }
    }
}
