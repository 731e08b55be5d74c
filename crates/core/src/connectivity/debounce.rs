use std::time::Duration;

use tokio::time::Instant;

/// Holds a boolean signal steady until a change has persisted for `window`.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    stable: bool,
    candidate: Option<(bool, Instant)>,
}

impl Debouncer {
    pub fn new(initial: bool, window: Duration) -> Self {
        Self {
            window,
            stable: initial,
            candidate: None,
        }
    }

    pub fn stable(&self) -> bool {
        self.stable
    }

    /// Feed a raw observation. Returns when the change may settle, if the
    /// observation differs from the stable value.
    pub fn observe(&mut self, value: bool, now: Instant) -> Option<Instant> {
        if value == self.stable {
            self.candidate = None;
            return None;
        }
        match self.candidate {
            Some((pending, _)) if pending == value => {}
            _ => self.candidate = Some((value, now)),
        }
        self.deadline()
    }

    /// Promote the pending value once its window has elapsed. Returns the new
    /// stable value on a transition.
    pub fn settle(&mut self, now: Instant) -> Option<bool> {
        let (value, since) = self.candidate?;
        if now.saturating_duration_since(since) < self.window {
            return None;
        }
        self.candidate = None;
        self.stable = value;
        Some(value)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.candidate.map(|(_, since)| since + self.window)
    }
}
