use log::{debug, warn};

use crate::config::Profile;
use crate::frame::{HandObservation, Landmark};

/// All four fingertips within `radius` palm widths of the palm center.
pub fn is_fist(hand: &HandObservation, radius: f32) -> bool {
    let (Some(center), Some(width)) = (hand.palm_center(), hand.palm_width()) else {
        return false;
    };
    Landmark::FIST_TIPS.iter().all(|tip| {
        hand.point(*tip)
            .is_some_and(|p| p.distance(&center) / width <= radius)
    })
}

#[derive(Debug, Clone, Default)]
pub struct PanicMonitor {
    clenched_since: Option<u64>,
    // fired for the current clench episode
    fired: bool,
}

impl PanicMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_clenched(&self) -> bool {
        self.clenched_since.is_some()
    }

    /// How long the current clench has been held, for overlay feedback.
    pub fn held_ms(&self, t_ms: u64) -> u64 {
        self.clenched_since
            .map(|since| t_ms.saturating_sub(since))
            .unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.clenched_since = None;
        self.fired = false;
    }

    /// Feed one frame's predicate. Returns `true` exactly once per clench
    /// episode, on the first frame the hold reaches `panic_hold_ms`.
    pub fn update(&mut self, t_ms: u64, clenched: bool, profile: &Profile) -> bool {
        if !clenched {
            if self.clenched_since.is_some() {
                debug!("panic: clench released after {} ms", self.held_ms(t_ms));
            }
            self.reset();
            return false;
        }

        let since = *self.clenched_since.get_or_insert(t_ms);
        if !self.fired && t_ms - since >= profile.panic_hold_ms {
            self.fired = true;
            warn!("panic gesture held for {} ms", t_ms - since);
            return true;
        }
        false
    }

    /// Convenience over [`update`](Self::update) for an optional tracked hand.
    pub fn observe(&mut self, t_ms: u64, hand: Option<&HandObservation>, profile: &Profile) -> bool {
        let clenched = hand.is_some_and(|h| is_fist(h, profile.fist_radius));
        self.update(t_ms, clenched, profile)
    }
}
