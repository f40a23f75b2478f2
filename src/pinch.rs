//! ```text
//!   Idle --d < close--> Pending --held >= min_dwell--> Active --d > open--> Releasing --> Idle
//!                          |                                                  (one frame)
//!                          +--d >= close before dwell (noise)--> Idle
//! ```

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::Profile;
use crate::event::{Button, PointerEvent, ReleaseKind};
use crate::frame::{HandObservation, Landmark, Point};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinchChannel {
    /// Thumb + index: click and drag.
    Primary,
    /// Thumb + middle: right click, taps only.
    Secondary,
    /// Index + middle held together: vertical scroll.
    Scroll,
}

impl PinchChannel {
    /// Also the output priority order within one frame.
    pub const ALL: [PinchChannel; 3] = [Self::Primary, Self::Secondary, Self::Scroll];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Scroll => "scroll",
        }
    }

    /// The two landmarks whose distance opens and closes the pinch.
    pub fn landmarks(&self) -> (Landmark, Landmark) {
        match self {
            Self::Primary => (Landmark::ThumbTip, Landmark::IndexTip),
            Self::Secondary => (Landmark::ThumbTip, Landmark::MiddleTip),
            Self::Scroll => (Landmark::IndexTip, Landmark::MiddleTip),
        }
    }

    /// Motion is read from the midpoint of these. The click channels use the
    /// index knuckle, which stays put while the fingertips close.
    pub fn tracked_landmarks(&self) -> (Landmark, Landmark) {
        match self {
            Self::Primary | Self::Secondary => (Landmark::IndexMcp, Landmark::IndexMcp),
            Self::Scroll => (Landmark::IndexTip, Landmark::MiddleTip),
        }
    }

    pub fn sample(&self, hand: &HandObservation) -> Option<ChannelSample> {
        let (a, b) = self.landmarks();
        let distance = hand.normalized_distance(a, b)?;
        let (p, q) = self.tracked_landmarks();
        let point = hand.point(p)?.midpoint(&hand.point(q)?);
        Some(ChannelSample { distance, point })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSample {
    /// Pinch distance in palm widths.
    pub distance: f32,
    pub point: Point,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Idle,
    Pending,
    Active,
    Releasing,
}

/// Below this a coasting scroll stops, in ticks per ms.
const MOMENTUM_FLOOR: f32 = 0.002;

#[derive(Debug, Clone, PartialEq)]
struct Contact {
    /// Pending entry; tap duration is measured from here.
    touched_ms: u64,
    last: Point,
    last_ms: u64,
    /// Left-press pointer freeze ends here.
    settle_until_ms: u64,
    /// Smoothed scroll rate, ticks per ms.
    velocity: f32,
    /// Accumulated tracked-point travel since activation.
    travel: f32,
    /// Became active while another channel held the frame: no output at all
    /// for this activation.
    muted: bool,
    // sub-unit leftovers carried between frames
    rem_x: f32,
    rem_y: f32,
}

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Idle,
    Pending { since_ms: u64 },
    Active(Contact),
    Releasing { release: ReleaseKind },
}

/// Scroll that keeps going after release and decays by half-life.
#[derive(Debug, Clone, PartialEq)]
struct Momentum {
    velocity: f32,
    last_ms: u64,
    rem: f32,
}

#[derive(Debug, Clone)]
pub struct PinchTracker {
    channel: PinchChannel,
    phase: Phase,
    phase_entered_ms: u64,
    /// Fixed at touch-down, cleared on release.
    anchor: Option<Point>,
    momentum: Option<Momentum>,
}

impl PinchTracker {
    pub fn new(channel: PinchChannel) -> Self {
        Self {
            channel,
            phase: Phase::Idle,
            phase_entered_ms: 0,
            anchor: None,
            momentum: None,
        }
    }

    pub fn channel(&self) -> PinchChannel {
        self.channel
    }

    pub fn phase(&self) -> PhaseKind {
        match self.phase {
            Phase::Idle => PhaseKind::Idle,
            Phase::Pending { .. } => PhaseKind::Pending,
            Phase::Active(_) => PhaseKind::Active,
            Phase::Releasing { .. } => PhaseKind::Releasing,
        }
    }

    pub fn phase_entered_ms(&self) -> u64 {
        self.phase_entered_ms
    }

    pub fn anchor(&self) -> Option<Point> {
        self.anchor
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, Phase::Active(_))
    }

    /// Drop straight to `Idle` without emitting anything. The caller is
    /// responsible for the `ReleaseAll` that covers whatever was held.
    pub fn force_idle(&mut self, t_ms: u64) {
        if !matches!(self.phase, Phase::Idle) {
            debug!("{}: forced idle from {:?}", self.channel.as_str(), self.phase());
        }
        self.momentum = None;
        self.enter(Phase::Idle, t_ms);
    }

    /// Advance one frame. `exclusive` is set when another channel owns the
    /// frame; effects are then withheld, but phases still advance.
    pub fn update(
        &mut self,
        t_ms: u64,
        sample: &ChannelSample,
        profile: &Profile,
        exclusive: bool,
    ) -> Vec<PointerEvent> {
        let mut out = Vec::new();
        let d = sample.distance;

        if matches!(self.phase, Phase::Releasing { .. }) {
            self.enter(Phase::Idle, t_ms);
        }

        if matches!(self.phase, Phase::Idle) {
            if d < profile.close_threshold {
                if self.momentum.take().is_some() {
                    debug!("{}: momentum caught", self.channel.as_str());
                }
                self.enter(Phase::Pending { since_ms: t_ms }, t_ms);
            } else {
                self.coast(t_ms, profile, &mut out);
            }
        }

        if let Phase::Pending { since_ms } = self.phase {
            if d >= profile.close_threshold {
                debug!(
                    "{}: reopened after {} ms, ignored",
                    self.channel.as_str(),
                    t_ms - since_ms
                );
                self.enter(Phase::Idle, t_ms);
            } else if t_ms - since_ms >= profile.min_dwell_ms {
                self.activate(t_ms, since_ms, sample.point, profile, exclusive, &mut out);
            }
            return out;
        }

        if matches!(self.phase, Phase::Active(_)) {
            if d > profile.open_threshold {
                self.release(t_ms, profile, &mut out);
            } else {
                self.track(t_ms, sample.point, profile, exclusive, &mut out);
            }
        }
        out
    }

    fn enter(&mut self, phase: Phase, t_ms: u64) {
        if matches!(phase, Phase::Idle) {
            self.anchor = None;
        }
        self.phase = phase;
        self.phase_entered_ms = t_ms;
    }

    fn activate(
        &mut self,
        t_ms: u64,
        touched_ms: u64,
        point: Point,
        profile: &Profile,
        exclusive: bool,
        out: &mut Vec<PointerEvent>,
    ) {
        debug!(
            "{}: active at t={t_ms}{}",
            self.channel.as_str(),
            if exclusive { " (muted)" } else { "" }
        );
        self.enter(
            Phase::Active(Contact {
                touched_ms,
                last: point,
                last_ms: t_ms,
                settle_until_ms: t_ms + profile.click_settle_ms,
                velocity: 0.0,
                travel: 0.0,
                muted: exclusive,
                rem_x: 0.0,
                rem_y: 0.0,
            }),
            t_ms,
        );
        self.anchor = Some(point);

        // right click is only decided on release, scroll has no button
        if self.channel == PinchChannel::Primary && !exclusive {
            out.push(PointerEvent::ButtonDown {
                button: Button::Left,
            });
        }
    }

    fn track(
        &mut self,
        t_ms: u64,
        point: Point,
        profile: &Profile,
        exclusive: bool,
        out: &mut Vec<PointerEvent>,
    ) {
        let channel = self.channel;
        let Phase::Active(c) = &mut self.phase else {
            return;
        };
        let dx = point.x - c.last.x;
        let dy = point.y - c.last.y;
        let dt = t_ms.saturating_sub(c.last_ms);
        c.last = point;
        c.last_ms = t_ms;
        c.travel += (dx * dx + dy * dy).sqrt();

        match channel {
            PinchChannel::Primary => {
                if c.muted || exclusive || t_ms < c.settle_until_ms {
                    c.rem_x = 0.0;
                    c.rem_y = 0.0;
                    return;
                }
                c.rem_x += dx * profile.move_sensitivity;
                c.rem_y += dy * profile.move_sensitivity;
                let (mx, my) = (c.rem_x.trunc(), c.rem_y.trunc());
                c.rem_x -= mx;
                c.rem_y -= my;
                if mx != 0.0 || my != 0.0 {
                    out.push(PointerEvent::Move {
                        dx: mx as i32,
                        dy: my as i32,
                    });
                }
            }
            PinchChannel::Secondary => {}
            PinchChannel::Scroll => {
                // camera y grows downward; raising the hand scrolls up
                let sign = if profile.invert_scroll { 1.0 } else { -1.0 };
                let delta = sign * dy * profile.scroll_sensitivity;
                if dt > 0 {
                    c.velocity = 0.5 * c.velocity + 0.5 * delta / dt as f32;
                }
                c.rem_y += delta;
                let ticks = c.rem_y.trunc();
                c.rem_y -= ticks;
                if ticks != 0.0 {
                    out.push(PointerEvent::Scroll { dy: ticks as i32 });
                }
            }
        }
    }

    fn release(&mut self, t_ms: u64, profile: &Profile, out: &mut Vec<PointerEvent>) {
        let Phase::Active(c) = &self.phase else {
            return;
        };
        let held_ms = t_ms - c.touched_ms;
        let tap_length = held_ms <= profile.tap_max_ms;
        let release = if tap_length && c.travel <= profile.tap_move_tol {
            ReleaseKind::Tap
        } else {
            ReleaseKind::Drag
        };
        debug!(
            "{}: released after {held_ms} ms, travel {:.4} -> {release:?}",
            self.channel.as_str(),
            c.travel
        );

        if !c.muted {
            match self.channel {
                PinchChannel::Primary => out.push(PointerEvent::ButtonUp {
                    button: Button::Left,
                    release,
                }),
                // no right-drag: long holds release silently
                PinchChannel::Secondary if tap_length => {
                    out.push(PointerEvent::ButtonDown {
                        button: Button::Right,
                    });
                    out.push(PointerEvent::ButtonUp {
                        button: Button::Right,
                        release: ReleaseKind::Tap,
                    });
                }
                PinchChannel::Scroll => {
                    if profile.scroll_half_life_ms > 0 && c.velocity.abs() >= MOMENTUM_FLOOR {
                        debug!("scroll: coasting at {:.1} ticks/s", c.velocity * 1000.0);
                        self.momentum = Some(Momentum {
                            velocity: c.velocity,
                            last_ms: t_ms,
                            rem: 0.0,
                        });
                    }
                }
                PinchChannel::Secondary => {}
            }
        }
        self.enter(Phase::Releasing { release }, t_ms);
    }

    /// Integrates the decaying scroll rate over the time since the last step.
    fn coast(&mut self, t_ms: u64, profile: &Profile, out: &mut Vec<PointerEvent>) {
        let Some(m) = self.momentum.as_mut() else {
            return;
        };
        let dt = t_ms.saturating_sub(m.last_ms) as f32;
        let half = profile.scroll_half_life_ms.max(1) as f32;
        let decay = 0.5f32.powf(dt / half);
        // exact area under v * 0.5^(t / half) between the two steps
        m.rem += m.velocity * (1.0 - decay) * half / std::f32::consts::LN_2;
        m.velocity *= decay;
        m.last_ms = t_ms;

        let ticks = m.rem.trunc();
        m.rem -= ticks;
        if ticks != 0.0 {
            out.push(PointerEvent::Scroll { dy: ticks as i32 });
        }
        if m.velocity.abs() < MOMENTUM_FLOOR {
            self.momentum = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn profile() -> Profile {
        Profile {
            close_threshold: 0.3,
            open_threshold: 0.45,
            min_dwell_ms: 50,
            tap_max_ms: 150,
            tap_move_tol: 0.02,
            click_settle_ms: 0,
            ..Profile::default()
        }
    }

    fn at(d: f32) -> ChannelSample {
        ChannelSample {
            distance: d,
            point: Point::new(0.5, 0.5),
        }
    }

    fn moved(d: f32, x: f32, y: f32) -> ChannelSample {
        ChannelSample {
            distance: d,
            point: Point::new(x, y),
        }
    }

    /// Drives the tracker through (t_ms, sample) pairs and concatenates output.
    fn drive(
        tr: &mut PinchTracker,
        p: &Profile,
        steps: &[(u64, ChannelSample)],
    ) -> Vec<PointerEvent> {
        steps
            .iter()
            .flat_map(|(t, s)| tr.update(*t, s, p, false))
            .collect()
    }

    #[test]
    fn full_cycle_emits_down_then_up() {
        let p = profile();
        let mut tr = PinchTracker::new(PinchChannel::Primary);
        assert!(tr.update(0, &at(0.2), &p, false).is_empty());
        assert_eq!(tr.phase(), PhaseKind::Pending);

        let ev = tr.update(50, &at(0.2), &p, false);
        assert_eq!(
            ev,
            vec![PointerEvent::ButtonDown {
                button: Button::Left
            }]
        );
        assert_eq!(tr.phase(), PhaseKind::Active);
        assert_eq!(tr.anchor(), Some(Point::new(0.5, 0.5)));

        let ev = tr.update(100, &at(0.6), &p, false);
        assert_eq!(
            ev,
            vec![PointerEvent::ButtonUp {
                button: Button::Left,
                release: ReleaseKind::Tap
            }]
        );
        assert_eq!(tr.phase(), PhaseKind::Releasing);

        assert!(tr.update(116, &at(0.6), &p, false).is_empty());
        assert_eq!(tr.phase(), PhaseKind::Idle);
        assert_eq!(tr.anchor(), None);
    }

    #[test]
    fn short_pinch_is_rejected_by_dwell() {
        let p = profile();
        let mut tr = PinchTracker::new(PinchChannel::Primary);
        let ev = drive(
            &mut tr,
            &p,
            &[(0, at(0.2)), (16, at(0.2)), (32, at(0.2)), (48, at(0.35))],
        );
        assert!(ev.is_empty());
        assert_eq!(tr.phase(), PhaseKind::Idle);
    }

    #[test]
    fn dead_zone_never_toggles() {
        let p = profile();
        let mut tr = PinchTracker::new(PinchChannel::Primary);
        let band: Vec<(u64, ChannelSample)> = (0..50)
            .map(|i| (i * 16, at(if i % 2 == 0 { 0.31 } else { 0.44 })))
            .collect();
        assert!(drive(&mut tr, &p, &band).is_empty());
        assert_eq!(tr.phase(), PhaseKind::Idle);

        // once active, the same band keeps it active
        drive(&mut tr, &p, &[(1000, at(0.1)), (1100, at(0.1))]);
        assert!(tr.is_active());
        let band: Vec<(u64, ChannelSample)> = (0..50)
            .map(|i| (1200 + i * 16, at(if i % 2 == 0 { 0.31 } else { 0.44 })))
            .collect();
        assert!(drive(&mut tr, &p, &band).is_empty());
        assert!(tr.is_active());
    }

    #[test]
    fn tap_boundary_is_inclusive() {
        let p = profile();
        for (release_at, expected) in [(150, ReleaseKind::Tap), (151, ReleaseKind::Drag)] {
            let mut tr = PinchTracker::new(PinchChannel::Primary);
            let ev = drive(
                &mut tr,
                &p,
                &[(0, at(0.2)), (50, at(0.2)), (release_at, at(0.6))],
            );
            assert_eq!(
                ev.last(),
                Some(&PointerEvent::ButtonUp {
                    button: Button::Left,
                    release: expected
                }),
                "release at {release_at}"
            );
        }
    }

    #[test]
    fn movement_turns_a_short_press_into_a_drag() {
        let p = profile();
        let mut tr = PinchTracker::new(PinchChannel::Primary);
        let ev = drive(
            &mut tr,
            &p,
            &[
                (0, at(0.2)),
                (50, moved(0.2, 0.5, 0.5)),
                (66, moved(0.2, 0.55, 0.5)),
                (82, moved(0.6, 0.55, 0.5)),
            ],
        );
        assert!(ev.contains(&PointerEvent::ButtonUp {
            button: Button::Left,
            release: ReleaseKind::Drag
        }));
    }

    #[test]
    fn moves_are_frame_deltas_with_remainder() {
        let mut p = profile();
        p.move_sensitivity = 96.0;
        let mut tr = PinchTracker::new(PinchChannel::Primary);
        drive(&mut tr, &p, &[(0, at(0.2)), (50, moved(0.2, 0.5, 0.5))]);

        // 1/64 of the frame is 1.5 px
        let ev = tr.update(66, &moved(0.2, 0.515625, 0.5), &p, false);
        assert_eq!(ev, vec![PointerEvent::Move { dx: 1, dy: 0 }]);
        // the carried half pixel joins the next delta
        let ev = tr.update(82, &moved(0.2, 0.53125, 0.5), &p, false);
        assert_eq!(ev, vec![PointerEvent::Move { dx: 2, dy: 0 }]);
        // anchor stays where the touch started
        assert_eq!(tr.anchor(), Some(Point::new(0.5, 0.5)));
    }

    #[test]
    fn secondary_clicks_only_on_taps() {
        let p = profile();
        let mut tr = PinchTracker::new(PinchChannel::Secondary);
        let ev = drive(&mut tr, &p, &[(0, at(0.2)), (50, at(0.2)), (120, at(0.6))]);
        assert_eq!(
            ev,
            vec![
                PointerEvent::ButtonDown {
                    button: Button::Right
                },
                PointerEvent::ButtonUp {
                    button: Button::Right,
                    release: ReleaseKind::Tap
                },
            ]
        );

        let mut tr = PinchTracker::new(PinchChannel::Secondary);
        let ev = drive(&mut tr, &p, &[(0, at(0.2)), (50, at(0.2)), (400, at(0.6))]);
        assert!(ev.is_empty());
        assert_eq!(tr.phase(), PhaseKind::Releasing);
    }

    #[test]
    fn scroll_emits_ticks_from_vertical_motion() {
        let mut p = profile();
        p.scroll_sensitivity = 96.0;
        let mut tr = PinchTracker::new(PinchChannel::Scroll);
        let ev = drive(
            &mut tr,
            &p,
            &[
                (0, at(0.2)),
                (50, moved(0.2, 0.5, 0.5)),
                (66, moved(0.2, 0.5, 0.46875)),
                (82, moved(0.2, 0.5, 0.5)),
                (98, moved(0.6, 0.5, 0.5)),
            ],
        );
        assert_eq!(
            ev,
            vec![PointerEvent::Scroll { dy: 3 }, PointerEvent::Scroll { dy: -3 }]
        );
    }

    #[test]
    fn muted_activation_emits_nothing() {
        let p = profile();
        let mut tr = PinchTracker::new(PinchChannel::Primary);
        assert!(tr.update(0, &at(0.2), &p, true).is_empty());
        assert!(tr.update(50, &at(0.2), &p, true).is_empty());
        assert!(tr.is_active());
        // the other channel let go, but this activation stays silent
        assert!(tr.update(66, &moved(0.2, 0.6, 0.6), &p, false).is_empty());
        assert!(tr.update(82, &at(0.6), &p, false).is_empty());
    }

    #[test]
    fn force_idle_clears_anchor() {
        let p = profile();
        let mut tr = PinchTracker::new(PinchChannel::Primary);
        drive(&mut tr, &p, &[(0, at(0.2)), (50, at(0.2))]);
        tr.force_idle(60);
        assert_eq!(tr.phase(), PhaseKind::Idle);
        assert_eq!(tr.anchor(), None);
        assert_eq!(tr.phase_entered_ms(), 60);
    }

    #[test]
    fn pointer_settles_after_a_press() {
        let mut p = profile();
        p.click_settle_ms = 60;
        p.move_sensitivity = 64.0;
        let mut tr = PinchTracker::new(PinchChannel::Primary);
        drive(&mut tr, &p, &[(0, at(0.2)), (50, moved(0.2, 0.5, 0.5))]);

        assert!(tr.update(66, &moved(0.2, 0.5625, 0.5), &p, false).is_empty());
        let ev = tr.update(120, &moved(0.2, 0.625, 0.5), &p, false);
        assert_eq!(ev, vec![PointerEvent::Move { dx: 4, dy: 0 }]);
    }

    fn flick(tr: &mut PinchTracker, p: &Profile) -> Vec<PointerEvent> {
        drive(
            tr,
            p,
            &[
                (0, at(0.2)),
                (50, moved(0.2, 0.5, 0.5)),
                (66, moved(0.2, 0.5, 0.46875)),
                (82, moved(0.2, 0.5, 0.4375)),
                (98, at(0.6)),
            ],
        )
    }

    fn scroll_total(ev: &[PointerEvent]) -> i32 {
        ev.iter()
            .map(|e| match e {
                PointerEvent::Scroll { dy } => *dy,
                other => panic!("unexpected {other:?}"),
            })
            .sum()
    }

    #[test]
    fn scroll_coasts_after_release_and_stops() {
        let mut p = profile();
        p.scroll_sensitivity = 96.0;
        p.scroll_half_life_ms = 320;
        let mut tr = PinchTracker::new(PinchChannel::Scroll);
        assert_eq!(scroll_total(&flick(&mut tr, &p)), 6);

        let steps: Vec<(u64, ChannelSample)> = (1..250).map(|i| (98 + i * 16, at(0.6))).collect();
        let coast: Vec<Vec<PointerEvent>> =
            steps.iter().map(|(t, s)| tr.update(*t, s, &p, false)).collect();

        let first = scroll_total(&coast[0]);
        assert!((1..=3).contains(&first), "{first}");
        let total = scroll_total(&coast.concat());
        assert!((55..=65).contains(&total), "{total}");
        // decayed below the floor well before the end
        assert!(coast[200..].iter().all(|e| e.is_empty()));
    }

    #[test]
    fn pinching_again_catches_the_momentum() {
        let mut p = profile();
        p.scroll_sensitivity = 96.0;
        p.scroll_half_life_ms = 320;
        let mut tr = PinchTracker::new(PinchChannel::Scroll);
        flick(&mut tr, &p);
        let ev = drive(&mut tr, &p, &[(114, at(0.2)), (130, at(0.6)), (146, at(0.6))]);
        assert!(ev.is_empty(), "{ev:?}");
    }

    #[test]
    fn zero_half_life_disables_momentum() {
        let mut p = profile();
        p.scroll_sensitivity = 96.0;
        p.scroll_half_life_ms = 0;
        let mut tr = PinchTracker::new(PinchChannel::Scroll);
        flick(&mut tr, &p);
        let steps: Vec<(u64, ChannelSample)> = (1..20).map(|i| (98 + i * 16, at(0.6))).collect();
        assert!(drive(&mut tr, &p, &steps).is_empty());
    }

    fn in_band() -> impl Strategy<Value = Vec<(u64, f32)>> {
        prop::collection::vec((1u64..60, 0.301f32..0.449), 1..120)
    }

    proptest! {
        #[test]
        fn dead_zone_is_silent_on_every_channel(band in in_band()) {
            let p = profile();
            for channel in PinchChannel::ALL {
                // from rest the band never closes the pinch
                let mut tr = PinchTracker::new(channel);
                let mut t = 0;
                for (dt, d) in &band {
                    t += dt;
                    prop_assert!(tr.update(t, &at(*d), &p, false).is_empty());
                }
                prop_assert_eq!(tr.phase(), PhaseKind::Idle);

                // once down, the band never opens it
                let mut tr = PinchTracker::new(channel);
                let pressed = drive(&mut tr, &p, &[(0, at(0.1)), (50, at(0.1))]);
                prop_assert!(tr.is_active());
                let mut t = 50;
                for (dt, d) in &band {
                    t += dt;
                    prop_assert!(tr.update(t, &at(*d), &p, false).is_empty());
                }
                prop_assert!(tr.is_active());
                prop_assert!(pressed.len() <= 1);
            }
        }
    }
}
