// Precedence per frame:
//   1. panic (sustained fist)      -> ReleaseAll + SafeOff
//   2. tracking lost past grace    -> ReleaseAll + SafeOff
//   3. pinch channels (scroll first, then primary/secondary)
// SafeOff is sticky; only `reengage` leaves it.

use log::{debug, info, warn};
use serde::Serialize;

use crate::conditioner::SignalConditioner;
use crate::config::{Profile, ProfileName};
use crate::error::FailSafeReason;
use crate::event::{ButtonState, PointerEvent};
use crate::frame::{Frame, Point};
use crate::panic::PanicMonitor;
use crate::pinch::{PhaseKind, PinchChannel, PinchTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemMode {
    Running,
    SafeOff,
}

/// Read-only view for the overlay renderer and `status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlaySnapshot {
    pub t_ms: u64,
    pub mode: SystemMode,
    pub reason: Option<FailSafeReason>,
    pub profile: ProfileName,
    pub channels: Vec<ChannelSnapshot>,
    pub buttons: ButtonState,
    /// 0.0 ..= 1.0 progress toward the panic hold.
    pub panic_arming: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSnapshot {
    pub channel: PinchChannel,
    pub phase: PhaseKind,
    pub since_ms: u64,
    pub anchor: Option<Point>,
}

const PRIMARY: usize = 0;
const SECONDARY: usize = 1;
const SCROLL: usize = 2;

#[derive(Debug, Clone)]
pub struct GestureStateMachine {
    profile: Profile,
    conditioner: SignalConditioner,
    trackers: [PinchTracker; 3],
    panic: PanicMonitor,
    mode: SystemMode,
    reason: Option<FailSafeReason>,
    buttons: ButtonState,
    // last frame with a usable hand; None until one is seen after start/re-engage
    last_track_ms: Option<u64>,
    now_ms: u64,
}

impl GestureStateMachine {
    pub fn new(profile: Profile) -> Self {
        Self {
            conditioner: SignalConditioner::new(&profile),
            trackers: PinchChannel::ALL.map(PinchTracker::new),
            panic: PanicMonitor::new(),
            mode: SystemMode::Running,
            reason: None,
            buttons: ButtonState::default(),
            last_track_ms: None,
            now_ms: 0,
            profile,
        }
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn mode(&self) -> SystemMode {
        self.mode
    }

    pub fn reason(&self) -> Option<FailSafeReason> {
        self.reason
    }

    pub fn buttons(&self) -> ButtonState {
        self.buttons
    }

    pub fn tracker(&self, channel: PinchChannel) -> &PinchTracker {
        &self.trackers[Self::slot(channel)]
    }

    fn slot(channel: PinchChannel) -> usize {
        match channel {
            PinchChannel::Primary => PRIMARY,
            PinchChannel::Secondary => SECONDARY,
            PinchChannel::Scroll => SCROLL,
        }
    }

    /// Process one frame. Never fails: an invalid frame is dropped and counts
    /// as a frame without a hand.
    pub fn step(&mut self, frame: &Frame) -> Vec<PointerEvent> {
        let t = frame.t_ms;
        self.now_ms = self.now_ms.max(t);

        let hand = match self.conditioner.condition(frame) {
            Ok(c) => c.hand,
            Err(e) => {
                debug!("t={t} frame discarded: {e}");
                None
            }
        };

        if self.mode == SystemMode::SafeOff {
            return Vec::new();
        }

        if self.panic.observe(t, hand.as_ref(), &self.profile) {
            return self.fail_safe(FailSafeReason::Panic, t);
        }

        let Some(hand) = hand else {
            return self.on_no_track(t);
        };
        self.last_track_ms = Some(t);

        // fingertips bunch up in a fist; hold the channels while it arms
        if self.panic.is_clenched() {
            return Vec::new();
        }

        let mut samples = PinchChannel::ALL.map(|c| c.sample(&hand));
        let mut per_channel: [Vec<PointerEvent>; 3] = Default::default();

        // scroll decides exclusivity for the click channels in this frame
        if let Some(s) = samples[SCROLL].take() {
            per_channel[SCROLL] = self.trackers[SCROLL].update(t, &s, &self.profile, false);
        }
        let exclusive = self.trackers[SCROLL].is_active();
        for i in [PRIMARY, SECONDARY] {
            if let Some(s) = samples[i].take() {
                per_channel[i] = self.trackers[i].update(t, &s, &self.profile, exclusive);
            }
        }

        let out: Vec<PointerEvent> = per_channel.into_iter().flatten().collect();
        for ev in &out {
            self.buttons.apply(ev);
        }
        out
    }

    /// Checks the tracking-loss clock when no frame arrived. Touches nothing
    /// else: smoothing, the panic hold and the channels are left as they are.
    pub fn tick(&mut self, t_ms: u64) -> Vec<PointerEvent> {
        self.now_ms = self.now_ms.max(t_ms);
        if self.mode == SystemMode::SafeOff {
            return Vec::new();
        }
        match self.last_track_ms {
            Some(last) if t_ms.saturating_sub(last) > self.profile.lost_grace_ms => {
                self.fail_safe(FailSafeReason::TrackingLost, t_ms)
            }
            _ => Vec::new(),
        }
    }

    fn on_no_track(&mut self, t: u64) -> Vec<PointerEvent> {
        let Some(last) = self.last_track_ms else {
            // nothing was ever engaged, so nothing to lose
            return Vec::new();
        };
        let gap = t.saturating_sub(last);
        if gap > self.profile.lost_grace_ms {
            return self.fail_safe(FailSafeReason::TrackingLost, t);
        }
        debug!("t={t} no hand for {gap} ms, holding");
        Vec::new()
    }

    /// Release everything and enter `SafeOff`. Idempotent: a second trigger
    /// while already off emits nothing.
    pub fn fail_safe(&mut self, reason: FailSafeReason, t_ms: u64) -> Vec<PointerEvent> {
        self.now_ms = self.now_ms.max(t_ms);
        if self.mode == SystemMode::SafeOff {
            debug!("fail-safe ({}) while already off", reason.as_str());
            return Vec::new();
        }
        warn!(
            "fail-safe at t={t_ms}: {} (buttons left={} right={})",
            reason.as_str(),
            self.buttons.left,
            self.buttons.right
        );
        for tr in &mut self.trackers {
            tr.force_idle(t_ms);
        }
        self.panic.reset();
        self.buttons = ButtonState::default();
        self.last_track_ms = None;
        self.mode = SystemMode::SafeOff;
        self.reason = Some(reason);
        vec![PointerEvent::ReleaseAll]
    }

    /// Leave `SafeOff` with every channel idle and no smoothing history.
    pub fn reengage(&mut self, t_ms: u64) {
        self.now_ms = self.now_ms.max(t_ms);
        if self.mode == SystemMode::Running {
            return;
        }
        info!(
            "re-engaged at t={t_ms} after {}",
            self.reason.map(|r| r.as_str()).unwrap_or("unknown")
        );
        for tr in &mut self.trackers {
            tr.force_idle(t_ms);
        }
        self.conditioner.reset();
        self.panic.reset();
        self.last_track_ms = None;
        self.mode = SystemMode::Running;
        self.reason = None;
    }

    /// Swap thresholds. Anything held is released first so no press
    /// straddles two profiles.
    pub fn set_profile(&mut self, profile: Profile, t_ms: u64) -> Vec<PointerEvent> {
        self.now_ms = self.now_ms.max(t_ms);
        let mut out = Vec::new();
        if self.buttons.any() {
            out.push(PointerEvent::ReleaseAll);
            self.buttons = ButtonState::default();
        }
        for tr in &mut self.trackers {
            tr.force_idle(t_ms);
        }
        self.conditioner.reconfigure(&profile);
        self.panic.reset();
        info!("profile switched to {}", profile.name);
        self.profile = profile;
        out
    }

    pub fn snapshot(&self) -> OverlaySnapshot {
        let held = self.panic.held_ms(self.now_ms) as f32;
        OverlaySnapshot {
            t_ms: self.now_ms,
            mode: self.mode,
            reason: self.reason,
            profile: self.profile.name,
            channels: self
                .trackers
                .iter()
                .map(|tr| ChannelSnapshot {
                    channel: tr.channel(),
                    phase: tr.phase(),
                    since_ms: tr.phase_entered_ms(),
                    anchor: tr.anchor(),
                })
                .collect(),
            buttons: self.buttons,
            panic_arming: (held / self.profile.panic_hold_ms as f32).min(1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Button, ReleaseKind};
    use crate::frame::fixtures::HandPose;
    use proptest::prelude::*;

    // unsmoothed so frame timings are exact
    fn profile() -> Profile {
        Profile {
            smoothing_factor: 1.0,
            click_settle_ms: 0,
            ..Profile::default()
        }
    }

    fn open() -> HandPose {
        HandPose::default()
    }

    fn pinched() -> HandPose {
        HandPose::default().index_pinch(0.1)
    }

    fn run(gsm: &mut GestureStateMachine, frames: &[Frame]) -> Vec<PointerEvent> {
        frames.iter().flat_map(|f| gsm.step(f)).collect()
    }

    const LEFT_DOWN: PointerEvent = PointerEvent::ButtonDown {
        button: Button::Left,
    };

    #[test]
    fn tap_through_the_machine() {
        let mut gsm = GestureStateMachine::new(profile());
        let ev = run(
            &mut gsm,
            &[pinched().frame(0), pinched().frame(50), open().frame(100)],
        );
        assert_eq!(
            ev,
            vec![
                LEFT_DOWN,
                PointerEvent::ButtonUp {
                    button: Button::Left,
                    release: ReleaseKind::Tap
                }
            ]
        );
        assert!(!gsm.buttons().any());
    }

    #[test]
    fn drag_moves_the_pointer() {
        let mut gsm = GestureStateMachine::new(profile());
        let ev = run(
            &mut gsm,
            &[
                pinched().frame(0),
                pinched().frame(50),
                pinched().at(0.55, 0.5).frame(66),
                pinched().at(0.6, 0.5).frame(82),
                open().at(0.6, 0.5).frame(300),
            ],
        );
        assert_eq!(ev.first(), Some(&LEFT_DOWN));
        assert!(
            ev.iter()
                .any(|e| matches!(e, PointerEvent::Move { dx, dy: 0 } if *dx > 0))
        );
        assert_eq!(
            ev.last(),
            Some(&PointerEvent::ButtonUp {
                button: Button::Left,
                release: ReleaseKind::Drag
            })
        );
    }

    #[test]
    fn tracking_loss_releases_exactly_once() {
        let mut gsm = GestureStateMachine::new(profile());
        run(&mut gsm, &[pinched().frame(0), pinched().frame(50)]);
        assert!(gsm.buttons().left);

        // inside the grace window nothing happens
        assert!(gsm.step(&Frame::empty(100)).is_empty());
        assert!(gsm.step(&Frame::empty(170)).is_empty());
        assert_eq!(gsm.step(&Frame::empty(171)), vec![PointerEvent::ReleaseAll]);
        assert_eq!(gsm.mode(), SystemMode::SafeOff);
        assert_eq!(gsm.reason(), Some(FailSafeReason::TrackingLost));

        assert!(gsm.step(&Frame::empty(400)).is_empty());
        assert!(gsm.fail_safe(FailSafeReason::Manual, 410).is_empty());
        assert!(!gsm.buttons().any());
        for c in PinchChannel::ALL {
            assert_eq!(gsm.tracker(c).phase(), PhaseKind::Idle);
        }
    }

    #[test]
    fn loss_with_every_channel_engaged_releases_once() {
        let mut gsm = GestureStateMachine::new(profile());
        // scroll takes the frame, then primary and secondary go active muted
        let scroll = open().two_finger(0.1);
        let all = pinched().two_finger(0.1).middle_pinch(0.1);
        run(&mut gsm, &[scroll.frame(0), scroll.frame(50), all.frame(66), all.frame(116)]);
        assert!(gsm.tracker(PinchChannel::Scroll).is_active());
        assert!(gsm.tracker(PinchChannel::Primary).is_active());
        assert!(gsm.tracker(PinchChannel::Secondary).is_active());

        let ev = run(
            &mut gsm,
            &[Frame::empty(150), Frame::empty(237), Frame::empty(300)],
        );
        assert_eq!(ev, vec![PointerEvent::ReleaseAll]);
        assert_eq!(gsm.mode(), SystemMode::SafeOff);
        for c in PinchChannel::ALL {
            assert_eq!(gsm.tracker(c).phase(), PhaseKind::Idle);
        }
    }

    #[test]
    fn panic_releases_once_with_two_channels_down() {
        let mut gsm = GestureStateMachine::new(profile());
        // index and middle tips stay apart, so scroll does not engage
        let both = open().index_pinch(0.25).middle_pinch(0.25);
        run(&mut gsm, &[both.frame(0), both.frame(50)]);
        assert!(gsm.buttons().left);
        assert!(gsm.tracker(PinchChannel::Secondary).is_active());
        assert_eq!(gsm.tracker(PinchChannel::Scroll).phase(), PhaseKind::Idle);

        let fist = both.fist();
        let ev: Vec<PointerEvent> = (0..=60)
            .flat_map(|i| gsm.step(&fist.frame(100 + i * 20)))
            .collect();
        assert_eq!(ev, vec![PointerEvent::ReleaseAll]);
        assert_eq!(gsm.reason(), Some(FailSafeReason::Panic));
    }

    #[test]
    fn clenching_fist_holds_the_channels() {
        let mut gsm = GestureStateMachine::new(profile());
        let fist = open().fist();
        let ev = run(
            &mut gsm,
            &(0..40).map(|i| fist.frame(i * 20)).collect::<Vec<_>>(),
        );
        assert!(ev.is_empty(), "{ev:?}");
        for c in PinchChannel::ALL {
            assert_eq!(gsm.tracker(c).phase(), PhaseKind::Idle);
        }
        assert!(gsm.snapshot().panic_arming > 0.7);
    }

    #[test]
    fn tick_checks_loss_without_touching_the_hand_state() {
        let mut gsm = GestureStateMachine::new(profile());
        // no hand seen yet: nothing to lose
        assert!(gsm.tick(1000).is_empty());

        // ticks between 33 ms frames leave the panic hold running
        let fist = open().fist();
        let mut fired = None;
        for i in 0..40u64 {
            let t = 2000 + i * 33;
            if !gsm.step(&fist.frame(t)).is_empty() {
                fired = Some(t);
                break;
            }
            assert!(gsm.tick(t + 20).is_empty());
        }
        assert_eq!(fired, Some(2000 + 31 * 33));

        let mut gsm = GestureStateMachine::new(profile());
        run(&mut gsm, &[pinched().frame(0), pinched().frame(50)]);
        assert!(gsm.tick(170).is_empty());
        assert_eq!(gsm.tick(171), vec![PointerEvent::ReleaseAll]);
        assert_eq!(gsm.reason(), Some(FailSafeReason::TrackingLost));
        assert!(gsm.tick(500).is_empty());
    }

    #[test]
    fn loss_with_nothing_active_still_goes_safe_off() {
        let mut gsm = GestureStateMachine::new(profile());
        run(&mut gsm, &[open().frame(0)]);
        assert_eq!(gsm.step(&Frame::empty(500)), vec![PointerEvent::ReleaseAll]);
        assert_eq!(gsm.mode(), SystemMode::SafeOff);
    }

    #[test]
    fn short_dropout_is_bridged() {
        let mut gsm = GestureStateMachine::new(profile());
        run(&mut gsm, &[pinched().frame(0), pinched().frame(50)]);
        let ev = run(
            &mut gsm,
            &[
                Frame::empty(66),
                pinched().confidence(0.3).frame(82),
                pinched().frame(98),
            ],
        );
        assert!(ev.is_empty());
        assert!(gsm.tracker(PinchChannel::Primary).is_active());
        assert_eq!(gsm.mode(), SystemMode::Running);
    }

    #[test]
    fn no_hand_at_startup_is_not_a_loss() {
        let mut gsm = GestureStateMachine::new(profile());
        let frames: Vec<Frame> = (0..100).map(|i| Frame::empty(i * 16)).collect();
        assert!(run(&mut gsm, &frames).is_empty());
        assert_eq!(gsm.mode(), SystemMode::Running);
    }

    #[test]
    fn invalid_frames_count_as_missing() {
        let mut gsm = GestureStateMachine::new(profile());
        run(&mut gsm, &[pinched().frame(0), pinched().frame(50)]);
        let mut bad = pinched().frame(66);
        bad.hands[0].confidence = 2.0;
        assert!(gsm.step(&bad).is_empty());
        assert!(gsm.tracker(PinchChannel::Primary).is_active());

        let mut bad = pinched().frame(200);
        bad.hands[0].confidence = 2.0;
        assert_eq!(gsm.step(&bad), vec![PointerEvent::ReleaseAll]);
    }

    #[test]
    fn panic_overrides_an_active_drag() {
        let mut gsm = GestureStateMachine::new(profile());
        run(&mut gsm, &[pinched().frame(0), pinched().frame(50)]);
        assert!(gsm.buttons().left);

        let fist = pinched().fist();
        let mut fired_at = None;
        for t in (100..=1200).step_by(20) {
            let ev = gsm.step(&fist.frame(t));
            if ev.contains(&PointerEvent::ReleaseAll) {
                assert_eq!(ev, vec![PointerEvent::ReleaseAll]);
                fired_at = Some(t);
                break;
            }
        }
        assert_eq!(fired_at, Some(1100));
        assert_eq!(gsm.reason(), Some(FailSafeReason::Panic));
        assert!(!gsm.buttons().any());
    }

    #[test]
    fn safe_off_is_inert_until_reengaged() {
        let mut gsm = GestureStateMachine::new(profile());
        gsm.fail_safe(FailSafeReason::Manual, 0);
        let ev = run(
            &mut gsm,
            &[pinched().frame(10), pinched().frame(60), pinched().frame(200)],
        );
        assert!(ev.is_empty());
        assert_eq!(gsm.tracker(PinchChannel::Primary).phase(), PhaseKind::Idle);

        gsm.reengage(300);
        assert_eq!(gsm.mode(), SystemMode::Running);
        let ev = run(&mut gsm, &[pinched().frame(310), pinched().frame(360)]);
        assert_eq!(ev, vec![LEFT_DOWN]);
    }

    #[test]
    fn scroll_mutes_click_channels() {
        let mut gsm = GestureStateMachine::new(profile());
        let scroll = open().two_finger(0.1);
        let both = pinched().two_finger(0.1);
        let ev = run(
            &mut gsm,
            &[
                scroll.frame(0),
                scroll.frame(50),
                both.frame(66),
                both.frame(116),
                both.frame(132),
                open().frame(200),
            ],
        );
        assert!(
            ev.iter()
                .all(|e| matches!(e, PointerEvent::Scroll { .. })),
            "{ev:?}"
        );
        assert!(!gsm.buttons().any());
    }

    #[test]
    fn profile_switch_releases_held_buttons() {
        let mut gsm = GestureStateMachine::new(profile());
        run(&mut gsm, &[pinched().frame(0), pinched().frame(50)]);
        let ev = gsm.set_profile(Profile::preset(ProfileName::Precision), 60);
        assert_eq!(ev, vec![PointerEvent::ReleaseAll]);
        assert_eq!(gsm.profile().name, ProfileName::Precision);
        assert!(gsm.snapshot().channels.iter().all(|c| c.phase == PhaseKind::Idle));

        // nothing held, nothing to release
        assert!(gsm.set_profile(profile(), 70).is_empty());
    }

    #[test]
    fn snapshot_reports_phases_and_anchor() {
        let mut gsm = GestureStateMachine::new(profile());
        run(&mut gsm, &[pinched().frame(0), pinched().frame(50)]);
        let snap = gsm.snapshot();
        assert_eq!(snap.mode, SystemMode::Running);
        let primary = &snap.channels[0];
        assert_eq!(primary.channel, PinchChannel::Primary);
        assert_eq!(primary.phase, PhaseKind::Active);
        assert_eq!(primary.since_ms, 50);
        assert_eq!(primary.anchor, Some(Point::new(0.5, 0.5)));
        assert!(snap.buttons.left);
    }

    fn arb_frames() -> impl Strategy<Value = Vec<Frame>> {
        let step = (
            1u64..60,
            prop::option::weighted(0.9, (0.0f32..1.0, 0.0f32..1.5, 0.3f32..0.7, 0.3f32..0.7)),
            prop::option::of(0.0f32..0.6),
        );
        prop::collection::vec(step, 1..200).prop_map(|steps| {
            let mut t = 0;
            steps
                .into_iter()
                .map(|(dt, hand, two)| {
                    t += dt;
                    match hand {
                        None => Frame::empty(t),
                        Some((ip, mp, x, y)) => {
                            let mut pose = HandPose::default()
                                .at(x, y)
                                .index_pinch(ip)
                                .middle_pinch(mp);
                            pose.two_finger = two;
                            pose.frame(t)
                        }
                    }
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn replay_is_deterministic(frames in arb_frames()) {
            let mut a = GestureStateMachine::new(Profile::default());
            let mut b = GestureStateMachine::new(Profile::default());
            for f in &frames {
                prop_assert_eq!(a.step(f), b.step(f));
            }
            prop_assert_eq!(a.snapshot(), b.snapshot());
        }

        #[test]
        fn button_events_stay_paired(frames in arb_frames()) {
            let mut gsm = GestureStateMachine::new(Profile::default());
            let mut held = ButtonState::default();
            for f in &frames {
                for ev in gsm.step(f) {
                    match ev {
                        PointerEvent::ButtonDown { button: Button::Left } => prop_assert!(!held.left),
                        PointerEvent::ButtonUp { button: Button::Left, .. } => prop_assert!(held.left),
                        PointerEvent::ButtonDown { button: Button::Right } => prop_assert!(!held.right),
                        PointerEvent::ButtonUp { button: Button::Right, .. } => prop_assert!(held.right),
                        _ => {}
                    }
                    held.apply(&ev);
                }
                prop_assert_eq!(held, gsm.buttons());
            }
        }
    }
}
