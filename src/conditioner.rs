use std::collections::BTreeMap;

use log::debug;

use crate::config::{MIN_CONFIDENCE, Profile};
use crate::error::FrameError;
use crate::frame::{Frame, HandObservation, Landmark, Point};
use crate::pinch::PinchChannel;

/// Validated output for one frame. `hand` is `None` when nothing was tracked
/// above the confidence floor; downstream treats that exactly like a missing frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionedFrame {
    pub t_ms: u64,
    pub hand: Option<HandObservation>,
}

#[derive(Debug, Clone)]
pub struct SignalConditioner {
    alpha: f32,
    required: Vec<Landmark>,
    last_t_ms: Option<u64>,
    // smoothed landmark positions per hand track; dropped as soon as a track goes missing
    tracks: BTreeMap<u32, BTreeMap<Landmark, Point>>,
}

/// Every landmark some channel, the palm geometry or the fist detector reads.
pub fn required_landmarks() -> Vec<Landmark> {
    let mut out: Vec<Landmark> = PinchChannel::ALL
        .iter()
        .flat_map(|c| {
            let (a, b) = c.landmarks();
            [a, b, c.tracked_landmarks().0, c.tracked_landmarks().1]
        })
        .chain(Landmark::PALM)
        .chain(Landmark::FIST_TIPS)
        .collect();
    out.sort();
    out.dedup();
    out
}

impl SignalConditioner {
    pub fn new(profile: &Profile) -> Self {
        Self {
            alpha: profile.smoothing_factor,
            required: required_landmarks(),
            last_t_ms: None,
            tracks: BTreeMap::new(),
        }
    }

    /// Forget all smoothing history (profile switch, re-engagement).
    /// The timestamp floor is kept.
    pub fn reset(&mut self) {
        self.tracks.clear();
    }

    pub fn reconfigure(&mut self, profile: &Profile) {
        self.alpha = profile.smoothing_factor;
        self.reset();
    }

    pub fn condition(&mut self, frame: &Frame) -> Result<ConditionedFrame, FrameError> {
        if let Some(prev_ms) = self.last_t_ms {
            if frame.t_ms < prev_ms {
                return Err(FrameError::TimestampRegressed {
                    prev_ms,
                    now_ms: frame.t_ms,
                });
            }
        }
        for hand in &frame.hands {
            self.validate(hand)?;
        }
        self.last_t_ms = Some(frame.t_ms);

        let usable: Vec<&HandObservation> = frame
            .hands
            .iter()
            .filter(|h| h.confidence >= MIN_CONFIDENCE)
            .collect();

        // no smoothing across a gap
        self.tracks
            .retain(|id, _| usable.iter().any(|h| h.track_id == *id));

        let mut smoothed: Vec<HandObservation> = usable
            .into_iter()
            .map(|h| self.smooth(h))
            .collect();

        smoothed.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then(a.track_id.cmp(&b.track_id))
        });
        let hand = smoothed.into_iter().next();
        if hand.is_none() && !frame.hands.is_empty() {
            debug!("t={} all hands below confidence floor", frame.t_ms);
        }

        Ok(ConditionedFrame {
            t_ms: frame.t_ms,
            hand,
        })
    }

    fn validate(&self, hand: &HandObservation) -> Result<(), FrameError> {
        if !(0.0..=1.0).contains(&hand.confidence) {
            return Err(FrameError::ConfidenceOutOfRange {
                track_id: hand.track_id,
                confidence: hand.confidence,
            });
        }
        for (lm, p) in &hand.landmarks {
            if !p.is_finite() {
                return Err(FrameError::NonFinite {
                    track_id: hand.track_id,
                    landmark: *lm,
                });
            }
        }
        if hand.confidence < MIN_CONFIDENCE {
            // will be dropped as untracked, its landmark set does not matter
            return Ok(());
        }
        if let Some(missing) = self
            .required
            .iter()
            .find(|lm| !hand.landmarks.contains_key(*lm))
        {
            return Err(FrameError::MissingLandmark {
                track_id: hand.track_id,
                landmark: *missing,
            });
        }
        Ok(())
    }

    fn smooth(&mut self, hand: &HandObservation) -> HandObservation {
        let alpha = self.alpha;
        let state = self.tracks.entry(hand.track_id).or_default();
        let mut out = hand.clone();
        for (lm, raw) in out.landmarks.iter_mut() {
            let s = match state.get(lm) {
                Some(prev) => prev.blend(raw, alpha),
                None => *raw,
            };
            state.insert(*lm, s);
            *raw = s;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::fixtures::HandPose;

    fn conditioner(alpha: f32) -> SignalConditioner {
        let mut p = Profile::default();
        p.smoothing_factor = alpha;
        SignalConditioner::new(&p)
    }

    #[test]
    fn rejects_non_finite_coordinates() {
        let mut c = conditioner(0.5);
        let mut f = HandPose::default().frame(0);
        f.hands[0]
            .landmarks
            .insert(Landmark::IndexTip, Point::new(f32::NAN, 0.2));
        assert!(matches!(
            c.condition(&f),
            Err(FrameError::NonFinite {
                landmark: Landmark::IndexTip,
                ..
            })
        ));
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let mut c = conditioner(0.5);
        let f = HandPose::default().confidence(1.5).frame(0);
        assert!(matches!(
            c.condition(&f),
            Err(FrameError::ConfidenceOutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_missing_channel_landmark() {
        let mut c = conditioner(0.5);
        let mut f = HandPose::default().frame(0);
        f.hands[0].landmarks.remove(&Landmark::MiddleTip);
        assert!(matches!(
            c.condition(&f),
            Err(FrameError::MissingLandmark {
                landmark: Landmark::MiddleTip,
                ..
            })
        ));
    }

    #[test]
    fn rejects_timestamp_regression() {
        let mut c = conditioner(0.5);
        c.condition(&HandPose::default().frame(100)).unwrap();
        assert!(matches!(
            c.condition(&HandPose::default().frame(99)),
            Err(FrameError::TimestampRegressed { .. })
        ));
    }

    #[test]
    fn low_confidence_is_no_track_not_a_smoothed_value() {
        let mut c = conditioner(0.5);
        c.condition(&HandPose::default().frame(0)).unwrap();
        let out = c
            .condition(&HandPose::default().confidence(0.2).frame(16))
            .unwrap();
        assert_eq!(out.hand, None);
    }

    #[test]
    fn smooths_across_consecutive_frames() {
        let mut c = conditioner(0.5);
        c.condition(&HandPose::default().at(0.4, 0.5).frame(0))
            .unwrap();
        let out = c
            .condition(&HandPose::default().at(0.6, 0.5).frame(16))
            .unwrap();
        let mcp = out.hand.unwrap().point(Landmark::IndexMcp).unwrap();
        assert!((mcp.x - 0.5).abs() < 1e-5, "got {}", mcp.x);
    }

    #[test]
    fn smoothing_resets_after_a_gap() {
        let mut c = conditioner(0.5);
        c.condition(&HandPose::default().at(0.4, 0.5).frame(0))
            .unwrap();
        c.condition(&Frame::empty(16)).unwrap();
        let out = c
            .condition(&HandPose::default().at(0.6, 0.5).frame(32))
            .unwrap();
        let mcp = out.hand.unwrap().point(Landmark::IndexMcp).unwrap();
        assert!((mcp.x - 0.6).abs() < 1e-6, "got {}", mcp.x);
    }

    #[test]
    fn picks_the_most_confident_hand() {
        let mut c = conditioner(1.0);
        let f = Frame {
            t_ms: 0,
            hands: vec![
                HandPose::default().confidence(0.7).observation(4),
                HandPose::default().confidence(0.9).observation(7),
                HandPose::default().confidence(0.9).observation(5),
            ],
        };
        let out = c.condition(&f).unwrap();
        assert_eq!(out.hand.unwrap().track_id, 5);
    }
}
