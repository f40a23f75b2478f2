use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

/// Named hand landmarks, MediaPipe numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Landmark {
    Wrist,
    ThumbCmc,
    ThumbMcp,
    ThumbIp,
    ThumbTip,
    IndexMcp,
    IndexPip,
    IndexDip,
    IndexTip,
    MiddleMcp,
    MiddlePip,
    MiddleDip,
    MiddleTip,
    RingMcp,
    RingPip,
    RingDip,
    RingTip,
    PinkyMcp,
    PinkyPip,
    PinkyDip,
    PinkyTip,
}

impl Landmark {
    pub const ALL: [Landmark; 21] = [
        Self::Wrist,
        Self::ThumbCmc,
        Self::ThumbMcp,
        Self::ThumbIp,
        Self::ThumbTip,
        Self::IndexMcp,
        Self::IndexPip,
        Self::IndexDip,
        Self::IndexTip,
        Self::MiddleMcp,
        Self::MiddlePip,
        Self::MiddleDip,
        Self::MiddleTip,
        Self::RingMcp,
        Self::RingPip,
        Self::RingDip,
        Self::RingTip,
        Self::PinkyMcp,
        Self::PinkyPip,
        Self::PinkyDip,
        Self::PinkyTip,
    ];

    /// Landmarks averaged into the palm center.
    pub const PALM: [Landmark; 5] = [
        Self::Wrist,
        Self::IndexMcp,
        Self::MiddleMcp,
        Self::RingMcp,
        Self::PinkyMcp,
    ];

    /// Fingertips checked by the fist detector (thumb excluded, it folds over the fingers).
    pub const FIST_TIPS: [Landmark; 4] = [
        Self::IndexTip,
        Self::MiddleTip,
        Self::RingTip,
        Self::PinkyTip,
    ];

    pub fn from_index(i: usize) -> Option<Self> {
        Self::ALL.get(i).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub z: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y, z: 0.0 }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Planar distance; camera depth is too noisy to be useful for pinches.
    pub fn distance(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn midpoint(&self, other: &Point) -> Point {
        Point {
            x: (self.x + other.x) * 0.5,
            y: (self.y + other.y) * 0.5,
            z: (self.z + other.z) * 0.5,
        }
    }

    /// Exponential blend toward `target`; `alpha = 1` returns `target` unchanged.
    pub fn blend(&self, target: &Point, alpha: f32) -> Point {
        if alpha >= 1.0 {
            return *target;
        }
        Point {
            x: self.x + alpha * (target.x - self.x),
            y: self.y + alpha * (target.y - self.y),
            z: self.z + alpha * (target.z - self.z),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandObservation {
    /// Tracker-assigned identity, stable while the hand stays in view.
    pub track_id: u32,
    pub confidence: f32,
    #[serde(deserialize_with = "de_landmarks")]
    pub landmarks: BTreeMap<Landmark, Point>,
}

/// Accepts named landmarks or a bare array in MediaPipe order.
fn de_landmarks<'de, D>(d: D) -> Result<BTreeMap<Landmark, Point>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Named(BTreeMap<Landmark, Point>),
        Indexed(Vec<Point>),
    }

    match Repr::deserialize(d)? {
        Repr::Named(m) => Ok(m),
        Repr::Indexed(v) if v.len() > Landmark::ALL.len() => Err(D::Error::invalid_length(
            v.len(),
            &"at most 21 landmarks",
        )),
        Repr::Indexed(v) => Ok(v
            .into_iter()
            .enumerate()
            .filter_map(|(i, p)| Landmark::from_index(i).map(|lm| (lm, p)))
            .collect()),
    }
}

impl HandObservation {
    pub fn point(&self, lm: Landmark) -> Option<Point> {
        self.landmarks.get(&lm).copied()
    }

    /// Index MCP to pinky MCP distance; the unit all pinch distances are measured in.
    pub fn palm_width(&self) -> Option<f32> {
        let a = self.point(Landmark::IndexMcp)?;
        let b = self.point(Landmark::PinkyMcp)?;
        Some(a.distance(&b).max(1e-6))
    }

    pub fn palm_center(&self) -> Option<Point> {
        let mut acc = Point::default();
        for lm in Landmark::PALM {
            let p = self.point(lm)?;
            acc.x += p.x;
            acc.y += p.y;
            acc.z += p.z;
        }
        let n = Landmark::PALM.len() as f32;
        Some(Point {
            x: acc.x / n,
            y: acc.y / n,
            z: acc.z / n,
        })
    }

    /// Distance between two landmarks in palm widths.
    pub fn normalized_distance(&self, a: Landmark, b: Landmark) -> Option<f32> {
        let pa = self.point(a)?;
        let pb = self.point(b)?;
        Some(pa.distance(&pb) / self.palm_width()?)
    }
}

/// One tracker snapshot. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Monotonic capture time in milliseconds.
    pub t_ms: u64,
    #[serde(default)]
    pub hands: Vec<HandObservation>,
}

impl Frame {
    #[cfg(test)]
    pub fn empty(t_ms: u64) -> Self {
        Self {
            t_ms,
            hands: Vec::new(),
        }
    }
}

// ── Test helpers ───────────────────────────────────────────
