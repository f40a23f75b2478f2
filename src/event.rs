use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Button {
    Left,
    Right,
}

/// How a press ended. Sinks may ignore it; it is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseKind {
    Tap,
    Drag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PointerEvent {
    Move { dx: i32, dy: i32 },
    ButtonDown { button: Button },
    ButtonUp { button: Button, release: ReleaseKind },
    /// Positive scrolls up.
    Scroll { dy: i32 },
    /// Release every button this process may have pressed, whatever the tracked state.
    ReleaseAll,
}

/// Logical button state as implied by the events emitted so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ButtonState {
    pub left: bool,
    pub right: bool,
}

impl ButtonState {
    pub fn any(&self) -> bool {
        self.left || self.right
    }

    pub fn apply(&mut self, ev: &PointerEvent) {
        match ev {
            PointerEvent::ButtonDown { button } => self.set(*button, true),
            PointerEvent::ButtonUp { button, .. } => self.set(*button, false),
            PointerEvent::ReleaseAll => *self = Self::default(),
            PointerEvent::Move { .. } | PointerEvent::Scroll { .. } => {}
        }
    }

    fn set(&mut self, button: Button, down: bool) {
        match button {
            Button::Left => self.left = down,
            Button::Right => self.right = down,
        }
    }
}
