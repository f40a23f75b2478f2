use log::{debug, error};

use crate::actions::OutputSink;
use crate::error::FailSafeReason;
use crate::event::PointerEvent;
use crate::session::Session;

/// Hand one frame's events to the sink. If the sink fails, the OS button
/// state is unknown, so this converges on the fail-safe path and releases
/// everything it can.
pub fn deliver<S: OutputSink + ?Sized>(
    session: &mut Session,
    sink: &mut S,
    events: &[PointerEvent],
    t_ms: u64,
) {
    if events.is_empty() {
        return;
    }
    debug!("t={t_ms} -> {events:?}");
    let Err(e) = sink.apply_batch(events) else {
        return;
    };
    error!("output failed at t={t_ms}: {e}");
    session.fail_safe(FailSafeReason::SinkFailure, t_ms);
    // best effort, the device may be the thing that broke
    if let Err(e) = sink.release_all() {
        error!("release after output failure also failed: {e}");
    }
}
