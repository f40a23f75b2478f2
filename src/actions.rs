use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, warn};

use crate::error::SinkError;
use crate::event::{Button, PointerEvent};

pub trait OutputSink: Send {
    fn apply(&mut self, ev: &PointerEvent) -> Result<(), SinkError>;

    fn apply_batch(&mut self, events: &[PointerEvent]) -> Result<(), SinkError> {
        events.iter().try_for_each(|ev| self.apply(ev))
    }

    /// Release both buttons regardless of what this sink thinks is held.
    fn release_all(&mut self) -> Result<(), SinkError> {
        self.apply(&PointerEvent::ReleaseAll)
    }
}

impl<S: OutputSink + ?Sized> OutputSink for Box<S> {
    fn apply(&mut self, ev: &PointerEvent) -> Result<(), SinkError> {
        (**self).apply(ev)
    }

    fn apply_batch(&mut self, events: &[PointerEvent]) -> Result<(), SinkError> {
        (**self).apply_batch(events)
    }

    fn release_all(&mut self) -> Result<(), SinkError> {
        (**self).release_all()
    }
}

// ── uinput ─────────────────────────────────────────────────

pub struct UinputSink {
    linux: Option<Box<LinuxUinput>>,
}

impl UinputSink {
    pub fn new() -> Result<Self> {
        #[cfg(target_os = "linux")]
        {
            let dev = LinuxUinput::create()?;
            return Ok(Self {
                linux: Some(Box::new(dev)),
            });
        }
        #[allow(unreachable_code)]
        {
            warn!("uinput not available; running in NO-OP mode");
            Ok(Self::noop())
        }
    }

    /// Logs events instead of injecting them.
    pub fn noop() -> Self {
        Self { linux: None }
    }

    pub fn is_noop(&self) -> bool {
        self.linux.is_none()
    }
}

impl OutputSink for UinputSink {
    fn apply(&mut self, ev: &PointerEvent) -> Result<(), SinkError> {
        let Some(dev) = self.linux.as_mut() else {
            debug!("noop sink: {ev:?}");
            return Ok(());
        };
        dev.apply(ev)
            .map_err(|e| SinkError::Device(format!("{e:#}")))
    }
}

struct LinuxUinput {
    dev: uinput::device::Device,
}

impl LinuxUinput {
    fn create() -> Result<Self> {
        use uinput::event::{controller::Mouse, relative};

        let dev = uinput::default()?
            .name("Pinchpad Virtual Pointer")?
            // relative axes + wheel
            .event(relative::Position::X)?
            .event(relative::Position::Y)?
            .event(relative::Wheel::Vertical)?
            // mouse buttons
            .event(Mouse::Left)?
            .event(Mouse::Right)?
            .create()?;

        info!("uinput: created virtual pointer");
        Ok(Self { dev })
    }

    fn apply(&mut self, ev: &PointerEvent) -> Result<()> {
        use uinput::event::controller::Mouse;
        use uinput::event::relative::{Position, Wheel};

        let mouse = |b: Button| match b {
            Button::Left => Mouse::Left,
            Button::Right => Mouse::Right,
        };
        match *ev {
            PointerEvent::Move { dx, dy } => {
                if dx != 0 {
                    self.dev.send(Position::X, dx)?;
                }
                if dy != 0 {
                    self.dev.send(Position::Y, dy)?;
                }
            }
            PointerEvent::ButtonDown { button } => self.dev.send(mouse(button), 1)?,
            PointerEvent::ButtonUp { button, .. } => self.dev.send(mouse(button), 0)?,
            // REL_WHEEL: positive is away from the user, i.e. up
            PointerEvent::Scroll { dy } => self.dev.send(Wheel::Vertical, dy)?,
            PointerEvent::ReleaseAll => {
                self.dev.send(Mouse::Left, 0)?;
                self.dev.send(Mouse::Right, 0)?;
            }
        }
        self.dev.synchronize()?;
        Ok(())
    }
}

// ── in-memory ──────────────────────────────────────────────

/// Collects events; cloning shares the same buffer.
#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<PointerEvent>>>,
    fail: Arc<Mutex<Option<SinkError>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PointerEvent> {
        self.events.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Make every following call fail with `err` (None restores).
    #[cfg(test)]
    pub fn fail_with(&self, err: Option<SinkError>) {
        if let Ok(mut f) = self.fail.lock() {
            *f = err;
        }
    }
}

impl OutputSink for MemorySink {
    fn apply(&mut self, ev: &PointerEvent) -> Result<(), SinkError> {
        if let Some(err) = self.fail.lock().ok().and_then(|f| f.clone()) {
            return Err(err);
        }
        self.events
            .lock()
            .map_err(|_| SinkError::Device("memory sink poisoned".into()))?
            .push(*ev);
        Ok(())
    }
}

// ── worker thread with deadline ────────────────────────────

enum Job {
    Batch(Vec<PointerEvent>, Sender<Result<(), SinkError>>),
    ReleaseAll(Sender<Result<(), SinkError>>),
}

/// Runs an inner sink on its own thread so a wedged device cannot stall the
/// gesture loop. Each batch must be acknowledged within `timeout`.
pub struct TimedSink {
    tx: SyncSender<Job>,
    timeout: Duration,
}

impl TimedSink {
    pub fn spawn<S: OutputSink + 'static>(inner: S, timeout: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<Job>(16);
        thread::Builder::new()
            .name("sink-worker".into())
            .spawn(move || Self::worker(inner, rx))?;
        Ok(Self { tx, timeout })
    }

    fn worker<S: OutputSink>(mut inner: S, rx: Receiver<Job>) {
        for job in rx {
            let (res, reply) = match job {
                Job::Batch(events, reply) => (inner.apply_batch(&events), reply),
                Job::ReleaseAll(reply) => (inner.release_all(), reply),
            };
            if let Err(e) = &res {
                error!("sink: {e}");
            }
            // caller may have given up waiting
            let _ = reply.send(res);
        }
        debug!("sink worker exiting");
    }

    fn submit(&self, job: impl FnOnce(Sender<Result<(), SinkError>>) -> Job) -> Result<(), SinkError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .try_send(job(reply_tx))
            .map_err(|e| match e {
                mpsc::TrySendError::Full(_) => SinkError::Timeout(self.timeout),
                mpsc::TrySendError::Disconnected(_) => SinkError::Disconnected,
            })?;
        match reply_rx.recv_timeout(self.timeout) {
            Ok(res) => res,
            Err(RecvTimeoutError::Timeout) => Err(SinkError::Timeout(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(SinkError::Disconnected),
        }
    }
}

impl OutputSink for TimedSink {
    fn apply(&mut self, ev: &PointerEvent) -> Result<(), SinkError> {
        self.apply_batch(std::slice::from_ref(ev))
    }

    fn apply_batch(&mut self, events: &[PointerEvent]) -> Result<(), SinkError> {
        if events.is_empty() {
            return Ok(());
        }
        self.submit(|reply| Job::Batch(events.to_vec(), reply))
    }

    fn release_all(&mut self) -> Result<(), SinkError> {
        self.submit(Job::ReleaseAll)
    }
}

// ── scope guard ────────────────────────────────────────────

/// Releases all buttons when dropped, including during unwinding.
pub struct ReleaseGuard<S: OutputSink> {
    sink: S,
}

impl<S: OutputSink> ReleaseGuard<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn sink(&mut self) -> &mut S {
        &mut self.sink
    }
}

impl<S: OutputSink> Drop for ReleaseGuard<S> {
    fn drop(&mut self) {
        match self.sink.release_all() {
            Ok(()) => debug!("release guard: buttons released"),
            Err(e) => error!("release guard: could not release buttons: {e}"),
        }
    }
}
