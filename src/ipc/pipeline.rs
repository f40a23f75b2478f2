use anyhow::Result;
use log::{error, info, warn};
use serde::Serialize;
use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex,
        mpsc::{self, Receiver, Sender, TryRecvError},
    },
    thread,
    time::{Duration, Instant},
};

use super::dispatch::deliver;
use crate::actions::{OutputSink, ReleaseGuard};
use crate::config::Profile;
use crate::error::FailSafeReason;
use crate::gsm::{OverlaySnapshot, SystemMode};
use crate::queue::{FrameQueue, Pop, QueueStatsSnapshot};
use crate::session::Session;

/// How long the loop waits for a frame before checking controls and the
/// tracking-loss clock.
const POLL: Duration = Duration::from_millis(20);

pub enum Control {
    Engage,
    Disengage,
    SetProfile(Profile),
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub gesture: OverlaySnapshot,
    pub queue: QueueStatsSnapshot,
    pub recording: Option<PathBuf>,
    pub source_open: bool,
}

/// Frame time for inputs that do not come with a frame (controls, ticks):
/// last frame time plus wall time elapsed since it arrived.
struct FrameClock {
    last_t_ms: u64,
    at: Instant,
    seen: bool,
}

impl FrameClock {
    fn new() -> Self {
        Self {
            last_t_ms: 0,
            at: Instant::now(),
            seen: false,
        }
    }

    fn observe(&mut self, t_ms: u64) {
        self.last_t_ms = self.last_t_ms.max(t_ms);
        self.at = Instant::now();
        self.seen = true;
    }

    fn now(&self) -> u64 {
        self.last_t_ms + self.at.elapsed().as_millis() as u64
    }
}

pub struct Pipeline {
    tx: Sender<Control>,
    status: Arc<Mutex<PipelineStatus>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Pipeline {
    pub fn start<S: OutputSink + 'static>(
        profile: Profile,
        sink: S,
        queue: Arc<FrameQueue>,
        record_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let session = Session::new(profile, record_dir);
        let status = Arc::new(Mutex::new(PipelineStatus {
            gesture: session.gsm().snapshot(),
            queue: queue.stats(),
            recording: session.recording_path().map(|p| p.to_path_buf()),
            source_open: true,
        }));
        let (tx, rx) = mpsc::channel();

        let st = Arc::clone(&status);
        let handle = thread::Builder::new()
            .name("gesture".into())
            .spawn(move || run(session, ReleaseGuard::new(sink), queue, rx, st))?;

        Ok(Self {
            tx,
            status,
            thread: Some(handle),
        })
    }

    pub fn send(&self, c: Control) {
        if self.tx.send(c).is_err() {
            warn!("gesture pipeline is not running");
        }
    }

    pub fn status(&self) -> Option<PipelineStatus> {
        self.status.lock().ok().map(|s| s.clone())
    }

    /// Stop the loop and wait for it; buttons are released on the way out.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = self.tx.send(Control::Shutdown);
        if let Some(h) = self.thread.take() {
            if h.join().is_err() {
                error!("gesture pipeline panicked during shutdown");
            }
        }
    }
}

fn run<S: OutputSink>(
    mut session: Session,
    mut guard: ReleaseGuard<S>,
    queue: Arc<FrameQueue>,
    rx: Receiver<Control>,
    status: Arc<Mutex<PipelineStatus>>,
) {
    let mut clock = FrameClock::new();
    let mut source_open = true;
    info!(
        "gesture pipeline running, profile {}",
        session.gsm().profile().name
    );

    loop {
        loop {
            let control = match rx.try_recv() {
                Ok(c) => c,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => Control::Shutdown,
            };
            let t = clock.now();
            let events = match control {
                Control::Engage => session.reengage(t),
                Control::Disengage => session.fail_safe(FailSafeReason::Manual, t),
                Control::SetProfile(p) => session.set_profile(p, t),
                Control::Shutdown => {
                    let events = session.fail_safe(FailSafeReason::Shutdown, t);
                    deliver(&mut session, guard.sink(), &events, t);
                    info!("gesture pipeline stopped");
                    return;
                }
            };
            deliver(&mut session, guard.sink(), &events, t);
        }

        match queue.pop_timeout(POLL) {
            Pop::Frame(f) => {
                clock.observe(f.t_ms);
                let t = f.t_ms;
                let events = session.step(f);
                deliver(&mut session, guard.sink(), &events, t);
            }
            pop => {
                if matches!(pop, Pop::Closed) && source_open {
                    warn!("frame source closed; treating as loss of tracking");
                    source_open = false;
                }
                // a stalled source is indistinguishable from a lost hand
                if clock.seen && session.gsm().mode() == SystemMode::Running {
                    let t = clock.now();
                    let events = session.tick(t);
                    deliver(&mut session, guard.sink(), &events, t);
                }
                if !source_open {
                    thread::sleep(POLL);
                }
            }
        }

        if let Ok(mut st) = status.lock() {
            st.gesture = session.gsm().snapshot();
            st.queue = queue.stats();
            st.recording = session.recording_path().map(|p| p.to_path_buf());
            st.source_open = source_open;
        }
    }
}
