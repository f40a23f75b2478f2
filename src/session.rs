//! A session file is JSON lines: a header with the profile, then one entry per
//! input the state machine consumed together with the events it produced.
//!
//! ```text
//! {"version":1,"profile":{...}}
//! {"input":{"kind":"frame","t_ms":0,"hands":[...]},"events":[]}
//! {"input":{"kind":"reengage","t_ms":5000},"events":[]}
//! ```
//!
//! Frames are stored as received, before validation, so a replay walks the
//! exact same code path including rejected frames.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::Profile;
use crate::error::{FailSafeReason, SessionError};
use crate::event::PointerEvent;
use crate::frame::Frame;
use crate::gsm::GestureStateMachine;

pub const SESSION_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub version: u32,
    pub profile: Profile,
}

/// Everything that can change state machine output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionInput {
    Frame(Frame),
    Reengage {
        t_ms: u64,
    },
    /// Loss-clock check while no frame arrived. Only stored when it fired.
    Tick {
        t_ms: u64,
    },
    FailSafe {
        t_ms: u64,
        reason: FailSafeReason,
    },
    /// Always the last entry of a file; the next file starts with this profile.
    SwitchProfile {
        t_ms: u64,
        profile: Profile,
    },
}

impl SessionInput {
    /// Feed this input to `gsm`. Live runs and replays both go through here.
    pub fn apply(&self, gsm: &mut GestureStateMachine) -> Vec<PointerEvent> {
        match self {
            Self::Frame(f) => gsm.step(f),
            Self::Reengage { t_ms } => {
                gsm.reengage(*t_ms);
                Vec::new()
            }
            Self::Tick { t_ms } => gsm.tick(*t_ms),
            Self::FailSafe { t_ms, reason } => gsm.fail_safe(*reason, *t_ms),
            Self::SwitchProfile { t_ms, profile } => gsm.set_profile(profile.clone(), *t_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub input: SessionInput,
    pub events: Vec<PointerEvent>,
}

pub struct SessionRecorder {
    path: PathBuf,
    out: BufWriter<File>,
    entries: usize,
}

impl SessionRecorder {
    /// Start a new file under `dir`, named after wall-clock time and profile.
    pub fn create(dir: &Path, profile: &Profile) -> Result<Self, SessionError> {
        fs::create_dir_all(dir)?;
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let stem = format!("{stamp}-{}", profile.name.as_str().to_ascii_lowercase());

        let mut n = 0;
        let (path, file) = loop {
            let name = if n == 0 {
                format!("{stem}.jsonl")
            } else {
                format!("{stem}-{n}.jsonl")
            };
            let path = dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(f) => break (path, f),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
                Err(e) => return Err(e.into()),
            }
        };

        let mut rec = Self {
            path,
            out: BufWriter::new(file),
            entries: 0,
        };
        let header = SessionHeader {
            version: SESSION_VERSION,
            profile: profile.clone(),
        };
        rec.write_line(&header)?;
        info!("recording session to {}", rec.path.display());
        Ok(rec)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, input: &SessionInput, events: &[PointerEvent]) -> Result<(), SessionError> {
        #[derive(Serialize)]
        struct Borrowed<'a> {
            input: &'a SessionInput,
            events: &'a [PointerEvent],
        }
        self.write_line(&Borrowed { input, events })?;
        self.entries += 1;
        Ok(())
    }

    fn write_line<T: Serialize>(&mut self, value: &T) -> Result<(), SessionError> {
        serde_json::to_writer(&mut self.out, value).map_err(|source| SessionError::Json {
            line: self.entries + 1,
            source,
        })?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub header: SessionHeader,
    pub entries: Vec<SessionEntry>,
}

impl SessionRecord {
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        Self::read(BufReader::new(File::open(path)?))
    }

    pub fn read<R: BufRead>(reader: R) -> Result<Self, SessionError> {
        let mut lines = reader
            .lines()
            .enumerate()
            .filter(|(_, l)| !matches!(l, Ok(s) if s.trim().is_empty()));

        let (_, first) = lines.next().ok_or(SessionError::MissingHeader)?;
        let header: SessionHeader =
            serde_json::from_str(&first?).map_err(|source| SessionError::Json { line: 1, source })?;
        if header.version != SESSION_VERSION {
            return Err(SessionError::Version(header.version));
        }
        header.profile.validate()?;

        let mut entries = Vec::new();
        for (i, line) in lines {
            let entry = serde_json::from_str(&line?)
                .map_err(|source| SessionError::Json { line: i + 1, source })?;
            entries.push(entry);
        }
        Ok(Self { header, entries })
    }
}

/// Re-runs a recorded session through a fresh state machine.
pub struct Replayer {
    gsm: GestureStateMachine,
}

impl Replayer {
    pub fn new(header: &SessionHeader) -> Self {
        Self {
            gsm: GestureStateMachine::new(header.profile.clone()),
        }
    }

    pub fn state(&self) -> &GestureStateMachine {
        &self.gsm
    }

    pub fn feed(&mut self, input: &SessionInput) -> Vec<PointerEvent> {
        input.apply(&mut self.gsm)
    }

    /// Check every recorded event list against a fresh run. Returns the
    /// number of entries checked.
    pub fn verify(record: &SessionRecord) -> Result<usize, SessionError> {
        let mut r = Self::new(&record.header);
        for (index, entry) in record.entries.iter().enumerate() {
            let actual = r.feed(&entry.input);
            if actual != entry.events {
                return Err(SessionError::Mismatch {
                    index,
                    expected: format!("{:?}", entry.events),
                    actual: format!("{actual:?}"),
                });
            }
        }
        debug!("replayed {} entries", record.entries.len());
        Ok(record.entries.len())
    }
}

/// A state machine plus an optional recorder. Recording problems are logged
/// and recording stops; the gesture path never fails because of them.
pub struct Session {
    gsm: GestureStateMachine,
    recorder: Option<SessionRecorder>,
    record_dir: Option<PathBuf>,
}

impl Session {
    pub fn new(profile: Profile, record_dir: Option<PathBuf>) -> Self {
        let recorder = record_dir
            .as_deref()
            .and_then(|dir| Self::open_recorder(dir, &profile));
        Self {
            gsm: GestureStateMachine::new(profile),
            recorder,
            record_dir,
        }
    }

    fn open_recorder(dir: &Path, profile: &Profile) -> Option<SessionRecorder> {
        match SessionRecorder::create(dir, profile) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!("session recording disabled: {e}");
                None
            }
        }
    }

    pub fn gsm(&self) -> &GestureStateMachine {
        &self.gsm
    }

    pub fn recording_path(&self) -> Option<&Path> {
        self.recorder.as_ref().map(|r| r.path())
    }

    pub fn handle(&mut self, input: SessionInput) -> Vec<PointerEvent> {
        let events = input.apply(&mut self.gsm);
        // a tick that changed nothing leaves no trace worth replaying
        if matches!(input, SessionInput::Tick { .. }) && events.is_empty() {
            return events;
        }
        if let Some(rec) = self.recorder.as_mut() {
            if let Err(e) = rec.record(&input, &events) {
                warn!("session recording stopped: {e}");
                self.recorder = None;
            }
        }
        if let SessionInput::SwitchProfile { profile, .. } = &input {
            if let Some(dir) = self.record_dir.as_deref() {
                self.recorder = Self::open_recorder(dir, profile);
            }
        }
        events
    }

    pub fn step(&mut self, frame: Frame) -> Vec<PointerEvent> {
        self.handle(SessionInput::Frame(frame))
    }

    pub fn tick(&mut self, t_ms: u64) -> Vec<PointerEvent> {
        self.handle(SessionInput::Tick { t_ms })
    }

    pub fn reengage(&mut self, t_ms: u64) -> Vec<PointerEvent> {
        self.handle(SessionInput::Reengage { t_ms })
    }

    pub fn fail_safe(&mut self, reason: FailSafeReason, t_ms: u64) -> Vec<PointerEvent> {
        self.handle(SessionInput::FailSafe { t_ms, reason })
    }

    pub fn set_profile(&mut self, profile: Profile, t_ms: u64) -> Vec<PointerEvent> {
        self.handle(SessionInput::SwitchProfile { t_ms, profile })
    }
}
