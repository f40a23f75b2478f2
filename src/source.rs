use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::frame::Frame;
use crate::queue::FrameQueue;

pub trait FrameSource: Send {
    /// `Ok(None)` at end of stream.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn describe(&self) -> String;
}

pub struct JsonLinesSource {
    reader: Box<dyn BufRead + Send>,
    label: String,
    line: usize,
    skipped: usize,
}

impl JsonLinesSource {
    /// `-` reads stdin.
    pub fn open(path: &Path) -> Result<Self> {
        if path.as_os_str() == "-" {
            return Ok(Self::from_reader(BufReader::new(io::stdin()), "stdin"));
        }
        let f = File::open(path).with_context(|| format!("open frame source {}", path.display()))?;
        Ok(Self::from_reader(BufReader::new(f), &path.display().to_string()))
    }

    pub fn from_reader<R: BufRead + Send + 'static>(reader: R, label: &str) -> Self {
        Self {
            reader: Box::new(reader),
            label: label.to_string(),
            line: 0,
            skipped: 0,
        }
    }

    #[cfg(test)]
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl FrameSource for JsonLinesSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut buf = String::new();
        loop {
            buf.clear();
            if self.reader.read_line(&mut buf)? == 0 {
                if self.skipped > 0 {
                    warn!("{}: {} malformed lines skipped", self.label, self.skipped);
                }
                return Ok(None);
            }
            self.line += 1;
            let line = buf.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Frame>(line) {
                Ok(f) => return Ok(Some(f)),
                Err(e) => {
                    // unparseable lines never reach the state machine
                    self.skipped += 1;
                    warn!("{}:{}: skipping malformed frame: {e}", self.label, self.line);
                }
            }
        }
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Pump `source` into `queue` on a background thread. The queue is closed
/// when the source ends or fails.
pub fn spawn_reader(mut source: Box<dyn FrameSource>, queue: Arc<FrameQueue>) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("frame-reader".into())
        .spawn(move || {
            info!("frames: reading from {}", source.describe());
            let mut n = 0u64;
            loop {
                match source.next_frame() {
                    Ok(Some(f)) => {
                        n += 1;
                        if !queue.push(f) {
                            debug!("frames: queue closed, reader exiting");
                            break;
                        }
                    }
                    Ok(None) => {
                        info!("frames: {} ended after {n} frames", source.describe());
                        break;
                    }
                    Err(e) => {
                        warn!("frames: {} failed: {e:#}", source.describe());
                        break;
                    }
                }
            }
            queue.close();
        })?;
    Ok(handle)
}
