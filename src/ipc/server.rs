use anyhow::{Result, anyhow};
use log::{error, info, warn};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use std::{
    io::{BufRead, BufReader, Write},
    os::unix::net::{UnixListener, UnixStream},
    path::PathBuf,
    sync::{
        Arc, Mutex,
        mpsc::{self, Sender},
    },
    thread,
    time::Duration,
};

use super::pipeline::{Control, Pipeline, PipelineStatus};
use super::runtime::socket_path;
use crate::actions::{TimedSink, UinputSink};
use crate::config::{self, DaemonConfigState};
use crate::queue::FrameQueue;
use crate::source::{JsonLinesSource, spawn_reader};

/// Deadline for one batch of events to reach the OS.
const SINK_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    /// JSON-lines landmark stream; `-` for stdin.
    pub frames: Option<PathBuf>,
    /// Record sessions here (`--record-default` picks the cache dir).
    pub record: Option<PathBuf>,
    /// Log events instead of injecting them.
    pub dry_run: bool,
}

pub fn run_daemon(opts: DaemonOptions) -> Result<()> {
    // socket
    let sock = socket_path()?;
    if sock.exists() {
        let _ = std::fs::remove_file(&sock);
    }
    let listener = UnixListener::bind(&sock)?;
    info!("daemon: listening on {}", sock.display());

    // state
    let mut cfg = DaemonConfigState::load_or_install_default()?;
    info!("daemon: active profile '{}'", cfg.active_name);

    // output
    let sink = if opts.dry_run {
        UinputSink::noop()
    } else {
        UinputSink::new().unwrap_or_else(|e| {
            warn!("uinput unavailable ({e}); running in NO-OP mode");
            UinputSink::noop()
        })
    };
    let sink_noop = sink.is_noop();
    let sink = TimedSink::spawn(sink, SINK_TIMEOUT)?;

    // input
    let queue = Arc::new(FrameQueue::default());
    match &opts.frames {
        Some(path) => {
            let src = JsonLinesSource::open(path)?;
            spawn_reader(Box::new(src), Arc::clone(&queue))?;
        }
        None => warn!("daemon: no frame source given; gestures stay idle"),
    }

    let pipeline = Pipeline::start(cfg.profile.clone(), sink, Arc::clone(&queue), opts.record.clone())?;

    // channels
    let (tx_req, rx_req) = mpsc::channel::<IpcMsg>();
    let (tx_fs, rx_fs) = mpsc::channel::<PathBuf>();

    // keep alive for the daemon's lifetime
    let _watcher = match config::watch_profiles(&cfg.profiles_dir, tx_fs) {
        Ok(w) => Some(w),
        Err(e) => {
            warn!("profile watcher disabled: {e}");
            None
        }
    };

    {
        let tx = tx_req.clone();
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        thread::Builder::new().name("signals".into()).spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!("daemon: signal {sig}, shutting down");
                let _ = tx.send(IpcMsg::Shutdown);
            }
        })?;
    }

    let shared = Arc::new(Mutex::new(SharedView {
        active_profile: cfg.active_name.clone(),
        profiles: cfg.list_profiles(),
        doctor: cfg.doctor_report(),
        sink_noop,
        status: pipeline.status(),
    }));

    // accept loop
    listener.set_nonblocking(true)?;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                let tx = tx_req.clone();
                let view = Arc::clone(&shared);
                thread::spawn(move || {
                    if let Err(e) = handle_client(stream, &view, &tx) {
                        error!("ipc client error: {e}");
                    }
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("accept failed: {e}"),
        }

        // debounce editor save bursts into one reload
        let mut touched = false;
        while let Ok(path) = rx_fs.try_recv() {
            touched |= path.file_stem().and_then(|s| s.to_str()) == Some(cfg.active_name.as_str());
        }
        let mut refresh = touched;
        if touched {
            match cfg.reload() {
                Ok(()) => {
                    info!("active profile changed on disk, reloaded");
                    pipeline.send(Control::SetProfile(cfg.profile.clone()));
                }
                Err(e) => error!("reload failed, keeping last good profile: {e}"),
            }
        }

        let mut stop = false;
        while let Ok(msg) = rx_req.try_recv() {
            refresh |= matches!(msg, IpcMsg::Reload(_) | IpcMsg::UseProfile(..));
            match msg {
                IpcMsg::Engage => pipeline.send(Control::Engage),
                IpcMsg::Disengage => pipeline.send(Control::Disengage),
                IpcMsg::Reload(reply) => {
                    let res = cfg.reload().map(|_| cfg.active_name.clone());
                    match &res {
                        Ok(_) => {
                            pipeline.send(Control::SetProfile(cfg.profile.clone()));
                            info!("profile reloaded");
                        }
                        Err(e) => error!("reload failed: {e}"),
                    }
                    let _ = reply.send(res.map_err(|e| e.to_string()));
                }
                IpcMsg::UseProfile(name, reply) => {
                    let res = cfg.set_active(&name).map(|_| cfg.active_name.clone());
                    match &res {
                        Ok(_) => {
                            pipeline.send(Control::SetProfile(cfg.profile.clone()));
                            info!("switched active profile to {}", cfg.active_name);
                        }
                        Err(e) => error!("use profile failed: {e}"),
                    }
                    let _ = reply.send(res.map_err(|e| e.to_string()));
                }
                IpcMsg::Shutdown => stop = true,
            }
        }

        if let Ok(mut v) = shared.lock() {
            if refresh {
                v.active_profile = cfg.active_name.clone();
                v.profiles = cfg.list_profiles();
                v.doctor = cfg.doctor_report();
            }
            v.status = pipeline.status();
        }

        if stop {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }

    info!("daemon: shutting down");
    queue.close();
    pipeline.shutdown();
    let _ = std::fs::remove_file(&sock);
    Ok(())
}

/// What client threads may read without touching daemon-owned state.
struct SharedView {
    active_profile: String,
    profiles: Vec<String>,
    doctor: serde_json::Value,
    sink_noop: bool,
    status: Option<PipelineStatus>,
}

enum IpcMsg {
    Engage,
    Disengage,
    Reload(Sender<Result<String, String>>),
    UseProfile(String, Sender<Result<String, String>>),
    Shutdown,
}

fn handle_client(
    mut stream: UnixStream,
    view: &Mutex<SharedView>,
    tx_req: &Sender<IpcMsg>,
) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim().is_empty() {
        return Ok(());
    }
    let req: serde_json::Value = serde_json::from_str(&line)?;
    let send = |msg: IpcMsg| {
        tx_req
            .send(msg)
            .map_err(|_| anyhow!("daemon is shutting down"))
    };
    let op = req.get("op").and_then(|v| v.as_str()).unwrap_or("");

    let read_view = |f: &dyn Fn(&SharedView) -> serde_json::Value| -> serde_json::Value {
        match view.lock() {
            Ok(v) => f(&v),
            Err(_) => serde_json::json!({"ok": false, "error": "daemon state unavailable"}),
        }
    };

    let resp = match op {
        "status" => read_view(&|v| {
            let sink = if v.sink_noop { "noop" } else { "uinput" };
            serde_json::json!({"ok": true, "data": {
                "active_profile": v.active_profile,
                "socket": socket_path().ok(),
                "sink": sink,
                "pipeline": v.status,
            }})
        }),
        "engage" => {
            send(IpcMsg::Engage)?;
            serde_json::json!({"ok": true, "data": "engaged"})
        }
        "disengage" => {
            send(IpcMsg::Disengage)?;
            serde_json::json!({"ok": true, "data": "disengaged"})
        }
        "reload" => {
            let (tx, rx) = mpsc::channel();
            send(IpcMsg::Reload(tx))?;
            reply_json(rx.recv_timeout(Duration::from_secs(2)))
        }
        "use" => {
            let name = req.get("profile").and_then(|v| v.as_str()).unwrap_or("");
            if name.is_empty() {
                serde_json::json!({"ok": false, "error": "missing profile name"})
            } else {
                let (tx, rx) = mpsc::channel();
                send(IpcMsg::UseProfile(name.to_string(), tx))?;
                reply_json(rx.recv_timeout(Duration::from_secs(2)))
            }
        }
        "list" => read_view(&|v| {
            serde_json::json!({"ok": true, "data": {"profiles": v.profiles, "active": v.active_profile}})
        }),
        "doctor" => read_view(&|v| serde_json::json!({"ok": true, "data": v.doctor})),
        "shutdown" => {
            send(IpcMsg::Shutdown)?;
            serde_json::json!({"ok": true, "data": "shutting down"})
        }
        _ => serde_json::json!({"ok": false, "error": format!("unknown op: {op}")}),
    };

    writeln!(stream, "{resp}")?;
    Ok(())
}

fn reply_json(
    res: std::result::Result<std::result::Result<String, String>, mpsc::RecvTimeoutError>,
) -> serde_json::Value {
    match res {
        Ok(Ok(active)) => serde_json::json!({"ok": true, "data": {"active_profile": active}}),
        Ok(Err(e)) => serde_json::json!({"ok": false, "error": e}),
        Err(_) => serde_json::json!({"ok": false, "error": "daemon did not answer"}),
    }
}

// client helper
pub fn client_request(req: serde_json::Value) -> Result<serde_json::Value> {
    let sock = socket_path()?;
    if !sock.exists() {
        return Err(anyhow!(
            "pinchpad daemon is not running (socket missing at {})",
            sock.display()
        ));
    }
    let mut stream = UnixStream::connect(sock)?;
    let line = serde_json::to_string(&req)? + "\n";
    stream.write_all(line.as_bytes())?;
    let mut reader = BufReader::new(stream);
    let mut resp = String::new();
    reader.read_line(&mut resp)?;
    let v: serde_json::Value = serde_json::from_str(&resp)?;
    Ok(v)
}
