use anyhow::{Result, anyhow};
use pico_args::Arguments;
use std::{
    env,
    ffi::OsString,
    path::{Path, PathBuf},
    process::Command,
};

use crate::actions::{MemorySink, OutputSink, UinputSink};
use crate::config;
use crate::event::{Button, PointerEvent, ReleaseKind};
use crate::ipc::{self, DaemonOptions};
use crate::session::{Replayer, SessionRecord};

pub fn run() -> Result<()> {
    let mut pargs = Arguments::from_env();

    // Hidden daemon mode (spawned by `start`)
    if pargs.contains("--daemon") {
        let opts = daemon_options(&mut pargs)?;
        return ipc::run_daemon(opts);
    }

    // No args -> general help
    if env::args().len() == 1 {
        print_help();
        return Ok(());
    }

    // Flags-based help (-h/--help)
    if pargs.contains("-h") || pargs.contains("--help") {
        print_help();
        return Ok(());
    }

    // First free arg is the subcommand
    let subcmd: Option<String> = pargs.free_from_str().ok();

    match subcmd.as_deref() {
        Some("help") => {
            let topic: Option<String> = pargs.free_from_str().ok();
            if let Some(t) = topic {
                print_subcmd_help(&t);
            } else {
                print_help();
            }
            Ok(())
        }

        Some("start") => {
            let opts = daemon_options(&mut pargs)?;
            let exe = std::env::current_exe()?;
            let mut cmd = Command::new(exe);
            cmd.arg("--daemon");
            if let Some(f) = &opts.frames {
                // the daemon does not share our working directory guarantees
                cmd.arg("--frames").arg(absolute(f)?);
            }
            if let Some(dir) = &opts.record {
                cmd.arg("--record").arg(absolute(dir)?);
            }
            if opts.dry_run {
                cmd.arg("--dry-run");
            }
            let child = cmd.spawn()?;
            println!("pinchpad: started daemon (pid={})", child.id());
            Ok(())
        }

        Some(op @ ("stop" | "status" | "engage" | "disengage" | "reload" | "list" | "doctor")) => {
            let op = if op == "stop" { "shutdown" } else { op };
            let r = ipc::client_request(serde_json::json!({ "op": op }))?;
            print_response(&r);
            Ok(())
        }

        Some("use") => {
            let name: String = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: pinchpad use <profile_name>"))?;
            let r = ipc::client_request(serde_json::json!({"op":"use","profile":name}))?;
            print_response(&r);
            Ok(())
        }

        Some("emit") => {
            // usage:
            //   pinchpad emit move 40 -10
            //   pinchpad emit click right
            //   pinchpad emit scroll 3
            //   pinchpad emit release-all
            let what: String = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: pinchpad emit <move|click|scroll|release-all> ..."))?;
            let events = match what.as_str() {
                "move" => {
                    let dx: i32 = pargs
                        .free_from_str()
                        .map_err(|_| anyhow!("usage: pinchpad emit move <dx> <dy>"))?;
                    let dy: i32 = pargs
                        .free_from_str()
                        .map_err(|_| anyhow!("usage: pinchpad emit move <dx> <dy>"))?;
                    vec![PointerEvent::Move { dx, dy }]
                }
                "click" => {
                    let btn: String = pargs
                        .free_from_str()
                        .map_err(|_| anyhow!("usage: pinchpad emit click <left|right>"))?;
                    let button = match btn.to_ascii_lowercase().as_str() {
                        "left" => Button::Left,
                        "right" => Button::Right,
                        other => return Err(anyhow!("unknown mouse button: {other}")),
                    };
                    vec![
                        PointerEvent::ButtonDown { button },
                        PointerEvent::ButtonUp {
                            button,
                            release: ReleaseKind::Tap,
                        },
                    ]
                }
                "scroll" => {
                    let dy: i32 = pargs
                        .free_from_str()
                        .map_err(|_| anyhow!("usage: pinchpad emit scroll <ticks>"))?;
                    vec![PointerEvent::Scroll { dy }]
                }
                "release-all" => vec![PointerEvent::ReleaseAll],
                other => return Err(anyhow!("unknown emit kind: {other}")),
            };
            let mut sink = UinputSink::new()?;
            sink.apply_batch(&events)?;
            println!("ok: emitted {events:?}");
            Ok(())
        }

        Some("replay") => {
            let path: PathBuf = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: pinchpad replay <session.jsonl>"))?;
            replay(&path)
        }

        Some(other) => {
            eprintln!("unknown subcommand: {other}\n");
            print_help();
            Ok(())
        }

        None => {
            print_help();
            Ok(())
        }
    }
}

fn daemon_options(pargs: &mut Arguments) -> Result<DaemonOptions> {
    let frames: Option<PathBuf> = pargs.opt_value_from_os_str("--frames", to_path)?;
    let record = if pargs.contains("--record-default") {
        Some(config::sessions_dir()?)
    } else {
        pargs.opt_value_from_os_str("--record", to_path)?
    };
    Ok(DaemonOptions {
        frames,
        record,
        dry_run: pargs.contains("--dry-run"),
    })
}

fn to_path(s: &std::ffi::OsStr) -> Result<PathBuf, std::convert::Infallible> {
    Ok(PathBuf::from(s))
}

fn absolute(p: &Path) -> Result<OsString> {
    if p.as_os_str() == "-" || p.is_absolute() {
        return Ok(p.as_os_str().to_os_string());
    }
    Ok(env::current_dir()?.join(p).into_os_string())
}

/// Re-run a recorded session and compare every emitted event.
fn replay(path: &Path) -> Result<()> {
    let record = SessionRecord::load(path)?;
    let checked = Replayer::verify(&record)?;

    let mut replayer = Replayer::new(&record.header);
    let mut sink = MemorySink::new();
    for entry in &record.entries {
        sink.apply_batch(&replayer.feed(&entry.input))?;
    }
    let events = sink.events();
    let count = |f: fn(&PointerEvent) -> bool| events.iter().filter(|e| f(e)).count();

    let summary = serde_json::json!({
        "ok": true,
        "data": {
            "profile": record.header.profile.name,
            "entries": checked,
            "clicks": count(|e| matches!(e, PointerEvent::ButtonDown { .. })),
            "moves": count(|e| matches!(e, PointerEvent::Move { .. })),
            "scrolls": count(|e| matches!(e, PointerEvent::Scroll { .. })),
            "release_all": count(|e| matches!(e, PointerEvent::ReleaseAll)),
            "final_mode": replayer.state().mode(),
        }
    });
    print_response(&summary);
    Ok(())
}

fn print_help() {
    println!(
        r#"pinchpad: hand-gesture pointer daemon

USAGE:
  pinchpad help [command]                 Show general or command-specific help
  pinchpad start [--frames PATH] [--record DIR | --record-default] [--dry-run]
                                          Start the daemon
  pinchpad stop                           Stop the daemon (releases all buttons)
  pinchpad status                         Show gesture state and queue stats
  pinchpad engage                         Leave safe-off and resume gestures
  pinchpad disengage                      Release everything and go safe-off
  pinchpad reload                         Reload active profile
  pinchpad use <name>                     Switch active profile
  pinchpad list                           List profiles
  pinchpad doctor                         Diagnose uinput permissions
  pinchpad emit move <dx> <dy>            Move the pointer
  pinchpad emit click <left|right>        Emit a mouse click
  pinchpad emit scroll <ticks>            Emit vertical scroll (+ is up)
  pinchpad emit release-all               Release both buttons
  pinchpad replay <session.jsonl>         Verify a recorded session replays identically

TIPS:
  - Frames: one JSON object per line, e.g. from the hand tracker via a FIFO
  - Profiles: ~/.config/pinchpad/profiles
  - Active profile pointer: ~/.config/pinchpad/active
  - Sessions (--record-default): ~/.cache/pinchpad/sessions
  - Log level: PINCHPAD_LOG=debug
"#
    );
}

fn print_subcmd_help(cmd: &str) {
    match cmd {
        "start" => println!(
            "usage: pinchpad start [--frames PATH] [--record DIR | --record-default] [--dry-run]\n\
             Starts the background daemon. PATH is a JSON-lines frame stream ('-' for stdin).\n\
             --record writes session files for `pinchpad replay`. --dry-run logs events instead of injecting them."
        ),
        "stop" => println!("usage: pinchpad stop\nReleases all buttons and stops the running daemon."),
        "status" => println!(
            "usage: pinchpad status\nShows mode, per-channel phases, held buttons, queue stats and recording file."
        ),
        "engage" => println!(
            "usage: pinchpad engage\nRe-arms gestures after a fail-safe (tracking loss, panic fist, disengage)."
        ),
        "disengage" => println!(
            "usage: pinchpad disengage\nReleases all buttons and enters safe-off until `pinchpad engage`."
        ),
        "reload" => println!(
            "usage: pinchpad reload\nReloads the current profile; keeps last good on error."
        ),
        "use" => {
            println!("usage: pinchpad use <name>\nSwitches active profile to <name> and reloads.")
        }
        "list" => {
            println!("usage: pinchpad list\nLists available profiles.")
        }
        "doctor" => println!(
            "usage: pinchpad doctor\nChecks /dev/uinput and input group membership."
        ),
        "emit" => println!(
            "usage:\n  pinchpad emit move <dx> <dy>\n  pinchpad emit click <left|right>\n  pinchpad emit scroll <ticks>\n  pinchpad emit release-all"
        ),
        "replay" => println!(
            "usage: pinchpad replay <session.jsonl>\nRe-runs a recorded session and fails on the first divergent event."
        ),
        _ => {
            eprintln!("unknown command: {cmd}\n");
            print_help();
        }
    }
}

fn print_response(v: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(v).unwrap_or_default());
}
