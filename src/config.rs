use anyhow::{Result, anyhow};
use directories::UserDirs;
use log::{info, warn};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
    sync::mpsc::Sender,
};

use crate::error::ProfileError;

/// Confidence floor below which a hand is treated as not tracked at all.
/// Independent of the active profile.
pub const MIN_CONFIDENCE: f32 = 0.55;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileName {
    Default,
    Precision,
    Chill,
}

impl ProfileName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "Default",
            Self::Precision => "Precision",
            Self::Chill => "Chill",
        }
    }
}

impl fmt::Display for ProfileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileName {
    type Err = ProfileError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "precision" => Ok(Self::Precision),
            "chill" => Ok(Self::Chill),
            _ => Err(ProfileError::UnknownPreset(s.to_string())),
        }
    }
}

/// Tuning for one session. Immutable while the session runs.
///
/// Distances are in palm widths (index MCP to pinky MCP), positions in
/// normalized camera coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: ProfileName,
    pub close_threshold: f32,
    pub open_threshold: f32,
    pub min_dwell_ms: u64,
    pub tap_max_ms: u64,
    /// Tracked-point travel allowed for a tap, normalized units.
    pub tap_move_tol: f32,
    pub panic_hold_ms: u64,
    /// Fingertip to palm-center radius for the fist predicate, palm widths.
    pub fist_radius: f32,
    /// Wheel ticks per normalized unit of vertical hand travel.
    pub scroll_sensitivity: f32,
    /// Pointer pixels per normalized unit of hand travel.
    pub move_sensitivity: f32,
    /// EMA weight of the newest landmark sample, `(0, 1]`.
    pub smoothing_factor: f32,
    pub lost_grace_ms: u64,
    /// Pointer freeze after a left press, so taps land where they started.
    pub click_settle_ms: u64,
    /// Half-life of scroll momentum after release; 0 turns momentum off.
    pub scroll_half_life_ms: u64,
    #[serde(default)]
    pub invert_scroll: bool,
}

impl Profile {
    pub fn preset(name: ProfileName) -> Self {
        match name {
            ProfileName::Default => Self {
                name,
                close_threshold: 0.30,
                open_threshold: 0.45,
                min_dwell_ms: 50,
                tap_max_ms: 170,
                tap_move_tol: 0.02,
                panic_hold_ms: 1000,
                fist_radius: 0.9,
                scroll_sensitivity: 40.0,
                move_sensitivity: 2400.0,
                smoothing_factor: 0.5,
                lost_grace_ms: 120,
                click_settle_ms: 60,
                scroll_half_life_ms: 320,
                invert_scroll: false,
            },
            ProfileName::Precision => Self {
                name,
                close_threshold: 0.28,
                open_threshold: 0.45,
                min_dwell_ms: 60,
                tap_max_ms: 180,
                tap_move_tol: 0.015,
                panic_hold_ms: 1000,
                fist_radius: 0.9,
                scroll_sensitivity: 30.0,
                move_sensitivity: 1500.0,
                smoothing_factor: 0.35,
                lost_grace_ms: 110,
                click_settle_ms: 80,
                scroll_half_life_ms: 0,
                invert_scroll: false,
            },
            ProfileName::Chill => Self {
                name,
                close_threshold: 0.32,
                open_threshold: 0.50,
                min_dwell_ms: 50,
                tap_max_ms: 170,
                tap_move_tol: 0.025,
                panic_hold_ms: 1000,
                fist_radius: 0.9,
                scroll_sensitivity: 50.0,
                move_sensitivity: 3000.0,
                smoothing_factor: 0.6,
                lost_grace_ms: 130,
                click_settle_ms: 50,
                scroll_half_life_ms: 420,
                invert_scroll: false,
            },
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ProfileError> {
        let positive = |field: &'static str, v: f32| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(ProfileError::OutOfRange {
                    field,
                    value: v as f64,
                })
            }
        };
        positive("close_threshold", self.close_threshold)?;
        positive("open_threshold", self.open_threshold)?;
        if self.open_threshold <= self.close_threshold {
            return Err(ProfileError::ThresholdOrder {
                close: self.close_threshold,
                open: self.open_threshold,
            });
        }
        positive("tap_move_tol", self.tap_move_tol)?;
        positive("fist_radius", self.fist_radius)?;
        positive("scroll_sensitivity", self.scroll_sensitivity)?;
        positive("move_sensitivity", self.move_sensitivity)?;
        positive("smoothing_factor", self.smoothing_factor)?;
        if self.smoothing_factor > 1.0 {
            return Err(ProfileError::OutOfRange {
                field: "smoothing_factor",
                value: self.smoothing_factor as f64,
            });
        }
        for (field, v) in [
            ("tap_max_ms", self.tap_max_ms),
            ("panic_hold_ms", self.panic_hold_ms),
            ("lost_grace_ms", self.lost_grace_ms),
        ] {
            if v == 0 {
                return Err(ProfileError::OutOfRange { field, value: 0.0 });
            }
        }
        if self.tap_max_ms < self.min_dwell_ms {
            // A tap could never be classified.
            return Err(ProfileError::OutOfRange {
                field: "tap_max_ms",
                value: self.tap_max_ms as f64,
            });
        }
        Ok(())
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self::preset(ProfileName::Default)
    }
}

// --------- on-disk profile files ----------

#[derive(Debug, Clone, Deserialize)]
pub struct Meta {
    pub preset: String,
    #[serde(default)]
    pub advanced: bool,
}

/// Numeric overrides; only honoured when `meta.advanced = true`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Advanced {
    pub close_threshold: Option<f32>,
    pub open_threshold: Option<f32>,
    pub min_dwell_ms: Option<u64>,
    pub tap_max_ms: Option<u64>,
    pub tap_move_tol: Option<f32>,
    pub panic_hold_ms: Option<u64>,
    pub fist_radius: Option<f32>,
    pub scroll_sensitivity: Option<f32>,
    pub move_sensitivity: Option<f32>,
    pub smoothing_factor: Option<f32>,
    pub lost_grace_ms: Option<u64>,
    pub click_settle_ms: Option<u64>,
    pub scroll_half_life_ms: Option<u64>,
    pub invert_scroll: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileFile {
    pub meta: Meta,
    #[serde(default)]
    pub advanced: Advanced,
}

impl ProfileFile {
    pub fn resolve(&self) -> std::result::Result<Profile, ProfileError> {
        let mut p = Profile::preset(self.meta.preset.parse()?);
        if self.meta.advanced {
            let a = &self.advanced;
            macro_rules! apply {
                ($($f:ident),*) => { $( if let Some(v) = a.$f { p.$f = v; } )* };
            }
            apply!(
                close_threshold,
                open_threshold,
                min_dwell_ms,
                tap_max_ms,
                tap_move_tol,
                panic_hold_ms,
                fist_radius,
                scroll_sensitivity,
                move_sensitivity,
                smoothing_factor,
                lost_grace_ms,
                click_settle_ms,
                scroll_half_life_ms,
                invert_scroll
            );
        }
        p.validate()?;
        Ok(p)
    }
}

pub fn parse_profile(txt: &str) -> Result<Profile> {
    let file: ProfileFile = toml::from_str(txt)?;
    Ok(file.resolve()?)
}

// ------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DaemonConfigState {
    pub active_name: String,
    pub profile: Profile,
    pub profiles_dir: PathBuf,
    pub active_ptr: PathBuf,
}

pub fn config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .ok_or_else(|| anyhow!("cannot resolve home directory"))?
        .home_dir()
        .to_path_buf();
    Ok(home.join(".config").join("pinchpad"))
}

pub fn sessions_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .ok_or_else(|| anyhow!("cannot resolve home directory"))?
        .home_dir()
        .to_path_buf();
    Ok(home.join(".cache").join("pinchpad").join("sessions"))
}

const BUILTIN_PROFILES: [(&str, &str); 3] = [
    ("default", include_str!("../profiles/default.toml")),
    ("precision", include_str!("../profiles/precision.toml")),
    ("chill", include_str!("../profiles/chill.toml")),
];

impl DaemonConfigState {
    pub fn load_or_install_default() -> Result<Self> {
        Self::load_or_install_in(config_dir()?)
    }

    pub fn load_or_install_in(cfgdir: PathBuf) -> Result<Self> {
        let profdir = cfgdir.join("profiles");
        fs::create_dir_all(&profdir)?;

        for (name, text) in BUILTIN_PROFILES {
            let path = profdir.join(format!("{name}.toml"));
            if !path.exists() {
                fs::write(&path, text)?;
                info!("installed {name} profile at {}", path.display());
            }
        }

        let active_ptr = cfgdir.join("active");
        if !active_ptr.exists() {
            let mut f = fs::File::create(&active_ptr)?;
            f.write_all(b"default")?;
        }

        let active_name = fs::read_to_string(&active_ptr)?.trim().to_string();
        let profile = load_profile(&profdir, &active_name)?;

        Ok(Self {
            active_name,
            profile,
            profiles_dir: profdir,
            active_ptr,
        })
    }

    /// Re-reads the active profile; on error the last good profile stays in place.
    pub fn reload(&mut self) -> Result<()> {
        self.profile = load_profile(&self.profiles_dir, &self.active_name)?;
        Ok(())
    }

    pub fn set_active(&mut self, name: &str) -> Result<()> {
        let p = self.profiles_dir.join(format!("{name}.toml"));
        if !p.exists() {
            return Err(anyhow!("profile not found: {}", p.display()));
        }
        let profile = load_profile(&self.profiles_dir, name)?;
        fs::write(&self.active_ptr, name.as_bytes())?;
        self.active_name = name.to_string();
        self.profile = profile;
        Ok(())
    }

    #[cfg(test)]
    pub fn active_profile_path(&self) -> PathBuf {
        self.profiles_dir.join(format!("{}.toml", self.active_name))
    }

    pub fn list_profiles(&self) -> Vec<String> {
        let mut v = Vec::new();
        if let Ok(rd) = fs::read_dir(&self.profiles_dir) {
            for e in rd.flatten() {
                let path = e.path();
                if path.extension().is_some_and(|ext| ext == "toml") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        v.push(stem.to_string());
                    }
                }
            }
        }
        v.sort();
        v
    }

    pub fn doctor_report(&self) -> serde_json::Value {
        let uinput_ok = Path::new("/dev/uinput").exists();
        let in_input_group = check_in_input_group();
        serde_json::json!({
            "uinput_present": uinput_ok,
            "input_group_member": in_input_group,
            "profiles_dir": self.profiles_dir,
            "active_profile": self.active_name,
            "preset": self.profile.name,
            "hints": {
                "udev_rule": "/etc/udev/rules.d/80-uinput.rules",
                "add_user_to_input_group": "sudo usermod -aG input $USER && newgrp input"
            }
        })
    }
}

fn load_profile(dir: &Path, name: &str) -> Result<Profile> {
    let path = dir.join(format!("{name}.toml"));
    let txt = fs::read_to_string(&path)
        .map_err(|e| anyhow!("failed to read {}: {e}", path.display()))?;
    parse_profile(&txt).map_err(|e| anyhow!("failed to load {}: {e}", path.display()))
}

/// Signals `tx` whenever a file in the profiles directory is written.
/// Keep the returned watcher alive for as long as notifications are wanted.
pub fn watch_profiles(dir: &Path, tx: Sender<PathBuf>) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(ev) if ev.kind.is_modify() || ev.kind.is_create() => {
                for p in ev.paths {
                    let _ = tx.send(p);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("profile watcher: {e}"),
        }
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

fn check_in_input_group() -> bool {
    let Ok(s) = fs::read_to_string("/etc/group") else {
        return false;
    };
    let Ok(user) = whoami::fallible::username() else {
        return false;
    };
    s.lines()
        .filter(|line| line.starts_with("input:"))
        .any(|line| {
            line.split(':')
                .nth(3)
                .unwrap_or("")
                .split(',')
                .any(|u| u == user)
        })
}
