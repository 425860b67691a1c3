use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use rollcall_core::KioskConfig;
use rollcall_hw::CaptureSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const DEFAULT_CONFIG_PATH: &str = "/etc/rollcall/rollcall.toml";

/// Which message bus the control interface is served on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bus {
    System,
    Session,
}

impl FromStr for Bus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "system" => Ok(Bus::System),
            "session" => Ok(Bus::Session),
            other => bail!("unknown bus {other:?} (expected system or session)"),
        }
    }
}

/// Daemon configuration: optional TOML file, then `ROLLCALL_*` overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the recognition service.
    pub recognition_url: String,
    /// Path to the SQLite attendance journal.
    pub db_path: PathBuf,
    /// Local time of day after which marks are recorded as late ("HH:MM").
    pub late_after: Option<String>,
    pub bus: Bus,
    /// Start a session as soon as the daemon is up.
    pub autostart: bool,
    pub camera: CaptureSettings,
    pub kiosk: KioskConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recognition_url: "http://127.0.0.1:8000".to_string(),
            db_path: PathBuf::from("/var/lib/rollcall/attendance.db"),
            late_after: None,
            bus: Bus::System,
            autostart: true,
            camera: CaptureSettings::default(),
            kiosk: KioskConfig::default(),
        }
    }
}

impl Config {
    /// Load from `ROLLCALL_CONFIG` (or the default path when present), then
    /// apply environment overrides and validate.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var("ROLLCALL_CONFIG").ok().map(PathBuf::from);
        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `ROLLCALL_*` overrides looked up through `var`.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        let camera = &mut self.camera;
        override_with(&var, "ROLLCALL_CAMERA_DEVICE", &mut camera.device)?;
        override_with(&var, "ROLLCALL_CAMERA_WIDTH", &mut camera.width)?;
        override_with(&var, "ROLLCALL_CAMERA_HEIGHT", &mut camera.height)?;
        override_with(&var, "ROLLCALL_WARMUP_FRAMES", &mut camera.warmup_frames)?;
        override_flag(&var, "ROLLCALL_AUTO_ADJUST_LIGHTING", &mut camera.auto_adjust_lighting);
        override_with(&var, "ROLLCALL_JPEG_QUALITY", &mut camera.jpeg_quality)?;

        let kiosk = &mut self.kiosk;
        override_with(&var, "ROLLCALL_CONFIDENCE_THRESHOLD", &mut kiosk.confidence_threshold)?;
        override_flag(&var, "ROLLCALL_LIVENESS_DETECTION", &mut kiosk.liveness_detection);
        override_with(&var, "ROLLCALL_RECOGNITION_TIMEOUT_SECS", &mut kiosk.recognition_timeout_secs)?;
        override_with(&var, "ROLLCALL_PRESENCE_PERIOD_MS", &mut kiosk.presence_period_ms)?;
        override_with(&var, "ROLLCALL_RECOGNITION_PERIOD_MS", &mut kiosk.recognition_period_ms)?;
        override_with(&var, "ROLLCALL_COOLDOWN_MS", &mut kiosk.cooldown_ms)?;
        override_with(&var, "ROLLCALL_MAX_FACES", &mut kiosk.max_faces_per_frame)?;

        override_with(&var, "ROLLCALL_RECOGNITION_URL", &mut self.recognition_url)?;
        override_with(&var, "ROLLCALL_DB_PATH", &mut self.db_path)?;
        override_with(&var, "ROLLCALL_BUS", &mut self.bus)?;
        override_flag(&var, "ROLLCALL_AUTOSTART", &mut self.autostart);
        if let Some(late) = var("ROLLCALL_LATE_AFTER") {
            self.late_after = (!late.is_empty()).then_some(late);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.kiosk.validate()?;
        if self.camera.jpeg_quality == 0 || self.camera.jpeg_quality > 100 {
            bail!("jpeg_quality must be within 1..=100, got {}", self.camera.jpeg_quality);
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            bail!("camera resolution must be non-zero");
        }
        self.late_after()?;
        Ok(())
    }

    /// Parsed late-after time, if configured.
    pub fn late_after(&self) -> Result<Option<NaiveTime>> {
        let Some(raw) = self.late_after.as_deref() else {
            return Ok(None);
        };
        let time = NaiveTime::parse_from_str(raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
            .with_context(|| format!("late_after must be HH:MM, got {raw:?}"))?;
        Ok(Some(time))
    }
}

fn override_with<T>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = var(key) {
        *slot = raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}"))?;
    }
    Ok(())
}

/// Any value other than `0`, `false`, `no` or `off` turns a flag on.
fn override_flag(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut bool) {
    if let Some(raw) = var(key) {
        *slot = !matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "no" | "off"
        );
    }
}
