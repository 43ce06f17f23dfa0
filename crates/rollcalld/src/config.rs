use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Daemon configuration: a TOML file with defaults, overridable per key
/// by `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// A face matches only when confidence is strictly above this.
    pub confidence_threshold: f32,
    /// Seconds before the known-face registry must be reloaded.
    pub cache_ttl_secs: u64,
    /// Process every n-th captured frame.
    pub frame_skip_rate: u32,
    /// Shrink factor applied before detection, in (0, 1].
    pub downscale_factor: f32,
    /// Frames discarded at capture start (camera AGC/AE stabilization).
    pub warmup_frames: usize,
    /// JPEG quality of the outgoing stream, 1-100.
    pub jpeg_quality: u8,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            camera_device: "/dev/video0".to_string(),
            db_path: data_dir.join("attendance.db"),
            model_dir: data_dir.join("models"),
            confidence_threshold: 0.6,
            cache_ttl_secs: 300,
            frame_skip_rate: 2,
            downscale_factor: 0.25,
            warmup_frames: 4,
            jpeg_quality: 80,
        }
    }
}

impl Config {
    /// Load configuration: `ROLLCALL_CONFIG` names the file, otherwise
    /// `rollcall.toml` in the working directory is used if present.
    /// Environment overrides win over the file in all cases.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var("ROLLCALL_CONFIG").ok().map(PathBuf::from);
        let path = explicit.or_else(|| {
            let default = PathBuf::from("rollcall.toml");
            default.exists().then_some(default)
        });

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        tracing::info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Ok(v) = std::env::var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        env_parse("ROLLCALL_CONFIDENCE_THRESHOLD", &mut self.confidence_threshold);
        env_parse("ROLLCALL_CACHE_TTL_SECS", &mut self.cache_ttl_secs);
        env_parse("ROLLCALL_FRAME_SKIP_RATE", &mut self.frame_skip_rate);
        env_parse("ROLLCALL_DOWNSCALE_FACTOR", &mut self.downscale_factor);
        env_parse("ROLLCALL_WARMUP_FRAMES", &mut self.warmup_frames);
        env_parse("ROLLCALL_JPEG_QUALITY", &mut self.jpeg_quality);
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_skip_rate < 1 {
            bail!("frame_skip_rate must be at least 1");
        }
        if !(self.downscale_factor > 0.0 && self.downscale_factor <= 1.0) {
            bail!("downscale_factor must be in (0, 1]");
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            bail!("confidence_threshold must be in [0, 1]");
        }
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            bail!("jpeg_quality must be in 1-100");
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Path to the face detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(rollcall_vision::DETECTOR_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the face embedding model.
    pub fn encoder_model_path(&self) -> String {
        self.model_dir
            .join(rollcall_vision::ENCODER_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Some(value) = std::env::var(key).ok().and_then(|v| v.parse().ok()) {
        *target = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_zero_skip_rate_rejected() {
        let config = Config {
            frame_skip_rate: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_downscale_factor_bounds() {
        for bad in [0.0, -0.5, 1.5] {
            let config = Config {
                downscale_factor: bad,
                ..Config::default()
            };
            assert!(config.validate().is_err(), "factor {bad} should be rejected");
        }
        let config = Config {
            downscale_factor: 1.0,
            ..Config::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_threshold_bounds() {
        let config = Config {
            confidence_threshold: 1.2,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let parsed: Config = toml::from_str(
            r#"
            camera_device = "/dev/video7"
            confidence_threshold = 0.5
            frame_skip_rate = 3
            "#,
        )
        .unwrap();
        assert_eq!(parsed.camera_device, "/dev/video7");
        assert_eq!(parsed.frame_skip_rate, 3);
        // Unset keys fall back to defaults.
        assert_eq!(parsed.cache_ttl_secs, 300);
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(toml::from_str::<Config>("no_such_key = 1").is_err());
    }
}
