use crate::error::{InspectorError, Result};
use crate::source::SourceKind;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct InspectorConfig {
    pub source: SourceSettings,
    pub camera: CameraSettings,
    pub network: NetworkSettings,
    pub file: FileSettings,
    pub recording: RecordingSettings,
    pub inference: InferenceSettings,
    pub training: TrainingSettings,
    pub system: SystemSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceSettings {
    /// Source selected at startup
    #[serde(default = "default_source_kind")]
    pub kind: SourceKind,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraSettings {
    /// Device selector (device index, serial, `/dev/videoN` or `stub://...`)
    #[serde(default = "default_camera_device")]
    pub device: String,

    /// Requested resolution (width, height)
    #[serde(default = "default_camera_resolution")]
    pub resolution: (u32, u32),

    /// Requested frames per second
    #[serde(default = "default_camera_fps")]
    pub fps: u32,

    /// Pixel format (mono8, rgb24, bgr24, mjpeg)
    #[serde(default = "default_pixel_format")]
    pub pixel_format: String,

    /// Exposure time in microseconds
    #[serde(default = "default_exposure_us")]
    pub exposure_us: f64,

    /// Analog gain in dB
    #[serde(default)]
    pub gain: f64,

    #[serde(default)]
    pub auto_exposure: bool,

    #[serde(default)]
    pub auto_gain: bool,

    #[serde(default = "default_gamma")]
    pub gamma: f64,

    #[serde(default)]
    pub brightness: f64,

    #[serde(default = "default_contrast")]
    pub contrast: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NetworkSettings {
    /// Stream URL (rtsp://, http:// or stub://)
    #[serde(default = "default_network_url")]
    pub url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Polling rate when the stream does not report one
    #[serde(default = "default_network_fps")]
    pub fps: u32,

    #[serde(default = "default_network_resolution")]
    pub resolution: (u32, u32),
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FileSettings {
    /// Path to the video file (`.clip`, any container with the gstreamer feature, or stub://)
    #[serde(default = "default_file_path")]
    pub path: String,

    /// Restart from the first frame at end of stream
    #[serde(default = "default_loop_playback")]
    pub loop_playback: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RecordingSettings {
    /// Directory recordings are written to
    #[serde(default = "default_recording_path")]
    pub path: String,

    /// Codec identifier (clip, h264, mjpeg)
    #[serde(default = "default_codec")]
    pub codec: String,

    /// Output frame rate; the source rate is used when unset
    #[serde(default)]
    pub fps: Option<f64>,

    /// Encoder quality 1-100
    #[serde(default = "default_quality")]
    pub quality: u8,

    /// Maximum session length in seconds (0 = unlimited)
    #[serde(default = "default_max_duration")]
    pub max_duration_seconds: u32,

    /// Start a recording automatically while a defect is active
    #[serde(default)]
    pub record_on_defect: bool,

    /// Seconds of footage retained ahead of a recording trigger
    #[serde(default = "default_preroll_seconds")]
    pub preroll_seconds: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct InferenceSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Model descriptor path
    #[serde(default)]
    pub model_path: Option<String>,

    /// Minimum confidence for a prediction to count as a defect
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    /// Concurrent inference jobs before frames are skipped
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TrainingSettings {
    /// Root directory for labelled training snapshots
    #[serde(default = "default_training_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemSettings {
    /// Event bus capacity
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Interval between status log lines in seconds
    #[serde(default = "default_status_interval")]
    pub status_interval_seconds: u32,
}

impl InspectorConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from_file("inspect.toml")
    }

    /// Load configuration from a specific file path (TOML or JSON by extension)
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("source.kind", "hardware_camera")?
            .set_default("camera.device", default_camera_device())?
            .set_default(
                "camera.resolution",
                vec![default_camera_resolution().0, default_camera_resolution().1],
            )?
            .set_default("camera.fps", default_camera_fps())?
            .set_default("camera.pixel_format", default_pixel_format())?
            .set_default("camera.exposure_us", default_exposure_us())?
            .set_default("camera.gain", 0.0)?
            .set_default("camera.auto_exposure", false)?
            .set_default("camera.auto_gain", false)?
            .set_default("camera.gamma", default_gamma())?
            .set_default("camera.brightness", 0.0)?
            .set_default("camera.contrast", default_contrast())?
            .set_default("network.url", default_network_url())?
            .set_default("network.fps", default_network_fps())?
            .set_default(
                "network.resolution",
                vec![default_network_resolution().0, default_network_resolution().1],
            )?
            .set_default("file.path", default_file_path())?
            .set_default("file.loop_playback", default_loop_playback())?
            .set_default("recording.path", default_recording_path())?
            .set_default("recording.codec", default_codec())?
            .set_default("recording.quality", default_quality() as i64)?
            .set_default("recording.max_duration_seconds", default_max_duration())?
            .set_default("recording.record_on_defect", false)?
            .set_default("recording.preroll_seconds", default_preroll_seconds())?
            .set_default("inference.enabled", false)?
            .set_default(
                "inference.confidence_threshold",
                default_confidence_threshold() as f64,
            )?
            .set_default("inference.max_in_flight", default_max_in_flight() as i64)?
            .set_default("training.path", default_training_path())?
            .set_default(
                "system.event_bus_capacity",
                default_event_bus_capacity() as i64,
            )?
            .set_default("system.status_interval_seconds", default_status_interval())?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // INSPECT__CAMERA__FPS=60 style overrides
            .add_source(
                Environment::with_prefix("INSPECT")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: InspectorConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Write the configuration back to disk (JSON for `.json`, TOML otherwise)
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let contents = if is_json {
            serde_json::to_string_pretty(self)?
        } else {
            toml::to_string_pretty(self)?
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, contents)?;

        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.camera.resolution.0 == 0 || self.camera.resolution.1 == 0 {
            return Err(ConfigError::Message(
                "Camera resolution must be greater than 0".to_string(),
            ));
        }

        if self.camera.fps == 0 {
            return Err(ConfigError::Message(
                "Camera fps must be greater than 0".to_string(),
            ));
        }

        if self.network.fps == 0 {
            return Err(ConfigError::Message(
                "Network fps must be greater than 0".to_string(),
            ));
        }

        if self.network.url.trim().is_empty() {
            return Err(ConfigError::Message(
                "Network url cannot be empty".to_string(),
            ));
        }

        if let Some(fps) = self.recording.fps {
            if !(fps > 0.0) {
                return Err(ConfigError::Message(
                    "Recording fps must be greater than 0".to_string(),
                ));
            }
        }

        if self.recording.preroll_seconds == 0 {
            return Err(ConfigError::Message(
                "Recording preroll_seconds must be greater than 0".to_string(),
            ));
        }

        if self.recording.path.trim().is_empty() {
            return Err(ConfigError::Message(
                "Recording path cannot be empty".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.inference.confidence_threshold) {
            return Err(ConfigError::Message(
                "Confidence threshold must be within [0, 1]".to_string(),
            ));
        }

        if self.inference.enabled && self.inference.model_path.is_none() {
            return Err(ConfigError::Message(
                "inference.model_path must be set when inference is enabled".to_string(),
            ));
        }

        if self.inference.max_in_flight == 0 {
            return Err(ConfigError::Message(
                "Inference max_in_flight must be greater than 0".to_string(),
            ));
        }

        if self.training.path.trim().is_empty() {
            return Err(ConfigError::Message(
                "Training path cannot be empty".to_string(),
            ));
        }

        if self.system.event_bus_capacity == 0 {
            return Err(ConfigError::Message(
                "Event bus capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn default_toml() -> Result<String> {
        toml::to_string_pretty(&Self::default()).map_err(InspectorError::from)
    }
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            source: SourceSettings {
                kind: default_source_kind(),
            },
            camera: CameraSettings {
                device: default_camera_device(),
                resolution: default_camera_resolution(),
                fps: default_camera_fps(),
                pixel_format: default_pixel_format(),
                exposure_us: default_exposure_us(),
                gain: 0.0,
                auto_exposure: false,
                auto_gain: false,
                gamma: default_gamma(),
                brightness: 0.0,
                contrast: default_contrast(),
            },
            network: NetworkSettings {
                url: default_network_url(),
                username: None,
                password: None,
                fps: default_network_fps(),
                resolution: default_network_resolution(),
            },
            file: FileSettings {
                path: default_file_path(),
                loop_playback: default_loop_playback(),
            },
            recording: RecordingSettings {
                path: default_recording_path(),
                codec: default_codec(),
                fps: None,
                quality: default_quality(),
                max_duration_seconds: default_max_duration(),
                record_on_defect: false,
                preroll_seconds: default_preroll_seconds(),
            },
            inference: InferenceSettings {
                enabled: false,
                model_path: None,
                confidence_threshold: default_confidence_threshold(),
                max_in_flight: default_max_in_flight(),
            },
            training: TrainingSettings {
                path: default_training_path(),
            },
            system: SystemSettings {
                event_bus_capacity: default_event_bus_capacity(),
                status_interval_seconds: default_status_interval(),
            },
        }
    }
}

// Default value functions
fn default_source_kind() -> SourceKind {
    SourceKind::HardwareCamera
}

fn default_camera_device() -> String {
    "stub://camera".to_string()
}
fn default_camera_resolution() -> (u32, u32) {
    (1280, 1024)
}
fn default_camera_fps() -> u32 {
    30
}
fn default_pixel_format() -> String {
    "mono8".to_string()
}
fn default_exposure_us() -> f64 {
    10_000.0
}
fn default_gamma() -> f64 {
    1.0
}
fn default_contrast() -> f64 {
    1.0
}

fn default_network_url() -> String {
    "stub://network".to_string()
}
fn default_network_fps() -> u32 {
    15
}
fn default_network_resolution() -> (u32, u32) {
    (1280, 720)
}

fn default_file_path() -> String {
    "stub://file?frames=300".to_string()
}
fn default_loop_playback() -> bool {
    true
}

fn default_recording_path() -> String {
    "./recordings".to_string()
}
fn default_codec() -> String {
    "clip".to_string()
}
fn default_quality() -> u8 {
    80
}
fn default_max_duration() -> u32 {
    300
}
fn default_preroll_seconds() -> u32 {
    5
}

fn default_confidence_threshold() -> f32 {
    0.5
}
fn default_max_in_flight() -> usize {
    4
}

fn default_training_path() -> String {
    "./training_data".to_string()
}

fn default_event_bus_capacity() -> usize {
    256
}
fn default_status_interval() -> u32 {
    5
}
