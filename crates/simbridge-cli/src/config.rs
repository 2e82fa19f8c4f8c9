//! Configuration file – reads/writes `~/.simbridge/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use simbridge_middleware::connection::DEFAULT_ENDPOINT;
use simbridge_middleware::publisher::DEFAULT_FRAME_ID;
use simbridge_middleware::{ConnectionConfig, ReconnectPolicy};
use simbridge_perception::DistanceMode;
use simbridge_runtime::scheduler::{CameraMount, StreamConfig, StreamKind};
use simbridge_runtime::{DepthOutput, PipelineConfig};

/// One `[[streams]]` table: a capture stream plus the simulated render size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    #[serde(flatten)]
    pub stream: StreamConfig,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

/// One `[[objects]]` table: a simulated scene object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub name: String,
    pub position: [f64; 3],
    /// Metres per scene sample.
    #[serde(default)]
    pub velocity: [f64; 3],
}

/// Persisted configuration stored in `~/.simbridge/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// rosbridge websocket URL.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Delay between reconnect attempts; values below 100 ms are raised to it.
    #[serde(default = "default_reconnect_ms")]
    pub reconnect_ms: u64,

    /// When set, the delay doubles per failed attempt up to this cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_max_ms: Option<u64>,

    /// Outbound queue capacity per connection generation.
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,

    /// Default `header.frame_id`.
    #[serde(default = "default_frame_id")]
    pub frame_id: String,

    /// Idle render targets kept per size and format; unbounded when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_max_per_key: Option<usize>,

    #[serde(default = "default_streams")]
    pub streams: Vec<StreamEntry>,

    #[serde(default = "default_objects")]
    pub objects: Vec<ObjectEntry>,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}
/// Shortest reconnect delay accepted from the file or environment.
const MIN_RECONNECT_MS: u64 = 100;

fn default_reconnect_ms() -> u64 {
    1_000
}
fn default_send_buffer() -> usize {
    64
}
fn default_frame_id() -> String {
    DEFAULT_FRAME_ID.to_string()
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}

fn default_streams() -> Vec<StreamEntry> {
    let camera = CameraMount {
        position: [0.0, 1.0, -3.0],
        rotation_deg: [0.0, 0.0, 0.0],
    };
    vec![
        StreamEntry {
            stream: StreamConfig::camera("front_rgb", "/unity_camera_1/rgb/compressed", 10.0),
            width: default_width(),
            height: default_height(),
        },
        StreamEntry {
            stream: StreamConfig::depth(
                "front_depth",
                "/unity_camera_1/depth/compressed",
                10.0,
                DepthOutput::Png16,
            ),
            width: default_width(),
            height: default_height(),
        },
        StreamEntry {
            stream: StreamConfig {
                kind: StreamKind::Objects {
                    per_object_topic: false,
                    cameras: vec![camera],
                    distance_mode: DistanceMode::AlongAxis,
                },
                ..StreamConfig::objects("objects", "/unity/object_info", 5.0)
            },
            width: default_width(),
            height: default_height(),
        },
    ]
}

fn default_objects() -> Vec<ObjectEntry> {
    vec![ObjectEntry {
        name: "Cube".to_string(),
        position: [0.0, 0.5, 2.0],
        velocity: [0.01, 0.0, 0.0],
    }]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            reconnect_ms: default_reconnect_ms(),
            reconnect_max_ms: None,
            send_buffer: default_send_buffer(),
            frame_id: default_frame_id(),
            pool_max_per_key: None,
            streams: default_streams(),
            objects: default_objects(),
        }
    }
}

impl Config {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let initial = Duration::from_millis(self.reconnect_ms.max(MIN_RECONNECT_MS));
        match self.reconnect_max_ms {
            Some(max) => ReconnectPolicy::Exponential {
                initial,
                max: Duration::from_millis(max).max(initial),
            },
            None => ReconnectPolicy::Fixed(initial),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            connection: ConnectionConfig {
                endpoint: self.endpoint.clone(),
                reconnect: self.reconnect_policy(),
                send_buffer: self.send_buffer,
                ..ConnectionConfig::default()
            },
            frame_id: self.frame_id.clone(),
            streams: self.streams.iter().map(|s| s.stream.clone()).collect(),
            ..PipelineConfig::default()
        }
    }
}

/// Return the path to `~/.simbridge/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".simbridge").join("config.toml")
}

/// Load the config from `path`.  Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `SIMBRIDGE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SIMBRIDGE_ENDPOINT` | `endpoint` |
/// | `SIMBRIDGE_RECONNECT_MS` | `reconnect_ms` |
/// | `SIMBRIDGE_FRAME_ID` | `frame_id` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("SIMBRIDGE_ENDPOINT") {
        cfg.endpoint = v;
    }
    if let Ok(v) = std::env::var("SIMBRIDGE_RECONNECT_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.reconnect_ms = ms;
    }
    if let Ok(v) = std::env::var("SIMBRIDGE_FRAME_ID") {
        cfg.frame_id = v;
    }
}

/// Save the config to `path`, creating its directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
