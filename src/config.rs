use crate::detect::DetectorConfig;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf};
use tracing::{debug, error};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local ONNX file, or the file name inside `model_repo`.
    pub model: String,
    pub model_repo: String,
    pub input_size: u32,
    pub confidence: f32,
    pub iou: f32,
    pub camera_index: u32,
    pub upload_dir: PathBuf,
    pub listen_addr: String,
    pub display_interval_ms: u64,
    pub panel_width: u32,
    pub panel_height: u32,
    pub font_path: Option<PathBuf>,
    pub max_upload_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: "yolov8n-onnx-web/yolov8n.onnx".to_string(),
            model_repo: "salim4n/yolov8n-detect-onnx".to_string(),
            input_size: 640,
            confidence: 0.25,
            iou: 0.45,
            camera_index: 0,
            upload_dir: PathBuf::from("uploads"),
            listen_addr: "0.0.0.0:5000".to_string(),
            display_interval_ms: 50,
            panel_width: 520,
            panel_height: 400,
            font_path: None,
            max_upload_bytes: 256 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn detector(&self) -> DetectorConfig {
        DetectorConfig {
            input_size: self.input_size,
            confidence: self.confidence.clamp(0.0, 1.0),
            iou: self.iou.clamp(0.0, 1.0),
        }
    }
}

pub fn config_path() -> PathBuf {
    env::var_os("DETECT_RELAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("detect-relay.json"))
}

pub fn load_config() -> Config {
    let path = config_path();
    if let Ok(data) = fs::read(&path) {
        match serde_json::from_slice(&data) {
            Ok(cfg) => return cfg,
            Err(e) => error!(path = %path.display(), "ignoring invalid config: {e}"),
        }
    }
    debug!(path = %path.display(), "using default configuration");
    Config::default()
}

pub fn save_config(cfg: &Config) {
    let path = config_path();
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    match serde_json::to_vec_pretty(cfg) {
        Ok(data) => {
            if let Err(e) = fs::write(&path, data) {
                error!("failed to write config: {e}");
            }
        }
        Err(e) => error!("failed to encode config: {e}"),
    }
}
