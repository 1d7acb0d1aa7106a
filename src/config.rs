use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::nms::NmsParams;
use crate::BowResult;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    /// Keypoints and descriptors from the keypoint network.
    #[default]
    Learned,
    /// ORB keypoints (requires the `opencv` feature).
    Handcrafted,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Input resolution of the keypoint network.
pub enum Resolution {
    #[default]
    #[serde(rename = "320x240")]
    Qvga,
    #[serde(rename = "640x480")]
    Vga,
}

impl Resolution {
    /// Network input `(width, height)`.
    pub fn dims(self) -> (usize, usize) {
        match self {
            Resolution::Qvga => (320, 240),
            Resolution::Vga => (640, 480),
        }
    }

    /// Decoder parameters for this resolution, unscaled.
    pub fn nms_params(self) -> NmsParams {
        let (w, h) = self.dims();
        match self {
            Resolution::Qvga => NmsParams::new(w, h, 8, 4),
            Resolution::Vga => NmsParams::new(w, h, 16, 8),
        }
    }

    /// Network file used when none is configured.
    pub fn default_network(self) -> &'static str {
        match self {
            Resolution::Qvga => "gcn2_320x240.pt",
            Resolution::Vga => "gcn2_640x480.pt",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
/// Feature extractor selection.
///
/// ```json
/// { "extractor": "learned", "network_path": "nets/gcn2_640x480.pt", "resolution": "640x480" }
/// ```
pub struct ExtractorConfig {
    pub extractor: ExtractorKind,
    pub network_path: Option<PathBuf>,
    pub resolution: Resolution,
}

impl ExtractorConfig {
    pub fn from_json(json: &str) -> BowResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> BowResult<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    /// Configured network path, or the default network for the resolution.
    pub fn network_path(&self) -> PathBuf {
        self.network_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(self.resolution.default_network()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ExtractorConfig::from_json("{}").unwrap();
        assert_eq!(cfg, ExtractorConfig::default());
        assert_eq!(cfg.extractor, ExtractorKind::Learned);
        assert_eq!(cfg.network_path(), PathBuf::from("gcn2_320x240.pt"));
    }

    #[test]
    fn full_resolution() {
        let cfg = ExtractorConfig::from_json(r#"{"resolution": "640x480"}"#).unwrap();
        assert_eq!(cfg.network_path(), PathBuf::from("gcn2_640x480.pt"));
        let p = cfg.resolution.nms_params();
        assert_eq!((p.width, p.height, p.border, p.min_distance), (640, 480, 16, 8));
    }

    #[test]
    fn explicit_network() {
        let cfg = ExtractorConfig::from_json(
            r#"{"extractor": "handcrafted", "network_path": "/nets/tiny.pt", "resolution": "320x240"}"#,
        )
        .unwrap();
        assert_eq!(cfg.extractor, ExtractorKind::Handcrafted);
        assert_eq!(cfg.network_path(), PathBuf::from("/nets/tiny.pt"));
        assert_eq!(cfg.resolution.nms_params(), NmsParams::new(320, 240, 8, 4));
    }

    #[test]
    fn unknown_values_are_rejected() {
        assert!(ExtractorConfig::from_json(r#"{"resolution": "1280x720"}"#).is_err());
        assert!(ExtractorConfig::from_json(r#"{"extractor": "sift"}"#).is_err());
    }
}
