use std::path::Path;
use tracing::debug;

use crate::config::{ExtractorConfig, ExtractorKind, Resolution};
use crate::nms::{decode, Keypoint, NetworkOutput};
use crate::{BowErr, BowResult, Desc};

#[derive(Debug, Clone, Copy)]
/// A borrowed 8-bit grayscale image, row major.
pub struct Image<'a> {
    pub width: usize,
    pub height: usize,
    pub pixels: &'a [u8],
}

impl<'a> Image<'a> {
    pub fn new(width: usize, height: usize, pixels: &'a [u8]) -> BowResult<Self> {
        if pixels.len() != width * height {
            return Err(BowErr::Precondition(format!(
                "{} pixels for a {}x{} image",
                pixels.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// The keypoint network. Produces raw detections in its own input grid.
pub trait KeypointNetwork {
    /// Run on `image` resized to `width x height`.
    fn infer(&mut self, image: &Image, width: usize, height: usize) -> BowResult<NetworkOutput>;
}

/// Detects keypoints and computes their binary descriptors.
pub trait FeatureExtractor {
    /// Keypoints are in `image` pixel coordinates; descriptors are row aligned with them.
    fn extract(&mut self, image: &Image) -> BowResult<(Vec<Keypoint>, Vec<Desc>)>;
}

/// Runs a [`KeypointNetwork`] and decodes its output with non-maximum suppression.
pub struct LearnedExtractor<N> {
    network: N,
    resolution: Resolution,
}

impl<N: KeypointNetwork> LearnedExtractor<N> {
    pub fn new(network: N, resolution: Resolution) -> Self {
        Self {
            network,
            resolution,
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn into_network(self) -> N {
        self.network
    }
}

impl<N: KeypointNetwork> FeatureExtractor for LearnedExtractor<N> {
    fn extract(&mut self, image: &Image) -> BowResult<(Vec<Keypoint>, Vec<Desc>)> {
        if image.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let params = self
            .resolution
            .nms_params()
            .scaled_to(image.width, image.height);
        let output = self.network.infer(image, params.width, params.height)?;
        debug!(
            "Network returned {} detections for a {}x{} image",
            output.len(),
            image.width,
            image.height
        );
        decode(&output, &params)
    }
}

/// Build the extractor selected by `config`. `load_network` is only called
/// for the learned extractor, with the configured network path.
pub fn extractor_from_config<N, F>(
    config: &ExtractorConfig,
    load_network: F,
) -> BowResult<Box<dyn FeatureExtractor>>
where
    N: KeypointNetwork + 'static,
    F: FnOnce(&Path) -> BowResult<N>,
{
    match config.extractor {
        ExtractorKind::Learned => {
            let network = load_network(&config.network_path())?;
            Ok(Box::new(LearnedExtractor::new(network, config.resolution)))
        }
        #[cfg(feature = "opencv")]
        ExtractorKind::Handcrafted => Ok(Box::new(crate::opencv_utils::OrbExtractor::new()?)),
        #[cfg(not(feature = "opencv"))]
        ExtractorKind::Handcrafted => Err(BowErr::Parameter(
            "handcrafted extractor requires the opencv feature".into(),
        )),
    }
}
