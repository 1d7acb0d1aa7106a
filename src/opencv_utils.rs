use crate::extractor::{FeatureExtractor, Image};
use crate::nms::Keypoint;
use crate::{BowErr, BowResult, Desc, DESC_LEN};
use opencv::{self, core::MatTrait, prelude::Feature2DTrait};
use std::path::Path;

type CvImage = opencv::prelude::Mat;
type CvMat = opencv::core::Mat;

/// ORB keypoints and descriptors, the handcrafted alternative to the learned extractor.
pub struct OrbExtractor {
    orb: opencv::core::Ptr<dyn opencv::features2d::ORB>,
}

impl OrbExtractor {
    pub fn new() -> BowResult<Self> {
        Ok(Self {
            orb: opencv::features2d::ORB::default()?,
        })
    }

    fn detect(&mut self, cv_img: &CvImage) -> BowResult<(Vec<Keypoint>, Vec<Desc>)> {
        let mut kps = opencv::types::VectorOfKeyPoint::new();
        let mut desc = CvMat::default()?;
        let mask = CvMat::default()?;
        self.orb
            .detect_and_compute(cv_img, &mask, &mut kps, &mut desc, false)?;

        let mut keypoints = Vec::with_capacity(kps.len());
        let mut descriptors = Vec::with_capacity(kps.len());
        for (i, kp) in kps.iter().enumerate() {
            let pt = kp.pt;
            keypoints.push(Keypoint {
                x: pt.x,
                y: pt.y,
                size: kp.size,
            });
            // Copy data from CvMat into descriptor buffer
            let mut d: Desc = [0; DESC_LEN];
            for (j, b) in d.iter_mut().enumerate() {
                *b = *desc
                    .at_2d::<u8>(i as i32, j as i32)
                    .map_err(|_| BowErr::OpenCvDecode)?;
            }
            descriptors.push(d);
        }
        Ok((keypoints, descriptors))
    }
}

impl FeatureExtractor for OrbExtractor {
    fn extract(&mut self, image: &Image) -> BowResult<(Vec<Keypoint>, Vec<Desc>)> {
        if image.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let mut cv_img = CvMat::new_rows_cols_with_default(
            image.height as i32,
            image.width as i32,
            opencv::core::CV_8UC1,
            opencv::core::Scalar::all(0.),
        )?;
        for (r, row) in image.pixels.chunks(image.width).enumerate() {
            for (c, &p) in row.iter().enumerate() {
                *cv_img.at_2d_mut::<u8>(r as i32, c as i32)? = p;
            }
        }
        self.detect(&cv_img)
    }
}

/// Use opencv to load an image and extract orb keypoint descriptors.
pub fn load_img_get_kps<P: AsRef<Path>>(path: P) -> BowResult<Vec<Desc>> {
    let name = path
        .as_ref()
        .to_str()
        .ok_or_else(|| BowErr::Precondition(format!("non utf-8 path {:?}", path.as_ref())))?;
    let img: CvImage = opencv::imgcodecs::imread(name, opencv::imgcodecs::IMREAD_GRAYSCALE)?;
    Ok(OrbExtractor::new()?.detect(&img)?.1)
}
