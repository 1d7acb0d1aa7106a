use std::path::Path;
use tracing::info;

use crate::extractor::{FeatureExtractor, Image};
use crate::vocab::{TreeBuilder, Vocabulary};
use crate::{BowResult, Desc};

#[derive(Debug, Clone, Default, PartialEq)]
/// Descriptors of a training image set, one list per image.
pub struct Corpus {
    images: Vec<Vec<Desc>>,
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image(&mut self, descriptors: Vec<Desc>) {
        self.images.push(descriptors);
    }

    /// Run `extractor` on `image` and add its descriptors. Returns how many were added.
    pub fn extract<E: FeatureExtractor + ?Sized>(
        &mut self,
        extractor: &mut E,
        image: &Image,
    ) -> BowResult<usize> {
        let (_, descriptors) = extractor.extract(image)?;
        let n = descriptors.len();
        self.add_image(descriptors);
        Ok(n)
    }

    pub fn images(&self) -> &[Vec<Desc>] {
        &self.images
    }

    /// Number of images.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn num_features(&self) -> usize {
        self.images.iter().map(Vec::len).sum()
    }

    /// Fill `voc` from the corpus with `builder` and save it to `path`
    /// (format chosen by extension).
    pub fn create_vocabulary_file<B: TreeBuilder, P: AsRef<Path>>(
        &self,
        builder: &B,
        mut voc: Vocabulary,
        path: P,
    ) -> BowResult<Vocabulary> {
        info!(
            "Creating vocabulary from {} features in {} images",
            self.num_features(),
            self.len()
        );
        voc.create(builder, &self.images)?;
        voc.save(&path)?;
        Ok(voc)
    }
}

impl From<Vec<Vec<Desc>>> for Corpus {
    fn from(images: Vec<Vec<Desc>>) -> Self {
        Self { images }
    }
}
