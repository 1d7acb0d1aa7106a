use thiserror::Error;

/// Spatial non-maximum suppression turning raw network detections into
/// keypoints with aligned descriptors.
pub mod nms;
pub use nms::{decode, Detection, Keypoint, NetworkOutput, NmsParams};

/// Hierarchical visual-word vocabulary, which provides the main data model of this crate.
pub mod vocab;
pub use vocab::{ScoringType, TreeBuilder, Vocabulary, WeightingType};

/// Hierarchical k-means vocabulary builder.
pub mod kmeans;
pub use kmeans::HKMeansBuilder;

/// Sparse bag-of-words vectors and their similarity scores.
pub mod bow;

/// Binary and text vocabulary files.
pub mod codec;
pub use codec::VocabularyFormat;

/// Extractor selection and resolution presets.
pub mod config;
pub use config::{ExtractorConfig, ExtractorKind, Resolution};

/// Keypoint extractors feeding the decoder.
pub mod extractor;
pub use extractor::{extractor_from_config, FeatureExtractor, Image, KeypointNetwork, LearnedExtractor};

/// Corpus accumulation and vocabulary file creation.
pub mod pipeline;
pub use pipeline::Corpus;

/// Utilities for extracting keypoint descriptors using opencv.
#[cfg(feature = "opencv")]
pub mod opencv_utils;
#[cfg(feature = "opencv")]
pub use opencv_utils::*;

/// Supported descriptor type is 32-byte binary array.
///
/// This is the most commonly used keypoint descriptor data type.
/// It is used by ORB and BRIEF, and it is what the learned detector emits.
pub type Desc = [u8; 32];

/// Length of a descriptor in bytes.
pub const DESC_LEN: usize = std::mem::size_of::<Desc>();

/// Index of a node in the vocabulary arena. Node 0 is the root.
pub type NodeId = u32;

/// Index of a visual word (leaf) in the vocabulary.
pub type WordId = u32;

/// Bag-of-Words representation of an image or descriptor set.
///
/// Key: word/leaf id in the vocabulary.
///
/// Value: total weight of that word in provided features.
pub type BowVector = std::collections::BTreeMap<WordId, f64>;

/// This type represents a map from features to their corresponding nodes in the Vocabulary tree.
///
/// The direct index for `feature[i]` is `di = DirectIdx[i]` where
/// `di.len() <= L` (number of levels), and `di[j]` is the id of the node matching `feature[i]`
/// at level `j + 1` in the Vocabulary tree.
pub type DirectIdx = Vec<smallvec::SmallVec<[NodeId; vocab::MAX_LEVELS]>>;

pub type BowResult<T> = std::result::Result<T, BowErr>;

#[derive(Error, Debug)]
pub enum BowErr {
    #[error("Invalid vocabulary parameters: {0}")]
    Parameter(String),
    #[error("Io Error")]
    Io(#[from] std::io::Error),
    #[error("Malformed vocabulary file: {0}")]
    Format(String),
    #[error("Precondition violated: {0}")]
    Precondition(String),
    #[error("Configuration Error")]
    Config(#[from] serde_json::Error),
    #[cfg(feature = "bincode")]
    #[error("Vocabulary Serialization Error")]
    Bincode(#[from] bincode::Error),
    #[cfg(feature = "opencv")]
    #[error("Opencv Error")]
    OpenCvInternal(#[from] opencv::Error),
    #[cfg(feature = "opencv")]
    #[error("Opencv Descriptor decode error")]
    OpenCvDecode,
}
