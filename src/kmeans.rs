use bitvec::{order::Msb0, view::BitView};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tracing::debug;

use crate::vocab::{hamming, TreeBuilder, Vocabulary, ROOT};
use crate::{BowResult, Desc, NodeId, DESC_LEN};

/// Assignment rounds of one k-means step when no limit is configured.
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

#[derive(Debug, Clone, Default)]
/// Builds a vocabulary with recursive k-means clustering of binary descriptors.
///
/// Initial centers are drawn at random from the cluster's features; set a
/// seed for reproducible vocabularies.
pub struct HKMeansBuilder {
    seed: Option<u64>,
    max_iterations: Option<usize>,
}

impl HKMeansBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Cap the number of assignment rounds of a single k-means step.
    /// At least one round always runs.
    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = Some(n);
        self
    }
}

impl TreeBuilder for HKMeansBuilder {
    fn build(&self, voc: &mut Vocabulary, corpus: &[Vec<Desc>]) -> BowResult<()> {
        let features: Vec<Desc> = corpus.iter().flatten().copied().collect();
        let mut rng = match self.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        self.cluster(voc, &features, ROOT, 1, &mut rng)
    }
}

/////////////////////                Helpers                 ////////////////////////
/////////////////////////////////////////////////////////////////////////////////////

impl HKMeansBuilder {
    fn cluster(
        &self,
        voc: &mut Vocabulary,
        features: &[Desc],
        parent: NodeId,
        curr_level: usize,
        rng: &mut StdRng,
    ) -> BowResult<()> {
        debug!(
            "KMeans step with {} features. parent: {}, level {}",
            features.len(),
            parent,
            curr_level
        );
        if features.is_empty() {
            return Ok(());
        }
        let k = voc.k();
        let mut clusters: Vec<Desc> = Vec::new();
        let mut groups: Vec<Vec<usize>> = Vec::new();

        if features.len() <= k {
            // Only one feature per cluster
            for (i, f) in features.iter().enumerate() {
                clusters.push(*f);
                groups.push(vec![i]);
            }
        } else {
            clusters = features.choose_multiple(rng, k).cloned().collect();
            let max_iterations = self.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS).max(1);

            for _ in 0..max_iterations {
                let mut new_groups: Vec<Vec<usize>> = vec![Vec::new(); k];
                for (i, f) in features.iter().enumerate() {
                    let mut best: (usize, u32) = (0, u32::MAX);
                    for (j, c) in clusters.iter().enumerate() {
                        let d = hamming(c, f);
                        if d < best.1 {
                            best = (j, d);
                        }
                    }
                    new_groups[best.0].push(i);
                }

                if groups == new_groups {
                    break; // converged
                }

                clusters = new_groups
                    .iter()
                    .map(|group| desc_mean(group.iter().map(|&i| &features[i])))
                    .collect();
                groups = new_groups;
            }

            // centers that attracted nothing do not become nodes
            let (kept_clusters, kept_groups): (Vec<Desc>, Vec<Vec<usize>>) = clusters
                .into_iter()
                .zip(groups)
                .filter(|(_, g)| !g.is_empty())
                .unzip();
            clusters = kept_clusters;
            groups = kept_groups;
        }

        let ids = clusters
            .iter()
            .map(|c| voc.add_node(parent, *c))
            .collect::<BowResult<Vec<NodeId>>>()?;

        // Recurse
        if curr_level < voc.levels() {
            for (id, group) in ids.iter().zip(&groups) {
                if group.len() > 1 {
                    let features: Vec<Desc> = group.iter().map(|&i| features[i]).collect();
                    self.cluster(voc, &features, *id, curr_level + 1, rng)?;
                }
            }
        }
        Ok(())
    }
}

/// Bitwise majority of a collection of binary arrays (descriptors).
fn desc_mean<'a, I: Iterator<Item = &'a Desc>>(descriptors: I) -> Desc {
    let mut counts = [0usize; DESC_LEN * 8];
    let mut n = 0;
    for d in descriptors {
        n += 1;
        for (i, b) in d.view_bits::<Msb0>().iter().enumerate() {
            if *b {
                counts[i] += 1;
            }
        }
    }
    let n2 = n / 2;
    let mut result: Desc = [0; DESC_LEN];
    let result_bits = result.view_bits_mut::<Msb0>();
    for (i, &c) in counts.iter().enumerate() {
        if c > n2 {
            result_bits.set(i, true);
        }
    }
    result
}
