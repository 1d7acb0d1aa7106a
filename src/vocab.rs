use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use tracing::info;

use crate::bow::{BowTrait, Norm};
use crate::*;

/// Largest branching factor a vocabulary file may declare.
pub const MAX_BRANCHING: usize = 20;
/// Largest depth a vocabulary file may declare.
pub const MAX_LEVELS: usize = 10;

/// Id of the root placeholder node.
pub const ROOT: NodeId = 0;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
/// How word weights are computed when the vocabulary is created,
/// and how they are accumulated when transforming features.
pub enum WeightingType {
    TfIdf,
    Tf,
    Idf,
    Binary,
}

impl WeightingType {
    /// Integer code used in vocabulary files.
    pub fn code(self) -> i32 {
        match self {
            WeightingType::TfIdf => 0,
            WeightingType::Tf => 1,
            WeightingType::Idf => 2,
            WeightingType::Binary => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(WeightingType::TfIdf),
            1 => Some(WeightingType::Tf),
            2 => Some(WeightingType::Idf),
            3 => Some(WeightingType::Binary),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
/// Similarity measure between two bag-of-words vectors.
pub enum ScoringType {
    L1,
    L2,
    ChiSquare,
    Kl,
    Bhattacharyya,
    DotProduct,
}

impl ScoringType {
    /// Integer code used in vocabulary files.
    pub fn code(self) -> i32 {
        match self {
            ScoringType::L1 => 0,
            ScoringType::L2 => 1,
            ScoringType::ChiSquare => 2,
            ScoringType::Kl => 3,
            ScoringType::Bhattacharyya => 4,
            ScoringType::DotProduct => 5,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ScoringType::L1),
            1 => Some(ScoringType::L2),
            2 => Some(ScoringType::ChiSquare),
            3 => Some(ScoringType::Kl),
            4 => Some(ScoringType::Bhattacharyya),
            5 => Some(ScoringType::DotProduct),
            _ => None,
        }
    }

    /// Norm bow vectors must have before being scored with this measure.
    pub fn norm(self) -> Option<Norm> {
        match self {
            ScoringType::L2 => Some(Norm::L2),
            ScoringType::DotProduct => None,
            _ => Some(Norm::L1),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// A node of the vocabulary tree. Links to other nodes are plain indices into the arena.
pub struct Node {
    pub id: NodeId,
    pub parent: NodeId,
    pub children: Vec<NodeId>,
    pub descriptor: Desc,
    pub weight: f32,
    /// Set iff the node is a leaf (visual word).
    pub word_id: Option<WordId>,
}

impl Node {
    fn new(id: NodeId, parent: NodeId, descriptor: Desc) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            descriptor,
            weight: 0.,
            word_id: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.word_id.is_some()
    }
}

/// Clusters a corpus of descriptors into the nodes of a vocabulary.
///
/// Implementors only add nodes below the root with [`Vocabulary::add_node`];
/// words and weights are assigned afterwards by [`Vocabulary::create`].
pub trait TreeBuilder {
    fn build(&self, voc: &mut Vocabulary, corpus: &[Vec<Desc>]) -> BowResult<()>;
}

#[derive(Serialize, Deserialize, PartialEq, Clone)]
/// Hierarchical vocabulary of binary visual words. Can be:
/// 1. Created from a corpus of per-image descriptors with a [`TreeBuilder`].
/// 2. Saved to & loaded from binary or text files (see [`crate::codec`]).
/// 3. Used to transform a new set of descriptors into a BoW representation (and
///    optionally get the direct index from features to nodes).
pub struct Vocabulary {
    nodes: Vec<Node>,
    words: Vec<NodeId>,
    k: usize,
    l: usize,
    weighting: WeightingType,
    scoring: ScoringType,
}

/// Vocabulary API
impl Vocabulary {
    /// Empty vocabulary holding only the root.
    ///
    /// Args: (k: Branching factor, l: Number of levels)
    pub fn new(k: usize, l: usize, weighting: WeightingType, scoring: ScoringType) -> BowResult<Self> {
        check_params(k, l)?;
        Ok(Self::unchecked(k, l, weighting, scoring))
    }

    /// Empty vocabulary without bounds checks on `k` and `l`.
    pub(crate) fn unchecked(k: usize, l: usize, weighting: WeightingType, scoring: ScoringType) -> Self {
        Self {
            nodes: vec![Node::new(ROOT, ROOT, [0; DESC_LEN])],
            words: Vec::new(),
            k,
            l,
            weighting,
            scoring,
        }
    }

    /// Build the vocabulary from a corpus of descriptors, one list per image.
    ///
    /// Any previous content is discarded. Words are numbered in ascending node id order.
    pub fn create<B: TreeBuilder>(&mut self, builder: &B, corpus: &[Vec<Desc>]) -> BowResult<()> {
        self.nodes.truncate(1);
        self.nodes[0].children.clear();
        self.words.clear();

        builder.build(self, corpus)?;
        self.create_words();
        self.set_node_weights(corpus);

        info!(
            "Created vocabulary: k={}, L={}, {} nodes, {} words from {} images",
            self.k,
            self.l,
            self.nodes.len() - 1,
            self.words.len(),
            corpus.len()
        );
        Ok(())
    }

    /// Append a node below `parent`. Used by tree builders.
    pub fn add_node(&mut self, parent: NodeId, descriptor: Desc) -> BowResult<NodeId> {
        self.push_node(parent, descriptor, 0., false)
    }

    /// Transform a set of binary descriptors into its bag of words
    /// representation with respect to the Vocabulary, normalized for the scoring type.
    pub fn transform(&self, features: &[Desc]) -> BowVector {
        self.transform_generic(features, false).0
    }

    /// Like [`Vocabulary::transform`], also providing the "direct index" from
    /// the features to their corresponding nodes in the Vocabulary tree.
    pub fn transform_with_direct_idx(&self, features: &[Desc]) -> (BowVector, DirectIdx) {
        self.transform_generic(features, true)
    }

    /// Quantize a single descriptor. Returns the word id and its weight,
    /// or `None` if the vocabulary has no words.
    pub fn quantize(&self, feature: &Desc) -> Option<(WordId, f32)> {
        self.descend(feature, None)
    }

    /// Similarity between two bow vectors according to the scoring type.
    pub fn score(&self, a: &BowVector, b: &BowVector) -> f64 {
        a.score(b, self.scoring)
    }

    /// Check the structural invariants of the tree.
    pub fn check_invariants(&self) -> BowResult<()> {
        let bad = |msg: String| Err(BowErr::Format(msg));
        let root = match self.nodes.first() {
            Some(root) => root,
            None => return bad("missing root node".into()),
        };
        if root.id != ROOT || root.word_id.is_some() {
            return bad("root must be node 0 and cannot be a word".into());
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if node.id as usize != i {
                return bad(format!("node at slot {} has id {}", i, node.id));
            }
            if i > 0 {
                match self.nodes.get(node.parent as usize) {
                    Some(p) if p.children.contains(&node.id) => {}
                    _ => return bad(format!("node {} is not a child of its parent {}", i, node.parent)),
                }
            }
            for &c in &node.children {
                match self.nodes.get(c as usize) {
                    Some(child) if c != ROOT && child.parent == node.id => {}
                    _ => return bad(format!("child {} of node {} does not link back", c, i)),
                }
            }
            if !(node.weight >= 0.) {
                return bad(format!("node {} has weight {}", i, node.weight));
            }
        }
        for (w, &n) in self.words.iter().enumerate() {
            match self.nodes.get(n as usize) {
                Some(node) if node.word_id == Some(w as WordId) => {}
                _ => return bad(format!("word {} does not map to a leaf", w)),
            }
        }
        let leaves = self.nodes.iter().filter(|n| n.is_leaf()).count();
        if leaves != self.words.len() {
            return bad(format!("{} leaves but {} words", leaves, self.words.len()));
        }
        Ok(())
    }

    /// Branching factor.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Number of levels below the root.
    pub fn levels(&self) -> usize {
        self.l
    }

    pub fn weighting(&self) -> WeightingType {
        self.weighting
    }

    pub fn scoring(&self) -> ScoringType {
        self.scoring
    }

    /// Number of nodes, excluding the root.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id as usize)
    }

    /// All nodes, root first.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Node ids of the words, indexed by word id.
    pub fn words(&self) -> &[NodeId] {
        &self.words
    }

    pub fn word_node(&self, word: WordId) -> Option<&Node> {
        self.words.get(word as usize).and_then(|&n| self.node(n))
    }
}

/// Reject branching factors and depths the file formats cannot describe.
pub(crate) fn check_params(k: usize, l: usize) -> BowResult<()> {
    if k == 0 || k > MAX_BRANCHING {
        return Err(BowErr::Parameter(format!(
            "branching factor {} outside 1..={}",
            k, MAX_BRANCHING
        )));
    }
    if l == 0 || l > MAX_LEVELS {
        return Err(BowErr::Parameter(format!("depth {} outside 1..={}", l, MAX_LEVELS)));
    }
    Ok(())
}

/////////////////////                Helpers                 ////////////////////////
/////////////////////////////////////////////////////////////////////////////////////

impl Vocabulary {
    /// Append a node, linking it to an existing parent. Leaves get the next word id.
    pub(crate) fn push_node(
        &mut self,
        parent: NodeId,
        descriptor: Desc,
        weight: f32,
        leaf: bool,
    ) -> BowResult<NodeId> {
        let id = self.nodes.len() as NodeId;
        if parent as usize >= self.nodes.len() {
            return Err(BowErr::Format(format!(
                "node {} refers to missing parent {}",
                id, parent
            )));
        }
        let mut node = Node::new(id, parent, descriptor);
        node.weight = weight;
        if leaf {
            node.word_id = Some(self.words.len() as WordId);
            self.words.push(id);
        }
        self.nodes[parent as usize].children.push(id);
        self.nodes.push(node);
        Ok(id)
    }

    /// Append `count` unlinked node slots, filled afterwards with [`Vocabulary::link_node`].
    pub(crate) fn alloc_nodes(&mut self, count: usize) {
        let start = self.nodes.len() as NodeId;
        self.nodes
            .extend((0..count as NodeId).map(|i| Node::new(start + i, ROOT, [0; DESC_LEN])));
    }

    /// Fill slot `id` and link it below `parent`, which may be any allocated slot.
    /// Leaves get the next word id.
    pub(crate) fn link_node(
        &mut self,
        id: NodeId,
        parent: NodeId,
        descriptor: Desc,
        weight: f32,
        leaf: bool,
    ) -> BowResult<()> {
        if parent as usize >= self.nodes.len() {
            return Err(BowErr::Format(format!(
                "node {} refers to missing parent {}",
                id, parent
            )));
        }
        if parent == id {
            return Err(BowErr::Format(format!("node {} is its own parent", id)));
        }
        let word_id = if leaf {
            self.words.push(id);
            Some(self.words.len() as WordId - 1)
        } else {
            None
        };
        let node = &mut self.nodes[id as usize];
        node.parent = parent;
        node.descriptor = descriptor;
        node.weight = weight;
        node.word_id = word_id;
        self.nodes[parent as usize].children.push(id);
        Ok(())
    }

    /// Reject linked nodes that do not form a tree: leaves with children,
    /// or nodes the root cannot reach.
    pub(crate) fn check_links(&self) -> BowResult<()> {
        if let Some(n) = self.nodes.iter().find(|n| n.is_leaf() && !n.children.is_empty()) {
            return Err(BowErr::Format(format!("leaf node {} has children", n.id)));
        }
        let mut reached = vec![false; self.nodes.len()];
        let mut stack = vec![ROOT];
        while let Some(id) = stack.pop() {
            reached[id as usize] = true;
            stack.extend(&self.nodes[id as usize].children);
        }
        match reached.iter().position(|r| !r) {
            Some(i) => Err(BowErr::Format(format!("node {} is not reachable from the root", i))),
            None => Ok(()),
        }
    }

    /// Turn every childless node into a word, in ascending id order.
    fn create_words(&mut self) {
        self.words.clear();
        for node in self.nodes.iter_mut().skip(1) {
            if node.children.is_empty() {
                node.word_id = Some(self.words.len() as WordId);
                self.words.push(node.id);
            } else {
                node.word_id = None;
            }
        }
    }

    /// Tf and binary weighting give every word weight 1. Idf weighting uses
    /// `ln(N / n_i)` over the `N` corpus images, `n_i` being the number of
    /// images where word `i` occurs.
    fn set_node_weights(&mut self, corpus: &[Vec<Desc>]) {
        match self.weighting {
            WeightingType::Tf | WeightingType::Binary => {
                for &n in &self.words {
                    self.nodes[n as usize].weight = 1.;
                }
            }
            WeightingType::Idf | WeightingType::TfIdf => {
                let mut counts = vec![0usize; self.words.len()];
                let mut seen = vec![false; self.words.len()];
                for image in corpus {
                    seen.iter_mut().for_each(|s| *s = false);
                    for f in image {
                        if let Some((w, _)) = self.quantize(f) {
                            if !seen[w as usize] {
                                seen[w as usize] = true;
                                counts[w as usize] += 1;
                            }
                        }
                    }
                }
                let n_docs = corpus.len() as f64;
                for (w, &n) in self.words.iter().enumerate() {
                    let ni = counts[w];
                    self.nodes[n as usize].weight = if ni > 0 {
                        (n_docs / ni as f64).ln() as f32
                    } else {
                        0.
                    };
                }
            }
        }
    }

    /// Descend from the root following the closest child. Records the visited
    /// nodes (excluding the root) in `path` if given.
    fn descend(
        &self,
        feature: &Desc,
        mut path: Option<&mut SmallVec<[NodeId; MAX_LEVELS]>>,
    ) -> Option<(WordId, f32)> {
        let mut node = &self.nodes[ROOT as usize];
        while !node.children.is_empty() {
            let mut best: (u32, NodeId) = (u32::MAX, node.children[0]);
            for &c in &node.children {
                let d = hamming(feature, &self.nodes[c as usize].descriptor);
                if d < best.0 {
                    best = (d, c);
                }
            }
            node = &self.nodes[best.1 as usize];
            if let Some(p) = path.as_mut() {
                p.push(node.id);
            }
        }
        node.word_id.map(|w| (w, node.weight))
    }

    fn transform_generic(&self, features: &[Desc], di: bool) -> (BowVector, DirectIdx) {
        let mut bow = BowVector::new();
        let mut direct_idx: DirectIdx = Vec::with_capacity(if di { features.len() } else { 0 });
        let accumulate = matches!(self.weighting, WeightingType::Tf | WeightingType::TfIdf);

        for feature in features {
            let mut path = SmallVec::new();
            let word = self.descend(feature, if di { Some(&mut path) } else { None });
            if di {
                direct_idx.push(path);
            }
            match word {
                Some((id, w)) if w > 0. => {
                    if accumulate {
                        bow.add_weight(id, w as f64);
                    } else {
                        bow.add_if_not_exist(id, w as f64);
                    }
                }
                _ => {}
            }
        }

        match self.scoring.norm() {
            Some(norm) => bow.normalize(norm),
            None if accumulate && !bow.is_empty() => {
                // plain term frequency
                let nd = bow.len() as f64;
                for v in bow.values_mut() {
                    *v /= nd;
                }
            }
            None => {}
        }

        (bow, direct_idx)
    }
}

#[inline]
/// Hamming distance between two binary arrays (descriptors).
pub fn hamming(x: &[u8], y: &[u8]) -> u32 {
    x.iter()
        .zip(y)
        .fold(0, |a, (b, c)| a + (*b ^ *c).count_ones())
}

impl fmt::Debug for Vocabulary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vocabulary")
            .field("Word/Leaf Nodes", &self.words.len())
            .field("Other Nodes", &(self.nodes.len() - 1 - self.words.len()))
            .field("Levels", &self.l)
            .field("Branching Factor", &self.k)
            .field("Weighting", &self.weighting)
            .field("Scoring", &self.scoring)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn desc(b: u8) -> Desc {
        [b; DESC_LEN]
    }

    /// Root with two children; the second has two leaf children. Words are
    /// node 1, node 3 and node 4.
    pub(crate) fn small_tree() -> Vocabulary {
        let mut voc = Vocabulary::new(2, 2, WeightingType::TfIdf, ScoringType::L1).unwrap();
        voc.push_node(0, desc(0x00), 0.5, true).unwrap();
        voc.push_node(0, desc(0xff), 0., false).unwrap();
        voc.push_node(2, desc(0xf0), 1.25, true).unwrap();
        voc.push_node(2, desc(0xff), 2., true).unwrap();
        voc
    }

    #[test]
    fn parameter_bounds() {
        use WeightingType::*;
        assert!(Vocabulary::new(10, 6, TfIdf, ScoringType::L1).is_ok());
        assert!(Vocabulary::new(20, 10, Tf, ScoringType::L2).is_ok());
        for &(k, l) in &[(0, 3), (21, 3), (5, 0), (5, 11)] {
            assert!(matches!(
                Vocabulary::new(k, l, TfIdf, ScoringType::L1),
                Err(BowErr::Parameter(_))
            ));
        }
    }

    #[test]
    fn policy_codes() {
        for code in 0..4 {
            assert_eq!(WeightingType::from_code(code).unwrap().code(), code);
        }
        for code in 0..6 {
            assert_eq!(ScoringType::from_code(code).unwrap().code(), code);
        }
        assert!(WeightingType::from_code(4).is_none());
        assert!(ScoringType::from_code(-1).is_none());
    }

    #[test]
    fn arena_links() {
        let voc = small_tree();
        assert_eq!(voc.num_nodes(), 4);
        assert_eq!(voc.node(0).unwrap().children, vec![1, 2]);
        assert_eq!(voc.node(2).unwrap().children, vec![3, 4]);
        assert_eq!(voc.node(4).unwrap().parent, 2);
        assert_eq!(voc.words(), &[1, 3, 4]);
        assert_eq!(voc.word_node(1).unwrap().id, 3);
        voc.check_invariants().unwrap();
    }

    #[test]
    fn missing_parent() {
        let mut voc = small_tree();
        assert!(matches!(voc.add_node(9, desc(1)), Err(BowErr::Format(_))));
        assert_eq!(voc.num_nodes(), 4);
    }

    #[test]
    fn broken_invariants_are_reported() {
        let mut voc = small_tree();
        voc.nodes[3].weight = -1.;
        assert!(voc.check_invariants().is_err());

        let mut voc = small_tree();
        voc.nodes[4].parent = 1;
        assert!(voc.check_invariants().is_err());

        let mut voc = small_tree();
        voc.nodes[1].word_id = Some(2);
        assert!(voc.check_invariants().is_err());
    }

    #[test]
    fn quantize_follows_closest_child() {
        let voc = small_tree();
        assert_eq!(voc.quantize(&desc(0x01)), Some((0, 0.5)));
        assert_eq!(voc.quantize(&desc(0xf1)), Some((1, 1.25)));
        assert_eq!(voc.quantize(&desc(0xfe)), Some((2, 2.)));
    }

    #[test]
    fn empty_vocabulary_quantizes_nothing() {
        let voc = Vocabulary::new(2, 2, WeightingType::Tf, ScoringType::L1).unwrap();
        assert_eq!(voc.quantize(&desc(3)), None);
        assert!(voc.transform(&[desc(3)]).is_empty());
    }

    #[test]
    fn transform_is_l1_normalized() {
        let voc = small_tree();
        let bow = voc.transform(&[desc(0x00), desc(0xf0), desc(0xf0)]);
        // 0.5 for word 0, 2 * 1.25 for word 1
        assert_eq!(bow.len(), 2);
        assert!((bow[&0] - 0.5 / 3.).abs() < 1e-9);
        assert!((bow[&1] - 2.5 / 3.).abs() < 1e-9);
        assert!((voc.score(&bow, &bow) - 1.).abs() < 1e-9);
    }

    #[test]
    fn idf_weighting_counts_words_once() {
        let mut voc = small_tree();
        voc.weighting = WeightingType::Idf;
        voc.scoring = ScoringType::DotProduct;
        let bow = voc.transform(&[desc(0xf0), desc(0xf0)]);
        assert_eq!(bow.get(&1), Some(&1.25));
    }

    #[test]
    fn direct_index_lists_path() {
        let voc = small_tree();
        let (_, di) = voc.transform_with_direct_idx(&[desc(0x00), desc(0xfe)]);
        assert_eq!(di[0].as_slice(), &[1]);
        assert_eq!(di[1].as_slice(), &[2, 4]);
    }

    #[test]
    fn hamming_distance() {
        assert_eq!(hamming(&desc(0), &desc(0)), 0);
        assert_eq!(hamming(&desc(0), &desc(0xff)), 256);
        let mut c = desc(0);
        c[0] = 0x0f;
        assert_eq!(hamming(&desc(0), &c), 4);
    }
}
