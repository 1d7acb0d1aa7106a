//! Vocabulary files.
//!
//! # Binary format
//!
//! All values are in host byte order.
//!
//! ```text
//! u32 node_count      nodes excluding the root
//! u32 record_size     always 41
//! i32 k
//! i32 L
//! i32 scoring
//! i32 weighting
//! node_count records, ascending id from 1:
//!     i32 parent_id
//!     [u8; 32] descriptor
//!     f32 weight
//!     u8 is_leaf
//! ```
//!
//! # Text format
//!
//! ```text
//! k L scoring weighting
//! parent_id is_leaf d[0] d[1] ... d[31] weight
//! ...
//! ```
//!
//! The binary loader trusts `k` and `L`; the text loader checks them.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use tracing::{info, warn};

use crate::vocab::{check_params, ScoringType, Vocabulary, WeightingType};
use crate::{BowErr, BowResult, Desc, NodeId, DESC_LEN};

/// Size of one binary node record: parent id, descriptor, weight, leaf flag.
pub const RECORD_SIZE: usize = 4 + DESC_LEN + 4 + 1;

const HEADER_SIZE: usize = 6 * 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VocabularyFormat {
    /// Fixed-size records (`.bin`).
    Binary,
    /// One node per line (`.txt`).
    Text,
    /// Serde snapshot of the whole tree (`.voc`).
    #[cfg(feature = "bincode")]
    Bincode,
}

impl VocabularyFormat {
    /// Guess the format from the file extension. Unknown extensions are binary.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        match path.as_ref().extension().and_then(|e| e.to_str()) {
            Some("txt") => VocabularyFormat::Text,
            #[cfg(feature = "bincode")]
            Some("voc") => VocabularyFormat::Bincode,
            _ => VocabularyFormat::Binary,
        }
    }
}

/// Vocabulary persistence
impl Vocabulary {
    /// Load a vocabulary, choosing the format from the file extension.
    pub fn load<P: AsRef<Path>>(path: P) -> BowResult<Self> {
        Self::load_as(&path, VocabularyFormat::from_path(&path))
    }

    /// Save the vocabulary, choosing the format from the file extension.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> BowResult<()> {
        self.save_as(&path, VocabularyFormat::from_path(&path))
    }

    pub fn load_as<P: AsRef<Path>>(path: P, format: VocabularyFormat) -> BowResult<Self> {
        let voc = match format {
            VocabularyFormat::Binary => Self::load_binary(&path)?,
            VocabularyFormat::Text => Self::load_text(&path)?,
            #[cfg(feature = "bincode")]
            VocabularyFormat::Bincode => Self::load_bincode(&path)?,
        };
        info!(
            "Loaded vocabulary {:?}: k={}, L={}, {} nodes, {} words",
            path.as_ref(),
            voc.k(),
            voc.levels(),
            voc.num_nodes(),
            voc.num_words()
        );
        Ok(voc)
    }

    pub fn save_as<P: AsRef<Path>>(&self, path: P, format: VocabularyFormat) -> BowResult<()> {
        match format {
            VocabularyFormat::Binary => self.save_binary(&path)?,
            VocabularyFormat::Text => self.save_text(&path)?,
            #[cfg(feature = "bincode")]
            VocabularyFormat::Bincode => self.save_bincode(&path)?,
        }
        info!("Saved vocabulary to {:?}", path.as_ref());
        Ok(())
    }

    pub fn load_binary<P: AsRef<Path>>(path: P) -> BowResult<Self> {
        Self::read_binary(BufReader::new(File::open(path)?))
    }

    pub fn save_binary<P: AsRef<Path>>(&self, path: P) -> BowResult<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.write_binary(&mut w)?;
        w.flush()?;
        Ok(())
    }

    pub fn load_text<P: AsRef<Path>>(path: P) -> BowResult<Self> {
        Self::read_text(BufReader::new(File::open(path)?))
    }

    pub fn save_text<P: AsRef<Path>>(&self, path: P) -> BowResult<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.write_text(&mut w)?;
        w.flush()?;
        Ok(())
    }

    /// Load a vocabulary snapshot written by [`Vocabulary::save_bincode`].
    #[cfg(feature = "bincode")]
    pub fn load_bincode<P: AsRef<Path>>(path: P) -> BowResult<Self> {
        let mut file = File::open(path)?;
        let mut buffer: Vec<u8> = Vec::new();
        file.read_to_end(&mut buffer)?;
        let voc: Self = bincode::deserialize(&buffer)?;
        voc.check_invariants()?;
        Ok(voc)
    }

    /// Save a snapshot of the vocabulary with bincode.
    #[cfg(feature = "bincode")]
    pub fn save_bincode<P: AsRef<Path>>(&self, path: P) -> BowResult<()> {
        let serialized = bincode::serialize(&self)?;
        let mut file = File::create(path)?;
        file.write_all(&serialized)?;
        Ok(())
    }

    pub fn write_binary<W: Write>(&self, w: &mut W) -> BowResult<()> {
        w.write_all(&(self.num_nodes() as u32).to_ne_bytes())?;
        w.write_all(&(RECORD_SIZE as u32).to_ne_bytes())?;
        w.write_all(&(self.k() as i32).to_ne_bytes())?;
        w.write_all(&(self.levels() as i32).to_ne_bytes())?;
        w.write_all(&self.scoring().code().to_ne_bytes())?;
        w.write_all(&self.weighting().code().to_ne_bytes())?;

        let mut record = [0u8; RECORD_SIZE];
        for node in &self.nodes()[1..] {
            record[0..4].copy_from_slice(&(node.parent as i32).to_ne_bytes());
            record[4..4 + DESC_LEN].copy_from_slice(&node.descriptor);
            record[4 + DESC_LEN..8 + DESC_LEN].copy_from_slice(&node.weight.to_ne_bytes());
            record[8 + DESC_LEN] = node.is_leaf() as u8;
            w.write_all(&record)?;
        }
        Ok(())
    }

    pub fn read_binary<R: Read>(mut r: R) -> BowResult<Self> {
        let mut header = [0u8; HEADER_SIZE];
        read_exact_or_truncated(&mut r, &mut header, "header")?;
        let field = |i: usize| ne_bytes(&header[4 * i..4 * i + 4]);

        let node_count = u32::from_ne_bytes(field(0));
        let record_size = u32::from_ne_bytes(field(1));
        if record_size as usize != RECORD_SIZE {
            return Err(BowErr::Format(format!(
                "record size {} does not match expected {}",
                record_size, RECORD_SIZE
            )));
        }
        let k = i32::from_ne_bytes(field(2));
        let l = i32::from_ne_bytes(field(3));
        if k < 0 || l < 0 {
            return Err(BowErr::Format(format!("negative tree shape k={}, L={}", k, l)));
        }
        let scoring_code = i32::from_ne_bytes(field(4));
        let scoring = ScoringType::from_code(scoring_code)
            .ok_or_else(|| BowErr::Format(format!("unknown scoring type {}", scoring_code)))?;
        let weighting_code = i32::from_ne_bytes(field(5));
        let weighting = WeightingType::from_code(weighting_code)
            .ok_or_else(|| BowErr::Format(format!("unknown weighting type {}", weighting_code)))?;

        let mut records = Vec::new();
        let mut record = [0u8; RECORD_SIZE];
        for i in 1..=node_count {
            read_exact_or_truncated(&mut r, &mut record, "node records")
                .map_err(|e| match e {
                    BowErr::Format(_) => BowErr::Format(format!(
                        "stream ends at record {} of {}",
                        i, node_count
                    )),
                    e => e,
                })?;
            let parent = i32::from_ne_bytes(ne_bytes(&record[0..4]));
            if parent < 0 {
                return Err(BowErr::Format(format!("node {} has parent {}", i, parent)));
            }
            let mut descriptor: Desc = [0; DESC_LEN];
            descriptor.copy_from_slice(&record[4..4 + DESC_LEN]);
            let weight = f32::from_ne_bytes(ne_bytes(&record[4 + DESC_LEN..8 + DESC_LEN]));
            let leaf = record[8 + DESC_LEN] != 0;
            records.push(Record {
                parent: parent as u32,
                descriptor,
                weight,
                leaf,
            });
        }

        let mut rest = [0u8; 1];
        if r.read(&mut rest)? > 0 {
            warn!("Ignoring data after the last of {} vocabulary records", node_count);
        }
        let mut voc = Vocabulary::unchecked(k as usize, l as usize, weighting, scoring);
        link_records(&mut voc, records)?;
        Ok(voc)
    }

    pub fn write_text<W: Write>(&self, w: &mut W) -> BowResult<()> {
        writeln!(
            w,
            "{} {} {} {}",
            self.k(),
            self.levels(),
            self.scoring().code(),
            self.weighting().code()
        )?;
        for node in &self.nodes()[1..] {
            writeln!(
                w,
                "{} {} {} {}",
                node.parent,
                node.is_leaf() as u8,
                desc_to_string(&node.descriptor),
                node.weight
            )?;
        }
        Ok(())
    }

    pub fn read_text<R: BufRead>(r: R) -> BowResult<Self> {
        let mut lines = r.lines();
        let header = lines
            .next()
            .ok_or_else(|| BowErr::Format("empty vocabulary file".into()))??;
        let fields = header
            .split_whitespace()
            .map(|t| t.parse::<i64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| BowErr::Format(format!("invalid header {:?}", header)))?;
        if fields.len() != 4 {
            return Err(BowErr::Format(format!(
                "header needs k, L, scoring and weighting, got {:?}",
                header
            )));
        }
        let (k, l) = (fields[0], fields[1]);
        if k <= 0 || l <= 0 {
            return Err(BowErr::Parameter(format!("tree shape k={}, L={}", k, l)));
        }
        check_params(k as usize, l as usize)?;
        let scoring = i32::try_from(fields[2])
            .ok()
            .and_then(ScoringType::from_code)
            .ok_or_else(|| BowErr::Parameter(format!("unknown scoring type {}", fields[2])))?;
        let weighting = i32::try_from(fields[3])
            .ok()
            .and_then(WeightingType::from_code)
            .ok_or_else(|| BowErr::Parameter(format!("unknown weighting type {}", fields[3])))?;

        let mut records = Vec::new();
        for (n, line) in lines.enumerate() {
            let line = line?;
            let line_no = n + 2;
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.is_empty() {
                continue;
            }
            if tokens.len() != DESC_LEN + 3 {
                return Err(BowErr::Format(format!(
                    "line {}: expected {} fields, got {}",
                    line_no,
                    DESC_LEN + 3,
                    tokens.len()
                )));
            }
            let bad = |what: &str| BowErr::Format(format!("line {}: invalid {}", line_no, what));
            let parent: u32 = tokens[0].parse().map_err(|_| bad("parent id"))?;
            let leaf: i32 = tokens[1].parse().map_err(|_| bad("leaf flag"))?;
            let descriptor = desc_from_tokens(&tokens[2..2 + DESC_LEN])?;
            let weight: f32 = tokens[2 + DESC_LEN].parse().map_err(|_| bad("weight"))?;
            records.push(Record {
                parent,
                descriptor,
                weight,
                leaf: leaf > 0,
            });
        }
        let mut voc = Vocabulary::unchecked(k as usize, l as usize, weighting, scoring);
        link_records(&mut voc, records)?;
        Ok(voc)
    }
}

/// One node as stored in a file; its id is its position plus one.
struct Record {
    parent: NodeId,
    descriptor: Desc,
    weight: f32,
    leaf: bool,
}

/// Allocate a slot per record, then link each record to its parent, so a
/// parent may appear after its children.
fn link_records(voc: &mut Vocabulary, records: Vec<Record>) -> BowResult<()> {
    voc.alloc_nodes(records.len());
    for (i, rec) in records.into_iter().enumerate() {
        voc.link_node(i as NodeId + 1, rec.parent, rec.descriptor, rec.weight, rec.leaf)?;
    }
    voc.check_links()
}

/// Descriptor as space separated decimal bytes.
pub fn desc_to_string(desc: &Desc) -> String {
    desc.iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse the decimal byte tokens written by [`desc_to_string`].
pub fn desc_from_tokens(tokens: &[&str]) -> BowResult<Desc> {
    if tokens.len() != DESC_LEN {
        return Err(BowErr::Format(format!(
            "descriptor needs {} bytes, got {}",
            DESC_LEN,
            tokens.len()
        )));
    }
    let mut desc: Desc = [0; DESC_LEN];
    for (d, t) in desc.iter_mut().zip(tokens) {
        *d = t
            .parse()
            .map_err(|_| BowErr::Format(format!("invalid descriptor byte {:?}", t)))?;
    }
    Ok(desc)
}

#[inline]
fn ne_bytes(b: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&b[..4]);
    out
}

fn read_exact_or_truncated<R: Read>(r: &mut R, buf: &mut [u8], what: &str) -> BowResult<()> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => BowErr::Format(format!("truncated {}", what)),
        _ => BowErr::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::tests::{desc, small_tree};
    use std::io::Cursor;

    fn to_binary(voc: &Vocabulary) -> Vec<u8> {
        let mut buf = Vec::new();
        voc.write_binary(&mut buf).unwrap();
        buf
    }

    fn header(node_count: u32, record_size: u32, k: i32, l: i32, s: i32, w: i32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&node_count.to_ne_bytes());
        buf.extend_from_slice(&record_size.to_ne_bytes());
        for v in [k, l, s, w] {
            buf.extend_from_slice(&v.to_ne_bytes());
        }
        buf
    }

    #[test]
    fn binary_layout() {
        let voc = small_tree();
        let buf = to_binary(&voc);
        assert_eq!(buf.len(), HEADER_SIZE + 4 * RECORD_SIZE);
        assert_eq!(&buf[..HEADER_SIZE], header(4, 41, 2, 2, 0, 0).as_slice());
        // third record: parent 2, descriptor 0xf0, weight 1.25, leaf
        let rec = &buf[HEADER_SIZE + 2 * RECORD_SIZE..HEADER_SIZE + 3 * RECORD_SIZE];
        assert_eq!(&rec[0..4], &2i32.to_ne_bytes());
        assert_eq!(&rec[4..36], &desc(0xf0));
        assert_eq!(&rec[36..40], &1.25f32.to_ne_bytes());
        assert_eq!(rec[40], 1);
    }

    #[test]
    fn binary_round_trip() {
        let voc = small_tree();
        let loaded = Vocabulary::read_binary(Cursor::new(to_binary(&voc))).unwrap();
        assert_eq!(loaded, voc);
    }

    #[test]
    fn truncated_binary() {
        let buf = to_binary(&small_tree());
        let err = Vocabulary::read_binary(Cursor::new(&buf[..buf.len() - 1])).unwrap_err();
        assert!(matches!(err, BowErr::Format(_)));
        let err = Vocabulary::read_binary(Cursor::new(&buf[..10])).unwrap_err();
        assert!(matches!(err, BowErr::Format(_)));
    }

    #[test]
    fn record_size_mismatch() {
        let mut buf = to_binary(&small_tree());
        buf[4..8].copy_from_slice(&42u32.to_ne_bytes());
        assert!(matches!(
            Vocabulary::read_binary(Cursor::new(buf)),
            Err(BowErr::Format(_))
        ));
    }

    #[test]
    fn binary_skips_shape_bounds() {
        let buf = header(0, 41, 50, 12, 1, 2);
        let voc = Vocabulary::read_binary(Cursor::new(buf)).unwrap();
        assert_eq!((voc.k(), voc.levels()), (50, 12));
        assert_eq!(voc.scoring(), ScoringType::L2);
        assert_eq!(voc.weighting(), WeightingType::Idf);
    }

    #[test]
    fn binary_rejects_dangling_parent() {
        let mut buf = to_binary(&small_tree());
        // first record points at node 7
        buf[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&7i32.to_ne_bytes());
        assert!(matches!(
            Vocabulary::read_binary(Cursor::new(buf)),
            Err(BowErr::Format(_))
        ));
    }

    fn record(parent: i32, fill: u8, weight: f32, leaf: bool) -> Vec<u8> {
        let mut rec = Vec::with_capacity(RECORD_SIZE);
        rec.extend_from_slice(&parent.to_ne_bytes());
        rec.extend_from_slice(&desc(fill));
        rec.extend_from_slice(&weight.to_ne_bytes());
        rec.push(leaf as u8);
        rec
    }

    #[test]
    fn binary_parent_after_child() {
        let mut buf = header(2, 41, 2, 1, 0, 0);
        buf.extend(record(2, 0x0f, 0.75, true));
        buf.extend(record(0, 0xff, 0., false));
        let voc = Vocabulary::read_binary(Cursor::new(buf)).unwrap();

        voc.check_invariants().unwrap();
        assert_eq!(voc.num_nodes(), 2);
        assert_eq!(voc.node(0).unwrap().children, vec![2]);
        assert_eq!(voc.node(2).unwrap().children, vec![1]);
        let leaf = voc.word_node(0).unwrap();
        assert_eq!((leaf.id, leaf.parent), (1, 2));
        assert_eq!(leaf.descriptor, desc(0x0f));
        assert_eq!(leaf.weight, 0.75);
        assert_eq!(voc.quantize(&desc(0x0f)), Some((0, 0.75)));
    }

    #[test]
    fn binary_rejects_broken_links() {
        let cases = [
            // own parent
            vec![record(1, 0, 1., true)],
            // child below a leaf
            vec![record(0, 0, 1., true), record(1, 1, 1., true)],
            // 1 and 2 point at each other
            vec![record(2, 0, 0., false), record(1, 1, 0., false), record(0, 2, 1., true)],
        ];
        for records in cases {
            let mut buf = header(records.len() as u32, 41, 2, 2, 0, 0);
            buf.extend(records.concat());
            assert!(matches!(
                Vocabulary::read_binary(Cursor::new(buf)),
                Err(BowErr::Format(_))
            ));
        }
    }

    #[test]
    fn binary_tolerates_trailing_bytes() {
        let mut buf = to_binary(&small_tree());
        buf.push(0);
        assert_eq!(Vocabulary::read_binary(Cursor::new(buf)).unwrap(), small_tree());
    }

    #[test]
    fn text_layout() {
        let mut buf = Vec::new();
        small_tree().write_text(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "2 2 0 0");
        let zeros = vec!["0"; 32].join(" ");
        assert_eq!(lines[1], format!("0 1 {} 0.5", zeros));
        let ones = vec!["255"; 32].join(" ");
        assert_eq!(lines[2], format!("0 0 {} 0", ones));
    }

    #[test]
    fn text_round_trip() {
        let voc = small_tree();
        let mut buf = Vec::new();
        voc.write_text(&mut buf).unwrap();
        let loaded = Vocabulary::read_text(Cursor::new(buf)).unwrap();
        assert_eq!(loaded, voc);
    }

    #[test]
    fn text_header_bounds() {
        for head in ["0 3 0 0", "21 3 0 0", "10 0 0 0", "10 11 0 0", "10 5 6 0", "10 5 0 4", "-1 5 0 0"] {
            assert!(
                matches!(
                    Vocabulary::read_text(Cursor::new(head.as_bytes())),
                    Err(BowErr::Parameter(_))
                ),
                "{}",
                head
            );
        }
        assert!(matches!(
            Vocabulary::read_text(Cursor::new("10 x 0 0".as_bytes())),
            Err(BowErr::Format(_))
        ));
        assert!(matches!(
            Vocabulary::read_text(Cursor::new("".as_bytes())),
            Err(BowErr::Format(_))
        ));
    }

    #[test]
    fn text_rejects_bad_lines() {
        let zeros = vec!["0"; 32].join(" ");
        let short = format!("2 1 0 0\n0 1 {}\n", zeros);
        assert!(matches!(
            Vocabulary::read_text(Cursor::new(short.into_bytes())),
            Err(BowErr::Format(_))
        ));
        let overflow = format!("2 1 0 0\n0 1 256 {} 1\n", vec!["0"; 31].join(" "));
        assert!(matches!(
            Vocabulary::read_text(Cursor::new(overflow.into_bytes())),
            Err(BowErr::Format(_))
        ));
        let orphan = format!("2 1 0 0\n3 1 {} 1\n", zeros);
        assert!(matches!(
            Vocabulary::read_text(Cursor::new(orphan.into_bytes())),
            Err(BowErr::Format(_))
        ));
    }

    #[test]
    fn text_parent_after_child() {
        let zeros = vec!["0"; 32].join(" ");
        let text = format!("2 1 0 0\n2 1 {} 1\n0 0 {} 0\n", zeros, zeros);
        let voc = Vocabulary::read_text(Cursor::new(text.into_bytes())).unwrap();
        voc.check_invariants().unwrap();
        assert_eq!(voc.node(2).unwrap().children, vec![1]);
        assert_eq!(voc.words(), &[1]);
    }

    #[test]
    fn text_skips_blank_lines() {
        let zeros = vec!["0"; 32].join(" ");
        let text = format!("2 1 0 0\n0 1 {} 1.5\n\n", zeros);
        let voc = Vocabulary::read_text(Cursor::new(text.into_bytes())).unwrap();
        assert_eq!(voc.num_nodes(), 1);
        assert_eq!(voc.num_words(), 1);
        assert_eq!(voc.word_node(0).unwrap().weight, 1.5);
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(VocabularyFormat::from_path("a/voc.txt"), VocabularyFormat::Text);
        assert_eq!(VocabularyFormat::from_path("voc.bin"), VocabularyFormat::Binary);
        assert_eq!(VocabularyFormat::from_path("voc"), VocabularyFormat::Binary);
        #[cfg(feature = "bincode")]
        assert_eq!(VocabularyFormat::from_path("test.voc"), VocabularyFormat::Bincode);
    }
}
