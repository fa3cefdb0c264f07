pub mod kmer;

pub use kmer::Kmer;

use hashbrown::HashMap;
use kmer::{complement_base, compress_base, decompress_base, is_valid_base};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("k-mer length {k} is invalid (must be between 1 and {max})")]
    InvalidKmerLength { k: usize, max: usize },

    #[error("unitig {index} is {length} bases long, shorter than k = {k}")]
    UnitigTooShort {
        index: usize,
        length: usize,
        k: usize,
    },

    #[error("unitig {index} contains a non-ACGT base at position {position}")]
    InvalidBase { index: usize, position: usize },

    #[error("k-mer {kmer} occurs in more than one unitig position")]
    DuplicateKmer { kmer: String },
}

/// A nucleotide sequence packed four bases per byte.
#[derive(Clone)]
pub struct CompressedSequence {
    data: Box<[u8]>,
    length: usize,
}

impl CompressedSequence {
    pub fn from_bases(bases: &[u8]) -> Option<Self> {
        let mut data = vec![0u8; (bases.len() + 3) / 4];
        for (i, &base) in bases.iter().enumerate() {
            if !is_valid_base(base) {
                return None;
            }
            data[i / 4] |= compress_base(base) << (2 * (i % 4));
        }
        Some(Self {
            data: data.into_boxed_slice(),
            length: bases.len(),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// 2-bit code of the base at `index` on the forward strand.
    #[inline]
    pub fn base2(&self, index: usize) -> u8 {
        debug_assert!(index < self.length);
        (self.data[index / 4] >> (2 * (index % 4))) & 0x3
    }

    pub fn kmer_at(&self, index: usize, k: usize) -> Kmer {
        debug_assert!(index + k <= self.length);
        let mut bits = 0u64;
        for i in index..index + k {
            bits = (bits << 2) | self.base2(i) as u64;
        }
        Kmer::from_bits(bits)
    }

    pub fn to_string(&self) -> String {
        (0..self.length)
            .map(|i| decompress_base(self.base2(i)) as char)
            .collect()
    }
}

/// A mapping view into a unitig, in k-mer coordinates on the forward strand:
/// the mapping covers the k-mers starting at offsets `dist..dist + len`.
/// `strand` is false when the mapped sequence matched the unitig's reverse
/// complement.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UnitigMap {
    pub unitig_id: usize,
    pub dist: usize,
    pub len: usize,
    pub size: usize,
    pub strand: bool,
}

impl UnitigMap {
    /// Number of k-mers packed in the underlying unitig.
    #[inline]
    pub fn km_count(&self, k: usize) -> usize {
        self.size - k + 1
    }

    /// A mapping spanning every k-mer of a unitig, forward strand.
    pub fn whole(unitig_id: usize, size: usize, k: usize) -> Self {
        Self {
            unitig_id,
            dist: 0,
            len: size - k + 1,
            size,
            strand: true,
        }
    }
}

struct Unitig {
    seq: CompressedSequence,
    data: u8,
}

#[derive(Copy, Clone)]
struct KmerOccurrence {
    unitig: config::UnitigIndexType,
    position: u32,
    // True when the canonical form of the k-mer is its forward-strand form.
    forward: bool,
}

/// A finished compacted de Bruijn graph, loaded from already-extracted
/// unitigs. Each distinct k-mer of the input occurs at exactly one
/// (unitig, offset) pair; lookups are strand-oblivious via canonical forms.
///
/// The per-unitig one-byte data slot is owned by whoever annotates the
/// graph; it is written once after construction and read-only afterwards.
pub struct CompactedGraph {
    k: usize,
    unitigs: Vec<Unitig>,
    index: HashMap<u64, KmerOccurrence>,
}

impl CompactedGraph {
    pub fn from_unitigs<S: AsRef<[u8]>>(
        k: usize,
        sequences: impl IntoIterator<Item = S>,
    ) -> Result<Self, GraphError> {
        if k == 0 || k > config::MAX_KMER_LENGTH {
            return Err(GraphError::InvalidKmerLength {
                k,
                max: config::MAX_KMER_LENGTH,
            });
        }

        let mut unitigs = vec![];
        let mut index = HashMap::new();

        for (unitig_id, sequence) in sequences.into_iter().enumerate() {
            let bases = sequence.as_ref();
            if bases.len() < k {
                return Err(GraphError::UnitigTooShort {
                    index: unitig_id,
                    length: bases.len(),
                    k,
                });
            }
            let seq = CompressedSequence::from_bases(bases).ok_or_else(|| {
                let position = bases.iter().position(|b| !is_valid_base(*b)).unwrap();
                GraphError::InvalidBase {
                    index: unitig_id,
                    position,
                }
            })?;

            for position in 0..=(seq.len() - k) {
                let km = seq.kmer_at(position, k);
                let (canonical, forward) = km.canonical(k);
                let occurrence = KmerOccurrence {
                    unitig: unitig_id as config::UnitigIndexType,
                    position: position as u32,
                    forward,
                };
                if index.insert(canonical.bits(), occurrence).is_some() {
                    return Err(GraphError::DuplicateKmer {
                        kmer: km.to_string(k),
                    });
                }
            }

            unitigs.push(Unitig { seq, data: 0 });
        }

        Ok(Self { k, unitigs, index })
    }

    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    #[inline]
    pub fn unitigs_count(&self) -> usize {
        self.unitigs.len()
    }

    /// Locates a k-mer in the graph, on either strand. The returned mapping
    /// covers exactly one k-mer (`len == 1`).
    pub fn find(&self, km: Kmer) -> Option<UnitigMap> {
        let (canonical, query_forward) = km.canonical(self.k);
        let occurrence = self.index.get(&canonical.bits())?;
        let unitig = &self.unitigs[occurrence.unitig as usize];

        Some(UnitigMap {
            unitig_id: occurrence.unitig as usize,
            dist: occurrence.position as usize,
            len: 1,
            size: unitig.seq.len(),
            strand: query_forward == occurrence.forward,
        })
    }

    /// First k-mer of the unitig on the forward strand.
    pub fn head_kmer(&self, unitig_id: usize) -> Kmer {
        self.unitigs[unitig_id].seq.kmer_at(0, self.k)
    }

    #[inline]
    pub fn km_count(&self, unitig_id: usize) -> usize {
        self.unitigs[unitig_id].seq.len() - self.k + 1
    }

    #[inline]
    pub fn unitig_size(&self, unitig_id: usize) -> usize {
        self.unitigs[unitig_id].seq.len()
    }

    pub fn unitig_sequence(&self, unitig_id: usize) -> &CompressedSequence {
        &self.unitigs[unitig_id].seq
    }

    #[inline]
    pub fn data(&self, unitig_id: usize) -> u8 {
        self.unitigs[unitig_id].data
    }

    pub fn set_data(&mut self, unitig_id: usize, value: u8) {
        self.unitigs[unitig_id].data = value;
    }

    /// Greedily extends a single-k-mer mapping along `read` while the next
    /// read k-mers continue on the same unitig in the mapped orientation
    /// (longest common prefix with the strand-oriented side). `kmer_start`
    /// is the read offset of the k-mer `um` was found at. Returns the
    /// number of k-mers the mapping grew by.
    pub fn extend_mapping(&self, um: &mut UnitigMap, read: &[u8], kmer_start: usize) -> usize {
        let k = self.k;
        let seq = &self.unitigs[um.unitig_id].seq;
        let km_count = um.km_count(k);

        let mut extension = 0;
        loop {
            let read_next = kmer_start + k + extension;
            if read_next >= read.len() || !is_valid_base(read[read_next]) {
                break;
            }
            let read_base = compress_base(read[read_next]);

            if um.strand {
                let unitig_next = um.dist + um.len + extension + k - 1;
                if um.dist + um.len + extension >= km_count || seq.base2(unitig_next) != read_base {
                    break;
                }
            } else {
                if um.dist < extension + 1 {
                    break;
                }
                let unitig_next = um.dist - extension - 1;
                if seq.base2(unitig_next) != complement_base(read_base) {
                    break;
                }
            }
            extension += 1;
        }

        if !um.strand {
            um.dist -= extension;
        }
        um.len += extension;
        extension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn revcomp(seq: &[u8]) -> Vec<u8> {
        seq.iter()
            .rev()
            .map(|b| match b {
                b'A' => b'T',
                b'C' => b'G',
                b'G' => b'C',
                _ => b'A',
            })
            .collect()
    }

    #[test]
    fn compressed_sequence_roundtrip() {
        let seq = CompressedSequence::from_bases(b"ACGTTGCAAC").unwrap();
        assert_eq!(seq.len(), 10);
        assert_eq!(seq.to_string(), "ACGTTGCAAC");
        assert_eq!(seq.kmer_at(2, 5).to_string(5), "GTTGC");
        assert!(CompressedSequence::from_bases(b"ACGN").is_none());
    }

    #[test]
    fn find_reports_strand_and_position() {
        let graph = CompactedGraph::from_unitigs(5, ["ACGTTGCA", "GGGGCTTAA"]).unwrap();

        let um = graph.find(Kmer::from_bases(b"CGTTG").unwrap()).unwrap();
        assert_eq!((um.unitig_id, um.dist, um.strand), (0, 1, true));
        assert_eq!(um.km_count(5), 4);

        // Reverse complement of GGGCT, which starts at offset 1 of unitig 1
        let um = graph.find(Kmer::from_bases(b"AGCCC").unwrap()).unwrap();
        assert_eq!((um.unitig_id, um.dist, um.strand), (1, 1, false));

        assert!(graph.find(Kmer::from_bases(b"TTTTT").unwrap()).is_none());
    }

    #[test]
    fn duplicate_kmers_are_rejected() {
        assert!(matches!(
            CompactedGraph::from_unitigs(5, ["ACGTTGCA", "CGTTG"]),
            Err(GraphError::DuplicateKmer { .. })
        ));
    }

    #[test]
    fn forward_extension_covers_full_match() {
        let graph = CompactedGraph::from_unitigs(5, ["AAACCCGGTT"]).unwrap();
        let read = b"AAACCCGGTT";

        let mut um = graph.find(Kmer::from_bases(&read[..5]).unwrap()).unwrap();
        let extension = graph.extend_mapping(&mut um, read, 0);

        assert_eq!(extension, 5);
        assert_eq!((um.dist, um.len, um.strand), (0, 6, true));
    }

    #[test]
    fn reverse_extension_walks_backwards() {
        let unitig = b"AAACCCGGTT";
        let graph = CompactedGraph::from_unitigs(5, [&unitig[..]]).unwrap();
        let read = revcomp(unitig);

        let mut um = graph.find(Kmer::from_bases(&read[..5]).unwrap()).unwrap();
        assert_eq!((um.dist, um.strand), (5, false));

        let extension = graph.extend_mapping(&mut um, &read, 0);
        assert_eq!(extension, 5);
        assert_eq!((um.dist, um.len), (0, 6));
    }

    #[test]
    fn extension_stops_at_mismatch_and_ambiguity() {
        let graph = CompactedGraph::from_unitigs(5, ["AAACCCGGTT"]).unwrap();

        let read = b"AAACCCNGTT";
        let mut um = graph.find(Kmer::from_bases(&read[..5]).unwrap()).unwrap();
        assert_eq!(graph.extend_mapping(&mut um, read, 0), 1);
        assert_eq!(um.len, 2);
    }
}
