use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use graph::UnitigMap;
use roaring::RoaringBitmap;

use crate::ColorsError;

/// Identifies one (color, k-mer position) pair of a unitig as the single
/// integer `color_id * km_count + position`. Iterating ids in ascending
/// numeric order therefore visits colors in ascending order and, within a
/// color, k-mer positions in ascending order.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ColorKmerId(u64);

impl ColorKmerId {
    /// Reserved all-ones id produced by default-constructed iterators.
    pub const INVALID: Self = Self(u64::MAX);

    #[inline]
    pub fn new(color_id: config::ColorIndexType, km_count: usize, position: usize) -> Self {
        debug_assert!(position < km_count);
        Self(color_id as u64 * km_count as u64 + position as u64)
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_invalid(self) -> bool {
        self.0 == u64::MAX
    }

    /// The color, given the k-mer count of the owning unitig. The invalid
    /// sentinel is reported and returned unchanged.
    pub fn color_id(self, km_count: usize) -> u64 {
        if self.is_invalid() {
            ccdbg_logging::error!("color_id() called on an invalid color k-mer id");
            return self.0;
        }
        self.0 / km_count as u64
    }

    /// The k-mer position on the forward strand of the owning unitig.
    pub fn kmer_position(self, km_count: usize) -> u64 {
        if self.is_invalid() {
            ccdbg_logging::error!("kmer_position() called on an invalid color k-mer id");
            return self.0;
        }
        self.0 % km_count as u64
    }
}

impl Default for ColorKmerId {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Largest id storable in the inline bit vector: 64 bits minus the two the
/// on-disk tag encoding reserves.
pub const MAX_BIT_VECTOR_IDS: u64 = 62;

pub(crate) const TAG_BITMAP: u8 = 0;
pub(crate) const TAG_BIT_VECTOR: u8 = 1;
pub(crate) const TAG_SINGLE: u8 = 2;
pub(crate) const TAG_UNOCCUPIED: u8 = 3;

/// The k-mer color sets of one unitig, in one of four representations:
///
/// - `Bitmap`: heap compressed bitmap holding arbitrary ids,
/// - `BitVector`: inline presence mask for ids `0..62`,
/// - `Single`: exactly one id,
/// - `Unoccupied`: the slot is not associated with any unitig.
///
/// Representation changes are one-way: a set never leaves the `Bitmap`
/// state once it reaches it.
#[derive(Clone, Debug)]
pub enum UnitigColors {
    Bitmap(Box<RoaringBitmap>),
    BitVector(u64),
    Single(u64),
    Unoccupied,
}

impl Default for UnitigColors {
    fn default() -> Self {
        Self::Unoccupied
    }
}

impl UnitigColors {
    /// An occupied set holding no colors.
    pub fn new_occupied() -> Self {
        Self::BitVector(0)
    }

    #[inline]
    pub fn is_unoccupied(&self) -> bool {
        matches!(self, Self::Unoccupied)
    }

    /// Claims the slot for a unitig without adding colors.
    pub fn set_occupied(&mut self) {
        if self.is_unoccupied() {
            *self = Self::BitVector(0);
        }
    }

    /// Releases the slot, dropping any heap bitmap.
    pub fn set_unoccupied(&mut self) {
        *self = Self::Unoccupied;
    }

    /// Empties the set but keeps the slot associated with its unitig.
    pub fn clear(&mut self) {
        if !self.is_unoccupied() {
            *self = Self::BitVector(0);
        }
    }

    /// Adds `color_id` to every k-mer covered by the mapping.
    pub fn add(&mut self, um: &UnitigMap, k: usize, color_id: config::ColorIndexType) {
        let km_count = um.km_count(k) as u64;
        debug_assert!(um.len > 0 && (um.dist + um.len) as u64 <= km_count);

        let start = color_id as u64 * km_count + um.dist as u64;
        self.insert_range(start, start + um.len as u64);
    }

    /// Inserts the contiguous id range `[start, end)`, applying the one-way
    /// representation transitions.
    pub(crate) fn insert_range(&mut self, start: u64, end: u64) {
        debug_assert!(start < end);
        assert!(
            end <= u32::MAX as u64 + 1,
            "color k-mer id {} exceeds the supported range",
            end - 1
        );

        self.set_occupied();

        match self {
            Self::BitVector(mask) => {
                if *mask == 0 && end - start == 1 {
                    *self = Self::Single(start);
                } else if end <= MAX_BIT_VECTOR_IDS {
                    *mask |= range_mask(start, end);
                } else {
                    let mut bitmap = bitmap_from_mask(*mask);
                    bitmap.insert_range(start as u32..=(end - 1) as u32);
                    *self = Self::Bitmap(Box::new(bitmap));
                }
            }
            Self::Single(existing) => {
                if end - start == 1 && *existing == start {
                    return;
                }
                if *existing < MAX_BIT_VECTOR_IDS && end <= MAX_BIT_VECTOR_IDS {
                    *self = Self::BitVector((1u64 << *existing) | range_mask(start, end));
                } else {
                    let mut bitmap = RoaringBitmap::new();
                    bitmap.insert(*existing as u32);
                    bitmap.insert_range(start as u32..=(end - 1) as u32);
                    *self = Self::Bitmap(Box::new(bitmap));
                }
            }
            Self::Bitmap(bitmap) => {
                bitmap.insert_range(start as u32..=(end - 1) as u32);
            }
            Self::Unoccupied => unreachable!(),
        }
    }

    #[inline]
    pub(crate) fn insert(&mut self, id: u64) {
        self.insert_range(id, id + 1);
    }

    /// True iff `color_id` is present on every k-mer covered by the mapping.
    pub fn contains(&self, um: &UnitigMap, k: usize, color_id: config::ColorIndexType) -> bool {
        let km_count = um.km_count(k) as u64;
        debug_assert!(um.len > 0 && (um.dist + um.len) as u64 <= km_count);

        let start = color_id as u64 * km_count + um.dist as u64;
        self.contains_range(start, start + um.len as u64)
    }

    fn contains_range(&self, start: u64, end: u64) -> bool {
        match self {
            Self::Bitmap(bitmap) => {
                if end > u32::MAX as u64 + 1 {
                    return false;
                }
                (start..end).all(|id| bitmap.contains(id as u32))
            }
            Self::BitVector(mask) => {
                end <= MAX_BIT_VECTOR_IDS && {
                    let range = range_mask(start, end);
                    mask & range == range
                }
            }
            Self::Single(existing) => end - start == 1 && *existing == start,
            Self::Unoccupied => false,
        }
    }

    /// Number of distinct ids, i.e. the per-k-mer color set cardinalities
    /// summed over the whole unitig.
    pub fn size(&self) -> usize {
        match self {
            Self::Bitmap(bitmap) => bitmap.len() as usize,
            Self::BitVector(mask) => mask.count_ones() as usize,
            Self::Single(_) => 1,
            Self::Unoccupied => 0,
        }
    }

    /// Iterates ids in ascending numeric order, which is by color and
    /// within a color by k-mer position.
    pub fn iter(&self) -> UnitigColorsIter<'_> {
        UnitigColorsIter {
            inner: match self {
                Self::Bitmap(bitmap) => IterInner::Bitmap(bitmap.iter()),
                Self::BitVector(mask) => IterInner::BitVector(*mask),
                Self::Single(id) => IterInner::Single(Some(*id)),
                Self::Unoccupied => IterInner::BitVector(0),
            },
        }
    }

    /// The same colors with every k-mer position mirrored:
    /// `color * K + pos` becomes `color * K + (K - 1 - pos)`.
    pub fn reverse(&self, km_count: usize) -> UnitigColors {
        if self.is_unoccupied() {
            return Self::Unoccupied;
        }

        let km_count = km_count as u64;
        let mut reversed = Self::new_occupied();
        for id in self.iter() {
            let id = id.raw();
            debug_assert!(id % km_count < km_count);
            let color = id / km_count;
            let position = id % km_count;
            reversed.insert(color * km_count + (km_count - 1 - position));
        }
        reversed
    }

    /// Set-union with another color set over the same unitig coordinates.
    pub fn merge(&mut self, other: &UnitigColors) {
        let mut run: Option<(u64, u64)> = None;
        for id in other.iter() {
            let id = id.raw();
            match &mut run {
                Some((_, end)) if *end == id => *end += 1,
                _ => {
                    if let Some((start, end)) = run.take() {
                        self.insert_range(start, end);
                    }
                    run = Some((id, id + 1));
                }
            }
        }
        if let Some((start, end)) = run {
            self.insert_range(start, end);
        }
    }

    /// Collapses runs of consecutive ids in the compressed bitmap. Lossless
    /// and optional; a no-op in the inline representations.
    pub fn optimize(&mut self) {
        if let Self::Bitmap(bitmap) = self {
            bitmap.optimize();
        }
    }

    /// True when both sets are occupied (or both unoccupied) and hold the
    /// same ids, regardless of representation.
    pub fn same_colors(&self, other: &UnitigColors) -> bool {
        self.is_unoccupied() == other.is_unoccupied() && self.iter().eq(other.iter())
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            Self::Bitmap(_) => TAG_BITMAP,
            Self::BitVector(_) => TAG_BIT_VECTOR,
            Self::Single(_) => TAG_SINGLE,
            Self::Unoccupied => TAG_UNOCCUPIED,
        }
    }

    /// Writes the stable binary encoding: a tag byte followed by the
    /// representation payload (see the storage file layout).
    pub fn write(&self, writer: &mut impl Write) -> Result<(), ColorsError> {
        writer.write_u8(self.tag()).map_err(ColorsError::io)?;

        match self {
            Self::Bitmap(bitmap) => {
                let size = bitmap.serialized_size();
                writer
                    .write_u32::<LittleEndian>(size as u32)
                    .map_err(ColorsError::io)?;
                bitmap.serialize_into(&mut *writer).map_err(ColorsError::io)?;
            }
            Self::BitVector(mask) => {
                writer
                    .write_u64::<LittleEndian>((mask << 2) | TAG_BIT_VECTOR as u64)
                    .map_err(ColorsError::io)?;
            }
            Self::Single(id) => {
                writer
                    .write_u64::<LittleEndian>(*id)
                    .map_err(ColorsError::io)?;
            }
            Self::Unoccupied => {}
        }
        Ok(())
    }

    pub fn read(reader: &mut impl Read) -> Result<Self, ColorsError> {
        let tag = reader.read_u8().map_err(ColorsError::io)?;

        Ok(match tag {
            TAG_BITMAP => {
                let size = reader.read_u32::<LittleEndian>().map_err(ColorsError::io)? as usize;
                let mut blob = vec![0u8; size];
                reader.read_exact(&mut blob).map_err(ColorsError::io)?;
                let bitmap = RoaringBitmap::deserialize_from(&blob[..])
                    .map_err(|_| ColorsError::IoVersionMismatch)?;
                Self::Bitmap(Box::new(bitmap))
            }
            TAG_BIT_VECTOR => {
                let word = reader.read_u64::<LittleEndian>().map_err(ColorsError::io)?;
                if word & 0x3 != TAG_BIT_VECTOR as u64 {
                    return Err(ColorsError::IoVersionMismatch);
                }
                Self::BitVector(word >> 2)
            }
            TAG_SINGLE => {
                Self::Single(reader.read_u64::<LittleEndian>().map_err(ColorsError::io)?)
            }
            TAG_UNOCCUPIED => Self::Unoccupied,
            _ => return Err(ColorsError::IoVersionMismatch),
        })
    }
}

#[inline]
fn range_mask(start: u64, end: u64) -> u64 {
    debug_assert!(end <= MAX_BIT_VECTOR_IDS);
    ((1u64 << (end - start)) - 1) << start
}

fn bitmap_from_mask(mut mask: u64) -> RoaringBitmap {
    let mut bitmap = RoaringBitmap::new();
    while mask != 0 {
        let id = mask.trailing_zeros();
        bitmap.insert(id);
        mask &= mask - 1;
    }
    bitmap
}

enum IterInner<'a> {
    Bitmap(roaring::bitmap::Iter<'a>),
    BitVector(u64),
    Single(Option<u64>),
}

pub struct UnitigColorsIter<'a> {
    inner: IterInner<'a>,
}

impl<'a> Iterator for UnitigColorsIter<'a> {
    type Item = ColorKmerId;

    fn next(&mut self) -> Option<ColorKmerId> {
        match &mut self.inner {
            IterInner::Bitmap(iter) => iter.next().map(|id| ColorKmerId::from_raw(id as u64)),
            IterInner::BitVector(mask) => {
                if *mask == 0 {
                    None
                } else {
                    let id = mask.trailing_zeros() as u64;
                    *mask &= *mask - 1;
                    Some(ColorKmerId::from_raw(id))
                }
            }
            IterInner::Single(id) => id.take().map(ColorKmerId::from_raw),
        }
    }
}
