use std::cell::UnsafeCell;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use config::{ColorIndexType, COLOR_STRIPES_COUNT, DEFAULT_OUTPUT_BUFFER_SIZE, MAX_COLOR_HASHES};
use graph::{CompactedGraph, Kmer, UnitigMap};
use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};
use rand::RngCore;

use crate::unitig_colors::UnitigColors;
use crate::ColorsError;

/// A color set slot. Mutated only under the owning stripe lock; distinct
/// unitigs always resolve to distinct slots, so two stripes never alias
/// the same slot.
pub(crate) struct ColorSlot(UnsafeCell<UnitigColors>);

unsafe impl Sync for ColorSlot {}

impl ColorSlot {
    fn new(colors: UnitigColors) -> Self {
        Self(UnsafeCell::new(colors))
    }

    #[inline]
    pub(crate) fn get(&self) -> &UnitigColors {
        unsafe { &*self.0.get() }
    }

    /// Caller must hold the stripe lock of the owning unitig.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub(crate) unsafe fn get_mut(&self) -> &mut UnitigColors {
        unsafe { &mut *self.0.get() }
    }
}

/// Graph-wide color storage: one UnitigColors per unitig, reachable in O(1)
/// from the unitig's head k-mer through an 8-bit hash selector stored in the
/// graph's per-unitig data slot (0 = overflow table, `i + 1` = seed index).
///
/// The selector byte is written once by [`ColorStorage::init`] and immutable
/// afterwards; mutual exclusion during the parallel mapping phase comes from
/// a striped lock table indexed by `unitig_id`.
pub struct ColorStorage {
    slots: Box<[ColorSlot]>,
    overflow: HashMap<u64, ColorSlot>,
    seeds: Box<[u64]>,
    stripes: Box<[Mutex<()>]>,
    color_names: Vec<String>,
    k: usize,
}

impl ColorStorage {
    /// Claims one slot per unitig, serially, in graph order: the first seed
    /// hashing the head k-mer to an unoccupied slot wins; a unitig whose
    /// probes are all taken goes to the overflow table.
    pub fn init(graph: &mut CompactedGraph, color_names: Vec<String>) -> Result<Self, ColorsError> {
        let mut rng = rand::thread_rng();
        let seeds: Box<[u64]> = (0..MAX_COLOR_HASHES).map(|_| rng.next_u64()).collect();

        Self::init_with_seeds(graph, color_names, seeds)
    }

    fn init_with_seeds(
        graph: &mut CompactedGraph,
        color_names: Vec<String>,
        seeds: Box<[u64]>,
    ) -> Result<Self, ColorsError> {
        let unitigs_count = graph.unitigs_count();

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(unitigs_count)
            .map_err(|_| ColorsError::AllocationFailed)?;
        slots.extend((0..unitigs_count).map(|_| ColorSlot::new(UnitigColors::Unoccupied)));

        let mut overflow = HashMap::new();
        let mut overflow_count = 0usize;

        for unitig_id in 0..unitigs_count {
            let head = graph.head_kmer(unitig_id);

            let mut accessor = 0u8;
            for (seed_index, seed) in seeds.iter().enumerate() {
                let slot = (head.hash(*seed) % unitigs_count as u64) as usize;
                if slots[slot].0.get_mut().is_unoccupied() {
                    slots[slot].0.get_mut().set_occupied();
                    accessor = (seed_index + 1) as u8;
                    break;
                }
            }

            if accessor == 0 {
                overflow_count += 1;
                match overflow.entry(head.bits()) {
                    hashbrown::hash_map::Entry::Occupied(_) => {
                        return Err(ColorsError::OverflowInsertFailed);
                    }
                    hashbrown::hash_map::Entry::Vacant(entry) => {
                        entry.insert(ColorSlot::new(UnitigColors::new_occupied()));
                    }
                }
            }

            graph.set_data(unitig_id, accessor);
        }

        if overflow_count > 0 {
            ccdbg_logging::info!(
                "{} unitigs of {} could not be hashed and use the overflow table",
                overflow_count,
                unitigs_count
            );
        }

        Ok(Self {
            slots: slots.into_boxed_slice(),
            overflow,
            seeds,
            stripes: (0..COLOR_STRIPES_COUNT)
                .map(|_| Mutex::new(()))
                .collect(),
            color_names,
            k: graph.k(),
        })
    }

    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    #[inline]
    pub fn unitigs_count(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn colors_count(&self) -> usize {
        self.color_names.len()
    }

    pub fn color_name(&self, color_id: ColorIndexType) -> Option<&str> {
        self.color_names.get(color_id as usize).map(String::as_str)
    }

    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }

    pub(crate) fn slot_for(
        &self,
        um: &UnitigMap,
        graph: &CompactedGraph,
    ) -> Option<&ColorSlot> {
        let accessor = graph.data(um.unitig_id);
        let head = graph.head_kmer(um.unitig_id);

        if accessor == 0 {
            self.overflow.get(&head.bits())
        } else {
            let seed = self.seeds[accessor as usize - 1];
            let slot = (head.hash(seed) % self.slots.len() as u64) as usize;
            Some(&self.slots[slot])
        }
    }

    #[inline]
    pub(crate) fn lock_unitig(&self, unitig_id: usize) -> MutexGuard<'_, ()> {
        self.stripes[unitig_id & (COLOR_STRIPES_COUNT - 1)].lock()
    }

    /// The color set of a unitig. The reference must not be held across a
    /// concurrent `set_color` on the same unitig; during the parallel
    /// mapping phase all mutation goes through the stripe locks.
    pub fn color_set(&self, um: &UnitigMap, graph: &CompactedGraph) -> Option<&UnitigColors> {
        self.slot_for(um, graph).map(ColorSlot::get)
    }

    fn check_mapping(&self, um: &UnitigMap, color_id: ColorIndexType) -> Result<(), ColorsError> {
        let km_count = um.km_count(self.k) as u64;
        let end = color_id as u64 * km_count + (um.dist + um.len) as u64;

        if (color_id as usize) < self.color_names.len()
            && um.len > 0
            && (um.dist + um.len) as u64 <= km_count
            && end <= u32::MAX as u64 + 1
        {
            Ok(())
        } else {
            Err(ColorsError::InvalidColorKmerId)
        }
    }

    /// Adds `color_id` to every k-mer of the mapping, under the unitig's
    /// stripe lock. Returns false when the mapping resolves to no slot or
    /// the color/mapping pair is out of range.
    pub fn set_color(
        &self,
        um: &UnitigMap,
        graph: &CompactedGraph,
        color_id: ColorIndexType,
    ) -> bool {
        if let Err(err) = self.check_mapping(um, color_id) {
            ccdbg_logging::error!(
                "rejected color {} on unitig {}: {}",
                color_id,
                um.unitig_id,
                err
            );
            return false;
        }

        let Some(slot) = self.slot_for(um, graph) else {
            return false;
        };

        let _guard = self.lock_unitig(um.unitig_id);
        unsafe { slot.get_mut() }.add(um, self.k, color_id);
        true
    }

    /// True iff every k-mer of the mapping carries `color_id`.
    pub fn contains_color(
        &self,
        um: &UnitigMap,
        graph: &CompactedGraph,
        color_id: ColorIndexType,
    ) -> bool {
        self.color_set(um, graph)
            .map(|colors| colors.contains(um, self.k, color_id))
            .unwrap_or(false)
    }

    /// Run-compresses every bitmap-backed color set. Lossless; meant to be
    /// called once after the mapping phase.
    pub fn optimize(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.0.get_mut().optimize();
        }
        for slot in self.overflow.values_mut() {
            slot.0.get_mut().optimize();
        }
    }

    pub fn write_file(&self, path: impl AsRef<Path>) -> Result<(), ColorsError> {
        let file = File::create(path.as_ref()).map_err(|err| {
            ccdbg_logging::error!("cannot create colors file {}", path.as_ref().display());
            ColorsError::io(err)
        })?;

        let mut writer = BufWriter::with_capacity(DEFAULT_OUTPUT_BUFFER_SIZE, file);
        self.write_to(&mut writer)?;
        writer.flush().map_err(ColorsError::io)
    }

    /// Serializes the storage: slot count, color count, seed table, the
    /// overflow entries keyed by packed head k-mer, every slot blob in
    /// order, then the nul-terminated color names.
    pub fn write_to(&self, writer: &mut impl Write) -> Result<(), ColorsError> {
        writer
            .write_u32::<LittleEndian>(self.slots.len() as u32)
            .map_err(ColorsError::io)?;
        writer
            .write_u32::<LittleEndian>(self.color_names.len() as u32)
            .map_err(ColorsError::io)?;
        writer
            .write_u32::<LittleEndian>(self.seeds.len() as u32)
            .map_err(ColorsError::io)?;
        for seed in self.seeds.iter() {
            writer
                .write_u64::<LittleEndian>(*seed)
                .map_err(ColorsError::io)?;
        }

        writer
            .write_u32::<LittleEndian>(self.overflow.len() as u32)
            .map_err(ColorsError::io)?;

        let mut overflow_entries: Vec<_> = self.overflow.iter().collect();
        overflow_entries.sort_unstable_by_key(|(bits, _)| **bits);

        let mut packed_kmer = vec![0u8; Kmer::packed_size(self.k)];
        for (bits, slot) in overflow_entries {
            Kmer::from_bits(*bits).to_packed_bytes(self.k, &mut packed_kmer);
            writer.write_all(&packed_kmer).map_err(ColorsError::io)?;
            slot.get().write(writer)?;
        }

        for slot in self.slots.iter() {
            slot.get().write(writer)?;
        }

        for name in &self.color_names {
            writer.write_all(name.as_bytes()).map_err(ColorsError::io)?;
            writer.write_u8(0).map_err(ColorsError::io)?;
        }

        Ok(())
    }

    pub fn read_file(
        path: impl AsRef<Path>,
        graph: &mut CompactedGraph,
    ) -> Result<Self, ColorsError> {
        let file = File::open(path.as_ref()).map_err(|err| {
            ccdbg_logging::error!("cannot open colors file {}", path.as_ref().display());
            ColorsError::io(err)
        })?;
        Self::read_from(
            &mut BufReader::with_capacity(DEFAULT_OUTPUT_BUFFER_SIZE, file),
            graph,
        )
    }

    /// Deserializes a storage written by [`write_to`](Self::write_to) and
    /// rebinds every unitig's accessor byte by replaying the deterministic
    /// claim order of `init` against the occupancy found in the file.
    pub fn read_from(
        reader: &mut impl Read,
        graph: &mut CompactedGraph,
    ) -> Result<Self, ColorsError> {
        let unitigs_count = reader.read_u32::<LittleEndian>().map_err(ColorsError::io)? as usize;
        if unitigs_count != graph.unitigs_count() {
            return Err(ColorsError::GraphMismatch {
                file: unitigs_count,
                graph: graph.unitigs_count(),
            });
        }

        let colors_count = reader.read_u32::<LittleEndian>().map_err(ColorsError::io)? as usize;
        let seeds_count = reader.read_u32::<LittleEndian>().map_err(ColorsError::io)? as usize;
        if seeds_count == 0 || seeds_count > u8::MAX as usize {
            return Err(ColorsError::IoVersionMismatch);
        }

        let mut seeds = vec![0u64; seeds_count];
        for seed in seeds.iter_mut() {
            *seed = reader.read_u64::<LittleEndian>().map_err(ColorsError::io)?;
        }

        let overflow_count = reader.read_u32::<LittleEndian>().map_err(ColorsError::io)? as usize;
        let k = graph.k();
        let mut overflow = HashMap::with_capacity(overflow_count);
        let mut packed_kmer = vec![0u8; Kmer::packed_size(k)];

        for _ in 0..overflow_count {
            reader
                .read_exact(&mut packed_kmer)
                .map_err(ColorsError::io)?;
            let head = Kmer::from_packed_bytes(k, &packed_kmer);
            let colors = UnitigColors::read(reader)?;
            if overflow
                .insert(head.bits(), ColorSlot::new(colors))
                .is_some()
            {
                return Err(ColorsError::OverflowInsertFailed);
            }
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(unitigs_count)
            .map_err(|_| ColorsError::AllocationFailed)?;
        for _ in 0..unitigs_count {
            slots.push(ColorSlot::new(UnitigColors::read(reader)?));
        }

        let mut color_names = Vec::with_capacity(colors_count);
        let mut name = Vec::new();
        for _ in 0..colors_count {
            name.clear();
            loop {
                let byte = reader.read_u8().map_err(ColorsError::io)?;
                if byte == 0 {
                    break;
                }
                name.push(byte);
            }
            color_names.push(
                String::from_utf8(name.clone()).map_err(|_| ColorsError::IoVersionMismatch)?,
            );
        }

        let storage = Self {
            slots: slots.into_boxed_slice(),
            overflow,
            seeds: seeds.into_boxed_slice(),
            stripes: (0..COLOR_STRIPES_COUNT)
                .map(|_| Mutex::new(()))
                .collect(),
            color_names,
            k,
        };
        storage.rebind_accessors(graph)?;

        Ok(storage)
    }

    /// Replays the first-empty-wins claim order: the slots occupied in the
    /// file are claimed by unitigs in graph order exactly as `init` claimed
    /// them, which recovers each unitig's accessor byte without storing it.
    fn rebind_accessors(&self, graph: &mut CompactedGraph) -> Result<(), ColorsError> {
        let unitigs_count = self.slots.len();
        let mut claimed = vec![false; unitigs_count];

        for unitig_id in 0..unitigs_count {
            let head = graph.head_kmer(unitig_id);

            let mut accessor = 0u8;
            for (seed_index, seed) in self.seeds.iter().enumerate() {
                let slot = (head.hash(*seed) % unitigs_count as u64) as usize;
                if !claimed[slot] && !self.slots[slot].get().is_unoccupied() {
                    claimed[slot] = true;
                    accessor = (seed_index + 1) as u8;
                    break;
                }
            }

            if accessor == 0 && !self.overflow.contains_key(&head.bits()) {
                return Err(ColorsError::IoVersionMismatch);
            }

            graph.set_data(unitig_id, accessor);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Builds a graph of `count` single-k-mer unitigs with distinct
    /// canonical forms.
    fn toy_graph(k: usize, count: usize) -> CompactedGraph {
        let mut sequences = vec![];
        let mut seen = hashbrown::HashSet::new();

        let mut candidate = 0u64;
        while sequences.len() < count {
            let km = Kmer::from_bits(candidate);
            candidate += 1;

            let (canonical, _) = km.canonical(k);
            if !seen.insert(canonical.bits()) {
                continue;
            }
            sequences.push(km.to_string(k));
        }

        CompactedGraph::from_unitigs(k, sequences).unwrap()
    }

    fn whole_mapping(graph: &CompactedGraph, unitig_id: usize) -> UnitigMap {
        UnitigMap::whole(unitig_id, graph.unitig_size(unitig_id), graph.k())
    }

    #[test]
    fn init_claims_one_distinct_slot_per_unitig() {
        let mut graph = toy_graph(9, 200);
        let storage = ColorStorage::init(&mut graph, vec!["a".into(), "b".into()]).unwrap();

        let mut seen_slots = hashbrown::HashSet::new();
        let mut occupied = 0;
        for unitig_id in 0..graph.unitigs_count() {
            let accessor = graph.data(unitig_id);
            let head = graph.head_kmer(unitig_id);

            if accessor == 0 {
                assert!(storage.overflow.contains_key(&head.bits()));
            } else {
                let seed = storage.seeds[accessor as usize - 1];
                let slot = (head.hash(seed) % graph.unitigs_count() as u64) as usize;
                assert!(!storage.slots[slot].get().is_unoccupied());
                assert!(seen_slots.insert(slot), "two unitigs share slot {}", slot);
                occupied += 1;
            }
        }
        assert_eq!(occupied + storage.overflow.len(), graph.unitigs_count());
    }

    #[test]
    fn set_and_query_colors() {
        let mut graph = toy_graph(9, 50);
        let storage = ColorStorage::init(&mut graph, vec!["a".into(), "b".into()]).unwrap();

        let um = whole_mapping(&graph, 7);
        assert!(storage.set_color(&um, &graph, 1));
        assert!(storage.contains_color(&um, &graph, 1));
        assert!(!storage.contains_color(&um, &graph, 0));

        let colors = storage.color_set(&um, &graph).unwrap();
        assert_eq!(colors.size(), um.km_count(graph.k()));

        // Untouched unitigs stay empty but occupied or in the overflow
        let other = whole_mapping(&graph, 3);
        assert_eq!(storage.color_set(&other, &graph).unwrap().size(), 0);
    }

    #[test]
    fn out_of_range_color_is_rejected() {
        let mut graph = toy_graph(9, 10);
        let storage = ColorStorage::init(&mut graph, vec!["only".into()]).unwrap();

        let um = whole_mapping(&graph, 0);
        assert!(!storage.set_color(&um, &graph, 1));
        assert_eq!(storage.color_set(&um, &graph).unwrap().size(), 0);
    }

    #[test]
    fn file_roundtrip_restores_colors_and_accessors() {
        let mut graph = toy_graph(9, 120);
        let names = vec!["one".into(), "two".into(), "three".into()];
        let storage = ColorStorage::init(&mut graph, names).unwrap();

        for unitig_id in 0..graph.unitigs_count() {
            let um = whole_mapping(&graph, unitig_id);
            storage.set_color(&um, &graph, (unitig_id % 3) as ColorIndexType);
            if unitig_id % 5 == 0 {
                storage.set_color(&um, &graph, 2);
            }
        }

        let mut buffer = vec![];
        storage.write_to(&mut buffer).unwrap();

        let accessors: Vec<u8> = (0..graph.unitigs_count())
            .map(|id| graph.data(id))
            .collect();

        // Reload against an identical graph with blank data slots
        let mut reloaded_graph = toy_graph(9, 120);
        let reloaded = ColorStorage::read_from(&mut Cursor::new(&buffer), &mut reloaded_graph)
            .unwrap();

        assert_eq!(reloaded.colors_count(), 3);
        assert_eq!(reloaded.color_name(1), Some("two"));
        assert_eq!(reloaded.overflow_len(), storage.overflow_len());

        for unitig_id in 0..graph.unitigs_count() {
            assert_eq!(accessors[unitig_id], reloaded_graph.data(unitig_id));

            let um = whole_mapping(&graph, unitig_id);
            let original = storage.color_set(&um, &graph).unwrap();
            let restored = reloaded.color_set(&um, &reloaded_graph).unwrap();
            assert!(original.same_colors(restored));
        }
    }

    #[test]
    fn mismatched_graph_is_rejected() {
        let mut graph = toy_graph(9, 30);
        let storage = ColorStorage::init(&mut graph, vec!["a".into()]).unwrap();

        let mut buffer = vec![];
        storage.write_to(&mut buffer).unwrap();

        let mut smaller_graph = toy_graph(9, 29);
        assert!(matches!(
            ColorStorage::read_from(&mut Cursor::new(&buffer), &mut smaller_graph),
            Err(ColorsError::GraphMismatch { file: 30, graph: 29 })
        ));
    }

    #[test]
    fn truncated_file_is_rejected() {
        let mut graph = toy_graph(9, 20);
        let storage = ColorStorage::init(&mut graph, vec!["a".into()]).unwrap();

        let mut buffer = vec![];
        storage.write_to(&mut buffer).unwrap();
        buffer.truncate(buffer.len() / 2);

        let mut reloaded_graph = toy_graph(9, 20);
        assert!(matches!(
            ColorStorage::read_from(&mut Cursor::new(&buffer), &mut reloaded_graph),
            Err(ColorsError::IoTruncated)
        ));
    }

    #[test]
    fn concurrent_adds_on_distinct_unitigs_match_serial_execution() {
        let mut graph = toy_graph(9, 64);
        let storage = ColorStorage::init(&mut graph, vec!["a".into(), "b".into()]).unwrap();

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let graph = &graph;
                let storage = &storage;
                scope.spawn(move || {
                    for unitig_id in (worker..graph.unitigs_count()).step_by(4) {
                        let um = whole_mapping(graph, unitig_id);
                        storage.set_color(&um, graph, (unitig_id % 2) as ColorIndexType);
                    }
                });
            }
        });

        for unitig_id in 0..graph.unitigs_count() {
            let um = whole_mapping(&graph, unitig_id);
            assert!(storage.contains_color(&um, &graph, (unitig_id % 2) as ColorIndexType));
            assert_eq!(
                storage.color_set(&um, &graph).unwrap().size(),
                um.km_count(graph.k())
            );
        }
    }

    #[test]
    fn concurrent_adds_on_one_unitig_union_under_the_lock() {
        let mut graph = toy_graph(9, 8);
        let storage = ColorStorage::init(&mut graph, vec!["a".into(), "b".into()]).unwrap();

        let um = whole_mapping(&graph, 0);
        let km_count = um.km_count(graph.k());

        std::thread::scope(|scope| {
            for color in 0..2u32 {
                let graph = &graph;
                let storage = &storage;
                let um = um;
                scope.spawn(move || {
                    for _ in 0..1000 {
                        storage.set_color(&um, graph, color);
                    }
                });
            }
        });

        assert_eq!(storage.color_set(&um, &graph).unwrap().size(), 2 * km_count);
        assert!(storage.contains_color(&um, &graph, 0));
        assert!(storage.contains_color(&um, &graph, 1));
    }
}
