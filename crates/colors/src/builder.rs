use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use config::{ColorIndexType, DEFAULT_READ_CHUNK_SIZE, READ_CHUNKS_QUEUE_SIZE};
use graph::kmer::{compress_base, is_valid_base};
use graph::{CompactedGraph, Kmer, UnitigMap};
use io::SequencesReader;

use crate::storage::ColorStorage;
use crate::unitig_colors::UnitigColors;
use crate::ColorsError;

pub struct ColorMapOptions {
    pub threads_count: usize,
    pub chunk_size: usize,
    /// Cooperative cancellation, checked between k-mers; an in-flight add
    /// always completes under its stripe lock.
    pub cancel: Arc<AtomicBool>,
}

impl Default for ColorMapOptions {
    fn default() -> Self {
        Self {
            threads_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            chunk_size: DEFAULT_READ_CHUNK_SIZE,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

type SequenceChunk = Vec<(ColorIndexType, Vec<u8>)>;

/// Maps input sequences onto the graph and records, for every mapped k-mer,
/// the id of the file it came from. One reader thread batches sequences into
/// chunks; worker threads drain the chunk queue and insert under the
/// per-unitig stripe locks.
pub fn map_colors(
    graph: &CompactedGraph,
    storage: &ColorStorage,
    inputs: &[impl AsRef<Path>],
    options: &ColorMapOptions,
) -> Result<(), ColorsError> {
    assert_eq!(
        inputs.len(),
        storage.colors_count(),
        "one color per input file"
    );

    std::thread::scope(|scope| {
        let (sender, receiver) =
            crossbeam::channel::bounded::<SequenceChunk>(READ_CHUNKS_QUEUE_SIZE);

        for worker_index in 0..options.threads_count.max(1) {
            let receiver = receiver.clone();
            let cancel = &options.cancel;
            std::thread::Builder::new()
                .name(format!("color-map-{}", worker_index))
                .spawn_scoped(scope, move || {
                    while let Ok(chunk) = receiver.recv() {
                        for (color_id, sequence) in &chunk {
                            if cancel.load(Ordering::Relaxed) {
                                return;
                            }
                            map_sequence(graph, storage, sequence, *color_id, cancel);
                        }
                    }
                })
                .expect("cannot spawn a color mapping worker");
        }
        drop(receiver);

        let mut reader = SequencesReader::new();
        let mut chunk: SequenceChunk = Vec::with_capacity(options.chunk_size);

        for (file_index, input) in inputs.iter().enumerate() {
            if options.cancel.load(Ordering::Relaxed) {
                break;
            }
            let color_id = file_index as ColorIndexType;

            reader
                .process_file(input.as_ref(), |record| {
                    if record.seq.len() < graph.k() {
                        return;
                    }
                    chunk.push((color_id, record.seq.to_vec()));
                    if chunk.len() == options.chunk_size {
                        let full = std::mem::replace(
                            &mut chunk,
                            Vec::with_capacity(options.chunk_size),
                        );
                        let _ = sender.send(full);
                    }
                })
                .map_err(ColorsError::io)?;
        }

        if !chunk.is_empty() {
            let _ = sender.send(chunk);
        }

        Ok(())
    })
}

/// Colors every graph-mapped k-mer of one sequence. Runs of consecutive
/// k-mers landing on the same unitig are merged into a single locked add by
/// extending the first mapping of the run and skipping past it.
fn map_sequence(
    graph: &CompactedGraph,
    storage: &ColorStorage,
    sequence: &[u8],
    color_id: ColorIndexType,
    cancel: &AtomicBool,
) {
    let k = graph.k();
    if sequence.len() < k {
        return;
    }

    let mut km = Kmer::from_bits(0);
    let mut valid_bases = 0usize;
    let mut next_query = 0usize;

    for (index, &base) in sequence.iter().enumerate() {
        if is_valid_base(base) {
            km = km.roll_forward(k, compress_base(base));
            valid_bases += 1;
        } else {
            valid_bases = 0;
        }
        if valid_bases < k {
            continue;
        }

        let start = index + 1 - k;
        if start < next_query {
            continue;
        }
        if cancel.load(Ordering::Relaxed) {
            return;
        }

        if let Some(mut um) = graph.find(km) {
            graph.extend_mapping(&mut um, sequence, start);
            storage.set_color(&um, graph, color_id);
            next_query = start + um.len;
        }
    }
}

/// Decomposes ids into (color, position) pairs, groups runs of consecutive
/// positions under one color, and re-emits each run re-indexed to a new
/// k-mer count, shifted by `position_offset`.
fn emit_position_runs(
    pairs: impl Iterator<Item = (u64, u64)>,
    new_km_count: u64,
    position_offset: u64,
    out: &mut UnitigColors,
) {
    let mut run: Option<(u64, u64, u64)> = None;

    let flush = |run: Option<(u64, u64, u64)>, out: &mut UnitigColors| {
        if let Some((color, start, len)) = run {
            let base = color * new_km_count + position_offset + start;
            out.insert_range(base, base + len);
        }
    };

    for (color, position) in pairs {
        match &mut run {
            Some((c, s, l)) if *c == color && position == *s + *l => *l += 1,
            _ => {
                flush(run.take(), out);
                run = Some((color, position, 1));
            }
        }
    }
    flush(run, out);
}

impl ColorStorage {
    /// Rewrites color annotations for the concatenation of two unitigs:
    /// after the call, dest's color set is re-indexed to the merged k-mer
    /// count `K_dest + K_src` with src's positions shifted by `K_dest`, and
    /// src's slot is released. Reverse-strand mappings are reversed first.
    ///
    /// Must not run concurrently with adds on either unitig.
    pub fn join_colors(
        &self,
        dest: &UnitigMap,
        src: &UnitigMap,
        graph: &CompactedGraph,
    ) -> bool {
        let k = self.k();
        let dest_km = dest.km_count(k) as u64;
        let src_km = src.km_count(k) as u64;
        let merged_km = dest_km + src_km;

        let (Some(dest_slot), Some(src_slot)) =
            (self.slot_for(dest, graph), self.slot_for(src, graph))
        else {
            return false;
        };

        let mut merged = UnitigColors::new_occupied();

        for (colors, km_count, offset, strand) in [
            (dest_slot.get(), dest_km, 0, dest.strand),
            (src_slot.get(), src_km, dest_km, src.strand),
        ] {
            let oriented;
            let view = if strand {
                colors
            } else {
                oriented = colors.reverse(km_count as usize);
                &oriented
            };
            emit_position_runs(
                view.iter()
                    .map(|id| (id.raw() / km_count, id.raw() % km_count)),
                merged_km,
                offset,
                &mut merged,
            );
        }

        {
            let _guard = self.lock_unitig(dest.unitig_id);
            *unsafe { dest_slot.get_mut() } = merged;
        }
        {
            let _guard = self.lock_unitig(src.unitig_id);
            unsafe { src_slot.get_mut() }.set_unoccupied();
        }

        true
    }

    /// The color annotations of the sub-range `[um.dist, um.dist + um.len)`
    /// of a unitig, re-based to position 0 with k-mer count `um.len`.
    pub fn extract_colors(&self, um: &UnitigMap, graph: &CompactedGraph) -> UnitigColors {
        let Some(slot) = self.slot_for(um, graph) else {
            return UnitigColors::Unoccupied;
        };

        let km_count = um.km_count(self.k()) as u64;
        let start = um.dist as u64;
        let end = start + um.len as u64;

        let mut extracted = UnitigColors::new_occupied();
        emit_position_runs(
            slot.get().iter().filter_map(|id| {
                let id = id.raw();
                let position = id % km_count;
                (start..end)
                    .contains(&position)
                    .then(|| (id / km_count, position - start))
            }),
            um.len as u64,
            0,
            &mut extracted,
        );
        extracted
    }
}
