//! Colored compacted de Bruijn graph: a per-k-mer color annotation layer
//! over a finished compacted graph. Each input file is one color; every
//! k-mer occurrence of every unitig records the set of files it came from.
//!
//! The graph scaffold is loaded from already-extracted unitigs; the color
//! layer claims one [`UnitigColors`] slot per unitig through a hash-selector
//! byte kept in the graph's per-unitig data slot, maps input sequences onto
//! the graph in parallel, and serializes the annotations to a companion
//! `.bfg_colors` file.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub use ccdbg_logging;
pub use colors::{ColorKmerId, ColorMapOptions, ColorStorage, ColorsError, UnitigColors};
pub use config::ColorIndexType;
pub use graph::{CompactedGraph, GraphError, Kmer, UnitigMap};

/// A compacted graph together with its color annotations.
pub struct ColoredCompactedGraph {
    graph: CompactedGraph,
    colors: ColorStorage,
}

impl ColoredCompactedGraph {
    /// Builds the graph scaffold from already-extracted unitigs and claims
    /// a color slot for each of them. `color_names` fixes the number of
    /// colors; their order must match the input file order passed to
    /// [`map_colors`](Self::map_colors).
    pub fn from_unitigs<S: AsRef<[u8]>>(
        k: usize,
        unitigs: impl IntoIterator<Item = S>,
        color_names: Vec<String>,
    ) -> anyhow::Result<Self> {
        let mut graph = CompactedGraph::from_unitigs(k, unitigs)?;
        let colors = ColorStorage::init(&mut graph, color_names)?;
        Ok(Self { graph, colors })
    }

    #[inline]
    pub fn graph(&self) -> &CompactedGraph {
        &self.graph
    }

    #[inline]
    pub fn k(&self) -> usize {
        self.graph.k()
    }

    #[inline]
    pub fn unitigs_count(&self) -> usize {
        self.graph.unitigs_count()
    }

    #[inline]
    pub fn colors_count(&self) -> usize {
        self.colors.colors_count()
    }

    pub fn color_name(&self, color_id: ColorIndexType) -> Option<&str> {
        self.colors.color_name(color_id)
    }

    pub fn find(&self, km: Kmer) -> Option<UnitigMap> {
        self.graph.find(km)
    }

    /// Streams the sequences of `inputs` through the graph and colors every
    /// mapped k-mer with its file index. One file per color, in the order
    /// the color names were given at construction.
    pub fn map_colors(
        &self,
        inputs: &[impl AsRef<Path>],
        options: &ColorMapOptions,
    ) -> anyhow::Result<()> {
        colors::map_colors(&self.graph, &self.colors, inputs, options)?;
        Ok(())
    }

    pub fn set_color(&self, um: &UnitigMap, color_id: ColorIndexType) -> bool {
        self.colors.set_color(um, &self.graph, color_id)
    }

    pub fn color_set(&self, um: &UnitigMap) -> Option<&UnitigColors> {
        self.colors.color_set(um, &self.graph)
    }

    pub fn contains_color(&self, um: &UnitigMap, color_id: ColorIndexType) -> bool {
        self.colors.contains_color(um, &self.graph, color_id)
    }

    pub fn join_colors(&self, dest: &UnitigMap, src: &UnitigMap) -> bool {
        self.colors.join_colors(dest, src, &self.graph)
    }

    pub fn extract_colors(&self, um: &UnitigMap) -> UnitigColors {
        self.colors.extract_colors(um, &self.graph)
    }

    /// The `(color_id, kmer_position)` pairs of one unitig, colors in
    /// ascending order and positions ascending within each color.
    pub fn colors_of(&self, unitig_id: usize) -> impl Iterator<Item = (u64, u64)> + '_ {
        let km_count = self.graph.km_count(unitig_id);
        let um = UnitigMap::whole(unitig_id, self.graph.unitig_size(unitig_id), self.graph.k());

        self.colors
            .color_set(&um, &self.graph)
            .into_iter()
            .flat_map(move |colors| {
                colors
                    .iter()
                    .map(move |id| (id.color_id(km_count), id.kmer_position(km_count)))
            })
    }

    /// Run-compresses the bitmap-backed color sets; call once after mapping.
    pub fn optimize_colors(&mut self) {
        self.colors.optimize();
    }

    /// Writes the color annotations next to the graph as
    /// `<prefix>.bfg_colors` and returns the written path.
    pub fn write_colors(&self, prefix: impl AsRef<Path>) -> anyhow::Result<PathBuf> {
        let path = colors_file_path(prefix);
        self.colors.write_file(&path)?;
        Ok(path)
    }

    /// Replaces the color annotations with the content of
    /// `<prefix>.bfg_colors`. Fails with [`ColorsError::GraphMismatch`]
    /// when the file was written for a different unitig count.
    pub fn read_colors(&mut self, prefix: impl AsRef<Path>) -> anyhow::Result<()> {
        self.colors = ColorStorage::read_file(colors_file_path(prefix), &mut self.graph)?;
        Ok(())
    }
}

fn colors_file_path(prefix: impl AsRef<Path>) -> PathBuf {
    let mut path = prefix.as_ref().as_os_str().to_owned();
    path.push(".");
    path.push(config::COLORS_FILE_EXTENSION);
    PathBuf::from(path)
}

/// A fresh cancellation flag for [`ColorMapOptions`].
pub fn cancellation_flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}
