pub mod sequences_reader;

pub use sequences_reader::{FastaSequence, SequencesReader};
