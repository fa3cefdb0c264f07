pub mod builder;
pub mod storage;
pub mod unitig_colors;

pub use builder::{map_colors, ColorMapOptions};
pub use storage::ColorStorage;
pub use unitig_colors::{ColorKmerId, UnitigColors};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ColorsError {
    #[error("invalid color k-mer id")]
    InvalidColorKmerId,

    #[error("color storage input ended prematurely")]
    IoTruncated,

    #[error("unrecognized color storage layout")]
    IoVersionMismatch,

    #[error("i/o error: {0}")]
    Io(std::io::Error),

    #[error("cannot allocate the color slot array")]
    AllocationFailed,

    #[error("color storage was built for {file} unitigs but the loaded graph has {graph}")]
    GraphMismatch { file: usize, graph: usize },

    #[error("head k-mer already present in the overflow table")]
    OverflowInsertFailed,
}

impl ColorsError {
    pub(crate) fn io(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::IoTruncated
        } else {
            Self::Io(err)
        }
    }
}
