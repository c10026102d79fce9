use thiserror::Error;

use crate::{Address, BlockId};

/// Every way a simulator operation can fail.
///
/// All variants are recoverable by the caller. Construction errors
/// (`InvalidConfig`) only come out of constructors; everything else
/// propagates out of the operation that hit it and leaves the subsystem
/// usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("address {addr:#x} is out of bounds (memory size is {total} bytes)")]
    OutOfBounds { addr: Address, total: usize },

    #[error("invalid virtual address {addr:#x}: page {vpage} is outside the virtual address space")]
    InvalidAddress { addr: Address, vpage: usize },

    #[error("cannot allocate zero bytes")]
    ZeroSize,

    #[error("out of memory: no free block can serve {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("unknown block id {0}")]
    UnknownBlock(BlockId),

    #[error("no allocated block starts at address {0:#x}")]
    UnknownAddress(Address),
}

pub type Result<T> = core::result::Result<T, MemoryError>;
