//! Error kinds raised while decompiling a single function, plus the one
//! engine-level failure.

use thiserror::Error;

/// Malformed or unrecognized code while building a block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown opcode at {pos:#x}: {desc}")]
    Opcode { pos: u64, desc: String },
    #[error("block limit {limit:#x} in the middle of instruction at {pos:#x}")]
    MidInstruction { limit: u64, pos: u64 },
    #[error("address {addr:#x} is outside the code image")]
    OutOfImage { addr: u64 },
    #[error("unknown register {0}")]
    UnknownRegister(String),
    #[error("effect emitted after the block terminator at {pos:#x}")]
    Sealed { pos: u64 },
}

/// Inconsistent successor graph or an unstructurable function.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("entry block {0:#x} was not discovered")]
    MissingEntry(u64),
    #[error("edge from block {from:#x} to {to:#x} does not start a block")]
    DanglingEdge { from: u64, to: u64 },
    #[error("structuring left blocks unvisited: {blocks:?}")]
    Unstructured { blocks: Vec<String> },
}

/// Per-function failure kept for display.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecoError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorldError {
    #[error("function {func} did not converge after {passes} passes")]
    NonConvergent { func: String, passes: u32 },
}
