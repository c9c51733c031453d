//! Retargetable decompiler engine: symbolic expressions, block IR, whole
//! function dataflow and control-flow structuring, driven to a fixpoint
//! across the call graph.

pub mod block;
pub mod cfg;
pub mod display;
pub mod error;
pub mod expr;
pub mod func;
pub mod image;
pub mod isa;
pub mod op;
pub mod parser;
pub mod structurizer;
pub mod util;
pub mod var;
pub mod world;

#[cfg(test)]
mod test;

pub use block::{Block, BlockBuilder};
pub use cfg::{build_call_graph, build_cfg, call_graph_to_dot, graph_to_dot, CallGraph, ControlFlowGraph, EdgeKind};
pub use display::{DefaultDisplay, DisplayCtx, IsaDisplay};
pub use error::{ConnectError, DecoError, DecodeError, WorldError};
pub use expr::{CmpOp, Expr};
pub use func::{BlockId, FuncBody, Function, Signature, ENTRY};
pub use image::Section;
pub use isa::{Isa, RegId};
pub use op::{Op, Terminator};
pub use structurizer::{FlowGraph, Seq, Stmt};
pub use var::{Value, Var, VarKind};
pub use world::{DomainId, FuncId, World, WorldConfig};
