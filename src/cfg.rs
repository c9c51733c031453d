//! petgraph views of a decompiled function's blocks and of the call graph,
//! with DOT output for both.

use std::collections::HashMap;
use std::fmt::Write;

use petgraph::graph::{Graph, NodeIndex};

use crate::func::{BlockId, FuncBody};
use crate::op::Terminator;
use crate::world::{FuncId, World};

#[derive(Debug)]
pub struct BlockNode {
    pub id: BlockId,
    pub name: String,
    pub start: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    FallThrough,
    CondBranch,
    UncondBranch,
    /// Resumption after a call.
    CallReturn,
}

pub type ControlFlowGraph = Graph<BlockNode, EdgeKind>;
pub type CallGraph = Graph<FuncId, ()>;

pub fn build_cfg(body: &FuncBody) -> ControlFlowGraph {
    let mut g = ControlFlowGraph::new();
    let mut nodes = HashMap::<BlockId, NodeIndex>::new();
    for (id, b) in &body.blocks {
        let idx = g.add_node(BlockNode { id: *id, name: b.name.clone(), start: b.start });
        nodes.insert(*id, idx);
    }
    for (id, b) in &body.blocks {
        for (slot, out) in b.outs.iter().enumerate() {
            let (Some(from), Some(to)) = (nodes.get(id), out.and_then(|t| nodes.get(&t))) else { continue };
            let kind = match (&b.term, slot) {
                (Terminator::Branch { .. }, 0) => EdgeKind::CondBranch,
                (Terminator::Branch { .. }, _) => EdgeKind::FallThrough,
                (Terminator::RetCall { .. } | Terminator::Call { .. }, _) => EdgeKind::CallReturn,
                (Terminator::Jump { addr, .. }, _) if addr.as_const() != Some(b.end as i64) => EdgeKind::UncondBranch,
                _ => EdgeKind::FallThrough,
            };
            g.update_edge(*from, *to, kind);
        }
    }
    g
}

/// Caller to callee edges, as recorded by call binding.
pub fn build_call_graph(world: &World) -> CallGraph {
    let mut g = CallGraph::new();
    let nodes: Vec<NodeIndex> = (0..world.funcs.len()).map(|i| g.add_node(FuncId(i as u32))).collect();
    for (callee, f) in world.funcs.iter().enumerate() {
        for caller in &f.deps {
            g.update_edge(nodes[caller.index()], nodes[callee], ());
        }
    }
    g
}

pub fn graph_to_dot(cfg: &ControlFlowGraph) -> String {
    let mut s = String::from("digraph CFG {\n");
    for idx in cfg.node_indices() {
        let bb = &cfg[idx];
        let _ = writeln!(s, "  {} [label=\"{}\\n0x{:04x}\"];", bb.id.0, bb.name, bb.start);
    }
    for e in cfg.edge_indices() {
        if let Some((from, to)) = cfg.edge_endpoints(e) {
            let style = match cfg[e] {
                EdgeKind::CondBranch => " [color=green]",
                EdgeKind::CallReturn => " [style=dashed]",
                EdgeKind::FallThrough | EdgeKind::UncondBranch => "",
            };
            let _ = writeln!(s, "  {} -> {}{};", cfg[from].id.0, cfg[to].id.0, style);
        }
    }
    s.push('}');
    s
}

pub fn call_graph_to_dot(world: &World, g: &CallGraph) -> String {
    let mut s = String::from("digraph calls {\n");
    for idx in g.node_indices() {
        let f = world.func(g[idx]);
        let _ = writeln!(s, "  {} [label=\"{}\\n0x{:04x}\"];", g[idx].0, f.name, f.start);
    }
    for e in g.edge_indices() {
        if let Some((from, to)) = g.edge_endpoints(e) {
            let _ = writeln!(s, "  {} -> {};", g[from].0, g[to].0);
        }
    }
    s.push('}');
    s
}
