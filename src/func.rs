//! Whole-function decompilation: block discovery, call binding, dataflow
//! and structuring, rerun from scratch on every pass.

mod forward;
mod live;
mod render;
mod sig;
mod stack;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::block::Block;
use crate::error::{ConnectError, DecoError, DecodeError};
use crate::expr::{Expr, LiveMasks};
use crate::image::Section;
use crate::isa::{Isa, RegId};
use crate::op::{CallArg, Op, Terminator};
use crate::structurizer::{self, FlowGraph, Seq};
use crate::var::{Value, Var, VarAlloc, VarKind};
use crate::world::{DomainId, FuncId, World};

/// Inferred argument masks and return registers. Both only grow.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Signature {
    pub args: BTreeMap<RegId, i64>,
    /// `None` until a return path is seen.
    pub rets: Option<BTreeSet<RegId>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// The pseudo-block that hands parameters to the first real block.
pub const ENTRY: BlockId = BlockId(0);

/// Where a variable visible in a block comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Def {
    /// Block input for this register.
    Reg(RegId),
    /// Function parameter, owned by the entry block.
    Parm(RegId),
    Assign(Expr),
    /// Load, exec or call result.
    Op,
    None,
}

#[derive(Clone, Debug)]
pub struct FunBlock {
    pub name: String,
    pub start: u64,
    pub end: u64,
    pub is_entry: bool,
    pub inregs: BTreeMap<RegId, Var>,
    pub ops: Vec<Op>,
    pub term: Terminator,
    /// Successor addresses as decoded.
    pub targets: Vec<Option<u64>>,
    /// Successor blocks once connected.
    pub outs: Vec<Option<BlockId>>,
    pub outregs: Vec<BTreeMap<RegId, Value>>,
    pub ins: BTreeSet<(BlockId, usize)>,
    pub localdefs: BTreeMap<Var, Def>,
    pub livevars: LiveMasks,
}

impl FunBlock {
    fn from_block(block: Block, amask: i64) -> Self {
        let term = block.term.unwrap_or(Terminator::Jump { addr: Expr::Const(block.end as i64), amask });
        let mut fb = FunBlock {
            name: block.name,
            start: block.start,
            end: block.end,
            is_entry: false,
            inregs: block.inregs,
            ops: block.ops,
            term,
            outs: vec![None; block.outs.len()],
            targets: block.outs,
            outregs: block.outregs,
            ins: BTreeSet::new(),
            localdefs: BTreeMap::new(),
            livevars: LiveMasks::new(),
        };
        fb.refresh_defs();
        fb
    }

    fn entry(name: String, start: u64, first: BlockId) -> Self {
        FunBlock {
            name,
            start,
            end: start,
            is_entry: true,
            inregs: BTreeMap::new(),
            ops: Vec::new(),
            term: Terminator::Jump { addr: Expr::Const(start as i64), amask: -1 },
            targets: vec![Some(start)],
            outs: vec![Some(first)],
            outregs: vec![BTreeMap::new()],
            ins: BTreeSet::new(),
            localdefs: BTreeMap::new(),
            livevars: LiveMasks::new(),
        }
    }

    /// Rebuilds the definition map after the op list changed.
    pub fn refresh_defs(&mut self) {
        self.localdefs.clear();
        if self.is_entry {
            for val in self.outregs.iter().flat_map(|r| r.values()) {
                if let Value::Var(v) = val {
                    if let VarKind::Parm(r) = v.kind {
                        self.localdefs.insert(*v, Def::Reg(r));
                    }
                }
            }
            return;
        }
        for (reg, var) in &self.inregs {
            self.localdefs.insert(*var, Def::Reg(*reg));
        }
        for op in &self.ops {
            match op {
                Op::Assign { dst, src } => {
                    self.localdefs.insert(*dst, Def::Assign(src.clone()));
                }
                op => {
                    for v in op.defs() {
                        self.localdefs.insert(v, Def::Op);
                    }
                }
            }
        }
        for v in self.term.defs() {
            self.localdefs.insert(v, Def::Op);
        }
    }

    pub fn def_of(&self, var: Var) -> Def {
        match self.localdefs.get(&var) {
            Some(d) => d.clone(),
            None => match var.kind {
                VarKind::Parm(r) => Def::Parm(r),
                _ => Def::None,
            },
        }
    }

    pub fn get_in(&mut self, alloc: &mut VarAlloc, isa: &dyn Isa, reg: RegId) -> Var {
        if let Some(v) = self.inregs.get(&reg) {
            return *v;
        }
        let kind = if self.is_entry { VarKind::Parm(reg) } else { VarKind::In(reg) };
        let var = alloc.fresh(isa.reg(reg).mask, kind);
        self.localdefs.insert(var, Def::Reg(reg));
        if !self.is_entry {
            self.inregs.insert(reg, var);
        }
        var
    }

    /// The value `reg` holds on edge `idx`, passing the block input through
    /// when the block leaves it alone.
    pub fn get_out(&mut self, alloc: &mut VarAlloc, isa: &dyn Isa, idx: usize, reg: RegId) -> Value {
        if let Some(v) = self.outregs.get(idx).and_then(|r| r.get(&reg)) {
            return *v;
        }
        let val = Value::Var(self.get_in(alloc, isa, reg));
        if let Some(regs) = self.outregs.get_mut(idx) {
            regs.insert(reg, val);
        }
        val
    }

    /// Replaces variables by values in every read and in the edge maps.
    /// Returns the registers whose block input got replaced; predecessors
    /// must stop providing them.
    pub fn subst_values(&mut self, subst: &BTreeMap<Var, Value>) -> Vec<RegId> {
        let exprs: BTreeMap<Var, Expr> = subst.iter().map(|(k, v)| (*k, v.to_expr())).collect();
        self.ops = self.ops.iter().map(|op| op.fold(&exprs)).collect();
        self.term = self.term.fold(&exprs);
        for regs in &mut self.outregs {
            for val in regs.values_mut() {
                if let Some(rep) = val.as_var().and_then(|v| subst.get(&v)) {
                    *val = *rep;
                }
            }
        }
        let gone: Vec<RegId> = self
            .inregs
            .iter()
            .filter(|(_, v)| subst.contains_key(v))
            .map(|(r, _)| *r)
            .collect();
        for r in &gone {
            self.inregs.remove(r);
        }
        for (var, rep) in subst {
            if let Some(mask) = self.livevars.remove(var) {
                if let Value::Var(nv) = rep {
                    *self.livevars.entry(*nv).or_insert(0) |= mask;
                }
            }
        }
        self.refresh_defs();
        gone
    }
}

/// What the last pass left behind.
#[derive(Clone, Debug)]
pub struct FuncBody {
    pub blocks: BTreeMap<BlockId, FunBlock>,
    pub connected: bool,
    pub structure: Option<Seq<BlockId>>,
    /// Goto targets in the structure.
    pub labels: BTreeSet<BlockId>,
    /// Offsets from the entry stack pointer; `None` where paths disagree.
    pub sp_offsets: BTreeMap<Var, Option<i64>>,
}

impl FuncBody {
    pub fn block_at(&self, addr: u64) -> Option<&FunBlock> {
        self.blocks.values().find(|b| !b.is_entry && b.start == addr)
    }
}

pub struct Function {
    pub name: String,
    pub domain: DomainId,
    pub section: Arc<Section>,
    pub start: u64,
    pub dirty: bool,
    pub inproc: bool,
    pub processed: bool,
    /// Set once the pass cap was hit.
    pub stalled: bool,
    pub passes: u32,
    /// Functions to re-dirty when the signature changes.
    pub deps: BTreeSet<FuncId>,
    pub wanted: BTreeMap<RegId, i64>,
    /// Call targets proven constant, by call block end address.
    pub callees: BTreeMap<u64, u64>,
    pub sig: Signature,
    pub prevsig: Option<Signature>,
    pub error: Option<DecoError>,
    pub body: Option<FuncBody>,
}

impl Function {
    pub fn new(name: String, domain: DomainId, section: Arc<Section>, start: u64) -> Self {
        Self {
            name,
            domain,
            section,
            start,
            dirty: false,
            inproc: false,
            processed: false,
            stalled: false,
            passes: 0,
            deps: BTreeSet::new(),
            wanted: BTreeMap::new(),
            callees: BTreeMap::new(),
            sig: Signature::default(),
            prevsig: None,
            error: None,
            body: None,
        }
    }

    pub fn structure(&self) -> Option<&Seq<BlockId>> {
        self.body.as_ref()?.structure.as_ref()
    }
}

/// Working state of one pass over one function.
struct Pass<'w> {
    world: &'w mut World,
    id: FuncId,
    domain: DomainId,
    isa: Arc<dyn Isa>,
    section: Arc<Section>,
    name: String,
    start: u64,
    alloc: VarAlloc,
    blocks: BTreeMap<BlockId, FunBlock>,
    by_addr: BTreeMap<u64, BlockId>,
    connected: bool,
    labels: BTreeSet<BlockId>,
    sp_offsets: BTreeMap<Var, Option<i64>>,
}

/// Runs the full pipeline for `id`. Failures are recorded on the function.
pub(crate) fn process(world: &mut World, id: FuncId) {
    let f = world.func_mut(id);
    f.error = None;
    f.body = None;
    let (domain, section, name, start) = (f.domain, f.section.clone(), f.name.clone(), f.start);
    let isa = world.domain(domain).isa.clone();
    debug!(func = %name, "processing");
    let mut pass = Pass {
        world,
        id,
        domain,
        isa,
        section,
        name,
        start,
        alloc: VarAlloc::new(),
        blocks: BTreeMap::new(),
        by_addr: BTreeMap::new(),
        connected: false,
        labels: BTreeSet::new(),
        sp_offsets: BTreeMap::new(),
    };
    if let Err(err) = pass.find_blocks() {
        warn!(func = %pass.name, %err, "decode failed");
        pass.world.func_mut(id).error = Some(err.into());
        return;
    }
    let res = pass.analyze();
    let Pass { world, blocks, connected, labels, sp_offsets, name, .. } = pass;
    let f = world.func_mut(id);
    let structure = match res {
        Ok(s) => Some(s),
        Err(err) => {
            warn!(func = %name, %err, "connect failed");
            f.error = Some(err.into());
            None
        }
    };
    f.body = Some(FuncBody { blocks, connected, structure, labels, sp_offsets });
    f.processed = true;
}

impl Pass<'_> {
    fn analyze(&mut self) -> Result<Seq<BlockId>, ConnectError> {
        self.connect()?;
        self.findlive();
        self.find_sp();
        self.findlive();
        self.glue_blocks();
        self.forward_ins();
        self.find_const_calls();
        self.clean_preserved();
        self.world.update_sig(self.id);
        self.structure()
    }

    fn decode_block(&mut self, addr: u64, limit: Option<u64>) -> Result<FunBlock, DecodeError> {
        let isa = self.isa.clone();
        let name = format!("{}_{:x}", self.name, addr);
        let block = Block::build(&*isa, &self.section, &mut self.alloc, name, addr, limit)?;
        let mut fb = FunBlock::from_block(block, isa.code_space().amask);
        self.process_calls(&mut fb);
        Ok(fb)
    }

    /// Discovers every block start, then rebuilds each block bounded by the
    /// next start.
    fn find_blocks(&mut self) -> Result<(), DecodeError> {
        let mut seen = BTreeSet::from([self.start]);
        let mut queue = vec![self.start];
        while let Some(addr) = queue.pop() {
            let fb = self.decode_block(addr, None)?;
            for t in fb.targets.iter().flatten() {
                if seen.insert(*t) {
                    queue.push(*t);
                }
            }
        }
        let starts: Vec<u64> = seen.into_iter().collect();
        self.alloc = VarAlloc::new();
        for (i, addr) in starts.iter().enumerate() {
            let fb = self.decode_block(*addr, starts.get(i + 1).copied())?;
            let id = BlockId(i as u32 + 1);
            self.by_addr.insert(*addr, id);
            self.blocks.insert(id, fb);
        }
        debug!(func = %self.name, blocks = self.blocks.len(), "blocks found");
        Ok(())
    }

    /// Binds a call with a known target to its function, forcing the callee
    /// through a pass first so its signature is current.
    fn process_calls(&mut self, fb: &mut FunBlock) {
        let Terminator::Call { addr, amask } = &fb.term else { return };
        let (addr, amask) = (addr.clone(), *amask);
        let target = match addr.as_const() {
            Some(a) => Some(a as u64),
            None => self.world.func(self.id).callees.get(&fb.end).copied(),
        };
        let Some(callee) = target.and_then(|t| self.world.find_function(self.domain, t)) else {
            fb.targets[0] = None;
            return;
        };
        if !self.world.func(callee).processed {
            self.world.try_process(callee);
        }
        self.world.func_mut(callee).deps.insert(self.id);
        let sig = self.world.func(callee).sig.clone();
        let isa = self.isa.clone();
        let args: BTreeMap<RegId, CallArg> = sig
            .args
            .iter()
            .map(|(reg, mask)| {
                let value = fb.get_out(&mut self.alloc, &*isa, 0, *reg).to_expr();
                (*reg, CallArg { value, mask: *mask })
            })
            .collect();
        fb.term = match sig.rets {
            None => {
                fb.targets[0] = None;
                Terminator::NoretCall { addr, amask, callee, args }
            }
            Some(regs) => {
                let mut rets = BTreeMap::new();
                for reg in regs {
                    let var = self.alloc.temp(isa.reg(reg).mask);
                    fb.outregs[0].insert(reg, Value::Var(var));
                    rets.insert(reg, var);
                }
                Terminator::RetCall { addr, amask, callee, args, rets }
            }
        };
        fb.refresh_defs();
    }

    fn connect(&mut self) -> Result<(), ConnectError> {
        let first = *self.by_addr.get(&self.start).ok_or(ConnectError::MissingEntry(self.start))?;
        let mut eb = FunBlock::entry(format!("{}_entry", self.name), self.start, first);
        let isa = self.isa.clone();
        let entry_regs: Vec<RegId> = self.blocks.get(&first).map(|b| b.inregs.keys().copied().collect()).unwrap_or_default();
        for reg in entry_regs {
            eb.get_out(&mut self.alloc, &*isa, 0, reg);
        }
        self.blocks.insert(ENTRY, eb);

        let mut edges = Vec::new();
        for (id, b) in &mut self.blocks {
            if b.is_entry {
                edges.push((*id, 0, first));
                continue;
            }
            for (idx, target) in b.targets.iter().enumerate() {
                if let Some(addr) = target {
                    let to = *self.by_addr.get(addr).ok_or(ConnectError::DanglingEdge { from: b.start, to: *addr })?;
                    b.outs[idx] = Some(to);
                    edges.push((*id, idx, to));
                }
            }
        }
        for (from, idx, to) in edges {
            if let Some(t) = self.blocks.get_mut(&to) {
                t.ins.insert((from, idx));
            }
        }
        if self.blocks.values().any(|b| b.term.is_return()) {
            self.world.func_mut(self.id).sig.rets.get_or_insert_with(BTreeSet::new);
        }
        self.connected = true;
        Ok(())
    }

    /// Edge value lookup that materializes pass-through inputs.
    fn get_out(&mut self, id: BlockId, idx: usize, reg: RegId) -> Option<Value> {
        let isa = self.isa.clone();
        let b = self.blocks.get_mut(&id)?;
        Some(b.get_out(&mut self.alloc, &*isa, idx, reg))
    }

    /// Splices out blocks that do nothing but jump, composing their edge
    /// maps onto each predecessor edge.
    fn glue_blocks(&mut self) {
        let ids: Vec<BlockId> = self.blocks.keys().copied().collect();
        for id in ids {
            let Some(b) = self.blocks.get(&id) else { continue };
            let Some(Some(next)) = b.outs.first().copied().map(|o| o.filter(|n| *n != id)) else { continue };
            if b.is_entry || !b.ops.is_empty() || !matches!(b.term, Terminator::Jump { .. }) {
                continue;
            }
            let Some(b) = self.blocks.remove(&id) else { continue };
            for (pred, idx) in &b.ins {
                let mut outregs = BTreeMap::new();
                for (reg, val) in &b.outregs[0] {
                    let composed = match val.as_var().map(|v| b.def_of(v)) {
                        Some(Def::Reg(ireg)) => self.get_out(*pred, *idx, ireg),
                        _ => Some(*val),
                    };
                    if let Some(v) = composed {
                        outregs.insert(*reg, v);
                    }
                }
                if let Some(p) = self.blocks.get_mut(pred) {
                    p.outs[*idx] = Some(next);
                    p.outregs[*idx] = outregs;
                }
                if let Some(n) = self.blocks.get_mut(&next) {
                    n.ins.insert((*pred, *idx));
                }
            }
            if let Some(n) = self.blocks.get_mut(&next) {
                n.ins.remove(&(id, 0));
            }
            debug!(block = %b.name, "glued");
        }
    }

    /// Records call sites whose target became constant, for the next pass.
    fn find_const_calls(&mut self) {
        let found: Vec<(u64, u64)> = self
            .blocks
            .values()
            .filter_map(|b| match &b.term {
                Terminator::Call { addr, .. } => addr.as_const().map(|a| (b.end, a as u64)),
                _ => None,
            })
            .collect();
        for (end, addr) in found {
            let f = self.world.func_mut(self.id);
            if let std::collections::btree_map::Entry::Vacant(e) = f.callees.entry(end) {
                e.insert(addr);
                debug!(func = %f.name, site = end, target = addr, "constant call target");
                self.world.mark_dirty(self.id);
            }
        }
    }

    fn structure(&mut self) -> Result<Seq<BlockId>, ConnectError> {
        let s = structurizer::structure(&Graph(&self.blocks));
        let missing: Vec<String> = s
            .reachable
            .difference(&s.used)
            .filter_map(|id| self.blocks.get(id).map(|b| b.name.clone()))
            .collect();
        if !missing.is_empty() {
            return Err(ConnectError::Unstructured { blocks: missing });
        }
        self.labels = s.labels;
        Ok(s.body)
    }
}

/// The connected block graph as the structurizer sees it.
pub struct Graph<'a>(pub &'a BTreeMap<BlockId, FunBlock>);

impl FlowGraph for Graph<'_> {
    type Node = BlockId;

    fn entry(&self) -> BlockId {
        ENTRY
    }

    fn succs(&self, node: BlockId) -> Vec<Option<BlockId>> {
        self.0.get(&node).map(|b| b.outs.clone()).unwrap_or_default()
    }
}
