//! Basic block construction: replays an ISA decoder against a register
//! emulation surface, then runs the local dead-code pass.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::trace;

use crate::error::DecodeError;
use crate::expr::{Expr, VarCounts};
use crate::image::Section;
use crate::isa::{ExecSpec, FieldSrc, Isa, MemMode, MemSpace, RegId, RegKind};
use crate::op::{Op, Terminator};
use crate::util::bflmask;
use crate::var::{Value, Var, VarAlloc, VarKind};

/// Successor slot as recorded by a terminator emission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Out {
    Addr(u64),
    /// The address right after the block.
    Next,
    Unknown,
}

/// The decoding session for one block. Decoders only see this surface.
pub struct BlockBuilder<'a> {
    isa: &'a dyn Isa,
    section: &'a Section,
    alloc: &'a mut VarAlloc,
    inregs: BTreeMap<RegId, Var>,
    regs: BTreeMap<RegId, Value>,
    temps: BTreeMap<Var, Expr>,
    ops: Vec<Op>,
    term: Option<(Terminator, Vec<Out>)>,
    pos: u64,
}

impl<'a> BlockBuilder<'a> {
    fn new(isa: &'a dyn Isa, section: &'a Section, alloc: &'a mut VarAlloc, start: u64) -> Self {
        Self {
            isa,
            section,
            alloc,
            inregs: BTreeMap::new(),
            regs: BTreeMap::new(),
            temps: BTreeMap::new(),
            ops: Vec::new(),
            term: None,
            pos: start,
        }
    }

    pub fn isa(&self) -> &dyn Isa {
        self.isa
    }

    /// Little-endian code fetch.
    pub fn fetch(&self, addr: u64, len: usize) -> Result<u64, DecodeError> {
        self.section.get(addr, len)
    }

    fn check_open(&self) -> Result<(), DecodeError> {
        match self.term {
            Some(_) => Err(DecodeError::Sealed { pos: self.pos }),
            None => Ok(()),
        }
    }

    pub fn get_reg(&mut self, reg: RegId) -> Result<Expr, DecodeError> {
        self.check_open()?;
        let isa = self.isa;
        let desc = isa.reg(reg);
        match &desc.kind {
            RegKind::Plain | RegKind::Visible => {
                if let Some(v) = self.regs.get(&reg) {
                    return Ok(v.to_expr());
                }
                let mask = desc.mask;
                let alloc = &mut *self.alloc;
                let var = *self.inregs.entry(reg).or_insert_with(|| alloc.fresh(mask, VarKind::In(reg)));
                Ok(Expr::Var(var))
            }
            RegKind::Split(fields) => {
                let mut res = Expr::Const(0);
                for f in fields {
                    let part = match f.src {
                        FieldSrc::Const(v) => Expr::Const(v),
                        FieldSrc::Reg(r) => self.get_reg(r)?,
                    };
                    res = res | (part << f.start as i64);
                }
                Ok(res)
            }
            RegKind::Sub { reg: base, start, len } => {
                let v = self.get_reg(*base)?;
                Ok((v >> *start as i64) & bflmask(*len))
            }
        }
    }

    pub fn set_reg(&mut self, reg: RegId, expr: Expr) -> Result<(), DecodeError> {
        self.check_open()?;
        let isa = self.isa;
        let desc = isa.reg(reg);
        match &desc.kind {
            RegKind::Plain | RegKind::Visible => {
                let visible = desc.kind == RegKind::Visible;
                let dmask = desc.dmask;
                let val = self.make_temp(expr, dmask)?;
                let unchanged = match self.regs.get(&reg) {
                    Some(cur) => *cur == val,
                    None => self.inregs.get(&reg).map(|v| Value::Var(*v)) == Some(val),
                };
                if !unchanged {
                    if visible {
                        self.ops.push(Op::Write { reg, dmask, src: val.to_expr() });
                    }
                    self.regs.insert(reg, val);
                }
                Ok(())
            }
            RegKind::Split(fields) => {
                for f in fields {
                    if let FieldSrc::Reg(r) = f.src {
                        self.set_reg(r, (expr.clone() >> f.start as i64) & bflmask(f.len))?;
                    }
                }
                Ok(())
            }
            RegKind::Sub { reg: base, start, len } => {
                let m = bflmask(*len) << *start;
                let old = self.get_reg(*base)?;
                let res = (old & !m) | ((expr << *start as i64) & m);
                self.set_reg(*base, res)
            }
        }
    }

    /// Names `expr & mask`, reusing a constant or variable when it folds to
    /// one instead of allocating a temporary.
    pub fn make_temp(&mut self, expr: Expr, mask: i64) -> Result<Value, DecodeError> {
        self.check_open()?;
        let expr = expr & mask;
        if let Some(v) = Value::from_expr(&expr) {
            return Ok(v);
        }
        let expr = expr.fold(&self.temps) & mask;
        if let Some(v) = Value::from_expr(&expr) {
            return Ok(v);
        }
        let var = self.alloc.temp(expr.bmask());
        self.ops.push(Op::Assign { dst: var, src: expr.clone() });
        self.temps.insert(var, expr);
        Ok(Value::Var(var))
    }

    pub fn emit_exec(&mut self, spec: &Arc<ExecSpec>, ins: Vec<Expr>) -> Result<Vec<Expr>, DecodeError> {
        self.check_open()?;
        let outs: Vec<Var> = spec.omask.iter().map(|m| self.alloc.temp(*m)).collect();
        self.ops.push(Op::Exec { spec: spec.clone(), outs: outs.iter().copied().map(Some).collect(), ins });
        Ok(outs.into_iter().map(Expr::Var).collect())
    }

    pub fn emit_ld(&mut self, space: &Arc<MemSpace>, size: i32, addr: Expr) -> Result<Expr, DecodeError> {
        self.check_open()?;
        let dst = self.alloc.temp(bflmask(space.bsz * size));
        self.ops.push(Op::Load { space: space.clone(), size, dst, addr });
        Ok(Expr::Var(dst))
    }

    pub fn emit_st(&mut self, space: &Arc<MemSpace>, size: i32, addr: Expr, src: Expr) -> Result<(), DecodeError> {
        self.check_open()?;
        self.ops.push(Op::Store { space: space.clone(), size, addr, src });
        Ok(())
    }

    fn seal(&mut self, term: Terminator, outs: Vec<Out>) -> Result<(), DecodeError> {
        self.check_open()?;
        self.term = Some((term, outs));
        Ok(())
    }

    fn target(addr: &Expr) -> Out {
        match addr.as_const() {
            Some(a) => Out::Addr(a as u64),
            None => Out::Unknown,
        }
    }

    pub fn emit_jmp(&mut self, addr: Expr) -> Result<(), DecodeError> {
        let amask = self.isa.code_space().amask;
        let out = Self::target(&addr);
        self.seal(Terminator::Jump { addr, amask }, vec![out])
    }

    /// Taken edge first, fallthrough second.
    pub fn emit_bra(&mut self, pred: Expr, addr: Expr) -> Result<(), DecodeError> {
        let amask = self.isa.code_space().amask;
        let out = Self::target(&addr);
        self.seal(Terminator::Branch { pred, addr, amask }, vec![out, Out::Next])
    }

    pub fn emit_call(&mut self, addr: Expr) -> Result<(), DecodeError> {
        let amask = self.isa.code_space().amask;
        self.seal(Terminator::Call { addr, amask }, vec![Out::Next])
    }

    pub fn emit_ret(&mut self) -> Result<(), DecodeError> {
        self.seal(Terminator::Return, vec![Out::Unknown])
    }

    pub fn emit_iret(&mut self) -> Result<(), DecodeError> {
        self.seal(Terminator::InterruptReturn, vec![Out::Unknown])
    }

    pub fn emit_exit(&mut self) -> Result<(), DecodeError> {
        self.seal(Terminator::Exit, vec![Out::Unknown])
    }
}

/// A decoded straight-line run.
#[derive(Clone, Debug)]
pub struct Block {
    pub name: String,
    pub start: u64,
    pub end: u64,
    pub inregs: BTreeMap<RegId, Var>,
    pub ops: Vec<Op>,
    /// `None` when decoding stopped at the limit.
    pub term: Option<Terminator>,
    pub outs: Vec<Option<u64>>,
    pub outregs: Vec<BTreeMap<RegId, Value>>,
}

impl Block {
    /// Decodes from `start` until a terminator or `limit`, without cleaning.
    pub fn decode(
        isa: &dyn Isa,
        section: &Section,
        alloc: &mut VarAlloc,
        name: String,
        start: u64,
        limit: Option<u64>,
    ) -> Result<Block, DecodeError> {
        let mut b = BlockBuilder::new(isa, section, alloc, start);
        let mut pos = start;
        while b.term.is_none() && Some(pos) != limit {
            if let Some(limit) = limit {
                if pos > limit {
                    return Err(DecodeError::MidInstruction { limit, pos: b.pos });
                }
            }
            b.pos = pos;
            pos = isa.decode(&mut b, pos)?;
        }
        let end = pos;
        let (term, outs) = match b.term.take() {
            Some((t, outs)) => (Some(t), outs),
            None => (None, vec![limit.map_or(Out::Unknown, Out::Addr)]),
        };
        let outs: Vec<Option<u64>> = outs
            .into_iter()
            .map(|o| match o {
                Out::Addr(a) => Some(a),
                Out::Next => Some(end),
                Out::Unknown => None,
            })
            .collect();
        let outregs = vec![b.regs.clone(); outs.len()];
        trace!(block = %name, start, end, ops = b.ops.len(), "decoded block");
        Ok(Block { name, start, end, inregs: b.inregs, ops: b.ops, term, outs, outregs })
    }

    /// Decodes and cleans.
    pub fn build(
        isa: &dyn Isa,
        section: &Section,
        alloc: &mut VarAlloc,
        name: String,
        start: u64,
        limit: Option<u64>,
    ) -> Result<Block, DecodeError> {
        let mut block = Self::decode(isa, section, alloc, name, start, limit)?;
        block.clean();
        Ok(block)
    }

    /// Backward dead-code elimination, then forward folding of terminal and
    /// single-use assignments into their readers.
    pub fn clean(&mut self) {
        let mut live = VarCounts::new();
        for regs in &self.outregs {
            for v in regs.values().filter_map(|v| v.as_var()) {
                *live.entry(v).or_insert(0) += 2;
            }
        }
        if let Some(t) = &self.term {
            t.find_vars(&mut live);
        }
        let mut kept = Vec::with_capacity(self.ops.len());
        for op in self.ops.drain(..).rev() {
            let op = match op {
                Op::Assign { dst, .. } if !live.contains_key(&dst) => continue,
                Op::Load { dst, ref space, .. } if !live.contains_key(&dst) && space.mode != MemMode::Io => continue,
                Op::Exec { spec, outs, ins } => Op::Exec {
                    spec,
                    outs: outs.into_iter().map(|o| o.filter(|v| live.contains_key(v))).collect(),
                    ins,
                },
                op => op,
            };
            op.find_vars(&mut live);
            kept.push(op);
        }
        kept.reverse();
        self.inregs.retain(|_, v| live.contains_key(v));

        let mut subst: BTreeMap<Var, Expr> = BTreeMap::new();
        let mut ops = Vec::with_capacity(kept.len());
        for op in kept {
            let op = op.fold(&subst);
            if let Op::Assign { dst, src } = &op {
                if src.is_terminal() || live.get(dst) == Some(&1) {
                    subst.insert(*dst, src.clone());
                    continue;
                }
            }
            ops.push(op);
        }
        self.ops = ops;
        self.term = self.term.as_ref().map(|t| t.fold(&subst));
        for regs in &mut self.outregs {
            for val in regs.values_mut() {
                if let Some(rep) = val.as_var().and_then(|v| subst.get(&v)).and_then(Value::from_expr) {
                    *val = rep;
                }
            }
        }
    }
}
