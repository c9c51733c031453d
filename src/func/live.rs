use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use super::{BlockId, Def, Pass, ENTRY};
use crate::expr::LiveMasks;
use crate::isa::RegId;
use crate::op::{Op, Terminator};
use crate::var::{Value, Var};

/// Pending liveness facts.
enum Live {
    /// Bits of a variable as seen in a block.
    Var(BlockId, Var, i64),
    /// Bits of a register leaving a block along one edge.
    Out(BlockId, usize, RegId, i64),
}

impl Pass<'_> {
    /// Backward liveness to a fixpoint, then drops dead inputs, dead
    /// assignments and edge values nobody reads.
    pub(super) fn findlive(&mut self) {
        for b in self.blocks.values_mut() {
            b.livevars.clear();
        }
        let wanted = self.world.func(self.id).wanted.clone();
        let mut work = Vec::new();
        for (id, b) in &self.blocks {
            if b.term.is_return() {
                work.extend(wanted.iter().map(|(reg, mask)| Live::Out(*id, 0, *reg, *mask)));
            }
            let mut live = LiveMasks::new();
            for op in b.ops.iter().filter(|op| !matches!(op, Op::Assign { .. })) {
                op.find_live_masks(&mut live);
            }
            b.term.find_live_masks(&mut live);
            work.extend(live.into_iter().map(|(v, m)| Live::Var(*id, v, m)));
        }

        while let Some(item) = work.pop() {
            match item {
                Live::Var(id, var, mask) => {
                    let mask = mask & var.mask;
                    let Some(b) = self.blocks.get_mut(&id) else { continue };
                    let cur = b.livevars.get(&var).copied().unwrap_or(0);
                    if cur | mask == cur {
                        continue;
                    }
                    b.livevars.insert(var, cur | mask);
                    match b.def_of(var) {
                        Def::Assign(src) => {
                            let mut live = LiveMasks::new();
                            src.find_live_masks(&mut live, mask);
                            work.extend(live.into_iter().map(|(v, m)| Live::Var(id, v, m)));
                        }
                        Def::Reg(reg) if !b.is_entry => {
                            work.extend(b.ins.iter().map(|(p, idx)| Live::Out(*p, *idx, reg, mask)));
                        }
                        Def::Parm(_) => work.push(Live::Var(ENTRY, var, mask)),
                        _ => {}
                    }
                }
                Live::Out(id, idx, reg, mask) => {
                    let mask = mask & self.isa.reg(reg).mask;
                    if mask == 0 {
                        continue;
                    }
                    if let Some(Terminator::RetCall { callee, .. }) = self.blocks.get(&id).map(|b| &b.term) {
                        let callee = *callee;
                        self.world.want_reg(callee, reg, mask);
                    }
                    if let Some(Value::Var(v)) = self.get_out(id, idx, reg) {
                        work.push(Live::Var(id, v, mask));
                    }
                }
            }
        }
        self.prune_dead(&wanted);
    }

    fn prune_dead(&mut self, wanted: &BTreeMap<RegId, i64>) {
        for b in self.blocks.values_mut() {
            let live = &b.livevars;
            b.inregs.retain(|_, v| live.contains_key(v));
            b.ops.retain(|op| match op {
                Op::Assign { dst, .. } => live.contains_key(dst),
                _ => true,
            });
        }
        let wanted_in: BTreeMap<BlockId, BTreeSet<RegId>> =
            self.blocks.iter().map(|(id, b)| (*id, b.inregs.keys().copied().collect())).collect();
        for b in self.blocks.values_mut() {
            let is_return = b.term.is_return();
            for (out, regs) in b.outs.iter().zip(b.outregs.iter_mut()) {
                match out {
                    Some(t) => {
                        let keep = wanted_in.get(t);
                        regs.retain(|r, _| keep.is_some_and(|k| k.contains(r)));
                    }
                    None if is_return => regs.retain(|r, _| wanted.contains_key(r)),
                    None => regs.clear(),
                }
            }
            b.refresh_defs();
            trace!(block = %b.name, live = b.livevars.len(), ins = b.inregs.len(), "liveness");
        }
    }
}
