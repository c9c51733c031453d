use std::collections::{BTreeMap, VecDeque};

use tracing::debug;

use super::{BlockId, Pass, ENTRY};
use crate::expr::Expr;
use crate::isa::RegId;
use crate::op::Op;
use crate::util::lowmask;
use crate::var::{Value, Var};

/// `var + off` under `mask`, counting a bare variable as offset zero.
fn offset_of(e: &Expr) -> Option<(Var, i64, i64)> {
    match e {
        Expr::Var(v) => Some((*v, 0, -1)),
        e => e.as_offset(),
    }
}

impl Pass<'_> {
    /// Tracks every value derived from the entry stack pointer by a constant
    /// offset and rewrites it in terms of the entry value. Offsets that
    /// differ between paths are poisoned for good.
    pub(super) fn find_sp(&mut self) {
        let Some(sp) = self.isa.stack_ptr() else { return };
        let spmask = self.isa.reg(sp).mask;
        let offmask = lowmask(spmask);
        let Some(entry) = self.blocks.get(&ENTRY) else { return };
        let Some(Value::Var(osp)) = entry.outregs[0].get(&sp).copied() else { return };
        let Some(first) = entry.outs[0] else { return };

        let mut offsets: BTreeMap<Var, Option<i64>> = BTreeMap::from([(osp, Some(0))]);
        let mut queue: VecDeque<(BlockId, RegId, Option<i64>)> = VecDeque::from([(first, sp, Some(0))]);
        while let Some((id, reg, off)) = queue.pop_front() {
            let Some(b) = self.blocks.get(&id) else { continue };
            let Some(var) = b.inregs.get(&reg).copied() else { continue };
            let off = match offsets.get(&var) {
                None => off,
                Some(None) => continue,
                Some(prev) if *prev == off => continue,
                Some(_) => None,
            };
            offsets.insert(var, off);

            let mut newoff = BTreeMap::from([(var, off)]);
            for op in &b.ops {
                let Op::Assign { dst, src } = op else { continue };
                let Some((v, k, amask)) = offset_of(src) else { continue };
                if amask | spmask != amask {
                    continue;
                }
                if let Some(base) = newoff.get(&v).copied() {
                    newoff.insert(*dst, base.map(|o| o.wrapping_add(k) & offmask));
                }
            }
            for (dst, off) in &newoff {
                if dst != &var {
                    offsets.insert(*dst, *off);
                }
            }
            for (out, regs) in b.outs.iter().zip(&b.outregs) {
                let Some(t) = out else { continue };
                for (r, val) in regs {
                    if let Some(off) = val.as_var().and_then(|v| newoff.get(&v)) {
                        queue.push_back((*t, *r, *off));
                    }
                }
            }
        }

        let known: BTreeMap<Var, i64> = offsets.iter().filter_map(|(v, o)| o.map(|o| (*v, o))).collect();
        let canon = |off: i64| -> Expr {
            if off == 0 {
                Expr::Var(osp)
            } else {
                Expr::add(&Expr::Var(osp), &Expr::Const(off)).mask(spmask)
            }
        };
        for b in self.blocks.values_mut().filter(|b| !b.is_entry) {
            let mut subst: BTreeMap<Var, Expr> = BTreeMap::new();
            for var in b.inregs.values() {
                if let Some(off) = known.get(var) {
                    subst.insert(*var, canon(*off));
                }
            }
            let mut ops = Vec::with_capacity(b.ops.len());
            let mut moved = BTreeMap::new();
            for op in &b.ops {
                match op {
                    Op::Assign { dst, .. } if known.get(dst) == Some(&0) => {
                        subst.insert(*dst, Expr::Var(osp));
                        moved.insert(*dst, Value::Var(osp));
                    }
                    Op::Assign { dst, .. } if known.contains_key(dst) => {
                        ops.push(Op::Assign { dst: *dst, src: canon(known[dst]) });
                    }
                    op => ops.push(op.fold(&subst)),
                }
            }
            b.ops = ops;
            b.term = b.term.fold(&subst);
            for regs in &mut b.outregs {
                for val in regs.values_mut() {
                    if let Some(rep) = val.as_var().and_then(|v| moved.get(&v)) {
                        *val = *rep;
                    }
                }
            }
            b.refresh_defs();
        }
        debug!(func = %self.name, tracked = offsets.len(), known = known.len(), "stack offsets");
        self.sp_offsets = offsets;
    }
}
