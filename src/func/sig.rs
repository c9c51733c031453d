use std::collections::BTreeSet;

use tracing::debug;

use super::{Pass, ENTRY};
use crate::expr::LiveMasks;
use crate::isa::RegId;
use crate::var::{Value, VarKind};

impl Pass<'_> {
    /// Splits wanted registers into real returns and registers handed back
    /// untouched, then widens the argument masks with every parameter that
    /// is still read.
    pub(super) fn clean_preserved(&mut self) {
        let wanted = self.world.func(self.id).wanted.clone();
        let mut rets: BTreeSet<RegId> = BTreeSet::new();
        for b in self.blocks.values().filter(|b| b.term.is_return()) {
            for reg in wanted.keys() {
                match b.outregs[0].get(reg) {
                    Some(Value::Var(v)) if v.kind == VarKind::Parm(*reg) => {}
                    None => {}
                    Some(_) => {
                        rets.insert(*reg);
                    }
                }
            }
        }
        for b in self.blocks.values_mut().filter(|b| b.term.is_return()) {
            b.outregs[0].retain(|r, _| !wanted.contains_key(r) || rets.contains(r));
        }

        let mut used = LiveMasks::new();
        for b in self.blocks.values().filter(|b| !b.is_entry) {
            for op in &b.ops {
                op.find_live_masks(&mut used);
            }
            b.term.find_live_masks(&mut used);
            for v in b.outregs.iter().flat_map(|r| r.values()).filter_map(|v| v.as_var()) {
                *used.entry(v).or_insert(0) |= v.mask;
            }
        }

        let entry_live = self.blocks.get(&ENTRY).map(|b| b.livevars.clone()).unwrap_or_default();
        let f = self.world.func_mut(self.id);
        for (var, mask) in entry_live {
            let VarKind::Parm(reg) = var.kind else { continue };
            if used.contains_key(&var) {
                *f.sig.args.entry(reg).or_insert(0) |= mask;
            }
        }
        if let Some(known) = f.sig.rets.as_mut() {
            known.extend(rets);
        }
        debug!(func = %f.name, sig = ?f.sig, "signature");
    }
}
