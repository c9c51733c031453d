use std::collections::BTreeSet;
use std::sync::Arc;

use super::{fmt_const, Expr};
use crate::display::DisplayCtx;

/// Bitwise XOR of a constant and a set of terms.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BigXor {
    pub konst: i64,
    pub exprs: Vec<Expr>,
    bmask: i64,
}

impl BigXor {
    pub fn bmask(&self) -> i64 {
        self.bmask
    }

    pub(super) fn render(&self, ctx: &dyn DisplayCtx) -> String {
        let mut parts: Vec<String> = self.exprs.iter().map(|e| e.render(ctx)).collect();
        if self.konst != 0 {
            parts.push(fmt_const(self.konst));
        }
        format!("({})", parts.join(" ^ "))
    }
}

#[derive(Default)]
pub(super) struct XorBuilder {
    konst: i64,
    exprs: BTreeSet<Expr>,
}

impl XorBuilder {
    pub(super) fn with_const(konst: i64) -> Self {
        Self { konst, exprs: BTreeSet::new() }
    }

    /// Inserting a term already present removes it.
    fn toggle(&mut self, e: Expr) {
        if !self.exprs.remove(&e) {
            self.exprs.insert(e);
        }
    }

    pub(super) fn add(&mut self, expr: &Expr, mask: i64) {
        match expr {
            Expr::BigXor(x) => {
                self.konst ^= x.konst & mask;
                for e in &x.exprs {
                    self.add(e, mask);
                }
            }
            Expr::Const(v) => self.konst ^= v & mask,
            _ => {
                let e = if mask == -1 { expr.clone() } else { expr.mask_step(mask) };
                match e {
                    Expr::Const(v) => self.konst ^= v & mask,
                    Expr::BigXor(_) => self.add(&e, -1),
                    e if e.bmask() & mask == 0 => {}
                    e => self.toggle(e),
                }
            }
        }
    }

    pub(super) fn finish(mut self) -> Expr {
        if self.exprs.is_empty() {
            return Expr::Const(self.konst);
        }
        if self.konst == 1 {
            // `cmp ^ 1` is the negated comparison.
            let cmp = self.exprs.iter().find_map(|e| match e {
                Expr::Cmp(c) => Some((e.clone(), c.negate())),
                _ => None,
            });
            if let Some((orig, neg)) = cmp {
                self.konst = 0;
                self.exprs.remove(&orig);
                match neg {
                    Expr::Const(v) => self.konst ^= v,
                    neg => self.toggle(neg),
                }
            }
        }
        if self.exprs.is_empty() {
            return Expr::Const(self.konst);
        }
        if self.konst == 0 && self.exprs.len() == 1 {
            if let Some(e) = self.exprs.pop_first() {
                return e;
            }
        }
        let bmask = self.exprs.iter().fold(self.konst, |acc, e| acc | e.bmask());
        Expr::BigXor(Arc::new(BigXor { konst: self.konst, exprs: self.exprs.into_iter().collect(), bmask }))
    }
}
