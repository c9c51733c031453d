use std::collections::BTreeMap;
use std::sync::Arc;

use super::{fmt_const, BinOp, Expr};
use crate::display::DisplayCtx;
use crate::util::highmask;
use crate::var::Var;

/// Affine combination: `konst + sum(expr * mul)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sum {
    pub konst: i64,
    pub parts: Vec<(Expr, i64)>,
    bmask: i64,
}

impl Sum {
    pub fn bmask(&self) -> i64 {
        self.bmask
    }

    pub(super) fn as_offset(&self) -> Option<(Var, i64, i64)> {
        match self.parts.as_slice() {
            [(Expr::Var(v), 1)] => Some((*v, self.konst, -1)),
            _ => None,
        }
    }

    pub(super) fn render(&self, ctx: &dyn DisplayCtx) -> String {
        let mut out = String::from("(");
        if self.konst != 0 {
            out.push_str(&fmt_const(self.konst));
        }
        for (e, mul) in &self.parts {
            let first = out.len() == 1;
            match (first, *mul > 0) {
                (true, true) => {}
                (true, false) => out.push('-'),
                (false, true) => out.push_str(" + "),
                (false, false) => out.push_str(" - "),
            }
            out.push_str(&e.render(ctx));
            if mul.unsigned_abs() != 1 {
                out.push_str(&format!(" * {:#x}", mul.unsigned_abs()));
            }
        }
        out.push(')');
        out
    }
}

#[derive(Default)]
pub(super) struct SumBuilder {
    konst: i64,
    parts: BTreeMap<Expr, i64>,
}

impl SumBuilder {
    pub(super) fn with_const(konst: i64) -> Self {
        Self { konst, parts: BTreeMap::new() }
    }

    fn add_const(&mut self, v: i64, mask: i64, mul: i64) {
        self.konst = self.konst.wrapping_add(v.wrapping_mul(mul)) & mask;
    }

    fn add_part(&mut self, e: Expr, mul: i64) {
        let slot = self.parts.entry(e).or_insert(0);
        *slot = slot.wrapping_add(mul);
    }

    /// Accumulates `expr * mul`, with `expr` contracted to `mask`.
    pub(super) fn add(&mut self, expr: &Expr, mask: i64, mul: i64) {
        if mul == 0 {
            return;
        }
        match expr {
            Expr::Sum(s) => {
                self.add_const(s.konst, mask, mul);
                for (e, smul) in &s.parts {
                    self.add(e, mask, smul.wrapping_mul(mul));
                }
            }
            Expr::Const(v) => self.add_const(*v, mask, mul),
            Expr::Bin(b) if b.op == BinOp::Mul => match (b.lhs.as_const(), b.rhs.as_const()) {
                (_, Some(c)) => self.add(&b.lhs, mask, mul.wrapping_mul(c)),
                (Some(c), _) => self.add(&b.rhs, mask, mul.wrapping_mul(c)),
                _ => self.add_masked(expr, mask, mul),
            },
            _ => self.add_masked(expr, mask, mul),
        }
    }

    fn add_masked(&mut self, expr: &Expr, mask: i64, mul: i64) {
        let e = if mask == -1 { expr.clone() } else { expr.mask_step(mask) };
        match e {
            Expr::Const(v) => self.add_const(v, mask, mul),
            Expr::Sum(_) => self.add(&e, -1, mul),
            e => self.add_part(e, mul),
        }
    }

    pub(super) fn finish(self, mask: i64) -> Expr {
        let mut konst = self.konst & mask;
        let mut parts: BTreeMap<Expr, i64> = BTreeMap::new();
        for (e, mul) in self.parts {
            if mul == 0 {
                continue;
            }
            let e = if mask == -1 { e } else { e.mask_step(mask) };
            match e {
                Expr::Const(v) => konst = konst.wrapping_add(v.wrapping_mul(mul)) & mask,
                Expr::Sum(s) => {
                    konst = konst.wrapping_add(s.konst.wrapping_mul(mul)) & mask;
                    for (se, smul) in &s.parts {
                        let slot = parts.entry(se.clone()).or_insert(0);
                        *slot = slot.wrapping_add(smul.wrapping_mul(mul));
                    }
                }
                e => {
                    let slot = parts.entry(e).or_insert(0);
                    *slot = slot.wrapping_add(mul);
                }
            }
        }
        parts.retain(|_, mul| *mul != 0);
        if parts.is_empty() {
            return Expr::Const(konst);
        }
        if konst == 0 && parts.len() == 1 {
            if let Some((e, 1)) = parts.iter().next() {
                return e.clone();
            }
        }
        let bmask = parts
            .iter()
            .fold(highmask(konst), |acc, (e, mul)| acc | highmask(e.bmask().wrapping_mul(*mul)));
        Expr::Sum(Arc::new(Sum { konst, parts: parts.into_iter().collect(), bmask }))
    }
}
