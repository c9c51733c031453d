//! Self-normalizing symbolic expressions.
//!
//! Every constructor returns a canonical value: sums, bitfield unions and xor
//! sets flatten nested nodes, fold constants and drop terms that the target
//! mask makes unobservable. Structural equality is value equality for the
//! forms the constructors produce.

mod bigor;
mod bigxor;
mod sum;

pub use bigor::{BigOr, Bitfield};
pub use bigxor::BigXor;
pub use sum::Sum;

use std::collections::BTreeMap;
use std::fmt;
use std::ops;
use std::sync::Arc;

use crate::display::{DefaultDisplay, DisplayCtx};
use crate::util::{lowmask, sext, shift_amount, shl};
use crate::var::Var;

use bigor::OrBuilder;
use bigxor::XorBuilder;
use sum::SumBuilder;

/// Use counts collected by [`Expr::find_vars`].
pub type VarCounts = BTreeMap<Var, u32>;
/// Demanded bits per variable, collected by [`Expr::find_live_masks`].
pub type LiveMasks = BTreeMap<Var, i64>;

const MASK_ROUNDS: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Expr {
    Const(i64),
    Var(Var),
    Sum(Arc<Sum>),
    BigOr(Arc<BigOr>),
    BigXor(Arc<BigXor>),
    Cmp(Arc<Cmp>),
    Bin(Arc<Bin>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Ge,
}

impl CmpOp {
    pub fn negate(self) -> CmpOp {
        match self {
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Ge => CmpOp::Lt,
        }
    }

    pub fn holds(self, a: i64, b: i64) -> bool {
        match self {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Ge => a >= b,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Ge => ">=",
        }
    }
}

/// Boolean comparison, valued 0 or 1.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cmp {
    pub op: CmpOp,
    pub lhs: Expr,
    pub rhs: Expr,
}

impl Cmp {
    pub fn negate(&self) -> Expr {
        Expr::cmp(self.op.negate(), self.lhs.clone(), self.rhs.clone())
    }
}

/// Operations the canonical forms cannot absorb (non-constant operands).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BinOp {
    Mul,
    And,
    Shl,
    Sext,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bin {
    pub op: BinOp,
    pub lhs: Expr,
    pub rhs: Expr,
}

/// A variable to value mapping used by [`Expr::fold`].
pub trait Substitution {
    fn lookup(&self, var: Var) -> Option<Expr>;
}

impl Substitution for BTreeMap<Var, Expr> {
    fn lookup(&self, var: Var) -> Option<Expr> {
        self.get(&var).cloned()
    }
}

impl Substitution for BTreeMap<Var, Var> {
    fn lookup(&self, var: Var) -> Option<Expr> {
        self.get(&var).map(|v| Expr::Var(*v))
    }
}

/* ------------------------------- construction ------------------------------ */

impl Expr {
    pub fn as_const(&self) -> Option<i64> {
        match self {
            Expr::Const(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_var(&self) -> Option<Var> {
        match self {
            Expr::Var(v) => Some(*v),
            _ => None,
        }
    }

    /// Constant or bare variable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Expr::Const(_) | Expr::Var(_))
    }

    /// Superset of the bits this expression can ever have set.
    pub fn bmask(&self) -> i64 {
        match self {
            Expr::Const(v) => *v,
            Expr::Var(v) => v.mask,
            Expr::Sum(s) => s.bmask(),
            Expr::BigOr(o) => o.bmask(),
            Expr::BigXor(x) => x.bmask(),
            Expr::Cmp(_) => 1,
            Expr::Bin(_) => -1,
        }
    }

    pub fn add(a: &Expr, b: &Expr) -> Expr {
        let mut sb = SumBuilder::default();
        sb.add(a, -1, 1);
        sb.add(b, -1, 1);
        sb.finish(-1)
    }

    pub fn sub(a: &Expr, b: &Expr) -> Expr {
        let mut sb = SumBuilder::default();
        sb.add(a, -1, 1);
        sb.add(b, -1, -1);
        sb.finish(-1)
    }

    pub fn mul(a: &Expr, b: &Expr) -> Expr {
        match (a.as_const(), b.as_const()) {
            (Some(x), Some(y)) => Expr::Const(x.wrapping_mul(y)),
            (Some(c), None) | (None, Some(c)) => {
                let e = if a.as_const().is_some() { b } else { a };
                let mut sb = SumBuilder::default();
                sb.add(e, -1, c);
                sb.finish(-1)
            }
            (None, None) => Expr::bin(BinOp::Mul, a.clone(), b.clone()),
        }
    }

    pub fn and(a: &Expr, b: &Expr) -> Expr {
        if let (Some(x), Some(y)) = (a.as_const(), b.as_const()) {
            return Expr::Const(x & y);
        }
        if a.bmask() & b.bmask() == 0 {
            return Expr::Const(0);
        }
        let (e, c) = match (a.as_const(), b.as_const()) {
            (Some(c), _) => (b, c),
            (_, Some(c)) => (a, c),
            _ => return Expr::bin(BinOp::And, a.clone(), b.clone()),
        };
        let mut ob = OrBuilder::default();
        ob.add(e, None, 0, c);
        ob.finish(-1)
    }

    pub fn or(a: &Expr, b: &Expr) -> Expr {
        let mut ob = OrBuilder::default();
        ob.add(a, None, 0, -1);
        ob.add(b, None, 0, -1);
        ob.finish(-1)
    }

    pub fn xor(a: &Expr, b: &Expr) -> Expr {
        let mut xb = XorBuilder::default();
        xb.add(a, -1);
        xb.add(b, -1);
        xb.finish()
    }

    /// Shift left; negative constant amounts shift right arithmetically.
    pub fn shl(a: &Expr, by: &Expr) -> Expr {
        match (a.as_const(), by.as_const()) {
            (Some(x), Some(k)) => Expr::Const(shl(x, shift_amount(k))),
            (_, Some(0)) => a.clone(),
            (_, Some(k)) => {
                let mut ob = OrBuilder::default();
                ob.add(a, None, shift_amount(k), -1);
                ob.finish(-1)
            }
            _ => Expr::bin(BinOp::Shl, a.clone(), by.clone()),
        }
    }

    /// Sign-extends `a` from bit index `bit`.
    pub fn sext(a: &Expr, bit: &Expr) -> Expr {
        match (a.as_const(), bit.as_const()) {
            (Some(x), Some(b)) => Expr::Const(sext(x, Some(shift_amount(b)))),
            (_, Some(b)) => {
                let mut ob = OrBuilder::default();
                ob.add(a, Some(shift_amount(b)), 0, -1);
                ob.finish(-1)
            }
            _ => Expr::bin(BinOp::Sext, a.clone(), bit.clone()),
        }
    }

    pub fn cmp(op: CmpOp, lhs: Expr, rhs: Expr) -> Expr {
        match (lhs.as_const(), rhs.as_const()) {
            (Some(a), Some(b)) => Expr::Const(op.holds(a, b) as i64),
            _ => Expr::Cmp(Arc::new(Cmp { op, lhs, rhs })),
        }
    }

    fn bin(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Bin(Arc::new(Bin { op, lhs, rhs }))
    }

    /// Contracts the expression to the bits in `m`. The result agrees with
    /// `self` on every bit of `m`, and masking it again by `m` returns it
    /// unchanged.
    pub fn mask(&self, m: i64) -> Expr {
        let mut cur = self.mask_step(m);
        for _ in 0..MASK_ROUNDS {
            let next = cur.mask_step(m);
            if next == cur {
                break;
            }
            cur = next;
        }
        cur
    }

    /// One contraction round. Builders finish under the caller's mask only
    /// at the top, so a round can leave work that the next one picks up.
    fn mask_step(&self, m: i64) -> Expr {
        match self {
            Expr::Const(v) => Expr::Const(v & m),
            Expr::Var(_) | Expr::Cmp(_) => self.clone(),
            Expr::Sum(_) => {
                let lm = lowmask(m);
                let mut sb = SumBuilder::default();
                sb.add(self, lm, 1);
                sb.finish(lm)
            }
            Expr::BigOr(_) => {
                let mut ob = OrBuilder::default();
                ob.add(self, None, 0, m);
                ob.finish(m)
            }
            Expr::BigXor(_) => {
                let mut xb = XorBuilder::default();
                xb.add(self, m);
                xb.finish()
            }
            Expr::Bin(b) => match b.op {
                BinOp::Mul => {
                    let lm = lowmask(m);
                    Expr::mul(&b.lhs.mask_step(lm), &b.rhs.mask_step(lm))
                }
                BinOp::And => Expr::and(&b.lhs.mask_step(m), &b.rhs.mask_step(m)),
                BinOp::Shl | BinOp::Sext => self.clone(),
            },
        }
    }

    /// Replaces variables by their values and re-canonicalizes.
    pub fn fold(&self, subst: &dyn Substitution) -> Expr {
        match self {
            Expr::Const(_) => self.clone(),
            Expr::Var(v) => subst.lookup(*v).unwrap_or_else(|| self.clone()),
            Expr::Sum(s) => {
                let mut sb = SumBuilder::with_const(s.konst);
                for (e, mul) in &s.parts {
                    sb.add(&e.fold(subst), -1, *mul);
                }
                sb.finish(-1)
            }
            Expr::BigOr(o) => {
                let mut ob = OrBuilder::with_const(o.konst);
                for bf in &o.fields {
                    ob.add(&bf.expr.fold(subst), bf.sign, bf.shift, bf.mask);
                }
                ob.finish(-1)
            }
            Expr::BigXor(x) => {
                let mut xb = XorBuilder::with_const(x.konst);
                for e in &x.exprs {
                    xb.add(&e.fold(subst), -1);
                }
                xb.finish()
            }
            Expr::Cmp(c) => Expr::cmp(c.op, c.lhs.fold(subst), c.rhs.fold(subst)),
            Expr::Bin(b) => {
                let (l, r) = (b.lhs.fold(subst), b.rhs.fold(subst));
                match b.op {
                    BinOp::Mul => Expr::mul(&l, &r),
                    BinOp::And => Expr::and(&l, &r),
                    BinOp::Shl => Expr::shl(&l, &r),
                    BinOp::Sext => Expr::sext(&l, &r),
                }
            }
        }
    }

    /// Counts variable references.
    pub fn find_vars(&self, counts: &mut VarCounts) {
        match self {
            Expr::Const(_) => {}
            Expr::Var(v) => *counts.entry(*v).or_insert(0) += 1,
            Expr::Sum(s) => s.parts.iter().for_each(|(e, _)| e.find_vars(counts)),
            Expr::BigOr(o) => o.fields.iter().for_each(|bf| bf.expr.find_vars(counts)),
            Expr::BigXor(x) => x.exprs.iter().for_each(|e| e.find_vars(counts)),
            Expr::Cmp(c) => {
                c.lhs.find_vars(counts);
                c.rhs.find_vars(counts);
            }
            Expr::Bin(b) => {
                b.lhs.find_vars(counts);
                b.rhs.find_vars(counts);
            }
        }
    }

    /// Records which bits of each free variable are needed to produce the
    /// bits of `self` in `mask`.
    pub fn find_live_masks(&self, live: &mut LiveMasks, mask: i64) {
        match self {
            Expr::Const(_) => {}
            Expr::Var(v) => *live.entry(*v).or_insert(0) |= mask,
            Expr::Sum(s) => {
                for (e, _) in &s.parts {
                    e.find_live_masks(live, lowmask(mask));
                }
            }
            Expr::BigOr(o) => o.find_live_masks(live, mask),
            Expr::BigXor(x) => x.exprs.iter().for_each(|e| e.find_live_masks(live, mask)),
            Expr::Cmp(c) => {
                c.lhs.find_live_masks(live, -1);
                c.rhs.find_live_masks(live, -1);
            }
            Expr::Bin(b) => {
                let m = match b.op {
                    BinOp::Mul => lowmask(mask),
                    BinOp::And => mask,
                    BinOp::Shl | BinOp::Sext => -1,
                };
                b.lhs.find_live_masks(live, m);
                b.rhs.find_live_masks(live, m);
            }
        }
    }

    /// `(var, offset, mask)` when the expression is `var + offset` under `mask`.
    pub fn as_offset(&self) -> Option<(Var, i64, i64)> {
        match self {
            Expr::Sum(s) => s.as_offset(),
            Expr::BigOr(o) => o.as_offset(),
            _ => None,
        }
    }

    /// Evaluates under a concrete valuation of the free variables.
    pub fn eval(&self, env: &dyn Fn(Var) -> i64) -> i64 {
        match self {
            Expr::Const(v) => *v,
            Expr::Var(v) => env(*v),
            Expr::Sum(s) => s
                .parts
                .iter()
                .fold(s.konst, |acc, (e, mul)| acc.wrapping_add(e.eval(env).wrapping_mul(*mul))),
            Expr::BigOr(o) => o.fields.iter().fold(o.konst, |acc, bf| {
                acc | (shl(sext(bf.expr.eval(env), bf.sign), bf.shift) & bf.mask)
            }),
            Expr::BigXor(x) => x.exprs.iter().fold(x.konst, |acc, e| acc ^ e.eval(env)),
            Expr::Cmp(c) => c.op.holds(c.lhs.eval(env), c.rhs.eval(env)) as i64,
            Expr::Bin(b) => {
                let (l, r) = (b.lhs.eval(env), b.rhs.eval(env));
                match b.op {
                    BinOp::Mul => l.wrapping_mul(r),
                    BinOp::And => l & r,
                    BinOp::Shl => shl(l, shift_amount(r)),
                    BinOp::Sext => sext(l, Some(shift_amount(r))),
                }
            }
        }
    }

    pub fn render(&self, ctx: &dyn DisplayCtx) -> String {
        match self {
            Expr::Const(v) => fmt_const(*v),
            Expr::Var(v) => ctx.var_name(*v),
            Expr::Sum(s) => s.render(ctx),
            Expr::BigOr(o) => o.render(ctx),
            Expr::BigXor(x) => x.render(ctx),
            Expr::Cmp(c) => format!("({} {} {})", c.lhs.render(ctx), c.op.symbol(), c.rhs.render(ctx)),
            Expr::Bin(b) => match b.op {
                BinOp::Mul => format!("({} * {})", b.lhs.render(ctx), b.rhs.render(ctx)),
                BinOp::And => format!("({} & {})", b.lhs.render(ctx), b.rhs.render(ctx)),
                BinOp::Shl => format!("({} << {})", b.lhs.render(ctx), b.rhs.render(ctx)),
                BinOp::Sext => format!("sext({}, {})", b.lhs.render(ctx), b.rhs.render(ctx)),
            },
        }
    }
}

pub(crate) fn fmt_const(v: i64) -> String {
    if v < 0 {
        format!("-{:#x}", v.unsigned_abs())
    } else {
        format!("{:#x}", v)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(&DefaultDisplay))
    }
}

impl From<i64> for Expr {
    fn from(v: i64) -> Self {
        Expr::Const(v)
    }
}

impl From<Var> for Expr {
    fn from(v: Var) -> Self {
        Expr::Var(v)
    }
}

/* -------------------------------- operators -------------------------------- */

macro_rules! binop {
    ($tr:ident, $method:ident, $ctor:path) => {
        impl ops::$tr<Expr> for Expr {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                $ctor(&self, &rhs)
            }
        }
        impl ops::$tr<&Expr> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: &Expr) -> Expr {
                $ctor(self, rhs)
            }
        }
        impl ops::$tr<i64> for Expr {
            type Output = Expr;
            fn $method(self, rhs: i64) -> Expr {
                $ctor(&self, &Expr::Const(rhs))
            }
        }
    };
}

binop!(Add, add, Expr::add);
binop!(Sub, sub, Expr::sub);
binop!(Mul, mul, Expr::mul);
binop!(BitAnd, bitand, Expr::and);
binop!(BitOr, bitor, Expr::or);
binop!(BitXor, bitxor, Expr::xor);
binop!(Shl, shl, Expr::shl);

impl ops::Shr<i64> for Expr {
    type Output = Expr;
    fn shr(self, rhs: i64) -> Expr {
        Expr::shl(&self, &Expr::Const(rhs.wrapping_neg()))
    }
}

impl ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::sub(&Expr::Const(0), &self)
    }
}

#[cfg(test)]
mod tests;
