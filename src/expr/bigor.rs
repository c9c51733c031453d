use std::sync::Arc;

use super::{fmt_const, BinOp, Expr, LiveMasks};
use crate::display::DisplayCtx;
use crate::util::{bflmask, sext, shl};
use crate::var::Var;

/// One term of a bitfield union: `sext(expr, sign) << shift & mask`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bitfield {
    pub expr: Expr,
    pub sign: Option<i32>,
    pub shift: i32,
    pub mask: i64,
}

impl Bitfield {
    /// Bits this field can produce before its mask is applied.
    fn produced(&self) -> i64 {
        shl(sext(self.expr.bmask(), self.sign), self.shift)
    }

    fn render(&self, ctx: &dyn DisplayCtx) -> String {
        let mut res = self.expr.render(ctx);
        if let Some(sign) = self.sign {
            res = format!("sext({}, {})", res, sign);
        }
        if self.shift > 0 {
            res.push_str(&format!(" << {}", self.shift));
        }
        if self.shift < 0 {
            res.push_str(&format!(" >> {}", -self.shift));
        }
        if self.mask != -1 {
            res.push_str(&format!(" & {}", fmt_const(self.mask)));
        }
        res
    }
}

/// Bitwise OR of a constant and a list of bitfields, in insertion order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BigOr {
    pub konst: i64,
    pub fields: Vec<Bitfield>,
    bmask: i64,
}

impl BigOr {
    pub fn bmask(&self) -> i64 {
        self.bmask
    }

    pub(super) fn find_live_masks(&self, live: &mut LiveMasks, mask: i64) {
        for bf in &self.fields {
            let imask = input_mask(mask & bf.mask, bf.sign, bf.shift);
            bf.expr.find_live_masks(live, imask);
        }
    }

    pub(super) fn as_offset(&self) -> Option<(Var, i64, i64)> {
        match self.fields.as_slice() {
            [bf] if self.konst == 0 && bf.sign.is_none() && bf.shift == 0 => {
                let (var, off, m) = bf.expr.as_offset()?;
                Some((var, off, m & bf.mask))
            }
            _ => None,
        }
    }

    pub(super) fn render(&self, ctx: &dyn DisplayCtx) -> String {
        let mut parts: Vec<String> = self.fields.iter().map(|bf| bf.render(ctx)).collect();
        if self.konst != 0 {
            parts.push(fmt_const(self.konst));
        }
        format!("({})", parts.join(" | "))
    }
}

/// Bits of a field's source that reach the result bits in `mask`.
fn input_mask(mask: i64, sign: Option<i32>, shift: i32) -> i64 {
    let mut imask = shl(mask, -shift);
    // Right shifts replicate the top bit into the high result bits.
    if shift < 0 && mask & shl(-1, 64 + shift) != 0 {
        imask |= i64::MIN;
    }
    if let Some(s) = sign {
        if imask & shl(-1, s) != 0 {
            imask |= shl(1, s);
        }
        imask &= bflmask(s + 1);
    }
    imask
}

/// Composes an inner field transform `(ssign, sshift, smask)` over a source
/// with possible bits `sbits` with an outer one `(sign, shift, mask)`.
/// `None` when nothing survives.
fn reduce(
    sbits: i64,
    (ssign, sshift, smask): (Option<i32>, i32, i64),
    (sign, shift, mask): (Option<i32>, i32, i64),
) -> Option<(Option<i32>, i32, i64)> {
    if sshift >= 64 {
        return None;
    }
    let mask = mask & shl(sext(smask, sign), shift);
    let mut sign = match sign {
        Some(s) if s - sshift < 0 => return None,
        Some(s) => Some(s - sshift),
        None => None,
    };
    if let Some(ss) = ssign {
        sign = Some(sign.map_or(ss, |s| s.min(ss)));
    }
    // The inner left shift drops source bits past bit 63, and the bit that
    // lands there becomes the sign of what the outer shift sees.
    if sshift > 0 {
        let top = 63 - sshift;
        if sext(sbits, ssign) & shl(-1, top) != 0 {
            sign = Some(sign.map_or(top, |s| s.min(top)));
        }
    }
    Some((sign, shift + sshift, mask))
}

#[derive(Default)]
pub(super) struct OrBuilder {
    konst: i64,
    fields: Vec<Bitfield>,
}

impl OrBuilder {
    pub(super) fn with_const(konst: i64) -> Self {
        Self { konst, fields: Vec::new() }
    }

    fn add_const(&mut self, v: i64, sign: Option<i32>, shift: i32, mask: i64) {
        self.konst |= shl(sext(v, sign), shift) & mask;
    }

    /// `self |= sext(expr, sign) << shift & mask`
    pub(super) fn add(&mut self, expr: &Expr, sign: Option<i32>, shift: i32, mask: i64) {
        let sign = sign.filter(|s| mask & shl(-1, shift + s + 1) != 0);
        if mask == 0 {
            return;
        }
        let imask = input_mask(mask, sign, shift);
        match expr {
            Expr::BigOr(o) => {
                self.add_const(o.konst, sign, shift, mask);
                for bf in &o.fields {
                    let inner = (bf.sign, bf.shift, bf.mask);
                    if let Some((s, sh, m)) = reduce(bf.expr.bmask(), inner, (sign, shift, mask)) {
                        self.add(&bf.expr, s, sh, m);
                    }
                }
                return;
            }
            Expr::Const(v) => {
                self.add_const(*v, sign, shift, mask);
                return;
            }
            Expr::Bin(b) if b.op == BinOp::And => {
                let l = b.lhs.mask_step(imask);
                let r = b.rhs.mask_step(imask);
                let split = match (l.as_const(), r.as_const()) {
                    (_, Some(c)) => Some((l, c)),
                    (Some(c), _) => Some((r, c)),
                    _ => None,
                };
                if let Some((e, c)) = split {
                    if let Some((s, sh, m)) = reduce(e.bmask(), (None, 0, c), (sign, shift, mask)) {
                        self.add(&e, s, sh, m);
                    }
                    return;
                }
            }
            _ => {}
        }
        let e = expr.mask_step(imask);
        match e {
            Expr::Const(v) => self.add_const(v, sign, shift, mask),
            Expr::BigOr(_) => self.add(&e, sign, shift, mask),
            e => {
                if e.bmask() & imask == 0 {
                    return;
                }
                self.push(Bitfield { expr: e, sign, shift, mask });
            }
        }
    }

    /// A field with the same source transform as an earlier one merges into
    /// it, so a fully covered later field disappears.
    fn push(&mut self, bf: Bitfield) {
        let same = self
            .fields
            .iter_mut()
            .find(|f| f.expr == bf.expr && f.sign == bf.sign && f.shift == bf.shift);
        match same {
            Some(f) => f.mask |= bf.mask,
            None => self.fields.push(bf),
        }
    }

    pub(super) fn finish(self, mask: i64) -> Expr {
        let konst = self.konst;
        let mut bmask = konst;
        let mut fields = Vec::with_capacity(self.fields.len());
        for mut bf in self.fields {
            if bf.mask | konst == konst {
                continue;
            }
            let produced = bf.produced();
            if (mask & produced) | bf.mask == bf.mask {
                bf.mask = -1;
            }
            bmask |= produced & bf.mask;
            fields.push(bf);
        }
        if fields.is_empty() {
            return Expr::Const(konst);
        }
        if konst == 0 && fields.len() == 1 {
            let bf = &fields[0];
            if bf.mask == -1 && bf.sign.is_none() && bf.shift == 0 {
                return bf.expr.clone();
            }
        }
        Expr::BigOr(Arc::new(BigOr { konst, fields, bmask }))
    }
}
