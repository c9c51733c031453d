use std::collections::BTreeMap;

use pretty_assertions::assert_eq;
use proptest::prelude::*;

use super::*;
use crate::util::{sext, shl};
use crate::var::VarKind;

fn var(id: u32, mask: i64) -> Var {
    Var { id, mask, kind: VarKind::Temp }
}

const VARS: [(u32, i64); 3] = [(0, -1), (1, 0xff), (2, 0xffff)];

fn env_from(vals: &[i64; 3]) -> impl Fn(Var) -> i64 + '_ {
    move |v: Var| vals[v.id as usize] & v.mask
}

fn arb_expr() -> impl Strategy<Value = Expr> {
    let leaf = prop_oneof![
        any::<i64>().prop_map(Expr::Const),
        (-16i64..16).prop_map(Expr::Const),
        (0usize..3).prop_map(|i| Expr::Var(var(VARS[i].0, VARS[i].1))),
    ];
    leaf.prop_recursive(4, 24, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(a, b)| Expr::add(&a, &b)),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| Expr::sub(&a, &b)),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| Expr::or(&a, &b)),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| Expr::xor(&a, &b)),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| Expr::and(&a, &b)),
            (inner.clone(), any::<i64>()).prop_map(|(a, c)| Expr::and(&a, &Expr::Const(c))),
            (inner.clone(), -8i64..8).prop_map(|(a, c)| Expr::mul(&a, &Expr::Const(c))),
            (inner.clone(), -40i64..40).prop_map(|(a, k)| Expr::shl(&a, &Expr::Const(k))),
            (inner.clone(), 0i64..40).prop_map(|(a, k)| Expr::sext(&a, &Expr::Const(k))),
            (inner.clone(), inner).prop_map(|(a, b)| Expr::cmp(CmpOp::Lt, a, b)),
        ]
    })
}

fn arb_mask() -> impl Strategy<Value = i64> {
    prop_oneof![Just(-1i64), Just(0xff), Just(0xffff_ffff), Just(0xff00), any::<i64>()]
}

proptest! {
    #[test]
    fn mask_agrees_on_masked_bits(e in arb_expr(), m in arb_mask(), vals in any::<[i64; 3]>()) {
        let env = env_from(&vals);
        prop_assert_eq!(e.mask(m).eval(&env) & m, e.eval(&env) & m);
    }

    #[test]
    fn bmask_covers_every_value(e in arb_expr(), vals in any::<[i64; 3]>()) {
        let env = env_from(&vals);
        prop_assert_eq!(e.eval(&env) & !e.bmask(), 0);
    }

    #[test]
    fn dead_bits_do_not_matter(e in arb_expr(), m in arb_mask(), vals in any::<[i64; 3]>(), noise in any::<i64>()) {
        let mut live = LiveMasks::new();
        e.find_live_masks(&mut live, m);
        let mut other = vals;
        for (i, (id, mask)) in VARS.iter().enumerate() {
            let lm = live.get(&var(*id, *mask)).copied().unwrap_or(0);
            other[i] = (vals[i] & lm) | (noise & !lm);
        }
        prop_assert_eq!(e.eval(&env_from(&vals)) & m, e.eval(&env_from(&other)) & m);
    }

    #[test]
    fn fold_matches_evaluation(e in arb_expr(), c in any::<i64>(), vals in any::<[i64; 3]>()) {
        let x = var(0, -1);
        let subst = BTreeMap::from([(x, Expr::Const(c))]);
        let folded = e.fold(&subst);
        let mut with_c = vals;
        with_c[0] = c;
        prop_assert_eq!(folded.eval(&env_from(&vals)), e.eval(&env_from(&with_c)));
        prop_assert!(!folded.find_vars_contains(x));
    }

    #[test]
    fn sums_commute(a in arb_expr(), b in arb_expr()) {
        prop_assert_eq!(Expr::add(&a, &b), Expr::add(&b, &a));
    }

    #[test]
    fn xor_with_itself_is_zero(a in arb_expr()) {
        prop_assert_eq!(Expr::xor(&a, &a), Expr::Const(0));
    }

    #[test]
    fn masking_is_idempotent(e in arb_expr(), m in arb_mask()) {
        let once = e.mask(m);
        prop_assert_eq!(once.mask(m), once);
    }

    #[test]
    fn constructors_match_reference(
        a in arb_expr(),
        b in arb_expr(),
        k in -40i64..40,
        vals in any::<[i64; 3]>(),
    ) {
        let env = env_from(&vals);
        let (x, y) = (a.eval(&env), b.eval(&env));
        prop_assert_eq!(Expr::add(&a, &b).eval(&env), x.wrapping_add(y));
        prop_assert_eq!(Expr::sub(&a, &b).eval(&env), x.wrapping_sub(y));
        prop_assert_eq!(Expr::mul(&a, &b).eval(&env), x.wrapping_mul(y));
        prop_assert_eq!(Expr::or(&a, &b).eval(&env), x | y);
        prop_assert_eq!(Expr::xor(&a, &b).eval(&env), x ^ y);
        prop_assert_eq!(Expr::and(&a, &b).eval(&env), x & y);
        prop_assert_eq!(Expr::shl(&a, &Expr::Const(k)).eval(&env), shl(x, k as i32), "shift by {}", k);
        let bit = k.abs();
        prop_assert_eq!(Expr::sext(&a, &Expr::Const(bit)).eval(&env), sext(x, Some(bit as i32)), "sext at {}", bit);
    }
}

impl Expr {
    fn find_vars_contains(&self, v: Var) -> bool {
        let mut counts = VarCounts::new();
        self.find_vars(&mut counts);
        counts.contains_key(&v)
    }
}

#[test]
fn constants_fold() {
    assert_eq!(Expr::add(&Expr::Const(2), &Expr::Const(3)), Expr::Const(5));
    assert_eq!(Expr::Const(0xf0) & 0x3c, Expr::Const(0x30));
    assert_eq!(Expr::cmp(CmpOp::Eq, Expr::Const(1), Expr::Const(1)), Expr::Const(1));
}

#[test]
fn affine_cancellation() {
    let x = Expr::Var(var(0, -1));
    let y = Expr::Var(var(1, 0xff));
    assert_eq!(Expr::sub(&x, &x), Expr::Const(0));
    let e = Expr::sub(&Expr::add(&x, &y), &y);
    assert_eq!(e, x);
    assert_eq!(Expr::add(&x, &x), Expr::mul(&x, &Expr::Const(2)));
}

#[test]
fn offsets() {
    let sp = var(0, 0xffff_ffff);
    let e = Expr::add(&Expr::Var(sp), &Expr::Const(-8));
    assert_eq!(e.as_offset(), Some((sp, -8, -1)));
    let m = e.clone() & 0xffff_ffff;
    assert_eq!(m.as_offset().map(|(v, off, mask)| (v, off & 0xffff_ffff, mask)), Some((sp, 0xffff_fff8, 0xffff_ffff)));
    assert_eq!(Expr::Var(sp).as_offset(), None);
}

#[test]
fn narrow_mask_drops_high_fields() {
    let x = Expr::Var(var(0, -1));
    let y = Expr::Var(var(1, 0xff));
    // (y << 8) | (x & 0xff)
    let e = Expr::or(&(y.clone() << 8), &(x.clone() & 0xff));
    assert_eq!(e.mask(0xff), x);
    assert_eq!(e.mask(0xff00), y << 8);

    let mut live = LiveMasks::new();
    e.find_live_masks(&mut live, 0xf0);
    assert_eq!(live.get(&var(0, -1)), Some(&0xf0));
    assert_eq!(live.get(&var(1, 0xff)).copied().unwrap_or(0), 0);
}

#[test]
fn overlapping_fields_keep_first() {
    let x = Expr::Var(var(0, -1));
    let y = Expr::Var(var(2, 0xffff));
    // Both cover bits 0..8; the union is evaluated as written.
    let e = Expr::or(&(x.clone() & 0xff), &(y & 0xff));
    match &e {
        Expr::BigOr(o) => assert_eq!(o.fields[0].expr, x),
        other => panic!("expected bitfield union, got {other}"),
    }
}

#[test]
fn negated_compare() {
    let x = Expr::Var(var(0, -1));
    let c = Expr::cmp(CmpOp::Lt, x.clone(), Expr::Const(3));
    assert_eq!(c.clone() ^ 1, Expr::cmp(CmpOp::Ge, x, Expr::Const(3)));
    assert_eq!(c.bmask(), 1);
}

#[test]
fn render_default() {
    let x = Expr::Var(var(4, -1));
    let e = Expr::add(&x, &Expr::Const(-2));
    assert_eq!(e.to_string(), "(-0x2 + t4)");
}

#[test]
fn shift_out_and_back_keeps_sign() {
    let t0 = var(0, -1);
    // (t0 << 7) >> 8: bit 56 of t0 lands on bit 63 and is replicated.
    let e = Expr::shl(&Expr::shl(&Expr::Var(t0), &Expr::Const(7)), &Expr::Const(-8));
    for v in [0x0123_4567_89ab_cdef, 0x0100_0000_0000_0000, -1, 0x7f] {
        assert_eq!(e.eval(&|_: Var| v), shl(shl(v, 7), -8), "t0 = {v:#x}");
    }
}

#[test]
fn mask_with_bit_62() {
    let x = Expr::Var(var(0, -1));
    let s = Expr::add(&x, &Expr::Const(3));
    let e = Expr::and(&s, &Expr::Const(0x4000_0000_0000_0000));
    assert_eq!(e.eval(&|_: Var| 0x3fff_ffff_ffff_fffd), 0x4000_0000_0000_0000);
}

#[test]
fn widening_settles_in_one_mask() {
    let t0 = Expr::Var(var(0, -1));
    let t1 = Expr::Var(var(1, 0xff));
    let t2 = Expr::Var(var(2, 0xffff));
    let e = Expr::and(&Expr::and(&Expr::xor(&t1, &Expr::Const(-1)), &t2), &t0);
    let once = e.mask(0xff00);
    assert_eq!(once.mask(0xff00), once);
    assert_eq!(once, Expr::and(&t2, &t0));
}
