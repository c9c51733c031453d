//! IR operations and block terminators.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::display::DisplayCtx;
use crate::expr::{Expr, LiveMasks, Substitution, VarCounts};
use crate::isa::{ExecSpec, MemSpace, RegId};
use crate::util::bflmask;
use crate::var::Var;
use crate::world::FuncId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Assign { dst: Var, src: Expr },
    /// Write to a device-visible register; never dead.
    Write { reg: RegId, dmask: i64, src: Expr },
    Load { space: Arc<MemSpace>, size: i32, dst: Var, addr: Expr },
    Store { space: Arc<MemSpace>, size: i32, addr: Expr, src: Expr },
    /// Device operation; dead outputs become `None`.
    Exec { spec: Arc<ExecSpec>, outs: Vec<Option<Var>>, ins: Vec<Expr> },
}

fn data_mask(space: &MemSpace, size: i32) -> i64 {
    bflmask(space.bsz * size)
}

impl Op {
    pub fn defs(&self) -> Vec<Var> {
        match self {
            Op::Assign { dst, .. } | Op::Load { dst, .. } => vec![*dst],
            Op::Exec { outs, .. } => outs.iter().flatten().copied().collect(),
            Op::Write { .. } | Op::Store { .. } => Vec::new(),
        }
    }

    pub fn find_vars(&self, counts: &mut VarCounts) {
        match self {
            Op::Assign { src, .. } | Op::Write { src, .. } => src.find_vars(counts),
            Op::Load { addr, .. } => addr.find_vars(counts),
            Op::Store { addr, src, .. } => {
                addr.find_vars(counts);
                src.find_vars(counts);
            }
            Op::Exec { ins, .. } => ins.iter().for_each(|e| e.find_vars(counts)),
        }
    }

    pub fn find_live_masks(&self, live: &mut LiveMasks) {
        match self {
            Op::Assign { dst, src } => src.find_live_masks(live, dst.mask),
            Op::Write { dmask, src, .. } => src.find_live_masks(live, *dmask),
            Op::Load { space, addr, .. } => addr.find_live_masks(live, space.amask),
            Op::Store { space, size, addr, src } => {
                addr.find_live_masks(live, space.amask);
                src.find_live_masks(live, data_mask(space, *size));
            }
            Op::Exec { spec, ins, .. } => {
                for (e, m) in ins.iter().zip(&spec.imask) {
                    e.find_live_masks(live, *m);
                }
            }
        }
    }

    /// Propagates values into every read, leaving definitions alone.
    pub fn fold(&self, subst: &dyn Substitution) -> Op {
        match self {
            Op::Assign { dst, src } => Op::Assign { dst: *dst, src: src.fold(subst).mask(-1) },
            Op::Write { reg, dmask, src } => Op::Write { reg: *reg, dmask: *dmask, src: src.fold(subst).mask(*dmask) },
            Op::Load { space, size, dst, addr } => Op::Load {
                space: space.clone(),
                size: *size,
                dst: *dst,
                addr: addr.fold(subst).mask(space.amask),
            },
            Op::Store { space, size, addr, src } => Op::Store {
                space: space.clone(),
                size: *size,
                addr: addr.fold(subst).mask(space.amask),
                src: src.fold(subst).mask(data_mask(space, *size)),
            },
            Op::Exec { spec, outs, ins } => Op::Exec {
                spec: spec.clone(),
                outs: outs.clone(),
                ins: ins.iter().zip(&spec.imask).map(|(e, m)| e.fold(subst).mask(*m)).collect(),
            },
        }
    }

    /// Renames variables everywhere, definitions included.
    pub fn subst_vars(&self, rename: &BTreeMap<Var, Var>) -> Op {
        let rn = |v: &Var| *rename.get(v).unwrap_or(v);
        match self.fold(rename) {
            Op::Assign { dst, src } => Op::Assign { dst: rn(&dst), src },
            Op::Load { space, size, dst, addr } => Op::Load { space, size, dst: rn(&dst), addr },
            Op::Exec { spec, outs, ins } => Op::Exec { spec, outs: outs.iter().map(|o| o.as_ref().map(rn)).collect(), ins },
            op => op,
        }
    }

    pub fn render(&self, ctx: &dyn DisplayCtx) -> String {
        match self {
            Op::Assign { dst, src } => format!("{} = {}", ctx.var_name(*dst), src.render(ctx)),
            Op::Write { reg, src, .. } => format!("{} = {}", ctx.reg_name(*reg), src.render(ctx)),
            Op::Load { space, size, dst, addr } => {
                format!("{} = {}.{}[{}]", ctx.var_name(*dst), space.name, size, addr.render(ctx))
            }
            Op::Store { space, size, addr, src } => {
                format!("{}.{}[{}] = {}", space.name, size, addr.render(ctx), src.render(ctx))
            }
            Op::Exec { spec, outs, ins } => {
                let ins: Vec<String> = ins.iter().map(|e| e.render(ctx)).collect();
                let call = format!("{}({})", spec.name, ins.join(", "));
                if outs.is_empty() {
                    call
                } else {
                    let outs: Vec<String> = outs
                        .iter()
                        .map(|o| o.map(|v| ctx.var_name(v)).unwrap_or_else(|| "_".to_string()))
                        .collect();
                    format!("{} = {}", outs.join(", "), call)
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallArg {
    pub value: Expr,
    pub mask: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Terminator {
    Jump { addr: Expr, amask: i64 },
    Branch { pred: Expr, addr: Expr, amask: i64 },
    /// Call not yet bound to a function.
    Call { addr: Expr, amask: i64 },
    NoretCall { addr: Expr, amask: i64, callee: FuncId, args: BTreeMap<RegId, CallArg> },
    RetCall {
        addr: Expr,
        amask: i64,
        callee: FuncId,
        args: BTreeMap<RegId, CallArg>,
        rets: BTreeMap<RegId, Var>,
    },
    Return,
    InterruptReturn,
    Exit,
}

impl Terminator {
    pub fn defs(&self) -> Vec<Var> {
        match self {
            Terminator::RetCall { rets, .. } => rets.values().copied().collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_return(&self) -> bool {
        matches!(self, Terminator::Return)
    }

    pub fn find_vars(&self, counts: &mut VarCounts) {
        match self {
            Terminator::Jump { addr, .. } | Terminator::Call { addr, .. } => addr.find_vars(counts),
            Terminator::Branch { pred, addr, .. } => {
                pred.find_vars(counts);
                addr.find_vars(counts);
            }
            Terminator::NoretCall { addr, args, .. } | Terminator::RetCall { addr, args, .. } => {
                addr.find_vars(counts);
                args.values().for_each(|a| a.value.find_vars(counts));
            }
            Terminator::Return | Terminator::InterruptReturn | Terminator::Exit => {}
        }
    }

    pub fn find_live_masks(&self, live: &mut LiveMasks) {
        match self {
            Terminator::Jump { addr, amask } | Terminator::Call { addr, amask } => addr.find_live_masks(live, *amask),
            Terminator::Branch { pred, addr, amask } => {
                pred.find_live_masks(live, -1);
                addr.find_live_masks(live, *amask);
            }
            Terminator::NoretCall { addr, amask, args, .. } | Terminator::RetCall { addr, amask, args, .. } => {
                addr.find_live_masks(live, *amask);
                for a in args.values() {
                    a.value.find_live_masks(live, a.mask);
                }
            }
            Terminator::Return | Terminator::InterruptReturn | Terminator::Exit => {}
        }
    }

    pub fn fold(&self, subst: &dyn Substitution) -> Terminator {
        let fold_args = |args: &BTreeMap<RegId, CallArg>| {
            args.iter()
                .map(|(r, a)| (*r, CallArg { value: a.value.fold(subst).mask(a.mask), mask: a.mask }))
                .collect::<BTreeMap<_, _>>()
        };
        match self {
            Terminator::Jump { addr, amask } => Terminator::Jump { addr: addr.fold(subst).mask(*amask), amask: *amask },
            Terminator::Branch { pred, addr, amask } => Terminator::Branch {
                pred: pred.fold(subst).mask(-1),
                addr: addr.fold(subst).mask(*amask),
                amask: *amask,
            },
            Terminator::Call { addr, amask } => Terminator::Call { addr: addr.fold(subst).mask(*amask), amask: *amask },
            Terminator::NoretCall { addr, amask, callee, args } => Terminator::NoretCall {
                addr: addr.fold(subst).mask(*amask),
                amask: *amask,
                callee: *callee,
                args: fold_args(args),
            },
            Terminator::RetCall { addr, amask, callee, args, rets } => Terminator::RetCall {
                addr: addr.fold(subst).mask(*amask),
                amask: *amask,
                callee: *callee,
                args: fold_args(args),
                rets: rets.clone(),
            },
            Terminator::Return => Terminator::Return,
            Terminator::InterruptReturn => Terminator::InterruptReturn,
            Terminator::Exit => Terminator::Exit,
        }
    }

    pub fn subst_vars(&self, rename: &BTreeMap<Var, Var>) -> Terminator {
        match self.fold(rename) {
            Terminator::RetCall { addr, amask, callee, args, rets } => Terminator::RetCall {
                addr,
                amask,
                callee,
                args,
                rets: rets.into_iter().map(|(r, v)| (r, *rename.get(&v).unwrap_or(&v))).collect(),
            },
            t => t,
        }
    }

    pub fn render(&self, ctx: &dyn DisplayCtx) -> String {
        let render_args = |args: &BTreeMap<RegId, CallArg>| {
            let args: Vec<String> =
                args.iter().map(|(r, a)| format!("{}={}", ctx.reg_name(*r), a.value.render(ctx))).collect();
            format!("({})", args.join(", "))
        };
        match self {
            Terminator::Jump { addr, .. } => format!("goto {}", addr.render(ctx)),
            Terminator::Branch { pred, addr, .. } => format!("if {}: goto {}", pred.render(ctx), addr.render(ctx)),
            Terminator::Call { addr, .. } => format!("{}() # unbound", addr.render(ctx)),
            Terminator::NoretCall { callee, args, .. } => {
                format!("{}{} # noreturn", ctx.func_name(*callee), render_args(args))
            }
            Terminator::RetCall { callee, args, rets, .. } => {
                let call = format!("{}{}", ctx.func_name(*callee), render_args(args));
                if rets.is_empty() {
                    call
                } else {
                    let names: Vec<String> = rets.values().map(|v| ctx.var_name(*v)).collect();
                    format!("{} = {}", names.join(", "), call)
                }
            }
            Terminator::Return => "return".to_string(),
            Terminator::InterruptReturn => "iret".to_string(),
            Terminator::Exit => "exit".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::mini::MiniIsa;
    use crate::var::VarKind;
    use pretty_assertions::assert_eq;

    fn var(id: u32, mask: i64) -> Var {
        Var { id, mask, kind: VarKind::Temp }
    }

    #[test]
    fn rename_reaches_defs_and_reads() {
        let (a, b, c) = (var(1, -1), var(2, -1), var(3, 0xff));
        let rename = BTreeMap::from([(a, c), (b, a)]);

        let op = Op::Assign { dst: a, src: Expr::Var(b) + 1 };
        assert_eq!(op.subst_vars(&rename), Op::Assign { dst: c, src: Expr::Var(a) + 1 });

        let isa = MiniIsa::new();
        let op = Op::Exec { spec: isa.iord.clone(), outs: vec![Some(a)], ins: vec![Expr::Var(c)] };
        assert_eq!(op.subst_vars(&rename), Op::Exec { spec: isa.iord.clone(), outs: vec![Some(c)], ins: vec![Expr::Var(c)] });

        // stores define nothing
        let op = Op::Store { space: isa.data.clone(), size: 4, addr: Expr::Var(b), src: Expr::Var(c) };
        let Op::Store { addr, src, .. } = op.subst_vars(&rename) else { panic!("store changed kind") };
        assert_eq!((addr, src), (Expr::Var(a), Expr::Var(c)));
    }

    #[test]
    fn rename_call_results() {
        let (a, b, c) = (var(1, -1), var(2, -1), var(3, -1));
        let rename = BTreeMap::from([(a, c), (b, a)]);
        let call = Terminator::RetCall {
            addr: Expr::Const(0x20),
            amask: 0xffff,
            callee: FuncId(1),
            args: BTreeMap::from([(RegId(0), CallArg { value: Expr::Var(b), mask: -1 })]),
            rets: BTreeMap::from([(RegId(0), a)]),
        };
        let Terminator::RetCall { args, rets, addr, .. } = call.subst_vars(&rename) else {
            panic!("call changed kind")
        };
        assert_eq!(addr, Expr::Const(0x20));
        assert_eq!(args[&RegId(0)].value, Expr::Var(a));
        assert_eq!(rets[&RegId(0)], c);
        assert_eq!(call.defs(), vec![a]);
    }
}
