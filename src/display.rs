//! Naming of registers, variables and functions for rendered output.

use crate::isa::{Isa, RegId};
use crate::var::{Var, VarKind};
use crate::world::{FuncId, World};

pub trait DisplayCtx {
    fn reg_name(&self, reg: RegId) -> String {
        format!("${}", reg.0)
    }

    fn var_name(&self, var: Var) -> String {
        match var.kind {
            VarKind::Temp => format!("t{}", var.id),
            VarKind::In(r) => format!("{}_in{}", self.reg_name(r), var.id),
            VarKind::Parm(r) => format!("parm_{}", self.reg_name(r)),
        }
    }

    fn func_name(&self, func: FuncId) -> String {
        format!("func_{}", func.0)
    }
}

/// Numeric names only; used by `Display` impls.
pub struct DefaultDisplay;

impl DisplayCtx for DefaultDisplay {}

/// Register names from the ISA, function names from the world when given.
pub struct IsaDisplay<'a> {
    pub isa: &'a dyn Isa,
    pub world: Option<&'a World>,
}

impl<'a> IsaDisplay<'a> {
    pub fn new(isa: &'a dyn Isa) -> Self {
        Self { isa, world: None }
    }

    pub fn with_world(isa: &'a dyn Isa, world: &'a World) -> Self {
        Self { isa, world: Some(world) }
    }
}

impl DisplayCtx for IsaDisplay<'_> {
    fn reg_name(&self, reg: RegId) -> String {
        self.isa
            .regs()
            .get(reg.index())
            .map(|d| d.name.clone())
            .unwrap_or_else(|| format!("${}", reg.0))
    }

    fn func_name(&self, func: FuncId) -> String {
        match self.world.and_then(|w| w.funcs.get(func.index())) {
            Some(f) => f.name.clone(),
            None => format!("func_{}", func.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::mini::MiniIsa;
    use pretty_assertions::assert_eq;

    #[test]
    fn var_names() {
        let isa = MiniIsa::new();
        let ctx = IsaDisplay::new(&isa);
        let sp = isa.reg_by_name("sp").unwrap();
        let v = Var { id: 7, mask: -1, kind: VarKind::In(sp) };
        assert_eq!(ctx.var_name(v), "sp_in7");
        let p = Var { id: 2, mask: -1, kind: VarKind::Parm(sp) };
        assert_eq!(ctx.var_name(p), "parm_sp");
        assert_eq!(DefaultDisplay.var_name(Var { id: 3, mask: 1, kind: VarKind::Temp }), "t3");
        assert_eq!(DefaultDisplay.reg_name(RegId(4)), "$4");
    }
}
