//! Variables and the values registers can hold.

use crate::expr::Expr;
use crate::isa::RegId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VarKind {
    /// Block-local temporary.
    Temp,
    /// Block input, not yet tied to a definition across edges.
    In(RegId),
    /// Function parameter holding the entry value of a register.
    Parm(RegId),
}

/// A symbolic value with a stable id. The mask never changes after creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Var {
    pub id: u32,
    pub mask: i64,
    pub kind: VarKind,
}

impl Var {
    pub fn reg(&self) -> Option<RegId> {
        match self.kind {
            VarKind::In(r) | VarKind::Parm(r) => Some(r),
            VarKind::Temp => None,
        }
    }

    pub fn is_in(&self) -> bool {
        matches!(self.kind, VarKind::In(_))
    }
}

/// Hands out variable ids for one function pass.
#[derive(Debug, Default)]
pub struct VarAlloc {
    next: u32,
}

impl VarAlloc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self, mask: i64, kind: VarKind) -> Var {
        let id = self.next;
        self.next += 1;
        Var { id, mask, kind }
    }

    pub fn temp(&mut self, mask: i64) -> Var {
        self.fresh(mask, VarKind::Temp)
    }
}

/// What a register holds at a block boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    Const(i64),
    Var(Var),
}

impl Value {
    pub fn to_expr(self) -> Expr {
        match self {
            Value::Const(c) => Expr::Const(c),
            Value::Var(v) => Expr::Var(v),
        }
    }

    pub fn as_var(self) -> Option<Var> {
        match self {
            Value::Var(v) => Some(v),
            Value::Const(_) => None,
        }
    }

    /// Converts a terminal expression back into a value.
    pub fn from_expr(e: &Expr) -> Option<Value> {
        match e {
            Expr::Const(c) => Some(Value::Const(*c)),
            Expr::Var(v) => Some(Value::Var(*v)),
            _ => None,
        }
    }
}

impl From<Var> for Value {
    fn from(v: Var) -> Self {
        Value::Var(v)
    }
}
