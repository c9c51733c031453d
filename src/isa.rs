//! What a target architecture tells the engine: registers, memory spaces,
//! device operations, and a decoder driving the block builder.

pub mod mini;

use std::sync::Arc;

use crate::block::BlockBuilder;
use crate::error::DecodeError;
use crate::util::bflmask;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegId(pub u16);

impl RegId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldSrc {
    Reg(RegId),
    /// Bits that always read as this value and ignore writes.
    Const(i64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitField {
    pub start: i32,
    pub len: i32,
    pub src: FieldSrc,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegKind {
    Plain,
    /// Device-visible register: writes are side effects in their own right.
    Visible,
    /// Composite of other registers' bits.
    Split(Vec<SplitField>),
    /// Bit range view of a wider register.
    Sub { reg: RegId, start: i32, len: i32 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegDesc {
    pub name: String,
    /// Bits that carry information.
    pub mask: i64,
    /// Bits a write can change.
    pub dmask: i64,
    pub kind: RegKind,
}

impl RegDesc {
    pub fn plain(name: &str, mask: i64) -> Self {
        Self { name: name.to_string(), mask, dmask: mask, kind: RegKind::Plain }
    }

    pub fn visible(name: &str, mask: i64) -> Self {
        Self { name: name.to_string(), mask, dmask: mask, kind: RegKind::Visible }
    }

    pub fn split(name: &str, fields: Vec<SplitField>) -> Self {
        let mut mask = 0;
        let mut dmask = 0;
        for f in &fields {
            let m = bflmask(f.len) << f.start;
            match f.src {
                FieldSrc::Reg(_) => {
                    mask |= m;
                    dmask |= m;
                }
                FieldSrc::Const(v) => mask |= v << f.start,
            }
        }
        Self { name: name.to_string(), mask, dmask, kind: RegKind::Split(fields) }
    }

    pub fn sub(name: &str, reg: RegId, start: i32, len: i32) -> Self {
        let mask = bflmask(len);
        Self { name: name.to_string(), mask, dmask: mask, kind: RegKind::Sub { reg, start, len } }
    }

    /// Plain and visible registers are the ones that carry values across
    /// block edges.
    pub fn is_storage(&self) -> bool {
        matches!(self.kind, RegKind::Plain | RegKind::Visible)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemMode {
    ReadOnly,
    ReadWrite,
    /// Accesses have side effects; loads are never dropped.
    Io,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemSpace {
    pub name: String,
    /// Bits per element.
    pub bsz: i32,
    pub amask: i64,
    pub mode: MemMode,
}

impl MemSpace {
    pub fn new(name: &str, bsz: i32, amask: i64, mode: MemMode) -> Arc<Self> {
        Arc::new(Self { name: name.to_string(), bsz, amask, mode })
    }
}

/// A multi-output device operation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ExecSpec {
    pub name: String,
    pub omask: Vec<i64>,
    pub imask: Vec<i64>,
}

impl ExecSpec {
    pub fn new(name: &str, omask: Vec<i64>, imask: Vec<i64>) -> Arc<Self> {
        Arc::new(Self { name: name.to_string(), omask, imask })
    }
}

pub trait Isa: Send + Sync {
    fn name(&self) -> &str;

    fn regs(&self) -> &[RegDesc];

    fn reg(&self, id: RegId) -> &RegDesc {
        &self.regs()[id.index()]
    }

    fn reg_by_name(&self, name: &str) -> Option<RegId> {
        self.regs().iter().position(|r| r.name == name).map(|i| RegId(i as u16))
    }

    fn code_space(&self) -> &Arc<MemSpace>;

    fn stack_ptr(&self) -> Option<RegId>;

    /// Decodes one instruction at `pos` into `b`, returning the address of
    /// the next one.
    fn decode(&self, b: &mut BlockBuilder<'_>, pos: u64) -> Result<u64, DecodeError>;
}

pub fn by_name(name: &str) -> Option<Arc<dyn Isa>> {
    match name {
        "mini" => Some(Arc::new(mini::MiniIsa::new())),
        _ => None,
    }
}
