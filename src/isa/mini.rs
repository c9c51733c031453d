//! A small reference ISA.
//!
//! Encoding: byte 0 is the opcode, byte 1 (when present) packs two register
//! fields (`a` in the low nibble, `b` in the high one), and four-byte forms
//! carry a little-endian 16-bit immediate in bytes 2..4.
//!
//! Register fields 0..=7 name `r0..r7`, 8 is `sp`, 9 the split `flags`
//! register and 10 the device-visible `tv` timer register.

use std::sync::Arc;

use crate::block::BlockBuilder;
use crate::error::DecodeError;
use crate::expr::{CmpOp, Expr};
use crate::isa::{ExecSpec, FieldSrc, Isa, MemMode, MemSpace, RegDesc, RegId, SplitField};
use crate::util::{bflmask, sext};

pub const R0: RegId = RegId(0);
pub const SP: RegId = RegId(8);
pub const Z: RegId = RegId(9);
pub const C: RegId = RegId(10);
pub const IE: RegId = RegId(11);
pub const FLAGS: RegId = RegId(12);
pub const TV: RegId = RegId(13);
const LOW0: u16 = 14;

pub const WORD: i64 = 0xffff_ffff;

pub struct MiniIsa {
    regs: Vec<RegDesc>,
    code: Arc<MemSpace>,
    pub data: Arc<MemSpace>,
    pub io: Arc<MemSpace>,
    pub iord: Arc<ExecSpec>,
    pub sleep: Arc<ExecSpec>,
}

impl Default for MiniIsa {
    fn default() -> Self {
        Self::new()
    }
}

impl MiniIsa {
    pub fn new() -> Self {
        let mut regs: Vec<RegDesc> = (0..8).map(|i| RegDesc::plain(&format!("r{i}"), WORD)).collect();
        regs.push(RegDesc::plain("sp", WORD));
        regs.push(RegDesc::plain("z", 1));
        regs.push(RegDesc::plain("c", 1));
        regs.push(RegDesc::plain("ie", 1));
        regs.push(RegDesc::split(
            "flags",
            vec![
                SplitField { start: 0, len: 1, src: FieldSrc::Reg(Z) },
                SplitField { start: 1, len: 1, src: FieldSrc::Reg(C) },
                SplitField { start: 7, len: 1, src: FieldSrc::Const(1) },
                SplitField { start: 8, len: 1, src: FieldSrc::Reg(IE) },
            ],
        ));
        regs.push(RegDesc::visible("tv", 0xffff));
        for i in 0..8 {
            regs.push(RegDesc::sub(&format!("l{i}"), RegId(i), 0, 16));
        }
        Self {
            regs,
            code: MemSpace::new("C", 8, 0xffff, MemMode::ReadOnly),
            data: MemSpace::new("D", 8, WORD, MemMode::ReadWrite),
            io: MemSpace::new("IO", 16, 0xff, MemMode::Io),
            iord: ExecSpec::new("iord", vec![0xffff], vec![0xff]),
            sleep: ExecSpec::new("sleep", vec![], vec![0xffff]),
        }
    }
}

/// Instruction length by opcode.
fn insn_len(op: u8) -> Option<u64> {
    match op {
        0x00 | 0x2c | 0x2d | 0x2e => Some(1),
        0x02..=0x07 | 0x0d..=0x0f | 0x14..=0x17 | 0x25 | 0x26 => Some(2),
        0x01 | 0x08..=0x0c | 0x10..=0x13 | 0x20..=0x24 | 0x27 | 0x28 => Some(4),
        _ => None,
    }
}

fn gpr(pos: u64, field: u64) -> Result<RegId, DecodeError> {
    match field {
        0..=8 => Ok(RegId(field as u16)),
        9 => Ok(FLAGS),
        10 => Ok(TV),
        _ => Err(DecodeError::Opcode { pos, desc: format!("register field {field}") }),
    }
}

/// Two-operand arithmetic: `a = a OP rhs`.
fn alu(b: &mut BlockBuilder<'_>, ra: RegId, rhs: Expr, op: u8) -> Result<(), DecodeError> {
    let lhs = b.get_reg(ra)?;
    let res = match op {
        0x03 => lhs + rhs,
        0x04 => lhs - rhs,
        0x05 => lhs & rhs,
        0x06 => lhs | rhs,
        0x07 => lhs ^ rhs,
        _ => lhs * rhs,
    };
    b.set_reg(ra, res)
}

impl Isa for MiniIsa {
    fn name(&self) -> &str {
        "mini"
    }

    fn regs(&self) -> &[RegDesc] {
        &self.regs
    }

    fn code_space(&self) -> &Arc<MemSpace> {
        &self.code
    }

    fn stack_ptr(&self) -> Option<RegId> {
        Some(SP)
    }

    fn decode(&self, b: &mut BlockBuilder<'_>, pos: u64) -> Result<u64, DecodeError> {
        let op = b.fetch(pos, 1)? as u8;
        let len = insn_len(op).ok_or_else(|| DecodeError::Opcode { pos, desc: format!("opcode {op:#04x}") })?;
        let fields = if len >= 2 { b.fetch(pos + 1, 1)? } else { 0 };
        let imm = if len == 4 { b.fetch(pos + 2, 2)? as i64 } else { 0 };
        let simm = sext(imm, Some(15));
        let (fa, fb) = (fields & 0xf, fields >> 4);
        let next = pos + len;
        let target = Expr::Const(imm);

        let a = || gpr(pos, fa);
        let bb = || gpr(pos, fb);

        match op {
            0x00 => {}
            0x01 => b.set_reg(a()?, Expr::Const(simm))?,
            0x02 => {
                let v = b.get_reg(bb()?)?;
                b.set_reg(a()?, v)?;
            }
            0x03..=0x07 | 0x0f => {
                let rhs = b.get_reg(bb()?)?;
                alu(b, a()?, rhs, op)?;
            }
            0x08 => alu(b, a()?, Expr::Const(simm), 0x03)?,
            0x09 => alu(b, a()?, Expr::Const(imm), 0x05)?,
            0x0a..=0x0c => {
                let ra = a()?;
                let x = b.get_reg(ra)?;
                let k = imm & 0x1f;
                let res = match op {
                    0x0a => x << k,
                    0x0b => x >> k,
                    _ => Expr::sext(&x, &Expr::Const(k)),
                };
                b.set_reg(ra, res)?;
            }
            0x0d => {
                if fa >= 8 {
                    return Err(DecodeError::Opcode { pos, desc: format!("movl to field {fa}") });
                }
                let v = b.get_reg(bb()?)?;
                b.set_reg(RegId(LOW0 + fa as u16), v)?;
            }
            0x0e => {
                let x = b.get_reg(a()?)?;
                let y = b.get_reg(bb()?)?;
                b.set_reg(Z, Expr::cmp(CmpOp::Eq, x.clone(), y.clone()))?;
                b.set_reg(C, Expr::cmp(CmpOp::Lt, x, y))?;
            }
            0x10 => {
                let addr = b.get_reg(bb()?)? + simm;
                let v = b.emit_ld(&self.data, 4, addr)?;
                b.set_reg(a()?, v)?;
            }
            0x11 => {
                let addr = b.get_reg(bb()?)? + simm;
                let v = b.get_reg(a()?)?;
                b.emit_st(&self.data, 4, addr, v)?;
            }
            0x12 => {
                let v = b.emit_ld(&self.io, 1, Expr::Const(imm & 0xff))?;
                b.set_reg(a()?, v)?;
            }
            0x13 => {
                let v = b.get_reg(a()?)?;
                b.emit_st(&self.io, 1, Expr::Const(imm & 0xff), v)?;
            }
            0x14 => {
                let port = b.get_reg(bb()?)?;
                let outs = b.emit_exec(&self.iord, vec![port])?;
                if let Some(v) = outs.into_iter().next() {
                    b.set_reg(a()?, v)?;
                }
            }
            0x15 => {
                let v = b.get_reg(a()?)?;
                b.emit_exec(&self.sleep, vec![v])?;
            }
            0x16 => {
                let sp = b.get_reg(SP)? - 4;
                let v = b.get_reg(a()?)?;
                b.emit_st(&self.data, 4, sp.clone(), v)?;
                b.set_reg(SP, sp)?;
            }
            0x17 => {
                let sp = b.get_reg(SP)?;
                let v = b.emit_ld(&self.data, 4, sp.clone())?;
                b.set_reg(a()?, v)?;
                b.set_reg(SP, sp + 4)?;
            }
            0x20 => b.emit_jmp(target)?,
            0x21 => {
                let p = b.get_reg(Z)?;
                b.emit_bra(p, target)?;
            }
            0x22 => {
                let p = b.get_reg(Z)? ^ 1;
                b.emit_bra(p, target)?;
            }
            0x23 => {
                let p = b.get_reg(C)?;
                b.emit_bra(p, target)?;
            }
            0x24 => b.emit_call(target)?,
            0x25 => {
                let t = b.get_reg(a()?)? & bflmask(16);
                b.emit_call(t)?;
            }
            0x26 => {
                let t = b.get_reg(a()?)? & bflmask(16);
                b.emit_jmp(t)?;
            }
            0x27 | 0x28 => {
                let v = b.get_reg(a()?)?;
                let cmp = if op == 0x27 { CmpOp::Eq } else { CmpOp::Ne };
                b.emit_bra(Expr::cmp(cmp, v, Expr::Const(0)), target)?;
            }
            0x2c => b.emit_ret()?,
            0x2d => b.emit_iret()?,
            0x2e => b.emit_exit()?,
            _ => return Err(DecodeError::Opcode { pos, desc: format!("opcode {op:#04x}") }),
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;
    use crate::image::Section;
    use crate::op::{Op, Terminator};
    use crate::var::{Value, VarAlloc};
    use pretty_assertions::assert_eq;

    fn build(code: &[u8]) -> Result<Block, DecodeError> {
        let isa = MiniIsa::new();
        let sec = Section::new(0, code.to_vec());
        let mut alloc = VarAlloc::new();
        Block::build(&isa, &sec, &mut alloc, "b".into(), 0, None)
    }

    #[test]
    fn movi_ret() {
        // movi r0, -2; ret
        let b = build(&[0x01, 0x00, 0xfe, 0xff, 0x2c]).unwrap();
        assert_eq!(b.end, 5);
        assert_eq!(b.term, Some(Terminator::Return));
        assert_eq!(b.outregs[0].get(&R0), Some(&Value::Const(0xffff_fffe)));
    }

    #[test]
    fn flags_split_write() {
        // mov flags, r1; ret
        let b = build(&[0x02, 0x19, 0x2c]).unwrap();
        let isa = MiniIsa::new();
        let r1 = b.inregs[&RegId(1)];
        let z = b.outregs[0][&Z];
        let c = b.outregs[0][&C];
        assert_eq!(z.as_var().map(|v| v.mask), Some(1));
        assert_eq!(c.as_var().map(|v| v.mask), Some(1));
        assert!(b.outregs[0].get(&isa.reg_by_name("ie").unwrap()).is_some());
        assert_eq!(r1.mask, WORD);
    }

    #[test]
    fn io_load_kept() {
        // in r0, 0x10 ; movi r0, 0; ret
        let b = build(&[0x12, 0x00, 0x10, 0x00, 0x01, 0x00, 0x00, 0x00, 0x2c]).unwrap();
        assert_eq!(b.ops.len(), 1);
        assert!(matches!(b.ops[0], Op::Load { .. }));
    }

    #[test]
    fn visible_write() {
        // movi r0, 7; mov tv, r0; exit
        let b = build(&[0x01, 0x00, 0x07, 0x00, 0x02, 0x0a, 0x2e]).unwrap();
        assert!(matches!(&b.ops[..], [Op::Write { reg: TV, src: Expr::Const(7), .. }]));
    }

    #[test]
    fn bad_opcode() {
        let err = build(&[0xff]).unwrap_err();
        assert_eq!(err, DecodeError::Opcode { pos: 0, desc: "opcode 0xff".to_string() });
        let err = build(&[0x01, 0x0f, 0x00, 0x00]).unwrap_err();
        assert!(matches!(err, DecodeError::Opcode { pos: 0, .. }));
        let err = build(&[0x01, 0x00]).unwrap_err();
        assert!(matches!(err, DecodeError::OutOfImage { .. }));
    }
}
