use std::fmt::Write;

use super::{BlockId, FuncBody, FunBlock, Function};
use crate::display::DisplayCtx;
use crate::expr::fmt_const;
use crate::op::Terminator;
use crate::structurizer::{Seq, Stmt};

const INDENT: &str = "    ";

struct Printer<'a> {
    func: &'a Function,
    body: &'a FuncBody,
    ctx: &'a dyn DisplayCtx,
    out: String,
}

impl Printer<'_> {
    fn line(&mut self, depth: usize, text: &str) {
        for _ in 0..depth {
            self.out.push_str(INDENT);
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn block(&self, id: BlockId) -> Option<&FunBlock> {
        self.body.blocks.get(&id)
    }

    fn ops(&mut self, depth: usize, id: BlockId) {
        let Some(b) = self.block(id) else { return };
        let lines: Vec<String> = b.ops.iter().map(|op| op.render(self.ctx)).collect();
        if self.body.labels.contains(&id) {
            let label = format!("{}:", b.name);
            self.line(depth.saturating_sub(1), &label);
        }
        for l in lines {
            self.line(depth, &l);
        }
    }

    /// Assignments moving values across edge `idx` into the successor.
    /// Returns whether any were printed.
    fn phis(&mut self, depth: usize, id: BlockId, idx: usize) -> bool {
        let Some(b) = self.block(id) else { return false };
        let (Some(Some(t)), Some(regs)) = (b.outs.get(idx), b.outregs.get(idx)) else { return false };
        let Some(target) = self.block(*t) else { return false };
        let lines: Vec<String> = target
            .inregs
            .iter()
            .filter_map(|(reg, var)| {
                let val = regs.get(reg)?;
                (val.as_var() != Some(*var))
                    .then(|| format!("{} = {}", self.ctx.var_name(*var), val.to_expr().render(self.ctx)))
            })
            .collect();
        let moved = !lines.is_empty();
        for l in lines {
            self.line(depth, &l);
        }
        moved
    }

    fn exit(&mut self, depth: usize, id: BlockId) {
        let Some(b) = self.block(id) else { return };
        let line = match b.outs.first() {
            Some(None) if b.term.is_return() => {
                let rets: Vec<String> = self
                    .func
                    .sig
                    .rets
                    .iter()
                    .flatten()
                    .filter_map(|r| b.outregs[0].get(r))
                    .map(|v| v.to_expr().render(self.ctx))
                    .collect();
                Some(if rets.is_empty() { "return".to_string() } else { format!("return {}", rets.join(", ")) })
            }
            Some(Some(_)) if matches!(b.term, Terminator::Jump { .. }) => None,
            _ => Some(b.term.render(self.ctx)),
        };
        if let Some(line) = line {
            self.line(depth, &line);
        }
        self.phis(depth, id, 0);
    }

    fn seq(&mut self, depth: usize, seq: &Seq<BlockId>) {
        if seq.is_empty() {
            self.line(depth, "pass");
        }
        for stmt in seq {
            match stmt {
                Stmt::Block(id) => {
                    self.ops(depth, *id);
                    self.exit(depth, *id);
                }
                Stmt::If { node, arms, .. } => {
                    self.ops(depth, *node);
                    let pred = match self.block(*node).map(|b| &b.term) {
                        Some(Terminator::Branch { pred, .. }) => pred.render(self.ctx),
                        _ => "?".to_string(),
                    };
                    for (idx, arm) in arms.iter().enumerate() {
                        let head = if idx == 0 { format!("if {pred}:") } else { "else:".to_string() };
                        self.line(depth, &head);
                        let moved = self.phis(depth + 1, *node, idx);
                        if !(moved && arm.is_empty()) {
                            self.seq(depth + 1, arm);
                        }
                    }
                }
                Stmt::Loop(body) => {
                    self.line(depth, "while True:");
                    self.seq(depth + 1, body);
                }
                Stmt::Goto(id) => {
                    let name = self.block(*id).map(|b| b.name.clone()).unwrap_or_default();
                    self.line(depth, &format!("goto {name}"));
                }
                Stmt::Continue => self.line(depth, "continue"),
                Stmt::Break => self.line(depth, "break"),
            }
        }
    }

    /// Unstructured listing for functions that failed part way.
    fn raw(&mut self) {
        let ids: Vec<BlockId> = self.body.blocks.keys().copied().collect();
        for id in ids {
            if let Some(b) = self.block(id) {
                let label = format!("{}:", b.name);
                self.line(0, &label);
            }
            self.ops(1, id);
            if let Some(b) = self.block(id) {
                let term = b.term.render(self.ctx);
                self.line(1, &term);
            }
        }
    }
}

impl Function {
    pub fn header(&self, ctx: &dyn DisplayCtx) -> String {
        let args: Vec<String> =
            self.sig.args.iter().map(|(r, m)| format!("{}[{}]", ctx.reg_name(*r), fmt_const(*m))).collect();
        let rets = match &self.sig.rets {
            Some(rets) => {
                let names: Vec<String> = rets.iter().map(|r| ctx.reg_name(*r)).collect();
                format!("({})", names.join(", "))
            }
            None => "noreturn".to_string(),
        };
        format!("def {}({}) -> {}:", self.name, args.join(", "), rets)
    }

    /// Pseudo-code for the last pass, or a raw listing and the error.
    pub fn render(&self, ctx: &dyn DisplayCtx) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.header(ctx));
        if let Some(err) = &self.error {
            let _ = writeln!(out, "{INDENT}# {err}");
        }
        let Some(body) = &self.body else {
            return out;
        };
        let mut p = Printer { func: self, body, ctx, out };
        match &body.structure {
            Some(s) if self.error.is_none() => p.seq(1, s),
            _ => p.raw(),
        }
        p.out
    }
}
