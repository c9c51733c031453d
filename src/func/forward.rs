use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::debug;

use super::{BlockId, Pass};
use crate::isa::RegId;
use crate::var::{Value, Var};

type Links = BTreeMap<Value, BTreeSet<Value>>;

/// Members of `class` that every path from the other roots must cross
/// `v` to reach, `v` included.
fn shadow(v: Value, class: &[Value], next: &Links, roots: &BTreeSet<Value>) -> Vec<Value> {
    let mut marked: BTreeSet<Value> = roots.iter().copied().filter(|r| *r != v).collect();
    let mut queue: VecDeque<Value> = marked.iter().copied().collect();
    while let Some(n) = queue.pop_front() {
        for s in next.get(&n).into_iter().flatten() {
            if *s != v && marked.insert(*s) {
                queue.push_back(*s);
            }
        }
    }
    class.iter().copied().filter(|m| !marked.contains(m)).collect()
}

impl Pass<'_> {
    /// Collapses block inputs onto the value that reaches them along every
    /// path: a single definition, or the merge input all paths pass through.
    pub(super) fn forward_ins(&mut self) {
        let mut edges: Vec<(Value, Var)> = Vec::new();
        let mut inputs: Vec<(BlockId, RegId, Var, Vec<(BlockId, usize)>)> = Vec::new();
        for (id, b) in &self.blocks {
            let ins: Vec<(BlockId, usize)> = b.ins.iter().copied().collect();
            for (reg, var) in &b.inregs {
                inputs.push((*id, *reg, *var, ins.clone()));
            }
        }
        for (_, reg, var, ins) in inputs {
            for (p, idx) in ins {
                if let Some(src) = self.get_out(p, idx, reg) {
                    edges.push((src, var));
                }
            }
        }

        let mut vnext = Links::new();
        let mut vprev = Links::new();
        for (src, dst) in &edges {
            vnext.entry(*src).or_default().insert(Value::Var(*dst));
            vprev.entry(Value::Var(*dst)).or_default().insert(*src);
        }

        // Colour classes over the undirected edge graph.
        let mut colour: BTreeMap<Value, usize> = BTreeMap::new();
        let mut classes: Vec<Vec<Value>> = Vec::new();
        let nodes: BTreeSet<Value> = vnext.keys().chain(vprev.keys()).copied().collect();
        for start in &nodes {
            if colour.contains_key(start) {
                continue;
            }
            let c = classes.len();
            let mut class = vec![*start];
            colour.insert(*start, c);
            let mut queue = VecDeque::from([*start]);
            while let Some(v) = queue.pop_front() {
                for n in vnext.get(&v).into_iter().chain(vprev.get(&v)).flatten() {
                    if !colour.contains_key(n) {
                        colour.insert(*n, c);
                        class.push(*n);
                        queue.push_back(*n);
                    }
                }
            }
            classes.push(class);
        }

        let mut subst: BTreeMap<Var, Value> = BTreeMap::new();
        for class in &classes {
            // An input nothing feeds is as good as a definition.
            let roots: BTreeSet<Value> = class
                .iter()
                .filter(|v| match v {
                    Value::Var(var) if var.is_in() => !vprev.contains_key(v),
                    _ => true,
                })
                .copied()
                .collect();
            match roots.len() {
                0 => continue,
                1 => {
                    let root = roots.iter().copied().next();
                    for v in class {
                        if let (Some(root), Value::Var(var)) = (root, v) {
                            if !roots.contains(v) {
                                subst.insert(*var, root);
                            }
                        }
                    }
                }
                _ => {
                    let mut shadows: Vec<(Value, Vec<Value>)> =
                        class.iter().map(|v| (*v, shadow(*v, class, &vnext, &roots))).collect();
                    shadows.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
                    for (owner, members) in shadows {
                        for m in members {
                            if let Value::Var(var) = m {
                                if m != owner {
                                    subst.entry(var).or_insert(owner);
                                }
                            }
                        }
                    }
                }
            }
        }
        if subst.is_empty() {
            return;
        }
        debug!(func = %self.name, forwarded = subst.len(), "forwarded inputs");

        let mut dropped: Vec<(BlockId, Vec<RegId>)> = Vec::new();
        for (id, b) in self.blocks.iter_mut() {
            let gone = b.subst_values(&subst);
            if !gone.is_empty() {
                dropped.push((*id, gone));
            }
        }
        for (id, gone) in dropped {
            let ins: Vec<(BlockId, usize)> = self.blocks.get(&id).map(|b| b.ins.iter().copied().collect()).unwrap_or_default();
            for (p, idx) in ins {
                if let Some(regs) = self.blocks.get_mut(&p).and_then(|pb| pb.outregs.get_mut(idx)) {
                    for r in &gone {
                        regs.remove(r);
                    }
                }
            }
        }
    }
}
