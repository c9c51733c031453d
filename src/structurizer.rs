//! CFG to structured statement tree.
//!
//! A DFS classifies edges (back edges make loop headers, cross edges to
//! finished nodes make if-joins at their lowest common ancestor), then a
//! second walk emits sequences, ifs bounded by their joins, loops bounded by
//! their exits, and `Goto` for whatever is left.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::trace;

/// What the structurizer needs to know about a graph.
pub trait FlowGraph {
    type Node: Copy + Ord + fmt::Debug;

    fn entry(&self) -> Self::Node;

    /// Successor slots in order; `None` is an edge leaving the graph.
    fn succs(&self, node: Self::Node) -> Vec<Option<Self::Node>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Stmt<N> {
    Block(N),
    /// Branch on `node`, one arm per successor slot, resuming at `join`.
    If { node: N, join: Option<N>, arms: Vec<Seq<N>> },
    Loop(Seq<N>),
    Goto(N),
    Continue,
    Break,
}

pub type Seq<N> = Vec<Stmt<N>>;

#[derive(Clone, Debug)]
pub struct Structure<N> {
    pub body: Seq<N>,
    /// Every node the DFS reached.
    pub reachable: BTreeSet<N>,
    /// Nodes emitted as `Block` or `If`.
    pub used: BTreeSet<N>,
    /// Nodes some `Goto` points at.
    pub labels: BTreeSet<N>,
}

struct Walk<'g, G: FlowGraph> {
    g: &'g G,
    depth: BTreeMap<G::Node, usize>,
    parent: BTreeMap<G::Node, G::Node>,
    /// Innermost loop header per node; a header maps to itself.
    lp: BTreeMap<G::Node, G::Node>,
    /// Enclosing loop of each loop header.
    outer: BTreeMap<G::Node, G::Node>,
    join: BTreeMap<G::Node, G::Node>,
    brk: BTreeMap<G::Node, G::Node>,
    used: BTreeSet<G::Node>,
    labels: BTreeSet<G::Node>,
}

pub fn structure<G: FlowGraph>(g: &G) -> Structure<G::Node> {
    let mut w = Walk {
        g,
        depth: BTreeMap::new(),
        parent: BTreeMap::new(),
        lp: BTreeMap::new(),
        outer: BTreeMap::new(),
        join: BTreeMap::new(),
        brk: BTreeMap::new(),
        used: BTreeSet::new(),
        labels: BTreeSet::new(),
    };
    let reachable = w.classify();
    let body = w.seq(Some(g.entry()), None, None, None).0;
    Structure { body, reachable, used: w.used, labels: w.labels }
}

impl<G: FlowGraph> Walk<'_, G> {
    fn d(&self, n: Option<G::Node>) -> i64 {
        n.and_then(|n| self.depth.get(&n)).map_or(-1, |d| *d as i64)
    }

    fn loop_of(&self, n: G::Node) -> Option<G::Node> {
        self.lp.get(&n).copied()
    }

    /// Marks the tree path from `from` up to (not including) `header` as
    /// belonging to that loop, unless a deeper loop already claims a node.
    fn claim(&mut self, from: G::Node, header: G::Node) {
        let hd = self.d(Some(header));
        let mut c = from;
        while c != header {
            if self.d(self.loop_of(c)) < hd {
                self.lp.insert(c, header);
            } else if self.loop_of(c) == Some(c) && self.d(self.outer.get(&c).copied()) < hd {
                self.outer.insert(c, header);
            }
            match self.parent.get(&c) {
                Some(p) => c = *p,
                None => break,
            }
        }
    }

    fn classify(&mut self) -> BTreeSet<G::Node> {
        let entry = self.g.entry();
        let mut stack = vec![(entry, 0usize)];
        let mut active = BTreeSet::from([entry]);
        let mut done = BTreeSet::new();
        let mut joins = Vec::new();
        let mut edges = Vec::new();
        self.depth.insert(entry, 0);

        while let Some((b, idx)) = stack.pop() {
            let succs = self.g.succs(b);
            if idx >= succs.len() {
                active.remove(&b);
                done.insert(b);
                continue;
            }
            stack.push((b, idx + 1));
            let Some(n) = succs[idx] else { continue };
            edges.push((b, n));
            if done.contains(&n) {
                joins.push((b, n));
                // a join may still sit inside a loop that is open on the path
                let mut tl = n;
                while let Some(l) = self.loop_of(tl) {
                    if active.contains(&l) {
                        break;
                    }
                    match self.parent.get(&tl) {
                        Some(p) => tl = *p,
                        None => break,
                    }
                }
                if let Some(l) = self.loop_of(tl).filter(|l| active.contains(l)) {
                    self.claim(b, l);
                }
            } else if active.contains(&n) {
                if let Some(prev) = self.lp.insert(n, n).filter(|p| *p != n) {
                    self.outer.insert(n, prev);
                }
                self.claim(b, n);
            } else {
                self.depth.insert(n, stack.len());
                self.parent.insert(n, b);
                stack.push((n, 0));
                active.insert(n);
            }
        }

        for (a, b) in joins {
            let Some(split) = self.lca(a, b) else { continue };
            if self.loop_of(split) == self.nest(b) && self.d(self.join.get(&split).copied()) < self.d(Some(b)) {
                self.join.insert(split, b);
            }
        }

        // loop exits: the deepest target of an edge leaving the loop
        for (a, b) in edges {
            let Some(l) = self.loop_of(a) else { continue };
            if b == l || self.in_loop(b, l) {
                continue;
            }
            if self.d(self.brk.get(&l).copied()) < self.d(Some(b)) {
                self.brk.insert(l, b);
            }
        }
        trace!(loops = ?self.lp, joins = ?self.join, breaks = ?self.brk, "classified");
        done
    }

    /// The loop `n` sits in, not counting the one it heads.
    fn nest(&self, n: G::Node) -> Option<G::Node> {
        match self.loop_of(n) {
            Some(h) if h == n => self.outer.get(&n).copied(),
            l => l,
        }
    }

    fn in_loop(&self, n: G::Node, header: G::Node) -> bool {
        let mut cur = self.loop_of(n);
        while let Some(h) = cur {
            if h == header {
                return true;
            }
            cur = self.outer.get(&h).copied();
        }
        false
    }

    fn lca(&self, mut a: G::Node, mut b: G::Node) -> Option<G::Node> {
        while self.d(Some(a)) > self.d(Some(b)) {
            a = *self.parent.get(&a)?;
        }
        while self.d(Some(b)) > self.d(Some(a)) {
            b = *self.parent.get(&b)?;
        }
        while a != b {
            a = *self.parent.get(&a)?;
            b = *self.parent.get(&b)?;
        }
        Some(a)
    }

    /// Emits the run starting at `block`. The flag tells whether the run
    /// ended by reaching `join`.
    fn seq(
        &mut self,
        mut block: Option<G::Node>,
        join: Option<G::Node>,
        cont: Option<G::Node>,
        brk: Option<G::Node>,
    ) -> (Seq<G::Node>, bool) {
        let mut res = Vec::new();
        let entry = block;
        while let Some(b) = block {
            if Some(b) == brk {
                res.push(Stmt::Break);
                return (res, false);
            }
            let used = self.used.contains(&b);
            if used || entry != cont {
                if Some(b) == join {
                    return (res, true);
                } else if Some(b) == cont {
                    res.push(Stmt::Continue);
                    return (res, false);
                }
            }
            if used {
                self.labels.insert(b);
                res.push(Stmt::Goto(b));
                return (res, false);
            }
            let succs = self.g.succs(b);
            if self.loop_of(b) == Some(b) && cont != Some(b) {
                let sbrk = self.brk.get(&b).copied().or(join);
                let (body, _) = self.seq(Some(b), Some(b), Some(b), sbrk);
                res.push(Stmt::Loop(body));
                block = sbrk;
            } else if succs.len() <= 1 {
                self.used.insert(b);
                res.push(Stmt::Block(b));
                block = succs.first().copied().flatten();
            } else {
                self.used.insert(b);
                let mut sjoin = self.join.get(&b).copied().or(join);
                let mut arms = Vec::with_capacity(succs.len());
                let mut joined = false;
                for out in succs {
                    let (arm, ju) = self.seq(out, sjoin, cont, brk);
                    joined |= ju;
                    arms.push(arm);
                }
                if !joined {
                    sjoin = None;
                }
                res.push(Stmt::If { node: b, join: sjoin, arms });
                block = sjoin;
            }
        }
        (res, false)
    }
}
