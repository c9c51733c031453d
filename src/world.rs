//! Process-wide scheduling state: the function arena, address-space domains
//! and the dirty set driving everything to a fixpoint.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::WorldError;
use crate::func::{self, Function};
use crate::image::Section;
use crate::isa::{Isa, RegId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

impl FuncId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(pub u32);

#[derive(Clone, Debug)]
pub struct WorldConfig {
    /// How many times one function may be processed before the engine gives
    /// up on it.
    pub max_passes: u32,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self { max_passes: 64 }
    }
}

/// One address space, with its mapped sections and attached functions.
pub struct Domain {
    pub isa: Arc<dyn Isa>,
    /// Sections by memory space name.
    pub sections: BTreeMap<String, Vec<Arc<Section>>>,
    /// Objects attached at `(space, address)`.
    pub objects: BTreeMap<(String, u64), FuncId>,
}

impl Domain {
    pub fn find_section(&self, space: &str, addr: u64) -> Option<&Arc<Section>> {
        self.sections.get(space)?.iter().find(|s| s.contains(addr))
    }
}

#[derive(Default)]
pub struct World {
    pub config: WorldConfig,
    pub funcs: Vec<Function>,
    pub domains: Vec<Domain>,
    dirty: BTreeSet<FuncId>,
}

impl World {
    pub fn new(config: WorldConfig) -> Self {
        Self { config, ..Default::default() }
    }

    pub fn add_domain(&mut self, isa: Arc<dyn Isa>) -> DomainId {
        self.domains.push(Domain { isa, sections: BTreeMap::new(), objects: BTreeMap::new() });
        DomainId(self.domains.len() as u32 - 1)
    }

    pub fn domain(&self, id: DomainId) -> &Domain {
        &self.domains[id.0 as usize]
    }

    /// Maps `section` into the domain's code space.
    pub fn add_code(&mut self, dom: DomainId, section: Section) {
        let space = self.domain(dom).isa.code_space().name.clone();
        self.add_section(dom, &space, section);
    }

    pub fn add_section(&mut self, dom: DomainId, space: &str, section: Section) {
        self.domains[dom.0 as usize]
            .sections
            .entry(space.to_string())
            .or_default()
            .push(Arc::new(section));
    }

    pub fn func(&self, id: FuncId) -> &Function {
        &self.funcs[id.index()]
    }

    pub fn func_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.funcs[id.index()]
    }

    /// The function starting at `addr`, created on first reference. `None`
    /// when no code section maps the address.
    pub fn find_function(&mut self, dom: DomainId, addr: u64) -> Option<FuncId> {
        let d = self.domain(dom);
        let space = d.isa.code_space().name.clone();
        if let Some(id) = d.objects.get(&(space.clone(), addr)) {
            return Some(*id);
        }
        let section = d.find_section(&space, addr)?.clone();
        let id = FuncId(self.funcs.len() as u32);
        self.funcs.push(Function::new(format!("func_{addr:x}"), dom, section, addr));
        self.domains[dom.0 as usize].objects.insert((space, addr), id);
        debug!(func = id.0, addr, "new function");
        self.mark_dirty(id);
        Some(id)
    }

    /// Like [`World::find_function`], renaming the function when `name` is
    /// given.
    pub fn add_function(&mut self, dom: DomainId, addr: u64, name: Option<&str>) -> Option<FuncId> {
        let id = self.find_function(dom, addr)?;
        if let Some(name) = name {
            self.func_mut(id).name = name.to_string();
        }
        Some(id)
    }

    pub fn is_dirty(&self, id: FuncId) -> bool {
        self.func(id).dirty
    }

    pub fn mark_dirty(&mut self, id: FuncId) {
        let f = self.func_mut(id);
        if !f.dirty {
            f.dirty = true;
            self.dirty.insert(id);
        }
    }

    /// Asks for `reg` (bits in `mask`) to be returned by `id`.
    pub fn want_reg(&mut self, id: FuncId, reg: RegId, mask: i64) {
        let f = self.func_mut(id);
        let cur = f.wanted.get(&reg).copied().unwrap_or(0);
        if cur | mask != cur {
            f.wanted.insert(reg, cur | mask);
            debug!(func = %f.name, reg = reg.0, mask = cur | mask, "return interest grew");
            self.mark_dirty(id);
        }
    }

    /// Processes `id` right away if it is dirty and not already running.
    pub fn try_process(&mut self, id: FuncId) {
        let f = self.func(id);
        if f.dirty && !f.inproc {
            self.dirty.remove(&id);
            self.run(id);
        }
    }

    fn run(&mut self, id: FuncId) {
        let max = self.config.max_passes;
        let f = self.func_mut(id);
        f.dirty = false;
        if f.passes >= max {
            if !f.stalled {
                warn!(func = %f.name, passes = f.passes, "pass limit reached");
            }
            f.stalled = true;
            return;
        }
        f.passes += 1;
        f.inproc = true;
        func::process(self, id);
        self.func_mut(id).inproc = false;
    }

    /// Drains the dirty set.
    pub fn process(&mut self) -> Result<(), WorldError> {
        while let Some(id) = self.dirty.pop_first() {
            self.run(id);
        }
        info!(funcs = self.funcs.len(), "world settled");
        match self.funcs.iter().find(|f| f.stalled) {
            Some(f) => Err(WorldError::NonConvergent { func: f.name.clone(), passes: f.passes }),
            None => Ok(()),
        }
    }

    /// Publishes the function's current signature, re-dirtying its callers
    /// when it changed.
    pub fn update_sig(&mut self, id: FuncId) {
        let f = self.func_mut(id);
        if f.prevsig.as_ref() == Some(&f.sig) {
            return;
        }
        debug!(func = %f.name, sig = ?f.sig, "signature changed");
        f.prevsig = Some(f.sig.clone());
        let deps: Vec<FuncId> = f.deps.iter().copied().collect();
        for dep in deps {
            self.mark_dirty(dep);
        }
    }
}
