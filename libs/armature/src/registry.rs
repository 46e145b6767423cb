//! Module registry and dependency resolver.
//!
//! The registry owns every registered module from `register` until process
//! end (instances may be replaced by their constructors, never removed).
//! Order resolution combines explicit name-based dependencies with implicit
//! edges derived from declared service provisions, then runs Kahn's
//! algorithm with a providers-first ready set. Name ordering is only the
//! terminal stabilizer: among ready modules, the one more depended-upon goes
//! first, so a provider always precedes its consumers even when its name
//! sorts last.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::contracts::{Capabilities, Module};
use crate::services::{short_type_name, ServiceRegistry, TypeKey};

/// One registered module and the metadata captured at registration time.
#[derive(Clone)]
pub struct ModuleSlot {
    pub name: &'static str,
    /// Short name of the module's concrete Rust type; used for service name
    /// conflict resolution.
    pub type_name: &'static str,
    pub module: Arc<dyn Module>,
    /// Capability set of the instance as originally registered.
    pub declared: Capabilities,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("module '{0}' is already registered")]
    DuplicateModule(&'static str),

    #[error("module '{module}' depends on unknown module '{depends_on}'")]
    UnknownDependency {
        module: String,
        depends_on: String,
    },

    #[error("module '{module}' requires interface {interface:?} but no registered module or service provides it")]
    UnresolvedInterface {
        module: String,
        interface: TypeKey,
    },

    #[error("cyclic module dependency: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
}

/// Registry of modules keyed by name, plus the order resolver.
#[derive(Default)]
pub struct ModuleRegistry {
    slots: RwLock<Vec<ModuleSlot>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a module. The concrete type is captured here so conflict
    /// resolution can use its short name later.
    pub fn register<M: Module>(&self, module: M) -> Result<(), ResolveError> {
        let name = module.name();
        let mut slots = self.slots.write();
        if slots.iter().any(|s| s.name == name) {
            return Err(ResolveError::DuplicateModule(name));
        }
        let module: Arc<dyn Module> = Arc::new(module);
        let declared = Capabilities::of(module.as_ref());
        slots.push(ModuleSlot {
            name,
            type_name: short_type_name(std::any::type_name::<M>()),
            module,
            declared,
        });
        Ok(())
    }

    /// Replace a module instance (constructor injection). The declared
    /// capability set is preserved for the before/after comparison.
    pub(crate) fn replace(&self, name: &str, module: Arc<dyn Module>) {
        let mut slots = self.slots.write();
        if let Some(slot) = slots.iter_mut().find(|s| s.name == name) {
            slot.module = module;
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.slots
            .read()
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.module.clone())
    }

    pub fn slot(&self, name: &str) -> Option<ModuleSlot> {
        self.slots.read().iter().find(|s| s.name == name).cloned()
    }

    pub fn slots(&self) -> Vec<ModuleSlot> {
        self.slots.read().clone()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Compute the deterministic init order.
    ///
    /// `external` lets required dependencies be satisfied by services that
    /// were registered outside any module; those contribute no graph edge.
    pub fn resolve_order(&self, external: &ServiceRegistry) -> Result<Vec<String>, ResolveError> {
        let slots = self.slots.read();
        resolve_order(&slots, external)
    }
}

struct Declared {
    name: String,
    explicit: Vec<String>,
    required_names: Vec<String>,
    required_interfaces: Vec<TypeKey>,
    provided_names: HashSet<String>,
    provided_interfaces: HashSet<TypeKey>,
}

fn resolve_order(
    slots: &[ModuleSlot],
    external: &ServiceRegistry,
) -> Result<Vec<String>, ResolveError> {
    // Collect declarations once; order resolution never calls init.
    let mut decls: Vec<Declared> = Vec::with_capacity(slots.len());
    for slot in slots {
        let mut required_names = Vec::new();
        let mut required_interfaces = Vec::new();
        for dep in slot.module.dependencies() {
            if !dep.required {
                continue;
            }
            if dep.match_by_interface {
                if let Some(iface) = dep.interface {
                    required_interfaces.push(iface);
                }
            } else {
                required_names.push(dep.name);
            }
        }
        let mut provided_names = HashSet::new();
        let mut provided_interfaces = HashSet::new();
        for provision in slot.module.provisions() {
            provided_interfaces.extend(provision.handle.interface_keys());
            provided_names.insert(provision.name);
        }
        decls.push(Declared {
            name: slot.name.to_owned(),
            explicit: slot.module.requires().iter().map(|s| (*s).to_owned()).collect(),
            required_names,
            required_interfaces,
            provided_names,
            provided_interfaces,
        });
    }

    // Index modules by name. BTreeMap keeps diagnostics deterministic.
    let index: BTreeMap<&str, usize> = decls
        .iter()
        .enumerate()
        .map(|(i, d)| (d.name.as_str(), i))
        .collect();

    // adjacency: edge provider -> consumer.
    let n = decls.len();
    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut indeg = vec![0usize; n];
    fn add_edge(adj: &mut [Vec<usize>], indeg: &mut [usize], from: usize, to: usize) {
        if from != to && !adj[from].contains(&to) {
            adj[from].push(to);
            indeg[to] += 1;
        }
    }

    for (i, decl) in decls.iter().enumerate() {
        for dep in &decl.explicit {
            let provider = *index.get(dep.as_str()).ok_or_else(|| {
                ResolveError::UnknownDependency {
                    module: decl.name.clone(),
                    depends_on: dep.clone(),
                }
            })?;
            add_edge(&mut adj, &mut indeg, provider, i);
        }
        for name in &decl.required_names {
            // Name-based service deps: edge to every module declaring that
            // name. A miss here is not fatal: the service may be registered
            // externally or during an earlier module's init, and injection
            // reports the miss with the module context.
            for (j, other) in decls.iter().enumerate() {
                if other.provided_names.contains(name) {
                    add_edge(&mut adj, &mut indeg, j, i);
                }
            }
        }
        for iface in &decl.required_interfaces {
            let mut satisfied = false;
            for (j, other) in decls.iter().enumerate() {
                if other.provided_interfaces.contains(iface) {
                    add_edge(&mut adj, &mut indeg, j, i);
                    satisfied = true;
                }
            }
            if !satisfied && external.by_interface_key(*iface).is_empty() {
                return Err(ResolveError::UnresolvedInterface {
                    module: decl.name.clone(),
                    interface: *iface,
                });
            }
        }
    }

    if let Some(path) = detect_cycle(&decls, &adj) {
        return Err(ResolveError::Cycle { path });
    }

    // Providers-first Kahn: among ready modules, prefer the one with more
    // dependents, then break the remaining tie by name. Dependent counts are
    // a pure function of the declarations, so the order is stable across
    // runs and registration orders.
    let dependents: Vec<usize> = adj.iter().map(Vec::len).collect();
    let mut ready: Vec<usize> = (0..n).filter(|&i| indeg[i] == 0).collect();
    let by_bias = |a: &usize, b: &usize| {
        dependents[*b]
            .cmp(&dependents[*a])
            .then_with(|| decls[*a].name.cmp(&decls[*b].name))
    };
    ready.sort_by(by_bias);

    let mut order = Vec::with_capacity(n);
    while !ready.is_empty() {
        let u = ready.remove(0);
        order.push(decls[u].name.clone());
        let mut unlocked = Vec::new();
        for &w in &adj[u] {
            indeg[w] -= 1;
            if indeg[w] == 0 {
                unlocked.push(w);
            }
        }
        ready.extend(unlocked);
        ready.sort_by(by_bias);
    }

    tracing::debug!(order = ?order, "module dependency order resolved");
    Ok(order)
}

/// DFS with gray/black coloring; returns the closed cycle path when found.
fn detect_cycle(decls: &[Declared], adj: &[Vec<usize>]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unseen,
        Active,
        Done,
    }

    fn walk(
        node: usize,
        decls: &[Declared],
        adj: &[Vec<usize>],
        marks: &mut [Mark],
        trail: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        marks[node] = Mark::Active;
        trail.push(node);

        for &next in &adj[node] {
            match marks[next] {
                Mark::Active => {
                    let start = trail.iter().position(|&t| t == next)?;
                    let mut path: Vec<String> =
                        trail[start..].iter().map(|&i| decls[i].name.clone()).collect();
                    path.push(decls[next].name.clone());
                    return Some(path);
                }
                Mark::Unseen => {
                    if let Some(path) = walk(next, decls, adj, marks, trail) {
                        return Some(path);
                    }
                }
                Mark::Done => {}
            }
        }

        trail.pop();
        marks[node] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::Unseen; decls.len()];
    let mut trail = Vec::new();
    for i in 0..decls.len() {
        if marks[i] == Mark::Unseen {
            if let Some(path) = walk(i, decls, adj, &mut marks, &mut trail) {
                return Some(path);
            }
        }
    }
    None
}
