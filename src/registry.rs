//! The live module registry.
//!
//! A single mutex (owned by the [`Context`](crate::Context)) serializes the
//! modules map, the symbol map, the namespace accounting and the dependency
//! graph. The graph stores module names by stable index and edges from
//! dependent to provider; strong references live only in the modules map
//! and in each dependent's own dependency map.

use crate::error::{
    busy, cycle_error, duplicate, invalid_argument, not_found, permission_denied,
};
use crate::export::MODIFIER_DEPENDENCY;
use crate::info::{
    DependencyLink, LockedSymbol, ModuleInfo, ModuleType, NamespaceUse, SymbolKey,
};
use crate::param::{ParamAccess, ParamCell, ParamType, ParamValue};
use crate::version::Version;
use crate::Result;
use indexmap::{IndexMap, IndexSet};
use petgraph::algo::{has_path_connecting, is_cyclic_directed};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;
use std::sync::Arc;

/// How a dependency edge came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DepKind {
    /// Established during construction; immutable for the module's life.
    Static,
    /// Added later through `link`; removable through `unlink`.
    Dynamic,
}

pub(crate) struct ModuleEntry {
    pub info: ModuleInfo,
    pub node: NodeIndex,
}

pub(crate) struct SymbolEntry {
    pub version: Version,
    /// The symbol map indirects through the modules map by name.
    pub owner: String,
}

#[derive(Default)]
pub(crate) struct NamespaceEntry {
    /// Symbols exported into the namespace.
    pub symbol_count: usize,
    /// Modules that included the namespace.
    pub reference_count: usize,
}

pub(crate) struct RegistryState {
    pub modules: IndexMap<String, ModuleEntry>,
    pub symbols: IndexMap<SymbolKey, SymbolEntry>,
    pub namespaces: IndexMap<String, NamespaceEntry>,
    pub graph: StableDiGraph<String, DepKind>,
    pub is_loading: bool,
}

/// What a module contributes to the global maps, snapshotted under its
/// info mutex.
struct Contribution {
    exports: Vec<(SymbolKey, Version)>,
    includes: Vec<String>,
    dependencies: IndexSet<String>,
}

impl RegistryState {
    pub(crate) fn new() -> Self {
        Self {
            modules: IndexMap::new(),
            symbols: IndexMap::new(),
            namespaces: IndexMap::new(),
            graph: StableDiGraph::new(),
            is_loading: false,
        }
    }

    fn contribution(&self, info: &ModuleInfo) -> Result<Contribution> {
        info.with_live(|live| {
            let mut dependencies: IndexSet<String> =
                live.dependencies.keys().cloned().collect();
            if let Some(record) = live.record {
                for modifier in record.modifiers() {
                    if modifier.tag == MODIFIER_DEPENDENCY && !modifier.value.is_null() {
                        // Safety: validation guaranteed a raw strong
                        // module-info reference.
                        let target = unsafe { ModuleInfo::borrow_raw(modifier.value) };
                        dependencies.insert(target.name().to_string());
                    }
                }
            }
            Ok(Contribution {
                exports: live
                    .symbols
                    .iter()
                    .map(|(key, cell)| (key.clone(), cell.version()))
                    .collect(),
                includes: live.namespaces.keys().cloned().collect(),
                dependencies,
            })
        })
    }

    fn entry_of(&self, info: &ModuleInfo) -> Result<&ModuleEntry> {
        self.modules
            .get(info.name())
            .filter(|entry| entry.info.ptr_eq(info))
            .ok_or_else(|| not_found(format!("module `{}` is not registered", info.name())))
    }

    /// Commits a built module. All-or-nothing: a failure at any step leaves
    /// the registry as it was.
    pub(crate) fn add(&mut self, info: &ModuleInfo) -> Result<()> {
        let name = info.name().to_string();
        if self.modules.contains_key(&name) {
            return Err(duplicate(format!("a module named `{name}` is already loaded")));
        }
        let contribution = self.contribution(info)?;

        for (key, _) in &contribution.exports {
            if self.symbols.contains_key(key) {
                return Err(duplicate(format!("symbol `{key}` is already exported")));
            }
        }
        for namespace in &contribution.includes {
            if !self.namespaces.contains_key(namespace) {
                return Err(not_found(format!(
                    "imported namespace `{namespace}` does not exist"
                )));
            }
        }
        let mut dependency_nodes = Vec::with_capacity(contribution.dependencies.len());
        for dependency in &contribution.dependencies {
            let entry = self.modules.get(dependency).ok_or_else(|| {
                not_found(format!("dependency `{dependency}` is not loaded"))
            })?;
            dependency_nodes.push(entry.node);
        }

        let node = self.graph.add_node(name.clone());
        for dependency in dependency_nodes {
            self.graph.add_edge(node, dependency, DepKind::Static);
        }
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_node(node);
            return Err(cycle_error(format!(
                "adding module `{name}` would close a dependency cycle"
            )));
        }

        // The remaining steps cannot fail; mutations from here on need no
        // rollback.
        for namespace in &contribution.includes {
            self.namespaces[namespace].reference_count += 1;
        }
        for (key, version) in contribution.exports {
            if !key.namespace.is_empty() {
                self.namespaces
                    .entry(key.namespace.clone())
                    .or_default()
                    .symbol_count += 1;
            }
            self.symbols.insert(
                key,
                SymbolEntry {
                    version,
                    owner: name.clone(),
                },
            );
        }
        log::info!("Registered module [{name}]");
        self.modules.insert(
            name,
            ModuleEntry {
                info: info.clone(),
                node,
            },
        );
        Ok(())
    }

    /// Explains why `info` cannot be removed, or confirms that it can.
    pub(crate) fn removable(&self, info: &ModuleInfo) -> Result<()> {
        let entry = self.entry_of(info)?;
        if self
            .graph
            .neighbors_directed(entry.node, Direction::Incoming)
            .next()
            .is_some()
        {
            return Err(busy(format!(
                "module `{}` is depended upon",
                info.name()
            )));
        }
        if info.has_locked_exports() {
            return Err(busy(format!(
                "module `{}` has locked exported symbols",
                info.name()
            )));
        }
        if info.unload_locks() > 0 {
            return Err(busy(format!(
                "module `{}` holds unload locks",
                info.name()
            )));
        }

        // Removing the module must not leave a namespace that is referenced
        // but no longer backed by any symbol.
        let contribution = self.contribution(info)?;
        let mut symbol_deltas: IndexMap<&str, usize> = IndexMap::new();
        for (key, _) in &contribution.exports {
            if !key.namespace.is_empty() {
                *symbol_deltas.entry(key.namespace.as_str()).or_default() += 1;
            }
        }
        for (namespace, delta) in symbol_deltas {
            let entry = &self.namespaces[namespace];
            let own_reference = contribution
                .includes
                .iter()
                .any(|included| included == namespace) as usize;
            let symbols_left = entry.symbol_count - delta;
            let references_left = entry.reference_count - own_reference;
            if symbols_left == 0 && references_left > 0 {
                return Err(busy(format!(
                    "namespace `{namespace}` is still included by other modules"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn can_remove(&self, info: &ModuleInfo) -> bool {
        self.removable(info).is_ok()
    }

    /// Removes a module from every map and the graph. The caller detaches
    /// the info afterwards, outside the registry mutex.
    pub(crate) fn remove(&mut self, info: &ModuleInfo) -> Result<()> {
        self.removable(info)?;
        let contribution = self.contribution(info)?;
        let entry = self
            .modules
            .shift_remove(info.name())
            .expect("checked by removable");

        for (key, _) in &contribution.exports {
            self.symbols.shift_remove(key);
            if !key.namespace.is_empty() {
                self.namespaces[key.namespace.as_str()].symbol_count -= 1;
            }
        }
        for namespace in &contribution.includes {
            self.namespaces[namespace.as_str()].reference_count -= 1;
        }
        self.namespaces
            .retain(|_, entry| entry.symbol_count + entry.reference_count > 0);

        self.graph.remove_node(entry.node);
        log::info!("Removed module [{}]", info.name());
        Ok(())
    }

    /// Adds a dynamic dependency link `a -> b`.
    pub(crate) fn link(&mut self, a: &ModuleInfo, b: &ModuleInfo) -> Result<()> {
        if b.module_type() == ModuleType::Pseudo {
            return Err(permission_denied(format!(
                "pseudo module `{}` cannot be a dependency target",
                b.name()
            )));
        }
        let node_a = self.entry_of(a)?.node;
        let node_b = self.entry_of(b)?.node;
        if a.has_dependency(b.name()) {
            return Err(duplicate(format!(
                "`{}` already depends on `{}`",
                a.name(),
                b.name()
            )));
        }
        if has_path_connecting(&self.graph, node_b, node_a, None) {
            return Err(cycle_error(format!(
                "linking `{}` to `{}` would close a dependency cycle",
                a.name(),
                b.name()
            )));
        }
        a.with_live(|live| {
            live.dependencies.insert(
                b.name().to_string(),
                DependencyLink {
                    info: b.clone(),
                    static_link: false,
                },
            );
            Ok(())
        })?;
        self.graph.add_edge(node_a, node_b, DepKind::Dynamic);
        log::debug!("Linked [{}] -> [{}]", a.name(), b.name());
        Ok(())
    }

    /// Removes a dynamic dependency link `a -> b`. Static links are part of
    /// the module's construction and cannot be removed.
    pub(crate) fn unlink(&mut self, a: &ModuleInfo, b: &ModuleInfo) -> Result<()> {
        let node_a = self.entry_of(a)?.node;
        let node_b = self.entry_of(b)?.node;
        a.with_live(|live| {
            let link = live.dependencies.get(b.name()).ok_or_else(|| {
                not_found(format!("`{}` does not depend on `{}`", a.name(), b.name()))
            })?;
            if link.static_link {
                return Err(permission_denied(format!(
                    "dependency of `{}` on `{}` is static",
                    a.name(),
                    b.name()
                )));
            }
            live.dependencies.shift_remove(b.name());
            Ok(())
        })?;
        if let Some(edge) = self.graph.find_edge(node_a, node_b) {
            self.graph.remove_edge(edge);
        }
        log::debug!("Unlinked [{}] -> [{}]", a.name(), b.name());
        Ok(())
    }

    pub(crate) fn find_module(&self, name: &str) -> Result<ModuleInfo> {
        self.modules
            .get(name)
            .map(|entry| entry.info.clone())
            .ok_or_else(|| not_found(format!("no module named `{name}`")))
    }

    pub(crate) fn find_module_by_symbol(
        &self,
        name: &str,
        namespace: &str,
        required: &Version,
    ) -> Result<ModuleInfo> {
        let key = SymbolKey::new(name, namespace);
        let entry = self
            .symbols
            .get(&key)
            .filter(|entry| entry.version.is_compatible_with(required))
            .ok_or_else(|| {
                not_found(format!("no symbol `{key}` at version {required}"))
            })?;
        self.find_module(&entry.owner)
    }

    pub(crate) fn namespace_exists(&self, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
    }

    /// Dynamically includes `namespace` into `module`.
    pub(crate) fn acquire_namespace(&mut self, module: &ModuleInfo, namespace: &str) -> Result<()> {
        if namespace.is_empty() {
            return Err(invalid_argument("the global namespace is always included"));
        }
        if !self.namespaces.contains_key(namespace) {
            return Err(not_found(format!("no namespace `{namespace}`")));
        }
        module.with_live(|live| {
            if live.namespaces.contains_key(namespace) {
                return Err(duplicate(format!(
                    "`{}` already includes namespace `{namespace}`",
                    module.name()
                )));
            }
            live.namespaces
                .insert(namespace.to_string(), NamespaceUse { static_link: false });
            Ok(())
        })?;
        self.namespaces[namespace].reference_count += 1;
        Ok(())
    }

    /// Releases a dynamically included namespace.
    pub(crate) fn release_namespace(&mut self, module: &ModuleInfo, namespace: &str) -> Result<()> {
        module.with_live(|live| {
            let included = live.namespaces.get(namespace).ok_or_else(|| {
                not_found(format!(
                    "`{}` does not include namespace `{namespace}`",
                    module.name()
                ))
            })?;
            if included.static_link {
                return Err(permission_denied(format!(
                    "namespace `{namespace}` was included at construction"
                )));
            }
            live.namespaces.shift_remove(namespace);
            Ok(())
        })?;
        let entry = &mut self.namespaces[namespace];
        entry.reference_count -= 1;
        if entry.symbol_count == 0 && entry.reference_count == 0 {
            self.namespaces.shift_remove(namespace);
        }
        Ok(())
    }

    /// Locks and returns a provider's exported symbol on behalf of
    /// `caller`. The caller must hold a dependency link to the provider and
    /// have included the symbol's namespace.
    pub(crate) fn load_symbol(
        &self,
        caller: &ModuleInfo,
        name: &str,
        namespace: &str,
        required: &Version,
    ) -> Result<LockedSymbol> {
        let key = SymbolKey::new(name, namespace);
        let entry = self.symbols.get(&key).ok_or_else(|| {
            not_found(format!("no symbol `{key}` in the registry"))
        })?;
        if !entry.version.is_compatible_with(required) {
            return Err(not_found(format!(
                "symbol `{key}` is at {} which does not satisfy {required}",
                entry.version
            )));
        }
        // A module is not its own dependency.
        if entry.owner == caller.name() {
            return Err(not_found(format!(
                "`{}` cannot load its own symbol `{key}`",
                caller.name()
            )));
        }
        if !caller.has_dependency(&entry.owner) {
            return Err(not_found(format!(
                "`{}` does not depend on `{}`",
                caller.name(),
                entry.owner
            )));
        }
        if !namespace.is_empty() && !caller.includes_namespace(namespace) {
            return Err(permission_denied(format!(
                "`{}` has not included namespace `{namespace}`",
                caller.name()
            )));
        }
        let provider = self.find_module(&entry.owner)?;
        provider.with_live(|live| {
            let cell = live.symbols.get(&key).ok_or_else(|| {
                not_found(format!("provider `{}` lost symbol `{key}`", entry.owner))
            })?;
            LockedSymbol::acquire(cell)
        })
    }

    /// Picks one loose module: a Regular module nothing references beyond
    /// the registry itself, with `can_remove` satisfied. Removes it from
    /// the maps and hands it back for detaching.
    pub(crate) fn take_loose_module(&mut self) -> Option<ModuleInfo> {
        let info = self.modules.values().find_map(|entry| {
            (entry.info.module_type() == ModuleType::Regular
                && entry.info.strong_count() == 1
                && self.can_remove(&entry.info))
            .then(|| entry.info.clone())
        })?;
        log::debug!("Cleaning up loose module [{}]", info.name());
        self.remove(&info).ok().map(|_| info)
    }

    fn param_cell(&self, module: &str, param: &str) -> Result<(ModuleInfo, Arc<ParamCell>)> {
        let owner = self.find_module(module)?;
        let cell = owner.with_live(|live| {
            live.params.get(param).cloned().ok_or_else(|| {
                not_found(format!("module `{module}` has no parameter `{param}`"))
            })
        })?;
        Ok((owner, cell))
    }

    /// Type and access groups of a parameter.
    pub(crate) fn query_param(
        &self,
        module: &str,
        param: &str,
    ) -> Result<(ParamType, ParamAccess, ParamAccess)> {
        let (_, cell) = self.param_cell(module, param)?;
        Ok((cell.param_type(), cell.read_access(), cell.write_access()))
    }

    /// Reads `cell` under the owner's info mutex, as the hook contract
    /// requires.
    fn read_locked(owner: &ModuleInfo, cell: &ParamCell) -> Result<ParamValue> {
        owner.with_live(|_| Ok(cell.read_hooked().0))
    }

    fn write_locked(owner: &ModuleInfo, cell: &ParamCell, value: ParamValue) -> Result<()> {
        owner.with_live(|_| cell.write_hooked(value))
    }

    pub(crate) fn param_get_public(&self, module: &str, param: &str) -> Result<ParamValue> {
        let (owner, cell) = self.param_cell(module, param)?;
        if !cell.can_read_public() {
            return Err(cell.denied("public read"));
        }
        Self::read_locked(&owner, &cell)
    }

    pub(crate) fn param_set_public(
        &self,
        module: &str,
        param: &str,
        value: ParamValue,
    ) -> Result<()> {
        let (owner, cell) = self.param_cell(module, param)?;
        if !cell.can_write_public() {
            return Err(cell.denied("public write"));
        }
        Self::write_locked(&owner, &cell, value)
    }

    pub(crate) fn param_get_dependency(
        &self,
        caller: &ModuleInfo,
        module: &str,
        param: &str,
    ) -> Result<ParamValue> {
        let (owner, cell) = self.param_cell(module, param)?;
        if !cell.can_read_dependency(caller) {
            return Err(cell.denied("dependency read"));
        }
        Self::read_locked(&owner, &cell)
    }

    pub(crate) fn param_set_dependency(
        &self,
        caller: &ModuleInfo,
        module: &str,
        param: &str,
        value: ParamValue,
    ) -> Result<()> {
        let (owner, cell) = self.param_cell(module, param)?;
        if !cell.can_write_dependency(caller) {
            return Err(cell.denied("dependency write"));
        }
        Self::write_locked(&owner, &cell, value)
    }

    pub(crate) fn param_get_private(
        &self,
        caller: &ModuleInfo,
        module: &str,
        param: &str,
    ) -> Result<ParamValue> {
        let (owner, cell) = self.param_cell(module, param)?;
        if !cell.can_read_private(caller) {
            return Err(cell.denied("private read"));
        }
        Self::read_locked(&owner, &cell)
    }

    pub(crate) fn param_set_private(
        &self,
        caller: &ModuleInfo,
        module: &str,
        param: &str,
        value: ParamValue,
    ) -> Result<()> {
        let (owner, cell) = self.param_cell(module, param)?;
        if !cell.can_write_private(caller) {
            return Err(cell.denied("private write"));
        }
        Self::write_locked(&owner, &cell, value)
    }

    /// Checks the registry-wide invariants; intended for diagnostics and
    /// tests.
    pub(crate) fn verify_integrity(&self) -> Result<()> {
        if is_cyclic_directed(&self.graph) {
            return Err(invalid_argument("dependency graph is cyclic"));
        }
        for (key, entry) in &self.symbols {
            if !self.modules.contains_key(&entry.owner) {
                return Err(invalid_argument(format!(
                    "symbol `{key}` is owned by unknown module `{}`",
                    entry.owner
                )));
            }
        }
        for (namespace, entry) in &self.namespaces {
            if entry.symbol_count + entry.reference_count == 0 {
                return Err(invalid_argument(format!(
                    "namespace `{namespace}` entry is empty but present"
                )));
            }
        }
        let mut symbol_counts: IndexMap<String, usize> = IndexMap::new();
        let mut reference_counts: IndexMap<String, usize> = IndexMap::new();
        for entry in self.modules.values() {
            let info = &entry.info;
            let node = entry.node;
            let (exports, includes, dependencies) = info.with_live(|live| {
                Ok((
                    live.symbols.keys().cloned().collect::<Vec<_>>(),
                    live.namespaces.keys().cloned().collect::<Vec<_>>(),
                    live.dependencies
                        .iter()
                        .map(|(name, link)| (name.clone(), link.info.clone()))
                        .collect::<Vec<_>>(),
                ))
            })?;
            for key in exports {
                if !key.namespace.is_empty() {
                    *symbol_counts.entry(key.namespace).or_default() += 1;
                }
            }
            for namespace in includes {
                *reference_counts.entry(namespace).or_default() += 1;
            }
            for (name, link) in dependencies {
                let target = self.modules.get(&name).ok_or_else(|| {
                    invalid_argument(format!(
                        "`{}` depends on unknown module `{name}`",
                        info.name()
                    ))
                })?;
                if !target.info.ptr_eq(&link) {
                    return Err(invalid_argument(format!(
                        "dependency `{name}` of `{}` is stale",
                        info.name()
                    )));
                }
                if self.graph.find_edge(node, target.node).is_none() {
                    return Err(invalid_argument(format!(
                        "missing graph edge `{}` -> `{name}`",
                        info.name()
                    )));
                }
            }
        }
        for (namespace, entry) in &self.namespaces {
            let symbols = symbol_counts.get(namespace).copied().unwrap_or(0);
            if symbols != entry.symbol_count {
                return Err(invalid_argument(format!(
                    "namespace `{namespace}` records {} symbols, found {symbols}",
                    entry.symbol_count
                )));
            }
            let references = reference_counts.get(namespace).copied().unwrap_or(0);
            if references != entry.reference_count {
                return Err(invalid_argument(format!(
                    "namespace `{namespace}` records {} references, found {references}",
                    entry.reference_count
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::ExportRecord;
    use crate::Error;
    use std::path::PathBuf;

    static EMPTY_A: ExportRecord = ExportRecord::empty(c"ra".as_ptr());
    static EMPTY_B: ExportRecord = ExportRecord::empty(c"rb".as_ptr());

    fn regular(record: &'static ExportRecord) -> ModuleInfo {
        ModuleInfo::new_regular(record, None, PathBuf::new())
    }

    #[test]
    fn add_remove_round_trip() {
        let mut registry = RegistryState::new();
        let a = ModuleInfo::new_pseudo("a");
        registry.add(&a).unwrap();
        assert!(registry.find_module("a").is_ok());
        assert_eq!(registry.graph.node_count(), 1);

        let err = registry.add(&a).unwrap_err();
        assert!(matches!(err, Error::Duplicate { .. }));

        registry.remove(&a).unwrap();
        assert!(registry.find_module("a").is_err());
        assert_eq!(registry.graph.node_count(), 0);
        registry.verify_integrity().unwrap();
    }

    #[test]
    fn link_and_unlink_guard_the_graph() {
        let mut registry = RegistryState::new();
        let a = regular(&EMPTY_A);
        let b = regular(&EMPTY_B);
        registry.add(&a).unwrap();
        registry.add(&b).unwrap();

        registry.link(&a, &b).unwrap();
        assert!(a.has_dependency("rb"));
        registry.verify_integrity().unwrap();

        let err = registry.link(&a, &b).unwrap_err();
        assert!(matches!(err, Error::Duplicate { .. }));

        let err = registry.link(&b, &a).unwrap_err();
        assert!(matches!(err, Error::Cycle { .. }));

        // A linked provider is pinned.
        let err = registry.removable(&b).unwrap_err();
        assert!(matches!(err, Error::Busy { .. }));

        registry.unlink(&a, &b).unwrap();
        let err = registry.unlink(&a, &b).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        registry.removable(&b).unwrap();
        registry.verify_integrity().unwrap();
    }

    #[test]
    fn pseudo_targets_are_refused() {
        let mut registry = RegistryState::new();
        let a = regular(&EMPTY_A);
        let p = ModuleInfo::new_pseudo("p");
        registry.add(&a).unwrap();
        registry.add(&p).unwrap();
        let err = registry.link(&a, &p).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { .. }));
    }

    #[test]
    fn unknown_modules_are_reported() {
        let mut registry = RegistryState::new();
        let ghost = ModuleInfo::new_pseudo("ghost");
        assert!(matches!(
            registry.remove(&ghost).unwrap_err(),
            Error::NotFound { .. }
        ));
        assert!(matches!(
            registry.find_module("ghost").unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[test]
    fn namespace_acquire_release_accounting() {
        let mut registry = RegistryState::new();
        let p = ModuleInfo::new_pseudo("host");
        registry.add(&p).unwrap();

        let err = registry.acquire_namespace(&p, "missing").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        // Seed a namespace the way add() does for an exporting module.
        registry.namespaces.insert(
            "ns".to_string(),
            NamespaceEntry {
                symbol_count: 1,
                reference_count: 0,
            },
        );
        registry.acquire_namespace(&p, "ns").unwrap();
        assert_eq!(registry.namespaces["ns"].reference_count, 1);

        let err = registry.acquire_namespace(&p, "ns").unwrap_err();
        assert!(matches!(err, Error::Duplicate { .. }));

        registry.release_namespace(&p, "ns").unwrap();
        assert_eq!(registry.namespaces["ns"].reference_count, 0);
        let err = registry.release_namespace(&p, "ns").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
