//! Orders the modules of a loading set for construction.
//!
//! Every staged module is probed against the live registry and the set
//! itself; unsatisfiable modules are failed individually while the
//! survivors are arranged providers-first along the import edges between
//! them. A cycle among survivors fails the whole operation.

use crate::error::{cycle_error, duplicate, not_found};
use crate::export::MODIFIER_DEPENDENCY;
use crate::info::{ModuleInfo, SymbolKey};
use crate::registry::RegistryState;
use crate::set::{PendingModule, PendingStatus, SetState};
use crate::{Error, Result};
use indexmap::{IndexMap, IndexSet};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

/// Outcome of a resolution pass: construction order for the survivors and
/// the individually failed modules.
#[derive(Debug)]
pub(crate) struct Resolution {
    /// Names of staged modules, providers before their dependents.
    pub order: Vec<String>,
    pub failures: Vec<(String, Error)>,
}

/// Names of the modules a record's dependency modifiers point at.
fn modifier_dependencies(pending: &PendingModule) -> Vec<String> {
    pending
        .record
        .modifiers()
        .iter()
        .filter(|modifier| modifier.tag == MODIFIER_DEPENDENCY && !modifier.value.is_null())
        .map(|modifier| {
            // Safety: validation guaranteed a non-null value produced by
            // `ModuleInfo::into_raw`.
            let info = unsafe { ModuleInfo::borrow_raw(modifier.value) };
            info.name().to_string()
        })
        .collect()
}

/// Checks the preconditions of one staged module. `failed` carries modules
/// already failed in this pass, which must not count as providers.
pub(crate) fn probe(
    registry: &RegistryState,
    set: &SetState,
    pending: &PendingModule,
    failed: &IndexSet<String>,
) -> Result<()> {
    if registry.modules.contains_key(&pending.name) {
        return Err(duplicate(format!(
            "a module named `{}` is already loaded",
            pending.name
        )));
    }

    let provided_by_set = |key: &SymbolKey, required: &crate::Version| {
        set.symbols.get(key).is_some_and(|symbol| {
            symbol.version.is_compatible_with(required)
                && !failed.contains(&symbol.provider)
                && set
                    .modules
                    .get(&symbol.provider)
                    .is_some_and(|provider| !matches!(provider.status, PendingStatus::Error(_)))
        })
    };

    for import in pending.record.symbol_imports() {
        let key = SymbolKey::new(
            import.name().to_string_lossy(),
            import.namespace().to_string_lossy(),
        );
        let in_registry = registry
            .symbols
            .get(&key)
            .is_some_and(|entry| entry.version.is_compatible_with(&import.version));
        if !in_registry && !provided_by_set(&key, &import.version) {
            return Err(not_found(format!(
                "no provider for symbol `{key}` at version {}",
                import.version
            )));
        }
    }

    for export in pending.record.symbol_exports() {
        let key = SymbolKey::new(
            export.name().to_string_lossy(),
            export.namespace().to_string_lossy(),
        );
        if registry.symbols.contains_key(&key) {
            return Err(duplicate(format!("symbol `{key}` is already exported")));
        }
    }
    for export in pending.record.dynamic_symbol_exports() {
        let key = SymbolKey::new(
            export.name().to_string_lossy(),
            export.namespace().to_string_lossy(),
        );
        if registry.symbols.contains_key(&key) {
            return Err(duplicate(format!("symbol `{key}` is already exported")));
        }
    }

    for target in modifier_dependencies(pending) {
        let in_registry = registry.modules.contains_key(&target);
        let in_set = !failed.contains(&target)
            && set
                .modules
                .get(&target)
                .is_some_and(|provider| !matches!(provider.status, PendingStatus::Error(_)));
        if !in_registry && !in_set {
            return Err(not_found(format!(
                "declared dependency `{target}` is not loaded"
            )));
        }
    }

    Ok(())
}

/// Computes the construction order for every `Unloaded` module of the set.
///
/// Re-running without mutating the set or the registry yields the same
/// order; ties are broken by staging order.
pub(crate) fn resolve(registry: &RegistryState, set: &SetState) -> Result<Resolution> {
    // Probe to a fixpoint so a module importing from a failed sibling is
    // failed in the same pass instead of at construction time.
    let mut failed: IndexSet<String> = IndexSet::new();
    let mut failures: IndexMap<String, Error> = IndexMap::new();
    loop {
        let mut changed = false;
        for pending in set.modules.values() {
            if !matches!(pending.status, PendingStatus::Unloaded) || failed.contains(&pending.name)
            {
                continue;
            }
            if let Err(err) = probe(registry, set, pending, &failed) {
                failed.insert(pending.name.clone());
                failures.insert(pending.name.clone(), err);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut nodes = IndexMap::new();
    for pending in set.modules.values() {
        if matches!(pending.status, PendingStatus::Unloaded) && !failed.contains(&pending.name) {
            let node = graph.add_node(pending.name.clone());
            nodes.insert(pending.name.clone(), node);
        }
    }

    for pending in set.modules.values() {
        let Some(&dependent) = nodes.get(&pending.name) else {
            continue;
        };
        // Import edges point from dependent to provider; imports satisfied
        // by the registry contribute none.
        for import in pending.record.symbol_imports() {
            let key = SymbolKey::new(
                import.name().to_string_lossy(),
                import.namespace().to_string_lossy(),
            );
            if let Some(symbol) = set.symbols.get(&key) {
                if let Some(&provider) = nodes.get(&symbol.provider) {
                    graph.update_edge(dependent, provider, ());
                }
            }
        }
        for target in modifier_dependencies(pending) {
            if let Some(&provider) = nodes.get(&target) {
                graph.update_edge(dependent, provider, ());
            }
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| {
        cycle_error(format!(
            "loading set contains a dependency cycle through `{}`",
            graph[cycle.node_id()]
        ))
    })?;

    // Toposort emits dependents first along our edge direction; providers
    // must be constructed first.
    let order: Vec<String> = sorted
        .into_iter()
        .rev()
        .map(|node| graph[node].clone())
        .collect();

    log::debug!(
        "Resolved loading order: [{}] ({} failed)",
        order.join(", "),
        failures.len()
    );

    Ok(Resolution {
        order,
        failures: failures.into_iter().collect(),
    })
}
