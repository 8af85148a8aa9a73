use crate::info::{LockedSymbol, ModuleInfo};
use crate::param::{ParamAccess, ParamType, ParamValue};
use crate::registry::RegistryState;
use crate::version::Version;
use crate::Result;
use spin::{Mutex, MutexGuard};
use std::sync::Arc;

/// The host context owning the module registry.
///
/// Clones share the same registry; the registry lives exactly as long as
/// the last clone. There is no process-wide state: every operation goes
/// through a context handed in explicitly.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    registry: Mutex<RegistryState>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Creates a context with an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                registry: Mutex::new(RegistryState::new()),
            }),
        }
    }

    pub(crate) fn registry(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.registry.lock()
    }

    /// Looks up a loaded module by name.
    pub fn find_module(&self, name: &str) -> Result<ModuleInfo> {
        self.registry().find_module(name)
    }

    /// Looks up the module providing `(name, namespace)` at a version
    /// compatible with `required`.
    pub fn find_module_by_symbol(
        &self,
        name: &str,
        namespace: &str,
        required: &Version,
    ) -> Result<ModuleInfo> {
        self.registry()
            .find_module_by_symbol(name, namespace, required)
    }

    /// True if any loaded module exports into `namespace` or references it.
    pub fn namespace_exists(&self, namespace: &str) -> bool {
        self.registry().namespace_exists(namespace)
    }

    /// Symbol and reference counts of a namespace, if it exists.
    pub fn namespace_stats(&self, namespace: &str) -> Option<(usize, usize)> {
        self.registry()
            .namespaces
            .get(namespace)
            .map(|entry| (entry.symbol_count, entry.reference_count))
    }

    /// Registers a synthetic module identity for the host. A pseudo module
    /// can link to providers and load their symbols but exports nothing
    /// and cannot be depended on.
    pub fn new_pseudo_module(&self, name: &str) -> Result<ModuleInfo> {
        let info = ModuleInfo::new_pseudo(name);
        self.registry().add(&info).inspect_err(|_| info.discard())?;
        Ok(info)
    }

    /// Adds a dynamic dependency link from `a` to `b`, allowing `a` to
    /// load symbols `b` exports.
    pub fn link(&self, a: &ModuleInfo, b: &ModuleInfo) -> Result<()> {
        self.registry().link(a, b)
    }

    /// Removes a dynamic dependency link from `a` to `b`. Links
    /// established at construction are static and cannot be removed.
    pub fn unlink(&self, a: &ModuleInfo, b: &ModuleInfo) -> Result<()> {
        self.registry().unlink(a, b)
    }

    /// Includes `namespace` into `module`, allowing it to load symbols
    /// exported there.
    pub fn include_namespace(&self, module: &ModuleInfo, namespace: &str) -> Result<()> {
        self.registry().acquire_namespace(module, namespace)
    }

    /// Releases a namespace previously included through
    /// [`Context::include_namespace`].
    pub fn exclude_namespace(&self, module: &ModuleInfo, namespace: &str) -> Result<()> {
        self.registry().release_namespace(module, namespace)
    }

    /// Locks a provider's symbol on behalf of `caller` and returns the
    /// guard carrying the raw pointer. The provider cannot be unloaded
    /// while the guard lives.
    pub fn load_symbol(
        &self,
        caller: &ModuleInfo,
        name: &str,
        namespace: &str,
        required: &Version,
    ) -> Result<LockedSymbol> {
        self.registry().load_symbol(caller, name, namespace, required)
    }

    /// Withdraws a module from the registry and tears it down, then
    /// collects any modules left loose.
    pub fn unload(&self, info: &ModuleInfo) -> Result<()> {
        crate::loader::unload(self, info)
    }

    /// Collects Regular modules nothing references anymore.
    pub fn cleanup_loose(&self) {
        crate::loader::cleanup_loose(self)
    }

    /// Type and access groups of a module parameter.
    pub fn query_param(
        &self,
        module: &str,
        param: &str,
    ) -> Result<(ParamType, ParamAccess, ParamAccess)> {
        self.registry().query_param(module, param)
    }

    /// Reads a parameter whose read access is public.
    pub fn param_get_public(&self, module: &str, param: &str) -> Result<ParamValue> {
        self.registry().param_get_public(module, param)
    }

    /// Writes a parameter whose write access is public.
    pub fn param_set_public(&self, module: &str, param: &str, value: ParamValue) -> Result<()> {
        self.registry().param_set_public(module, param, value)
    }

    /// Reads a parameter on behalf of a module depending on its owner.
    pub fn param_get_dependency(
        &self,
        caller: &ModuleInfo,
        module: &str,
        param: &str,
    ) -> Result<ParamValue> {
        self.registry().param_get_dependency(caller, module, param)
    }

    /// Writes a parameter on behalf of a module depending on its owner.
    pub fn param_set_dependency(
        &self,
        caller: &ModuleInfo,
        module: &str,
        param: &str,
        value: ParamValue,
    ) -> Result<()> {
        self.registry()
            .param_set_dependency(caller, module, param, value)
    }

    /// Reads a parameter as its owner.
    pub fn param_get_private(
        &self,
        caller: &ModuleInfo,
        module: &str,
        param: &str,
    ) -> Result<ParamValue> {
        self.registry().param_get_private(caller, module, param)
    }

    /// Writes a parameter as its owner.
    pub fn param_set_private(
        &self,
        caller: &ModuleInfo,
        module: &str,
        param: &str,
        value: ParamValue,
    ) -> Result<()> {
        self.registry()
            .param_set_private(caller, module, param, value)
    }

    /// Names of every loaded module, in load order.
    pub fn module_names(&self) -> Vec<String> {
        self.registry().modules.keys().cloned().collect()
    }

    /// Number of loaded modules.
    pub fn module_count(&self) -> usize {
        self.registry().modules.len()
    }

    /// Checks the registry-wide invariants; intended for host diagnostics.
    pub fn verify_integrity(&self) -> Result<()> {
        self.registry().verify_integrity()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("modules", &self.module_count())
            .finish()
    }
}
