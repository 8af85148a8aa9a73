use crate::error::{invalid_argument, overflow};
use crate::export::{cleanup_record, DynSymbolDtorFn, ExportRecord, ModuleInstance};
use crate::handle::ModuleHandle;
use crate::param::ParamCell;
use crate::version::Version;
use crate::{Error, Result};
use indexmap::IndexMap;
use spin::Mutex;
use std::ffi::{c_char, c_void, CString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

/// Identity of a symbol: name plus namespace. The empty namespace is the
/// global one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolKey {
    pub name: String,
    pub namespace: String,
}

impl SymbolKey {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl std::fmt::Display for SymbolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}::{}", self.namespace, self.name)
        }
    }
}

/// One exported symbol owned by a module.
///
/// Importers hold `Arc` clones and bump `locks`; a module cannot be removed
/// while any of its cells is locked, which keeps `ptr` alive for every
/// holder.
pub struct SymbolCell {
    key: SymbolKey,
    version: Version,
    ptr: *const c_void,
    dyn_dtor: Option<DynSymbolDtorFn>,
    locks: AtomicUsize,
}

// Safety: `ptr` refers to either immutable section data or a dynamically
// constructed symbol that outlives the cell; the cell itself never writes
// through it.
unsafe impl Send for SymbolCell {}
unsafe impl Sync for SymbolCell {}

impl SymbolCell {
    pub(crate) fn new_static(key: SymbolKey, version: Version, ptr: *const c_void) -> Self {
        Self {
            key,
            version,
            ptr,
            dyn_dtor: None,
            locks: AtomicUsize::new(0),
        }
    }

    pub(crate) fn new_dynamic(
        key: SymbolKey,
        version: Version,
        ptr: *const c_void,
        dtor: DynSymbolDtorFn,
    ) -> Self {
        Self {
            key,
            version,
            ptr,
            dyn_dtor: Some(dtor),
            locks: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn key(&self) -> &SymbolKey {
        &self.key
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Raw symbol address. Only meaningful to holders of a lock.
    #[inline]
    pub fn as_ptr(&self) -> *const c_void {
        self.ptr
    }

    #[inline]
    pub(crate) fn lock_count(&self) -> usize {
        self.locks.load(Ordering::Acquire)
    }

    pub(crate) fn lock(&self) -> Result<()> {
        self.locks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |locks| {
                locks.checked_add(1)
            })
            .map(|_| ())
            .map_err(|_| overflow("symbol lock count saturated"))
    }

    pub(crate) fn unlock(&self) {
        let prev = self.locks.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "symbol lock underflow");
    }

    pub(crate) fn dyn_dtor(&self) -> Option<DynSymbolDtorFn> {
        self.dyn_dtor
    }
}

impl std::fmt::Debug for SymbolCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolCell")
            .field("key", &self.key.to_string())
            .field("version", &self.version)
            .field("locks", &self.lock_count())
            .finish()
    }
}

/// A lock on a provider's exported symbol.
///
/// Holding the guard keeps the provider loaded; the raw pointer obtained
/// through [`LockedSymbol::as_ptr`] stays valid until the guard drops.
pub struct LockedSymbol {
    cell: Arc<SymbolCell>,
}

impl LockedSymbol {
    pub(crate) fn acquire(cell: &Arc<SymbolCell>) -> Result<Self> {
        cell.lock()?;
        Ok(Self { cell: cell.clone() })
    }

    /// Raw address of the locked symbol.
    #[inline]
    pub fn as_ptr(&self) -> *const c_void {
        self.cell.as_ptr()
    }

    /// Version the provider exported the symbol at.
    #[inline]
    pub fn version(&self) -> Version {
        self.cell.version()
    }

    /// Symbol identity.
    #[inline]
    pub fn key(&self) -> &SymbolKey {
        self.cell.key()
    }
}

impl Drop for LockedSymbol {
    fn drop(&mut self) {
        self.cell.unlock();
    }
}

impl std::fmt::Debug for LockedSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedSymbol")
            .field("key", &self.cell.key().to_string())
            .field("version", &self.cell.version())
            .finish()
    }
}

/// Whether a module was built from an export record or synthesized by the
/// host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleType {
    /// Built from a validated export record of a binary.
    Regular,
    /// A synthetic identity used by the host to query symbols. Carries no
    /// exports, parameters or resources and cannot be depended on.
    Pseudo,
}

/// How a module came to include a namespace.
#[derive(Debug, Clone, Copy)]
pub struct NamespaceUse {
    /// Declared in the export record; static inclusions cannot be released.
    pub static_link: bool,
}

/// A dependency edge held by a module, mirrored in the registry graph.
pub(crate) struct DependencyLink {
    pub info: ModuleInfo,
    pub static_link: bool,
}

/// The struct-of-arrays tables handed to module code, plus their backing
/// storage. Built by the module builder; immutable afterwards except for
/// the export slots filled while dynamic symbols are constructed.
pub(crate) struct InstanceTables {
    // The slices below back the raw tables inside `instance`; they are only
    // read through it.
    #[allow(dead_code)]
    param_ptrs: Box<[*const c_void]>,
    #[allow(dead_code)]
    resource_strings: Box<[CString]>,
    #[allow(dead_code)]
    resource_ptrs: Box<[*const c_char]>,
    #[allow(dead_code)]
    import_ptrs: Box<[*const c_void]>,
    export_ptrs: Box<[AtomicPtr<c_void>]>,
    /// Heap-allocated so the address handed to module code stays stable;
    /// always mutated through this raw pointer to keep handed-out aliases
    /// valid.
    instance: *mut ModuleInstance,
}

// Safety: the pointer slices refer to storage owned by this struct or by
// the module info that owns it; the instance allocation is exclusively
// managed through `instance`.
unsafe impl Send for InstanceTables {}
unsafe impl Sync for InstanceTables {}

impl InstanceTables {
    pub(crate) fn new(
        info_ptr: *const c_void,
        param_ptrs: Vec<*const c_void>,
        resource_strings: Vec<CString>,
        import_ptrs: Vec<*const c_void>,
        static_exports: Vec<*const c_void>,
        dynamic_count: usize,
    ) -> Self {
        let param_ptrs = param_ptrs.into_boxed_slice();
        let resource_strings = resource_strings.into_boxed_slice();
        let resource_ptrs: Box<[*const c_char]> =
            resource_strings.iter().map(|s| s.as_ptr()).collect();
        let import_ptrs = import_ptrs.into_boxed_slice();
        let export_ptrs: Box<[AtomicPtr<c_void>]> = static_exports
            .into_iter()
            .map(|ptr| AtomicPtr::new(ptr.cast_mut()))
            .chain((0..dynamic_count).map(|_| AtomicPtr::new(std::ptr::null_mut())))
            .collect();

        let instance = Box::into_raw(Box::new(ModuleInstance {
            parameters: param_ptrs.as_ptr(),
            resources: resource_ptrs.as_ptr(),
            imports: import_ptrs.as_ptr(),
            // `AtomicPtr<c_void>` is transparent over `*mut c_void`.
            exports: export_ptrs.as_ptr() as *const *const c_void,
            info: info_ptr,
            state: std::ptr::null_mut(),
        }));

        Self {
            param_ptrs,
            resource_strings,
            resource_ptrs,
            import_ptrs,
            export_ptrs,
            instance,
        }
    }

    #[inline]
    pub(crate) fn instance_ptr(&self) -> *const ModuleInstance {
        self.instance
    }

    pub(crate) fn set_state(&self, state: *mut c_void) {
        // Safety: `instance` is exclusively owned; module code only reads.
        unsafe { (*self.instance).state = state };
    }

    pub(crate) fn state(&self) -> *mut c_void {
        // Safety: as above.
        unsafe { (*self.instance).state }
    }

    pub(crate) fn fill_export_slot(&self, idx: usize, ptr: *const c_void) {
        self.export_ptrs[idx].store(ptr.cast_mut(), Ordering::Release);
    }
}

impl Drop for InstanceTables {
    fn drop(&mut self) {
        // Safety: created by `Box::into_raw` in `new`; dropped exactly once.
        unsafe { drop(Box::from_raw(self.instance)) };
    }
}

/// The mutable inner state of a live module.
pub(crate) struct LiveInfo {
    pub handle: Option<ModuleHandle>,
    pub record: Option<&'static ExportRecord>,
    pub symbols: IndexMap<SymbolKey, Arc<SymbolCell>>,
    pub params: IndexMap<String, Arc<ParamCell>>,
    pub namespaces: IndexMap<String, NamespaceUse>,
    pub dependencies: IndexMap<String, DependencyLink>,
    /// Locks on provider symbols, one per declared import.
    pub imports: Vec<LockedSymbol>,
    pub unload_locks: usize,
    pub tables: Option<InstanceTables>,
}

impl LiveInfo {
    fn empty(handle: Option<ModuleHandle>, record: Option<&'static ExportRecord>) -> Self {
        Self {
            handle,
            record,
            symbols: IndexMap::new(),
            params: IndexMap::new(),
            namespaces: IndexMap::new(),
            dependencies: IndexMap::new(),
            imports: Vec::new(),
            unload_locks: 0,
            tables: None,
        }
    }
}

enum InfoState {
    Live(LiveInfo),
    Detached,
}

struct InfoShared {
    name: String,
    description: String,
    author: String,
    license: String,
    module_path: PathBuf,
    ty: ModuleType,
    state: Mutex<InfoState>,
}

/// A shared, lock-protected record of one module instance.
///
/// Clones share the same record. After unload the inner state is torn down
/// but outstanding clones stay valid; operations on them report
/// [`Error::Detached`].
#[derive(Clone)]
pub struct ModuleInfo {
    shared: Arc<InfoShared>,
}

impl ModuleInfo {
    pub(crate) fn new_regular(
        record: &'static ExportRecord,
        handle: Option<ModuleHandle>,
        module_path: PathBuf,
    ) -> Self {
        let lossy = |ptr: Option<&std::ffi::CStr>| {
            ptr.map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
        };
        Self {
            shared: Arc::new(InfoShared {
                name: record.name().to_string_lossy().into_owned(),
                description: lossy(record.description()),
                author: lossy(record.author()),
                license: lossy(record.license()),
                module_path,
                ty: ModuleType::Regular,
                state: Mutex::new(InfoState::Live(LiveInfo::empty(handle, Some(record)))),
            }),
        }
    }

    /// Silently drops the inner state without running any teardown
    /// callbacks; used by the builder to roll back a partially built
    /// instance whose lifecycle hooks it already unwound itself.
    pub(crate) fn discard(&self) {
        let state = std::mem::replace(&mut *self.shared.state.lock(), InfoState::Detached);
        drop(state);
    }

    pub(crate) fn new_pseudo(name: &str) -> Self {
        Self {
            shared: Arc::new(InfoShared {
                name: name.to_string(),
                description: String::new(),
                author: String::new(),
                license: String::new(),
                module_path: PathBuf::new(),
                ty: ModuleType::Pseudo,
                state: Mutex::new(InfoState::Live(LiveInfo::empty(None, None))),
            }),
        }
    }

    /// Module name, unique within a registry.
    #[inline]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[inline]
    pub fn description(&self) -> &str {
        &self.shared.description
    }

    #[inline]
    pub fn author(&self) -> &str {
        &self.shared.author
    }

    #[inline]
    pub fn license(&self) -> &str {
        &self.shared.license
    }

    /// Path of the binary the module was built from; empty for pseudo
    /// modules.
    #[inline]
    pub fn module_path(&self) -> &Path {
        &self.shared.module_path
    }

    #[inline]
    pub fn module_type(&self) -> ModuleType {
        self.shared.ty
    }

    /// True while the inner state has not been torn down.
    pub fn is_loaded(&self) -> bool {
        matches!(&*self.shared.state.lock(), InfoState::Live(_))
    }

    /// True if both handles refer to the same module record.
    #[inline]
    pub fn ptr_eq(&self, other: &ModuleInfo) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Runs `f` on the live inner state, or reports [`Error::Detached`].
    pub(crate) fn with_live<R>(&self, f: impl FnOnce(&mut LiveInfo) -> Result<R>) -> Result<R> {
        match &mut *self.shared.state.lock() {
            InfoState::Live(live) => f(live),
            InfoState::Detached => Err(Error::Detached),
        }
    }

    /// Prevents the module from being unloaded until the matching
    /// [`ModuleInfo::unlock_unload`].
    pub fn lock_unload(&self) -> Result<()> {
        self.with_live(|live| {
            live.unload_locks = live
                .unload_locks
                .checked_add(1)
                .ok_or_else(|| overflow("module unload lock count saturated"))?;
            Ok(())
        })
    }

    /// Releases one unload lock.
    pub fn unlock_unload(&self) -> Result<()> {
        self.with_live(|live| {
            live.unload_locks = live
                .unload_locks
                .checked_sub(1)
                .ok_or_else(|| invalid_argument("module holds no unload lock"))?;
            Ok(())
        })
    }

    /// Number of outstanding unload locks; zero once detached.
    pub fn unload_locks(&self) -> usize {
        self.with_live(|live| Ok(live.unload_locks)).unwrap_or(0)
    }

    /// True if this module holds a dependency link to `provider`.
    pub fn has_dependency(&self, provider: &str) -> bool {
        self.with_live(|live| Ok(live.dependencies.contains_key(provider)))
            .unwrap_or(false)
    }

    /// True if this module has included `namespace`, statically or
    /// dynamically.
    pub fn includes_namespace(&self, namespace: &str) -> bool {
        self.with_live(|live| Ok(live.namespaces.contains_key(namespace)))
            .unwrap_or(false)
    }

    /// Names of the modules this module depends on.
    pub fn dependency_names(&self) -> Vec<String> {
        self.with_live(|live| Ok(live.dependencies.keys().cloned().collect()))
            .unwrap_or_default()
    }

    /// True if any exported symbol is currently locked by an importer.
    pub(crate) fn has_locked_exports(&self) -> bool {
        self.with_live(|live| {
            Ok(live.symbols.values().any(|cell| cell.lock_count() > 0))
        })
        .unwrap_or(false)
    }

    pub(crate) fn strong_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    /// Address of the instance tables, null for pseudo modules.
    pub fn instance_ptr(&self) -> *const ModuleInstance {
        self.with_live(|live| {
            Ok(live
                .tables
                .as_ref()
                .map(|tables| tables.instance_ptr())
                .unwrap_or(std::ptr::null()))
        })
        .unwrap_or(std::ptr::null())
    }

    /// Borrowed pointer to the shared record, used as the instance's
    /// `info` back-reference. Carries no reference count; valid while the
    /// instance tables are.
    pub(crate) fn as_instance_ptr(&self) -> *const c_void {
        Arc::as_ptr(&self.shared) as *const c_void
    }

    /// Converts into a raw strong reference, as stored by dependency
    /// modifiers. Must be balanced by [`ModuleInfo::release_raw`] or
    /// [`ModuleInfo::from_raw`].
    pub fn into_raw(self) -> *const c_void {
        Arc::into_raw(self.shared) as *const c_void
    }

    /// Reclaims a raw strong reference produced by [`ModuleInfo::into_raw`].
    ///
    /// # Safety
    /// `ptr` must come from `into_raw` and not have been released yet.
    pub unsafe fn from_raw(ptr: *const c_void) -> Self {
        Self {
            shared: unsafe { Arc::from_raw(ptr as *const InfoShared) },
        }
    }

    /// Clones the module info behind a raw reference without consuming it.
    ///
    /// # Safety
    /// `ptr` must come from `into_raw` (or `as_instance_ptr` of a live
    /// instance) and still be outstanding.
    pub unsafe fn borrow_raw(ptr: *const c_void) -> Self {
        let shared = ptr as *const InfoShared;
        unsafe {
            Arc::increment_strong_count(shared);
            Self {
                shared: Arc::from_raw(shared),
            }
        }
    }

    /// Drops a raw strong reference produced by [`ModuleInfo::into_raw`].
    ///
    /// # Safety
    /// As for [`ModuleInfo::from_raw`].
    pub unsafe fn release_raw(ptr: *const c_void) {
        drop(unsafe { Self::from_raw(ptr) });
    }

    /// Tears down the inner state: dynamic exports are destroyed in
    /// reverse declaration order, the module destructor runs with the
    /// constructor state, the record cleanup hook fires, import locks and
    /// the binary handle are released. Idempotent; user callbacks run with
    /// no runtime locks held.
    pub(crate) fn detach(&self) {
        let state = std::mem::replace(&mut *self.shared.state.lock(), InfoState::Detached);
        let InfoState::Live(live) = state else {
            return;
        };
        log::debug!("Detaching module [{}]", self.name());

        for cell in live.symbols.values().rev() {
            if let Some(dtor) = cell.dyn_dtor() {
                debug_assert_eq!(cell.lock_count(), 0, "dynamic symbol still locked");
                // Safety: the symbol was produced by the paired constructor
                // and no lock holders remain.
                unsafe { dtor(cell.as_ptr().cast_mut()) };
            }
        }

        if let (Some(record), Some(tables)) = (live.record, live.tables.as_ref()) {
            if let Some(dtor) = record.destructor {
                // Safety: invoked exactly once with the state returned by
                // the paired constructor.
                unsafe { dtor(tables.instance_ptr(), tables.state()) };
            }
        }

        if let Some(record) = live.record {
            cleanup_record(record);
        }

        // Dropping the rest releases import locks, parameter cells, the
        // dependency strong references and finally the binary handle.
        drop(live);
    }
}

impl std::fmt::Debug for ModuleInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInfo")
            .field("name", &self.shared.name)
            .field("type", &self.shared.ty)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl std::fmt::Display for ModuleInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.shared.name)?;
        if !self.shared.author.is_empty() {
            write!(f, " by {}", self.shared.author)?;
        }
        if !self.shared.description.is_empty() {
            write!(f, ": {}", self.shared.description)?;
        }
        Ok(())
    }
}
