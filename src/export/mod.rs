//! The export-record protocol.
//!
//! A module binary carries a linker-populated section holding pointers to
//! [`ExportRecord`] structures. The section layout itself is a build-system
//! concern; the runtime only requires the binary to expose an iterator
//! function under the well-known symbol [`EXPORTS_SYMBOL`] that walks the
//! section and hands every slot to a visitor. Null slots are linker padding
//! and are skipped by the reader.

pub(crate) mod validate;

use crate::param::{ParamReadFn, ParamWriteFn};
use crate::version::Version;
use std::ffi::{c_char, c_void, CStr};

/// Structural tag identifying an [`ExportRecord`] in the section.
pub const STRUCT_TYPE_MODULE_EXPORT: u32 = 0x4d48_5845;

/// ABI revision of the export-record protocol supported by this host.
pub const MODHOST_ABI: u32 = 1;

/// Well-known symbol a plugin binary exports to enumerate its records.
pub const EXPORTS_SYMBOL: &[u8] = b"modhost_module_exports\0";

/// Modifier tag: a destructor to run when the record is abandoned.
pub const MODIFIER_DESTRUCTOR: u32 = 0;
/// Modifier tag: a strong module-info reference held by the record.
pub const MODIFIER_DEPENDENCY: u32 = 1;
/// Modifier tag: debug information attached by the build system.
pub const MODIFIER_DEBUG_INFO: u32 = 2;

/// Visitor invoked per section slot; returning `false` stops the walk.
pub type ExportVisitFn = unsafe extern "C" fn(record: *const ExportRecord, data: *mut c_void) -> bool;

/// The iterator function a binary exposes under [`EXPORTS_SYMBOL`].
pub type ExportIteratorFn = unsafe extern "C" fn(visit: ExportVisitFn, data: *mut c_void);

/// Module constructor. Runs after imports are wired and before exports are
/// registered, with no runtime locks held. `set` points at the
/// [`LoadingSet`](crate::LoadingSet) driving the load and may be used to
/// append further modules. A nonzero return fails the module.
pub type ModuleCtorFn =
    unsafe extern "C" fn(instance: *const ModuleInstance, set: *const c_void, out_state: *mut *mut c_void) -> i32;

/// Module destructor, invoked once at unload with the constructor state.
pub type ModuleDtorFn = unsafe extern "C" fn(instance: *const ModuleInstance, state: *mut c_void);

/// Event hook run after the module is committed, outside all locks.
pub type ModuleStartFn = unsafe extern "C" fn(instance: *const ModuleInstance) -> i32;

/// Event hook run before the module is removed, outside all locks.
pub type ModuleStopFn = unsafe extern "C" fn(instance: *const ModuleInstance);

/// Constructor of a dynamically constructed symbol export.
pub type DynSymbolCtorFn =
    unsafe extern "C" fn(instance: *const ModuleInstance, out_symbol: *mut *mut c_void) -> i32;

/// Destructor of a dynamically constructed symbol export.
pub type DynSymbolDtorFn = unsafe extern "C" fn(symbol: *mut c_void);

/// Destructor attached to a record through a [`MODIFIER_DESTRUCTOR`].
pub type ModifierDestructorFn = unsafe extern "C" fn(data: *mut c_void);

/// Declaration of a module parameter.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawParamDecl {
    pub name: *const c_char,
    /// One of the [`ParamType`](crate::ParamType) discriminants.
    pub param_type: u32,
    /// One of the [`ParamAccess`](crate::ParamAccess) discriminants.
    pub read_access: u32,
    /// One of the [`ParamAccess`](crate::ParamAccess) discriminants.
    pub write_access: u32,
    /// Canonical 64-bit representation of the default value.
    pub default_value: u64,
    pub read: Option<ParamReadFn>,
    pub write: Option<ParamWriteFn>,
}

// Safety: the declaration only points at immutable section data.
unsafe impl Send for RawParamDecl {}
unsafe impl Sync for RawParamDecl {}

impl RawParamDecl {
    pub fn name(&self) -> &CStr {
        // Safety: validated records carry a non-null name.
        unsafe { CStr::from_ptr(self.name) }
    }
}

/// Declaration of a file resource, relative to the binary's directory.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawResourceDecl {
    pub path: *const c_char,
}

// Safety: the declaration only points at immutable section data.
unsafe impl Send for RawResourceDecl {}
unsafe impl Sync for RawResourceDecl {}

impl RawResourceDecl {
    pub fn path(&self) -> &CStr {
        // Safety: validated records carry a non-null path.
        unsafe { CStr::from_ptr(self.path) }
    }
}

/// Declaration of an imported namespace.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawNamespaceImport {
    pub name: *const c_char,
}

// Safety: the declaration only points at immutable section data.
unsafe impl Send for RawNamespaceImport {}
unsafe impl Sync for RawNamespaceImport {}

impl RawNamespaceImport {
    pub fn name(&self) -> &CStr {
        // Safety: validated records carry a non-null name.
        unsafe { CStr::from_ptr(self.name) }
    }
}

/// Declaration of an imported symbol. An empty namespace string selects the
/// global namespace.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawSymbolImport {
    pub name: *const c_char,
    pub namespace: *const c_char,
    pub version: Version,
}

// Safety: the declaration only points at immutable section data.
unsafe impl Send for RawSymbolImport {}
unsafe impl Sync for RawSymbolImport {}

impl RawSymbolImport {
    pub fn name(&self) -> &CStr {
        // Safety: validated records carry a non-null name.
        unsafe { CStr::from_ptr(self.name) }
    }

    pub fn namespace(&self) -> &CStr {
        // Safety: validated records carry a non-null namespace.
        unsafe { CStr::from_ptr(self.namespace) }
    }
}

/// Declaration of a statically exported symbol.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawStaticExport {
    pub name: *const c_char,
    pub namespace: *const c_char,
    pub version: Version,
    pub symbol: *const c_void,
}

// Safety: the declaration only points at immutable section data.
unsafe impl Send for RawStaticExport {}
unsafe impl Sync for RawStaticExport {}

impl RawStaticExport {
    pub fn name(&self) -> &CStr {
        // Safety: validated records carry a non-null name.
        unsafe { CStr::from_ptr(self.name) }
    }

    pub fn namespace(&self) -> &CStr {
        // Safety: validated records carry a non-null namespace.
        unsafe { CStr::from_ptr(self.namespace) }
    }
}

/// Declaration of a dynamically constructed symbol export.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawDynamicExport {
    pub name: *const c_char,
    pub namespace: *const c_char,
    pub version: Version,
    pub constructor: Option<DynSymbolCtorFn>,
    pub destructor: Option<DynSymbolDtorFn>,
}

// Safety: the declaration only points at immutable section data.
unsafe impl Send for RawDynamicExport {}
unsafe impl Sync for RawDynamicExport {}

impl RawDynamicExport {
    pub fn name(&self) -> &CStr {
        // Safety: validated records carry a non-null name.
        unsafe { CStr::from_ptr(self.name) }
    }

    pub fn namespace(&self) -> &CStr {
        // Safety: validated records carry a non-null namespace.
        unsafe { CStr::from_ptr(self.namespace) }
    }
}

/// Payload of a [`MODIFIER_DESTRUCTOR`] modifier.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ModifierDestructor {
    pub data: *mut c_void,
    pub destructor: Option<ModifierDestructorFn>,
}

// Safety: the declaration only points at immutable section data.
unsafe impl Send for ModifierDestructor {}
unsafe impl Sync for ModifierDestructor {}

/// A tagged modifier attached to a record.
///
/// `value` points at a [`ModifierDestructor`] for [`MODIFIER_DESTRUCTOR`]
/// and at a raw strong [`ModuleInfo`](crate::ModuleInfo) reference (see
/// [`ModuleInfo::into_raw`](crate::ModuleInfo::into_raw)) for
/// [`MODIFIER_DEPENDENCY`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawModifier {
    pub tag: u32,
    pub value: *const c_void,
}

// Safety: the declaration only points at immutable section data.
unsafe impl Send for RawModifier {}
unsafe impl Sync for RawModifier {}

/// One module's declarations, emitted into the export section of a binary.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ExportRecord {
    /// Must be [`STRUCT_TYPE_MODULE_EXPORT`].
    pub struct_type: u32,
    /// Reserved for protocol evolution; must currently be null.
    pub next: *const ExportRecord,
    /// Must be [`MODHOST_ABI`].
    pub abi: u32,
    pub name: *const c_char,
    pub description: *const c_char,
    pub author: *const c_char,
    pub license: *const c_char,
    pub parameters: *const RawParamDecl,
    pub parameters_len: u32,
    pub resources: *const RawResourceDecl,
    pub resources_len: u32,
    pub namespace_imports: *const RawNamespaceImport,
    pub namespace_imports_len: u32,
    pub symbol_imports: *const RawSymbolImport,
    pub symbol_imports_len: u32,
    pub symbol_exports: *const RawStaticExport,
    pub symbol_exports_len: u32,
    pub dynamic_symbol_exports: *const RawDynamicExport,
    pub dynamic_symbol_exports_len: u32,
    pub modifiers: *const RawModifier,
    pub modifiers_len: u32,
    pub constructor: Option<ModuleCtorFn>,
    pub destructor: Option<ModuleDtorFn>,
    pub on_start: Option<ModuleStartFn>,
    pub on_stop: Option<ModuleStopFn>,
}

// Safety: a record is immutable section data; every pointer it carries
// refers to data with the same lifetime and is never written through.
unsafe impl Send for ExportRecord {}
unsafe impl Sync for ExportRecord {}

#[inline]
fn raw_slice<'a, T>(ptr: *const T, len: u32) -> &'a [T] {
    if ptr.is_null() {
        &[]
    } else {
        // Safety: validated records pair a non-null pointer with its length.
        unsafe { std::slice::from_raw_parts(ptr, len as usize) }
    }
}

impl ExportRecord {
    /// An empty record carrying only a name; intended for struct-update
    /// construction of static records.
    pub const fn empty(name: *const c_char) -> Self {
        Self {
            struct_type: STRUCT_TYPE_MODULE_EXPORT,
            next: std::ptr::null(),
            abi: MODHOST_ABI,
            name,
            description: std::ptr::null(),
            author: std::ptr::null(),
            license: std::ptr::null(),
            parameters: std::ptr::null(),
            parameters_len: 0,
            resources: std::ptr::null(),
            resources_len: 0,
            namespace_imports: std::ptr::null(),
            namespace_imports_len: 0,
            symbol_imports: std::ptr::null(),
            symbol_imports_len: 0,
            symbol_exports: std::ptr::null(),
            symbol_exports_len: 0,
            dynamic_symbol_exports: std::ptr::null(),
            dynamic_symbol_exports_len: 0,
            modifiers: std::ptr::null(),
            modifiers_len: 0,
            constructor: None,
            destructor: None,
            on_start: None,
            on_stop: None,
        }
    }

    pub fn name(&self) -> &CStr {
        // Safety: validated records carry a non-null name.
        unsafe { CStr::from_ptr(self.name) }
    }

    fn opt_str(ptr: *const c_char) -> Option<&'static CStr> {
        if ptr.is_null() {
            None
        } else {
            // Safety: non-null metadata strings are nul-terminated section data.
            Some(unsafe { CStr::from_ptr(ptr) })
        }
    }

    pub fn description(&self) -> Option<&CStr> {
        Self::opt_str(self.description)
    }

    pub fn author(&self) -> Option<&CStr> {
        Self::opt_str(self.author)
    }

    pub fn license(&self) -> Option<&CStr> {
        Self::opt_str(self.license)
    }

    pub fn parameters(&self) -> &[RawParamDecl] {
        raw_slice(self.parameters, self.parameters_len)
    }

    pub fn resources(&self) -> &[RawResourceDecl] {
        raw_slice(self.resources, self.resources_len)
    }

    pub fn namespace_imports(&self) -> &[RawNamespaceImport] {
        raw_slice(self.namespace_imports, self.namespace_imports_len)
    }

    pub fn symbol_imports(&self) -> &[RawSymbolImport] {
        raw_slice(self.symbol_imports, self.symbol_imports_len)
    }

    pub fn symbol_exports(&self) -> &[RawStaticExport] {
        raw_slice(self.symbol_exports, self.symbol_exports_len)
    }

    pub fn dynamic_symbol_exports(&self) -> &[RawDynamicExport] {
        raw_slice(self.dynamic_symbol_exports, self.dynamic_symbol_exports_len)
    }

    pub fn modifiers(&self) -> &[RawModifier] {
        raw_slice(self.modifiers, self.modifiers_len)
    }
}

impl std::fmt::Debug for ExportRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("ExportRecord");
        if !self.name.is_null() {
            d.field("name", &self.name());
        }
        d.field("parameters", &self.parameters_len)
            .field("resources", &self.resources_len)
            .field("namespace_imports", &self.namespace_imports_len)
            .field("symbol_imports", &self.symbol_imports_len)
            .field("symbol_exports", &self.symbol_exports_len)
            .field("dynamic_symbol_exports", &self.dynamic_symbol_exports_len)
            .field("modifiers", &self.modifiers_len)
            .finish()
    }
}

/// The struct-of-arrays instance tables handed to module code.
///
/// Built once during construction and read-only afterwards; indices match
/// the declaration order of the corresponding arrays in the record, with
/// static exports preceding dynamic ones in `exports`.
#[repr(C)]
pub struct ModuleInstance {
    /// Per-declaration pointers to the module's own [`ParamCell`](crate::ParamCell)s.
    pub parameters: *const *const c_void,
    /// Per-declaration absolute resource paths.
    pub resources: *const *const c_char,
    /// Per-declaration pointers to locked raw symbols in providers.
    pub imports: *const *const c_void,
    /// Pointers into this module's own symbol cells.
    pub exports: *const *const c_void,
    /// Raw strong reference to the owning module info; borrow through
    /// [`ModuleInfo::borrow_raw`](crate::ModuleInfo::borrow_raw).
    pub info: *const c_void,
    /// Opaque state returned by the module constructor.
    pub state: *mut c_void,
}

// Safety: the tables point at storage owned by the module info, which
// outlives every handed-out instance pointer.
unsafe impl Send for ModuleInstance {}
unsafe impl Sync for ModuleInstance {}

impl ModuleInstance {
    /// Parameter cell at declaration index `idx`.
    ///
    /// # Safety
    /// `idx` must be within the record's parameter array.
    pub unsafe fn parameter(&self, idx: usize) -> *const c_void {
        unsafe { *self.parameters.add(idx) }
    }

    /// Absolute resource path at declaration index `idx`.
    ///
    /// # Safety
    /// `idx` must be within the record's resource array.
    pub unsafe fn resource(&self, idx: usize) -> &CStr {
        unsafe { CStr::from_ptr(*self.resources.add(idx)) }
    }

    /// Imported symbol at declaration index `idx`.
    ///
    /// # Safety
    /// `idx` must be within the record's symbol-import array.
    pub unsafe fn import(&self, idx: usize) -> *const c_void {
        unsafe { *self.imports.add(idx) }
    }

    /// Exported symbol at table index `idx` (statics first, then dynamics).
    ///
    /// # Safety
    /// `idx` must be within the combined export table.
    pub unsafe fn export(&self, idx: usize) -> *const c_void {
        unsafe { *self.exports.add(idx) }
    }
}

/// A finite, non-restartable walk over a binary's export section.
///
/// Null slots (linker padding) are skipped. Records are yielded in link
/// order without any validation.
pub struct ExportIter {
    records: std::vec::IntoIter<*const ExportRecord>,
}

impl Iterator for ExportIter {
    type Item = &'static ExportRecord;

    fn next(&mut self) -> Option<Self::Item> {
        for ptr in self.records.by_ref() {
            if ptr.is_null() {
                log::trace!("Skipping null export slot");
                continue;
            }
            // Safety: the slot points at section data of the binary whose
            // handle the caller keeps alive for every record it uses; the
            // `'static` bound is upheld by that handle reference.
            return Some(unsafe { &*ptr });
        }
        None
    }
}

/// Drains `iterator` into link order.
pub(crate) fn collect_exports(iterator: ExportIteratorFn) -> ExportIter {
    unsafe extern "C" fn visit(record: *const ExportRecord, data: *mut c_void) -> bool {
        let slots = unsafe { &mut *(data as *mut Vec<*const ExportRecord>) };
        slots.push(record);
        true
    }

    let mut slots: Vec<*const ExportRecord> = Vec::new();
    // Safety: `visit` only appends to the vector threaded through `data`.
    unsafe { iterator(visit, &mut slots as *mut _ as *mut c_void) };
    log::trace!("Export section walk yielded {} slots", slots.len());
    ExportIter {
        records: slots.into_iter(),
    }
}

/// Runs the cleanup path of a record that is definitively not going to be
/// used: invokes every `Destructor` modifier and releases the strong
/// module-info reference of every `Dependency` modifier. Unknown modifiers
/// are skipped.
pub(crate) fn cleanup_record(record: &ExportRecord) {
    for modifier in record.modifiers() {
        match modifier.tag {
            MODIFIER_DESTRUCTOR => {
                let payload = modifier.value as *const ModifierDestructor;
                if payload.is_null() {
                    continue;
                }
                // Safety: validation guaranteed a non-null payload; a
                // missing destructor function is a no-op.
                unsafe {
                    let payload = &*payload;
                    if let Some(destructor) = payload.destructor {
                        destructor(payload.data);
                    }
                }
            }
            MODIFIER_DEPENDENCY => {
                if !modifier.value.is_null() {
                    // Safety: the value was produced by `ModuleInfo::into_raw`.
                    unsafe { crate::info::ModuleInfo::release_raw(modifier.value) };
                }
            }
            other => {
                log::trace!("Skipping modifier with tag {other} during record cleanup");
            }
        }
    }
}

/// Defines the [`EXPORTS_SYMBOL`] iterator over a fixed list of records.
///
/// ```no_run
/// use modhost::{export_modules, ExportRecord};
///
/// static MY_MODULE: ExportRecord = ExportRecord::empty(c"my_module".as_ptr());
/// export_modules!(MY_MODULE);
/// ```
#[macro_export]
macro_rules! export_modules {
    ($($record:expr),* $(,)?) => {
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn modhost_module_exports(
            visit: $crate::ExportVisitFn,
            data: *mut core::ffi::c_void,
        ) {
            $(
                if !unsafe { visit(&$record as *const $crate::ExportRecord, data) } {
                    return;
                }
            )*
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    static REC_A: ExportRecord = ExportRecord::empty(c"a".as_ptr());
    static REC_B: ExportRecord = ExportRecord::empty(c"b".as_ptr());

    unsafe extern "C" fn iter_with_padding(visit: ExportVisitFn, data: *mut c_void) {
        unsafe {
            if !visit(&REC_A, data) {
                return;
            }
            if !visit(std::ptr::null(), data) {
                return;
            }
            let _ = visit(&REC_B, data);
        }
    }

    #[test]
    fn reader_skips_null_slots() {
        let names: Vec<_> = collect_exports(iter_with_padding)
            .map(|r| r.name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn empty_record_has_empty_arrays() {
        assert!(REC_A.parameters().is_empty());
        assert!(REC_A.symbol_imports().is_empty());
        assert!(REC_A.modifiers().is_empty());
        assert!(REC_A.description().is_none());
    }
}
