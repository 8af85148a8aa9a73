use modhost::{
    Context, Error, ExportRecord, ExportVisitFn, LoadingSet, RawNamespaceImport, RawStaticExport,
    RawSymbolImport, Version,
};
use std::ffi::c_void;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// --- provider/importer pair -------------------------------------------------

static PROV_VALUE: u64 = 99;
static PROV_EXPORTS: [RawStaticExport; 1] = [RawStaticExport {
    name: c"s".as_ptr(),
    namespace: c"".as_ptr(),
    version: Version::new(1, 0, 0),
    symbol: &PROV_VALUE as *const u64 as *const c_void,
}];
static PROV_RECORD: ExportRecord = ExportRecord {
    symbol_exports: PROV_EXPORTS.as_ptr(),
    symbol_exports_len: 1,
    ..ExportRecord::empty(c"prov".as_ptr())
};

static IMP_IMPORTS: [RawSymbolImport; 1] = [RawSymbolImport {
    name: c"s".as_ptr(),
    namespace: c"".as_ptr(),
    version: Version::new(1, 0, 0),
}];
static IMP_RECORD: ExportRecord = ExportRecord {
    symbol_imports: IMP_IMPORTS.as_ptr(),
    symbol_imports_len: 1,
    ..ExportRecord::empty(c"imp".as_ptr())
};

unsafe extern "C" fn pair_exports(visit: ExportVisitFn, data: *mut c_void) {
    unsafe {
        if !visit(&PROV_RECORD, data) {
            return;
        }
        let _ = visit(&IMP_RECORD, data);
    }
}

#[test]
fn unload_order_follows_dependencies() {
    init_logging();
    let ctx = Context::new();
    let set = LoadingSet::new();
    set.append_local(pair_exports, |_| true).unwrap();
    set.finish(&ctx).unwrap();

    let provider = ctx.find_module("prov").unwrap();
    let importer = ctx.find_module("imp").unwrap();
    let by_symbol = ctx
        .find_module_by_symbol("s", "", &Version::new(1, 0, 0))
        .unwrap();
    assert!(by_symbol.ptr_eq(&provider));

    // The provider is pinned by the importer's static link and lock.
    let err = ctx.unload(&provider).unwrap_err();
    assert!(matches!(err, Error::Busy { .. }));

    ctx.unload(&importer).unwrap();
    assert!(!importer.is_loaded());

    ctx.unload(&provider).unwrap();
    assert!(!provider.is_loaded());
    assert_eq!(ctx.module_count(), 0);
    ctx.verify_integrity().unwrap();
}

#[test]
fn detached_infos_reject_operations() {
    init_logging();
    let ctx = Context::new();
    let set = LoadingSet::new();
    set.append_local(pair_exports, |_| true).unwrap();
    set.finish(&ctx).unwrap();

    let importer = ctx.find_module("imp").unwrap();
    ctx.unload(&importer).unwrap();

    assert!(matches!(importer.lock_unload(), Err(Error::Detached)));
    assert!(!importer.has_dependency("prov"));
    // A second unload finds no registered module under this info.
    assert!(matches!(ctx.unload(&importer), Err(Error::NotFound { .. })));
}

#[test]
fn static_links_cannot_be_unlinked() {
    init_logging();
    let ctx = Context::new();
    let set = LoadingSet::new();
    set.append_local(pair_exports, |_| true).unwrap();
    set.finish(&ctx).unwrap();

    let provider = ctx.find_module("prov").unwrap();
    let importer = ctx.find_module("imp").unwrap();

    let err = ctx.unlink(&importer, &provider).unwrap_err();
    assert!(matches!(err, Error::PermissionDenied { .. }));

    // Linking on top of the static link is a duplicate.
    let err = ctx.link(&importer, &provider).unwrap_err();
    assert!(matches!(err, Error::Duplicate { .. }));
}

#[test]
fn pseudo_modules_cannot_be_depended_on() {
    init_logging();
    let ctx = Context::new();
    let set = LoadingSet::new();
    set.append_local(pair_exports, |_| true).unwrap();
    set.finish(&ctx).unwrap();

    let provider = ctx.find_module("prov").unwrap();
    let host = ctx.new_pseudo_module("host").unwrap();

    let err = ctx.link(&provider, &host).unwrap_err();
    assert!(matches!(err, Error::PermissionDenied { .. }));

    // The reverse direction is the intended use.
    ctx.link(&host, &provider).unwrap();
    let err = ctx.link(&host, &provider).unwrap_err();
    assert!(matches!(err, Error::Duplicate { .. }));
    ctx.unlink(&host, &provider).unwrap();
}

#[test]
fn link_cycles_are_refused() {
    init_logging();
    let ctx = Context::new();
    let set = LoadingSet::new();
    set.append_local(pair_exports, |_| true).unwrap();
    set.finish(&ctx).unwrap();

    let provider = ctx.find_module("prov").unwrap();
    let importer = ctx.find_module("imp").unwrap();

    // `imp` already depends on `prov`; the reverse edge closes a cycle.
    let err = ctx.link(&provider, &importer).unwrap_err();
    assert!(matches!(err, Error::Cycle { .. }));

    // Self links are cycles of length zero.
    let err = ctx.link(&provider, &provider).unwrap_err();
    assert!(matches!(err, Error::Cycle { .. }));

    ctx.verify_integrity().unwrap();
}

// --- namespace accounting ---------------------------------------------------

static NSPROV_VALUE: u32 = 7;
static NSPROV_EXPORTS: [RawStaticExport; 1] = [RawStaticExport {
    name: c"s1".as_ptr(),
    namespace: c"acct".as_ptr(),
    version: Version::new(1, 0, 0),
    symbol: &NSPROV_VALUE as *const u32 as *const c_void,
}];
static NSPROV_RECORD: ExportRecord = ExportRecord {
    symbol_exports: NSPROV_EXPORTS.as_ptr(),
    symbol_exports_len: 1,
    ..ExportRecord::empty(c"nsprov".as_ptr())
};

static NSUSER_NAMESPACES: [RawNamespaceImport; 1] = [RawNamespaceImport {
    name: c"acct".as_ptr(),
}];
static NSUSER_RECORD: ExportRecord = ExportRecord {
    namespace_imports: NSUSER_NAMESPACES.as_ptr(),
    namespace_imports_len: 1,
    ..ExportRecord::empty(c"nsuser".as_ptr())
};

unsafe extern "C" fn namespace_exports(visit: ExportVisitFn, data: *mut c_void) {
    unsafe {
        if !visit(&NSPROV_RECORD, data) {
            return;
        }
        let _ = visit(&NSUSER_RECORD, data);
    }
}

#[test]
fn namespace_counts_follow_module_lifecycles() {
    init_logging();
    let ctx = Context::new();
    let set = LoadingSet::new();
    set.append_local(namespace_exports, |_| true).unwrap();
    set.finish(&ctx).unwrap();

    assert_eq!(ctx.namespace_stats("acct"), Some((1, 1)));

    let user = ctx.find_module("nsuser").unwrap();
    let provider = ctx.find_module("nsprov").unwrap();

    // The provider cannot go first: the namespace would be left referenced
    // but empty.
    let err = ctx.unload(&provider).unwrap_err();
    assert!(matches!(err, Error::Busy { .. }));

    ctx.unload(&user).unwrap();
    assert_eq!(ctx.namespace_stats("acct"), Some((1, 0)));

    ctx.unload(&provider).unwrap();
    assert_eq!(ctx.namespace_stats("acct"), None);
    assert!(!ctx.namespace_exists("acct"));
    ctx.verify_integrity().unwrap();
}

#[test]
fn dynamic_namespace_inclusion_gates_symbol_loads() {
    init_logging();
    let ctx = Context::new();
    let set = LoadingSet::new();
    set.append_local(namespace_exports, |_| true).unwrap();
    set.finish(&ctx).unwrap();

    let provider = ctx.find_module("nsprov").unwrap();
    let host = ctx.new_pseudo_module("host").unwrap();
    ctx.link(&host, &provider).unwrap();

    // Depending on the provider is not enough without the namespace.
    let err = ctx
        .load_symbol(&host, "s1", "acct", &Version::new(1, 0, 0))
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied { .. }));

    ctx.include_namespace(&host, "acct").unwrap();
    assert_eq!(ctx.namespace_stats("acct"), Some((1, 2)));
    let symbol = ctx
        .load_symbol(&host, "s1", "acct", &Version::new(1, 0, 0))
        .unwrap();
    assert_eq!(unsafe { *(symbol.as_ptr() as *const u32) }, 7);
    drop(symbol);

    ctx.exclude_namespace(&host, "acct").unwrap();
    let err = ctx.exclude_namespace(&host, "acct").unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    // Statically included namespaces cannot be released.
    let user = ctx.find_module("nsuser").unwrap();
    let err = ctx.exclude_namespace(&user, "acct").unwrap_err();
    assert!(matches!(err, Error::PermissionDenied { .. }));
    ctx.verify_integrity().unwrap();
}

// --- loose-module collection ------------------------------------------------

#[test]
fn cleanup_collects_only_unreferenced_modules() {
    init_logging();
    let ctx = Context::new();
    let set = LoadingSet::new();
    set.append_local(pair_exports, |_| true).unwrap();
    set.finish(&ctx).unwrap();

    {
        // While the host holds info handles nothing is loose.
        let _provider = ctx.find_module("prov").unwrap();
        let _importer = ctx.find_module("imp").unwrap();
        drop(set);
        ctx.cleanup_loose();
        assert_eq!(ctx.module_count(), 2);
    }

    // With the handles gone the importer becomes loose, and removing it
    // frees the provider in the same pass.
    ctx.cleanup_loose();
    assert_eq!(ctx.module_count(), 0);
    ctx.verify_integrity().unwrap();
}

// --- lifecycle hooks --------------------------------------------------------

use modhost::ModuleInstance;
use std::sync::atomic::{AtomicUsize, Ordering};

static LIFE_SEQ: AtomicUsize = AtomicUsize::new(0);
static LIFE_CTOR_AT: AtomicUsize = AtomicUsize::new(0);
static LIFE_START_AT: AtomicUsize = AtomicUsize::new(0);
static LIFE_STOP_AT: AtomicUsize = AtomicUsize::new(0);
static LIFE_DTOR_AT: AtomicUsize = AtomicUsize::new(0);

fn life_mark(slot: &AtomicUsize) {
    slot.store(LIFE_SEQ.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
}

unsafe extern "C" fn life_ctor(
    _instance: *const ModuleInstance,
    _set: *const c_void,
    out_state: *mut *mut c_void,
) -> i32 {
    life_mark(&LIFE_CTOR_AT);
    unsafe { *out_state = Box::into_raw(Box::new(5u64)) as *mut c_void };
    0
}

unsafe extern "C" fn life_dtor(_instance: *const ModuleInstance, state: *mut c_void) {
    life_mark(&LIFE_DTOR_AT);
    let state = unsafe { Box::from_raw(state as *mut u64) };
    assert_eq!(*state, 5);
}

unsafe extern "C" fn life_on_start(instance: *const ModuleInstance) -> i32 {
    life_mark(&LIFE_START_AT);
    assert_eq!(unsafe { *((*instance).state as *const u64) }, 5);
    0
}

unsafe extern "C" fn life_on_stop(_instance: *const ModuleInstance) {
    life_mark(&LIFE_STOP_AT);
}

static LIFE_RECORD: ExportRecord = ExportRecord {
    constructor: Some(life_ctor),
    destructor: Some(life_dtor),
    on_start: Some(life_on_start),
    on_stop: Some(life_on_stop),
    ..ExportRecord::empty(c"life".as_ptr())
};

unsafe extern "C" fn life_exports(visit: ExportVisitFn, data: *mut c_void) {
    unsafe {
        let _ = visit(&LIFE_RECORD, data);
    }
}

#[test]
fn lifecycle_hooks_run_in_order() {
    init_logging();
    let ctx = Context::new();
    let set = LoadingSet::new();
    set.append_local(life_exports, |_| true).unwrap();
    set.finish(&ctx).unwrap();

    let module = ctx.find_module("life").unwrap();
    assert!(LIFE_CTOR_AT.load(Ordering::SeqCst) > 0);
    assert!(LIFE_START_AT.load(Ordering::SeqCst) > LIFE_CTOR_AT.load(Ordering::SeqCst));
    assert_eq!(LIFE_STOP_AT.load(Ordering::SeqCst), 0);

    ctx.unload(&module).unwrap();
    assert!(LIFE_STOP_AT.load(Ordering::SeqCst) > LIFE_START_AT.load(Ordering::SeqCst));
    assert!(LIFE_DTOR_AT.load(Ordering::SeqCst) > LIFE_STOP_AT.load(Ordering::SeqCst));
}

#[test]
fn pseudo_modules_survive_cleanup() {
    init_logging();
    let ctx = Context::new();
    let host = ctx.new_pseudo_module("host").unwrap();
    drop(host);
    ctx.cleanup_loose();
    assert_eq!(ctx.module_count(), 1);

    let host = ctx.find_module("host").unwrap();
    ctx.unload(&host).unwrap();
    assert_eq!(ctx.module_count(), 0);
}
