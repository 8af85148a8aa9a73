use modhost::{
    Context, Error, ExportRecord, ExportVisitFn, LoadingSet, ModuleInstance, RawDynamicExport,
    RawNamespaceImport, RawStaticExport, RawSymbolImport, Version,
};
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// --- trivial load -----------------------------------------------------------

static TRIVIAL_VALUE: i32 = 5;
static TRIVIAL_EXPORTS: [RawStaticExport; 1] = [RawStaticExport {
    name: c"sym".as_ptr(),
    namespace: c"".as_ptr(),
    version: Version::new(1, 0, 0),
    symbol: &TRIVIAL_VALUE as *const i32 as *const c_void,
}];
static TRIVIAL_RECORD: ExportRecord = ExportRecord {
    symbol_exports: TRIVIAL_EXPORTS.as_ptr(),
    symbol_exports_len: 1,
    ..ExportRecord::empty(c"trivial".as_ptr())
};

unsafe extern "C" fn trivial_exports(visit: ExportVisitFn, data: *mut c_void) {
    unsafe {
        let _ = visit(&TRIVIAL_RECORD, data);
    }
}

#[test]
fn trivial_load_and_pseudo_access() {
    init_logging();
    let ctx = Context::new();
    let set = LoadingSet::new();
    set.append_local(trivial_exports, |_| true).unwrap();
    assert!(set.has_module("trivial"));
    assert!(set.has_symbol("sym", "", &Version::new(1, 0, 0)));
    assert!(!set.has_symbol("sym", "", &Version::new(1, 1, 0)));
    set.finish(&ctx).unwrap();

    let module = ctx.find_module("trivial").unwrap();
    assert!(module.is_loaded());

    // A module is not its own dependency.
    let err = ctx
        .load_symbol(&module, "sym", "", &Version::new(1, 0, 0))
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    let host = ctx.new_pseudo_module("host").unwrap();
    ctx.link(&host, &module).unwrap();
    let symbol = ctx
        .load_symbol(&host, "sym", "", &Version::new(1, 0, 0))
        .unwrap();
    let value = unsafe { *(symbol.as_ptr() as *const i32) };
    assert_eq!(value, 5);

    // Queued callbacks fire immediately once the module is terminal.
    let fired = Arc::new(AtomicBool::new(false));
    let observed = fired.clone();
    set.add_callback(
        "trivial",
        move |info| {
            assert_eq!(info.name(), "trivial");
            observed.store(true, Ordering::SeqCst);
        },
        |_| panic!("module loaded fine"),
    )
    .unwrap();
    assert!(fired.load(Ordering::SeqCst));

    ctx.verify_integrity().unwrap();
}

// --- version compatibility --------------------------------------------------

static VPROV_VALUE: i32 = 23;
static VPROV_EXPORTS: [RawStaticExport; 1] = [RawStaticExport {
    name: c"vsym".as_ptr(),
    namespace: c"vspace".as_ptr(),
    version: Version::new(2, 3, 0),
    symbol: &VPROV_VALUE as *const i32 as *const c_void,
}];
static VPROV_RECORD: ExportRecord = ExportRecord {
    symbol_exports: VPROV_EXPORTS.as_ptr(),
    symbol_exports_len: 1,
    ..ExportRecord::empty(c"vprov".as_ptr())
};

static V_NAMESPACES: [RawNamespaceImport; 1] = [RawNamespaceImport {
    name: c"vspace".as_ptr(),
}];
static VOK_IMPORTS: [RawSymbolImport; 1] = [RawSymbolImport {
    name: c"vsym".as_ptr(),
    namespace: c"vspace".as_ptr(),
    version: Version::new(2, 0, 0),
}];
static VOK_RECORD: ExportRecord = ExportRecord {
    namespace_imports: V_NAMESPACES.as_ptr(),
    namespace_imports_len: 1,
    symbol_imports: VOK_IMPORTS.as_ptr(),
    symbol_imports_len: 1,
    ..ExportRecord::empty(c"vok".as_ptr())
};

static VBAD_IMPORTS: [RawSymbolImport; 1] = [RawSymbolImport {
    name: c"vsym".as_ptr(),
    namespace: c"vspace".as_ptr(),
    version: Version::new(2, 4, 0),
}];
static VBAD_RECORD: ExportRecord = ExportRecord {
    namespace_imports: V_NAMESPACES.as_ptr(),
    namespace_imports_len: 1,
    symbol_imports: VBAD_IMPORTS.as_ptr(),
    symbol_imports_len: 1,
    ..ExportRecord::empty(c"vbad".as_ptr())
};

unsafe extern "C" fn version_exports(visit: ExportVisitFn, data: *mut c_void) {
    unsafe {
        if !visit(&VPROV_RECORD, data) {
            return;
        }
        if !visit(&VOK_RECORD, data) {
            return;
        }
        let _ = visit(&VBAD_RECORD, data);
    }
}

#[test]
fn version_compatibility_is_enforced() {
    init_logging();
    let ctx = Context::new();
    let set = LoadingSet::new();
    set.append_local(version_exports, |_| true).unwrap();

    let successes = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));
    for name in ["vprov", "vok"] {
        let successes = successes.clone();
        set.add_callback(name, move |_| {
            successes.fetch_add(1, Ordering::SeqCst);
        }, |err| panic!("unexpected load failure: {err}"))
            .unwrap();
    }
    {
        let errors = errors.clone();
        set.add_callback(
            "vbad",
            |_| panic!("vbad must not load"),
            move |err| {
                assert!(matches!(err, Error::NotFound { .. }));
                errors.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
    }

    set.finish(&ctx).unwrap();
    assert_eq!(successes.load(Ordering::SeqCst), 2);
    assert_eq!(errors.load(Ordering::SeqCst), 1);

    assert!(ctx.find_module("vprov").is_ok());
    assert!(ctx.find_module("vok").is_ok());
    assert!(ctx.find_module("vbad").is_err());

    // The dependent's import table points straight at the provider's cell.
    let importer = ctx.find_module("vok").unwrap();
    assert!(importer.has_dependency("vprov"));
    let instance = importer.instance_ptr();
    let imported = unsafe { (*instance).import(0) };
    assert_eq!(unsafe { *(imported as *const i32) }, 23);

    ctx.verify_integrity().unwrap();
}

// --- cycle rejection --------------------------------------------------------

static CYCA_VALUE: i32 = 1;
static CYCA_EXPORTS: [RawStaticExport; 1] = [RawStaticExport {
    name: c"csyma".as_ptr(),
    namespace: c"".as_ptr(),
    version: Version::new(1, 0, 0),
    symbol: &CYCA_VALUE as *const i32 as *const c_void,
}];
static CYCA_IMPORTS: [RawSymbolImport; 1] = [RawSymbolImport {
    name: c"csymb".as_ptr(),
    namespace: c"".as_ptr(),
    version: Version::new(1, 0, 0),
}];
static CYCA_RECORD: ExportRecord = ExportRecord {
    symbol_exports: CYCA_EXPORTS.as_ptr(),
    symbol_exports_len: 1,
    symbol_imports: CYCA_IMPORTS.as_ptr(),
    symbol_imports_len: 1,
    ..ExportRecord::empty(c"cyca".as_ptr())
};

static CYCB_VALUE: i32 = 2;
static CYCB_EXPORTS: [RawStaticExport; 1] = [RawStaticExport {
    name: c"csymb".as_ptr(),
    namespace: c"".as_ptr(),
    version: Version::new(1, 0, 0),
    symbol: &CYCB_VALUE as *const i32 as *const c_void,
}];
static CYCB_IMPORTS: [RawSymbolImport; 1] = [RawSymbolImport {
    name: c"csyma".as_ptr(),
    namespace: c"".as_ptr(),
    version: Version::new(1, 0, 0),
}];
static CYCB_RECORD: ExportRecord = ExportRecord {
    symbol_exports: CYCB_EXPORTS.as_ptr(),
    symbol_exports_len: 1,
    symbol_imports: CYCB_IMPORTS.as_ptr(),
    symbol_imports_len: 1,
    ..ExportRecord::empty(c"cycb".as_ptr())
};

unsafe extern "C" fn cycle_exports(visit: ExportVisitFn, data: *mut c_void) {
    unsafe {
        if !visit(&CYCA_RECORD, data) {
            return;
        }
        let _ = visit(&CYCB_RECORD, data);
    }
}

#[test]
fn cyclic_sets_are_rejected_whole() {
    init_logging();
    let ctx = Context::new();
    let set = LoadingSet::new();
    set.append_local(cycle_exports, |_| true).unwrap();

    let errors = Arc::new(AtomicUsize::new(0));
    for name in ["cyca", "cycb"] {
        let errors = errors.clone();
        set.add_callback(name, |_| panic!("cycle must not load"), move |err| {
            assert!(matches!(err, Error::Cycle { .. }));
            errors.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    let err = set.finish(&ctx).unwrap_err();
    assert!(matches!(err, Error::Cycle { .. }));
    assert_eq!(errors.load(Ordering::SeqCst), 2);
    assert_eq!(ctx.module_count(), 0);
    ctx.verify_integrity().unwrap();
}

// --- re-entrant appends from a constructor ----------------------------------

static INNER_RECORD: ExportRecord = ExportRecord::empty(c"inner".as_ptr());

unsafe extern "C" fn inner_exports(visit: ExportVisitFn, data: *mut c_void) {
    unsafe {
        let _ = visit(&INNER_RECORD, data);
    }
}

unsafe extern "C" fn outer_ctor(
    _instance: *const ModuleInstance,
    set: *const c_void,
    out_state: *mut *mut c_void,
) -> i32 {
    let set = unsafe { &*(set as *const LoadingSet) };
    set.append_local(inner_exports, |_| true)
        .expect("re-entrant append from the loading thread");
    unsafe { *out_state = std::ptr::null_mut() };
    0
}

unsafe extern "C" fn outer_dtor(_instance: *const ModuleInstance, _state: *mut c_void) {}

static OUTER_RECORD: ExportRecord = ExportRecord {
    constructor: Some(outer_ctor),
    destructor: Some(outer_dtor),
    ..ExportRecord::empty(c"outer".as_ptr())
};

unsafe extern "C" fn outer_exports(visit: ExportVisitFn, data: *mut c_void) {
    unsafe {
        let _ = visit(&OUTER_RECORD, data);
    }
}

#[test]
fn constructors_may_append_to_their_own_set() {
    init_logging();
    let ctx = Context::new();
    let set = LoadingSet::new();
    set.append_local(outer_exports, |_| true).unwrap();
    set.finish(&ctx).unwrap();

    assert!(ctx.find_module("outer").is_ok());
    assert!(ctx.find_module("inner").is_ok());
    ctx.verify_integrity().unwrap();
}

// --- freestanding records ---------------------------------------------------

static FOWNER_RECORD: ExportRecord = ExportRecord::empty(c"fowner".as_ptr());

unsafe extern "C" fn fowner_exports(visit: ExportVisitFn, data: *mut c_void) {
    unsafe {
        let _ = visit(&FOWNER_RECORD, data);
    }
}

static FREE_RECORD: ExportRecord = ExportRecord::empty(c"freestanding".as_ptr());

#[test]
fn freestanding_records_lock_their_owner() {
    init_logging();
    let ctx = Context::new();
    let set = LoadingSet::new();
    set.append_local(fowner_exports, |_| true).unwrap();
    set.finish(&ctx).unwrap();
    let owner = ctx.find_module("fowner").unwrap();

    let set = LoadingSet::new();
    unsafe { set.append_freestanding(&owner, &FREE_RECORD).unwrap() };
    assert_eq!(owner.unload_locks(), 1);

    // The owner cannot be unloaded while its record is pending.
    let err = ctx.unload(&owner).unwrap_err();
    assert!(matches!(err, Error::Busy { .. }));

    set.finish(&ctx).unwrap();
    assert_eq!(owner.unload_locks(), 0);
    assert!(ctx.find_module("freestanding").is_ok());
    ctx.verify_integrity().unwrap();
}

#[test]
fn dismissing_a_set_releases_owners_and_reports_errors() {
    init_logging();
    let ctx = Context::new();
    let set = LoadingSet::new();
    set.append_local(fowner_exports, |_| true).unwrap();
    set.finish(&ctx).unwrap();
    let owner = ctx.find_module("fowner").unwrap();

    let set = LoadingSet::new();
    unsafe { set.append_freestanding(&owner, &FREE_RECORD).unwrap() };
    let errored = Arc::new(AtomicBool::new(false));
    {
        let errored = errored.clone();
        set.add_callback(
            "freestanding",
            |_| panic!("dismissed modules never load"),
            move |_| {
                errored.store(true, Ordering::SeqCst);
            },
        )
        .unwrap();
    }
    set.dismiss().unwrap();
    assert!(errored.load(Ordering::SeqCst));
    assert_eq!(owner.unload_locks(), 0);
    assert!(ctx.find_module("freestanding").is_err());
}

// --- dynamic symbol exports -------------------------------------------------

static DYN_DTOR_RAN: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn dyn_ok_ctor(
    _instance: *const ModuleInstance,
    out_symbol: *mut *mut c_void,
) -> i32 {
    let boxed = Box::new(777i32);
    unsafe { *out_symbol = Box::into_raw(boxed) as *mut c_void };
    0
}

unsafe extern "C" fn dyn_ok_dtor(symbol: *mut c_void) {
    DYN_DTOR_RAN.fetch_add(1, Ordering::SeqCst);
    unsafe { drop(Box::from_raw(symbol as *mut i32)) };
}

unsafe extern "C" fn dyn_fail_ctor(
    _instance: *const ModuleInstance,
    _out_symbol: *mut *mut c_void,
) -> i32 {
    7
}

unsafe extern "C" fn dyn_fail_dtor(_symbol: *mut c_void) {
    panic!("a failed dynamic export has no destructor to run");
}

static DYNOK_EXPORTS: [RawDynamicExport; 1] = [RawDynamicExport {
    name: c"made".as_ptr(),
    namespace: c"".as_ptr(),
    version: Version::new(1, 0, 0),
    constructor: Some(dyn_ok_ctor),
    destructor: Some(dyn_ok_dtor),
}];
static DYNOK_RECORD: ExportRecord = ExportRecord {
    dynamic_symbol_exports: DYNOK_EXPORTS.as_ptr(),
    dynamic_symbol_exports_len: 1,
    ..ExportRecord::empty(c"dynok".as_ptr())
};

unsafe extern "C" fn dynok_exports(visit: ExportVisitFn, data: *mut c_void) {
    unsafe {
        let _ = visit(&DYNOK_RECORD, data);
    }
}

static FIRST_DTOR_RAN: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn dyn_first_dtor(symbol: *mut c_void) {
    FIRST_DTOR_RAN.fetch_add(1, Ordering::SeqCst);
    unsafe { drop(Box::from_raw(symbol as *mut i32)) };
}

static DYNFAIL_EXPORTS: [RawDynamicExport; 2] = [
    RawDynamicExport {
        name: c"first".as_ptr(),
        namespace: c"".as_ptr(),
        version: Version::new(1, 0, 0),
        constructor: Some(dyn_ok_ctor),
        destructor: Some(dyn_first_dtor),
    },
    RawDynamicExport {
        name: c"second".as_ptr(),
        namespace: c"".as_ptr(),
        version: Version::new(1, 0, 0),
        constructor: Some(dyn_fail_ctor),
        destructor: Some(dyn_fail_dtor),
    },
];
static DYNFAIL_RECORD: ExportRecord = ExportRecord {
    dynamic_symbol_exports: DYNFAIL_EXPORTS.as_ptr(),
    dynamic_symbol_exports_len: 2,
    ..ExportRecord::empty(c"dynfail".as_ptr())
};

unsafe extern "C" fn dynfail_exports(visit: ExportVisitFn, data: *mut c_void) {
    unsafe {
        let _ = visit(&DYNFAIL_RECORD, data);
    }
}

#[test]
fn dynamic_exports_construct_and_tear_down() {
    init_logging();
    let ctx = Context::new();
    let set = LoadingSet::new();
    set.append_local(dynok_exports, |_| true).unwrap();
    set.finish(&ctx).unwrap();

    let module = ctx.find_module("dynok").unwrap();
    let host = ctx.new_pseudo_module("dynhost").unwrap();
    ctx.link(&host, &module).unwrap();
    let symbol = ctx
        .load_symbol(&host, "made", "", &Version::new(1, 0, 0))
        .unwrap();
    assert_eq!(unsafe { *(symbol.as_ptr() as *const i32) }, 777);

    // The provider stays pinned while the symbol lock lives.
    let err = ctx.unload(&module).unwrap_err();
    assert!(matches!(err, Error::Busy { .. }));
    drop(symbol);

    ctx.unlink(&host, &module).unwrap();
    let before = DYN_DTOR_RAN.load(Ordering::SeqCst);
    ctx.unload(&module).unwrap();
    assert_eq!(DYN_DTOR_RAN.load(Ordering::SeqCst), before + 1);
    assert!(!module.is_loaded());
}

#[test]
fn failing_dynamic_export_unwinds_the_module() {
    init_logging();
    let ctx = Context::new();
    let set = LoadingSet::new();
    set.append_local(dynfail_exports, |_| true).unwrap();

    let errored = Arc::new(AtomicBool::new(false));
    {
        let errored = errored.clone();
        set.add_callback(
            "dynfail",
            |_| panic!("dynfail must not load"),
            move |err| {
                assert!(matches!(err, Error::ConstructorFailed { code: 7 }));
                errored.store(true, Ordering::SeqCst);
            },
        )
        .unwrap();
    }

    set.finish(&ctx).unwrap();
    assert!(errored.load(Ordering::SeqCst));
    // The already-built first export was destroyed during the unwind.
    assert_eq!(FIRST_DTOR_RAN.load(Ordering::SeqCst), 1);
    assert!(ctx.find_module("dynfail").is_err());
    ctx.verify_integrity().unwrap();
}

// --- unsatisfied namespace import ------------------------------------------

static NONS_NAMESPACES: [RawNamespaceImport; 1] = [RawNamespaceImport {
    name: c"nowhere".as_ptr(),
}];
static NONS_RECORD: ExportRecord = ExportRecord {
    namespace_imports: NONS_NAMESPACES.as_ptr(),
    namespace_imports_len: 1,
    ..ExportRecord::empty(c"nons".as_ptr())
};

unsafe extern "C" fn nons_exports(visit: ExportVisitFn, data: *mut c_void) {
    unsafe {
        let _ = visit(&NONS_RECORD, data);
    }
}

#[test]
fn missing_namespace_fails_only_that_module() {
    init_logging();
    let ctx = Context::new();
    let set = LoadingSet::new();
    set.append_local(nons_exports, |_| true).unwrap();
    set.append_local(trivial_exports, |_| true).unwrap();

    let errored = Arc::new(AtomicBool::new(false));
    {
        let errored = errored.clone();
        set.add_callback(
            "nons",
            |_| panic!("nons must not load"),
            move |err| {
                assert!(matches!(err, Error::NotFound { .. }));
                errored.store(true, Ordering::SeqCst);
            },
        )
        .unwrap();
    }

    set.finish(&ctx).unwrap();
    assert!(errored.load(Ordering::SeqCst));
    assert!(ctx.find_module("nons").is_err());
    assert!(ctx.find_module("trivial").is_ok());
    ctx.verify_integrity().unwrap();
}
