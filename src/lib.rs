//! The `modhost` crate is the core runtime of a native plugin host.
//!
//! Independently built dynamic libraries ("modules") declare parameters,
//! file resources, imported namespaces, imported and exported symbols,
//! dependencies and lifecycle hooks through export records placed in a
//! section of their binary. The runtime discovers those records, stages
//! them in a [`LoadingSet`], negotiates a providers-first load order,
//! constructs every module, wires imports to exports under semantic
//! versioning and tracks references so modules can be unloaded safely.
//!
//! # Examples
//! ```no_run
//! use modhost::{Context, LoadingSet, Version};
//!
//! let ctx = Context::new();
//! let set = LoadingSet::new();
//! set.append_plugin("libgreeter.so", |_| true).unwrap();
//! set.finish(&ctx).unwrap();
//!
//! let host = ctx.new_pseudo_module("host").unwrap();
//! let greeter = ctx.find_module("greeter").unwrap();
//! ctx.link(&host, &greeter).unwrap();
//!
//! let symbol = ctx
//!     .load_symbol(&host, "greet", "", &Version::new(1, 0, 0))
//!     .unwrap();
//! let greet: extern "C" fn() = unsafe { std::mem::transmute(symbol.as_ptr()) };
//! greet();
//! ```

mod builder;
mod context;
mod error;
pub mod export;
pub mod find;
mod handle;
mod info;
mod loader;
mod param;
mod registry;
mod resolver;
mod set;
mod version;

pub use context::Context;
pub use error::{Error, Result};
pub use export::{
    ExportIter, ExportIteratorFn, ExportRecord, ExportVisitFn, DynSymbolCtorFn, DynSymbolDtorFn,
    ModifierDestructor, ModifierDestructorFn, ModuleCtorFn, ModuleDtorFn, ModuleInstance,
    ModuleStartFn, ModuleStopFn, RawDynamicExport, RawModifier, RawNamespaceImport, RawParamDecl,
    RawResourceDecl, RawStaticExport, RawSymbolImport, EXPORTS_SYMBOL, MODHOST_ABI,
    MODIFIER_DEBUG_INFO, MODIFIER_DEPENDENCY, MODIFIER_DESTRUCTOR, STRUCT_TYPE_MODULE_EXPORT,
};
pub use handle::ModuleHandle;
pub use info::{LockedSymbol, ModuleInfo, ModuleType, SymbolKey};
pub use param::{
    param_read_default, param_write_default, ParamAccess, ParamCell, ParamReadFn, ParamType,
    ParamValue, ParamWriteFn,
};
pub use set::LoadingSet;
pub use version::Version;
