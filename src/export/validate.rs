//! Pre-admission validation of export records.
//!
//! Every record surfaced by the section reader passes through
//! [`validate`] before it may enter a loading set. Validation is a pure
//! structural check; rejected records are warn-logged and cleaned up by the
//! caller, and never fail the surrounding batch.

use super::{
    ExportRecord, MODHOST_ABI, MODIFIER_DEBUG_INFO, MODIFIER_DEPENDENCY, MODIFIER_DESTRUCTOR,
    STRUCT_TYPE_MODULE_EXPORT,
};
use crate::param::{ParamAccess, ParamType};
use std::collections::HashSet;
use std::ffi::CStr;
use std::fmt::Display;

/// Why a record was refused admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Reject {
    BadStructType(u32),
    BadAbi(u32),
    ReservedNextSet,
    NullName,
    UnpairedLifecycle,
    ArrayLengthMismatch(&'static str),
    NullParamName,
    BadParamType(u32),
    BadParamAccess(u32),
    NullParamHook(String),
    DuplicateParam(String),
    NullResourcePath,
    AbsoluteResourcePath(String),
    NullNamespaceName,
    NullImportName,
    NullImportNamespace,
    UndeclaredImportNamespace(String),
    NullExportName,
    NullExportNamespace,
    NullExportSymbol(String),
    NullDynamicLifecycle(String),
    ExportCollision(String),
    NullModifierValue(u32),
    UnknownModifier(u32),
}

impl Display for Reject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reject::BadStructType(ty) => write!(f, "struct type {ty:#x} is not an export"),
            Reject::BadAbi(abi) => write!(f, "abi {abi} not supported (host speaks {MODHOST_ABI})"),
            Reject::ReservedNextSet => write!(f, "reserved `next` pointer is set"),
            Reject::NullName => write!(f, "record has no name"),
            Reject::UnpairedLifecycle => {
                write!(f, "constructor and destructor must be declared together")
            }
            Reject::ArrayLengthMismatch(which) => {
                write!(f, "{which} array pointer and count disagree")
            }
            Reject::NullParamName => write!(f, "parameter has no name"),
            Reject::BadParamType(ty) => write!(f, "parameter type {ty} out of range"),
            Reject::BadParamAccess(access) => write!(f, "parameter access {access} out of range"),
            Reject::NullParamHook(name) => write!(f, "parameter `{name}` is missing a hook"),
            Reject::DuplicateParam(name) => write!(f, "parameter `{name}` declared twice"),
            Reject::NullResourcePath => write!(f, "resource has no path"),
            Reject::AbsoluteResourcePath(path) => {
                write!(f, "resource path `{path}` must be relative")
            }
            Reject::NullNamespaceName => write!(f, "namespace import has no name"),
            Reject::NullImportName => write!(f, "symbol import has no name"),
            Reject::NullImportNamespace => write!(f, "symbol import has no namespace string"),
            Reject::UndeclaredImportNamespace(ns) => {
                write!(f, "symbol import from namespace `{ns}` lacks a namespace import")
            }
            Reject::NullExportName => write!(f, "symbol export has no name"),
            Reject::NullExportNamespace => write!(f, "symbol export has no namespace string"),
            Reject::NullExportSymbol(name) => write!(f, "static export `{name}` has no pointer"),
            Reject::NullDynamicLifecycle(name) => {
                write!(f, "dynamic export `{name}` is missing a constructor or destructor")
            }
            Reject::ExportCollision(key) => {
                write!(f, "export `{key}` collides within the record")
            }
            Reject::NullModifierValue(tag) => write!(f, "modifier with tag {tag} has no value"),
            Reject::UnknownModifier(tag) => write!(f, "modifier tag {tag} not recognized"),
        }
    }
}

fn display_key(name: &CStr, ns: &CStr) -> String {
    if ns.is_empty() {
        name.to_string_lossy().into_owned()
    } else {
        format!("{}::{}", ns.to_string_lossy(), name.to_string_lossy())
    }
}

fn check_array<T>(which: &'static str, ptr: *const T, len: u32) -> Result<(), Reject> {
    if ptr.is_null() != (len == 0) {
        return Err(Reject::ArrayLengthMismatch(which));
    }
    Ok(())
}

/// Checks a single record against the protocol. Performs no lookups beyond
/// the record itself.
pub(crate) fn validate(record: &ExportRecord) -> Result<(), Reject> {
    if record.struct_type != STRUCT_TYPE_MODULE_EXPORT {
        return Err(Reject::BadStructType(record.struct_type));
    }
    if record.abi != MODHOST_ABI {
        return Err(Reject::BadAbi(record.abi));
    }
    if !record.next.is_null() {
        return Err(Reject::ReservedNextSet);
    }
    if record.name.is_null() {
        return Err(Reject::NullName);
    }
    if record.constructor.is_some() != record.destructor.is_some() {
        return Err(Reject::UnpairedLifecycle);
    }

    check_array("parameters", record.parameters, record.parameters_len)?;
    check_array("resources", record.resources, record.resources_len)?;
    check_array(
        "namespace imports",
        record.namespace_imports,
        record.namespace_imports_len,
    )?;
    check_array("symbol imports", record.symbol_imports, record.symbol_imports_len)?;
    check_array("symbol exports", record.symbol_exports, record.symbol_exports_len)?;
    check_array(
        "dynamic symbol exports",
        record.dynamic_symbol_exports,
        record.dynamic_symbol_exports_len,
    )?;
    check_array("modifiers", record.modifiers, record.modifiers_len)?;

    let mut param_names = HashSet::new();
    for param in record.parameters() {
        if param.name.is_null() {
            return Err(Reject::NullParamName);
        }
        if ParamType::from_raw(param.param_type).is_none() {
            return Err(Reject::BadParamType(param.param_type));
        }
        if ParamAccess::from_raw(param.read_access).is_none() {
            return Err(Reject::BadParamAccess(param.read_access));
        }
        if ParamAccess::from_raw(param.write_access).is_none() {
            return Err(Reject::BadParamAccess(param.write_access));
        }
        let name = param.name().to_string_lossy().into_owned();
        if param.read.is_none() || param.write.is_none() {
            return Err(Reject::NullParamHook(name));
        }
        if !param_names.insert(name.clone()) {
            return Err(Reject::DuplicateParam(name));
        }
    }

    for resource in record.resources() {
        if resource.path.is_null() {
            return Err(Reject::NullResourcePath);
        }
        let path = resource.path().to_string_lossy();
        if path.starts_with('/') || path.starts_with('\\') {
            return Err(Reject::AbsoluteResourcePath(path.into_owned()));
        }
    }

    let mut namespaces = HashSet::new();
    for ns in record.namespace_imports() {
        if ns.name.is_null() {
            return Err(Reject::NullNamespaceName);
        }
        namespaces.insert(ns.name().to_bytes().to_vec());
    }

    let mut import_keys = HashSet::new();
    for import in record.symbol_imports() {
        if import.name.is_null() {
            return Err(Reject::NullImportName);
        }
        if import.namespace.is_null() {
            return Err(Reject::NullImportNamespace);
        }
        let ns = import.namespace();
        if !ns.is_empty() && !namespaces.contains(ns.to_bytes()) {
            return Err(Reject::UndeclaredImportNamespace(
                ns.to_string_lossy().into_owned(),
            ));
        }
        import_keys.insert((import.name().to_bytes().to_vec(), ns.to_bytes().to_vec()));
    }

    let mut export_keys = HashSet::new();
    let mut check_export = |name: &CStr, ns: &CStr| -> Result<(), Reject> {
        let key = (name.to_bytes().to_vec(), ns.to_bytes().to_vec());
        if import_keys.contains(&key) || !export_keys.insert(key) {
            return Err(Reject::ExportCollision(display_key(name, ns)));
        }
        Ok(())
    };

    for export in record.symbol_exports() {
        if export.name.is_null() {
            return Err(Reject::NullExportName);
        }
        if export.namespace.is_null() {
            return Err(Reject::NullExportNamespace);
        }
        if export.symbol.is_null() {
            return Err(Reject::NullExportSymbol(
                export.name().to_string_lossy().into_owned(),
            ));
        }
        check_export(export.name(), export.namespace())?;
    }

    for export in record.dynamic_symbol_exports() {
        if export.name.is_null() {
            return Err(Reject::NullExportName);
        }
        if export.namespace.is_null() {
            return Err(Reject::NullExportNamespace);
        }
        if export.constructor.is_none() || export.destructor.is_none() {
            return Err(Reject::NullDynamicLifecycle(
                export.name().to_string_lossy().into_owned(),
            ));
        }
        check_export(export.name(), export.namespace())?;
    }

    for modifier in record.modifiers() {
        match modifier.tag {
            MODIFIER_DESTRUCTOR | MODIFIER_DEPENDENCY => {
                if modifier.value.is_null() {
                    return Err(Reject::NullModifierValue(modifier.tag));
                }
            }
            MODIFIER_DEBUG_INFO => {}
            other => return Err(Reject::UnknownModifier(other)),
        }
    }

    Ok(())
}
