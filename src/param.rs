use crate::error::{permission_denied, type_mismatch};
use crate::info::ModuleInfo;
use crate::Result;
use std::ffi::c_void;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

/// Storage type of a module parameter.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamType {
    U8 = 0,
    U16 = 1,
    U32 = 2,
    U64 = 3,
    I8 = 4,
    I16 = 5,
    I32 = 6,
    I64 = 7,
}

impl ParamType {
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => ParamType::U8,
            1 => ParamType::U16,
            2 => ParamType::U32,
            3 => ParamType::U64,
            4 => ParamType::I8,
            5 => ParamType::I16,
            6 => ParamType::I32,
            7 => ParamType::I64,
            _ => return None,
        })
    }
}

impl Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ParamType::U8 => "u8",
            ParamType::U16 => "u16",
            ParamType::U32 => "u32",
            ParamType::U64 => "u64",
            ParamType::I8 => "i8",
            ParamType::I16 => "i16",
            ParamType::I32 => "i32",
            ParamType::I64 => "i64",
        };
        f.write_str(name)
    }
}

/// Access group gating one direction of a parameter.
///
/// `Public` is readable/writable by anyone holding the host context,
/// `Dependency` by modules with a dependency link to the owner, `Private`
/// only by the owner itself.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamAccess {
    Public = 0,
    Dependency = 1,
    Private = 2,
}

impl ParamAccess {
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => ParamAccess::Public,
            1 => ParamAccess::Dependency,
            2 => ParamAccess::Private,
            _ => return None,
        })
    }
}

impl Display for ParamAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ParamAccess::Public => "public",
            ParamAccess::Dependency => "dependency",
            ParamAccess::Private => "private",
        };
        f.write_str(name)
    }
}

/// A typed parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
}

impl ParamValue {
    /// The storage type this value belongs to.
    #[inline]
    pub fn param_type(&self) -> ParamType {
        match self {
            ParamValue::U8(_) => ParamType::U8,
            ParamValue::U16(_) => ParamType::U16,
            ParamValue::U32(_) => ParamType::U32,
            ParamValue::U64(_) => ParamType::U64,
            ParamValue::I8(_) => ParamType::I8,
            ParamValue::I16(_) => ParamType::I16,
            ParamValue::I32(_) => ParamType::I32,
            ParamValue::I64(_) => ParamType::I64,
        }
    }

    /// Canonical 64-bit representation used by the atomic store and the
    /// hook ABI. Signed values are sign-extended.
    #[inline]
    pub fn to_bits(self) -> u64 {
        match self {
            ParamValue::U8(v) => v as u64,
            ParamValue::U16(v) => v as u64,
            ParamValue::U32(v) => v as u64,
            ParamValue::U64(v) => v,
            ParamValue::I8(v) => v as i64 as u64,
            ParamValue::I16(v) => v as i64 as u64,
            ParamValue::I32(v) => v as i64 as u64,
            ParamValue::I64(v) => v as u64,
        }
    }

    /// Reinterprets canonical bits as a value of `ty`.
    #[inline]
    pub fn from_bits(ty: ParamType, bits: u64) -> Self {
        match ty {
            ParamType::U8 => ParamValue::U8(bits as u8),
            ParamType::U16 => ParamValue::U16(bits as u16),
            ParamType::U32 => ParamValue::U32(bits as u32),
            ParamType::U64 => ParamValue::U64(bits),
            ParamType::I8 => ParamValue::I8(bits as i8),
            ParamType::I16 => ParamValue::I16(bits as i16),
            ParamType::I32 => ParamValue::I32(bits as i32),
            ParamType::I64 => ParamValue::I64(bits as i64),
        }
    }
}

impl Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::U8(v) => write!(f, "{v}"),
            ParamValue::U16(v) => write!(f, "{v}"),
            ParamValue::U32(v) => write!(f, "{v}"),
            ParamValue::U64(v) => write!(f, "{v}"),
            ParamValue::I8(v) => write!(f, "{v}"),
            ParamValue::I16(v) => write!(f, "{v}"),
            ParamValue::I32(v) => write!(f, "{v}"),
            ParamValue::I64(v) => write!(f, "{v}"),
        }
    }
}

/// Read hook of a parameter. `data` is the owning [`ParamCell`];
/// `out_value` receives the canonical 64-bit representation.
pub type ParamReadFn = unsafe extern "C" fn(data: *const c_void, out_value: *mut u64);

/// Write hook of a parameter. `data` is the owning [`ParamCell`];
/// `in_value` holds the canonical 64-bit representation.
pub type ParamWriteFn = unsafe extern "C" fn(data: *const c_void, in_value: *const u64);

/// Default read hook: loads the atomic cell value.
pub unsafe extern "C" fn param_read_default(data: *const c_void, out_value: *mut u64) {
    let cell = unsafe { &*(data as *const ParamCell) };
    unsafe { *out_value = cell.value.load(Ordering::Acquire) };
}

/// Default write hook: stores into the atomic cell value.
pub unsafe extern "C" fn param_write_default(data: *const c_void, in_value: *const u64) {
    let cell = unsafe { &*(data as *const ParamCell) };
    cell.value.store(unsafe { *in_value }, Ordering::Release);
}

/// An atomically stored, access-gated parameter owned by one module.
///
/// The cell lives behind an `Arc` for the module's life; the instance table
/// hands its address to module code, which reaches it back through the
/// parameter hooks.
pub struct ParamCell {
    owner: String,
    name: String,
    ty: ParamType,
    value: AtomicU64,
    read_access: ParamAccess,
    write_access: ParamAccess,
    read_hook: ParamReadFn,
    write_hook: ParamWriteFn,
}

impl ParamCell {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        owner: &str,
        name: &str,
        ty: ParamType,
        default_bits: u64,
        read_access: ParamAccess,
        write_access: ParamAccess,
        read_hook: ParamReadFn,
        write_hook: ParamWriteFn,
    ) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            ty,
            value: AtomicU64::new(default_bits),
            read_access,
            write_access,
            read_hook,
            write_hook,
        }
    }

    /// Name of the module owning this parameter.
    #[inline]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Name of the parameter.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared storage type.
    #[inline]
    pub fn param_type(&self) -> ParamType {
        self.ty
    }

    /// Access group for reads.
    #[inline]
    pub fn read_access(&self) -> ParamAccess {
        self.read_access
    }

    /// Access group for writes.
    #[inline]
    pub fn write_access(&self) -> ParamAccess {
        self.write_access
    }

    /// True if any caller may read this parameter.
    #[inline]
    pub fn can_read_public(&self) -> bool {
        self.read_access == ParamAccess::Public
    }

    /// True if any caller may write this parameter.
    #[inline]
    pub fn can_write_public(&self) -> bool {
        self.write_access == ParamAccess::Public
    }

    /// True if `caller` may read at dependency level: it holds a dependency
    /// link to the owner and reads are not private.
    pub fn can_read_dependency(&self, caller: &ModuleInfo) -> bool {
        self.read_access != ParamAccess::Private && caller.has_dependency(&self.owner)
    }

    /// True if `caller` may write at dependency level.
    pub fn can_write_dependency(&self, caller: &ModuleInfo) -> bool {
        self.write_access != ParamAccess::Private && caller.has_dependency(&self.owner)
    }

    /// True if `caller` is the owner; the owner may always read.
    #[inline]
    pub fn can_read_private(&self, caller: &ModuleInfo) -> bool {
        caller.name() == self.owner
    }

    /// True if `caller` is the owner; the owner may always write.
    #[inline]
    pub fn can_write_private(&self, caller: &ModuleInfo) -> bool {
        caller.name() == self.owner
    }

    /// Reads through the read hook. The caller holds the owner's info mutex.
    pub(crate) fn read_hooked(&self) -> (ParamValue, ParamType) {
        let mut bits = 0u64;
        unsafe { (self.read_hook)(self as *const _ as *const c_void, &mut bits) };
        (ParamValue::from_bits(self.ty, bits), self.ty)
    }

    /// Writes through the write hook after checking the value type. The
    /// caller holds the owner's info mutex.
    pub(crate) fn write_hooked(&self, value: ParamValue) -> Result<()> {
        if value.param_type() != self.ty {
            return Err(type_mismatch(format!(
                "parameter `{}` stores {}, got {}",
                self.name,
                self.ty,
                value.param_type()
            )));
        }
        let bits = value.to_bits();
        unsafe { (self.write_hook)(self as *const _ as *const c_void, &bits) };
        Ok(())
    }

    /// Reads bypassing hooks and access checks; used to seed and inspect.
    #[inline]
    pub fn load(&self) -> ParamValue {
        ParamValue::from_bits(self.ty, self.value.load(Ordering::Acquire))
    }

    pub(crate) fn denied(&self, op: &str) -> crate::Error {
        permission_denied(format!("{op} access to parameter `{}`", self.name))
    }
}

impl std::fmt::Debug for ParamCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamCell")
            .field("owner", &self.owner)
            .field("name", &self.name)
            .field("type", &self.ty)
            .field("read_access", &self.read_access)
            .field("write_access", &self.write_access)
            .field("value", &self.load())
            .finish()
    }
}
