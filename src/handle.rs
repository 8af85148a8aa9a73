use crate::export::{collect_exports, ExportIter, ExportIteratorFn, EXPORTS_SYMBOL};
use crate::find::resolve_plugin;
use crate::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A reference-counted handle to a binary image carrying export records.
///
/// Every pending and live module originating from the binary holds a clone;
/// the image stays resident until the last clone drops, so raw pointers
/// into its export section stay valid for the life of every module built
/// from it.
#[derive(Clone)]
pub struct ModuleHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    /// Directory of the binary; resource declarations resolve against it.
    base_dir: PathBuf,
    path: PathBuf,
    iterator: ExportIteratorFn,
    /// Present for plugins; the host's own image needs no keep-alive.
    library: Option<libloading::Library>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if self.library.is_some() {
            log::info!("Releasing binary image [{}]", self.path.display());
        }
    }
}

impl ModuleHandle {
    /// Wraps the export iterator of the running binary itself.
    ///
    /// The binary's directory is taken from the current executable path.
    pub fn open_local(iterator: ExportIteratorFn) -> Result<Self> {
        let path = std::env::current_exe()?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        log::debug!("Opened local image [{}]", path.display());
        Ok(Self {
            inner: Arc::new(HandleInner {
                base_dir,
                path,
                iterator,
                library: None,
            }),
        })
    }

    /// Opens a plugin binary and retrieves its export iterator symbol.
    ///
    /// Bare file names are searched through `MODHOST_PLUGIN_PATH` and the
    /// current directory; see [`crate::find`].
    pub fn open_plugin(path: impl AsRef<Path>) -> Result<Self> {
        let path = resolve_plugin(path.as_ref())?;
        log::info!("Opening plugin [{}]", path.display());
        // Safety: loading a plugin runs its initializers; the caller vouches
        // for the binary the same way a dlopen caller does.
        let library = unsafe { libloading::Library::new(&path)? };
        let iterator = unsafe {
            let symbol = library.get::<ExportIteratorFn>(EXPORTS_SYMBOL)?;
            *symbol
        };
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(Self {
            inner: Arc::new(HandleInner {
                base_dir,
                path,
                iterator,
                library: Some(library),
            }),
        })
    }

    /// Directory of the underlying binary.
    #[inline]
    pub fn base_dir(&self) -> &Path {
        &self.inner.base_dir
    }

    /// Path of the underlying binary.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Walks the binary's export section.
    pub fn exports(&self) -> ExportIter {
        collect_exports(self.inner.iterator)
    }
}

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("path", &self.inner.path)
            .field("plugin", &self.inner.library.is_some())
            .finish()
    }
}
