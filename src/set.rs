use crate::context::Context;
use crate::error::{busy, duplicate, invalid_argument, not_found};
use crate::export::validate::validate;
use crate::export::{cleanup_record, ExportIteratorFn, ExportRecord};
use crate::handle::ModuleHandle;
use crate::info::{ModuleInfo, SymbolKey};
use crate::version::Version;
use crate::{Error, Result};
use indexmap::IndexMap;
use spin::{Mutex, MutexGuard};
use std::path::Path;
use std::sync::Arc;
use std::thread::ThreadId;

/// Callback pair queued on a pending module; exactly one side runs when the
/// module reaches a terminal state.
pub struct LoadCallback {
    pub(crate) on_success: Box<dyn FnOnce(&ModuleInfo) + Send>,
    pub(crate) on_error: Box<dyn FnOnce(&Error) + Send>,
}

/// Terminal or staged state of a pending module. Transitions are
/// `Unloaded -> Loaded` or `Unloaded -> Error`, never back.
pub(crate) enum PendingStatus {
    Unloaded,
    Loaded(ModuleInfo),
    Error(Arc<Error>),
}

/// One module staged for loading.
pub(crate) struct PendingModule {
    pub name: String,
    /// Keeps the originating binary resident; absent for freestanding
    /// records, which live as long as their owner.
    pub handle: Option<ModuleHandle>,
    /// Owner of a freestanding record; holds an unload lock while the
    /// record is pending.
    pub owner: Option<ModuleInfo>,
    pub record: &'static ExportRecord,
    pub status: PendingStatus,
    pub callbacks: Vec<LoadCallback>,
}

impl PendingModule {
    /// Directory resource declarations resolve against.
    pub(crate) fn base_dir(&self) -> std::path::PathBuf {
        if let Some(handle) = &self.handle {
            return handle.base_dir().to_path_buf();
        }
        if let Some(owner) = &self.owner {
            if let Some(parent) = owner.module_path().parent() {
                return parent.to_path_buf();
            }
        }
        std::path::PathBuf::new()
    }
}

/// A symbol promised by a pending module.
pub(crate) struct SetSymbol {
    pub version: Version,
    pub provider: String,
}

pub(crate) struct SetState {
    pub modules: IndexMap<String, PendingModule>,
    pub symbols: IndexMap<SymbolKey, SetSymbol>,
    pub is_loading: bool,
    /// Thread driving the current load; its re-entrant appends (from module
    /// constructors) are allowed while everyone else gets `Busy`.
    pub loading_thread: Option<ThreadId>,
    pub needs_reorder: bool,
}

impl SetState {
    fn guard_append(&self) -> Result<()> {
        if self.is_loading && self.loading_thread != Some(std::thread::current().id()) {
            return Err(busy("loading set is currently being loaded"));
        }
        Ok(())
    }
}

/// Work that has to run after the set mutex is released: user callbacks,
/// record cleanup and owner unlocks must not see any runtime lock held.
pub(crate) struct ErrorFlush {
    pub callbacks: Vec<LoadCallback>,
    pub error: Arc<Error>,
    pub owner: Option<ModuleInfo>,
    pub cleanup: Option<&'static ExportRecord>,
}

impl ErrorFlush {
    pub(crate) fn run(self) {
        for callback in self.callbacks {
            (callback.on_error)(&self.error);
        }
        if let Some(record) = self.cleanup {
            cleanup_record(record);
        }
        if let Some(owner) = self.owner {
            let _ = owner.unlock_unload();
        }
    }
}

struct SetShared {
    state: Mutex<SetState>,
}

impl Drop for SetShared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let pending: Vec<ErrorFlush> = state
            .modules
            .values_mut()
            .filter(|pending| matches!(pending.status, PendingStatus::Unloaded))
            .map(|pending| abandon(pending))
            .collect();
        if !pending.is_empty() {
            log::debug!("Dropping loading set with {} pending modules", pending.len());
        }
        for flush in pending {
            flush.run();
        }
    }
}

fn abandon(pending: &mut PendingModule) -> ErrorFlush {
    let error = Arc::new(not_found(format!(
        "loading set was dismissed before module `{}` was loaded",
        pending.name
    )));
    pending.status = PendingStatus::Error(error.clone());
    ErrorFlush {
        callbacks: std::mem::take(&mut pending.callbacks),
        error,
        owner: pending.owner.clone(),
        cleanup: Some(pending.record),
    }
}

/// A staging area accumulating modules before they are committed to the
/// registry.
///
/// Clones share the same set; module constructors receive a pointer to the
/// set driving their load and may append further modules through it.
#[derive(Clone)]
pub struct LoadingSet {
    shared: Arc<SetShared>,
}

impl Default for LoadingSet {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadingSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SetShared {
                state: Mutex::new(SetState {
                    modules: IndexMap::new(),
                    symbols: IndexMap::new(),
                    is_loading: false,
                    loading_thread: None,
                    needs_reorder: false,
                }),
            }),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SetState> {
        self.shared.state.lock()
    }

    /// True if a module with `name` is staged in this set.
    pub fn has_module(&self, name: &str) -> bool {
        self.state().modules.contains_key(name)
    }

    /// True if a staged module provides `(name, namespace)` at a version
    /// compatible with `required`.
    pub fn has_symbol(&self, name: &str, namespace: &str, required: &Version) -> bool {
        self.state()
            .symbols
            .get(&SymbolKey::new(name, namespace))
            .is_some_and(|symbol| symbol.version.is_compatible_with(required))
    }

    /// Opens a plugin binary and stages every accepted export record.
    ///
    /// `filter` sees each validated record and may decline it. Records that
    /// fail validation or collide with modules already staged are rejected
    /// individually; the batch itself only fails if the binary cannot be
    /// opened or the set is being loaded by another thread.
    pub fn append_plugin(
        &self,
        path: impl AsRef<Path>,
        filter: impl FnMut(&ExportRecord) -> bool,
    ) -> Result<()> {
        let handle = ModuleHandle::open_plugin(path)?;
        self.append_handle(handle, filter)
    }

    /// Stages the export records of the running binary itself.
    pub fn append_local(
        &self,
        iterator: ExportIteratorFn,
        filter: impl FnMut(&ExportRecord) -> bool,
    ) -> Result<()> {
        let handle = ModuleHandle::open_local(iterator)?;
        self.append_handle(handle, filter)
    }

    fn append_handle(
        &self,
        handle: ModuleHandle,
        mut filter: impl FnMut(&ExportRecord) -> bool,
    ) -> Result<()> {
        let mut accepted = 0usize;
        for record in handle.exports() {
            if let Err(reason) = validate(record) {
                log::warn!("Rejecting export record {record:?}: {reason}");
                cleanup_record(record);
                continue;
            }
            if !filter(record) {
                log::trace!("Filter declined export record {:?}", record.name());
                continue;
            }
            let mut state = self.state();
            state.guard_append()?;
            match stage(&mut state, record, Some(handle.clone()), None) {
                Ok(()) => accepted += 1,
                Err(err) => {
                    drop(state);
                    log::warn!("Rejecting export record {:?}: {err}", record.name());
                    cleanup_record(record);
                }
            }
        }
        log::debug!(
            "Appended {accepted} modules from [{}]",
            handle.path().display()
        );
        Ok(())
    }

    /// Stages a single dynamically constructed record owned by a live
    /// module. The owner cannot be unloaded while the record is pending.
    ///
    /// # Safety
    /// `record` must stay valid until the pending module reaches a terminal
    /// state or the set is dropped; the owner's unload lock is the intended
    /// way to guarantee that.
    pub unsafe fn append_freestanding(
        &self,
        owner: &ModuleInfo,
        record: *const ExportRecord,
    ) -> Result<()> {
        if record.is_null() {
            return Err(invalid_argument("freestanding export record is null"));
        }
        // Safety: non-null per the check above; validity is the caller's
        // contract.
        let record: &'static ExportRecord = unsafe { &*record };
        if let Err(reason) = validate(record) {
            cleanup_record(record);
            return Err(invalid_argument(format!(
                "freestanding export record rejected: {reason}"
            )));
        }
        owner.lock_unload()?;
        let staged = {
            let mut state = self.state();
            state
                .guard_append()
                .and_then(|_| stage(&mut state, record, None, Some(owner.clone())))
        };
        if let Err(err) = staged {
            let _ = owner.unlock_unload();
            cleanup_record(record);
            return Err(err);
        }
        Ok(())
    }

    /// Queues a callback pair on a staged module. If the module already
    /// reached a terminal state the matching side runs immediately.
    pub fn add_callback(
        &self,
        module: &str,
        on_success: impl FnOnce(&ModuleInfo) + Send + 'static,
        on_error: impl FnOnce(&Error) + Send + 'static,
    ) -> Result<()> {
        enum Immediate {
            Queued,
            Success(ModuleInfo),
            Failure(Arc<Error>),
        }

        let mut on_success = Some(on_success);
        let mut on_error = Some(on_error);

        let immediate = {
            let mut state = self.state();
            let pending = state
                .modules
                .get_mut(module)
                .ok_or_else(|| not_found(format!("no pending module `{module}` in set")))?;
            match &pending.status {
                PendingStatus::Unloaded => {
                    pending.callbacks.push(LoadCallback {
                        on_success: Box::new(on_success.take().unwrap()),
                        on_error: Box::new(on_error.take().unwrap()),
                    });
                    Immediate::Queued
                }
                PendingStatus::Loaded(info) => Immediate::Success(info.clone()),
                PendingStatus::Error(err) => Immediate::Failure(err.clone()),
            }
        };
        match immediate {
            Immediate::Queued => {}
            Immediate::Success(info) => on_success.unwrap()(&info),
            Immediate::Failure(err) => on_error.unwrap()(&err),
        }
        Ok(())
    }

    /// Drives every staged module through resolution, construction and
    /// registry commit. Individual module failures are reported through
    /// their callbacks; see [`crate::loader`].
    pub fn finish(&self, ctx: &Context) -> Result<()> {
        crate::loader::finish(ctx, self)
    }

    /// Abandons the set: every staged module's error callbacks fire and its
    /// record is cleaned up. Fails with `Busy` while a load is running.
    pub fn dismiss(&self) -> Result<()> {
        let flushes: Vec<ErrorFlush> = {
            let mut state = self.state();
            if state.is_loading {
                return Err(busy("can not dismiss a loading set while it is loading"));
            }
            let flushes = state
                .modules
                .values_mut()
                .filter(|pending| matches!(pending.status, PendingStatus::Unloaded))
                .map(abandon)
                .collect();
            state.modules.clear();
            state.symbols.clear();
            flushes
        };
        log::debug!("Dismissing loading set ({} modules)", flushes.len());
        for flush in flushes {
            flush.run();
        }
        Ok(())
    }
}

/// Inserts an accepted record into the set maps. The caller cleans the
/// record up if staging fails.
fn stage(
    state: &mut SetState,
    record: &'static ExportRecord,
    handle: Option<ModuleHandle>,
    owner: Option<ModuleInfo>,
) -> Result<()> {
    let name = record.name().to_string_lossy().into_owned();
    if state.modules.contains_key(&name) {
        return Err(duplicate(format!("module `{name}` is already staged")));
    }

    let mut keys = Vec::new();
    for export in record.symbol_exports() {
        keys.push((
            SymbolKey::new(
                export.name().to_string_lossy(),
                export.namespace().to_string_lossy(),
            ),
            export.version,
        ));
    }
    for export in record.dynamic_symbol_exports() {
        keys.push((
            SymbolKey::new(
                export.name().to_string_lossy(),
                export.namespace().to_string_lossy(),
            ),
            export.version,
        ));
    }
    for (key, _) in &keys {
        if state.symbols.contains_key(key) {
            return Err(duplicate(format!(
                "symbol `{key}` is already promised by the set"
            )));
        }
    }

    for (key, version) in keys {
        state.symbols.insert(
            key,
            SetSymbol {
                version,
                provider: name.clone(),
            },
        );
    }
    log::debug!("Staged module [{name}]");
    state.modules.insert(
        name.clone(),
        PendingModule {
            name,
            handle,
            owner,
            record,
            status: PendingStatus::Unloaded,
            callbacks: Vec::new(),
        },
    );
    state.needs_reorder = true;
    Ok(())
}

/// Marks a staged module failed and hands back the work that must run
/// outside the set mutex. `already_cleaned` is set when the builder already
/// ran the record's cleanup path as part of its rollback.
pub(crate) fn fail_pending(
    state: &mut SetState,
    name: &str,
    error: Error,
    already_cleaned: bool,
) -> Option<ErrorFlush> {
    let pending = state.modules.get_mut(name)?;
    if !matches!(pending.status, PendingStatus::Unloaded) {
        return None;
    }
    log::warn!("Module [{name}] failed to load: {error}");
    let error = Arc::new(error);
    pending.status = PendingStatus::Error(error.clone());
    Some(ErrorFlush {
        callbacks: std::mem::take(&mut pending.callbacks),
        error,
        owner: pending.owner.clone(),
        cleanup: (!already_cleaned).then_some(pending.record),
    })
}

/// Marks a staged module loaded and hands back its queued callbacks plus
/// the owner unlock.
pub(crate) fn complete_pending(
    state: &mut SetState,
    name: &str,
    info: &ModuleInfo,
) -> (Vec<LoadCallback>, Option<ModuleInfo>) {
    let Some(pending) = state.modules.get_mut(name) else {
        return (Vec::new(), None);
    };
    pending.status = PendingStatus::Loaded(info.clone());
    (std::mem::take(&mut pending.callbacks), pending.owner.clone())
}
