//! Drives a loading set through resolution, construction and commit.
//!
//! `finish` is the single entry point that turns staged modules into
//! registered ones. It recomputes the construction order whenever a module
//! constructor appended more modules, re-probes every module right before
//! building it, and reports individual failures through the per-module
//! callback channel while registry-wide failures abort the call.

use crate::builder::build_module;
use crate::context::Context;
use crate::error::{busy, constructor_failed, cycle_error};
use crate::info::{ModuleInfo, ModuleType};
use crate::resolver;
use crate::set::{complete_pending, fail_pending, ErrorFlush, LoadingSet, PendingStatus};
use crate::{Error, Result};
use indexmap::IndexSet;
use std::collections::VecDeque;

/// Loads every staged module of `set` into the registry owned by `ctx`.
///
/// Individual module failures surface through their callbacks, not through
/// the return value; only registry-wide failures (a dependency cycle, a
/// concurrent load) fail the call itself.
pub(crate) fn finish(ctx: &Context, set: &LoadingSet) -> Result<()> {
    {
        let mut registry = ctx.registry();
        if registry.is_loading {
            return Err(busy("another load is already in progress"));
        }
        registry.is_loading = true;
    }
    {
        let mut state = set.state();
        if state.is_loading {
            ctx.registry().is_loading = false;
            return Err(busy("loading set is already being loaded"));
        }
        state.is_loading = true;
        state.loading_thread = Some(std::thread::current().id());
        state.needs_reorder = false;
    }
    log::info!("Finishing loading set");

    let result = drive(ctx, set);

    {
        let mut state = set.state();
        state.is_loading = false;
        state.loading_thread = None;
    }
    ctx.registry().is_loading = false;
    result
}

fn drive(ctx: &Context, set: &LoadingSet) -> Result<()> {
    let mut queue: VecDeque<String> = VecDeque::new();
    let mut stale = true;
    loop {
        let reorder = {
            let mut state = set.state();
            let reorder = stale || state.needs_reorder;
            state.needs_reorder = false;
            reorder
        };
        if reorder {
            stale = false;
            queue = reorder_queue(ctx, set)?;
        }

        let next = {
            let state = set.state();
            let mut next = None;
            while let Some(candidate) = queue.pop_front() {
                let unloaded = state
                    .modules
                    .get(&candidate)
                    .is_some_and(|pending| matches!(pending.status, PendingStatus::Unloaded));
                if unloaded {
                    next = Some(candidate);
                    break;
                }
            }
            next
        };
        let Some(name) = next else {
            if set.state().needs_reorder {
                // A constructor appended more modules after the queue
                // drained; pick them up.
                continue;
            }
            break;
        };

        // The registry may have changed since the order was computed (a
        // failed sibling released symbols it promised); re-check before
        // building.
        let probe = {
            let registry = ctx.registry();
            let state = set.state();
            match state.modules.get(&name) {
                Some(pending) => resolver::probe(&registry, &state, pending, &IndexSet::new()),
                None => continue,
            }
        };
        if let Err(err) = probe {
            fail_one(set, &name, err, false);
            continue;
        }

        let info = match build_module(ctx, set, &name) {
            Ok(info) => info,
            Err(err) => {
                // The builder already ran the record's cleanup path.
                fail_one(set, &name, err, true);
                continue;
            }
        };

        if let Err(err) = ctx.registry().add(&info) {
            info.detach();
            fail_one(set, &name, err, true);
            continue;
        }

        if let Err(err) = start_module(&info) {
            log::warn!("Module [{name}] failed to start: {err}");
            if let Err(remove_err) = ctx.registry().remove(&info) {
                log::warn!("Could not withdraw failed module [{name}]: {remove_err}");
            }
            info.detach();
            fail_one(set, &name, err, true);
            continue;
        }

        log::info!("Loaded module [{name}]");
        let (callbacks, owner) = {
            let mut state = set.state();
            complete_pending(&mut state, &name, &info)
        };
        for callback in callbacks {
            (callback.on_success)(&info);
        }
        if let Some(owner) = owner {
            let _ = owner.unlock_unload();
        }
    }
    Ok(())
}

/// Recomputes the construction order, failing every module the resolver
/// found unsatisfiable. A cycle fails every staged module and the call.
fn reorder_queue(ctx: &Context, set: &LoadingSet) -> Result<VecDeque<String>> {
    let resolution = {
        let registry = ctx.registry();
        let state = set.state();
        resolver::resolve(&registry, &state)
    };
    match resolution {
        Ok(resolution) => {
            let flushes: Vec<ErrorFlush> = {
                let mut state = set.state();
                resolution
                    .failures
                    .into_iter()
                    .filter_map(|(name, err)| fail_pending(&mut state, &name, err, false))
                    .collect()
            };
            for flush in flushes {
                flush.run();
            }
            Ok(resolution.order.into())
        }
        Err(err) => {
            fail_all(set, &err);
            Err(err)
        }
    }
}

/// Fails one staged module and runs its deferred work outside the mutex.
fn fail_one(set: &LoadingSet, name: &str, err: Error, already_cleaned: bool) {
    let flush = {
        let mut state = set.state();
        fail_pending(&mut state, name, err, already_cleaned)
    };
    if let Some(flush) = flush {
        flush.run();
    }
}

/// Fails every still-unloaded module with a copy of a set-wide error.
fn fail_all(set: &LoadingSet, err: &Error) {
    let flushes: Vec<ErrorFlush> = {
        let mut state = set.state();
        let names: Vec<String> = state
            .modules
            .iter()
            .filter(|(_, pending)| matches!(pending.status, PendingStatus::Unloaded))
            .map(|(name, _)| name.clone())
            .collect();
        names
            .into_iter()
            .filter_map(|name| {
                let copy = match err {
                    Error::Cycle { msg } => cycle_error(msg),
                    other => busy(other.to_string()),
                };
                fail_pending(&mut state, &name, copy, false)
            })
            .collect()
    };
    for flush in flushes {
        flush.run();
    }
}

/// Runs the `on_start` hook, if any, with no runtime lock held.
fn start_module(info: &ModuleInfo) -> Result<()> {
    let hook = info.with_live(|live| {
        Ok(live.record.and_then(|record| {
            record
                .on_start
                .map(|hook| (hook, live.tables.as_ref().map(|t| t.instance_ptr())))
        }))
    })?;
    if let Some((hook, Some(instance))) = hook {
        // Safety: the instance stays alive behind the info for the call.
        let code = unsafe { hook(instance) };
        if code != 0 {
            return Err(constructor_failed(code));
        }
    }
    Ok(())
}

/// Runs the `on_stop` hook, if any, with no runtime lock held.
fn stop_module(info: &ModuleInfo) {
    let hook = info
        .with_live(|live| {
            Ok(live.record.and_then(|record| {
                record
                    .on_stop
                    .map(|hook| (hook, live.tables.as_ref().map(|t| t.instance_ptr())))
            }))
        })
        .ok()
        .flatten();
    if let Some((hook, Some(instance))) = hook {
        // Safety: as for `start_module`.
        unsafe { hook(instance) };
    }
}

/// Withdraws a module from the registry, tears down its instance and
/// collects any modules that became loose.
pub(crate) fn unload(ctx: &Context, info: &ModuleInfo) -> Result<()> {
    log::info!("Unloading module [{}]", info.name());
    ctx.registry().remove(info)?;
    if info.module_type() == ModuleType::Regular {
        stop_module(info);
    }
    info.detach();
    cleanup_loose(ctx);
    Ok(())
}

/// Repeatedly removes Regular modules that nothing references: no
/// dependents, no locked symbols, no unload locks and no outstanding info
/// handles. Pseudo modules are never collected.
pub(crate) fn cleanup_loose(ctx: &Context) {
    loop {
        let Some(info) = ctx.registry().take_loose_module() else {
            break;
        };
        stop_module(&info);
        info.detach();
    }
}
