//! Plugin path resolution.
//!
//! A bare file name passed to [`ModuleHandle::open_plugin`] is searched
//! through the directories named by the `MODHOST_PLUGIN_PATH` environment
//! variable, then the current directory. Anything containing a path
//! separator is taken as-is.
//!
//! [`ModuleHandle::open_plugin`]: crate::ModuleHandle::open_plugin

use crate::error::not_found;
use crate::Result;
use spin::Lazy;
use std::path::{Path, PathBuf};

/// Environment variable naming the plugin search directories.
pub const PLUGIN_PATH_VAR: &str = "MODHOST_PLUGIN_PATH";

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        const PATH_LIST_SEPARATOR: char = ';';
    } else {
        const PATH_LIST_SEPARATOR: char = ':';
    }
}

static PLUGIN_PATH: Lazy<Box<[PathBuf]>> = Lazy::new(|| {
    let list = std::env::var(PLUGIN_PATH_VAR).unwrap_or_default();
    split_path_list(&list)
});

fn split_path_list(list: &str) -> Box<[PathBuf]> {
    list.split(PATH_LIST_SEPARATOR)
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Resolves a plugin specifier to the path handed to the library loader.
pub(crate) fn resolve_plugin(spec: &Path) -> Result<PathBuf> {
    if spec.components().count() > 1 || spec.is_absolute() {
        return Ok(spec.to_path_buf());
    }
    // Search order: MODHOST_PLUGIN_PATH -> current directory.
    for dir in PLUGIN_PATH.iter().chain(std::iter::once(&PathBuf::from("."))) {
        let candidate = dir.join(spec);
        log::trace!("Try plugin candidate: [{}]", candidate.display());
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(not_found(format!(
        "can not find plugin: {}",
        spec.display()
    )))
}
