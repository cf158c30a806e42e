//! Maintenance commands that run instead of a build

use crate::context::Context;
use fbuild_core::{Error, Result};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tracing::info;

/// Remove the build root and everything below it.
///
/// Refuses to delete the working directory, one of its ancestors or the
/// file system root.
pub fn clean(buildroot: &Path) -> Result<()> {
    if !buildroot.exists() {
        info!(buildroot = %buildroot.display(), "nothing to clean");
        return Ok(());
    }

    let resolved = buildroot
        .canonicalize()
        .map_err(|e| Error::file_system(buildroot, "resolve build root", e))?;
    let cwd = std::env::current_dir()
        .and_then(|dir| dir.canonicalize())
        .map_err(|e| Error::file_system(".", "resolve working directory", e))?;
    if resolved.parent().is_none() || cwd.starts_with(&resolved) {
        return Err(Error::configuration(format!(
            "refusing to remove build root '{}': it contains the working directory",
            buildroot.display()
        )));
    }

    fs::remove_dir_all(&resolved)
        .map_err(|e| Error::file_system(buildroot, "remove build root", e))?;
    info!(buildroot = %buildroot.display(), "build root removed");
    Ok(())
}

/// Write the cache contents as JSON to `out`
pub fn dump_state(context: &Context, out: &mut dyn Write) -> Result<()> {
    let dump = context.database().dump();
    serde_json::to_writer_pretty(&mut *out, &dump)?;
    writeln!(out).map_err(|e| Error::file_system("<stdout>", "write", e))?;
    info!("{} cache entries", dump.len());
    Ok(())
}

/// Print the cache contents on stdout
pub fn print_state(context: &Context) -> Result<()> {
    let stdout = io::stdout();
    let mut lock = stdout.lock();
    dump_state(context, &mut lock)
}

/// Drop every cache entry for `function`
pub fn clear_function(context: &Context, function: &str) -> Result<()> {
    if !context.database().clear_function(function) {
        return Err(Error::configuration(format!(
            "no cache entries for function '{function}'"
        )));
    }
    info!(function, "cache entries cleared");
    Ok(())
}

/// Drop every cache entry that depends on `path`
pub fn clear_file(context: &Context, path: &Path) -> Result<()> {
    if !context.database().clear_file(path) {
        return Err(Error::configuration(format!(
            "no cache entries depend on '{}'",
            path.display()
        )));
    }
    info!(path = %path.display(), "cache entries cleared");
    Ok(())
}
