//! The build script shipped with the `fbuild` binary.
//!
//! `configure` lists the files under the source directory (`--source-dir`,
//! default `src`) and `build` copies each of them into `<buildroot>/out/`.
//! Every copy is a memoized call running as its own job, so a second build
//! only copies what changed.

use crate::context::Context;
use crate::registry::Registry;
use anyhow::Context as _;
use clap::Arg;
use fbuild_cache::{FileDependency, Memoized, Recorder};
use fbuild_core::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Key of the source directory in `BuildOptions::extra`
pub const SOURCE_DIR_KEY: &str = "source_dir";

const DEFAULT_SOURCE_DIR: &str = "src";

pub fn registry() -> Registry {
    Registry::new()
        .described_target("configure", "list the source files", |context| {
            let sources = configure(context)?;
            info!("{} source files", sources.len());
            Ok(())
        })
        .described_target("build", "copy the sources into <buildroot>/out", |context| {
            build(context).map(|_| ())
        })
        .on_pre_options(|command| {
            command.arg(
                Arg::new("source-dir")
                    .long("source-dir")
                    .value_name("DIR")
                    .default_value(DEFAULT_SOURCE_DIR)
                    .help("Directory holding the sources"),
            )
        })
        .on_post_options(|options, matches| {
            if let Some(dir) = matches.get_one::<String>("source-dir") {
                options.extra.insert(SOURCE_DIR_KEY.to_string(), dir.clone());
            }
            Ok(())
        })
}

fn source_dir(context: &Context) -> PathBuf {
    context
        .options()
        .extra
        .get(SOURCE_DIR_KEY)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOURCE_DIR))
}

/// Sorted list of the files below the source directory
pub fn configure(context: &Context) -> Result<Vec<PathBuf>> {
    let dir = source_dir(context);
    let listing = context.memoize("configure", &dir, &[FileDependency::input(&dir)], |recorder| {
        let mut sources = Vec::new();
        collect(&dir, &mut sources, recorder)?;
        sources.sort();
        Ok(sources)
    })?;
    Ok(listing.into_value())
}

// Subdirectories are recorded so that adding a nested file invalidates the
// listing
fn collect(dir: &Path, sources: &mut Vec<PathBuf>, recorder: &mut Recorder<'_>) -> anyhow::Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
    for entry in entries {
        let path = entry.with_context(|| format!("reading {}", dir.display()))?.path();
        if path.is_dir() {
            recorder.input(&path);
            collect(&path, sources, recorder)?;
        } else {
            sources.push(path);
        }
    }
    Ok(())
}

/// Copy every source into `<buildroot>/out`, returning the copies
pub fn build(context: &Context) -> Result<Vec<PathBuf>> {
    let sources = configure(context)?;
    let source_root = source_dir(context);
    let out_dir = context.buildroot().join("out");

    let worker = context.clone();
    let copies = context.scheduler().map("copy", sources, move |source| {
        copy(&worker, &source_root, &out_dir, source)
    })?;

    let copied = copies.iter().filter(|copy| !copy.was_cached()).count();
    info!("{} files up to date, {} copied", copies.len() - copied, copied);
    Ok(copies.into_iter().map(Memoized::into_value).collect())
}

fn copy(context: &Context, source_root: &Path, out_dir: &Path, source: PathBuf) -> Result<Memoized<PathBuf>> {
    let relative = source.strip_prefix(source_root).unwrap_or(&source);
    let target = out_dir.join(relative);
    let declared = [FileDependency::input(&source), FileDependency::output(&target)];

    context.memoize("copy", &(&source, &target), &declared, |_| {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::copy(&source, &target)
            .with_context(|| format!("copying {} to {}", source.display(), target.display()))?;
        Ok(target.clone())
    })
}
