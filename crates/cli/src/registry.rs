//! Target registry and build script hooks
//!
//! A build script is a [`Registry`]: named targets plus two optional hooks
//! around option parsing. It is filled once before dispatch and read-only
//! afterwards.

use crate::context::Context;
use clap::{ArgMatches, Command};
use fbuild_config::BuildOptions;
use fbuild_core::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use tracing::info_span;

/// Entry point of a target
pub type TargetFn = Box<dyn Fn(&Context) -> Result<()> + Send + Sync>;

/// Adds arguments to the command line before it is parsed
pub type PreOptionsFn = Box<dyn Fn(Command) -> Command + Send + Sync>;

/// Adjusts the options after parsing, with access to the script's own
/// arguments
pub type PostOptionsFn = Box<dyn Fn(&mut BuildOptions, &ArgMatches) -> Result<()> + Send + Sync>;

struct Target {
    about: Option<String>,
    run: TargetFn,
}

/// Named targets and optional hooks of a build script
#[derive(Default)]
pub struct Registry {
    targets: BTreeMap<String, Target>,
    pre_options: Option<PreOptionsFn>,
    post_options: Option<PostOptionsFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`. A later registration under the same name replaces
    /// the earlier one.
    pub fn target<F>(self, name: impl Into<String>, run: F) -> Self
    where
        F: Fn(&Context) -> Result<()> + Send + Sync + 'static,
    {
        self.insert(name.into(), None, Box::new(run))
    }

    /// Register `name` with a one-line description shown in `--help`
    pub fn described_target<F>(self, name: impl Into<String>, about: impl Into<String>, run: F) -> Self
    where
        F: Fn(&Context) -> Result<()> + Send + Sync + 'static,
    {
        self.insert(name.into(), Some(about.into()), Box::new(run))
    }

    fn insert(mut self, name: String, about: Option<String>, run: TargetFn) -> Self {
        if self.targets.insert(name.clone(), Target { about, run }).is_some() {
            tracing::debug!(target_name = %name, "target registered twice; keeping the last");
        }
        self
    }

    pub fn on_pre_options<F>(mut self, hook: F) -> Self
    where
        F: Fn(Command) -> Command + Send + Sync + 'static,
    {
        self.pre_options = Some(Box::new(hook));
        self
    }

    pub fn on_post_options<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut BuildOptions, &ArgMatches) -> Result<()> + Send + Sync + 'static,
    {
        self.post_options = Some(Box::new(hook));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.targets.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }

    /// The entry point registered as `name`
    pub fn lookup(&self, name: &str) -> Result<&TargetFn> {
        self.targets
            .get(name)
            .map(|target| &target.run)
            .ok_or_else(|| Error::target_not_found(name))
    }

    /// Run the target `name` against `context`
    pub fn run_target(&self, name: &str, context: &Context) -> Result<()> {
        let run = self.lookup(name)?;
        let span = info_span!("target", name);
        let _enter = span.enter();
        tracing::info!("running target");
        run(context)
    }

    /// Apply the pre-options hook, if any
    pub fn pre_options(&self, command: Command) -> Command {
        match &self.pre_options {
            Some(hook) => hook(command),
            None => command,
        }
    }

    /// Apply the post-options hook, if any
    pub fn post_options(&self, options: &mut BuildOptions, matches: &ArgMatches) -> Result<()> {
        match &self.post_options {
            Some(hook) => hook(options, matches),
            None => Ok(()),
        }
    }

    /// Target list for `--help`
    pub fn help_text(&self) -> String {
        let mut text = String::from("Targets:\n");
        for (name, target) in &self.targets {
            match &target.about {
                Some(about) => text.push_str(&format!("  {name:<16}{about}\n")),
                None => text.push_str(&format!("  {name}\n")),
            }
        }
        text
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("targets", &self.targets.keys().collect::<Vec<_>>())
            .field("pre_options", &self.pre_options.is_some())
            .field("post_options", &self.post_options.is_some())
            .finish()
    }
}
