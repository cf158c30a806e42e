//! Command line definition
//!
//! Flags map one to one onto [`BuildOptions`]. Environment overrides are
//! applied first so that anything given on the command line wins.

use clap::{ArgAction, ArgGroup, Parser};
use fbuild_config::{BuildOptions, SignaturePolicy};
use fbuild_core::{Result, DEFAULT_TARGET};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fbuild")]
#[command(about = "Incremental build driver with a persistent build cache")]
#[command(version)]
#[command(group(
    ArgGroup::new("mode").args(["dump_state", "clean", "clear_function", "clear_file"])
))]
pub struct Cli {
    /// Increase diagnostic verbosity (repeat for more)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Number of worker threads [default: 1]
    #[arg(short, long, value_name = "N")]
    pub jobs: Option<usize>,

    /// Disable colored output
    #[arg(long)]
    pub nocolor: bool,

    /// Annotate output with the worker thread
    #[arg(long)]
    pub show_threads: bool,

    /// Ignore the saved build cache and reconfigure
    #[arg(long)]
    pub configure: bool,

    /// Root directory for build outputs and state [default: build]
    #[arg(long, value_name = "DIR")]
    pub buildroot: Option<PathBuf>,

    /// Cache state file, relative to the build root [default: fbuild-state.db]
    #[arg(long, value_name = "NAME")]
    pub state_file: Option<PathBuf>,

    /// Log file, relative to the build root [default: fbuild.log]
    #[arg(long, value_name = "NAME")]
    pub log_file: Option<PathBuf>,

    /// Print the cache contents and exit
    #[arg(long)]
    pub dump_state: bool,

    /// Remove the build root and exit
    #[arg(long)]
    pub clean: bool,

    /// Remove all cache entries for a function and exit
    #[arg(long, value_name = "NAME")]
    pub clear_function: Option<String>,

    /// Remove all cache entries depending on a file and exit
    #[arg(long, value_name = "PATH")]
    pub clear_file: Option<PathBuf>,

    /// Do not persist the cache at exit
    #[arg(long)]
    pub do_not_save_database: bool,

    /// How file dependencies are signed: metadata or content [default: metadata]
    #[arg(long, value_name = "POLICY")]
    pub signature: Option<SignaturePolicy>,

    /// Targets to run
    #[arg(value_name = "TARGET", default_value = DEFAULT_TARGET)]
    pub targets: Vec<String>,
}

/// What the invocation should do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Clean,
    DumpState,
    ClearFunction(String),
    ClearFile(PathBuf),
    Run(Vec<String>),
}

impl Cli {
    pub fn action(&self) -> Action {
        if self.clean {
            Action::Clean
        } else if self.dump_state {
            Action::DumpState
        } else if let Some(name) = &self.clear_function {
            Action::ClearFunction(name.clone())
        } else if let Some(path) = &self.clear_file {
            Action::ClearFile(path.clone())
        } else {
            Action::Run(self.targets.clone())
        }
    }

    /// Options from the process environment and this command line
    pub fn build_options(&self) -> Result<BuildOptions> {
        self.build_options_with_env(|name| std::env::var(name).ok())
    }

    /// Same as [`build_options`](Self::build_options) with an explicit
    /// environment lookup
    pub fn build_options_with_env<F>(&self, lookup: F) -> Result<BuildOptions>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = BuildOptions::default();
        options.apply_env_from(lookup)?;

        options.verbose = self.verbose;
        options.color = !self.nocolor;
        options.show_threads = self.show_threads;
        options.force_configuration = self.configure;
        options.save_database = !self.do_not_save_database;
        if let Some(jobs) = self.jobs {
            options.jobs = jobs;
        }
        if let Some(buildroot) = &self.buildroot {
            options.buildroot = buildroot.clone();
        }
        if let Some(state_file) = &self.state_file {
            options.state_file = state_file.clone();
        }
        if let Some(log_file) = &self.log_file {
            options.log_file = log_file.clone();
        }
        if let Some(policy) = self.signature {
            options.signature_policy = policy;
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use fbuild_core::{FBUILD_BUILDROOT_VAR, FBUILD_JOBS_VAR};

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("fbuild").chain(args.iter().copied())).unwrap()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults_run_the_build_target() {
        let cli = parse(&[]);
        assert_eq!(cli.action(), Action::Run(vec!["build".to_string()]));

        let options = cli.build_options_with_env(no_env).unwrap();
        assert_eq!(options, BuildOptions::default());
    }

    #[test]
    fn test_flags_map_onto_options() {
        let cli = parse(&[
            "-vv",
            "-j",
            "4",
            "--nocolor",
            "--show-threads",
            "--configure",
            "--buildroot",
            "out",
            "--state-file",
            "state.db",
            "--log-file",
            "run.log",
            "--do-not-save-database",
            "--signature",
            "content",
            "configure",
            "build",
        ]);
        let options = cli.build_options_with_env(no_env).unwrap();

        assert_eq!(options.verbose, 2);
        assert_eq!(options.jobs, 4);
        assert!(!options.color);
        assert!(options.show_threads);
        assert!(options.force_configuration);
        assert_eq!(options.state_path(), PathBuf::from("out/state.db"));
        assert_eq!(options.log_path(), PathBuf::from("out/run.log"));
        assert!(!options.save_database);
        assert_eq!(options.signature_policy, SignaturePolicy::Content);
        assert_eq!(
            cli.action(),
            Action::Run(vec!["configure".to_string(), "build".to_string()])
        );
    }

    #[test]
    fn test_command_line_wins_over_environment() {
        let env = |name: &str| match name {
            FBUILD_JOBS_VAR => Some("8".to_string()),
            FBUILD_BUILDROOT_VAR => Some("/tmp/env-root".to_string()),
            _ => None,
        };

        let from_env = parse(&[]).build_options_with_env(env).unwrap();
        assert_eq!(from_env.jobs, 8);
        assert_eq!(from_env.buildroot, PathBuf::from("/tmp/env-root"));

        let explicit = parse(&["-j", "1", "--buildroot", "mine"])
            .build_options_with_env(env)
            .unwrap();
        assert_eq!(explicit.jobs, 1);
        assert_eq!(explicit.buildroot, PathBuf::from("mine"));
    }

    #[test]
    fn test_modes_are_exclusive() {
        assert_eq!(parse(&["--clean"]).action(), Action::Clean);
        assert_eq!(
            parse(&["--clear-function", "compile"]).action(),
            Action::ClearFunction("compile".to_string())
        );
        assert!(Cli::try_parse_from(["fbuild", "--clean", "--dump-state"]).is_err());
    }

    #[test]
    fn test_unknown_signature_policy_is_rejected() {
        assert!(Cli::try_parse_from(["fbuild", "--signature", "fast"]).is_err());
    }
}
