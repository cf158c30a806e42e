//! Top-level dispatch: parse, build the context, run, persist, exit

use crate::cli::{Action, Cli};
use crate::commands;
use crate::context::Context;
use crate::registry::Registry;
use clap::{CommandFactory, FromArgMatches};
use fbuild_config::BuildOptions;
use fbuild_core::{Error, ErrorKind, Result, INTERRUPTED_EXIT_CODE};
use fbuild_utils::cancel::CancellationToken;
use fbuild_utils::interrupt::InterruptHandler;
use fbuild_utils::logging::{self, LogSettings};
use std::error::Error as _;
use std::ffi::OsString;
use std::panic::{self, AssertUnwindSafe};
use std::process::ExitCode;
use tracing::{debug, error, info, warn};

/// Exit status for a run that failed
pub const FAILURE_EXIT_CODE: i32 = 1;

/// Run `registry` with the process arguments and exit
pub fn main(registry: Registry) -> ExitCode {
    let code = run(&registry, std::env::args_os());
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// Run `registry` with `args` (program name first) and return the exit
/// status.
///
/// Does not return if the run was interrupted and the signal could be
/// re-raised.
pub fn run<I, T>(registry: &Registry, args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let command = registry
        .pre_options(Cli::command())
        .after_help(registry.help_text());
    let matches = match command.try_get_matches_from(args) {
        Ok(matches) => matches,
        Err(e) => {
            // Help and version requests print and exit 0
            let _ = e.print();
            return e.exit_code();
        }
    };

    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return e.exit_code();
        }
    };

    // No subscriber yet, so failures up to here go straight to stderr
    let options = match configure(registry, &cli, &matches) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("fbuild: {e}");
            return FAILURE_EXIT_CODE;
        }
    };

    let action = cli.action();
    if let Err(e) = init_logging(&options, &action) {
        eprintln!("fbuild: {e}");
        return FAILURE_EXIT_CODE;
    }

    if action == Action::Clean {
        return match commands::clean(&options.buildroot) {
            Ok(()) => 0,
            Err(e) => {
                report(&e);
                FAILURE_EXIT_CODE
            }
        };
    }

    let interrupts = match InterruptHandler::install(CancellationToken::new()) {
        Ok(handler) => handler,
        Err(e) => {
            report(&e);
            return FAILURE_EXIT_CODE;
        }
    };
    let context = match Context::new(options, interrupts) {
        Ok(context) => context,
        Err(e) => {
            report(&e);
            return FAILURE_EXIT_CODE;
        }
    };

    let code = execute(registry, &context, &action);
    if context.interrupted().is_some() {
        context.interrupts().reraise();
        return INTERRUPTED_EXIT_CODE;
    }
    code
}

fn configure(registry: &Registry, cli: &Cli, matches: &clap::ArgMatches) -> Result<BuildOptions> {
    let mut options = cli.build_options()?;
    registry.post_options(&mut options, matches)?;
    options.validate()?;
    Ok(options)
}

fn init_logging(options: &BuildOptions, action: &Action) -> Result<()> {
    // Cleaning must not recreate the tree it removes
    let log_file = (*action != Action::Clean).then(|| options.log_path());
    logging::init(&LogSettings {
        verbose: options.verbose,
        color: options.color,
        show_threads: options.show_threads,
        log_file,
    })
}

/// Everything after the context exists. The cache is saved on every path
/// out of here.
fn execute(registry: &Registry, context: &Context, action: &Action) -> i32 {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| dispatch(registry, context, action)))
        .unwrap_or_else(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            Err(Error::build(format!("build script panicked: {message}")))
        });

    context.shutdown();

    let memo = context.memo_stats();
    let cache = context.cache_stats();
    info!(
        hits = memo.hits,
        misses = memo.misses,
        executions = memo.executions,
        "build cache: {} hits, {} executions",
        memo.hits,
        memo.executions
    );
    debug!(
        entries = cache.entries,
        functions = cache.functions,
        files = cache.files,
        "cache store"
    );

    let saved = context.save_configuration();

    let mut code = 0;
    match outcome {
        Ok(()) => {}
        Err(e) if e.is_interrupt() || context.interrupted().is_some() => {
            warn!("build interrupted: {e}");
            code = INTERRUPTED_EXIT_CODE;
        }
        Err(e) => {
            report(&e);
            code = exit_code(&e);
        }
    }
    if let Err(e) = saved {
        report(&e);
        if code == 0 {
            code = FAILURE_EXIT_CODE;
        }
    }
    code
}

fn dispatch(registry: &Registry, context: &Context, action: &Action) -> Result<()> {
    context.create_buildroot()?;
    context.load_configuration();

    match action {
        Action::DumpState => commands::print_state(context),
        Action::ClearFunction(function) => commands::clear_function(context, function),
        Action::ClearFile(path) => commands::clear_file(context, path),
        Action::Clean => commands::clean(context.buildroot()),
        Action::Run(targets) => {
            // Resolve everything before building anything
            for target in targets {
                registry.lookup(target)?;
            }
            for target in targets {
                registry.run_target(target, context)?;
            }
            info!("build finished");
            Ok(())
        }
    }
}

/// Exit status for an unrecovered error
pub fn exit_code(error: &Error) -> i32 {
    match error.kind() {
        ErrorKind::Interrupted => INTERRUPTED_EXIT_CODE,
        ErrorKind::Scheduler if error.is_interrupt() => INTERRUPTED_EXIT_CODE,
        ErrorKind::Configuration | ErrorKind::Build | ErrorKind::CacheIo | ErrorKind::Scheduler => {
            FAILURE_EXIT_CODE
        }
    }
}

/// Log `error` with its chain of causes
fn report(error: &Error) {
    error!("{error}");
    let mut source = error.source();
    while let Some(cause) = source {
        error!("  caused by: {cause}");
        source = cause.source();
    }
}
