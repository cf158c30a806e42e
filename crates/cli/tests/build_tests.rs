//! End-to-end runs of the demo build script against a temporary tree

use fbuild::demo::{self, SOURCE_DIR_KEY};
use fbuild::{commands, BuildOptions, Context, ErrorKind};
use fbuild_utils::cancel::CancellationToken;
use fbuild_utils::interrupt::InterruptHandler;
use serial_test::serial;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

/// Let coarse file system clocks move past the previous build
fn settle() {
    thread::sleep(Duration::from_millis(50));
}

struct Project {
    dir: TempDir,
}

impl Project {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("lib")).unwrap();
        fs::write(src.join("main.c"), "int main(void) { return 0; }\n").unwrap();
        fs::write(src.join("lib/util.c"), "int util;\n").unwrap();
        Self { dir }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn src(&self) -> PathBuf {
        self.root().join("src")
    }

    fn out(&self, name: &str) -> PathBuf {
        self.root().join("build/out").join(name)
    }

    fn options(&self) -> BuildOptions {
        let mut options = BuildOptions::with_buildroot(self.root().join("build"));
        options.jobs = 4;
        options
            .extra
            .insert(SOURCE_DIR_KEY.to_string(), self.src().display().to_string());
        options
    }

    /// A fresh context, as a new process would create it
    fn context(&self) -> Context {
        let context = Context::new(
            self.options(),
            InterruptHandler::detached(CancellationToken::new()),
        )
        .unwrap();
        context.create_buildroot().unwrap();
        context.load_configuration();
        context
    }

    /// Run `target` in a fresh context and persist the cache afterwards
    fn run(&self, target: &str) -> Context {
        let context = self.context();
        demo::registry().run_target(target, &context).unwrap();
        context.shutdown();
        context.save_configuration().unwrap();
        context
    }
}

#[test]
fn test_second_build_is_fully_cached() {
    let project = Project::new();

    let first = project.run("build");
    assert_eq!(first.memo_stats().executions, 3);
    assert_eq!(
        fs::read_to_string(project.out("lib/util.c")).unwrap(),
        "int util;\n"
    );

    let second = project.run("build");
    let stats = second.memo_stats();
    assert_eq!(stats.executions, 0);
    assert_eq!(stats.hits, 3);
}

#[test]
fn test_editing_a_source_copies_only_that_file() {
    let project = Project::new();
    project.run("build");

    settle();
    fs::write(project.src().join("main.c"), "int main(void) { return 10; }\n").unwrap();
    let rebuilt = project.run("build");

    assert_eq!(rebuilt.memo_stats().executions, 1);
    assert!(fs::read_to_string(project.out("main.c"))
        .unwrap()
        .contains("return 10"));
}

#[test]
fn test_deleted_output_is_recreated() {
    let project = Project::new();
    project.run("build");

    fs::remove_file(project.out("main.c")).unwrap();
    let rebuilt = project.run("build");

    assert_eq!(rebuilt.memo_stats().executions, 1);
    assert!(project.out("main.c").exists());
}

#[test]
fn test_new_nested_file_is_picked_up() {
    let project = Project::new();
    project.run("build");

    settle();
    fs::write(project.src().join("lib/extra.c"), "int extra;\n").unwrap();
    let rebuilt = project.run("build");

    // The listing and the new copy run; the other copies are hits
    assert_eq!(rebuilt.memo_stats().executions, 2);
    assert!(project.out("lib/extra.c").exists());
}

#[test]
fn test_clearing_a_function_forces_it_to_run_again() {
    let project = Project::new();
    project.run("build");

    let context = project.context();
    commands::clear_function(&context, "copy").unwrap();
    let err = commands::clear_function(&context, "copy").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    context.save_configuration().unwrap();

    let rebuilt = project.run("build");
    assert_eq!(rebuilt.memo_stats().executions, 2);
}

#[test]
fn test_unknown_target_is_a_configuration_error() {
    let project = Project::new();
    let context = project.context();
    let err = demo::registry()
        .run_target("install", &context)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn test_interrupted_build_still_saves_finished_work() {
    let project = Project::new();
    project.run("configure");

    let context = project.context();
    context.interrupts().notify(2);
    let err = demo::registry().run_target("build", &context).unwrap_err();
    assert!(err.is_interrupt());

    context.shutdown();
    context.save_configuration().unwrap();

    // The listing cached before the interrupt survives
    let next = project.run("build");
    assert_eq!(next.memo_stats().executions, 2);
}

#[test]
#[serial]
fn test_run_returns_zero_then_reuses_the_cache() {
    let project = Project::new();
    let buildroot = project.root().join("build");
    let args = |extra: &[&str]| {
        let mut args = vec![
            "fbuild".to_string(),
            "--buildroot".to_string(),
            buildroot.display().to_string(),
            "--source-dir".to_string(),
            project.src().display().to_string(),
        ];
        args.extend(extra.iter().map(|s| s.to_string()));
        args
    };

    assert_eq!(fbuild::run(&demo::registry(), args(&["-j", "2"])), 0);
    assert!(project.out("main.c").exists());
    assert!(buildroot.join("fbuild-state.db").exists());
    assert!(buildroot.join("fbuild.log").exists());

    assert_eq!(fbuild::run(&demo::registry(), args(&["--clear-function", "copy"])), 0);
    assert_eq!(fbuild::run(&demo::registry(), args(&["--clear-function", "copy"])), 1);
    assert_eq!(fbuild::run(&demo::registry(), args(&["missing-target"])), 1);
}
