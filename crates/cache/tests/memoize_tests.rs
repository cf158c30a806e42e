use fbuild_cache::{CallStatus, Database, FileDependency, Memoizer};
use fbuild_config::SignaturePolicy;
use fbuild_core::Result;
use fbuild_task::Scheduler;
use fbuild_utils::cancel::CancellationToken;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn memoizer(policy: SignaturePolicy) -> Arc<Memoizer> {
    Arc::new(Memoizer::new(
        Arc::new(Database::new(policy)),
        CancellationToken::new(),
    ))
}

/// Property: a pure call with fixed inputs runs its body once
#[test]
fn test_memoize_twice_executes_once() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("a.c");
    fs::write(&source, "int main() { return 0; }").unwrap();

    let memo = memoizer(SignaturePolicy::Metadata);
    let runs = AtomicUsize::new(0);
    let compile = || -> Result<_> {
        memo.memoize(
            "compile",
            &("a.c", "-O2"),
            &[FileDependency::input(&source)],
            |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(format!("compiled {} bytes", fs::read(&source)?.len()))
            },
        )
    };

    let first = compile().unwrap();
    let second = compile().unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(first.value, second.value);
    assert_eq!(second.status, CallStatus::Hit);
}

/// Property: changing a declared input yields a new key and a new run
#[test]
fn test_changed_input_is_a_miss() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("a.c");
    fs::write(&source, "int a;").unwrap();

    let memo = memoizer(SignaturePolicy::Content);
    let runs = AtomicUsize::new(0);
    let compile = || {
        memo.memoize("compile", "a.c", &[FileDependency::input(&source)], |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(fs::read_to_string(&source)?)
        })
    };

    let before = compile().unwrap();
    fs::write(&source, "int b;").unwrap();
    let after = compile().unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_ne!(before.fingerprint, after.fingerprint);
    assert_eq!(after.value, "int b;");
}

/// Property: a declared input that appears later invalidates the entry
#[test]
fn test_absent_input_appearing_is_a_miss() {
    let temp_dir = TempDir::new().unwrap();
    let optional = temp_dir.path().join("local.conf");

    let memo = memoizer(SignaturePolicy::Metadata);
    let configure = || {
        memo.memoize(
            "configure",
            &(),
            &[FileDependency::input(&optional)],
            |_| Ok(optional.exists()),
        )
    };

    assert!(!configure().unwrap().value);
    fs::write(&optional, "debug = true").unwrap();
    let second = configure().unwrap();

    assert_eq!(second.status, CallStatus::Executed);
    assert!(second.value);
}

/// Property: N concurrent callers of one fingerprint run the body once and
/// all observe its result
#[test]
fn test_concurrent_callers_execute_once() {
    const CALLERS: usize = 8;

    let memo = memoizer(SignaturePolicy::Metadata);
    let runs = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let memo = Arc::clone(&memo);
            let runs = Arc::clone(&runs);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                memo.memoize("codegen", "schema.json", &[], |_| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(50));
                    Ok(vec![1u8, 2, 3])
                })
                .unwrap()
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|r| r.value == vec![1u8, 2, 3]));
    assert_eq!(
        results
            .iter()
            .filter(|r| r.status == CallStatus::Executed)
            .count(),
        1
    );
    let stats = memo.stats();
    assert_eq!(stats.executions, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits + stats.misses, CALLERS as u64);
}

/// Two identical calls queued on a single worker, each waiting on a job it
/// submits, must both finish
#[test]
fn test_identical_jobs_with_nested_waits_on_one_worker() {
    let memo = memoizer(SignaturePolicy::Metadata);
    let pool = Arc::new(Scheduler::new(1, CancellationToken::new()).unwrap());
    let (release_tx, release_rx) = mpsc::channel::<()>();

    // Hold the only worker until both links are queued
    let gate = pool
        .submit("gate", move || {
            release_rx.recv().unwrap();
            Ok(())
        })
        .unwrap();
    let links: Vec<_> = (0..2)
        .map(|i| {
            let memo = Arc::clone(&memo);
            let inner = Arc::clone(&pool);
            pool.submit(format!("link-{i}"), move || {
                let linked = memo.memoize("link", "app", &[], |_| {
                    inner.submit("compile", || Ok(7u32))?.wait()
                })?;
                Ok(linked.value)
            })
            .unwrap()
        })
        .collect();
    release_tx.send(()).unwrap();
    gate.wait().unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        let values: Vec<u32> = links.into_iter().map(|h| h.wait().unwrap()).collect();
        done_tx.send(values).unwrap();
    });
    let values = done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("identical memoized jobs deadlocked");

    assert_eq!(values, vec![7, 7]);
    let stats = memo.stats();
    assert_eq!(stats.executions, 1);
    assert_eq!(stats.hits, 1);
    pool.shutdown();
}

/// Property: distinct fingerprints do not wait for each other
#[test]
fn test_distinct_calls_run_in_parallel() {
    let memo = memoizer(SignaturePolicy::Metadata);
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2u32)
        .map(|n| {
            let memo = Arc::clone(&memo);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                memo.memoize("step", &n, &[], |_| {
                    // Both bodies must be inside at the same time to pass
                    barrier.wait();
                    Ok(n)
                })
                .unwrap()
                .value
            })
        })
        .collect();

    let mut values: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    values.sort();
    assert_eq!(values, vec![0, 1]);
}

/// Property: clearing by function and by file report whether anything matched
#[test]
fn test_selective_clearing() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("a.c");
    fs::write(&source, "int a;").unwrap();

    let memo = memoizer(SignaturePolicy::Metadata);
    memo.memoize("compile", "a.c", &[FileDependency::input(&source)], |_| {
        Ok(())
    })
    .unwrap();
    memo.memoize("lint", "a.c", &[], |rec| {
        rec.input(&source);
        Ok(())
    })
    .unwrap();
    memo.memoize("unrelated", &(), &[], |_| Ok(())).unwrap();
    let db = memo.database();

    assert!(db.clear_function("compile"));
    assert!(!db.clear_function("compile"));

    assert!(db.clear_file(&source));
    assert!(!db.clear_file(&source));

    assert_eq!(db.len(), 1);
    assert_eq!(db.dump().entries[0].function, "unrelated");
}
