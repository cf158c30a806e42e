use fbuild_cache::{CallStatus, Database, FileDependency, Memoizer, STATE_MAGIC};
use fbuild_config::SignaturePolicy;
use fbuild_utils::cancel::CancellationToken;
use std::fs::{self, File};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tempfile::TempDir;

/// One process worth of cache: load, memoize, save
fn run_once(
    state: &Path,
    policy: SignaturePolicy,
    f: impl FnOnce(&Memoizer),
) -> Arc<Database> {
    let db = Arc::new(Database::load(state, policy));
    let memo = Memoizer::new(Arc::clone(&db), CancellationToken::new());
    f(&memo);
    db.save(state).unwrap();
    db
}

fn set_mtime(path: &Path, secs: u64) {
    let file = File::options().write(true).open(path).unwrap();
    file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

#[test]
fn test_save_then_load_reproduces_entries() {
    let temp_dir = TempDir::new().unwrap();
    let state = temp_dir.path().join("build").join("fbuild-state.db");
    let source = temp_dir.path().join("a.c");
    fs::write(&source, "int a;").unwrap();

    let mut fingerprints = Vec::new();
    let saved = run_once(&state, SignaturePolicy::Metadata, |memo| {
        for flags in ["-O0", "-O2"] {
            let result = memo
                .memoize(
                    "compile",
                    &flags,
                    &[FileDependency::input(&source)],
                    |rec| {
                        rec.output(temp_dir.path().join(format!("a{flags}.o")));
                        Ok(flags.len())
                    },
                )
                .unwrap();
            fingerprints.push(result.fingerprint);
        }
    });

    let loaded = Database::load(&state, SignaturePolicy::Metadata);
    assert_eq!(loaded.len(), 2);
    for fingerprint in &fingerprints {
        assert_eq!(loaded.lookup(fingerprint), saved.lookup(fingerprint));
    }
    assert_eq!(&fs::read(&state).unwrap()[..4], &STATE_MAGIC);
}

#[test]
fn test_corrupt_state_loads_empty_and_stays_usable() {
    let temp_dir = TempDir::new().unwrap();
    let state = temp_dir.path().join("fbuild-state.db");

    run_once(&state, SignaturePolicy::Metadata, |memo| {
        memo.memoize("step", &1, &[], |_| Ok(1u32)).unwrap();
    });
    let bytes = fs::read(&state).unwrap();

    for broken in [
        bytes[..bytes.len() / 2].to_vec(),
        b"garbage that is long enough to hold a header".to_vec(),
        Vec::new(),
    ] {
        fs::write(&state, &broken).unwrap();
        let db = Arc::new(Database::load(&state, SignaturePolicy::Metadata));
        assert!(db.is_empty());

        let memo = Memoizer::new(Arc::clone(&db), CancellationToken::new());
        let result = memo.memoize("step", &1, &[], |_| Ok(1u32)).unwrap();
        assert_eq!(result.status, CallStatus::Executed);
        db.save(&state).unwrap();
    }

    assert_eq!(Database::load(&state, SignaturePolicy::Metadata).len(), 1);
}

#[test]
fn test_nothing_is_persisted_until_save() {
    let temp_dir = TempDir::new().unwrap();
    let state = temp_dir.path().join("fbuild-state.db");

    let db = Arc::new(Database::load(&state, SignaturePolicy::Metadata));
    let memo = Memoizer::new(Arc::clone(&db), CancellationToken::new());
    memo.memoize("step", &1, &[], |_| Ok(())).unwrap();

    assert!(!state.exists());
}

/// a.c at T1 yields E1; touching it to T2 re-runs the compile step and yields
/// E2; moving it back to T1 still counts as a change under the metadata policy
#[test]
fn test_mtime_changes_across_runs_under_metadata_policy() {
    let temp_dir = TempDir::new().unwrap();
    let state = temp_dir.path().join("fbuild-state.db");
    let source = temp_dir.path().join("a.c");
    fs::write(&source, "x".repeat(100)).unwrap();
    set_mtime(&source, 1_000);

    let runs = AtomicUsize::new(0);
    let build = |memo: &Memoizer| {
        memo.memoize("compile", "a.c", &[FileDependency::input(&source)], |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap()
        .fingerprint
    };

    let mut e1 = None;
    run_once(&state, SignaturePolicy::Metadata, |memo| e1 = Some(build(memo)));

    let mut cached = None;
    run_once(&state, SignaturePolicy::Metadata, |memo| cached = Some(build(memo)));
    assert_eq!(cached, e1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    set_mtime(&source, 2_000);
    let mut e2 = None;
    let db = run_once(&state, SignaturePolicy::Metadata, |memo| e2 = Some(build(memo)));
    assert_ne!(e2, e1);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    // E1 no longer matches the file and was pruned on load
    assert_eq!(db.len(), 1);

    set_mtime(&source, 1_000);
    run_once(&state, SignaturePolicy::Metadata, |memo| {
        build(memo);
    });
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

#[test]
fn test_mtime_only_change_is_a_hit_under_content_policy() {
    let temp_dir = TempDir::new().unwrap();
    let state = temp_dir.path().join("fbuild-state.db");
    let source = temp_dir.path().join("a.c");
    fs::write(&source, "x".repeat(100)).unwrap();
    set_mtime(&source, 1_000);

    let runs = AtomicUsize::new(0);
    let build = |memo: &Memoizer| {
        memo.memoize("compile", "a.c", &[FileDependency::input(&source)], |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    };

    run_once(&state, SignaturePolicy::Content, build);
    set_mtime(&source, 2_000);
    run_once(&state, SignaturePolicy::Content, build);

    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_save_replaces_previous_state_atomically() {
    let temp_dir = TempDir::new().unwrap();
    let state = temp_dir.path().join("fbuild-state.db");
    fs::write(&state, "previous").unwrap();

    let db = Database::new(SignaturePolicy::Metadata);
    db.save(&state).unwrap();

    assert_eq!(&fs::read(&state).unwrap()[..4], &STATE_MAGIC);
    let leftovers = fs::read_dir(temp_dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .count();
    assert_eq!(leftovers, 0);
}
