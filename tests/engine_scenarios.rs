/// End-to-end scenarios for the incremental decision engine
///
/// Each test drives a small "uppercase a.txt into out.txt" unit of work
/// through the engine and checks which path it took.
mod common;

use cachet::engine::{IncrementalEngine, Outcome, UnitOfWork, WorkResult};
use cachet::fingerprint::{Fingerprinter, InputChanges, PathSensitivity};
use cachet::outputs::{pack_outputs, OriginMetadata};
use cachet::service::{BuildCacheService, CompositeBuildCache, LocalBuildCache};
use cachet::{CacheError, CacheKey, Storage};
use common::{CancellingRemote, FlakyRemote, MemoryCache, TestWorkspace};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn uppercase_unit(base: &Path) -> UnitOfWork {
    UnitOfWork::new(":upper", "uppercase v1", base)
        .with_input("a.txt")
        .with_output("out.txt")
}

async fn run_uppercase(
    engine: &IncrementalEngine,
    unit: &UnitOfWork,
    calls: &AtomicUsize,
) -> WorkResult {
    let base = unit.base_dir.clone();
    engine
        .evaluate(unit, |_changes| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            let text = fs::read_to_string(base.join("a.txt"))?;
            fs::write(base.join("out.txt"), text.to_uppercase())?;
            anyhow::Ok(())
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_execute_then_up_to_date_then_execute_on_change() {
    let ws = TestWorkspace::new();
    ws.write("a.txt", "hello");
    let (engine, _storage) = ws.local_engine();
    let unit = uppercase_unit(&ws.work());
    let calls = AtomicUsize::new(0);

    let first = run_uppercase(&engine, &unit, &calls).await;
    assert_eq!(first.outcome, Outcome::Executed);
    assert_eq!(ws.read("out.txt"), "HELLO");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let second = run_uppercase(&engine, &unit, &calls).await;
    assert_eq!(second.outcome, Outcome::UpToDate);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(second.changes.is_none());

    ws.write("a.txt", "world");
    let third = run_uppercase(&engine, &unit, &calls).await;
    assert_eq!(third.outcome, Outcome::Executed);
    assert_eq!(ws.read("out.txt"), "WORLD");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let changes = third.changes.unwrap();
    assert!(changes.incremental);
    assert_eq!(changes.modified, vec![ws.work().join("a.txt")]);
}

#[tokio::test]
async fn test_deleted_output_is_restored_from_cache() {
    let ws = TestWorkspace::new();
    ws.write("a.txt", "hello");
    let (engine, _storage) = ws.local_engine();
    let unit = uppercase_unit(&ws.work());
    let calls = AtomicUsize::new(0);

    run_uppercase(&engine, &unit, &calls).await;
    fs::remove_file(ws.work().join("out.txt")).unwrap();

    let result = run_uppercase(&engine, &unit, &calls).await;
    assert_eq!(result.outcome, Outcome::CacheHit);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(ws.read("out.txt"), "HELLO");

    let origin = result.origin.unwrap();
    assert_eq!(origin.identity, ":upper");
    assert_eq!(Some(origin.cache_key), result.cache_key);

    // Restoration records state, so the next run is up to date
    let again = run_uppercase(&engine, &unit, &calls).await;
    assert_eq!(again.outcome, Outcome::UpToDate);
}

#[tokio::test]
async fn test_prepopulated_cache_hit_replaces_stale_output() {
    let ws = TestWorkspace::new();
    ws.write("a.txt", "hello");
    let (engine, storage) = ws.local_engine();
    let unit = uppercase_unit(&ws.work());

    // Build the entry another machine would have produced
    let producer = TestWorkspace::new();
    producer.write("a.txt", "hello");
    producer.write("out.txt", "HELLO");
    let fingerprint = cachet::fingerprint::Fingerprinter::new()
        .fingerprint(&unit.inputs, unit.sensitivity, &CancellationToken::new())
        .unwrap();
    let key = CacheKey::derive(&unit.implementation, &fingerprint, &unit.outputs);
    let payload = pack_outputs(
        &producer.work(),
        &unit.outputs,
        OriginMetadata::new(":upper", key, Duration::from_millis(42)),
    )
    .unwrap();
    storage.put(&key, &payload).unwrap();

    ws.write("out.txt", "stale");
    let calls = AtomicUsize::new(0);
    let result = run_uppercase(&engine, &unit, &calls).await;

    assert_eq!(result.outcome, Outcome::CacheHit);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(ws.read("out.txt"), "HELLO");
    assert_eq!(result.origin.unwrap().execution_time_ms, 42);
}

#[tokio::test]
async fn test_relocated_workspace_hits_shared_cache() {
    let first = TestWorkspace::new();
    let second = TestWorkspace::new();
    first.write("a.txt", "hello");
    second.write("a.txt", "hello");

    let storage = first.local_storage();
    let service: Arc<dyn BuildCacheService> = Arc::new(LocalBuildCache::new(Arc::clone(&storage)));
    let calls = AtomicUsize::new(0);

    let engine = IncrementalEngine::new(first.state_store(), Arc::clone(&service), CancellationToken::new());
    let built = run_uppercase(&engine, &uppercase_unit(&first.work()), &calls).await;
    assert_eq!(built.outcome, Outcome::Executed);

    let engine = IncrementalEngine::new(second.state_store(), service, CancellationToken::new());
    let restored = run_uppercase(&engine, &uppercase_unit(&second.work()), &calls).await;
    assert_eq!(restored.outcome, Outcome::CacheHit);
    assert_eq!(restored.cache_key, built.cache_key);
    assert_eq!(second.read("out.txt"), "HELLO");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_execution_records_nothing() {
    let ws = TestWorkspace::new();
    ws.write("a.txt", "hello");
    let (engine, storage) = ws.local_engine();
    let unit = uppercase_unit(&ws.work());

    let result = engine
        .evaluate(&unit, |_changes| async { Err::<(), _>(anyhow::anyhow!("compiler crashed")) })
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::Failed);
    assert_eq!(result.failure.unwrap().to_string(), "compiler crashed");
    assert!(engine.states().get(":upper").unwrap().is_none());
    assert_eq!(storage.stats().unwrap().total_objects, 0);

    let calls = AtomicUsize::new(0);
    let retry = run_uppercase(&engine, &unit, &calls).await;
    assert_eq!(retry.outcome, Outcome::Executed);
    assert!(!retry.changes.unwrap().incremental);
}

#[tokio::test]
async fn test_non_cacheable_unit_never_touches_cache() {
    let ws = TestWorkspace::new();
    ws.write("a.txt", "hello");
    let memory = Arc::new(MemoryCache::default());
    let engine = IncrementalEngine::new(ws.state_store(), memory.clone(), CancellationToken::new());
    let unit = uppercase_unit(&ws.work()).cacheable(false);
    let calls = AtomicUsize::new(0);

    let first = run_uppercase(&engine, &unit, &calls).await;
    assert_eq!(first.outcome, Outcome::Executed);
    assert!(first.cache_key.is_none());

    engine.states().remove(":upper").unwrap();
    let second = run_uppercase(&engine, &unit, &calls).await;
    assert_eq!(second.outcome, Outcome::Executed);

    assert_eq!(memory.loads.load(Ordering::SeqCst), 0);
    assert_eq!(memory.stores.load(Ordering::SeqCst), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_output_outside_base_dir_is_not_cached() {
    let ws = TestWorkspace::new();
    ws.write("a.txt", "hello");
    let memory = Arc::new(MemoryCache::default());
    let engine = IncrementalEngine::new(ws.state_store(), memory.clone(), CancellationToken::new());

    let unit = UnitOfWork::new(":escape", "copy", ws.work())
        .with_input("a.txt")
        .with_output("../escaped.txt");
    let result = engine
        .evaluate(&unit, |_changes| async { anyhow::Ok(()) })
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::Executed);
    assert!(result.cache_key.is_none());
    assert_eq!(memory.len(), 0);
}

#[tokio::test]
async fn test_broken_remote_degrades_to_local() {
    let ws = TestWorkspace::new();
    ws.write("a.txt", "hello");
    let storage = ws.local_storage();
    let local: Arc<dyn BuildCacheService> = Arc::new(LocalBuildCache::new(Arc::clone(&storage)));
    let remote = Arc::new(FlakyRemote::broken());
    let composite = Arc::new(CompositeBuildCache::new(local, remote.clone(), true));
    let engine = IncrementalEngine::new(ws.state_store(), composite.clone(), CancellationToken::new());
    let unit = uppercase_unit(&ws.work());
    let calls = AtomicUsize::new(0);

    assert_eq!(run_uppercase(&engine, &unit, &calls).await.outcome, Outcome::Executed);
    assert!(composite.remote_disabled());
    assert_eq!(run_uppercase(&engine, &unit, &calls).await.outcome, Outcome::UpToDate);

    engine.states().remove(":upper").unwrap();
    fs::remove_file(ws.work().join("out.txt")).unwrap();
    assert_eq!(run_uppercase(&engine, &unit, &calls).await.outcome, Outcome::CacheHit);
    assert_eq!(ws.read("out.txt"), "HELLO");

    // Only the first failing call reached the remote
    assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_corrupt_local_entry_is_a_miss() {
    let ws = TestWorkspace::new();
    ws.write("a.txt", "hello");
    let (engine, storage) = ws.local_engine();
    let unit = uppercase_unit(&ws.work());
    let calls = AtomicUsize::new(0);

    let first = run_uppercase(&engine, &unit, &calls).await;
    let key = first.cache_key.unwrap();
    let hex = key.to_hex();
    let entry = storage.root().join("objects").join(&hex[..2]).join(&hex[2..]);
    fs::write(&entry, b"garbage").unwrap();

    engine.states().remove(":upper").unwrap();
    let second = run_uppercase(&engine, &unit, &calls).await;
    assert_eq!(second.outcome, Outcome::Executed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Re-executing stored a fresh entry
    assert!(storage.get(&key).unwrap().is_some());
}

#[tokio::test]
async fn test_directory_inputs_report_incremental_changes() {
    let ws = TestWorkspace::new();
    ws.write("src/a.txt", "a");
    ws.write("src/b.txt", "b");
    let (engine, _storage) = ws.local_engine();
    let unit = UnitOfWork::new(":concat", "concat", ws.work())
        .with_input("src")
        .with_output("dist");

    let base = ws.work();
    let build = |base: std::path::PathBuf| {
        move |_changes: InputChanges| async move {
            let mut joined = String::new();
            for name in ["a.txt", "b.txt", "c.txt"] {
                if let Ok(text) = fs::read_to_string(base.join("src").join(name)) {
                    joined.push_str(&text);
                }
            }
            fs::create_dir_all(base.join("dist"))?;
            fs::write(base.join("dist/all.txt"), joined)?;
            anyhow::Ok(())
        }
    };

    let first = engine.evaluate(&unit, build(base.clone())).await.unwrap();
    let first_changes = first.changes.unwrap();
    assert!(!first_changes.incremental);
    assert_eq!(first_changes.added.len(), 2);

    ws.write("src/a.txt", "A");
    ws.write("src/c.txt", "c");
    fs::remove_file(base.join("src/b.txt")).unwrap();

    let second = engine.evaluate(&unit, build(base.clone())).await.unwrap();
    assert_eq!(second.outcome, Outcome::Executed);
    let changes = second.changes.unwrap();
    assert!(changes.incremental);
    assert_eq!(changes.modified, vec![base.join("src/a.txt")]);
    assert_eq!(changes.added, vec![base.join("src/c.txt")]);
    assert_eq!(changes.removed, vec![base.join("src/b.txt")]);
    assert_eq!(ws.read("dist/all.txt"), "Ac");
}

#[tokio::test]
async fn test_implementation_change_forces_full_rebuild() {
    let ws = TestWorkspace::new();
    ws.write("a.txt", "hello");
    let (engine, _storage) = ws.local_engine();
    let calls = AtomicUsize::new(0);

    run_uppercase(&engine, &uppercase_unit(&ws.work()), &calls).await;

    let mut changed = uppercase_unit(&ws.work());
    changed.implementation = "uppercase v2".to_string();
    let result = run_uppercase(&engine, &changed, &calls).await;

    assert_eq!(result.outcome, Outcome::Executed);
    assert!(!result.changes.unwrap().incremental);
}

#[tokio::test]
async fn test_path_sensitivity_none_ignores_renames() {
    let ws = TestWorkspace::new();
    ws.write("a.txt", "hello");
    let (engine, _storage) = ws.local_engine();

    let unit = |input: &str| {
        UnitOfWork::new(":content", "content only", ws.work())
            .with_input(input)
            .with_sensitivity(PathSensitivity::None)
            .with_output("out.txt")
    };
    let write_out = |base: std::path::PathBuf| {
        move |_changes: InputChanges| async move {
            fs::write(base.join("out.txt"), "done")?;
            anyhow::Ok(())
        }
    };

    let first = engine.evaluate(&unit("a.txt"), write_out(ws.work())).await.unwrap();
    assert_eq!(first.outcome, Outcome::Executed);

    fs::rename(ws.work().join("a.txt"), ws.work().join("renamed.txt")).unwrap();
    let second = engine
        .evaluate(&unit("renamed.txt"), write_out(ws.work()))
        .await
        .unwrap();
    assert_eq!(second.outcome, Outcome::UpToDate);
}

#[tokio::test]
async fn test_missing_input_is_fatal_io_error() {
    let ws = TestWorkspace::new();
    let (engine, _storage) = ws.local_engine();
    let unit = uppercase_unit(&ws.work());
    let calls = AtomicUsize::new(0);

    let err = engine
        .evaluate(&unit, |_changes| async {
            calls.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::Io { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancelled_build_does_not_run_work() {
    let ws = TestWorkspace::new();
    ws.write("a.txt", "hello");
    let cancel = CancellationToken::new();
    cancel.cancel();
    let engine = IncrementalEngine::new(
        ws.state_store(),
        Arc::new(MemoryCache::default()),
        cancel,
    );
    let calls = AtomicUsize::new(0);

    let err = engine
        .evaluate(&uppercase_unit(&ws.work()), |_changes| async {
            calls.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::Cancelled));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancellation_during_cache_lookup_does_not_run_work() {
    let ws = TestWorkspace::new();
    ws.write("a.txt", "hello");
    let cancel = CancellationToken::new();
    let remote = Arc::new(CancellingRemote::new(cancel.clone()));
    let engine = IncrementalEngine::new(ws.state_store(), remote.clone(), cancel);
    let unit = uppercase_unit(&ws.work());
    let calls = AtomicUsize::new(0);

    let err = engine
        .evaluate(&unit, |_changes| async {
            calls.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::Cancelled));
    assert_eq!(remote.loads.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(engine.states().get(":upper").unwrap().is_none());
}

#[tokio::test]
async fn test_unit_rewriting_its_input_converges() {
    let ws = TestWorkspace::new();
    ws.write("a.txt", "hello");
    let (engine, _storage) = ws.local_engine();
    // Appends a marker once, so the second run leaves the file alone
    let unit = UnitOfWork::new(":mark", "mark v1", ws.work())
        .with_input("a.txt")
        .with_output("a.txt");
    let calls = AtomicUsize::new(0);
    let base = ws.work();

    let run = || {
        let base = base.clone();
        let calls = &calls;
        let unit = &unit;
        let engine = &engine;
        async move {
            engine
                .evaluate(unit, |_changes| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let text = fs::read_to_string(base.join("a.txt"))?;
                    if !text.ends_with('!') {
                        fs::write(base.join("a.txt"), format!("{text}!"))?;
                    }
                    anyhow::Ok(())
                })
                .await
                .unwrap()
        }
    };

    let before = Fingerprinter::new()
        .fingerprint(&unit.inputs, unit.sensitivity, &CancellationToken::new())
        .unwrap();

    let first = run().await;
    assert_eq!(first.outcome, Outcome::Executed);
    assert_eq!(ws.read("a.txt"), "hello!");
    let recorded = engine.states().get(":mark").unwrap().unwrap();
    assert_eq!(recorded.inputs, before);

    let second = run().await;
    assert_eq!(second.outcome, Outcome::Executed);
    assert_eq!(ws.read("a.txt"), "hello!");

    let third = run().await;
    assert_eq!(third.outcome, Outcome::UpToDate);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_parallel_units_share_one_engine() {
    let ws = TestWorkspace::new();
    for i in 0..8 {
        ws.write(&format!("in{i}.txt"), &format!("value {i}"));
    }
    let (engine, _storage) = ws.local_engine();
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = Arc::clone(&engine);
        let base = ws.work();
        handles.push(tokio::spawn(async move {
            let unit = UnitOfWork::new(format!(":unit{i}"), "copy", base.clone())
                .with_input(&format!("in{i}.txt"))
                .with_output(format!("out{i}.txt"));
            engine
                .evaluate(&unit, |_changes| async move {
                    fs::copy(base.join(format!("in{i}.txt")), base.join(format!("out{i}.txt")))?;
                    anyhow::Ok(())
                })
                .await
                .unwrap()
                .outcome
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap(), Outcome::Executed);
    }
    assert_eq!(engine.states().list().unwrap().len(), 8);
}
