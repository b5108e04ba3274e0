mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{config, shared, FailingSink, MemorySink, MockAdapter};
use package_harvester::{
    CheckpointStore, ConfigError, FailureKind, HarvestPipeline, PipelineError, RunPhase,
    SourceType,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn store(dir: &TempDir) -> Arc<CheckpointStore> {
    Arc::new(CheckpointStore::new(dir.path(), "test-run"))
}

#[tokio::test]
async fn test_fresh_run_exports_everything_and_finalizes() {
    let dir = TempDir::new().unwrap();
    let adapter = shared(MockAdapter::new(SourceType::Nix, &[&["curl", "git"], &["vim"]]));
    let sink = shared(MemorySink::default());

    let report = HarvestPipeline::new(config(dir.path(), &[SourceType::Nix]), store(&dir))
        .with_adapter(adapter.clone())
        .with_sink(sink.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(report.phase, RunPhase::Completed);
    assert_eq!(report.total_exported(), 3);
    assert_eq!(sink.ids(), vec!["nix:curl", "nix:git", "nix:vim"]);
    assert!(sink.finalized());

    let nix = report.source(SourceType::Nix).unwrap();
    assert_eq!(nix.pages, 2);
    // The final page resumes from its own start.
    assert_eq!(nix.cursor.as_deref(), Some("1"));

    let reloaded = store(&dir);
    let state = reloaded.load(SourceType::Nix).unwrap().unwrap();
    assert_eq!(state.completed_ids.len(), 3);
    assert_eq!(state.cursor.as_deref(), Some("1"));
}

#[tokio::test]
async fn test_resume_only_attempts_remaining_items() {
    let dir = TempDir::new().unwrap();
    let previous = store(&dir);
    previous.record_completed(SourceType::Arch, "a");
    previous.record_completed(SourceType::Arch, "b");
    previous.persist(SourceType::Arch).unwrap();

    let adapter = shared(MockAdapter::new(SourceType::Arch, &[&["a", "b", "c"]]));
    let sink = shared(MemorySink::default());
    let report = HarvestPipeline::new(config(dir.path(), &[SourceType::Arch]), store(&dir))
        .with_adapter(adapter.clone())
        .with_sink(sink.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(adapter.fetched(), vec!["c"]);
    assert_eq!(sink.ids(), vec!["arch:c"]);
    let arch = report.source(SourceType::Arch).unwrap();
    assert_eq!(arch.skipped, 2);
    assert_eq!(arch.dispatched, 1);
    assert_eq!(arch.exported, 1);
}

#[tokio::test]
async fn test_malformed_item_fails_alone() {
    let dir = TempDir::new().unwrap();
    let adapter = shared(
        MockAdapter::new(SourceType::Arch, &[&["firefox", "broken", "yay"]]).with_malformed("broken"),
    );
    let sink = shared(MemorySink::default());

    let report = HarvestPipeline::new(config(dir.path(), &[SourceType::Arch]), store(&dir))
        .with_adapter(adapter.clone())
        .with_sink(sink.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(report.phase, RunPhase::Completed);
    assert_eq!(sink.ids(), vec!["arch:firefox", "arch:yay"]);
    let arch = report.source(SourceType::Arch).unwrap();
    assert_eq!(arch.failures(FailureKind::Malformed), 1);
    assert_eq!(arch.exported, 2);
    // The page held a failure, so the cursor stays put.
    assert_eq!(arch.cursor, None);
}

#[tokio::test]
async fn test_sink_failure_is_not_checkpointed() {
    let dir = TempDir::new().unwrap();
    let adapter = shared(MockAdapter::new(SourceType::Nix, &[&["a", "b", "c"]]));
    let memory = shared(MemorySink::default());

    let report = HarvestPipeline::new(config(dir.path(), &[SourceType::Nix]), store(&dir))
        .with_adapter(adapter)
        .with_sink(shared(FailingSink::rejecting(&["b"])))
        .with_sink(memory.clone())
        .run()
        .await
        .unwrap();

    // The healthy sink still received every record.
    assert_eq!(memory.ids(), vec!["nix:a", "nix:b", "nix:c"]);
    assert_eq!(report.source(SourceType::Nix).unwrap().failures(FailureKind::Export), 1);

    let reloaded = store(&dir);
    reloaded.load(SourceType::Nix).unwrap();
    assert!(reloaded.is_completed(SourceType::Nix, "a"));
    assert!(!reloaded.is_completed(SourceType::Nix, "b"));
    assert!(reloaded.is_completed(SourceType::Nix, "c"));
}

#[tokio::test]
async fn test_item_limit_is_global() {
    let dir = TempDir::new().unwrap();
    let nix = shared(MockAdapter::new(SourceType::Nix, &[&["a", "b", "c", "d"]]));
    let arch = shared(MockAdapter::new(SourceType::Arch, &[&["e", "f", "g", "h"]]));
    let mut config = config(dir.path(), &[SourceType::Nix, SourceType::Arch]);
    config.item_limit = Some(3);

    let report = HarvestPipeline::new(config, store(&dir))
        .with_adapter(nix.clone())
        .with_adapter(arch.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(report.total_dispatched(), 3);
    assert_eq!(nix.fetched().len() + arch.fetched().len(), 3);
    assert!(report.limit_reached);
}

#[tokio::test]
async fn test_duplicate_ids_are_dispatched_once() {
    let dir = TempDir::new().unwrap();
    let adapter = shared(MockAdapter::new(SourceType::Flathub, &[&["org.a.App", "org.b.App"], &["org.b.App"]]));
    let mut config = config(dir.path(), &[SourceType::Flathub]);
    config.credentials.insert(SourceType::Flathub, "token".to_string());

    let report = HarvestPipeline::new(config, store(&dir))
        .with_adapter(adapter.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(adapter.fetched(), vec!["org.a.App", "org.b.App"]);
    assert_eq!(report.total_dispatched(), 2);
}

#[tokio::test]
async fn test_cancelled_before_start_dispatches_nothing() {
    let dir = TempDir::new().unwrap();
    let adapter = shared(MockAdapter::new(SourceType::Nix, &[&["a", "b"]]));
    let token = CancellationToken::new();
    token.cancel();

    let report = HarvestPipeline::new(config(dir.path(), &[SourceType::Nix]), store(&dir))
        .with_adapter(adapter.clone())
        .with_cancellation(token)
        .run()
        .await
        .unwrap();

    assert_eq!(report.phase, RunPhase::Aborted);
    assert_eq!(report.total_dispatched(), 0);
    assert!(adapter.fetched().is_empty());
    // Checkpoint is still flushed.
    assert!(store(&dir).path_for(SourceType::Nix).exists());
}

#[tokio::test]
async fn test_run_timeout_cancels_in_flight_items() {
    let dir = TempDir::new().unwrap();
    let adapter = shared(
        MockAdapter::new(SourceType::Arch, &[&["slow-a", "slow-b"]]).with_delay(Duration::from_secs(30)),
    );
    let mut config = config(dir.path(), &[SourceType::Arch]);
    config.run_timeout_secs = Some(1);
    config.item_timeout_secs = 60;

    let report = HarvestPipeline::new(config, store(&dir))
        .with_adapter(adapter)
        .run()
        .await
        .unwrap();

    assert_eq!(report.phase, RunPhase::Aborted);
    let arch = report.source(SourceType::Arch).unwrap();
    assert_eq!(arch.failures(FailureKind::Cancelled), 2);
    assert_eq!(arch.exported, 0);
}

#[tokio::test]
async fn test_invalid_config_fails_before_any_fetch() {
    let dir = TempDir::new().unwrap();
    let adapter = shared(MockAdapter::new(SourceType::Flathub, &[&["org.a.App"]]));

    let result = HarvestPipeline::new(config(dir.path(), &[SourceType::Flathub]), store(&dir))
        .with_adapter(adapter.clone())
        .run()
        .await;

    assert!(matches!(result, Err(PipelineError::Config(_))));
    assert!(adapter.fetched().is_empty());
}

#[tokio::test]
async fn test_missing_adapter_is_fatal() {
    let dir = TempDir::new().unwrap();
    let result = HarvestPipeline::new(config(dir.path(), &[SourceType::Nix]), store(&dir))
        .run()
        .await;
    assert!(matches!(result, Err(PipelineError::MissingAdapter(SourceType::Nix))));
}

#[tokio::test]
async fn test_corrupt_checkpoint_aborts_run() {
    let dir = TempDir::new().unwrap();
    std::fs::write(store(&dir).path_for(SourceType::Nix), "{ not json").unwrap();
    let adapter = shared(MockAdapter::new(SourceType::Nix, &[&["a"]]));

    let result = HarvestPipeline::new(config(dir.path(), &[SourceType::Nix]), store(&dir))
        .with_adapter(adapter.clone())
        .run()
        .await;

    assert!(matches!(
        result,
        Err(PipelineError::Checkpoint {
            source_type: SourceType::Nix,
            pending: 0,
            ..
        })
    ));
    assert!(adapter.fetched().is_empty());
}

#[tokio::test]
async fn test_checkpoint_write_failure_reports_pending() {
    let dir = TempDir::new().unwrap();
    let checkpoint_dir = dir.path().join("checkpoints");
    let blocker = checkpoint_dir.clone();
    // Once enumeration starts, a plain file takes the directory's place.
    let adapter = shared(
        MockAdapter::new(SourceType::Nix, &[&["a", "b", "c"]]).on_enumerate(move || {
            let _ = std::fs::write(&blocker, b"not a directory");
        }),
    );
    let mut config = config(&checkpoint_dir, &[SourceType::Nix]);
    config.checkpoint_interval = 100;

    let result = HarvestPipeline::new(config, Arc::new(CheckpointStore::new(&checkpoint_dir, "test-run")))
        .with_adapter(adapter)
        .run()
        .await;

    match result {
        Err(PipelineError::Checkpoint {
            source_type,
            pending,
            ..
        }) => {
            assert_eq!(source_type, SourceType::Nix);
            assert_eq!(pending, 3);
        }
        other => panic!("expected checkpoint failure, got {:?}", other.map(|r| r.phase)),
    }
}

#[tokio::test]
async fn test_from_config_checkpoints_under_configured_dir() {
    let dir = TempDir::new().unwrap();
    let checkpoint_dir = dir.path().join("state");
    std::fs::create_dir(&checkpoint_dir).unwrap();
    let mut config = config(&checkpoint_dir, &[SourceType::Nix]);
    config.run_id = "nightly".to_string();

    let report = HarvestPipeline::from_config(config)
        .with_adapter(shared(MockAdapter::new(SourceType::Nix, &[&["a"]])))
        .run()
        .await
        .unwrap();

    assert_eq!(report.run_id, "nightly");
    assert!(checkpoint_dir.join("nightly.nix.checkpoint.json").exists());
    let reloaded = CheckpointStore::new(&checkpoint_dir, "nightly");
    reloaded.load(SourceType::Nix).unwrap();
    assert!(reloaded.is_completed(SourceType::Nix, "a"));
}

#[tokio::test]
async fn test_store_disagreeing_with_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let other = TempDir::new().unwrap();
    let adapter = shared(MockAdapter::new(SourceType::Nix, &[&["a"]]));

    let result = HarvestPipeline::new(config(dir.path(), &[SourceType::Nix]), store(&other))
        .with_adapter(adapter.clone())
        .run()
        .await;
    assert!(matches!(
        result,
        Err(PipelineError::Config(ConfigError::Invalid { field: "checkpoint_dir", .. }))
    ));

    let result = HarvestPipeline::new(
        config(dir.path(), &[SourceType::Nix]),
        Arc::new(CheckpointStore::new(dir.path(), "another-run")),
    )
    .with_adapter(adapter.clone())
    .run()
    .await;
    assert!(matches!(
        result,
        Err(PipelineError::Config(ConfigError::Invalid { field: "run_id", .. }))
    ));
    assert!(adapter.fetched().is_empty());
}

#[tokio::test]
async fn test_checkpoint_failure_stops_in_flight_exports() {
    let dir = TempDir::new().unwrap();
    let checkpoint_dir = dir.path().join("checkpoints");
    let blocker = checkpoint_dir.clone();
    let adapter = shared(
        MockAdapter::new(SourceType::Nix, &[&["a", "b", "c"]])
            .with_slow("b", Duration::from_millis(300))
            .with_slow("c", Duration::from_millis(300))
            .on_enumerate(move || {
                let _ = std::fs::write(&blocker, b"not a directory");
            }),
    );
    let sink = shared(MemorySink::default());

    let result = HarvestPipeline::new(
        config(&checkpoint_dir, &[SourceType::Nix]),
        Arc::new(CheckpointStore::new(&checkpoint_dir, "test-run")),
    )
    .with_adapter(adapter)
    .with_sink(sink.clone())
    .run()
    .await;
    assert!(matches!(result, Err(PipelineError::Checkpoint { .. })));

    // Workers still sleeping when the run failed never reach the sink.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(sink.ids(), vec!["nix:a"]);
}

#[tokio::test]
async fn test_panicking_fetch_is_counted_and_run_completes() {
    let dir = TempDir::new().unwrap();
    let adapter = shared(MockAdapter::new(SourceType::Arch, &[&["a", "bad", "c"]]).with_panic("bad"));
    let sink = shared(MemorySink::default());

    let report = HarvestPipeline::new(config(dir.path(), &[SourceType::Arch]), store(&dir))
        .with_adapter(adapter)
        .with_sink(sink.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(report.phase, RunPhase::Completed);
    assert_eq!(sink.ids(), vec!["arch:a", "arch:c"]);
    let arch = report.source(SourceType::Arch).unwrap();
    assert_eq!(arch.failures(FailureKind::Aborted), 1);
    assert_eq!(arch.exported, 2);
    assert_eq!(arch.cursor, None);
}
