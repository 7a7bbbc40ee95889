//! End-to-end coverage of the upload session state machine: chunk
//! sequencing, retry/backoff, pause/resume, cancellation, and events.

mod common;

use common::{FlakyAdapter, default_ctx, upload_manager};
use bytes::Bytes;
use media_plane::{
    adapters::{MemoryAdapter, StorageAdapter, TransferOptions},
    errors::CoreError,
    models::session::{ChunkOutcome, SessionStatus},
    services::events::Event,
};
use std::sync::Arc;

#[tokio::test]
async fn chunk_count_rounds_up() {
    let manager = upload_manager(Arc::new(MemoryAdapter::new()));
    let init = manager
        .create_session("video.mp4", 10, Some(4), &default_ctx())
        .await
        .unwrap();
    assert_eq!(init.total_chunks, 3);
    assert_eq!(init.chunk_urls.len(), 3);
    assert_eq!(init.session.status, SessionStatus::Pending);
    assert_eq!(init.session.bytes_uploaded, 0);
}

#[tokio::test]
async fn production_sized_files_split_as_expected() {
    let manager = upload_manager(Arc::new(MemoryAdapter::new()));
    let init = manager
        .create_session("movie.mp4", 12_000_000, Some(5_000_000), &default_ctx())
        .await
        .unwrap();
    assert_eq!(init.total_chunks, 3);
}

#[tokio::test]
async fn sweep_collects_terminal_sessions_past_retention() {
    let allocator = common::allocator_with(Arc::new(MemoryAdapter::new()));
    let manager = media_plane::services::upload_manager::UploadManager::new(
        allocator,
        Arc::new(media_plane::services::events::EventBus::new()),
        media_plane::services::upload_manager::UploadConfig {
            retention_secs: 0,
            ..common::test_upload_config()
        },
    );

    let done = manager
        .create_session("a.bin", 4, Some(4), &default_ctx())
        .await
        .unwrap();
    manager.cancel(done.upload_id).await.unwrap();
    let live = manager
        .create_session("b.bin", 4, Some(4), &default_ctx())
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    assert_eq!(manager.sweep_expired().await, 1);

    let err = manager.get(done.upload_id).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound { .. }));
    // Non-terminal sessions survive the sweep.
    manager.get(live.upload_id).await.unwrap();
}

#[tokio::test]
async fn zero_byte_files_are_rejected() {
    let manager = upload_manager(Arc::new(MemoryAdapter::new()));
    let err = manager
        .create_session("empty.bin", 0, None, &default_ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}

#[tokio::test]
async fn oversized_chunk_counts_are_rejected() {
    let manager = upload_manager(Arc::new(MemoryAdapter::new()));
    let err = manager
        .create_session("huge.bin", 20_000, Some(1), &default_ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}

#[tokio::test]
async fn sequential_chunks_complete_the_session() {
    let adapter = Arc::new(MemoryAdapter::new());
    let manager = upload_manager(adapter.clone());
    let init = manager
        .create_session("photo.png", 10, Some(4), &default_ctx())
        .await
        .unwrap();
    let id = init.upload_id;

    // First chunk implicitly moves Pending -> Uploading.
    let s0 = manager
        .upload_chunk(id, 0, Bytes::from_static(b"aaaa"))
        .await
        .unwrap();
    assert_eq!(s0.status, SessionStatus::Uploading);
    assert_eq!(s0.current_chunk, 1);
    assert_eq!(s0.bytes_uploaded, 4);

    manager
        .upload_chunk(id, 1, Bytes::from_static(b"bbbb"))
        .await
        .unwrap();
    let done = manager
        .upload_chunk(id, 2, Bytes::from_static(b"cc"))
        .await
        .unwrap();

    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.bytes_uploaded, 10);
    assert_eq!(done.percentage, 100);

    // The assembled object is readable through the adapter.
    let stored = adapter
        .download_file(&init.file_key, &TransferOptions::default())
        .await
        .unwrap();
    assert_eq!(&stored[..], b"aaaabbbbcc");
}

#[tokio::test]
async fn progress_is_monotonic_and_percentage_consistent() {
    let manager = upload_manager(Arc::new(MemoryAdapter::new()));
    let init = manager
        .create_session("doc.pdf", 10, Some(4), &default_ctx())
        .await
        .unwrap();
    let id = init.upload_id;

    let mut last_bytes = 0;
    for (index, data) in [&b"aaaa"[..], &b"bbbb"[..], &b"cc"[..]].iter().enumerate() {
        let snapshot = manager
            .upload_chunk(id, index as u32, Bytes::copy_from_slice(data))
            .await
            .unwrap();
        assert!(snapshot.bytes_uploaded >= last_bytes);
        last_bytes = snapshot.bytes_uploaded;

        let expected = ((snapshot.bytes_uploaded as f64 / snapshot.file_size as f64) * 100.0)
            .round() as u32;
        assert_eq!(snapshot.percentage, expected);
    }
    assert_eq!(last_bytes, 10);
}

#[tokio::test]
async fn out_of_order_chunks_are_rejected() {
    let manager = upload_manager(Arc::new(MemoryAdapter::new()));
    let init = manager
        .create_session("photo.png", 10, Some(4), &default_ctx())
        .await
        .unwrap();

    let err = manager
        .upload_chunk(init.upload_id, 1, Bytes::from_static(b"bbbb"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}

#[tokio::test]
async fn wrong_sized_chunks_are_rejected() {
    let manager = upload_manager(Arc::new(MemoryAdapter::new()));
    let init = manager
        .create_session("photo.png", 10, Some(4), &default_ctx())
        .await
        .unwrap();

    let err = manager
        .upload_chunk(init.upload_id, 0, Bytes::from_static(b"aa"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}

#[tokio::test]
async fn transient_failures_are_retried_then_forgotten() {
    let adapter = Arc::new(FlakyAdapter::new(2));
    let manager = upload_manager(adapter.clone());
    let init = manager
        .create_session("photo.png", 4, Some(4), &default_ctx())
        .await
        .unwrap();

    let snapshot = manager
        .upload_chunk(init.upload_id, 0, Bytes::from_static(b"aaaa"))
        .await
        .unwrap();

    // Two injected failures plus the success.
    assert_eq!(adapter.chunk_attempts(), 3);
    assert_eq!(snapshot.status, SessionStatus::Completed);
    // A success resets the retry counter.
    assert_eq!(snapshot.retry_count, 0);
}

#[tokio::test]
async fn retries_exhaust_after_max_plus_one_attempts() {
    let adapter = Arc::new(FlakyAdapter::new(u32::MAX));
    let manager = upload_manager(adapter.clone());
    let init = manager
        .create_session("photo.png", 4, Some(4), &default_ctx())
        .await
        .unwrap();
    let id = init.upload_id;

    let err = manager
        .upload_chunk(id, 0, Bytes::from_static(b"aaaa"))
        .await
        .unwrap_err();
    match err {
        CoreError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 4),
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }

    // max_retries = 3 means exactly four attempts, never a fifth.
    assert_eq!(adapter.chunk_attempts(), 4);

    let snapshot = manager.get(id).await.unwrap();
    assert_eq!(snapshot.status, SessionStatus::Failed);
    assert!(snapshot.error.is_some());
}

#[tokio::test]
async fn reported_failures_fail_the_session_at_the_limit() {
    let manager = upload_manager(Arc::new(MemoryAdapter::new()));
    let init = manager
        .create_session("photo.png", 10, Some(4), &default_ctx())
        .await
        .unwrap();
    let id = init.upload_id;

    for attempt in 1..=3u32 {
        let snapshot = manager
            .report_chunk_result(
                id,
                0,
                ChunkOutcome::Failure {
                    error: "network reset".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(snapshot.status, SessionStatus::Uploading);
        assert_eq!(snapshot.retry_count, attempt);
    }

    // Fourth failure crosses max_retries.
    let snapshot = manager
        .report_chunk_result(
            id,
            0,
            ChunkOutcome::Failure {
                error: "network reset".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(snapshot.status, SessionStatus::Failed);
    assert_eq!(snapshot.error.as_deref(), Some("network reset"));

    // The session is terminal; further reports bounce.
    let err = manager
        .report_chunk_result(
            id,
            0,
            ChunkOutcome::Failure {
                error: "late".into(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidState { .. }));
}

#[tokio::test]
async fn client_reported_successes_complete_the_session() {
    let adapter = Arc::new(MemoryAdapter::new());
    let manager = upload_manager(adapter.clone());
    let init = manager
        .create_session("photo.png", 8, Some(4), &default_ctx())
        .await
        .unwrap();
    let id = init.upload_id;

    // The adapter never saw chunk bytes (the client used presigned URLs),
    // so stage the parts it will assemble.
    let opts = TransferOptions::default();
    adapter
        .upload_chunk(&init.file_key, Bytes::from_static(b"aaaa"), 0, 2, &opts)
        .await
        .unwrap();
    adapter
        .upload_chunk(&init.file_key, Bytes::from_static(b"bbbb"), 1, 2, &opts)
        .await
        .unwrap();

    manager
        .report_chunk_result(id, 0, ChunkOutcome::Success { etag: "e0".into() })
        .await
        .unwrap();
    let done = manager
        .report_chunk_result(id, 1, ChunkOutcome::Success { etag: "e1".into() })
        .await
        .unwrap();

    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.bytes_uploaded, 8);
    assert!(
        adapter.file_exists(&init.file_key).await.unwrap(),
        "completed upload should be assembled on the provider"
    );
}

#[tokio::test]
async fn pause_blocks_chunks_and_resume_lists_missing() {
    let manager = upload_manager(Arc::new(MemoryAdapter::new()));
    let init = manager
        .create_session("photo.png", 10, Some(4), &default_ctx())
        .await
        .unwrap();
    let id = init.upload_id;

    manager
        .upload_chunk(id, 0, Bytes::from_static(b"aaaa"))
        .await
        .unwrap();
    let paused = manager.pause(id).await.unwrap();
    assert_eq!(paused.status, SessionStatus::Paused);

    let err = manager
        .upload_chunk(id, 1, Bytes::from_static(b"bbbb"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidState { .. }));

    let resumed = manager.resume(id).await.unwrap();
    assert_eq!(resumed.session.status, SessionStatus::Uploading);
    assert_eq!(resumed.missing_chunks, vec![1, 2]);
    assert_eq!(resumed.chunk_urls.len(), 2);
    // Confirmed progress survives the pause.
    assert_eq!(resumed.session.bytes_uploaded, 4);
}

#[tokio::test]
async fn explicit_start_moves_pending_to_uploading_once() {
    let manager = upload_manager(Arc::new(MemoryAdapter::new()));
    let init = manager
        .create_session("photo.png", 10, Some(4), &default_ctx())
        .await
        .unwrap();

    let started = manager.start(init.upload_id).await.unwrap();
    assert_eq!(started.status, SessionStatus::Uploading);

    let err = manager.start(init.upload_id).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidState { .. }));
}

#[tokio::test]
async fn resume_retries_a_completion_interrupted_by_pause() {
    let (adapter, mut entered) = FlakyAdapter::gated();
    let manager = upload_manager(adapter.clone());
    let init = manager
        .create_session("photo.png", 4, Some(4), &default_ctx())
        .await
        .unwrap();
    let id = init.upload_id;

    let driver = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager.upload_chunk(id, 0, Bytes::from_static(b"aaaa")).await
        })
    };

    // Wait until the final-chunk completion is in flight, then pause.
    entered.recv().await.unwrap();
    manager.pause(id).await.unwrap();
    adapter.release_completions(2);

    // The in-flight completion result is discarded, not applied.
    let err = driver.await.unwrap().unwrap_err();
    assert!(matches!(err, CoreError::InvalidState { .. }));
    assert_eq!(
        manager.get(id).await.unwrap().status,
        SessionStatus::Paused
    );

    // Resume re-runs the multipart completion instead of stranding the
    // session with an empty missing-chunk list.
    let resumed = manager.resume(id).await.unwrap();
    assert!(resumed.missing_chunks.is_empty());
    assert_eq!(resumed.session.status, SessionStatus::Completed);
    assert_eq!(resumed.session.percentage, 100);
}

#[tokio::test]
async fn cancel_is_immediate_and_final() {
    let manager = upload_manager(Arc::new(MemoryAdapter::new()));
    let init = manager
        .create_session("photo.png", 10, Some(4), &default_ctx())
        .await
        .unwrap();
    let id = init.upload_id;

    let cancelled = manager.cancel(id).await.unwrap();
    assert_eq!(cancelled.status, SessionStatus::Cancelled);

    // Anything arriving after the flip is rejected, not applied.
    let err = manager
        .upload_chunk(id, 0, Bytes::from_static(b"aaaa"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Cancelled(_)));

    let err = manager
        .report_chunk_result(id, 0, ChunkOutcome::Success { etag: "e0".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Cancelled(_)));

    let snapshot = manager.get(id).await.unwrap();
    assert_eq!(snapshot.status, SessionStatus::Cancelled);
    assert_eq!(snapshot.bytes_uploaded, 0);
}

#[tokio::test]
async fn session_events_arrive_in_order() {
    let manager = upload_manager(Arc::new(MemoryAdapter::new()));
    let init = manager
        .create_session("photo.png", 8, Some(4), &default_ctx())
        .await
        .unwrap();
    let id = init.upload_id;
    let mut rx = manager.events().subscribe(id);

    manager
        .upload_chunk(id, 0, Bytes::from_static(b"aaaa"))
        .await
        .unwrap();
    manager
        .upload_chunk(id, 1, Bytes::from_static(b"bbbb"))
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    assert!(matches!(
        events.first(),
        Some(Event::ChunkUploaded { chunk_index: 0, .. })
    ));
    assert!(matches!(events.last(), Some(Event::Completed(_))));
    let chunk_indices: Vec<u32> = events
        .iter()
        .filter_map(|event| match event {
            Event::ChunkUploaded { chunk_index, .. } => Some(*chunk_index),
            _ => None,
        })
        .collect();
    assert_eq!(chunk_indices, vec![0, 1]);
}

#[tokio::test]
async fn retry_events_carry_attempt_and_backoff() {
    let adapter = Arc::new(FlakyAdapter::new(1));
    let manager = upload_manager(adapter);
    let init = manager
        .create_session("photo.png", 4, Some(4), &default_ctx())
        .await
        .unwrap();
    let id = init.upload_id;
    let mut rx = manager.events().subscribe(id);

    manager
        .upload_chunk(id, 0, Bytes::from_static(b"aaaa"))
        .await
        .unwrap();

    let mut saw_retry = false;
    while let Ok(event) = rx.try_recv() {
        if let Event::Retry {
            attempt, delay_ms, ..
        } = event
        {
            assert_eq!(attempt, 1);
            assert_eq!(delay_ms, 1);
            saw_retry = true;
        }
    }
    assert!(saw_retry, "expected a retry event for the injected failure");
}
