// Integration tests for the chunked deployment upload pipeline

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{archive, ChunkTrace, FakeConsole};
use pmlink::client::{RecordingSink, SinkEvent, TokenManager, UploadOutcome, UploadPipeline};
use pmlink::common::types::{UploadState, MIN_CHUNK_SIZE};
use pmlink::ClientConfig;

const CHUNK: usize = MIN_CHUNK_SIZE;

fn config() -> ClientConfig {
    ClientConfig::default()
        .with_chunk_size(CHUNK)
        .unwrap()
        .with_retry_backoff_step(Duration::from_millis(1))
}

fn pipeline(api: Arc<FakeConsole>) -> (UploadPipeline, Arc<TokenManager>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let tokens = Arc::new(TokenManager::new(api.clone()));
    let pipeline = UploadPipeline::new(&config(), api, tokens.clone(), sink.clone());
    (pipeline, tokens, sink)
}

#[tokio::test]
async fn test_every_chunk_sent_once_then_finalized() {
    let api = Arc::new(FakeConsole::default());
    let (pipeline, _tokens, sink) = pipeline(api.clone());
    let file = archive(CHUNK * 5 + 100);

    let outcome = pipeline.upload_chunked(file.path(), true).await;
    assert_eq!(outcome, UploadOutcome::Completed);

    // 5 full chunks plus a 100 byte tail
    assert_eq!(api.accepted_chunks(), vec![0, 1, 2, 3, 4, 5]);
    let chunks = api.chunks.lock().unwrap().clone();
    assert!(chunks.values().all(|sizes| sizes.len() == 1));
    assert_eq!(chunks[&0], vec![CHUNK]);
    assert_eq!(chunks[&5], vec![100]);

    let inits = api.inits.lock().unwrap().clone();
    assert_eq!(inits.len(), 1);
    assert_eq!(inits[0].total_chunks, 6);
    assert_eq!(inits[0].file_size, (CHUNK * 5 + 100) as u64);
    assert!(inits[0].restart_project);
    assert_eq!(api.finalizes.lock().unwrap().as_slice(), &[inits[0].upload_id.clone()]);

    // one token for the whole upload, rotated afterwards
    assert!(api.tokens_seen.lock().unwrap().iter().all(|t| t == "csrf-1"));
    assert_eq!(api.token_fetches.load(Ordering::SeqCst), 2);

    let progress = sink.progress();
    assert_eq!(progress.first().map(|p| p.state), Some(UploadState::Initializing));
    let last = progress.last().unwrap();
    assert_eq!((last.state, last.percent), (UploadState::Completed, 100));
    assert!(progress.windows(2).all(|w| w[0].percent <= w[1].percent || w[1].state == UploadState::Completed));
    assert!(sink.notices().iter().any(|n| n.title == "Upload Complete"));
    assert!(sink.events().contains(&SinkEvent::HistoryChanged));
    assert!(!pipeline.is_busy());
}

#[tokio::test]
async fn test_failed_chunk_retried_sequentially() {
    let api = Arc::new(FakeConsole::default());
    // fails in the batch and on the first retry, accepted on the second retry
    api.fail_chunk(2, 2);
    let (pipeline, _tokens, sink) = pipeline(api.clone());
    let file = archive(CHUNK * 4);

    let outcome = pipeline.upload_chunked(file.path(), false).await;
    assert_eq!(outcome, UploadOutcome::Completed);

    assert_eq!(api.accepted_chunks(), vec![0, 1, 2, 3]);
    assert_eq!(api.chunk_calls.load(Ordering::SeqCst), 4 + 2);
    assert_eq!(api.finalize_count(), 1);
    assert!(sink.progress().iter().any(|p| p.state == UploadState::Retrying));
}

#[tokio::test]
async fn test_exhausted_chunk_fails_without_finalize() {
    let api = Arc::new(FakeConsole::default());
    api.fail_chunk(1, 100);
    let (pipeline, tokens, sink) = pipeline(api.clone());
    let file = archive(CHUNK * 3);

    let outcome = pipeline.upload_chunked(file.path(), false).await;
    match outcome {
        UploadOutcome::Failed(reason) => assert!(reason.contains("Chunk 1"), "{}", reason),
        other => panic!("expected failure, got {:?}", other),
    }

    // one batched try plus three retries
    assert_eq!(api.chunk_calls.load(Ordering::SeqCst), 3 + 3);
    assert_eq!(api.finalize_count(), 0);
    assert!(tokens.cached().is_none());
    assert!(sink.notices().iter().any(|n| n.title == "Upload Failed"));
    assert_eq!(sink.progress().last().map(|p| p.state), Some(UploadState::Failed));
}

#[tokio::test]
async fn test_init_failure_sends_no_chunks() {
    let api = Arc::new(FakeConsole {
        fail_init: true,
        ..Default::default()
    });
    let (pipeline, _tokens, _sink) = pipeline(api.clone());
    let file = archive(CHUNK * 2);

    let outcome = pipeline.upload_chunked(file.path(), false).await;
    assert!(matches!(outcome, UploadOutcome::Failed(_)));
    assert_eq!(api.chunk_calls.load(Ordering::SeqCst), 0);
    assert_eq!(api.finalize_count(), 0);
}

#[tokio::test]
async fn test_rejected_token_is_security_error() {
    let api = Arc::new(FakeConsole {
        forbid_chunks: true,
        ..Default::default()
    });
    let (pipeline, tokens, sink) = pipeline(api.clone());
    let file = archive(CHUNK);

    let outcome = pipeline.upload_chunked(file.path(), false).await;
    assert!(matches!(outcome, UploadOutcome::Failed(_)));
    assert_eq!(api.finalize_count(), 0);
    assert!(sink.notices().iter().any(|n| n.title == "Security Error"));

    // no retries with a rejected token, a single refresh afterwards
    assert_eq!(api.chunk_calls.load(Ordering::SeqCst), 1);
    assert!(!sink.progress().iter().any(|p| p.state == UploadState::Retrying));
    assert_eq!(api.token_fetches.load(Ordering::SeqCst), 2);
    assert_eq!(tokens.cached().map(|t| t.value), Some("csrf-2".to_string()));
}

#[tokio::test]
async fn test_rejected_token_stops_remaining_batches() {
    let api = Arc::new(FakeConsole {
        forbid_chunks: true,
        ..Default::default()
    });
    let (pipeline, _tokens, _sink) = pipeline(api.clone());
    let file = archive(CHUNK * 7);

    let outcome = pipeline.upload_chunked(file.path(), false).await;
    assert!(matches!(outcome, UploadOutcome::Failed(_)));
    // first batch only
    assert_eq!(api.chunk_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_batches_bound_requests_in_flight() {
    let api = Arc::new(FakeConsole {
        chunk_delay: Some(Duration::from_millis(100)),
        ..Default::default()
    });
    let (pipeline, _tokens, _sink) = pipeline(api.clone());
    let file = archive(CHUNK * 7);

    assert_eq!(pipeline.upload_chunked(file.path(), false).await, UploadOutcome::Completed);
    assert_eq!(api.peak_in_flight.load(Ordering::SeqCst), 3);

    // batches [0, 1, 2], [3, 4, 5], [6]: a batch starts only after the previous one settled
    let trace = api.chunk_trace.lock().unwrap().clone();
    let position = |event: ChunkTrace| trace.iter().position(|t| *t == event).unwrap();
    for index in 3..7u32 {
        let started = position(ChunkTrace::Started(index));
        for earlier in 0..(index / 3) * 3 {
            assert!(
                position(ChunkTrace::Finished(earlier)) < started,
                "chunk {} started before chunk {} settled",
                index,
                earlier
            );
        }
    }
}

#[tokio::test]
async fn test_cancel_stops_upload() {
    let api = Arc::new(FakeConsole {
        chunk_delay: Some(Duration::from_millis(200)),
        ..Default::default()
    });
    let (pipeline, tokens, sink) = pipeline(api.clone());
    let file = archive(CHUNK * 10);

    let cancel = async {
        api.chunk_seen.notified().await;
        assert!(pipeline.cancel());
    };
    let (outcome, ()) = tokio::join!(pipeline.upload_chunked(file.path(), false), cancel);

    assert_eq!(outcome, UploadOutcome::Cancelled);
    assert_eq!(api.finalize_count(), 0);
    assert!(api.accepted_chunks().len() < 10);
    assert!(tokens.cached().is_none());
    assert!(sink.notices().iter().any(|n| n.title == "Upload Cancelled"));
    assert!(!pipeline.is_busy());
    assert!(!pipeline.cancel());
}

#[tokio::test]
async fn test_second_upload_rejected_while_busy() {
    let api = Arc::new(FakeConsole {
        chunk_delay: Some(Duration::from_millis(50)),
        ..Default::default()
    });
    let (pipeline, _tokens, sink) = pipeline(api.clone());
    let first = archive(CHUNK * 2);
    let second = archive(CHUNK);

    let competing = async {
        api.chunk_seen.notified().await;
        assert!(pipeline.is_busy());
        pipeline.upload_chunked(second.path(), false).await
    };
    let (outcome, rejected) = tokio::join!(pipeline.upload_chunked(first.path(), false), competing);

    assert_eq!(outcome, UploadOutcome::Completed);
    assert_eq!(rejected, UploadOutcome::Busy);
    assert_eq!(api.inits.lock().unwrap().len(), 1);
    assert!(sink.notices().iter().any(|n| n.title == "Upload in Progress"));

    // slot is free again
    let third = archive(100);
    assert_eq!(pipeline.upload_chunked(third.path(), false).await, UploadOutcome::Completed);
}

#[tokio::test]
async fn test_whole_file_upload_reports_bytes() {
    let api = Arc::new(FakeConsole::default());
    let (pipeline, _tokens, sink) = pipeline(api.clone());
    let file = archive(4096);

    let outcome = pipeline.upload_whole(file.path(), false).await;
    assert_eq!(outcome, UploadOutcome::Completed);
    assert_eq!(api.whole_uploads.load(Ordering::SeqCst), 1);
    assert_eq!(api.chunk_calls.load(Ordering::SeqCst), 0);

    let progress = sink.progress();
    assert!(progress.iter().any(|p| p.percent == 50 && p.message == "Uploading... 2.0 KB / 4.0 KB"));
    assert_eq!(progress.last().map(|p| p.state), Some(UploadState::Completed));
}

#[tokio::test]
async fn test_missing_file_fails() {
    let api = Arc::new(FakeConsole::default());
    let (pipeline, _tokens, _sink) = pipeline(api.clone());

    let outcome = pipeline
        .upload_chunked(std::path::Path::new("/nonexistent/project.zip"), false)
        .await;
    assert!(matches!(outcome, UploadOutcome::Failed(_)));
    assert_eq!(api.token_fetches.load(Ordering::SeqCst), 0);
}
