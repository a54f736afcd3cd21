mod common;

use std::io::ErrorKind;
use std::sync::Arc;

use futures::StreamExt;

use common::{downloads, payload, progress_recorder, BodyFault, FaultyService};
use dog_blob_transfer::{
    BlobClient, BlobService, ByteRange, DownloadOptions, DownloadRetryOptions, MemoryBlobService,
    ReplayableBody, TransferConfig, TransferError, UploadOptions, WriteOptions,
};

const KEY: &str = "video.bin";

async fn seeded(len: usize) -> (Arc<MemoryBlobService>, Arc<FaultyService>, BlobClient) {
    let memory = Arc::new(MemoryBlobService::new().with_download_chunk_size(128));
    let faulty = Arc::new(FaultyService::new(memory.clone()));
    let client = BlobClient::from_arc(faulty.clone(), TransferConfig::default()).unwrap();
    client.upload(KEY, payload(len), UploadOptions::new()).await.unwrap();
    (memory, faulty, client)
}

#[tokio::test]
async fn interrupted_body_resumes_from_last_offset_with_if_match() {
    let (memory, faulty, client) = seeded(1024).await;
    faulty.push_body_fault(BodyFault::Error { after: 256, kind: ErrorKind::ConnectionReset });

    let stream = client.download(KEY, DownloadOptions::new()).await.unwrap();
    let etag = stream.properties().etag.clone();
    let data = stream.read_to_end().await.unwrap();

    assert_eq!(data, payload(1024));
    assert_eq!(
        downloads(&memory),
        vec![
            (None, None),
            (Some(ByteRange::new(256, Some(1024))), Some(etag)),
        ]
    );
}

#[tokio::test]
async fn changed_etag_is_fatal_without_further_retries() {
    let (memory, faulty, client) = seeded(1024).await;
    faulty.push_body_fault(BodyFault::Error { after: 256, kind: ErrorKind::ConnectionReset });

    let mut stream = client.download(KEY, DownloadOptions::new()).await.unwrap();
    let mut received = 0usize;
    while received < 256 {
        received += stream.next().await.unwrap().unwrap().len();
    }

    // Someone replaces the blob while the download is paused.
    memory
        .put_blob(KEY, ReplayableBody::new(payload(2048)), &WriteOptions::new())
        .await
        .unwrap();

    let err = stream.next().await.unwrap().unwrap_err();
    match err {
        TransferError::DownloadAborted { offset, remaining, attempts, source } => {
            assert_eq!(offset, 256);
            assert_eq!(remaining, 768);
            assert_eq!(attempts, 1);
            assert!(matches!(*source, TransferError::PreconditionFailed { .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(stream.next().await.is_none());
    assert_eq!(downloads(&memory).len(), 2);
}

#[tokio::test]
async fn retry_budget_is_per_download() {
    let (memory, faulty, client) = seeded(1024).await;
    for _ in 0..4 {
        faulty.push_body_fault(BodyFault::Error { after: 100, kind: ErrorKind::TimedOut });
    }

    let options = DownloadOptions::new().with_retry(DownloadRetryOptions { max_retry_requests: 2 });
    let err = client
        .download(KEY, options)
        .await
        .unwrap()
        .read_to_end()
        .await
        .unwrap_err();

    match err {
        TransferError::DownloadAborted { offset, attempts, source, .. } => {
            assert_eq!(offset, 300);
            assert_eq!(attempts, 2);
            assert!(source.is_retryable());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(downloads(&memory).len(), 3);
}

#[tokio::test]
async fn transient_failure_of_resume_request_is_retried() {
    let (memory, faulty, client) = seeded(1024).await;
    faulty.push_body_fault(BodyFault::Error { after: 256, kind: ErrorKind::ConnectionReset });
    faulty.fail_download_call(1, TransferError::transient("gateway timeout"));

    let data = client
        .download(KEY, DownloadOptions::new())
        .await
        .unwrap()
        .read_to_end()
        .await
        .unwrap();

    assert_eq!(data, payload(1024));
    assert_eq!(faulty.download_calls(), 3);
    assert_eq!(downloads(&memory)[1].0, Some(ByteRange::new(256, Some(1024))));
}

#[tokio::test]
async fn failed_resume_request_spends_the_retry_budget() {
    let (memory, faulty, client) = seeded(1024).await;
    faulty.push_body_fault(BodyFault::Error { after: 256, kind: ErrorKind::ConnectionReset });
    faulty.fail_download_call(1, TransferError::transient("gateway timeout"));

    let options = DownloadOptions::new().with_retry(DownloadRetryOptions { max_retry_requests: 1 });
    let err = client
        .download(KEY, options)
        .await
        .unwrap()
        .read_to_end()
        .await
        .unwrap_err();

    match err {
        TransferError::DownloadAborted { offset, remaining, attempts, source } => {
            assert_eq!(offset, 256);
            assert_eq!(remaining, 768);
            assert_eq!(attempts, 1);
            assert!(matches!(*source, TransferError::TransientTransport { .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(faulty.download_calls(), 2);
    assert_eq!(downloads(&memory).len(), 1);
}

#[tokio::test]
async fn non_retryable_resume_request_failure_is_fatal() {
    let (memory, faulty, client) = seeded(1024).await;
    faulty.push_body_fault(BodyFault::Error { after: 512, kind: ErrorKind::ConnectionReset });
    faulty.fail_download_call(1, TransferError::service(403, "AuthorizationFailure", "signature expired"));

    let err = client
        .download(KEY, DownloadOptions::new())
        .await
        .unwrap()
        .read_to_end()
        .await
        .unwrap_err();

    match err {
        TransferError::DownloadAborted { offset, attempts, source, .. } => {
            assert_eq!(offset, 512);
            assert_eq!(attempts, 1);
            assert_eq!(source.error_code(), Some("AuthorizationFailure"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(faulty.download_calls(), 2);
    assert_eq!(downloads(&memory).len(), 1);
}

#[tokio::test]
async fn premature_end_of_body_is_resumed() {
    let (memory, faulty, client) = seeded(1000).await;
    faulty.push_body_fault(BodyFault::Truncate { after: 600 });

    let data = client
        .download(KEY, DownloadOptions::new())
        .await
        .unwrap()
        .read_to_end()
        .await
        .unwrap();

    assert_eq!(data, payload(1000));
    assert_eq!(downloads(&memory)[1].0, Some(ByteRange::new(600, Some(1000))));
}

#[tokio::test]
async fn non_transient_error_is_not_retried() {
    let (memory, faulty, client) = seeded(512).await;
    faulty.push_body_fault(BodyFault::Error { after: 128, kind: ErrorKind::PermissionDenied });

    let err = client
        .download(KEY, DownloadOptions::new())
        .await
        .unwrap()
        .read_to_end()
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::DownloadAborted { offset: 128, attempts: 0, .. }));
    assert_eq!(downloads(&memory).len(), 1);
}

#[tokio::test]
async fn resume_without_consistency_check_sends_no_if_match() {
    let (memory, faulty, client) = seeded(512).await;
    faulty.push_body_fault(BodyFault::Error { after: 128, kind: ErrorKind::ConnectionReset });

    client
        .download(KEY, DownloadOptions::new().with_consistency_check(false))
        .await
        .unwrap()
        .read_to_end()
        .await
        .unwrap();

    assert_eq!(downloads(&memory)[1], (Some(ByteRange::new(128, Some(512))), None));
}

#[tokio::test]
async fn ranged_download_resumes_inside_the_range() {
    let (memory, faulty, client) = seeded(1024).await;
    faulty.push_body_fault(BodyFault::Error { after: 200, kind: ErrorKind::ConnectionAborted });

    let data = client
        .download(KEY, DownloadOptions::new().with_range(ByteRange::with_count(100, 500)))
        .await
        .unwrap()
        .read_to_end()
        .await
        .unwrap();

    assert_eq!(data, payload(1024).slice(100..600));
    assert_eq!(downloads(&memory)[1].0, Some(ByteRange::new(300, Some(600))));
}

#[tokio::test]
async fn download_progress_reaches_length_once() {
    let (_, faulty, client) = seeded(1024).await;
    faulty.push_body_fault(BodyFault::Error { after: 300, kind: ErrorKind::ConnectionReset });
    let (seen, receiver) = progress_recorder();

    client
        .download(KEY, DownloadOptions::new().with_progress(receiver))
        .await
        .unwrap()
        .read_to_end()
        .await
        .unwrap();

    let seen = seen.lock().clone();
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(seen.last().copied(), Some(1024));
}

#[tokio::test]
async fn download_to_writer_copies_everything() {
    let (_, faulty, client) = seeded(700).await;
    faulty.push_body_fault(BodyFault::Error { after: 384, kind: ErrorKind::BrokenPipe });

    let mut sink: Vec<u8> = Vec::new();
    let properties = client
        .download_to(KEY, &mut sink, DownloadOptions::new())
        .await
        .unwrap();

    assert_eq!(properties.content_length, 700);
    assert_eq!(sink, payload(700).to_vec());
}

#[tokio::test]
async fn missing_blob_fails_before_streaming() {
    let (_, _, client) = seeded(10).await;
    let err = client.download("nope", DownloadOptions::new()).await.unwrap_err();
    assert_eq!(err.error_code(), Some("BlobNotFound"));
    assert!(!client.exists("nope").await.unwrap());
}
