//! Uploader integration tests against the in-memory transport.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{
    now_epoch, ChangeKind, EntityKind, FileId, FileRecord, Folder, FolderId, FolderState,
    QueueState, UploadState, PRIORITY_NORMAL,
};
use crypto::{FolderSigner, MasterKey};
use net::MemoryTransport;
use segmenter::{Segmenter, SegmenterConfig};
use store::Store;
use uploader::{BackpressurePolicy, Uploader, UploaderConfig};

struct Fixture {
    _db: tempfile::TempDir,
    _tree: tempfile::TempDir,
    store: Store,
    transport: Arc<MemoryTransport>,
    folder: Folder,
    file: FileRecord,
}

async fn fixture(redundancy: u8, data: &[u8]) -> Fixture {
    let db_dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", db_dir.path().join("up.db").display());
    let store = Store::connect(&url, 4).await.unwrap();

    let tree = tempfile::tempdir().unwrap();
    std::fs::write(tree.path().join("payload.bin"), data).unwrap();

    let signer = FolderSigner::generate();
    let content_key = MasterKey::generate();
    let folder = Folder {
        folder_id: FolderId::generate(),
        path: tree.path().to_string_lossy().into_owned(),
        name: "fixture".to_string(),
        signing_key: Some(signer.secret_hex()),
        verifying_key: Some(signer.verifying_key_hex()),
        content_key: Some(content_key.to_base64()),
        version: 1,
        file_count: 1,
        total_size: data.len() as u64,
        segment_count: 0,
        encryption_enabled: true,
        redundancy_level: redundancy,
        target_group: "alt.binaries.test".to_string(),
        state: FolderState::Indexed,
        created_at: now_epoch(),
        last_indexed: Some(now_epoch()),
    };
    store.insert_folder(&folder).await.unwrap();

    let file = FileRecord {
        file_id: FileId::generate(),
        folder_id: folder.folder_id,
        path: "payload.bin".to_string(),
        size: data.len() as u64,
        hash: crypto::sha256_hex(data),
        mime_type: None,
        version: 1,
        previous_version: None,
        change_kind: ChangeKind::Added,
        segment_size: 32_768,
        total_segments: 0,
        uploaded_segments: 0,
        encryption_key_ref: None,
        modified_at: now_epoch(),
        indexed_at: now_epoch(),
    };
    store.insert_files_bulk(&[file.clone()]).await.unwrap();

    // Segment through the real segmenter so rows are regenerable.
    let segmenter = Segmenter::new(
        SegmenterConfig {
            segment_size: 32_768,
            pack_threshold: 1_000,
            redundancy_level: redundancy,
            compression_enabled: true,
        },
        &content_key,
        hex::decode(folder.signing_key.as_ref().unwrap()).unwrap(),
        folder.target_group.clone(),
    )
    .unwrap();
    let result = segmenter
        .segment_folder(&[(
            file.clone(),
            Path::new(&folder.path).join(&file.path),
        )])
        .unwrap();
    store.insert_segments_bulk(&result.segments).await.unwrap();
    for packed in &result.packed {
        store.insert_packed_segment(packed).await.unwrap();
    }
    store
        .set_file_segment_totals(
            &file.file_id,
            result.file_totals[&file.file_id],
            32_768,
        )
        .await
        .unwrap();

    Fixture {
        _db: db_dir,
        _tree: tree,
        store,
        transport: Arc::new(MemoryTransport::new()),
        folder,
        file,
    }
}

fn uploader_for(fixture: &Fixture) -> Uploader {
    Uploader::new(
        fixture.store.clone(),
        fixture.transport.clone(),
        UploaderConfig {
            worker_count: 2,
            max_retries: 2,
            high_water_mark: 100,
            backpressure: BackpressurePolicy::FailFast,
            session_deploys_per_hour: None,
            segmenter: SegmenterConfig {
                segment_size: 32_768,
                pack_threshold: 1_000,
                redundancy_level: 1,
                compression_enabled: true,
            },
        },
    )
}

#[tokio::test]
async fn folder_upload_posts_every_redundancy_copy() {
    let fixture = fixture(2, &vec![0xA7u8; 80_000]).await;
    let uploader = uploader_for(&fixture);

    uploader
        .enqueue(
            EntityKind::Folder,
            fixture.folder.folder_id.to_string(),
            PRIORITY_NORMAL,
            0,
            None,
        )
        .await
        .unwrap();
    uploader.process_available().await.unwrap();

    // ceil(80000/32768) = 3 logical segments x 2 copies.
    assert_eq!(fixture.transport.article_count(), 6);

    let rows = fixture
        .store
        .segments_for_file(&fixture.file.file_id)
        .await
        .unwrap();
    assert_eq!(rows.len(), 6);
    for row in &rows {
        assert_eq!(row.upload_state, UploadState::Uploaded);
        let message_id = row.message_id.as_ref().expect("uploaded row has id");
        let article = fixture.store.article(message_id).await.unwrap().unwrap();
        assert_eq!(article.group, fixture.folder.target_group);
        assert_eq!(article.subject, row.subject);
    }

    // All 3 logical segments have every copy posted.
    let file = fixture.store.file(&fixture.file.file_id).await.unwrap();
    assert_eq!(file.uploaded_segments, 3);
}

#[tokio::test]
async fn subjects_carry_no_path_material() {
    let fixture = fixture(1, &vec![1u8; 40_000]).await;
    let uploader = uploader_for(&fixture);
    uploader
        .enqueue(
            EntityKind::Folder,
            fixture.folder.folder_id.to_string(),
            PRIORITY_NORMAL,
            0,
            None,
        )
        .await
        .unwrap();
    uploader.process_available().await.unwrap();

    for subject in fixture.transport.subjects() {
        assert!(!subject.contains("payload"));
        assert!(!subject.contains("bin"));
        assert_eq!(subject.len(), 32);
    }
}

#[tokio::test]
async fn transient_failures_retry_then_succeed() {
    let fixture = fixture(1, &vec![2u8; 40_000]).await;
    let uploader = uploader_for(&fixture);
    fixture.transport.fail_next_posts(1);

    let queue_id = uploader
        .enqueue(
            EntityKind::Folder,
            fixture.folder.folder_id.to_string(),
            PRIORITY_NORMAL,
            0,
            None,
        )
        .await
        .unwrap();
    uploader.process_available().await.unwrap();

    let item = fixture.store.queue_item(&queue_id).await.unwrap().unwrap();
    assert_eq!(item.state, QueueState::Completed);
    assert!(item.retry_count >= 1);
    // Priority was demoted one step toward NORMAL ceiling.
    assert!(item.priority >= PRIORITY_NORMAL);
}

#[tokio::test]
async fn exhausted_retries_fail_with_error_preserved() {
    let fixture = fixture(1, &vec![3u8; 40_000]).await;
    let uploader = uploader_for(&fixture);
    fixture.transport.fail_next_posts(100);

    let queue_id = uploader
        .enqueue(
            EntityKind::Folder,
            fixture.folder.folder_id.to_string(),
            PRIORITY_NORMAL,
            0,
            None,
        )
        .await
        .unwrap();
    uploader.process_available().await.unwrap();

    let item = fixture.store.queue_item(&queue_id).await.unwrap().unwrap();
    assert_eq!(item.state, QueueState::Failed);
    assert!(item.error.is_some());
    assert_eq!(item.retry_count, 2);
}

#[tokio::test]
async fn cancel_before_lease_removes_the_item() {
    let fixture = fixture(1, &vec![4u8; 40_000]).await;
    let uploader = uploader_for(&fixture);

    let queue_id = uploader
        .enqueue(
            EntityKind::Folder,
            fixture.folder.folder_id.to_string(),
            PRIORITY_NORMAL,
            0,
            None,
        )
        .await
        .unwrap();
    uploader.cancel(queue_id).await.unwrap();
    uploader.process_available().await.unwrap();

    assert_eq!(fixture.transport.article_count(), 0);
    let item = fixture.store.queue_item(&queue_id).await.unwrap().unwrap();
    assert_eq!(item.state, QueueState::Cancelled);
}

#[tokio::test]
async fn pause_blocks_workers_until_resume() {
    let fixture = fixture(1, &vec![5u8; 40_000]).await;
    let uploader = uploader_for(&fixture);
    let handles = uploader.spawn_workers();

    uploader.pause();
    let queue_id = uploader
        .enqueue(
            EntityKind::Folder,
            fixture.folder.folder_id.to_string(),
            PRIORITY_NORMAL,
            0,
            None,
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fixture.transport.article_count(), 0);

    uploader.resume();
    let state = uploader
        .await_item(queue_id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(state, QueueState::Completed);
    assert!(fixture.transport.article_count() > 0);

    uploader.shutdown();
    for handle in handles {
        let _ = handle.await;
    }
}

#[tokio::test]
async fn restart_resumes_persisted_queue() {
    let fixture = fixture(1, &vec![6u8; 40_000]).await;
    {
        // First process enqueues but never runs a worker.
        let uploader = uploader_for(&fixture);
        uploader
            .enqueue(
                EntityKind::Folder,
                fixture.folder.folder_id.to_string(),
                PRIORITY_NORMAL,
                0,
                None,
            )
            .await
            .unwrap();
    }

    // Second process restores from the store and completes the work.
    let uploader = uploader_for(&fixture);
    let restored = uploader.restore().await.unwrap();
    assert_eq!(restored, 1);
    uploader.process_available().await.unwrap();
    assert!(fixture.transport.article_count() > 0);
}

#[tokio::test]
async fn backpressure_fail_fast_rejects_over_high_water() {
    let fixture = fixture(1, &vec![7u8; 2_000]).await;
    let uploader = Uploader::new(
        fixture.store.clone(),
        fixture.transport.clone(),
        UploaderConfig {
            worker_count: 1,
            high_water_mark: 2,
            backpressure: BackpressurePolicy::FailFast,
            ..Default::default()
        },
    );

    for i in 0..2 {
        uploader
            .enqueue(
                EntityKind::File,
                FileId::generate().to_string(),
                PRIORITY_NORMAL,
                0,
                Some(format!("s{i}")),
            )
            .await
            .unwrap();
    }
    let err = uploader
        .enqueue(
            EntityKind::File,
            FileId::generate().to_string(),
            PRIORITY_NORMAL,
            0,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, uploader::UploaderError::QueueFull { .. }));
}
