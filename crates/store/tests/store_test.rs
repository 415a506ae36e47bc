//! Store integration tests over the embedded engine.

use common::{
    now_epoch, AccessTier, ChangeKind, Commitment, CommitmentId, EntityKind, FileId, FileRecord,
    Folder, FolderId, FolderState, QueueItem, QueueState, SegmentId, SegmentRecord, Share,
    ShareId, ShareKind, UploadState, PRIORITY_NORMAL,
};
use store::{Store, StoreError};

async fn temp_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let store = Store::connect(&url, 4).await.unwrap();
    (dir, store)
}

fn folder_fixture() -> Folder {
    Folder {
        folder_id: FolderId::generate(),
        path: "/data/photos".to_string(),
        name: "photos".to_string(),
        signing_key: None,
        verifying_key: None,
        content_key: None,
        version: 1,
        file_count: 0,
        total_size: 0,
        segment_count: 0,
        encryption_enabled: true,
        redundancy_level: 2,
        target_group: "alt.binaries.test".to_string(),
        state: FolderState::Added,
        created_at: now_epoch(),
        last_indexed: None,
    }
}

fn file_fixture(folder_id: FolderId, path: &str, version: u32) -> FileRecord {
    FileRecord {
        file_id: FileId::generate(),
        folder_id,
        path: path.to_string(),
        size: 1024,
        hash: format!("{:064}", version),
        mime_type: None,
        version,
        previous_version: (version > 1).then(|| version - 1),
        change_kind: if version == 1 {
            ChangeKind::Added
        } else {
            ChangeKind::Modified
        },
        segment_size: 768_000,
        total_segments: 0,
        uploaded_segments: 0,
        encryption_key_ref: None,
        modified_at: now_epoch(),
        indexed_at: now_epoch(),
    }
}

fn segment_fixture(file_id: FileId, index: u32, redundancy: u8) -> SegmentRecord {
    SegmentRecord {
        segment_id: SegmentId::generate(),
        file_id: Some(file_id),
        packed_segment_id: None,
        segment_index: index,
        redundancy_index: redundancy,
        size: 768_000,
        compressed_size: Some(700_000),
        hash: "ab".repeat(32),
        offset_start: index as u64 * 768_000,
        offset_end: (index as u64 + 1) * 768_000,
        message_id: None,
        subject: "OBFUSCATEDSUBJECTOBFUSCATEDSUBJ".to_string(),
        group: "alt.binaries.test".to_string(),
        nonce: "00".repeat(12),
        upload_state: UploadState::Pending,
        attempts: 0,
        packing_index: None,
    }
}

#[tokio::test]
async fn migration_is_idempotent() {
    let (_dir, store) = temp_store().await;
    store.migrate().await.unwrap();
    store.migrate().await.unwrap();
}

#[tokio::test]
async fn duplicate_folder_path_is_rejected_then_ok_after_removal() {
    let (_dir, store) = temp_store().await;
    let folder = folder_fixture();
    store.insert_folder(&folder).await.unwrap();

    let mut again = folder_fixture();
    again.path = folder.path.clone();
    let err = store.insert_folder(&again).await.unwrap_err();
    assert!(matches!(err, StoreError::Duplicate { .. }));

    store.remove_folder(&folder.folder_id).await.unwrap();
    store.insert_folder(&again).await.unwrap();
}

#[tokio::test]
async fn folder_identifier_survives_round_trip() {
    let (_dir, store) = temp_store().await;
    let folder = folder_fixture();
    store.insert_folder(&folder).await.unwrap();
    let loaded = store.folder(&folder.folder_id).await.unwrap();
    assert_eq!(loaded.folder_id, folder.folder_id);
    assert_eq!(loaded.redundancy_level, 2);
    assert_eq!(loaded.state, FolderState::Added);
}

#[tokio::test]
async fn bulk_files_and_latest_versions() {
    let (_dir, store) = temp_store().await;
    let folder = folder_fixture();
    store.insert_folder(&folder).await.unwrap();

    let records: Vec<FileRecord> = (0..250)
        .map(|i| file_fixture(folder.folder_id, &format!("dir/file_{i:04}.bin"), 1))
        .collect();
    store.insert_files_bulk(&records).await.unwrap();

    // A second version of one file supersedes the first.
    let mut v2 = file_fixture(folder.folder_id, "dir/file_0000.bin", 2);
    v2.previous_version = Some(1);
    store.insert_files_bulk(&[v2.clone()]).await.unwrap();

    let latest = store.latest_file_versions(&folder.folder_id).await.unwrap();
    assert_eq!(latest.len(), 250);
    assert_eq!(latest["dir/file_0000.bin"].version, 2);
    assert_eq!(latest["dir/file_0000.bin"].previous_version, Some(1));
    assert_eq!(latest["dir/file_0001.bin"].version, 1);
}

#[tokio::test]
async fn scan_cursor_pulls_bounded_batches() {
    let (_dir, store) = temp_store().await;
    let folder = folder_fixture();
    store.insert_folder(&folder).await.unwrap();
    let records: Vec<FileRecord> = (0..57)
        .map(|i| file_fixture(folder.folder_id, &format!("f{i}"), 1))
        .collect();
    store.insert_files_bulk(&records).await.unwrap();

    let mut scan = store.scan_files(&folder.folder_id, 10);
    let mut seen = 0;
    loop {
        let batch = scan.next_batch().await.unwrap();
        if batch.is_empty() {
            break;
        }
        assert!(batch.len() <= 10);
        seen += batch.len();
    }
    assert_eq!(seen, 57);
}

#[tokio::test]
async fn segment_redundancy_pair_is_unique() {
    let (_dir, store) = temp_store().await;
    let file_id = FileId::generate();
    let segment = segment_fixture(file_id, 0, 0);
    store.insert_segments_bulk(&[segment.clone()]).await.unwrap();

    let mut copy = segment_fixture(file_id, 0, 0);
    copy.segment_id = segment.segment_id;
    let err = store.insert_segments_bulk(&[copy]).await.unwrap_err();
    match err {
        StoreError::Query { kind, .. } => assert_eq!(kind, store::QueryErrorKind::Constraint),
        other => panic!("expected constraint error, got {other:?}"),
    }
}

#[tokio::test]
async fn uploaded_segments_are_immutable() {
    let (_dir, store) = temp_store().await;
    let file_id = FileId::generate();
    let segment = segment_fixture(file_id, 0, 0);
    store.insert_segments_bulk(&[segment.clone()]).await.unwrap();

    store
        .set_segment_state(&segment.segment_id, 0, UploadState::Uploaded, Some("<m1@x>"))
        .await
        .unwrap();
    // A later transition must not stick.
    store
        .set_segment_state(&segment.segment_id, 0, UploadState::Failed, None)
        .await
        .unwrap();

    let rows = store.segments_for_file(&file_id).await.unwrap();
    assert_eq!(rows[0].upload_state, UploadState::Uploaded);
    assert_eq!(rows[0].message_id.as_deref(), Some("<m1@x>"));
}

#[tokio::test]
async fn queue_terminal_states_never_regress() {
    let (_dir, store) = temp_store().await;
    let mut item = QueueItem::new("entity".into(), EntityKind::Folder, PRIORITY_NORMAL, 100);
    store.insert_queue_item(&item).await.unwrap();

    item.state = QueueState::Completed;
    item.completed_at = Some(now_epoch());
    store.update_queue_item(&item).await.unwrap();

    item.state = QueueState::Queued;
    store.update_queue_item(&item).await.unwrap();

    let loaded = store.queue_item(&item.queue_id).await.unwrap().unwrap();
    assert_eq!(loaded.state, QueueState::Completed);
}

#[tokio::test]
async fn resumable_queue_orders_by_priority_then_fifo() {
    let (_dir, store) = temp_store().await;
    let mut low = QueueItem::new("low".into(), EntityKind::File, 8, 1);
    low.queued_at = 100;
    let mut high = QueueItem::new("high".into(), EntityKind::File, 1, 1);
    high.queued_at = 200;
    let mut normal_old = QueueItem::new("n1".into(), EntityKind::File, 5, 1);
    normal_old.queued_at = 10;
    let mut normal_new = QueueItem::new("n2".into(), EntityKind::File, 5, 1);
    normal_new.queued_at = 20;

    for item in [&low, &high, &normal_new, &normal_old] {
        store.insert_queue_item(item).await.unwrap();
    }
    let loaded = store.load_resumable_queue().await.unwrap();
    let order: Vec<&str> = loaded.iter().map(|i| i.entity_id.as_str()).collect();
    assert_eq!(order, vec!["high", "n1", "n2", "low"]);
}

#[tokio::test]
async fn share_and_commitment_round_trip() {
    let (_dir, store) = temp_store().await;
    let share_id = ShareId::generate();
    let mut share = Share {
        share_id: share_id.clone(),
        folder_id: FolderId::generate(),
        folder_version: 1,
        kind: ShareKind::Full,
        tier: AccessTier::Member,
        owner_id: "owner".to_string(),
        master_key: None,
        passphrase_hash: None,
        passphrase_salt: None,
        key_salt: None,
        wrapped_keys: Default::default(),
        allowed_users: vec!["u1".to_string()],
        denied_users: vec![],
        index_refs: vec![],
        expires_at: None,
        revoked: false,
        created_at: now_epoch(),
    };
    share
        .wrapped_keys
        .insert("owner".to_string(), "d2tleQ==".to_string());
    store.insert_share(&share).await.unwrap();

    let commitment = Commitment {
        commitment_id: CommitmentId::generate(),
        share_id: share_id.clone(),
        user_id: "u1".to_string(),
        commitment_hash: "cc".repeat(32),
        wrapped_key: "d3JhcHBlZA==".to_string(),
        permissions: r#"{"read":true}"#.to_string(),
        granted_at: now_epoch(),
        revoked: false,
        revoked_at: None,
    };
    store.upsert_commitment(&commitment).await.unwrap();

    let live = store.live_commitment(&share_id, "u1").await.unwrap();
    assert!(live.is_some());

    store.revoke_commitment(&share_id, "u1").await.unwrap();
    assert!(store.live_commitment(&share_id, "u1").await.unwrap().is_none());

    // Re-adding reactivates the same (share, user) row.
    store.upsert_commitment(&commitment).await.unwrap();
    assert!(store.live_commitment(&share_id, "u1").await.unwrap().is_some());

    store.revoke_share(&share_id).await.unwrap();
    let loaded = store.share(&share_id).await.unwrap().unwrap();
    assert!(loaded.revoked);
}

#[tokio::test]
async fn savepoints_roll_back_partial_work() {
    let (_dir, store) = temp_store().await;
    let folder = folder_fixture();
    store.insert_folder(&folder).await.unwrap();

    let mut tx = store.begin().await.unwrap();
    tx.execute(
        "UPDATE folders SET name = $1 WHERE folder_id = $2",
        &[
            store::Arg::from("outer"),
            store::Arg::from(folder.folder_id.to_string()),
        ],
    )
    .await
    .unwrap();

    let sp = tx.savepoint().await.unwrap();
    tx.execute(
        "UPDATE folders SET name = $1 WHERE folder_id = $2",
        &[
            store::Arg::from("inner"),
            store::Arg::from(folder.folder_id.to_string()),
        ],
    )
    .await
    .unwrap();
    tx.rollback_to(&sp).await.unwrap();
    tx.commit().await.unwrap();

    let loaded = store.folder(&folder.folder_id).await.unwrap();
    assert_eq!(loaded.name, "outer");
}

#[tokio::test]
async fn server_health_upsert_and_slow_query_ring() {
    let (_dir, store) = temp_store().await;
    let health = store::ServerHealthRow {
        server_id: "news.example:563".to_string(),
        response_time_ema: 120.5,
        failure_rate_ema: 0.25,
        last_success: Some(now_epoch()),
        last_failure: None,
        unhealthy_since: None,
    };
    store.upsert_server_health(&health).await.unwrap();
    // Upsert replaces, never duplicates.
    store.upsert_server_health(&health).await.unwrap();

    let loaded = store
        .server_health("news.example:563")
        .await
        .unwrap()
        .unwrap();
    assert!((loaded.response_time_ema - 120.5).abs() < 1e-9);
    assert!((loaded.failure_rate_ema - 0.25).abs() < 1e-9);

    // Nothing here was slow enough for the diagnostic ring.
    assert!(store.slow_queries().is_empty());
}

#[tokio::test]
async fn download_progress_round_trip() {
    let (_dir, store) = temp_store().await;
    let share_id = ShareId::generate();
    let file_id = FileId::generate();

    assert!(store
        .download_progress(&share_id, &file_id)
        .await
        .unwrap()
        .is_empty());

    store
        .set_download_progress(&share_id, &file_id, &[0, 1, 4])
        .await
        .unwrap();
    assert_eq!(
        store.download_progress(&share_id, &file_id).await.unwrap(),
        vec![0, 1, 4]
    );

    store
        .set_download_progress(&share_id, &file_id, &[0, 1, 2, 3, 4])
        .await
        .unwrap();
    assert_eq!(
        store
            .download_progress(&share_id, &file_id)
            .await
            .unwrap()
            .len(),
        5
    );

    store.clear_download_progress(&share_id).await.unwrap();
    assert!(store
        .download_progress(&share_id, &file_id)
        .await
        .unwrap()
        .is_empty());
}
