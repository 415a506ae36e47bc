//! End-to-end publish/retrieve scenarios over the in-memory transport.

use std::path::Path;
use std::sync::Arc;

use common::{AccessTier, QueueState, UnifiedConfig, UploadState};
use engine::{Engine, MemberCredentials};
use net::MemoryTransport;
use store::Store;

fn test_config(redundancy: u8, workers: usize) -> UnifiedConfig {
    UnifiedConfig {
        segment_size: 32_768,
        pack_threshold: 50_000,
        redundancy_level: redundancy,
        download_worker_threads: workers,
        upload_worker_threads: 1,
        // Light KDF parameters for test speed.
        scrypt_n: 1024,
        pbkdf2_iterations: 1_000,
        ..Default::default()
    }
}

async fn engine_with(config: UnifiedConfig) -> (tempfile::TempDir, Arc<MemoryTransport>, Engine) {
    let db = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", db.path().join("e2e.db").display());
    let store = Store::connect(&url, 4).await.unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let engine = Engine::new(
        store,
        transport.clone(),
        config,
        Arc::new(common::NoopMetrics),
        common::noop_progress(),
    );
    (db, transport, engine)
}

fn pseudo_random(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64).wrapping_mul(2654435761) >> 7) as u8)
        .collect()
}

fn write_source_tree(dir: &Path) -> (Vec<u8>, Vec<u8>) {
    let a = b"hello\n".to_vec();
    let b = pseudo_random(65_536);
    std::fs::write(dir.join("a.txt"), &a).unwrap();
    std::fs::write(dir.join("b.bin"), &b).unwrap();
    (a, b)
}

fn assert_tree_matches(dest: &Path, a: &[u8], b: &[u8]) {
    assert_eq!(std::fs::read(dest.join("a.txt")).unwrap(), a);
    assert_eq!(std::fs::read(dest.join("b.bin")).unwrap(), b);
}

/// Scenario 1: open share round trip with redundancy 2.
#[tokio::test]
async fn open_share_round_trip() {
    let source = tempfile::tempdir().unwrap();
    let (a, b) = write_source_tree(source.path());
    let (_db, transport, engine) = engine_with(test_config(2, 4)).await;

    let folder = engine
        .add_folder(&source.path().to_string_lossy(), None)
        .await
        .unwrap();
    let outcome = engine.index_folder(&folder.folder_id).await.unwrap();
    assert_eq!(outcome.added, 2);

    engine.segment_folder(&folder.folder_id).await.unwrap();
    let state = engine.upload_folder(&folder.folder_id).await.unwrap();
    assert_eq!(state, QueueState::Completed);

    // b.bin: 2 segments x 2 copies; a.txt: 1 packed body x 2 copies.
    assert_eq!(transport.article_count(), 6);

    let publish = engine
        .publish_folder(&folder.folder_id, AccessTier::Open, None, &[], b"pk-owner")
        .await
        .unwrap();
    // One index article joins the six segment articles.
    assert_eq!(transport.article_count(), 7);

    // Token parses to tier=open with an embedded 32-byte key.
    let parsed = access::parse(&publish.token).unwrap();
    let access::ParsedToken::Uri(uri) = parsed else {
        panic!("expected uri token");
    };
    assert_eq!(uri.tier, AccessTier::Open);
    assert_eq!(uri.embedded_key.unwrap().as_bytes().len(), 32);

    // Every uploaded segment row has an article row in the right group.
    let files = engine.store().live_files(&folder.folder_id).await.unwrap();
    for file in &files {
        let rows = engine
            .store()
            .segments_for_file(&file.file_id)
            .await
            .unwrap();
        for row in rows {
            assert_eq!(row.upload_state, UploadState::Uploaded);
            let article = engine
                .store()
                .article(row.message_id.as_deref().unwrap())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(article.group, folder.target_group);
        }
    }

    let dest = tempfile::tempdir().unwrap();
    let summary = engine
        .download_share(&publish.token, dest.path(), None, None)
        .await
        .unwrap();
    assert!(summary.fully_successful());
    assert_eq!(summary.files_completed, 2);
    assert_tree_matches(dest.path(), &a, &b);
}

/// Scenario 2: passphrase share; the wrong passphrase is denied.
#[tokio::test]
async fn passphrase_share_wrong_passphrase_is_denied() {
    let source = tempfile::tempdir().unwrap();
    let (a, b) = write_source_tree(source.path());
    let (_db, _transport, engine) = engine_with(test_config(1, 4)).await;

    let folder = engine
        .add_folder(&source.path().to_string_lossy(), None)
        .await
        .unwrap();
    engine.index_folder(&folder.folder_id).await.unwrap();
    engine.segment_folder(&folder.folder_id).await.unwrap();
    engine.upload_folder(&folder.folder_id).await.unwrap();
    let publish = engine
        .publish_folder(
            &folder.folder_id,
            AccessTier::Passphrase,
            Some("correct horse battery staple"),
            &[],
            b"pk-owner",
        )
        .await
        .unwrap();

    let dest = tempfile::tempdir().unwrap();
    let err = engine
        .download_share(&publish.token, dest.path(), Some("wrong"), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("access denied"));

    let summary = engine
        .download_share(
            &publish.token,
            dest.path(),
            Some("correct horse battery staple"),
            None,
        )
        .await
        .unwrap();
    assert!(summary.fully_successful());
    assert_tree_matches(dest.path(), &a, &b);
}

/// Scenario 3: member share revocation and re-grant.
#[tokio::test]
async fn member_share_revocation() {
    let source = tempfile::tempdir().unwrap();
    let (a, b) = write_source_tree(source.path());
    let (_db, _transport, engine) = engine_with(test_config(1, 4)).await;

    let folder = engine
        .add_folder(&source.path().to_string_lossy(), None)
        .await
        .unwrap();
    engine.index_folder(&folder.folder_id).await.unwrap();
    engine.segment_folder(&folder.folder_id).await.unwrap();
    engine.upload_folder(&folder.folder_id).await.unwrap();

    let members = vec![
        ("u1".to_string(), b"pk-u1".to_vec()),
        ("u2".to_string(), b"pk-u2".to_vec()),
    ];
    let publish = engine
        .publish_folder(
            &folder.folder_id,
            AccessTier::Member,
            None,
            &members,
            b"pk-owner",
        )
        .await
        .unwrap();

    let u1 = MemberCredentials {
        user_id: "u1".to_string(),
        public_key: b"pk-u1".to_vec(),
    };
    let u2 = MemberCredentials {
        user_id: "u2".to_string(),
        public_key: b"pk-u2".to_vec(),
    };

    let dest1 = tempfile::tempdir().unwrap();
    let summary = engine
        .download_share(&publish.token, dest1.path(), None, Some(&u1))
        .await
        .unwrap();
    assert!(summary.fully_successful());
    assert_tree_matches(dest1.path(), &a, &b);

    engine
        .remove_member(&publish.share.share_id, "u2")
        .await
        .unwrap();

    let dest2 = tempfile::tempdir().unwrap();
    let err = engine
        .download_share(&publish.token, dest2.path(), None, Some(&u2))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("access denied"));

    // U1 is unaffected.
    let dest3 = tempfile::tempdir().unwrap();
    assert!(engine
        .download_share(&publish.token, dest3.path(), None, Some(&u1))
        .await
        .unwrap()
        .fully_successful());

    // Re-adding U2 restores access.
    engine
        .add_member(&publish.share.share_id, "u2", b"pk-u2")
        .await
        .unwrap();
    let dest4 = tempfile::tempdir().unwrap();
    assert!(engine
        .download_share(&publish.token, dest4.path(), None, Some(&u2))
        .await
        .unwrap()
        .fully_successful());
}

/// Scenario 4: redundancy failover, then total loss of one segment.
#[tokio::test]
async fn redundancy_failover_and_exhaustion() {
    let source = tempfile::tempdir().unwrap();
    let (a, b) = write_source_tree(source.path());
    let (_db, transport, engine) = engine_with(test_config(3, 2)).await;

    let folder = engine
        .add_folder(&source.path().to_string_lossy(), None)
        .await
        .unwrap();
    engine.index_folder(&folder.folder_id).await.unwrap();
    engine.segment_folder(&folder.folder_id).await.unwrap();
    engine.upload_folder(&folder.folder_id).await.unwrap();
    let publish = engine
        .publish_folder(&folder.folder_id, AccessTier::Open, None, &[], b"pk-owner")
        .await
        .unwrap();

    // Locate b.bin's segment index 1 copies.
    let files = engine.store().live_files(&folder.folder_id).await.unwrap();
    let b_file = files.iter().find(|f| f.path == "b.bin").unwrap();
    let rows = engine
        .store()
        .segments_for_file(&b_file.file_id)
        .await
        .unwrap();
    let copies: Vec<_> = rows.iter().filter(|r| r.segment_index == 1).collect();
    assert_eq!(copies.len(), 3);

    // Kill copies 0 and 1: the download must fail over to copy 2.
    for copy in copies.iter().filter(|c| c.redundancy_index < 2) {
        transport.drop_article(copy.message_id.as_deref().unwrap());
    }
    let dest = tempfile::tempdir().unwrap();
    let summary = engine
        .download_share(&publish.token, dest.path(), None, None)
        .await
        .unwrap();
    assert!(summary.fully_successful());
    assert_tree_matches(dest.path(), &a, &b);

    // Kill the third copy too: b.bin fails, a.txt still completes.
    for copy in copies.iter().filter(|c| c.redundancy_index == 2) {
        transport.drop_article(copy.message_id.as_deref().unwrap());
    }
    let dest2 = tempfile::tempdir().unwrap();
    let summary = engine
        .download_share(&publish.token, dest2.path(), None, None)
        .await
        .unwrap();
    assert_eq!(summary.files_failed.len(), 1);
    assert_eq!(summary.files_failed[0].0, "b.bin");
    assert_eq!(std::fs::read(dest2.path().join("a.txt")).unwrap(), a);
}

/// Scenario 5: an interrupted download resumes, fetching only what is
/// missing.
#[tokio::test]
async fn interrupted_download_resumes() {
    let source = tempfile::tempdir().unwrap();
    // Large enough for several segments, incompressible content.
    let data = pseudo_random(160_000);
    std::fs::write(source.path().join("big.bin"), &data).unwrap();

    // Single download worker so segments arrive strictly in order.
    let (_db, transport, engine) = engine_with(test_config(1, 1)).await;
    let folder = engine
        .add_folder(&source.path().to_string_lossy(), None)
        .await
        .unwrap();
    engine.index_folder(&folder.folder_id).await.unwrap();
    engine.segment_folder(&folder.folder_id).await.unwrap();
    engine.upload_folder(&folder.folder_id).await.unwrap();
    let publish = engine
        .publish_folder(&folder.folder_id, AccessTier::Open, None, &[], b"pk-owner")
        .await
        .unwrap();

    // 160000 / 32768 -> 5 segments. Fail the last one once.
    let files = engine.store().live_files(&folder.folder_id).await.unwrap();
    let rows = engine
        .store()
        .segments_for_file(&files[0].file_id)
        .await
        .unwrap();
    let last = rows.iter().max_by_key(|r| r.segment_index).unwrap();
    transport.fail_fetches(last.message_id.as_deref().unwrap(), 1);

    let dest = tempfile::tempdir().unwrap();
    let first = engine
        .download_share(&publish.token, dest.path(), None, None)
        .await
        .unwrap();
    assert_eq!(first.files_failed.len(), 1);

    // Second session: only the missing tail (plus the index) is fetched.
    let fetched_before = transport.fetch_log().len();
    let second = engine
        .download_share(&publish.token, dest.path(), None, None)
        .await
        .unwrap();
    assert!(second.fully_successful());
    assert!(second.segments_resumed >= 4, "resumed {}", second.segments_resumed);
    let session_fetches = transport.fetch_log().len() - fetched_before;
    // 1 index article + the single missing segment.
    assert!(session_fetches <= 2, "fetched {session_fetches} articles");
    assert_eq!(std::fs::read(dest.path().join("big.bin")).unwrap(), data);
}

/// Scenario 6: re-index emits exactly one row per change kind.
#[tokio::test]
async fn reindex_change_kinds_and_version_bump() {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("keep.txt"), b"same").unwrap();
    std::fs::write(source.path().join("change.txt"), b"before").unwrap();
    std::fs::write(source.path().join("remove.txt"), b"bye").unwrap();

    let (_db, _transport, engine) = engine_with(test_config(1, 4)).await;
    let folder = engine
        .add_folder(&source.path().to_string_lossy(), None)
        .await
        .unwrap();
    engine.index_folder(&folder.folder_id).await.unwrap();
    assert_eq!(engine.folder_info(&folder.folder_id).await.unwrap().version, 1);

    std::fs::write(source.path().join("change.txt"), b"after").unwrap();
    std::fs::remove_file(source.path().join("remove.txt")).unwrap();
    std::fs::write(source.path().join("new.txt"), b"hello").unwrap();

    let outcome = engine.index_folder(&folder.folder_id).await.unwrap();
    assert_eq!(outcome.added, 1);
    assert_eq!(outcome.modified, 1);
    assert_eq!(outcome.deleted, 1);
    assert_eq!(outcome.unchanged, 1);

    let info = engine.folder_info(&folder.folder_id).await.unwrap();
    assert_eq!(info.version, 2);

    let latest = engine
        .store()
        .latest_file_versions(&folder.folder_id)
        .await
        .unwrap();
    assert_eq!(latest["change.txt"].version, 2);
    assert_eq!(latest["change.txt"].previous_version, Some(1));

    let counts = engine
        .store()
        .change_counts(&folder.folder_id)
        .await
        .unwrap();
    assert_eq!(counts[&common::ChangeKind::Added], 1);
    assert_eq!(counts[&common::ChangeKind::Modified], 1);
    assert_eq!(counts[&common::ChangeKind::Deleted], 1);
    assert_eq!(counts[&common::ChangeKind::Unchanged], 1);
}

/// add_folder twice fails; remove then add succeeds.
#[tokio::test]
async fn add_remove_add_folder() {
    let source = tempfile::tempdir().unwrap();
    let (_db, _transport, engine) = engine_with(test_config(1, 4)).await;

    let folder = engine
        .add_folder(&source.path().to_string_lossy(), None)
        .await
        .unwrap();
    assert!(engine
        .add_folder(&source.path().to_string_lossy(), None)
        .await
        .is_err());

    engine.remove_folder(&folder.folder_id).await.unwrap();
    engine
        .add_folder(&source.path().to_string_lossy(), None)
        .await
        .unwrap();
}

/// Publish then immediate revoke denies everyone.
#[tokio::test]
async fn publish_then_revoke_denies_all() {
    let source = tempfile::tempdir().unwrap();
    write_source_tree(source.path());
    let (_db, _transport, engine) = engine_with(test_config(1, 4)).await;

    let folder = engine
        .add_folder(&source.path().to_string_lossy(), None)
        .await
        .unwrap();
    engine.index_folder(&folder.folder_id).await.unwrap();
    engine.segment_folder(&folder.folder_id).await.unwrap();
    engine.upload_folder(&folder.folder_id).await.unwrap();
    let publish = engine
        .publish_folder(&folder.folder_id, AccessTier::Open, None, &[], b"pk-owner")
        .await
        .unwrap();

    engine.revoke_share(&publish.share.share_id).await.unwrap();

    let dest = tempfile::tempdir().unwrap();
    let err = engine
        .download_share(&publish.token, dest.path(), None, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("access denied"));
}

/// Invariant: per-folder logical segment count times redundancy equals
/// the segment rows.
#[tokio::test]
async fn redundancy_row_counts_match_invariant() {
    let source = tempfile::tempdir().unwrap();
    write_source_tree(source.path());
    let (_db, _transport, engine) = engine_with(test_config(2, 4)).await;

    let folder = engine
        .add_folder(&source.path().to_string_lossy(), None)
        .await
        .unwrap();
    engine.index_folder(&folder.folder_id).await.unwrap();
    engine.segment_folder(&folder.folder_id).await.unwrap();

    let files = engine.store().live_files(&folder.folder_id).await.unwrap();
    let mut logical_total = 0u32;
    for file in &files {
        let rows = engine
            .store()
            .segments_for_file(&file.file_id)
            .await
            .unwrap();
        let record = engine.store().file(&file.file_id).await.unwrap();
        let distinct: std::collections::HashSet<_> =
            rows.iter().map(|r| r.segment_index).collect();
        assert_eq!(distinct.len() as u32, record.total_segments);
        for index in &distinct {
            let copies = rows.iter().filter(|r| r.segment_index == *index).count();
            assert_eq!(copies as u8, folder.redundancy_level);
        }
        logical_total += record.total_segments;
    }
    assert!(logical_total > 0);
}
