//! Restart recovery: persisted sessions are restored, re-synced against the
//! store, and dropped when their store-side upload no longer exists.

mod common;

use common::{generate_binary, test_config, MemStore, MB};
use sermon_ingest::hash_index::HashIndex;
use sermon_ingest::notify::{CommitNotifier, NullSink};
use sermon_ingest::orchestrator::UploadOrchestrator;
use sermon_ingest::session::{SessionRegistry, SessionStatus};
use sermon_ingest::storage::ObjectStore;
use std::collections::HashMap;
use std::sync::Arc;

fn orchestrator_on(
    store: Arc<MemStore>,
    sessions: Arc<SessionRegistry>,
) -> Arc<UploadOrchestrator> {
    let config = test_config();
    let notifier = CommitNotifier::spawn(
        Arc::new(NullSink),
        config.batch_notify_threshold,
        config.batch_notify_window,
    );
    Arc::new(UploadOrchestrator::new(
        store,
        Arc::new(HashIndex::new()),
        sessions,
        notifier,
        None,
        config,
    ))
}

#[tokio::test]
async fn test_restored_sessions_resync_with_store() {
    let dir = tempfile::tempdir().unwrap();
    let session_file = dir.path().join("sessions.json");
    let store = Arc::new(MemStore::new());

    // "First run": two sessions, one of which loses its store-side upload.
    let (live_id, dead_id) = {
        let sessions = Arc::new(SessionRegistry::new());

        let live_upload = store
            .multipart_init("live_1700000000.wav", "audio/wav", HashMap::new())
            .await
            .unwrap();
        let live = sessions.create(
            "live.wav".into(),
            "live_1700000000.wav".into(),
            live_upload.clone(),
            25 * MB,
            5 * MB,
            None,
            HashMap::new(),
        );
        // A part the client managed to upload before the crash.
        store.put_part(&live_upload, 1, &generate_binary(5 * MB as usize, 1));

        let dead_upload = store
            .multipart_init("dead_1700000000.wav", "audio/wav", HashMap::new())
            .await
            .unwrap();
        let dead = sessions.create(
            "dead.wav".into(),
            "dead_1700000000.wav".into(),
            dead_upload.clone(),
            25 * MB,
            5 * MB,
            None,
            HashMap::new(),
        );
        // The store forgot this upload (expired lifecycle rule, manual abort…).
        store
            .multipart_abort("dead_1700000000.wav", &dead_upload)
            .await
            .unwrap();

        sessions.save_to(&session_file).unwrap();
        (live.session_id, dead.session_id)
    };

    // "Second run": restore and reconcile.
    let restored = Arc::new(SessionRegistry::load_from(&session_file).unwrap());
    assert_eq!(restored.list().len(), 2);

    let orchestrator = orchestrator_on(store.clone(), restored.clone());
    orchestrator.reconcile_sessions().await;

    // The live session survives with its store-side part re-synced.
    let live = restored.get(&live_id).unwrap();
    assert_eq!(live.status, SessionStatus::Open);
    assert_eq!(live.completed_parts.len(), 1);
    assert_eq!(live.completed_parts[0].part_number, 1);
    assert_eq!(live.bytes_received, 5 * MB);

    // The orphaned session is gone.
    assert!(restored.get(&dead_id).is_err());
}

#[tokio::test]
async fn test_terminal_sessions_survive_restore_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let session_file = dir.path().join("sessions.json");
    let store = Arc::new(MemStore::new());

    let committed_id = {
        let sessions = Arc::new(SessionRegistry::new());
        let session = sessions.create(
            "done.wav".into(),
            "done_1700000000.wav".into(),
            "upload-gone".into(),
            10 * MB,
            5 * MB,
            None,
            HashMap::new(),
        );
        sessions
            .close(&session.session_id, SessionStatus::Committed)
            .unwrap();
        sessions.save_to(&session_file).unwrap();
        session.session_id
    };

    let restored = Arc::new(SessionRegistry::load_from(&session_file).unwrap());
    let orchestrator = orchestrator_on(store, restored.clone());
    orchestrator.reconcile_sessions().await;

    // Terminal records are not probed against the store or resurrected.
    assert_eq!(
        restored.get(&committed_id).unwrap().status,
        SessionStatus::Committed
    );
}
