mod common;

use std::sync::Arc;

use common::{parts, FakeIndex, StaticFetcher};
use local_mind::store::SqliteStore;
use local_mind::types::UploadState;
use local_mind::{Session, SessionState};
use tokio::sync::watch;

const DISPLAY_MS: i64 = 3_000;

async fn wait(
    state: &mut watch::Receiver<SessionState>,
    what: &str,
    done: impl FnMut(&SessionState) -> bool,
) -> SessionState {
    tokio::time::timeout(std::time::Duration::from_secs(5), state.wait_for(done))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .expect("session state closed")
        .clone()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ingest_search_and_restore_across_sessions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("store.sqlite");

    let store = SqliteStore::open(&path).expect("open store");
    let session = Session::start(
        parts(FakeIndex::new(), Arc::new(store), Arc::new(StaticFetcher::model())),
        DISPLAY_MS,
    );
    let mut state = session.subscribe();

    // Not ready yet: searching is a no-op.
    assert!(session.search("dinner", None).is_none());
    wait(&mut state, "ready", |s| s.ready).await;
    assert!(session.search("   ", None).is_none());

    session.add_document("chat.txt", "9/9/24, 15:16 - Alice: dinner at 8?");
    session.add_document("notes.md", "buy groceries");
    let settled = wait(&mut state, "uploads", |s| {
        s.uploads.len() == 2 && s.uploads_settled()
    })
    .await;
    assert_eq!(settled.documents, vec!["chat.txt", "notes.md"]);
    assert_eq!(settled.indexed_count, 2);
    assert!(settled.queue.is_idle());
    assert_eq!(settled.uploads["chat.txt"].status, UploadState::Completed);

    let request = session.search("dinner", None).expect("search accepted");
    let found = wait(&mut state, "results", |s| !s.is_searching).await;
    assert!(found.pending_search.is_none());
    assert_eq!(found.search_results.len(), 1);
    assert_eq!(found.search_results[0].doc_id, "chat.txt");
    // Transcripts are normalized before they reach the index.
    assert!(found.search_results[0]
        .content
        .starts_with("On 9/9/24, 15:16, Alice said:"));
    assert!(request > 0);

    session.prune_settled(chrono::Utc::now().timestamp_millis() + DISPLAY_MS);
    let pruned = session.snapshot();
    assert!(pruned.uploads.is_empty());
    assert_eq!(pruned.queue.submitted, 0);
    session.shutdown().await;

    let store = SqliteStore::open(&path).expect("reopen store");
    let fetcher = Arc::new(StaticFetcher::model());
    let session = Session::start(
        parts(FakeIndex::new(), Arc::new(store), Arc::clone(&fetcher)),
        DISPLAY_MS,
    );
    let mut state = session.subscribe();
    let restored = wait(&mut state, "ready", |s| s.ready).await;
    assert_eq!(restored.documents, vec!["chat.txt", "notes.md"]);
    assert_eq!(
        restored.uploads["notes.md"]
            .progress
            .as_ref()
            .map(|p| p.etr.as_str()),
        Some("Restored")
    );
    assert_eq!(fetcher.calls(), 0);
    session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_upload_is_reported_and_acknowledged() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::open(&dir.path().join("store.sqlite")).expect("open store");
    let session = Session::start(
        parts(FakeIndex::new(), Arc::new(store), Arc::new(StaticFetcher::model())),
        DISPLAY_MS,
    );
    let mut state = session.subscribe();
    wait(&mut state, "ready", |s| s.ready).await;

    session.add_document("bad.txt", "REJECT");
    let failed = wait(&mut state, "failure", |s| s.uploads_settled()).await;
    assert_eq!(failed.uploads["bad.txt"].status, UploadState::Error);
    assert!(failed.last_error.is_some());
    assert!(failed.documents.is_empty());

    session.acknowledge_error();
    assert!(session.snapshot().last_error.is_none());
    session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_upload_disappears_and_never_completes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::open(&dir.path().join("store.sqlite")).expect("open store");
    let (index, mut gate) = FakeIndex::gated("a.txt");
    let session = Session::start(
        parts(index, Arc::new(store), Arc::new(StaticFetcher::model())),
        DISPLAY_MS,
    );
    let mut state = session.subscribe();
    wait(&mut state, "ready", |s| s.ready).await;

    session.add_document("a.txt", "one\ntwo");
    session.add_document("b.txt", "three");
    gate.started().await;
    session.cancel_upload("b.txt");
    assert!(!session.snapshot().uploads.contains_key("b.txt"));
    gate.release();

    let settled = wait(&mut state, "a.txt", |s| s.uploads_settled()).await;
    assert_eq!(settled.documents, vec!["a.txt"]);
    assert!(!settled.uploads.contains_key("b.txt"));
    assert!(settled.queue.is_idle());
    session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_model_marks_the_session_failed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::open(&dir.path().join("store.sqlite")).expect("open store");
    let session = Session::start(
        parts(FakeIndex::new(), Arc::new(store), Arc::new(StaticFetcher::empty())),
        DISPLAY_MS,
    );
    let mut state = session.subscribe();
    let failed = wait(&mut state, "failure", |s| s.failed).await;
    assert!(!failed.ready);
    assert!(failed
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("404")));
    assert!(session.search("anything", None).is_none());
    session.shutdown().await;
}
