use std::sync::Arc;

use super::*;
use crate::document::AuthorProfile;
use crate::errors::StoreError;
use crate::pool::CancelFlag;
use crate::versioning::{Durability, VersionMessage, VersionRecord, VersionState};

fn author(id: &str, name: &str) -> Document {
    Document::new(
        id,
        format!("{name}. University of Tartu. Interests: distributed systems"),
        Some(DocumentMetadata::AuthorProfile(AuthorProfile {
            name: Some(name.to_string()),
            citations: Some(10),
            ..Default::default()
        })),
    )
}

fn commit(service: &ExpertService, docs: Vec<Document>) -> VersionRecord {
    let message = VersionMessage {
        source: Some("test".into()),
        ..Default::default()
    };
    service
        .ingest_documents(docs, true, &message, &CancelFlag::new())
        .unwrap()
        .version
        .unwrap()
}

fn vectors_file(h: &Harness) -> Vec<u8> {
    std::fs::read(h.service.config().collection_path().join("vectors.bin")).unwrap()
}

#[test]
fn test_versioned_ingest_creates_one_version() {
    let h = harness().build();
    assert_eq!(h.service.version_state(), VersionState::Uninitialized);
    assert!(h.service.list_versions(None).unwrap().is_empty());

    let record = commit(
        &h.service,
        vec![author("doc1", "Ada"), author("doc2", "Grace"), author("doc3", "Barbara")],
    );

    let versions = h.service.list_versions(Some(1)).unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].commit_id, record.commit_id);
    assert_eq!(record.document_count, 3);
    assert_eq!(record.metadata.count_added, 3);
    assert_eq!(record.metadata.source, "test");
    assert!(record.message.contains("3 profiles from test"));
    assert_eq!(record.durability, Durability::LocalOnly);
    assert_eq!(h.service.count().unwrap(), 3);
    assert_eq!(h.service.version_state(), VersionState::Committed);
    assert_eq!(h.service.active_commit(), Some(record.commit_id));
}

#[test]
fn test_unversioned_write_clears_active_commit() {
    let h = harness().build();
    commit(&h.service, vec![author("doc1", "Ada")]);
    assert!(h.service.active_commit().is_some());

    h.service
        .ingest_documents(
            vec![author("doc2", "Grace")],
            false,
            &VersionMessage::default(),
            &CancelFlag::new(),
        )
        .unwrap();
    assert_eq!(h.service.active_commit(), None);
    assert_eq!(h.service.list_versions(None).unwrap().len(), 1);
}

#[test]
fn test_history_is_newest_first_and_capped() {
    let h = harness().build();
    let mut committed = Vec::new();
    for n in 0..4 {
        committed.push(commit(&h.service, vec![author(&format!("doc{n}"), "Ada")]).commit_id);
    }

    let all = h.service.list_versions(None).unwrap();
    let ids: Vec<String> = all.iter().map(|r| r.commit_id.clone()).collect();
    committed.reverse();
    assert_eq!(ids, committed);
    assert!(all.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));

    assert_eq!(h.service.list_versions(Some(2)).unwrap().len(), 2);
    assert_eq!(h.service.list_versions(Some(0)).unwrap().len(), 0);
}

#[test]
fn test_restore_round_trip() {
    let h = harness().build();
    let first = commit(&h.service, vec![author("doc1", "Ada"), author("doc2", "Grace")]);
    let snapshot = vectors_file(&h);

    commit(&h.service, vec![author("doc3", "Barbara")]);
    assert_eq!(h.service.count().unwrap(), 3);

    let outcome = h.service.restore_to(&first.commit_id).unwrap();
    assert!(!outcome.already_active);
    assert_eq!(outcome.document_count, 2);
    assert_eq!(h.service.count().unwrap(), 2);
    assert_eq!(vectors_file(&h), snapshot);
    assert_eq!(h.service.active_commit(), Some(first.commit_id.clone()));

    let again = h.service.restore_to(&first.commit_id).unwrap();
    assert!(again.already_active);
    assert_eq!(again.document_count, 2);

    // restore does not rewrite history
    assert_eq!(h.service.list_versions(None).unwrap().len(), 2);
}

#[test]
fn test_restore_after_reset() {
    let h = harness().build();
    let record = commit(&h.service, vec![author("doc1", "Ada"), author("doc2", "Grace")]);

    h.service.reset().unwrap();
    assert_eq!(h.service.count().unwrap(), 0);
    assert_eq!(h.service.active_commit(), None);

    let outcome = h.service.restore_to(&record.commit_id).unwrap();
    assert!(!outcome.already_active);
    assert_eq!(h.service.count().unwrap(), 2);

    let response = h
        .service
        .search(&crate::retrieval::SearchRequest::new("Grace"), &CancelFlag::new())
        .unwrap();
    assert_eq!(response.results[0].id, "doc2");
}

#[test]
fn test_restore_unknown_commit() {
    let h = harness().build();
    commit(&h.service, vec![author("doc1", "Ada")]);

    assert!(matches!(
        h.service.restore_to("zz"),
        Err(StoreError::VersionNotFound(_))
    ));
    assert_eq!(h.service.count().unwrap(), 1);
    assert_eq!(h.service.version_state(), VersionState::Committed);
}

#[test]
fn test_commits_are_pushed_to_remote() {
    let remote = Arc::new(MemoryRemote::default());
    let h = harness().remote(remote.clone()).build();

    let record = commit(&h.service, vec![author("doc1", "Ada")]);
    assert_eq!(record.durability, Durability::Remote);
    assert_eq!(remote.pushes.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(remote.objects.lock().unwrap().contains_key(&record.snapshot_id));
}

#[test]
fn test_offline_remote_keeps_commit_local_until_next_push() {
    let remote = Arc::new(MemoryRemote::default());
    let h = harness().remote(remote.clone()).build();

    remote.set_offline(true);
    let offline = commit(&h.service, vec![author("doc1", "Ada")]);
    assert_eq!(offline.durability, Durability::LocalOnly);
    assert_eq!(h.service.count().unwrap(), 1);

    remote.set_offline(false);
    let online = commit(&h.service, vec![author("doc2", "Grace")]);
    assert_eq!(online.durability, Durability::Remote);
    assert_eq!(remote.pushes.load(std::sync::atomic::Ordering::SeqCst), 2);

    let history = h.service.list_versions(None).unwrap();
    assert!(history.iter().all(|r| r.durability == Durability::Remote));
}

#[test]
fn test_restore_pulls_missing_snapshot() {
    let remote = Arc::new(MemoryRemote::default());
    let h = harness().remote(remote.clone()).build();

    let first = commit(&h.service, vec![author("doc1", "Ada")]);
    commit(&h.service, vec![author("doc2", "Grace")]);

    let objects = h.service.config().history_path().join("objects");
    for entry in std::fs::read_dir(&objects).unwrap() {
        std::fs::remove_file(entry.unwrap().path()).unwrap();
    }

    let outcome = h.service.restore_to(&first.commit_id).unwrap();
    assert_eq!(outcome.document_count, 1);
    assert_eq!(h.service.count().unwrap(), 1);
}

#[test]
fn test_missing_snapshot_without_remote_fails_cleanly() {
    let h = harness().build();
    let first = commit(&h.service, vec![author("doc1", "Ada")]);
    commit(&h.service, vec![author("doc2", "Grace")]);

    let objects = h.service.config().history_path().join("objects");
    for entry in std::fs::read_dir(&objects).unwrap() {
        std::fs::remove_file(entry.unwrap().path()).unwrap();
    }

    assert!(h.service.restore_to(&first.commit_id).is_err());
    // the live collection is untouched
    assert_eq!(h.service.count().unwrap(), 2);
}

#[test]
fn test_history_survives_reopen() {
    let h = harness().build();
    let record = commit(&h.service, vec![author("doc1", "Ada")]);
    let config = h.service.config().clone();
    drop(h.service);

    let reopened = ExpertService::with_components(config, Arc::new(HashEmbedder::new()), None, None).unwrap();
    let versions = reopened.list_versions(None).unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].commit_id, record.commit_id);
    assert_eq!(reopened.active_commit(), Some(record.commit_id));
    assert_eq!(reopened.count().unwrap(), 1);
}
