use std::sync::Arc;

use super::*;
use crate::errors::StoreError;
use crate::pool::CancelFlag;
use crate::service::IngestRequest;
use crate::versioning::VersionMessage;

fn request(ids: &[&str], contents: &[&str]) -> IngestRequest {
    IngestRequest {
        ids: ids.iter().map(|s| s.to_string()).collect(),
        documents: contents.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

#[test]
fn test_upsert_is_idempotent() {
    let h = harness().build();
    let docs = vec![
        doc("a", "rust systems engineer"),
        doc("b", "python data scientist"),
        doc("c", "protein folding researcher"),
    ];

    h.service
        .ingest_documents(docs.clone(), false, &VersionMessage::default(), &CancelFlag::new())
        .unwrap();
    let first = h
        .service
        .search(&crate::retrieval::SearchRequest::new("rust engineer"), &CancelFlag::new())
        .unwrap();

    let outcome = h
        .service
        .ingest_documents(docs, false, &VersionMessage::default(), &CancelFlag::new())
        .unwrap();
    assert_eq!(outcome.written, 3);
    assert_eq!(h.service.count().unwrap(), 3);

    let second = h
        .service
        .search(&crate::retrieval::SearchRequest::new("rust engineer"), &CancelFlag::new())
        .unwrap();
    assert_eq!(first.results, second.results);
}

#[test]
fn test_same_id_overwrites() {
    let h = harness().build();
    h.service
        .ingest(request(&["a", "a"], &["old text", "new text"]), &CancelFlag::new())
        .unwrap();
    h.service
        .ingest(request(&["b"], &["other"]), &CancelFlag::new())
        .unwrap();

    assert_eq!(h.service.count().unwrap(), 2);
    let values = h
        .service
        .search(&crate::retrieval::SearchRequest::new("new text"), &CancelFlag::new())
        .unwrap();
    assert_eq!(values.results[0].id, "a");
    assert_eq!(values.results[0].content, "new text");
}

#[test]
fn test_invalid_input_is_rejected_before_embedding() {
    let embedder = Arc::new(HashEmbedder::new());
    let h = harness().embedder(embedder.clone()).build();

    let mismatched = request(&["a", "b"], &["only one"]);
    assert!(matches!(
        h.service.ingest(mismatched, &CancelFlag::new()),
        Err(StoreError::Validation(_))
    ));

    let empty = request(&[], &[]);
    assert!(matches!(
        h.service.ingest(empty, &CancelFlag::new()),
        Err(StoreError::Validation(_))
    ));

    let nul = request(&["a"], &["bad\0content"]);
    assert!(matches!(
        h.service.ingest(nul, &CancelFlag::new()),
        Err(StoreError::Validation(_))
    ));

    assert_eq!(embedder.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(h.service.count().unwrap(), 0);
}

#[test]
fn test_failing_chunk_leaves_other_chunks_written() {
    let h = harness()
        .embedder(Arc::new(HashEmbedder::failing_on("flaky")))
        .configure(|c| c.store.max_batch_size = 2)
        .build();

    let docs = vec![
        doc("a", "first"),
        doc("b", "second"),
        doc("c", "flaky third"),
        doc("d", "fourth"),
        doc("e", "fifth"),
    ];
    let outcome = h
        .service
        .ingest_documents(docs, false, &VersionMessage::default(), &CancelFlag::new())
        .unwrap();

    assert_eq!(outcome.written, 3);
    let failed: Vec<&str> = outcome.failed.iter().map(|f| f.id.as_str()).collect();
    assert_eq!(failed, vec!["c", "d"]);
    assert_eq!(h.service.count().unwrap(), 3);
}

#[test]
fn test_all_chunks_unavailable_reports_every_id() {
    let h = harness()
        .embedder(Arc::new(HashEmbedder::failing_on("down")))
        .build();

    let outcome = h
        .service
        .ingest_documents(
            vec![doc("a", "down"), doc("b", "down too")],
            true,
            &VersionMessage::default(),
            &CancelFlag::new(),
        )
        .unwrap();
    assert_eq!(outcome.written, 0);
    assert_eq!(outcome.failed.len(), 2);
    assert!(outcome.failed[0].reason.contains("unavailable"));
    // nothing written, nothing committed
    assert!(outcome.version.is_none());
    assert!(h.service.list_versions(None).unwrap().is_empty());
}

#[test]
fn test_cancelled_before_start_writes_nothing() {
    let h = harness().build();
    let cancel = CancelFlag::new();
    cancel.cancel();

    let result = h
        .service
        .ingest(request(&["a"], &["text"]), &cancel);
    assert!(matches!(result, Err(StoreError::Cancelled)));
    assert_eq!(h.service.count().unwrap(), 0);
}

#[test]
fn test_concurrent_ingests_are_all_applied() {
    let h = harness().build();
    let service = &h.service;

    std::thread::scope(|scope| {
        for t in 0..4 {
            scope.spawn(move || {
                for i in 0..5 {
                    let id = format!("t{t}-{i}");
                    service
                        .ingest_documents(
                            vec![doc(&id, &format!("document {id}"))],
                            false,
                            &VersionMessage::default(),
                            &CancelFlag::new(),
                        )
                        .unwrap();
                    service.count().unwrap();
                }
            });
        }
    });

    assert_eq!(service.count().unwrap(), 20);
}

#[test]
fn test_distinct_values_and_stats() {
    let h = harness().build();
    let mut a = profile("a", "first", 3.0);
    let mut b = profile("b", "second", 3.0);
    let c = profile("c", "third", 12.0);
    if let Some(DocumentMetadata::LinkedinProfile(p)) = a.metadata.as_mut() {
        p.location = Some("Paris".into());
    }
    if let Some(DocumentMetadata::LinkedinProfile(p)) = b.metadata.as_mut() {
        p.location = Some("Berlin".into());
    }
    h.service
        .ingest_documents(vec![a, b, c], false, &VersionMessage::default(), &CancelFlag::new())
        .unwrap();

    let locations: Vec<String> = h
        .service
        .metadata_values("location")
        .unwrap()
        .iter()
        .map(|v| v.to_string())
        .collect();
    assert_eq!(locations, vec!["Berlin", "Paris"]);
    assert_eq!(h.service.metadata_values("years_experience").unwrap().len(), 2);

    let stats = h.service.collection_stats().unwrap();
    assert_eq!(stats.count, 3);
    assert_eq!(stats.dimensions, 64);
    assert_eq!(stats.model, "hash-test");
}

#[test]
fn test_invalid_config_is_rejected_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.store.max_batch_size = 0;

    let result = ExpertService::with_components(config, Arc::new(HashEmbedder::new()), None, None);
    match result {
        Err(StoreError::Validation(msg)) => assert!(msg.contains("max_batch_size")),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("zero batch size accepted"),
    }
}
