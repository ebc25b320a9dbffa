use std::sync::Arc;

use super::*;
use crate::document::MetadataFilter;
use crate::errors::StoreError;
use crate::pool::CancelFlag;
use crate::retrieval::{SearchRequest, SearchResponse};
use crate::versioning::VersionMessage;

fn seed(service: &ExpertService, docs: Vec<Document>) {
    service
        .ingest_documents(docs, false, &VersionMessage::default(), &CancelFlag::new())
        .unwrap();
}

fn search(service: &ExpertService, request: SearchRequest) -> SearchResponse {
    service.search(&request, &CancelFlag::new()).unwrap()
}

fn ids(response: &SearchResponse) -> Vec<&str> {
    response.results.iter().map(|h| h.id.as_str()).collect()
}

fn corpus() -> Vec<Document> {
    vec![
        doc("kernel", "linux kernel scheduler developer"),
        doc("ml", "machine learning researcher working on transformers"),
        doc("bio", "protein structure biology lab"),
        doc("rust", "rust compiler and linux tooling engineer"),
        doc("chef", "pastry chef in lyon"),
    ]
}

#[test]
fn test_reranked_search() {
    let h = harness().build();
    seed(&h.service, corpus());

    let mut request = SearchRequest::new("rust linux engineer");
    request.final_k = Some(3);
    let response = search(&h.service, request);

    assert!(!response.degraded);
    assert_eq!(response.results.len(), 3);
    assert_eq!(response.results[0].id, "rust");
    assert!(response.results[0].rerank_score.is_some());
    assert!(response
        .results
        .windows(2)
        .all(|w| w[0].score >= w[1].score));
}

#[test]
fn test_degraded_without_reranker() {
    for reranker in [None, Some(Arc::new(BrokenReranker) as Arc<dyn Reranker>)] {
        let h = harness().reranker(reranker).build();
        seed(&h.service, corpus());

        let mut request = SearchRequest::new("linux kernel");
        request.final_k = Some(2);
        let response = search(&h.service, request);

        assert!(response.degraded);
        assert_eq!(response.results.len(), 2);
        assert_eq!(response.results[0].id, "kernel");
        assert!(response.results[0].distance <= response.results[1].distance);
        assert!(response.results.iter().all(|hit| hit.rerank_score.is_none()));
        let expected = 1.0 - f64::from(response.results[0].distance);
        assert!((response.results[0].score - expected).abs() < 1e-9);
    }
}

#[test]
fn test_initial_k_is_raised_to_final_k() {
    let h = harness().build();
    seed(&h.service, corpus());

    let mut request = SearchRequest::new("engineer");
    request.initial_k = Some(1);
    request.final_k = Some(4);
    assert_eq!(search(&h.service, request).results.len(), 4);
}

#[test]
fn test_fewer_matches_than_final_k() {
    let h = harness().build();
    seed(&h.service, vec![doc("only", "lonely document")]);

    let mut request = SearchRequest::new("document");
    request.final_k = Some(10);
    assert_eq!(ids(&search(&h.service, request)), vec!["only"]);
}

#[test]
fn test_empty_collection_returns_nothing() {
    let h = harness().build();
    let response = search(&h.service, SearchRequest::new("anything"));
    assert!(response.results.is_empty());
    assert!(!response.degraded);
}

#[test]
fn test_invalid_requests() {
    let h = harness().build();
    seed(&h.service, corpus());

    assert!(matches!(
        h.service.search(&SearchRequest::new("   "), &CancelFlag::new()),
        Err(StoreError::Validation(_))
    ));

    let mut request = SearchRequest::new("linux");
    request.final_k = Some(0);
    assert!(matches!(
        h.service.search(&request, &CancelFlag::new()),
        Err(StoreError::Validation(_))
    ));
}

#[test]
fn test_cancelled_search() {
    let h = harness().build();
    seed(&h.service, corpus());

    let cancel = CancelFlag::new();
    cancel.cancel();
    assert!(matches!(
        h.service.search(&SearchRequest::new("linux"), &cancel),
        Err(StoreError::Cancelled)
    ));
}

#[test]
fn test_metadata_filter() {
    let h = harness().build();
    seed(
        &h.service,
        vec![
            profile("junior", "software engineer", 2.0),
            profile("mid", "software engineer", 7.0),
            profile("senior", "software engineer", 15.0),
            doc("untyped", "software engineer"),
        ],
    );

    let mut request = SearchRequest::new("software engineer");
    request.filters = MetadataFilter::new().gte("years_experience", 5.0);
    let mut found = ids(&search(&h.service, request))
        .into_iter()
        .map(String::from)
        .collect::<Vec<_>>();
    found.sort();
    assert_eq!(found, vec!["mid", "senior"]);

    let mut request = SearchRequest::new("software engineer");
    request.filters = MetadataFilter::new().eq("doc_type", "publication");
    assert!(search(&h.service, request).results.is_empty());
}

#[test]
fn test_small_corpus_gets_neutral_tiers() {
    let h = harness().build();
    seed(
        &h.service,
        vec![
            profile("p1", "data engineer", 1.0),
            profile("p5", "data engineer", 5.0),
            profile("p10", "data engineer", 10.0),
            profile("p20", "data engineer", 20.0),
        ],
    );

    let summary = h.service.refresh_credibility_statistics().unwrap();
    assert_eq!(summary.corpus_size, 4);
    assert!(summary.low_confidence);

    let response = search(&h.service, SearchRequest::new("data engineer"));
    assert!(response.low_confidence);
    assert!(!response.stale_statistics);
    for hit in &response.results {
        assert_eq!(hit.credibility_tier, 3);
        assert_eq!(hit.credibility_percentile, None);
    }
}

#[test]
fn test_credibility_breaks_even_relevance() {
    let h = harness().build();
    let years = [1.0, 2.0, 4.0, 8.0, 12.0, 25.0];
    seed(
        &h.service,
        years
            .iter()
            .map(|y| profile(&format!("y{y}"), "site reliability engineer", *y))
            .collect(),
    );

    let summary = h.service.refresh_credibility_statistics().unwrap();
    assert_eq!(summary.corpus_size, 6);
    assert!(!summary.low_confidence);

    let mut request = SearchRequest::new("site reliability engineer");
    request.final_k = Some(6);
    let response = search(&h.service, request);

    assert!(!response.low_confidence);
    let first = &response.results[0];
    assert_eq!(first.id, "y25");
    assert_eq!(first.credibility_tier, 5);
    assert_eq!(first.credibility_percentile, Some(100.0));

    let last = response.results.last().unwrap();
    assert_eq!(last.id, "y1");
    assert_eq!(last.credibility_tier, 1);
}

#[test]
fn test_statistics_go_stale_after_unversioned_writes() {
    let h = harness().build();
    seed(&h.service, corpus());
    h.service.refresh_credibility_statistics().unwrap();
    assert!(!search(&h.service, SearchRequest::new("linux")).stale_statistics);

    seed(&h.service, vec![doc("new", "linux distribution maintainer")]);
    assert!(search(&h.service, SearchRequest::new("linux")).stale_statistics);

    let summary = h.service.refresh_credibility_statistics().unwrap();
    assert!(!summary.stale);
    assert!(!search(&h.service, SearchRequest::new("linux")).stale_statistics);
}

#[test]
fn test_versioned_ingest_rebuilds_statistics() {
    let h = harness().build();
    seed(&h.service, corpus());
    h.service.refresh_credibility_statistics().unwrap();

    h.service
        .ingest_documents(
            vec![doc("new", "linux distribution maintainer")],
            true,
            &VersionMessage::default(),
            &CancelFlag::new(),
        )
        .unwrap();
    assert!(!search(&h.service, SearchRequest::new("linux")).stale_statistics);
}

#[test]
fn test_job_titles_drive_credibility_tiers() {
    let h = harness().build();
    let titles = [
        ("cto", "CTO"),
        ("director", "Director of Research"),
        ("vp", "Vice President, R&D"),
        ("manager", "Engineering Manager"),
        ("senior", "Senior Engineer"),
        ("analyst", "Analyst"),
    ];
    let records: Vec<crate::profile::LinkedinRecord> = titles
        .iter()
        .map(|(id, title)| {
            serde_json::from_value(serde_json::json!({
                "urn_id": id,
                "full_name": "Sam Doe",
                "current_title": title,
                "total_years_experience": "5",
            }))
            .unwrap()
        })
        .collect();
    let docs: Vec<Document> = records
        .into_iter()
        .filter_map(|r| r.into_document())
        .map(|mut d| {
            d.content = "applied machine learning".to_string();
            d
        })
        .collect();
    seed(&h.service, docs);
    h.service.refresh_credibility_statistics().unwrap();

    let mut request = SearchRequest::new("applied machine learning");
    request.final_k = Some(6);
    let response = search(&h.service, request);

    let tier = |id: &str| {
        response
            .results
            .iter()
            .find(|hit| hit.id == id)
            .map(|hit| hit.credibility_tier)
            .unwrap()
    };
    assert_eq!(tier("cto"), 5);
    assert_eq!(tier("director"), 4);
    assert_eq!(tier("vp"), 4);
    assert_eq!(tier("manager"), 3);
    assert_eq!(tier("senior"), 2);
    assert_eq!(tier("analyst"), 1);

    assert_eq!(response.results[0].id, "cto");
    assert_eq!(response.results.last().unwrap().id, "analyst");
}
