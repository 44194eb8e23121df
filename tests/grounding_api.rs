mod common;

use citegrounder::extraction::normalized_content;
use citegrounder::model::{
    AnswerId, Document, DocumentFormat, DocumentId, HighlightInstruction, LocationMetadata,
};
use citegrounder::{GroundingApi, GroundingError};
use common::service;
use httpmock::prelude::*;
use std::sync::Arc;

const ARTICLE: &str = r#"<html><head><title>Solar</title><script>track()</script></head>
<body>
  <nav><a href="/">Home</a></nav>
  <main>
    <h1>Rooftop solar</h1>
    <p>Photovoltaic panels convert sunlight into electricity without moving parts.</p>
    <p>Inverters turn the direct current from the panels into household alternating current.</p>
  </main>
  <footer>Copyright</footer>
</body></html>"#;

#[tokio::test]
async fn collaborators_drive_the_engine_through_the_trait() {
    let api: Arc<dyn GroundingApi> = Arc::new(service());
    let document = Document::new("manual", DocumentFormat::PlainText);
    api.ingest(
        &document,
        b"Rinse the filter monthly under cold water.\n\nReplace the filter every two years."
            .to_vec(),
    )
    .await
    .unwrap();

    let retrieved = api
        .retrieve(&document.id, "how often to replace the filter", Some(2))
        .await
        .unwrap();
    assert_eq!(retrieved.len(), 2);

    // The marker points at whichever hit is the rinse passage.
    let rinse = retrieved
        .iter()
        .position(|hit| hit.passage_id.sequence_number == 0)
        .unwrap()
        + 1;
    let answer_text = format!("Rinse the filter monthly under cold water [{rinse}].");
    let (answer, citations) = api
        .assign_citations(&AnswerId::new("a1"), &document.id, &answer_text, &retrieved)
        .await
        .unwrap();
    assert_eq!(citations.len(), 1);
    assert_eq!(citations[0].ordinal, 1);
    assert_eq!(citations[0].passage_id.sequence_number, 0);
    assert!(answer.text.ends_with("[1]"));

    let instruction = api
        .resolve_highlight(
            &citations[0].passage_id,
            "Rinse the filter monthly\nunder cold water.\n\nReplace the filter every two years.",
        )
        .unwrap();
    assert!(matches!(instruction, HighlightInstruction::TextSnippet { .. }));

    let report = api.delete_document(&document.id);
    assert!(!report.cancelled_job);
    assert!(report.index_removed);
    assert_eq!(report.citations_removed, 1);
    assert!(api.resolve_highlight(&citations[0].passage_id, "").is_err());
    assert_eq!(api.metrics_snapshot().documents_ingested, 1);
}

#[tokio::test]
async fn web_pages_are_fetched_cleaned_and_located_by_offset() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/solar");
            then.status(200)
                .header("content-type", "text/html; charset=utf-8")
                .body(ARTICLE);
        })
        .await;

    let service = service();
    let document_id = DocumentId::new("solar");
    let outcome = service
        .ingest_url(&document_id, &server.url("/solar"))
        .await
        .unwrap();
    assert_eq!(outcome.passages, 3);

    let passages = service.passages(&document_id).unwrap();
    assert!(
        passages
            .iter()
            .all(|passage| passage.format == DocumentFormat::Web)
    );
    assert!(
        passages
            .iter()
            .all(|passage| !passage.normalized_text.contains("Home"))
    );

    let live = normalized_content(ARTICLE.as_bytes(), DocumentFormat::Web).unwrap();
    for passage in &passages {
        let LocationMetadata::Web {
            char_offset_start,
            char_offset_end,
        } = passage.location
        else {
            panic!("web passage without offsets: {:?}", passage.location);
        };
        let stored: String = live
            .chars()
            .skip(char_offset_start)
            .take(char_offset_end - char_offset_start)
            .collect();
        assert_eq!(stored, passage.normalized_text);

        match service.resolve_highlight(&passage.id(), &live).unwrap() {
            HighlightInstruction::TextSnippet {
                start_offset,
                end_offset,
            } => assert_eq!((start_offset, end_offset), (char_offset_start, char_offset_end)),
            other => panic!("expected a snippet, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn unreachable_pages_fail_without_indexing() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/gone");
            then.status(404);
        })
        .await;

    let service = service();
    let document_id = DocumentId::new("gone");
    let error = service
        .ingest_url(&document_id, &server.url("/gone"))
        .await
        .unwrap_err();
    assert!(matches!(error, GroundingError::Extraction(_)));
    assert_eq!(service.index_state(&document_id), None);
}
