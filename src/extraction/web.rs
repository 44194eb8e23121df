//! Web sources: fetching with a size cap, then HTML cleaning down to article text.

use super::chunking::TokenBudget;
use super::text::blocks_to_drafts;
use super::{DraftSet, ExtractionError};
use crate::config::Config;
use crate::model::{DocumentFormat, LocationMetadata};
use crate::text::collapse_whitespace;
use scraper::{ElementRef, Html, Selector};
use std::time::Duration;

/// Subtrees that never contribute article text.
const EXCLUDED_TAGS: &[&str] = &[
    "script", "style", "nav", "footer", "header", "aside", "noscript", "iframe", "form",
    "template", "svg",
];

/// Elements whose text forms one block.
const BLOCK_TAGS: &[&str] = &[
    "h1", "h2", "h3", "h4", "h5", "h6", "p", "li", "td", "th", "pre", "blockquote",
];

/// Candidate content roots, most specific first.
const ROOT_SELECTORS: &[&str] = &["main", "article", "[role=main]", "#content", ".content", "body"];

/// Limits applied while fetching a web source.
#[derive(Debug, Clone)]
pub struct WebFetchConfig {
    /// Whole-request timeout.
    pub timeout: Duration,
    /// Maximum accepted body size.
    pub max_bytes: usize,
}

impl From<&Config> for WebFetchConfig {
    fn from(config: &Config) -> Self {
        Self {
            timeout: Duration::from_secs(config.web_fetch_timeout_secs),
            max_bytes: config.web_max_bytes,
        }
    }
}

/// Body of a fetched URL together with the pipeline it belongs to.
#[derive(Debug, Clone)]
pub struct FetchedSource {
    /// Final URL after redirects.
    pub url: String,
    /// [`DocumentFormat::Pdf`] when the server returned a PDF, otherwise [`DocumentFormat::Web`].
    pub format: DocumentFormat,
    /// Raw body.
    pub bytes: Vec<u8>,
}

/// Fetch `url`, enforcing the timeout and size cap, and classify the body.
pub async fn fetch_web_source(
    url: &str,
    config: &WebFetchConfig,
) -> Result<FetchedSource, ExtractionError> {
    let parsed = url::Url::parse(url)
        .map_err(|err| ExtractionError::UnsupportedDocument(format!("invalid url {url}: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ExtractionError::UnsupportedDocument(format!(
            "unsupported url scheme {}",
            parsed.scheme()
        )));
    }

    let client = reqwest::Client::builder()
        .user_agent("citegrounder/0.1")
        .timeout(config.timeout)
        .build()
        .map_err(|err| ExtractionError::Fetch(err.to_string()))?;

    tracing::debug!(url = %parsed, "Fetching web source");
    let mut response = client
        .get(parsed.clone())
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|err| ExtractionError::Fetch(err.to_string()))?;

    if response
        .content_length()
        .is_some_and(|length| length > config.max_bytes as u64)
    {
        return Err(ExtractionError::FetchTooLarge {
            limit: config.max_bytes,
        });
    }

    let final_url = response.url().to_string();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_lowercase();

    let mut bytes = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|err| ExtractionError::Fetch(err.to_string()))?
    {
        if bytes.len() + chunk.len() > config.max_bytes {
            return Err(ExtractionError::FetchTooLarge {
                limit: config.max_bytes,
            });
        }
        bytes.extend_from_slice(&chunk);
    }

    let is_pdf = content_type.contains("application/pdf")
        || bytes.starts_with(b"%PDF")
        || (content_type.is_empty() && parsed.path().to_lowercase().ends_with(".pdf"));
    let format = if is_pdf {
        DocumentFormat::Pdf
    } else {
        DocumentFormat::Web
    };

    tracing::info!(
        url = %final_url,
        bytes = bytes.len(),
        format = ?format,
        "Fetched web source"
    );
    Ok(FetchedSource {
        url: final_url,
        format,
        bytes,
    })
}

pub(super) fn extract_html(bytes: &[u8], budget: &TokenBudget) -> Result<DraftSet, ExtractionError> {
    let blocks = html_blocks(&String::from_utf8_lossy(bytes));
    if blocks.is_empty() {
        return Err(ExtractionError::CorruptDocument("no text content".to_string()));
    }
    Ok(blocks_to_drafts(blocks, budget, web_location))
}

fn web_location(start: usize, end: usize) -> LocationMetadata {
    LocationMetadata::Web {
        char_offset_start: start,
        char_offset_end: end,
    }
}

/// Outermost text blocks of the main content, in document order.
pub(crate) fn html_blocks(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let root = pick_root(&document);

    let mut blocks = Vec::new();
    for element in root.descendants().skip(1).filter_map(ElementRef::wrap) {
        let name = element.value().name();
        if !BLOCK_TAGS.contains(&name) || has_excluded_or_block_ancestor(element, root) {
            continue;
        }
        let mut text = String::new();
        collect_visible_text(element, &mut text);
        let text = collapse_whitespace(&text);
        if !text.is_empty() {
            blocks.push(text);
        }
    }

    if blocks.is_empty() {
        let mut text = String::new();
        collect_visible_text(root, &mut text);
        let text = collapse_whitespace(&text);
        if !text.is_empty() {
            blocks.push(text);
        }
    }
    blocks
}

fn pick_root(document: &Html) -> ElementRef<'_> {
    ROOT_SELECTORS
        .iter()
        .filter_map(|selector| Selector::parse(selector).ok())
        .find_map(|selector| document.select(&selector).next())
        .unwrap_or_else(|| document.root_element())
}

fn has_excluded_or_block_ancestor(element: ElementRef<'_>, root: ElementRef<'_>) -> bool {
    if EXCLUDED_TAGS.contains(&element.value().name()) {
        return true;
    }
    for ancestor in element.ancestors() {
        if ancestor.id() == root.id() {
            break;
        }
        if let Some(ancestor) = ElementRef::wrap(ancestor) {
            let name = ancestor.value().name();
            if EXCLUDED_TAGS.contains(&name) || BLOCK_TAGS.contains(&name) {
                return true;
            }
        }
    }
    false
}

fn collect_visible_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        if let Some(child_element) = ElementRef::wrap(child) {
            let name = child_element.value().name();
            if EXCLUDED_TAGS.contains(&name) {
                continue;
            }
            let breaks_words = matches!(name, "br" | "p" | "div" | "li" | "td" | "th" | "tr");
            if breaks_words {
                out.push(' ');
            }
            collect_visible_text(child_element, out);
            if breaks_words {
                out.push(' ');
            }
        } else if let Some(text) = child.value().as_text() {
            out.push_str(text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    const PAGE: &str = r#"<html><head><title>t</title><script>var x = 1;</script></head>
        <body>
          <header><p>Site header</p></header>
          <nav><ul><li>Home</li></ul></nav>
          <main>
            <h1>Solar power</h1>
            <p>Panels convert <b>sunlight</b> into electricity.<script>track()</script></p>
            <ul><li>Cheap</li><li><p>Clean</p></li></ul>
            <aside><p>Ad</p></aside>
          </main>
          <footer><p>Copyright</p></footer>
        </body></html>"#;

    fn fetch_config() -> WebFetchConfig {
        WebFetchConfig {
            timeout: Duration::from_secs(5),
            max_bytes: 1024,
        }
    }

    #[test]
    fn html_blocks_keep_main_content_only() {
        assert_eq!(
            html_blocks(PAGE),
            vec![
                "Solar power",
                "Panels convert sunlight into electricity.",
                "Cheap",
                "Clean",
            ]
        );
    }

    #[test]
    fn falls_back_to_root_text_without_blocks() {
        assert_eq!(
            html_blocks("<html><body><div>Just a div</div></body></html>"),
            vec!["Just a div"]
        );
    }

    #[test]
    fn empty_page_is_corrupt() {
        let budget = TokenBudget::new(50, super::super::chunking::whitespace_token_counter());
        let result = extract_html(b"<html><body><script>x()</script></body></html>", &budget);
        assert!(matches!(result, Err(ExtractionError::CorruptDocument(_))));
    }

    #[tokio::test]
    async fn fetch_classifies_html_and_pdf() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/article");
                then.status(200)
                    .header("content-type", "text/html; charset=utf-8")
                    .body("<p>hello</p>");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/paper");
                then.status(200)
                    .header("content-type", "application/pdf")
                    .body("%PDF-1.5 ...");
            })
            .await;

        let html = fetch_web_source(&server.url("/article"), &fetch_config())
            .await
            .unwrap();
        assert_eq!(html.format, DocumentFormat::Web);
        assert_eq!(html.bytes, b"<p>hello</p>");

        let pdf = fetch_web_source(&server.url("/paper"), &fetch_config())
            .await
            .unwrap();
        assert_eq!(pdf.format, DocumentFormat::Pdf);
    }

    #[tokio::test]
    async fn fetch_enforces_size_cap() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/big");
                then.status(200).body("x".repeat(4096));
            })
            .await;

        let error = fetch_web_source(&server.url("/big"), &fetch_config())
            .await
            .unwrap_err();
        assert!(matches!(error, ExtractionError::FetchTooLarge { limit: 1024 }));
    }

    #[tokio::test]
    async fn fetch_reports_http_errors() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/missing");
                then.status(404);
            })
            .await;

        let error = fetch_web_source(&server.url("/missing"), &fetch_config())
            .await
            .unwrap_err();
        assert!(matches!(error, ExtractionError::Fetch(_)));
    }

    #[tokio::test]
    async fn rejects_non_http_urls() {
        let error = fetch_web_source("file:///etc/passwd", &fetch_config())
            .await
            .unwrap_err();
        assert!(matches!(error, ExtractionError::UnsupportedDocument(_)));
    }
}
