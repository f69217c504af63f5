//! Web search/scrape adapters (§6 "Web adapters").
//!
//! `WebSearchProvider` implementations are tried in the §6 order
//! {brave, serpapi, fallback}; `FallbackSearchProvider` queries DuckDuckGo's
//! HTML endpoint, grounded on `danielmriley-aigent`'s `web_browse` tool.
//! `HttpWebScraper` extracts title/body text the same way, via the
//! `scraper` crate, with one retry on transient failure per §7.

use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum WebError {
    #[error("web request failed: {0}")]
    Request(String),
    #[error("no extractable content at {0}")]
    NoContent(String),
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[derive(Debug, Clone)]
pub struct ScrapedPage {
    pub url: String,
    pub title: Option<String>,
    pub text: String,
    pub domain: String,
}

#[async_trait]
pub trait WebSearchProvider: Send + Sync {
    async fn search(&self, query: &str, n: usize) -> Result<Vec<SearchHit>, WebError>;
}

#[async_trait]
pub trait WebScraper: Send + Sync {
    async fn scrape(&self, url: &str) -> Result<ScrapedPage, WebError>;
}

fn domain_of(url: &str) -> String {
    url.split("://")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or(url)
        .to_string()
}

/// Brave Search API. Requires `BRAVE_API_KEY`.
pub struct BraveSearchProvider {
    client: reqwest::Client,
    api_key: String,
}

impl BraveSearchProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), api_key: api_key.into() }
    }
}

#[async_trait]
impl WebSearchProvider for BraveSearchProvider {
    async fn search(&self, query: &str, n: usize) -> Result<Vec<SearchHit>, WebError> {
        let response = self
            .client
            .get("https://api.search.brave.com/res/v1/web/search")
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .query(&[("q", query), ("count", &n.to_string()), ("search_lang", "en")])
            .send()
            .await
            .map_err(|e| WebError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(WebError::Request(format!("brave returned {}", response.status())));
        }
        let body: serde_json::Value = response.json().await.map_err(|e| WebError::Request(e.to_string()))?;

        let hits = body
            .get("web")
            .and_then(|w| w.get("results"))
            .and_then(|r| r.as_array())
            .map(|items| {
                items
                    .iter()
                    .take(n)
                    .map(|item| SearchHit {
                        title: item.get("title").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                        url: item.get("url").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                        snippet: item.get("description").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(hits)
    }
}

/// SerpApi (Google engine). Requires `SERP_API_KEY`.
pub struct SerpApiSearchProvider {
    client: reqwest::Client,
    api_key: String,
}

impl SerpApiSearchProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), api_key: api_key.into() }
    }
}

#[async_trait]
impl WebSearchProvider for SerpApiSearchProvider {
    async fn search(&self, query: &str, n: usize) -> Result<Vec<SearchHit>, WebError> {
        let response = self
            .client
            .get("https://serpapi.com/search")
            .query(&[("q", query), ("engine", "google"), ("num", &n.to_string()), ("api_key", &self.api_key)])
            .send()
            .await
            .map_err(|e| WebError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(WebError::Request(format!("serpapi returned {}", response.status())));
        }
        let body: serde_json::Value = response.json().await.map_err(|e| WebError::Request(e.to_string()))?;

        let hits = body
            .get("organic_results")
            .and_then(|r| r.as_array())
            .map(|items| {
                items
                    .iter()
                    .take(n)
                    .map(|item| SearchHit {
                        title: item.get("title").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                        url: item.get("link").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                        snippet: item.get("snippet").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(hits)
    }
}

/// §6's chain terminus: DuckDuckGo's HTML endpoint, keyless.
pub struct FallbackSearchProvider {
    client: reqwest::Client,
}

impl FallbackSearchProvider {
    pub fn new() -> Self {
        Self { client: reqwest::Client::builder().user_agent(USER_AGENT).build().unwrap_or_default() }
    }
}

impl Default for FallbackSearchProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebSearchProvider for FallbackSearchProvider {
    async fn search(&self, query: &str, n: usize) -> Result<Vec<SearchHit>, WebError> {
        let response = self
            .client
            .post("https://html.duckduckgo.com/html/")
            .form(&[("q", query)])
            .send()
            .await
            .map_err(|e| WebError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(WebError::Request(format!("duckduckgo returned {}", response.status())));
        }
        let body = response.text().await.map_err(|e| WebError::Request(e.to_string()))?;

        let hits = {
            let doc = Html::parse_document(&body);
            let result_sel = Selector::parse(".result").expect("static selector");
            let link_sel = Selector::parse("a.result__a").expect("static selector");
            let snippet_sel = Selector::parse("a.result__snippet").expect("static selector");

            doc.select(&result_sel)
                .take(n)
                .filter_map(|result| {
                    let link = result.select(&link_sel).next()?;
                    let url = link.value().attr("href")?.to_string();
                    let title: String = link.text().collect();
                    let snippet = result.select(&snippet_sel).next().map(|s| s.text().collect()).unwrap_or_default();
                    Some(SearchHit { title: title.trim().to_string(), url, snippet })
                })
                .collect()
        };
        Ok(hits)
    }
}

/// Always returns no results — the offline default for tests.
pub struct NullWebSearchProvider;

#[async_trait]
impl WebSearchProvider for NullWebSearchProvider {
    async fn search(&self, _query: &str, _n: usize) -> Result<Vec<SearchHit>, WebError> {
        Ok(Vec::new())
    }
}

/// Real HTTP scraper: fetches `url`, extracts the page title and the best
/// readable text region it can find, retrying once on transient failure.
pub struct HttpWebScraper {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpWebScraper {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder().user_agent(USER_AGENT).build().unwrap_or_default(),
            timeout,
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<String, WebError> {
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .header("Accept", "text/html")
            .send()
            .await
            .map_err(|e| WebError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(WebError::Request(format!("http {}", response.status())));
        }
        response.text().await.map_err(|e| WebError::Request(e.to_string()))
    }
}

#[async_trait]
impl WebScraper for HttpWebScraper {
    async fn scrape(&self, url: &str) -> Result<ScrapedPage, WebError> {
        let html = match self.fetch_once(url).await {
            Ok(html) => html,
            Err(_) => self.fetch_once(url).await?,
        };

        let title = extract_title(&html);
        let text = extract_body_text(&html);
        if text.is_empty() {
            return Err(WebError::NoContent(url.to_string()));
        }

        Ok(ScrapedPage { url: url.to_string(), title, text, domain: domain_of(url) })
    }
}

fn extract_title(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let sel = Selector::parse("title").ok()?;
    doc.select(&sel).next().map(|el| el.text().collect::<String>().trim().to_string()).filter(|t| !t.is_empty())
}

const BODY_SELECTORS: &[&str] = &["article", "main", "[role=\"main\"]", ".post-content", ".entry-content"];

fn extract_body_text(html: &str) -> String {
    let doc = Html::parse_document(html);

    for sel_str in BODY_SELECTORS {
        if let Ok(sel) = Selector::parse(sel_str) {
            if let Some(el) = doc.select(&sel).next() {
                let text = collapse_whitespace(&el.text().collect::<String>());
                if text.len() >= 80 {
                    return text;
                }
            }
        }
    }

    if let Ok(body_sel) = Selector::parse("body") {
        if let Some(body) = doc.select(&body_sel).next() {
            return collapse_whitespace(&body.text().collect::<String>());
        }
    }
    String::new()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Never scrapes anything — the offline default for tests.
pub struct NullWebScraper;

#[async_trait]
impl WebScraper for NullWebScraper {
    async fn scrape(&self, url: &str) -> Result<ScrapedPage, WebError> {
        Err(WebError::NoContent(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_search_provider_returns_empty() {
        let hits = NullWebSearchProvider.search("rust programming", 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn null_scraper_always_errors() {
        let err = NullWebScraper.scrape("https://example.com").await.unwrap_err();
        assert!(matches!(err, WebError::NoContent(_)));
    }

    #[test]
    fn extract_title_from_html() {
        let html = "<html><head><title>Test Page</title></head><body></body></html>";
        assert_eq!(extract_title(html).as_deref(), Some("Test Page"));
    }

    #[test]
    fn extract_body_text_prefers_article() {
        let html = r#"<html><body>
            <nav>Navigation stuff</nav>
            <article>This is the main article content that should be extracted for the test.</article>
        </body></html>"#;
        let text = extract_body_text(html);
        assert!(text.contains("main article content"));
        assert!(!text.contains("Navigation"));
    }

    #[test]
    fn domain_of_extracts_host() {
        assert_eq!(domain_of("https://example.com/a/b"), "example.com");
    }

    #[test]
    fn collapse_whitespace_normalizes_runs() {
        assert_eq!(collapse_whitespace("  hello   world  \n\n"), "hello world");
    }
}
