use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

pub const DEFAULT_FETCH_MAX_CHARS: usize = 20_000;

/// Retrieves a page and returns readable text.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<String>;
}

#[derive(Clone)]
pub struct HttpPageFetcher {
    client: reqwest::Client,
    max_chars: usize,
}

impl HttpPageFetcher {
    pub fn new(max_chars: usize) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .user_agent(concat!("parley/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {e}"))?;
        Ok(Self { client, max_chars })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<String> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("fetch of {url} failed with HTTP {}", status.as_u16());
        }
        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("html"))
            .unwrap_or(true);
        let body = response.text().await?;
        if is_html {
            Ok(reduce_html_to_text(&body, self.max_chars))
        } else {
            Ok(body.chars().take(self.max_chars).collect())
        }
    }
}

/// Converts HTML to markdown, then drops images, unwraps links to their
/// label, and collapses blank runs. Output is capped at `max_chars`.
pub fn reduce_html_to_text(html: &str, max_chars: usize) -> String {
    let markdown = html2md::parse_html(html);
    let mut text = markdown;
    if let Ok(images) = Regex::new(r"!\[[^\]]*\]\([^)]*\)") {
        text = images.replace_all(&text, "").into_owned();
    }
    if let Ok(links) = Regex::new(r"\[([^\]]*)\]\([^)]*\)") {
        text = links.replace_all(&text, "$1").into_owned();
    }
    let mut out = String::new();
    let mut blank_run = 0usize;
    for line in text.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_is_reduced_to_plain_text() {
        let html = r#"<html><body><h1>Report</h1><p>See <a href="https://x.example">the data</a>.</p>
            <img src="chart.png" alt="chart"><p></p><p></p><p>End</p></body></html>"#;
        let text = reduce_html_to_text(html, DEFAULT_FETCH_MAX_CHARS);
        assert!(text.contains("Report"));
        assert!(text.contains("See the data."));
        assert!(!text.contains("https://x.example"));
        assert!(!text.contains("chart.png"));
        assert!(!text.contains("\n\n\n"));
    }

    #[test]
    fn output_is_truncated_by_characters() {
        let html = format!("<p>{}</p>", "é".repeat(50));
        assert_eq!(reduce_html_to_text(&html, 10).chars().count(), 10);
    }
}
