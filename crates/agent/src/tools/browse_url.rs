//! `browse_url`: fetch a web page and hand its readable text to the model.
//!
//! Only `http` and `https` URLs are fetched. HTML is reduced to text with
//! navigation, header, footer, script and style blocks removed; plain text
//! and JSON are returned as served. Bodies over [`MAX_RESPONSE_BYTES`] are
//! refused and output over [`MAX_OUTPUT_CHARS`] is truncated.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use regex::{Regex, RegexBuilder};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use super::Tool;

pub const MAX_RESPONSE_BYTES: usize = 5 * 1024 * 1024;
pub const MAX_OUTPUT_CHARS: usize = 50_000;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const STRIPPED_BLOCKS: &[&str] =
    &["head", "script", "style", "noscript", "nav", "header", "footer", "svg", "iframe"];

pub struct BrowseUrlTool {
    client: reqwest::Client,
    timeout: Duration,
    max_bytes: usize,
}

impl BrowseUrlTool {
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_limits(DEFAULT_TIMEOUT, MAX_RESPONSE_BYTES)
    }

    pub fn with_limits(timeout: Duration, max_bytes: usize) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().user_agent("zenthor-agent").build()?;
        Ok(Self { client, timeout, max_bytes })
    }

    async fn fetch(&self, url: Url) -> Result<String> {
        let response = self
            .client
            .get(url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|error| self.request_error(error))?;

        let status = response.status();
        if !status.is_success() {
            bail!("HTTP {} fetching {url}", status.as_u16());
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if !is_textual(&content_type) {
            bail!("Cannot extract text from binary content ({content_type})");
        }

        if let Some(length) = response.content_length() {
            if length > self.max_bytes as u64 {
                bail!("Response too large: {length} bytes (limit {} bytes)", self.max_bytes);
            }
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|error| self.request_error(error))?;
            if body.len() + chunk.len() > self.max_bytes {
                bail!("Response too large: more than {} bytes", self.max_bytes);
            }
            body.extend_from_slice(&chunk);
        }

        let raw = String::from_utf8_lossy(&body).into_owned();
        let text = if is_html(&content_type) { html_to_text(&raw) } else { raw };
        debug!(
            event_name = "agent.tool.browse_url.fetched",
            url = %url,
            bytes = body.len(),
            "fetched page"
        );
        Ok(truncate(text, MAX_OUTPUT_CHARS))
    }

    fn request_error(&self, error: reqwest::Error) -> anyhow::Error {
        if error.is_timeout() {
            anyhow!("Request timed out after {}ms", self.timeout.as_millis())
        } else {
            anyhow!("Error fetching URL: {error}")
        }
    }
}

#[async_trait]
impl Tool for BrowseUrlTool {
    fn name(&self) -> &str {
        "browse_url"
    }

    fn description(&self) -> &str {
        "Fetch a web page over http or https and return its readable text content."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "The http or https URL to fetch"}
            },
            "required": ["url"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, input: Value) -> Result<Value> {
        let raw = input
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("'url' is required"))?;
        let url = parse_url(raw)?;
        self.fetch(url).await.map(Value::String)
    }
}

fn parse_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).map_err(|error| anyhow!("Invalid URL `{raw}`: {error}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => bail!("Protocol not allowed: {other}: (only http and https)"),
    }
}

fn is_html(content_type: &str) -> bool {
    content_type.contains("text/html") || content_type.contains("application/xhtml")
}

fn is_textual(content_type: &str) -> bool {
    content_type.is_empty()
        || content_type.starts_with("text/")
        || ["json", "xml", "javascript"].iter().any(|kind| content_type.contains(kind))
}

fn block_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        STRIPPED_BLOCKS
            .iter()
            .filter_map(|tag| {
                RegexBuilder::new(&format!(r"<{tag}\b[^>]*>.*?</{tag}\s*>"))
                    .case_insensitive(true)
                    .dot_matches_new_line(true)
                    .build()
                    .ok()
            })
            .collect()
    })
}

fn markup_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"<!--.*?-->", ""),
            (r"</?(p|div|br|h[1-6]|li|ul|ol|tr|table|section|article|main|blockquote|pre)\b[^>]*>", "\n"),
            (r"<[^>]+>", ""),
        ]
        .into_iter()
        .filter_map(|(expression, replacement)| {
            RegexBuilder::new(expression)
                .case_insensitive(true)
                .dot_matches_new_line(true)
                .build()
                .ok()
                .map(|regex| (regex, replacement))
        })
        .collect()
    })
}

/// Reduces an HTML document to its visible text, one block per line.
pub(crate) fn html_to_text(html: &str) -> String {
    let mut text = html.to_string();
    for pattern in block_patterns() {
        text = pattern.replace_all(&text, " ").into_owned();
    }
    for (pattern, replacement) in markup_patterns() {
        text = pattern.replace_all(&text, *replacement).into_owned();
    }
    let text = decode_entities(&text);

    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn truncate(text: String, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text;
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}\n\n[Truncated: showing {max_chars} of {total} characters]")
}
