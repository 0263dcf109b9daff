//! Web reader tool — fetch a URL and return its readable text

use crate::tool::{ParamKind, ParamSchema, ParamSpec, Tool, ToolOutput};
use serde_json::{json, Map, Value};
use tracing::debug;

const DEFAULT_MAX_LENGTH: usize = 8_000;

#[derive(Debug)]
pub struct WebReaderTool {
    client: reqwest::Client,
    timeout_secs: u64,
}

impl WebReaderTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout_secs: 20,
        }
    }
}

impl Default for WebReaderTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Tool for WebReaderTool {
    fn name(&self) -> &str {
        "web_reader"
    }

    fn description(&self) -> &str {
        "Fetch a web page over http(s) and return its readable text content, \
         tags stripped, capped in length."
    }

    fn parameters_schema(&self) -> ParamSchema {
        let mut schema = ParamSchema::new();
        schema.insert(
            "url".to_string(),
            ParamSpec::required(ParamKind::String, "The http(s) URL to fetch"),
        );
        schema.insert(
            "max_length".to_string(),
            ParamSpec::optional(ParamKind::Integer, "Maximum characters to return (default 8000)"),
        );
        schema
    }

    fn concurrency_safe(&self) -> bool {
        true
    }

    async fn execute(&self, args: Map<String, Value>) -> ToolOutput {
        let url = match args.get("url").and_then(Value::as_str) {
            Some(u) if !u.trim().is_empty() => u.trim().to_string(),
            _ => return ToolOutput::failure("missing required parameter: url"),
        };
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return ToolOutput::failure(format!("unsupported URL scheme: {}", url));
        }
        let max_length = args
            .get("max_length")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_LENGTH);

        debug!("web_reader: fetching {}", url);

        let response = match self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_secs(self.timeout_secs))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return ToolOutput::failure(format!("fetch failed: {}", e)),
        };

        let status = response.status();
        if !status.is_success() {
            return ToolOutput::failure(format!("fetch failed: HTTP {}", status));
        }

        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => return ToolOutput::failure(format!("body read failed: {}", e)),
        };

        let mut text = strip_html(&body);
        let total = text.chars().count();
        if total > max_length {
            text = text.chars().take(max_length).collect::<String>() + "...";
        }

        ToolOutput::success(json!({
            "url": url,
            "content": text,
            "total_chars": total,
        }))
    }
}

/// Strip tags, scripts and styles; collapse whitespace.
fn strip_html(html: &str) -> String {
    fn starts_ignore_case(haystack: &str, needle: &str) -> bool {
        haystack.len() >= needle.len()
            && haystack.is_char_boundary(needle.len())
            && haystack[..needle.len()].eq_ignore_ascii_case(needle)
    }

    let mut out = String::with_capacity(html.len() / 2);
    let mut chars = html.char_indices();
    let mut skip_until: Option<&str> = None;
    let mut in_tag = false;

    while let Some((i, c)) = chars.next() {
        if let Some(end_marker) = skip_until {
            if starts_ignore_case(&html[i..], end_marker) {
                // consume the rest of the closing tag (ASCII, 1 byte/char)
                for _ in 0..end_marker.len().saturating_sub(1) {
                    chars.next();
                }
                skip_until = None;
                in_tag = false;
            }
            continue;
        }
        match c {
            '<' => {
                if starts_ignore_case(&html[i..], "<script") {
                    skip_until = Some("</script>");
                } else if starts_ignore_case(&html[i..], "<style") {
                    skip_until = Some("</style>");
                } else {
                    in_tag = true;
                }
            }
            '>' if in_tag => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_html_drops_tags_and_scripts() {
        let html = "<html><head><script>var x = 1;</script><style>body{}</style></head>\
                    <body><h1>Title</h1><p>Hello <b>world</b></p></body></html>";
        let text = strip_html(html);
        assert!(text.contains("Title"));
        assert!(text.contains("Hello world"));
        assert!(!text.contains("var x"));
        assert!(!text.contains("body{}"));
        assert!(!text.contains("<"));
    }

    #[test]
    fn strip_html_plain_text_unchanged() {
        assert_eq!(strip_html("just   some\n text"), "just some text");
    }

    #[tokio::test]
    async fn rejects_non_http_schemes() {
        let tool = WebReaderTool::new();
        let mut args = Map::new();
        args.insert("url".to_string(), serde_json::json!("file:///etc/passwd"));
        let out = tool.execute(args).await;
        assert!(out.is_error());
    }

    #[tokio::test]
    async fn missing_url_fails() {
        let tool = WebReaderTool::new();
        let out = tool.execute(Map::new()).await;
        assert!(out.is_error());
    }
}
