//! Incremental parsing of generated text.
//!
//! Two concerns live here:
//!
//! * [`ToolCallScanner`] — a state machine that watches a token stream for
//!   `<tool_call>…</tool_call>` blocks. Because providers chunk text at
//!   arbitrary byte offsets, a marker can arrive split across chunks; the
//!   scanner holds back the longest trailing fragment that could still
//!   turn into an opening tag and only releases it once disambiguated.
//! * [`parse_ai_content`] — post-stream splitting of `<think>…</think>`
//!   segments into hidden thinking content.

const OPEN_TAG: &str = "<tool_call>";
const CLOSE_TAG: &str = "</tool_call>";
const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// One parsed unit of streamed output.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// User-visible text.
    Text(String),
    /// The body between a complete pair of tool-call markers.
    ToolCall(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ScanState {
    /// Buffering visible text, watching for an opening tag.
    Outside,
    /// Buffering a tool-call body, watching for the closing tag.
    Inside,
}

/// Streaming `<tool_call>` detector.
#[derive(Debug)]
pub struct ToolCallScanner {
    state: ScanState,
    buf: String,
}

impl Default for ToolCallScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallScanner {
    pub fn new() -> Self {
        Self {
            state: ScanState::Outside,
            buf: String::new(),
        }
    }

    /// Feed one chunk; returns every item that became unambiguous.
    pub fn push(&mut self, chunk: &str) -> Vec<StreamItem> {
        self.buf.push_str(chunk);
        let mut items = Vec::new();
        loop {
            match self.state {
                ScanState::Outside => {
                    if let Some(at) = self.buf.find(OPEN_TAG) {
                        if at > 0 {
                            items.push(StreamItem::Text(self.buf[..at].to_string()));
                        }
                        self.buf.drain(..at + OPEN_TAG.len());
                        self.state = ScanState::Inside;
                    } else {
                        let hold = partial_tag_suffix(&self.buf, OPEN_TAG);
                        let release = self.buf.len() - hold;
                        if release > 0 {
                            items.push(StreamItem::Text(self.buf[..release].to_string()));
                            self.buf.drain(..release);
                        }
                        break;
                    }
                }
                ScanState::Inside => {
                    if let Some(at) = self.buf.find(CLOSE_TAG) {
                        items.push(StreamItem::ToolCall(self.buf[..at].trim().to_string()));
                        self.buf.drain(..at + CLOSE_TAG.len());
                        self.state = ScanState::Outside;
                    } else {
                        break;
                    }
                }
            }
        }
        items
    }

    /// Flush at end of stream. An unterminated marker is demoted back to
    /// plain text rather than dropped.
    pub fn finish(&mut self) -> Option<StreamItem> {
        let leftover = match self.state {
            ScanState::Outside if self.buf.is_empty() => return None,
            ScanState::Outside => std::mem::take(&mut self.buf),
            ScanState::Inside => {
                self.state = ScanState::Outside;
                format!("{}{}", OPEN_TAG, std::mem::take(&mut self.buf))
            }
        };
        Some(StreamItem::Text(leftover))
    }
}

/// Length of the longest suffix of `buf` that is a proper prefix of
/// `tag`. That suffix must be held back: the next chunk may complete the
/// tag.
fn partial_tag_suffix(buf: &str, tag: &str) -> usize {
    let max = buf.len().min(tag.len() - 1);
    for len in (1..=max).rev() {
        if !buf.is_char_boundary(buf.len() - len) {
            continue;
        }
        if buf.ends_with(&tag[..len]) {
            return len;
        }
    }
    0
}

/// Result of splitting thinking segments out of a complete response.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedContent {
    /// What the UI shows.
    pub processed: String,
    /// The unmodified model output.
    pub raw: String,
    /// Extracted thinking text, when the mode is on and segments exist.
    pub thinking: Option<String>,
}

/// Split `<think>…</think>` segments out of `full`. With thinking mode
/// off the text passes through untouched. An unterminated `<think>`
/// swallows the remainder, matching how reasoning models emit it.
pub fn parse_ai_content(full: &str, thinking_enabled: bool) -> ParsedContent {
    if !thinking_enabled || !full.contains(THINK_OPEN) {
        return ParsedContent {
            processed: full.trim().to_string(),
            raw: full.to_string(),
            thinking: None,
        };
    }

    let mut visible = String::new();
    let mut thinking = Vec::new();
    let mut rest = full;
    loop {
        match rest.find(THINK_OPEN) {
            Some(at) => {
                visible.push_str(&rest[..at]);
                let body = &rest[at + THINK_OPEN.len()..];
                match body.find(THINK_CLOSE) {
                    Some(end) => {
                        thinking.push(body[..end].trim().to_string());
                        rest = &body[end + THINK_CLOSE.len()..];
                    }
                    None => {
                        thinking.push(body.trim().to_string());
                        rest = "";
                    }
                }
            }
            None => {
                visible.push_str(rest);
                break;
            }
        }
        if rest.is_empty() {
            break;
        }
    }

    ParsedContent {
        processed: visible.trim().to_string(),
        raw: full.to_string(),
        thinking: Some(thinking.join("\n")).filter(|t| !t.is_empty()),
    }
}
