use futures::stream::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

use quill_core::error::{QuillError, Result};

/// Parse a raw SSE byte stream into individual events.
/// SSE format: `event: <type>\ndata: <json>\n\n`
#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

/// A parsed SSE event.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed text into the parser and extract complete events.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(&chunk.replace("\r\n", "\n"));
        let mut events = Vec::new();

        // Split on double newlines (event boundaries)
        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();

            let mut event_type = None;
            let mut data_lines = Vec::new();

            for line in block.lines() {
                if let Some(val) = line.strip_prefix("event: ") {
                    event_type = Some(val.to_string());
                } else if let Some(val) = line.strip_prefix("data: ") {
                    data_lines.push(val.to_string());
                } else if let Some(val) = line.strip_prefix("data:") {
                    data_lines.push(val.to_string());
                }
            }

            if !data_lines.is_empty() {
                events.push(SseEvent {
                    event_type,
                    data: data_lines.join("\n"),
                });
            }
        }

        events
    }

    /// True when an event has started but its terminating blank line has not
    /// arrived yet.
    pub fn has_partial(&self) -> bool {
        !self.buffer.trim().is_empty()
    }
}

/// A stream of SSE events from raw bytes.
///
/// Transport errors are surfaced as items so a truncated response is never
/// mistaken for a complete one.
pub struct SseStream<S> {
    inner: S,
    parser: SseParser,
    pending: std::collections::VecDeque<SseEvent>,
    // Bytes of a UTF-8 sequence split across chunks.
    carry: Vec<u8>,
    done: bool,
}

impl<S> SseStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            parser: SseParser::new(),
            pending: std::collections::VecDeque::new(),
            carry: Vec::new(),
            done: false,
        }
    }
}

impl<S> Stream for SseStream<S>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<SseEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if this.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.carry.extend_from_slice(&bytes);
                    let valid_up_to = match std::str::from_utf8(&this.carry) {
                        Ok(_) => this.carry.len(),
                        // A sequence that can never complete, as opposed to one
                        // split across chunks.
                        Err(e) if e.error_len().is_some() => {
                            this.done = true;
                            return Poll::Ready(Some(Err(QuillError::provider(
                                "llm",
                                format!("invalid UTF-8 in response at byte {}", e.valid_up_to()),
                            ))));
                        }
                        Err(e) => e.valid_up_to(),
                    };
                    let text: Vec<u8> = this.carry.drain(..valid_up_to).collect();
                    // valid_up_to guarantees this slice is UTF-8
                    let text = String::from_utf8_lossy(&text);
                    this.pending.extend(this.parser.feed(&text));
                }
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(QuillError::provider(
                        "llm",
                        format!("stream interrupted: {}", e),
                    ))));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    if !this.carry.is_empty() || this.parser.has_partial() {
                        return Poll::Ready(Some(Err(QuillError::provider(
                            "llm",
                            "response body ended mid-event",
                        ))));
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
