//! Relays the upstream completion to the caller and records the assistant
//! reply in the thread.
//!
//! The mode is fixed before any upstream byte is read:
//! - [`RelayMode::Buffered`]: read the whole body, extract the reply, send
//!   the original bytes back unchanged.
//! - [`RelayMode::Streaming`]: echo the SSE stream line by line while
//!   accumulating `data:` deltas until `[DONE]` or upstream EOF.

use axum::{
    body::Body,
    http::{header, HeaderValue},
    response::Response,
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use crate::models::chat::ChatCompletionEnvelope;
use crate::models::Message;
use crate::store::MessageStore;
use crate::utils::error::ApiError;

/// Response header carrying the thread the turn was recorded in
pub const THREAD_ID_HEADER: &str = "x-thread-id";

const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    Buffered,
    Streaming,
}

impl RelayMode {
    pub fn for_request(stream: bool) -> Self {
        if stream {
            RelayMode::Streaming
        } else {
            RelayMode::Buffered
        }
    }
}

/// Longest unterminated line held back before the stream is cut off.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Splits an SSE byte stream into lines across chunk boundaries.
///
/// Lines are returned without their `\n` terminator; a trailing `\r` is
/// dropped as well.
#[derive(Debug)]
pub struct SseLineSplitter {
    pending: BytesMut,
    max_line: usize,
}

impl Default for SseLineSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

impl SseLineSplitter {
    pub fn new(max_line: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            max_line,
        }
    }

    /// Whether the unterminated remainder has grown past the line limit.
    pub fn overflowed(&self) -> bool {
        self.pending.len() > self.max_line
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line = self.pending.split_to(pos + 1);
            line.truncate(pos);
            lines.push(strip_cr(line));
        }
        lines
    }

    /// Unterminated remainder once upstream has closed.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            return None;
        }
        Some(strip_cr(self.pending.split()))
    }
}

fn strip_cr(mut line: BytesMut) -> Bytes {
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    line.freeze()
}

/// Payload of a `data:` field line, with one optional leading space removed.
fn data_payload(line: &[u8]) -> Option<&str> {
    let rest = line.strip_prefix(b"data:")?;
    let rest = rest.strip_prefix(b" ").unwrap_or(rest);
    std::str::from_utf8(rest).ok()
}

/// Per-call accumulator for a streamed reply. Owned by a single relay.
#[derive(Debug, Default)]
pub struct StreamState {
    reply: String,
    done: bool,
}

impl StreamState {
    /// Inspect one line. Returns `true` once the `[DONE]` sentinel is seen.
    ///
    /// Non-data lines (comments, `event:`, keep-alives) and undecodable
    /// payloads are ignored.
    pub fn observe(&mut self, line: &[u8]) -> bool {
        let Some(payload) = data_payload(line) else {
            return false;
        };

        if payload.trim() == DONE_SENTINEL {
            self.done = true;
            return true;
        }

        match serde_json::from_str::<ChatCompletionEnvelope>(payload) {
            Ok(event) => {
                if let Some(text) = event.delta_text() {
                    self.reply.push_str(text);
                }
            }
            Err(e) => trace!("Skipping undecodable stream payload: {}", e),
        }
        false
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn reply(&self) -> &str {
        &self.reply
    }

    pub fn into_reply(self) -> Option<String> {
        if self.reply.is_empty() {
            None
        } else {
            Some(self.reply)
        }
    }
}

/// Reply text of a buffered completion body, if any.
pub fn extract_reply(body: &[u8]) -> Option<String> {
    let envelope: ChatCompletionEnvelope = serde_json::from_slice(body).ok()?;
    envelope.message_text().map(str::to_string)
}

/// Echo frame for one line: the line bytes plus `\n`.
fn frame(line: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(line.len() + 1);
    out.extend_from_slice(line);
    out.extend_from_slice(b"\n");
    out.freeze()
}

async fn persist_reply(store: &dyn MessageStore, thread_id: &str, reply: String) {
    let len = reply.len();
    match store.save_message(thread_id, &Message::assistant(reply)).await {
        Ok(()) => info!("Saved assistant reply ({} bytes) to thread {}", len, thread_id),
        // The caller already has (or is getting) the upstream bytes
        Err(e) => error!("Failed to save assistant message for thread {}: {}", thread_id, e),
    }
}

/// Save whatever the stream accumulated. The write runs on its own task so
/// a caller hanging up after the last frame cannot cancel it.
async fn persist_streamed(store: &Arc<dyn MessageStore>, thread_id: &str, state: StreamState) {
    debug!(
        "Stream for thread {} finished (sentinel: {}, {} bytes of reply)",
        thread_id,
        state.is_done(),
        state.reply().len()
    );

    let Some(reply) = state.into_reply() else {
        return;
    };

    let store = store.clone();
    let owned_thread = thread_id.to_string();
    let task = tokio::spawn(async move {
        persist_reply(store.as_ref(), &owned_thread, reply).await;
    });
    if let Err(e) = task.await {
        error!("Saving streamed reply for thread {} failed: {}", thread_id, e);
    }
}

fn thread_header(thread_id: &str) -> Option<HeaderValue> {
    match HeaderValue::from_str(thread_id) {
        Ok(value) => Some(value),
        Err(_) => {
            debug!("Thread id {:?} is not a valid header value, omitting", thread_id);
            None
        }
    }
}

#[derive(Clone)]
pub struct ResponseRelay {
    store: Arc<dyn MessageStore>,
    max_line_bytes: usize,
}

impl ResponseRelay {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    /// Cap on a single buffered SSE line; past it the stream is ended.
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    pub async fn relay(
        &self,
        mode: RelayMode,
        thread_id: String,
        upstream: reqwest::Response,
    ) -> Result<Response, ApiError> {
        let mut response = match mode {
            RelayMode::Buffered => self.relay_buffered(&thread_id, upstream).await?,
            RelayMode::Streaming => self.relay_streaming(thread_id.clone(), upstream)?,
        };

        if let Some(value) = thread_header(&thread_id) {
            response.headers_mut().insert(THREAD_ID_HEADER, value);
        }
        Ok(response)
    }

    async fn relay_buffered(
        &self,
        thread_id: &str,
        upstream: reqwest::Response,
    ) -> Result<Response, ApiError> {
        let status = upstream.status();
        let content_type = upstream
            .headers()
            .get(header::CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("application/json"));

        let body = upstream
            .bytes()
            .await
            .map_err(|e| ApiError::Upstream(format!("Failed to read upstream response: {}", e)))?;

        if status.is_success() {
            match extract_reply(&body) {
                Some(reply) => persist_reply(self.store.as_ref(), thread_id, reply).await,
                None => warn!(
                    "No assistant content in upstream response for thread {}",
                    thread_id
                ),
            }
        } else {
            warn!("Upstream returned {} for thread {}", status, thread_id);
        }

        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .map_err(|e| ApiError::Internal(format!("Failed to build response: {}", e)))
    }

    fn relay_streaming(
        &self,
        thread_id: String,
        upstream: reqwest::Response,
    ) -> Result<Response, ApiError> {
        let status = upstream.status();
        let content_type = upstream
            .headers()
            .get(header::CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("text/event-stream"));

        if !status.is_success() {
            warn!("Upstream returned {} for streamed thread {}", status, thread_id);
        }

        let store = self.store.clone();
        let max_line = self.max_line_bytes;
        let mut upstream_body = Box::pin(upstream.bytes_stream());

        // Dropped as soon as the caller disconnects, which also drops the
        // upstream response and closes that connection. The reply is saved
        // before the final frame goes out, so hanging up after it is safe.
        let body = async_stream::stream! {
            let mut lines = SseLineSplitter::new(max_line);
            let mut state = StreamState::default();

            'relay: loop {
                match upstream_body.next().await {
                    Some(Ok(chunk)) => {
                        for line in lines.push(&chunk) {
                            if state.observe(&line) {
                                persist_streamed(&store, &thread_id, std::mem::take(&mut state)).await;
                                yield Ok::<Bytes, std::io::Error>(frame(&line));
                                break 'relay;
                            }
                            yield Ok::<Bytes, std::io::Error>(frame(&line));
                        }

                        if lines.overflowed() {
                            warn!(
                                "Upstream line for thread {} exceeds {} bytes, ending stream",
                                thread_id, max_line
                            );
                            persist_streamed(&store, &thread_id, std::mem::take(&mut state)).await;
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Upstream stream for thread {} broke off: {}", thread_id, e);
                        persist_streamed(&store, &thread_id, std::mem::take(&mut state)).await;
                        break;
                    }
                    None => {
                        let tail = lines.finish();
                        if let Some(line) = &tail {
                            state.observe(line);
                        }
                        persist_streamed(&store, &thread_id, std::mem::take(&mut state)).await;
                        if let Some(line) = tail {
                            yield Ok::<Bytes, std::io::Error>(frame(&line));
                        }
                        break;
                    }
                }
            }
        };

        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CACHE_CONTROL, "no-cache")
            .header("x-accel-buffering", "no")
            .body(Body::from_stream(body))
            .map_err(|e| ApiError::Internal(format!("Failed to build response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MockMessageStore, SqliteStore};
    use axum::http::StatusCode;
    use crate::utils::error::StoreError;

    fn upstream_json(status: u16, body: &str) -> reqwest::Response {
        let response = axum::http::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(body.to_string())
            .unwrap();
        reqwest::Response::from(response)
    }

    fn upstream_sse(chunks: Vec<&'static str>) -> reqwest::Response {
        let stream = futures::stream::iter(
            chunks
                .into_iter()
                .map(|chunk| Ok::<Bytes, std::io::Error>(Bytes::from_static(chunk.as_bytes()))),
        );
        let response = axum::http::Response::builder()
            .status(200)
            .header("content-type", "text/event-stream")
            .body(reqwest::Body::wrap_stream(stream))
            .unwrap();
        reqwest::Response::from(response)
    }

    fn expect_one_reply(store: &mut MockMessageStore, expected: &'static str) {
        store
            .expect_save_message()
            .withf(move |thread_id: &str, message: &Message| {
                thread_id == "t1" && *message == Message::assistant(expected)
            })
            .times(1)
            .returning(|_, _| Ok(()));
    }

    async fn body_of(response: Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    #[test]
    fn test_mode_selection() {
        assert_eq!(RelayMode::for_request(true), RelayMode::Streaming);
        assert_eq!(RelayMode::for_request(false), RelayMode::Buffered);
    }

    #[test]
    fn test_splitter_joins_lines_across_chunks() {
        let mut splitter = SseLineSplitter::default();
        assert!(splitter.push(b"data: {\"a\"").is_empty());
        let lines = splitter.push(b":1}\n\ndata: [DO");
        assert_eq!(lines, vec![Bytes::from("data: {\"a\":1}"), Bytes::new()]);
        let lines = splitter.push(b"NE]\r\n");
        assert_eq!(lines, vec![Bytes::from("data: [DONE]")]);
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_splitter_returns_unterminated_tail() {
        let mut splitter = SseLineSplitter::default();
        assert!(splitter.push(b"data: tail").is_empty());
        assert_eq!(splitter.finish(), Some(Bytes::from("data: tail")));
    }

    #[test]
    fn test_state_accumulates_deltas_until_sentinel() {
        let mut state = StreamState::default();
        assert!(!state.observe(br#"data: {"choices":[{"delta":{"content":"He"}}]}"#));
        assert!(!state.observe(b""));
        assert!(!state.observe(b": keep-alive"));
        assert!(!state.observe(br#"data: {"choices":[{"delta":{"content":"llo"}}]}"#));
        assert!(state.observe(b"data: [DONE]"));
        assert!(state.is_done());
        assert_eq!(state.into_reply().as_deref(), Some("Hello"));
    }

    #[test]
    fn test_state_skips_malformed_payloads() {
        let mut state = StreamState::default();
        assert!(!state.observe(b"data: {not json"));
        assert!(!state.observe(br#"data:{"choices":[{"delta":{"text":"ok"}}]}"#));
        assert!(!state.observe(b"event: ping"));
        assert_eq!(state.reply(), "ok");
    }

    #[test]
    fn test_empty_stream_has_no_reply() {
        let mut state = StreamState::default();
        state.observe(br#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#);
        assert_eq!(state.into_reply(), None);
    }

    #[test]
    fn test_extract_reply_uses_flat_text_fallback() {
        assert_eq!(
            extract_reply(br#"{"choices":[{"text":"legacy completion"}]}"#).as_deref(),
            Some("legacy completion")
        );
        assert_eq!(extract_reply(b"not json"), None);
    }

    #[tokio::test]
    async fn test_buffered_relays_raw_bytes_and_persists_reply() {
        let raw = r#"{"id":"c1","choices":[{"message":{"role":"assistant","content":"ok"}}]}"#;
        let mut store = MockMessageStore::new();
        expect_one_reply(&mut store, "ok");

        let relay = ResponseRelay::new(Arc::new(store));
        let response = relay
            .relay(RelayMode::Buffered, "t1".into(), upstream_json(200, raw))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[THREAD_ID_HEADER], "t1");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(&body_of(response).await[..], raw.as_bytes());
    }

    #[tokio::test]
    async fn test_buffered_malformed_body_is_still_relayed() {
        let mut store = MockMessageStore::new();
        store.expect_save_message().never();

        let relay = ResponseRelay::new(Arc::new(store));
        let response = relay
            .relay(RelayMode::Buffered, "t1".into(), upstream_json(200, "{oops"))
            .await
            .unwrap();

        assert_eq!(&body_of(response).await[..], b"{oops");
    }

    #[tokio::test]
    async fn test_buffered_error_status_is_passed_through_without_saving() {
        let raw = r#"{"error":{"message":"bad key"}}"#;
        let mut store = MockMessageStore::new();
        store.expect_save_message().never();

        let relay = ResponseRelay::new(Arc::new(store));
        let response = relay
            .relay(RelayMode::Buffered, "t1".into(), upstream_json(401, raw))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(&body_of(response).await[..], raw.as_bytes());
    }

    #[tokio::test]
    async fn test_buffered_save_failure_does_not_change_response() {
        let raw = r#"{"choices":[{"message":{"content":"ok"}}]}"#;
        let mut store = MockMessageStore::new();
        store
            .expect_save_message()
            .times(1)
            .returning(|_, _| Err(StoreError::Connect("gone".into())));

        let relay = ResponseRelay::new(Arc::new(store));
        let response = relay
            .relay(RelayMode::Buffered, "t1".into(), upstream_json(200, raw))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(&body_of(response).await[..], raw.as_bytes());
    }

    #[tokio::test]
    async fn test_streaming_echoes_lines_and_saves_once() {
        let mut store = MockMessageStore::new();
        expect_one_reply(&mut store, "Hello");

        let upstream = upstream_sse(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":",
            "{\"content\":\"llo\"}}]}\n\ndata: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        ]);

        let relay = ResponseRelay::new(Arc::new(store));
        let response = relay
            .relay(RelayMode::Streaming, "t1".into(), upstream)
            .await
            .unwrap();

        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers()[THREAD_ID_HEADER], "t1");

        let body = body_of(response).await;
        assert_eq!(
            std::str::from_utf8(&body).unwrap(),
            "data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\n\
             data: [DONE]\n"
        );
    }

    #[tokio::test]
    async fn test_streaming_saves_on_upstream_close_without_sentinel() {
        let mut store = MockMessageStore::new();
        expect_one_reply(&mut store, "partial");

        let upstream = upstream_sse(vec!["data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}"]);

        let relay = ResponseRelay::new(Arc::new(store));
        let response = relay
            .relay(RelayMode::Streaming, "t1".into(), upstream)
            .await
            .unwrap();

        let body = body_of(response).await;
        assert!(body.ends_with(b"}]}\n"));
    }

    #[tokio::test]
    async fn test_streaming_save_failure_is_not_visible_to_caller() {
        let mut store = MockMessageStore::new();
        store
            .expect_save_message()
            .times(1)
            .returning(|_, _| Err(StoreError::Connect("gone".into())));

        let upstream = upstream_sse(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n",
            "data: [DONE]\n",
        ]);

        let relay = ResponseRelay::new(Arc::new(store));
        let response = relay
            .relay(RelayMode::Streaming, "t1".into(), upstream)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_of(response).await;
        assert!(body.ends_with(b"data: [DONE]\n"));
    }

    #[test]
    fn test_splitter_reports_overlong_line() {
        let mut splitter = SseLineSplitter::new(8);
        assert_eq!(splitter.push(b"data: 1\ndata: ok"), vec![Bytes::from("data: 1")]);
        assert!(!splitter.overflowed());
        assert!(splitter.push(b" and then some").is_empty());
        assert!(splitter.overflowed());
    }

    #[tokio::test]
    async fn test_streaming_reply_survives_hang_up_after_sentinel() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());

        // Upstream keeps the connection open after the sentinel
        let chunks = futures::stream::iter(vec![
            Ok::<Bytes, std::io::Error>(Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
            )),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ])
        .chain(futures::stream::pending());
        let upstream = reqwest::Response::from(
            axum::http::Response::builder()
                .status(200)
                .header("content-type", "text/event-stream")
                .body(reqwest::Body::wrap_stream(chunks))
                .unwrap(),
        );

        let relay = ResponseRelay::new(store.clone());
        let response = relay
            .relay(RelayMode::Streaming, "t1".into(), upstream)
            .await
            .unwrap();

        let mut frames = response.into_body().into_data_stream();
        while let Some(frame) = frames.next().await {
            if frame.unwrap().starts_with(b"data: [DONE]") {
                break;
            }
        }
        drop(frames);

        assert_eq!(
            store.get_messages("t1").await.unwrap(),
            vec![Message::assistant("Hello")]
        );
    }

    #[tokio::test]
    async fn test_streaming_ends_on_overlong_line() {
        let mut store = MockMessageStore::new();
        expect_one_reply(&mut store, "ok");

        let upstream = upstream_sse(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n",
            "data: 0123456789012345678901234567890123456789012345678901234567890123456789",
            "0123456789\n",
            "data: [DONE]\n",
        ]);

        let relay = ResponseRelay::new(Arc::new(store)).with_max_line_bytes(64);
        let response = relay
            .relay(RelayMode::Streaming, "t1".into(), upstream)
            .await
            .unwrap();

        let body = body_of(response).await;
        assert_eq!(
            std::str::from_utf8(&body).unwrap(),
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n"
        );
    }
}
