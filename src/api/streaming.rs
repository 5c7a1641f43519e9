// SSE streaming support - re-frames the upstream event stream as OpenAI
// chat.completion.chunk records

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt::Display;
use tokio::sync::mpsc;

use crate::proxy::response::{candidate_index, candidate_text, finish_reason_of, transform_usage};

static DATA_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^data: ([^\r\n]*)(?:\n\n|\r\r|\r\n\r\n)").expect("data line pattern compiles")
});

const STREAM_DONE: &str = "data: [DONE]\n\n";

/// Stage A: pulls `data: <payload>` records out of raw upstream bytes.
#[derive(Debug, Default)]
pub struct SseLineSplitter {
    // trailing bytes of a UTF-8 sequence split across chunks
    pending: Vec<u8>,
    buffer: String,
}

impl SseLineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every payload completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(s) => s.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        let text = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
        self.pending.drain(..valid);
        self.buffer.push_str(&text);

        let mut payloads = Vec::new();
        while let Some((payload, consumed)) = DATA_LINE
            .captures(&self.buffer)
            .map(|caps| (caps[1].to_string(), caps[0].len()))
        {
            self.buffer.drain(..consumed);
            payloads.push(payload);
        }
        payloads
    }

    /// Upstream closed. Unterminated leftovers are handed on rather than dropped.
    pub fn finish(&mut self) -> Option<String> {
        if !self.pending.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending).into_owned();
            self.buffer.push_str(&tail);
            self.pending.clear();
        }
        if self.buffer.is_empty() {
            return None;
        }
        tracing::warn!("Unterminated data at end of upstream stream: {:?}", self.buffer);
        Some(std::mem::take(&mut self.buffer))
    }
}

#[derive(Debug)]
struct LastChunk {
    candidate: Value,
    usage: Option<Value>,
}

/// Stage B: turns upstream payloads into OpenAI chunk records, tracking the
/// latest chunk per candidate index so the closing records can be built.
#[derive(Debug)]
pub struct OpenAiChunkMapper {
    id: String,
    model: String,
    include_usage: bool,
    last: BTreeMap<u64, LastChunk>,
}

impl OpenAiChunkMapper {
    pub fn new(id: String, model: String, include_usage: bool) -> Self {
        Self {
            id,
            model,
            include_usage,
            last: BTreeMap::new(),
        }
    }

    pub fn map(&mut self, payload: &str) -> Vec<String> {
        let data: Value = match serde_json::from_str::<Value>(payload) {
            Ok(v) if v.get("candidates").is_some_and(|c| c.is_array()) => v,
            Ok(v) => {
                tracing::error!("Upstream chunk without candidates: {}", v);
                self.error_payload(&format!("Upstream chunk without candidates: {}", v))
            }
            Err(e) => {
                tracing::error!("Error parsing upstream chunk: {}", e);
                self.error_payload(&e.to_string())
            }
        };

        let usage = data.get("usageMetadata").cloned();
        let chunk_usage = usage
            .as_ref()
            .filter(|_| self.include_usage)
            .map(|_| Value::Null);

        let Some(candidates) = data.get("candidates").and_then(|v| v.as_array()) else {
            return Vec::new();
        };

        let mut records = Vec::new();
        for candidate in candidates {
            let index = candidate_index(candidate);

            if !self.last.contains_key(&index) {
                records.push(self.record(
                    json!({
                        "index": index,
                        "delta": { "role": "assistant", "content": "" },
                        "logprobs": null,
                        "finish_reason": null,
                    }),
                    chunk_usage.clone(),
                ));
            }

            if let Some(text) = candidate_text(candidate) {
                records.push(self.record(
                    json!({
                        "index": index,
                        "delta": { "content": text },
                        "logprobs": null,
                        "finish_reason": null,
                    }),
                    chunk_usage.clone(),
                ));
            }

            self.last.insert(
                index,
                LastChunk {
                    candidate: candidate.clone(),
                    usage: usage.clone(),
                },
            );
        }
        records
    }

    /// Closing records for every candidate seen, then the `[DONE]` terminator.
    pub fn finish(&mut self) -> Vec<String> {
        let last = std::mem::take(&mut self.last);
        let mut records: Vec<String> = last
            .iter()
            .map(|(index, chunk)| {
                let usage = chunk
                    .usage
                    .as_ref()
                    .filter(|_| self.include_usage)
                    .map(transform_usage);
                self.record(
                    json!({
                        "index": index,
                        "delta": {},
                        "logprobs": null,
                        "finish_reason": finish_reason_of(&chunk.candidate),
                    }),
                    usage,
                )
            })
            .collect();
        records.push(STREAM_DONE.to_string());
        records
    }

    // one error candidate per slot seen so far, at least one
    fn error_payload(&self, message: &str) -> Value {
        let slots = self.last.len().max(1) as u64;
        let candidates: Vec<Value> = (0..slots)
            .map(|index| {
                json!({
                    "index": index,
                    "finishReason": "error",
                    "content": { "parts": [{ "text": message }] },
                })
            })
            .collect();
        json!({ "candidates": candidates })
    }

    fn record(&self, choice: Value, usage: Option<Value>) -> String {
        let mut chunk = json!({
            "id": self.id,
            "choices": [choice],
            "created": chrono::Utc::now().timestamp(),
            "model": self.model,
            "object": "chat.completion.chunk",
        });
        if let Some(usage) = usage {
            chunk["usage"] = usage;
        }
        format!("data: {}\n\n", chunk)
    }
}

/// Chain Stage A and Stage B over an upstream byte stream. Stage A runs on its
/// own task and hands payloads over a bounded channel, so a slow client
/// throttles the upstream read. Dropping the returned stream stops both.
pub fn openai_event_stream<S, E>(
    upstream: S,
    mut mapper: OpenAiChunkMapper,
) -> impl Stream<Item = Result<Bytes, Infallible>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<String>(32);

    tokio::spawn(async move {
        let mut upstream = Box::pin(upstream);
        let mut splitter = SseLineSplitter::new();

        loop {
            let chunk = tokio::select! {
                _ = tx.closed() => {
                    tracing::debug!("Client went away, closing upstream stream");
                    return;
                }
                chunk = upstream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let bytes = match chunk {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!("Upstream stream error: {}", e);
                    break;
                }
            };
            for payload in splitter.push(&bytes) {
                if tx.send(payload).await.is_err() {
                    tracing::debug!("Client went away, closing upstream stream");
                    return;
                }
            }
        }

        if let Some(rest) = splitter.finish() {
            let _ = tx.send(rest).await;
        }
    });

    async_stream::stream! {
        while let Some(payload) = rx.recv().await {
            for record in mapper.map(&payload) {
                yield Ok(Bytes::from(record));
            }
        }
        for record in mapper.finish() {
            yield Ok(Bytes::from(record));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_record(record: &str) -> Value {
        let body = record
            .strip_prefix("data: ")
            .and_then(|r| r.strip_suffix("\n\n"))
            .unwrap_or_else(|| panic!("not an SSE record: {:?}", record));
        serde_json::from_str(body).unwrap()
    }

    async fn run_stream(chunks: Vec<&'static str>, include_usage: bool) -> Vec<String> {
        let upstream = futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, std::io::Error>(Bytes::from_static(c.as_bytes()))),
        );
        let mapper = OpenAiChunkMapper::new("chatcmpl-test".into(), "gemini-2.5-pro".into(), include_usage);
        openai_event_stream(upstream, mapper)
            .map(|r| String::from_utf8(r.unwrap().to_vec()).unwrap())
            .collect()
            .await
    }

    #[test]
    fn splitter_handles_all_terminators() {
        let mut splitter = SseLineSplitter::new();
        let out = splitter.push(b"data: a\n\ndata: b\r\rdata: c\r\n\r\ndata: d");
        assert_eq!(out, vec!["a", "b", "c"]);
        assert_eq!(splitter.push(b"\n\n"), vec!["d"]);
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn splitter_joins_records_split_across_chunks() {
        let mut splitter = SseLineSplitter::new();
        assert!(splitter.push(b"data: {\"x\"").is_empty());
        assert!(splitter.push(b":1}\n").is_empty());
        assert_eq!(splitter.push(b"\n"), vec!["{\"x\":1}"]);
    }

    #[test]
    fn splitter_keeps_multibyte_chars_intact() {
        let bytes = "data: héllo\n\n".as_bytes();
        // split inside the two-byte é
        let mut splitter = SseLineSplitter::new();
        assert!(splitter.push(&bytes[..8]).is_empty());
        assert_eq!(splitter.push(&bytes[8..]), vec!["héllo"]);
    }

    #[test]
    fn splitter_emits_unterminated_leftovers() {
        let mut splitter = SseLineSplitter::new();
        assert!(splitter.push(b"data: {\"partial\":").is_empty());
        assert_eq!(splitter.finish().as_deref(), Some("data: {\"partial\":"));
        assert_eq!(splitter.finish(), None);
    }

    #[tokio::test]
    async fn single_chunk_produces_bracketed_records() {
        let records = run_stream(
            vec!["data: {\"candidates\":[{\"index\":0,\"content\":{\"parts\":[{\"text\":\"Hi\"}]}}]}\n\n"],
            false,
        )
        .await;

        assert_eq!(records.len(), 4);
        let first = parse_record(&records[0]);
        assert_eq!(first["object"], "chat.completion.chunk");
        assert_eq!(first["id"], "chatcmpl-test");
        assert_eq!(first["model"], "gemini-2.5-pro");
        assert_eq!(first["choices"][0]["delta"], json!({"role": "assistant", "content": ""}));

        let second = parse_record(&records[1]);
        assert_eq!(second["choices"][0]["delta"], json!({"content": "Hi"}));
        assert_eq!(second["choices"][0]["finish_reason"], Value::Null);

        let last = parse_record(&records[2]);
        assert_eq!(last["choices"][0]["delta"], json!({}));
        assert!(last.get("usage").is_none());

        assert_eq!(records[3], "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn finish_reason_and_usage_on_final_chunk() {
        let records = run_stream(
            vec![
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"A\"}]}}],\"usageMetadata\":{\"promptTokenCount\":1}}\r\n\r\n",
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"B\"}]},\"finishReason\":\"MAX_TOKENS\"}],\"usageMetadata\":{\"promptTokenCount\":1,\"candidatesTokenCount\":2,\"totalTokenCount\":3}}\r\n\r\n",
            ],
            true,
        )
        .await;

        let parsed: Vec<Value> = records[..records.len() - 1].iter().map(|r| parse_record(r)).collect();
        let deltas: Vec<&Value> = parsed.iter().map(|c| &c["choices"][0]["delta"]).collect();
        assert_eq!(
            deltas,
            vec![
                &json!({"role": "assistant", "content": ""}),
                &json!({"content": "A"}),
                &json!({"content": "B"}),
                &json!({}),
            ]
        );
        assert_eq!(parsed[1]["usage"], Value::Null);
        assert_eq!(parsed[3]["choices"][0]["finish_reason"], "length");
        assert_eq!(
            parsed[3]["usage"],
            json!({"completion_tokens": 2, "prompt_tokens": 1, "total_tokens": 3})
        );
        assert_eq!(records.last().unwrap(), "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn candidates_are_tracked_per_index() {
        let records = run_stream(
            vec!["data: {\"candidates\":[{\"index\":0,\"content\":{\"parts\":[{\"text\":\"x\"}]}},{\"index\":1,\"content\":{\"parts\":[{\"text\":\"y\"}]}}]}\n\n"],
            false,
        )
        .await;

        let indices: Vec<u64> = records[..records.len() - 1]
            .iter()
            .map(|r| parse_record(r)["choices"][0]["index"].as_u64().unwrap())
            .collect();
        assert_eq!(indices, vec![0, 0, 1, 1, 0, 1]);
    }

    #[tokio::test]
    async fn malformed_payload_becomes_error_candidate() {
        let records = run_stream(vec!["data: {not json\n\n"], false).await;

        assert_eq!(records.len(), 4);
        let content = parse_record(&records[1]);
        assert!(content["choices"][0]["delta"]["content"].as_str().unwrap().contains("key must be a string"));
        let last = parse_record(&records[2]);
        assert_eq!(last["choices"][0]["finish_reason"], "error");
    }

    #[tokio::test]
    async fn chunk_without_candidates_becomes_error_candidate() {
        // a `streamable` body is one JSON array, not a candidates object
        let records = run_stream(
            vec!["data: [{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hello\"}]}}]}]\n\n"],
            false,
        )
        .await;

        assert_eq!(records.len(), 4);
        let content = parse_record(&records[1]);
        assert!(content["choices"][0]["delta"]["content"]
            .as_str()
            .unwrap()
            .starts_with("Upstream chunk without candidates"));
        let last = parse_record(&records[2]);
        assert_eq!(last["choices"][0]["finish_reason"], "error");
        assert_eq!(records[3], "data: [DONE]\n\n");
    }

    #[test]
    fn mapper_flags_object_without_candidates() {
        let mut mapper = OpenAiChunkMapper::new("chatcmpl-test".into(), "gemini-2.5-pro".into(), false);
        let records = mapper.map("{\"promptFeedback\":{\"blockReason\":\"SAFETY\"}}");
        assert_eq!(records.len(), 2);
        assert!(parse_record(&records[1])["choices"][0]["delta"]["content"]
            .as_str()
            .unwrap()
            .contains("blockReason"));
    }

    #[tokio::test]
    async fn dropping_the_client_stream_releases_upstream() {
        let (guard_tx, guard_rx) = tokio::sync::oneshot::channel::<()>();
        // one partial record, then an upstream that never sends again
        let upstream = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(
            b"data: {\"candidates\":",
        ))])
        .chain(futures::stream::pending())
        .map(move |item| {
            let _held = &guard_tx;
            item
        });
        let mapper = OpenAiChunkMapper::new("chatcmpl-test".into(), "gemini-2.5-pro".into(), false);

        let events = openai_event_stream(upstream, mapper);
        drop(events);

        let released = tokio::time::timeout(std::time::Duration::from_secs(2), guard_rx)
            .await
            .expect("upstream stream was not dropped");
        assert!(released.is_err());
    }

    #[tokio::test]
    async fn empty_upstream_still_terminates() {
        let records = run_stream(vec![], false).await;
        assert_eq!(records, vec!["data: [DONE]\n\n"]);
    }
}
