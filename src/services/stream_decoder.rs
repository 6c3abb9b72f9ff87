//! Newline-delimited JSON decoding for streamed model responses.
//!
//! The server writes one JSON object per line, but transports may hand us a
//! response object split over several lines. Lines that fail to parse on their
//! own are accumulated and re-parsed as a whole until they form a complete
//! object, up to a byte limit.

use std::collections::VecDeque;
use std::marker::PhantomData;

use futures::stream::{self, Stream, StreamExt};
use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};

use crate::error::{AppError, AppResult};
use crate::models::chat::{
    ChatResponse, GenerateResponse, GenerationEvent, GenerationMetrics, ToolCall,
};

/// A single streamed object from one of the generation endpoints.
pub trait StreamResponse: DeserializeOwned {
    fn content(&self) -> &str;
    fn is_done(&self) -> bool;
    fn metrics(&self) -> GenerationMetrics;

    fn tool_calls(&self) -> Option<Vec<ToolCall>> {
        None
    }
}

impl StreamResponse for ChatResponse {
    fn content(&self) -> &str {
        &self.message.content
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn tool_calls(&self) -> Option<Vec<ToolCall>> {
        self.message.tool_calls.clone()
    }

    fn metrics(&self) -> GenerationMetrics {
        GenerationMetrics {
            model: self.model.clone(),
            done_reason: self.done_reason.clone(),
            total_duration: self.total_duration,
            load_duration: self.load_duration,
            prompt_eval_count: self.prompt_eval_count,
            prompt_eval_duration: self.prompt_eval_duration,
            eval_count: self.eval_count,
            eval_duration: self.eval_duration,
        }
    }
}

impl StreamResponse for GenerateResponse {
    fn content(&self) -> &str {
        &self.response
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn metrics(&self) -> GenerationMetrics {
        GenerationMetrics {
            model: self.model.clone(),
            done_reason: None,
            total_duration: self.total_duration,
            load_duration: self.load_duration,
            prompt_eval_count: self.prompt_eval_count,
            prompt_eval_duration: self.prompt_eval_duration,
            eval_count: self.eval_count,
            eval_duration: self.eval_duration,
        }
    }
}

pub struct StreamDecoder<T> {
    pending: String,
    max_buffer: usize,
    finished: bool,
    _response: PhantomData<fn() -> T>,
}

impl<T: StreamResponse> StreamDecoder<T> {
    pub fn new(max_buffer: usize) -> Self {
        Self {
            pending: String::new(),
            max_buffer,
            finished: false,
            _response: PhantomData,
        }
    }

    /// True once `Done` was produced or the pending buffer overflowed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn finish(&mut self) {
        self.finished = true;
        self.pending.clear();
    }

    /// Decode one transport line into zero or more stream items.
    ///
    /// An `Err` item is always the last item and ends the stream.
    pub fn decode_line(&mut self, line: &str) -> Vec<AppResult<GenerationEvent>> {
        if self.finished {
            return Vec::new();
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Vec::new();
        }

        let first_error = match serde_json::from_str::<T>(line) {
            Ok(response) => {
                self.pending.clear();
                return self.emit(response);
            }
            Err(err) => err,
        };

        if let Some(reported) = server_error_message(line) {
            warn!(
                target: "app::chat::decoder",
                server_error = %reported,
                "server reported an error mid-stream"
            );
        }

        self.pending.push_str(line);
        match serde_json::from_str::<T>(&self.pending) {
            Ok(response) => {
                debug!(
                    target: "app::chat::decoder",
                    buffered = self.pending.len(),
                    "recovered response split across lines"
                );
                self.pending.clear();
                self.emit(response)
            }
            Err(_) if self.pending.len() > self.max_buffer => {
                let observed = self.pending.len();
                warn!(
                    target: "app::chat::decoder",
                    observed,
                    limit = self.max_buffer,
                    "pending decode buffer exceeded limit"
                );
                self.finish();
                vec![
                    Ok(GenerationEvent::DecodeError {
                        raw_line: line.to_string(),
                        cause: first_error.to_string(),
                    }),
                    Err(AppError::content_too_large(observed, self.max_buffer)),
                ]
            }
            Err(_) => {
                trace!(
                    target: "app::chat::decoder",
                    buffered = self.pending.len(),
                    error = %first_error,
                    "buffering incomplete line"
                );
                Vec::new()
            }
        }
    }

    fn emit(&mut self, response: T) -> Vec<AppResult<GenerationEvent>> {
        let mut events = vec![Ok(GenerationEvent::Content {
            text: response.content().to_string(),
        })];
        if let Some(calls) = response.tool_calls().filter(|calls| !calls.is_empty()) {
            events.push(Ok(GenerationEvent::ToolCalls { calls }));
        }
        if response.is_done() {
            self.finished = true;
            events.push(Ok(GenerationEvent::Done {
                metrics: response.metrics(),
            }));
        }
        events
    }
}

/// The `error` string of a line shaped like `{"error":"..."}`.
pub fn server_error_message(line: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    value.get("error")?.as_str().map(str::to_string)
}

/// Splits raw body chunks into lines.
///
/// Splitting happens on the `\n` byte, which never occurs inside a multi-byte
/// UTF-8 sequence, so characters split across chunks are reassembled intact.
pub struct LineSplitter {
    buffer: Vec<u8>,
    max_line: usize,
}

impl LineSplitter {
    pub fn new(max_line: usize) -> Self {
        Self::with_capacity(0, max_line)
    }

    /// Preallocates `capacity` bytes for the line buffer.
    pub fn with_capacity(capacity: usize, max_line: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity.min(max_line)),
            max_line,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn push(&mut self, chunk: &[u8]) -> AppResult<Vec<String>> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(position) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=position).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        if self.buffer.len() > self.max_line {
            let observed = self.buffer.len();
            self.buffer.clear();
            return Err(AppError::content_too_large(observed, self.max_line));
        }

        Ok(lines)
    }

    /// Remaining unterminated line at end of stream, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        Some(line)
    }
}

/// Turn a stream of body chunks into a stream of lines.
pub fn byte_lines<S, B>(chunks: S, max_line: usize) -> impl Stream<Item = AppResult<String>>
where
    S: Stream<Item = AppResult<B>> + Unpin,
    B: AsRef<[u8]>,
{
    buffered_lines(chunks, LineSplitter::new(max_line))
}

/// Like [`byte_lines`], with a caller-configured splitter.
pub fn buffered_lines<S, B>(chunks: S, splitter: LineSplitter) -> impl Stream<Item = AppResult<String>>
where
    S: Stream<Item = AppResult<B>> + Unpin,
    B: AsRef<[u8]>,
{
    let state = (chunks, splitter, VecDeque::new(), false);
    stream::unfold(state, |(mut chunks, mut splitter, mut queue, mut ended)| async move {
        loop {
            if let Some(line) = queue.pop_front() {
                return Some((Ok(line), (chunks, splitter, queue, ended)));
            }
            if ended {
                return None;
            }
            match chunks.next().await {
                Some(Ok(chunk)) => match splitter.push(chunk.as_ref()) {
                    Ok(lines) => queue.extend(lines),
                    Err(err) => {
                        ended = true;
                        return Some((Err(err), (chunks, splitter, queue, ended)));
                    }
                },
                Some(Err(err)) => {
                    ended = true;
                    return Some((Err(err), (chunks, splitter, queue, ended)));
                }
                None => {
                    ended = true;
                    queue.extend(splitter.finish());
                }
            }
        }
    })
}

/// Decode a stream of lines into generation events.
///
/// The sequence ends after `Done`, after the first `Err`, or when the input
/// ends; ending without `Done` is not an error.
pub fn decode_lines<T, S>(lines: S, max_buffer: usize) -> impl Stream<Item = AppResult<GenerationEvent>>
where
    T: StreamResponse,
    S: Stream<Item = AppResult<String>> + Unpin,
{
    let state = (lines, StreamDecoder::<T>::new(max_buffer), VecDeque::new());
    stream::unfold(state, |(mut lines, mut decoder, mut queue)| async move {
        loop {
            if let Some(item) = queue.pop_front() {
                return Some((item, (lines, decoder, queue)));
            }
            if decoder.is_finished() {
                return None;
            }
            match lines.next().await {
                Some(Ok(line)) => queue.extend(decoder.decode_line(&line)),
                Some(Err(err)) => {
                    decoder.finish();
                    return Some((Err(err), (lines, decoder, queue)));
                }
                None => return None,
            }
        }
    })
}
