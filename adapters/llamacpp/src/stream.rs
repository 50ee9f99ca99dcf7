//! Streaming llama.cpp stdout as text fragments

use std::collections::VecDeque;
use std::io::Read;
use std::process::{Child, ChildStdout};
use std::thread::JoinHandle;

use solollm_core::engine::NativeStream;
use solollm_core::error::BackendError;
use tracing::{debug, warn};

use crate::timings::LlamaCppParser;

/// Bytes read from stdout per chunk
const READ_CHUNK: usize = 256;

/// Marker llama.cpp appends when the model emits end-of-sequence
pub const END_OF_TEXT: &str = "[end of text]";

/// Incremental UTF-8 decoder.
///
/// Multi-byte characters may be split across reads; incomplete trailing
/// bytes are held until the next chunk. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(invalid) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + invalid);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush at end of stream
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Truncates a text stream at the first stop sequence.
///
/// Text that could be the start of a stop sequence is held back until the
/// next chunk decides it.
#[derive(Debug)]
pub struct StopFilter {
    stops: Vec<String>,
    held: String,
    stopped: bool,
}

impl StopFilter {
    pub fn new(stops: impl IntoIterator<Item = String>) -> Self {
        let stops = stops.into_iter().filter(|s| !s.is_empty()).collect();
        Self { stops, held: String::new(), stopped: false }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Feed text, returning what can be released now
    pub fn push(&mut self, text: &str) -> String {
        if self.stopped {
            return String::new();
        }
        self.held.push_str(text);

        let first_stop = self.stops.iter().filter_map(|stop| self.held.find(stop.as_str())).min();
        if let Some(at) = first_stop {
            self.stopped = true;
            let mut released = std::mem::take(&mut self.held);
            released.truncate(at);
            return released;
        }

        let keep = self.partial_suffix_len();
        let split = self.held.len() - keep;
        let rest = self.held.split_off(split);
        std::mem::replace(&mut self.held, rest)
    }

    /// Release held text at end of stream
    pub fn finish(&mut self) -> String {
        if self.stopped {
            return String::new();
        }
        std::mem::take(&mut self.held)
    }

    /// Longest suffix of `held` that is a proper prefix of some stop sequence
    fn partial_suffix_len(&self) -> usize {
        let mut longest = 0;
        for stop in &self.stops {
            for (idx, _) in self.held.char_indices() {
                let suffix = &self.held[idx..];
                if suffix.len() < stop.len() && stop.starts_with(suffix) {
                    longest = longest.max(suffix.len());
                    break;
                }
            }
        }
        longest
    }
}

/// One running llama.cpp process, read fragment by fragment.
///
/// Dropping the stream kills the process.
pub struct ProcessStream {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    decoder: Utf8Decoder,
    filter: StopFilter,
    pending: VecDeque<Result<String, BackendError>>,
    tokens: Option<u64>,
    done: bool,
}

impl ProcessStream {
    pub(crate) fn new(child: Child, stdout: ChildStdout, stderr: JoinHandle<String>, stops: Vec<String>) -> Self {
        let filter = StopFilter::new(stops.into_iter().chain(std::iter::once(END_OF_TEXT.to_string())));
        Self {
            child,
            stdout,
            stderr: Some(stderr),
            decoder: Utf8Decoder::default(),
            filter,
            pending: VecDeque::new(),
            tokens: None,
            done: false,
        }
    }

    fn read_chunk(&mut self) {
        let mut buf = [0u8; READ_CHUNK];
        match self.stdout.read(&mut buf) {
            Ok(0) => self.finish(),
            Ok(n) => {
                let text = self.decoder.decode(&buf[..n]);
                let released = self.filter.push(&text);
                self.pending.push_back(Ok(released));
                if self.filter.is_stopped() {
                    debug!("Stop sequence reached");
                    self.terminate();
                    self.done = true;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                self.terminate();
                self.pending.push_back(Err(BackendError::stream(format!("reading llama.cpp output: {e}"))));
                self.done = true;
            }
        }
    }

    /// End of stdout: flush text, then check how the process exited
    fn finish(&mut self) {
        self.done = true;
        let tail = self.decoder.finish();
        let mut released = self.filter.push(&tail);
        released.push_str(&self.filter.finish());
        self.pending.push_back(Ok(released));

        let status = match self.child.wait() {
            Ok(status) => status,
            Err(e) => {
                self.pending.push_back(Err(BackendError::stream(format!("waiting for llama.cpp: {e}"))));
                return;
            }
        };
        let stderr = self.stderr.take().and_then(|handle| handle.join().ok()).unwrap_or_default();

        if !status.success() {
            let message = stderr_tail(&stderr);
            self.pending.push_back(Err(BackendError::Exit { status: status.to_string(), message }));
            return;
        }

        self.tokens = LlamaCppParser::parse(&stderr).eval_tokens.map(u64::from);
    }

    fn terminate(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            if let Err(e) = self.child.kill() {
                warn!(error = %e, "Failed to kill llama.cpp process");
            }
        }
        let _ = self.child.wait();
    }
}

impl Iterator for ProcessStream {
    type Item = Result<String, BackendError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            if self.done {
                return None;
            }
            self.read_chunk();
        }
    }
}

impl NativeStream for ProcessStream {
    fn token_count(&self) -> Option<u64> {
        self.tokens
    }
}

impl Drop for ProcessStream {
    fn drop(&mut self) {
        if !self.done {
            debug!("Generation abandoned, stopping llama.cpp");
        }
        self.terminate();
    }
}

/// Last few non-empty lines of stderr, for error messages
fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(3);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_split_multibyte() {
        let bytes = "héllo ✓".as_bytes();
        let mut decoder = Utf8Decoder::default();
        let mut out = String::new();
        for chunk in bytes.chunks(1) {
            out.push_str(&decoder.decode(chunk));
        }
        out.push_str(&decoder.finish());
        assert_eq!(out, "héllo ✓");
    }

    #[test]
    fn test_decoder_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[b'a', 0xFF, b'b']), "a\u{FFFD}b");
        // Held until more bytes arrive, then flushed lossily
        assert_eq!(decoder.decode(&[0xE2, 0x9C]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn test_stop_filter_truncates() {
        let mut filter = StopFilter::new(vec!["<|im_end|>".to_string()]);
        assert_eq!(filter.push("Hello"), "Hello");
        assert_eq!(filter.push(" world<|im_end|>junk"), " world");
        assert!(filter.is_stopped());
        assert_eq!(filter.push("more"), "");
        assert_eq!(filter.finish(), "");
    }

    #[test]
    fn test_stop_filter_across_chunks() {
        let mut filter = StopFilter::new(vec!["<|im_end|>".to_string()]);
        assert_eq!(filter.push("Hi <|im"), "Hi ");
        assert_eq!(filter.push("_end|>"), "");
        assert!(filter.is_stopped());
    }

    #[test]
    fn test_stop_filter_releases_false_prefix() {
        let mut filter = StopFilter::new(vec!["<|im_end|>".to_string()]);
        assert_eq!(filter.push("a <|i"), "a ");
        assert_eq!(filter.push("s it"), "<|is it");
        assert_eq!(filter.push("<"), "");
        assert_eq!(filter.finish(), "<");
    }

    #[test]
    fn test_stop_filter_earliest_stop_wins() {
        let mut filter = StopFilter::new(vec!["<|im_start|>".to_string(), END_OF_TEXT.to_string()]);
        assert_eq!(filter.push("done [end of text] <|im_start|>"), "done ");
    }

    #[test]
    fn test_stderr_tail() {
        assert_eq!(stderr_tail("a\n\nb\nc\nd\n"), "b\nc\nd");
        assert_eq!(stderr_tail(""), "");
    }
}
