use super::{Producer, StreamState};
use crate::error::GenerateError;
use tokio_stream::StreamExt;

/// What a backend wants done with one decoded line.
#[derive(Debug)]
pub enum LineAction {
    Emit(String),
    Skip,
    /// The backend signalled the end of the answer before the body ended.
    Stop,
    Fail(GenerateError),
}

/// Read a newline-delimited response body to completion on behalf of `producer`.
///
/// Cancellation interrupts the pending read and drops the response, which
/// closes the connection. A body read error ends the stream as a transport
/// failure; what counts as a bad line is up to `on_line`.
pub async fn pump<F>(resp: reqwest::Response, producer: Producer, mut on_line: F)
where
    F: FnMut(&[u8]) -> LineAction + Send,
{
    producer.set_state(StreamState::Streaming);
    let body = resp.bytes_stream();
    let mut body = std::pin::pin!(body);
    let mut decoder = LineDecoder::new();

    loop {
        let item = tokio::select! {
            biased;
            _ = producer.cancelled() => {
                producer.abandon();
                return;
            }
            item = body.next() => item,
        };

        let lines = match item {
            Some(Ok(bytes)) => decoder.push(&bytes),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "error reading response stream");
                producer.fail(GenerateError::Transport(e)).await;
                return;
            }
            None => break,
        };

        for line in lines {
            if !dispatch(&producer, on_line(&line)).await {
                return;
            }
        }
    }

    if let Some(line) = decoder.finish() {
        if !dispatch(&producer, on_line(&line)).await {
            return;
        }
    }
    producer.finish();
}

/// Returns whether the pump should keep reading.
async fn dispatch(producer: &Producer, action: LineAction) -> bool {
    match action {
        LineAction::Emit(text) => {
            if producer.send(text).await {
                true
            } else {
                producer.abandon();
                false
            }
        }
        LineAction::Skip => true,
        LineAction::Stop => {
            producer.finish();
            false
        }
        LineAction::Fail(err) => {
            producer.fail(err).await;
            false
        }
    }
}

/// Incremental splitter for newline-delimited bodies.
///
/// - Buffers raw bytes across network chunks
/// - Yields one line per `\n`, with a trailing `\r` trimmed
/// - Skips blank lines
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
    /// Prefix of `buf` already known to hold no newline.
    scanned: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a body chunk and return every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(off) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
            let pos = self.scanned + off;
            self.scanned = 0;
            let mut line = self.buf.drain(..=pos).collect::<Vec<u8>>();
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
            if !is_blank(&line) {
                out.push(line);
            }
        }
        self.scanned = self.buf.len();

        out
    }

    /// Hand back whatever is left once the body ends without a final newline.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        self.scanned = 0;
        let mut rest = std::mem::take(&mut self.buf);
        if rest.ends_with(b"\r") {
            rest.pop();
        }
        (!is_blank(&rest)).then_some(rest)
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_lines_across_chunk_boundaries() {
        let mut dec = LineDecoder::new();
        assert!(dec.push(br#"{"answer":"h"#).is_empty());
        let lines = dec.push(b"e\"}\n{\"answer\":\"llo\"}\r\n\n{\"x\"");
        assert_eq!(
            lines,
            vec![br#"{"answer":"he"}"#.to_vec(), br#"{"answer":"llo"}"#.to_vec()]
        );
        assert_eq!(dec.finish(), Some(br#"{"x""#.to_vec()));
        assert_eq!(dec.finish(), None);
    }

    #[test]
    fn long_line_in_small_pieces() {
        let mut dec = LineDecoder::new();
        let line = format!("{{\"answer\":\"{}\"}}", "x".repeat(10_000));
        for piece in line.as_bytes().chunks(7) {
            assert!(dec.push(piece).is_empty());
        }
        assert_eq!(dec.push(b"\n{\"a\""), vec![line.into_bytes()]);
        assert_eq!(dec.push(b":1}\n"), vec![br#"{"a":1}"#.to_vec()]);
        assert_eq!(dec.finish(), None);
    }

    #[test]
    fn blank_tail_is_dropped() {
        let mut dec = LineDecoder::new();
        assert_eq!(dec.push(b"a\n  \n"), vec![b"a".to_vec()]);
        dec.push(b" \r");
        assert_eq!(dec.finish(), None);
    }
}
