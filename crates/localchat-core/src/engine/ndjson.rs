//! Newline-delimited JSON framing for streamed HTTP bodies.

use reqwest::Response;
use serde::de::DeserializeOwned;

/// Splits arbitrary byte chunks into complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete, non-blank line without its terminator.
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.iter().all(u8::is_ascii_whitespace) {
                return Some(line);
            }
        }
        None
    }

    /// Whatever is left once the body ends, if it is not blank.
    pub fn take_rest(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.buf);
        (!rest.iter().all(u8::is_ascii_whitespace)).then_some(rest)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NdjsonError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Decode(#[from] serde_json::Error),
}

/// Reads one JSON value per line from a streaming response.
pub struct NdjsonReader {
    response: Response,
    lines: LineBuffer,
    finished: bool,
}

impl NdjsonReader {
    pub fn new(response: Response) -> Self {
        Self {
            response,
            lines: LineBuffer::new(),
            finished: false,
        }
    }

    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, NdjsonError> {
        loop {
            if let Some(line) = self.lines.next_line() {
                return Ok(Some(serde_json::from_slice(&line)?));
            }
            if self.finished {
                return match self.lines.take_rest() {
                    Some(rest) => Ok(Some(serde_json::from_slice(&rest)?)),
                    None => Ok(None),
                };
            }
            match self.response.chunk().await? {
                Some(bytes) => self.lines.push(&bytes),
                None => self.finished = true,
            }
        }
    }
}
