//! Framed message codec for the compiler wire protocol.
//!
//! Each message is one line of JSON header terminated by `\n`, followed by a
//! body of exactly `bytes` raw bytes (no terminator). The codec does not
//! interpret the header's `type`; dispatch happens in the worker layer.

use std::io::{BufRead, Write};

use serde_json::Value;

use crate::error::{CompilerError, Result};

/// Writes framed messages onto a stream.
pub struct FrameWriter<W: Write> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Emit a frame: `header` (with its `bytes` field set to `|body|`) as one
    /// JSON line, then the body bytes, then flush.
    ///
    /// Write failures are transport errors. A failed flush is tolerated and
    /// surfaces as EOF on the next read of the reply stream.
    pub fn write_message(&mut self, header: &mut Value, body: &[u8]) -> Result<()> {
        let Some(fields) = header.as_object_mut() else {
            return Err(CompilerError::Transport(
                "frame header must be a JSON object".into(),
            ));
        };
        fields.insert("bytes".to_string(), body.len().into());

        let line = serde_json::to_string(header).map_err(|e| {
            CompilerError::Transport(format!("unable to serialize frame header: {e}"))
        })?;

        self.inner
            .write_all(line.as_bytes())
            .and_then(|()| self.inner.write_all(b"\n"))
            .and_then(|()| {
                if body.is_empty() {
                    Ok(())
                } else {
                    self.inner.write_all(body)
                }
            })
            .map_err(|e| CompilerError::Transport(format!("error writing message: {e}")))?;

        let _ = self.inner.flush();
        Ok(())
    }

    /// Write raw bytes outside any frame and flush.
    ///
    /// Used once per worker, for the byte the child swallows on its first
    /// stdin read.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner
            .write_all(bytes)
            .map_err(|e| CompilerError::Transport(format!("error writing message: {e}")))?;
        let _ = self.inner.flush();
        Ok(())
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads framed messages off a stream.
pub struct FrameReader<R: BufRead> {
    inner: R,
}

impl<R: BufRead> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read one line, without its trailing `\n`.
    pub fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        match self.inner.read_line(&mut line) {
            Ok(0) => Err(CompilerError::Transport(
                "error reading line: unexpected EOF".into(),
            )),
            Ok(_) => {
                if line.ends_with('\n') {
                    line.pop();
                }
                if line.ends_with('\r') {
                    line.pop();
                }
                Ok(line)
            }
            Err(e) => Err(CompilerError::Transport(format!("error reading line: {e}"))),
        }
    }

    /// Read exactly `n` body bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut body = vec![0u8; n];
        self.inner
            .read_exact(&mut body)
            .map_err(|e| CompilerError::Transport(format!("error reading message body: {e}")))?;
        Ok(body)
    }
}
