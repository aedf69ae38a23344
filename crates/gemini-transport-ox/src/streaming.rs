//! Incremental extraction of JSON values from a chunked response body.
//!
//! The decoder scans raw bytes. Every structural character (`{ } [ ] " \`) is
//! ASCII and can never occur inside a multi-byte UTF-8 sequence, so a code
//! point split across chunks cannot disturb boundary detection; text is only
//! decoded once a complete span has been cut out of the buffer.

use std::time::Duration;

use async_stream::try_stream;
use futures_util::{StreamExt, stream::BoxStream};
use serde_json::Value;
use tracing::trace;

use crate::{
    error::{ErrorKind, classify_transport_failure},
    transport::ByteStream,
};

/// Scanner state for one streaming response.
///
/// Feed it chunks as they arrive with [`feed`](Self::feed) and call
/// [`finish`](Self::finish) once the body ends. Objects found at the top level
/// are emitted as-is; a top-level array emits each of its object elements.
/// Anything else, including bracketed spans that fail to parse, is skipped.
#[derive(Debug, Default)]
pub struct JsonStreamDecoder {
    buffer: Vec<u8>,
    /// Next byte of `buffer` to scan.
    cursor: usize,
    brace_depth: usize,
    bracket_depth: usize,
    in_string: bool,
    escape_next: bool,
    /// Offset of the opening `{`/`[` of the value being scanned.
    value_start: Option<usize>,
}

impl JsonStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every value completed by it, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);

        let mut emitted = Vec::new();
        while let Some(end) = self.scan() {
            let start = self.value_start.take().unwrap_or(0);
            let span: Vec<u8> = self.buffer.drain(..=end).skip(start).collect();
            self.cursor = 0;
            emit(&span, &mut emitted);
        }

        // Scanned noise before an open value (or all of it, if none is open)
        // is never needed again.
        let keep_from = self.value_start.unwrap_or(self.cursor);
        self.buffer.drain(..keep_from);
        self.cursor -= keep_from;
        if self.value_start.is_some() {
            self.value_start = Some(0);
        }
        emitted
    }

    /// Gives whatever is left in the buffer one last parse attempt.
    ///
    /// A truncated trailing fragment is expected under some framings and is
    /// dropped rather than reported.
    pub fn finish(self) -> Vec<Value> {
        let remainder = self.buffer.trim_ascii();
        let mut emitted = Vec::new();
        if !remainder.is_empty() {
            emit(remainder, &mut emitted);
        }
        emitted
    }

    /// Bytes received but not yet consumed by a completed value.
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Scans forward from the cursor. Returns the index of the closing byte of
    /// the next complete top-level value, if the buffer holds one.
    fn scan(&mut self) -> Option<usize> {
        while let Some(&byte) = self.buffer.get(self.cursor) {
            let index = self.cursor;
            self.cursor += 1;

            if self.escape_next {
                self.escape_next = false;
                continue;
            }

            if self.in_string {
                match byte {
                    b'\\' => self.escape_next = true,
                    b'"' => self.in_string = false,
                    _ => {}
                }
                continue;
            }

            if self.value_start.is_none() {
                match byte {
                    b'"' => self.in_string = true,
                    b'{' => {
                        self.brace_depth = 1;
                        self.value_start = Some(index);
                    }
                    b'[' => {
                        self.bracket_depth = 1;
                        self.value_start = Some(index);
                    }
                    _ => {}
                }
                continue;
            }

            match byte {
                b'"' => self.in_string = true,
                b'{' => self.brace_depth += 1,
                b'[' => self.bracket_depth += 1,
                b'}' | b']' => {
                    let depth = if byte == b'}' {
                        &mut self.brace_depth
                    } else {
                        &mut self.bracket_depth
                    };
                    *depth = depth.saturating_sub(1);
                    if self.brace_depth == 0 && self.bracket_depth == 0 {
                        return Some(index);
                    }
                }
                _ => {}
            }
        }
        None
    }
}

fn emit(span: &[u8], out: &mut Vec<Value>) {
    match serde_json::from_slice::<Value>(span) {
        Ok(Value::Object(object)) => out.push(Value::Object(object)),
        Ok(Value::Array(items)) => out.extend(items.into_iter().filter(Value::is_object)),
        Ok(_) => trace!(len = span.len(), "ignoring non-object value in stream"),
        Err(err) => trace!(len = span.len(), %err, "skipping malformed stream fragment"),
    }
}

/// Lazily decodes `body` into JSON values as the consumer pulls.
///
/// Each read must complete within `timeout`. Read failures and stalled reads
/// end the stream with the classified error.
pub fn decode_json_stream(
    body: ByteStream,
    timeout: Duration,
) -> BoxStream<'static, Result<Value, ErrorKind>> {
    Box::pin(try_stream! {
        let mut body = body;
        let mut decoder = JsonStreamDecoder::new();

        loop {
            let next = tokio::time::timeout(timeout, body.next())
                .await
                .map_err(|_elapsed| ErrorKind::Timeout { duration: timeout })?;
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|failure| classify_transport_failure(&failure, timeout))?;
            for value in decoder.feed(&chunk) {
                yield value;
            }
        }

        for value in decoder.finish() {
            yield value;
        }
    })
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn frames() -> impl Strategy<Value = Vec<Value>> {
        proptest::collection::vec(
            (r#"[a-z{}\[\]"\\ :,é😀]{0,16}"#, any::<i32>(), any::<bool>()),
            1..8,
        )
        .prop_map(|items| {
            items
                .into_iter()
                .map(|(text, n, flag)| {
                    json!({"text": text, "n": n, "nested": {"flag": flag, "list": [text, n]}})
                })
                .collect()
        })
    }

    fn decode_split(bytes: &[u8], cuts: &[usize]) -> Vec<Value> {
        let mut decoder = JsonStreamDecoder::new();
        let mut values = Vec::new();
        let mut previous = 0;
        for &cut in cuts {
            values.extend(decoder.feed(&bytes[previous..cut]));
            previous = cut;
        }
        values.extend(decoder.feed(&bytes[previous..]));
        values.extend(decoder.finish());
        values
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_output(
            objects in frames(),
            offsets in proptest::collection::vec(any::<prop::sample::Index>(), 0..12),
        ) {
            let serialized = serde_json::to_vec(&Value::Array(objects.clone())).unwrap();

            let whole = decode_split(&serialized, &[]);

            let every_byte: Vec<usize> = (1..serialized.len()).collect();
            let byte_at_a_time = decode_split(&serialized, &every_byte);

            let mut cuts: Vec<usize> = offsets.iter().map(|i| i.index(serialized.len())).collect();
            cuts.sort_unstable();
            let random = decode_split(&serialized, &cuts);

            prop_assert_eq!(&whole, &objects);
            prop_assert_eq!(&byte_at_a_time, &objects);
            prop_assert_eq!(&random, &objects);
        }

        #[test]
        fn concatenated_objects_survive_any_split(
            objects in frames(),
            offsets in proptest::collection::vec(any::<prop::sample::Index>(), 0..12),
        ) {
            let mut serialized = Vec::new();
            for object in &objects {
                serialized.extend(serde_json::to_vec(object).unwrap());
                serialized.extend_from_slice(b"\r\n");
            }

            let mut cuts: Vec<usize> = offsets.iter().map(|i| i.index(serialized.len())).collect();
            cuts.sort_unstable();

            prop_assert_eq!(decode_split(&serialized, &cuts), objects);
        }
    }
}
