//! SSE event splitter.
//!
//! Turns a byte stream into one string per SSE event (the text between blank
//! lines). Events are handed on raw, `data:` prefixes included: stripping the
//! transport prefix is the frame decoder's job, so bare-text transports and
//! SSE share one decode path.

use futures::stream::{self, Stream, StreamExt};

use super::errors::BackendError;

/// Split a byte stream into raw SSE events.
///
/// Incomplete events are buffered across chunk boundaries, and so are
/// multi-byte characters cut by a chunk boundary. Bytes that are not valid
/// UTF-8 are replaced rather than failing the stream. When the byte stream
/// ends, any non-blank remainder is emitted as a final event.
pub fn split_sse_events<S, B, E>(byte_stream: S) -> impl Stream<Item = Result<String, BackendError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    stream::unfold(
        (byte_stream, Vec::new(), String::new(), false),
        |(mut byte_stream, mut pending, mut buffer, mut finished)| async move {
            loop {
                if let Some(event_end) = buffer.find("\n\n") {
                    let event = buffer[..event_end].to_string();
                    buffer.drain(..event_end + 2);
                    if event.trim().is_empty() {
                        continue;
                    }
                    return Some((Ok(event), (byte_stream, pending, buffer, finished)));
                }

                if finished {
                    return None;
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => {
                        pending.extend_from_slice(bytes.as_ref());
                        drain_utf8(&mut pending, &mut buffer);
                        // A CR/LF pair may straddle chunks, so normalise the
                        // whole buffer rather than the new text.
                        if buffer.contains("\r\n") {
                            buffer = buffer.replace("\r\n", "\n");
                        }
                    }
                    Some(Err(e)) => {
                        finished = true;
                        return Some((
                            Err(BackendError::StreamError {
                                reason: format!("stream read error: {e}"),
                            }),
                            (byte_stream, pending, buffer, finished),
                        ));
                    }
                    None => {
                        finished = true;
                        let mut rest = std::mem::take(&mut buffer);
                        rest.push_str(&String::from_utf8_lossy(&pending));
                        pending.clear();
                        if !rest.trim().is_empty() {
                            return Some((Ok(rest), (byte_stream, pending, buffer, finished)));
                        }
                        return None;
                    }
                }
            }
        },
    )
}

/// Move the decodable prefix of `pending` into `out`. A truncated trailing
/// sequence stays in `pending` for the next chunk; invalid bytes become
/// U+FFFD.
fn drain_utf8(pending: &mut Vec<u8>, out: &mut String) {
    loop {
        let (valid, invalid_len) = match std::str::from_utf8(pending) {
            Ok(_) => (pending.len(), None),
            Err(e) => (e.valid_up_to(), e.error_len()),
        };
        out.push_str(&String::from_utf8_lossy(&pending[..valid]));
        match invalid_len {
            Some(len) => {
                out.push(char::REPLACEMENT_CHARACTER);
                pending.drain(..valid + len);
            }
            None => {
                pending.drain(..valid);
                return;
            }
        }
    }
}
