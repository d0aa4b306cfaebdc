//! Content-Length framing for DAP messages over a byte stream.

use crate::protocol::ProtocolMessage;
use crate::{DapError, Result};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{trace, warn};

const CONTENT_LENGTH: &str = "content-length";
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;
const MAX_HEADER_LINE_BYTES: u64 = 8 * 1024;

/// Serialize `message` into one `Content-Length` framed buffer.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    let mut framed = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    framed.extend_from_slice(&body);
    Ok(framed)
}

pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Next decoded message, `Ok(None)` on a clean end of stream.
    ///
    /// Frames whose body is not a recognizable protocol message are logged
    /// and skipped; the stream stays in sync because the length was honoured.
    pub async fn read_next(&mut self) -> Result<Option<ProtocolMessage>> {
        loop {
            let Some(body) = self.read_frame().await? else {
                return Ok(None);
            };
            match serde_json::from_slice::<ProtocolMessage>(&body) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => {
                    warn!(
                        "Dropping undecodable DAP frame ({} bytes): {}",
                        body.len(),
                        e
                    );
                }
            }
        }
    }

    /// Raw body of the next frame.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut content_length: Option<usize> = None;
        let mut saw_header = false;

        loop {
            let mut line = String::new();
            let bytes_read = (&mut self.reader)
                .take(MAX_HEADER_LINE_BYTES)
                .read_line(&mut line)
                .await
                .map_err(|e| DapError::Framing(format!("failed to read header: {e}")))?;
            if bytes_read as u64 == MAX_HEADER_LINE_BYTES && !line.ends_with('\n') {
                return Err(DapError::Framing(format!(
                    "header line exceeds {MAX_HEADER_LINE_BYTES} bytes"
                )));
            }
            if bytes_read == 0 {
                if saw_header {
                    return Err(DapError::Framing(
                        "stream closed while reading DAP headers".to_string(),
                    ));
                }
                return Ok(None);
            }

            let trimmed = line.trim_end_matches(&['\r', '\n'][..]);
            if trimmed.is_empty() {
                if saw_header {
                    break;
                }
                // Tolerate stray blank lines between frames.
                continue;
            }
            saw_header = true;

            if let Some((key, value)) = trimmed.split_once(':') {
                if key.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
                    let parsed = value.trim().parse::<usize>().map_err(|e| {
                        DapError::Framing(format!("invalid Content-Length value: {e}"))
                    })?;
                    content_length = Some(parsed);
                }
            }
        }

        let length = content_length.ok_or_else(|| {
            DapError::Framing("missing required Content-Length header".to_string())
        })?;
        if length > MAX_FRAME_BYTES {
            return Err(DapError::Framing(format!(
                "Content-Length {length} exceeds limit of {MAX_FRAME_BYTES} bytes"
            )));
        }

        let mut body = vec![0_u8; length];
        self.reader.read_exact(&mut body).await.map_err(|e| {
            DapError::Framing(format!(
                "stream closed before {length}-byte body was complete: {e}"
            ))
        })?;
        trace!("Read DAP frame of {} bytes", length);
        Ok(Some(body))
    }
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let framed = encode_frame(message)?;
        self.writer.write_all(&framed).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Event, Request};
    use serde_json::json;

    fn frame(json: &str) -> String {
        format!("Content-Length: {}\r\n\r\n{}", json.len(), json)
    }

    #[tokio::test]
    async fn test_decodes_consecutive_frames() {
        let input = format!(
            "{}{}",
            frame(r#"{"seq":1,"type":"event","event":"initialized"}"#),
            frame(r#"{"seq":2,"type":"response","request_seq":1,"command":"initialize","success":true}"#)
        );
        let mut reader = FrameReader::new(input.as_bytes());

        let first = reader.read_next().await.unwrap().unwrap();
        assert!(matches!(first, ProtocolMessage::Event(ref e) if e.event == "initialized"));
        let second = reader.read_next().await.unwrap().unwrap();
        assert!(matches!(second, ProtocolMessage::Response(ref r) if r.request_seq == 1));
        assert!(reader.read_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_content_length_counts_utf8_bytes() {
        let message = ProtocolMessage::Event(Event {
            seq: 4,
            event: "output".to_string(),
            body: Some(json!({ "output": "héllo → wörld\n" })),
        });
        let framed = encode_frame(&message).unwrap();
        let text = String::from_utf8(framed.clone()).unwrap();
        let (header, body) = text.split_once("\r\n\r\n").unwrap();
        assert_eq!(header, format!("Content-Length: {}", body.len()));
        assert!(body.len() > body.chars().count());

        let mut reader = FrameReader::new(framed.as_slice());
        assert_eq!(reader.read_next().await.unwrap(), Some(message));
    }

    #[tokio::test]
    async fn test_extra_headers_are_ignored() {
        let json = r#"{"seq":1,"type":"request","command":"threads"}"#;
        let input = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\ncontent-length: {}\r\n\r\n{}",
            json.len(),
            json
        );
        let mut reader = FrameReader::new(input.as_bytes());
        let message = reader.read_next().await.unwrap().unwrap();
        assert_eq!(
            message,
            ProtocolMessage::Request(Request {
                seq: 1,
                command: "threads".into(),
                arguments: None
            })
        );
    }

    #[tokio::test]
    async fn test_truncated_body_is_framing_error() {
        let input = "Content-Length: 50\r\n\r\n{\"seq\":1";
        let mut reader = FrameReader::new(input.as_bytes());
        let err = reader.read_next().await.unwrap_err();
        assert!(matches!(err, DapError::Framing(_)), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_stream_closed_mid_header_is_framing_error() {
        let mut reader = FrameReader::new("Content-Length: 12\r\n".as_bytes());
        let err = reader.read_next().await.unwrap_err();
        assert!(err.to_string().contains("while reading DAP headers"), "{err}");
    }

    #[tokio::test]
    async fn test_unterminated_header_line_is_bounded() {
        let input = "X".repeat(MAX_HEADER_LINE_BYTES as usize * 4);
        let mut reader = FrameReader::new(input.as_bytes());
        let err = reader.read_next().await.unwrap_err();
        assert!(err.to_string().contains("header line exceeds"), "{err}");
    }

    #[tokio::test]
    async fn test_missing_content_length_is_framing_error() {
        let mut reader = FrameReader::new("X-Other: 1\r\n\r\n{}".as_bytes());
        let err = reader.read_next().await.unwrap_err();
        assert!(err.to_string().contains("missing required Content-Length"), "{err}");
    }

    #[tokio::test]
    async fn test_undecodable_body_is_skipped() {
        let input = format!(
            "{}{}{}",
            frame("not json at all"),
            frame(r#"{"seq":1,"type":"telemetry"}"#),
            frame(r#"{"seq":2,"type":"event","event":"terminated"}"#)
        );
        let mut reader = FrameReader::new(input.as_bytes());
        let message = reader.read_next().await.unwrap().unwrap();
        assert!(matches!(message, ProtocolMessage::Event(ref e) if e.event == "terminated"));
    }

    #[tokio::test]
    async fn test_writer_round_trips_through_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let request = ProtocolMessage::Request(Request {
            seq: 7,
            command: "continue".into(),
            arguments: Some(json!({ "threadId": 1 })),
        });
        writer.write(&request).await.unwrap();
        drop(writer);

        let mut reader = FrameReader::new(server);
        assert_eq!(reader.read_next().await.unwrap(), Some(request));
        assert!(reader.read_next().await.unwrap().is_none());
    }
}
