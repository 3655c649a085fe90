use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::dap::messages::{Event, Request, Response};
use crate::error::{DebugError, DebugResult};

pub struct DapReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> DapReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
        }
    }

    /// Read one framed JSON message. Returns `None` on a clean EOF.
    pub async fn read_value(&mut self) -> DebugResult<Option<Value>> {
        let mut line = String::new();
        let mut content_length = None;

        // Header block: `Name: value` lines, closed by an empty line. Only
        // Content-Length matters; anything else is tolerated and skipped.
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            match line.trim_end() {
                "" => break,
                header => {
                    if let Some(len) = parse_content_length(header)? {
                        content_length = Some(len);
                    }
                }
            }
        }

        let len = content_length.ok_or_else(|| {
            DebugError::Protocol("missing Content-Length header".to_string())
        })?;

        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload).await?;
        Ok(Some(serde_json::from_slice(&payload)?))
    }

    pub async fn read_request(&mut self) -> DebugResult<Option<Request>> {
        let Some(value) = self.read_value().await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value::<Request>(value)?))
    }
}

/// `Some(len)` for a Content-Length header (any case), `None` for other
/// headers, an error for an unparseable length.
fn parse_content_length(header: &str) -> DebugResult<Option<usize>> {
    let Some((name, value)) = header.split_once(':') else {
        return Ok(None);
    };
    if !name.trim().eq_ignore_ascii_case("Content-Length") {
        return Ok(None);
    }
    let value = value.trim();
    value.parse().map(Some).map_err(|err| {
        DebugError::Protocol(format!("invalid Content-Length {value:?}: {err}"))
    })
}

pub struct DapWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> DapWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_value(&mut self, value: &Value) -> DebugResult<()> {
        let payload = serde_json::to_vec(value)?;
        // One buffer, one write: keeps the frame contiguous on the wire.
        let mut frame = format!("Content-Length: {}\r\n\r\n", payload.len()).into_bytes();
        frame.extend_from_slice(&payload);
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn write_request(&mut self, request: &Request) -> DebugResult<()> {
        let value = serde_json::to_value(request)?;
        self.write_value(&value).await
    }

    pub async fn write_response(&mut self, response: &Response) -> DebugResult<()> {
        let value = serde_json::to_value(response)?;
        self.write_value(&value).await
    }

    pub async fn write_event(&mut self, event: &Event) -> DebugResult<()> {
        let value = serde_json::to_value(event)?;
        self.write_value(&value).await
    }

    /// Flush and send EOF on the underlying stream. For a TCP write half
    /// this is the client-visible "session over" signal.
    pub async fn shutdown(&mut self) -> DebugResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn round_trips_a_framed_request() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_rx, _server_tx) = tokio::io::split(server);
        let (_client_rx, client_tx) = tokio::io::split(client);

        let mut writer = DapWriter::new(client_tx);
        writer
            .write_request(&Request::new(7, "initialize", json!({"adapterID": "kiln"})))
            .await
            .unwrap();

        let mut reader = DapReader::new(server_rx);
        let request = reader.read_request().await.unwrap().unwrap();
        assert_eq!(request.seq, 7);
        assert_eq!(request.command, "initialize");
        assert_eq!(request.arguments["adapterID"], "kiln");
    }

    #[tokio::test]
    async fn missing_content_length_is_a_protocol_error() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_rx, _server_tx) = tokio::io::split(server);
        let (_client_rx, mut client_tx) = tokio::io::split(client);

        tokio::io::AsyncWriteExt::write_all(&mut client_tx, b"Content-Type: json\r\n\r\n")
            .await
            .unwrap();

        let mut reader = DapReader::new(server_rx);
        let err = reader.read_value().await.unwrap_err();
        assert!(matches!(err, DebugError::Protocol(_)));
    }

    #[tokio::test]
    async fn extra_headers_and_lowercase_names_are_tolerated() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_rx, _server_tx) = tokio::io::split(server);
        let (_client_rx, mut client_tx) = tokio::io::split(client);

        tokio::io::AsyncWriteExt::write_all(
            &mut client_tx,
            b"content-length: 2\r\nContent-Type: application/json\r\n\r\n{}",
        )
        .await
        .unwrap();

        let mut reader = DapReader::new(server_rx);
        let value = reader.read_value().await.unwrap().unwrap();
        assert_eq!(value, json!({}));
    }

    #[tokio::test]
    async fn clean_eof_reads_as_none() {
        let (client, server) = tokio::io::duplex(64);
        let (server_rx, _server_tx) = tokio::io::split(server);
        drop(client);

        let mut reader = DapReader::new(server_rx);
        assert!(reader.read_value().await.unwrap().is_none());
    }
}
