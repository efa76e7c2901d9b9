//! Newline-delimited JSON-RPC over a byte stream
//!
//! One frame per line. Reads are chunked, so a frame may arrive in pieces;
//! [`LineFramer`] holds the incomplete tail until its newline shows up.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::{
    errors::AppError,
    mcp::rpc::{encode_response, ProtocolResponse},
    router::{RequestContext, RequestRouter},
};

const READ_CHUNK: usize = 8 * 1024;

/// Longest accepted frame, terminator excluded.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Line(String),
    /// Undecodable or oversized input, answered with a parse error.
    Rejected(String),
}

#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_frame_bytes: usize,
    /// Set while skipping the rest of an oversized frame.
    discarding: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::with_max_frame(MAX_FRAME_BYTES)
    }
}

impl LineFramer {
    pub fn with_max_frame(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_bytes,
            discarding: false,
        }
    }

    /// Appends a chunk and drains every completed frame, without terminators.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(position) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=position).collect();
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            frames.push(self.decode(line));
        }

        if self.buffer.len() > self.max_frame_bytes {
            self.buffer.clear();
            if !self.discarding {
                self.discarding = true;
                frames.push(self.oversized());
            }
        }
        frames
    }

    /// Remaining unterminated input once the stream has ended.
    pub fn finish(&mut self) -> Option<Frame> {
        let rest = std::mem::take(&mut self.buffer);
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        match self.decode(rest) {
            Frame::Line(text) => {
                let text = text.trim();
                (!text.is_empty()).then(|| Frame::Line(text.to_string()))
            }
            rejected => Some(rejected),
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn decode(&self, line: Vec<u8>) -> Frame {
        if line.len() > self.max_frame_bytes {
            return self.oversized();
        }
        String::from_utf8(line)
            .map(Frame::Line)
            .unwrap_or_else(|_| Frame::Rejected("frame is not valid UTF-8".to_string()))
    }

    fn oversized(&self) -> Frame {
        Frame::Rejected(format!("frame exceeds {} bytes", self.max_frame_bytes))
    }
}

pub async fn serve_lines<R, W>(
    router: &RequestRouter,
    context: RequestContext,
    mut reader: R,
    mut writer: W,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut framer = LineFramer::default();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        for frame in framer.push(&chunk[..read]) {
            answer(router, &context, frame, &mut writer).await?;
        }
        if framer.pending() > 0 {
            debug!(buffered = framer.pending(), "holding partial frame");
        }
    }

    if let Some(frame) = framer.finish() {
        answer(router, &context, frame, &mut writer).await?;
    }
    writer.flush().await?;
    info!(transport = context.transport.as_str(), "input stream closed");
    Ok(())
}

async fn answer<W>(
    router: &RequestRouter,
    context: &RequestContext,
    frame: Frame,
    writer: &mut W,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let output = match frame {
        Frame::Line(line) => router.handle_line(context, &line).await,
        Frame::Rejected(message) => {
            warn!(transport = context.transport.as_str(), reason = %message, "rejected frame");
            Some(encode_response(&ProtocolResponse::failure(
                None,
                &AppError::Parse { message },
            )))
        }
    };
    if let Some(output) = output {
        writer.write_all(output.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

pub async fn serve_stdio(router: &RequestRouter) -> io::Result<()> {
    info!("serving MCP over stdio");
    serve_lines(
        router,
        RequestContext::stdio(),
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};

    use super::*;
    use crate::{
        auth::AuthMiddleware, cache::CacheManager, mcp::server::ProtocolHandler,
        query::tests::MockExecutor, rate_limit::RateLimitMiddleware, AppState,
    };

    fn router() -> RequestRouter {
        RequestRouter::new(
            ProtocolHandler::new(AppState::new(
                Arc::new(MockExecutor::with_rows(1)),
                Arc::new(CacheManager::default()),
                Some("1".to_string()),
            )),
            AuthMiddleware::default(),
            RateLimitMiddleware::disabled(),
        )
    }

    fn frames(output: &[u8]) -> Vec<Value> {
        String::from_utf8_lossy(output)
            .lines()
            .map(|line| serde_json::from_str(line).expect("json frame"))
            .collect()
    }

    fn line(text: &str) -> Frame {
        Frame::Line(text.to_string())
    }

    #[test]
    fn framer_holds_partial_lines() {
        let mut framer = LineFramer::default();
        assert!(framer.push(b"{\"a\":").is_empty());
        assert_eq!(framer.pending(), 5);
        assert_eq!(framer.push(b"1}\r\n{\"b\""), vec![line("{\"a\":1}")]);
        assert_eq!(framer.push(b":2}\n\n"), vec![line("{\"b\":2}"), line("")]);
        assert_eq!(framer.finish(), None);

        framer.push(b"tail");
        assert_eq!(framer.finish(), Some(line("tail")));
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn framer_rejects_invalid_utf8() {
        let mut framer = LineFramer::default();
        let frames = framer.push(b"{\"a\":\"\xff\xfe\"}\nnext\n");
        assert_eq!(
            frames,
            vec![
                Frame::Rejected("frame is not valid UTF-8".to_string()),
                line("next"),
            ]
        );
    }

    #[test]
    fn framer_drops_oversized_frames_once() {
        let mut framer = LineFramer::with_max_frame(8);
        assert!(framer.push(b"12345").is_empty());
        assert_eq!(
            framer.push(b"6789abc"),
            vec![Frame::Rejected("frame exceeds 8 bytes".to_string())]
        );
        assert_eq!(framer.pending(), 0);
        assert!(framer.push(b"defghij").is_empty());
        assert_eq!(framer.push(b"klm\nok\n"), vec![line("ok")]);

        assert_eq!(
            framer.push(b"0123456789\n"),
            vec![Frame::Rejected("frame exceeds 8 bytes".to_string())]
        );
    }

    #[tokio::test]
    async fn serves_a_session_over_a_byte_stream() {
        let router = router();
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05","capabilities":{},"clientInfo":{"name":"t","version":"1"}}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n",
            "{not json\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
        );
        let mut output = Vec::new();

        serve_lines(&router, RequestContext::stdio(), input.as_bytes(), &mut output)
            .await
            .expect("session");

        let frames = frames(&output);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0]["id"], json!(1));
        assert_eq!(frames[1]["error"]["code"], json!(-32700));
        assert_eq!(frames[1]["id"], Value::Null);
        assert_eq!(frames[2]["result"]["tools"][0]["name"], json!("nrql_query"));
    }

    #[tokio::test]
    async fn invalid_utf8_is_answered_with_parse_error() {
        let router = router();
        let mut input = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"\xffping\"}\n".to_vec();
        input.extend_from_slice(br#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#);
        let mut output = Vec::new();

        serve_lines(&router, RequestContext::stdio(), input.as_slice(), &mut output)
            .await
            .expect("session");

        let frames = frames(&output);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["id"], Value::Null);
        assert_eq!(frames[0]["error"]["code"], json!(-32700));
        assert_eq!(frames[1]["id"], json!(2));
    }

    #[tokio::test]
    async fn frames_split_across_reads_are_reassembled() {
        let router = router();
        let (mut client, server) = tokio::io::duplex(16);
        let mut output = Vec::new();

        let writer = tokio::spawn(async move {
            let frame = br#"{"jsonrpc":"2.0","id":"abc","method":"ping"}"#;
            for piece in frame.chunks(7) {
                client.write_all(piece).await.expect("write piece");
            }
            client.write_all(b"\n").await.expect("newline");
        });

        serve_lines(&router, RequestContext::stdio(), server, &mut output)
            .await
            .expect("session");
        writer.await.expect("writer task");

        let frames = frames(&output);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["id"], json!("abc"));
        assert_eq!(frames[0]["error"]["code"], json!(-32003));
    }
}
