use memchr::memchr;
use tokio::io::{AsyncRead, AsyncReadExt};

const DEFAULT_BUFFER_SIZE: usize = 32768;

/// Reassembles discrete NATS protocol commands from an unstructured byte
/// stream.
///
/// A command is either a single CRLF-terminated control line, or - for the
/// payload-bearing verbs `MSG` and `HMSG` - the control line followed by the
/// declared number of payload bytes and the trailing CRLF, returned as one
/// unit. The reader holds no stream of its own; callers pass the session's
/// current stream to every call, so a session swaps transports (e.g. for a
/// TLS upgrade) by dropping the reader together with the old stream.
pub struct CommandReader {
    buf: Box<[u8]>,
    start_offset: usize,
    end_offset: usize,
}

impl CommandReader {
    pub fn new() -> Self {
        Self::new_with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    pub fn new_with_buffer_size(buffer_size: usize) -> Self {
        // note that `buffer_size` also bounds the control line length.
        Self {
            buf: vec![0u8; buffer_size].into_boxed_slice(),
            start_offset: 0usize,
            end_offset: 0usize,
        }
    }

    /// Reads the next complete command, however the underlying transport
    /// chunks it. `Ok(None)` is a bare delimiter line (keepalive artifact)
    /// that callers skip without treating as an error.
    pub async fn next_command<T: AsyncRead + Unpin>(
        &mut self,
        stream: &mut T,
    ) -> std::io::Result<Option<Vec<u8>>> {
        let line_end = loop {
            match memchr(b'\n', &self.buf[self.start_offset..self.end_offset]) {
                Some(pos) => break self.start_offset + pos + 1,
                None => self.fill(stream).await?,
            }
        };

        let mut cmd = self.buf[self.start_offset..line_end].to_vec();
        self.consume_to(line_end);

        let line = strip_delimiter(&cmd);
        if line.is_empty() {
            return Ok(None);
        }

        if let Some(payload_len) = declared_payload_length(line)? {
            // payload plus its trailing CRLF
            self.read_payload(stream, &mut cmd, payload_len + 2).await?;
        }

        Ok(Some(cmd))
    }

    async fn read_payload<T: AsyncRead + Unpin>(
        &mut self,
        stream: &mut T,
        cmd: &mut Vec<u8>,
        mut remaining: usize,
    ) -> std::io::Result<()> {
        let buffered = self.end_offset - self.start_offset;
        let take = std::cmp::min(buffered, remaining);
        if take > 0 {
            cmd.extend_from_slice(&self.buf[self.start_offset..self.start_offset + take]);
            self.consume_to(self.start_offset + take);
            remaining -= take;
        }
        if remaining > 0 {
            let filled = cmd.len();
            cmd.resize(filled + remaining, 0u8);
            stream.read_exact(&mut cmd[filled..]).await.map_err(|e| {
                std::io::Error::new(e.kind(), format!("stream closed mid-command: {}", e))
            })?;
        }
        Ok(())
    }

    fn consume_to(&mut self, new_start_offset: usize) {
        if new_start_offset == self.end_offset {
            self.start_offset = 0;
            self.end_offset = 0;
        } else {
            self.start_offset = new_start_offset;
        }
    }

    fn reset_buf_offset(&mut self) {
        if self.start_offset == 0 {
            return;
        }
        self.buf.copy_within(self.start_offset..self.end_offset, 0);
        self.end_offset -= self.start_offset;
        self.start_offset = 0;
    }

    async fn fill<T: AsyncRead + Unpin>(&mut self, stream: &mut T) -> std::io::Result<()> {
        if self.start_offset == 0 && self.end_offset == self.buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "command line exceeds buffer size",
            ));
        }

        // Compact so there's space for the rest of the line.
        self.reset_buf_offset();

        let len = stream.read(&mut self.buf[self.end_offset..]).await?;
        if len == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "EOF while reading command",
            ));
        }
        self.end_offset += len;
        Ok(())
    }
}

fn strip_delimiter(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Payload byte count declared by a control line, or `None` for control-only
/// verbs. For `MSG` the last field is the payload size; for `HMSG` it is the
/// total size, which is also exactly the byte count following the line.
fn declared_payload_length(line: &[u8]) -> std::io::Result<Option<usize>> {
    let mut fields = line
        .split(|b: &u8| b.is_ascii_whitespace())
        .filter(|f| !f.is_empty());
    let verb = match fields.next() {
        Some(verb) => verb,
        None => return Ok(None),
    };
    if !verb.eq_ignore_ascii_case(b"MSG") && !verb.eq_ignore_ascii_case(b"HMSG") {
        return Ok(None);
    }
    let size = fields
        .last()
        .and_then(|f| std::str::from_utf8(f).ok())
        .and_then(|s| s.parse::<usize>().ok())
        // leave room for the trailing CRLF
        .filter(|n| n.checked_add(2).is_some())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "malformed payload length in: {}",
                    String::from_utf8_lossy(line)
                ),
            )
        })?;
    Ok(Some(size))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::ReadBuf;

    use super::*;

    /// Delivers a scripted sequence of chunks, then EOF.
    struct ChunkedStream {
        chunks: VecDeque<Vec<u8>>,
    }

    impl ChunkedStream {
        fn new(chunks: &[&[u8]]) -> Self {
            Self {
                chunks: chunks.iter().map(|c| c.to_vec()).collect(),
            }
        }
    }

    impl AsyncRead for ChunkedStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if let Some(mut chunk) = self.chunks.pop_front() {
                let n = std::cmp::min(chunk.len(), buf.remaining());
                buf.put_slice(&chunk[..n]);
                if n < chunk.len() {
                    let rest = chunk.split_off(n);
                    self.chunks.push_front(rest);
                }
            }
            Poll::Ready(Ok(()))
        }
    }

    async fn read_until_eof(stream: &mut ChunkedStream) -> Vec<Vec<u8>> {
        let mut reader = CommandReader::new();
        let mut cmds = vec![];
        loop {
            match reader.next_command(stream).await {
                Ok(Some(cmd)) => cmds.push(cmd),
                Ok(None) => continue,
                Err(e) => {
                    assert_eq!(e.kind(), std::io::ErrorKind::ConnectionAborted);
                    break;
                }
            }
        }
        cmds
    }

    #[tokio::test]
    async fn commands_delivered_one_shot() {
        let mut stream = ChunkedStream::new(&[b"INFO {}\r\nPING\r\nMSG foo 1 5\r\nhello\r\n+OK\r\n"]);
        let cmds = read_until_eof(&mut stream).await;
        assert_eq!(
            cmds,
            vec![
                b"INFO {}\r\n".to_vec(),
                b"PING\r\n".to_vec(),
                b"MSG foo 1 5\r\nhello\r\n".to_vec(),
                b"+OK\r\n".to_vec(),
            ]
        );
    }

    #[tokio::test]
    async fn commands_split_mid_delimiter() {
        let mut stream = ChunkedStream::new(&[b"INFO {\"x\"", b":1}\r\nPI", b"NG\r\n"]);
        let cmds = read_until_eof(&mut stream).await;
        assert_eq!(
            cmds,
            vec![b"INFO {\"x\":1}\r\n".to_vec(), b"PING\r\n".to_vec()]
        );
    }

    #[tokio::test]
    async fn commands_delivered_one_byte_at_a_time() {
        let bytes: &[u8] = b"INFO {}\r\nMSG sub 1 5\r\nhello\r\nPING\r\n";
        let chunks: Vec<&[u8]> = bytes.chunks(1).collect();
        let mut stream = ChunkedStream::new(&chunks);
        let cmds = read_until_eof(&mut stream).await;
        assert_eq!(
            cmds,
            vec![
                b"INFO {}\r\n".to_vec(),
                b"MSG sub 1 5\r\nhello\r\n".to_vec(),
                b"PING\r\n".to_vec(),
            ]
        );
    }

    #[tokio::test]
    async fn payload_with_embedded_delimiter_stays_one_command() {
        let mut stream = ChunkedStream::new(&[b"MSG s 1 5\r\nhe\r\no\r\nPONG\r\n"]);
        let cmds = read_until_eof(&mut stream).await;
        assert_eq!(
            cmds,
            vec![b"MSG s 1 5\r\nhe\r\no\r\n".to_vec(), b"PONG\r\n".to_vec()]
        );
    }

    #[tokio::test]
    async fn hmsg_honors_total_size() {
        let mut stream =
            ChunkedStream::new(&[b"HMSG s 1 12 17\r\nNATS/1.0\r\n\r\nhello\r\nPING\r\n"]);
        let cmds = read_until_eof(&mut stream).await;
        assert_eq!(
            cmds,
            vec![
                b"HMSG s 1 12 17\r\nNATS/1.0\r\n\r\nhello\r\n".to_vec(),
                b"PING\r\n".to_vec(),
            ]
        );
    }

    #[tokio::test]
    async fn lowercase_verb_still_carries_payload() {
        let mut stream = ChunkedStream::new(&[b"msg a 1 2\r\nhi\r\n"]);
        let cmds = read_until_eof(&mut stream).await;
        assert_eq!(cmds, vec![b"msg a 1 2\r\nhi\r\n".to_vec()]);
    }

    #[tokio::test]
    async fn bare_delimiter_yields_none() {
        let mut stream = ChunkedStream::new(&[b"\r\nPING\r\n"]);
        let mut reader = CommandReader::new();
        assert_eq!(reader.next_command(&mut stream).await.unwrap(), None);
        assert_eq!(
            reader.next_command(&mut stream).await.unwrap(),
            Some(b"PING\r\n".to_vec())
        );
    }

    #[tokio::test]
    async fn malformed_payload_length_is_an_error() {
        let mut stream = ChunkedStream::new(&[b"MSG a 1 five\r\n"]);
        let mut reader = CommandReader::new();
        let err = reader.next_command(&mut stream).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn eof_mid_payload_is_an_error() {
        let mut stream = ChunkedStream::new(&[b"MSG a 1 10\r\nabc"]);
        let mut reader = CommandReader::new();
        let err = reader.next_command(&mut stream).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn eof_mid_line_is_an_error() {
        let mut stream = ChunkedStream::new(&[b"PIN"]);
        let mut reader = CommandReader::new();
        let err = reader.next_command(&mut stream).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn line_exceeding_buffer_is_an_error() {
        let mut stream = ChunkedStream::new(&[b"0123456789ABCDEF\r\n"]);
        let mut reader = CommandReader::new_with_buffer_size(8);
        let err = reader.next_command(&mut stream).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn payload_split_across_reads() {
        let mut stream = ChunkedStream::new(&[b"MSG foo 1 5", b"\r\nhel", b"lo", b"\r\n"]);
        let cmds = read_until_eof(&mut stream).await;
        assert_eq!(cmds, vec![b"MSG foo 1 5\r\nhello\r\n".to_vec()]);
    }
}
