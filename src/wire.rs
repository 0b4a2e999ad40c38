//! Wire protocol shared by the server and the client driver
//!
//! One session is a fixed sequence of messages on a single stream:
//!
//! 1. extension token (client → server)
//! 2. menu text (server → client)
//! 3. option token (client → server)
//! 4. file size, 8-byte little-endian (client → server)
//! 5. file payload, exactly `size` bytes (client → server)
//! 6. result extension token, or a notice (server → client)
//! 7. result size and payload (server → client, only after a result token)
//!
//! Tokens and text messages are terminated by a NUL byte or by the end of the
//! stream, and are bounded in length. A reply that is a well-formed extension
//! is a result; anything else is a human-readable notice.

use std::{future::Future, path::Path, time::Duration};

use tokio::{
    fs::File,
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};

use crate::error::{RelayError, Result, TransferError, TransportError, ProtocolError};

/// Maximum length of extension and option tokens
pub const MAX_TOKEN_LEN: usize = 64;

/// Maximum length of menu and notice messages
pub const MAX_TEXT_LEN: usize = 4096;

/// Maximum length of a well-formed extension
pub const MAX_EXTENSION_LEN: usize = 16;

/// Chunk size for payload transfer
pub const TRANSFER_CHUNK_SIZE: usize = 64 * 1024;

/// Menu text for extensions with no conversions
pub const NOTICE_UNSUPPORTED: &str = "Unsupported file extension.\n";

/// Sent when the option token is not usable
pub const NOTICE_INVALID_OPTION: &str = "Invalid conversion option.\n";

/// Sent when the upload ended before its declared size
pub const NOTICE_INCOMPLETE_UPLOAD: &str = "Incomplete upload.\n";

/// Sent when the declared size exceeds the server limit
pub const NOTICE_TOO_LARGE: &str = "File too large.\n";

/// Sent when the conversion engine fails
pub const NOTICE_CONVERSION_FAILED: &str = "Conversion failed.\n";

/// What the server sent back after the upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A converted file with this extension follows
    Result { extension: String },
    /// No file follows
    Notice(String),
}

impl Reply {
    /// Classify a reply token
    pub fn classify(token: String) -> Self {
        if is_extension_token(&token) {
            Reply::Result { extension: token }
        } else {
            Reply::Notice(token)
        }
    }
}

/// Whether `token` is a bare extension (1..=16 ASCII alphanumerics)
pub fn is_extension_token(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= MAX_EXTENSION_LEN
        && token.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Canonical form of an announced extension, or `None` if it cannot be one
pub fn normalize_extension(token: &str) -> Option<String> {
    let token = token.trim().trim_start_matches('.').to_ascii_lowercase();
    is_extension_token(&token).then_some(token)
}

/// Run a wire operation under an optional idle limit
pub async fn within<T, F>(limit: Option<Duration>, operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        None => fut.await,
        Some(duration) => match timeout(duration, fut).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout { operation, duration }.into()),
        },
    }
}

/// Read one NUL- or EOF-terminated token of at most `max_len` bytes
pub async fn read_token<R>(reader: &mut R, max_len: usize, expected: &'static str) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take(max_len as u64 + 1)
        .read_until(0, &mut buf)
        .await
        .map_err(|source| TransportError::Io { operation: expected, source })?;

    if read == 0 {
        return Err(TransportError::Closed { expected }.into());
    }

    if buf.last() == Some(&0) {
        buf.pop();
    } else if buf.len() > max_len {
        return Err(ProtocolError::TokenTooLong { max: max_len }.into());
    }

    String::from_utf8(buf).map_err(|_| ProtocolError::NotText.into())
}

/// Write one NUL-terminated token
pub async fn write_token<W>(writer: &mut W, token: &str, operation: &'static str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug_assert!(!token.as_bytes().contains(&0));

    let mut frame = Vec::with_capacity(token.len() + 1);
    frame.extend_from_slice(token.as_bytes());
    frame.push(0);

    writer
        .write_all(&frame)
        .await
        .map_err(|source| TransportError::Io { operation, source })?;
    writer
        .flush()
        .await
        .map_err(|source| TransportError::Io { operation, source })?;
    Ok(())
}

/// Read the fixed-width size field
pub async fn read_size<R>(reader: &mut R, expected: &'static str) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    reader.read_u64_le().await.map_err(|source| {
        if source.kind() == std::io::ErrorKind::UnexpectedEof {
            TransportError::Closed { expected }.into()
        } else {
            RelayError::from(TransportError::Io { operation: expected, source })
        }
    })
}

/// Write the fixed-width size field
pub async fn write_size<W>(writer: &mut W, size: u64) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_u64_le(size)
        .await
        .map_err(|source| TransportError::Io { operation: "file size", source })?;
    Ok(())
}

/// Copy exactly `expected` payload bytes from `reader` into `sink`.
///
/// Returns the number of bytes received. An early end of stream is a
/// transfer integrity error carrying the count that did arrive.
pub async fn receive_payload<R, W>(
    reader: &mut R,
    sink: &mut W,
    expected: u64,
    idle: Option<Duration>,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; TRANSFER_CHUNK_SIZE];
    let mut received = 0u64;

    while received < expected {
        let want = (expected - received).min(buffer.len() as u64) as usize;
        let read = within(idle, "file payload", async {
            reader
                .read(&mut buffer[..want])
                .await
                .map_err(|source| RelayError::from(TransportError::Io { operation: "file payload", source }))
        })
        .await?;

        if read == 0 {
            return Err(TransferError::Incomplete { received, expected }.into());
        }

        sink.write_all(&buffer[..read]).await?;
        received += read as u64;
    }

    sink.flush().await?;
    Ok(received)
}

/// Send the size field followed by the contents of `path`.
///
/// Returns the number of payload bytes written.
pub async fn send_file<W>(writer: &mut W, path: &Path, idle: Option<Duration>) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut file = File::open(path).await?;
    let size = file.metadata().await?.len();

    within(idle, "file size", write_size(writer, size)).await?;

    let mut buffer = vec![0u8; TRANSFER_CHUNK_SIZE];
    let mut sent = 0u64;

    while sent < size {
        let want = (size - sent).min(buffer.len() as u64) as usize;
        let read = file.read(&mut buffer[..want]).await?;
        if read == 0 {
            // file shrank underneath us
            return Err(TransferError::Incomplete { received: sent, expected: size }.into());
        }

        within(idle, "file payload", async {
            writer
                .write_all(&buffer[..read])
                .await
                .map_err(|source| RelayError::from(TransportError::Io { operation: "file payload", source }))
        })
        .await?;
        sent += read as u64;
    }

    writer
        .flush()
        .await
        .map_err(|source| TransportError::Io { operation: "file payload", source })?;
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_read_nul_terminated_token() {
        let mock = Builder::new().read(b"jpeg\0").build();
        let mut reader = BufReader::new(mock);

        let token = read_token(&mut reader, MAX_TOKEN_LEN, "extension").await.unwrap();
        assert_eq!(token, "jpeg");
    }

    #[tokio::test]
    async fn test_token_split_across_reads() {
        let mock = Builder::new().read(b"jp").read(b"eg\0").build();
        let mut reader = BufReader::new(mock);

        let token = read_token(&mut reader, MAX_TOKEN_LEN, "extension").await.unwrap();
        assert_eq!(token, "jpeg");
    }

    #[tokio::test]
    async fn test_token_terminated_by_end_of_stream() {
        let mock = Builder::new().read(b"png").build();
        let mut reader = BufReader::new(mock);

        let token = read_token(&mut reader, MAX_TOKEN_LEN, "extension").await.unwrap();
        assert_eq!(token, "png");
    }

    #[tokio::test]
    async fn test_token_does_not_consume_following_bytes() {
        let mut frame = b"7\0".to_vec();
        frame.extend_from_slice(&5u64.to_le_bytes());
        let mock = Builder::new().read(&frame).build();
        let mut reader = BufReader::new(mock);

        assert_eq!(read_token(&mut reader, MAX_TOKEN_LEN, "option").await.unwrap(), "7");
        assert_eq!(read_size(&mut reader, "file size").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_token_too_long() {
        let long = vec![b'a'; MAX_TOKEN_LEN + 8];
        let mock = Builder::new().read(&long).build();
        let mut reader = BufReader::new(mock);

        let result = read_token(&mut reader, MAX_TOKEN_LEN, "extension").await;
        assert!(matches!(
            result,
            Err(RelayError::Protocol(ProtocolError::TokenTooLong { max: MAX_TOKEN_LEN }))
        ));
    }

    #[tokio::test]
    async fn test_closed_stream_before_token() {
        let mock = Builder::new().build();
        let mut reader = BufReader::new(mock);

        let result = read_token(&mut reader, MAX_TOKEN_LEN, "extension").await;
        assert!(matches!(
            result,
            Err(RelayError::Transport(TransportError::Closed { expected: "extension" }))
        ));
    }

    #[tokio::test]
    async fn test_write_token_appends_nul() {
        let mut mock = Builder::new().write(b"mp3\0").build();
        write_token(&mut mock, "mp3", "result extension").await.unwrap();
    }

    #[tokio::test]
    async fn test_size_is_little_endian() {
        let mut mock = Builder::new()
            .write(&[0x2a, 0x01, 0, 0, 0, 0, 0, 0])
            .build();
        write_size(&mut mock, 0x012a).await.unwrap();

        let mock = Builder::new().read(&[0x2a, 0x01, 0, 0, 0, 0, 0, 0]).build();
        let mut reader = BufReader::new(mock);
        assert_eq!(read_size(&mut reader, "file size").await.unwrap(), 0x012a);
    }

    #[tokio::test]
    async fn test_truncated_size_field() {
        let mock = Builder::new().read(&[1, 2, 3]).build();
        let mut reader = BufReader::new(mock);

        let result = read_size(&mut reader, "file size").await;
        assert!(matches!(
            result,
            Err(RelayError::Transport(TransportError::Closed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_receive_payload_accumulates_chunks() {
        let mock = Builder::new().read(b"hello ").read(b"wor").read(b"ld").build();
        let mut reader = BufReader::new(mock);
        let mut sink = Vec::new();

        let received = receive_payload(&mut reader, &mut sink, 11, None).await.unwrap();
        assert_eq!(received, 11);
        assert_eq!(sink, b"hello world");
    }

    #[tokio::test]
    async fn test_receive_payload_stops_at_declared_size() {
        let mock = Builder::new().read(b"abcdefgh").build();
        let mut reader = BufReader::new(mock);
        let mut sink = Vec::new();

        receive_payload(&mut reader, &mut sink, 4, None).await.unwrap();
        assert_eq!(sink, b"abcd");
    }

    #[tokio::test]
    async fn test_receive_payload_partial_transfer() {
        let mock = Builder::new().read(b"0123456789").build();
        let mut reader = BufReader::new(mock);
        let mut sink = Vec::new();

        let result = receive_payload(&mut reader, &mut sink, 100, None).await;
        assert!(matches!(
            result,
            Err(RelayError::Transfer(TransferError::Incomplete { received: 10, expected: 100 }))
        ));
    }

    #[tokio::test]
    async fn test_send_file_frames_size_and_payload() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("payload.bin");
        tokio::fs::write(&path, b"converted").await.unwrap();

        let mut out = Vec::new();
        let sent = send_file(&mut out, &path, None).await.unwrap();

        assert_eq!(sent, 9);
        assert_eq!(&out[..8], &9u64.to_le_bytes());
        assert_eq!(&out[8..], b"converted");
    }

    #[tokio::test]
    async fn test_idle_limit() {
        let result: Result<()> = within(Some(Duration::from_millis(20)), "menu", async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;

        assert!(matches!(
            result,
            Err(RelayError::Transport(TransportError::Timeout { operation: "menu", .. }))
        ));
    }

    #[test]
    fn test_reply_classification() {
        assert_eq!(
            Reply::classify("jpeg".to_string()),
            Reply::Result { extension: "jpeg".to_string() }
        );
        assert_eq!(
            Reply::classify(NOTICE_INVALID_OPTION.to_string()),
            Reply::Notice(NOTICE_INVALID_OPTION.to_string())
        );
        assert!(matches!(Reply::classify(String::new()), Reply::Notice(_)));
    }

    #[test]
    fn test_normalize_extension() {
        assert_eq!(normalize_extension("JPG"), Some("jpg".to_string()));
        assert_eq!(normalize_extension(".png"), Some("png".to_string()));
        assert_eq!(normalize_extension("../etc"), None);
        assert_eq!(normalize_extension(""), None);
        assert_eq!(normalize_extension("a".repeat(17).as_str()), None);
    }
}
