//! Per-connection session state machine
//!
//! A session serves exactly one conversion on one stream:
//!
//! ```text
//! AwaitExtension -> AwaitOption -> ReceivingFile -> Converting -> SendingResult -> Closed
//!        \               \               \               \               \
//!         +---------------+---------------+---------------+---------------+--> Error
//! ```
//!
//! Scratch files are owned by the running step and dropped on every exit
//! path. The stream is shut down exactly once when [`SessionHandler::handle`]
//! returns.

use std::{fmt, sync::Arc, time::Duration};

use tokio::{
    fs::File,
    io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    time::timeout,
};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SessionLimits;
use crate::dispatch::DispatchTable;
use crate::error::{EngineError, ProtocolError, RelayError, Result, TransferError, TransportError};
use crate::scratch::{ScratchRole, ScratchSpace};
use crate::wire::{
    normalize_extension, read_size, read_token, receive_payload, send_file, within, write_token,
    MAX_TOKEN_LEN,
};

/// Limit on discarding a refused upload when no idle limit is configured
const DISCARD_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a session is in the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitExtension,
    AwaitOption,
    ReceivingFile,
    Converting,
    SendingResult,
    Closed,
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::AwaitExtension => "await-extension",
            SessionState::AwaitOption => "await-option",
            SessionState::ReceivingFile => "receiving-file",
            SessionState::Converting => "converting",
            SessionState::SendingResult => "sending-result",
            SessionState::Closed => "closed",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Outcome of one session
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Id carried by the session's log span
    pub id: Uuid,
    /// `Closed` or `Error`
    pub state: SessionState,
    /// State the session was in when it failed
    pub failed_in: Option<SessionState>,
    /// Normalised extension; empty when the token was unusable
    pub extension: Option<String>,
    /// Option the client selected, if it parsed
    pub option: Option<u32>,
    /// Payload bytes written to the input scratch file
    pub bytes_received: u64,
    /// Result payload bytes sent back
    pub bytes_sent: u64,
    /// Failure description for `Error` sessions
    pub error: Option<String>,
}

impl SessionReport {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            state: SessionState::AwaitExtension,
            failed_in: None,
            extension: None,
            option: None,
            bytes_received: 0,
            bytes_sent: 0,
            error: None,
        }
    }

    fn enter(&mut self, state: SessionState) {
        debug!("{} -> {}", self.state, state);
        self.state = state;
    }

    pub fn is_success(&self) -> bool {
        self.state == SessionState::Closed
    }
}

/// Runs sessions against a shared dispatch table
#[derive(Debug, Clone)]
pub struct SessionHandler {
    table: Arc<DispatchTable>,
    scratch: ScratchSpace,
    limits: SessionLimits,
}

impl SessionHandler {
    pub fn new(table: Arc<DispatchTable>, scratch: ScratchSpace, limits: SessionLimits) -> Self {
        Self {
            table,
            scratch,
            limits,
        }
    }

    /// Serve one session on `stream` and close it
    pub async fn handle<S>(&self, stream: S, peer: &str) -> SessionReport
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let id = Uuid::new_v4();
        let span = info_span!("session", id = %id, peer = %peer);

        async move {
            info!("Session started");
            let mut stream = BufReader::new(stream);
            let mut report = SessionReport::new(id);

            match self.run(&mut stream, &mut report).await {
                Ok(()) => {
                    report.enter(SessionState::Closed);
                    info!(
                        "Session complete: received {} bytes, sent {} bytes",
                        report.bytes_received, report.bytes_sent
                    );
                }
                Err(e) => {
                    warn!("Session failed during {}: {}", report.state, e);
                    if !e.is_transport() {
                        if let Some(notice) = e.notice() {
                            let sent = within(
                                self.limits.io_timeout,
                                "notice",
                                write_token(&mut stream, notice, "notice"),
                            )
                            .await;
                            if let Err(send_error) = sent {
                                debug!("Could not deliver notice: {}", send_error);
                            }
                        }
                        // the peer is still writing the refused payload
                        if let RelayError::Transfer(TransferError::TooLarge { size, .. }) = &e {
                            match self.discard(&mut stream, *size).await {
                                Ok(discarded) => debug!("Discarded {} refused bytes", discarded),
                                Err(discard_error) => {
                                    debug!("Stopped discarding refused upload: {}", discard_error)
                                }
                            }
                        }
                    }
                    report.failed_in = Some(report.state);
                    report.error = Some(e.to_string());
                    report.enter(SessionState::Error);
                }
            }

            if let Err(e) = stream.shutdown().await {
                debug!("Shutdown after session: {}", e);
            }
            report
        }
        .instrument(span)
        .await
    }

    /// Read and drop up to `size` bytes so the peer can finish its upload
    /// and read the notice
    async fn discard<S>(&self, stream: &mut BufReader<S>, size: u64) -> Result<u64>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let limit = self.limits.io_timeout.unwrap_or(DISCARD_TIMEOUT);
        within(Some(limit), "refused payload", async {
            io::copy(&mut (&mut *stream).take(size), &mut io::sink())
                .await
                .map_err(|source| {
                    RelayError::from(TransportError::Io {
                        operation: "refused payload",
                        source,
                    })
                })
        })
        .await
    }

    async fn run<S>(&self, stream: &mut BufReader<S>, report: &mut SessionReport) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let io = self.limits.io_timeout;

        report.enter(SessionState::AwaitExtension);
        let extension = match within(io, "extension", read_token(stream, MAX_TOKEN_LEN, "extension")).await {
            Ok(token) => normalize_extension(&token).unwrap_or_default(),
            // answered like any unknown extension
            Err(RelayError::Protocol(e)) => {
                warn!("Unreadable extension token: {}", e);
                String::new()
            }
            Err(e) => return Err(e),
        };
        info!("Client announced extension '{}'", extension);
        report.extension = Some(extension.clone());

        report.enter(SessionState::AwaitOption);
        let menu = self.table.menu(&extension);
        within(io, "menu", write_token(stream, &menu.render(), "menu")).await?;

        let token = within(io, "option", read_token(stream, MAX_TOKEN_LEN, "option")).await?;
        let option: u32 = token
            .trim()
            .parse()
            .map_err(|_| ProtocolError::InvalidOption { token: token.clone() })?;
        report.option = Some(option);
        if !menu.contains(option) {
            return Err(ProtocolError::OptionNotOffered { option, extension }.into());
        }

        report.enter(SessionState::ReceivingFile);
        let size = within(io, "file size", read_size(stream, "file size")).await?;
        if size > self.limits.max_file_size {
            return Err(TransferError::TooLarge {
                size,
                max_size: self.limits.max_file_size,
            }
            .into());
        }

        let input = self.scratch.allocate(ScratchRole::Input, &extension)?;
        {
            let mut file = File::create(input.path()).await?;
            let received = receive_payload(stream, &mut file, size, io).await;
            if let Err(RelayError::Transfer(TransferError::Incomplete { received, .. })) = &received {
                report.bytes_received = *received;
            }
            report.bytes_received = received?;
        }
        info!("Received {} bytes", report.bytes_received);

        report.enter(SessionState::Converting);
        let descriptor = self
            .table
            .lookup(option)
            .ok_or(ProtocolError::UnknownOption { option })?;
        let output = self
            .scratch
            .allocate(ScratchRole::Output, &descriptor.target_extension)?;

        info!(
            "Converting option {} ({}) with {}",
            descriptor.id,
            descriptor.description,
            descriptor.engine.name()
        );
        let conversion = descriptor.engine.convert(input.path(), output.path());
        match self.limits.conversion_timeout {
            Some(duration) => timeout(duration, conversion)
                .await
                .map_err(|_| EngineError::Timeout { duration })??,
            None => conversion.await?,
        }

        report.enter(SessionState::SendingResult);
        within(
            io,
            "result extension",
            write_token(stream, &descriptor.target_extension, "result extension"),
        )
        .await?;
        report.bytes_sent = send_file(stream, output.path(), io).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::STANDARD_CONVERSIONS;
    use crate::engine::ConversionEngine;
    use crate::wire::{
        write_size, MAX_TEXT_LEN, NOTICE_CONVERSION_FAILED, NOTICE_INCOMPLETE_UPLOAD,
        NOTICE_INVALID_OPTION, NOTICE_TOO_LARGE, NOTICE_UNSUPPORTED,
    };
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    /// Copies the input and prefixes it with a marker
    #[derive(Debug)]
    struct TagEngine;

    #[async_trait]
    impl ConversionEngine for TagEngine {
        fn name(&self) -> &str {
            "tag"
        }

        async fn convert(&self, input: &Path, output: &Path) -> std::result::Result<(), EngineError> {
            let mut data = b"converted:".to_vec();
            data.extend(tokio::fs::read(input).await?);
            tokio::fs::write(output, data).await?;
            Ok(())
        }
    }

    #[derive(Debug)]
    struct BrokenEngine;

    #[async_trait]
    impl ConversionEngine for BrokenEngine {
        fn name(&self) -> &str {
            "broken"
        }

        async fn convert(&self, _input: &Path, _output: &Path) -> std::result::Result<(), EngineError> {
            Err(EngineError::ProcessFailed {
                program: "broken".to_string(),
                status: "exit status: 1".to_string(),
                stderr: String::new(),
            })
        }
    }

    #[derive(Debug)]
    struct StallingEngine;

    #[async_trait]
    impl ConversionEngine for StallingEngine {
        fn name(&self) -> &str {
            "stalling"
        }

        async fn convert(&self, _input: &Path, _output: &Path) -> std::result::Result<(), EngineError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    struct Fixture {
        dir: TempDir,
        handler: SessionHandler,
    }

    /// Option 13 fails, option 14 stalls, everything else tags
    fn fixture(limits: SessionLimits) -> Fixture {
        let dir = TempDir::new().unwrap();
        let table = DispatchTable::with_engines(STANDARD_CONVERSIONS, |row| -> Arc<dyn ConversionEngine> {
            match row.id {
                13 => Arc::new(BrokenEngine),
                14 => Arc::new(StallingEngine),
                _ => Arc::new(TagEngine),
            }
        })
        .unwrap();
        let scratch = ScratchSpace::new(dir.path()).unwrap();

        Fixture {
            handler: SessionHandler::new(Arc::new(table), scratch, limits),
            dir,
        }
    }

    fn scratch_is_empty(fixture: &Fixture) -> bool {
        std::fs::read_dir(fixture.dir.path()).unwrap().count() == 0
    }

    fn spawn(fixture: &Fixture) -> (BufReader<DuplexStream>, tokio::task::JoinHandle<SessionReport>) {
        let (client, server) = duplex(256 * 1024);
        let handler = fixture.handler.clone();
        let task = tokio::spawn(async move { handler.handle(server, "test-peer").await });
        (BufReader::new(client), task)
    }

    async fn announce(client: &mut BufReader<DuplexStream>, extension: &str, option: &str) -> String {
        write_token(client, extension, "extension").await.unwrap();
        let menu = read_token(client, MAX_TEXT_LEN, "menu").await.unwrap();
        write_token(client, option, "option").await.unwrap();
        menu
    }

    #[tokio::test]
    async fn test_successful_conversion() {
        let fixture = fixture(SessionLimits::default());
        let (mut client, task) = spawn(&fixture);

        let menu = announce(&mut client, "bmp", "8").await;
        assert_eq!(menu, "7. BMP to JPEG\n8. BMP to PNG\n");

        write_size(&mut client, 5).await.unwrap();
        client.write_all(b"pixel").await.unwrap();

        let reply = read_token(&mut client, MAX_TEXT_LEN, "reply").await.unwrap();
        assert_eq!(reply, "png");
        let size = read_size(&mut client, "result size").await.unwrap();
        let mut payload = vec![0u8; size as usize];
        client.read_exact(&mut payload).await.unwrap();
        assert_eq!(payload, b"converted:pixel");

        let report = task.await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.extension.as_deref(), Some("bmp"));
        assert_eq!(report.option, Some(8));
        assert_eq!(report.bytes_received, 5);
        assert_eq!(report.bytes_sent, size);
        assert!(scratch_is_empty(&fixture));
    }

    #[tokio::test]
    async fn test_unsupported_extension_then_option_rejected() {
        let fixture = fixture(SessionLimits::default());
        let (mut client, task) = spawn(&fixture);

        let menu = announce(&mut client, "docx", "1").await;
        assert_eq!(menu, NOTICE_UNSUPPORTED);

        let reply = read_token(&mut client, MAX_TEXT_LEN, "reply").await.unwrap();
        assert_eq!(reply, NOTICE_INVALID_OPTION);

        let report = task.await.unwrap();
        assert_eq!(report.state, SessionState::Error);
        assert_eq!(report.failed_in, Some(SessionState::AwaitOption));
        assert!(scratch_is_empty(&fixture));
    }

    #[tokio::test]
    async fn test_option_not_on_menu() {
        let fixture = fixture(SessionLimits::default());
        let (mut client, task) = spawn(&fixture);

        // 9 exists, but belongs to jpeg
        announce(&mut client, "bmp", "9").await;
        let reply = read_token(&mut client, MAX_TEXT_LEN, "reply").await.unwrap();
        assert_eq!(reply, NOTICE_INVALID_OPTION);

        let report = task.await.unwrap();
        assert_eq!(report.option, Some(9));
        assert_eq!(report.failed_in, Some(SessionState::AwaitOption));
    }

    #[tokio::test]
    async fn test_non_numeric_option() {
        let fixture = fixture(SessionLimits::default());
        let (mut client, task) = spawn(&fixture);

        announce(&mut client, "png", "first").await;
        let reply = read_token(&mut client, MAX_TEXT_LEN, "reply").await.unwrap();
        assert_eq!(reply, NOTICE_INVALID_OPTION);

        let report = task.await.unwrap();
        assert_eq!(report.option, None);
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn test_jpg_alias_gets_jpeg_menu() {
        let fixture = fixture(SessionLimits::default());
        let (mut client, _task) = spawn(&fixture);

        let menu = announce(&mut client, "JPG", "10").await;
        assert_eq!(menu, "9. JPEG to BMP\n10. JPEG to PNG\n");
    }

    #[tokio::test]
    async fn test_partial_transfer() {
        let fixture = fixture(SessionLimits::default());
        let (mut client, task) = spawn(&fixture);

        announce(&mut client, "wav", "6").await;
        write_size(&mut client, 100).await.unwrap();
        client.write_all(&[7u8; 10]).await.unwrap();
        client.shutdown().await.unwrap();

        let reply = read_token(&mut client, MAX_TEXT_LEN, "reply").await.unwrap();
        assert_eq!(reply, NOTICE_INCOMPLETE_UPLOAD);

        let report = task.await.unwrap();
        assert_eq!(report.failed_in, Some(SessionState::ReceivingFile));
        assert_eq!(report.bytes_received, 10);
        assert!(report.error.unwrap().contains("received 10 of 100 bytes"));
        assert!(scratch_is_empty(&fixture));
    }

    #[tokio::test]
    async fn test_engine_failure_sends_notice() {
        let fixture = fixture(SessionLimits::default());
        let (mut client, task) = spawn(&fixture);

        announce(&mut client, "odt", "13").await;
        write_size(&mut client, 3).await.unwrap();
        client.write_all(b"odt").await.unwrap();

        let reply = read_token(&mut client, MAX_TEXT_LEN, "reply").await.unwrap();
        assert_eq!(reply, NOTICE_CONVERSION_FAILED);

        let report = task.await.unwrap();
        assert_eq!(report.failed_in, Some(SessionState::Converting));
        assert!(scratch_is_empty(&fixture));
    }

    #[tokio::test]
    async fn test_conversion_timeout() {
        let limits = SessionLimits {
            conversion_timeout: Some(Duration::from_millis(50)),
            ..SessionLimits::default()
        };
        let fixture = fixture(limits);
        let (mut client, task) = spawn(&fixture);

        announce(&mut client, "odt", "14").await;
        write_size(&mut client, 3).await.unwrap();
        client.write_all(b"odt").await.unwrap();

        let reply = read_token(&mut client, MAX_TEXT_LEN, "reply").await.unwrap();
        assert_eq!(reply, NOTICE_CONVERSION_FAILED);

        let report = task.await.unwrap();
        assert!(report.error.unwrap().contains("timed out"));
        assert!(scratch_is_empty(&fixture));
    }

    #[tokio::test]
    async fn test_declared_size_over_limit() {
        let limits = SessionLimits {
            max_file_size: 16,
            ..SessionLimits::default()
        };
        let fixture = fixture(limits);
        let (mut client, task) = spawn(&fixture);

        announce(&mut client, "txt", "15").await;
        write_size(&mut client, 1000).await.unwrap();
        client.write_all(&[b'x'; 1000]).await.unwrap();

        let reply = read_token(&mut client, MAX_TEXT_LEN, "reply").await.unwrap();
        assert_eq!(reply, NOTICE_TOO_LARGE);

        let report = task.await.unwrap();
        assert_eq!(report.failed_in, Some(SessionState::ReceivingFile));
        assert_eq!(report.bytes_received, 0);
        assert!(scratch_is_empty(&fixture));
    }

    #[tokio::test]
    async fn test_refused_upload_is_drained_before_close() {
        let limits = SessionLimits {
            max_file_size: 16,
            io_timeout: Some(Duration::from_secs(5)),
            ..SessionLimits::default()
        };
        let fixture = fixture(limits);
        // smaller than the upload, so the server has to read it
        let (client, server) = duplex(4 * 1024);
        let handler = fixture.handler.clone();
        let task = tokio::spawn(async move { handler.handle(server, "test-peer").await });
        let mut client = BufReader::new(client);

        announce(&mut client, "bmp", "7").await;
        write_size(&mut client, 256 * 1024).await.unwrap();
        client.write_all(&vec![0u8; 256 * 1024]).await.unwrap();

        let reply = read_token(&mut client, MAX_TEXT_LEN, "reply").await.unwrap();
        assert_eq!(reply, NOTICE_TOO_LARGE);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let report = task.await.unwrap();
        assert_eq!(report.failed_in, Some(SessionState::ReceivingFile));
        assert!(scratch_is_empty(&fixture));
    }

    #[tokio::test]
    async fn test_overlong_extension_gets_unsupported_menu() {
        let fixture = fixture(SessionLimits::default());
        let (mut client, task) = spawn(&fixture);

        let long = "a".repeat(200);
        let menu = announce(&mut client, &long, "1").await;
        assert_eq!(menu, NOTICE_UNSUPPORTED);

        let reply = read_token(&mut client, MAX_TEXT_LEN, "reply").await.unwrap();
        assert_eq!(reply, NOTICE_INVALID_OPTION);

        let report = task.await.unwrap();
        assert_eq!(report.extension.as_deref(), Some(""));
        assert_eq!(report.failed_in, Some(SessionState::AwaitOption));
        assert!(scratch_is_empty(&fixture));
    }

    #[tokio::test]
    async fn test_non_utf8_extension_gets_unsupported_menu() {
        let fixture = fixture(SessionLimits::default());
        let (mut client, task) = spawn(&fixture);

        client.write_all(&[0xff, 0xfe, b'g', 0]).await.unwrap();
        let menu = read_token(&mut client, MAX_TEXT_LEN, "menu").await.unwrap();
        assert_eq!(menu, NOTICE_UNSUPPORTED);

        write_token(&mut client, "7", "option").await.unwrap();
        let reply = read_token(&mut client, MAX_TEXT_LEN, "reply").await.unwrap();
        assert_eq!(reply, NOTICE_INVALID_OPTION);

        let report = task.await.unwrap();
        assert_eq!(report.option, Some(7));
        assert_eq!(report.failed_in, Some(SessionState::AwaitOption));
    }

    #[tokio::test]
    async fn test_peer_gone_before_extension() {
        let fixture = fixture(SessionLimits::default());
        let (client, task) = spawn(&fixture);
        drop(client);

        let report = task.await.unwrap();
        assert_eq!(report.failed_in, Some(SessionState::AwaitExtension));
        assert_eq!(report.extension, None);
    }

    #[tokio::test]
    async fn test_idle_peer_times_out() {
        let limits = SessionLimits {
            io_timeout: Some(Duration::from_millis(50)),
            ..SessionLimits::default()
        };
        let fixture = fixture(limits);
        let (mut client, task) = spawn(&fixture);

        write_token(&mut client, "mp3", "extension").await.unwrap();
        // never send the option

        let report = task.await.unwrap();
        assert_eq!(report.failed_in, Some(SessionState::AwaitOption));
        assert!(report.error.unwrap().contains("timed out"));
    }
}
