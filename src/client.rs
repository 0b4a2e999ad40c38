//! Client driver
//!
//! Runs the wire protocol from the initiating side. Each conversion uses a
//! fresh connection: announce the extension, show the menu, pick an option,
//! upload, and save the result next to the input as
//! `<stem>_modified.<extension>`.

use std::{
    fmt,
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use tokio::{
    fs::File,
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpStream, UnixStream},
};
use tracing::{debug, info, warn};

use crate::dispatch::Menu;
use crate::error::{ProtocolError, Result, TransportError};
use crate::wire::{
    read_size, read_token, receive_payload, send_file, within, write_token, Reply, MAX_TEXT_LEN,
};

/// Byte stream to a relay server
pub trait RelayStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RelayStream for T {}

/// Where the server listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

impl Endpoint {
    pub async fn connect(&self) -> Result<Box<dyn RelayStream>> {
        let address = self.to_string();
        let stream: Box<dyn RelayStream> = match self {
            Endpoint::Tcp { host, port } => Box::new(
                TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|source| TransportError::Connect { address, source })?,
            ),
            Endpoint::Unix(path) => Box::new(
                UnixStream::connect(path)
                    .await
                    .map_err(|source| TransportError::Connect { address, source })?,
            ),
        };
        debug!("Connected to {}", self);
        Ok(stream)
    }
}

/// Extension announced for `path`: its lowercase suffix, or empty
pub fn file_extension(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

/// `<dir>/<stem>_modified.<extension>` for an input at `<dir>/<stem>.<ext>`
pub fn derive_output_path(input: &Path, extension: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    input.with_file_name(format!("{}_modified.{}", stem, extension))
}

/// What happened to one conversion request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Converted {
        output: PathBuf,
        uploaded: u64,
        downloaded: u64,
    },
    Refused {
        notice: String,
    },
}

/// One protocol exchange on an open stream
pub struct ClientSession<S> {
    stream: BufReader<S>,
    io_timeout: Option<Duration>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> ClientSession<S> {
    pub fn new(stream: S, io_timeout: Option<Duration>) -> Self {
        Self {
            stream: BufReader::new(stream),
            io_timeout,
        }
    }

    /// Send the extension and return the menu offered for it
    pub async fn announce(&mut self, extension: &str) -> Result<Menu> {
        let io = self.io_timeout;
        within(io, "extension", write_token(&mut self.stream, extension, "extension")).await?;
        let text = within(io, "menu", read_token(&mut self.stream, MAX_TEXT_LEN, "menu")).await?;
        Ok(Menu::parse(&text))
    }

    pub async fn select(&mut self, option: &str) -> Result<()> {
        within(
            self.io_timeout,
            "option",
            write_token(&mut self.stream, option.trim(), "option"),
        )
        .await
    }

    /// Send the size field and contents of `path`
    pub async fn upload(&mut self, path: &Path) -> Result<u64> {
        send_file(&mut self.stream, path, self.io_timeout).await
    }

    pub async fn reply(&mut self) -> Result<Reply> {
        let token = within(
            self.io_timeout,
            "reply",
            read_token(&mut self.stream, MAX_TEXT_LEN, "reply"),
        )
        .await?;
        Ok(Reply::classify(token))
    }

    /// Receive the result payload into `output`, removing it on failure
    pub async fn download(&mut self, output: &Path) -> Result<u64> {
        let io = self.io_timeout;
        let size = within(io, "result size", read_size(&mut self.stream, "result size")).await?;

        let received = self.write_payload(output, size).await;
        if received.is_err() {
            if let Err(e) = tokio::fs::remove_file(output).await {
                debug!("Could not remove partial output {}: {}", output.display(), e);
            }
        }
        received
    }

    async fn write_payload(&mut self, output: &Path, size: u64) -> Result<u64> {
        let mut file = File::create(output).await?;
        let received = receive_payload(&mut self.stream, &mut file, size, self.io_timeout).await?;
        file.flush().await?;
        Ok(received)
    }

    /// Finish the exchange after the menu: select, upload if the option is
    /// offered, and collect the result
    pub async fn complete(mut self, menu: &Menu, option: &str, input: &Path) -> Result<Outcome> {
        self.select(option).await?;

        let offered = option
            .trim()
            .parse::<u32>()
            .map(|id| menu.contains(id))
            .unwrap_or(false);
        let uploaded = if offered {
            match self.upload(input).await {
                Ok(uploaded) => uploaded,
                // the server may have refused the upload and stopped reading
                Err(e) if e.is_transport() => {
                    return match self.reply().await {
                        Ok(Reply::Notice(notice)) => Ok(Outcome::Refused { notice }),
                        _ => Err(e),
                    };
                }
                Err(e) => return Err(e),
            }
        } else {
            0
        };

        let outcome = match self.reply().await? {
            Reply::Notice(notice) => Outcome::Refused { notice },
            Reply::Result { extension } => {
                let output = derive_output_path(input, &extension);
                let downloaded = self.download(&output).await?;
                Outcome::Converted {
                    output,
                    uploaded,
                    downloaded,
                }
            }
        };

        if let Err(e) = self.stream.shutdown().await {
            debug!("Shutdown after exchange: {}", e);
        }
        Ok(outcome)
    }
}

/// Convert `input` with a preselected `option` in one call
pub async fn convert_file(
    endpoint: &Endpoint,
    input: &Path,
    option: &str,
    io_timeout: Option<Duration>,
) -> Result<Outcome> {
    let stream = endpoint.connect().await?;
    let mut session = ClientSession::new(stream, io_timeout);
    let menu = session.announce(&file_extension(input)).await?;
    session.complete(&menu, option, input).await
}

/// Turn a refusal into an error
pub fn require_converted(outcome: Outcome) -> Result<(PathBuf, u64)> {
    match outcome {
        Outcome::Converted {
            output, downloaded, ..
        } => Ok((output, downloaded)),
        Outcome::Refused { notice } => Err(ProtocolError::Notice { message: notice }.into()),
    }
}

/// Interactive loop reading file paths and options from stdin
pub struct InteractiveClient {
    endpoint: Endpoint,
    io_timeout: Option<Duration>,
}

impl InteractiveClient {
    pub fn new(endpoint: Endpoint, io_timeout: Option<Duration>) -> Self {
        Self {
            endpoint,
            io_timeout,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        println!("🚀 File conversion client ({})", self.endpoint);
        println!("Enter a file path to convert, Ctrl+D to exit");

        let mut reader = BufReader::new(tokio::io::stdin());

        loop {
            let Some(path) = prompt(&mut reader, "file> ").await? else {
                break;
            };
            if path.is_empty() {
                continue;
            }

            let input = PathBuf::from(&path);
            if !input.is_file() {
                println!("❌ No such file: {}", input.display());
                continue;
            }

            match self.convert_interactively(&mut reader, &input).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => println!("❌ Error: {:#}", e),
            }
        }

        println!("👋 Goodbye!");
        Ok(())
    }

    /// Returns `false` when stdin closed mid-exchange
    async fn convert_interactively<R>(&self, reader: &mut R, input: &Path) -> anyhow::Result<bool>
    where
        R: AsyncBufRead + Unpin,
    {
        let stream = self
            .endpoint
            .connect()
            .await
            .with_context(|| format!("Failed to reach server at {}", self.endpoint))?;
        let mut session = ClientSession::new(stream, self.io_timeout);

        let extension = file_extension(input);
        let menu = session
            .announce(&extension)
            .await
            .context("Failed to receive menu")?;
        print!("{}", menu);

        let Some(option) = prompt(reader, "option> ").await? else {
            return Ok(false);
        };

        let outcome = session
            .complete(&menu, &option, input)
            .await
            .context("Conversion exchange failed")?;

        match outcome {
            Outcome::Converted {
                output,
                uploaded,
                downloaded,
            } => {
                info!("Saved {} ({} bytes)", output.display(), downloaded);
                println!("📤 Sent {} bytes", uploaded);
                println!("✅ Saved {} ({} bytes)", output.display(), downloaded);
            }
            Outcome::Refused { notice } => {
                warn!("Server refused conversion: {}", notice.trim_end());
                print!("⚠️  {}", notice);
                if !notice.ends_with('\n') {
                    println!();
                }
            }
        }
        Ok(true)
    }
}

/// Print `label` and read one trimmed line; `None` at end of input
async fn prompt<R>(reader: &mut R, label: &str) -> anyhow::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    print!("{}", label);
    std::io::stdout().flush()?;

    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}
