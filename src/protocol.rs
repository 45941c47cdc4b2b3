//! Session handshake messages
//!
//! A TCP or TLS session opens with the client sending its [`Options`] as one
//! JSON line; the server answers with an [`Ack`] line and payload follows.
//! A UDP session opens with one datagram holding the same JSON object and no
//! acknowledgment.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::rate_limit::validate_max_speed;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ACK_MAGIC: &str = "benchwire-ack";
pub const DEFAULT_PORT: u16 = 8080;

pub const CLIENT_VERSION_KEY: &str = "client_version";
pub const SERVER_VERSION_KEY: &str = "server_version";

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_LINE_LENGTH: usize = 8192;
pub const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;
/// Largest payload a single IPv4 UDP datagram can carry
pub const MAX_UDP_PAYLOAD: usize = 65_507;

pub const DEFAULT_TCP_BUFFER: usize = 1_000_000;
pub const DEFAULT_UDP_BUFFER: usize = 64_000;

/// Session parameters chosen by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Options {
    pub report_interval: Duration,
    pub total_duration: Duration,
    pub tcp_read_size: usize,
    pub tcp_write_size: usize,
    pub udp_read_size: usize,
    pub udp_write_size: usize,
    /// Server must not write payload back
    pub passive_server: bool,
    /// Megabits per second, 0 for unlimited
    pub max_speed: f64,
    #[serde(default)]
    pub table: BTreeMap<String, String>,
}

impl Default for Options {
    fn default() -> Self {
        let mut table = BTreeMap::new();
        table.insert(CLIENT_VERSION_KEY.to_string(), VERSION.to_string());
        Self {
            report_interval: Duration::from_secs(2),
            total_duration: Duration::from_secs(10),
            tcp_read_size: DEFAULT_TCP_BUFFER,
            tcp_write_size: DEFAULT_TCP_BUFFER,
            udp_read_size: DEFAULT_UDP_BUFFER,
            udp_write_size: DEFAULT_UDP_BUFFER,
            passive_server: false,
            max_speed: 0.0,
            table,
        }
    }
}

impl Options {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, size, max) in [
            ("tcp_read_size", self.tcp_read_size, MAX_BUFFER_SIZE),
            ("tcp_write_size", self.tcp_write_size, MAX_BUFFER_SIZE),
            ("udp_read_size", self.udp_read_size, MAX_UDP_PAYLOAD),
            ("udp_write_size", self.udp_write_size, MAX_UDP_PAYLOAD),
        ] {
            if size == 0 || size > max {
                anyhow::bail!("{} must be between 1 and {} bytes, got {}", name, max, size);
            }
        }
        validate_max_speed(self.max_speed)?;
        Ok(())
    }

    pub fn client_version(&self) -> &str {
        self.table
            .get(CLIENT_VERSION_KEY)
            .map(String::as_str)
            .unwrap_or("unknown")
    }
}

/// Server reply to a stream client's [`Options`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub magic: String,
    #[serde(default)]
    pub table: BTreeMap<String, String>,
}

impl Ack {
    pub fn new() -> Self {
        let mut table = BTreeMap::new();
        table.insert(SERVER_VERSION_KEY.to_string(), VERSION.to_string());
        Self {
            magic: ACK_MAGIC.to_string(),
            table,
        }
    }

    pub fn server_version(&self) -> &str {
        self.table
            .get(SERVER_VERSION_KEY)
            .map(String::as_str)
            .unwrap_or("unknown")
    }

    pub fn verify(&self) -> Result<(), HandshakeError> {
        if self.magic == ACK_MAGIC {
            Ok(())
        } else {
            Err(HandshakeError::BadMagic {
                expected: ACK_MAGIC.to_string(),
                got: self.magic.clone(),
            })
        }
    }
}

impl Default for Ack {
    fn default() -> Self {
        Self::new()
    }
}

/// Protocol violations seen while opening a session
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeError {
    BadMagic { expected: String, got: String },
    /// The peer sent something that cannot start a JSON message
    NotAMessage { first_byte: u8 },
    LineTooLong,
    /// A zero-length datagram arrived where options were expected
    Empty,
    Closed,
    TimedOut(Duration),
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeError::BadMagic { expected, got } => {
                write!(f, "bad ack magic: expected {:?}, got {:?}", expected, got)
            }
            HandshakeError::NotAMessage { first_byte } => {
                write!(f, "not a handshake message (first byte 0x{:02x})", first_byte)
            }
            HandshakeError::LineTooLong => {
                write!(f, "handshake message exceeds {} bytes", MAX_LINE_LENGTH)
            }
            HandshakeError::Empty => write!(f, "empty handshake datagram"),
            HandshakeError::Closed => write!(f, "connection closed during handshake"),
            HandshakeError::TimedOut(limit) => {
                write!(f, "handshake timed out after {:?}", limit)
            }
        }
    }
}

impl std::error::Error for HandshakeError {}

pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = format!("{}\n", serde_json::to_string(msg)?);
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_message<R, T>(reader: &mut R) -> anyhow::Result<T>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let line = read_bounded_line(reader).await?;
    serde_json::from_slice(&line).context("malformed handshake message")
}

/// Read one newline-terminated message without consuming anything past it.
async fn read_bounded_line<R>(reader: &mut R) -> anyhow::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let bytes = reader.fill_buf().await?;
        if bytes.is_empty() {
            return Err(HandshakeError::Closed.into());
        }
        if line.is_empty() && bytes[0] != b'{' {
            return Err(HandshakeError::NotAMessage {
                first_byte: bytes[0],
            }
            .into());
        }

        if let Some(newline_pos) = bytes.iter().position(|&b| b == b'\n') {
            let to_read = newline_pos + 1;
            if line.len() + to_read > MAX_LINE_LENGTH {
                return Err(HandshakeError::LineTooLong.into());
            }
            line.extend_from_slice(&bytes[..newline_pos]);
            reader.consume(to_read);
            return Ok(line);
        }

        let len = bytes.len();
        if line.len() + len > MAX_LINE_LENGTH {
            return Err(HandshakeError::LineTooLong.into());
        }
        line.extend_from_slice(bytes);
        reader.consume(len);
    }
}

async fn read_with_timeout<R, T>(reader: &mut R, limit: Duration) -> anyhow::Result<T>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    tokio::time::timeout(limit, read_message(reader))
        .await
        .map_err(|_| HandshakeError::TimedOut(limit))?
}

pub async fn send_options<W>(writer: &mut W, options: &Options) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_message(writer, options)
        .await
        .context("sending options")
}

/// Server side: read and validate the client's options.
pub async fn recv_options<R>(reader: &mut R, limit: Duration) -> anyhow::Result<Options>
where
    R: AsyncBufRead + Unpin,
{
    let options: Options = read_with_timeout(reader, limit).await?;
    options.validate()?;
    debug!(
        "Received options from client version {}: {:?}",
        options.client_version(),
        options
    );
    Ok(options)
}

pub async fn send_ack<W>(writer: &mut W, ack: &Ack) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    ack.verify().context("refusing to send ack")?;
    write_message(writer, ack).await.context("sending ack")
}

/// Client side: read the server's ack and check its magic.
pub async fn recv_ack<R>(reader: &mut R, limit: Duration) -> anyhow::Result<Ack>
where
    R: AsyncBufRead + Unpin,
{
    let ack: Ack = read_with_timeout(reader, limit).await?;
    ack.verify()?;
    debug!("Server version {}", ack.server_version());
    Ok(ack)
}

pub fn encode_datagram(options: &Options) -> anyhow::Result<Vec<u8>> {
    let bytes = serde_json::to_vec(options)?;
    if bytes.len() > MAX_LINE_LENGTH {
        return Err(HandshakeError::LineTooLong.into());
    }
    Ok(bytes)
}

pub fn decode_datagram(datagram: &[u8]) -> anyhow::Result<Options> {
    match datagram.first() {
        None => return Err(HandshakeError::Empty.into()),
        Some(&b) if b != b'{' => return Err(HandshakeError::NotAMessage { first_byte: b }.into()),
        Some(_) => {}
    }
    let options: Options =
        serde_json::from_slice(datagram).context("malformed options datagram")?;
    options.validate()?;
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_default_options() {
        let options = Options::default();
        assert_eq!(options.report_interval, Duration::from_secs(2));
        assert_eq!(options.total_duration, Duration::from_secs(10));
        assert_eq!(options.tcp_read_size, 1_000_000);
        assert_eq!(options.udp_write_size, 64_000);
        assert_eq!(options.client_version(), VERSION);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_sizes() {
        let options = Options {
            tcp_write_size: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = Options {
            udp_read_size: MAX_BUFFER_SIZE + 1,
            ..Default::default()
        };
        assert!(options.validate().is_err());

        // Fine for TCP, too big for one datagram
        let options = Options {
            tcp_write_size: MAX_UDP_PAYLOAD + 1,
            udp_read_size: MAX_UDP_PAYLOAD,
            ..Default::default()
        };
        assert!(options.validate().is_ok());

        let options = Options {
            udp_write_size: MAX_UDP_PAYLOAD + 1,
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = Options {
            max_speed: -3.0,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_ack_magic() {
        assert!(Ack::new().verify().is_ok());
        let ack = Ack {
            magic: "nope".to_string(),
            table: BTreeMap::new(),
        };
        assert!(matches!(
            ack.verify(),
            Err(HandshakeError::BadMagic { .. })
        ));
        assert_eq!(ack.server_version(), "unknown");
    }

    #[tokio::test]
    async fn test_line_leaves_payload_unread() {
        let mut wire = Vec::new();
        write_message(&mut wire, &Ack::new()).await.unwrap();
        wire.extend_from_slice(b"payload");

        let mut reader = BufReader::new(&wire[..]);
        let ack = recv_ack(&mut reader, HANDSHAKE_TIMEOUT).await.unwrap();
        assert_eq!(ack.server_version(), VERSION);

        let mut rest = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut rest)
            .await
            .unwrap();
        assert_eq!(rest, b"payload");
    }

    #[tokio::test]
    async fn test_rejects_tls_record() {
        let wire = [0x16u8, 0x03, 0x01, 0x00];
        let mut reader = BufReader::new(&wire[..]);
        let err = recv_options(&mut reader, HANDSHAKE_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<HandshakeError>(),
            Some(&HandshakeError::NotAMessage { first_byte: 0x16 })
        );
    }

    #[tokio::test]
    async fn test_rejects_long_line() {
        let mut wire = vec![b'{'];
        wire.extend(std::iter::repeat_n(b' ', MAX_LINE_LENGTH + 10));
        let mut reader = BufReader::with_capacity(512, &wire[..]);
        let err = recv_options(&mut reader, HANDSHAKE_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<HandshakeError>(),
            Some(&HandshakeError::LineTooLong)
        );
    }

    #[tokio::test]
    async fn test_send_ack_refuses_bad_magic() {
        let mut wire = Vec::new();
        let ack = Ack {
            magic: "wrong".to_string(),
            table: BTreeMap::new(),
        };
        assert!(send_ack(&mut wire, &ack).await.is_err());
        assert!(wire.is_empty());
    }

    #[test]
    fn test_datagram_rejects_garbage() {
        assert!(decode_datagram(b"").is_err());
        assert!(decode_datagram(b"hello").is_err());
        assert!(decode_datagram(b"{\"not\":\"options\"}").is_err());

        let bytes = encode_datagram(&Options::default()).unwrap();
        assert_eq!(decode_datagram(&bytes).unwrap(), Options::default());
    }
}
