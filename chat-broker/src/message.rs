use std::{
    io,
    time::{SystemTime, UNIX_EPOCH},
};

use futures::StreamExt;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

/// Longest line accepted from a peer, in bytes.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// A chat message routed by the broker.
///
/// `recipient` is ignored when `broadcast` is set. Messages are plain values:
/// a broadcast hands every subscriber its own clone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub sender: String,
    pub recipient: String,
    pub content: String,
    pub broadcast: bool,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
}

impl Message {
    /// Builds a private message for `recipient`, stamped with the current time.
    pub fn private(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            content: content.into(),
            broadcast: false,
            timestamp: unix_now(),
        }
    }

    /// Builds a broadcast from `sender`, stamped with the current time.
    pub fn broadcast(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            recipient: String::new(),
            content: content.into(),
            broadcast: true,
            timestamp: unix_now(),
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

/// Frames a client sends to the session layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Hello { id: String },
    Say { text: String },
    Whisper { to: String, text: String },
}

/// Frames the session layer sends back to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome { id: String },
    Delivery { message: Message },
    Error { message: String },
}

/// Reads one JSON frame per line, so `nc` works as a client.
///
/// Partial lines stay buffered inside the reader between calls, which makes
/// [`FrameReader::next_frame`] safe to race in `select!`: losing the race
/// never discards bytes already read off the socket.
pub struct FrameReader<R> {
    lines: FramedRead<R, LinesCodec>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: line_reader(reader),
        }
    }

    /// Next frame, or `None` once the peer closes. Blank lines are skipped.
    pub async fn next_frame<T: DeserializeOwned>(&mut self) -> io::Result<Option<T>> {
        while let Some(line) = self.lines.next().await {
            let line = line.map_err(codec_to_io_error)?;
            let trimmed = line.trim_end_matches('\r');
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str(trimmed).map(Some).map_err(to_io_error);
        }
        Ok(None)
    }
}

/// Line stream with the same length limit the frame reader enforces.
pub fn line_reader<R: AsyncRead>(reader: R) -> FramedRead<R, LinesCodec> {
    FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LEN))
}

pub fn codec_to_io_error(err: LinesCodecError) -> io::Error {
    match err {
        LinesCodecError::Io(err) => err,
        LinesCodecError::MaxLineLengthExceeded => io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line longer than {MAX_LINE_LEN} bytes"),
        ),
    }
}

pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(frame).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
