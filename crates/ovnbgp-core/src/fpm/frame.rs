//! FPM frame envelope
//!
//! ```text
//!  0        1        2                 4
//! +--------+--------+--------+--------+----------------------+
//! |version |  type  |  length (BE)    | payload (length - 4) |
//! +--------+--------+--------+--------+----------------------+
//! ```
//!
//! `length` counts the header too.

use crate::config::FpmFormat;
use crate::error::{Error, Result};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const HEADER_LEN: usize = 4;

pub const FPM_VERSION: u8 = 1;

/// Frame type carrying a structured route-change record
pub const TYPE_STRUCTURED: u8 = 1;

/// Frame type carrying kernel route messages
pub const TYPE_NETLINK: u8 = 2;

/// Frame type expected for a payload format
pub fn frame_type(format: FpmFormat) -> u8 {
    match format {
        FpmFormat::Structured => TYPE_STRUCTURED,
        FpmFormat::Netlink => TYPE_NETLINK,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpmHeader {
    pub version: u8,
    pub msg_type: u8,
    pub length: u16,
}

impl FpmHeader {
    /// Parse a header; lengths shorter than the header itself are rejected
    pub fn parse(bytes: [u8; HEADER_LEN]) -> Result<Self> {
        let header = Self {
            version: bytes[0],
            msg_type: bytes[1],
            length: u16::from_be_bytes([bytes[2], bytes[3]]),
        };
        if usize::from(header.length) < HEADER_LEN {
            return Err(Error::protocol(format!(
                "frame length {} shorter than header",
                header.length
            )));
        }
        Ok(header)
    }

    pub fn payload_len(&self) -> usize {
        usize::from(self.length) - HEADER_LEN
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let [hi, lo] = self.length.to_be_bytes();
        [self.version, self.msg_type, hi, lo]
    }
}

/// One complete frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FpmFrame {
    pub header: FpmHeader,
    pub payload: Vec<u8>,
}

impl FpmFrame {
    pub fn new(msg_type: u8, payload: Vec<u8>) -> Result<Self> {
        let length = u16::try_from(payload.len() + HEADER_LEN)
            .map_err(|_| Error::protocol(format!("payload of {} bytes too large", payload.len())))?;
        Ok(Self {
            header: FpmHeader {
                version: FPM_VERSION,
                msg_type,
                length,
            },
            payload,
        })
    }

    pub fn msg_type(&self) -> u8 {
        self.header.msg_type
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.header.to_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Read the next frame
///
/// Returns `Ok(None)` on a clean end of stream between frames. A stream
/// ending inside a frame is a protocol error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<FpmFrame>>
where
    R: AsyncRead + Unpin,
{
    read_frame_with_timeout(reader, None).await
}

/// Like [`read_frame`], bounding the time between the first byte of a frame
/// and its last
///
/// Idle time between frames is never bounded.
pub async fn read_frame_with_timeout<R>(
    reader: &mut R,
    timeout: Option<Duration>,
) -> Result<Option<FpmFrame>>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_LEN];
    let first = reader.read(&mut raw).await?;
    if first == 0 {
        return Ok(None);
    }

    let rest = read_rest(reader, raw, first);
    match timeout {
        Some(limit) => tokio::time::timeout(limit, rest)
            .await
            .map_err(|_| Error::protocol(format!("partial frame stalled for {:?}", limit)))?
            .map(Some),
        None => rest.await.map(Some),
    }
}

async fn read_rest<R>(reader: &mut R, mut raw: [u8; HEADER_LEN], mut filled: usize) -> Result<FpmFrame>
where
    R: AsyncRead + Unpin,
{
    while filled < HEADER_LEN {
        let n = reader.read(&mut raw[filled..]).await?;
        if n == 0 {
            return Err(Error::protocol(format!(
                "truncated header: {} of {} bytes",
                filled, HEADER_LEN
            )));
        }
        filled += n;
    }

    let header = FpmHeader::parse(raw)?;
    let mut payload = vec![0u8; header.payload_len()];
    reader.read_exact(&mut payload).await.map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => Error::protocol(format!(
            "truncated frame: expected {} payload bytes",
            header.payload_len()
        )),
        _ => Error::Io(e),
    })?;

    Ok(FpmFrame { header, payload })
}
