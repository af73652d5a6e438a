//! TLS ClientHello inspection.
//!
//! Reads exactly one TLS handshake record from the inbound stream and
//! recovers the `server_name` extension without any cryptography. The bytes
//! consumed are returned verbatim so the caller can replay them to the
//! upstream and let the handshake continue end-to-end.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// TLS record type for handshake messages.
const RECORD_TYPE_HANDSHAKE: u8 = 22;

/// Handshake message type for ClientHello.
const HANDSHAKE_CLIENT_HELLO: u8 = 1;

/// Extension number of server_name.
const EXT_SERVER_NAME: u16 = 0;

/// Maximum TLS record payload length.
const MAX_RECORD_LEN: usize = 16384;

#[derive(Debug, Error)]
pub enum SniError {
    /// The first bytes are not a plausible TLS handshake record.
    #[error("malformed TLS record")]
    MalformedRecord,

    /// The record does not contain a parsable ClientHello.
    #[error("malformed client hello")]
    MalformedHandshake,

    /// A well-formed ClientHello without a usable server_name entry.
    #[error("client hello carries no server name")]
    NoSni,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Read one handshake record and extract the SNI hostname.
///
/// Accepts any fragmentation of the `5 + record_len` bytes. On success the
/// returned buffer holds exactly the bytes consumed from the stream.
pub async fn read_client_hello<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<(String, Vec<u8>), SniError> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;

    let record_len = record_len(&header)?;
    let mut buf = vec![0u8; 5 + record_len];
    buf[..5].copy_from_slice(&header);
    stream.read_exact(&mut buf[5..]).await?;

    let host = parse_server_name(&buf[5..])?;
    Ok((host, buf))
}

/// Validate a TLS record header and return the payload length.
fn record_len(header: &[u8; 5]) -> Result<usize, SniError> {
    if header[0] != RECORD_TYPE_HANDSHAKE {
        return Err(SniError::MalformedRecord);
    }
    // Record-layer version 3.1 through 3.x; SSLv3 and below are rejected.
    if header[1] != 3 || header[2] < 1 {
        return Err(SniError::MalformedRecord);
    }
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if len == 0 || len > MAX_RECORD_LEN {
        return Err(SniError::MalformedRecord);
    }
    Ok(len)
}

/// Byte cursor over the handshake message.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SniError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(SniError::MalformedHandshake)?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, SniError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, SniError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// A length-prefixed vector with a 1-byte length.
    fn vec8(&mut self) -> Result<&'a [u8], SniError> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    /// A length-prefixed vector with a 2-byte length.
    fn vec16(&mut self) -> Result<&'a [u8], SniError> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

/// Extract the SNI hostname from a handshake message (record header already
/// stripped). Pure over the buffer; the first `host_name` entry wins and is
/// normalized to lowercase.
pub fn parse_server_name(handshake: &[u8]) -> Result<String, SniError> {
    let mut cur = Cursor::new(handshake);

    if cur.u8()? != HANDSHAKE_CLIENT_HELLO {
        return Err(SniError::MalformedHandshake);
    }
    cur.take(3)?; // handshake length
    cur.take(2)?; // legacy_version
    cur.take(32)?; // random
    cur.vec8()?; // session_id
    cur.vec16()?; // cipher_suites
    cur.vec8()?; // compression_methods

    if cur.is_empty() {
        // ClientHello without extensions.
        return Err(SniError::NoSni);
    }

    let extensions = cur.vec16()?;
    let mut exts = Cursor::new(extensions);
    while !exts.is_empty() {
        let ext_type = exts.u16()?;
        let ext_data = exts.vec16()?;
        if ext_type != EXT_SERVER_NAME {
            continue;
        }

        let mut names = Cursor::new(ext_data);
        let name_list = names.vec16()?;
        let mut entries = Cursor::new(name_list);
        while !entries.is_empty() {
            let name_type = entries.u8()?;
            let name = entries.vec16()?;
            if name_type != 0 {
                continue;
            }
            if name.is_empty() {
                return Err(SniError::NoSni);
            }
            let host = std::str::from_utf8(name).map_err(|_| SniError::MalformedHandshake)?;
            return Ok(host.to_lowercase());
        }
        return Err(SniError::NoSni);
    }

    Err(SniError::NoSni)
}
