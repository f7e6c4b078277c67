//! The framed object stream: byte stream ↔ JSON values with a pluggable
//! framing codec.
//!
//! A connection picks one codec at construction and keeps it for its whole
//! lifetime. The read and write halves are independent so one task can read
//! while another writes.

use std::io;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};

/// The framing policy delimiting successive JSON values on a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectCodec {
    /// Raw JSON values back to back, newline-terminated on write.
    Plain,
    /// `Content-Length: N\r\n\r\n` header framing. Header lines must end
    /// with `\r\n`; other headers such as `Content-Type` are accepted and
    /// ignored.
    VSCode,
    /// An unsigned LEB128 length prefix, then exactly that many bytes.
    Varint,
}

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub(crate) fn invalid_data(
    error: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, error)
}

macro_rules! invalid_data_fmt {
    ($($tt:tt)*) => ($crate::codec::invalid_data(format!($($tt)*)))
}

/// The read half of a framed object stream.
pub struct FramedReader {
    reader: BufReader<BoxReader>,
    codec: ObjectCodec,
    /// Bytes read but not yet consumed by the plain codec.
    spill: Vec<u8>,
}

impl FramedReader {
    /// Wraps a byte reader with the given codec.
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static, codec: ObjectCodec) -> Self {
        FramedReader {
            reader: BufReader::new(Box::new(reader) as BoxReader),
            codec,
            spill: Vec::new(),
        }
    }

    /// Reads the next JSON value from the stream.
    ///
    /// Returns `Ok(None)` on a clean end of stream; malformed framing is an
    /// error and fatal to the read side.
    pub async fn read_object<T: DeserializeOwned>(&mut self) -> io::Result<Option<T>> {
        match self.codec {
            ObjectCodec::Plain => self.read_plain().await,
            ObjectCodec::VSCode => self.read_vscode().await,
            ObjectCodec::Varint => self.read_varint().await,
        }
    }

    async fn read_plain<T: DeserializeOwned>(&mut self) -> io::Result<Option<T>> {
        loop {
            if !self.spill.is_empty() {
                let parsed = {
                    let mut values = serde_json::Deserializer::from_slice(&self.spill)
                        .into_iter::<T>();
                    match values.next() {
                        Some(Ok(value)) => Some((value, values.byte_offset())),
                        // a partial value, read more
                        Some(Err(err)) if err.is_eof() => None,
                        Some(Err(err)) => return Err(invalid_data(err)),
                        None => None,
                    }
                };
                if let Some((value, consumed)) = parsed {
                    log::debug!("< {}", String::from_utf8_lossy(&self.spill[..consumed]));
                    self.spill.drain(..consumed);
                    return Ok(Some(value));
                }
            }

            let mut chunk = [0u8; 4096];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                if self.spill.iter().all(|b| b.is_ascii_whitespace()) {
                    return Ok(None);
                }
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            self.spill.extend_from_slice(&chunk[..n]);
        }
    }

    async fn read_vscode<T: DeserializeOwned>(&mut self) -> io::Result<Option<T>> {
        let mut size = None;
        let mut line = Vec::new();
        let mut first = true;
        loop {
            line.clear();
            let n = self.reader.read_until(b'\r', &mut line).await?;
            if n == 0 {
                if first {
                    return Ok(None);
                }
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            first = false;
            if line.last() != Some(&b'\r') {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            if self.reader.read_u8().await? != b'\n' {
                return Err(invalid_data_fmt!("line endings must be \\r\\n"));
            }
            if line.len() == 1 {
                break;
            }
            let header =
                std::str::from_utf8(&line[..line.len() - 1]).map_err(invalid_data)?;
            if let Some(value) = header.strip_prefix("Content-Length: ") {
                size = Some(value.parse::<usize>().map_err(invalid_data)?);
            }
        }
        let size = size.ok_or_else(|| invalid_data_fmt!("no Content-Length header"))?;

        let mut payload = vec![0u8; size];
        self.reader.read_exact(&mut payload).await?;
        log::debug!("< {}", String::from_utf8_lossy(&payload));
        serde_json::from_slice(&payload).map(Some).map_err(invalid_data)
    }

    async fn read_varint<T: DeserializeOwned>(&mut self) -> io::Result<Option<T>> {
        let mut size: u64 = 0;
        let mut shift = 0u32;
        let mut first = true;
        loop {
            let byte = match self.reader.read_u8().await {
                Ok(byte) => byte,
                // end of stream between frames is a clean close
                Err(err) if first && err.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(err) => return Err(err),
            };
            first = false;
            size |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift >= 64 {
                return Err(invalid_data_fmt!("varint length overflows"));
            }
        }

        let mut payload = vec![0u8; size as usize];
        self.reader.read_exact(&mut payload).await?;
        log::debug!("< {}", String::from_utf8_lossy(&payload));
        serde_json::from_slice(&payload).map(Some).map_err(invalid_data)
    }
}

/// The write half of a framed object stream.
pub struct FramedWriter {
    writer: BufWriter<BoxWriter>,
    codec: ObjectCodec,
}

impl FramedWriter {
    /// Wraps a byte writer with the given codec.
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static, codec: ObjectCodec) -> Self {
        FramedWriter {
            writer: BufWriter::new(Box::new(writer) as BoxWriter),
            codec,
        }
    }

    /// Serializes and writes one JSON value, framed per the codec, and
    /// flushes.
    pub async fn write_object<T: Serialize + ?Sized>(&mut self, obj: &T) -> io::Result<()> {
        let payload = serde_json::to_vec(obj).map_err(invalid_data)?;
        log::debug!("> {}", String::from_utf8_lossy(&payload));
        match self.codec {
            ObjectCodec::Plain => {
                self.writer.write_all(&payload).await?;
                self.writer.write_all(b"\n").await?;
            }
            ObjectCodec::VSCode => {
                let header = format!("Content-Length: {}\r\n\r\n", payload.len());
                self.writer.write_all(header.as_bytes()).await?;
                self.writer.write_all(&payload).await?;
            }
            ObjectCodec::Varint => {
                let mut prefix = [0u8; 10];
                let n = encode_varint(payload.len() as u64, &mut prefix);
                self.writer.write_all(&prefix[..n]).await?;
                self.writer.write_all(&payload).await?;
            }
        }
        self.writer.flush().await
    }

    /// Flushes and shuts the write side down.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

fn encode_varint(mut value: u64, buf: &mut [u8; 10]) -> usize {
    let mut n = 0;
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf[n] = byte;
        n += 1;
        if value == 0 {
            return n;
        }
    }
}

/// A framed object stream over a bidirectional byte channel.
pub struct FramedStream {
    reader: FramedReader,
    writer: FramedWriter,
}

impl FramedStream {
    /// Splits a duplex byte channel and frames it with the given codec.
    pub fn new(io: impl AsyncRead + AsyncWrite + Send + 'static, codec: ObjectCodec) -> Self {
        let (reader, writer) = tokio::io::split(io);
        FramedStream::from_parts(reader, writer, codec)
    }

    /// A stream of raw JSON values without framing bytes.
    pub fn plain(io: impl AsyncRead + AsyncWrite + Send + 'static) -> Self {
        FramedStream::new(io, ObjectCodec::Plain)
    }

    /// A stream with `Content-Length` header framing.
    pub fn vscode(io: impl AsyncRead + AsyncWrite + Send + 'static) -> Self {
        FramedStream::new(io, ObjectCodec::VSCode)
    }

    /// A stream with varint length-prefix framing.
    pub fn varint(io: impl AsyncRead + AsyncWrite + Send + 'static) -> Self {
        FramedStream::new(io, ObjectCodec::Varint)
    }

    /// Frames separately owned read and write halves.
    pub fn from_parts(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        codec: ObjectCodec,
    ) -> Self {
        FramedStream {
            reader: FramedReader::new(reader, codec),
            writer: FramedWriter::new(writer, codec),
        }
    }

    /// Reads the next JSON value; `Ok(None)` on a clean end of stream.
    pub async fn read_object<T: DeserializeOwned>(&mut self) -> io::Result<Option<T>> {
        self.reader.read_object().await
    }

    /// Serializes and writes one JSON value.
    pub async fn write_object<T: Serialize + ?Sized>(&mut self, obj: &T) -> io::Result<()> {
        self.writer.write_object(obj).await
    }

    /// Shuts the write side down.
    pub async fn close(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }

    /// Splits into independently usable read and write halves.
    pub fn into_split(self) -> (FramedReader, FramedWriter) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn plain_round_trip() {
        let (a, b) = tokio::io::duplex(4096);
        let mut a = FramedStream::plain(a);
        let mut b = FramedStream::plain(b);

        a.write_object("test").await.unwrap();
        let read: Option<String> = b.read_object().await.unwrap();
        assert_eq!(read.as_deref(), Some("test"));
    }

    #[tokio::test]
    async fn plain_back_to_back_values() {
        let (a, b) = tokio::io::duplex(4096);
        let mut a = FramedStream::plain(a);
        let mut b = FramedStream::plain(b);

        a.write_object(&1u32).await.unwrap();
        a.write_object(&2u32).await.unwrap();
        assert_eq!(b.read_object::<u32>().await.unwrap(), Some(1));
        assert_eq!(b.read_object::<u32>().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn vscode_round_trip() {
        let (a, b) = tokio::io::duplex(4096);
        let mut a = FramedStream::vscode(a);
        let mut b = FramedStream::vscode(b);

        a.write_object("test").await.unwrap();
        let read: Option<String> = b.read_object().await.unwrap();
        assert_eq!(read.as_deref(), Some("test"));
    }

    #[tokio::test]
    async fn vscode_ignores_content_type_header() {
        let (mut a, b) = tokio::io::duplex(4096);
        let mut b = FramedStream::vscode(b);

        a.write_all(
            b"Content-Length: 6\r\nContent-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n\"abcd\"",
        )
        .await
        .unwrap();
        let read: Option<String> = b.read_object().await.unwrap();
        assert_eq!(read.as_deref(), Some("abcd"));
    }

    #[tokio::test]
    async fn vscode_rejects_bad_line_endings() {
        let (mut a, b) = tokio::io::duplex(4096);
        let mut b = FramedStream::vscode(b);

        a.write_all(b"Content-Length: 6\r\r\n\"abcd\"").await.unwrap();
        let err = b.read_object::<String>().await.unwrap_err();
        assert!(err.to_string().contains("line endings must be"));
    }

    #[tokio::test]
    async fn vscode_requires_content_length() {
        let (mut a, b) = tokio::io::duplex(4096);
        let mut b = FramedStream::vscode(b);

        a.write_all(b"Content-Type: application/json\r\n\r\n").await.unwrap();
        let err = b.read_object::<String>().await.unwrap_err();
        assert!(err.to_string().contains("no Content-Length"));
    }

    #[tokio::test]
    async fn varint_round_trip() {
        let (a, b) = tokio::io::duplex(8192);
        let mut a = FramedStream::varint(a);
        let mut b = FramedStream::varint(b);

        // long enough for a multi-byte length prefix
        let value = "x".repeat(300);
        a.write_object(&value).await.unwrap();
        let read: Option<String> = b.read_object().await.unwrap();
        assert_eq!(read, Some(value));
    }

    #[tokio::test]
    async fn read_after_peer_close_is_clean_eof() {
        for codec in [ObjectCodec::Plain, ObjectCodec::VSCode, ObjectCodec::Varint] {
            let (a, b) = tokio::io::duplex(4096);
            let mut b = FramedStream::new(b, codec);
            drop(a);
            assert!(b.read_object::<String>().await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn write_after_peer_close_fails() {
        let (a, b) = tokio::io::duplex(4096);
        let mut a = FramedStream::plain(a);
        drop(b);
        assert!(a.write_object("test").await.is_err());
    }

    #[test]
    fn varint_encoding() {
        let mut buf = [0u8; 10];
        assert_eq!(encode_varint(0, &mut buf), 1);
        assert_eq!(buf[0], 0);
        assert_eq!(encode_varint(300, &mut buf), 2);
        assert_eq!(&buf[..2], &[0xac, 0x02]);
    }
}
