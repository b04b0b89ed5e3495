use crate::envelope::{EnvelopeKind, NetworkEnvelope};
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt::{Debug, Formatter};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: u8 = 1;

const LEN_PREFIX_LEN: usize = std::mem::size_of::<u32>();
const HEADER_LEN: usize = 1 + 1 + std::mem::size_of::<u64>();

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub u64);

impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CHK:{:016X}", self.0)
    }
}

impl Checksum {
    pub fn new(data: &[u8]) -> Checksum {
        let crc = crc::Crc::<u64>::new(&crc::CRC_64_REDIS);
        let mut digest = crc.digest();
        digest.update(data);
        Checksum(digest.finalize())
    }
}

/// Encodes an envelope as a complete frame including the length prefix
pub fn encode_frame(envelope: &NetworkEnvelope, max_frame_size: usize) -> anyhow::Result<BytesMut> {
    let mut body = BytesMut::new();
    envelope.ser_body(&mut body);

    let frame_len = HEADER_LEN + body.len();
    if frame_len > max_frame_size {
        bail!("{:?} envelope of {} bytes exceeds the configured maximum frame size of {}", envelope.kind(), frame_len, max_frame_size);
    }
    let frame_len_u32: u32 = frame_len.try_into()?;

    let mut buf = BytesMut::with_capacity(LEN_PREFIX_LEN + frame_len);
    buf.put_u32(frame_len_u32);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(envelope.kind().into());
    buf.put_u64(Checksum::new(&body).0);
    buf.put_slice(&body);
    Ok(buf)
}

/// Decodes a frame *without* its length prefix
pub fn decode_frame(mut frame: &[u8]) -> anyhow::Result<NetworkEnvelope> {
    let version = frame.try_get_u8()?;
    if version != PROTOCOL_VERSION {
        bail!("unsupported protocol version {}", version);
    }

    let raw_kind = frame.try_get_u8()?;
    let kind = EnvelopeKind::try_from(raw_kind)
        .map_err(|_| anyhow!("invalid envelope kind discriminator {}", raw_kind))?;

    let checksum = Checksum(frame.try_get_u64()?);
    let actual = Checksum::new(frame);
    if checksum != actual {
        bail!("checksum mismatch: frame has {:?}, body has {:?}", checksum, actual);
    }

    NetworkEnvelope::try_deser_body(kind, &mut frame)
}

/// Reads the next frame, returning `None` if the stream ends cleanly at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_frame_size: usize) -> anyhow::Result<Option<BytesMut>> {
    let mut len_buf = [0u8; LEN_PREFIX_LEN];
    if reader.read(&mut len_buf[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut len_buf[1..]).await?;

    let frame_len = u32::from_be_bytes(len_buf) as usize;
    if frame_len > max_frame_size {
        bail!("received a frame that was longer than the configured maximum ({}) - closing connection because it is apparently compromised", frame_len);
    }
    if frame_len < HEADER_LEN {
        bail!("received a frame of {} bytes which is shorter than the frame header", frame_len);
    }

    let mut frame = BytesMut::zeroed(frame_len);
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
