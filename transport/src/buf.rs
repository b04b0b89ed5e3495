use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let raw = try_get_bytes(buf)?;
    let s = String::from_utf8(raw.to_vec())?;
    Ok(s)
}

pub fn put_bytes(buf: &mut impl BufMut, data: &[u8]) {
    buf.put_usize_varint(data.len());
    buf.put_slice(data);
}

pub fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = try_get_len(buf)?;
    if buf.remaining() < len {
        bail!("length prefix {} exceeds remaining buffer of {} bytes", len, buf.remaining());
    }
    Ok(buf.copy_to_bytes(len))
}

pub fn try_get_len(buf: &mut impl Buf) -> anyhow::Result<usize> {
    buf.try_get_usize_varint()
        .map_err(|e| anyhow!("invalid length prefix: {:?}", e))
}

pub fn put_optional_string(buf: &mut impl BufMut, s: Option<&str>) {
    match s {
        None => buf.put_u8(0),
        Some(s) => {
            buf.put_u8(1);
            put_string(buf, s);
        }
    }
}

pub fn try_get_optional_string(buf: &mut impl Buf) -> anyhow::Result<Option<String>> {
    match buf.try_get_u8()? {
        0 => Ok(None),
        1 => Ok(Some(try_get_string(buf)?)),
        n => Err(anyhow!("invalid option marker {}", n)),
    }
}

pub fn put_bool(buf: &mut impl BufMut, value: bool) {
    buf.put_u8(if value { 1 } else { 0 });
}

pub fn try_get_bool(buf: &mut impl Buf) -> anyhow::Result<bool> {
    match buf.try_get_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        n => Err(anyhow!("invalid boolean {}", n)),
    }
}
