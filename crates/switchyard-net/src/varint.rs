//! Unsigned LEB128 varints, as used by multistream-select and mplex

use bytes::BufMut;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest encoding of a u64
pub const MAX_LEN: usize = 10;

/// Append `value` to `dst`
pub fn encode(mut value: u64, dst: &mut impl BufMut) {
    while value >= 0x80 {
        dst.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// Decode from the front of `src`
///
/// Returns `Ok(None)` when `src` holds an incomplete varint, otherwise the
/// value and the number of bytes consumed.
pub fn decode(src: &[u8]) -> io::Result<Option<(u64, usize)>> {
    let mut value = 0u64;
    for (i, byte) in src.iter().enumerate() {
        if i >= MAX_LEN {
            return Err(overflow());
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if src.len() >= MAX_LEN {
        return Err(overflow());
    }
    Ok(None)
}

/// Read one varint a byte at a time, so nothing past it is consumed
pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<u64> {
    let mut value = 0u64;
    for i in 0..MAX_LEN {
        let byte = reader.read_u8().await?;
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(overflow())
}

fn overflow() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "varint overflow")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_known_encodings() {
        let mut buf = BytesMut::new();
        encode(1, &mut buf);
        encode(300, &mut buf);
        assert_eq!(&buf[..], &[0x01, 0xac, 0x02]);

        assert_eq!(decode(&buf).unwrap(), Some((1, 1)));
        assert_eq!(decode(&buf[1..]).unwrap(), Some((300, 2)));
    }

    #[test]
    fn test_incomplete_and_overflow() {
        assert_eq!(decode(&[0x80]).unwrap(), None);
        assert_eq!(decode(&[]).unwrap(), None);
        assert!(decode(&[0xff; 11]).is_err());
    }

    #[tokio::test]
    async fn test_async_read_stops_at_varint() {
        let data = [0xac, 0x02, 0x42];
        let mut reader = &data[..];
        assert_eq!(read(&mut reader).await.unwrap(), 300);
        assert_eq!(reader, &[0x42]);
    }
}
