//! The two variable-length integer encodings used on the wire. Both share the
//! same three-tier shape (`byte | 0xFF u16 | 0xFF 0xFF 0xFF u32`) but differ in
//! what the single-byte leading range means, so keeping them as distinct
//! functions (rather than one parameterized helper) avoids ever conflating
//! them at a call site.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read};

/// MultiPacket sub-packet lengths: a leading byte of `0x01..=0xFE` is the
/// length directly. Zero-length sub-packets never occur in a MultiPacket, so
/// `0x00` is not a valid single-byte length here.
pub fn write_multi_packet_length(out: &mut Vec<u8>, length: u32) {
    if length < 0xFF {
        out.push(length as u8);
    } else if length < 0xFFFF {
        out.push(0xFF);
        out.write_u16::<BigEndian>(length as u16).expect("Vec write is infallible");
    } else {
        out.push(0xFF);
        out.push(0xFF);
        out.push(0xFF);
        out.write_u32::<BigEndian>(length).expect("Vec write is infallible");
    }
}

pub fn read_multi_packet_length(cursor: &mut Cursor<&[u8]>) -> io::Result<u32> {
    let first = cursor.read_u8()?;
    if first < 0xFF {
        Ok(first as u32)
    } else {
        let second = cursor.read_u16::<BigEndian>()?;
        if second < 0xFFFF {
            Ok(second as u32)
        } else {
            cursor.read_u32::<BigEndian>()
        }
    }
}

/// Data-bundle sub-item lengths: identical tier shape, but the leading byte's
/// direct-length range is `0x00..=0xFE` since a zero-length bundled item is
/// valid (an empty application buffer).
pub fn write_data_bundle_length(out: &mut Vec<u8>, length: u32) {
    if length < 0xFF {
        out.push(length as u8);
    } else if length < 0xFFFF {
        out.push(0xFF);
        out.write_u16::<BigEndian>(length as u16).expect("Vec write is infallible");
    } else {
        out.push(0xFF);
        out.push(0xFF);
        out.push(0xFF);
        out.write_u32::<BigEndian>(length).expect("Vec write is infallible");
    }
}

pub fn read_data_bundle_length(cursor: &mut impl Read) -> io::Result<u32> {
    let first = cursor.read_u8()?;
    if first < 0xFF {
        Ok(first as u32)
    } else {
        let second = cursor.read_u16::<BigEndian>()?;
        if second < 0xFFFF {
            Ok(second as u32)
        } else {
            cursor.read_u32::<BigEndian>()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_packet_round_trips_all_tiers() {
        for &length in &[0u32, 1, 0xFE, 0xFF, 1000, 0xFFFE, 0xFFFF, 70_000] {
            let mut buf = Vec::new();
            write_multi_packet_length(&mut buf, length);
            let mut cursor = Cursor::new(buf.as_slice());
            assert_eq!(read_multi_packet_length(&mut cursor).unwrap(), length);
        }
    }

    #[test]
    fn data_bundle_round_trips_zero_length() {
        let mut buf = Vec::new();
        write_data_bundle_length(&mut buf, 0);
        assert_eq!(buf, vec![0x00]);
        let mut cursor = Cursor::new(buf.as_slice());
        assert_eq!(read_data_bundle_length(&mut cursor).unwrap(), 0);
    }

    #[test]
    fn data_bundle_round_trips_all_tiers() {
        for &length in &[0u32, 1, 0xFE, 0xFF, 1000, 0xFFFE, 0xFFFF, 70_000] {
            let mut buf = Vec::new();
            write_data_bundle_length(&mut buf, length);
            let mut cursor = Cursor::new(buf.as_slice());
            assert_eq!(read_data_bundle_length(&mut cursor).unwrap(), length);
        }
    }
}
