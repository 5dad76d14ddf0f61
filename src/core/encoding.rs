// On-disk widths and big-endian field helpers shared by the store and the index.
use crate::core::error::{Error, ErrorKind};

/// Width of the payload length prefix in front of every store frame.
pub const LEN_WIDTH: u64 = 8;
/// Width of the relative offset field of an index entry.
pub const OFF_WIDTH: u64 = 4;
/// Width of the store position field of an index entry.
pub const POS_WIDTH: u64 = 8;
pub const ENT_WIDTH: u64 = OFF_WIDTH + POS_WIDTH;

/// Relative index that selects the most recently written entry.
pub const LAST_ENTRY: i64 = -1;

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize)]
pub struct IndexEntry {
    pub offset: u32,
    pub position: u64,
}

impl IndexEntry {
    pub fn new(offset: u32, position: u64) -> Self {
        Self { offset, position }
    }

    pub fn encode(&self) -> [u8; ENT_WIDTH as usize] {
        let mut buf = [0u8; ENT_WIDTH as usize];
        write_u32(&mut buf, 0, self.offset);
        write_u64(&mut buf, OFF_WIDTH as usize, self.position);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < ENT_WIDTH as usize {
            return Err(Error::new(ErrorKind::Corrupt).with_message("index entry too small"));
        }
        Ok(Self {
            offset: read_u32(buf, 0),
            position: read_u64(buf, OFF_WIDTH as usize),
        })
    }
}

pub fn frame_len(payload_len: u64) -> u64 {
    LEN_WIDTH + payload_len
}

pub fn encode_len(payload_len: u64) -> [u8; LEN_WIDTH as usize] {
    payload_len.to_be_bytes()
}

pub fn decode_len(buf: &[u8; LEN_WIDTH as usize]) -> u64 {
    u64::from_be_bytes(*buf)
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_be_bytes(out)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(out)
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::{ENT_WIDTH, IndexEntry, LEN_WIDTH, decode_len, encode_len, frame_len};
    use crate::core::error::ErrorKind;

    #[test]
    fn entry_layout_is_big_endian() {
        let entry = IndexEntry::new(1, 0x0102_0304_0506_0708);
        let buf = entry.encode();
        assert_eq!(buf.len() as u64, ENT_WIDTH);
        assert_eq!(&buf[0..4], &[0, 0, 0, 1]);
        assert_eq!(&buf[4..12], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(IndexEntry::decode(&buf).expect("decode"), entry);
    }

    #[test]
    fn short_entry_is_corrupt() {
        let err = IndexEntry::decode(&[0u8; 11]).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn length_prefix_is_big_endian() {
        let buf = encode_len(11);
        assert_eq!(buf, [0, 0, 0, 0, 0, 0, 0, 11]);
        assert_eq!(decode_len(&buf), 11);
    }

    #[test]
    fn frame_len_counts_prefix() {
        assert_eq!(frame_len(0), LEN_WIDTH);
        assert_eq!(frame_len(11), 19);
    }
}
