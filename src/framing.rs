//! Datagram layout of the file channel.
//!
//! Every datagram is exactly [`DATAGRAM_SIZE`] bytes:
//!
//! - header: `DD-FILETRANSFER <version> <name> <directory> <size> <sha256-hex>`,
//!   NUL padded. Whitespace and `%` inside name/directory are percent-escaped.
//! - chunk: `u32 LE sequence`, `u32 LE payload length`, payload, zero padded.
//! - footer: `DD-FILETRANSFER-END`, NUL padded.

pub const DATAGRAM_SIZE: usize = 1200;
pub const CHUNK_HEADER_LEN: usize = 8;
pub const CHUNK_CAPACITY: usize = DATAGRAM_SIZE - CHUNK_HEADER_LEN;

pub const HEADER_TAG: &str = "DD-FILETRANSFER";
pub const FOOTER_TAG: &str = "DD-FILETRANSFER-END";
pub const FORMAT_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub name: String,
    pub directory: String,
    pub size: u64,
    pub hash_hex: String,
}

pub fn encode_header(header: &FileHeader) -> Vec<u8> {
    let directory = if header.directory.is_empty() {
        ".".to_string()
    } else {
        escape_field(&header.directory)
    };
    let text = format!(
        "{} {} {} {} {} {}",
        HEADER_TAG,
        FORMAT_VERSION,
        escape_field(&header.name),
        directory,
        header.size,
        header.hash_hex
    );
    padded(text.as_bytes())
}

pub fn decode_header(buf: &[u8]) -> Option<FileHeader> {
    let text = std::str::from_utf8(trim_padding(buf)).ok()?;
    let mut fields = text.split(' ');
    if fields.next()? != HEADER_TAG {
        return None;
    }
    let _version: u32 = fields.next()?.parse().ok()?;
    let name = unescape_field(fields.next()?);
    let directory = unescape_field(fields.next()?);
    let size = fields.next()?.parse().ok()?;
    let hash_hex = fields.next()?.to_string();
    Some(FileHeader {
        name,
        directory,
        size,
        hash_hex,
    })
}

pub fn encode_chunk(sequence: u32, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= CHUNK_CAPACITY);
    let len = payload.len().min(CHUNK_CAPACITY);
    let mut buf = vec![0u8; DATAGRAM_SIZE];
    buf[0..4].copy_from_slice(&sequence.to_le_bytes());
    buf[4..8].copy_from_slice(&(len as u32).to_le_bytes());
    buf[CHUNK_HEADER_LEN..CHUNK_HEADER_LEN + len].copy_from_slice(&payload[..len]);
    buf
}

pub fn decode_chunk(buf: &[u8]) -> Option<(u32, &[u8])> {
    if buf.len() < CHUNK_HEADER_LEN {
        return None;
    }
    let sequence = u32::from_le_bytes(buf[0..4].try_into().ok()?);
    let len = u32::from_le_bytes(buf[4..8].try_into().ok()?) as usize;
    if len > CHUNK_CAPACITY || CHUNK_HEADER_LEN + len > buf.len() {
        return None;
    }
    Some((sequence, &buf[CHUNK_HEADER_LEN..CHUNK_HEADER_LEN + len]))
}

pub fn encode_footer() -> Vec<u8> {
    padded(FOOTER_TAG.as_bytes())
}

pub fn is_footer(buf: &[u8]) -> bool {
    trim_padding(buf) == FOOTER_TAG.as_bytes()
}

/// Number of chunk datagrams for a body of `size` bytes.
pub fn chunk_count(size: u64) -> u64 {
    size.div_ceil(CHUNK_CAPACITY as u64)
}

fn padded(bytes: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; DATAGRAM_SIZE];
    let len = bytes.len().min(DATAGRAM_SIZE);
    buf[..len].copy_from_slice(&bytes[..len]);
    buf
}

fn trim_padding(buf: &[u8]) -> &[u8] {
    let end = buf.iter().rposition(|b| *b != 0).map_or(0, |pos| pos + 1);
    &buf[..end]
}

fn escape_field(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '%' => out.push_str("%25"),
            c if c.is_whitespace() => {
                let mut utf8 = [0u8; 4];
                for b in c.encode_utf8(&mut utf8).bytes() {
                    out.push_str(&format!("%{b:02X}"));
                }
            }
            c => out.push(c),
        }
    }
    out
}

fn unescape_field(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_datagram_is_fixed_size() {
        let header = FileHeader {
            name: "a.txt".to_string(),
            directory: "sub".to_string(),
            size: 10,
            hash_hex: "00".repeat(32),
        };
        assert_eq!(encode_header(&header).len(), DATAGRAM_SIZE);
        assert_eq!(encode_chunk(0, b"hello").len(), DATAGRAM_SIZE);
        assert_eq!(encode_chunk(3, &[7u8; CHUNK_CAPACITY]).len(), DATAGRAM_SIZE);
        assert_eq!(encode_footer().len(), DATAGRAM_SIZE);
    }

    #[test]
    fn chunk_prefix_is_little_endian() {
        let buf = encode_chunk(0x0102_0304, b"xyz");
        assert_eq!(&buf[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&buf[4..8], &[3, 0, 0, 0]);
        assert_eq!(&buf[8..11], b"xyz");
        assert!(buf[11..].iter().all(|b| *b == 0));
        assert_eq!(decode_chunk(&buf), Some((0x0102_0304, &b"xyz"[..])));
    }

    #[test]
    fn header_escapes_whitespace_in_names() {
        let header = FileHeader {
            name: "monthly report 100%.pdf".to_string(),
            directory: "reports/2026 q1".to_string(),
            size: 5000,
            hash_hex: "ab".repeat(32),
        };
        let buf = encode_header(&header);
        assert!(buf.starts_with(b"DD-FILETRANSFER 2 monthly%20report%20100%25.pdf reports/2026%20q1 5000 "));
        assert_eq!(decode_header(&buf), Some(header));
    }

    #[test]
    fn root_directory_is_a_dot() {
        let header = FileHeader {
            name: "a.txt".to_string(),
            directory: String::new(),
            size: 1,
            hash_hex: "cd".repeat(32),
        };
        let decoded = decode_header(&encode_header(&header)).unwrap();
        assert_eq!(decoded.directory, ".");
    }

    #[test]
    fn footer_is_recognized_and_not_a_header() {
        let footer = encode_footer();
        assert!(is_footer(&footer));
        assert!(decode_header(&footer).is_none());
    }

    #[test]
    fn chunk_counts_round_up() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK_CAPACITY as u64), 1);
        assert_eq!(chunk_count(CHUNK_CAPACITY as u64 + 1), 2);
        assert_eq!(chunk_count(5000), 5);
    }
}
