use std::convert::TryFrom;

use byteorder::{BigEndian, ByteOrder};
use num_enum::TryFromPrimitive;
use thiserror::Error;

use super::{FILENAME_LEN, SECTION_ALIGN};

/// Section table validation errors
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Unknown section magic {:#010x} at offset {:#x}", _1, _0)]
    UnknownSectionMagic(usize, u32),
    #[error(
        "Section at offset {:#x} declares {} bytes which runs past the end of the image",
        _0,
        _1
    )]
    TruncatedSection(usize, usize),
    #[error(
        "File section at offset {:#x} declares {} bytes which cannot hold a filename",
        _0,
        _1
    )]
    FileHeaderTooShort(usize, usize),
}

/// Identifies what a section holds.
///
/// Every valid magic satisfies `magic & 0xfffff00f == 0x55aaf00f`; anything
/// else that is not the end-of-table sentinel means the EEPROM is corrupted.
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[repr(u32)]
pub enum SectionKind {
    /// Opaque data region. The bootcode occupies the first one in the image.
    Data = 0x55aa_f00f,
    /// A named modifiable file such as the boot configuration
    File = 0x55aa_f30f,
    /// Free space that future parses skip over
    Padding = 0x55aa_feef,
}

/// A single tagged, length-prefixed region inside an EEPROM image
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Section {
    pub kind: SectionKind,
    /// Absolute byte offset of the section header within the image
    pub offset: usize,
    /// The declared length stored in the header. For file sections this
    /// covers the filename field and the payload; for the bootcode section it
    /// is the payload alone.
    pub length: usize,
    /// The decoded filename, only present for file sections
    pub filename: Option<String>,
}

impl Section {
    /// Returns the payload length of a file section, excluding the filename
    /// field counted by `length`
    pub fn file_payload_len(&self) -> usize {
        self.length.saturating_sub(FILENAME_LEN)
    }
}

/// Rounds `offset` up to the next section boundary
pub(crate) fn align(offset: usize) -> usize {
    (offset + SECTION_ALIGN - 1) & !(SECTION_ALIGN - 1)
}

/// Decodes the fixed-width filename field, stripping the trailing fill bytes
fn decode_filename(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());

    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Walks `bytes` from offset 0 and builds the ordered section table.
///
/// The walk stops at the first zeroed or erased tag, and fails with
/// `ParseError` if a tag outside the known set is found or a section runs
/// past the end of the buffer.
pub(crate) fn parse_sections(bytes: &[u8]) -> Result<Vec<Section>, ParseError> {
    let mut sections = Vec::new();
    let mut offset = 0;

    while offset + 8 <= bytes.len() {
        // Read the section magic
        let magic = BigEndian::read_u32(&bytes[offset..]);

        // A zeroed or erased tag marks the end of the section table
        if magic == 0 || magic == 0xffff_ffff {
            break;
        }

        let kind = SectionKind::try_from(magic)
            .map_err(|_| ParseError::UnknownSectionMagic(offset, magic))?;

        // Read the declared length and bounds-check it before touching the
        // payload
        let length = BigEndian::read_u32(&bytes[offset + 4..]) as usize;

        if offset + 8 + length > bytes.len() {
            return Err(ParseError::TruncatedSection(offset, length));
        }

        // Decode the filename field for file sections
        let filename = if kind == SectionKind::File {
            if length < FILENAME_LEN {
                return Err(ParseError::FileHeaderTooShort(offset, length));
            }

            Some(decode_filename(&bytes[offset + 8..offset + 8 + FILENAME_LEN]))
        } else {
            None
        };

        sections.push(Section {
            kind,
            offset,
            length,
            filename,
        });

        // Advance past the header and payload to the next section boundary
        offset = align(offset + 8 + length);
    }

    Ok(sections)
}

#[cfg(test)]
mod tests {
    use byteorder::{BigEndian, ByteOrder};

    use super::*;

    /// Appends a section header (and filename, when given) followed by
    /// `payload`, padding the buffer to the section alignment
    fn push_section(buf: &mut Vec<u8>, magic: u32, length: u32, filename: Option<&str>, payload: &[u8]) {
        let mut hdr = [0u8; 8];

        BigEndian::write_u32(&mut hdr[0..], magic);
        BigEndian::write_u32(&mut hdr[4..], length);
        buf.extend_from_slice(&hdr);

        if let Some(name) = filename {
            let mut field = [0u8; FILENAME_LEN];
            field[..name.len()].copy_from_slice(name.as_bytes());
            buf.extend_from_slice(&field);
        }

        buf.extend_from_slice(payload);

        while buf.len() % SECTION_ALIGN != 0 {
            buf.push(0xff);
        }
    }

    #[test]
    fn it_should_parse_a_section_table() {
        let mut buf = Vec::new();

        push_section(&mut buf, SectionKind::Data as u32, 16, None, &[0xaa; 16]);
        push_section(&mut buf, SectionKind::File as u32, 12 + 5, Some("a.txt"), b"hello");
        push_section(&mut buf, SectionKind::Padding as u32, 8, None, &[0xff; 8]);
        buf.extend_from_slice(&[0u8; 16]);

        let sections = parse_sections(&buf).unwrap();

        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].kind, SectionKind::Data);
        assert_eq!(sections[0].offset, 0);
        assert_eq!(sections[0].length, 16);
        assert_eq!(sections[1].kind, SectionKind::File);
        assert_eq!(sections[1].offset, 24);
        assert_eq!(sections[1].filename.as_deref(), Some("a.txt"));
        assert_eq!(sections[1].file_payload_len(), 5);
        assert_eq!(sections[2].kind, SectionKind::Padding);
    }

    #[test]
    fn it_should_stop_at_an_erased_tag() {
        let mut buf = Vec::new();

        push_section(&mut buf, SectionKind::Data as u32, 8, None, &[0xaa; 8]);
        buf.extend_from_slice(&[0xff; 32]);

        let sections = parse_sections(&buf).unwrap();

        assert_eq!(sections.len(), 1);
    }

    #[test]
    fn it_should_fail_on_an_unknown_magic() {
        let mut buf = Vec::new();

        push_section(&mut buf, SectionKind::Data as u32, 8, None, &[0xaa; 8]);
        push_section(&mut buf, 0x55aa_f10f, 8, None, &[0xbb; 8]);

        match parse_sections(&buf) {
            Err(ParseError::UnknownSectionMagic(offset, magic)) => {
                assert_eq!(offset, 16);
                assert_eq!(magic, 0x55aa_f10f);
            }
            other => panic!("expected UnknownSectionMagic, got {:?}", other),
        }
    }

    #[test]
    fn it_should_fail_on_a_truncated_section() {
        let mut buf = Vec::new();

        push_section(&mut buf, SectionKind::Data as u32, 8, None, &[0xaa; 8]);

        // Overwrite the length with one that runs past the buffer end
        BigEndian::write_u32(&mut buf[4..], 4096);

        assert!(matches!(
            parse_sections(&buf),
            Err(ParseError::TruncatedSection(0, 4096))
        ));
    }

    #[test]
    fn it_should_strip_filename_fill_bytes() {
        let mut buf = Vec::new();

        push_section(&mut buf, SectionKind::File as u32, 12 + 4, Some("conf"), b"data");

        let sections = parse_sections(&buf).unwrap();

        assert_eq!(sections[0].filename.as_deref(), Some("conf"));
    }
}
