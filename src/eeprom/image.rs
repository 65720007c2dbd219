use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};
use thiserror::Error;

use super::section::{align, parse_sections, ParseError, Section, SectionKind};
use super::{
    BOOTCODE_FILENAME, BOOTCODE_MIN_SIZE, ERASE_BLOCK_SIZE, FILENAME_LEN, FILE_HDR_LEN, FILL_BYTE,
    IMAGE_SIZE, MAX_FILE_SIZE,
};

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("The image is {} bytes - expected {} or {}", _0, IMAGE_SIZE, IMAGE_SIZE * 4)]
    InvalidImageSize(usize),

    #[error("EEPROM is corrupted: {}", _0)]
    Parse(#[from] ParseError),

    #[error("{} was not found in the EEPROM", _0)]
    FileNotFound(String),

    #[error("The file is {} bytes which exceeds the {} byte limit", _0, MAX_FILE_SIZE)]
    FileTooBig(usize),

    #[error("Not enough space for {} bytes - {} bytes available before the next section", _0, _1)]
    InsufficientSpace(usize, usize),

    #[error("Writing {} bytes at offset {:#x} would cross into the reserved trailer", _0, _1)]
    TrailerOverlap(usize, usize),

    #[error("The bootcode region ends at {:#x} but the boot ROM requires {:#x}", _0, BOOTCODE_MIN_SIZE)]
    BootcodeRegionTooSmall(usize),

    #[error("No section follows the bootcode region")]
    MissingNextSection,

    #[error("I/O error: {}", _0)]
    Io(#[from] io::Error),
}

/// Addresses a modifiable entry inside an EEPROM image
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FileTarget {
    /// The bootcode region stored in the very first section
    Bootcode,
    /// A named file such as the boot configuration
    Named(String),
}

impl FileTarget {
    /// Creates a target from a filename, mapping the reserved bootcode name
    /// to the bootcode region
    pub fn named<S: AsRef<str>>(name: S) -> FileTarget {
        if name.as_ref() == BOOTCODE_FILENAME {
            FileTarget::Bootcode
        } else {
            FileTarget::Named(name.as_ref().to_owned())
        }
    }
}

impl fmt::Display for FileTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileTarget::Bootcode => f.write_str(BOOTCODE_FILENAME),
            FileTarget::Named(name) => f.write_str(name),
        }
    }
}

/// The byte range occupied by a modifiable file entry
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FileRegion {
    /// Absolute offset of the section header
    pub offset: usize,
    /// The declared length stored in the header
    pub length: usize,
    /// Whether the entry is the final section in the table
    pub is_last: bool,
    /// Offset of the next non-padding section, if one exists
    pub next_section: Option<usize>,
}

/// A loaded bootloader EEPROM image.
///
/// All updates happen in place: the buffer never grows or shrinks, later
/// sections keep their offsets, and freed space is re-tagged as padding so
/// the section table stays walkable.
pub struct EepromImage {
    bytes: Vec<u8>,
}

impl EepromImage {
    /// Validates the size of `bytes` and the section table, returning the
    /// image on success, `ImageError` otherwise
    pub fn from_bytes(bytes: Vec<u8>) -> Result<EepromImage, ImageError> {
        if bytes.len() != IMAGE_SIZE && bytes.len() != IMAGE_SIZE * 4 {
            return Err(ImageError::InvalidImageSize(bytes.len()));
        }

        // Walk the table once up front so corruption is reported at load time
        // rather than halfway through an update
        let sections = parse_sections(&bytes)?;

        debug!("Loaded EEPROM image with {} sections", sections.len());

        Ok(EepromImage { bytes })
    }

    /// Reads and validates the image stored at `path`
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<EepromImage, ImageError> {
        debug!("Reading EEPROM image from {:?}", path.as_ref());

        Self::from_bytes(fs::read(path)?)
    }

    /// The raw image contents
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Writes the image to `path`
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ImageError> {
        fs::write(path, &self.bytes)?;

        Ok(())
    }

    /// Returns the ordered section table
    pub fn sections(&self) -> Result<Vec<Section>, ImageError> {
        Ok(parse_sections(&self.bytes)?)
    }

    /// Locates the entry addressed by `target`.
    ///
    /// Returns `None` when no section matches; callers treat that as a fatal
    /// "target not found" condition. `next_section` is the offset of the
    /// first non-padding section after the match and bounds how much room an
    /// update may use.
    pub fn locate(&self, target: &FileTarget) -> Result<Option<FileRegion>, ImageError> {
        let sections = self.sections()?;

        let index = match target {
            // The bootcode header is defined to be the first section
            FileTarget::Bootcode => {
                if sections.is_empty() {
                    None
                } else {
                    Some(0)
                }
            }
            FileTarget::Named(name) => sections.iter().position(|section| {
                section.kind == SectionKind::File
                    && section.filename.as_deref() == Some(name.as_str())
            }),
        };

        Ok(index.map(|index| {
            let next_section = sections[index + 1..]
                .iter()
                .find(|section| section.kind != SectionKind::Padding)
                .map(|section| section.offset);

            FileRegion {
                offset: sections[index].offset,
                length: sections[index].length,
                is_last: index == sections.len() - 1,
                next_section,
            }
        }))
    }

    /// Offset of the reserved trailer the bootloader itself may rewrite
    fn trailer_offset(&self) -> usize {
        self.bytes.len() - ERASE_BLOCK_SIZE
    }

    /// The first offset an update of `region` must not reach: the next
    /// non-padding section, or the reserved trailer when no section follows.
    /// An entry stored inside the trailer itself may use its erase block.
    fn region_bound(&self, region: &FileRegion) -> usize {
        match region.next_section {
            Some(offset) => offset,
            None if region.offset >= self.trailer_offset() => self.bytes.len(),
            None => self.trailer_offset(),
        }
    }

    /// Replaces the contents of the named file `name` with `payload`.
    ///
    /// The stored length field is recomputed to cover the filename field plus
    /// the payload, and the freed tail is re-tagged as padding so later
    /// sections keep their offsets. Nothing is written unless every
    /// precondition holds.
    pub fn update_file(&mut self, name: &str, payload: &[u8]) -> Result<(), ImageError> {
        if payload.len() > MAX_FILE_SIZE {
            return Err(ImageError::FileTooBig(payload.len()));
        }

        let target = FileTarget::Named(name.to_owned());
        let region = self
            .locate(&target)?
            .ok_or_else(|| ImageError::FileNotFound(name.to_owned()))?;

        let update_len = payload.len() + FILE_HDR_LEN;
        let trailer = self.trailer_offset();

        if region.offset < trailer && region.offset + update_len > trailer {
            return Err(ImageError::TrailerOverlap(update_len, region.offset));
        }

        let bound = self.region_bound(&region);

        if region.offset + update_len > bound {
            return Err(ImageError::InsufficientSpace(
                update_len,
                bound - region.offset,
            ));
        }

        trace!(
            "Updating {} at {:#x} with {} bytes, bound {:#x}",
            name,
            region.offset,
            payload.len(),
            bound
        );

        // The stored length covers the filename field plus the payload
        let new_len = payload.len() + FILENAME_LEN;

        BigEndian::write_u32(&mut self.bytes[region.offset + 4..], new_len as u32);
        self.bytes[region.offset + FILE_HDR_LEN..region.offset + update_len]
            .copy_from_slice(payload);

        self.repad(region.offset + 8 + new_len, bound, region.is_last);

        Ok(())
    }

    /// Replaces the bootcode payload.
    ///
    /// The bootcode region always extends up to the next section, which must
    /// exist and leave at least the minimum space the boot ROM insists on.
    /// Unlike named files, the stored length field counts the payload alone.
    pub fn update_bootcode(&mut self, payload: &[u8]) -> Result<(), ImageError> {
        let region = self
            .locate(&FileTarget::Bootcode)?
            .ok_or_else(|| ImageError::FileNotFound(BOOTCODE_FILENAME.to_owned()))?;

        let next = region.next_section.ok_or(ImageError::MissingNextSection)?;

        if next < BOOTCODE_MIN_SIZE {
            return Err(ImageError::BootcodeRegionTooSmall(next));
        }

        if 8 + payload.len() > next {
            return Err(ImageError::InsufficientSpace(8 + payload.len(), next));
        }

        trace!("Updating bootcode with {} bytes, bound {:#x}", payload.len(), next);

        BigEndian::write_u32(&mut self.bytes[4..], payload.len() as u32);
        self.bytes[8..8 + payload.len()].copy_from_slice(payload);

        self.repad(8 + payload.len(), next, false);

        Ok(())
    }

    /// Fills the span between a rewritten entry and `bound` so the section
    /// table stays walkable.
    ///
    /// The fill byte up to the alignment boundary keeps the next header
    /// aligned; the remainder gets a padding header unless the entry is the
    /// table's last, in which case the erased bytes read back as the
    /// end-of-table sentinel.
    fn repad(&mut self, end: usize, bound: usize, is_last: bool) {
        let aligned_end = align(end);

        for byte in &mut self.bytes[end..aligned_end] {
            *byte = FILL_BYTE;
        }

        let gap = bound - aligned_end;

        if is_last {
            for byte in &mut self.bytes[aligned_end..bound] {
                *byte = FILL_BYTE;
            }
        } else if gap >= 8 {
            BigEndian::write_u32(&mut self.bytes[aligned_end..], SectionKind::Padding as u32);
            BigEndian::write_u32(&mut self.bytes[aligned_end + 4..], (gap - 8) as u32);

            for byte in &mut self.bytes[aligned_end + 8..bound] {
                *byte = FILL_BYTE;
            }
        }
    }

    /// Returns exactly the stored payload bytes of the entry addressed by
    /// `target`, excluding all header and filename overhead
    pub fn get_file(&self, target: &FileTarget) -> Result<Vec<u8>, ImageError> {
        let region = self
            .locate(target)?
            .ok_or_else(|| ImageError::FileNotFound(target.to_string()))?;

        let payload = match target {
            FileTarget::Bootcode => &self.bytes[region.offset + 8..region.offset + 8 + region.length],
            FileTarget::Named(_) => {
                &self.bytes[region.offset + FILE_HDR_LEN..region.offset + 8 + region.length]
            }
        };

        Ok(payload.to_vec())
    }

    /// Writes the bootcode section and every named file out as individual
    /// files under `directory`, returning the written paths
    pub fn extract_all<P: AsRef<Path>>(&self, directory: P) -> Result<Vec<PathBuf>, ImageError> {
        let directory = directory.as_ref();
        let mut written = Vec::new();

        let bootcode = self.get_file(&FileTarget::Bootcode)?;
        let path = directory.join(BOOTCODE_FILENAME);

        debug!("Extracting {} bytes to {:?}", bootcode.len(), path);
        fs::write(&path, bootcode)?;
        written.push(path);

        for section in self.sections()? {
            if let Some(name) = section.filename {
                let payload = self.get_file(&FileTarget::Named(name.clone()))?;
                let path = directory.join(&name);

                debug!("Extracting {} bytes to {:?}", payload.len(), path);
                fs::write(&path, payload)?;
                written.push(path);
            }
        }

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use assert_hex::assert_eq_hex;
    use byteorder::{BigEndian, ByteOrder};

    use super::*;

    /// Writes a section header at `offset` and returns the offset just past
    /// the header
    fn put_header(bytes: &mut [u8], offset: usize, kind: SectionKind, length: usize) -> usize {
        BigEndian::write_u32(&mut bytes[offset..], kind as u32);
        BigEndian::write_u32(&mut bytes[offset + 4..], length as u32);

        offset + 8
    }

    /// Writes a complete file section at `offset` and returns the offset of
    /// the next section boundary
    fn put_file(bytes: &mut [u8], offset: usize, name: &str, payload: &[u8]) -> usize {
        let end = put_header(bytes, offset, SectionKind::File, FILENAME_LEN + payload.len());

        bytes[end..end + FILENAME_LEN].iter_mut().for_each(|b| *b = 0);
        bytes[end..end + name.len()].copy_from_slice(name.as_bytes());
        bytes[end + FILENAME_LEN..end + FILENAME_LEN + payload.len()].copy_from_slice(payload);

        align(end + FILENAME_LEN + payload.len())
    }

    /// Builds a 512 KiB image with a bootcode region, a config file, a
    /// padding section and a trailing signature file:
    ///
    /// ```text
    /// 0x00000 bootcode (data, 0x1000 byte payload)
    /// 0x01008 padding up to the 128 KiB boundary
    /// 0x20000 bootconf.txt (100 byte payload)
    /// 0x20078 padding (48 byte body)
    /// 0x200b0 bootconf.sig (20 byte payload)
    /// ```
    fn test_image() -> EepromImage {
        let mut bytes = vec![FILL_BYTE; IMAGE_SIZE];

        // Bootcode region reaching up to the next section at 128 KiB
        let end = put_header(&mut bytes, 0, SectionKind::Data, 0x1000);
        for (i, byte) in bytes[end..end + 0x1000].iter_mut().enumerate() {
            *byte = i as u8;
        }

        put_header(&mut bytes, align(8 + 0x1000), SectionKind::Padding, 0x20000 - align(8 + 0x1000) - 8);

        let offset = put_file(&mut bytes, 0x20000, "bootconf.txt", &[b'c'; 100]);
        assert_eq!(offset, 0x20078);

        put_header(&mut bytes, offset, SectionKind::Padding, 48);

        let offset = put_file(&mut bytes, 0x200b0, "bootconf.sig", &[b's'; 20]);
        assert_eq!(offset, 0x200d8);

        EepromImage::from_bytes(bytes).unwrap()
    }

    #[test]
    fn it_should_reject_an_invalid_image_size() {
        let result = EepromImage::from_bytes(vec![FILL_BYTE; IMAGE_SIZE + 1]);

        assert!(matches!(result, Err(ImageError::InvalidImageSize(_))));
    }

    #[test]
    fn it_should_accept_both_image_sizes() {
        assert!(EepromImage::from_bytes(vec![FILL_BYTE; IMAGE_SIZE]).is_ok());
        assert!(EepromImage::from_bytes(vec![FILL_BYTE; IMAGE_SIZE * 4]).is_ok());
    }

    #[test]
    fn it_should_locate_a_named_file() {
        let image = test_image();
        let region = image
            .locate(&FileTarget::named("bootconf.txt"))
            .unwrap()
            .unwrap();

        assert_eq!(region.offset, 0x20000);
        assert_eq!(region.length, 112);
        assert!(!region.is_last);
        assert_eq!(region.next_section, Some(0x200b0));
    }

    #[test]
    fn it_should_locate_the_bootcode() {
        let image = test_image();
        let region = image.locate(&FileTarget::Bootcode).unwrap().unwrap();

        assert_eq!(region.offset, 0);
        assert_eq!(region.length, 0x1000);
        assert_eq!(region.next_section, Some(0x20000));
    }

    #[test]
    fn it_should_bound_the_last_entry_by_the_trailer() {
        let image = test_image();
        let region = image
            .locate(&FileTarget::named("bootconf.sig"))
            .unwrap()
            .unwrap();

        assert!(region.is_last);
        assert_eq!(region.next_section, None);
        assert_eq!(image.region_bound(&region), IMAGE_SIZE - ERASE_BLOCK_SIZE);
    }

    #[test]
    fn it_should_return_none_for_a_missing_file() {
        let image = test_image();

        assert!(image.locate(&FileTarget::named("nosuch.txt")).unwrap().is_none());
    }

    #[test]
    fn it_should_update_and_read_back_a_file() {
        let mut image = test_image();
        let payload = b"BOOT_UART=1\nPOWER_OFF_ON_HALT=0\n";

        image.update_file("bootconf.txt", payload).unwrap();

        let read = image.get_file(&FileTarget::named("bootconf.txt")).unwrap();

        assert_eq_hex!(read, payload);
    }

    #[test]
    fn it_should_shrink_the_padding_when_a_file_grows() {
        let mut image = test_image();

        image.update_file("bootconf.txt", &[b'x'; 120]).unwrap();

        let sections = image.sections().unwrap();
        let table: Vec<_> = sections
            .iter()
            .map(|s| (s.kind, s.offset, s.length))
            .collect();

        // 120 byte payload stores a length of 132; the next boundary is
        // 0x20000 + align(8 + 132) = 0x20090, leaving a 24 byte padding body
        // before bootconf.sig, whose offset must not move.
        assert_eq!(table[2], (SectionKind::File, 0x20000, 132));
        assert_eq!(table[3], (SectionKind::Padding, 0x20090, 24));
        assert_eq!(table[4].1, 0x200b0);
        assert_eq!(image.as_bytes().len(), IMAGE_SIZE);
    }

    #[test]
    fn it_should_round_trip_every_modifiable_file() {
        let mut image = test_image();
        let original = image.as_bytes().to_vec();

        let bootcode = image.get_file(&FileTarget::Bootcode).unwrap();
        image.update_bootcode(&bootcode).unwrap();

        for name in &["bootconf.txt", "bootconf.sig"] {
            let payload = image.get_file(&FileTarget::named(name)).unwrap();
            image.update_file(name, &payload).unwrap();
        }

        assert_eq!(image.as_bytes(), &original[..]);
    }

    #[test]
    fn it_should_reject_an_oversized_file_without_mutating() {
        let mut image = test_image();
        let before = image.as_bytes().to_vec();

        let result = image.update_file("bootconf.txt", &[0u8; MAX_FILE_SIZE + 1]);

        assert!(matches!(result, Err(ImageError::FileTooBig(_))));
        assert_eq!(image.as_bytes(), &before[..]);
    }

    #[test]
    fn it_should_reject_an_update_of_a_missing_file() {
        let mut image = test_image();
        let before = image.as_bytes().to_vec();

        let result = image.update_file("nosuch.txt", b"data");

        assert!(matches!(result, Err(ImageError::FileNotFound(_))));
        assert_eq!(image.as_bytes(), &before[..]);
    }

    #[test]
    fn it_should_reject_an_update_that_crosses_the_next_section() {
        let mut image = test_image();
        let before = image.as_bytes().to_vec();

        // bootconf.txt has 0xb0 bytes of room; a 0x100 byte payload needs
        // 0x114 and must be refused
        let result = image.update_file("bootconf.txt", &[0u8; 0x100]);

        assert!(matches!(result, Err(ImageError::InsufficientSpace(_, _))));
        assert_eq!(image.as_bytes(), &before[..]);
    }

    #[test]
    fn it_should_update_the_bootcode_in_place() {
        let mut image = test_image();
        let payload = vec![0x5a; 0x800];

        image.update_bootcode(&payload).unwrap();

        assert_eq_hex!(image.get_file(&FileTarget::Bootcode).unwrap(), payload);

        // The config file after the bootcode region must be untouched
        let region = image
            .locate(&FileTarget::named("bootconf.txt"))
            .unwrap()
            .unwrap();

        assert_eq!(region.offset, 0x20000);
    }

    #[test]
    fn it_should_reject_a_bootcode_region_below_the_minimum() {
        let mut bytes = vec![FILL_BYTE; IMAGE_SIZE];

        let end = put_header(&mut bytes, 0, SectionKind::Data, 0x100);
        bytes[end..end + 0x100].iter_mut().for_each(|b| *b = 0xaa);

        // The next section sits far below the 128 KiB load boundary
        put_file(&mut bytes, align(8 + 0x100), "bootconf.txt", b"x");

        let mut image = EepromImage::from_bytes(bytes).unwrap();
        let result = image.update_bootcode(&[0u8; 0x100]);

        assert!(matches!(result, Err(ImageError::BootcodeRegionTooSmall(_))));
    }

    #[test]
    fn it_should_require_a_section_after_the_bootcode() {
        let mut bytes = vec![FILL_BYTE; IMAGE_SIZE];

        put_header(&mut bytes, 0, SectionKind::Data, 0x100);
        bytes[8..8 + 0x100].iter_mut().for_each(|b| *b = 0xaa);

        let mut image = EepromImage::from_bytes(bytes).unwrap();
        let result = image.update_bootcode(&[0u8; 0x10]);

        assert!(matches!(result, Err(ImageError::MissingNextSection)));
    }

    #[test]
    fn it_should_keep_the_table_walkable_after_shrinking_the_last_entry() {
        let mut image = test_image();

        image.update_file("bootconf.sig", &[b's'; 4]).unwrap();

        // The freed tail reads back as erased bytes, so the walk still ends
        // cleanly after the shrunken entry
        let sections = image.sections().unwrap();

        assert_eq!(sections.last().unwrap().length, FILENAME_LEN + 4);
        assert_eq!(sections.last().unwrap().offset, 0x200b0);
    }
}
