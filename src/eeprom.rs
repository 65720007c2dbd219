//! Bootloader EEPROM image handling

mod image;
mod section;

pub use image::{EepromImage, FileRegion, FileTarget, ImageError};
pub use section::{ParseError, Section, SectionKind};

/// The size of the smaller of the two EEPROM parts in circulation. The larger
/// part is exactly four times this size.
pub const IMAGE_SIZE: usize = 512 * 1024;

/// Size of a single erase block. The final erase block of the image is
/// reserved for the bootloader's own use and must never gain a new section
/// boundary.
pub const ERASE_BLOCK_SIZE: usize = 4096;

/// Width of the fixed filename field in a file section header.
pub const FILENAME_LEN: usize = 12;

/// Total size of a file section header - magic, length and filename.
pub const FILE_HDR_LEN: usize = 20;

/// Sections are aligned to this boundary relative to the previous section's
/// end.
pub const SECTION_ALIGN: usize = 8;

/// Largest payload accepted for a named modifiable file.
pub const MAX_FILE_SIZE: usize = 0x2000;

/// Smallest bootcode region the boot ROM is able to load from.
pub const BOOTCODE_MIN_SIZE: usize = 128 * 1024;

/// The name used when the bootcode region is addressed or extracted as a
/// file. The region itself carries no filename field.
pub const BOOTCODE_FILENAME: &str = "bootcode.bin";

/// Name of the embedded boot configuration file.
pub const CONFIG_FILENAME: &str = "bootconf.txt";

/// The erased state of the EEPROM, used to fill freed space.
pub(crate) const FILL_BYTE: u8 = 0xff;
