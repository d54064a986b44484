//! On-disk layout constants for the CFB container.
//!
//! Field offsets follow MS-CFB. The header is always 512 bytes regardless of
//! the sector size, and directory entries are fixed 128-byte records.

/// CFB magic (OLE Structured Storage signature).
pub const MSI_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// The CFB header is always 512 bytes, independent of sector size.
pub(crate) const HEADER_SIZE: usize = 0x200;

/// Size threshold below which a stream is stored in the mini-stream.
pub(crate) const MINI_STREAM_CUTOFF_SIZE: u32 = 4096;

/// Directory entry size (bytes).
pub(crate) const DIRENT_SIZE: usize = 128;

/// Directory entry name field size (bytes), including the NUL terminator.
pub(crate) const DIRENT_MAX_NAME_SIZE: usize = 64;

/// Largest sector index that can address data.
pub const MAXREGSECT: u32 = 0xFFFF_FFFA;
/// Sector belongs to a DIFAT sector.
pub const DIFSECT: u32 = 0xFFFF_FFFC;
/// Sector belongs to a FAT sector.
pub const FATSECT: u32 = 0xFFFF_FFFD;
/// End of a sector chain.
pub const ENDOFCHAIN: u32 = 0xFFFF_FFFE;
/// Unallocated sector.
pub const FREESECT: u32 = 0xFFFF_FFFF;
/// Terminator for directory entry ids.
pub const NOSTREAM: u32 = 0xFFFF_FFFF;

/// The number of DIFAT entries stored in the header.
pub const DIFAT_IN_HEADER: usize = 109;

// Header field offsets.
pub(crate) const HEADER_SIGNATURE: usize = 0x00;
pub(crate) const HEADER_CLSID: usize = 0x08;
pub(crate) const HEADER_MINOR_VER: usize = 0x18;
pub(crate) const HEADER_MAJOR_VER: usize = 0x1A;
pub(crate) const HEADER_BYTE_ORDER: usize = 0x1C;
pub(crate) const HEADER_SECTOR_SHIFT: usize = 0x1E;
pub(crate) const HEADER_MINI_SECTOR_SHIFT: usize = 0x20;
pub(crate) const HEADER_DIR_SECTORS_NUM: usize = 0x28;
pub(crate) const HEADER_FAT_SECTORS_NUM: usize = 0x2C;
pub(crate) const HEADER_DIR_SECTOR_LOC: usize = 0x30;
pub(crate) const HEADER_TRANSACTION: usize = 0x34;
pub(crate) const HEADER_MINI_STREAM_CUTOFF: usize = 0x38;
pub(crate) const HEADER_MINI_FAT_SECTOR_LOC: usize = 0x3C;
pub(crate) const HEADER_MINI_FAT_SECTORS_NUM: usize = 0x40;
pub(crate) const HEADER_DIFAT_SECTOR_LOC: usize = 0x44;
pub(crate) const HEADER_DIFAT_SECTORS_NUM: usize = 0x48;
pub(crate) const HEADER_DIFAT: usize = 0x4C;

// Directory entry field offsets.
pub(crate) const DIRENT_NAME: usize = 0x00;
pub(crate) const DIRENT_NAME_LEN: usize = 0x40;
pub(crate) const DIRENT_TYPE: usize = 0x42;
pub(crate) const DIRENT_COLOUR: usize = 0x43;
pub(crate) const DIRENT_LEFT_SIBLING_ID: usize = 0x44;
pub(crate) const DIRENT_RIGHT_SIBLING_ID: usize = 0x48;
pub(crate) const DIRENT_CHILD_ID: usize = 0x4C;
pub(crate) const DIRENT_CLSID: usize = 0x50;
pub(crate) const DIRENT_STATE_BITS: usize = 0x60;
pub(crate) const DIRENT_CREATE_TIME: usize = 0x64;
pub(crate) const DIRENT_MODIFY_TIME: usize = 0x6C;
pub(crate) const DIRENT_START_SECTOR_LOC: usize = 0x74;
pub(crate) const DIRENT_FILE_SIZE: usize = 0x78;

/// Directory entry types.
pub(crate) const DIR_STORAGE: u8 = 1;
pub(crate) const DIR_STREAM: u8 = 2;
pub(crate) const DIR_ROOT: u8 = 5;

/// Directory entry color values.
pub(crate) const BLACK_COLOR: u8 = 1;

/// The `\x05DigitalSignature` stream name (UTF-16LE incl. NUL).
pub const DIGITAL_SIGNATURE_NAME: &[u8] = &[
    0x05, 0x00, // U+0005
    b'D', 0x00, b'i', 0x00, b'g', 0x00, b'i', 0x00, b't', 0x00, b'a', 0x00, b'l', 0x00, b'S', 0x00,
    b'i', 0x00, b'g', 0x00, b'n', 0x00, b'a', 0x00, b't', 0x00, b'u', 0x00, b'r', 0x00, b'e', 0x00,
    0x00, 0x00, // NUL
];

/// The `\x05MsiDigitalSignatureEx` stream name (UTF-16LE incl. NUL).
pub const DIGITAL_SIGNATURE_EX_NAME: &[u8] = &[
    0x05, 0x00, // U+0005
    b'M', 0x00, b's', 0x00, b'i', 0x00, b'D', 0x00, b'i', 0x00, b'g', 0x00, b'i', 0x00, b't', 0x00,
    b'a', 0x00, b'l', 0x00, b'S', 0x00, b'i', 0x00, b'g', 0x00, b'n', 0x00, b'a', 0x00, b't', 0x00,
    b'u', 0x00, b'r', 0x00, b'e', 0x00, b'E', 0x00, b'x', 0x00, 0x00, 0x00, // NUL
];

/// Placeholder written into header fields that a later save pass must fill.
pub(crate) const DEAD_FOOD: [u8; 4] = [0xDE, 0xAD, 0xF0, 0x0D];

/// Compares a stored entry name against a stream name constant over the
/// shorter of the two lengths.
pub(crate) fn name_matches(name: &[u8], reference: &[u8]) -> bool {
    let n = name.len().min(reference.len());
    name[..n] == reference[..n]
}

pub(crate) fn le_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

pub(crate) fn le_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}
