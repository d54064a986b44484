//! Directory entries: the fixed 128-byte records describing storages and
//! streams, and the two orderings the signing pipeline needs.
//!
//! Two comparators exist on purpose and must not be conflated. `cmp_hash`
//! orders children for the digest passes (raw bytes, longer name first on a
//! prefix tie); `cmp_tree` orders children for directory serialization
//! (shorter name first, then UTF-16 code units).

use std::cmp::Ordering;

use crate::format::{
    le_u16, le_u32, name_matches, BLACK_COLOR, DIGITAL_SIGNATURE_EX_NAME, DIGITAL_SIGNATURE_NAME,
    DIRENT_CHILD_ID, DIRENT_CLSID, DIRENT_COLOUR, DIRENT_CREATE_TIME, DIRENT_FILE_SIZE,
    DIRENT_LEFT_SIBLING_ID, DIRENT_MAX_NAME_SIZE, DIRENT_MODIFY_TIME, DIRENT_NAME,
    DIRENT_NAME_LEN, DIRENT_RIGHT_SIBLING_ID, DIRENT_SIZE, DIRENT_START_SECTOR_LOC,
    DIRENT_STATE_BITS, DIRENT_TYPE, DIR_ROOT, DIR_STORAGE, DIR_STREAM, NOSTREAM,
};
use crate::infra::error::{MsiError, MsiResult};

/// A directory entry as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Name bytes (UTF-16LE), including the NUL terminator.
    pub(crate) name: Vec<u8>,
    /// Name length in bytes, including the NUL terminator.
    pub(crate) name_len: u16,
    /// Object type.
    pub(crate) object_type: u8,
    /// Color flag.
    pub(crate) color_flag: u8,
    pub(crate) left_sibling_id: u32,
    pub(crate) right_sibling_id: u32,
    pub(crate) child_id: u32,
    pub(crate) clsid: [u8; 16],
    pub(crate) state_bits: [u8; 4],
    /// Creation time (FILETIME raw bytes).
    pub(crate) creation_time: [u8; 8],
    /// Modification time (FILETIME raw bytes).
    pub(crate) modified_time: [u8; 8],
    pub(crate) start_sector_location: u32,
    /// Stream size; only the low 32 bits are meaningful for MSI payloads.
    pub(crate) stream_size: u64,
}

impl DirEntry {
    /// Parses one 128-byte directory record.
    pub(crate) fn parse(data: &[u8]) -> MsiResult<Self> {
        if data.len() < DIRENT_SIZE {
            return Err(MsiError::Malformed(
                "truncated directory entry record".into(),
            ));
        }

        let name_len = le_u16(data, DIRENT_NAME_LEN);
        let name_len_clamped = usize::from(name_len).min(DIRENT_MAX_NAME_SIZE);
        let name = data[DIRENT_NAME..DIRENT_NAME + name_len_clamped].to_vec();

        let mut clsid = [0u8; 16];
        clsid.copy_from_slice(&data[DIRENT_CLSID..DIRENT_CLSID + 16]);
        let mut state_bits = [0u8; 4];
        state_bits.copy_from_slice(&data[DIRENT_STATE_BITS..DIRENT_STATE_BITS + 4]);
        let mut creation_time = [0u8; 8];
        creation_time.copy_from_slice(&data[DIRENT_CREATE_TIME..DIRENT_CREATE_TIME + 8]);
        let mut modified_time = [0u8; 8];
        modified_time.copy_from_slice(&data[DIRENT_MODIFY_TIME..DIRENT_MODIFY_TIME + 8]);

        let size_lo = le_u32(data, DIRENT_FILE_SIZE);
        let size_hi = le_u32(data, DIRENT_FILE_SIZE + 4);

        Ok(DirEntry {
            name,
            name_len,
            object_type: data[DIRENT_TYPE],
            color_flag: data[DIRENT_COLOUR],
            left_sibling_id: le_u32(data, DIRENT_LEFT_SIBLING_ID),
            right_sibling_id: le_u32(data, DIRENT_RIGHT_SIBLING_ID),
            child_id: le_u32(data, DIRENT_CHILD_ID),
            clsid,
            state_bits,
            creation_time,
            modified_time,
            start_sector_location: le_u32(data, DIRENT_START_SECTOR_LOC),
            stream_size: (u64::from(size_hi) << 32) | u64::from(size_lo),
        })
    }

    /// Serializes the entry back into its 128-byte on-disk form.
    ///
    /// Only the low 32 bits of the size are written; the high half is zeroed.
    pub(crate) fn serialize(&self) -> [u8; DIRENT_SIZE] {
        let mut data = [0u8; DIRENT_SIZE];

        let name_len = self
            .name
            .len()
            .min(usize::from(self.name_len))
            .min(DIRENT_MAX_NAME_SIZE);
        data[DIRENT_NAME..DIRENT_NAME + name_len].copy_from_slice(&self.name[..name_len]);
        data[DIRENT_NAME_LEN..DIRENT_NAME_LEN + 2].copy_from_slice(&self.name_len.to_le_bytes());
        data[DIRENT_TYPE] = self.object_type;
        data[DIRENT_COLOUR] = self.color_flag;
        data[DIRENT_LEFT_SIBLING_ID..DIRENT_LEFT_SIBLING_ID + 4]
            .copy_from_slice(&self.left_sibling_id.to_le_bytes());
        data[DIRENT_RIGHT_SIBLING_ID..DIRENT_RIGHT_SIBLING_ID + 4]
            .copy_from_slice(&self.right_sibling_id.to_le_bytes());
        data[DIRENT_CHILD_ID..DIRENT_CHILD_ID + 4].copy_from_slice(&self.child_id.to_le_bytes());
        data[DIRENT_CLSID..DIRENT_CLSID + 16].copy_from_slice(&self.clsid);
        data[DIRENT_STATE_BITS..DIRENT_STATE_BITS + 4].copy_from_slice(&self.state_bits);
        data[DIRENT_CREATE_TIME..DIRENT_CREATE_TIME + 8].copy_from_slice(&self.creation_time);
        data[DIRENT_MODIFY_TIME..DIRENT_MODIFY_TIME + 8].copy_from_slice(&self.modified_time);
        data[DIRENT_START_SECTOR_LOC..DIRENT_START_SECTOR_LOC + 4]
            .copy_from_slice(&self.start_sector_location.to_le_bytes());
        data[DIRENT_FILE_SIZE..DIRENT_FILE_SIZE + 4]
            .copy_from_slice(&(self.stream_size as u32).to_le_bytes());

        data
    }

    /// Builds a fresh stream entry for insertion at the root.
    pub(crate) fn new_stream(name: &[u8]) -> Self {
        DirEntry {
            name: name.to_vec(),
            name_len: u16::try_from(name.len()).unwrap_or(0),
            object_type: DIR_STREAM,
            color_flag: BLACK_COLOR,
            left_sibling_id: NOSTREAM,
            right_sibling_id: NOSTREAM,
            child_id: NOSTREAM,
            clsid: [0u8; 16],
            state_bits: [0u8; 4],
            creation_time: [0u8; 8],
            modified_time: [0u8; 8],
            start_sector_location: NOSTREAM,
            stream_size: 0,
        }
    }

    /// Returns true if this is a stream entry.
    #[must_use]
    pub fn is_stream(&self) -> bool {
        self.object_type == DIR_STREAM
    }

    /// Returns true if this is a storage entry (including the root).
    #[must_use]
    pub fn is_storage(&self) -> bool {
        self.object_type == DIR_STORAGE || self.object_type == DIR_ROOT
    }

    /// Returns true if this is the root entry.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.object_type == DIR_ROOT
    }

    /// The logical name: UTF-16LE bytes excluding the NUL terminator.
    #[must_use]
    pub fn name_bytes(&self) -> &[u8] {
        let len = self.name.len().saturating_sub(2);
        &self.name[..len]
    }

    /// The logical name decoded for display and diagnostics.
    #[must_use]
    pub fn name_string(&self) -> String {
        let units: Vec<u16> = self
            .name_bytes()
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    }

    /// Declared stream size.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.stream_size
    }

    /// Starting sector location (FAT or mini-FAT domain depending on size).
    #[must_use]
    pub fn start_sector(&self) -> u32 {
        self.start_sector_location
    }

    /// The entry's CLSID bytes.
    #[must_use]
    pub fn clsid(&self) -> &[u8; 16] {
        &self.clsid
    }

    /// The entry's state bits.
    #[must_use]
    pub fn state_bits(&self) -> &[u8; 4] {
        &self.state_bits
    }

    pub(crate) fn matches_name(&self, reference: &[u8]) -> bool {
        name_matches(&self.name, reference)
    }

    /// Returns true if the name matches either signature stream.
    pub(crate) fn is_signature_name(&self) -> bool {
        self.matches_name(DIGITAL_SIGNATURE_NAME) || self.matches_name(DIGITAL_SIGNATURE_EX_NAME)
    }

    /// Ordering for the digest passes: byte-wise comparison of the logical
    /// names up to the shorter length; on a prefix tie the longer name sorts
    /// first.
    pub(crate) fn cmp_hash(&self, other: &Self) -> Ordering {
        let a = self.name_bytes();
        let b = other.name_bytes();
        let n = a.len().min(b.len());
        match a[..n].cmp(&b[..n]) {
            Ordering::Equal => b.len().cmp(&a.len()),
            ord => ord,
        }
    }

    /// Ordering for directory serialization: shorter names first, equal-length
    /// names by pairwise UTF-16 code units.
    pub(crate) fn cmp_tree(&self, other: &Self) -> Ordering {
        match self.name_len.cmp(&other.name_len) {
            Ordering::Equal => {}
            ord => return ord,
        }

        let limit = usize::from(self.name_len.saturating_sub(2))
            .min(self.name.len())
            .min(other.name.len());
        let mut i = 0;
        while i + 1 < limit {
            let a = u16::from_le_bytes([self.name[i], self.name[i + 1]]);
            let b = u16::from_le_bytes([other.name[i], other.name[i + 1]]);
            if a != b {
                return a.cmp(&b);
            }
            i += 2;
        }
        Ordering::Equal
    }
}
