//! Container rewrite: re-emits a parsed image as a fresh CFB with the
//! signature streams installed at the root.
//!
//! Windows' MSI verifier is picky about container invariants and, in
//! practice, about the shape of the directory table and allocation chains, so
//! the layout is conservative and fixed:
//!
//! - write order: large streams, mini-stream, mini-FAT, directory, FAT, header
//! - directory serialization in tree order with a degenerate structure: all
//!   nodes black, left sibling always `NOSTREAM`, right siblings forming a
//!   per-storage list
//! - every structural header field is recomputed; nothing is copied from the
//!   input layout

use std::io::{Seek, SeekFrom, Write};

use crate::dirent::DirEntry;
use crate::format::{
    DEAD_FOOD, DIFAT_IN_HEADER, DIGITAL_SIGNATURE_EX_NAME, DIGITAL_SIGNATURE_NAME, HEADER_CLSID,
    DIRENT_CHILD_ID,
    DIRENT_LEFT_SIBLING_ID, DIRENT_RIGHT_SIBLING_ID, DIRENT_SIZE, DIR_STORAGE, ENDOFCHAIN,
    FATSECT, FREESECT, HEADER_DIFAT, HEADER_DIFAT_SECTOR_LOC, HEADER_DIR_SECTORS_NUM,
    HEADER_DIR_SECTOR_LOC, HEADER_FAT_SECTORS_NUM, HEADER_MAJOR_VER, HEADER_MINI_FAT_SECTORS_NUM,
    HEADER_MINI_FAT_SECTOR_LOC, HEADER_MINI_SECTOR_SHIFT, HEADER_MINI_STREAM_CUTOFF,
    HEADER_MINOR_VER, HEADER_BYTE_ORDER, HEADER_SECTOR_SHIFT, HEADER_SIGNATURE, HEADER_SIZE,
    MINI_STREAM_CUTOFF_SIZE, MSI_MAGIC, NOSTREAM, BLACK_COLOR,
};
use crate::image::{Header, MsiFile};
use crate::infra::error::{MsiError, MsiResult};
use crate::tree::DirTree;

/// Largest version-3 output whose FAT still fits the 109 header DIFAT slots.
const DIFAT_V3_LIMIT: usize = 7_143_936;
/// Largest version-4 output whose FAT still fits the 109 header DIFAT slots.
const DIFAT_V4_LIMIT: usize = 457_183_232;

/// Output context: accumulation buffers and allocation counters.
struct MsiOut {
    sector_size: usize,
    mini_sector_size: usize,
    /// Next free regular sector number.
    sector_num: u32,
    /// Next free mini-sector number.
    mini_sector_num: u32,
    /// Header bytes, written last.
    header: [u8; HEADER_SIZE],
    ministream: Vec<u8>,
    minifat: Vec<u32>,
    fat: Vec<u32>,
    dirtree_sectors_count: u32,
    minifat_sectors_count: u32,
    fat_sectors_count: u32,
}

impl MsiOut {
    fn new(msi: &MsiFile, len_msi: usize, len_msiex: usize) -> MsiResult<MsiOut> {
        let sector_size = output_sector_size(
            msi.data().len(),
            len_msi,
            len_msiex,
            msi.sector_size(),
            msi.mini_sector_size(),
        )?;
        Ok(MsiOut {
            sector_size,
            mini_sector_size: msi.mini_sector_size(),
            sector_num: 0,
            mini_sector_num: 0,
            header: header_new(msi.header(), sector_size),
            ministream: Vec::new(),
            minifat: Vec::new(),
            fat: Vec::new(),
            dirtree_sectors_count: 0,
            minifat_sectors_count: 0,
            fat_sectors_count: 0,
        })
    }

    fn set_header_u32(&mut self, offset: usize, value: u32) {
        self.header[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// Picks the output sector size from the projected total size.
///
/// A version-3 FAT addressed purely from the header DIFAT tops out around
/// 6.8 MiB; past that the output switches to 4096-byte sectors, and past the
/// version-4 equivalent (~436 MiB) the rewrite is refused rather than
/// emitting DIFAT sectors.
fn output_sector_size(
    input_len: usize,
    len_msi: usize,
    len_msiex: usize,
    input_sector_size: usize,
    mini_sector_size: usize,
) -> MsiResult<usize> {
    let msi_size = if len_msi <= MINI_STREAM_CUTOFF_SIZE as usize {
        len_msi.div_ceil(mini_sector_size) * mini_sector_size
    } else {
        len_msi.div_ceil(input_sector_size) * input_sector_size
    };
    let msiex_size = len_msiex.div_ceil(mini_sector_size) * mini_sector_size;

    let projected = input_len + msi_size + msiex_size;
    if projected > DIFAT_V4_LIMIT {
        return Err(MsiError::Unsupported(
            "output would require DIFAT sectors".into(),
        ));
    }
    if projected > DIFAT_V3_LIMIT {
        return Ok(4096);
    }
    Ok(input_sector_size)
}

/// Fresh output header template; structural fields carry a recognizable
/// placeholder until the save passes fill them.
fn header_new(input: &Header, sector_size: usize) -> [u8; HEADER_SIZE] {
    let mut hdr = [0u8; HEADER_SIZE];

    hdr[HEADER_SIGNATURE..HEADER_SIGNATURE + 8].copy_from_slice(&MSI_MAGIC);
    hdr[HEADER_CLSID..HEADER_CLSID + 16].fill(0);
    // Reserved bytes, directory sector count and transaction signature stay
    // zero.
    hdr[HEADER_MINOR_VER..HEADER_MINOR_VER + 2]
        .copy_from_slice(&input.minor_version.to_le_bytes());
    let major: u16 = if sector_size == 4096 { 0x0004 } else { 0x0003 };
    hdr[HEADER_MAJOR_VER..HEADER_MAJOR_VER + 2].copy_from_slice(&major.to_le_bytes());
    hdr[HEADER_BYTE_ORDER..HEADER_BYTE_ORDER + 2]
        .copy_from_slice(&input.byte_order.to_le_bytes());
    let sector_shift: u16 = if sector_size == 4096 { 0x000C } else { 0x0009 };
    hdr[HEADER_SECTOR_SHIFT..HEADER_SECTOR_SHIFT + 2]
        .copy_from_slice(&sector_shift.to_le_bytes());
    hdr[HEADER_MINI_SECTOR_SHIFT..HEADER_MINI_SECTOR_SHIFT + 2]
        .copy_from_slice(&input.mini_sector_shift.to_le_bytes());

    hdr[HEADER_FAT_SECTORS_NUM..HEADER_FAT_SECTORS_NUM + 4].copy_from_slice(&DEAD_FOOD);
    hdr[HEADER_DIR_SECTOR_LOC..HEADER_DIR_SECTOR_LOC + 4].copy_from_slice(&DEAD_FOOD);
    hdr[HEADER_MINI_STREAM_CUTOFF..HEADER_MINI_STREAM_CUTOFF + 4]
        .copy_from_slice(&MINI_STREAM_CUTOFF_SIZE.to_le_bytes());
    hdr[HEADER_MINI_FAT_SECTOR_LOC..HEADER_MINI_FAT_SECTOR_LOC + 4].copy_from_slice(&DEAD_FOOD);
    hdr[HEADER_MINI_FAT_SECTORS_NUM..HEADER_MINI_FAT_SECTORS_NUM + 4]
        .copy_from_slice(&DEAD_FOOD);
    hdr[HEADER_DIFAT_SECTOR_LOC..HEADER_DIFAT_SECTOR_LOC + 4]
        .copy_from_slice(&ENDOFCHAIN.to_le_bytes());
    // DIFAT sector count stays zero: no DIFAT sectors are ever emitted.
    hdr[HEADER_DIFAT..HEADER_DIFAT + 4].copy_from_slice(&DEAD_FOOD);
    for i in 1..DIFAT_IN_HEADER {
        hdr[HEADER_DIFAT + 4 * i..HEADER_DIFAT + 4 * i + 4]
            .copy_from_slice(&FREESECT.to_le_bytes());
    }

    hdr
}

/// Rewrites `msi` into `outdata` with `p_msi` as the `DigitalSignature`
/// payload and, when non-empty, `p_msiex` as `MsiDigitalSignatureEx`.
///
/// The tree is mutated in place: signature entries are installed at the root
/// and every entry's start sector and size are rewritten to the output
/// layout. With an empty `p_msi` the container is re-emitted without touching
/// the signature entries.
///
/// # Errors
/// Returns `Unsupported` when the projected output would need DIFAT sectors,
/// `InvalidArgument` when a signature name collides with a storage, and read
/// or I/O errors from the source image and the sink. On failure the sink is
/// left in an undefined state and must be discarded.
pub fn write_msi<W: Write + Seek>(
    msi: &MsiFile,
    tree: &mut DirTree,
    p_msi: &[u8],
    p_msiex: &[u8],
    outdata: &mut W,
) -> MsiResult<()> {
    let mut out = MsiOut::new(msi, p_msi.len(), p_msiex.len())?;

    log::debug!(
        "rewriting CFB image: {} bytes in, signature {} bytes, ex {} bytes, sector size {}",
        msi.data().len(),
        p_msi.len(),
        p_msiex.len(),
        out.sector_size
    );

    // The first sector is reserved for the header, which is written last.
    outdata.seek(SeekFrom::Start(out.sector_size as u64))?;

    if !p_msi.is_empty() {
        tree.insert_signatures(!p_msiex.is_empty())?;
    }

    stream_handle(msi, tree, 0, p_msi, p_msiex, outdata, &mut out, true)?;
    ministream_save(tree, &mut out);
    let ministream = std::mem::take(&mut out.ministream);
    if !ministream.is_empty() {
        outdata.write_all(&ministream)?;
        pad_to_sector(outdata, ministream.len(), out.sector_size)?;
    }
    minifat_save(outdata, &mut out)?;
    dirtree_save(tree, outdata, &mut out)?;
    fat_save(outdata, &mut out)?;
    header_save(outdata, &mut out)?;
    Ok(())
}

/// Zero-fills the remainder of the current sector.
fn pad_to_sector<W: Write>(outdata: &mut W, len: usize, sector_size: usize) -> MsiResult<()> {
    let remain = (sector_size - len % sector_size) % sector_size;
    if remain > 0 {
        outdata.write_all(&vec![0u8; remain])?;
    }
    Ok(())
}

/// Reads one stream's payload; at the root the signature streams take their
/// bytes from the caller instead of the source image.
fn stream_read(
    msi: &MsiFile,
    entry: &DirEntry,
    p_msi: &[u8],
    p_msiex: &[u8],
    is_root: bool,
) -> MsiResult<Vec<u8>> {
    if is_root && entry.matches_name(DIGITAL_SIGNATURE_NAME) {
        return Ok(p_msi.to_vec());
    }
    if is_root && entry.matches_name(DIGITAL_SIGNATURE_EX_NAME) {
        return Ok(p_msiex.to_vec());
    }

    let inlen = entry.size() as u32 as usize;
    if inlen == 0 {
        return Ok(Vec::new());
    }
    let mut indata = vec![0u8; inlen];
    msi.read(entry, 0, &mut indata)
        .map_err(|e| match e {
            MsiError::ReadFailed(_) => e,
            other => MsiError::ReadFailed(other.to_string()),
        })?;
    Ok(indata)
}

/// Recursive stream pass: places every stream payload either in the
/// mini-stream accumulator or directly in the output, builds the matching
/// allocation chains, and rewrites each entry's start sector and size.
#[allow(clippy::too_many_arguments)]
fn stream_handle<W: Write>(
    msi: &MsiFile,
    tree: &mut DirTree,
    idx: usize,
    p_msi: &[u8],
    p_msiex: &[u8],
    outdata: &mut W,
    out: &mut MsiOut,
    is_root: bool,
) -> MsiResult<()> {
    let children = tree.children(idx).to_vec();
    for child in children {
        if tree.node(child).entry.object_type == DIR_STORAGE {
            stream_handle(msi, tree, child, p_msi, p_msiex, outdata, out, false)?;
            continue;
        }
        if !tree.node(child).entry.is_stream() {
            continue;
        }

        let snapshot = tree.node(child).entry.clone();
        let indata = stream_read(msi, &snapshot, p_msi, p_msiex, is_root)?;

        let entry = &mut tree.node_mut(child).entry;
        if indata.is_empty() {
            // Null streams get no sectors at all.
            entry.stream_size = 0;
            entry.start_sector_location = NOSTREAM;
            continue;
        }
        entry.stream_size = u64::from(indata.len() as u32);

        if indata.len() < MINI_STREAM_CUTOFF_SIZE as usize {
            entry.start_sector_location = out.mini_sector_num;

            let mini_count = indata.len().div_ceil(out.mini_sector_size) as u32;
            out.ministream.extend_from_slice(&indata);
            let pad = (out.mini_sector_size - indata.len() % out.mini_sector_size)
                % out.mini_sector_size;
            out.ministream.extend(std::iter::repeat_n(0u8, pad));

            for i in 0..mini_count {
                out.minifat.push(if i + 1 == mini_count {
                    ENDOFCHAIN
                } else {
                    out.mini_sector_num + i + 1
                });
            }
            out.mini_sector_num += mini_count;
        } else {
            entry.start_sector_location = out.sector_num;

            outdata.write_all(&indata)?;
            pad_to_sector(outdata, indata.len(), out.sector_size)?;

            let sectors = indata.len().div_ceil(out.sector_size) as u32;
            for i in 0..sectors {
                out.fat.push(if i + 1 == sectors {
                    ENDOFCHAIN
                } else {
                    out.sector_num + i + 1
                });
            }
            out.sector_num += sectors;
        }
    }
    Ok(())
}

/// Assigns the mini-stream container its regular sectors and FAT chain; the
/// root entry points at the first of them.
fn ministream_save(tree: &mut DirTree, out: &mut MsiOut) {
    let root = &mut tree.node_mut(0).entry;
    if out.ministream.is_empty() {
        root.start_sector_location = NOSTREAM;
        return;
    }

    root.start_sector_location = out.sector_num;

    let sectors = out.ministream.len().div_ceil(out.sector_size) as u32;
    for i in 0..sectors {
        out.fat.push(if i + 1 == sectors {
            ENDOFCHAIN
        } else {
            out.sector_num + i + 1
        });
    }
    out.sector_num += sectors;
}

/// Emits the mini-FAT stream: entries, a terminator, free-sector fill to the
/// sector boundary, and its own FAT chain.
fn minifat_save<W: Write>(outdata: &mut W, out: &mut MsiOut) -> MsiResult<()> {
    if out.minifat.is_empty() {
        out.set_header_u32(HEADER_MINI_FAT_SECTOR_LOC, ENDOFCHAIN);
        out.minifat_sectors_count = 0;
        return Ok(());
    }

    let minifat_start = out.sector_num;
    out.set_header_u32(HEADER_MINI_FAT_SECTOR_LOC, minifat_start);

    // Terminate the mini-FAT stream itself, then fill the trailing sector.
    out.minifat.push(ENDOFCHAIN);
    let entries_per_sector = out.sector_size / 4;
    let padded = out.minifat.len().div_ceil(entries_per_sector) * entries_per_sector;
    out.minifat.resize(padded, FREESECT);

    for entry in &out.minifat {
        outdata.write_all(&entry.to_le_bytes())?;
    }

    out.minifat_sectors_count = (padded / entries_per_sector) as u32;
    for i in 0..out.minifat_sectors_count {
        out.fat.push(if i + 1 == out.minifat_sectors_count {
            ENDOFCHAIN
        } else {
            minifat_start + i + 1
        });
    }
    out.sector_num += out.minifat_sectors_count;
    Ok(())
}

/// One all-zero directory record with the id fields set to `NOSTREAM`.
fn unused_dirent() -> [u8; DIRENT_SIZE] {
    let mut data = [0u8; DIRENT_SIZE];
    data[DIRENT_LEFT_SIBLING_ID..DIRENT_LEFT_SIBLING_ID + 4]
        .copy_from_slice(&NOSTREAM.to_le_bytes());
    data[DIRENT_RIGHT_SIBLING_ID..DIRENT_RIGHT_SIBLING_ID + 4]
        .copy_from_slice(&NOSTREAM.to_le_bytes());
    data[DIRENT_CHILD_ID..DIRENT_CHILD_ID + 4].copy_from_slice(&NOSTREAM.to_le_bytes());
    data
}

/// Linearizes the tree for serialization: depth-first with each storage's
/// children in tree order, ids assigned by emission position, and the sibling
/// pointers rewritten into a right-linked list per storage.
fn dirents_save(tree: &DirTree) -> Vec<DirEntry> {
    struct FlatNode {
        entry: DirEntry,
        children: Vec<usize>,
    }

    fn flatten(tree: &DirTree, node: usize, flat: &mut Vec<FlatNode>) -> usize {
        let idx = flat.len();
        flat.push(FlatNode {
            entry: tree.node(node).entry.clone(),
            children: Vec::new(),
        });

        let mut kids = tree.children(node).to_vec();
        kids.sort_by(|&a, &b| tree.node(a).entry.cmp_tree(&tree.node(b).entry));

        let mut child_idxs = Vec::with_capacity(kids.len());
        for kid in kids {
            child_idxs.push(flatten(tree, kid, flat));
        }
        flat[idx].children = child_idxs;
        idx
    }

    let mut flat: Vec<FlatNode> = Vec::new();
    flatten(tree, 0, &mut flat);

    // Make everything black and sever the red-black pointers; in the
    // depth-first numbering a child's next sibling already sits past all of
    // the child's descendants.
    for node in &mut flat {
        node.entry.color_flag = BLACK_COLOR;
        node.entry.left_sibling_id = NOSTREAM;
        node.entry.right_sibling_id = NOSTREAM;
        node.entry.child_id = NOSTREAM;
    }
    for idx in 0..flat.len() {
        let children = flat[idx].children.clone();
        if children.is_empty() {
            continue;
        }
        flat[idx].entry.child_id = children[0] as u32;
        for (pos, &child) in children.iter().enumerate() {
            flat[child].entry.right_sibling_id = if pos + 1 < children.len() {
                children[pos + 1] as u32
            } else {
                NOSTREAM
            };
        }
    }

    flat.into_iter().map(|node| node.entry).collect()
}

/// Emits the directory sectors and their FAT chain.
fn dirtree_save<W: Write>(tree: &mut DirTree, outdata: &mut W, out: &mut MsiOut) -> MsiResult<()> {
    out.set_header_u32(HEADER_DIR_SECTOR_LOC, out.sector_num);

    // The root's recorded size is the mini-stream container length.
    tree.node_mut(0).entry.stream_size = u64::from(out.mini_sector_num) * out.mini_sector_size as u64;

    let entries = dirents_save(tree);
    let mut dirtree_len = 0usize;
    for entry in &entries {
        outdata.write_all(&entry.serialize())?;
        dirtree_len += DIRENT_SIZE;
    }

    if dirtree_len % out.sector_size > 0 {
        let unused = unused_dirent();
        let mut remain = out.sector_size - dirtree_len % out.sector_size;
        while remain > 0 {
            outdata.write_all(&unused)?;
            remain = remain.saturating_sub(DIRENT_SIZE);
        }
    }

    out.dirtree_sectors_count = dirtree_len.div_ceil(out.sector_size) as u32;
    for i in 0..out.dirtree_sectors_count {
        out.fat.push(if i + 1 == out.dirtree_sectors_count {
            ENDOFCHAIN
        } else {
            out.sector_num + i + 1
        });
    }
    out.sector_num += out.dirtree_sectors_count;
    Ok(())
}

/// Emits the FAT, marks the FAT's own sectors and publishes their locations
/// in the header DIFAT slots.
fn fat_save<W: Write>(outdata: &mut W, out: &mut MsiOut) -> MsiResult<()> {
    let entries_per_sector = out.sector_size / 4;

    // The FAT must also map its own sectors, which in turn grow the FAT.
    let current_sectors = (out.fat.len() * 4).div_ceil(out.sector_size);
    out.fat_sectors_count =
        ((out.fat.len() + current_sectors) * 4).div_ceil(out.sector_size) as u32;

    for _ in 0..out.fat_sectors_count {
        out.fat.push(FATSECT);
    }
    for i in 0..(out.fat_sectors_count as usize).min(DIFAT_IN_HEADER) {
        let slot = HEADER_DIFAT + i * 4;
        let location = out.sector_num + i as u32;
        out.header[slot..slot + 4].copy_from_slice(&location.to_le_bytes());
    }
    out.sector_num += out.fat_sectors_count;

    if out.fat_sectors_count as usize > DIFAT_IN_HEADER {
        return Err(MsiError::Unsupported(
            "DIFAT sectors are not supported".into(),
        ));
    }

    let padded = out.fat.len().div_ceil(entries_per_sector) * entries_per_sector;
    out.fat.resize(padded, FREESECT);
    for entry in &out.fat {
        outdata.write_all(&entry.to_le_bytes())?;
    }
    Ok(())
}

/// Backfills the counts and writes the header into the reserved first sector.
fn header_save<W: Write + Seek>(outdata: &mut W, out: &mut MsiOut) -> MsiResult<()> {
    out.set_header_u32(HEADER_FAT_SECTORS_NUM, out.fat_sectors_count);
    out.set_header_u32(HEADER_MINI_FAT_SECTORS_NUM, out.minifat_sectors_count);
    if out.sector_size == 4096 {
        out.set_header_u32(HEADER_DIR_SECTORS_NUM, out.dirtree_sectors_count);
    }

    outdata.seek(SeekFrom::Start(0))?;
    outdata.write_all(&out.header)?;
    if out.sector_size > HEADER_SIZE {
        outdata.write_all(&vec![0u8; out.sector_size - HEADER_SIZE])?;
    }
    Ok(())
}
