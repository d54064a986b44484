//! Shared fixture support: hand-assembled CFB images.
//!
//! The layout logic here is intentionally independent of the crate's writer
//! (directory first, then large payloads, mini-stream, mini-FAT, and the FAT
//! last), so writer regressions cannot confirm themselves through the
//! fixtures.

#![allow(dead_code)]

const SECTOR: usize = 512;
const MINI: usize = 64;
const CUTOFF: usize = 4096;
const DIRENT: usize = 128;
const ENDOFCHAIN: u32 = 0xFFFF_FFFE;
const FATSECT: u32 = 0xFFFF_FFFD;
const FREESECT: u32 = 0xFFFF_FFFF;
const NOSTREAM: u32 = 0xFFFF_FFFF;

/// Logical node used to describe a fixture container.
pub enum Node {
    Stream {
        name: String,
        data: Vec<u8>,
        state: [u8; 4],
    },
    Storage {
        name: String,
        clsid: [u8; 16],
        children: Vec<Node>,
    },
}

pub fn stream(name: &str, data: &[u8]) -> Node {
    Node::Stream {
        name: name.into(),
        data: data.to_vec(),
        state: [0; 4],
    }
}

pub fn stream_with_state(name: &str, data: &[u8], state: [u8; 4]) -> Node {
    Node::Stream {
        name: name.into(),
        data: data.to_vec(),
        state,
    }
}

pub fn storage(name: &str, clsid: [u8; 16], children: Vec<Node>) -> Node {
    Node::Storage {
        name: name.into(),
        clsid,
        children,
    }
}

/// UTF-16LE encoding of a name, NUL terminator included.
pub fn utf16_name(s: &str) -> Vec<u8> {
    let mut bytes = Vec::new();
    for unit in s.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes.extend_from_slice(&[0, 0]);
    bytes
}

struct Ent {
    name: Vec<u8>,
    typ: u8,
    clsid: [u8; 16],
    state: [u8; 4],
    right: u32,
    child: u32,
    start: u32,
    size: u32,
    data: Option<Vec<u8>>,
}

fn push_node(node: &Node, ents: &mut Vec<Ent>) -> usize {
    match node {
        Node::Stream { name, data, state } => {
            let idx = ents.len();
            ents.push(Ent {
                name: utf16_name(name),
                typ: 2,
                clsid: [0; 16],
                state: *state,
                right: NOSTREAM,
                child: NOSTREAM,
                start: ENDOFCHAIN,
                size: data.len() as u32,
                data: Some(data.clone()),
            });
            idx
        }
        Node::Storage {
            name,
            clsid,
            children,
        } => {
            let idx = ents.len();
            ents.push(Ent {
                name: utf16_name(name),
                typ: 1,
                clsid: *clsid,
                state: [0; 4],
                right: NOSTREAM,
                child: NOSTREAM,
                start: ENDOFCHAIN,
                size: 0,
                data: None,
            });
            link_children(children, ents, idx);
            idx
        }
    }
}

// Children are laid out as a right-linked sibling list under the parent.
fn link_children(children: &[Node], ents: &mut Vec<Ent>, parent: usize) {
    let ids: Vec<usize> = children.iter().map(|c| push_node(c, ents)).collect();
    if let Some(&first) = ids.first() {
        ents[parent].child = first as u32;
    }
    for pair in ids.windows(2) {
        ents[pair[0]].right = pair[1] as u32;
    }
}

fn put16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn serialize_ent(ent: &Ent) -> [u8; DIRENT] {
    let mut data = [0u8; DIRENT];
    let name_len = ent.name.len().min(64);
    data[0..name_len].copy_from_slice(&ent.name[..name_len]);
    put16(&mut data, 0x40, ent.name.len() as u16);
    data[0x42] = ent.typ;
    data[0x43] = 1; // black
    put32(&mut data, 0x44, NOSTREAM);
    put32(&mut data, 0x48, ent.right);
    put32(&mut data, 0x4C, ent.child);
    data[0x50..0x60].copy_from_slice(&ent.clsid);
    data[0x60..0x64].copy_from_slice(&ent.state);
    put32(&mut data, 0x74, ent.start);
    put32(&mut data, 0x78, ent.size);
    data
}

fn unused_ent() -> [u8; DIRENT] {
    let mut data = [0u8; DIRENT];
    put32(&mut data, 0x44, NOSTREAM);
    put32(&mut data, 0x48, NOSTREAM);
    put32(&mut data, 0x4C, NOSTREAM);
    data
}

/// Builds a version-3 image with the given root children.
pub fn build(children: Vec<Node>) -> Vec<u8> {
    build_with_root(children, [0; 16], [0; 4])
}

/// Builds a version-3 image with control over the root's CLSID and state.
pub fn build_with_root(children: Vec<Node>, root_clsid: [u8; 16], root_state: [u8; 4]) -> Vec<u8> {
    let mut ents: Vec<Ent> = vec![Ent {
        name: utf16_name("Root Entry"),
        typ: 5,
        clsid: root_clsid,
        state: root_state,
        right: NOSTREAM,
        child: NOSTREAM,
        start: ENDOFCHAIN,
        size: 0,
        data: None,
    }];
    link_children(&children, &mut ents, 0);

    let dir_sectors = (ents.len() * DIRENT).div_ceil(SECTOR) as u32;
    let mut chains: Vec<(u32, u32)> = vec![(0, dir_sectors)];
    let mut next_sector = dir_sectors;

    // Large payloads occupy regular sectors right after the directory.
    let mut large_buf: Vec<u8> = Vec::new();
    for ent in ents.iter_mut() {
        let Some(data) = ent.data.as_ref() else {
            continue;
        };
        if data.len() < CUTOFF {
            continue;
        }
        let count = data.len().div_ceil(SECTOR) as u32;
        ent.start = next_sector;
        chains.push((next_sector, count));
        large_buf.extend_from_slice(data);
        large_buf.resize(large_buf.len().div_ceil(SECTOR) * SECTOR, 0);
        next_sector += count;
    }

    // Small payloads go into the mini-stream with a mini-FAT chain each.
    let mut ministream: Vec<u8> = Vec::new();
    let mut minifat: Vec<u32> = Vec::new();
    for ent in ents.iter_mut() {
        let Some(data) = ent.data.as_ref() else {
            continue;
        };
        if data.is_empty() || data.len() >= CUTOFF {
            continue;
        }
        let start = minifat.len() as u32;
        let count = data.len().div_ceil(MINI) as u32;
        ent.start = start;
        ministream.extend_from_slice(data);
        ministream.resize(ministream.len().div_ceil(MINI) * MINI, 0);
        for i in 0..count {
            minifat.push(if i + 1 == count {
                ENDOFCHAIN
            } else {
                start + i + 1
            });
        }
    }

    let ministream_sectors = ministream.len().div_ceil(SECTOR) as u32;
    let ministream_start = if ministream.is_empty() {
        ENDOFCHAIN
    } else {
        next_sector
    };
    if !ministream.is_empty() {
        chains.push((next_sector, ministream_sectors));
        next_sector += ministream_sectors;
    }
    ents[0].start = ministream_start;
    ents[0].size = ministream.len() as u32;

    let minifat_sectors = (minifat.len() * 4).div_ceil(SECTOR) as u32;
    let minifat_start = if minifat.is_empty() {
        ENDOFCHAIN
    } else {
        next_sector
    };
    if !minifat.is_empty() {
        chains.push((next_sector, minifat_sectors));
        next_sector += minifat_sectors;
    }

    // The FAT maps everything so far plus its own sectors.
    let before_fat = next_sector as usize;
    let mut fat_sectors = 0usize;
    loop {
        let needed = ((before_fat + fat_sectors) * 4).div_ceil(SECTOR);
        if needed == fat_sectors {
            break;
        }
        fat_sectors = needed;
    }
    let fat_start = next_sector;

    let mut fat = vec![FREESECT; fat_sectors * (SECTOR / 4)];
    for &(start, count) in &chains {
        for i in 0..count {
            fat[(start + i) as usize] = if i + 1 == count {
                ENDOFCHAIN
            } else {
                start + i + 1
            };
        }
    }
    for i in 0..fat_sectors {
        fat[fat_start as usize + i] = FATSECT;
    }

    let mut image = vec![0u8; SECTOR];
    image[0..8].copy_from_slice(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1]);
    put16(&mut image, 0x18, 0x003E);
    put16(&mut image, 0x1A, 0x0003);
    put16(&mut image, 0x1C, 0xFFFE);
    put16(&mut image, 0x1E, 0x0009);
    put16(&mut image, 0x20, 0x0006);
    put32(&mut image, 0x2C, fat_sectors as u32);
    put32(&mut image, 0x30, 0); // directory starts at sector 0
    put32(&mut image, 0x38, CUTOFF as u32);
    put32(&mut image, 0x3C, minifat_start);
    put32(&mut image, 0x40, minifat_sectors);
    put32(&mut image, 0x44, ENDOFCHAIN);
    put32(&mut image, 0x48, 0);
    for i in 0..109 {
        let value = if i < fat_sectors {
            fat_start + i as u32
        } else {
            FREESECT
        };
        put32(&mut image, 0x4C + i * 4, value);
    }

    let mut dir_bytes: Vec<u8> = Vec::new();
    for ent in &ents {
        dir_bytes.extend_from_slice(&serialize_ent(ent));
    }
    while dir_bytes.len() % SECTOR != 0 {
        dir_bytes.extend_from_slice(&unused_ent());
    }
    image.extend_from_slice(&dir_bytes);
    image.extend_from_slice(&large_buf);

    ministream.resize(ministream.len().div_ceil(SECTOR) * SECTOR, 0);
    image.extend_from_slice(&ministream);

    minifat.resize(minifat_sectors as usize * (SECTOR / 4), FREESECT);
    for entry in &minifat {
        image.extend_from_slice(&entry.to_le_bytes());
    }
    for entry in &fat {
        image.extend_from_slice(&entry.to_le_bytes());
    }
    image
}

/// Rewrites an image through the crate's writer and returns the output bytes.
pub fn rewrite(data: Vec<u8>, p_msi: &[u8], p_msiex: &[u8]) -> Vec<u8> {
    let msi = msi_cfb::MsiFile::open(data).expect("fixture must parse");
    let mut tree = msi_cfb::DirTree::build(&msi).expect("fixture tree must build");
    let mut cursor = std::io::Cursor::new(Vec::new());
    msi_cfb::write_msi(&msi, &mut tree, p_msi, p_msiex, &mut cursor).expect("rewrite must succeed");
    cursor.into_inner()
}

/// Reads one stream's full contents from a parsed image.
pub fn read_stream(msi: &msi_cfb::MsiFile, entry: &msi_cfb::DirEntry) -> Vec<u8> {
    let mut buf = vec![0u8; entry.size() as usize];
    msi.read(entry, 0, &mut buf).expect("stream read");
    buf
}
