//! Digest traversals for Authenticode MSI signing.
//!
//! Two recursive passes share child ordering but emit different bytes: the
//! content hash feeds stream payloads (plus each storage's CLSID), while the
//! metadata pre-hash feeds per-entry names, sizes, state bits and timestamps
//! for `MsiDigitalSignatureEx`.

use digest::Digest;

use crate::dirent::DirEntry;
use crate::format::DIR_STORAGE;
use crate::image::MsiFile;
use crate::infra::error::MsiResult;
use crate::tree::DirTree;

/// Chunk size for whole-file digests.
const FILE_DIGEST_CHUNK: usize = 16 * 1024 * 1024;

/// Feeds the container's content to `hash` in signing order.
///
/// At every storage the children are sorted with the hashing comparator,
/// stream payloads are emitted in that order (signature streams are skipped
/// at the root), storages recurse, and the storage's own CLSID is appended
/// after its children.
///
/// # Errors
/// Returns an error when a stream's bytes cannot be read from the image.
pub fn content_hash<D: Digest>(msi: &MsiFile, tree: &DirTree, hash: &mut D) -> MsiResult<()> {
    hash_dir(msi, tree, 0, hash, true)
}

fn hash_dir<D: Digest>(
    msi: &MsiFile,
    tree: &DirTree,
    idx: usize,
    hash: &mut D,
    is_root: bool,
) -> MsiResult<()> {
    let mut children = tree.children(idx).to_vec();
    children.sort_by(|&a, &b| tree.node(a).entry.cmp_hash(&tree.node(b).entry));

    log::trace!(
        "hashing storage {:?} with {} children",
        tree.node(idx).entry.name_string(),
        children.len()
    );

    for child in children {
        let entry = &tree.node(child).entry;
        if is_root && entry.is_signature_name() {
            continue;
        }
        if entry.is_stream() {
            let inlen = entry.size() as u32;
            if inlen == 0 {
                continue;
            }
            let mut indata = vec![0u8; inlen as usize];
            msi.read(entry, 0, &mut indata)?;
            hash.update(&indata);
        } else if entry.object_type == DIR_STORAGE {
            hash_dir(msi, tree, child, hash, false)?;
        }
    }

    hash.update(tree.node(idx).entry.clsid);
    Ok(())
}

/// Feeds the container's metadata to `hash` in signing order, producing the
/// input of the `MsiDigitalSignatureEx` pre-hash.
///
/// Unlike the content hash this touches no stream payloads: it covers names,
/// sizes, state bits and timestamps only.
pub fn metadata_prehash<D: Digest>(tree: &DirTree, hash: &mut D) {
    prehash_dir(tree, 0, hash, true);
}

/// One entry's metadata record.
fn prehash_metadata<D: Digest>(entry: &DirEntry, hash: &mut D) {
    if !entry.is_root() {
        hash.update(entry.name_bytes());
    }
    if entry.is_stream() {
        hash.update((entry.size() as u32).to_le_bytes());
    } else {
        hash.update(entry.clsid);
    }
    hash.update(entry.state_bits);
    if !entry.is_root() {
        hash.update(entry.creation_time);
        hash.update(entry.modified_time);
    }
}

fn prehash_dir<D: Digest>(tree: &DirTree, idx: usize, hash: &mut D, is_root: bool) {
    prehash_metadata(&tree.node(idx).entry, hash);

    let mut children = tree.children(idx).to_vec();
    children.sort_by(|&a, &b| tree.node(a).entry.cmp_hash(&tree.node(b).entry));

    for child in children {
        let entry = &tree.node(child).entry;
        if is_root && entry.is_signature_name() {
            continue;
        }
        if entry.is_stream() {
            prehash_metadata(entry, hash);
        } else if entry.object_type == DIR_STORAGE {
            prehash_dir(tree, child, hash, false);
        }
    }
}

/// Digest over the raw image bytes, fed in bounded chunks.
#[must_use]
pub fn file_digest<D: Digest>(data: &[u8]) -> digest::Output<D> {
    let mut md = D::new();
    for chunk in data.chunks(FILE_DIGEST_CHUNK) {
        md.update(chunk);
    }
    md.finalize()
}
