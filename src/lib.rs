//! Compound File Binary (CFB) container support for MSI signing.
//!
//! MSI packages are OLE compound documents. Unlike PE files, where the
//! Authenticode signature is appended to the image, MSI signatures live in
//! named streams inside the container: the PKCS#7 blob in
//! `\x05DigitalSignature` and, optionally, a metadata pre-hash in
//! `\x05MsiDigitalSignatureEx`.
//!
//! This crate parses an in-memory container, exposes its directory tree and
//! stream contents, computes the two digests those signatures cover, and
//! rewrites the container with the signature streams inserted at the root.
//! The whole image is memory-resident; all operations are synchronous and
//! single-threaded.
//!
//! ```no_run
//! use sha2::Sha256;
//!
//! # fn main() -> msi_cfb::MsiResult<()> {
//! let data = std::fs::read("installer.msi").unwrap();
//! let msi = msi_cfb::MsiFile::open(data)?;
//! let mut tree = msi_cfb::DirTree::build(&msi)?;
//!
//! let mut hasher = Sha256::new();
//! msi_cfb::content_hash(&msi, &tree, &mut hasher)?;
//! let digest = hasher.finalize();
//!
//! let pkcs7 = sign(digest.as_slice()); // external signer
//! let mut out = std::io::Cursor::new(Vec::new());
//! msi_cfb::write_msi(&msi, &mut tree, &pkcs7, &[], &mut out)?;
//! # Ok(())
//! # }
//! # use sha2::Digest;
//! # fn sign(_digest: &[u8]) -> Vec<u8> { Vec::new() }
//! ```

mod dirent;
mod format;
mod hash;
mod image;
pub mod infra;
mod tree;
mod writer;

pub use dirent::DirEntry;
pub use format::{
    DIFAT_IN_HEADER, DIFSECT, DIGITAL_SIGNATURE_EX_NAME, DIGITAL_SIGNATURE_NAME, ENDOFCHAIN,
    FATSECT, FREESECT, MAXREGSECT, MSI_MAGIC, NOSTREAM,
};
pub use hash::{content_hash, file_digest, metadata_prehash};
pub use image::{Header, MsiFile};
pub use infra::error::{MsiError, MsiResult};
pub use tree::{DirTree, NodeRef};
pub use writer::write_msi;

/// Check if data starts with the MSI/OLE magic signature.
#[must_use]
pub fn is_msi_file(data: &[u8]) -> bool {
    data.len() >= 8 && data[..8] == MSI_MAGIC
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_is_msi_magic() {
        let msi_header = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
        assert!(super::is_msi_file(&msi_header));

        let pe_header = [0x4D, 0x5A, 0x90, 0x00, 0x03, 0x00, 0x00, 0x00];
        assert!(!super::is_msi_file(&pe_header));
        assert!(!super::is_msi_file(&[0xD0, 0xCF]));
    }
}
