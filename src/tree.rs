//! Logical directory tree materialized from the on-disk red-black structures.
//!
//! Each storage's red-black tree of children is collapsed into a flat child
//! list; the traversal order is an artifact of the sibling links and carries
//! no meaning, so every consumer re-sorts with the comparator it needs.

use std::collections::HashSet;

use crate::dirent::DirEntry;
use crate::format::{DIGITAL_SIGNATURE_EX_NAME, DIGITAL_SIGNATURE_NAME, NOSTREAM};
use crate::image::MsiFile;
use crate::infra::error::{MsiError, MsiResult};

#[derive(Debug, Clone)]
pub(crate) struct DirNode {
    pub(crate) entry: DirEntry,
    pub(crate) children: Vec<usize>,
}

/// The materialized directory tree: an arena of entries with per-storage
/// child lists. Node 0 is always the root.
#[derive(Debug, Clone)]
pub struct DirTree {
    nodes: Vec<DirNode>,
}

impl DirTree {
    /// Materializes the tree starting from directory entry 0.
    ///
    /// Entry ids are tracked in a visited set so sibling/child pointer cycles
    /// in corrupt images are rejected instead of recursed forever.
    ///
    /// # Errors
    /// Returns `Malformed` for out-of-range ids and pointer cycles.
    pub fn build(msi: &MsiFile) -> MsiResult<DirTree> {
        let mut tree = DirTree { nodes: Vec::new() };
        let mut visited = HashSet::new();
        tree.visit(msi, 0, None, &mut visited)?;
        log::debug!("materialized directory tree with {} entries", tree.nodes.len());
        Ok(tree)
    }

    fn visit(
        &mut self,
        msi: &MsiFile,
        id: u32,
        parent: Option<usize>,
        visited: &mut HashSet<u32>,
    ) -> MsiResult<()> {
        if id == NOSTREAM {
            return Ok(());
        }
        if !visited.insert(id) {
            return Err(MsiError::Malformed(format!(
                "directory entry cycle detected at id {id}"
            )));
        }

        let entry = msi.entry(id)?;
        let left = entry.left_sibling_id;
        let right = entry.right_sibling_id;
        let child = entry.child_id;
        let is_stream = entry.is_stream();

        let idx = self.nodes.len();
        self.nodes.push(DirNode {
            entry,
            children: Vec::new(),
        });
        if let Some(parent) = parent {
            self.nodes[parent].children.push(idx);
        }

        // Siblings share this node's parent; the child subtree hangs below.
        self.visit(msi, left, parent, visited)?;
        self.visit(msi, right, parent, visited)?;
        if !is_stream {
            self.visit(msi, child, Some(idx), visited)?;
        }
        Ok(())
    }

    pub(crate) fn node(&self, idx: usize) -> &DirNode {
        &self.nodes[idx]
    }

    pub(crate) fn node_mut(&mut self, idx: usize) -> &mut DirNode {
        &mut self.nodes[idx]
    }

    pub(crate) fn children(&self, idx: usize) -> &[usize] {
        &self.nodes[idx].children
    }

    /// The root entry.
    #[must_use]
    pub fn root_entry(&self) -> &DirEntry {
        &self.nodes[0].entry
    }

    /// A cursor over the root node.
    #[must_use]
    pub fn root(&self) -> NodeRef<'_> {
        NodeRef { tree: self, idx: 0 }
    }

    /// Finds the `DigitalSignature` and `MsiDigitalSignatureEx` streams among
    /// the root's children.
    #[must_use]
    pub fn find_signatures(&self) -> (Option<&DirEntry>, Option<&DirEntry>) {
        let mut ds = None;
        let mut dse = None;
        for &child in &self.nodes[0].children {
            let entry = &self.nodes[child].entry;
            if entry.matches_name(DIGITAL_SIGNATURE_NAME) {
                ds = Some(entry);
            } else if entry.matches_name(DIGITAL_SIGNATURE_EX_NAME) {
                dse = Some(entry);
            }
        }
        (ds, dse)
    }

    /// Whether a `DigitalSignature` stream is present at the root.
    #[must_use]
    pub fn has_signature(&self) -> bool {
        self.find_signatures().0.is_some()
    }

    /// Whether an `MsiDigitalSignatureEx` stream is present at the root.
    #[must_use]
    pub fn has_signature_ex(&self) -> bool {
        self.find_signatures().1.is_some()
    }

    /// Names of all stream entries, in tree order (for diagnostics).
    #[must_use]
    pub fn stream_names(&self) -> Vec<String> {
        fn collect(tree: &DirTree, idx: usize, names: &mut Vec<String>) {
            for &child in tree.children(idx) {
                let entry = &tree.node(child).entry;
                if entry.is_stream() {
                    names.push(entry.name_string());
                } else {
                    collect(tree, child, names);
                }
            }
        }
        let mut names = Vec::new();
        collect(self, 0, &mut names);
        names
    }

    /// Removes every root child whose name matches; storages refuse deletion.
    pub(crate) fn delete_root_child(&mut self, name: &[u8]) -> MsiResult<()> {
        let root_children = self.nodes[0].children.clone();
        for &child in &root_children {
            let entry = &self.nodes[child].entry;
            if entry.matches_name(name) && !entry.is_stream() {
                return Err(MsiError::InvalidArgument(
                    "cannot delete or replace storages".into(),
                ));
            }
        }
        let nodes = &self.nodes;
        let matched: Vec<usize> = root_children
            .iter()
            .copied()
            .filter(|&c| nodes[c].entry.matches_name(name))
            .collect();
        self.nodes[0]
            .children
            .retain(|c| !matched.contains(c));
        Ok(())
    }

    /// Replaces (delete-then-append) a root stream with a fresh empty entry.
    pub(crate) fn insert_root_stream(&mut self, name: &[u8]) -> MsiResult<()> {
        self.delete_root_child(name)?;
        let idx = self.nodes.len();
        self.nodes.push(DirNode {
            entry: DirEntry::new_stream(name),
            children: Vec::new(),
        });
        self.nodes[0].children.push(idx);
        Ok(())
    }

    /// Installs the signature entries at the root: `MsiDigitalSignatureEx`
    /// first (replaced when present in the output, deleted otherwise), then
    /// `DigitalSignature`.
    pub(crate) fn insert_signatures(&mut self, with_ex: bool) -> MsiResult<()> {
        if with_ex {
            self.insert_root_stream(DIGITAL_SIGNATURE_EX_NAME)?;
        } else {
            self.delete_root_child(DIGITAL_SIGNATURE_EX_NAME)?;
        }
        self.insert_root_stream(DIGITAL_SIGNATURE_NAME)?;
        Ok(())
    }
}

/// Borrowing cursor over one tree node.
#[derive(Clone, Copy)]
pub struct NodeRef<'a> {
    tree: &'a DirTree,
    idx: usize,
}

impl<'a> NodeRef<'a> {
    /// The directory entry at this node.
    #[must_use]
    pub fn entry(&self) -> &'a DirEntry {
        &self.tree.nodes[self.idx].entry
    }

    /// Children in tree order.
    pub fn children(&self) -> impl Iterator<Item = NodeRef<'a>> + 'a {
        let tree = self.tree;
        self.tree.nodes[self.idx]
            .children
            .iter()
            .map(move |&idx| NodeRef { tree, idx })
    }

    /// Finds a direct child by decoded logical name.
    #[must_use]
    pub fn find_child(&self, name: &str) -> Option<NodeRef<'a>> {
        self.children().find(|c| c.entry().name_string() == name)
    }
}
