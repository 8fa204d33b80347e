//! Synthetic inode virtualization.
//!
//! [`InodeTable`] maps synthetic inodes (the numbers the kernel sees) to an engine-specific
//! binding of backend inodes, using two [`scc::HashMap`]s guarded by a coordination lock for
//! cross-map atomicity. Each composition engine owns its own table.

use std::hash::Hash;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{FsError, Ino, ROOT_INO};

struct Slot<B> {
    binding: B,
    /// Kernel references handed out for this inode and not yet forgotten.
    refs: u64,
}

/// Bidirectional mapping between synthetic inodes and backend bindings.
///
/// Reads go straight to the concurrent maps. Mutations that touch both maps are serialized by a
/// `Mutex<()>`, so a concurrent `forget` cannot interleave with a mint and leave an orphaned
/// entry. Minting deduplicates by binding: two racing lookups of one backend entity receive the
/// same synthetic inode.
pub struct InodeTable<B> {
    /// synthetic -> binding
    fwd: scc::HashMap<Ino, Slot<B>>,
    /// binding -> synthetic
    bwd: scc::HashMap<B, Ino>,
    /// Serializes mutations that touch both maps.
    mu: Mutex<()>,
    next_ino: AtomicU64,
}

impl<B> InodeTable<B>
where
    B: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Creates a table with the root inode pinned to `root`.
    #[must_use]
    pub fn new(root: B) -> Self {
        let fwd = scc::HashMap::new();
        let bwd = scc::HashMap::new();
        let _ = bwd.insert_sync(root.clone(), ROOT_INO);
        let _ = fwd.insert_sync(
            ROOT_INO,
            Slot {
                binding: root,
                refs: 0,
            },
        );
        Self {
            fwd,
            bwd,
            mu: Mutex::new(()),
            next_ino: AtomicU64::new(ROOT_INO + 1),
        }
    }

    /// Resolve a synthetic inode to its binding.
    #[must_use]
    pub fn resolve(&self, ino: Ino) -> Option<B> {
        self.fwd.read_sync(&ino, |_, slot| slot.binding.clone())
    }

    /// Resolve a synthetic inode, failing with [`FsError::ProviderNotFound`] if it was never
    /// minted or has been forgotten.
    pub fn require(&self, ino: Ino) -> Result<B, FsError> {
        self.resolve(ino).ok_or(FsError::ProviderNotFound(ino))
    }

    /// The synthetic inode currently bound to `binding`, if any.
    #[must_use]
    pub fn backward(&self, binding: &B) -> Option<Ino> {
        self.bwd.read_sync(binding, |_, &ino| ino)
    }

    /// Mint (or reuse) the synthetic inode for `binding` and count one kernel reference to it.
    ///
    /// Use this for every reply that hands an inode to the kernel with a lookup count: `lookup`,
    /// `create`, `mkdir`, `mknod`, `link`, `symlink`, `tmpfile` and `readdirplus`.
    #[must_use]
    pub fn intern(&self, binding: B) -> Ino {
        self.mint(binding, 1)
    }

    /// Mint (or reuse) the synthetic inode for `binding` without counting a kernel reference.
    ///
    /// Plain `readdir` entries do not carry a lookup count.
    #[must_use]
    pub fn observe(&self, binding: B) -> Ino {
        self.mint(binding, 0)
    }

    fn mint(&self, binding: B, refs: u64) -> Ino {
        let _guard = self
            .mu
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match self.bwd.entry_sync(binding.clone()) {
            scc::hash_map::Entry::Occupied(occ) => {
                let ino = *occ.get();
                if refs > 0
                    && let scc::hash_map::Entry::Occupied(mut slot) = self.fwd.entry_sync(ino)
                {
                    slot.get_mut().refs += refs;
                }
                ino
            }
            scc::hash_map::Entry::Vacant(vac) => {
                let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
                vac.insert_entry(ino);
                let _ = self.fwd.insert_sync(ino, Slot { binding, refs });
                ino
            }
        }
    }

    /// Drop `nlookup` kernel references to `ino`.
    ///
    /// Returns the binding if this retired the inode. The root inode is never retired.
    pub fn forget(&self, ino: Ino, nlookup: u64) -> Option<B> {
        if ino == ROOT_INO {
            return None;
        }
        let _guard = self
            .mu
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let remaining = match self.fwd.entry_sync(ino) {
            scc::hash_map::Entry::Occupied(mut occ) => {
                let slot = occ.get_mut();
                slot.refs = slot.refs.saturating_sub(nlookup);
                Some(slot.refs)
            }
            scc::hash_map::Entry::Vacant(_) => None,
        };
        if remaining != Some(0) {
            return None;
        }
        let (_, slot) = self.fwd.remove_sync(&ino)?;
        self.bwd.remove_sync(&slot.binding);
        Some(slot.binding)
    }

    /// Number of live synthetic inodes, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fwd.len()
    }

    /// Whether only the root is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_pinned_to_one() {
        let table = InodeTable::new((0_usize, 1_u64));
        assert_eq!(table.resolve(ROOT_INO), Some((0, 1)));
        assert_eq!(table.forget(ROOT_INO, 10), None);
        assert_eq!(table.resolve(ROOT_INO), Some((0, 1)));
    }

    #[test]
    fn first_minted_inode_is_above_root() {
        let table = InodeTable::new((0_usize, 1_u64));
        assert_eq!(table.intern((0, 77)), 2);
        assert_eq!(table.intern((1, 77)), 3);
    }
}
