//! The revision tree.
//!
//! Revisions live in an arena owned by the tree; parent links are arena
//! indices, so grafting and pruning never chase raw pointers. Callers hold
//! indices as cursors and must treat them as invalidated by `prune`.

use crate::error::{Error, Result};
use crate::revid::RevId;

/// Where a revision's body currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevBody {
    /// Held in memory and stored inline with the document metadata.
    Inline(Vec<u8>),
    /// Stored as the body of the document's own store record; present when
    /// the record was loaded without its body.
    InRecord,
    /// Persisted in the body-overflow store under (doc id, sequence).
    External,
    /// Nothing stored; reading it reports the body as gone.
    Absent,
}

impl RevBody {
    pub fn inline(&self) -> Option<&[u8]> {
        match self {
            RevBody::Inline(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// One node of a document's revision history.
#[derive(Debug, Clone)]
pub struct Revision {
    rev_id: RevId,
    pub(crate) parent: Option<usize>,
    pub(crate) sequence: u64,
    pub(crate) deleted: bool,
    pub(crate) leaf: bool,
    pub(crate) new: bool,
    pub(crate) has_attachments: bool,
    pub(crate) body: RevBody,
}

impl Revision {
    pub fn rev_id(&self) -> &RevId {
        &self.rev_id
    }

    /// The store sequence assigned when this revision was saved; 0 until then.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn is_leaf(&self) -> bool {
        self.leaf
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_new(&self) -> bool {
        self.new
    }

    pub fn has_attachments(&self) -> bool {
        self.has_attachments
    }

    pub fn body(&self) -> &RevBody {
        &self.body
    }
}

/// Arena of revisions linked into a tree (or forest, when conflicting
/// branches have separate roots).
#[derive(Debug, Clone, Default)]
pub struct RevTree {
    revs: Vec<Revision>,
}

impl RevTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.revs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Revision> {
        self.revs.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Revision> {
        self.revs.get_mut(index)
    }

    pub fn find(&self, rev_id: &RevId) -> Option<usize> {
        self.revs.iter().position(|r| r.rev_id == *rev_id)
    }

    pub fn revisions(&self) -> impl Iterator<Item = &Revision> {
        self.revs.iter()
    }

    pub(crate) fn revisions_mut(&mut self) -> impl Iterator<Item = &mut Revision> {
        self.revs.iter_mut()
    }

    /// Appends a revision restored from storage, bypassing insertion
    /// checks. The caller is responsible for index validity.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn push_loaded(
        &mut self,
        rev_id: RevId,
        parent: Option<usize>,
        sequence: u64,
        deleted: bool,
        leaf: bool,
        has_attachments: bool,
        body: RevBody,
    ) {
        self.revs.push(Revision {
            rev_id,
            parent,
            sequence,
            deleted,
            leaf,
            new: false,
            has_attachments,
            body,
        });
    }

    /// The winning revision: among leaves, non-deleted beats deleted, then
    /// higher generation, then lexicographically larger digest.
    pub fn current_index(&self) -> Option<usize> {
        self.revs
            .iter()
            .enumerate()
            .filter(|(_, r)| r.leaf)
            .max_by(|(_, a), (_, b)| {
                (!a.deleted, &a.rev_id).cmp(&(!b.deleted, &b.rev_id))
            })
            .map(|(i, _)| i)
    }

    /// More than one non-deleted leaf means the document is in conflict.
    pub fn is_conflicted(&self) -> bool {
        self.revs.iter().filter(|r| r.leaf && !r.deleted).count() > 1
    }

    pub(crate) fn any_leaf_has_attachments(&self) -> bool {
        self.revs.iter().any(|r| r.leaf && r.has_attachments)
    }

    /// Inserts a new revision as a child of `parent`.
    ///
    /// Returns the arena index of the inserted (or already-present)
    /// revision. An existing id is idempotent success unless its
    /// in-memory body differs from `body`. Fails with `Conflict` for a
    /// disallowed branch or a duplicate with a differing body, and
    /// `BadRequest` for a generation mismatch.
    pub fn insert(
        &mut self,
        rev_id: RevId,
        body: Vec<u8>,
        deleted: bool,
        has_attachments: bool,
        parent: Option<usize>,
        allow_conflict: bool,
    ) -> Result<usize> {
        if let Some(existing) = self.find(&rev_id) {
            // Only an in-memory body can prove a mismatch. A body living
            // in the store record or the overflow store is compared by
            // the document layer, which can load it.
            return match self.revs[existing].body.inline() {
                Some(stored) if stored != body.as_slice() => Err(Error::Conflict),
                _ => Ok(existing),
            };
        }

        if parent.is_none() && !allow_conflict {
            if let Some(current) = self.current_index() {
                if !self.revs[current].deleted {
                    return Err(Error::Conflict);
                }
            }
        }

        if let Some(p) = parent {
            if !self.revs[p].leaf && !allow_conflict {
                return Err(Error::Conflict);
            }
        }

        let parent_gen = parent.map_or(0, |p| self.revs[p].rev_id.generation());
        if rev_id.generation() != parent_gen + 1 {
            return Err(Error::BadRequest(format!(
                "generation {} does not follow parent generation {}",
                rev_id.generation(),
                parent_gen
            )));
        }

        if let Some(p) = parent {
            self.revs[p].leaf = false;
        }
        self.revs.push(Revision {
            rev_id,
            parent,
            sequence: 0,
            deleted,
            leaf: true,
            new: true,
            has_attachments,
            body: RevBody::Inline(body),
        });
        Ok(self.revs.len() - 1)
    }

    /// Grafts a revision history, ordered newest to oldest, onto the tree.
    ///
    /// Returns the index into `history` of the common ancestor: the first
    /// entry already present. Entries before it are inserted as a chain;
    /// if none is present the whole chain becomes a new branch and the
    /// returned index is `history.len()`. The body and flags apply to
    /// `history[0]` only.
    pub fn insert_history(
        &mut self,
        history: &[RevId],
        body: Vec<u8>,
        deleted: bool,
        has_attachments: bool,
    ) -> Result<usize> {
        if history.is_empty() {
            return Err(Error::BadRequest("empty revision history".into()));
        }
        for pair in history.windows(2) {
            if pair[0].generation() <= pair[1].generation() {
                return Err(Error::BadRequest(format!(
                    "history generations not strictly decreasing: {} then {}",
                    pair[0], pair[1]
                )));
            }
        }

        let common = history
            .iter()
            .position(|id| self.find(id).is_some())
            .unwrap_or(history.len());
        if common == 0 {
            return Ok(0);
        }

        // Build the chain oldest-first so each node can point at the one
        // below it.
        let mut parent = match history.get(common) {
            Some(ancestor) => {
                let idx = self
                    .find(ancestor)
                    .ok_or_else(|| Error::unknown("history ancestor vanished"))?;
                self.revs[idx].leaf = false;
                Some(idx)
            }
            None => None,
        };
        for id in history[..common].iter().rev() {
            let is_newest = *id == history[0];
            self.revs.push(Revision {
                rev_id: id.clone(),
                parent,
                sequence: 0,
                deleted: is_newest && deleted,
                leaf: is_newest,
                new: true,
                has_attachments: is_newest && has_attachments,
                body: if is_newest {
                    RevBody::Inline(body.clone())
                } else {
                    RevBody::Absent
                },
            });
            parent = Some(self.revs.len() - 1);
        }
        Ok(common)
    }

    /// Removes revisions whose distance to the nearest leaf is `max_depth`
    /// or more, reparenting survivors onto their nearest retained ancestor.
    /// Leaves are never removed. Returns the number of revisions dropped.
    pub fn prune(&mut self, max_depth: u64) -> usize {
        if max_depth == 0 || self.revs.len() as u64 <= max_depth {
            return 0;
        }

        let mut depth = vec![u64::MAX; self.revs.len()];
        for (i, rev) in self.revs.iter().enumerate() {
            if !rev.leaf {
                continue;
            }
            let mut cursor = Some(i);
            let mut d = 0u64;
            while let Some(idx) = cursor {
                if depth[idx] <= d {
                    break;
                }
                depth[idx] = d;
                cursor = self.revs[idx].parent;
                d += 1;
            }
        }

        let keep: Vec<bool> = depth.iter().map(|&d| d < max_depth).collect();
        if keep.iter().all(|&k| k) {
            return 0;
        }

        let mut remap = vec![None; self.revs.len()];
        let mut kept = Vec::with_capacity(self.revs.len());
        for (i, rev) in self.revs.iter().enumerate() {
            if keep[i] {
                remap[i] = Some(kept.len());
                kept.push(rev.clone());
            }
        }
        for rev in kept.iter_mut() {
            let mut ancestor = rev.parent;
            rev.parent = loop {
                match ancestor {
                    Some(a) if keep[a] => break remap[a],
                    Some(a) => ancestor = self.revs[a].parent,
                    None => break None,
                }
            };
        }
        let removed = self.revs.len() - kept.len();
        self.revs = kept;
        removed
    }

    /// First revision in depth-first pre-order, or `None` on an empty tree.
    pub fn first_in_preorder(&self) -> Option<usize> {
        self.revs.iter().position(|r| r.parent.is_none())
    }

    /// Depth-first pre-order successor of `index`: first child, else next
    /// sibling of the closest ancestor that has one. Root-less branches
    /// count as siblings in arena order.
    pub fn next_in_preorder(&self, index: usize) -> Option<usize> {
        if let Some(child) = self.first_child(index) {
            return Some(child);
        }
        let mut cursor = index;
        loop {
            if let Some(sibling) = self.next_sibling(cursor) {
                return Some(sibling);
            }
            match self.revs[cursor].parent {
                Some(p) => cursor = p,
                None => return None,
            }
        }
    }

    /// Advances pre-order from `index` to the next leaf, honoring the
    /// deletion filter.
    pub fn next_leaf(&self, index: usize, include_deleted: bool) -> Option<usize> {
        let mut cursor = self.next_in_preorder(index);
        while let Some(i) = cursor {
            let rev = &self.revs[i];
            if rev.leaf && (include_deleted || !rev.deleted) {
                return Some(i);
            }
            cursor = self.next_in_preorder(i);
        }
        None
    }

    fn first_child(&self, index: usize) -> Option<usize> {
        self.revs.iter().position(|r| r.parent == Some(index))
    }

    fn next_sibling(&self, index: usize) -> Option<usize> {
        let parent = self.revs[index].parent;
        self.revs
            .iter()
            .enumerate()
            .skip(index + 1)
            .find(|(_, r)| r.parent == parent)
            .map(|(i, _)| i)
    }
}
