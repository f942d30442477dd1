//! In-memory index of the tag hierarchy.
//!
//! The cache is an arena: every tag lives in one flat map keyed by id, and the
//! tree structure is expressed purely through ids (`parent_id` and the child id
//! set on each [`Tag`]). Alongside it the cache keeps the full descendant
//! closure of every node so subtree queries never walk the tree.
//!
//! The cache performs no I/O and no locking. [`TagService`](crate::TagService)
//! owns it, guards it with a lock, and only mutates it after the matching store
//! transaction has committed.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::error::{TagError, TagResult};
use crate::{Tag, TagId, TagNode, TagRow};

/// Tag arena plus precomputed descendant closures.
#[derive(Debug, Default)]
pub struct TagCache {
    by_id: HashMap<TagId, Tag>,
    descendants_of: HashMap<TagId, HashSet<TagId>>,
}

impl TagCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a cache populated from the given root nodes.
    pub fn from_roots(roots: Vec<TagNode>) -> Self {
        let mut cache = Self::new();
        cache.build(roots);
        cache
    }

    /// Replaces all state with the forest rooted at `roots`.
    ///
    /// Parent links come from the nesting of the nodes, not from the
    /// `parent_id` recorded on each row. A node whose id was already indexed is
    /// skipped along with its subtree.
    pub fn build(&mut self, roots: Vec<TagNode>) {
        self.by_id.clear();
        self.descendants_of.clear();

        for root in roots {
            self.index(root, None);
        }

        debug!(tags = self.by_id.len(), "Built tag cache");
    }

    /// Indexes `node` and its subtree, returning every id in that subtree
    /// (including the node itself), or `None` when the node was skipped.
    fn index(&mut self, node: TagNode, parent: Option<&TagId>) -> Option<HashSet<TagId>> {
        let TagNode { row, children } = node;

        if self.by_id.contains_key(&row.id) {
            warn!(id = %row.id, "Duplicate tag id while building cache, skipping subtree");
            return None;
        }

        let id = row.id.clone();
        let mut tag = Tag::from_row(row);
        tag.set_parent(parent.cloned());
        self.by_id.insert(id.clone(), tag);

        let mut descendants = HashSet::new();
        for child in children {
            let child_id = child.row.id.clone();
            if let Some(subtree) = self.index(child, Some(&id)) {
                if let Some(tag) = self.by_id.get_mut(&id) {
                    tag.children_mut().insert(child_id);
                }
                descendants.extend(subtree);
            }
        }

        let mut subtree = descendants.clone();
        subtree.insert(id.clone());
        self.descendants_of.insert(id, descendants);
        Some(subtree)
    }

    /// Returns the tag with the given id.
    pub fn get(&self, id: &TagId) -> Option<&Tag> {
        self.by_id.get(id)
    }

    /// Returns true if the id is cached.
    pub fn contains(&self, id: &TagId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Returns the tags for the known ids, in request order.
    ///
    /// Lookup is lenient: unknown ids are silently dropped and repeated ids are
    /// returned once. Callers that need every id to resolve must compare the
    /// lengths themselves.
    pub fn get_many(&self, ids: &[TagId]) -> Vec<&Tag> {
        let mut seen = HashSet::new();
        ids.iter()
            .filter(|id| seen.insert(*id))
            .filter_map(|id| self.by_id.get(id))
            .collect()
    }

    /// Returns the tag followed by all of its descendants (ordered by id).
    pub fn subtree(&self, id: &TagId) -> Option<Vec<&Tag>> {
        let tag = self.by_id.get(id)?;
        let mut descendants: Vec<&Tag> = self
            .descendants_of
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|d| self.by_id.get(d))
            .collect();
        descendants.sort_by(|a, b| a.id().cmp(b.id()));

        let mut subtree = Vec::with_capacity(descendants.len() + 1);
        subtree.push(tag);
        subtree.extend(descendants);
        Some(subtree)
    }

    /// Finds a tag by the `/`-separated names leading to it from a root.
    ///
    /// Each segment is matched against the names of the current level's tags,
    /// roots first. Where siblings share a name the first by id wins. Returns
    /// `None` for an empty path or when any segment has no match.
    pub fn by_path(&self, path: &str) -> Option<&Tag> {
        let mut segments = path.split('/').map(str::trim);
        let first = segments.next().filter(|s| !s.is_empty())?;

        let mut current = self
            .root_tags()
            .into_iter()
            .filter(|t| t.name() == first)
            .min_by(|a, b| a.id().cmp(b.id()))?;
        for segment in segments {
            current = current
                .children()
                .iter()
                .filter_map(|child| self.by_id.get(child))
                .find(|child| child.name() == segment)?;
        }
        Some(current)
    }

    /// Returns every tag without a parent, ordered by name then id.
    pub fn root_tags(&self) -> Vec<&Tag> {
        let mut roots: Vec<&Tag> = self.by_id.values().filter(|t| t.is_root()).collect();
        roots.sort_by(|a, b| a.name().cmp(b.name()).then_with(|| a.id().cmp(b.id())));
        roots
    }

    /// Iterates over every cached tag in no particular order.
    pub fn all(&self) -> impl Iterator<Item = &Tag> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Returns the ancestor chain of `id`, nearest parent first.
    pub fn ancestors(&self, id: &TagId) -> Option<Vec<&Tag>> {
        let tag = self.by_id.get(id)?;
        Some(
            tag.parent_id()
                .map(|parent| self.chain_from(parent))
                .unwrap_or_default()
                .iter()
                .filter_map(|a| self.by_id.get(a))
                .collect(),
        )
    }

    /// Inserts a new tag, optionally under `parent`.
    ///
    /// The parent must already be cached. On failure the cache is unchanged.
    /// Every ancestor of the new tag gains it in its closure.
    pub fn add(&mut self, row: TagRow, parent: Option<&TagId>) -> TagResult<&Tag> {
        if self.by_id.contains_key(&row.id) {
            return Err(TagError::AlreadyExists(row.id));
        }
        if let Some(parent) = parent
            && !self.by_id.contains_key(parent)
        {
            return Err(TagError::InvalidParent(parent.clone()));
        }

        let id = row.id.clone();
        let mut tag = Tag::from_row(row);
        tag.set_parent(parent.cloned());
        self.by_id.insert(id.clone(), tag);
        self.descendants_of.insert(id.clone(), HashSet::new());

        if let Some(parent) = parent {
            if let Some(parent_tag) = self.by_id.get_mut(parent) {
                parent_tag.children_mut().insert(id.clone());
            }
            for ancestor in self.chain_from(parent) {
                if let Some(closure) = self.descendants_of.get_mut(&ancestor) {
                    closure.insert(id.clone());
                }
            }
        }

        debug!(%id, parent = ?parent, "Added tag to cache");
        self.by_id.get(&id).ok_or(TagError::NotFound(id))
    }

    /// Checks that `id` may be placed under `new_parent` without mutating anything.
    ///
    /// Fails with `NotFound` for an unknown tag, `InvalidParent` for an unknown
    /// parent and `CyclicParent` when the parent sits inside the tag's subtree.
    pub fn validate_parent(&self, id: &TagId, new_parent: Option<&TagId>) -> TagResult<()> {
        if !self.by_id.contains_key(id) {
            return Err(TagError::NotFound(id.clone()));
        }
        let Some(parent) = new_parent else {
            return Ok(());
        };
        if !self.by_id.contains_key(parent) {
            return Err(TagError::InvalidParent(parent.clone()));
        }
        let inside = parent == id
            || self
                .descendants_of
                .get(id)
                .is_some_and(|closure| closure.contains(parent));
        if inside {
            return Err(TagError::CyclicParent {
                id: id.clone(),
                parent: parent.clone(),
            });
        }
        Ok(())
    }

    /// Applies an updated row and, if the parent changed, moves the tag.
    ///
    /// A move carries the whole subtree along: the tag and its descendants are
    /// removed from the closure of every old ancestor and added to the closure
    /// of every new ancestor. Children and their own closures are unaffected.
    /// A name-only change touches no closure.
    pub fn update(&mut self, new_parent: Option<&TagId>, row: &TagRow) -> TagResult<&Tag> {
        let current_parent = self
            .by_id
            .get(&row.id)
            .ok_or_else(|| TagError::NotFound(row.id.clone()))?
            .parent_id()
            .cloned();

        if current_parent.as_ref() != new_parent {
            self.validate_parent(&row.id, new_parent)?;
            self.relink(&row.id, current_parent.as_ref(), new_parent);
        }

        let tag = self
            .by_id
            .get_mut(&row.id)
            .ok_or_else(|| TagError::NotFound(row.id.clone()))?;
        tag.refresh_from(row);
        Ok(&*tag)
    }

    fn relink(&mut self, id: &TagId, old_parent: Option<&TagId>, new_parent: Option<&TagId>) {
        let mut moved: Vec<TagId> = self
            .descendants_of
            .get(id)
            .map(|closure| closure.iter().cloned().collect())
            .unwrap_or_default();
        moved.push(id.clone());

        if let Some(old) = old_parent {
            if let Some(old_tag) = self.by_id.get_mut(old) {
                old_tag.children_mut().remove(id);
            }
            for ancestor in self.chain_from(old) {
                if let Some(closure) = self.descendants_of.get_mut(&ancestor) {
                    for m in &moved {
                        closure.remove(m);
                    }
                }
            }
        }

        if let Some(new) = new_parent {
            if let Some(new_tag) = self.by_id.get_mut(new) {
                new_tag.children_mut().insert(id.clone());
            }
            for ancestor in self.chain_from(new) {
                if let Some(closure) = self.descendants_of.get_mut(&ancestor) {
                    closure.extend(moved.iter().cloned());
                }
            }
        }

        if let Some(tag) = self.by_id.get_mut(id) {
            tag.set_parent(new_parent.cloned());
        }

        debug!(%id, from = ?old_parent, to = ?new_parent, moved = moved.len(), "Re-parented tag");
    }

    /// Removes `id` and its whole subtree. Does nothing if `id` is unknown.
    ///
    /// Children are removed before their parent, so by the time a node is
    /// unlinked its closure is already empty.
    pub fn delete(&mut self, id: &TagId) {
        let Some(tag) = self.by_id.get(id) else {
            return;
        };
        let children: Vec<TagId> = tag.children().iter().cloned().collect();
        let parent = tag.parent_id().cloned();

        for child in &children {
            self.delete(child);
        }

        if let Some(parent) = parent {
            for ancestor in self.chain_from(&parent) {
                if let Some(closure) = self.descendants_of.get_mut(&ancestor) {
                    closure.remove(id);
                }
            }
            if let Some(parent_tag) = self.by_id.get_mut(&parent) {
                parent_tag.children_mut().remove(id);
            }
        }

        self.by_id.remove(id);
        self.descendants_of.remove(id);
    }

    /// Returns `start` followed by each of its ancestors up to the root.
    ///
    /// Bounded by the number of cached tags so a corrupted parent chain cannot
    /// loop forever.
    fn chain_from(&self, start: &TagId) -> Vec<TagId> {
        let mut chain = Vec::new();
        let mut current = Some(start);
        while let Some(id) = current {
            if chain.len() > self.by_id.len() {
                warn!(%start, "Parent chain exceeds cache size, cycle suspected");
                break;
            }
            chain.push(id.clone());
            current = self.by_id.get(id).and_then(Tag::parent_id);
        }
        chain
    }

    /// Checks every structural invariant, returning a description of the first
    /// violation found.
    ///
    /// Verified: parent chains terminate at a root, parent ids resolve, parent
    /// and child links agree, and each stored closure equals the set reachable
    /// through child links.
    pub fn verify(&self) -> Result<(), String> {
        for (id, tag) in &self.by_id {
            if tag.id() != id {
                return Err(format!("tag keyed as {id} carries id {}", tag.id()));
            }

            if let Some(parent) = tag.parent_id() {
                let Some(parent_tag) = self.by_id.get(parent) else {
                    return Err(format!("tag {id} references missing parent {parent}"));
                };
                if !parent_tag.children().contains(id) {
                    return Err(format!("parent {parent} does not list child {id}"));
                }
            }

            for child in tag.children() {
                match self.by_id.get(child) {
                    Some(child_tag) if child_tag.parent_id() == Some(id) => {}
                    Some(_) => return Err(format!("child {child} does not point back to {id}")),
                    None => return Err(format!("tag {id} lists missing child {child}")),
                }
            }

            let mut steps = 0;
            let mut current = tag.parent_id();
            while let Some(parent) = current {
                steps += 1;
                if steps > self.by_id.len() {
                    return Err(format!("parent chain of {id} does not terminate"));
                }
                current = self.by_id.get(parent).and_then(Tag::parent_id);
            }

            let expected = self.reachable_from(id);
            match self.descendants_of.get(id) {
                Some(closure) if *closure == expected => {}
                Some(closure) => {
                    return Err(format!(
                        "closure of {id} has {} ids, expected {}",
                        closure.len(),
                        expected.len()
                    ));
                }
                None => return Err(format!("tag {id} has no closure entry")),
            }
        }

        if self.descendants_of.len() != self.by_id.len() {
            return Err(format!(
                "{} closure entries for {} tags",
                self.descendants_of.len(),
                self.by_id.len()
            ));
        }

        Ok(())
    }

    fn reachable_from(&self, id: &TagId) -> HashSet<TagId> {
        let mut reachable = HashSet::new();
        let mut stack: Vec<&TagId> = self
            .by_id
            .get(id)
            .map(|t| t.children().iter().collect())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            if reachable.insert(next.clone())
                && let Some(tag) = self.by_id.get(next)
            {
                stack.extend(tag.children().iter());
            }
        }
        reachable
    }
}
