use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::error::{TagError, TagResult};
use crate::store::{TagStore, delete_tag_tree};
use crate::utils::{generate_tag_id, now};
use crate::{Database, EntryId, NewTag, SqliteTagStore, Tag, TagCache, TagId, TagRow};

/// Service layer for the tag hierarchy.
///
/// TagService owns the store and the in-memory [`TagCache`]. Reads are served
/// from the cache only; writes run a store transaction first and apply the
/// same change to the cache once it has committed. Every returned [`Tag`] is a
/// copy, so callers never observe later cache mutations through it.
///
/// The cache is built lazily on first use. All cache mutations, including
/// that first build, happen under an exclusive lock; reads share a lock for as
/// long as it takes to copy their results out. A write holds the exclusive
/// lock across its store transaction, so the cache sees changes in commit
/// order. Reads therefore block while a write's transaction is in flight.
///
/// # Examples
///
/// ```
/// use tagtree::{Database, NewTag, TagService};
///
/// # fn main() -> anyhow::Result<()> {
/// let service = TagService::with_database(Database::in_memory()?);
///
/// let lang = service.add_tag(NewTag::root("languages"))?;
/// let rust = service.add_tag(NewTag::child("rust", lang.id().clone()))?;
///
/// let subtree = service.subtree(lang.id())?;
/// assert_eq!(subtree.len(), 2);
/// assert_eq!(service.path(rust.id())?, "languages/rust");
/// # Ok(())
/// # }
/// ```
pub struct TagService<S: TagStore> {
    store: S,
    cache: RwLock<Option<TagCache>>,
}

impl TagService<SqliteTagStore> {
    /// Creates a service backed by a SQLite database.
    pub fn with_database(db: Database) -> Self {
        Self::new(SqliteTagStore::new(db))
    }
}

impl<S: TagStore> TagService<S> {
    /// Creates a new TagService over the given store.
    ///
    /// Nothing is read from the store until the first operation.
    pub fn new(store: S) -> Self {
        Self {
            store,
            cache: RwLock::new(None),
        }
    }

    /// Returns a reference to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs `f` against a warm cache under the shared lock.
    ///
    /// A cold cache is built first under the exclusive lock; `f` then runs
    /// under that same lock.
    fn read<T>(&self, f: impl FnOnce(&TagCache) -> TagResult<T>) -> TagResult<T> {
        {
            let guard = self.cache.read().map_err(|_| TagError::CachePoisoned)?;
            if let Some(cache) = guard.as_ref() {
                return f(cache);
            }
        }

        let mut guard = self.cache.write().map_err(|_| TagError::CachePoisoned)?;
        let cache = self.warm(&mut guard)?;
        f(cache)
    }

    /// Runs `f` against a warm cache under the exclusive lock.
    fn write<T>(&self, f: impl FnOnce(&mut TagCache) -> TagResult<T>) -> TagResult<T> {
        let mut guard = self.cache.write().map_err(|_| TagError::CachePoisoned)?;
        let cache = self.warm(&mut guard)?;
        f(cache)
    }

    /// Builds the cache into `slot` unless a concurrent caller already did.
    ///
    /// Must be called with the exclusive lock held.
    fn warm<'a>(&self, slot: &'a mut Option<TagCache>) -> TagResult<&'a mut TagCache> {
        let cache = match slot.take() {
            Some(cache) => cache,
            None => {
                let cache = TagCache::from_roots(self.store.query_root_tags_with_children()?);
                info!(tags = cache.len(), "Built tag cache");
                cache
            }
        };
        Ok(slot.insert(cache))
    }

    /// Replaces the cache contents with a fresh read of the store.
    fn reload(&self, cache: &mut TagCache) -> TagResult<()> {
        cache.build(self.store.query_root_tags_with_children()?);
        info!(tags = cache.len(), "Rebuilt tag cache");
        Ok(())
    }

    /// Returns all root tags, ordered by name.
    ///
    /// Children are reachable through [`Tag::children`] and [`Self::subtree`].
    pub fn get_all_tags(&self) -> TagResult<Vec<Tag>> {
        self.read(|cache| Ok(cache.root_tags().into_iter().cloned().collect()))
    }

    /// Returns the tags for the given ids, silently skipping unknown ids.
    ///
    /// Use [`Self::assert_tags`] when every id must exist.
    pub fn get_tags(&self, ids: &[TagId]) -> TagResult<Vec<Tag>> {
        self.read(|cache| Ok(cache.get_many(ids).into_iter().cloned().collect()))
    }

    /// Retrieves a tag by its ID.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::NotFound`] if no tag has this id.
    pub fn get_tag(&self, id: &TagId) -> TagResult<Tag> {
        self.read(|cache| {
            cache
                .get(id)
                .cloned()
                .ok_or_else(|| TagError::NotFound(id.clone()))
        })
    }

    /// Returns the tag followed by all of its descendants.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::NotFound`] if no tag has this id.
    pub fn subtree(&self, id: &TagId) -> TagResult<Vec<Tag>> {
        self.read(|cache| {
            cache
                .subtree(id)
                .map(|tags| tags.into_iter().cloned().collect())
                .ok_or_else(|| TagError::NotFound(id.clone()))
        })
    }

    /// Returns the union of several subtrees, each tag once.
    ///
    /// Unknown ids contribute nothing.
    pub fn subtrees(&self, ids: &[TagId]) -> TagResult<Vec<Tag>> {
        self.read(|cache| {
            let mut seen = HashSet::new();
            Ok(ids
                .iter()
                .filter_map(|id| cache.subtree(id))
                .flatten()
                .filter(|tag| seen.insert(tag.id().clone()))
                .cloned()
                .collect())
        })
    }

    /// Returns the ancestor chain of a tag, nearest parent first.
    pub fn ancestors(&self, id: &TagId) -> TagResult<Vec<Tag>> {
        self.read(|cache| {
            cache
                .ancestors(id)
                .map(|tags| tags.into_iter().cloned().collect())
                .ok_or_else(|| TagError::NotFound(id.clone()))
        })
    }

    /// Finds a tag by the `/`-separated names from its root, e.g. `"lang/rust"`.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::NotFound`] if no tag sits at this path.
    pub fn get_tag_by_path(&self, path: &str) -> TagResult<Tag> {
        self.read(|cache| {
            cache
                .by_path(path)
                .cloned()
                .ok_or_else(|| TagError::NotFound(TagId::new(path)))
        })
    }

    /// Returns the names from the root down to this tag, joined with `/`.
    pub fn path(&self, id: &TagId) -> TagResult<String> {
        self.read(|cache| {
            let tag = cache.get(id).ok_or_else(|| TagError::NotFound(id.clone()))?;
            let ancestors = cache.ancestors(id).unwrap_or_default();
            let names: Vec<&str> = ancestors
                .iter()
                .rev()
                .map(|t| t.name())
                .chain(std::iter::once(tag.name()))
                .collect();
            Ok(names.join("/"))
        })
    }

    /// Checks that every id names an existing tag.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::NotFound`] for the first unknown id.
    pub fn assert_tags(&self, ids: &[TagId]) -> TagResult<()> {
        self.read(|cache| match ids.iter().find(|id| !cache.contains(id)) {
            Some(unknown) => Err(TagError::NotFound(unknown.clone())),
            None => Ok(()),
        })
    }

    /// Returns the tags whose name appears as a word in `content`.
    ///
    /// Matching is case-insensitive on whitespace-separated words.
    pub fn match_content(&self, content: &str) -> TagResult<Vec<Tag>> {
        let lowered = content.to_lowercase();
        let words: HashSet<&str> = lowered.split_whitespace().collect();
        if words.is_empty() {
            return Ok(Vec::new());
        }

        self.read(|cache| {
            let mut matched: Vec<Tag> = cache
                .all()
                .filter(|tag| words.contains(tag.name().to_lowercase().as_str()))
                .cloned()
                .collect();
            matched.sort_by(|a, b| a.name().cmp(b.name()).then_with(|| a.id().cmp(b.id())));
            Ok(matched)
        })
    }

    /// Creates a new tag, optionally under an existing parent.
    ///
    /// A fresh id is always generated; any id on `new` is ignored. The parent
    /// is checked against the cache before the store is touched, and the cache
    /// is only updated after the insert commits.
    ///
    /// Without a `parent_id`, a name such as `"lang/rust/async"` creates
    /// `async` under the tag found at the path `lang/rust`.
    ///
    /// # Errors
    ///
    /// - [`TagError::EmptyName`] if the name is blank
    /// - [`TagError::InvalidParent`] if the parent does not exist
    /// - [`TagError::PathWithParent`] if the name contains `/` and a parent is given
    /// - [`TagError::UnknownParentPath`] if the path before the last `/` matches no tag
    /// - [`TagError::Store`] if the insert fails; the cache is left untouched
    ///
    /// # Examples
    ///
    /// ```
    /// use tagtree::{Database, NewTag, TagService};
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let service = TagService::with_database(Database::in_memory()?);
    ///
    /// let tag = service.add_tag(NewTag::root("x"))?;
    /// let fetched = service.get_tag(tag.id())?;
    /// assert_eq!(fetched.name(), "x");
    /// assert!(fetched.parent_id().is_none());
    /// # Ok(())
    /// # }
    /// ```
    pub fn add_tag(&self, new: NewTag) -> TagResult<Tag> {
        let trimmed = new.name.trim();
        let (parent_path, name) = match trimmed.rsplit_once('/') {
            Some(_) if new.parent_id.is_some() => {
                return Err(TagError::PathWithParent(trimmed.to_string()));
            }
            Some((path, last)) => (Some(path.trim()), validated_name(last)?),
            None => (None, validated_name(trimmed)?),
        };

        self.write(|cache| {
            let parent_id = match parent_path {
                Some(path) => Some(
                    cache
                        .by_path(path)
                        .ok_or_else(|| TagError::UnknownParentPath(path.to_string()))?
                        .id()
                        .clone(),
                ),
                None => new.parent_id.clone(),
            };
            if let Some(parent) = &parent_id
                && !cache.contains(parent)
            {
                return Err(TagError::InvalidParent(parent.clone()));
            }

            let now = now();
            let row = TagRow {
                id: generate_tag_id(),
                name,
                parent_id: parent_id.clone(),
                date_created: now,
                date_updated: now,
            };

            self.store.transaction(|w| w.insert_tag(&row))?;

            debug!(id = %row.id, parent = ?row.parent_id, "Created tag");
            Ok(cache.add(row, parent_id.as_ref())?.clone())
        })
    }

    /// Updates a tag's name and parent, or creates it when `new.id` is absent.
    ///
    /// Passing a `NewTag` without an id always creates a new tag (see
    /// [`Self::add_tag`]); it never matches an existing tag by name. With an id,
    /// `parent_id` is the complete desired parent: `None` moves the tag to the
    /// root. Moving a tag carries its whole subtree along.
    ///
    /// # Errors
    ///
    /// - [`TagError::NotFound`] if the store has no row with this id
    /// - [`TagError::InvalidParent`] if the parent does not exist
    /// - [`TagError::CyclicParent`] if the parent lies inside the tag's subtree
    /// - [`TagError::EmptyName`] if the name is blank
    /// - [`TagError::Store`] if the update fails; the cache is left untouched
    pub fn update_tag(&self, new: NewTag) -> TagResult<Tag> {
        let Some(id) = new.id.clone() else {
            return self.add_tag(new);
        };
        let name = validated_name(&new.name)?;

        self.write(|cache| {
            if let Some(parent) = &new.parent_id
                && !cache.contains(parent)
            {
                return Err(TagError::InvalidParent(parent.clone()));
            }

            let current = cache.get(&id);
            if current.is_some() {
                cache.validate_parent(&id, new.parent_id.as_ref())?;
            }
            let date_updated = next_update_time(current.map(Tag::date_updated));
            let row = TagRow {
                id: id.clone(),
                name,
                parent_id: new.parent_id.clone(),
                date_created: current.map_or(date_updated, Tag::date_created),
                date_updated,
            };

            let stored = self.store.transaction(|w| {
                if w.update_tag(&row)? == 0 {
                    return Ok(None);
                }
                w.query_tag(&id)
            })?;
            let Some(row) = stored else {
                info!(%id, "No rows modified when updating tag");
                return Err(TagError::NotFound(id));
            };

            match cache.update(row.parent_id.as_ref(), &row) {
                Ok(tag) => {
                    debug!(%id, parent = ?row.parent_id, "Updated tag");
                    Ok(tag.clone())
                }
                Err(err) => {
                    warn!(%id, error = %err, "Tag cache disagrees with store, rebuilding");
                    self.reload(cache)?;
                    cache.get(&id).cloned().ok_or(TagError::NotFound(id))
                }
            }
        })
    }

    /// Deletes a tag, all of its descendants and every entry association that
    /// referenced any of them.
    ///
    /// Returns whether any row was removed. Deleting an unknown id returns
    /// `false`.
    pub fn delete_tag(&self, id: &TagId) -> TagResult<bool> {
        self.write(|cache| {
            let removed = self.store.transaction(|w| delete_tag_tree(w, id))?;
            cache.delete(id);
            debug!(%id, removed, "Deleted tag tree");
            Ok(removed > 0)
        })
    }

    /// Discards the cache and rebuilds it from the store.
    ///
    /// This is the recovery path for a cache suspected to have drifted from
    /// storage, including after a writer panicked while holding the lock.
    pub fn rebuild(&self) -> TagResult<()> {
        let mut guard = match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Tag cache lock poisoned, recovering");
                let guard = poisoned.into_inner();
                self.cache.clear_poison();
                guard
            }
        };

        *guard = None;
        let cache = TagCache::from_roots(self.store.query_root_tags_with_children()?);
        info!(tags = cache.len(), "Rebuilt tag cache");
        *guard = Some(cache);
        Ok(())
    }

    /// Returns the number of cached tags.
    pub fn tag_count(&self) -> TagResult<usize> {
        self.read(|cache| Ok(cache.len()))
    }

    /// Checks the cache's structural invariants.
    ///
    /// Returns a description of the first violation, or `None` when the cache
    /// is consistent.
    pub fn verify_cache(&self) -> TagResult<Option<String>> {
        self.read(|cache| Ok(cache.verify().err()))
    }

    /// Compares the cache against a fresh read of the store.
    ///
    /// Runs under the exclusive lock so no write can land mid-comparison.
    /// Never modifies the cache; follow up with [`Self::rebuild`] to repair.
    pub fn detect_drift(&self) -> TagResult<DriftReport> {
        self.write(|cache| {
            let fresh = TagCache::from_roots(self.store.query_root_tags_with_children()?);
            let report = DriftReport::between(cache, &fresh);
            if !report.is_clean() {
                warn!(
                    missing_from_cache = report.missing_from_cache.len(),
                    missing_from_store = report.missing_from_store.len(),
                    mismatched = report.mismatched.len(),
                    "Tag cache drift detected"
                );
            }
            Ok(report)
        })
    }

    /// Attaches an entry to each of the given tags.
    ///
    /// All ids are validated before anything is written. Returns the number of
    /// new associations.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::NotFound`] for the first unknown tag id.
    pub fn tag_entry(&self, entry: &EntryId, tag_ids: &[TagId]) -> TagResult<usize> {
        self.write(|cache| {
            if let Some(unknown) = tag_ids.iter().find(|id| !cache.contains(id)) {
                return Err(TagError::NotFound(unknown.clone()));
            }
            let attached = self.store.transaction(|w| {
                let mut attached = 0;
                for tag_id in tag_ids {
                    attached += w.attach_entry(entry, tag_id)?;
                }
                Ok(attached)
            })?;
            Ok(attached)
        })
    }

    /// Returns the tags attached to an entry.
    pub fn entry_tags(&self, entry: &EntryId) -> TagResult<Vec<Tag>> {
        let ids = self.store.transaction(|w| w.entry_tag_ids(entry))?;
        self.get_tags(&ids)
    }
}

/// Differences between the cache and the store.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DriftReport {
    /// Ids present in the store but not in the cache.
    pub missing_from_cache: Vec<TagId>,
    /// Ids present in the cache but not in the store.
    pub missing_from_store: Vec<TagId>,
    /// Ids whose name or parent differ.
    pub mismatched: Vec<TagId>,
}

impl DriftReport {
    fn between(cached: &TagCache, stored: &TagCache) -> Self {
        let cached_ids: BTreeSet<&TagId> = cached.all().map(Tag::id).collect();
        let stored_by_id: HashMap<&TagId, &Tag> = stored.all().map(|t| (t.id(), t)).collect();

        let mut report = DriftReport::default();
        for tag in stored.all() {
            if !cached_ids.contains(tag.id()) {
                report.missing_from_cache.push(tag.id().clone());
            }
        }
        for id in &cached_ids {
            match (stored_by_id.get(*id), cached.get(id)) {
                (None, _) => report.missing_from_store.push((*id).clone()),
                (Some(s), Some(c)) if s.name() != c.name() || s.parent_id() != c.parent_id() => {
                    report.mismatched.push((*id).clone());
                }
                _ => {}
            }
        }
        report.missing_from_cache.sort();
        report
    }

    /// True when cache and store agree.
    pub fn is_clean(&self) -> bool {
        self.missing_from_cache.is_empty()
            && self.missing_from_store.is_empty()
            && self.mismatched.is_empty()
    }
}

/// Trims the name and rejects blank names.
fn validated_name(name: &str) -> TagResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(TagError::EmptyName);
    }
    Ok(trimmed.to_string())
}

/// Picks an update time strictly after `previous`.
fn next_update_time(previous: Option<OffsetDateTime>) -> OffsetDateTime {
    let now = now();
    match previous {
        Some(previous) if previous >= now => previous + Duration::milliseconds(1),
        _ => now,
    }
}
