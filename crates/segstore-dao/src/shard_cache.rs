//! Lazily populated shard cache of one position.
//!
//! A shard holds every object sharing `(parent track head, structure class)`.
//! Shards are loaded once through `get_or_load` and served from memory until
//! invalidated. Loading runs under a reentrant lock so a loader may pull in the
//! parent shard it links against.

use std::collections::BTreeMap;
use std::fmt;

use hashbrown::{HashMap, HashSet};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard, RwLock};
use tracing::{debug, warn};

use crate::experiment::{StructureClass, ROOT_CLASS};
use crate::ids::ObjectId;
use crate::object::SegmentedObject;

/// Unit of lazy loading, caching and deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardKey {
    pub parent_track_head: Option<ObjectId>,
    pub structure_class: StructureClass,
}

impl ShardKey {
    pub fn new(parent_track_head: Option<ObjectId>, structure_class: StructureClass) -> Self {
        Self { parent_track_head, structure_class }
    }

    /// The shard of all root objects.
    pub fn roots() -> Self {
        Self::new(None, ROOT_CLASS)
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parent_track_head {
            Some(head) => write!(f, "({}, {})", head, self.structure_class),
            None => write!(f, "(root, {})", self.structure_class),
        }
    }
}

pub type Shard = BTreeMap<ObjectId, SegmentedObject>;

/// Shard map plus the set of shards known to be complete.
#[derive(Default)]
pub struct ShardCache {
    shards: RwLock<HashMap<ShardKey, Shard>>,
    retrieved: RwLock<HashSet<ShardKey>>,
    load_lock: ReentrantMutex<()>,
}

impl ShardCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_retrieved(&self, key: &ShardKey) -> bool {
        self.retrieved.read().contains(key)
    }

    /// Exclusive section shared by loads and mutations. Reentrant.
    pub fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.load_lock.lock()
    }

    /// Populate `key` with `loader` unless it is already complete.
    pub fn get_or_load<F>(&self, key: ShardKey, loader: F)
    where
        F: FnOnce(&ShardKey) -> Shard,
    {
        if self.is_retrieved(&key) {
            return;
        }
        let _guard = self.load_lock.lock();
        if self.is_retrieved(&key) {
            return;
        }
        let shard = loader(&key);
        debug!(shard = %key, objects = shard.len(), "shard loaded");
        self.shards.write().insert(key, shard);
        self.retrieved.write().insert(key);
    }

    /// Run `f` on the shard if cached. `f` must not call back into the cache.
    pub fn read<R>(&self, key: &ShardKey, f: impl FnOnce(Option<&Shard>) -> R) -> R {
        f(self.shards.read().get(key))
    }

    /// Run `f` on the shard, creating it empty if absent. `f` must not call back into the cache.
    pub fn write<R>(&self, key: ShardKey, f: impl FnOnce(&mut Shard) -> R) -> R {
        f(self.shards.write().entry(key).or_default())
    }

    /// Run `f` on two distinct shards at once, creating them empty if absent.
    pub fn write_pair<R>(&self, a: ShardKey, b: ShardKey, f: impl FnOnce(&mut Shard, &mut Shard) -> R) -> R {
        debug_assert_ne!(a, b);
        let mut shards = self.shards.write();
        let mut first = shards.remove(&a).unwrap_or_default();
        let result = f(&mut first, shards.entry(b).or_default());
        shards.insert(a, first);
        result
    }

    /// Loaded shard of `class` holding `id`.
    pub fn find_loaded(&self, class: StructureClass, id: ObjectId) -> Option<ShardKey> {
        self.shards
            .read()
            .iter()
            .find(|(k, shard)| k.structure_class == class && shard.contains_key(&id))
            .map(|(k, _)| *k)
    }

    pub fn loaded_keys(&self) -> Vec<ShardKey> {
        let mut keys: Vec<ShardKey> = self.shards.read().keys().copied().collect();
        keys.sort();
        keys
    }

    /// Forget one shard; the next access reloads it.
    pub fn invalidate(&self, key: &ShardKey) {
        let _guard = self.load_lock.lock();
        self.shards.write().remove(key);
        self.retrieved.write().remove(key);
    }

    /// Release transient payloads, then drop every shard and retrieval flag.
    pub fn clear(&self) {
        let _guard = self.load_lock.lock();
        let mut shards = self.shards.write();
        for shard in shards.values_mut() {
            for object in shard.values_mut() {
                object.release_transient();
            }
        }
        shards.clear();
        self.retrieved.write().clear();
    }

    pub fn object_count(&self) -> usize {
        self.shards.read().values().map(BTreeMap::len).sum()
    }
}

/// Resolve `previous`, `next` and `track_head` links inside one shard.
///
/// Objects whose track head lies outside the shard are revisited in frame
/// order: when their previous object points back at them, they take over its
/// track head, repairing chains that continue across shard boundaries.
pub fn relink(key: &ShardKey, shard: &mut Shard) {
    let present: HashSet<ObjectId> = shard.keys().copied().collect();
    let mut deferred: Vec<(u32, ObjectId)> = Vec::new();

    for object in shard.values_mut() {
        object.links.previous = object.previous_id.filter(|id| present.contains(id));
        object.links.next = object.next_id.filter(|id| present.contains(id));
        object.links.track_head = match object.track_head_id {
            None => Some(object.id),
            Some(head) if present.contains(&head) => Some(head),
            Some(_) => {
                deferred.push((object.frame, object.id));
                None
            }
        };
    }

    deferred.sort_unstable();
    for (_, id) in deferred {
        let Some(previous_id) = shard.get(&id).and_then(|o| o.links.previous) else {
            debug!(shard = %key, object = %id, "track head outside shard");
            continue;
        };
        let head = match shard.get(&previous_id) {
            Some(previous) if previous.next_id == Some(id) => previous.track_head(),
            _ => {
                warn!(shard = %key, object = %id, previous = %previous_id, "broken track link");
                continue;
            }
        };
        if let Some(object) = shard.get_mut(&id) {
            object.links.track_head = Some(head);
        }
    }
}

/// Resolve parents of `shard` against the parent shard and re-derive the
/// children lists of the parents on the shard's parent track.
///
/// Returns how many objects were left without a parent.
pub fn link_parents(key: &ShardKey, shard: &mut Shard, parents: &mut Shard) -> usize {
    let mut missing = 0;
    let mut by_parent: HashMap<ObjectId, Vec<(u32, u32, ObjectId)>> = HashMap::new();

    for object in shard.values_mut() {
        object.links.parent = object.parent_id.filter(|p| parents.contains_key(p));
        match object.links.parent {
            Some(parent) => by_parent.entry(parent).or_default().push(object.sort_key()),
            None => {
                warn!(shard = %key, object = %object.id, parent = ?object.parent_id, "parent not found");
                missing += 1;
            }
        }
    }

    let Some(track) = key.parent_track_head else { return missing };
    for parent in parents.values_mut().filter(|p| p.track_head() == track) {
        let mut children = by_parent.remove(&parent.id).unwrap_or_default();
        children.sort_unstable();
        let ids: Vec<ObjectId> = children.into_iter().map(|(_, _, id)| id).collect();
        if ids.is_empty() {
            parent.children.remove(&key.structure_class);
        } else {
            parent.children.insert(key.structure_class, ids);
        }
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn obj(frame: u32, seq: u32, class: StructureClass) -> SegmentedObject {
        SegmentedObject::new(ObjectId::new(frame, seq), frame, class, 0)
    }

    fn shard_of(objects: Vec<SegmentedObject>) -> Shard {
        objects.into_iter().map(|o| (o.id, o)).collect()
    }

    #[test]
    fn test_get_or_load_runs_loader_once() {
        let cache = ShardCache::new();
        let calls = AtomicUsize::new(0);
        let key = ShardKey::roots();
        for _ in 0..3 {
            cache.get_or_load(key, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                shard_of(vec![obj(0, 1, ROOT_CLASS)])
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.read(&key, |s| s.map_or(0, |s| s.len())), 1);

        cache.invalidate(&key);
        assert!(!cache.is_retrieved(&key));
        cache.get_or_load(key, |_| Shard::new());
        assert_eq!(cache.read(&key, |s| s.map_or(0, |s| s.len())), 0);
    }

    #[test]
    fn test_loader_may_load_another_shard() {
        let cache = ShardCache::new();
        let parent_key = ShardKey::roots();
        let child_key = ShardKey::new(Some(ObjectId::new(0, 1)), 0);
        cache.get_or_load(child_key, |_| {
            cache.get_or_load(parent_key, |_| shard_of(vec![obj(0, 1, ROOT_CLASS)]));
            Shard::new()
        });
        assert!(cache.is_retrieved(&parent_key));
        assert!(cache.is_retrieved(&child_key));
        assert_eq!(cache.loaded_keys(), vec![parent_key, child_key]);
    }

    #[test]
    fn test_clear_releases_transient_payloads() {
        let cache = ShardCache::new();
        let mut root = obj(0, 1, ROOT_CLASS);
        root.raster = Some(std::sync::Arc::from(vec![0u8; 16]));
        let raster = root.raster.clone().unwrap();
        cache.get_or_load(ShardKey::roots(), |_| shard_of(vec![root]));
        assert_eq!(std::sync::Arc::strong_count(&raster), 2);

        cache.clear();
        assert_eq!(std::sync::Arc::strong_count(&raster), 1);
        assert_eq!(cache.object_count(), 0);
        assert!(!cache.is_retrieved(&ShardKey::roots()));
    }

    #[test]
    fn test_relink_in_shard_track() {
        let mut a = obj(0, 1, 0);
        let mut b = obj(1, 1, 0);
        let mut c = obj(2, 1, 0);
        b.follow(&mut a);
        c.follow(&mut b);
        let key = ShardKey::new(None, 0);
        let mut shard = shard_of(vec![a.clone(), b.clone(), c.clone()]);

        relink(&key, &mut shard);
        assert_eq!(shard[&a.id].links.next, Some(b.id));
        assert_eq!(shard[&c.id].links.previous, Some(b.id));
        assert_eq!(shard[&c.id].links.track_head, Some(a.id));
        assert_eq!(shard[&a.id].links.track_head, Some(a.id));
    }

    #[test]
    fn test_relink_repairs_chain_continuing_from_other_shard() {
        // a, b live in another shard; c, d, e continue the track here
        let mut a = obj(0, 1, 1);
        let mut b = obj(1, 1, 1);
        let mut c = obj(2, 1, 1);
        let mut d = obj(3, 1, 1);
        let mut e = obj(4, 1, 1);
        b.follow(&mut a);
        c.follow(&mut b);
        d.follow(&mut c);
        e.follow(&mut d);
        let key = ShardKey::new(Some(ObjectId::new(2, 9)), 1);
        let mut shard = shard_of(vec![e.clone(), c.clone(), d.clone()]);

        relink(&key, &mut shard);
        assert_eq!(shard[&c.id].links.previous, None);
        assert_eq!(shard[&c.id].track_head(), a.id);
        assert_eq!(shard[&d.id].links.track_head, Some(a.id));
        assert_eq!(shard[&e.id].links.track_head, Some(a.id));
    }

    #[test]
    fn test_relink_ignores_previous_not_pointing_back() {
        let mut a = obj(0, 1, 0);
        let mut b = obj(1, 1, 0);
        b.follow(&mut a);
        a.next_id = None;
        b.track_head_id = Some(ObjectId::new(0, 77));
        let key = ShardKey::new(None, 0);
        let mut shard = shard_of(vec![a, b.clone()]);

        relink(&key, &mut shard);
        assert_eq!(shard[&b.id].links.track_head, None);
        assert_eq!(shard[&b.id].track_head(), ObjectId::new(0, 77));
    }

    #[test]
    fn test_link_parents_derives_sorted_children() {
        let root = obj(0, 1, ROOT_CLASS);
        let other_root = obj(1, 1, ROOT_CLASS);
        let mut c2 = obj(0, 2, 0).with_parent(&root);
        c2.idx = 1;
        let c1 = obj(0, 3, 0).with_parent(&root);
        let mut orphan = obj(0, 4, 0).with_parent(&root);
        orphan.parent_id = Some(ObjectId::new(0, 99));

        let key = ShardKey::new(Some(root.id), 0);
        let mut parents = shard_of(vec![root.clone(), other_root.clone()]);
        let mut shard = shard_of(vec![c2.clone(), c1.clone(), orphan.clone()]);

        let missing = link_parents(&key, &mut shard, &mut parents);
        assert_eq!(missing, 1);
        assert_eq!(parents[&root.id].children_ids(0), &[c1.id, c2.id]);
        assert!(parents[&other_root.id].children_ids(0).is_empty());
        assert_eq!(shard[&c1.id].links.parent, Some(root.id));
        assert_eq!(shard[&orphan.id].links.parent, None);
    }

    #[test]
    fn test_shard_key_display() {
        assert_eq!(ShardKey::roots().to_string(), "(root, -1)");
        assert_eq!(ShardKey::new(Some(ObjectId::new(1, 2)), 3).to_string(), "(0000000100000002, 3)");
    }
}
