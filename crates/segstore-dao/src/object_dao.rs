//! Object store of one position.
//!
//! `ObjectDao` owns one objects table and one measurements table per structure
//! class, the position lock and the shard cache. Records are written through to
//! the tables and stay pending until a commit.
//!
//! Public writes never fail: on a read-only store they are no-ops, and table
//! errors are logged at this boundary.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use segstore_core::{Config, KvTable};

use crate::error::DaoResult;
use crate::experiment::{StructureClass, StructureHierarchy, ROOT_CLASS};
use crate::ids::{IdGenerator, ObjectId};
use crate::layout::{self, measurement_key, partition_prefix, record_key, TableKind, POSITION_LOCK_FILE, QUARANTINE_PREFIX};
use crate::lock::FileLock;
use crate::object::{Measurements, SegmentedObject};
use crate::serializer::ObjectSerializer;
use crate::shard_cache::{link_parents, relink, Shard, ShardCache, ShardKey};

type Tables = Mutex<HashMap<StructureClass, Arc<KvTable>>>;

/// Partitions known per class, keyed by parent track head. May hold emptied ones.
type Partitions = Mutex<HashMap<StructureClass, BTreeSet<Option<ObjectId>>>>;

pub struct ObjectDao {
    position: String,
    dir: PathBuf,
    hierarchy: StructureHierarchy,
    table_config: Config,
    serializer: Arc<dyn ObjectSerializer>,
    lock: Mutex<Option<FileLock>>,
    read_only: AtomicBool,
    objects: Tables,
    measurements: Tables,
    partitions: Partitions,
    cache: ShardCache,
    ids: OnceLock<IdGenerator>,
    commits: AtomicU64,
}

impl ObjectDao {
    /// Open the store of `position` rooted at `dir` (its `segmented_objects` directory).
    ///
    /// Unless `read_only` is requested the position lock is tried; if another
    /// holder has it the store opens read-only instead of failing.
    pub fn open(
        position: &str,
        dir: PathBuf,
        hierarchy: StructureHierarchy,
        read_only: bool,
        table_config: Config,
        serializer: Arc<dyn ObjectSerializer>,
    ) -> Self {
        let lock = if read_only {
            None
        } else {
            match FileLock::try_acquire(&dir.join(POSITION_LOCK_FILE)) {
                Ok(Some(lock)) => Some(lock),
                Ok(None) => {
                    warn!(position, "position locked by another process, opening read-only");
                    None
                }
                Err(e) => {
                    warn!(position, error = %e, "cannot lock position, opening read-only");
                    None
                }
            }
        };
        let read_only = lock.is_none();
        debug!(position, read_only, dir = %dir.display(), "opened object store");

        Self {
            position: position.to_string(),
            dir,
            hierarchy,
            table_config,
            serializer,
            lock: Mutex::new(lock),
            read_only: AtomicBool::new(read_only),
            objects: Mutex::new(HashMap::new()),
            measurements: Mutex::new(HashMap::new()),
            partitions: Mutex::new(HashMap::new()),
            cache: ShardCache::new(),
            ids: OnceLock::new(),
            commits: AtomicU64::new(0),
        }
    }

    pub fn position(&self) -> &str {
        &self.position
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn hierarchy(&self) -> &StructureHierarchy {
        &self.hierarchy
    }

    /// True when the position lock is not held.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Number of full commits performed.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    // ---------------------------------------------------------------------
    // Tables
    // ---------------------------------------------------------------------

    fn tables(&self, kind: TableKind) -> &Tables {
        match kind {
            TableKind::Objects => &self.objects,
            TableKind::Measurements => &self.measurements,
        }
    }

    fn table(&self, kind: TableKind, class: StructureClass) -> DaoResult<Arc<KvTable>> {
        let mut tables = self.tables(kind).lock();
        if let Some(table) = tables.get(&class) {
            return Ok(Arc::clone(table));
        }
        let path = self.dir.join(kind.file_name(class));
        let table = if self.is_read_only() {
            KvTable::open_read_only(&path, self.table_config.clone())?
        } else {
            KvTable::open(&path, self.table_config.clone())?
        };
        if kind == TableKind::Objects {
            let partitions = table.keys().iter().filter_map(|k| layout::parse_record_key(k)).map(|(p, _)| p).collect();
            self.partitions.lock().insert(class, partitions);
        }
        let table = Arc::new(table);
        tables.insert(class, Arc::clone(&table));
        Ok(table)
    }

    fn note_partition(&self, class: StructureClass, partition: Option<ObjectId>) {
        self.partitions.lock().entry(class).or_default().insert(partition);
    }

    /// Open table, or the table on disk; `None` if neither exists.
    fn existing_table(&self, kind: TableKind, class: StructureClass) -> DaoResult<Option<Arc<KvTable>>> {
        if self.tables(kind).lock().contains_key(&class) || self.dir.join(kind.file_name(class)).exists() {
            return self.table(kind, class).map(Some);
        }
        Ok(None)
    }

    fn open_tables(&self, kind: TableKind) -> Vec<(StructureClass, Arc<KvTable>)> {
        let mut tables: Vec<_> = self.tables(kind).lock().iter().map(|(c, t)| (*c, Arc::clone(t))).collect();
        tables.sort_by_key(|(c, _)| *c);
        tables
    }

    /// Classes with a table of `kind` open or on disk.
    fn known_classes(&self, kind: TableKind) -> BTreeSet<StructureClass> {
        let mut classes: BTreeSet<StructureClass> = self.tables(kind).lock().keys().copied().collect();
        classes.extend(layout::list_tables(&self.dir).into_iter().filter(|(k, _)| *k == kind).map(|(_, c)| c));
        classes
    }

    // ---------------------------------------------------------------------
    // Shard loading
    // ---------------------------------------------------------------------

    fn ensure_loaded(&self, key: ShardKey) {
        self.cache.get_or_load(key, |k| self.load_shard(k));
    }

    fn load_shard(&self, key: &ShardKey) -> Shard {
        let mut shard = match self.read_partition(key) {
            Ok(shard) => shard,
            Err(e) => {
                error!(position = %self.position, shard = %key, error = %e, "corrupted shard, treating as empty");
                Shard::new()
            }
        };
        relink(key, &mut shard);
        if key.structure_class != ROOT_CLASS {
            match self.parent_key_of(key) {
                Some(parent_key) => {
                    self.ensure_loaded(parent_key);
                    self.cache.write(parent_key, |parents| link_parents(key, &mut shard, parents));
                }
                None => warn!(position = %self.position, shard = %key, "parent shard not found"),
            }
        }
        shard
    }

    /// Decode one partition. Any undecodable record makes the shard load empty;
    /// on a writable store those records are moved out of the partition so the
    /// next load sees the rest.
    fn read_partition(&self, key: &ShardKey) -> DaoResult<Shard> {
        let table = self.table(TableKind::Objects, key.structure_class)?;
        let records = table.prefix_scan(&partition_prefix(key.parent_track_head));
        let serializer = &self.serializer;
        let decoded: Vec<(&str, DaoResult<SegmentedObject>)> = records
            .par_iter()
            .map(|(record_key, record)| (record_key.as_str(), serializer.deserialize_object(record)))
            .collect();

        let mut shard = Shard::new();
        let mut corrupted = Vec::new();
        for (record_key, result) in decoded {
            match result {
                Ok(object) => {
                    shard.insert(object.id, object);
                }
                Err(e) => {
                    error!(position = %self.position, shard = %key, record = record_key, error = %e, "undecodable object record");
                    corrupted.push(record_key);
                }
            }
        }
        if corrupted.is_empty() {
            return Ok(shard);
        }

        error!(position = %self.position, shard = %key, corrupted = corrupted.len(), "corrupted shard, treating as empty");
        if !self.is_read_only() {
            for record_key in corrupted {
                if let Some(record) = table.get(record_key) {
                    table.put(&layout::quarantine_key(record_key), &record)?;
                    table.remove(record_key)?;
                }
            }
        }
        Ok(Shard::new())
    }

    /// Shard holding the parents of the objects of `key`.
    fn parent_key_of(&self, key: &ShardKey) -> Option<ShardKey> {
        let parent_class = self.hierarchy.parent_of(key.structure_class)?;
        if parent_class == ROOT_CLASS {
            return Some(ShardKey::roots());
        }
        self.locate(parent_class, key.parent_track_head?)
    }

    /// Shard of `class` holding `id`: loaded shards first, then one lookup per known partition.
    fn locate(&self, class: StructureClass, id: ObjectId) -> Option<ShardKey> {
        if class == ROOT_CLASS {
            return Some(ShardKey::roots());
        }
        if let Some(key) = self.cache.find_loaded(class, id) {
            return Some(key);
        }
        let table = match self.table(TableKind::Objects, class) {
            Ok(table) => table,
            Err(e) => {
                error!(position = %self.position, structure_class = class, error = %e, "cannot open table");
                return None;
            }
        };
        let partitions: Vec<Option<ObjectId>> =
            self.partitions.lock().get(&class).map(|p| p.iter().copied().collect()).unwrap_or_default();
        partitions
            .into_iter()
            .find(|&partition| table.contains_key(&record_key(partition, id)))
            .map(|partition| ShardKey::new(partition, class))
    }

    /// Re-derive the parent links of `key` after a mutation.
    fn refresh_parents(&self, key: &ShardKey) {
        if key.structure_class == ROOT_CLASS {
            return;
        }
        if let Some(parent_key) = self.parent_key_of(key) {
            self.ensure_loaded(parent_key);
            self.cache.write_pair(*key, parent_key, |shard, parents| link_parents(key, shard, parents));
        }
    }

    fn filtered<F>(&self, key: ShardKey, filter: F) -> Vec<SegmentedObject>
    where
        F: Fn(&SegmentedObject) -> bool,
    {
        self.ensure_loaded(key);
        let mut objects: Vec<SegmentedObject> = self.cache.read(&key, |shard| {
            shard.map(|s| s.values().filter(|o| filter(*o)).cloned().collect()).unwrap_or_default()
        });
        objects.sort_by_key(SegmentedObject::sort_key);
        objects
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Every object of one shard, keyed by id.
    pub fn get_shard(&self, key: ShardKey) -> Shard {
        self.ensure_loaded(key);
        self.cache.read(&key, |shard| shard.cloned().unwrap_or_default())
    }

    pub fn get_roots(&self) -> Vec<SegmentedObject> {
        self.filtered(ShardKey::roots(), |_| true)
    }

    pub fn get_root(&self, frame: u32) -> Option<SegmentedObject> {
        self.filtered(ShardKey::roots(), |o| o.frame == frame).into_iter().next()
    }

    /// Members of the track of `head`, in frame order.
    ///
    /// A track continuing into another parent lineage is followed through its `next` link.
    pub fn get_track(&self, head: &SegmentedObject) -> Vec<SegmentedObject> {
        let class = head.structure_class;
        let mut key = head.shard_key();
        self.ensure_loaded(key);
        // the stored copy may have been re-headed since `head` was read
        let head_id = self
            .cache
            .read(&key, |shard| shard.and_then(|s| s.get(&head.id)).map(SegmentedObject::track_head))
            .unwrap_or_else(|| head.track_head());
        let mut visited = HashSet::new();
        let mut track: Vec<SegmentedObject> = Vec::new();

        while visited.insert(key) {
            let members = self.filtered(key, |o| o.track_head() == head_id);
            let Some(next) = members.last().and_then(|o| o.next_id) else {
                track.extend(members);
                break;
            };
            track.extend(members);
            if track.iter().any(|o| o.id == next) {
                break;
            }
            match self.locate(class, next) {
                Some(next_key) => key = next_key,
                None => {
                    warn!(position = %self.position, object = %next, "next object of track not found");
                    break;
                }
            }
        }
        track.sort_by_key(|o| o.frame);
        track
    }

    /// Track heads of `structure_class` within the parent track `parent_track_head`.
    pub fn get_track_heads(&self, parent_track_head: Option<ObjectId>, structure_class: StructureClass) -> Vec<SegmentedObject> {
        self.filtered(ShardKey::new(parent_track_head, structure_class), SegmentedObject::is_track_head)
    }

    /// Children of the stored copy of `parent` in `structure_class`; empty once the parent is deleted.
    pub fn get_children(&self, parent: &SegmentedObject, structure_class: StructureClass) -> Vec<SegmentedObject> {
        let key = parent.shard_key();
        self.ensure_loaded(key);
        match self.cache.read(&key, |shard| shard.and_then(|s| s.get(&parent.id).cloned())) {
            Some(stored) => self.children_of(&stored, structure_class),
            None => Vec::new(),
        }
    }

    fn children_of(&self, parent: &SegmentedObject, structure_class: StructureClass) -> Vec<SegmentedObject> {
        let parent_id = parent.id;
        self.filtered(ShardKey::new(Some(parent.track_head()), structure_class), |o| o.parent_id == Some(parent_id))
    }

    pub fn get_parent(&self, object: &SegmentedObject) -> Option<SegmentedObject> {
        let parent_id = object.parent_id?;
        let parent_key = self.parent_key_of(&object.shard_key())?;
        self.ensure_loaded(parent_key);
        self.cache.read(&parent_key, |shard| shard.and_then(|s| s.get(&parent_id).cloned()))
    }

    /// Look an object up by id.
    ///
    /// With a known lineage (`parent_track_head`, or the root class) this is a
    /// direct shard lookup; otherwise the partitions of the class are searched.
    pub fn get_by_id(
        &self,
        parent_track_head: Option<ObjectId>,
        structure_class: StructureClass,
        frame: Option<u32>,
        id: ObjectId,
    ) -> Option<SegmentedObject> {
        let key = if structure_class == ROOT_CLASS || parent_track_head.is_some() {
            ShardKey::new(parent_track_head, structure_class)
        } else {
            self.locate(structure_class, id)?
        };
        self.ensure_loaded(key);
        self.cache
            .read(&key, |shard| shard.and_then(|s| s.get(&id).cloned()))
            .filter(|o| frame.map_or(true, |f| o.frame == f))
    }

    pub fn contains(&self, object: &SegmentedObject) -> bool {
        let key = object.shard_key();
        self.ensure_loaded(key);
        self.cache.read(&key, |shard| shard.map_or(false, |s| s.contains_key(&object.id)))
    }

    /// Fresh id at `frame`, never colliding with a stored one.
    pub fn generate_id(&self, frame: u32) -> DaoResult<ObjectId> {
        self.ids.get_or_init(|| self.seed_ids()).next(frame)
    }

    fn seed_ids(&self) -> IdGenerator {
        let mut ids = Vec::new();
        for class in self.known_classes(TableKind::Objects) {
            match self.table(TableKind::Objects, class) {
                Ok(table) => ids.extend(
                table
                    .keys()
                    .iter()
                    .filter_map(|k| layout::parse_record_key(k.strip_prefix(QUARANTINE_PREFIX).unwrap_or(k)))
                    .map(|(_, id)| id),
            ),
                Err(e) => error!(position = %self.position, structure_class = class, error = %e, "cannot read ids"),
            }
        }
        IdGenerator::from_existing(ids)
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    pub fn store(&self, object: &SegmentedObject) {
        self.store_all(std::slice::from_ref(object), true);
    }

    /// Upsert `objects`, grouped per shard. With `commit`, each touched class is committed.
    pub fn store_all(&self, objects: &[SegmentedObject], commit: bool) {
        if self.is_read_only() {
            debug!(position = %self.position, count = objects.len(), "read-only, store ignored");
            return;
        }
        if let Err(e) = self.try_store(objects, commit) {
            error!(position = %self.position, error = %e, "store failed");
        }
    }

    fn try_store(&self, objects: &[SegmentedObject], commit: bool) -> DaoResult<()> {
        let _guard = self.cache.lock();
        let mut groups: BTreeMap<ShardKey, Vec<&SegmentedObject>> = BTreeMap::new();
        for object in objects {
            groups.entry(object.shard_key()).or_default().push(object);
        }

        let mut touched = BTreeSet::new();
        for (key, group) in groups {
            self.ensure_loaded(key);
            let table = self.table(TableKind::Objects, key.structure_class)?;
            let serializer = &self.serializer;
            let records = group
                .par_iter()
                .map(|o| -> DaoResult<(String, String)> {
                    Ok((record_key(key.parent_track_head, o.id), serializer.serialize_object(o)?))
                })
                .collect::<DaoResult<Vec<(String, String)>>>()?;
            for (record_key, record) in &records {
                table.put(record_key, record)?;
            }
            self.note_partition(key.structure_class, key.parent_track_head);

            let measured: Vec<&Measurements> = group
                .iter()
                .filter(|o| o.has_unflushed_measurements())
                .filter_map(|o| o.measurements.as_ref())
                .collect();
            if !measured.is_empty() {
                self.put_measurements(key.structure_class, &measured)?;
            }

            self.cache.write(key, |shard| {
                for object in &group {
                    let mut cached = (*object).clone();
                    if let Some(m) = cached.measurements.as_mut() {
                        m.mark_flushed();
                    }
                    if let Some(existing) = shard.get(&object.id) {
                        if cached.children.is_empty() {
                            cached.children = existing.children.clone();
                        }
                    }
                    shard.insert(object.id, cached);
                }
                relink(&key, shard);
            });
            self.refresh_parents(&key);
            touched.insert(key.structure_class);
        }

        if commit {
            for class in touched {
                self.commit_class(class)?;
            }
        }
        Ok(())
    }

    /// Delete `objects`; returns the classes whose tables were modified, for the caller to commit.
    ///
    /// Children are deleted before their parents. Track neighbours of a deleted
    /// object are always unlinked; the object following it heads a new track.
    pub fn delete(
        &self,
        objects: &[SegmentedObject],
        delete_children: bool,
        delete_from_parent: bool,
        relabel_siblings: bool,
    ) -> BTreeSet<StructureClass> {
        let mut modified = BTreeSet::new();
        if self.is_read_only() {
            debug!(position = %self.position, count = objects.len(), "read-only, delete ignored");
            return modified;
        }
        let _guard = self.cache.lock();
        if let Err(e) = self.delete_inner(objects, delete_children, delete_from_parent, relabel_siblings, &mut modified) {
            error!(position = %self.position, error = %e, "delete failed");
        }
        modified
    }

    fn delete_inner(
        &self,
        objects: &[SegmentedObject],
        delete_children: bool,
        delete_from_parent: bool,
        relabel_siblings: bool,
        modified: &mut BTreeSet<StructureClass>,
    ) -> DaoResult<()> {
        let mut groups: BTreeMap<ShardKey, Vec<SegmentedObject>> = BTreeMap::new();
        for object in objects {
            groups.entry(object.shard_key()).or_default().push(object.clone());
        }

        for (key, mut group) in groups {
            self.ensure_loaded(key);
            // prefer cached copies: their links are resolved
            self.cache.read(&key, |shard| {
                if let Some(shard) = shard {
                    for object in group.iter_mut() {
                        if let Some(cached) = shard.get(&object.id) {
                            *object = cached.clone();
                        }
                    }
                }
            });

            if delete_children {
                for child_class in self.hierarchy.direct_children(key.structure_class) {
                    let children: Vec<SegmentedObject> =
                        group.iter().flat_map(|o| self.children_of(o, child_class)).collect();
                    if !children.is_empty() {
                        self.delete_inner(&children, true, false, false, modified)?;
                    }
                }
            }

            let objects_table = self.table(TableKind::Objects, key.structure_class)?;
            let measurements_table = self.existing_table(TableKind::Measurements, key.structure_class)?;
            for object in &group {
                objects_table.remove(&record_key(key.parent_track_head, object.id))?;
                if let Some(table) = &measurements_table {
                    table.remove(&measurement_key(object.id))?;
                }
            }
            modified.insert(key.structure_class);

            let (changed, reheaded) = self.cache.write(key, |shard| {
                let heads_before: HashMap<ObjectId, ObjectId> = shard.values().map(|o| (o.id, o.track_head())).collect();
                let removed: Vec<SegmentedObject> = group.iter().filter_map(|o| shard.remove(&o.id)).collect();
                let mut changed = BTreeSet::new();
                for object in &removed {
                    unlink_neighbours(shard, object, &mut changed);
                }
                if relabel_siblings {
                    relabel(shard, &removed, &mut changed);
                }
                relink(&key, shard);
                let changed: Vec<SegmentedObject> = changed.iter().filter_map(|id| shard.get(id).cloned()).collect();
                let reheaded: HashMap<ObjectId, (ObjectId, ObjectId)> = changed
                    .iter()
                    .filter_map(|o| {
                        let before = *heads_before.get(&o.id)?;
                        (before != o.track_head()).then(|| (o.id, (before, o.track_head())))
                    })
                    .collect();
                (changed, reheaded)
            });
            for object in &changed {
                objects_table.put(&record_key(key.parent_track_head, object.id), &self.serializer.serialize_object(object)?)?;
            }
            self.move_children(key.structure_class, &reheaded, modified)?;

            if delete_from_parent {
                self.refresh_parents(&key);
            }
            debug!(position = %self.position, shard = %key, deleted = group.len(), updated = changed.len(), "deleted objects");
        }
        Ok(())
    }

    /// Re-key the children of re-headed objects under the partition of their new track head.
    ///
    /// `reheaded` maps an object id to its `(old, new)` track head.
    fn move_children(
        &self,
        class: StructureClass,
        reheaded: &HashMap<ObjectId, (ObjectId, ObjectId)>,
        modified: &mut BTreeSet<StructureClass>,
    ) -> DaoResult<()> {
        if reheaded.is_empty() {
            return Ok(());
        }
        let old_heads: BTreeSet<ObjectId> = reheaded.values().map(|&(old, _)| old).collect();
        for child_class in self.hierarchy.direct_children(class) {
            let Some(table) = self.existing_table(TableKind::Objects, child_class)? else { continue };
            let mut moved = 0;
            for &old_head in &old_heads {
                for (old_key, record) in table.prefix_scan(&partition_prefix(Some(old_head))) {
                    let mut child = match self.serializer.deserialize_object(&record) {
                        Ok(child) => child,
                        Err(e) => {
                            warn!(position = %self.position, record = %old_key, error = %e, "cannot move undecodable child");
                            continue;
                        }
                    };
                    let Some(&(_, new_head)) = child.parent_id.and_then(|p| reheaded.get(&p)) else { continue };
                    child.parent_track_head_id = Some(new_head);
                    table.remove(&old_key)?;
                    table.put(&record_key(Some(new_head), child.id), &self.serializer.serialize_object(&child)?)?;
                    self.note_partition(child_class, Some(new_head));
                    self.cache.invalidate(&ShardKey::new(Some(old_head), child_class));
                    self.cache.invalidate(&ShardKey::new(Some(new_head), child_class));
                    moved += 1;
                }
            }
            if moved > 0 {
                modified.insert(child_class);
                debug!(position = %self.position, structure_class = child_class, moved, "children moved to new track heads");
            }
        }
        Ok(())
    }

    /// Delete every object of `structure_class` and of the classes below it.
    pub fn delete_objects_by_class(&self, structure_class: StructureClass) -> BTreeSet<StructureClass> {
        let mut modified = BTreeSet::new();
        if self.is_read_only() {
            return modified;
        }
        let _guard = self.cache.lock();
        let classes = self.hierarchy.with_descendants(structure_class);
        for &class in &classes {
            let cleared = self.table(TableKind::Objects, class).and_then(|t| {
                t.clear()?;
                if let Some(m) = self.existing_table(TableKind::Measurements, class)? {
                    m.clear()?;
                }
                Ok(())
            });
            match cleared {
                Ok(()) => {
                    modified.insert(class);
                }
                Err(e) => error!(position = %self.position, structure_class = class, error = %e, "cannot clear class"),
            }
        }

        let parent_class = self.hierarchy.parent_of(structure_class);
        for key in self.cache.loaded_keys() {
            if classes.contains(&key.structure_class) || Some(key.structure_class) == parent_class {
                self.cache.invalidate(&key);
            }
        }
        modified
    }

    /// Delete every object and measurement of the position, and commit.
    pub fn delete_all_objects(&self) {
        if self.is_read_only() {
            return;
        }
        let _guard = self.cache.lock();
        for kind in TableKind::ALL {
            for class in self.known_classes(kind) {
                if let Err(e) = self.table(kind, class).and_then(|t| Ok(t.clear()?)) {
                    error!(position = %self.position, structure_class = class, error = %e, "cannot clear table");
                }
            }
        }
        self.commit();
        self.cache.clear();
        info!(position = %self.position, "deleted all objects");
    }

    // ---------------------------------------------------------------------
    // Measurements
    // ---------------------------------------------------------------------

    fn put_measurements(&self, class: StructureClass, measurements: &[&Measurements]) -> DaoResult<()> {
        let table = self.table(TableKind::Measurements, class)?;
        let serializer = &self.serializer;
        let records = measurements
            .par_iter()
            .map(|m| -> DaoResult<(String, String)> {
                Ok((measurement_key(m.object_id), serializer.serialize_measurements(m)?))
            })
            .collect::<DaoResult<Vec<(String, String)>>>()?;
        for (key, record) in &records {
            table.put(key, record)?;
        }
        Ok(())
    }

    pub fn upsert_measurement(&self, measurements: &Measurements) {
        self.upsert_measurements(std::slice::from_ref(measurements));
    }

    /// Write measurements and commit the measurement tables. Object tables are not committed.
    pub fn upsert_measurements(&self, measurements: &[Measurements]) {
        if self.is_read_only() {
            return;
        }
        let mut by_class: BTreeMap<StructureClass, Vec<&Measurements>> = BTreeMap::new();
        for m in measurements {
            by_class.entry(m.structure_class).or_default().push(m);
        }
        for (class, group) in by_class {
            let result = self
                .put_measurements(class, &group)
                .and_then(|()| Ok(self.table(TableKind::Measurements, class)?.commit()?));
            if let Err(e) = result {
                error!(position = %self.position, structure_class = class, error = %e, "measurement upsert failed");
            }
        }
    }

    /// All stored measurements of `structure_class`, in id order.
    pub fn get_measurements(&self, structure_class: StructureClass) -> Vec<Measurements> {
        let table = match self.existing_table(TableKind::Measurements, structure_class) {
            Ok(Some(table)) => table,
            Ok(None) => return Vec::new(),
            Err(e) => {
                error!(position = %self.position, structure_class, error = %e, "cannot open measurements");
                return Vec::new();
            }
        };
        let serializer = &self.serializer;
        table
            .values()
            .par_iter()
            .filter_map(|record| match serializer.deserialize_measurements(record) {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!(structure_class, error = %e, "skipping corrupted measurement record");
                    None
                }
            })
            .collect()
    }

    pub fn measurement(&self, structure_class: StructureClass, id: ObjectId) -> Option<Measurements> {
        let table = self.existing_table(TableKind::Measurements, structure_class).ok()??;
        let record = table.get(&measurement_key(id))?;
        self.serializer.deserialize_measurements(&record).ok()
    }

    pub fn delete_all_measurements(&self) {
        if self.is_read_only() {
            return;
        }
        for class in self.known_classes(TableKind::Measurements) {
            let result = self.table(TableKind::Measurements, class).and_then(|t| {
                t.clear()?;
                t.commit()?;
                Ok(())
            });
            if let Err(e) = result {
                error!(position = %self.position, structure_class = class, error = %e, "cannot delete measurements");
            }
        }
    }

    // ---------------------------------------------------------------------
    // Commit boundaries and maintenance
    // ---------------------------------------------------------------------

    fn commit_class(&self, class: StructureClass) -> DaoResult<()> {
        self.table(TableKind::Objects, class)?.commit()?;
        let measurements = self.tables(TableKind::Measurements).lock().get(&class).cloned();
        if let Some(table) = measurements {
            table.commit()?;
        }
        Ok(())
    }

    /// Commit every open table.
    pub fn commit(&self) {
        if self.is_read_only() {
            return;
        }
        for kind in TableKind::ALL {
            for (class, table) in self.open_tables(kind) {
                if let Err(e) = table.commit() {
                    error!(position = %self.position, structure_class = class, error = %e, "commit failed");
                }
            }
        }
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    /// Discard uncommitted writes and the cache built on them.
    pub fn rollback(&self) {
        let _guard = self.cache.lock();
        for kind in TableKind::ALL {
            for (_, table) in self.open_tables(kind) {
                table.rollback();
            }
        }
        self.cache.clear();
    }

    pub fn has_pending_writes(&self) -> bool {
        TableKind::ALL
            .into_iter()
            .any(|kind| self.open_tables(kind).iter().any(|(_, t)| t.has_pending()))
    }

    /// Commit and checkpoint open tables; with `only_opened == false` also tables only on disk.
    pub fn compact_dbs(&self, only_opened: bool) {
        if self.is_read_only() {
            return;
        }
        self.commit();
        for kind in TableKind::ALL {
            for (class, table) in self.open_tables(kind) {
                if let Err(e) = table.compact() {
                    error!(position = %self.position, structure_class = class, error = %e, "compaction failed");
                }
            }
        }
        if only_opened {
            return;
        }
        for (kind, class) in layout::list_tables(&self.dir) {
            if self.tables(kind).lock().contains_key(&class) {
                continue;
            }
            let path = self.dir.join(kind.file_name(class));
            let result = KvTable::open(&path, self.table_config.clone()).and_then(|t| {
                t.compact()?;
                t.close()
            });
            if let Err(e) = result {
                error!(position = %self.position, path = %path.display(), error = %e, "compaction failed");
            }
        }
    }

    /// Release transient payloads, drop every shard and close the tables.
    ///
    /// Without `commit`, pending writes are discarded.
    pub fn clear_cache(&self, commit: bool) {
        let _guard = self.cache.lock();
        if commit {
            self.commit();
        }
        self.cache.clear();
        for kind in TableKind::ALL {
            let drained: Vec<(StructureClass, Arc<KvTable>)> = self.tables(kind).lock().drain().collect();
            for (class, table) in drained {
                match Arc::try_unwrap(table) {
                    Ok(table) => {
                        if let Err(e) = table.close() {
                            warn!(position = %self.position, structure_class = class, error = %e, "close failed");
                        }
                    }
                    Err(_) => debug!(position = %self.position, structure_class = class, "table still in use"),
                }
            }
        }
    }

    /// Give up the position lock; the store becomes read-only.
    pub fn release_lock(&self) {
        self.read_only.store(true, Ordering::Release);
        if let Some(lock) = self.lock.lock().take() {
            lock.release();
            debug!(position = %self.position, "position lock released");
        }
    }
}

impl fmt::Debug for ObjectDao {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectDao")
            .field("position", &self.position)
            .field("dir", &self.dir)
            .field("read_only", &self.is_read_only())
            .field("cached_objects", &self.cache.object_count())
            .finish()
    }
}

/// Cut the track links of a removed object. The object after it heads a new track.
fn unlink_neighbours(shard: &mut Shard, removed: &SegmentedObject, changed: &mut BTreeSet<ObjectId>) {
    if let Some(previous) = removed.previous_id.and_then(|id| shard.get_mut(&id)) {
        if previous.next_id == Some(removed.id) {
            previous.next_id = None;
            changed.insert(previous.id);
        }
    }

    let Some(next_id) = removed.next_id else { return };
    match shard.get_mut(&next_id) {
        Some(next) if next.previous_id == Some(removed.id) => {
            next.previous_id = None;
            next.track_head_id = None;
            changed.insert(next_id);
        }
        _ => return,
    }

    let mut current = next_id;
    for _ in 0..shard.len() {
        let Some(following) = shard.get(&current).and_then(|o| o.next_id) else { break };
        match shard.get_mut(&following) {
            Some(o) if o.previous_id == Some(current) => {
                o.track_head_id = Some(next_id);
                changed.insert(following);
                current = following;
            }
            _ => break,
        }
    }
}

/// Give the siblings of removed objects contiguous labels again.
fn relabel(shard: &mut Shard, removed: &[SegmentedObject], changed: &mut BTreeSet<ObjectId>) {
    let groups: BTreeSet<(Option<ObjectId>, u32)> = removed.iter().map(|o| (o.parent_id, o.frame)).collect();
    for (parent_id, frame) in groups {
        let mut siblings: Vec<(u32, ObjectId)> = shard
            .values()
            .filter(|o| o.parent_id == parent_id && o.frame == frame)
            .map(|o| (o.idx, o.id))
            .collect();
        siblings.sort_unstable();
        for (new_idx, (old_idx, id)) in siblings.into_iter().enumerate() {
            if old_idx != new_idx as u32 {
                if let Some(o) = shard.get_mut(&id) {
                    o.idx = new_idx as u32;
                    changed.insert(id);
                }
            }
        }
    }
}
