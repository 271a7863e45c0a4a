//! Segmented objects and their measurement payloads.
//!
//! Relations (parent, previous, next, track head) are stored as ids. The
//! `links` resolved by a shard load are transient and never serialized.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::experiment::{StructureClass, ROOT_CLASS};
use crate::ids::ObjectId;
use crate::shard_cache::ShardKey;

/// Relations verified against the loaded shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Links {
    pub previous: Option<ObjectId>,
    pub next: Option<ObjectId>,
    pub track_head: Option<ObjectId>,
    pub parent: Option<ObjectId>,
}

/// A node of the object graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentedObject {
    pub id: ObjectId,
    pub frame: u32,
    pub structure_class: StructureClass,
    /// Label among siblings sharing the same parent and frame
    pub idx: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ObjectId>,
    /// Track head of the parent; `None` for root objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_track_head_id: Option<ObjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<ObjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_id: Option<ObjectId>,
    /// `None` when the object heads its own track
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_head_id: Option<ObjectId>,
    /// Opaque serialized region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(skip)]
    pub measurements: Option<Measurements>,
    /// Child ids per child class, sorted; derived on shard load
    #[serde(skip)]
    pub children: BTreeMap<StructureClass, Vec<ObjectId>>,
    #[serde(skip)]
    pub links: Links,
    /// Heavyweight image data, dropped by `clear_cache`
    #[serde(skip)]
    pub raster: Option<Arc<[u8]>>,
}

impl SegmentedObject {
    pub fn new(id: ObjectId, frame: u32, structure_class: StructureClass, idx: u32) -> Self {
        Self {
            id,
            frame,
            structure_class,
            idx,
            parent_id: None,
            parent_track_head_id: None,
            previous_id: None,
            next_id: None,
            track_head_id: None,
            region: None,
            measurements: None,
            children: BTreeMap::new(),
            links: Links::default(),
            raster: None,
        }
    }

    /// Root object of `frame`.
    pub fn root(id: ObjectId, frame: u32) -> Self {
        Self::new(id, frame, ROOT_CLASS, 0)
    }

    pub fn with_parent(mut self, parent: &SegmentedObject) -> Self {
        self.parent_id = Some(parent.id);
        self.parent_track_head_id = Some(parent.track_head());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Append `self` to the track of `previous`.
    pub fn follow(&mut self, previous: &mut SegmentedObject) {
        previous.next_id = Some(self.id);
        self.previous_id = Some(previous.id);
        self.track_head_id = Some(previous.track_head());
    }

    pub fn is_root(&self) -> bool {
        self.structure_class == ROOT_CLASS
    }

    /// Resolved track head, else the persisted one, else self.
    pub fn track_head(&self) -> ObjectId {
        self.links.track_head.or(self.track_head_id).unwrap_or(self.id)
    }

    pub fn is_track_head(&self) -> bool {
        self.track_head() == self.id
    }

    pub fn shard_key(&self) -> ShardKey {
        ShardKey::new(self.parent_track_head_id, self.structure_class)
    }

    /// Sibling order within a shard.
    pub fn sort_key(&self) -> (u32, u32, ObjectId) {
        (self.frame, self.idx, self.id)
    }

    pub fn children_ids(&self, class: StructureClass) -> &[ObjectId] {
        self.children.get(&class).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Measurements, created empty on first access.
    pub fn measurements_mut(&mut self) -> &mut Measurements {
        let (id, frame, class) = (self.id, self.frame, self.structure_class);
        self.measurements.get_or_insert_with(|| Measurements::new(id, frame, class))
    }

    /// Measurements changed since they were last written.
    pub fn has_unflushed_measurements(&self) -> bool {
        self.measurements.as_ref().map_or(false, Measurements::is_modified)
    }

    /// Drop transient heavyweight payloads.
    pub fn release_transient(&mut self) {
        self.raster = None;
    }
}

/// Measurement values of one object, stored apart from the object record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    pub object_id: ObjectId,
    pub frame: u32,
    pub structure_class: StructureClass,
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,
    #[serde(skip)]
    modified: bool,
}

impl Measurements {
    pub fn new(object_id: ObjectId, frame: u32, structure_class: StructureClass) -> Self {
        Self { object_id, frame, structure_class, values: BTreeMap::new(), modified: false }
    }

    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.values.insert(key.into(), value.into());
        self.modified = true;
    }

    pub fn value(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub(crate) fn mark_flushed(&mut self) {
        self.modified = false;
    }
}
