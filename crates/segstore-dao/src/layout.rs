//! On-disk naming: dataset files, position directories, table files and record keys.
//!
//! Object records are keyed `"<partition>/<id>"` where the partition is the
//! hex id of the parent's track head, or `root` for root objects. All records
//! of one shard share a partition, so a shard load is one prefix scan.

use std::path::{Path, PathBuf};

use crate::experiment::StructureClass;
use crate::ids::ObjectId;

pub const ROOT_PARTITION: &str = "root";
/// Undecodable object records are kept under this prefix, outside every partition.
pub const QUARANTINE_PREFIX: &str = "corrupted/";
pub const OBJECTS_DIR: &str = "segmented_objects";
pub const POSITION_LOCK_FILE: &str = ".lock";
pub const SELECTIONS_DIR: &str = "Selections";
pub const SELECTIONS_DB: &str = "selections.db";

/// Kind of per-class table, selects the file name pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Objects,
    Measurements,
}

impl TableKind {
    pub const ALL: [TableKind; 2] = [TableKind::Objects, TableKind::Measurements];

    fn stem(self) -> &'static str {
        match self {
            TableKind::Objects => "objects",
            TableKind::Measurements => "measurements",
        }
    }

    /// `objects_<class>.db` or `measurements_<class>.db`
    pub fn file_name(self, class: StructureClass) -> String {
        format!("{}_{}.db", self.stem(), class)
    }

    /// Inverse of `file_name`.
    pub fn parse_file_name(name: &str) -> Option<(TableKind, StructureClass)> {
        let body = name.strip_suffix(".db")?;
        Self::ALL.into_iter().find_map(|kind| {
            let class = body.strip_prefix(kind.stem())?.strip_prefix('_')?.parse().ok()?;
            Some((kind, class))
        })
    }
}

pub fn partition_name(parent_track_head: Option<ObjectId>) -> String {
    match parent_track_head {
        Some(id) => id.to_string(),
        None => ROOT_PARTITION.to_string(),
    }
}

/// Prefix shared by every record of a partition, separator included.
pub fn partition_prefix(parent_track_head: Option<ObjectId>) -> String {
    format!("{}/", partition_name(parent_track_head))
}

pub fn record_key(parent_track_head: Option<ObjectId>, id: ObjectId) -> String {
    format!("{}/{}", partition_name(parent_track_head), id)
}

/// Split a record key into `(parent track head, id)`.
pub fn parse_record_key(key: &str) -> Option<(Option<ObjectId>, ObjectId)> {
    let (partition, id) = key.split_once('/')?;
    let id = ObjectId::from_hex(id)?;
    if partition == ROOT_PARTITION {
        Some((None, id))
    } else {
        Some((Some(ObjectId::from_hex(partition)?), id))
    }
}

pub fn quarantine_key(record_key: &str) -> String {
    format!("{}{}", QUARANTINE_PREFIX, record_key)
}

/// Measurement records are keyed by the object id alone.
pub fn measurement_key(id: ObjectId) -> String {
    id.to_string()
}

pub fn config_path(dataset_dir: &Path, db_name: &str) -> PathBuf {
    dataset_dir.join(format!("{}_config.json", db_name))
}

pub fn config_lock_path(dataset_dir: &Path, db_name: &str) -> PathBuf {
    dataset_dir.join(format!("{}_config.json.lock", db_name))
}

/// `<output>/<position>/segmented_objects`
pub fn objects_dir(output_dir: &Path, position: &str) -> PathBuf {
    output_dir.join(position).join(OBJECTS_DIR)
}

pub fn selections_dir(output_dir: &Path) -> PathBuf {
    output_dir.join(SELECTIONS_DIR)
}

/// Per-class tables present in a position directory.
pub fn list_tables(objects_dir: &Path) -> Vec<(TableKind, StructureClass)> {
    let Ok(entries) = std::fs::read_dir(objects_dir) else { return Vec::new() };
    let mut tables: Vec<(TableKind, StructureClass)> = entries
        .flatten()
        .filter_map(|e| e.file_name().to_str().and_then(TableKind::parse_file_name))
        .collect();
    tables.sort_by_key(|&(kind, class)| (class, kind == TableKind::Measurements));
    tables
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::ROOT_CLASS;

    #[test]
    fn test_table_file_names() {
        assert_eq!(TableKind::Objects.file_name(ROOT_CLASS), "objects_-1.db");
        assert_eq!(TableKind::Measurements.file_name(2), "measurements_2.db");
        assert_eq!(TableKind::parse_file_name("objects_-1.db"), Some((TableKind::Objects, -1)));
        assert_eq!(TableKind::parse_file_name("measurements_3.db"), Some((TableKind::Measurements, 3)));
        assert_eq!(TableKind::parse_file_name("objects_x.db"), None);
        assert_eq!(TableKind::parse_file_name(".lock"), None);
    }

    #[test]
    fn test_record_keys() {
        let head = ObjectId::new(0, 3);
        let id = ObjectId::new(4, 1);
        assert_eq!(record_key(None, id), "root/0000000400000001");
        assert_eq!(record_key(Some(head), id), "0000000000000003/0000000400000001");
        assert!(record_key(Some(head), id).starts_with(&partition_prefix(Some(head))));
        assert_eq!(parse_record_key(&record_key(Some(head), id)), Some((Some(head), id)));
        assert_eq!(parse_record_key("root/0000000400000001"), Some((None, id)));
        assert_eq!(parse_record_key("garbage"), None);
        assert_eq!(parse_record_key(&quarantine_key(&record_key(None, id))), None);
        assert!(!quarantine_key(&record_key(Some(head), id)).starts_with(&partition_prefix(Some(head))));
    }

    #[test]
    fn test_paths() {
        let out = Path::new("/data/xp");
        assert_eq!(objects_dir(out, "pos0"), Path::new("/data/xp/pos0/segmented_objects"));
        assert_eq!(config_lock_path(out, "xp"), Path::new("/data/xp/xp_config.json.lock"));
        assert_eq!(selections_dir(out).join(SELECTIONS_DB), Path::new("/data/xp/Selections/selections.db"));
    }

    #[test]
    fn test_list_tables() {
        let dir = tempfile::TempDir::new().unwrap();
        for name in ["objects_0.db", "measurements_0.db", "objects_-1.db", ".lock"] {
            std::fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        assert_eq!(
            list_tables(dir.path()),
            vec![(TableKind::Objects, -1), (TableKind::Objects, 0), (TableKind::Measurements, 0)]
        );
    }
}
