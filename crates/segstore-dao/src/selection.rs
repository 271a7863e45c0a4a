//! Named object selections of a dataset.
//!
//! All selections live in one table keyed by name. Selections saved as loose
//! files by older layouts are imported on first access:
//!
//! - `<name>.json`: a full selection record
//! - `<name>.csv`: `position;structure_class;id_path` rows, optional header
//! - `<name>.txt`: `position;id_path` rows (class 0), or the three csv columns

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use segstore_core::{Config, KvTable};

use crate::error::{DaoError, DaoResult};
use crate::experiment::{StructureClass, ROOT_CLASS};
use crate::layout::SELECTIONS_DB;

/// One selected object: position, class and its index path (e.g. `"3-0-2"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SelectionElement {
    pub position: String,
    pub structure_class: StructureClass,
    pub id_path: String,
}

impl SelectionElement {
    pub fn new(position: impl Into<String>, structure_class: StructureClass, id_path: impl Into<String>) -> Self {
        Self { position: position.into(), structure_class, id_path: id_path.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub name: String,
    /// Class of the selected objects; `ROOT_CLASS` until the first element is added
    pub structure_class: StructureClass,
    #[serde(default)]
    pub elements: BTreeSet<SelectionElement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub highlight_in_tracks: bool,
    #[serde(default)]
    pub display_in_image: bool,
}

impl Selection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            structure_class: ROOT_CLASS,
            elements: BTreeSet::new(),
            color: None,
            highlight_in_tracks: false,
            display_in_image: false,
        }
    }

    pub fn add(&mut self, element: SelectionElement) -> bool {
        if self.structure_class == ROOT_CLASS {
            self.structure_class = element.structure_class;
        }
        self.elements.insert(element)
    }

    pub fn remove(&mut self, element: &SelectionElement) -> bool {
        self.elements.remove(element)
    }

    /// Elements of `position`, in path order.
    pub fn elements_of<'a>(&'a self, position: &'a str) -> impl Iterator<Item = &'a SelectionElement> + 'a {
        self.elements.iter().filter(move |e| e.position == position)
    }

    pub fn positions(&self) -> BTreeSet<&str> {
        self.elements.iter().map(|e| e.position.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Union `other`'s elements into `self`; `self` keeps its metadata.
    fn merge(&mut self, other: Selection) {
        if self.structure_class == ROOT_CLASS {
            self.structure_class = other.structure_class;
        }
        self.elements.extend(other.elements);
    }
}

pub struct SelectionStore {
    dir: PathBuf,
    table: KvTable,
    imported: Mutex<bool>,
}

impl SelectionStore {
    /// Open the selection table in `dir`. A read-only store never writes nor imports.
    pub fn open(dir: PathBuf, read_only: bool, config: Config) -> DaoResult<Self> {
        let path = dir.join(SELECTIONS_DB);
        let table = if read_only { KvTable::open_read_only(&path, config)? } else { KvTable::open(&path, config)? };
        Ok(Self { dir, table, imported: Mutex::new(false) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_read_only(&self) -> bool {
        self.table.is_read_only()
    }

    fn ensure_imported(&self) {
        let mut imported = self.imported.lock();
        if *imported {
            return;
        }
        *imported = true;
        if self.is_read_only() {
            return;
        }
        if let Err(e) = self.import_legacy() {
            error!(dir = %self.dir.display(), error = %e, "legacy selection import failed");
        }
    }

    fn import_legacy(&self) -> DaoResult<()> {
        let mut imported: BTreeMap<String, (Selection, Vec<PathBuf>)> = BTreeMap::new();
        for path in legacy_files(&self.dir) {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else { continue };
            let selection = match parse_legacy(&path, &name) {
                Ok(selection) => selection,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable selection file");
                    continue;
                }
            };
            match imported.get_mut(&name) {
                Some((existing, files)) => {
                    existing.merge(selection);
                    files.push(path);
                }
                None => {
                    imported.insert(name, (selection, vec![path]));
                }
            }
        }
        if imported.is_empty() {
            return Ok(());
        }

        let mut files = Vec::new();
        for (name, (legacy, paths)) in imported {
            let merged = match self.read(&name)? {
                Some(mut stored) => {
                    stored.merge(legacy);
                    stored
                }
                None => legacy,
            };
            self.write(&merged)?;
            files.extend(paths);
        }
        self.table.commit()?;
        for path in &files {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "cannot remove imported selection file");
            }
        }
        info!(dir = %self.dir.display(), files = files.len(), "imported legacy selections");
        Ok(())
    }

    fn read(&self, name: &str) -> DaoResult<Option<Selection>> {
        self.table
            .get(name)
            .map(|record| {
                serde_json::from_str(&record).map_err(|e| DaoError::serialization(format!("selection {}", name), e))
            })
            .transpose()
    }

    fn write(&self, selection: &Selection) -> DaoResult<()> {
        let record = serde_json::to_string(selection)
            .map_err(|e| DaoError::serialization(format!("selection {}", selection.name), e))?;
        self.table.put(&selection.name, &record)?;
        Ok(())
    }

    /// Selection `name`, created empty when absent (or when `clear_if_existing`).
    ///
    /// A created selection is persisted unless the store is read-only.
    pub fn get_or_create(&self, name: &str, clear_if_existing: bool) -> Selection {
        self.ensure_imported();
        let existing = match self.read(name) {
            Ok(existing) => existing,
            Err(e) => {
                error!(selection = name, error = %e, "corrupted selection, recreating");
                None
            }
        };
        match existing {
            Some(mut selection) => {
                if clear_if_existing {
                    selection.elements.clear();
                    self.store(&selection);
                }
                selection
            }
            None => {
                let selection = Selection::new(name);
                self.store(&selection);
                selection
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Selection> {
        self.ensure_imported();
        self.read(name).unwrap_or_else(|e| {
            error!(selection = name, error = %e, "corrupted selection");
            None
        })
    }

    /// Every stored selection, sorted by name.
    pub fn get_selections(&self) -> Vec<Selection> {
        self.ensure_imported();
        self.table
            .prefix_scan("")
            .into_iter()
            .filter_map(|(name, record)| match serde_json::from_str(&record) {
                Ok(selection) => Some(selection),
                Err(e) => {
                    warn!(selection = %name, error = %e, "skipping corrupted selection");
                    None
                }
            })
            .collect()
    }

    pub fn store(&self, selection: &Selection) {
        if self.is_read_only() {
            return;
        }
        self.ensure_imported();
        let result = self.write(selection).and_then(|()| Ok(self.table.commit()?));
        match result {
            Ok(_) => debug!(selection = %selection.name, elements = selection.len(), "selection stored"),
            Err(e) => error!(selection = %selection.name, error = %e, "cannot store selection"),
        }
    }

    pub fn delete(&self, name: &str) {
        if self.is_read_only() {
            return;
        }
        self.ensure_imported();
        let result = self.table.remove(name).and_then(|()| self.table.commit());
        if let Err(e) = result {
            error!(selection = name, error = %e, "cannot delete selection");
        }
    }

    pub fn delete_selection(&self, selection: &Selection) {
        self.delete(&selection.name);
    }

    /// Remove every selection.
    pub fn delete_all_objects(&self) {
        if self.is_read_only() {
            return;
        }
        self.ensure_imported();
        let result = self.table.clear().and_then(|()| self.table.commit());
        if let Err(e) = result {
            error!(dir = %self.dir.display(), error = %e, "cannot delete selections");
        }
    }

    /// Commit pending writes and checkpoint the table.
    pub fn close(&self) {
        if self.is_read_only() {
            return;
        }
        let result = self.table.commit().and_then(|_| self.table.compact());
        if let Err(e) = result {
            warn!(dir = %self.dir.display(), error = %e, "cannot close selection table");
        }
    }
}

fn legacy_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else { return Vec::new() };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("json" | "csv" | "txt")))
        .collect();
    files.sort();
    files
}

fn parse_legacy(path: &Path, name: &str) -> DaoResult<Selection> {
    let text = std::fs::read_to_string(path).map_err(|e| DaoError::io(path, e))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => {
            let mut selection: Selection = serde_json::from_str(&text)
                .map_err(|e| DaoError::serialization(format!("selection file {}", path.display()), e))?;
            if selection.name.is_empty() {
                selection.name = name.to_string();
            }
            Ok(selection)
        }
        _ => Ok(parse_rows(&text, name)),
    }
}

/// `position;class;path` or `position;path` rows. Unparseable rows are skipped.
fn parse_rows(text: &str, name: &str) -> Selection {
    let mut selection = Selection::new(name);
    for (line_no, line) in text.lines().enumerate() {
        let fields: Vec<&str> = line.split(';').map(str::trim).collect();
        let element = match fields.as_slice() {
            [position, class, id_path] if !position.is_empty() && !id_path.is_empty() => match class.parse() {
                Ok(class) => SelectionElement::new(*position, class, *id_path),
                Err(_) => {
                    if line_no > 0 {
                        debug!(selection = name, line = line_no + 1, "skipping malformed row");
                    }
                    continue;
                }
            },
            [position, id_path] if !position.is_empty() && !id_path.is_empty() => {
                SelectionElement::new(*position, 0, *id_path)
            }
            _ => continue,
        };
        selection.add(element);
    }
    selection
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &Path) -> SelectionStore {
        SelectionStore::open(dir.to_path_buf(), false, Config::default()).unwrap()
    }

    #[test]
    fn test_get_or_create_persists() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(dir.path());
            let mut selection = store.get_or_create("dividing", false);
            assert_eq!(selection.structure_class, ROOT_CLASS);
            selection.add(SelectionElement::new("pos0", 1, "0-2"));
            store.store(&selection);
            store.close();
        }
        let store = open(dir.path());
        let selection = store.get("dividing").unwrap();
        assert_eq!(selection.structure_class, 1);
        assert_eq!(selection.len(), 1);

        let cleared = store.get_or_create("dividing", true);
        assert!(cleared.is_empty());
        assert!(store.get("dividing").unwrap().is_empty());
    }

    #[test]
    fn test_delete_and_list() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());
        for name in ["b", "a", "c"] {
            store.get_or_create(name, false);
        }
        let names: Vec<String> = store.get_selections().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        store.delete("b");
        let a = store.get("a").unwrap();
        store.delete_selection(&a);
        assert_eq!(store.get_selections().len(), 1);
        store.delete_all_objects();
        assert!(store.get_selections().is_empty());
    }

    #[test]
    fn test_parse_rows_formats() {
        let csv = parse_rows("position;structure_class;id_path\npos0;1;0-1\npos1;1;2-3\n", "s");
        assert_eq!(csv.len(), 2);
        assert_eq!(csv.structure_class, 1);
        assert_eq!(csv.positions(), BTreeSet::from(["pos0", "pos1"]));

        let txt = parse_rows("pos0;4-1\n\npos0;4-2\n", "t");
        assert_eq!(txt.structure_class, 0);
        assert_eq!(txt.elements_of("pos0").map(|e| e.id_path.as_str()).collect::<Vec<_>>(), vec!["4-1", "4-2"]);
    }

    #[test]
    fn test_legacy_import_merges_and_removes_files() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(dir.path());
            let mut stored = Selection::new("tracked");
            stored.color = Some("red".into());
            stored.add(SelectionElement::new("pos0", 0, "1-1"));
            store.store(&stored);
            store.close();
        }
        std::fs::write(dir.path().join("tracked.txt"), "pos0;1-1\npos0;1-2\n").unwrap();
        std::fs::write(dir.path().join("other.csv"), "pos1;2;0-0\n").unwrap();

        let store = open(dir.path());
        let tracked = store.get("tracked").unwrap();
        assert_eq!(tracked.color.as_deref(), Some("red"));
        assert_eq!(tracked.len(), 2);
        assert_eq!(store.get("other").unwrap().structure_class, 2);
        assert!(!dir.path().join("tracked.txt").exists());
        assert!(!dir.path().join("other.csv").exists());
    }

    #[test]
    fn test_read_only_skips_import() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("legacy.txt"), "pos0;1-1\n").unwrap();
        let store = SelectionStore::open(dir.path().to_path_buf(), true, Config::default()).unwrap();
        assert!(store.get_selections().is_empty());
        store.store(&Selection::new("x"));
        assert!(store.get("x").is_none());
        assert!(dir.path().join("legacy.txt").exists());
        assert!(!dir.path().join(SELECTIONS_DB).exists());
    }
}
