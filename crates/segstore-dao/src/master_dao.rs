//! Dataset gateway: experiment descriptor, configuration lock and the bounded
//! working set of position stores.
//!
//! ```text
//! <dataset>/
//!   <db>_config.json        experiment descriptor (single-line JSON)
//!   <db>_config.json.lock   held while the dataset is writable
//! <output>/
//!   <position>/segmented_objects/...
//!   Selections/selections.db
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use segstore_core::platform_durability::durable_sync;

use crate::config::StoreConfig;
use crate::error::{DaoError, DaoResult};
use crate::experiment::{Experiment, ExperimentDescriptor};
use crate::layout;
use crate::lock::FileLock;
use crate::notify::{Notifier, TracingNotifier};
use crate::object_dao::ObjectDao;
use crate::selection::SelectionStore;
use crate::serializer::{JsonSerializer, ObjectSerializer};

/// Asked before committing pending writes of a store being closed in safe mode.
///
/// `Some(true)` commits, `Some(false)` rolls back, `None` (no answer) commits.
pub type SafeModePrompt = Arc<dyn Fn(&str) -> Option<bool> + Send + Sync>;

/// Open position stores, least recently used first.
#[derive(Default)]
struct WorkingSet {
    order: VecDeque<String>,
    stores: HashMap<String, Arc<ObjectDao>>,
}

impl WorkingSet {
    fn touch(&mut self, name: &str) {
        if let Some(pos) = self.order.iter().position(|n| n == name) {
            if let Some(n) = self.order.remove(pos) {
                self.order.push_back(n);
            }
        }
    }

    fn insert(&mut self, name: &str, store: Arc<ObjectDao>) {
        self.order.push_back(name.to_string());
        self.stores.insert(name.to_string(), store);
    }

    fn remove(&mut self, name: &str) -> Option<Arc<ObjectDao>> {
        self.order.retain(|n| n != name);
        self.stores.remove(name)
    }

    fn pop_lru(&mut self) -> Option<(String, Arc<ObjectDao>)> {
        let name = self.order.pop_front()?;
        let store = self.stores.remove(&name)?;
        Some((name, store))
    }

    fn drain(&mut self) -> Vec<(String, Arc<ObjectDao>)> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(entry) = self.pop_lru() {
            out.push(entry);
        }
        out
    }
}

/// Dataset-level store. Hands out position stores and owns the experiment descriptor.
pub struct MasterDao<X: ExperimentDescriptor = Experiment> {
    dir: PathBuf,
    db_name: String,
    config: StoreConfig,
    read_only: AtomicBool,
    config_lock: Mutex<Option<FileLock>>,
    config_file: Mutex<Option<File>>,
    experiment: RwLock<Option<X>>,
    working_set: Mutex<WorkingSet>,
    lock_requested: Mutex<HashSet<String>>,
    selections: Mutex<Option<Arc<SelectionStore>>>,
    notifier: Arc<dyn Notifier>,
    safe_mode_prompt: Mutex<Option<SafeModePrompt>>,
    serializer: Arc<dyn ObjectSerializer>,
}

impl<X: ExperimentDescriptor> MasterDao<X> {
    /// Open the dataset `db_name` in `dir`, notifying through `tracing`.
    pub fn open(dir: impl Into<PathBuf>, db_name: &str, config: StoreConfig) -> DaoResult<Self> {
        Self::open_with(dir, db_name, config, Arc::new(TracingNotifier))
    }

    /// Open the dataset with a custom notification channel.
    ///
    /// Unless `config.read_only` is set the configuration lock is tried; when it is
    /// held elsewhere the dataset opens read-only and the user is notified.
    pub fn open_with(
        dir: impl Into<PathBuf>,
        db_name: &str,
        config: StoreConfig,
        notifier: Arc<dyn Notifier>,
    ) -> DaoResult<Self> {
        config.validate()?;
        let dir = dir.into();
        let config_path = layout::config_path(&dir, db_name);

        let (lock, file) = if config.read_only {
            (None, None)
        } else {
            match FileLock::try_acquire(&layout::config_lock_path(&dir, db_name)) {
                Ok(Some(lock)) => {
                    let file = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create(true)
                        .truncate(false)
                        .open(&config_path)
                        .map_err(|e| DaoError::io(&config_path, e))?;
                    (Some(lock), Some(file))
                }
                Ok(None) => {
                    notifier.info(&format!(
                        "Configuration of dataset {} is locked by another process; opening read-only",
                        db_name
                    ));
                    (None, None)
                }
                Err(e) => {
                    notifier.error(&format!("Cannot lock configuration of dataset {}: {}; opening read-only", db_name, e));
                    (None, None)
                }
            }
        };
        let read_only = lock.is_none();
        let experiment = read_experiment::<X>(&config_path)?;
        info!(
            dataset = db_name,
            dir = %dir.display(),
            read_only,
            experiment = experiment.is_some(),
            "opened dataset"
        );

        Ok(Self {
            dir,
            db_name: db_name.to_string(),
            config,
            read_only: AtomicBool::new(read_only),
            config_lock: Mutex::new(lock),
            config_file: Mutex::new(file),
            experiment: RwLock::new(experiment),
            working_set: Mutex::new(WorkingSet::default()),
            lock_requested: Mutex::new(HashSet::new()),
            selections: Mutex::new(None),
            notifier,
            safe_mode_prompt: Mutex::new(None),
            serializer: Arc::new(JsonSerializer),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// True when the configuration lock is not held.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn set_safe_mode_prompt(&self, prompt: SafeModePrompt) {
        *self.safe_mode_prompt.lock() = Some(prompt);
    }

    // ---------------------------------------------------------------------
    // Experiment
    // ---------------------------------------------------------------------

    pub fn experiment(&self) -> Option<X> {
        self.experiment.read().clone()
    }

    /// Persist `experiment` and read it back.
    ///
    /// Refused on a read-only dataset. Returns false when the write fails or
    /// the file read back differs; both are reported to the user.
    pub fn set_experiment(&self, experiment: X) -> bool {
        if self.is_read_only() {
            self.notifier.error(&format!("Dataset {} is read-only; configuration not saved", self.db_name));
            return false;
        }
        let json = match serde_json::to_string(&experiment) {
            Ok(json) => json,
            Err(e) => {
                self.notifier.error(&format!("Cannot encode configuration of dataset {}: {}", self.db_name, e));
                return false;
            }
        };
        let path = layout::config_path(&self.dir, &self.db_name);
        if let Err(e) = self.write_config(&path, &json) {
            self.notifier.error(&format!("Cannot save configuration of dataset {}: {}", self.db_name, e));
            return false;
        }

        let saved = read_experiment::<X>(&path)
            .ok()
            .flatten()
            .and_then(|x| serde_json::to_string(&x).ok());
        if saved.as_deref() != Some(json.as_str()) {
            self.notifier.error(&format!("Configuration of dataset {} differs after saving", self.db_name));
            return false;
        }
        *self.experiment.write() = Some(experiment);
        debug!(dataset = %self.db_name, bytes = json.len(), "configuration saved");
        true
    }

    /// Apply `f` to a copy of the current experiment and save it.
    pub fn update_experiment(&self, f: impl FnOnce(&mut X)) -> bool {
        let Some(mut experiment) = self.experiment() else {
            self.notifier.error(&format!("Dataset {} has no configuration to update", self.db_name));
            return false;
        };
        f(&mut experiment);
        self.set_experiment(experiment)
    }

    fn write_config(&self, path: &Path, json: &str) -> DaoResult<()> {
        let mut guard = self.config_file.lock();
        let Some(file) = guard.as_mut() else {
            return std::fs::write(path, json).map_err(|e| DaoError::io(path, e));
        };
        file.set_len(0).map_err(|e| DaoError::io(path, e))?;
        file.seek(SeekFrom::Start(0)).map_err(|e| DaoError::io(path, e))?;
        file.write_all(json.as_bytes()).map_err(|e| DaoError::io(path, e))?;
        durable_sync(file).map_err(|e| DaoError::io(path, e))
    }

    pub fn position_names(&self) -> Vec<String> {
        self.experiment.read().as_ref().map(|x| x.position_names()).unwrap_or_default()
    }

    /// Resolved output directory of the experiment.
    pub fn output_dir(&self) -> DaoResult<PathBuf> {
        let experiment = self.experiment.read();
        let experiment = experiment.as_ref().ok_or_else(|| DaoError::ExperimentMissing(self.db_name.clone()))?;
        let out = experiment
            .output_directory()
            .ok_or_else(|| DaoError::NoOutputDirectory(self.db_name.clone()))?;
        Ok(if out.is_absolute() { out.to_path_buf() } else { self.dir.join(out) })
    }

    // ---------------------------------------------------------------------
    // Position stores
    // ---------------------------------------------------------------------

    /// Store of position `name`, opening it if needed.
    ///
    /// Opening beyond `max_open_positions` closes the least recently used store first.
    pub fn get_position_store(&self, name: &str) -> DaoResult<Arc<ObjectDao>> {
        let (hierarchy, known) = {
            let experiment = self.experiment.read();
            let experiment = experiment.as_ref().ok_or_else(|| DaoError::ExperimentMissing(self.db_name.clone()))?;
            (experiment.hierarchy(), experiment.position_names().iter().any(|p| p == name))
        };
        if !known {
            return Err(DaoError::UnknownPosition(name.to_string()));
        }
        let output = self.output_dir()?;

        {
            let mut working_set = self.working_set.lock();
            if let Some(store) = working_set.stores.get(name).cloned() {
                working_set.touch(name);
                return Ok(store);
            }
        }
        self.evict_down_to(self.config.max_open_positions - 1);

        let lock_requested = self.lock_requested.lock().contains(name);
        let read_only = self.is_read_only() && !lock_requested;
        let opened = Arc::new(ObjectDao::open(
            name,
            layout::objects_dir(&output, name),
            hierarchy,
            read_only,
            self.config.table.clone(),
            Arc::clone(&self.serializer),
        ));

        let store = {
            let mut working_set = self.working_set.lock();
            match working_set.stores.get(name).cloned() {
                // opened concurrently; ours is dropped with its lock
                Some(existing) => {
                    working_set.touch(name);
                    existing
                }
                None => {
                    if !read_only && opened.is_read_only() {
                        self.notifier.info(&format!("Position {} is locked by another process; opened read-only", name));
                    }
                    working_set.insert(name, Arc::clone(&opened));
                    opened
                }
            }
        };
        self.evict_down_to(self.config.max_open_positions);
        Ok(store)
    }

    /// Close least recently used stores until at most `bound` remain open.
    ///
    /// Stores are closed after the working set is unlocked, so a safe-mode
    /// prompt may call back into this dataset.
    fn evict_down_to(&self, bound: usize) {
        let evicted: Vec<(String, Arc<ObjectDao>)> = {
            let mut working_set = self.working_set.lock();
            let mut evicted = Vec::new();
            while working_set.order.len() > bound {
                match working_set.pop_lru() {
                    Some(entry) => evicted.push(entry),
                    None => break,
                }
            }
            evicted
        };
        for (name, store) in evicted {
            debug!(dataset = %self.db_name, position = %name, "evicting position store");
            self.close_store(&store);
        }
    }

    /// Commit (or, in safe mode, maybe roll back), clear and unlock a store leaving the working set.
    fn close_store(&self, store: &ObjectDao) {
        if !store.is_read_only() {
            let commit = if self.config.safe_mode && store.has_pending_writes() {
                let prompt = self.safe_mode_prompt.lock().clone();
                prompt
                    .and_then(|ask| ask(&format!("Commit pending changes of position {}?", store.position())))
                    .unwrap_or(true)
            } else {
                true
            };
            if commit {
                store.commit();
            } else {
                warn!(position = store.position(), "rolling back pending changes");
                store.rollback();
            }
        }
        store.clear_cache(false);
        store.release_lock();
    }

    /// Request write access to `names`. Returns false if any of them could not be locked.
    pub fn lock_positions(&self, names: &[&str]) -> bool {
        let mut all_locked = true;
        for &name in names {
            self.lock_requested.lock().insert(name.to_string());
            let reopen = self.working_set.lock().stores.get(name).map_or(false, |s| s.is_read_only());
            if reopen {
                let store = self.working_set.lock().remove(name);
                if let Some(store) = store {
                    self.close_store(&store);
                }
            }
            match self.get_position_store(name) {
                Ok(store) if !store.is_read_only() => {}
                // the user was told when the store opened read-only
                Ok(_) => all_locked = false,
                Err(e) => {
                    self.notifier.error(&format!("Position {} could not be locked: {}", name, e));
                    all_locked = false;
                }
            }
        }
        all_locked
    }

    /// Close `names`, committing their writes and releasing their locks.
    pub fn unlock_positions(&self, names: &[&str]) {
        for &name in names {
            self.lock_requested.lock().remove(name);
            let store = self.working_set.lock().remove(name);
            if let Some(store) = store {
                self.close_store(&store);
                debug!(dataset = %self.db_name, position = name, "position unlocked");
            }
        }
    }

    /// Names of open stores, least recently used first.
    pub fn open_positions(&self) -> Vec<String> {
        self.working_set.lock().order.iter().cloned().collect()
    }

    pub fn commit_all(&self) {
        let stores: Vec<Arc<ObjectDao>> = self.working_set.lock().stores.values().cloned().collect();
        for store in stores {
            store.commit();
        }
    }

    /// Compact open stores; with `only_opened == false` every position on disk.
    pub fn compact(&self, only_opened: bool) {
        let open: Vec<(String, Arc<ObjectDao>)> = {
            let working_set = self.working_set.lock();
            working_set.order.iter().filter_map(|n| working_set.stores.get(n).map(|s| (n.clone(), Arc::clone(s)))).collect()
        };
        for (_, store) in &open {
            store.compact_dbs(only_opened);
        }
        if only_opened || self.is_read_only() {
            return;
        }
        let output = match self.output_dir() {
            Ok(output) => output,
            Err(e) => {
                error!(dataset = %self.db_name, error = %e, "cannot compact positions");
                return;
            }
        };
        let Some(hierarchy) = self.experiment.read().as_ref().map(|x| x.hierarchy()) else { return };
        for name in self.position_names() {
            if open.iter().any(|(n, _)| *n == name) {
                continue;
            }
            let dir = layout::objects_dir(&output, &name);
            if !dir.exists() {
                continue;
            }
            let store = ObjectDao::open(
                &name,
                dir,
                hierarchy.clone(),
                false,
                self.config.table.clone(),
                Arc::clone(&self.serializer),
            );
            store.compact_dbs(false);
            store.clear_cache(false);
            store.release_lock();
        }
    }

    /// Commit and drop the cache of one open position.
    pub fn clear_cache(&self, position: &str) {
        let store = self.working_set.lock().stores.get(position).cloned();
        if let Some(store) = store {
            store.clear_cache(!store.is_read_only());
        }
    }

    pub fn get_selection_store(&self) -> DaoResult<Arc<SelectionStore>> {
        let mut selections = self.selections.lock();
        if let Some(store) = selections.as_ref() {
            return Ok(Arc::clone(store));
        }
        let dir = layout::selections_dir(&self.output_dir()?);
        let store = Arc::new(SelectionStore::open(dir, self.is_read_only(), self.config.table.clone())?);
        *selections = Some(Arc::clone(&store));
        Ok(store)
    }

    /// Release the configuration lock; the dataset becomes read-only.
    pub fn unlock_configuration(&self) {
        self.read_only.store(true, Ordering::Release);
        self.config_file.lock().take();
        if let Some(lock) = self.config_lock.lock().take() {
            lock.release();
            info!(dataset = %self.db_name, "configuration unlocked");
        }
    }

    /// Close every position store and the selection store, then unlock the configuration.
    pub fn close(&self) {
        let stores = self.working_set.lock().drain();
        for (_, store) in stores {
            self.close_store(&store);
        }
        self.lock_requested.lock().clear();
        if let Some(selections) = self.selections.lock().take() {
            selections.close();
        }
        self.unlock_configuration();
    }
}

impl<X: ExperimentDescriptor> fmt::Debug for MasterDao<X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterDao")
            .field("dir", &self.dir)
            .field("db_name", &self.db_name)
            .field("read_only", &self.is_read_only())
            .field("open_positions", &self.open_positions())
            .finish()
    }
}

/// Parse the descriptor at `path`; `None` if the file is absent or empty.
fn read_experiment<X: ExperimentDescriptor>(path: &Path) -> DaoResult<Option<X>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(DaoError::io(path, e)),
    };
    if text.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| DaoError::serialization(format!("configuration {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::SegmentedObject;
    use tempfile::TempDir;

    fn experiment() -> Experiment {
        Experiment::new("xp")
            .with_output_directory("out")
            .with_positions(["pos0", "pos1", "pos2"])
            .with_structure("channel", -1)
    }

    fn open(dir: &Path, config: StoreConfig) -> MasterDao {
        let dao: MasterDao = MasterDao::open(dir, "xp", config).unwrap();
        if dao.experiment().is_none() && !dao.is_read_only() {
            assert!(dao.set_experiment(experiment()));
        }
        dao
    }

    #[test]
    fn test_experiment_persisted() {
        let dir = TempDir::new().unwrap();
        {
            let dao = open(dir.path(), StoreConfig::default());
            assert_eq!(dao.position_names(), vec!["pos0", "pos1", "pos2"]);
            dao.close();
        }
        let dao: MasterDao = MasterDao::open(dir.path(), "xp", StoreConfig::default()).unwrap();
        assert_eq!(dao.experiment(), Some(experiment()));
        assert_eq!(dao.output_dir().unwrap(), dir.path().join("out"));
        assert!(dao.update_experiment(|x| x.positions.push("pos3".into())));
        assert_eq!(dao.position_names().len(), 4);
    }

    #[test]
    fn test_unknown_position_rejected() {
        let dir = TempDir::new().unwrap();
        let dao = open(dir.path(), StoreConfig::default());
        assert!(matches!(dao.get_position_store("nope"), Err(DaoError::UnknownPosition(_))));
    }

    #[test]
    fn test_missing_output_directory_is_fatal() {
        let dir = TempDir::new().unwrap();
        let dao: MasterDao = MasterDao::open(dir.path(), "xp", StoreConfig::default()).unwrap();
        assert!(dao.set_experiment(Experiment::new("xp").with_positions(["pos0"])));
        assert!(matches!(dao.get_position_store("pos0"), Err(DaoError::NoOutputDirectory(_))));
    }

    #[test]
    fn test_reopening_moves_store_to_tail() {
        let dir = TempDir::new().unwrap();
        let dao = open(dir.path(), StoreConfig { max_open_positions: 2, ..StoreConfig::default() });
        let first = dao.get_position_store("pos0").unwrap();
        dao.get_position_store("pos1").unwrap();
        let again = dao.get_position_store("pos0").unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(dao.open_positions(), vec!["pos1", "pos0"]);

        dao.get_position_store("pos2").unwrap();
        assert_eq!(dao.open_positions(), vec!["pos0", "pos2"]);
    }

    #[test]
    fn test_safe_mode_rollback_on_eviction() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig { max_open_positions: 1, safe_mode: true, ..StoreConfig::default() };
        let dao = open(dir.path(), config);
        dao.set_safe_mode_prompt(Arc::new(|_: &str| Some(false)));

        let store = dao.get_position_store("pos0").unwrap();
        let root = SegmentedObject::root(store.generate_id(0).unwrap(), 0);
        store.store_all(std::slice::from_ref(&root), false);
        assert!(store.has_pending_writes());

        dao.get_position_store("pos1").unwrap();
        assert_eq!(store.commit_count(), 0);

        let reopened = dao.get_position_store("pos0").unwrap();
        assert!(reopened.get_roots().is_empty());
    }

    #[test]
    fn test_unlock_configuration_makes_read_only() {
        let dir = TempDir::new().unwrap();
        let dao = open(dir.path(), StoreConfig::default());
        let lock_path = layout::config_lock_path(dir.path(), "xp");
        assert!(lock_path.exists());

        dao.unlock_configuration();
        assert!(dao.is_read_only());
        assert!(!lock_path.exists());
        assert!(!dao.set_experiment(experiment()));
        assert!(dao.get_position_store("pos0").unwrap().is_read_only());
    }

    #[test]
    fn test_lock_positions_on_read_only_dataset() {
        let dir = TempDir::new().unwrap();
        open(dir.path(), StoreConfig::default()).close();

        let dao: MasterDao = MasterDao::open(dir.path(), "xp", StoreConfig::read_only()).unwrap();
        assert!(dao.is_read_only());
        assert!(dao.get_position_store("pos0").unwrap().is_read_only());

        assert!(dao.lock_positions(&["pos0"]));
        assert!(!dao.get_position_store("pos0").unwrap().is_read_only());
        dao.unlock_positions(&["pos0"]);
        assert!(dao.open_positions().is_empty());
    }

    #[test]
    fn test_safe_mode_prompt_may_query_dataset() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig { max_open_positions: 1, safe_mode: true, ..StoreConfig::default() };
        let dao = Arc::new(open(dir.path(), config));
        let asked: Arc<Mutex<Vec<Vec<String>>>> = Arc::default();
        {
            let dataset = Arc::downgrade(&dao);
            let asked = Arc::clone(&asked);
            dao.set_safe_mode_prompt(Arc::new(move |_: &str| {
                let open = dataset.upgrade().map(|d| d.open_positions()).unwrap_or_default();
                asked.lock().push(open);
                Some(true)
            }));
        }

        let store = dao.get_position_store("pos0").unwrap();
        store.store_all(&[SegmentedObject::root(store.generate_id(0).unwrap(), 0)], false);
        dao.get_position_store("pos1").unwrap();

        assert_eq!(*asked.lock(), vec![Vec::<String>::new()]);
        assert_eq!(store.commit_count(), 1);
        assert_eq!(dao.open_positions(), vec!["pos1"]);
    }

    /// Descriptor whose `note` is written but never read back.
    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct LossyExperiment {
        base: Experiment,
        #[serde(skip_deserializing)]
        note: String,
    }

    impl ExperimentDescriptor for LossyExperiment {
        fn name(&self) -> &str {
            self.base.name()
        }

        fn position_names(&self) -> Vec<String> {
            self.base.position_names()
        }

        fn output_directory(&self) -> Option<&Path> {
            self.base.output_directory()
        }

        fn hierarchy(&self) -> crate::experiment::StructureHierarchy {
            self.base.hierarchy()
        }
    }

    #[test]
    fn test_failed_readback_keeps_previous_experiment() {
        let dir = TempDir::new().unwrap();
        let dao: MasterDao<LossyExperiment> = MasterDao::open(dir.path(), "xp", StoreConfig::default()).unwrap();
        let saved = LossyExperiment { base: experiment(), note: String::new() };
        assert!(dao.set_experiment(saved.clone()));

        let lossy = LossyExperiment { base: Experiment::new("other"), note: "dropped on read".into() };
        assert!(!dao.set_experiment(lossy));
        assert_eq!(dao.experiment(), Some(saved));
    }
}
