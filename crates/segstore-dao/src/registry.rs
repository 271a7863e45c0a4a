//! Open datasets of a process, keyed by directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::DaoResult;
use crate::experiment::{Experiment, ExperimentDescriptor};
use crate::master_dao::MasterDao;

/// Hands out one `MasterDao` per dataset directory.
pub struct DatasetRegistry<X: ExperimentDescriptor = Experiment> {
    config: StoreConfig,
    datasets: Mutex<HashMap<PathBuf, Arc<MasterDao<X>>>>,
}

impl<X: ExperimentDescriptor> DatasetRegistry<X> {
    pub fn new(config: StoreConfig) -> Self {
        Self { config, datasets: Mutex::new(HashMap::new()) }
    }

    /// Dataset at `dir`, opened with the registry configuration on first request.
    pub fn get_or_open(&self, dir: &Path, db_name: &str) -> DaoResult<Arc<MasterDao<X>>> {
        let mut datasets = self.datasets.lock();
        if let Some(dao) = datasets.get(dir) {
            return Ok(Arc::clone(dao));
        }
        let dao = Arc::new(MasterDao::open(dir, db_name, self.config.clone())?);
        datasets.insert(dir.to_path_buf(), Arc::clone(&dao));
        debug!(dir = %dir.display(), open = datasets.len(), "dataset registered");
        Ok(dao)
    }

    pub fn get(&self, dir: &Path) -> Option<Arc<MasterDao<X>>> {
        self.datasets.lock().get(dir).cloned()
    }

    /// Close and forget the dataset at `dir`. Returns false if it was not open.
    pub fn close(&self, dir: &Path) -> bool {
        let removed = self.datasets.lock().remove(dir);
        match removed {
            Some(dao) => {
                dao.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let datasets: Vec<_> = self.datasets.lock().drain().collect();
        for (_, dao) in datasets {
            dao.close();
        }
    }

    pub fn len(&self) -> usize {
        self.datasets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_same_directory_same_dataset() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let registry: DatasetRegistry = DatasetRegistry::new(StoreConfig::default());

        let first = registry.get_or_open(a.path(), "a").unwrap();
        let again = registry.get_or_open(a.path(), "a").unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        registry.get_or_open(b.path(), "b").unwrap();
        assert_eq!(registry.len(), 2);

        assert!(registry.close(a.path()));
        assert!(!registry.close(a.path()));
        assert!(first.is_read_only());
        registry.close_all();
        assert!(registry.is_empty());
    }
}
