//! Experiment descriptors: the dataset configuration persisted by `MasterDao`.
//!
//! The DAO layer only needs three things from an experiment: its positions,
//! where outputs go, and the parent class of each structure class.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Level in the object hierarchy. `ROOT_CLASS` is the per-frame root.
pub type StructureClass = i32;

pub const ROOT_CLASS: StructureClass = -1;

/// Parent class of every structure class.
///
/// `parents[c]` is the parent of class `c`; classes are numbered from 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureHierarchy {
    parents: Vec<StructureClass>,
}

impl StructureHierarchy {
    pub fn new(parents: Vec<StructureClass>) -> Self {
        Self { parents }
    }

    /// `None` for the root class and for classes the hierarchy does not declare.
    pub fn parent_of(&self, class: StructureClass) -> Option<StructureClass> {
        if class < 0 {
            return None;
        }
        self.parents.get(class as usize).copied()
    }

    /// Classes whose parent is `class`, ascending.
    pub fn direct_children(&self, class: StructureClass) -> Vec<StructureClass> {
        self.classes().filter(|&c| self.parents[c as usize] == class).collect()
    }

    /// `class` and every class below it, parents before children.
    pub fn with_descendants(&self, class: StructureClass) -> Vec<StructureClass> {
        let mut out = vec![class];
        let mut i = 0;
        while i < out.len() {
            let current = out[i];
            out.extend(self.direct_children(current));
            i += 1;
        }
        out
    }

    pub fn classes(&self) -> impl Iterator<Item = StructureClass> + '_ {
        0..self.parents.len() as StructureClass
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }
}

/// What `MasterDao` needs to know about a dataset's experiment.
pub trait ExperimentDescriptor: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn name(&self) -> &str;

    fn position_names(&self) -> Vec<String>;

    /// Root of position directories and selections. Relative paths resolve against the dataset directory.
    fn output_directory(&self) -> Option<&Path>;

    fn hierarchy(&self) -> StructureHierarchy;
}

/// One structure class of an [`Experiment`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureDef {
    pub name: String,
    pub parent: StructureClass,
}

/// Minimal JSON experiment: positions, output directory and structures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_directory: Option<PathBuf>,
    #[serde(default)]
    pub positions: Vec<String>,
    #[serde(default)]
    pub structures: Vec<StructureDef>,
}

impl Experiment {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), output_directory: None, positions: Vec::new(), structures: Vec::new() }
    }

    pub fn with_output_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_directory = Some(dir.into());
        self
    }

    pub fn with_positions<I, S>(mut self, positions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.positions = positions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_structure(mut self, name: impl Into<String>, parent: StructureClass) -> Self {
        self.structures.push(StructureDef { name: name.into(), parent });
        self
    }
}

impl ExperimentDescriptor for Experiment {
    fn name(&self) -> &str {
        &self.name
    }

    fn position_names(&self) -> Vec<String> {
        self.positions.clone()
    }

    fn output_directory(&self) -> Option<&Path> {
        self.output_directory.as_deref()
    }

    fn hierarchy(&self) -> StructureHierarchy {
        StructureHierarchy::new(self.structures.iter().map(|s| s.parent).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hierarchy() -> StructureHierarchy {
        // 0: microchannel, 1: bacteria in 0, 2: spots in 1, 3: other spots in 0
        StructureHierarchy::new(vec![ROOT_CLASS, 0, 1, 0])
    }

    #[test]
    fn test_parent_and_children() {
        let h = hierarchy();
        assert_eq!(h.parent_of(ROOT_CLASS), None);
        assert_eq!(h.parent_of(0), Some(ROOT_CLASS));
        assert_eq!(h.parent_of(2), Some(1));
        assert_eq!(h.parent_of(9), None);
        assert_eq!(h.direct_children(ROOT_CLASS), vec![0]);
        assert_eq!(h.direct_children(0), vec![1, 3]);
        assert!(h.direct_children(2).is_empty());
    }

    #[test]
    fn test_with_descendants() {
        let h = hierarchy();
        assert_eq!(h.with_descendants(0), vec![0, 1, 3, 2]);
        assert_eq!(h.with_descendants(ROOT_CLASS), vec![ROOT_CLASS, 0, 1, 3, 2]);
        assert_eq!(h.with_descendants(2), vec![2]);
    }

    #[test]
    fn test_experiment_json_single_line() {
        let xp = Experiment::new("xp")
            .with_output_directory("out")
            .with_positions(["pos0", "pos1"])
            .with_structure("channel", ROOT_CLASS)
            .with_structure("cell", 0);
        let json = serde_json::to_string(&xp).unwrap();
        assert!(!json.contains('\n'));
        let back: Experiment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, xp);
        assert_eq!(back.hierarchy(), StructureHierarchy::new(vec![-1, 0]));
        assert_eq!(back.output_directory(), Some(Path::new("out")));
    }
}
