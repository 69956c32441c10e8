//! Safetensors checkpoints of the reader's variables.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use candle_nn::VarMap;
use tracing::{debug, warn};
use yomite_core::{CheckpointSink, Result};

/// Checkpoints kept on disk before the oldest is removed.
pub const DEFAULT_MAX_TO_KEEP: usize = 5;

/// Writes `model-<step>.safetensors` into a checkpoint directory, keeping
/// only the newest few files.
pub struct VarMapCheckpointer {
    varmap: VarMap,
    dir: PathBuf,
    max_to_keep: usize,
    written: VecDeque<PathBuf>,
}

impl VarMapCheckpointer {
    pub fn new<P: AsRef<Path>>(varmap: &VarMap, dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            varmap: varmap.clone(),
            dir,
            max_to_keep: DEFAULT_MAX_TO_KEEP,
            written: VecDeque::new(),
        })
    }

    /// Keep at most `max_to_keep` checkpoints; zero keeps all of them.
    pub fn with_max_to_keep(mut self, max_to_keep: usize) -> Self {
        self.max_to_keep = max_to_keep;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, step: u64) -> PathBuf {
        self.dir.join(format!("model-{step}.safetensors"))
    }

    fn prune(&mut self) {
        if self.max_to_keep == 0 {
            return;
        }
        while self.written.len() > self.max_to_keep {
            let Some(oldest) = self.written.pop_front() else {
                break;
            };
            match fs::remove_file(&oldest) {
                Ok(()) => debug!("Removed old checkpoint {}", oldest.display()),
                Err(e) => warn!("Failed to remove old checkpoint {}: {}", oldest.display(), e),
            }
        }
    }
}

impl CheckpointSink for VarMapCheckpointer {
    fn save(&mut self, step: u64) -> Result<PathBuf> {
        let path = self.path_for(step);
        self.varmap.save(&path)?;
        self.written.push_back(path.clone());
        self.prune();
        Ok(path)
    }
}
