use super::XmConfig;
use cxm_core::error::{CxmError, CxmResult};
use std::path::{Path, PathBuf};
use tracing::debug;

/// VM configuration files of the cluster, read from the directory shared by
/// every node
#[derive(Debug, Clone)]
pub struct VmCatalog {
    dir: PathBuf,
}

impl VmCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, vm: &str) -> PathBuf {
        self.dir.join(vm)
    }

    /// Load and parse the configuration file of `vm`
    pub async fn load(&self, vm: &str) -> CxmResult<XmConfig> {
        let path = self.path_of(vm);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            CxmError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        XmConfig::parse(&content)
    }

    /// Logical volumes used by `vm`
    pub async fn lvs(&self, vm: &str) -> CxmResult<Vec<String>> {
        let lvs = self.load(vm).await?.lvs();
        debug!("[VM] {} lvs={:?}", vm, lvs);
        Ok(lvs)
    }
}
