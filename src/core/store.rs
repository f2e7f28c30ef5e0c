use super::period::{ChainError, PeriodChainManager, TaxPeriod};
use super::registry::SchemaRegistry;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const STORE_VERSION: u32 = 1;

/// On-disk document holding every period of every chain.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StoreDocument {
    pub version: u32,
    #[serde(default)]
    pub periods: Vec<TaxPeriod>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid store file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("store file {path} has version {found}, expected {}", STORE_VERSION)]
    Version { path: PathBuf, found: u32 },
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// JSON file store for period chains.
#[derive(Debug, Clone)]
pub struct PeriodStore {
    path: PathBuf,
}

impl PeriodStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        PeriodStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Read all periods. A missing file is an empty store.
    pub fn load(&self) -> Result<Vec<TaxPeriod>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("no store at {}, starting empty", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(self.io(e)),
        };
        let doc: StoreDocument =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
                path: self.path.clone(),
                source,
            })?;
        if doc.version != STORE_VERSION {
            return Err(StoreError::Version {
                path: self.path.clone(),
                found: doc.version,
            });
        }
        log::debug!(
            "loaded {} periods from {}",
            doc.periods.len(),
            self.path.display()
        );
        Ok(doc.periods)
    }

    /// Write all periods to a sibling temporary file, then rename it over
    /// the store so readers never see a partial document.
    pub fn save(&self, periods: Vec<TaxPeriod>) -> Result<(), StoreError> {
        let doc = StoreDocument {
            version: STORE_VERSION,
            periods,
        };
        let json = serde_json::to_vec_pretty(&doc).map_err(|source| StoreError::Json {
            path: self.path.clone(),
            source,
        })?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| self.io(e))?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = fs::File::create(&tmp).map_err(|e| self.io(e))?;
        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|e| self.io(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io(e))?;
        log::info!(
            "saved {} periods to {}",
            doc.periods.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Load the store into a chain manager.
    pub fn open(&self, registry: Arc<SchemaRegistry>) -> Result<PeriodChainManager, StoreError> {
        let periods = self.load()?;
        Ok(PeriodChainManager::from_periods(registry, periods)?)
    }

    pub fn persist(&self, manager: &PeriodChainManager) -> Result<(), StoreError> {
        self.save(manager.periods())
    }
}
