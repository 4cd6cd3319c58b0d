// (c) Roel Kluin, 2023, GPL v3

use crate::error::{Error, Result};
use crate::executor::{CpuLimit, Local};
use derive_more::Display;
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Display, Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum Grid {
    #[default]
    Local,
}

/// Process-wide settings, read once at start and passed around.
///
/// ```json
/// {"mr_dir": "/scratch/mr", "grid": "Local", "limit": -8}
/// ```
/// `mr_dir` holds task files. `limit` is a [`CpuLimit`]: a positive integer
/// reserves CPUs, a fraction uses that share, a negative integer caps processes.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub mr_dir: PathBuf,
    pub grid: Grid,
    pub limit: CpuLimit,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mr_dir: PathBuf::from("/tmp"),
            grid: Grid::Local,
            limit: CpuLimit::default(),
        }
    }
}

impl Config {
    /// `$HOME/.config/genomedb/main.json`
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config/genomedb/main.json"))
    }

    /// Reads `path`, or the default location when `None`. Only a missing
    /// default file falls back to the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Config::default_path() {
                Some(p) => (p, false),
                None => return Ok(Config::default()),
            },
        };
        match fs::read_to_string(&path) {
            Ok(text) => Config::from_json(&text)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == ErrorKind::NotFound && !explicit => Ok(Config::default()),
            Err(e) => Err(Error::Config(format!("{}: {}", path.display(), e))),
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn executor(&self) -> Local {
        match self.grid {
            Grid::Local => Local::new(self.limit),
        }
    }
}
