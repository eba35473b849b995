//! Naming-convention knowledge: path -> (dataset key, part index).
//!
//! Multi-module Lambda acquisitions are written as one file per detector
//! module, e.g. `sample_003_m1.nxs`, `sample_003_m2.nxs`, `sample_003_m3.nxs`,
//! optionally chunked as `sample_003_m1_part00001.nxs`. Everything that does
//! not fit the convention is noise (temp files, sidecars) and yields `None`.

use std::fmt;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{DatasetKey, PartIndex};
use crate::error::{Result, WatchError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    pub key: DatasetKey,
    pub part: PartIndex,
}

/// Maps a filesystem path onto a dataset part. Implementations must be pure
/// and total: any input yields `Some` or `None`, never a panic.
pub trait PathClassifier: Send + Sync {
    fn classify(&self, path: &Path) -> Option<Classification>;

    /// `K`, the number of parts that make a dataset complete.
    fn required_parts(&self) -> u8;
}

/// Parameters of the `<stem>_<module><N>[_<segment><S>].<ext>` convention.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConvention {
    /// Number of module files per acquisition.
    pub required_parts: u8,
    /// Marker preceding the module number (`m` in `_m2`).
    pub module_marker: String,
    /// Marker preceding the optional chunk number (`part` in `_part00001`).
    pub segment_marker: String,
    /// Accepted extensions, without the leading dot. Matched case-sensitively.
    pub extensions: Vec<String>,
}

impl Default for NamingConvention {
    fn default() -> Self {
        Self {
            required_parts: 3,
            module_marker: "m".to_string(),
            segment_marker: "part".to_string(),
            extensions: vec!["nxs".to_string(), "h5".to_string()],
        }
    }
}

impl NamingConvention {
    pub fn validate(&self) -> Result<()> {
        if self.required_parts == 0 {
            return Err(WatchError::InvalidConfig(
                "naming.required_parts must be at least 1".into(),
            ));
        }
        if self.module_marker.is_empty() {
            return Err(WatchError::InvalidConfig(
                "naming.module_marker must not be empty".into(),
            ));
        }
        if self.segment_marker.is_empty() {
            return Err(WatchError::InvalidConfig(
                "naming.segment_marker must not be empty".into(),
            ));
        }
        if self.extensions.iter().all(|ext| ext.trim().is_empty()) {
            return Err(WatchError::InvalidConfig(
                "naming.extensions must list at least one extension".into(),
            ));
        }
        Ok(())
    }

    fn pattern(&self) -> String {
        let extensions = self
            .extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.'))
            .filter(|ext| !ext.is_empty())
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join("|");
        format!(
            r"^(?P<stem>.+)_{module}(?P<module>\d+)(?:_{segment}(?P<segment>\d+))?\.(?:{extensions})$",
            module = regex::escape(&self.module_marker),
            segment = regex::escape(&self.segment_marker),
        )
    }
}

/// Regex-backed classifier for [`NamingConvention`].
#[derive(Clone)]
pub struct ModuleSuffixClassifier {
    convention: NamingConvention,
    pattern: Regex,
}

impl fmt::Debug for ModuleSuffixClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleSuffixClassifier")
            .field("convention", &self.convention)
            .field("pattern", &self.pattern.as_str())
            .finish()
    }
}

impl ModuleSuffixClassifier {
    pub fn new(convention: NamingConvention) -> Result<Self> {
        convention.validate()?;
        let pattern = Regex::new(&convention.pattern()).map_err(|err| {
            WatchError::InvalidConfig(format!("naming convention does not compile: {err}"))
        })?;
        Ok(Self {
            convention,
            pattern,
        })
    }

    pub fn convention(&self) -> &NamingConvention {
        &self.convention
    }
}

impl PathClassifier for ModuleSuffixClassifier {
    fn classify(&self, path: &Path) -> Option<Classification> {
        let file_name = path.file_name()?.to_str()?;
        let captures = self.pattern.captures(file_name)?;

        let module: u32 = captures.name("module")?.as_str().parse().ok()?;
        let part = PartIndex::new(module, self.convention.required_parts)?;

        let stem = captures.name("stem")?.as_str();
        let segment = captures.name("segment").map(|m| m.as_str().to_string());
        let directory = path.parent().map(Path::to_path_buf).unwrap_or_else(PathBuf::new);

        Some(Classification {
            key: DatasetKey::new(directory, stem, segment),
            part,
        })
    }

    fn required_parts(&self) -> u8 {
        self.convention.required_parts
    }
}
