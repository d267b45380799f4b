//! Persisted user preferences.
//!
//! Settings live in a small versioned TOML file. They are loaded once at
//! startup and written back at shutdown if anything changed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const CONFIG_ENV_VAR: &str = "PARTREE_CONFIG";
const CONFIG_FILENAME: &str = "partree.toml";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(std::io::Error),
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Unsupported settings file version: {0}")]
    UnsupportedVersion(u32),
    #[error("Redundancy must be between {min}% and {max}%, got {0}", min = Redundancy::MIN, max = Redundancy::MAX)]
    InvalidRedundancy(f64),
}

fn io_error(path: &Path, e: std::io::Error) -> SettingsError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        SettingsError::PermissionDenied(path.to_path_buf())
    } else {
        SettingsError::Io(e)
    }
}

/// Share of recovery data relative to the protected data, in percent.
///
/// Values are kept to three significant figures; the engine accepts far
/// finer steps than are useful to pick between.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Redundancy(f64);

impl Redundancy {
    pub const MIN: f64 = 0.01;
    pub const MAX: f64 = 1000.0;
    const DEFAULT: f64 = 10.0;

    pub fn new(percent: f64) -> Result<Self, SettingsError> {
        if !percent.is_finite() || !(Self::MIN..=Self::MAX).contains(&percent) {
            return Err(SettingsError::InvalidRedundancy(percent));
        }
        let rounded = round_to_significant(percent, 3).clamp(Self::MIN, Self::MAX);
        Ok(Redundancy(rounded))
    }

    pub fn percent(self) -> f64 {
        self.0
    }
}

impl Default for Redundancy {
    fn default() -> Self {
        Redundancy(Self::DEFAULT)
    }
}

/// Compact decimal form: at most two fractional digits, no trailing zeros.
impl fmt::Display for Redundancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fixed = format!("{:.2}", self.0);
        let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
        f.write_str(trimmed)
    }
}

impl FromStr for Redundancy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let percent: f64 = s
            .trim()
            .trim_end_matches('%')
            .parse()
            .map_err(|e| format!("invalid percentage '{s}': {e}"))?;
        Redundancy::new(percent).map_err(|e| e.to_string())
    }
}

impl TryFrom<f64> for Redundancy {
    type Error = SettingsError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Redundancy::new(value)
    }
}

impl From<Redundancy> for f64 {
    fn from(value: Redundancy) -> Self {
        value.percent()
    }
}

fn round_to_significant(value: f64, digits: i32) -> f64 {
    if value == 0.0 {
        return 0.0;
    }
    let magnitude = value.abs().log10().floor() as i32;
    let factor = 10f64.powi(digits - 1 - magnitude);
    (value * factor).round() / factor
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Metadata {
    version: u32,
}

/// Only the metadata section, so the version can be checked before the
/// rest of the document is interpreted.
#[derive(Debug, Deserialize)]
struct MetadataOnly {
    metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub redundancy_percent: Redundancy,
    /// Recovery engine executable. Looked up on `PATH` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<PathBuf>,
    metadata: Metadata,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            redundancy_percent: Redundancy::default(),
            engine: None,
            metadata: Metadata {
                version: Self::SUPPORTED_VERSION,
            },
        }
    }
}

impl Settings {
    const SUPPORTED_VERSION: u32 = 1;

    /// Where settings are kept when no explicit path is given.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
            return Some(PathBuf::from(path));
        }
        if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME").filter(|d| !d.is_empty()) {
            return Some(PathBuf::from(dir).join(CONFIG_FILENAME));
        }
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config").join(CONFIG_FILENAME))
    }

    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let metadata_only: MetadataOnly = toml::from_str(content)?;

        if metadata_only.metadata.version != Self::SUPPORTED_VERSION {
            return Err(SettingsError::UnsupportedVersion(
                metadata_only.metadata.version,
            ));
        }

        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> Result<String, SettingsError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Loads settings, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(e) => Err(io_error(path, e)),
        }
    }

    /// Writes settings atomically through a temporary file in the same directory.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        use std::io::Write;

        let content = self.to_toml()?;

        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;

        let mut temp_file =
            tempfile::NamedTempFile::new_in(parent).map_err(|e| io_error(parent, e))?;
        temp_file
            .write_all(content.as_bytes())
            .map_err(|e| io_error(path, e))?;
        temp_file.as_file().sync_all().map_err(SettingsError::Io)?;
        temp_file
            .persist(path)
            .map_err(|e| io_error(path, e.error))?;

        Ok(())
    }
}
