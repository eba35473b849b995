use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::models::AppConfig;

const DEFAULT_CONFIG_LOCATIONS: &[&str] = &[
    "lambdawatch.toml",
    "lambdawatch.json",
    "config/lambdawatch.toml",
    "config/lambdawatch.json",
];

pub const CONFIG_PATH_ENV: &str = "LAMBDAWATCH_CONFIG_PATH";
pub const CONFIG_JSON_ENV: &str = "LAMBDAWATCH_CONFIG_JSON";
pub const WATCH_DIR_ENV: &str = "LAMBDAWATCH_WATCH_DIR";

/// Where the loaded configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    Explicit(PathBuf),
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {}", .path.display())]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {}", .path.display())]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse configuration {origin}")]
    Json {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to parse configuration {origin}: toml error: {toml}; json error: {json}")]
    Unparseable {
        origin: String,
        toml: String,
        json: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(#[from] lambdawatch_core::WatchError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

/// Environment values that influence loading. Split out so tests do not have
/// to mutate the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub config_path: Option<PathBuf>,
    pub config_json: Option<String>,
    pub watch_dir: Option<PathBuf>,
}

impl EnvOverrides {
    pub fn gather() -> Self {
        Self {
            config_path: non_empty_var(CONFIG_PATH_ENV).map(PathBuf::from),
            config_json: non_empty_var(CONFIG_JSON_ENV),
            watch_dir: non_empty_var(WATCH_DIR_ENV).map(PathBuf::from),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Directory the default file locations are resolved against; the
    /// current directory when unset.
    pub search_root: Option<PathBuf>,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: AppConfig,
    pub source: ConfigSource,
    pub env_file_loaded: bool,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn with_search_root<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.search_root = Some(path.into());
        self
    }

    /// Load `.env` (if present), then resolve the configuration.
    ///
    /// Evaluation order:
    /// 1) the explicit path,
    /// 2) `$LAMBDAWATCH_CONFIG_PATH` (TOML or JSON file),
    /// 3) `$LAMBDAWATCH_CONFIG_JSON` (inline JSON),
    /// 4) `lambdawatch.toml` / `config/lambdawatch.toml`,
    /// 5) defaults.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };

        let mut load = self.load_with(EnvOverrides::gather())?;
        load.env_file_loaded = env_file_loaded;
        Ok(load)
    }

    /// Resolve the configuration against `env` without touching `.env`.
    pub fn load_with(&self, env: EnvOverrides) -> Result<ConfigLoad, ConfigLoadError> {
        let (mut config, source) = self.resolve(&env)?;

        if let Some(dir) = env.watch_dir {
            config.watch_dir = Some(dir);
        }
        config.session.validate()?;

        debug!(?source, "configuration loaded");
        Ok(ConfigLoad {
            config,
            source,
            env_file_loaded: false,
        })
    }

    fn resolve(&self, env: &EnvOverrides) -> Result<(AppConfig, ConfigSource), ConfigLoadError> {
        if let Some(path) = &self.options.config_path {
            if !path.exists() {
                return Err(ConfigLoadError::MissingConfig { path: path.clone() });
            }
            let config = load_from_file(path)?;
            return Ok((config, ConfigSource::Explicit(path.clone())));
        }

        if let Some(path) = &env.config_path {
            if !path.exists() {
                return Err(ConfigLoadError::MissingConfig { path: path.clone() });
            }
            let config = load_from_file(path)?;
            return Ok((config, ConfigSource::EnvPath(path.clone())));
        }

        if let Some(raw) = &env.config_json {
            let config = parse_json(raw, CONFIG_JSON_ENV)?;
            return Ok((config, ConfigSource::EnvInline));
        }

        if let Some(path) = self.find_default_file() {
            let config = load_from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        Ok((AppConfig::default(), ConfigSource::Default))
    }

    fn find_default_file(&self) -> Option<PathBuf> {
        let root = self
            .options
            .search_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        DEFAULT_CONFIG_LOCATIONS
            .iter()
            .map(|candidate| root.join(candidate))
            .find(|path| path.exists())
    }
}

pub fn load_from_file(path: &Path) -> Result<AppConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => parse_json(&contents, &path.display().to_string()),
        Some("toml") | Some("tml") => {
            toml::from_str(&contents).map_err(|source| ConfigLoadError::Toml {
                path: path.to_path_buf(),
                source,
            })
        }
        _ => parse_from_str(&contents, &path.display().to_string()),
    }
}

/// Try TOML first, then JSON.
pub fn parse_from_str(contents: &str, origin: &str) -> Result<AppConfig, ConfigLoadError> {
    toml::from_str(contents).or_else(|toml_err| {
        serde_json::from_str(contents).map_err(|json_err| ConfigLoadError::Unparseable {
            origin: origin.to_string(),
            toml: toml_err.to_string(),
            json: json_err.to_string(),
        })
    })
}

fn parse_json(raw: &str, origin: &str) -> Result<AppConfig, ConfigLoadError> {
    serde_json::from_str(raw).map_err(|source| ConfigLoadError::Json {
        origin: origin.to_string(),
        source,
    })
}
