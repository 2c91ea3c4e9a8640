//! Grid generation configuration.
//!
//! The defaults ship embedded in the binary from `config/default.toml`. A
//! `--config` file replaces them wholesale; the `WAZE_AREA_*` environment
//! variables then override individual bounding box edges.

use std::collections::BTreeSet;
use std::path::Path;

use alert_map_grid_models::{GridConfig, LEVEL_LIMIT};

/// Embedded default configuration.
const DEFAULT_CONFIG_TOML: &str = include_str!("../config/default.toml");

/// Environment variables overriding the bounding box, paired with the edge
/// they replace.
const AREA_ENV_VARS: &[(&str, AreaEdge)] = &[
    ("WAZE_AREA_TOP", AreaEdge::Top),
    ("WAZE_AREA_BOTTOM", AreaEdge::Bottom),
    ("WAZE_AREA_LEFT", AreaEdge::Left),
    ("WAZE_AREA_RIGHT", AreaEdge::Right),
];

#[derive(Debug, Clone, Copy)]
enum AreaEdge {
    Top,
    Bottom,
    Left,
    Right,
}

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// Path that was being read.
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The TOML document is malformed or has the wrong shape.
    #[error("Failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    /// An override environment variable is not a finite number.
    #[error("Invalid value for {name}: '{value}'")]
    Env {
        /// Variable name.
        name: String,
        /// Offending value.
        value: String,
    },

    /// The configuration parsed but is unusable.
    #[error("Invalid config: {message}")]
    Invalid {
        /// Description of what is wrong.
        message: String,
    },
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        message: message.into(),
    }
}

/// Parses and validates a TOML configuration document.
///
/// # Errors
///
/// Returns [`ConfigError`] if the document does not parse or fails
/// [`validate`].
pub fn parse(text: &str) -> Result<GridConfig, ConfigError> {
    let config: GridConfig = toml::from_str(text)?;
    validate(&config)?;
    Ok(config)
}

/// The embedded default configuration.
///
/// # Errors
///
/// Returns [`ConfigError`] if the embedded file is invalid.
pub fn default_config() -> Result<GridConfig, ConfigError> {
    parse(DEFAULT_CONFIG_TOML)
}

/// Loads the configuration for a run: `path` if given, the embedded
/// defaults otherwise, with `WAZE_AREA_*` overrides applied from the
/// process environment.
///
/// # Errors
///
/// Returns [`ConfigError`] if the file cannot be read or parsed, an
/// override is malformed, or the result fails validation.
pub fn load(path: Option<&Path>) -> Result<GridConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            log::info!("Loading config from {}", path.display());
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            parse(&text)?
        }
        None => default_config()?,
    };

    apply_area_overrides(&mut config, |name| std::env::var(name).ok())?;
    validate(&config)?;
    Ok(config)
}

/// Replaces bounding box edges with values returned by `lookup` for the
/// `WAZE_AREA_*` variable names.
///
/// # Errors
///
/// Returns [`ConfigError::Env`] if a provided value is not a finite number.
pub fn apply_area_overrides(
    config: &mut GridConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    for (name, edge) in AREA_ENV_VARS {
        let Some(raw) = lookup(name) else {
            continue;
        };
        let value: f64 = raw
            .trim()
            .parse()
            .ok()
            .filter(|v: &f64| v.is_finite())
            .ok_or_else(|| ConfigError::Env {
                name: (*name).to_string(),
                value: raw.clone(),
            })?;

        log::debug!("{name} overrides area {edge:?} with {value}");
        let area = &mut config.area;
        match edge {
            AreaEdge::Top => area.top = value,
            AreaEdge::Bottom => area.bottom = value,
            AreaEdge::Left => area.left = value,
            AreaEdge::Right => area.right = value,
        }
    }
    Ok(())
}

/// Checks a configuration for values the pipelines cannot work with.
///
/// Overlapping or non-contiguous windows are allowed.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] describing the first problem found.
pub fn validate(config: &GridConfig) -> Result<(), ConfigError> {
    if config.time_windows.is_empty() {
        return Err(invalid("at least one time window is required"));
    }

    let mut ids = BTreeSet::new();
    for window in &config.time_windows {
        if window.days_ago_end <= window.days_ago_start {
            return Err(invalid(format!(
                "time window {}: days_ago_end ({}) must be greater than days_ago_start ({})",
                window.id, window.days_ago_end, window.days_ago_start
            )));
        }
        if !ids.insert(window.id) {
            return Err(invalid(format!("duplicate time window id {}", window.id)));
        }
    }

    for (i, radius) in config.radius_groups.iter().enumerate() {
        if !radius.is_finite() || *radius <= 0.0 {
            return Err(invalid(format!(
                "radius group {i}: radius must be a positive number, got {radius}"
            )));
        }
    }

    if config.min_level > config.max_level {
        return Err(invalid(format!(
            "min_level ({}) must not exceed max_level ({})",
            config.min_level, config.max_level
        )));
    }
    if config.max_level > LEVEL_LIMIT {
        return Err(invalid(format!(
            "max_level ({}) must be at most {LEVEL_LIMIT}",
            config.max_level
        )));
    }

    Ok(())
}
