//! Environment variable fallbacks.
//!
//! Env vars are **fallback**, not override: they only fill fields that no
//! config file set.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

/// Mapping from environment variable name to config field path.
struct EnvMapping {
    var_name: &'static str,
    field_path: &'static str,
    kind: FieldKind,
}

#[derive(Clone, Copy)]
enum FieldKind {
    Text,
    Integer,
}

/// All supported `PLINTH_*` env var mappings.
const ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        var_name: "PLINTH_PLUGIN_DIRECTORY",
        field_path: "plugins.directory",
        kind: FieldKind::Text,
    },
    EnvMapping {
        var_name: "PLINTH_CUSTOM_CONFIG",
        field_path: "plugins.custom_config",
        kind: FieldKind::Text,
    },
    EnvMapping {
        var_name: "PLINTH_MAX_BACKGROUND_PLUGINS",
        field_path: "workers.max_background_plugins",
        kind: FieldKind::Integer,
    },
    EnvMapping {
        var_name: "PLINTH_WORKER_PROGRAM",
        field_path: "workers.worker_program",
        kind: FieldKind::Text,
    },
    EnvMapping {
        var_name: "PLINTH_LOG_LEVEL",
        field_path: "logging.level",
        kind: FieldKind::Text,
    },
    EnvMapping {
        var_name: "PLINTH_LOG_FORMAT",
        field_path: "logging.format",
        kind: FieldKind::Text,
    },
];

/// Snapshot the process environment.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars().collect()
}

/// Apply environment variable fallbacks to fields not in `file_fields`.
///
/// Returns the number of env vars applied.
///
/// # Errors
///
/// Returns [`ConfigError::BadEnvVar`] when a numeric field gets a value that
/// does not parse.
pub fn apply_env_fallbacks<S: ::std::hash::BuildHasher>(
    merged: &mut toml::Value,
    file_fields: &BTreeSet<String>,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<usize> {
    let mut count: usize = 0;

    for mapping in ENV_MAPPINGS {
        if file_fields.contains(mapping.field_path) {
            continue;
        }
        let Some(raw) = env_vars.get(mapping.var_name) else {
            continue;
        };

        let value = match mapping.kind {
            FieldKind::Text => toml::Value::String(raw.clone()),
            FieldKind::Integer => {
                let parsed = raw.trim().parse::<i64>().map_err(|e| ConfigError::BadEnvVar {
                    var: mapping.var_name,
                    message: format!("expected an integer: {e}"),
                })?;
                toml::Value::Integer(parsed)
            },
        };

        debug!(
            var = mapping.var_name,
            field = mapping.field_path,
            "applying env var fallback"
        );
        set_field(merged, mapping.field_path, value);
        count = count.saturating_add(1);
    }

    Ok(count)
}

/// Insert `value` at a dotted `path`, creating intermediate tables.
fn set_field(root: &mut toml::Value, path: &str, value: toml::Value) {
    let mut current = root;
    let mut segments = path.split('.').peekable();

    while let Some(segment) = segments.next() {
        let Some(table) = current.as_table_mut() else {
            return;
        };
        if segments.peek().is_none() {
            table.insert(segment.to_owned(), value);
            return;
        }
        current = table
            .entry(segment.to_owned())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
}
