use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use config::{Config, Environment, File};
use serde::Deserialize;
use shared::{domain::MissionStatus, lifecycle::TransitionGraph};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub token_ttl_seconds: i64,
    pub offer_sweep_interval_seconds: u64,
    /// Additional backward transitions as a comma separated `FROM:TO` list.
    #[serde(default)]
    pub extra_transitions: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/fieldops.db".into(),
            jwt_secret: "dev-only-secret".into(),
            token_ttl_seconds: 12 * 3600,
            offer_sweep_interval_seconds: 30,
            extra_transitions: String::new(),
        }
    }
}

impl Settings {
    pub fn transition_graph(&self) -> anyhow::Result<TransitionGraph> {
        parse_extra_transitions(&self.extra_transitions)?
            .into_iter()
            .try_fold(TransitionGraph::standard(), |graph, (from, to)| {
                if from.is_terminal() {
                    bail!("extra transition {from}:{to} leaves a terminal status");
                }
                Ok(graph.with_exception(from, to))
            })
    }
}

/// Defaults, then `server.toml` when present, then `APP__*` environment variables.
pub fn load_settings() -> anyhow::Result<Settings> {
    load_settings_from("server")
}

fn load_settings_from(file_stem: &str) -> anyhow::Result<Settings> {
    let defaults = Settings::default();
    Config::builder()
        .set_default("server_bind", defaults.server_bind)?
        .set_default("database_url", defaults.database_url)?
        .set_default("jwt_secret", defaults.jwt_secret)?
        .set_default("token_ttl_seconds", defaults.token_ttl_seconds)?
        .set_default(
            "offer_sweep_interval_seconds",
            defaults.offer_sweep_interval_seconds,
        )?
        .set_default("extra_transitions", defaults.extra_transitions)?
        .add_source(File::with_name(file_stem).required(false))
        .add_source(
            Environment::with_prefix("APP")
                .prefix_separator("__")
                .separator("__"),
        )
        .build()
        .context("failed to assemble server settings")?
        .try_deserialize()
        .context("invalid server settings")
}

fn parse_extra_transitions(raw: &str) -> anyhow::Result<Vec<(MissionStatus, MissionStatus)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| -> anyhow::Result<(MissionStatus, MissionStatus)> {
            let (from, to) = pair
                .split_once(':')
                .with_context(|| format!("transition '{pair}' is not in FROM:TO form"))?;
            Ok((from.trim().parse()?, to.trim().parse()?))
        })
        .collect()
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };
    let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
