use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use config::{Config, Environment, File, FileFormat};
use realtime::{Limits, MAX_MESSAGE_CHARS};
use serde::Deserialize;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub token_ttl_seconds: i64,
    pub push_gateway_url: Option<String>,
    pub push_server_key: Option<String>,
    pub outbox_capacity: usize,
    /// 0 lets call rooms grow without bound.
    pub max_call_participants: usize,
    pub max_request_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/server.db".into(),
            jwt_secret: "devsecret".into(),
            token_ttl_seconds: 7 * 24 * 3600,
            push_gateway_url: None,
            push_server_key: None,
            outbox_capacity: 256,
            max_call_participants: realtime::DEFAULT_MAX_CALL_PARTICIPANTS,
            max_request_bytes: 64 * 1024,
        }
    }
}

impl Settings {
    pub fn limits(&self) -> Limits {
        Limits {
            max_message_chars: MAX_MESSAGE_CHARS,
            max_call_participants: (self.max_call_participants > 0)
                .then_some(self.max_call_participants),
        }
    }

    pub fn push_gateway(&self) -> anyhow::Result<Option<Url>> {
        let Some(raw) = self
            .push_gateway_url
            .as_deref()
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
        else {
            return Ok(None);
        };
        let url = Url::parse(raw).with_context(|| format!("invalid push gateway url '{raw}'"))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("push gateway url must be http or https, got '{}'", url.scheme());
        }
        Ok(Some(url))
    }
}

/// `server.toml` in the working directory, then `APP__*` variables.
pub fn load_settings() -> anyhow::Result<Settings> {
    settings_from(Path::new("server.toml"), std::env::vars().collect())
}

fn settings_from(file: &Path, vars: HashMap<String, String>) -> anyhow::Result<Settings> {
    let mut settings: Settings = Config::builder()
        .add_source(File::from(file).format(FileFormat::Toml).required(false))
        .add_source(
            Environment::with_prefix("APP")
                .separator("__")
                .try_parsing(true)
                .source(Some(vars.clone())),
        )
        .build()
        .context("failed to read server settings")?
        .try_deserialize()
        .context("invalid server settings")?;

    if !vars.contains_key("APP__DATABASE_URL") {
        if let Some(v) = vars.get("DATABASE_URL") {
            settings.database_url = v.clone();
        }
    }
    if !vars.contains_key("APP__JWT_SECRET") {
        if let Some(v) = vars.get("ACCESS_TOKEN_SECRET") {
            settings.jwt_secret = v.clone();
        }
    }
    if settings.outbox_capacity == 0 {
        bail!("outbox_capacity must be at least 1");
    }
    Ok(settings)
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

    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        if has_drive_prefix(path) {
            return format!("sqlite:{}", path.replace('\\', "/"));
        }
        return raw_database_url.to_string();
    }

    if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        if has_drive_prefix(&path) {
            return format!("sqlite:{path}");
        }
        return format!("sqlite://{path}");
    }

    let path = raw_database_url.replace('\\', "/");
    if has_drive_prefix(&path) {
        return format!("sqlite:{path}");
    }
    format!("sqlite://{path}")
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
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
