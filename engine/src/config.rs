//! Configuration resolution.
//!
//! Precedence, lowest to highest: built-in defaults, `<data_dir>/config.json`,
//! environment (`CONTEXT_VAULT_*`, with `CONTEXT_MCP_*` as a legacy alias),
//! explicit overrides (CLI-style). All paths are absolute after resolution.
//! `data_dir` itself resolves from defaults/env/overrides only — the config
//! file cannot relocate the directory it is read from.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use context_vault_core::VaultResult;

use crate::retrieve::DEFAULT_EVENT_DECAY_DAYS;

pub const CONFIG_FILE: &str = "config.json";
const ENV_PREFIX: &str = "CONTEXT_VAULT_";
const ENV_ALIAS_PREFIX: &str = "CONTEXT_MCP_";

/// Highest-precedence layer, typically mapped from command-line arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverrides {
    pub vault_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub event_decay_days: Option<i64>,
    pub hosted_url: Option<String>,
    pub api_key: Option<String>,
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub linked_at: Option<String>,
}

/// `<data_dir>/config.json` — every key optional.
#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
    vault_dir: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    event_decay_days: Option<i64>,
    hosted_url: Option<String>,
    api_key: Option<String>,
    user_id: Option<String>,
    email: Option<String>,
    linked_at: Option<String>,
}

/// Fully-resolved engine configuration.
#[derive(Debug, Clone, Serialize)]
pub struct VaultConfig {
    pub vault_dir: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub event_decay_days: i64,
    pub hosted_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub linked_at: Option<String>,
    /// Which layers contributed, for the status snapshot.
    pub resolved_from: Vec<String>,
}

/// Environment access is injected so precedence is testable without
/// process-global state.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn env_get(env: EnvLookup<'_>, key: &str) -> Option<String> {
    env(&format!("{ENV_PREFIX}{key}"))
        .or_else(|| env(&format!("{ENV_ALIAS_PREFIX}{key}")))
        .filter(|v| !v.is_empty())
}

fn absolutize(path: PathBuf, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        cwd.join(path)
    }
}

impl VaultConfig {
    /// Resolve from the real process environment.
    pub fn resolve(overrides: ConfigOverrides) -> VaultResult<Self> {
        let env = |key: &str| std::env::var(key).ok();
        let home = std::env::var("HOME").map(PathBuf::from).ok();
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        Self::resolve_with(overrides, &env, home, &cwd)
    }

    /// Layered resolution with injected environment, home, and cwd.
    pub fn resolve_with(
        overrides: ConfigOverrides,
        env: EnvLookup<'_>,
        home: Option<PathBuf>,
        cwd: &Path,
    ) -> VaultResult<Self> {
        let mut resolved_from = vec!["defaults".to_string()];

        // data_dir first: it locates the config file.
        let default_data_dir =
            home.map(|h| h.join(".context-vault")).unwrap_or_else(|| cwd.join(".context-vault"));
        let data_dir = overrides
            .data_dir
            .clone()
            .or_else(|| env_get(env, "DATA_DIR").map(PathBuf::from))
            .unwrap_or(default_data_dir);
        let data_dir = absolutize(data_dir, cwd);

        let file: FileConfig = match std::fs::read_to_string(data_dir.join(CONFIG_FILE)) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(parsed) => {
                    resolved_from.push(CONFIG_FILE.to_string());
                    parsed
                }
                Err(e) => {
                    warn!(error = %e, "unparseable config.json, ignoring");
                    FileConfig::default()
                }
            },
            Err(_) => FileConfig::default(),
        };
        if file.data_dir.is_some() {
            warn!("config.json cannot relocate data_dir, ignoring its data_dir key");
        }

        let mut env_used = false;
        let mut from_env = |key: &str| {
            let v = env_get(env, key);
            if v.is_some() {
                env_used = true;
            }
            v
        };

        let vault_dir = overrides
            .vault_dir
            .clone()
            .or_else(|| from_env("VAULT_DIR").map(PathBuf::from))
            .or(file.vault_dir)
            .unwrap_or_else(|| data_dir.join("vault"));
        let db_path = overrides
            .db_path
            .clone()
            .or_else(|| from_env("DB_PATH").map(PathBuf::from))
            .or(file.db_path)
            .unwrap_or_else(|| data_dir.join("vault.db"));
        let event_decay_days = overrides
            .event_decay_days
            .or_else(|| {
                from_env("EVENT_DECAY_DAYS").and_then(|raw| match raw.parse::<i64>() {
                    Ok(n) if n > 0 => Some(n),
                    _ => {
                        warn!(raw = raw.as_str(), "bad EVENT_DECAY_DAYS, using default");
                        None
                    }
                })
            })
            .or(file.event_decay_days)
            .unwrap_or(DEFAULT_EVENT_DECAY_DAYS);

        let hosted_url =
            overrides.hosted_url.clone().or_else(|| from_env("HOSTED_URL")).or(file.hosted_url);
        let api_key = overrides.api_key.clone().or_else(|| from_env("API_KEY")).or(file.api_key);
        let user_id = overrides.user_id.clone().or_else(|| from_env("USER_ID")).or(file.user_id);
        let email = overrides.email.clone().or_else(|| from_env("EMAIL")).or(file.email);
        let linked_at =
            overrides.linked_at.clone().or_else(|| from_env("LINKED_AT")).or(file.linked_at);

        if env_used
            || env_get(env, "DATA_DIR").is_some()
        {
            resolved_from.push("env".to_string());
        }
        let has_overrides = serde_json::to_value(&overrides)
            .map(|v| v.as_object().is_some_and(|o| o.values().any(|v| !v.is_null())))
            .unwrap_or(false);
        if has_overrides {
            resolved_from.push("overrides".to_string());
        }

        Ok(Self {
            vault_dir: absolutize(vault_dir, cwd),
            data_dir,
            db_path: absolutize(db_path, cwd),
            event_decay_days,
            hosted_url,
            api_key,
            user_id,
            email,
            linked_at,
            resolved_from,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn resolve(
        overrides: ConfigOverrides,
        env: &HashMap<String, String>,
        home: &Path,
    ) -> VaultConfig {
        let lookup = |key: &str| env.get(key).cloned();
        VaultConfig::resolve_with(overrides, &lookup, Some(home.to_path_buf()), Path::new("/cwd"))
            .unwrap()
    }

    #[test]
    fn defaults_land_under_home() {
        let cfg = resolve(ConfigOverrides::default(), &HashMap::new(), Path::new("/home/u"));
        assert_eq!(cfg.data_dir, PathBuf::from("/home/u/.context-vault"));
        assert_eq!(cfg.vault_dir, PathBuf::from("/home/u/.context-vault/vault"));
        assert_eq!(cfg.db_path, PathBuf::from("/home/u/.context-vault/vault.db"));
        assert_eq!(cfg.event_decay_days, DEFAULT_EVENT_DECAY_DAYS);
        assert_eq!(cfg.resolved_from, vec!["defaults"]);
    }

    #[test]
    fn env_beats_file_defaults_and_alias_works() {
        let env = env_of(&[("CONTEXT_VAULT_VAULT_DIR", "/custom/vault")]);
        let cfg = resolve(ConfigOverrides::default(), &env, Path::new("/home/u"));
        assert_eq!(cfg.vault_dir, PathBuf::from("/custom/vault"));
        assert!(cfg.resolved_from.contains(&"env".to_string()));

        let env = env_of(&[("CONTEXT_MCP_VAULT_DIR", "/legacy/vault")]);
        let cfg = resolve(ConfigOverrides::default(), &env, Path::new("/home/u"));
        assert_eq!(cfg.vault_dir, PathBuf::from("/legacy/vault"));
    }

    #[test]
    fn canonical_env_beats_alias() {
        let env = env_of(&[
            ("CONTEXT_VAULT_USER_ID", "canonical"),
            ("CONTEXT_MCP_USER_ID", "legacy"),
        ]);
        let cfg = resolve(ConfigOverrides::default(), &env, Path::new("/home/u"));
        assert_eq!(cfg.user_id.as_deref(), Some("canonical"));
    }

    #[test]
    fn overrides_beat_env() {
        let env = env_of(&[("CONTEXT_VAULT_EVENT_DECAY_DAYS", "7")]);
        let overrides = ConfigOverrides { event_decay_days: Some(90), ..Default::default() };
        let cfg = resolve(overrides, &env, Path::new("/home/u"));
        assert_eq!(cfg.event_decay_days, 90);
        assert!(cfg.resolved_from.contains(&"overrides".to_string()));
    }

    #[test]
    fn config_file_layer_applies() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"{"event_decay_days": 14, "email": "me@example.com"}"#,
        )
        .unwrap();
        let overrides =
            ConfigOverrides { data_dir: Some(tmp.path().to_path_buf()), ..Default::default() };
        let cfg = resolve(overrides, &HashMap::new(), Path::new("/home/u"));
        assert_eq!(cfg.event_decay_days, 14);
        assert_eq!(cfg.email.as_deref(), Some("me@example.com"));
        assert!(cfg.resolved_from.contains(&"config.json".to_string()));
    }

    #[test]
    fn bad_decay_env_falls_back() {
        let env = env_of(&[("CONTEXT_VAULT_EVENT_DECAY_DAYS", "not-a-number")]);
        let cfg = resolve(ConfigOverrides::default(), &env, Path::new("/home/u"));
        assert_eq!(cfg.event_decay_days, DEFAULT_EVENT_DECAY_DAYS);
    }

    #[test]
    fn relative_paths_become_absolute() {
        let overrides = ConfigOverrides {
            vault_dir: Some(PathBuf::from("rel/vault")),
            ..Default::default()
        };
        let cfg = resolve(overrides, &HashMap::new(), Path::new("/home/u"));
        assert!(cfg.vault_dir.is_absolute());
        assert_eq!(cfg.vault_dir, PathBuf::from("/cwd/rel/vault"));
    }
}
