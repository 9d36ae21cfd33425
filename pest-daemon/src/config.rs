//! Load config from file and environment.

use anyhow::Context;
use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/pestcontrol/config.toml or /etc/pestcontrol/config.toml.
/// Env overrides: PESTCONTROL_LISTEN_PORT, PESTCONTROL_AUTHORITY_HOST, PESTCONTROL_AUTHORITY_PORT,
/// PESTCONTROL_LOG_LEVEL.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Client listen port (default 0, any free port).
    #[serde(default)]
    pub listen_port: u16,
    /// Authority server host.
    #[serde(default = "default_authority_host")]
    pub authority_host: String,
    /// Authority server port (default 20547).
    #[serde(default = "default_authority_port")]
    pub authority_port: u16,
    /// Filter used when RUST_LOG is unset (default "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_authority_host() -> String {
    "pestcontrol.protohackers.com".to_string()
}
fn default_authority_port() -> u16 {
    20547
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 0,
            authority_host: default_authority_host(),
            authority_port: default_authority_port(),
            log_level: default_log_level(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
/// A config file that cannot be used is returned alongside the defaults so the
/// caller can report it once logging is up.
pub fn load() -> (Config, Option<anyhow::Error>) {
    let (mut c, problem) = match load_file(&config_paths()) {
        Ok(c) => (c.unwrap_or_default(), None),
        Err(e) => (Config::default(), Some(e)),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    (c, problem)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("PESTCONTROL_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.listen_port = p;
    }
    if let Some(h) = var("PESTCONTROL_AUTHORITY_HOST").filter(|s| !s.is_empty()) {
        c.authority_host = h;
    }
    if let Some(p) = var("PESTCONTROL_AUTHORITY_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.authority_port = p;
    }
    if let Some(l) = var("PESTCONTROL_LOG_LEVEL").filter(|s| !s.is_empty()) {
        c.log_level = l;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/pestcontrol/config.toml"));
    }
    out.push(PathBuf::from("/etc/pestcontrol/config.toml"));
    out
}

/// First existing file in `paths` wins.
fn load_file(paths: &[PathBuf]) -> anyhow::Result<Option<Config>> {
    let Some(p) = paths.iter().find(|p| p.exists()) else {
        return Ok(None);
    };
    let s = std::fs::read_to_string(p)
        .with_context(|| format!("cannot read config file {}", p.display()))?;
    let c = toml::from_str::<Config>(&s)
        .with_context(|| format!("invalid config file {}", p.display()))?;
    Ok(Some(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str("listen_port = 4000\n").unwrap();
        assert_eq!(c.listen_port, 4000);
        assert_eq!(c.authority_host, "pestcontrol.protohackers.com");
        assert_eq!(c.authority_port, 20547);
        assert_eq!(c.log_level, "info");
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 1\n").is_err());
    }

    #[test]
    fn invalid_file_is_reported() {
        let dir = std::env::temp_dir().join(format!("pestcontrol-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let bad = dir.join("config.toml");
        std::fs::write(&bad, "listen_port = \"nope\"\n").unwrap();
        let missing = dir.join("absent.toml");

        let err = load_file(&[missing.clone(), bad.clone()]).unwrap_err();
        assert!(err.to_string().contains("invalid config file"));
        assert!(load_file(&[missing]).unwrap().is_none());

        std::fs::write(&bad, "authority_port = 9\n").unwrap();
        assert_eq!(load_file(&[bad]).unwrap().unwrap().authority_port, 9);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PESTCONTROL_LISTEN_PORT", "5555"),
            ("PESTCONTROL_AUTHORITY_HOST", "127.0.0.1"),
            ("PESTCONTROL_AUTHORITY_PORT", "not-a-port"),
            ("PESTCONTROL_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.listen_port, 5555);
        assert_eq!(c.authority_host, "127.0.0.1");
        assert_eq!(c.authority_port, 20547);
        assert_eq!(c.log_level, "debug");
    }
}
