#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs, io,
    net::IpAddr,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_WWW_ROOT: &str = "public";

const CONFIG_KEYS: [&str; 4] = ["PORT", "HOST", "YTDLP_PATH", "WWW_ROOT"];

#[cfg(windows)]
pub const DEFAULT_YTDLP: &str = "yt-dlp.exe";
#[cfg(not(windows))]
pub const DEFAULT_YTDLP: &str = "yt-dlp";

/// Everything the gateway needs to know before binding its listener.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub host: IpAddr,
    pub ytdlp_path: PathBuf,
    pub www_root: PathBuf,
}

/// Values supplied on the command line. They win over the environment and
/// the `.env` file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub host: Option<String>,
    pub ytdlp_path: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_config(overrides: ConfigOverrides) -> Result<GatewayConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_config_with_overrides(&file_vars, |key| env::var(key).ok(), overrides)
}

#[cfg(test)]
fn build_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<GatewayConfig> {
    build_config_with_overrides(file_vars, env_lookup, ConfigOverrides::default())
}

fn build_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> Result<GatewayConfig> {
    // Process environment first, then the file. Blank values count as unset.
    let setting = |key: &str| {
        non_blank(env_lookup(key)).or_else(|| non_blank(file_vars.get(key).cloned()))
    };

    // An unparseable PORT falls back to the default.
    let port = overrides
        .port
        .or_else(|| setting("PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let host = non_blank(overrides.host)
        .or_else(|| setting("HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let host = parse_host(&host)?;
    let ytdlp_path = overrides
        .ytdlp_path
        .or_else(|| setting("YTDLP_PATH").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP));
    let www_root = overrides
        .www_root
        .or_else(|| setting("WWW_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WWW_ROOT));

    Ok(GatewayConfig {
        port,
        host,
        ytdlp_path,
        www_root,
    })
}

pub fn parse_port(value: &str) -> Result<u16> {
    value
        .trim()
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

pub fn parse_host(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .with_context(|| format!("expected a valid IPv4 or IPv6 address for HOST, got {value:?}"))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Reads the gateway's keys from a dotenv-style file. A missing file is an
/// empty one; keys the gateway does not use are dropped.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(err) => return Err(err).with_context(|| format!("Reading {}", path.display())),
    };
    Ok(content
        .lines()
        .filter_map(parse_env_line)
        .filter(|(key, _)| CONFIG_KEYS.contains(key))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect())
}

/// `KEY=value`, optionally prefixed with `export` and with the value quoted.
fn parse_env_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    (!key.is_empty()).then(|| (key, unquote(value.trim())))
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .into_iter()
        .find_map(|quote| value.strip_prefix(quote)?.strip_suffix(quote))
        .unwrap_or(value)
}
