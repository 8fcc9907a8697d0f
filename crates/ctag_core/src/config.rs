use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const ENV_URL: &str = "ATLASSIAN_URL";
pub const ENV_USERNAME: &str = "ATLASSIAN_USERNAME";
pub const ENV_TOKEN: &str = "ATLASSIAN_TOKEN";
pub const ENV_CONFIG_PATH: &str = "CTAG_CONFIG";
pub const ENV_TIMEOUT_MS: &str = "CTAG_HTTP_TIMEOUT_MS";
pub const ENV_USER_AGENT: &str = "CTAG_USER_AGENT";

pub const DEFAULT_CONFIG_PATH: &str = ".ctag/config.toml";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_USER_AGENT: &str = concat!("ctag/", env!("CARGO_PKG_VERSION"));

/// Required credentials with the hint shown when one is missing.
pub const REQUIRED_ENV_VARS: [(&str, &str); 3] = [
    (ENV_URL, "The base URL of your Confluence instance"),
    (ENV_USERNAME, "Your Confluence username"),
    (ENV_TOKEN, "Your Atlassian API token"),
];

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CtagConfig {
    #[serde(default)]
    pub confluence: ConfluenceSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ConfluenceSection {
    pub url: Option<String>,
    pub username: Option<String>,
    pub token: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Config,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Config => "config",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigLocation {
    pub path: PathBuf,
    pub source: ValueSource,
}

/// Pick the secrets file: `--config` flag > `CTAG_CONFIG` > `./.ctag/config.toml`.
pub fn resolve_config_path(flag: Option<&Path>, cwd: &Path) -> ConfigLocation {
    if let Some(path) = flag {
        return ConfigLocation {
            path: absolutize(path, cwd),
            source: ValueSource::Flag,
        };
    }
    if let Some(value) = non_blank(env::var(ENV_CONFIG_PATH).ok()) {
        return ConfigLocation {
            path: absolutize(Path::new(&value), cwd),
            source: ValueSource::Env,
        };
    }
    ConfigLocation {
        path: cwd.join(DEFAULT_CONFIG_PATH),
        source: ValueSource::Default,
    }
}

/// Load and parse the secrets file. A missing file yields the default config.
pub fn load_config(config_path: &Path) -> Result<CtagConfig> {
    if !config_path.exists() {
        return Ok(CtagConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: CtagConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[derive(Clone)]
pub struct Credentials {
    pub base_url: String,
    pub username: String,
    pub token: String,
    pub url_source: ValueSource,
    pub username_source: ValueSource,
    pub token_source: ValueSource,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("token", &mask_secret(&self.token))
            .finish()
    }
}

impl Credentials {
    pub fn diagnostics(&self) -> String {
        format!(
            "base_url={} ({})\nusername={} ({})\ntoken={} ({})",
            self.base_url,
            self.url_source.as_str(),
            self.username,
            self.username_source.as_str(),
            mask_secret(&self.token),
            self.token_source.as_str(),
        )
    }
}

/// Resolve credentials from the process environment, falling back to the secrets file.
pub fn resolve_credentials(config: &CtagConfig) -> Result<Credentials> {
    resolve_credentials_with(|key| env::var(key).ok(), config)
}

/// Resolve credentials with an explicit variable lookup: lookup > config.
/// Fails listing every missing variable at once.
pub fn resolve_credentials_with<F>(lookup: F, config: &CtagConfig) -> Result<Credentials>
where
    F: Fn(&str) -> Option<String>,
{
    let section = &config.confluence;
    let pick = |key: &str, fallback: Option<&String>| -> Option<(String, ValueSource)> {
        if let Some(value) = non_blank(lookup(key)) {
            return Some((value, ValueSource::Env));
        }
        non_blank(fallback.cloned()).map(|value| (value, ValueSource::Config))
    };

    let url = pick(ENV_URL, section.url.as_ref());
    let username = pick(ENV_USERNAME, section.username.as_ref());
    let token = pick(ENV_TOKEN, section.token.as_ref());

    let mut missing = Vec::new();
    for ((name, description), present) in REQUIRED_ENV_VARS
        .iter()
        .zip([url.is_some(), username.is_some(), token.is_some()])
    {
        if !present {
            missing.push(format!("  {name} - {description}"));
        }
    }

    match (url, username, token) {
        (
            Some((base_url, url_source)),
            Some((username, username_source)),
            Some((token, token_source)),
        ) => Ok(Credentials {
            base_url,
            username,
            token,
            url_source,
            username_source,
            token_source,
        }),
        _ => bail!(
            "Missing required environment variables:\n{}\nCreate a .env file with these variables, set them in your environment, or add them to the [confluence] table of {}.",
            missing.join("\n"),
            DEFAULT_CONFIG_PATH
        ),
    }
}

/// HTTP timeout: env > config > default.
pub fn timeout_ms(config: &CtagConfig) -> u64 {
    non_blank(env::var(ENV_TIMEOUT_MS).ok())
        .and_then(|value| value.parse::<u64>().ok())
        .or(config.confluence.timeout_ms)
        .unwrap_or(DEFAULT_TIMEOUT_MS)
}

/// User agent: env > config > default.
pub fn user_agent(config: &CtagConfig) -> String {
    non_blank(env::var(ENV_USER_AGENT).ok())
        .or_else(|| non_blank(config.confluence.user_agent.clone()))
        .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
}

pub fn mask_secret(secret: &str) -> String {
    let visible = secret.chars().count().min(4);
    if secret.chars().count() <= 8 {
        return "*".repeat(secret.chars().count().max(1));
    }
    let tail = secret
        .chars()
        .skip(secret.chars().count() - visible)
        .collect::<String>();
    format!("****{tail}")
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}
