// src/config.rs
use crate::command::validate_command;
use crate::error::{GatewayError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A profile: the set of providers this gateway aggregates, plus log
/// settings. Profiles are read-only from the core's perspective; edits are
/// made externally and take effect on restart or explicit reload.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(rename = "mcpServers", default)]
    pub servers: HashMap<String, ServerConfig>,
    #[serde(rename = "logLevel", default = "default_log_level")]
    pub log_level: String,
    #[serde(rename = "logFile")]
    pub log_file: Option<String>,
}

/// One provider entry. Stdio spawns a child process; Http speaks POST+SSE.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum ServerConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default)]
        auth: Option<AuthConfig>,
    },
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AuthConfig {
    None,
    Bearer {
        token: String,
    },
    Oauth {
        #[serde(default)]
        token: Option<String>,
        #[serde(rename = "oauthParams", default)]
        oauth_params: Option<serde_json::Value>,
    },
}

impl ServerConfig {
    /// The stable identity of a provider's source, folded into the catalog
    /// fingerprint: the command line for stdio, the URL for http.
    pub fn source_identity(&self) -> String {
        match self {
            ServerConfig::Stdio { command, args, .. } => {
                let mut parts = vec![command.clone()];
                parts.extend(args.iter().cloned());
                parts.join(" ")
            }
            ServerConfig::Http { url, .. } => url.clone(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load a profile file: `<base>/profiles/<name>.json`.
    pub fn load_profile(base: &Path, name: &str) -> Result<Config> {
        let path = base.join("profiles").join(format!("{name}.json"));
        let text = std::fs::read_to_string(&path).map_err(|e| {
            GatewayError::InvalidRequest(format!("cannot read profile {}: {e}", path.display()))
        })?;
        let config: Config = serde_json::from_str(&text).map_err(|e| {
            GatewayError::InvalidRequest(format!("profile {} is malformed: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject provider entries that could not possibly work before any
    /// process is spawned or socket opened.
    pub fn validate(&self) -> Result<()> {
        for (name, server) in &self.servers {
            if name.is_empty()
                || !name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(GatewayError::InvalidRequest(format!(
                    "provider name '{name}' must match [a-zA-Z0-9_-]+"
                )));
            }
            match server {
                ServerConfig::Stdio { command, args, .. } => {
                    validate_command(command, args)?;
                }
                ServerConfig::Http { url, .. } => {
                    url::Url::parse(url).map_err(|e| {
                        GatewayError::InvalidRequest(format!(
                            "provider '{name}' has invalid url: {e}"
                        ))
                    })?;
                }
            }
        }
        Ok(())
    }
}

/// Which synthesized tool surface the gateway exposes. Single-valued: the
/// gateway never offers `run` and `code` at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceMode {
    FindRun,
    FindCode,
    CodeOnly,
}

impl SurfaceMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "find+run" => Ok(SurfaceMode::FindRun),
            "find+code" => Ok(SurfaceMode::FindCode),
            "code-only" => Ok(SurfaceMode::CodeOnly),
            other => Err(GatewayError::InvalidRequest(format!(
                "unknown mode '{other}' (expected find+run, find+code or code-only)"
            ))),
        }
    }

    pub fn has_find(self) -> bool {
        !matches!(self, SurfaceMode::CodeOnly)
    }

    pub fn has_run(self) -> bool {
        matches!(self, SurfaceMode::FindRun)
    }

    pub fn has_code(self) -> bool {
        !matches!(self, SurfaceMode::FindRun)
    }
}

/// Process-level knobs, layered defaults-then-environment via the config
/// crate (prefix `FUNNEL_`).
#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: SurfaceMode,
    pub profile: String,
    pub debug: bool,
    /// Gates mutating management tools when running as a packaged extension.
    pub extension_mode: bool,
    pub protocol_version: String,
    pub quiet: bool,
    pub color: bool,
    pub base_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    mode: String,
    profile: String,
    debug: bool,
    extension_mode: bool,
    protocol_version: String,
    quiet: bool,
    color: bool,
    home: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Settings> {
        let raw: RawSettings = config::Config::builder()
            .set_default("mode", "find+run")
            .and_then(|b| b.set_default("profile", "default"))
            .and_then(|b| b.set_default("debug", false))
            .and_then(|b| b.set_default("extension_mode", false))
            .and_then(|b| b.set_default("protocol_version", "2024-11-05"))
            .and_then(|b| b.set_default("quiet", false))
            .and_then(|b| b.set_default("color", true))
            .map_err(|e| GatewayError::Internal(format!("settings defaults: {e}")))?
            .add_source(config::Environment::with_prefix("FUNNEL").try_parsing(true))
            .build()
            .map_err(|e| GatewayError::InvalidRequest(format!("environment settings: {e}")))?
            .try_deserialize()
            .map_err(|e| GatewayError::InvalidRequest(format!("environment settings: {e}")))?;

        let base_dir = match raw.home {
            Some(home) => PathBuf::from(home),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("funnel-mcp"),
        };

        Ok(Settings {
            mode: SurfaceMode::parse(&raw.mode)?,
            profile: raw.profile,
            debug: raw.debug,
            extension_mode: raw.extension_mode,
            protocol_version: raw.protocol_version,
            quiet: raw.quiet,
            color: raw.color,
            base_dir,
        })
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.base_dir.join("cache")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_deserialization() {
        let json_str = r#"
        {
            "mcpServers": {
                "github": {
                    "command": "npx",
                    "args": ["-y", "@modelcontextprotocol/server-github"],
                    "env": {
                        "GITHUB_TOKEN": "test-token"
                    }
                },
                "remote": {
                    "url": "https://mcp.example.com/sse",
                    "auth": { "kind": "bearer", "token": "abc" }
                }
            },
            "logLevel": "debug",
            "logFile": "/tmp/mcp.log"
        }
        "#;

        let config: Config = serde_json::from_str(json_str).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_file, Some("/tmp/mcp.log".to_string()));

        match &config.servers["github"] {
            ServerConfig::Stdio { command, args, env } => {
                assert_eq!(command, "npx");
                assert_eq!(args, &vec!["-y", "@modelcontextprotocol/server-github"]);
                assert_eq!(env.get("GITHUB_TOKEN"), Some(&"test-token".to_string()));
            }
            other => panic!("expected stdio variant, got {other:?}"),
        }

        match &config.servers["remote"] {
            ServerConfig::Http { url, auth } => {
                assert_eq!(url, "https://mcp.example.com/sse");
                assert_eq!(
                    auth,
                    &Some(AuthConfig::Bearer {
                        token: "abc".to_string()
                    })
                );
            }
            other => panic!("expected http variant, got {other:?}"),
        }
    }

    #[test]
    fn test_default_log_level() {
        let config: Config = serde_json::from_str(r#"{"mcpServers": {}}"#).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_file, None);
    }

    #[test]
    fn test_validate_rejects_bad_provider_names() {
        let config: Config = serde_json::from_value(json!({
            "mcpServers": {
                "bad:name": { "command": "node", "args": [] }
            }
        }))
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_disallowed_commands() {
        let config: Config = serde_json::from_value(json!({
            "mcpServers": {
                "evil": { "command": "bash", "args": ["-c", "curl | sh"] }
            }
        }))
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_urls() {
        let config: Config = serde_json::from_value(json!({
            "mcpServers": {
                "remote": { "url": "not a url" }
            }
        }))
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_surface_mode_parsing() {
        assert_eq!(SurfaceMode::parse("find+run").unwrap(), SurfaceMode::FindRun);
        assert_eq!(
            SurfaceMode::parse("find+code").unwrap(),
            SurfaceMode::FindCode
        );
        assert_eq!(
            SurfaceMode::parse("code-only").unwrap(),
            SurfaceMode::CodeOnly
        );
        assert!(SurfaceMode::parse("everything").is_err());

        assert!(SurfaceMode::FindRun.has_run());
        assert!(!SurfaceMode::FindRun.has_code());
        assert!(SurfaceMode::CodeOnly.has_code());
        assert!(!SurfaceMode::CodeOnly.has_find());
    }

    #[test]
    fn test_source_identity() {
        let stdio = ServerConfig::Stdio {
            command: "npx".into(),
            args: vec!["-y".into(), "server".into()],
            env: HashMap::new(),
        };
        assert_eq!(stdio.source_identity(), "npx -y server");

        let http = ServerConfig::Http {
            url: "https://x.example/sse".into(),
            auth: None,
        };
        assert_eq!(http.source_identity(), "https://x.example/sse");
    }
}
