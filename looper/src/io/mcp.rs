//! MCP tool-server config (`{"mcpServers": {...}}` JSON) and its translation
//! into the formats each agent CLI accepts.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// One MCP server entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct McpFile {
    #[serde(rename = "mcpServers", default)]
    servers: BTreeMap<String, McpServerConfig>,
}

/// A parsed MCP config, remembering where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpConfig {
    pub path: PathBuf,
    pub servers: BTreeMap<String, McpServerConfig>,
}

impl McpConfig {
    pub fn load(path: &Path) -> Result<McpConfig> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let file: McpFile = serde_json::from_str(&contents)
            .with_context(|| format!("parse MCP config {}", path.display()))?;
        for name in file.servers.keys() {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
                return Err(anyhow!("MCP server name '{name}' must be [A-Za-z0-9_-]+"));
            }
        }
        Ok(McpConfig {
            path: path.to_path_buf(),
            servers: file.servers,
        })
    }

    /// `-c key=value` overrides in Codex's `mcp_servers.<name>.*` layout.
    /// Values are TOML literals; JSON string and array encodings are valid
    /// TOML for the values we emit.
    pub fn codex_overrides(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (name, server) in &self.servers {
            args.push("-c".to_string());
            args.push(format!(
                "mcp_servers.{name}.command={}",
                toml_string(&server.command)
            ));
            if !server.args.is_empty() {
                let list: Vec<String> = server.args.iter().map(|a| toml_string(a)).collect();
                args.push("-c".to_string());
                args.push(format!("mcp_servers.{name}.args=[{}]", list.join(",")));
            }
            if !server.env.is_empty() {
                let pairs: Vec<String> = server
                    .env
                    .iter()
                    .map(|(k, v)| format!("{}={}", toml_string(k), toml_string(v)))
                    .collect();
                args.push("-c".to_string());
                args.push(format!("mcp_servers.{name}.env={{{}}}", pairs.join(",")));
            }
        }
        args
    }
}

fn toml_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_servers_to_codex_overrides() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("mcp.json");
        fs::write(
            &path,
            r#"{"mcpServers": {"docs": {"command": "npx", "args": ["-y", "docs-mcp"], "env": {"TOKEN": "a\"b"}}}}"#,
        )
        .expect("write");

        let cfg = McpConfig::load(&path).expect("load");
        let args = cfg.codex_overrides();
        assert_eq!(
            args,
            vec![
                "-c",
                r#"mcp_servers.docs.command="npx""#,
                "-c",
                r#"mcp_servers.docs.args=["-y","docs-mcp"]"#,
                "-c",
                r#"mcp_servers.docs.env={"TOKEN"="a\"b"}"#,
            ]
        );
    }

    #[test]
    fn rejects_unsafe_server_names() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("mcp.json");
        fs::write(&path, r#"{"mcpServers": {"a.b": {"command": "x"}}}"#).expect("write");
        assert!(McpConfig::load(&path).is_err());
    }
}
