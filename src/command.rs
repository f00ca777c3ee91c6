// src/command.rs
//
// Gate in front of every child-process spawn. Provider configs come from a
// user-editable profile file, so the command line is treated as untrusted:
// only known runtime launchers may be executed, and nothing that smells of
// shell interpretation gets through.

use crate::error::{GatewayError, Result};

/// Base commands a provider is allowed to launch. Matching is on the file
/// name, so `/usr/local/bin/node` and `node` both resolve to `node`.
const ALLOWED_RUNTIMES: &[&str] = &[
    "node", "npx", "bun", "bunx", "deno", "python", "python3", "uv", "uvx", "pipx", "ruby",
    "java", "dotnet", "docker", "podman", "go", "cargo",
];

const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '<', '>', '\n', '\r', '\t', '\0',
];

/// Flags that hand a command string to an interpreter (`sh -c`, `node -e`).
const COMMAND_STRING_FLAGS: &[&str] = &["-c", "-e", "--eval", "--command"];

fn base_name(command: &str) -> &str {
    command
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(command)
        .trim_end_matches(".exe")
}

fn contains_metacharacter(s: &str) -> bool {
    s.chars().any(|c| SHELL_METACHARACTERS.contains(&c))
}

/// Validate a provider command line before spawning. Returns `InvalidRequest`
/// with the offending detail on rejection.
pub fn validate_command(command: &str, args: &[String]) -> Result<()> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "provider command is empty".to_string(),
        ));
    }
    if contains_metacharacter(trimmed) {
        return Err(GatewayError::InvalidRequest(format!(
            "provider command '{trimmed}' contains shell metacharacters"
        )));
    }
    if trimmed.contains("../") || trimmed.contains("..\\") {
        return Err(GatewayError::InvalidRequest(format!(
            "provider command '{trimmed}' contains path traversal"
        )));
    }

    let base = base_name(trimmed);
    if !ALLOWED_RUNTIMES.contains(&base) {
        return Err(GatewayError::InvalidRequest(format!(
            "command '{base}' is not an allowed runtime"
        )));
    }

    for arg in args {
        if contains_metacharacter(arg) {
            return Err(GatewayError::InvalidRequest(format!(
                "argument '{arg}' contains shell metacharacters"
            )));
        }
        if arg.contains("../") || arg.contains("..\\") {
            return Err(GatewayError::InvalidRequest(format!(
                "argument '{arg}' contains path traversal"
            )));
        }
        if COMMAND_STRING_FLAGS.contains(&arg.as_str()) {
            return Err(GatewayError::InvalidRequest(format!(
                "command-string flag '{arg}' is not permitted"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_allows_runtime_launchers() {
        assert!(validate_command("npx", &args(&["-y", "@modelcontextprotocol/server-github"])).is_ok());
        assert!(validate_command("/usr/bin/python3", &args(&["-m", "server"])).is_ok());
        assert!(validate_command("docker", &args(&["run", "ghcr.io/some/mcp"])).is_ok());
    }

    #[test]
    fn test_rejects_unknown_base_commands() {
        assert!(validate_command("bash", &[]).is_err());
        assert!(validate_command("/bin/sh", &[]).is_err());
        assert!(validate_command("rm", &args(&["-rf", "/"])).is_err());
    }

    #[test]
    fn test_rejects_metacharacters() {
        assert!(validate_command("node; rm -rf /", &[]).is_err());
        assert!(validate_command("node", &args(&["server.js; echo pwned"])).is_err());
        assert!(validate_command("node", &args(&["$(whoami)"])).is_err());
        assert!(validate_command("node", &args(&["a|b"])).is_err());
    }

    #[test]
    fn test_rejects_command_string_flags() {
        assert!(validate_command("node", &args(&["-e", "process.exit()"])).is_err());
        assert!(validate_command("python3", &args(&["-c", "import os"])).is_err());
    }

    #[test]
    fn test_rejects_path_traversal() {
        assert!(validate_command("../node", &[]).is_err());
        assert!(validate_command("node", &args(&["../../etc/passwd"])).is_err());
    }

    #[test]
    fn test_windows_exe_suffix_resolves() {
        assert!(validate_command("C:\\tools\\node.exe", &[]).is_ok());
    }
}
