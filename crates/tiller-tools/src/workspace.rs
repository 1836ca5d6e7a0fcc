// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

/// Result of a workspace command execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Where a conversation's tools operate: command execution plus the file
/// I/O primitives tools bind to.
#[async_trait]
pub trait Workspace: Send + Sync {
    fn working_dir(&self) -> &Path;

    async fn execute_command(
        &self,
        command: &str,
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> anyhow::Result<CommandResult>;

    async fn read_file(&self, path: &Path) -> anyhow::Result<String>;

    async fn write_file(&self, path: &Path, contents: &str) -> anyhow::Result<()>;

    /// Resolve a possibly-relative path against the working directory.
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir().join(path)
        }
    }
}

/// Serializable workspace descriptor used in configuration and over the
/// wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkspaceSpec {
    Local {
        working_dir: PathBuf,
    },
    Remote {
        host: String,
        working_dir: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_api_key: Option<String>,
    },
}

impl WorkspaceSpec {
    pub fn local(working_dir: impl Into<PathBuf>) -> Self {
        Self::Local {
            working_dir: working_dir.into(),
        }
    }

    pub fn connect(&self) -> Arc<dyn Workspace> {
        match self {
            Self::Local { working_dir } => Arc::new(LocalWorkspace::new(working_dir.clone())),
            Self::Remote {
                host,
                working_dir,
                session_api_key,
            } => Arc::new(RemoteWorkspace::new(
                host.clone(),
                working_dir.clone(),
                session_api_key.clone(),
            )),
        }
    }
}

// ─── Local workspace ──────────────────────────────────────────────────────────

pub struct LocalWorkspace {
    working_dir: PathBuf,
}

impl LocalWorkspace {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }
}

#[async_trait]
impl Workspace for LocalWorkspace {
    fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    async fn execute_command(
        &self,
        command: &str,
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> anyhow::Result<CommandResult> {
        debug!(cmd = %command, "executing workspace command");
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command);
        // Detach the subprocess from any controlling terminal: stdin from
        // /dev/null defeats isatty(0) probes, and kill_on_drop reaps the
        // child when the timeout drops the future.
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        cmd.current_dir(cwd.unwrap_or(&self.working_dir));

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| anyhow::anyhow!("command timed out after {}s", timeout.as_secs()))??;

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn read_file(&self, path: &Path) -> anyhow::Result<String> {
        let path = self.resolve(path);
        Ok(tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?)
    }

    async fn write_file(&self, path: &Path, contents: &str) -> anyhow::Result<()> {
        let path = self.resolve(path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| anyhow::anyhow!("writing {}: {e}", path.display()))?;
        Ok(())
    }
}

// ─── Remote workspace ─────────────────────────────────────────────────────────

/// Workspace projected onto a remote agent server. Commands and file I/O
/// go over its HTTP surface; the optional session API key rides in the
/// `X-Session-API-Key` header.
pub struct RemoteWorkspace {
    host: String,
    working_dir: PathBuf,
    session_api_key: Option<String>,
    client: reqwest::Client,
}

impl RemoteWorkspace {
    pub fn new(host: String, working_dir: PathBuf, session_api_key: Option<String>) -> Self {
        Self {
            host: host.trim_end_matches('/').to_string(),
            working_dir,
            session_api_key,
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, format!("{}{path}", self.host));
        if let Some(key) = &self.session_api_key {
            req = req.header("X-Session-API-Key", key);
        }
        req
    }
}

#[async_trait]
impl Workspace for RemoteWorkspace {
    fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    async fn execute_command(
        &self,
        command: &str,
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> anyhow::Result<CommandResult> {
        let body = serde_json::json!({
            "command": command,
            "cwd": cwd.map(|p| p.display().to_string()),
            "timeout_secs": timeout.as_secs(),
        });
        let response = self
            .request(reqwest::Method::POST, "/api/execute_command")
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn read_file(&self, path: &Path) -> anyhow::Result<String> {
        let response = self
            .request(reqwest::Method::GET, "/api/file")
            .query(&[("path", path.display().to_string())])
            .send()
            .await?
            .error_for_status()?;
        let value: serde_json::Value = response.json().await?;
        value["contents"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("malformed file response"))
    }

    async fn write_file(&self, path: &Path, contents: &str) -> anyhow::Result<()> {
        self.request(reqwest::Method::POST, "/api/file")
            .json(&serde_json::json!({
                "path": path.display().to_string(),
                "contents": contents,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_execute_captures_stdout_and_exit_code() {
        let ws = LocalWorkspace::new(std::env::temp_dir());
        let r = ws
            .execute_command("echo hello", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(r.stdout.trim(), "hello");
        assert_eq!(r.exit_code, 0);
    }

    #[tokio::test]
    async fn local_execute_reports_nonzero_exit() {
        let ws = LocalWorkspace::new(std::env::temp_dir());
        let r = ws
            .execute_command("exit 3", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(r.exit_code, 3);
    }

    #[tokio::test]
    async fn local_execute_times_out() {
        let ws = LocalWorkspace::new(std::env::temp_dir());
        let err = ws
            .execute_command("sleep 30", None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn local_file_round_trip_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let ws = LocalWorkspace::new(dir.path());
        ws.write_file(Path::new("sub/note.txt"), "content")
            .await
            .unwrap();
        let read = ws.read_file(Path::new("sub/note.txt")).await.unwrap();
        assert_eq!(read, "content");
    }

    #[test]
    fn workspace_spec_connects_local() {
        let spec = WorkspaceSpec::local("/tmp");
        let ws = spec.connect();
        assert_eq!(ws.working_dir(), Path::new("/tmp"));
    }

    #[test]
    fn remote_spec_round_trips() {
        let spec = WorkspaceSpec::Remote {
            host: "http://127.0.0.1:3000".into(),
            working_dir: PathBuf::from("/workspace"),
            session_api_key: Some("key".into()),
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"kind\":\"remote\""));
        let back: WorkspaceSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}
