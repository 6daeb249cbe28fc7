//! Renderer backed by the salt command-line tools.
//!
//! Stage documents are rendered on the master with
//! `salt-call --local slsutil.renderer <file>`; per-node state files are
//! rendered on a matched node with `salt -C <target> slsutil.renderer`.
//! Both run as subprocesses with YAML output, which keeps mapping order.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_yaml::Value;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{RenderFailure, Rendered, Renderer};
use crate::config::RendererSettings;

/// Renderer using subprocess calls to salt
pub struct SaltRenderer {
    /// Path to the salt-call binary
    salt_call: String,

    /// Path to the salt binary
    salt: String,

    /// Root of the state tree on the master
    states_root: PathBuf,

    /// Upper bound for a single render
    render_timeout: Duration,
}

impl SaltRenderer {
    /// Create a renderer from resolved settings
    pub fn new(settings: &RendererSettings) -> Self {
        Self {
            salt_call: settings.salt_call.clone(),
            salt: settings.salt.clone(),
            states_root: settings.states_root.clone(),
            render_timeout: Duration::from_secs(settings.timeout_seconds),
        }
    }

    /// Root of the state tree
    pub fn states_root(&self) -> &Path {
        &self.states_root
    }

    /// Path of a dotted name relative to the state tree,
    /// e.g. `ceph/stage/0/init.sls` or `ceph/mon.sls`
    pub fn relative_path(&self, name: &str) -> PathBuf {
        let base = PathBuf::from(name.replace('.', "/"));
        if self.is_package(name) {
            base.join("init.sls")
        } else {
            base.with_extension("sls")
        }
    }

    /// Absolute path of a dotted name on the master
    pub fn file_path(&self, name: &str) -> Result<PathBuf, RenderFailure> {
        let path = self.states_root.join(self.relative_path(name));
        if !path.exists() {
            return Err(RenderFailure::message(format!(
                "could not determine path for {}",
                name
            )));
        }
        Ok(path)
    }

    /// Run a salt command and return (stdout, stderr)
    async fn run(&self, program: &str, args: &[String]) -> Result<(String, String), RenderFailure> {
        debug!(program, ?args, "Running renderer command");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RenderFailure::message(format!("failed to spawn {}: {}", program, e)))?;

        let output = timeout(self.render_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                RenderFailure::message(format!(
                    "{} timed out after {:?}",
                    program, self.render_timeout
                ))
            })?
            .map_err(|e| RenderFailure::message(format!("failed to wait for {}: {}", program, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() && stdout.trim().is_empty() {
            let exit_code = output.status.code().unwrap_or(-1);
            let mut errors: Vec<String> = stderr
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect();
            if errors.is_empty() {
                errors.push(format!("{} failed with exit code {}", program, exit_code));
            }
            return Err(RenderFailure::new(errors));
        }

        Ok((stdout, stderr))
    }
}

/// Turn a renderer return value into a document, or the errors it reports.
///
/// Render failures come back as a string or a list of strings in place
/// of the mapping.
pub(crate) fn document_or_errors(value: Value) -> Result<Value, Vec<String>> {
    match value {
        Value::Mapping(_) => Ok(value),
        Value::Null => Ok(Value::Mapping(Default::default())),
        Value::String(s) => Err(s
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect()),
        Value::Sequence(items) => Err(items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => s,
                other => serde_yaml::to_string(&other)
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
            })
            .collect()),
        other => Err(vec![format!("unexpected render result: {:?}", other)]),
    }
}

fn parse_output(stdout: &str) -> Result<Value, RenderFailure> {
    serde_yaml::from_str(stdout)
        .map_err(|e| RenderFailure::message(format!("unreadable renderer output: {}", e)))
}

#[async_trait]
impl Renderer for SaltRenderer {
    fn name(&self) -> &str {
        "salt"
    }

    async fn render_stage(&self, stage_name: &str) -> Result<Rendered, RenderFailure> {
        let path = self.file_path(stage_name)?;
        info!(stage = stage_name, path = %path.display(), "Rendering stage file");

        let args = vec![
            "--local".to_string(),
            "--out=yaml".to_string(),
            "slsutil.renderer".to_string(),
            path.display().to_string(),
        ];
        let (stdout, stderr) = self.run(&self.salt_call, &args).await?;

        let value = match parse_output(&stdout)? {
            Value::Mapping(mut map) => map.remove("local").unwrap_or(Value::Null),
            other => other,
        };
        let document = document_or_errors(value).map_err(RenderFailure::new)?;

        Ok(Rendered::new(document).with_output(stderr.trim()))
    }

    async fn render_state(
        &self,
        state_name: &str,
        target: &str,
    ) -> Result<Rendered, RenderFailure> {
        let source = format!("salt://{}", self.relative_path(state_name).display());
        info!(state = state_name, target, "Rendering state file on target");

        let args = vec![
            "--out=yaml".to_string(),
            "--static".to_string(),
            "-C".to_string(),
            target.to_string(),
            "slsutil.renderer".to_string(),
            source,
        ];
        let (stdout, _) = self.run(&self.salt, &args).await?;

        let Value::Mapping(nodes) = parse_output(&stdout)? else {
            return Err(RenderFailure::message(format!(
                "no node matched target {}",
                target
            )));
        };

        let Some((node, value)) = nodes.into_iter().next() else {
            return Err(RenderFailure::message(format!(
                "no node matched target {}",
                target
            )));
        };
        let node = match node {
            Value::String(s) => s,
            other => serde_yaml::to_string(&other)
                .unwrap_or_default()
                .trim()
                .to_string(),
        };

        match document_or_errors(value) {
            Ok(document) => Ok(Rendered::new(document).on_node(node)),
            Err(errors) => Err(RenderFailure::new(errors).on_node(node)),
        }
    }

    fn is_package(&self, name: &str) -> bool {
        self.states_root.join(name.replace('.', "/")).is_dir()
    }
}
