//! CNI plugin interaction via command execution

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use derive_builder::Builder;
use getset::Getters;
use std::{collections::HashMap, path::Path, time::Duration};
use tokio::{io::AsyncWriteExt, process::Command, time};

#[async_trait]
/// The CNI command execution trait.
pub trait Exec: Send + Sync {
    /// Run a command and return the output as result.
    async fn run(&self, binary: &Path, args: &Args) -> Result<String>;

    /// Run a command with the provided bytes piped to stdin.
    async fn run_with_stdin(&self, binary: &Path, args: &Args, stdin: &[u8]) -> Result<String>;
}

#[derive(Clone, Debug)]
/// DefaultExec executes CNI plugins as subprocesses with a wall-clock
/// ceiling per invocation.
pub struct DefaultExec {
    timeout: Duration,
}

impl Default for DefaultExec {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(220),
        }
    }
}

impl DefaultExec {
    /// Create an executor with the provided invocation timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn exec(&self, binary: &Path, args: &Args, stdin: Option<&[u8]>) -> Result<String> {
        let mut command = Command::new(binary);
        command.envs(args.envs());
        command.stdin(std::process::Stdio::piped());
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());
        // Reap the plugin when the invocation future is dropped or times
        // out.
        command.kill_on_drop(true);

        let mut child = command
            .spawn()
            .with_context(|| format!("spawn plugin binary {}", binary.display()))?;

        if let Some(bytes) = stdin {
            child
                .stdin
                .take()
                .context("no stdin handle")?
                .write_all(bytes)
                .await
                .context("write plugin stdin")?;
        } else {
            // Close stdin so plugins reading it see EOF.
            child.stdin.take();
        }

        let output = time::timeout(self.timeout, child.wait_with_output())
            .await
            .with_context(|| {
                format!(
                    "plugin {} timed out after {:?}",
                    binary.display(),
                    self.timeout
                )
            })?
            .context("wait for plugin")?;

        let stdout = String::from_utf8(output.stdout).context("convert output to string")?;

        if !output.status.success() {
            // The plugin's error channel is a JSON object on stdout. Pass it
            // through verbatim so the caller can decode it.
            if !stdout.trim().is_empty() {
                bail!("{}", stdout.trim());
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "plugin {} failed with {}: {}",
                binary.display(),
                output.status,
                stderr.trim()
            );
        }

        Ok(stdout)
    }
}

#[async_trait]
impl Exec for DefaultExec {
    async fn run(&self, binary: &Path, args: &Args) -> Result<String> {
        self.exec(binary, args, None).await
    }

    async fn run_with_stdin(&self, binary: &Path, args: &Args, stdin: &[u8]) -> Result<String> {
        self.exec(binary, args, Some(stdin)).await
    }
}

#[derive(Clone, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into))]
/// The per-invocation identity handed to a plugin process through its
/// environment.
pub struct Args {
    #[get = "pub"]
    /// The verb to execute, exported as CNI_COMMAND.
    command: String,

    #[get = "pub"]
    /// The infra container ID owning the attachment.
    container_id: String,

    #[get = "pub"]
    /// Path to the pod's network namespace.
    network_namespace: String,

    #[get = "pub"]
    /// Ordered key/value pairs joined into CNI_ARGS.
    plugin_args: Vec<(String, String)>,

    #[get = "pub"]
    /// The interface the plugin operates on inside the pod.
    interface_name: String,

    #[get = "pub"]
    /// The plugin binary directory, exported as CNI_PATH.
    path: String,
}

impl Args {
    /// The CNI_* environment of the plugin process.
    fn envs(&self) -> HashMap<String, String> {
        let cni_args = self
            .plugin_args()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(";");

        vec![
            ("CNI_COMMAND", self.command().clone()),
            ("CNI_CONTAINERID", self.container_id().clone()),
            ("CNI_NETNS", self.network_namespace().clone()),
            ("CNI_ARGS", cni_args),
            ("CNI_IFNAME", self.interface_name().clone()),
            ("CNI_PATH", self.path().clone()),
        ]
        .into_iter()
        .map(|(key, value)| (key.into(), value))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, os::unix::fs::PermissionsExt, path::PathBuf};
    use tempfile::TempDir;

    fn write_script(dir: &Path, content: &str) -> Result<PathBuf> {
        let path = dir.join("plugin");
        fs::write(&path, content)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    #[tokio::test]
    async fn exec_captures_plugin_stdout() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let binary = write_script(
            temp_dir.path(),
            "#!/bin/sh\necho '{ \"cniVersion\": \"1.0.0\", \"supportedVersions\": [\"1.0.0\"] }'\n",
        )?;

        let output = DefaultExec::default()
            .run(
                &binary,
                &ArgsBuilder::default().command("VERSION").build()?,
            )
            .await?;
        assert!(output.contains("supportedVersions"));
        Ok(())
    }

    #[tokio::test]
    async fn exec_exports_cni_environment() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let binary = write_script(
            temp_dir.path(),
            "#!/bin/sh\nprintf '%s %s' \"$CNI_COMMAND\" \"$CNI_IFNAME\"\n",
        )?;

        let output = DefaultExec::default()
            .run(
                &binary,
                &ArgsBuilder::default()
                    .command("ADD")
                    .interface_name("eth0")
                    .build()?,
            )
            .await?;
        assert_eq!(output, "ADD eth0");
        Ok(())
    }

    #[tokio::test]
    async fn exec_missing_binary_fails() -> Result<()> {
        let res = DefaultExec::default()
            .run(
                Path::new("/does/not/exist/myplugin"),
                &ArgsBuilder::default().build()?,
            )
            .await;
        assert!(res.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn exec_pipes_stdin() -> Result<()> {
        let binary = which::which("cat")?;
        let output = DefaultExec::default()
            .run_with_stdin(&binary, &ArgsBuilder::default().build()?, b"{\"a\":1}")
            .await?;
        assert_eq!(output, "{\"a\":1}");
        Ok(())
    }

    #[tokio::test]
    async fn exec_failure_passes_stdout_error_object() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let binary = write_script(
            temp_dir.path(),
            "#!/bin/sh\necho '{ \"code\": 7, \"msg\": \"boom\" }'\nexit 1\n",
        )?;

        let err = DefaultExec::default()
            .run_with_stdin(&binary, &ArgsBuilder::default().build()?, b"{}")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
        Ok(())
    }

    #[tokio::test]
    async fn exec_timeout() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let binary = write_script(temp_dir.path(), "#!/bin/sh\nsleep 5\n")?;

        let err = DefaultExec::new(Duration::from_millis(100))
            .run(&binary, &ArgsBuilder::default().build()?)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        Ok(())
    }

    #[test]
    fn args_env_assembly() -> Result<()> {
        let args = ArgsBuilder::default()
            .command("ADD")
            .container_id("id")
            .network_namespace("/proc/1/ns/net")
            .interface_name("eth0")
            .path("/opt/cni/bin")
            .plugin_args(vec![
                ("IgnoreUnknown".to_string(), "1".to_string()),
                ("K8S_POD_NAME".to_string(), "pod".to_string()),
            ])
            .build()?;

        let envs = args.envs();
        assert_eq!(envs.get("CNI_COMMAND").map(String::as_str), Some("ADD"));
        assert_eq!(envs.get("CNI_IFNAME").map(String::as_str), Some("eth0"));
        assert_eq!(
            envs.get("CNI_ARGS").map(String::as_str),
            Some("IgnoreUnknown=1;K8S_POD_NAME=pod")
        );
        Ok(())
    }
}
