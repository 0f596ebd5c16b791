//! CNI plugin helpers mostly around their execution

use crate::{
    error::NetworkError,
    exec::{Args, ArgsBuilder, Exec},
};
use anyhow::{Context, Result};
use getset::Getters;
use ipnetwork::IpNetwork;
use log::trace;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use strum::{AsRefStr, EnumString, IntoStaticStr};

#[derive(AsRefStr, IntoStaticStr, Copy, Clone, Debug, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "shouty_snake_case")]
/// The CNI commands understood by plugin binaries.
pub enum Command {
    Add,
    Del,
    Check,
    Gc,
    Status,
    Version,
}

/// Resolve a plugin type to a binary inside the plugin directory.
pub fn find_binary(typ: &str, bin_dir: &Path) -> Result<PathBuf> {
    which::which_in(
        typ,
        Some(bin_dir),
        std::env::current_dir().context("get current working directory")?,
    )
    .with_context(|| {
        format!(
            "find plugin binary {} in path {}",
            typ,
            bin_dir.display()
        )
    })
}

#[derive(Getters)]
/// A single resolved plugin binary plus the executor used to drive it.
pub struct Plugin {
    #[get]
    /// Path to the plugin binary.
    binary: PathBuf,

    #[get]
    /// Directory exported to the plugin as CNI_PATH.
    bin_dir: PathBuf,

    #[get]
    /// CNI command execution helper.
    exec: Arc<dyn Exec>,
}

/// Per-invocation identity of the attachment the plugin operates on. Empty
/// fields are legal for the container-less verbs (GC, STATUS, VERSION).
#[derive(Clone, Debug, Default)]
pub struct InvokeArgs {
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    pub plugin_args: Vec<(String, String)>,
}

impl Plugin {
    /// Resolve the plugin binary for `typ` in `bin_dir`.
    pub fn resolve(typ: &str, bin_dir: &Path, exec: Arc<dyn Exec>) -> Result<Self> {
        let binary = find_binary(typ, bin_dir)?;
        trace!("Using plugin binary {}", binary.display());
        Ok(Self {
            binary,
            bin_dir: bin_dir.into(),
            exec,
        })
    }

    /// Create a version request for the plugin.
    pub async fn version(&self) -> Result<VersionResult> {
        let args = ArgsBuilder::default()
            .command(Command::Version.as_ref())
            .path(self.bin_dir().display().to_string())
            .build()
            .context("build CNI exec args")?;

        let output = self
            .exec()
            .run(self.binary(), &args)
            .await
            .context("exec CNI plugin")?;
        trace!("Got CNI output {}", output.trim());

        serde_json::from_str::<VersionResult>(&output).context("unmarshal CNI output")
    }

    /// Add an attachment via the plugin. Returns the plugin's result object.
    pub async fn add(&self, invoke: &InvokeArgs, stdin: &[u8]) -> Result<CNIResult> {
        self.cmd(Command::Add, invoke, stdin)
            .await?
            .context("no CNI result")
    }

    /// Delete an attachment via the plugin.
    pub async fn del(&self, invoke: &InvokeArgs, stdin: &[u8]) -> Result<()> {
        self.cmd(Command::Del, invoke, stdin).await?;
        Ok(())
    }

    /// Check an attachment via the plugin.
    pub async fn check(&self, invoke: &InvokeArgs, stdin: &[u8]) -> Result<()> {
        self.cmd(Command::Check, invoke, stdin).await?;
        Ok(())
    }

    /// Ask the plugin to reconcile its host state against the valid
    /// attachments named in `stdin`.
    pub async fn gc(&self, stdin: &[u8]) -> Result<()> {
        self.cmd(Command::Gc, &InvokeArgs::default(), stdin).await?;
        Ok(())
    }

    /// Probe the plugin's readiness to service attachments.
    pub async fn status(&self, stdin: &[u8]) -> Result<()> {
        self.cmd(Command::Status, &InvokeArgs::default(), stdin)
            .await?;
        Ok(())
    }

    /// Run a command against the plugin binary.
    async fn cmd(
        &self,
        command: Command,
        invoke: &InvokeArgs,
        stdin: &[u8],
    ) -> Result<Option<CNIResult>> {
        let args: Args = ArgsBuilder::default()
            .command(command.as_ref())
            .container_id(invoke.container_id.clone())
            .network_namespace(invoke.netns.clone())
            .interface_name(invoke.ifname.clone())
            .plugin_args(invoke.plugin_args.clone())
            .path(self.bin_dir().display().to_string())
            .build()
            .context("build CNI exec args")?;
        trace!("Using CNI args {:?}", args);

        match self.exec().run_with_stdin(self.binary(), &args, stdin).await {
            Ok(output) if command == Command::Add => {
                let result =
                    serde_json::from_str::<CNIResult>(&output).context("unmarshal CNI result")?;
                trace!("Got CNI output {:?}", result);
                Ok(Some(result))
            }
            Ok(_) => Ok(None),
            Err(e) => match serde_json::from_str::<ErrorResult>(&e.to_string()) {
                // The plugin used its error channel.
                Ok(cni_error) => Err(NetworkError::Plugin {
                    code: cni_error.code,
                    message: cni_error.message,
                }
                .into()),
                // Everything else (spawn failure, timeout) passes verbatim.
                Err(_) => Err(e),
            },
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, Getters)]
/// The decoded output of a `VERSION` invocation.
pub struct VersionResult {
    #[get = "pub"]
    #[serde(rename = "cniVersion")]
    /// The specification version the plugin itself implements.
    current: String,

    #[get = "pub"]
    #[serde(rename = "supportedVersions")]
    /// Every specification version the plugin accepts in configurations.
    supported_versions: Vec<String>,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, Getters, PartialEq)]
/// What an ADD left behind in the pod namespace, decoded far enough to pull
/// out addresses and interfaces. Unmodeled keys are retained so the result
/// round-trips as `prevResult`.
pub struct CNIResult {
    #[get = "pub"]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "cniVersion"
    )]
    /// The CNI version of the result.
    cni_version: Option<String>,

    #[get = "pub"]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    /// The list of network interfaces.
    interfaces: Vec<NetworkInterface>,

    #[get = "pub"]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    /// The list of IPs.
    ips: Vec<IP>,

    #[get = "pub"]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    /// The list of routes.
    routes: Vec<Route>,

    #[get = "pub"]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// The DNS configuration.
    dns: Option<DNS>,

    #[get = "pub"]
    #[serde(flatten)]
    /// Result keys not modeled above.
    specific: Map<String, Value>,
}

impl CNIResult {
    /// Decode a result from its raw JSON form.
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone()).context("unmarshal CNI result")
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, Getters, PartialEq)]
/// One interface a chain created or adopted, on the host or in the pod.
pub struct NetworkInterface {
    #[get = "pub"]
    name: String,

    #[get = "pub"]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mac: Option<String>,

    #[get = "pub"]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sandbox: Option<String>,
}

#[derive(Clone, Serialize, Deserialize, Debug, Getters, PartialEq)]
/// An address a chain assigned, pointing back at the interface carrying it.
pub struct IP {
    #[get = "pub"]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// IP version, either "4" or "6". Dropped from results by CNI 1.0.
    version: Option<String>,

    #[get = "pub"]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Index into the result's interfaces list.
    interface: Option<usize>,

    #[get = "pub"]
    address: IpNetwork,

    #[get = "pub"]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gateway: Option<IpAddr>,
}

#[derive(Clone, Serialize, Deserialize, Debug, Getters, PartialEq)]
pub struct Route {
    #[get = "pub"]
    dst: IpNetwork,

    #[get = "pub"]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gw: Option<IpAddr>,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, Getters, PartialEq)]
/// DNS contains values interesting for DNS resolvers
pub struct DNS {
    #[get = "pub"]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nameservers: Option<Vec<String>>,

    #[get = "pub"]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    domain: Option<String>,

    #[get = "pub"]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    search: Option<Vec<String>>,

    #[get = "pub"]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    options: Option<Vec<String>>,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, Getters)]
/// The structured error a failing plugin prints on stdout alongside its
/// non-zero exit.
pub struct ErrorResult {
    #[get = "pub"]
    /// Error code.
    code: u64,

    #[get = "pub"]
    #[serde(rename = "msg")]
    /// Error message.
    message: String,
}
