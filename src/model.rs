use crate::error::BoxError;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

pub const BOX_NAME_PREFIX: &str = "box-";
pub const VIRTUAL_PORT_PREFIX: &str = "virtual-";
const NAME_SUFFIX_LENGTH: usize = 5;
const NAME_SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoxProvider {
    Docker,
    Kube,
    Cloud,
}

impl BoxProvider {
    /// Probe order used when the provider of a box is unknown.
    pub const ALL: [Self; 3] = [Self::Docker, Self::Kube, Self::Cloud];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Kube => "kube",
            Self::Cloud => "cloud",
        }
    }
}

impl Display for BoxProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BoxProvider {
    type Err = BoxError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "kube" | "k8s" | "kubernetes" => Ok(Self::Kube),
            "cloud" => Ok(Self::Cloud),
            _ => Err(BoxError::InvalidProvider {
                value: value.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub enum ResourceSize {
    XS,
    #[default]
    S,
    M,
    L,
    XL,
}

impl ResourceSize {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::XS => "XS",
            Self::S => "S",
            Self::M => "M",
            Self::L => "L",
            Self::XL => "XL",
        }
    }

    /// CPU and memory quantities, used as both request and limit.
    pub fn resources(self) -> (&'static str, &'static str) {
        match self {
            Self::XS => ("500m", "512Mi"),
            Self::S => ("1000m", "1024Mi"),
            Self::M => ("2000m", "4096Mi"),
            Self::L => ("4000m", "8192Mi"),
            Self::XL => ("8000m", "16384Mi"),
        }
    }
}

impl Display for ResourceSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn exist_resource_size(value: &str) -> std::result::Result<ResourceSize, BoxError> {
    match value.trim().to_ascii_uppercase().as_str() {
        "XS" => Ok(ResourceSize::XS),
        "S" => Ok(ResourceSize::S),
        "M" => Ok(ResourceSize::M),
        "L" => Ok(ResourceSize::L),
        "XL" => Ok(ResourceSize::XL),
        _ => Err(BoxError::InvalidSize {
            value: value.to_string(),
        }),
    }
}

impl FromStr for ResourceSize {
    type Err = BoxError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        exist_resource_size(value)
    }
}

impl Serialize for ResourceSize {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ResourceSize {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        exist_resource_size(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BoxImage {
    pub repository: String,
    #[serde(default = "default_image_version")]
    pub version: String,
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct BoxNetwork {
    #[serde(default)]
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BoxTemplate {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub image: BoxImage,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub network: BoxNetwork,
    #[serde(default)]
    pub env: Vec<String>,
}

impl BoxTemplate {
    pub fn image_name(&self) -> String {
        format!("{}:{}", self.image.repository, self.image.version)
    }

    /// Ports declared by the template. Aliases with the virtual prefix are only
    /// understood by the cloud backend and are skipped unless requested.
    pub fn network_ports(&self, include_virtual: bool) -> Result<Vec<BoxPort>> {
        let mut ports = Vec::with_capacity(self.network.ports.len());
        for raw in &self.network.ports {
            let port = BoxPort::parse(raw)
                .with_context(|| format!("invalid port in template {}", self.name))?;
            if !include_virtual && port.is_virtual() {
                continue;
            }
            ports.push(port);
        }
        Ok(ports)
    }

    pub fn env_pairs(&self) -> Result<Vec<BoxEnv>> {
        self.env
            .iter()
            .map(|raw| {
                let (key, value) = raw
                    .split_once('=')
                    .with_context(|| format!("invalid env entry '{raw}', expected KEY=VALUE"))?;
                let key = key.trim();
                if key.is_empty() {
                    anyhow::bail!("invalid env entry '{raw}', empty key");
                }
                Ok(BoxEnv {
                    key: key.to_string(),
                    value: value.to_string(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BoxPort {
    pub alias: String,
    pub local: u16,
    pub remote: u16,
    #[serde(default)]
    pub public: bool,
}

impl BoxPort {
    /// Parses `alias:local[:remote]`, remote defaulting to local.
    pub fn parse(raw: &str) -> Result<Self> {
        let parts = raw.split(':').map(str::trim).collect::<Vec<_>>();
        let (alias, local, remote) = match parts.as_slice() {
            [alias, local] => (*alias, *local, *local),
            [alias, local, remote] => (*alias, *local, *remote),
            _ => anyhow::bail!("port '{raw}' must be alias:local[:remote]"),
        };
        if alias.is_empty() {
            anyhow::bail!("port '{raw}' has an empty alias");
        }
        let local = local
            .parse::<u16>()
            .with_context(|| format!("port '{raw}' has an invalid local port"))?;
        let remote = remote
            .parse::<u16>()
            .with_context(|| format!("port '{raw}' has an invalid remote port"))?;

        Ok(Self {
            alias: alias.to_string(),
            local,
            remote,
            public: false,
        })
    }

    pub fn is_virtual(&self) -> bool {
        self.alias.starts_with(VIRTUAL_PORT_PREFIX)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BoxEnv {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BoxInfo {
    pub id: String,
    pub name: String,
    pub healthy: bool,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TemplateSource {
    Local {
        path: String,
    },
    Git {
        url: String,
        revision: String,
        commit: String,
        name: String,
    },
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ProviderInfo {
    Docker { network: String, ip: String },
    Kube { namespace: String },
    Cloud,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxDetails {
    pub info: BoxInfo,
    pub template: TemplateSource,
    pub provider: ProviderInfo,
    pub size: ResourceSize,
    pub env: Vec<BoxEnv>,
    pub ports: Vec<BoxPort>,
    pub created: DateTime<Utc>,
}

/// Whether a box outlives the session that attached to it.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum BoxLifetime {
    Ephemeral,
    #[default]
    Persistent,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum AttachMode {
    #[default]
    ShellAndTunnel,
    ShellOnly,
    TunnelOnly,
}

impl AttachMode {
    pub fn wants_shell(self) -> bool {
        !matches!(self, Self::TunnelOnly)
    }

    pub fn wants_tunnel(self) -> bool {
        !matches!(self, Self::ShellOnly)
    }
}

const LABEL_LOCAL_PATH: &str = "com.hckops.template.local.path";
const LABEL_GIT_URL: &str = "com.hckops.template.git.url";
const LABEL_GIT_REVISION: &str = "com.hckops.template.git.revision";
const LABEL_GIT_COMMIT: &str = "com.hckops.template.git.commit";
const LABEL_GIT_NAME: &str = "com.hckops.template.git.name";
const LABEL_SIZE: &str = "com.hckops.box.size";
const LABEL_SHELL: &str = "com.hckops.box.shell";
const LABEL_PORTS: &str = "com.hckops.box.ports";

/// Provenance and size recorded on the created resource, so `describe` can
/// rebuild details without reading the template again.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct BoxLabels(BTreeMap<String, String>);

impl BoxLabels {
    pub fn new(source: &TemplateSource, size: ResourceSize) -> Self {
        let mut labels = BTreeMap::new();
        match source {
            TemplateSource::Local { path } => {
                labels.insert(LABEL_LOCAL_PATH.to_string(), path.clone());
            }
            TemplateSource::Git {
                url,
                revision,
                commit,
                name,
            } => {
                labels.insert(LABEL_GIT_URL.to_string(), url.clone());
                labels.insert(LABEL_GIT_REVISION.to_string(), revision.clone());
                labels.insert(LABEL_GIT_COMMIT.to_string(), commit.clone());
                labels.insert(LABEL_GIT_NAME.to_string(), name.clone());
            }
        }
        labels.insert(LABEL_SIZE.to_string(), size.as_str().to_string());
        Self(labels)
    }

    pub fn with_shell(mut self, shell: &str) -> Self {
        self.0.insert(LABEL_SHELL.to_string(), shell.to_string());
        self
    }

    /// Records ports as `alias:local:remote` joined by commas.
    pub fn with_ports(mut self, ports: &[BoxPort]) -> Self {
        let encoded = ports
            .iter()
            .map(|port| format!("{}:{}:{}", port.alias, port.local, port.remote))
            .collect::<Vec<_>>()
            .join(",");
        self.0.insert(LABEL_PORTS.to_string(), encoded);
        self
    }

    pub fn from_map<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        Self(
            entries
                .into_iter()
                .filter(|(key, _)| key.starts_with("com.hckops."))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        )
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn template_source(&self) -> Result<TemplateSource> {
        if let Some(path) = self.0.get(LABEL_LOCAL_PATH) {
            return Ok(TemplateSource::Local { path: path.clone() });
        }
        let url = self
            .0
            .get(LABEL_GIT_URL)
            .context("box labels carry no template provenance")?;
        let field = |key: &str| self.0.get(key).cloned().unwrap_or_default();
        Ok(TemplateSource::Git {
            url: url.clone(),
            revision: field(LABEL_GIT_REVISION),
            commit: field(LABEL_GIT_COMMIT),
            name: field(LABEL_GIT_NAME),
        })
    }

    pub fn size(&self) -> Result<ResourceSize> {
        let raw = self
            .0
            .get(LABEL_SIZE)
            .context("box labels carry no size")?;
        Ok(exist_resource_size(raw)?)
    }

    pub fn shell(&self) -> Option<&str> {
        self.0.get(LABEL_SHELL).map(String::as_str)
    }

    pub fn ports(&self) -> Result<Vec<BoxPort>> {
        let Some(encoded) = self.0.get(LABEL_PORTS) else {
            return Ok(Vec::new());
        };
        encoded
            .split(',')
            .filter(|raw| !raw.trim().is_empty())
            .map(BoxPort::parse)
            .collect()
    }
}

pub fn generate_name(template_name: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix = (0..NAME_SUFFIX_LENGTH)
        .map(|_| NAME_SUFFIX_CHARSET[rng.gen_range(0..NAME_SUFFIX_CHARSET.len())] as char)
        .collect::<String>();
    format!("{BOX_NAME_PREFIX}{template_name}-{suffix}")
}

pub fn is_box_name(name: &str) -> bool {
    name.starts_with(BOX_NAME_PREFIX)
}

fn default_image_version() -> String {
    "latest".to_string()
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(ports: &[&str]) -> BoxTemplate {
        BoxTemplate {
            kind: "box/v1".to_string(),
            name: "alpine".to_string(),
            tags: Vec::new(),
            image: BoxImage {
                repository: "hckops/alpine".to_string(),
                version: default_image_version(),
            },
            shell: "/bin/sh".to_string(),
            network: BoxNetwork {
                ports: ports.iter().map(|port| port.to_string()).collect(),
            },
            env: Vec::new(),
        }
    }

    #[test]
    fn network_ports_skip_virtual_unless_requested() {
        let template = template(&["tty:7681", "virtual-vpn:1194", "web:8080:80"]);

        let local = template.network_ports(false).unwrap();
        assert_eq!(
            local.iter().map(|port| port.alias.as_str()).collect::<Vec<_>>(),
            vec!["tty", "web"]
        );
        assert!(local.iter().all(|port| !port.is_virtual()));

        let all = template.network_ports(true).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[1].alias, "virtual-vpn");
    }

    #[test]
    fn port_remote_defaults_to_local() {
        let port = BoxPort::parse("tty:7681").unwrap();
        assert_eq!(port.local, 7681);
        assert_eq!(port.remote, 7681);

        let port = BoxPort::parse("web:8080:80").unwrap();
        assert_eq!(port.local, 8080);
        assert_eq!(port.remote, 80);
    }

    #[test]
    fn malformed_ports_are_rejected() {
        assert!(BoxPort::parse("tty").is_err());
        assert!(BoxPort::parse(":7681").is_err());
        assert!(BoxPort::parse("tty:abc").is_err());
        assert!(BoxPort::parse("tty:1:2:3").is_err());
        assert!(template(&["bad"]).network_ports(false).is_err());
    }

    #[test]
    fn resource_size_is_case_insensitive() {
        for (raw, expected) in [
            ("xs", ResourceSize::XS),
            ("S", ResourceSize::S),
            ("m", ResourceSize::M),
            ("L", ResourceSize::L),
            ("xL", ResourceSize::XL),
        ] {
            assert_eq!(exist_resource_size(raw).unwrap(), expected);
        }
    }

    #[test]
    fn unknown_resource_size_is_an_error() {
        for raw in ["", "XXL", "small", "s m"] {
            let error = exist_resource_size(raw).unwrap_err();
            assert!(error.to_string().starts_with("invalid resource size"));
        }
        assert_eq!(ResourceSize::default(), ResourceSize::S);
        assert!(ResourceSize::XS < ResourceSize::XL);
    }

    #[test]
    fn generated_name_has_prefix_and_suffix() {
        let name = generate_name("alpine");
        assert!(name.starts_with("box-alpine-"));
        assert_eq!(name.len(), "box-alpine-".len() + 5);
        assert!(
            name["box-alpine-".len()..]
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        );
        assert!(is_box_name(&name));
    }

    #[test]
    fn provider_parses_aliases() {
        assert_eq!("Docker".parse::<BoxProvider>().unwrap(), BoxProvider::Docker);
        assert_eq!("kubernetes".parse::<BoxProvider>().unwrap(), BoxProvider::Kube);
        assert_eq!("cloud".parse::<BoxProvider>().unwrap(), BoxProvider::Cloud);
        assert!("podman".parse::<BoxProvider>().is_err());
    }

    #[test]
    fn labels_rebuild_provenance() {
        let source = TemplateSource::Git {
            url: "https://github.com/hckops/megalopolis".to_string(),
            revision: "main".to_string(),
            commit: "abc123".to_string(),
            name: "alpine".to_string(),
        };
        let stored = BoxLabels::new(&source, ResourceSize::M).into_map();
        let restored = BoxLabels::from_map(stored.iter());
        assert_eq!(restored.template_source().unwrap(), source);
        assert_eq!(restored.size().unwrap(), ResourceSize::M);

        let local = BoxLabels::new(
            &TemplateSource::Local {
                path: "/tmp/alpine.yml".to_string(),
            },
            ResourceSize::S,
        );
        assert!(matches!(
            local.template_source().unwrap(),
            TemplateSource::Local { .. }
        ));
        assert!(local.shell().is_none());
        assert!(local.ports().unwrap().is_empty());
    }

    #[test]
    fn labels_carry_shell_and_bound_ports() {
        let ports = vec![
            BoxPort::parse("tty:7682:7681").unwrap(),
            BoxPort::parse("web:8080:80").unwrap(),
        ];
        let stored = BoxLabels::new(
            &TemplateSource::Local {
                path: "/tmp/alpine.yml".to_string(),
            },
            ResourceSize::S,
        )
        .with_shell("/bin/sh")
        .with_ports(&ports)
        .into_map();

        let restored = BoxLabels::from_map(stored.iter());
        assert_eq!(restored.shell(), Some("/bin/sh"));
        assert_eq!(restored.ports().unwrap(), ports);
    }

    #[test]
    fn env_pairs_require_key_value() {
        let mut template = template(&[]);
        template.env = vec!["A=1".to_string(), "B=x=y".to_string()];
        let env = template.env_pairs().unwrap();
        assert_eq!(env[1].value, "x=y");

        template.env = vec!["broken".to_string()];
        assert!(template.env_pairs().is_err());
    }

    #[test]
    fn attach_mode_flags() {
        assert!(AttachMode::ShellAndTunnel.wants_shell());
        assert!(AttachMode::ShellAndTunnel.wants_tunnel());
        assert!(!AttachMode::TunnelOnly.wants_shell());
        assert!(!AttachMode::ShellOnly.wants_tunnel());
    }
}
