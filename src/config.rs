use crate::model::{BoxProvider, ResourceSize};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HckConfig {
    #[serde(default, rename = "box")]
    pub box_: BoxConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub kube: KubeConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    /// Path the configuration was read from, if any.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BoxConfig {
    #[serde(default = "default_provider")]
    pub provider: BoxProvider,
    #[serde(default)]
    pub size: ResourceSize,
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DockerConfig {
    #[serde(default = "default_docker_network")]
    pub network_name: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeConfig {
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    #[serde(default = "default_kube_namespace")]
    pub namespace: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudConfig {
    #[serde(default = "default_cloud_address")]
    pub address: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub token: String,
}

impl Default for BoxConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            size: ResourceSize::default(),
            template_dir: default_template_dir(),
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            network_name: default_docker_network(),
        }
    }
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            namespace: default_kube_namespace(),
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            address: default_cloud_address(),
            username: String::new(),
            token: String::new(),
        }
    }
}

impl HckConfig {
    /// Loads the explicit path if given, otherwise the first discovered
    /// config file; no file at all yields the defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("config file {} does not exist", path.display());
                }
                Some(path.to_path_buf())
            }
            None => discover_config_path(),
        };
        let Some(path) = path else {
            return Ok(Self::default());
        };

        Self::read(&path)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut parsed = if raw.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str::<Self>(&raw)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        };
        parsed.source = Some(path.to_path_buf());
        parsed.kube.config_path = parsed
            .kube
            .config_path
            .filter(|path| !path.as_os_str().is_empty());
        Ok(parsed)
    }
}

fn default_provider() -> BoxProvider {
    BoxProvider::Docker
}

fn default_docker_network() -> String {
    "hck-network".to_string()
}

fn default_kube_namespace() -> String {
    "hck".to_string()
}

fn default_cloud_address() -> String {
    "0.0.0.0:2222".to_string()
}

fn default_template_dir() -> PathBuf {
    match std::env::var("HOME") {
        Ok(home) if !home.trim().is_empty() => {
            PathBuf::from(home).join(".cache/hck/megalopolis/boxes")
        }
        _ => PathBuf::from("boxes"),
    }
}

fn discover_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("HCK_CONFIG")
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }

    let cwd_candidates = [PathBuf::from("hck.yaml"), PathBuf::from("hck.yml")];
    for candidate in cwd_candidates {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let user_candidates = [
            PathBuf::from(&home).join(".config/hck/config.yaml"),
            PathBuf::from(&home).join(".config/hck/config.yml"),
        ];
        for candidate in user_candidates {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::HckConfig;
    use crate::model::{BoxProvider, ResourceSize};
    use std::fs;

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hck.yaml");
        fs::write(
            &path,
            "box:\n  provider: kube\n  size: m\ncloud:\n  username: alice\n  token: secret\n",
        )
        .unwrap();

        let config = HckConfig::load(Some(&path)).unwrap();
        assert_eq!(config.box_.provider, BoxProvider::Kube);
        assert_eq!(config.box_.size, ResourceSize::M);
        assert_eq!(config.cloud.username, "alice");
        assert_eq!(config.cloud.address, "0.0.0.0:2222");
        assert_eq!(config.docker.network_name, "hck-network");
        assert_eq!(config.kube.namespace, "hck");
        assert_eq!(config.source.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn empty_kube_config_path_means_inferred() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hck.yaml");
        fs::write(&path, "kube:\n  configPath: \"\"\n  namespace: boxes\n").unwrap();

        let config = HckConfig::load(Some(&path)).unwrap();
        assert!(config.kube.config_path.is_none());
        assert_eq!(config.kube.namespace, "boxes");
    }

    #[test]
    fn invalid_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hck.yaml");
        fs::write(&path, "box:\n  size: huge\n").unwrap();

        let error = HckConfig::load(Some(&path)).unwrap_err();
        assert!(format!("{error:#}").contains("invalid resource size"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(HckConfig::load(Some(&dir.path().join("absent.yaml"))).is_err());
    }
}
