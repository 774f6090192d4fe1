use crate::client::{BoxClient, ConnectOptions, CreateOptions, finish_session};
use crate::config::DockerConfig;
use crate::error::BoxError;
use crate::event::{Emitter, EventBus};
use crate::model::{
    BOX_NAME_PREFIX, BoxDetails, BoxEnv, BoxInfo, BoxLabels, BoxPort, BoxProvider, BoxTemplate,
    ProviderInfo, generate_name, is_box_name,
};
use crate::session::{BoxStreams, pipe_session};
use crate::tunnel::resolve_ports;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, HostConfig, PortBinding};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

const SOURCE: &str = "docker";
const DEFAULT_SHELL: &str = "/bin/bash";

pub struct DockerBoxClient {
    docker: Docker,
    network: String,
    emitter: Emitter,
}

impl DockerBoxClient {
    pub fn new(config: &DockerConfig, events: Arc<EventBus>) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("failed to connect to the docker daemon")?;
        Ok(Self {
            docker,
            network: config.network_name.clone(),
            emitter: Emitter::new(events, SOURCE),
        })
    }

    async fn pull_image(&self, template: &BoxTemplate) -> Result<()> {
        let image = template.image_name();
        self.emitter.loader(format!("pulling image {image}"));

        let options = CreateImageOptions {
            from_image: template.image.repository.clone(),
            tag: template.image.version.clone(),
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(update) = progress.next().await {
            match update {
                Ok(info) => {
                    if let Some(status) = info.status {
                        let detail = info.progress.unwrap_or_default();
                        self.emitter.loader(format!("{image}: {status} {detail}"));
                    }
                }
                Err(error) => {
                    // a local image is still usable when the registry is unreachable
                    if self.docker.inspect_image(&image).await.is_ok() {
                        self.emitter
                            .warning(format!("image pull failed, using local {image}: {error}"));
                        return Ok(());
                    }
                    return Err(error).with_context(|| format!("failed to pull image {image}"));
                }
            }
        }
        self.emitter.debug(format!("image {image} ready"));
        Ok(())
    }

    async fn ensure_network(&self) -> Result<()> {
        let options = ListNetworksOptions {
            filters: HashMap::from([("name".to_string(), vec![self.network.clone()])]),
        };
        let networks = self
            .docker
            .list_networks(Some(options))
            .await
            .context("failed to list docker networks")?;
        if networks
            .iter()
            .any(|network| network.name.as_deref() == Some(self.network.as_str()))
        {
            return Ok(());
        }

        self.emitter
            .debug(format!("creating docker network {}", self.network));
        self.docker
            .create_network(CreateNetworkOptions {
                name: self.network.clone(),
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await
            .with_context(|| format!("failed to create docker network {}", self.network))?;
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<ContainerInspectResponse> {
        match self.docker.inspect_container(name, None).await {
            Ok(response) if owned_box_name(&response).is_some() => Ok(response),
            Ok(_) => Err(BoxError::not_found(name).into()),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(BoxError::not_found(name).into()),
            Err(error) => Err(error).with_context(|| format!("failed to inspect container {name}")),
        }
    }

    async fn exec_shell(
        &self,
        name: &str,
        shell: &str,
        streams: BoxStreams,
        interrupt: &CancellationToken,
    ) -> Result<()> {
        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(streams.is_tty),
                    cmd: Some(vec![shell.to_string()]),
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("failed to create exec in {name}"))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .with_context(|| format!("failed to start exec in {name}"))?;
        let StartExecResults::Attached { output, input } = started else {
            anyhow::bail!("exec in {name} started detached");
        };

        if let Some((width, height)) = streams.terminal_size()
            && let Err(error) = self
                .docker
                .resize_exec(&exec.id, ResizeExecOptions { height, width })
                .await
        {
            self.emitter
                .warning(format!("failed to resize terminal: {error}"));
        }

        self.emitter.loader_stop();
        let output = StreamReader::new(
            output.map(|chunk| chunk.map(|log| log.into_bytes()).map_err(std::io::Error::other)),
        );
        pipe_session(streams, output, input, None, interrupt).await
    }
}

#[async_trait]
impl BoxClient for DockerBoxClient {
    fn provider(&self) -> BoxProvider {
        BoxProvider::Docker
    }

    fn events(&self) -> Arc<EventBus> {
        self.emitter.bus().clone()
    }

    async fn create(&self, opts: CreateOptions) -> Result<BoxInfo> {
        let template = &opts.template;
        let name = generate_name(&template.name);

        self.pull_image(template).await?;
        self.ensure_network().await?;

        let ports = template.network_ports(false)?;
        let ports = resolve_ports(&ports, |port| {
            self.emitter.console(format!(
                "[{}] http://localhost:{} -> {}",
                port.alias, port.local, port.remote
            ));
        })?;
        let labels = BoxLabels::new(&opts.source, opts.size)
            .with_shell(&template.shell)
            .with_ports(&ports);
        let config = build_container_config(template, &ports, labels, &self.network)?;

        self.emitter.loader(format!("creating box {name}"));
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .with_context(|| format!("failed to create container {name}"))?;
        for warning in created.warnings {
            self.emitter.warning(format!("{name}: {warning}"));
        }

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("failed to start container {name}"))?;
        self.emitter.loader_stop();
        self.emitter
            .info(format!("box {name} created with id {}", created.id));

        Ok(BoxInfo {
            id: created.id,
            name,
            healthy: true,
        })
    }

    async fn connect(&self, opts: ConnectOptions) -> Result<()> {
        let ConnectOptions {
            name,
            streams,
            mode,
            lifetime,
            interrupt,
        } = opts;
        let details = self.describe(&name).await?;
        self.emitter.loader(format!("connecting to {name}"));

        // ports were bound when the container was created
        if mode.wants_tunnel() {
            for port in &details.ports {
                self.emitter.console(format!(
                    "[{}] http://localhost:{} -> {}",
                    port.alias, port.local, port.remote
                ));
            }
        }

        let session = if mode.wants_shell() {
            let inspected = self.inspect(&name).await?;
            let labels = container_labels(&inspected);
            let shell = labels.shell().unwrap_or(DEFAULT_SHELL).to_string();
            self.exec_shell(&name, &shell, streams, &interrupt).await
        } else {
            self.emitter.loader_stop();
            interrupt.cancelled().await;
            Ok(())
        };

        finish_session(lifetime, session, self.delete(std::slice::from_ref(&name))).await
    }

    async fn describe(&self, name: &str) -> Result<BoxDetails> {
        let inspected = self.inspect(name).await?;
        container_details(&inspected, &self.network)
            .with_context(|| format!("failed to read details of container {name}"))
    }

    async fn list(&self) -> Result<Vec<BoxInfo>> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([("name".to_string(), vec![BOX_NAME_PREFIX.to_string()])]),
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .context("failed to list containers")?;

        let mut boxes = containers
            .into_iter()
            .filter_map(|container| {
                let name = container
                    .names
                    .unwrap_or_default()
                    .into_iter()
                    .map(|name| name.trim_start_matches('/').to_string())
                    .find(|name| is_box_name(name))?;
                Some(BoxInfo {
                    id: container.id.unwrap_or_default(),
                    name,
                    healthy: container.state.as_deref() == Some("running"),
                })
            })
            .collect::<Vec<_>>();
        boxes.sort_by(|left, right| left.name.cmp(&right.name));
        self.emitter.debug(format!("found {} boxes", boxes.len()));
        Ok(boxes)
    }

    async fn delete(&self, names: &[String]) -> Result<Vec<String>> {
        let owned = self
            .list()
            .await?
            .into_iter()
            .map(|info| info.name)
            .collect::<Vec<_>>();
        let targets = if names.is_empty() {
            owned
        } else {
            names
                .iter()
                .filter(|name| owned.contains(name))
                .cloned()
                .collect()
        };

        let mut deleted = Vec::with_capacity(targets.len());
        for name in targets {
            self.docker
                .remove_container(
                    &name,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
                .with_context(|| format!("failed to remove container {name}"))?;
            self.emitter.info(format!("box {name} deleted"));
            deleted.push(name);
        }
        Ok(deleted)
    }
}

fn build_container_config(
    template: &BoxTemplate,
    ports: &[BoxPort],
    labels: BoxLabels,
    network: &str,
) -> Result<Config<String>> {
    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for port in ports {
        let key = format!("{}/tcp", port.remote);
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(port.local.to_string()),
            }]),
        );
    }
    let env = template
        .env_pairs()?
        .into_iter()
        .map(|env| format!("{}={}", env.key, env.value))
        .collect::<Vec<_>>();

    Ok(Config {
        image: Some(template.image_name()),
        env: Some(env),
        tty: Some(true),
        open_stdin: Some(true),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        labels: Some(labels.into_map().into_iter().collect()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: Some(network.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn container_labels(inspected: &ContainerInspectResponse) -> BoxLabels {
    inspected
        .config
        .as_ref()
        .and_then(|config| config.labels.as_ref())
        .map(|labels| BoxLabels::from_map(labels.iter()))
        .unwrap_or_default()
}

/// The box name of a container created by hck, or `None` for any other
/// container the daemon knows.
fn owned_box_name(inspected: &ContainerInspectResponse) -> Option<String> {
    let name = inspected
        .name
        .as_deref()?
        .trim_start_matches('/')
        .to_string();
    (is_box_name(&name) && !container_labels(inspected).is_empty()).then_some(name)
}

fn container_details(inspected: &ContainerInspectResponse, network: &str) -> Result<BoxDetails> {
    let raw_name = inspected.name.as_deref().unwrap_or_default();
    let name = owned_box_name(inspected)
        .ok_or_else(|| BoxError::not_found(raw_name.trim_start_matches('/')))?;
    let labels = container_labels(inspected);
    let healthy = inspected
        .state
        .as_ref()
        .and_then(|state| state.running)
        .unwrap_or(false);
    let ip = inspected
        .network_settings
        .as_ref()
        .and_then(|settings| settings.networks.as_ref())
        .and_then(|networks| networks.get(network))
        .and_then(|endpoint| endpoint.ip_address.clone())
        .unwrap_or_default();
    let env = inspected
        .config
        .as_ref()
        .and_then(|config| config.env.as_ref())
        .map(|env| {
            env.iter()
                .filter_map(|raw| raw.split_once('='))
                .map(|(key, value)| BoxEnv {
                    key: key.to_string(),
                    value: value.to_string(),
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let created = inspected
        .created
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|created| created.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(BoxDetails {
        info: BoxInfo {
            id: inspected.id.clone().unwrap_or_default(),
            name,
            healthy,
        },
        template: labels.template_source()?,
        provider: ProviderInfo::Docker {
            network: network.to_string(),
            ip,
        },
        size: labels.size()?,
        env,
        ports: labels.ports()?,
        created,
    })
}
