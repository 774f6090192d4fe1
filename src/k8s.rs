use crate::client::{BoxClient, ConnectOptions, CreateOptions, finish_session};
use crate::config::KubeConfig;
use crate::error::BoxError;
use crate::event::{Emitter, EventBus};
use crate::model::{
    BoxDetails, BoxEnv, BoxInfo, BoxLabels, BoxPort, BoxProvider, BoxTemplate, ProviderInfo,
    ResourceSize, generate_name,
};
use crate::session::{BoxReader, BoxStreams, pipe_session};
use crate::tunnel::{TunnelDialer, TunnelStream, attach_with_tunnels};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{SinkExt, TryStreamExt};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Namespace, Pod, PodSpec, PodTemplateSpec,
    ResourceRequirements, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{AttachParams, DeleteParams, ListParams, PostParams, TerminalSize};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, Config, ResourceExt};
use std::collections::BTreeMap;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SOURCE: &str = "kube";
const LABEL_NAME: &str = "app.kubernetes.io/name";
const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY: &str = "hck";
const DEFAULT_SHELL: &str = "/bin/bash";
const POD_READY_TIMEOUT: Duration = Duration::from_secs(300);

pub struct KubeBoxClient {
    client: Client,
    namespace: String,
    emitter: Emitter,
}

impl KubeBoxClient {
    pub async fn new(config: &KubeConfig, events: Arc<EventBus>) -> Result<Self> {
        let kube_config = match &config.config_path {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .context("failed to load Kubernetes configuration")?
            }
            None => Config::infer()
                .await
                .context("failed to infer Kubernetes configuration")?,
        };
        let client = Client::try_from(kube_config).context("failed to initialize Kubernetes client")?;

        Ok(Self {
            client,
            namespace: config.namespace.clone(),
            emitter: Emitter::new(events, SOURCE),
        })
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn ensure_namespace(&self) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let existing = namespaces
            .get_opt(&self.namespace)
            .await
            .with_context(|| format!("failed to read namespace {}", self.namespace))?;
        if existing.is_some() {
            return Ok(());
        }

        self.emitter
            .debug(format!("creating namespace {}", self.namespace));
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(self.namespace.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        namespaces
            .create(&PostParams::default(), &namespace)
            .await
            .with_context(|| format!("failed to create namespace {}", self.namespace))?;
        Ok(())
    }

    async fn running_pod(&self, name: &str) -> Result<String> {
        let selector = format!("{LABEL_NAME}={name}");
        let pods = self.pods();
        let listed = pods
            .list(&ListParams::default().labels(&selector))
            .await
            .with_context(|| format!("failed to list pods of {name}"))?;
        if let Some(pod) = listed.items.into_iter().find(is_pod_running) {
            return Ok(pod.name_any());
        }

        self.emitter.loader(format!("waiting for {name} to be running"));
        tokio::time::timeout(POD_READY_TIMEOUT, watch_until_running(pods, &selector, name))
            .await
            .with_context(|| format!("timed out waiting for {name} to be running"))?
    }

    async fn exec_shell(
        &self,
        pod: &str,
        shell: &str,
        streams: BoxStreams,
        interrupt: &CancellationToken,
    ) -> Result<()> {
        let params = if streams.is_tty {
            AttachParams::interactive_tty()
        } else {
            AttachParams::default().stdin(true).stdout(true).stderr(true)
        };
        let mut attached = self
            .pods()
            .exec(pod, vec![shell.to_string()], &params)
            .await
            .with_context(|| format!("failed to exec into pod {pod}"))?;

        let stdin = attached.stdin().context("exec stdin is not attached")?;
        let stdout = attached.stdout().context("exec stdout is not attached")?;
        let stderr = attached
            .stderr()
            .map(|stderr| Box::new(stderr) as BoxReader);

        if let Some((width, height)) = streams.terminal_size()
            && let Some(mut sizes) = attached.terminal_size()
            && let Err(error) = sizes.send(TerminalSize { width, height }).await
        {
            self.emitter
                .warning(format!("failed to resize terminal: {error}"));
        }

        self.emitter.loader_stop();
        let session = pipe_session(streams, stdout, stdin, stderr, interrupt).await;
        attached.abort();
        session
    }
}

#[async_trait]
impl BoxClient for KubeBoxClient {
    fn provider(&self) -> BoxProvider {
        BoxProvider::Kube
    }

    fn events(&self) -> Arc<EventBus> {
        self.emitter.bus().clone()
    }

    async fn create(&self, opts: CreateOptions) -> Result<BoxInfo> {
        let template = &opts.template;
        let name = generate_name(&template.name);
        self.ensure_namespace().await?;

        let ports = template.network_ports(false)?;
        let labels = BoxLabels::new(&opts.source, opts.size)
            .with_shell(&template.shell)
            .with_ports(&ports);

        self.emitter.loader(format!("creating box {name}"));
        let deployment = build_deployment(&name, &self.namespace, template, &ports, labels, opts.size)?;
        let created = self
            .deployments()
            .create(&PostParams::default(), &deployment)
            .await
            .with_context(|| format!("failed to create deployment {name}"))?;

        if let Some(service) = build_service(&name, &self.namespace, &ports) {
            self.services()
                .create(&PostParams::default(), &service)
                .await
                .with_context(|| format!("failed to create service {name}"))?;
        }

        self.running_pod(&name).await?;
        self.emitter.loader_stop();
        self.emitter
            .info(format!("box {name} created in namespace {}", self.namespace));

        Ok(BoxInfo {
            id: created.uid().unwrap_or_default(),
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
        let deployment = self
            .deployments()
            .get(&name)
            .await
            .with_context(|| format!("failed to read deployment {name}"))?;
        let shell = deployment_labels(&deployment)
            .shell()
            .unwrap_or(DEFAULT_SHELL)
            .to_string();

        self.emitter.loader(format!("connecting to {name}"));
        let session = match self.running_pod(&name).await {
            Ok(pod) => {
                let dialer = Arc::new(KubePortDialer {
                    pods: self.pods(),
                    pod: pod.clone(),
                    emitter: self.emitter.clone(),
                });
                attach_with_tunnels(
                    mode,
                    &details.ports,
                    dialer,
                    &self.emitter,
                    &interrupt,
                    self.exec_shell(&pod, &shell, streams, &interrupt),
                )
                .await
            }
            Err(error) => Err(error),
        };

        finish_session(lifetime, session, self.delete(std::slice::from_ref(&name))).await
    }

    async fn describe(&self, name: &str) -> Result<BoxDetails> {
        let deployment = self
            .deployments()
            .get_opt(name)
            .await
            .with_context(|| format!("failed to read deployment {name}"))?
            .filter(is_managed)
            .ok_or_else(|| BoxError::not_found(name))?;
        deployment_details(&deployment, &self.namespace)
            .with_context(|| format!("failed to read details of deployment {name}"))
    }

    async fn list(&self) -> Result<Vec<BoxInfo>> {
        let selector = format!("{LABEL_MANAGED_BY}={MANAGED_BY}");
        let deployments = self
            .deployments()
            .list(&ListParams::default().labels(&selector))
            .await
            .with_context(|| format!("failed to list deployments in {}", self.namespace))?;

        let mut boxes = deployments
            .items
            .iter()
            .map(|deployment| BoxInfo {
                id: deployment.uid().unwrap_or_default(),
                name: deployment.name_any(),
                healthy: is_available(deployment),
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

        let services = self.services();
        let mut deleted = Vec::with_capacity(targets.len());
        for name in targets {
            self.deployments()
                .delete(&name, &DeleteParams::background())
                .await
                .with_context(|| format!("failed to delete deployment {name}"))?;
            if services
                .get_opt(&name)
                .await
                .with_context(|| format!("failed to read service {name}"))?
                .is_some()
            {
                services
                    .delete(&name, &DeleteParams::background())
                    .await
                    .with_context(|| format!("failed to delete service {name}"))?;
            }
            self.emitter.info(format!("box {name} deleted"));
            deleted.push(name);
        }
        Ok(deleted)
    }
}

async fn watch_until_running(pods: Api<Pod>, selector: &str, name: &str) -> Result<String> {
    let mut stream =
        pin!(watcher(pods, watcher::Config::default().labels(selector)).applied_objects());
    while let Some(pod) = stream
        .try_next()
        .await
        .with_context(|| format!("failed to watch pods of {name}"))?
    {
        if is_pod_running(&pod) {
            return Ok(pod.name_any());
        }
    }
    anyhow::bail!("pod watch of {name} ended before it was running")
}

/// Opens a fresh port-forward per accepted local connection.
struct KubePortDialer {
    pods: Api<Pod>,
    pod: String,
    emitter: Emitter,
}

#[async_trait]
impl TunnelDialer for KubePortDialer {
    async fn dial(&self, port: &BoxPort) -> Result<TunnelStream> {
        let mut forwarder = self
            .pods
            .portforward(&self.pod, &[port.remote])
            .await
            .with_context(|| format!("failed to port-forward {}:{}", self.pod, port.remote))?;
        let stream = forwarder
            .take_stream(port.remote)
            .with_context(|| format!("port-forward stream for {} is missing", port.remote))?;

        if let Some(failure) = forwarder.take_error(port.remote) {
            let emitter = self.emitter.clone();
            let alias = port.alias.clone();
            tokio::spawn(async move {
                if let Some(message) = failure.await {
                    emitter.error(format!("[{alias}] port-forward error: {message}"));
                }
            });
        }
        let emitter = self.emitter.clone();
        tokio::spawn(async move {
            if let Err(error) = forwarder.join().await {
                emitter.warning(format!("port-forward closed with error: {error}"));
            }
        });

        Ok(Box::new(stream))
    }
}

fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), name.to_string()),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
    ])
}

fn size_resources(size: ResourceSize) -> ResourceRequirements {
    let (cpu, memory) = size.resources();
    let quantities = BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity(memory.to_string())),
    ]);
    ResourceRequirements {
        limits: Some(quantities.clone()),
        requests: Some(quantities),
        ..Default::default()
    }
}

fn build_deployment(
    name: &str,
    namespace: &str,
    template: &BoxTemplate,
    ports: &[BoxPort],
    labels: BoxLabels,
    size: ResourceSize,
) -> Result<Deployment> {
    let selector = selector_labels(name);
    let env = template
        .env_pairs()?
        .into_iter()
        .map(|env| EnvVar {
            name: env.key,
            value: Some(env.value),
            ..Default::default()
        })
        .collect::<Vec<_>>();
    let container_ports = ports
        .iter()
        .map(|port| ContainerPort {
            container_port: i32::from(port.remote),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    let container = Container {
        name: template.name.clone(),
        image: Some(template.image_name()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        tty: Some(true),
        stdin: Some(true),
        env: Some(env),
        ports: Some(container_ports),
        resources: Some(size_resources(size)),
        ..Default::default()
    };

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(selector.clone()),
            annotations: Some(labels.into_map()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn build_service(name: &str, namespace: &str, ports: &[BoxPort]) -> Option<Service> {
    if ports.is_empty() {
        return None;
    }
    let service_ports = ports
        .iter()
        .map(|port| ServicePort {
            name: Some(port.alias.to_ascii_lowercase()),
            port: i32::from(port.remote),
            target_port: Some(IntOrString::Int(i32::from(port.remote))),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    Some(Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(selector_labels(name)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(name)),
            ports: Some(service_ports),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn is_managed(deployment: &Deployment) -> bool {
    deployment.labels().get(LABEL_MANAGED_BY).map(String::as_str) == Some(MANAGED_BY)
}

fn is_available(deployment: &Deployment) -> bool {
    deployment
        .status
        .as_ref()
        .and_then(|status| status.available_replicas)
        .unwrap_or(0)
        >= 1
}

fn is_pod_running(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && pod
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            == Some("Running")
}

fn deployment_labels(deployment: &Deployment) -> BoxLabels {
    BoxLabels::from_map(deployment.annotations().iter())
}

fn deployment_details(deployment: &Deployment, namespace: &str) -> Result<BoxDetails> {
    let labels = deployment_labels(deployment);
    let env = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .and_then(|spec| spec.containers.first())
        .and_then(|container| container.env.as_ref())
        .map(|env| {
            env.iter()
                .map(|var| BoxEnv {
                    key: var.name.clone(),
                    value: var.value.clone().unwrap_or_default(),
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let created = deployment
        .metadata
        .creation_timestamp
        .as_ref()
        .and_then(|time| DateTime::<Utc>::from_timestamp(time.0.as_second(), 0))
        .unwrap_or_else(Utc::now);

    Ok(BoxDetails {
        info: BoxInfo {
            id: deployment.uid().unwrap_or_default(),
            name: deployment.name_any(),
            healthy: is_available(deployment),
        },
        template: labels.template_source()?,
        provider: ProviderInfo::Kube {
            namespace: namespace.to_string(),
        },
        size: labels.size()?,
        env,
        ports: labels.ports()?,
        created,
    })
}
