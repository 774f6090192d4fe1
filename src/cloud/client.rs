use super::protocol::{
    BoxCreateRequestBody, BoxCreateResponseBody, BoxDeleteRequestBody, BoxDeleteResponseBody,
    BoxDescribeRequestBody, BoxDescribeResponseBody, BoxExecRequestBody, BoxListRequestBody,
    BoxListResponseBody, Message, Method, PingBody,
};
use super::transport::{CloudError, CloudTransport, SshTransport};
use crate::client::{BoxClient, ConnectOptions, CreateOptions, finish_session};
use crate::config::CloudConfig;
use crate::error::BoxError;
use crate::event::{Emitter, EventBus};
use crate::model::{
    AttachMode, BoxDetails, BoxEnv, BoxInfo, BoxPort, BoxProvider, ProviderInfo, TemplateSource,
    exist_resource_size,
};
use crate::session::{BoxStreams, pipe_session};
use crate::tunnel::{TunnelDialer, TunnelStream, attach_with_tunnels};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const SOURCE: &str = "cloud";

pub struct CloudBoxClient {
    transport: Arc<dyn CloudTransport>,
    origin: String,
    emitter: Emitter,
}

impl CloudBoxClient {
    pub fn new(config: &CloudConfig, events: Arc<EventBus>) -> Self {
        Self::with_transport(Arc::new(SshTransport::new(config)), events)
    }

    pub fn with_transport(transport: Arc<dyn CloudTransport>, events: Arc<EventBus>) -> Self {
        Self {
            transport,
            origin: format!("hck-v{}", env!("CARGO_PKG_VERSION")),
            emitter: Emitter::new(events, SOURCE),
        }
    }

    fn message<T>(&self, method: Method, body: T) -> Message<T>
    where
        T: Serialize + DeserializeOwned,
    {
        Message::new(self.origin.clone(), method, body)
    }

    async fn send<Req, Res>(&self, method: Method, body: Req) -> Result<Res>
    where
        Req: Serialize + DeserializeOwned + Send,
        Res: Serialize + DeserializeOwned,
    {
        let request = self.message(method, body);
        let protocol = request.protocol();
        self.emitter.debug(format!("sending {protocol}"));
        let raw = self.transport.request(&protocol, request.encode()?).await?;
        let reply = Message::<Res>::decode(&raw, method)?;
        Ok(reply.body)
    }

    async fn ping(&self) -> Result<()> {
        let reply: PingBody = self
            .send(Method::Ping, PingBody::ping())
            .await
            .context("cloud service did not answer ping")?;
        if reply != PingBody::pong() {
            anyhow::bail!("unexpected ping reply: {}", reply.value);
        }
        Ok(())
    }

    /// Validates the connection with a ping, runs `operation` and closes the
    /// connection whatever the outcome.
    async fn scoped<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let result = match self.ping().await {
            Ok(()) => operation.await,
            Err(error) => Err(error),
        };
        if let Err(error) = self.transport.close().await {
            self.emitter
                .warning(format!("failed to close cloud connection: {error:#}"));
        }
        result
    }

    async fn describe_box(&self, name: &str) -> Result<BoxDetails> {
        let body = BoxDescribeRequestBody {
            name: name.to_string(),
        };
        let reply = match self
            .send::<_, BoxDescribeResponseBody>(Method::BoxDescribe, body)
            .await
        {
            Ok(reply) => reply,
            Err(error)
                if matches!(
                    error.downcast_ref::<CloudError>(),
                    Some(CloudError::RequestRejected { .. })
                ) =>
            {
                self.emitter.debug(format!("describe {name} rejected: {error}"));
                return Err(BoxError::not_found(name).into());
            }
            Err(error) => return Err(error),
        };
        describe_details(reply)
    }

    async fn delete_boxes(&self, names: &[String]) -> Result<Vec<String>> {
        let reply: BoxDeleteResponseBody = self
            .send(
                Method::BoxDelete,
                BoxDeleteRequestBody {
                    names: names.to_vec(),
                },
            )
            .await
            .context("failed to delete cloud boxes")?;
        for name in &reply.names {
            self.emitter.info(format!("box {name} deleted"));
        }
        Ok(reply.names)
    }

    async fn exec_shell(
        &self,
        name: &str,
        streams: BoxStreams,
        interrupt: &CancellationToken,
    ) -> Result<()> {
        let request = self.message(
            Method::BoxExec,
            BoxExecRequestBody {
                name: name.to_string(),
            },
        );
        let session = self
            .transport
            .open_session(
                &request.protocol(),
                request.encode()?,
                streams.terminal_size(),
            )
            .await
            .with_context(|| format!("failed to open shell in {name}"))?;

        self.emitter.loader_stop();
        pipe_session(streams, session.reader, session.writer, None, interrupt).await
    }

    async fn connect_box(&self, opts: ConnectOptions) -> Result<()> {
        let ConnectOptions {
            name,
            streams,
            mode,
            lifetime,
            interrupt,
        } = opts;
        let details = self.describe_box(&name).await?;
        self.emitter.loader(format!("connecting to {name}"));

        let ports = tunnel_ports(&details.ports, mode);
        let dialer = Arc::new(CloudPortDialer {
            transport: self.transport.clone(),
            name: name.clone(),
        });
        let session = attach_with_tunnels(
            mode,
            &ports,
            dialer,
            &self.emitter,
            &interrupt,
            self.exec_shell(&name, streams, &interrupt),
        )
        .await;

        finish_session(lifetime, session, self.delete_boxes(std::slice::from_ref(&name))).await
    }
}

#[async_trait]
impl BoxClient for CloudBoxClient {
    fn provider(&self) -> BoxProvider {
        BoxProvider::Cloud
    }

    fn events(&self) -> Arc<EventBus> {
        self.emitter.bus().clone()
    }

    async fn create(&self, opts: CreateOptions) -> Result<BoxInfo> {
        self.scoped(async {
            self.emitter
                .loader(format!("creating box from {}", opts.template.name));
            let reply: BoxCreateResponseBody = self
                .send(
                    Method::BoxCreate,
                    BoxCreateRequestBody {
                        template_name: opts.template.name.clone(),
                        size: opts.size.as_str().to_string(),
                    },
                )
                .await
                .with_context(|| format!("failed to create box from {}", opts.template.name))?;
            self.emitter.loader_stop();
            self.emitter
                .info(format!("box {} created with size {}", reply.name, reply.size));
            Ok(BoxInfo {
                id: reply.name.clone(),
                name: reply.name,
                healthy: true,
            })
        })
        .await
    }

    async fn connect(&self, opts: ConnectOptions) -> Result<()> {
        self.scoped(self.connect_box(opts)).await
    }

    async fn describe(&self, name: &str) -> Result<BoxDetails> {
        self.scoped(self.describe_box(name)).await
    }

    async fn list(&self) -> Result<Vec<BoxInfo>> {
        self.scoped(async {
            let reply: BoxListResponseBody = self
                .send(Method::BoxList, BoxListRequestBody::default())
                .await
                .context("failed to list cloud boxes")?;
            let boxes = reply
                .items
                .into_iter()
                .map(|item| BoxInfo {
                    id: item.id,
                    name: item.name,
                    healthy: item.healthy,
                })
                .collect::<Vec<_>>();
            self.emitter.debug(format!("found {} boxes", boxes.len()));
            Ok(boxes)
        })
        .await
    }

    async fn delete(&self, names: &[String]) -> Result<Vec<String>> {
        self.scoped(self.delete_boxes(names)).await
    }
}

/// Forwards each local connection to `<box-name>:<remote-port>` on the
/// remote side.
struct CloudPortDialer {
    transport: Arc<dyn CloudTransport>,
    name: String,
}

#[async_trait]
impl TunnelDialer for CloudPortDialer {
    async fn dial(&self, port: &BoxPort) -> Result<TunnelStream> {
        self.transport.open_tunnel(&self.name, port.remote).await
    }
}

/// Virtual ports are served by the remote service and never tunneled.
fn tunnel_ports(ports: &[BoxPort], mode: AttachMode) -> Vec<BoxPort> {
    if !mode.wants_tunnel() {
        return Vec::new();
    }
    ports
        .iter()
        .filter(|port| !port.is_virtual())
        .cloned()
        .collect()
}

fn describe_details(reply: BoxDescribeResponseBody) -> Result<BoxDetails> {
    let created = DateTime::parse_from_rfc3339(&reply.created)
        .with_context(|| format!("invalid creation time {}", reply.created))?
        .with_timezone(&Utc);
    let env = reply
        .env
        .iter()
        .filter_map(|raw| raw.split_once('='))
        .map(|(key, value)| BoxEnv {
            key: key.to_string(),
            value: value.to_string(),
        })
        .collect();
    let ports = reply
        .ports
        .iter()
        .map(|raw| BoxPort::parse(raw))
        .collect::<Result<Vec<_>>>()?;

    Ok(BoxDetails {
        info: BoxInfo {
            id: reply.id,
            name: reply.name,
            healthy: reply.healthy,
        },
        template: TemplateSource::Git {
            url: reply.template.url,
            revision: reply.template.revision,
            commit: reply.template.commit,
            name: reply.template.name,
        },
        provider: ProviderInfo::Cloud,
        size: exist_resource_size(&reply.size)?,
        env,
        ports,
        created,
    })
}
