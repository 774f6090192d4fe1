use crate::cloud::CloudBoxClient;
use crate::config::HckConfig;
use crate::docker::DockerBoxClient;
use crate::event::EventBus;
use crate::k8s::KubeBoxClient;
use crate::model::{
    AttachMode, BoxDetails, BoxInfo, BoxLifetime, BoxProvider, BoxTemplate, ResourceSize,
    TemplateSource,
};
use crate::session::BoxStreams;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub template: BoxTemplate,
    pub source: TemplateSource,
    pub size: ResourceSize,
}

#[derive(Debug)]
pub struct ConnectOptions {
    pub name: String,
    pub streams: BoxStreams,
    pub mode: AttachMode,
    pub lifetime: BoxLifetime,
    /// Cancelled once by the process-wide signal handler.
    pub interrupt: CancellationToken,
}

/// The lifecycle contract every backend implements on its own.
///
/// Implementations publish progress on [`BoxClient::events`] while an
/// operation is in flight. A client is meant for one command at a time.
#[async_trait]
pub trait BoxClient: Send + Sync {
    fn provider(&self) -> BoxProvider;

    fn events(&self) -> Arc<EventBus>;

    /// Always provisions a new box, never reuses an existing one.
    async fn create(&self, opts: CreateOptions) -> Result<BoxInfo>;

    /// Attaches a shell and/or tunnels. With an ephemeral lifetime the box is
    /// deleted on every exit path, interrupts included.
    async fn connect(&self, opts: ConnectOptions) -> Result<()>;

    /// Fails with `BoxError::NotFound` when this backend has no such box.
    async fn describe(&self, name: &str) -> Result<BoxDetails>;

    async fn list(&self) -> Result<Vec<BoxInfo>>;

    /// An empty slice deletes every box this backend manages. Names that
    /// are not owned here are skipped.
    async fn delete(&self, names: &[String]) -> Result<Vec<String>>;
}

pub async fn new_box_client(
    provider: BoxProvider,
    config: &HckConfig,
    events: Arc<EventBus>,
) -> Result<Box<dyn BoxClient>> {
    let client: Box<dyn BoxClient> = match provider {
        BoxProvider::Docker => Box::new(DockerBoxClient::new(&config.docker, events)?),
        BoxProvider::Kube => Box::new(KubeBoxClient::new(&config.kube, events).await?),
        BoxProvider::Cloud => Box::new(CloudBoxClient::new(&config.cloud, events)),
    };
    Ok(client)
}

/// Runs `cleanup` after `session` regardless of how the session ended, and
/// reports the session error first.
pub(crate) async fn finish_session(
    lifetime: BoxLifetime,
    session: Result<()>,
    cleanup: impl std::future::Future<Output = Result<Vec<String>>>,
) -> Result<()> {
    if lifetime == BoxLifetime::Persistent {
        return session;
    }
    let cleaned = cleanup.await;
    match (session, cleaned) {
        (Err(error), Err(cleanup_error)) => Err(error.context(format!(
            "ephemeral box cleanup also failed: {cleanup_error:#}"
        ))),
        (Err(error), _) => Err(error),
        (Ok(()), Err(error)) => Err(error.context("failed to delete ephemeral box")),
        (Ok(()), Ok(_)) => Ok(()),
    }
}
