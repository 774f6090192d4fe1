use crate::client::{BoxClient, ConnectOptions, CreateOptions, new_box_client};
use crate::config::HckConfig;
use crate::error::{BoxError, is_not_found};
use crate::event::{Emitter, EventBus};
use crate::model::{AttachMode, BoxDetails, BoxInfo, BoxLifetime, BoxProvider};
use crate::session::BoxStreams;
use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Builds one client per provider on demand.
#[async_trait]
pub trait BoxClientFactory: Send + Sync {
    async fn client(&self, provider: BoxProvider) -> Result<Box<dyn BoxClient>>;
}

pub struct ConfigClientFactory {
    config: HckConfig,
    events: Arc<EventBus>,
}

impl ConfigClientFactory {
    pub fn new(config: HckConfig, events: Arc<EventBus>) -> Self {
        Self { config, events }
    }
}

#[async_trait]
impl BoxClientFactory for ConfigClientFactory {
    async fn client(&self, provider: BoxProvider) -> Result<Box<dyn BoxClient>> {
        new_box_client(provider, &self.config, self.events.clone()).await
    }
}

/// Result of one provider in a fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderReport<T> {
    pub provider: BoxProvider,
    pub value: T,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteReport {
    pub deleted: Vec<ProviderReport<Vec<String>>>,
    pub missing: Vec<String>,
}

impl DeleteReport {
    fn record(&mut self, provider: BoxProvider, names: Vec<String>) {
        match self
            .deleted
            .iter_mut()
            .find(|report| report.provider == provider)
        {
            Some(report) => report.value.extend(names),
            None => self.deleted.push(ProviderReport {
                provider,
                value: names,
            }),
        }
    }
}

/// Tries every provider in order until `operation` succeeds on one of them.
/// Misses are logged and skipped; when no provider handles `name` the
/// outcome is `BoxError::NotFound`.
pub async fn attempt_run_box_clients<T, F, Fut>(
    factory: &dyn BoxClientFactory,
    name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(Box<dyn BoxClient>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for provider in BoxProvider::ALL {
        let client = match factory.client(provider).await {
            Ok(client) => client,
            Err(error) => {
                warn!(%provider, "provider unavailable: {error:#}");
                continue;
            }
        };
        match operation(client).await {
            Ok(value) => {
                debug!(%provider, box_name = name, "box found");
                return Ok(value);
            }
            Err(error) => warn!(%provider, box_name = name, "box not handled: {error:#}"),
        }
    }
    Err(BoxError::not_found(name).into())
}

pub struct BoxOrchestrator {
    factory: Box<dyn BoxClientFactory>,
}

impl BoxOrchestrator {
    pub fn new(factory: Box<dyn BoxClientFactory>) -> Self {
        Self { factory }
    }

    pub async fn create(&self, provider: BoxProvider, opts: CreateOptions) -> Result<BoxInfo> {
        let client = self.factory.client(provider).await?;
        client.create(opts).await
    }

    /// Creates a box and attaches to it; the box is removed when the session
    /// ends.
    pub async fn open(
        &self,
        provider: BoxProvider,
        opts: CreateOptions,
        streams: BoxStreams,
        mode: AttachMode,
        interrupt: CancellationToken,
    ) -> Result<()> {
        let client = self.factory.client(provider).await?;
        let info = client.create(opts).await?;
        client
            .connect(ConnectOptions {
                name: info.name,
                streams,
                mode,
                lifetime: BoxLifetime::Ephemeral,
                interrupt,
            })
            .await
    }

    pub async fn connect(
        &self,
        provider: Option<BoxProvider>,
        name: &str,
        streams: BoxStreams,
        mode: AttachMode,
        interrupt: CancellationToken,
    ) -> Result<()> {
        let client = match provider {
            Some(provider) => self.factory.client(provider).await?,
            None => {
                attempt_run_box_clients(self.factory.as_ref(), name, |client| async move {
                    client.describe(name).await?;
                    anyhow::Ok(client)
                })
                .await?
            }
        };
        Emitter::new(client.events(), "orchestrator")
            .debug(format!("connecting to {name} on {}", client.provider()));
        client
            .connect(ConnectOptions {
                name: name.to_string(),
                streams,
                mode,
                lifetime: BoxLifetime::Persistent,
                interrupt,
            })
            .await
    }

    pub async fn describe(&self, provider: Option<BoxProvider>, name: &str) -> Result<BoxDetails> {
        match provider {
            Some(provider) => self.factory.client(provider).await?.describe(name).await,
            None => {
                attempt_run_box_clients(self.factory.as_ref(), name, |client| async move {
                    client.describe(name).await
                })
                .await
            }
        }
    }

    /// Lists one provider, or every provider when none is given. A failing
    /// provider is skipped in the fan-out.
    pub async fn list(
        &self,
        provider: Option<BoxProvider>,
    ) -> Result<Vec<ProviderReport<Vec<BoxInfo>>>> {
        if let Some(provider) = provider {
            return Ok(vec![self.list_provider(provider).await?]);
        }

        let mut reports = Vec::with_capacity(BoxProvider::ALL.len());
        for provider in BoxProvider::ALL {
            match self.list_provider(provider).await {
                Ok(report) => reports.push(report),
                Err(error) => warn!(%provider, "list skipped: {error:#}"),
            }
        }
        Ok(reports)
    }

    async fn list_provider(&self, provider: BoxProvider) -> Result<ProviderReport<Vec<BoxInfo>>> {
        let boxes = self.factory.client(provider).await?.list().await?;
        Ok(ProviderReport {
            provider,
            value: boxes,
        })
    }

    /// With `all` every box of the selected providers is removed. Otherwise
    /// each name goes to the given provider or is discovered on its own.
    pub async fn delete(
        &self,
        provider: Option<BoxProvider>,
        names: &[String],
        all: bool,
    ) -> Result<DeleteReport> {
        let mut report = DeleteReport::default();

        if all {
            let providers = provider.map_or_else(|| BoxProvider::ALL.to_vec(), |p| vec![p]);
            let fan_out = provider.is_none();
            for provider in providers {
                let deleted = match self.factory.client(provider).await {
                    Ok(client) => client.delete(&[]).await,
                    Err(error) => Err(error),
                };
                match deleted {
                    Ok(deleted) => report.record(provider, deleted),
                    Err(error) if fan_out => warn!(%provider, "delete skipped: {error:#}"),
                    Err(error) => return Err(error),
                }
            }
            return Ok(report);
        }

        if let Some(provider) = provider {
            let client = self.factory.client(provider).await?;
            let deleted = client.delete(names).await?;
            report.missing = names
                .iter()
                .filter(|name| !deleted.contains(name))
                .cloned()
                .collect();
            report.record(provider, deleted);
            return Ok(report);
        }

        for name in names {
            let found = attempt_run_box_clients(self.factory.as_ref(), name, |client| async move {
                let deleted = client.delete(std::slice::from_ref(name)).await?;
                if deleted.is_empty() {
                    return Err(BoxError::not_found(name.as_str()).into());
                }
                anyhow::Ok((client.provider(), deleted))
            })
            .await;
            match found {
                Ok((provider, deleted)) => report.record(provider, deleted),
                Err(error) if is_not_found(&error) => report.missing.push(name.clone()),
                Err(error) => return Err(error),
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::{BoxClientFactory, BoxOrchestrator, attempt_run_box_clients};
    use crate::client::{BoxClient, ConnectOptions, CreateOptions};
    use crate::error::{BoxError, is_not_found};
    use crate::event::EventBus;
    use crate::model::{
        BoxDetails, BoxInfo, BoxProvider, ProviderInfo, ResourceSize, TemplateSource,
    };
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Per-provider box names and call counters shared with the test.
    #[derive(Default)]
    struct Fleet {
        boxes: Mutex<HashMap<BoxProvider, Vec<String>>>,
        calls: Mutex<HashMap<BoxProvider, usize>>,
        broken: Mutex<Vec<BoxProvider>>,
    }

    impl Fleet {
        fn with(entries: &[(BoxProvider, &str)]) -> Arc<Self> {
            let fleet = Self::default();
            {
                let mut boxes = fleet.boxes.lock().unwrap();
                for (provider, name) in entries {
                    boxes.entry(*provider).or_default().push(name.to_string());
                }
            }
            Arc::new(fleet)
        }

        fn calls(&self, provider: BoxProvider) -> usize {
            self.calls.lock().unwrap().get(&provider).copied().unwrap_or(0)
        }

        fn touch(&self, provider: BoxProvider) -> Result<()> {
            *self.calls.lock().unwrap().entry(provider).or_default() += 1;
            if self.broken.lock().unwrap().contains(&provider) {
                anyhow::bail!("{provider} backend unreachable");
            }
            Ok(())
        }
    }

    struct MockClient {
        provider: BoxProvider,
        fleet: Arc<Fleet>,
        events: Arc<EventBus>,
    }

    #[async_trait]
    impl BoxClient for MockClient {
        fn provider(&self) -> BoxProvider {
            self.provider
        }

        fn events(&self) -> Arc<EventBus> {
            self.events.clone()
        }

        async fn create(&self, opts: CreateOptions) -> Result<BoxInfo> {
            self.fleet.touch(self.provider)?;
            let name = format!("box-{}-aaaaa", opts.template.name);
            self.fleet
                .boxes
                .lock()
                .unwrap()
                .entry(self.provider)
                .or_default()
                .push(name.clone());
            Ok(BoxInfo {
                id: name.clone(),
                name,
                healthy: true,
            })
        }

        async fn connect(&self, _opts: ConnectOptions) -> Result<()> {
            self.fleet.touch(self.provider)
        }

        async fn describe(&self, name: &str) -> Result<BoxDetails> {
            self.fleet.touch(self.provider)?;
            let boxes = self.fleet.boxes.lock().unwrap();
            if !boxes
                .get(&self.provider)
                .is_some_and(|names| names.iter().any(|known| known == name))
            {
                return Err(BoxError::not_found(name).into());
            }
            Ok(BoxDetails {
                info: BoxInfo {
                    id: name.to_string(),
                    name: name.to_string(),
                    healthy: true,
                },
                template: TemplateSource::Local {
                    path: "/boxes/alpine.yml".to_string(),
                },
                provider: ProviderInfo::Cloud,
                size: ResourceSize::S,
                env: Vec::new(),
                ports: Vec::new(),
                created: Utc::now(),
            })
        }

        async fn list(&self) -> Result<Vec<BoxInfo>> {
            self.fleet.touch(self.provider)?;
            let boxes = self.fleet.boxes.lock().unwrap();
            Ok(boxes
                .get(&self.provider)
                .map(|names| {
                    names
                        .iter()
                        .map(|name| BoxInfo {
                            id: name.clone(),
                            name: name.clone(),
                            healthy: true,
                        })
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn delete(&self, names: &[String]) -> Result<Vec<String>> {
            self.fleet.touch(self.provider)?;
            let mut boxes = self.fleet.boxes.lock().unwrap();
            let owned = boxes.entry(self.provider).or_default();
            let deleted = if names.is_empty() {
                std::mem::take(owned)
            } else {
                let deleted = owned
                    .iter()
                    .filter(|name| names.contains(name))
                    .cloned()
                    .collect::<Vec<_>>();
                owned.retain(|name| !deleted.contains(name));
                deleted
            };
            Ok(deleted)
        }
    }

    struct MockFactory {
        fleet: Arc<Fleet>,
        events: Arc<EventBus>,
    }

    #[async_trait]
    impl BoxClientFactory for MockFactory {
        async fn client(&self, provider: BoxProvider) -> Result<Box<dyn BoxClient>> {
            Ok(Box::new(MockClient {
                provider,
                fleet: self.fleet.clone(),
                events: self.events.clone(),
            }))
        }
    }

    fn factory(fleet: &Arc<Fleet>) -> MockFactory {
        MockFactory {
            fleet: fleet.clone(),
            events: Arc::new(EventBus::new()),
        }
    }

    #[tokio::test]
    async fn discovery_stops_at_the_first_provider_that_knows_the_box() {
        let fleet = Fleet::with(&[(BoxProvider::Kube, "box-alpine-abcde")]);
        let factory = factory(&fleet);

        let provider = attempt_run_box_clients(&factory, "box-alpine-abcde", |client| async move {
            client.describe("box-alpine-abcde").await?;
            anyhow::Ok(client.provider())
        })
        .await
        .unwrap();

        assert_eq!(provider, BoxProvider::Kube);
        assert_eq!(fleet.calls(BoxProvider::Docker), 1);
        assert_eq!(fleet.calls(BoxProvider::Kube), 1);
        assert_eq!(fleet.calls(BoxProvider::Cloud), 0);
    }

    #[tokio::test]
    async fn discovery_miss_is_not_found_after_every_provider() {
        let fleet = Fleet::with(&[]);
        let factory = factory(&fleet);

        let error = attempt_run_box_clients(&factory, "box-ghost-zzzzz", |client| async move {
            client.describe("box-ghost-zzzzz").await
        })
        .await
        .unwrap_err();

        assert!(is_not_found(&error));
        assert_eq!(error.to_string(), "box not found: box-ghost-zzzzz");
        for provider in BoxProvider::ALL {
            assert_eq!(fleet.calls(provider), 1);
        }
    }

    #[tokio::test]
    async fn list_fan_out_skips_a_failing_provider() {
        let fleet = Fleet::with(&[
            (BoxProvider::Docker, "box-alpine-aaaaa"),
            (BoxProvider::Cloud, "box-parrot-bbbbb"),
        ]);
        fleet.broken.lock().unwrap().push(BoxProvider::Kube);
        let orchestrator = BoxOrchestrator::new(Box::new(factory(&fleet)));

        let reports = orchestrator.list(None).await.unwrap();
        let providers = reports.iter().map(|report| report.provider).collect::<Vec<_>>();
        assert_eq!(providers, vec![BoxProvider::Docker, BoxProvider::Cloud]);
        assert_eq!(reports[1].value[0].name, "box-parrot-bbbbb");
    }

    #[tokio::test]
    async fn explicit_provider_failure_is_surfaced() {
        let fleet = Fleet::with(&[]);
        fleet.broken.lock().unwrap().push(BoxProvider::Kube);
        let orchestrator = BoxOrchestrator::new(Box::new(factory(&fleet)));

        let error = orchestrator.list(Some(BoxProvider::Kube)).await.unwrap_err();
        assert!(error.to_string().contains("unreachable"));
    }

    #[tokio::test]
    async fn delete_by_name_discovers_each_provider() {
        let fleet = Fleet::with(&[
            (BoxProvider::Docker, "box-alpine-aaaaa"),
            (BoxProvider::Cloud, "box-parrot-bbbbb"),
        ]);
        let orchestrator = BoxOrchestrator::new(Box::new(factory(&fleet)));

        let names = vec![
            "box-parrot-bbbbb".to_string(),
            "box-ghost-zzzzz".to_string(),
        ];
        let report = orchestrator.delete(None, &names, false).await.unwrap();
        assert_eq!(report.deleted.len(), 1);
        assert_eq!(report.deleted[0].provider, BoxProvider::Cloud);
        assert_eq!(report.deleted[0].value, vec!["box-parrot-bbbbb".to_string()]);
        assert_eq!(report.missing, vec!["box-ghost-zzzzz".to_string()]);
    }

    #[tokio::test]
    async fn delete_all_fans_out_and_tolerates_failures() {
        let fleet = Fleet::with(&[
            (BoxProvider::Docker, "box-alpine-aaaaa"),
            (BoxProvider::Cloud, "box-parrot-bbbbb"),
        ]);
        fleet.broken.lock().unwrap().push(BoxProvider::Docker);
        let orchestrator = BoxOrchestrator::new(Box::new(factory(&fleet)));

        let report = orchestrator.delete(None, &[], true).await.unwrap();
        let providers = report
            .deleted
            .iter()
            .map(|report| report.provider)
            .collect::<Vec<_>>();
        assert_eq!(providers, vec![BoxProvider::Kube, BoxProvider::Cloud]);
        assert_eq!(report.deleted[1].value, vec!["box-parrot-bbbbb".to_string()]);
    }
}
