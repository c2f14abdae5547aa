//! ---
//! upw_section: "02-messaging-ipc-data-model"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Version source and notification seams with channel and in-memory impls."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
//! Query and notification seams consumed by the reconciler and the change
//! listener, with the channel-backed and in-memory implementations.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;
use upwatch_common::{AvailableVersion, InstalledService};
use upwatch_versioning::latest_published;

use crate::client::{EventSubscription, InventoryClient};
use crate::protocol::ChannelEvent;
use crate::{InventoryError, Result};

/// Read-only view of the local service inventory.
#[async_trait]
pub trait VersionSource: Send + Sync {
    /// Installed services with their installed versions. An error means the
    /// inventory is unavailable as a whole.
    async fn list_installed(&self) -> Result<Vec<InstalledService>>;

    /// Latest published version of `service`, `None` when nothing usable is
    /// published.
    async fn latest_available(&self, service: &str) -> Result<Option<AvailableVersion>>;
}

/// A live stream of change events.
#[async_trait]
pub trait Subscription: Send {
    /// Next event; `Ok(None)` when the stream ended.
    async fn next_event(&mut self) -> Result<Option<ChannelEvent>>;
}

/// Something a change listener can subscribe to.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Open a new subscription.
    async fn subscribe(&self) -> Result<Box<dyn Subscription>>;
}

#[async_trait]
impl Subscription for EventSubscription {
    async fn next_event(&mut self) -> Result<Option<ChannelEvent>> {
        EventSubscription::next_event(self).await
    }
}

#[async_trait]
impl NotificationChannel for InventoryClient {
    async fn subscribe(&self) -> Result<Box<dyn Subscription>> {
        let subscription = InventoryClient::subscribe(self).await?;
        Ok(Box::new(subscription))
    }
}

fn pick_latest(service: &str, published: &[String]) -> Option<AvailableVersion> {
    let outcome = latest_published(published);
    for rejected in &outcome.rejected {
        warn!(service, error = %rejected, "skipping unparsable published version");
    }
    outcome
        .latest
        .map(|version| AvailableVersion::new(service, version))
}

/// [`VersionSource`] backed by the local channel.
#[derive(Debug, Clone)]
pub struct ChannelVersionSource {
    client: InventoryClient,
}

impl ChannelVersionSource {
    /// Wrap a channel client.
    pub fn new(client: InventoryClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VersionSource for ChannelVersionSource {
    async fn list_installed(&self) -> Result<Vec<InstalledService>> {
        self.client.installed_services().await
    }

    async fn latest_available(&self, service: &str) -> Result<Option<AvailableVersion>> {
        let published = self.client.service_versions(service).await?;
        Ok(pick_latest(service, &published))
    }
}

#[derive(Debug, Default)]
struct StaticState {
    installed: Mutex<BTreeMap<String, String>>,
    published: Mutex<BTreeMap<String, Vec<String>>>,
    failing_feeds: Mutex<BTreeSet<String>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ChannelEvent>>>,
    unavailable: AtomicBool,
    refuse_subscriptions: AtomicBool,
    list_calls: AtomicUsize,
}

/// In-process inventory. Serves the same contracts as the channel without a
/// socket; used by tests.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    state: Arc<StaticState>,
}

impl StaticInventory {
    /// Empty inventory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or update a service.
    pub fn install(&self, service: impl Into<String>, version: impl Into<String>) {
        self.state
            .installed
            .lock()
            .insert(service.into(), version.into());
    }

    /// Uninstall a service.
    pub fn uninstall(&self, service: &str) {
        self.state.installed.lock().remove(service);
    }

    /// Replace the published version list of a service.
    pub fn publish<S: AsRef<str>>(&self, service: impl Into<String>, versions: &[S]) {
        let versions = versions.iter().map(|v| v.as_ref().to_owned()).collect();
        self.state.published.lock().insert(service.into(), versions);
    }

    /// Make every `list_installed` call fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the feed query of one service fail until cleared.
    pub fn set_feed_failing(&self, service: &str, failing: bool) {
        let mut feeds = self.state.failing_feeds.lock();
        if failing {
            feeds.insert(service.to_owned());
        } else {
            feeds.remove(service);
        }
    }

    /// Make new subscriptions fail until cleared.
    pub fn set_refuse_subscriptions(&self, refuse: bool) {
        self.state
            .refuse_subscriptions
            .store(refuse, Ordering::SeqCst);
    }

    /// Deliver `event` to every open subscription; returns how many received it.
    pub fn emit(&self, event: ChannelEvent) -> usize {
        let mut subscribers = self.state.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    /// End every open subscription.
    pub fn disconnect_subscribers(&self) {
        self.state.subscribers.lock().clear();
    }

    /// Number of open subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.state.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    /// How many times `list_installed` was called.
    pub fn list_calls(&self) -> usize {
        self.state.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VersionSource for StaticInventory {
    async fn list_installed(&self) -> Result<Vec<InstalledService>> {
        self.state.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(InventoryError::Protocol("inventory marked unavailable".into()));
        }
        Ok(self
            .state
            .installed
            .lock()
            .iter()
            .map(|(name, version)| InstalledService::new(name.clone(), version.clone()))
            .collect())
    }

    async fn latest_available(&self, service: &str) -> Result<Option<AvailableVersion>> {
        if self.state.failing_feeds.lock().contains(service) {
            return Err(InventoryError::Rejected {
                command: "get_service_versions".into(),
                message: format!("feed for {} unavailable", service),
            });
        }
        let published = self
            .state
            .published
            .lock()
            .get(service)
            .cloned()
            .unwrap_or_default();
        Ok(pick_latest(service, &published))
    }
}

struct StaticSubscription {
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
}

#[async_trait]
impl Subscription for StaticSubscription {
    async fn next_event(&mut self) -> Result<Option<ChannelEvent>> {
        Ok(self.rx.recv().await)
    }
}

#[async_trait]
impl NotificationChannel for StaticInventory {
    async fn subscribe(&self) -> Result<Box<dyn Subscription>> {
        if self.state.refuse_subscriptions.load(Ordering::SeqCst) {
            return Err(InventoryError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "subscriptions refused",
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.subscribers.lock().push(tx);
        Ok(Box::new(StaticSubscription { rx }))
    }
}
