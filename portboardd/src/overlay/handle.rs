use std::sync::Arc;
use std::thread;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use shared::types::{OverlayConfig, OverlayHost, OverlayService, OverlayValue};
use super::store::{OverlayError, OverlayStore};

/// Commands sent to the overlay thread
pub enum OverlayCommand {
    ObserveHost {
        address: String,
        at: DateTime<Utc>,
        reply: oneshot::Sender<OverlayHost>,
    },
    ObserveService {
        address: String,
        port: u16,
        at: DateTime<Utc>,
        reply: oneshot::Sender<OverlayService>,
    },
    SetField {
        address: String,
        port: Option<u16>,
        key: String,
        value: OverlayValue,
        reply: oneshot::Sender<Result<(), OverlayError>>,
    },
    Persist(oneshot::Sender<Result<(), OverlayError>>),
    Shutdown,
}

/// Handle to the overlay store.
///
/// One thread owns the store and applies commands in arrival order, so
/// create-if-absent and every other mutation are serialized. User writes are
/// published to readers immediately; bookkeeping stamps are published on the
/// next persist.
#[derive(Clone)]
pub struct OverlayHandle {
    tx: mpsc::Sender<OverlayCommand>,
    published: watch::Receiver<Arc<OverlayConfig>>,
}

impl OverlayHandle {
    /// Spawn the overlay thread around a loaded store
    pub fn spawn(mut store: OverlayStore) -> Self {
        let (tx, mut rx) = mpsc::channel::<OverlayCommand>(256);
        let (published_tx, published) = watch::channel(Arc::new(store.config().clone()));

        let publish = |store: &OverlayStore, published_tx: &watch::Sender<Arc<OverlayConfig>>| {
            published_tx.send_replace(Arc::new(store.config().clone()));
        };

        thread::spawn(move || {
            // stamps applied since the last publish
            let mut dirty = false;
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    OverlayCommand::ObserveHost { address, at, reply } => {
                        let host = store.observe_host(&address, at);
                        dirty = true;
                        let _ = reply.send(host);
                    }
                    OverlayCommand::ObserveService { address, port, at, reply } => {
                        let service = store.observe_service(&address, port, at);
                        dirty = true;
                        let _ = reply.send(service);
                    }
                    OverlayCommand::SetField { address, port, key, value, reply } => {
                        let result = store.set_field(&address, port, &key, value);
                        if !matches!(result, Err(OverlayError::ReservedField(_))) {
                            publish(&store, &published_tx);
                            dirty = false;
                        }
                        let _ = reply.send(result);
                    }
                    OverlayCommand::Persist(reply) => {
                        if dirty {
                            publish(&store, &published_tx);
                            dirty = false;
                        }
                        let _ = reply.send(store.persist());
                    }
                    OverlayCommand::Shutdown => {
                        tracing::info!("Overlay thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx, published }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> OverlayCommand,
    ) -> Result<T, OverlayError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| OverlayError::Closed)?;
        rx.await.map_err(|_| OverlayError::Closed)
    }

    /// Latest overlay document; never blocks on the overlay thread
    pub fn current(&self) -> Arc<OverlayConfig> {
        self.published.borrow().clone()
    }

    /// Stamp first/last seen on a host, creating it if needed.
    /// Readers see the stamp after the next `persist`.
    pub async fn observe_host(&self, address: String, at: DateTime<Utc>) -> Result<OverlayHost, OverlayError> {
        self.request(|reply| OverlayCommand::ObserveHost { address, at, reply }).await
    }

    /// Stamp first/last seen on a service, creating it if needed
    pub async fn observe_service(
        &self,
        address: String,
        port: u16,
        at: DateTime<Utc>,
    ) -> Result<OverlayService, OverlayError> {
        self.request(|reply| OverlayCommand::ObserveService { address, port, at, reply }).await
    }

    /// Set a user field and persist before returning
    pub async fn set_field(
        &self,
        address: String,
        port: Option<u16>,
        key: String,
        value: OverlayValue,
    ) -> Result<(), OverlayError> {
        self.request(|reply| OverlayCommand::SetField { address, port, key, value, reply })
            .await?
    }

    /// Publish pending stamps and write the document
    pub async fn persist(&self) -> Result<(), OverlayError> {
        self.request(OverlayCommand::Persist).await?
    }

    /// Shutdown the overlay thread
    pub async fn shutdown(&self) -> Result<(), OverlayError> {
        self.tx.send(OverlayCommand::Shutdown).await.map_err(|_| OverlayError::Closed)
    }
}
