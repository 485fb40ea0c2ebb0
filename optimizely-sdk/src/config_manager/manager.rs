use futures::StreamExt;
use parking_lot::RwLock;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};

use super::requester::DatafileRequesterError;
use super::requester_builders::DatafileRequesterFactory;
use crate::notification::{Notification, NotificationCenter, ProjectConfigUpdateNotification};
use crate::project_config::{ConfigError, ProjectConfig};

/// Trait for the component that owns the current [ProjectConfig]. The built-in implementations
/// are a static manager fed once from a datafile, and a polling manager refreshing from the CDN.
pub trait ProjectConfigManager: Send + Sync {
    /// Returns the current snapshot without blocking on I/O. Fails with [ConfigError::NotReady]
    /// until a datafile has been loaded.
    fn get_config(&self) -> Result<Arc<ProjectConfig>, ConfigError>;

    /// Starts background work, if any. `init_complete` is called once with whether a datafile
    /// became available.
    fn subscribe(
        &self,
        init_complete: Arc<dyn Fn(bool) + Send + Sync>,
        shutdown_receiver: broadcast::Receiver<()>,
    );
}

pub struct StaticConfigManager {
    config: Arc<ProjectConfig>,
}

impl StaticConfigManager {
    pub fn new(datafile: &[u8]) -> Result<Self, ConfigError> {
        Ok(Self {
            config: Arc::new(ProjectConfig::from_datafile(datafile)?),
        })
    }
}

impl ProjectConfigManager for StaticConfigManager {
    fn get_config(&self) -> Result<Arc<ProjectConfig>, ConfigError> {
        Ok(self.config.clone())
    }

    fn subscribe(
        &self,
        init_complete: Arc<dyn Fn(bool) + Send + Sync>,
        _shutdown_receiver: broadcast::Receiver<()>,
    ) {
        init_complete(true);
    }
}

/// Holds the current snapshot and publishes revision changes.
#[derive(Clone)]
struct ConfigCell {
    current: Arc<RwLock<Option<Arc<ProjectConfig>>>>,
    notification_center: Arc<NotificationCenter>,
}

impl ConfigCell {
    /// Parses `datafile` and makes it current when its revision differs from the held one.
    /// Returns whether the snapshot changed.
    fn update(&self, datafile: &[u8]) -> Result<bool, ConfigError> {
        let config = Arc::new(ProjectConfig::from_datafile(datafile)?);
        let revision = config.revision().to_string();

        {
            let mut current = self.current.write();
            if let Some(existing) = current.as_ref() {
                if existing.revision() == revision {
                    return Ok(false);
                }
            }
            *current = Some(config);
        }

        info!("Project config updated to revision {}", revision);
        self.notification_center
            .send(Notification::ProjectConfigUpdate(
                ProjectConfigUpdateNotification { revision },
            ));
        Ok(true)
    }

    fn get(&self) -> Result<Arc<ProjectConfig>, ConfigError> {
        self.current.read().clone().ok_or(ConfigError::NotReady)
    }

    fn is_loaded(&self) -> bool {
        self.current.read().is_some()
    }
}

pub struct PollingConfigManager {
    requester_factory: Arc<Mutex<Box<dyn DatafileRequesterFactory>>>,
    url: String,
    access_token: Option<String>,
    poll_interval: Duration,
    cell: ConfigCell,
}

impl PollingConfigManager {
    pub fn new(
        requester_factory: Arc<Mutex<Box<dyn DatafileRequesterFactory>>>,
        url: String,
        access_token: Option<String>,
        poll_interval: Duration,
        notification_center: Arc<NotificationCenter>,
    ) -> Self {
        Self {
            requester_factory,
            url,
            access_token,
            poll_interval,
            cell: ConfigCell {
                current: Arc::new(RwLock::new(None)),
                notification_center,
            },
        }
    }

    /// Seeds the manager with a bootstrap datafile so decisions are available before the first
    /// poll completes.
    pub fn with_datafile(self, datafile: &[u8]) -> Result<Self, ConfigError> {
        self.cell.update(datafile)?;
        Ok(self)
    }
}

impl ProjectConfigManager for PollingConfigManager {
    fn get_config(&self) -> Result<Arc<ProjectConfig>, ConfigError> {
        self.cell.get()
    }

    fn subscribe(
        &self,
        init_complete: Arc<dyn Fn(bool) + Send + Sync>,
        shutdown_receiver: broadcast::Receiver<()>,
    ) {
        let mut requester = match self.requester_factory.lock() {
            Ok(factory) => match factory.build(&self.url, self.access_token.clone()) {
                Ok(requester) => requester,
                Err(e) => {
                    error!("{:?}", e);
                    init_complete(self.cell.is_loaded());
                    return;
                }
            },
            Err(e) => {
                error!("{:?}", e);
                init_complete(self.cell.is_loaded());
                return;
            }
        };

        let notify_init = Arc::new(Once::new());
        if self.cell.is_loaded() {
            notify_init.call_once(|| init_complete(true));
        }

        let cell = self.cell.clone();
        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            let mut interval = IntervalStream::new(time::interval(poll_interval)).fuse();

            let shutdown_stream = BroadcastStream::new(shutdown_receiver);
            let mut shutdown_future = shutdown_stream.into_future();

            loop {
                futures::select! {
                    _ = interval.next() => {
                        match requester.get_datafile().await {
                            Ok(Some(datafile)) => match cell.update(&datafile) {
                                Ok(_) => notify_init.call_once(|| init_complete(true)),
                                Err(e) => error!("Keeping the current datafile: {}", e),
                            },
                            Ok(None) => debug!("datafile unchanged"),
                            Err(DatafileRequesterError::Temporary) => {
                                warn!("datafile requester has returned a temporary failure");
                            }
                            Err(DatafileRequesterError::Permanent) => {
                                error!(
                                    "datafile requester has returned a permanent failure; will retry on the next interval"
                                );
                                notify_init.call_once(|| init_complete(false));
                            }
                        };
                    },
                    _ = shutdown_future => break
                };
            }
        });
    }
}

#[cfg(test)]
pub(crate) struct MockConfigManager {
    current: RwLock<Option<Arc<ProjectConfig>>>,
}

#[cfg(test)]
impl MockConfigManager {
    pub fn new(config: Option<Arc<ProjectConfig>>) -> Self {
        Self {
            current: RwLock::new(config),
        }
    }

    pub fn set_config(&self, config: Arc<ProjectConfig>) {
        self.current.write().replace(config);
    }
}

#[cfg(test)]
impl ProjectConfigManager for MockConfigManager {
    fn get_config(&self) -> Result<Arc<ProjectConfig>, ConfigError> {
        self.current.read().clone().ok_or(ConfigError::NotReady)
    }

    fn subscribe(
        &self,
        init_complete: Arc<dyn Fn(bool) + Send + Sync>,
        _shutdown_receiver: broadcast::Receiver<()>,
    ) {
        init_complete(self.current.read().is_some());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_manager::requester_builders::HyperDatafileRequesterBuilder;
    use crate::notification::NotificationType;
    use crate::test_common::{s1_datafile_with_revision, DATAFILE_S1};
    use crossbeam_channel::{bounded, unbounded};

    fn polling_manager(url: String, center: Arc<NotificationCenter>) -> PollingConfigManager {
        PollingConfigManager::new(
            Arc::new(Mutex::new(Box::new(HyperDatafileRequesterBuilder::new()))),
            url,
            None,
            Duration::from_millis(100),
            center,
        )
    }

    #[test]
    fn static_manager_serves_datafile() {
        let manager = StaticConfigManager::new(DATAFILE_S1.as_bytes()).unwrap();
        assert_eq!("1", manager.get_config().unwrap().revision());
    }

    #[test]
    fn static_manager_rejects_invalid_datafile() {
        assert!(matches!(
            StaticConfigManager::new(b"not json"),
            Err(ConfigError::InvalidDatafile(_))
        ));
    }

    #[test]
    fn polling_manager_is_not_ready_before_first_load() {
        let manager = polling_manager(
            "http://localhost/datafile.json".into(),
            Arc::new(NotificationCenter::new()),
        );
        assert!(matches!(manager.get_config(), Err(ConfigError::NotReady)));
    }

    #[test]
    fn same_revision_does_not_notify() {
        let center = Arc::new(NotificationCenter::new());
        let (tx, rx) = unbounded();
        center.add_handler(NotificationType::ProjectConfigUpdate, move |n| {
            tx.send(n.clone()).unwrap();
        });
        let manager = polling_manager("http://localhost/datafile.json".into(), center)
            .with_datafile(DATAFILE_S1.as_bytes())
            .unwrap();

        assert_eq!(Ok(false), manager.cell.update(DATAFILE_S1.as_bytes()));
        assert_eq!(
            Ok(true),
            manager
                .cell
                .update(s1_datafile_with_revision("2").as_bytes())
        );
        assert!(manager.cell.update(b"{").is_err());

        let revisions = rx
            .try_iter()
            .filter_map(|n| match n {
                Notification::ProjectConfigUpdate(update) => Some(update.revision),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(vec!["1", "2"], revisions);
        assert_eq!("2", manager.get_config().unwrap().revision());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn polling_manager_picks_up_new_revisions() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/datafiles/key.json")
            .with_status(200)
            .with_body(s1_datafile_with_revision("7"))
            .create_async()
            .await;

        let center = Arc::new(NotificationCenter::new());
        let (seen_tx, seen_rx) = unbounded();
        let manager = Arc::new(polling_manager(
            format!("{}/datafiles/key.json", server.url()),
            center.clone(),
        ));
        let observer = manager.clone();
        center.add_handler(NotificationType::ProjectConfigUpdate, move |_| {
            // The snapshot is already current when the notification fires.
            let revision = observer.get_config().map(|c| c.revision().to_string());
            seen_tx.send(revision).unwrap();
        });

        let (init_tx, init_rx) = bounded(1);
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        manager.subscribe(
            Arc::new(move |success| {
                let _ = init_tx.try_send(success);
            }),
            shutdown_tx.subscribe(),
        );

        let init = tokio::task::spawn_blocking(move || init_rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(Ok(true), init);
        assert_eq!(Ok(Ok("7".to_string())), seen_rx.recv_timeout(Duration::from_secs(5)));
        assert_eq!("7", manager.get_config().unwrap().revision());

        shutdown_tx.send(()).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn permanent_failure_reports_failed_init() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/datafiles/key.json")
            .with_status(403)
            .create_async()
            .await;

        let manager = polling_manager(
            format!("{}/datafiles/key.json", server.url()),
            Arc::new(NotificationCenter::new()),
        );
        let (init_tx, init_rx) = bounded(1);
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        manager.subscribe(
            Arc::new(move |success| {
                let _ = init_tx.try_send(success);
            }),
            shutdown_tx.subscribe(),
        );

        let init = tokio::task::spawn_blocking(move || init_rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(Ok(false), init);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn polling_continues_after_permanent_failure() {
        let mut server = mockito::Server::new_async().await;
        let not_found = server
            .mock("GET", "/datafiles/key.json")
            .with_status(404)
            .create_async()
            .await;

        let center = Arc::new(NotificationCenter::new());
        let (updated_tx, updated_rx) = unbounded();
        center.add_handler(NotificationType::ProjectConfigUpdate, move |_| {
            let _ = updated_tx.send(());
        });
        let manager = polling_manager(format!("{}/datafiles/key.json", server.url()), center);
        let (init_tx, init_rx) = bounded(1);
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        manager.subscribe(
            Arc::new(move |success| {
                let _ = init_tx.try_send(success);
            }),
            shutdown_tx.subscribe(),
        );

        let init = tokio::task::spawn_blocking(move || init_rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(Ok(false), init);
        assert!(manager.get_config().is_err());

        not_found.remove_async().await;
        server
            .mock("GET", "/datafiles/key.json")
            .with_status(200)
            .with_body(s1_datafile_with_revision("5"))
            .create_async()
            .await;

        let updated =
            tokio::task::spawn_blocking(move || updated_rx.recv_timeout(Duration::from_secs(5)))
                .await
                .unwrap();
        assert!(updated.is_ok());
        assert_eq!("5", manager.get_config().unwrap().revision());

        shutdown_tx.send(()).unwrap();
    }
}
