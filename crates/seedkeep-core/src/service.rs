//! Transfer service - owns the background tasks and bridges the manager to a
//! frontend over async channels

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::db::{Database, SettingsDb};
use crate::engine::ProtocolEngine;
use crate::engine_adapter::{Manager, RestoreReport, TorrentManager};
use crate::error::{Error, ErrorKind, Result};
use crate::network_policy::{InterfaceProbe, NetworkPolicyGate, SystemInterfaceProbe};
use crate::reconciler::ProgressReconciler;
use crate::types::{ContentId, Settings, Transfer};

/// Everything the components share, passed explicitly at construction
pub struct ServiceContext {
    pub db: Database,
    pub settings: Settings,
    pub gate: Arc<NetworkPolicyGate>,
    pub shutdown: CancellationToken,
}

impl ServiceContext {
    pub fn new(db: Database, settings: Settings, gate: Arc<NetworkPolicyGate>) -> Arc<Self> {
        Arc::new(Self {
            db,
            settings,
            gate,
            shutdown: CancellationToken::new(),
        })
    }

    /// Load settings from the database and build the gate around `probe`
    pub fn load(db: Database, probe: Arc<dyn InterfaceProbe>) -> Result<Arc<Self>> {
        let settings = SettingsDb::load(&db)?;
        let gate = Arc::new(NetworkPolicyGate::new(
            settings.network_policy.clone(),
            probe,
        ));
        Ok(Self::new(db, settings, gate))
    }

    /// Same as [`ServiceContext::load`] with the operating system probe
    pub fn load_with_system_probe(db: Database) -> Result<Arc<Self>> {
        Self::load(db, Arc::new(SystemInterfaceProbe))
    }
}

/// Commands sent from a frontend to the service
#[derive(Debug, Clone)]
pub enum ServiceCommand {
    AddTorrent(Vec<u8>),
    AddMagnet(String),
    Start(ContentId),
    Stop(ContentId),
    Remove(ContentId),
    /// Request the current transfer list
    Refresh,
    Shutdown,
}

/// Messages sent from the service to a frontend
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// Startup recovery finished
    Ready(RestoreReport),
    Added(Transfer),
    Updated(Transfer),
    Removed(ContentId),
    /// Periodic or requested full listing
    Snapshot(Vec<Transfer>),
    Error { kind: ErrorKind, message: String },
}

/// Owns the manager and the background loops
pub struct TransferService {
    ctx: Arc<ServiceContext>,
    manager: TorrentManager,
    restore: RestoreReport,
    tasks: Vec<JoinHandle<()>>,
}

impl TransferService {
    /// Build the registry and manager, restore persisted transfers and start
    /// the gate and reconciler loops. Must be called inside a tokio runtime.
    pub async fn start(ctx: Arc<ServiceContext>, engine: Arc<dyn ProtocolEngine>) -> Self {
        let registry = ctx.settings.registry_strategy.build();
        let manager = TorrentManager::new(engine, registry, ctx.clone());

        if let Err(e) = std::fs::create_dir_all(&ctx.settings.download_path) {
            log::warn!(
                "Failed to create download directory {}: {}",
                ctx.settings.download_path,
                e
            );
        }

        let restore = manager.restore_transfers().await;

        let mut tasks = Vec::new();

        let gate = ctx.gate.clone();
        let token = ctx.shutdown.clone();
        let interval = seconds(ctx.settings.policy_check_interval_secs);
        tasks.push(tokio::spawn(async move { gate.run(token, interval).await }));

        let reconciler = ProgressReconciler::new(manager.clone(), ctx.db.clone());
        let token = ctx.shutdown.clone();
        let interval = seconds(ctx.settings.reconcile_interval_secs);
        tasks.push(tokio::spawn(async move { reconciler.run(token, interval).await }));

        log::info!(
            "Transfer service started with {:?} registry",
            ctx.settings.registry_strategy
        );

        Self {
            ctx,
            manager,
            restore,
            tasks,
        }
    }

    /// Get a clone of the manager
    pub fn manager(&self) -> TorrentManager {
        self.manager.clone()
    }

    pub fn restore_report(&self) -> RestoreReport {
        self.restore
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }

    /// Serve commands from `cmd_receiver` and push events, including a
    /// periodic snapshot, to `event_sender` until shutdown
    pub fn spawn(
        &mut self,
        event_sender: async_channel::Sender<ServiceEvent>,
        cmd_receiver: async_channel::Receiver<ServiceCommand>,
    ) {
        let manager = self.manager.clone();
        let token = self.ctx.shutdown.clone();
        let restore = self.restore;
        let interval = seconds(self.ctx.settings.snapshot_interval_secs);

        self.tasks.push(tokio::spawn(async move {
            let _ = event_sender.send(ServiceEvent::Ready(restore)).await;

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,

                    cmd_result = cmd_receiver.recv() => {
                        match cmd_result {
                            Ok(ServiceCommand::Shutdown) => {
                                log::info!("Transfer service shutting down");
                                token.cancel();
                                break;
                            }
                            Ok(cmd) => {
                                // Commands run on their own task; a pending
                                // magnet must not stall the loop.
                                let manager = manager.clone();
                                let sender = event_sender.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_command(&manager, &sender, cmd).await {
                                        log::warn!("Failed to deliver service event: {}", e);
                                    }
                                });
                            }
                            Err(_) => {
                                log::warn!("Command channel closed");
                                break;
                            }
                        }
                    }

                    _ = ticker.tick() => {
                        let transfers = manager.list_torrents();
                        if event_sender.send(ServiceEvent::Snapshot(transfers)).await.is_err() {
                            log::warn!("Event channel closed");
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Cancel every background task and wait for them to finish
    pub async fn shutdown(self) {
        self.ctx.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                log::error!("Background task failed: {}", e);
            }
        }
        log::info!("Transfer service stopped");
    }
}

fn seconds(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}

async fn send_error(sender: &async_channel::Sender<ServiceEvent>, e: Error) -> Result<()> {
    sender
        .send(ServiceEvent::Error {
            kind: e.kind(),
            message: e.to_string(),
        })
        .await?;
    Ok(())
}

/// Handle a command from the frontend. Fails only when the event channel is
/// closed.
async fn handle_command(
    manager: &TorrentManager,
    sender: &async_channel::Sender<ServiceEvent>,
    cmd: ServiceCommand,
) -> Result<()> {
    match cmd {
        ServiceCommand::AddTorrent(data) => match manager.add_torrent(&data).await {
            Ok(id) => send_added(manager, sender, &id).await,
            Err(e) => send_error(sender, e).await,
        },

        ServiceCommand::AddMagnet(uri) => match manager.add_magnet(&uri).await {
            Ok(id) => send_added(manager, sender, &id).await,
            Err(e) => send_error(sender, e).await,
        },

        ServiceCommand::Start(id) => match manager.start_torrent(&id).await {
            Ok(()) => send_updated(manager, sender, &id).await,
            Err(e) => send_error(sender, e).await,
        },

        ServiceCommand::Stop(id) => match manager.stop_torrent(&id).await {
            Ok(()) => send_updated(manager, sender, &id).await,
            Err(e) => send_error(sender, e).await,
        },

        ServiceCommand::Remove(id) => match manager.remove_torrent(&id).await {
            Ok(()) => {
                sender.send(ServiceEvent::Removed(id)).await?;
                Ok(())
            }
            Err(e) => send_error(sender, e).await,
        },

        ServiceCommand::Refresh => {
            sender
                .send(ServiceEvent::Snapshot(manager.list_torrents()))
                .await?;
            Ok(())
        }

        // Handled in the main loop
        ServiceCommand::Shutdown => Ok(()),
    }
}

async fn send_added(
    manager: &TorrentManager,
    sender: &async_channel::Sender<ServiceEvent>,
    id: &ContentId,
) -> Result<()> {
    if let Ok(transfer) = manager.get_torrent(id) {
        sender.send(ServiceEvent::Added(transfer)).await?;
    }
    Ok(())
}

async fn send_updated(
    manager: &TorrentManager,
    sender: &async_channel::Sender<ServiceEvent>,
    id: &ContentId,
) -> Result<()> {
    if let Ok(transfer) = manager.get_torrent(id) {
        sender.send(ServiceEvent::Updated(transfer)).await?;
    }
    Ok(())
}
