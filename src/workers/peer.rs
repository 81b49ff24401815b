//! A named peer: one session wired to the local relay, its dispatcher and
//! its relay pump.

use crate::core::config::TransferConfig;
use crate::core::connection::{ConnectionState, TransportFactory};
use crate::core::events::AppEvent;
use crate::core::protocol::ReceivedFile;
use crate::core::session::Session;
use crate::utils::sos::SignalOfStop;
use crate::workers::relay::{spawn_pump, LocalRelay};
use anyhow::{anyhow, bail, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct PeerNode {
    pub name: String,
    pub session: Session,
    events: mpsc::UnboundedReceiver<AppEvent>,
    relay: LocalRelay,
    stop: SignalOfStop,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerNode {
    /// Join `relay` as `name` and start the session's background tasks.
    pub async fn start(
        name: &str,
        config: TransferConfig,
        factory: Arc<dyn TransportFactory>,
        relay: &LocalRelay,
    ) -> Result<Self> {
        let (endpoint, inbox) = relay.join(name).await;
        let (session, driver, events) = Session::with_relay(config, factory, Arc::new(endpoint))?;
        let stop = SignalOfStop::new();
        let tasks = vec![
            tokio::spawn(driver.run()),
            spawn_pump(session.clone(), inbox, stop.clone()),
        ];
        info!(event = "peer_started", peer = %name, "Peer started");
        Ok(Self {
            name: name.to_string(),
            session,
            events,
            relay: relay.clone(),
            stop,
            tasks,
        })
    }

    async fn next_event(&mut self) -> Result<AppEvent> {
        self.events
            .recv()
            .await
            .ok_or_else(|| anyhow!("{}: event stream ended", self.name))
    }

    /// Wait until the data channel to `peer_id` is open.
    pub async fn wait_channel_open(&mut self, peer_id: &str) -> Result<()> {
        loop {
            match self.next_event().await? {
                AppEvent::ChannelOpened { peer_id: p } if p == peer_id => {
                    info!(event = "channel_ready", peer = %self.name, remote = %peer_id);
                    return Ok(());
                }
                AppEvent::PeerStateChanged { peer_id: p, state }
                    if p == peer_id
                        && matches!(state, ConnectionState::Disconnected | ConnectionState::Closed) =>
                {
                    bail!("{}: connection to {peer_id} went {state} before the channel opened", self.name);
                }
                other => self.log_event(&other),
            }
        }
    }

    /// Wait until `file_id` from `peer_id` has been fully received.
    pub async fn wait_file(&mut self, peer_id: &str, file_id: &str) -> Result<ReceivedFile> {
        loop {
            match self.next_event().await? {
                AppEvent::FileReceived { peer_id: p, file } if p == peer_id && file.file_id == file_id => {
                    return Ok(file);
                }
                AppEvent::TransferAborted {
                    peer_id: p,
                    file_id: f,
                    reason,
                    ..
                } if p == peer_id && f == file_id => {
                    bail!("{}: transfer {file_id} from {peer_id} aborted: {reason}", self.name);
                }
                AppEvent::ChannelClosed { peer_id: p } if p == peer_id => {
                    bail!("{}: channel to {peer_id} closed before {file_id} arrived", self.name);
                }
                other => self.log_event(&other),
            }
        }
    }

    fn log_event(&self, event: &AppEvent) {
        match event {
            AppEvent::IncomingFile {
                peer_id,
                file_name,
                file_size,
                ..
            } => info!(
                event = "incoming_file",
                peer = %self.name,
                from = %peer_id,
                file = %file_name,
                size = file_size,
                "Receiving file"
            ),
            AppEvent::Progress {
                direction,
                file_id,
                percent,
                ..
            } => debug!(
                event = "progress",
                peer = %self.name,
                direction = ?direction,
                file_id = %file_id,
                percent = %format_args!("{percent:.1}"),
            ),
            AppEvent::Error { peer_id, message } => warn!(
                event = "peer_error",
                peer = %self.name,
                remote = %peer_id,
                message = %message,
            ),
            other => debug!(event = "app_event", peer = %self.name, ?other),
        }
    }

    /// Close every connection, leave the relay and stop background tasks.
    pub async fn shutdown(self) {
        self.session.shutdown().await;
        self.stop.cancel();
        self.relay.leave(&self.name).await;
        for task in self.tasks {
            let _ = task.await;
        }
        info!(event = "peer_stopped", peer = %self.name, "Peer stopped");
    }
}
