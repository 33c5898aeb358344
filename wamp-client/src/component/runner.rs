use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use log::{
    debug,
    error,
    info,
    warn,
};
use tokio::{
    runtime::Handle,
    sync::{
        broadcast,
        watch,
    },
    task::JoinHandle,
};

use crate::{
    component::component::{
        Component,
        ConnectDetails,
        SessionContext,
    },
    core::error::AuthenticationRefused,
    peer::{
        ConnectorFactory,
        LeaveDetails,
        Peer,
        PeerConfig,
        SessionDetails,
        WebSocketConnectorFactory,
    },
};

/// How long the router may take to confirm a GOODBYE before the connection is dropped anyway.
const LEAVE_TIMEOUT: Duration = Duration::from_secs(5);

/// When a [`Runner`] connects again after a session ends.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Connect again after the connection is lost or the session ends.
    ///
    /// Never applies to cancellation or refused authentication.
    pub auto_reconnect: bool,
    /// The maximum consecutive connect or join failures to tolerate before giving up.
    ///
    /// `None` retries indefinitely.
    pub max_consecutive_failures: Option<u32>,
    /// The delay before connecting again.
    ///
    /// Doubles with each consecutive failure, up to `max_reconnect_delay`.
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl ReconnectPolicy {
    /// The delay before the next attempt, after the given number of consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.reconnect_delay
            .saturating_mul(factor)
            .min(self.max_reconnect_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            auto_reconnect: false,
            max_consecutive_failures: Some(3),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

/// Configuration for a [`Runner`].
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Router URL, like `ws://localhost:8080/ws`.
    pub url: String,
    pub realm: String,
    pub peer: PeerConfig,
    pub reconnect: ReconnectPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws".to_owned(),
            realm: "realm1".to_owned(),
            peer: PeerConfig::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// A handle to a started [`Runner`].
pub struct RunnerHandle {
    peer: Arc<Peer>,
    join_handle: JoinHandle<Result<()>>,
    cancel_tx: watch::Sender<bool>,
}

impl RunnerHandle {
    /// The peer driven by the runner.
    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// Leaves the realm, disconnects, and stops reconnecting.
    ///
    /// Cancellation is asynchronous. Use [`Self::join`] to wait for the runner to stop.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    /// Waits for the runner to stop.
    ///
    /// Fails with the error that stopped the runner, if any.
    pub async fn join(&mut self) -> Result<()> {
        (&mut self.join_handle).await.map_err(Error::new)?
    }
}

enum CycleEnd {
    /// The session was joined at some point, and is over now.
    Ended,
    Canceled,
}

/// Drives a [`Component`] through the session lifecycle, reconnecting according to its
/// [`ReconnectPolicy`].
pub struct Runner<C> {
    config: RunnerConfig,
    component: Arc<C>,
    peer: Arc<Peer>,
    runtime: Handle,
}

impl<C> Runner<C>
where
    C: Component,
{
    /// Creates a runner whose peer connects using the connector factory.
    ///
    /// Every task of the runner and its peer runs on the given runtime.
    pub fn new(
        config: RunnerConfig,
        component: C,
        connector_factory: Box<dyn ConnectorFactory>,
        runtime: Handle,
    ) -> Result<Self> {
        let peer = Peer::new(config.peer.clone(), connector_factory, runtime.clone())?;
        Ok(Self {
            config,
            component: Arc::new(component),
            peer: Arc::new(peer),
            runtime,
        })
    }

    /// Creates a runner that connects over WebSocket.
    pub fn new_web_socket(config: RunnerConfig, component: C, runtime: Handle) -> Result<Self> {
        Self::new(
            config,
            component,
            Box::new(WebSocketConnectorFactory::default()),
            runtime,
        )
    }

    /// Starts the runner asynchronously.
    pub fn start(self) -> RunnerHandle {
        let peer = self.peer.clone();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let runtime = self.runtime.clone();
        let join_handle = runtime.spawn(self.run(cancel_rx));
        RunnerHandle {
            peer,
            join_handle,
            cancel_tx,
        }
    }

    async fn run(self, mut cancel_rx: watch::Receiver<bool>) -> Result<()> {
        let policy = &self.config.reconnect;
        let mut failures = 0;
        loop {
            match self.cycle(&mut cancel_rx).await {
                Ok(CycleEnd::Canceled) => {
                    info!("Runner for {} canceled", self.config.url);
                    return Ok(());
                }
                Ok(CycleEnd::Ended) => {
                    failures = 0;
                    if !policy.auto_reconnect {
                        return Ok(());
                    }
                }
                Err(err) => {
                    error!("Failed to establish session with {}: {err:#}", self.config.url);
                    if err.is::<AuthenticationRefused>() || !policy.auto_reconnect {
                        return Err(err);
                    }
                    failures += 1;
                    if policy
                        .max_consecutive_failures
                        .is_some_and(|max| failures >= max)
                    {
                        return Err(err.context(format!(
                            "failed to establish session after {failures} attempts"
                        )));
                    }
                }
            }

            let delay = policy.delay(failures);
            debug!("Runner reconnecting to {} in {delay:?}", self.config.url);
            tokio::select! {
                _ = tokio::time::sleep(delay) => (),
                _ = cancel_rx.wait_for(|canceled| *canceled) => return Ok(()),
            }
        }
    }

    /// Runs through one connection, from connect to disconnect.
    ///
    /// Fails only if the session could not be established.
    async fn cycle(&self, cancel_rx: &mut watch::Receiver<bool>) -> Result<CycleEnd> {
        if *cancel_rx.borrow() {
            return Ok(CycleEnd::Canceled);
        }

        self.peer.connect(&self.config.url).await?;
        self.component
            .on_connect(&ConnectDetails {
                url: self.config.url.clone(),
                realm: self.config.realm.clone(),
                extra: self.config.peer.extra.clone(),
            })
            .await;

        // Subscribe before joining, so that the end of the session cannot be missed.
        let mut session_finished_rx = self.peer.session_finished_rx();
        let joined = tokio::select! {
            result = self.peer.join_realm(&self.config.realm) => Some(result),
            _ = cancel_rx.wait_for(|canceled| *canceled) => None,
        };
        let details = match joined {
            Some(Ok(details)) => details,
            Some(Err(err)) => {
                self.disconnect().await;
                return Err(err);
            }
            None => {
                self.disconnect().await;
                return Ok(CycleEnd::Canceled);
            }
        };

        let end = self.joined(details, cancel_rx, &mut session_finished_rx).await;
        self.disconnect().await;
        Ok(end)
    }

    async fn joined(
        &self,
        details: SessionDetails,
        cancel_rx: &mut watch::Receiver<bool>,
        session_finished_rx: &mut broadcast::Receiver<LeaveDetails>,
    ) -> CycleEnd {
        let context = SessionContext::new(self.peer.clone(), details);
        let (end, leave_details) = tokio::select! {
            result = self.component.on_join(context) => {
                match result {
                    Ok(()) => info!("Component finished"),
                    Err(err) => error!("Component failed: {err:#}"),
                }
                (CycleEnd::Ended, None)
            }
            details = session_finished_rx.recv() => (CycleEnd::Ended, details.ok()),
            _ = cancel_rx.wait_for(|canceled| *canceled) => (CycleEnd::Canceled, None),
        };

        let leave_details = match leave_details {
            Some(details) => Some(details),
            None => {
                match tokio::time::timeout(LEAVE_TIMEOUT, self.peer.leave_realm()).await {
                    Ok(Ok(_)) => (),
                    Ok(Err(err)) => debug!("Session ended before leaving: {err:#}"),
                    Err(_) => {
                        warn!("Router did not confirm leaving, disconnecting");
                        self.peer.disconnect().await.ok();
                    }
                }
                // Every joined session reports how it ended, however it ended.
                session_finished_rx.recv().await.ok()
            }
        };
        if let Some(details) = leave_details {
            info!("Router session closed: {} {}", details.reason, details.message);
            self.component.on_leave(&details).await;
        }
        end
    }

    async fn disconnect(&self) {
        if let Err(err) = self.peer.disconnect().await {
            warn!("Failed to disconnect cleanly: {err:#}");
        }
        info!("Router connection closed");
        self.component.on_disconnect().await;
    }
}

#[cfg(test)]
mod runner_test {
    use std::time::Duration;

    use crate::component::runner::ReconnectPolicy;

    #[test]
    fn backs_off_exponentially_up_to_limit() {
        let policy = ReconnectPolicy {
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(5), Duration::from_secs(10));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(10));
    }
}
