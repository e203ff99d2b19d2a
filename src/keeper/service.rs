//! Keeper main loop
//!
//! Runs one keeper cycle, then sleeps until either the loop interval
//! elapses or the coordinator sends a notification, whichever comes first.
//! A lost notification connection only degrades the loop to polling.

use crate::common::shutdown::{StopMode, StopSignal};
use crate::common::utils::format_duration;
use crate::common::{Error, Result};
use crate::keeper::agent::Keeper;
use crate::pgsql::notify::{Event, Subscription};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct KeeperService {
    keeper: Keeper,
    subscription: Option<Subscription>,
    loop_interval: Duration,
    stop: StopSignal,
}

impl KeeperService {
    pub fn new(
        keeper: Keeper,
        subscription: Option<Subscription>,
        loop_interval: Duration,
        stop: StopSignal,
    ) -> Self {
        Self {
            keeper,
            subscription,
            loop_interval,
            stop,
        }
    }

    pub fn keeper(&self) -> &Keeper {
        &self.keeper
    }

    pub fn into_keeper(self) -> Keeper {
        self.keeper
    }

    /// Loop until a stop is requested.
    pub async fn run(&mut self) -> Result<()> {
        self.keeper.load_state().await?;
        info!(
            "Keeper started in state \"{}\", looping every {}",
            self.keeper.node().reported,
            format_duration(self.loop_interval)
        );

        loop {
            if self.stop.is_stopped() {
                break;
            }

            match self.keeper.step().await {
                Ok(state) => debug!("Keeper cycle done in state \"{}\"", state),
                Err(Error::Cancelled) if self.stop.is_stopped() => break,
                Err(e) => warn!("Keeper cycle failed, retrying next cycle: {}", e),
            }

            if self.wait_for_next_cycle().await {
                break;
            }
        }

        match self.stop.mode() {
            StopMode::Fast => info!("Fast shutdown requested, stopping now"),
            _ => info!("Keeper stopped"),
        }
        self.shutdown();
        Ok(())
    }

    /// Sleep until the next cycle is due. Returns `true` on a stop request.
    async fn wait_for_next_cycle(&mut self) -> bool {
        let subscription = match self.subscription.as_mut() {
            Some(subscription) => subscription,
            None => return self.stop.wait_timeout(self.loop_interval).await,
        };

        if !subscription.is_open() {
            if let Err(e) = subscription.resubscribe().await {
                warn!("Failed to listen for notifications, polling instead: {}", e);
                return self.stop.wait_timeout(self.loop_interval).await;
            }
        }

        let stop = self.stop.clone();
        let event = tokio::select! {
            _ = stop.stopped() => return true,
            event = subscription.wait_for_event(self.loop_interval) => event,
        };

        match event {
            Ok(Some(event)) => {
                if let Event::StateChange(hint) = event {
                    debug!(
                        "Woken up by a state change of node {} to \"{}\"",
                        hint.node_id, hint.assigned
                    );
                }
                // a burst of notifications still runs a single cycle
                match subscription.drain_pending().await {
                    Ok(0) => {}
                    Ok(n) => debug!("Coalesced {} more notifications into this cycle", n),
                    Err(e) => warn!("Lost the notification connection: {}", e),
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Lost the notification connection: {}", e),
        }
        self.stop.is_stopped()
    }

    fn shutdown(&mut self) {
        if let Some(subscription) = self.subscription.as_mut() {
            subscription.close();
        }
        self.keeper.close();
    }
}
