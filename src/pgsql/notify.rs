//! LISTEN/NOTIFY support
//!
//! The coordinator announces state changes on the `state` channel and
//! human oriented messages on the `log` channel. Events are only hints: the
//! keeper reacts to any of them by running its next cycle early.

use crate::common::{Error, Result};
use crate::keeper::state::NodeState;
use crate::pgsql::connection::ConnectionHandle;
use postgres_protocol::escape::escape_identifier;
use std::time::Duration;
use tracing::{debug, error, info};

pub const STATE_CHANNEL: &str = "state";
pub const LOG_CHANNEL: &str = "log";

/// Parsed payload of a `state` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChangeHint {
    pub reported: NodeState,
    pub assigned: NodeState,
    pub formation: String,
    pub group_id: i32,
    pub node_id: i64,
    pub host: String,
    pub port: u16,
}

impl StateChangeHint {
    /// Parse `S:<reported>:<assigned>:<formation>.<group>:<node_id>:<host>:<port>`.
    ///
    /// The host may itself contain colons (IPv6), so the port is taken from
    /// the end of the payload.
    pub fn parse(payload: &str) -> Option<Self> {
        let rest = payload.strip_prefix("S:")?;
        let mut fields = rest.splitn(5, ':');
        let reported = fields.next()?.parse().ok()?;
        let assigned = fields.next()?.parse().ok()?;
        let (formation, group) = fields.next()?.rsplit_once('.')?;
        let node_id = fields.next()?.parse().ok()?;
        let (host, port) = fields.next()?.rsplit_once(':')?;

        Some(Self {
            reported,
            assigned,
            formation: formation.to_string(),
            group_id: group.parse().ok()?,
            node_id,
            host: host.to_string(),
            port: port.parse().ok()?,
        })
    }
}

/// A notification, decoded according to its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    StateChange(StateChangeHint),
    Log(String),
    /// Payload that could not be decoded, or an unknown channel
    Other { channel: String, payload: String },
}

impl Event {
    pub fn decode(channel: &str, payload: &str) -> Self {
        match channel {
            STATE_CHANNEL => match StateChangeHint::parse(payload) {
                Some(hint) => Event::StateChange(hint),
                None => Event::Other {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                },
            },
            LOG_CHANNEL => Event::Log(payload.to_string()),
            _ => Event::Other {
                channel: channel.to_string(),
                payload: payload.to_string(),
            },
        }
    }
}

impl ConnectionHandle {
    /// `LISTEN` on every channel, stopping at the first failure. On failure
    /// the connection is closed so no partial subscription survives.
    pub async fn listen(&mut self, channels: &[String]) -> Result<()> {
        for channel in channels {
            let sql = format!("LISTEN {}", escape_identifier(channel));
            if let Err(e) = self.execute(&sql, &[]).await {
                error!("Failed to LISTEN \"{}\": {}", channel, e);
                self.close();
                return Err(e);
            }
        }
        Ok(())
    }
}

/// A connection dedicated to receiving notifications.
#[derive(Debug)]
pub struct Subscription {
    handle: ConnectionHandle,
    channels: Vec<String>,
}

impl Subscription {
    /// Subscribe `handle` to `channels`, all or nothing.
    pub async fn subscribe(handle: ConnectionHandle, channels: &[&str]) -> Result<Self> {
        let mut subscription = Self::new(handle, channels);
        subscription.handle.listen(&subscription.channels).await?;
        debug!("Listening for notifications on {:?}", subscription.channels);
        Ok(subscription)
    }

    /// A subscription that is not listening yet; see [`Self::resubscribe`].
    pub fn new(handle: ConnectionHandle, channels: &[&str]) -> Self {
        Self {
            handle,
            channels: channels.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    /// Reconnect and listen again after the connection was lost.
    pub async fn resubscribe(&mut self) -> Result<()> {
        self.handle.close();
        self.handle.listen(&self.channels).await
    }

    /// Wait up to `timeout` for the next event. `Ok(None)` on timeout.
    pub async fn wait_for_event(&mut self, timeout: Duration) -> Result<Option<Event>> {
        if !self.handle.is_open() {
            return Err(Error::Unreachable(format!(
                "notification connection to \"{}\" is closed",
                self.handle.conninfo()
            )));
        }

        let notification = match self.handle.next_notification(timeout).await? {
            Some(notification) => notification,
            None => return Ok(None),
        };

        let event = Event::decode(&notification.channel, &notification.payload);
        match &event {
            Event::Log(message) => info!("{}", message),
            Event::StateChange(hint) => debug!(
                "Node {} ({}:{}) reported \"{}\", assigned \"{}\"",
                hint.node_id, hint.host, hint.port, hint.reported, hint.assigned
            ),
            Event::Other { channel, payload } => {
                debug!("Notification on \"{}\": {}", channel, payload)
            }
        }
        Ok(Some(event))
    }

    /// Consume every notification already queued, without waiting.
    /// Returns how many were dropped.
    pub async fn drain_pending(&mut self) -> Result<usize> {
        let mut drained = 0;
        while self.wait_for_event(Duration::ZERO).await?.is_some() {
            drained += 1;
        }
        Ok(drained)
    }

    pub fn close(&mut self) {
        self.handle.close();
    }
}
