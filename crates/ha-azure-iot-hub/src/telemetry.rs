//! Telemetry snapshots and delivery
//!
//! Every tick reads the monitored entities from the state store, encodes
//! the ones that exist as a single JSON object and sends it. A failed send
//! is retried over a fresh connection; after [`SEND_ATTEMPTS`] failures the
//! snapshot is dropped and the next tick starts over.

use std::sync::Arc;
use std::time::Duration;

use ha_core::Attributes;
use ha_state_store::{SharedStateStore, StateStore};
use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::client::{DeviceClient, Message};
use crate::error::{IotHubError, IotHubResult};

/// A client shared between the timer task and lifecycle calls
pub type SharedClient = Arc<Mutex<Box<dyn DeviceClient>>>;

/// Attempts per snapshot, including the first
pub const SEND_ATTEMPTS: u32 = 3;

const RETRY_BASE_DELAY: Duration = Duration::from_secs(5);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(80);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntitySnapshot {
    pub state: String,
    pub attributes: Attributes,
}

/// entity_id -> snapshot, in monitored order
pub type TelemetrySnapshot = IndexMap<String, EntitySnapshot>;

/// Current state of every monitored entity that has one
pub fn collect_snapshot(states: &StateStore, monitored: &[String]) -> TelemetrySnapshot {
    monitored
        .iter()
        .filter_map(|entity_id| {
            let state = states.get(entity_id)?;
            Some((
                entity_id.clone(),
                EntitySnapshot {
                    state: state.state,
                    attributes: state.attributes,
                },
            ))
        })
        .collect()
}

/// One JSON message; fails when the body is over the hub's size limit
pub fn encode_snapshot(snapshot: &TelemetrySnapshot) -> IotHubResult<Message> {
    let message = Message::json(serde_json::to_string(snapshot)?);
    message.check_size()?;
    Ok(message)
}

/// Backoff before the retry following `failed` failed attempts
pub fn send_retry_delay(failed: u32) -> Duration {
    let factor = 2_u32.saturating_pow(failed.saturating_sub(1));
    RETRY_BASE_DELAY.saturating_mul(factor).min(RETRY_MAX_DELAY)
}

async fn attempt_send(client: &mut dyn DeviceClient, message: &Message) -> IotHubResult<()> {
    if !client.is_connected() {
        debug!("Client not connected, reconnecting before send");
        client.connect().await?;
    }
    client.send_message(message.clone()).await
}

/// Send `message`, reconnecting between failed attempts
///
/// Gives up early with the last error when `cancel` fires during a backoff.
/// Errors that another attempt cannot fix (an oversized body) are returned
/// at once and leave the connection alone.
pub async fn send_with_retry(
    client: &mut dyn DeviceClient,
    message: Message,
    cancel: &CancellationToken,
) -> IotHubResult<()> {
    message.check_size()?;
    let mut last_error = IotHubError::NotConnected;

    for attempt in 1..=SEND_ATTEMPTS {
        if attempt > 1 {
            let delay = send_retry_delay(attempt - 1);
            debug!(attempt, ?delay, "Waiting before telemetry retry");
            tokio::select! {
                _ = cancel.cancelled() => return Err(last_error),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        match attempt_send(client, &message).await {
            Ok(()) => return Ok(()),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                warn!(attempt, "Telemetry send failed: {}", err);
                // Force a fresh connection for the next attempt
                if let Err(disconnect_err) = client.disconnect().await {
                    debug!("Disconnect after failed send: {}", disconnect_err);
                }
                last_error = err;
            }
        }
    }

    Err(last_error)
}

/// Work done on every timer tick of one config entry
#[derive(Clone)]
pub struct TelemetrySender {
    entry_id: Arc<str>,
    states: SharedStateStore,
    monitored: Arc<[String]>,
    client: SharedClient,
}

impl TelemetrySender {
    pub fn new(
        entry_id: &str,
        states: SharedStateStore,
        monitored: Vec<String>,
        client: SharedClient,
    ) -> Self {
        Self {
            entry_id: Arc::from(entry_id),
            states,
            monitored: monitored.into(),
            client,
        }
    }

    #[instrument(skip_all, fields(entry_id = %self.entry_id))]
    pub async fn tick(&self, cancel: CancellationToken) {
        if cancel.is_cancelled() {
            return;
        }

        let snapshot = collect_snapshot(&self.states, &self.monitored);
        if snapshot.is_empty() {
            info!("No data to send");
            return;
        }

        let message = match encode_snapshot(&snapshot) {
            Ok(message) => message,
            Err(err) => {
                error!("Could not encode telemetry: {}", err);
                return;
            }
        };

        let mut client = self.client.lock().await;
        match send_with_retry(&mut **client, message, &cancel).await {
            Ok(()) => debug!(entities = snapshot.len(), "Telemetry sent"),
            Err(err) => error!(
                "Dropping telemetry snapshot of {} entities: {}",
                snapshot.len(),
                err
            ),
        }
    }
}
