//! IoT Hub device client over MQTT 3.1.1 / TLS
//!
//! Authentication uses the device SAS key from the connection string: the
//! username carries the hub host, client id and API version, the password is
//! a short-lived SAS token minted at every connect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, Transport,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ClientFactory, DeviceClient, Message, MAX_MESSAGE_SIZE};
use crate::connection_string::ConnectionString;
use crate::error::{IotHubError, IotHubResult};
use crate::sas;

pub const MQTT_PORT: u16 = 8883;
pub const API_VERSION: &str = "2021-04-12";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const PUBACK_TIMEOUT: Duration = Duration::from_secs(30);
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);
const KEEP_ALIVE: Duration = Duration::from_secs(60);
const REQUEST_CAPACITY: usize = 16;
/// Room for the topic and PUBLISH header on top of a full-size body
const PACKET_OVERHEAD: usize = 1024;
pub const MAX_PACKET_SIZE: usize = MAX_MESSAGE_SIZE + PACKET_OVERHEAD;

/// Builds [`MqttDeviceClient`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct MqttClientFactory;

impl ClientFactory for MqttClientFactory {
    fn create_from_connection_string(
        &self,
        connection_string: &str,
    ) -> IotHubResult<Box<dyn DeviceClient>> {
        let connection: ConnectionString = connection_string.parse()?;
        Ok(Box::new(MqttDeviceClient::new(connection)))
    }
}

/// One live MQTT connection and the task polling its event loop
struct Session {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    /// Signalled for every PUBACK
    acks: Arc<Notify>,
    /// Cancelled to stop the event loop, and by the event loop when it exits
    closed: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Session {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(mut self) {
        if self.is_connected() {
            if let Err(err) = self.client.disconnect().await {
                debug!("DISCONNECT not queued: {}", err);
            }
        }
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, task).await.is_err() {
                debug!("Event loop did not stop in time, cancelling");
            }
        }
        self.closed.cancel();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

pub struct MqttDeviceClient {
    connection: ConnectionString,
    session: Option<Session>,
    shut_down: bool,
}

impl MqttDeviceClient {
    pub fn new(connection: ConnectionString) -> Self {
        Self {
            connection,
            session: None,
            shut_down: false,
        }
    }

    pub fn connection(&self) -> &ConnectionString {
        &self.connection
    }

    fn mqtt_options(&self) -> IotHubResult<MqttOptions> {
        let password = sas::token_for(&self.connection)?;

        let mut options = MqttOptions::new(
            self.connection.client_id(),
            self.connection.connect_host(),
            MQTT_PORT,
        );
        options
            .set_credentials(username(&self.connection), password)
            .set_keep_alive(KEEP_ALIVE)
            .set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE)
            .set_transport(Transport::tls_with_default_config());
        Ok(options)
    }
}

/// `<hub host>/<client id>/?api-version=<version>`
pub fn username(connection: &ConnectionString) -> String {
    format!(
        "{}/{}/?api-version={}",
        connection.host_name,
        connection.client_id(),
        API_VERSION
    )
}

/// Device-to-cloud topic with the message's system properties appended
pub fn telemetry_topic(connection: &ConnectionString, message: &Message) -> String {
    let mut topic = match &connection.module_id {
        Some(module) => format!(
            "devices/{}/modules/{}/messages/events/",
            connection.device_id, module
        ),
        None => format!("devices/{}/messages/events/", connection.device_id),
    };

    let mut properties = Vec::new();
    if let Some(ref content_type) = message.content_type {
        properties.push(format!("$.ct={}", urlencoding::encode(content_type)));
    }
    if let Some(ref content_encoding) = message.content_encoding {
        properties.push(format!("$.ce={}", urlencoding::encode(content_encoding)));
    }
    topic.push_str(&properties.join("&"));
    topic
}

fn check_return_code(code: ConnectReturnCode) -> IotHubResult<()> {
    match code {
        ConnectReturnCode::Success => Ok(()),
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            Err(IotHubError::InvalidAuth(format!("{:?}", code)))
        }
        other => Err(IotHubError::CannotConnect(format!(
            "connection refused: {:?}",
            other
        ))),
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> IotHubResult<()> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => return check_return_code(ack.code),
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => return check_return_code(code),
            Err(err) => return Err(IotHubError::CannotConnect(err.to_string())),
        }
    }
}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    connected: Arc<AtomicBool>,
    acks: Arc<Notify>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    debug!(pkid = ack.pkid, "PUBACK received");
                    acks.notify_one();
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("DISCONNECT sent");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("IoT Hub connection lost: {}", err);
                    break;
                }
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    closed.cancel();
}

#[async_trait]
impl DeviceClient for MqttDeviceClient {
    async fn connect(&mut self) -> IotHubResult<()> {
        if self.shut_down {
            return Err(IotHubError::ShutDown);
        }
        if self.is_connected() {
            return Ok(());
        }
        if let Some(stale) = self.session.take() {
            stale.close().await;
        }

        debug!(
            device_id = %self.connection.device_id,
            host = %self.connection.connect_host(),
            "Connecting to IoT Hub"
        );
        let (client, mut event_loop) = AsyncClient::new(self.mqtt_options()?, REQUEST_CAPACITY);

        match tokio::time::timeout(CONNECT_TIMEOUT, wait_for_connack(&mut event_loop)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(IotHubError::CannotConnect(format!(
                    "no CONNACK within {:?}",
                    CONNECT_TIMEOUT
                )))
            }
        }

        let connected = Arc::new(AtomicBool::new(true));
        let acks = Arc::new(Notify::new());
        let closed = CancellationToken::new();
        let task = tokio::spawn(drive_event_loop(
            event_loop,
            Arc::clone(&connected),
            Arc::clone(&acks),
            closed.clone(),
        ));

        self.session = Some(Session {
            client,
            connected,
            acks,
            closed,
            task: Some(task),
        });
        info!(device_id = %self.connection.device_id, "Connected to IoT Hub");
        Ok(())
    }

    async fn send_message(&mut self, message: Message) -> IotHubResult<()> {
        if self.shut_down {
            return Err(IotHubError::ShutDown);
        }
        let session = self
            .session
            .as_ref()
            .filter(|s| s.is_connected())
            .ok_or(IotHubError::NotConnected)?;
        message.check_size()?;

        let topic = telemetry_topic(&self.connection, &message);
        let size = message.body.len();
        session
            .client
            .publish(topic, QoS::AtLeastOnce, false, message.body)
            .await
            .map_err(|e| IotHubError::Send(e.to_string()))?;

        tokio::select! {
            _ = session.acks.notified() => {
                debug!(bytes = size, "Telemetry message acknowledged");
                Ok(())
            }
            _ = session.closed.cancelled() => Err(IotHubError::NotConnected),
            _ = tokio::time::sleep(PUBACK_TIMEOUT) => {
                Err(IotHubError::Send(format!("no PUBACK within {:?}", PUBACK_TIMEOUT)))
            }
        }
    }

    async fn disconnect(&mut self) -> IotHubResult<()> {
        if let Some(session) = self.session.take() {
            session.close().await;
            info!(device_id = %self.connection.device_id, "Disconnected from IoT Hub");
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> IotHubResult<()> {
        self.disconnect().await?;
        self.shut_down = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.shut_down && self.session.as_ref().is_some_and(Session::is_connected)
    }
}
