//! Shared fixtures: an in-memory device client and a host with the
//! integration registered

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ha_azure_iot_hub::{
    AzureIotHub, ClientFactory, ConnectionString, DeviceClient, IotHubError, IotHubResult,
    Message, CONF_CONNECTION_STRING, CONF_POLLING_INTERVAL, DOMAIN,
};
use ha_config_entries::{ConfigEntries, ConfigEntry};
use ha_core::{Attributes, EntityId};
use ha_registries::Storage;
use ha_state_store::{SharedStateStore, StateStore};
use serde_json::{json, Value};
use tempfile::TempDir;

pub const CONNECTION_STRING: &str =
    "HostName=hub.azure-devices.net;DeviceId=dev1;SharedAccessKey=c2VjcmV0LWtleQ==";

/// How the next `connect` calls behave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectBehavior {
    #[default]
    Succeed,
    CannotConnect,
    InvalidAuth,
    Unexpected,
}

/// Everything the mock clients did, shared with the test
#[derive(Default)]
pub struct Recorder {
    pub created: AtomicUsize,
    pub live: AtomicUsize,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub shutdowns: AtomicUsize,
    /// Sends still to fail before one succeeds
    pub failing_sends: AtomicUsize,
    connect_behavior: Mutex<ConnectBehavior>,
    sent: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        *self.connect_behavior.lock().unwrap() = behavior;
    }

    pub fn fail_next_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_json(&self) -> Vec<Value> {
        self.sent()
            .iter()
            .map(|body| serde_json::from_str(body).unwrap())
            .collect()
    }

    pub fn live_clients(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct MockClient {
    recorder: Arc<Recorder>,
    connected: bool,
    shut_down: bool,
}

impl Drop for MockClient {
    fn drop(&mut self) {
        if !self.shut_down {
            self.recorder.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl DeviceClient for MockClient {
    async fn connect(&mut self) -> IotHubResult<()> {
        if self.shut_down {
            return Err(IotHubError::ShutDown);
        }
        self.recorder.connects.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.recorder.connect_behavior.lock().unwrap();
        match behavior {
            ConnectBehavior::Succeed => {
                self.connected = true;
                Ok(())
            }
            ConnectBehavior::CannotConnect => {
                Err(IotHubError::CannotConnect("connection refused".into()))
            }
            ConnectBehavior::InvalidAuth => {
                Err(IotHubError::InvalidAuth("bad credentials".into()))
            }
            ConnectBehavior::Unexpected => Err(IotHubError::Send("boom".into())),
        }
    }

    async fn send_message(&mut self, message: Message) -> IotHubResult<()> {
        if !self.connected {
            return Err(IotHubError::NotConnected);
        }
        let failing = self.recorder.failing_sends.load(Ordering::SeqCst);
        if failing > 0 {
            self.recorder.failing_sends.store(failing - 1, Ordering::SeqCst);
            return Err(IotHubError::Send("link detached".into()));
        }
        let body = message.body_str().unwrap_or_default().to_string();
        self.recorder.sent.lock().unwrap().push(body);
        Ok(())
    }

    async fn disconnect(&mut self) -> IotHubResult<()> {
        if self.connected {
            self.recorder.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        self.connected = false;
        Ok(())
    }

    async fn shutdown(&mut self) -> IotHubResult<()> {
        self.disconnect().await?;
        if !self.shut_down {
            self.shut_down = true;
            self.recorder.shutdowns.fetch_add(1, Ordering::SeqCst);
            self.recorder.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[derive(Default, Clone)]
pub struct MockFactory {
    pub recorder: Arc<Recorder>,
}

impl ClientFactory for MockFactory {
    fn create_from_connection_string(
        &self,
        connection_string: &str,
    ) -> IotHubResult<Box<dyn DeviceClient>> {
        connection_string.parse::<ConnectionString>()?;
        self.recorder.created.fetch_add(1, Ordering::SeqCst);
        self.recorder.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockClient {
            recorder: Arc::clone(&self.recorder),
            connected: false,
            shut_down: false,
        }))
    }
}

/// Config entries backed by a temp dir, with the integration registered
pub struct TestHost {
    pub dir: TempDir,
    pub entries: Arc<ConfigEntries>,
    pub states: SharedStateStore,
    pub hub: Arc<AzureIotHub>,
    pub factory: MockFactory,
}

impl TestHost {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let entries = Arc::new(ConfigEntries::new(Arc::new(Storage::new(dir.path()))));
        let states: SharedStateStore = Arc::new(StateStore::new());
        let factory = MockFactory::default();
        let hub = Arc::new(AzureIotHub::new(
            Arc::new(factory.clone()),
            Arc::clone(&states),
        ));
        entries.register_handler(DOMAIN, hub.clone());

        Self {
            dir,
            entries,
            states,
            hub,
            factory,
        }
    }

    pub fn recorder(&self) -> &Recorder {
        &self.factory.recorder
    }

    pub fn set_state(&self, entity_id: &str, state: &str, attributes: Value) {
        let attributes: Attributes = attributes.as_object().cloned().unwrap_or_default();
        self.states
            .set(entity_id.parse::<EntityId>().unwrap(), state, attributes);
    }

    /// Add an entry that sends `monitored` every `minutes`, without setting it up
    pub async fn add_entry(&self, minutes: i64, monitored: &[&str]) -> ConfigEntry {
        let entry = ConfigEntry::new(DOMAIN, "IoT Hub Device")
            .with_data(entry_data(minutes))
            .with_options(monitored_options(monitored));
        self.entries.add(entry).await.unwrap()
    }
}

pub fn entry_data(minutes: i64) -> HashMap<String, Value> {
    let mut data = HashMap::new();
    data.insert(CONF_CONNECTION_STRING.to_string(), json!(CONNECTION_STRING));
    data.insert(CONF_POLLING_INTERVAL.to_string(), json!(minutes));
    data
}

pub fn monitored_options(monitored: &[&str]) -> HashMap<String, Value> {
    let mut options = HashMap::new();
    options.insert("monitored_entities".to_string(), json!(monitored));
    options
}

pub fn user_input(connection_string: &str, minutes: Value) -> HashMap<String, Value> {
    let mut input = HashMap::new();
    input.insert(CONF_CONNECTION_STRING.to_string(), json!(connection_string));
    input.insert(CONF_POLLING_INTERVAL.to_string(), minutes);
    input
}
