//! Device connection strings
//!
//! `HostName=<hub>.azure-devices.net;DeviceId=<id>;SharedAccessKey=<base64>`,
//! optionally with `ModuleId`, `GatewayHostName` and `SharedAccessKeyName`.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::IotHubError;

#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub host_name: String,
    pub device_id: String,
    pub module_id: Option<String>,
    pub gateway_host_name: Option<String>,
    pub shared_access_key_name: Option<String>,
    shared_access_key: String,
}

impl ConnectionString {
    pub fn shared_access_key(&self) -> &str {
        &self.shared_access_key
    }

    /// MQTT client id: the device id, or `<device>/<module>` for modules
    pub fn client_id(&self) -> String {
        match &self.module_id {
            Some(module) => format!("{}/{}", self.device_id, module),
            None => self.device_id.clone(),
        }
    }

    /// Host the transport connects to (the gateway when one is configured)
    pub fn connect_host(&self) -> &str {
        self.gateway_host_name.as_deref().unwrap_or(&self.host_name)
    }

    /// Identity of the device within its hub; the key is not part of it
    pub fn unique_id(&self) -> String {
        format!("{}/{}", self.host_name.to_lowercase(), self.client_id())
    }

    /// SAS resource URI, before URL encoding
    pub fn resource_uri(&self) -> String {
        match &self.module_id {
            Some(module) => format!(
                "{}/devices/{}/modules/{}",
                self.host_name, self.device_id, module
            ),
            None => format!("{}/devices/{}", self.host_name, self.device_id),
        }
    }
}

impl FromStr for ConnectionString {
    type Err = IotHubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |msg: String| IotHubError::InvalidConnectionString(msg);

        let mut host_name = None;
        let mut device_id = None;
        let mut module_id = None;
        let mut gateway_host_name = None;
        let mut shared_access_key_name = None;
        let mut shared_access_key = None;

        for segment in s.trim().split(';').filter(|seg| !seg.is_empty()) {
            // Values may contain '=' (base64 padding), so split on the first one
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| invalid("segment without '='".into()))?;
            if value.is_empty() {
                return Err(invalid(format!("empty value for {}", key)));
            }

            let slot = match key {
                "HostName" => &mut host_name,
                "DeviceId" => &mut device_id,
                "ModuleId" => &mut module_id,
                "GatewayHostName" => &mut gateway_host_name,
                "SharedAccessKeyName" => &mut shared_access_key_name,
                "SharedAccessKey" => &mut shared_access_key,
                // Unknown keys (e.g. x509=true) are ignored
                _ => continue,
            };
            *slot = Some(value.to_string());
        }

        let host_name = host_name.ok_or_else(|| invalid("missing HostName".into()))?;
        let device_id = device_id.ok_or_else(|| invalid("missing DeviceId".into()))?;
        let shared_access_key =
            shared_access_key.ok_or_else(|| invalid("missing SharedAccessKey".into()))?;

        if STANDARD.decode(&shared_access_key).is_err() {
            return Err(invalid("SharedAccessKey is not valid base64".into()));
        }

        Ok(Self {
            host_name,
            device_id,
            module_id,
            gateway_host_name,
            shared_access_key_name,
            shared_access_key,
        })
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("host_name", &self.host_name)
            .field("device_id", &self.device_id)
            .field("module_id", &self.module_id)
            .field("gateway_host_name", &self.gateway_host_name)
            .field("shared_access_key_name", &self.shared_access_key_name)
            .field("shared_access_key", &"<redacted>")
            .finish()
    }
}
