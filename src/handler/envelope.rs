use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::{CombinedSnapshot, FingerprintRecord, ServiceStatus, SmartData};

/// Action codes a hub may request. Codes are wire-stable; never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Action {
    GetData = 0,
    CheckFingerprint = 1,
    GetContainerLogs = 2,
    GetContainerInfo = 3,
    GetSmartData = 4,
    GetSystemdInfo = 5,
}

impl Action {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::GetData),
            1 => Some(Self::CheckFingerprint),
            2 => Some(Self::GetContainerLogs),
            3 => Some(Self::GetContainerInfo),
            4 => Some(Self::GetSmartData),
            5 => Some(Self::GetSystemdInfo),
            _ => None,
        }
    }

    pub fn code(&self) -> u16 {
        *self as u16
    }
}

/// One hub-initiated request. `id`, when present, is echoed in the response
/// so the hub can pair them; `data` is an action-specific CBOR payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubRequest {
    pub action: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

/// The uniform response envelope. Exactly one payload field is set on
/// success; `error` on failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_data: Option<CombinedSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<FingerprintRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smart_data: Option<HashMap<String, SmartData>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_info: Option<ServiceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_bytes: Option<Vec<u8>>,
}

/// Typed success payloads handlers can return.
#[derive(Debug, Clone)]
pub enum ResponsePayload {
    SystemData(Box<CombinedSnapshot>),
    Fingerprint(FingerprintRecord),
    Text(String),
    SmartData(HashMap<String, SmartData>),
    ServiceInfo(ServiceStatus),
    Bytes(Vec<u8>),
}

impl AgentResponse {
    pub fn success(id: Option<u32>, payload: ResponsePayload) -> Self {
        let mut response = Self {
            id,
            ..Default::default()
        };
        match payload {
            ResponsePayload::SystemData(data) => response.system_data = Some(*data),
            ResponsePayload::Fingerprint(fp) => response.fingerprint = Some(fp),
            ResponsePayload::Text(s) => response.string = Some(s),
            ResponsePayload::SmartData(map) => response.smart_data = Some(map),
            ResponsePayload::ServiceInfo(info) => response.service_info = Some(info),
            ResponsePayload::Bytes(bytes) => response.raw_bytes = Some(bytes),
        }
        response
    }

    pub fn failure(id: Option<u32>, error: impl std::fmt::Display) -> Self {
        Self {
            id,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

// Action-specific request payloads.

/// GetData options; a missing payload defaults to the 60 s interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsOptions {
    pub interval_ms: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRequest {
    pub container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub service_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintChallenge {
    pub token: String,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).context("CBOR encode failed")?;
    Ok(buf)
}

pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).context("CBOR decode failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SmartAttribute;

    fn roundtrip(response: &AgentResponse) -> AgentResponse {
        decode(&encode(response).unwrap()).unwrap()
    }

    // -----------------------------------------------------------------------
    // envelope round-trips, one per payload variant
    // -----------------------------------------------------------------------

    #[test]
    fn request_roundtrip() {
        let request = HubRequest {
            action: Action::GetData.code(),
            id: Some(42),
            data: Some(encode(&StatsOptions { interval_ms: 10_000 }).unwrap()),
        };
        let decoded: HubRequest = decode(&encode(&request).unwrap()).unwrap();
        assert_eq!(decoded.action, 0);
        assert_eq!(decoded.id, Some(42));
        let options: StatsOptions = decode(decoded.data.as_deref().unwrap()).unwrap();
        assert_eq!(options.interval_ms, 10_000);
    }

    #[test]
    fn system_data_roundtrip() {
        let mut snapshot = CombinedSnapshot::default();
        snapshot.stats.cpu_pct = 12.34;
        snapshot.info.hostname = "host-1".into();
        let response =
            AgentResponse::success(Some(1), ResponsePayload::SystemData(Box::new(snapshot)));
        let back = roundtrip(&response);
        assert_eq!(back.id, Some(1));
        assert_eq!(back.system_data.unwrap().stats.cpu_pct, 12.34);
        assert!(back.error.is_none());
    }

    #[test]
    fn fingerprint_roundtrip() {
        let response = AgentResponse::success(
            None,
            ResponsePayload::Fingerprint(FingerprintRecord {
                fingerprint: "ab".repeat(24),
                hostname: "host-1".into(),
                port: "45876".into(),
            }),
        );
        let back = roundtrip(&response);
        assert_eq!(back.fingerprint.unwrap().port, "45876");
        assert_eq!(back.id, None);
    }

    #[test]
    fn string_roundtrip() {
        let response =
            AgentResponse::success(Some(7), ResponsePayload::Text("log line".into()));
        assert_eq!(roundtrip(&response).string.as_deref(), Some("log line"));
    }

    #[test]
    fn smart_map_roundtrip() {
        let mut map = HashMap::new();
        map.insert(
            "SERIAL1".to_string(),
            SmartData {
                device_name: "/dev/sda".into(),
                device_type: "sata".into(),
                serial_number: "SERIAL1".into(),
                status: "PASSED".into(),
                temperature: 31,
                attributes: vec![SmartAttribute {
                    id: Some(5),
                    name: "Reallocated_Sector_Ct".into(),
                    value: Some(100),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        let response = AgentResponse::success(Some(9), ResponsePayload::SmartData(map));
        let back = roundtrip(&response);
        let data = &back.smart_data.unwrap()["SERIAL1"];
        assert_eq!(data.temperature, 31);
        assert_eq!(data.attributes[0].id, Some(5));
    }

    #[test]
    fn service_info_roundtrip() {
        let response = AgentResponse::success(
            Some(3),
            ResponsePayload::ServiceInfo(ServiceStatus {
                name: "ssh".into(),
                load_state: "loaded".into(),
                active_state: "active".into(),
                sub_state: "running".into(),
                description: "OpenSSH".into(),
            }),
        );
        assert_eq!(roundtrip(&response).service_info.unwrap().name, "ssh");
    }

    #[test]
    fn bytes_roundtrip() {
        let response =
            AgentResponse::success(None, ResponsePayload::Bytes(vec![0, 159, 146, 150]));
        assert_eq!(
            roundtrip(&response).raw_bytes.unwrap(),
            vec![0, 159, 146, 150]
        );
    }

    #[test]
    fn error_roundtrip() {
        let response = AgentResponse::failure(Some(11), "boom");
        let back = roundtrip(&response);
        assert_eq!(back.id, Some(11));
        assert_eq!(back.error.as_deref(), Some("boom"));
        assert!(back.system_data.is_none());
    }

    // -----------------------------------------------------------------------
    // action codes
    // -----------------------------------------------------------------------

    #[test]
    fn action_codes_are_stable() {
        assert_eq!(Action::GetData.code(), 0);
        assert_eq!(Action::CheckFingerprint.code(), 1);
        assert_eq!(Action::GetContainerLogs.code(), 2);
        assert_eq!(Action::GetContainerInfo.code(), 3);
        assert_eq!(Action::GetSmartData.code(), 4);
        assert_eq!(Action::GetSystemdInfo.code(), 5);
    }

    #[test]
    fn unknown_action_code_is_none() {
        assert_eq!(Action::from_code(999), None);
        assert_eq!(Action::from_code(6), None);
    }
}
