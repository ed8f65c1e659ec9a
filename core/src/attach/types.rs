use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const ATTACH_TOKEN_TTL: Duration = Duration::from_secs(120);
pub const DRIVER_LEASE: Duration = Duration::from_secs(30);
pub const CLEANUP_GRACE: Duration = Duration::from_secs(5);
pub const INITIAL_COLS: u16 = 80;
pub const INITIAL_ROWS: u16 = 24;
pub const CLIENT_QUEUE_CAPACITY: usize = 64;

pub const CLAIM_SESSION_ID: &str = "attach.sessionID";
pub const CLAIM_CLIENT_ID: &str = "attach.clientID";
pub const CLAIM_ROLE: &str = "attach.role";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachRole {
    Viewer,
    Driver,
}

impl AttachRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AttachRole::Viewer => "viewer",
            AttachRole::Driver => "driver",
        }
    }
}

/// `""`/`"viewer"`/`"read"`/`"readonly"`/`"read-only"` normalize to
/// `Viewer`; `"driver"`/`"write"`/`"interactive"` normalize to `Driver`; any
/// other value is rejected.
pub fn normalize_attach_role(raw: &str) -> Option<AttachRole> {
    match raw.trim().to_lowercase().as_str() {
        "" | "viewer" | "read" | "readonly" | "read-only" => Some(AttachRole::Viewer),
        "driver" | "write" | "interactive" => Some(AttachRole::Driver),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Hello {
        #[serde(rename = "sessionID")]
        session_id: String,
        #[serde(rename = "clientID")]
        client_id: String,
        role: String,
        #[serde(rename = "driverID", skip_serializing_if = "Option::is_none")]
        driver_id: Option<String>,
        #[serde(rename = "leaseMS")]
        lease_ms: i64,
    },
    State {
        #[serde(rename = "driverID", skip_serializing_if = "Option::is_none")]
        driver_id: Option<String>,
        #[serde(rename = "leaseMS")]
        lease_ms: i64,
    },
    Keepalive,
    Resize {
        cols: u16,
        rows: u16,
    },
    #[serde(rename = "take_control")]
    TakeControl,
    Stdin {
        data: String,
    },
    Stdout {
        data: String,
    },
    BackendClosed,
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_attach_role_maps_viewer_aliases() {
        for raw in ["", "viewer", "read", "readonly", "read-only", "VIEWER"] {
            assert_eq!(normalize_attach_role(raw), Some(AttachRole::Viewer));
        }
    }

    #[test]
    fn normalize_attach_role_maps_driver_aliases() {
        for raw in ["driver", "write", "interactive", "Driver"] {
            assert_eq!(normalize_attach_role(raw), Some(AttachRole::Driver));
        }
    }

    #[test]
    fn normalize_attach_role_rejects_unknown_values() {
        assert_eq!(normalize_attach_role("admin"), None);
    }

    #[test]
    fn frame_serializes_with_tagged_type_field() {
        let frame = Frame::State {
            driver_id: Some("c1".to_string()),
            lease_ms: 30_000,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "state");
        assert_eq!(json["driverID"], "c1");
    }
}
