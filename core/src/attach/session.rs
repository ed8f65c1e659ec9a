use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::types::{AttachRole, Frame, CLEANUP_GRACE, CLIENT_QUEUE_CAPACITY, DRIVER_LEASE};

pub struct ClientHandle {
    pub send: mpsc::Sender<Frame>,
    pub max_role: AttachRole,
}

pub enum SeatOutcome {
    BecomeDriver,
    RemainViewer,
}

/// Shared driver-seating rule used both on join and on `take_control`: a
/// reconnecting holder of an unexpired lease keeps it; otherwise an unclaimed
/// seat goes to a client asking for the driver role; everyone else waits as
/// a viewer.
pub fn decide_seat(current_driver: Option<&str>, joining_client_id: &str, claimed_role: AttachRole) -> SeatOutcome {
    if current_driver == Some(joining_client_id) {
        SeatOutcome::BecomeDriver
    } else if claimed_role == AttachRole::Driver && current_driver.is_none() {
        SeatOutcome::BecomeDriver
    } else {
        SeatOutcome::RemainViewer
    }
}

pub struct Inner {
    pub clients: HashMap<String, ClientHandle>,
    pub driver_client_id: Option<String>,
    pub driver_lease_until: Option<Instant>,
    pub stdin_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    pub size_tx: Option<mpsc::Sender<(u16, u16)>>,
    pub backend_cancel: Option<CancellationToken>,
    pub cleanup_generation: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            clients: HashMap::new(),
            driver_client_id: None,
            driver_lease_until: None,
            stdin_tx: None,
            size_tx: None,
            backend_cancel: None,
            cleanup_generation: 0,
        }
    }

    /// The unexpired driver's client id, or `None` if there is no driver or
    /// its lease has lapsed. Mirrors the donor's `currentDriverLocked`.
    pub fn current_driver(&self, now: Instant) -> Option<&str> {
        let lease_until = self.driver_lease_until?;
        if now >= lease_until {
            return None;
        }
        self.driver_client_id.as_deref()
    }

    pub fn lease_remaining(&self, now: Instant) -> Duration {
        match self.driver_lease_until {
            Some(until) if until > now => until - now,
            _ => Duration::ZERO,
        }
    }

    pub fn refresh_lease(&mut self, now: Instant, client_id: &str) {
        self.driver_client_id = Some(client_id.to_string());
        self.driver_lease_until = Some(now + DRIVER_LEASE);
    }

    pub fn broadcast(&self, frame: Frame) {
        for client in self.clients.values() {
            let _ = client.send.try_send(frame.clone());
        }
    }
}

/// Per-session attach state: one exclusive lock over the client map, driver
/// seat, stdin pipe, exec cancel handle, and cleanup timer so none of those
/// can be observed half-updated by a concurrent connection.
pub struct AttachSession {
    pub inner: Mutex<Inner>,
}

impl Default for AttachSession {
    fn default() -> Self {
        Self::new()
    }
}

impl AttachSession {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
        }
    }
}

pub fn new_client_channel() -> (mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
    mpsc::channel(CLIENT_QUEUE_CAPACITY)
}

pub fn cleanup_delay(lease_remaining: Duration) -> Duration {
    lease_remaining + CLEANUP_GRACE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decide_seat_reconnect_keeps_driver_role_regardless_of_claimed_role() {
        let outcome = decide_seat(Some("c1"), "c1", AttachRole::Viewer);
        assert!(matches!(outcome, SeatOutcome::BecomeDriver));
    }

    #[test]
    fn decide_seat_claims_an_empty_seat_for_a_driver_role_request() {
        let outcome = decide_seat(None, "c2", AttachRole::Driver);
        assert!(matches!(outcome, SeatOutcome::BecomeDriver));
    }

    #[test]
    fn decide_seat_refuses_a_seat_already_held_by_someone_else() {
        let outcome = decide_seat(Some("c1"), "c2", AttachRole::Driver);
        assert!(matches!(outcome, SeatOutcome::RemainViewer));
    }

    #[test]
    fn decide_seat_leaves_a_viewer_role_request_as_viewer_on_an_empty_seat() {
        let outcome = decide_seat(None, "c2", AttachRole::Viewer);
        assert!(matches!(outcome, SeatOutcome::RemainViewer));
    }

    #[test]
    fn current_driver_expires_after_the_lease_elapses() {
        let mut inner = Inner::new();
        let t0 = Instant::now();
        inner.refresh_lease(t0, "c1");
        assert_eq!(inner.current_driver(t0), Some("c1"));
        assert_eq!(inner.current_driver(t0 + DRIVER_LEASE + Duration::from_millis(1)), None);
    }

    #[test]
    fn cleanup_delay_adds_the_grace_period_to_lease_remaining() {
        assert_eq!(cleanup_delay(Duration::from_secs(10)), Duration::from_secs(15));
        assert_eq!(cleanup_delay(Duration::ZERO), CLEANUP_GRACE);
    }
}
