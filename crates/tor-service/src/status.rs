// standard
use std::net::SocketAddr;
use std::sync::RwLock;

/// Coarse lifecycle state of the tor service.
///
/// The integer encoding is stable and is what crosses the C boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServiceStatus {
    NotStarted = 0,
    Bootstrapping = 1,
    Running = 2,
    Failed = 3,
    Stopped = 4,
}

impl ServiceStatus {
    pub fn as_int(self) -> i32 {
        self as u8 as i32
    }

    pub fn from_int(value: i32) -> Option<ServiceStatus> {
        match value {
            0 => Some(ServiceStatus::NotStarted),
            1 => Some(ServiceStatus::Bootstrapping),
            2 => Some(ServiceStatus::Running),
            3 => Some(ServiceStatus::Failed),
            4 => Some(ServiceStatus::Stopped),
            _ => None,
        }
    }

    // whether the lifecycle allows moving from self to next
    pub(crate) fn can_transition_to(self, next: ServiceStatus) -> bool {
        use ServiceStatus::*;
        matches!(
            (self, next),
            (NotStarted, Bootstrapping)
                | (Stopped, Bootstrapping)
                | (Failed, Bootstrapping)
                | (Bootstrapping, Running)
                | (Bootstrapping, Failed)
                | (Bootstrapping, Stopped)
                | (Running, Stopped)
                | (Running, Failed)
        )
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceStatus::NotStarted => "not started",
            ServiceStatus::Bootstrapping => "bootstrapping",
            ServiceStatus::Running => "running",
            ServiceStatus::Failed => "failed",
            ServiceStatus::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// A consistent view of the service: its status and, while running, the
/// address of the local SOCKS listener
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceSnapshot {
    pub status: ServiceStatus,
    pub socks_addr: Option<SocketAddr>,
}

// Written only on lifecycle transitions (with the supervisor's state mutex
// held); readers never wait on the state mutex.
pub(crate) struct StatusCell {
    snapshot: RwLock<ServiceSnapshot>,
}

impl StatusCell {
    pub fn new() -> StatusCell {
        StatusCell {
            snapshot: RwLock::new(ServiceSnapshot {
                status: ServiceStatus::NotStarted,
                socks_addr: None,
            }),
        }
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        match self.snapshot.read() {
            Ok(snapshot) => *snapshot,
            Err(_) => unreachable!("another thread panicked while holding the status lock"),
        }
    }

    pub fn publish(&self, status: ServiceStatus, socks_addr: Option<SocketAddr>) {
        let mut snapshot = match self.snapshot.write() {
            Ok(snapshot) => snapshot,
            Err(_) => unreachable!("another thread panicked while holding the status lock"),
        };
        debug_assert!(
            snapshot.status == status || snapshot.status.can_transition_to(status),
            "invalid status transition {} -> {}",
            snapshot.status,
            status
        );
        tracing::debug!(from = %snapshot.status, to = %status, "service status changed");
        // only a running service exposes its proxy
        let socks_addr = match status {
            ServiceStatus::Running => socks_addr,
            _ => None,
        };
        *snapshot = ServiceSnapshot { status, socks_addr };
    }
}

#[test]
fn test_status_encoding() {
    for (status, value) in [
        (ServiceStatus::NotStarted, 0),
        (ServiceStatus::Bootstrapping, 1),
        (ServiceStatus::Running, 2),
        (ServiceStatus::Failed, 3),
        (ServiceStatus::Stopped, 4),
    ] {
        assert_eq!(status.as_int(), value);
        assert_eq!(ServiceStatus::from_int(value), Some(status));
    }
    assert_eq!(ServiceStatus::from_int(5), None);
    assert_eq!(ServiceStatus::from_int(-1), None);
}

#[test]
fn test_status_transitions() {
    use ServiceStatus::*;

    assert!(NotStarted.can_transition_to(Bootstrapping));
    assert!(!NotStarted.can_transition_to(Running));
    assert!(Bootstrapping.can_transition_to(Running));
    assert!(Running.can_transition_to(Stopped));
    assert!(Running.can_transition_to(Failed));
    assert!(Failed.can_transition_to(Bootstrapping));
    assert!(!Stopped.can_transition_to(Running));
    assert!(!Failed.can_transition_to(Running));
}

#[test]
fn test_status_cell() {
    let cell = StatusCell::new();
    let addr: SocketAddr = ([127, 0, 0, 1], 9050).into();

    assert_eq!(cell.snapshot().status, ServiceStatus::NotStarted);

    // no proxy is exposed while bootstrapping
    cell.publish(ServiceStatus::Bootstrapping, Some(addr));
    assert_eq!(cell.snapshot().socks_addr, None);

    cell.publish(ServiceStatus::Running, Some(addr));
    assert_eq!(
        cell.snapshot(),
        ServiceSnapshot {
            status: ServiceStatus::Running,
            socks_addr: Some(addr)
        }
    );

    cell.publish(ServiceStatus::Stopped, Some(addr));
    assert_eq!(cell.snapshot().socks_addr, None);
}
