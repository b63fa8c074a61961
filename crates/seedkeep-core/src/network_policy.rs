//! Network policy gate (VPN kill switch)
//!
//! Polls the configured interface in the background and caches a single
//! "connections allowed" decision so request paths never touch the network
//! stack.

use chrono::{DateTime, Utc};
use nix::net::if_::InterfaceFlags;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::{InterfaceObservation, NetworkPolicy};

/// Interface name prefixes that indicate a tunnel
const VPN_PREFIXES: &[&str] = &[
    "tun", "tap", "wg", "ppp", "utun", "ipsec", "nordlynx", "proton", "mullvad", "tailscale",
];

/// Classify an interface as a VPN tunnel by its name
pub fn classify_vpn(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    VPN_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

/// Source of interface observations
pub trait InterfaceProbe: Send + Sync {
    /// `Ok(None)` when no interface with that name exists
    fn lookup(&self, name: &str) -> Result<Option<InterfaceObservation>>;
}

/// Reads interfaces from the operating system with `getifaddrs`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaceProbe;

impl InterfaceProbe for SystemInterfaceProbe {
    fn lookup(&self, name: &str) -> Result<Option<InterfaceObservation>> {
        let addrs = nix::ifaddrs::getifaddrs().map_err(std::io::Error::from)?;

        let mut found: Option<InterfaceObservation> = None;
        for ifaddr in addrs.filter(|a| a.interface_name == name) {
            let observation = found.get_or_insert_with(|| InterfaceObservation {
                name: name.to_string(),
                is_vpn: classify_vpn(name),
                is_up: false,
                addresses: Vec::new(),
            });
            observation.is_up |= ifaddr.flags.contains(InterfaceFlags::IFF_UP);

            if let Some(address) = ifaddr.address {
                if let Some(v4) = address.as_sockaddr_in() {
                    observation.addresses.push(IpAddr::V4(v4.ip()));
                } else if let Some(v6) = address.as_sockaddr_in6() {
                    observation.addresses.push(IpAddr::V6(v6.ip()));
                }
            }
        }

        Ok(found)
    }
}

/// Cached outcome of the last poll
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateState {
    pub allowed: bool,
    pub vpn_active: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub observation: Option<InterfaceObservation>,
}

impl Default for GateState {
    fn default() -> Self {
        Self {
            allowed: true,
            vpn_active: false,
            last_checked: None,
            observation: None,
        }
    }
}

pub struct NetworkPolicyGate {
    policy: RwLock<NetworkPolicy>,
    probe: Arc<dyn InterfaceProbe>,
    state: RwLock<GateState>,
}

impl NetworkPolicyGate {
    /// Create a gate and run the first check immediately
    pub fn new(policy: NetworkPolicy, probe: Arc<dyn InterfaceProbe>) -> Self {
        let gate = Self {
            policy: RwLock::new(policy),
            probe,
            state: RwLock::new(GateState::default()),
        };
        gate.check_now();
        gate
    }

    pub fn with_system_probe(policy: NetworkPolicy) -> Self {
        Self::new(policy, Arc::new(SystemInterfaceProbe))
    }

    /// Poll the interface and refresh the cached decision
    pub fn check_now(&self) -> GateState {
        let policy = self.policy();

        let next = if !policy.enabled {
            GateState {
                allowed: true,
                vpn_active: false,
                last_checked: Some(Utc::now()),
                observation: None,
            }
        } else {
            let observation = match self.probe.lookup(&policy.interface_name) {
                Ok(observation) => observation,
                Err(e) => {
                    log::warn!(
                        "Failed to inspect interface {}: {}",
                        policy.interface_name,
                        e
                    );
                    None
                }
            };

            let vpn_active = observation.as_ref().is_some_and(|o| o.is_up);
            if let Some(o) = observation.as_ref().filter(|o| o.is_up && !o.is_vpn) {
                log::debug!("Interface {} is up but does not look like a tunnel", o.name);
            }

            GateState {
                allowed: vpn_active || !policy.kill_switch_enabled,
                vpn_active,
                last_checked: Some(Utc::now()),
                observation,
            }
        };

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.allowed != next.allowed {
            if next.allowed {
                log::info!("VPN interface {} is active, transfers allowed", policy.interface_name);
            } else {
                log::warn!(
                    "VPN interface {} is not active, kill switch engaged",
                    policy.interface_name
                );
            }
        }
        *state = next.clone();
        next
    }

    pub fn is_allowed(&self) -> bool {
        self.state.read().unwrap_or_else(PoisonError::into_inner).allowed
    }

    pub fn is_vpn_active(&self) -> bool {
        self.state.read().unwrap_or_else(PoisonError::into_inner).vpn_active
    }

    pub fn last_checked(&self) -> Option<DateTime<Utc>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).last_checked
    }

    pub fn state(&self) -> GateState {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn policy(&self) -> NetworkPolicy {
        self.policy.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the policy and re-evaluate right away
    pub fn set_policy(&self, policy: NetworkPolicy) -> GateState {
        *self.policy.write().unwrap_or_else(PoisonError::into_inner) = policy;
        self.check_now()
    }

    /// Fail with `PermissionDenied` while the kill switch is engaged
    pub fn ensure_allowed(&self) -> Result<()> {
        if self.is_allowed() {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "kill switch active: VPN interface {} is not up",
                self.policy().interface_name
            )))
        }
    }

    /// Re-check on every tick until the token is cancelled
    pub async fn run(&self, token: CancellationToken, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; construction already checked.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_now();
                }
            }
        }
        log::info!("Network policy gate stopped");
    }
}
