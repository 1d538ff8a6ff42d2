use std::net::{IpAddr, Ipv4Addr};

use chrono::Utc;
use local_ip_address::local_ip;
use rand::distributions::Alphanumeric;
use rand::Rng;
use systemstat::{Platform, System};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. Calling this more
/// than once is harmless, which lets tests and binaries share it.
pub fn init_log() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Short random lowercase alphanumeric id, used for reply ids and secrets.
pub fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect()
}

/// Pick an IPv4 address that can be shared with a remote ICE peer.
///
/// Iterates over all network interfaces provided by `systemstat`, skipping any
/// loopback, link-local or broadcast addresses.
pub fn select_host_address() -> Option<IpAddr> {
    let system = System::new();
    let networks = system.networks().ok()?;

    for net in networks.values() {
        for n in &net.addrs {
            if let systemstat::IpAddr::V4(v) = n.addr {
                if !v.is_loopback() && !v.is_link_local() && !v.is_broadcast() {
                    return Some(IpAddr::V4(v));
                }
            }
        }
    }

    None
}

/// Address the peer transport binds to.
///
/// Prefers the primary interface reported by `local-ip-address`, then the
/// `systemstat` scan, then loopback so a single host can still talk to itself.
pub fn host_address() -> IpAddr {
    match local_ip() {
        Ok(ip) if !ip.is_loopback() => {
            debug!("Primary interface address: {}", ip);
            return ip;
        }
        Ok(_) => {}
        Err(e) => warn!("Failed to look up the primary interface: {}", e),
    }

    select_host_address().unwrap_or_else(|| {
        info!("No routable interface found, using loopback");
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_id_shape() {
        let a = random_id(12);
        let b = random_id(12);
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_now_millis_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn test_host_address_is_bindable() {
        let ip = host_address();
        assert!(!ip.is_unspecified());
        assert!(std::net::UdpSocket::bind((ip, 0)).is_ok());
    }
}
