//! Loopback port availability checks and allocation.
//!
//! A free port is only a hint: another process can grab it between the
//! check and the real bind, so callers must still propagate bind failures.

use std::net::{Ipv4Addr, SocketAddr};

use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{CoreError, CoreResult};

/// Lowest port accepted by user-facing operations.
pub const MIN_USER_PORT: u16 = 1000;

/// Fallback candidates tried after the preferred port, in order.
pub const FALLBACK_PORTS: [u16; 7] = [3001, 3002, 8000, 8080, 8081, 5000, 5001];

const RANDOM_ATTEMPTS: usize = 10;
const RANDOM_RANGE: std::ops::RangeInclusive<u16> = 3000..=9999;

/// Parse a user-supplied port, rejecting anything outside 1000–65535.
pub fn parse_user_port(raw: &str) -> Option<u16> {
    let value: i64 = raw.trim().parse().ok()?;
    user_port(value)
}

/// Restrict an integer to the user-facing port domain.
pub fn user_port(value: i64) -> Option<u16> {
    if (MIN_USER_PORT as i64..=u16::MAX as i64).contains(&value) {
        Some(value as u16)
    } else {
        None
    }
}

/// Whether `port` can currently be bound on 127.0.0.1.
///
/// Values outside 1–65535 report `false` without touching the network.
pub fn is_available(port: i64) -> bool {
    let port = match u16::try_from(port) {
        Ok(p) if p != 0 => p,
        _ => return false,
    };

    let available = try_bind(port).is_ok();
    tracing::debug!("Port {} check: {}", port, if available { "free" } else { "taken" });
    available
}

/// Binds a throwaway listener with the same socket options the real
/// server listener uses, then drops it.
fn try_bind(port: u16) -> std::io::Result<()> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    socket.bind(&addr.into())?;
    socket.listen(1)?;
    Ok(())
}

/// Find a free port, starting with `preferred`.
///
/// `reserved` is never returned; pass the core's own port here.
pub fn find_available(preferred: u16, reserved: Option<u16>) -> CoreResult<u16> {
    find_available_with(preferred, reserved, |p| is_available(p as i64))
}

/// Allocation algorithm with an injectable availability check.
pub fn find_available_with<F>(preferred: u16, reserved: Option<u16>, mut available: F) -> CoreResult<u16>
where
    F: FnMut(u16) -> bool,
{
    let is_reserved = |p: u16| reserved == Some(p);

    let candidates = std::iter::once(preferred).chain(FALLBACK_PORTS);
    for port in candidates {
        if port == 0 || is_reserved(port) {
            continue;
        }
        if available(port) {
            return Ok(port);
        }
    }

    let mut rng = rand::thread_rng();
    for _ in 0..RANDOM_ATTEMPTS {
        let port = rng.gen_range(RANDOM_RANGE);
        if is_reserved(port) {
            continue;
        }
        if available(port) {
            return Ok(port);
        }
    }

    tracing::warn!("No available port found (preferred: {})", preferred);
    Err(CoreError::NoPortAvailable)
}
