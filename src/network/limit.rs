//! Inbound connection limits
//!
//! Counts live inbound connections per remote IP. A connection holds a
//! [`ConnectionPermit`] for as long as it is open; dropping the permit gives
//! the slot back and forgets the IP once its count reaches zero.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Default inbound connections accepted from one IP
pub const DEFAULT_MAX_INBOUND_PER_IP: usize = 5;

#[derive(Debug)]
pub struct ConnectionLimiter {
    max_per_ip: usize,
    counts: Mutex<HashMap<IpAddr, usize>>,
}

impl ConnectionLimiter {
    pub fn new(max_per_ip: usize) -> Self {
        Self {
            max_per_ip,
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_per_ip(&self) -> usize {
        self.max_per_ip
    }

    /// Claim a slot for `ip`, or `None` if it is at its limit
    pub fn try_acquire(self: &Arc<Self>, ip: IpAddr) -> Option<ConnectionPermit> {
        let mut counts = self.counts.lock();
        let count = counts.entry(ip).or_insert(0);
        if *count >= self.max_per_ip {
            log::debug!("Too many connections from {}", ip);
            if *count == 0 {
                counts.remove(&ip);
            }
            return None;
        }
        *count += 1;
        Some(ConnectionPermit {
            limiter: self.clone(),
            ip,
        })
    }

    pub fn connections_from(&self, ip: &IpAddr) -> usize {
        self.counts.lock().get(ip).copied().unwrap_or(0)
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.counts.lock().contains_key(ip)
    }

    fn release(&self, ip: &IpAddr) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(ip);
            }
        }
    }
}

impl Default for ConnectionLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INBOUND_PER_IP)
    }
}

/// One counted inbound connection
#[derive(Debug)]
pub struct ConnectionPermit {
    limiter: Arc<ConnectionLimiter>,
    ip: IpAddr,
}

impl ConnectionPermit {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.limiter.release(&self.ip);
    }
}
