//! §4.I rate limits: per-IP connection cap, per-server room cap.
use std::net::IpAddr;

use dashmap::DashMap;

pub struct RateLimiter {
    max_conns_per_ip: usize,
    max_rooms: usize,
    conns_per_ip: DashMap<IpAddr, usize>,
}

#[derive(Debug, Eq, PartialEq)]
pub enum LimitOutcome {
    Allowed,
    /// Close code 4003.
    PerIpLimitExceeded,
    /// Close code 4002.
    RoomLimitExceeded,
}

impl RateLimiter {
    pub fn new(max_conns_per_ip: usize, max_rooms: usize) -> Self {
        Self {
            max_conns_per_ip,
            max_rooms,
            conns_per_ip: DashMap::new(),
        }
    }

    pub fn try_admit_connection(&self, ip: IpAddr) -> LimitOutcome {
        let mut count = self.conns_per_ip.entry(ip).or_insert(0);
        if *count >= self.max_conns_per_ip {
            return LimitOutcome::PerIpLimitExceeded;
        }
        *count += 1;
        LimitOutcome::Allowed
    }

    pub fn release_connection(&self, ip: IpAddr) {
        if let Some(mut count) = self.conns_per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn try_admit_room(&self, current_room_count: usize) -> LimitOutcome {
        if current_room_count >= self.max_rooms {
            LimitOutcome::RoomLimitExceeded
        } else {
            LimitOutcome::Allowed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_the_per_ip_cap() {
        let limiter = RateLimiter::new(2, 100);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        assert_eq!(limiter.try_admit_connection(ip), LimitOutcome::Allowed);
        assert_eq!(limiter.try_admit_connection(ip), LimitOutcome::Allowed);
        assert_eq!(limiter.try_admit_connection(ip), LimitOutcome::PerIpLimitExceeded);
    }

    #[test]
    fn release_frees_up_a_slot() {
        let limiter = RateLimiter::new(1, 100);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        assert_eq!(limiter.try_admit_connection(ip), LimitOutcome::Allowed);
        limiter.release_connection(ip);
        assert_eq!(limiter.try_admit_connection(ip), LimitOutcome::Allowed);
    }

    #[test]
    fn room_cap_is_checked_independently() {
        let limiter = RateLimiter::new(10, 2);
        assert_eq!(limiter.try_admit_room(1), LimitOutcome::Allowed);
        assert_eq!(limiter.try_admit_room(2), LimitOutcome::RoomLimitExceeded);
    }
}
