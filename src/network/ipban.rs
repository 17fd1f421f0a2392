//! Dynamic password-failure IP bans.
//!
//! Repeated failed passwords from one address within a sliding window add
//! a temporary ban; banned addresses are refused before the
//! authentication pipeline runs. A periodic sweep drops expired entries.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::config::LoginConfig;

pub struct IpBanList {
    /// Failure window length.
    interval: Duration,
    /// Failures within the window that trigger a ban.
    limit: u32,
    /// How long a triggered ban lasts.
    duration: Duration,
    failures: HashMap<u32, VecDeque<Instant>>,
    bans: HashMap<u32, Instant>,
}

impl IpBanList {
    pub fn new(interval: Duration, limit: u32, duration: Duration) -> Self {
        Self {
            interval,
            limit,
            duration,
            failures: HashMap::new(),
            bans: HashMap::new(),
        }
    }

    pub fn from_config(config: &LoginConfig) -> Self {
        Self::new(
            Duration::from_secs(config.dynamic_pass_failure_ban_interval as u64 * 60),
            config.dynamic_pass_failure_ban_limit,
            Duration::from_secs(config.dynamic_pass_failure_ban_duration as u64 * 60),
        )
    }

    /// Note a failed password from `ip` (host-order). Reaching the limit
    /// within the window converts the failures into a ban.
    pub fn record_failure(&mut self, ip: u32) {
        self.record_failure_at(ip, Instant::now());
    }

    fn record_failure_at(&mut self, ip: u32, now: Instant) {
        if self.limit == 0 {
            return;
        }
        let window = self.failures.entry(ip).or_default();
        while let Some(&oldest) = window.front() {
            if now.duration_since(oldest) > self.interval {
                window.pop_front();
            } else {
                break;
            }
        }
        window.push_back(now);
        if window.len() as u32 >= self.limit {
            self.failures.remove(&ip);
            self.bans.insert(ip, now + self.duration);
            tracing::info!(
                "[ipban] [banned] ip={}.{}.{}.{} minutes={}",
                (ip >> 24) & 0xFF,
                (ip >> 16) & 0xFF,
                (ip >> 8) & 0xFF,
                ip & 0xFF,
                self.duration.as_secs() / 60,
            );
        }
    }

    pub fn is_banned(&self, ip: u32) -> bool {
        self.is_banned_at(ip, Instant::now())
    }

    fn is_banned_at(&self, ip: u32, now: Instant) -> bool {
        self.bans.get(&ip).map(|&until| until > now).unwrap_or(false)
    }

    /// Drop expired bans and stale failure windows.
    pub fn sweep(&mut self) {
        self.sweep_at(Instant::now());
    }

    fn sweep_at(&mut self, now: Instant) {
        self.bans.retain(|_, &mut until| until > now);
        let interval = self.interval;
        self.failures.retain(|_, window| {
            while let Some(&oldest) = window.front() {
                if now.duration_since(oldest) > interval {
                    window.pop_front();
                } else {
                    break;
                }
            }
            !window.is_empty()
        });
    }

    #[cfg(test)]
    fn ban_count(&self) -> usize {
        self.bans.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP: u32 = 0x0A00_0001;

    fn list() -> IpBanList {
        IpBanList::new(Duration::from_secs(300), 3, Duration::from_secs(300))
    }

    #[test]
    fn test_limit_triggers_ban() {
        let mut bans = list();
        let t0 = Instant::now();
        bans.record_failure_at(IP, t0);
        bans.record_failure_at(IP, t0 + Duration::from_secs(1));
        assert!(!bans.is_banned_at(IP, t0 + Duration::from_secs(2)));
        bans.record_failure_at(IP, t0 + Duration::from_secs(2));
        assert!(bans.is_banned_at(IP, t0 + Duration::from_secs(3)));
    }

    #[test]
    fn test_window_slides() {
        let mut bans = list();
        let t0 = Instant::now();
        bans.record_failure_at(IP, t0);
        bans.record_failure_at(IP, t0 + Duration::from_secs(1));
        // third failure lands after the first left the window
        bans.record_failure_at(IP, t0 + Duration::from_secs(400));
        assert!(!bans.is_banned_at(IP, t0 + Duration::from_secs(401)));
    }

    #[test]
    fn test_ban_expires() {
        let mut bans = list();
        let t0 = Instant::now();
        for i in 0..3 {
            bans.record_failure_at(IP, t0 + Duration::from_secs(i));
        }
        assert!(bans.is_banned_at(IP, t0 + Duration::from_secs(10)));
        assert!(!bans.is_banned_at(IP, t0 + Duration::from_secs(400)));
    }

    #[test]
    fn test_sweep_removes_expired() {
        let mut bans = list();
        let t0 = Instant::now();
        for i in 0..3 {
            bans.record_failure_at(IP, t0 + Duration::from_secs(i));
        }
        assert_eq!(bans.ban_count(), 1);
        bans.sweep_at(t0 + Duration::from_secs(400));
        assert_eq!(bans.ban_count(), 0);
    }

    #[test]
    fn test_other_ips_unaffected() {
        let mut bans = list();
        let t0 = Instant::now();
        for i in 0..3 {
            bans.record_failure_at(IP, t0 + Duration::from_secs(i));
        }
        assert!(!bans.is_banned_at(IP + 1, t0 + Duration::from_secs(4)));
    }

    #[test]
    fn test_zero_limit_disables() {
        let mut bans = IpBanList::new(Duration::from_secs(300), 0, Duration::from_secs(300));
        let t0 = Instant::now();
        for i in 0..10 {
            bans.record_failure_at(IP, t0 + Duration::from_secs(i));
        }
        assert!(!bans.is_banned_at(IP, t0 + Duration::from_secs(11)));
    }
}
