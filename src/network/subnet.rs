//! LAN/WAN subnet remap table.
//!
//! When a client and a char-server sit on the same LAN, the server list
//! must advertise the char-server's LAN address instead of its public
//! one. Entries come from `subnet: MASK:CHAR_IP:MAP_IP` lines of the LAN
//! configuration file.

use anyhow::Result;
use std::path::Path;

use super::parse_ipv4;

/// One remap rule; all addresses are host-order u32s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    pub mask: u32,
    pub char_ip: u32,
    pub map_ip: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SubnetList {
    entries: Vec<Subnet>,
}

impl SubnetList {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, subnet: Subnet) {
        self.entries.push(subnet);
    }

    /// First entry whose char-server network contains `ip`, if any.
    /// Returns the LAN-facing char-server address to advertise.
    pub fn lan_subnetcheck(&self, ip: u32) -> Option<u32> {
        self.entries
            .iter()
            .find(|s| (s.char_ip & s.mask) == (ip & s.mask))
            .map(|s| s.char_ip)
    }

    /// Parse the `MASK:CHAR_IP:MAP_IP` value of a `subnet:` line.
    /// Entries whose char and map addresses fall in different networks
    /// are invalid.
    pub fn parse_entry(value: &str) -> Option<Subnet> {
        let mut parts = value.split(':');
        let mask = parse_ipv4(parts.next()?.trim())?;
        let char_ip = parse_ipv4(parts.next()?.trim())?;
        let map_ip = parse_ipv4(parts.next()?.trim())?;
        if parts.next().is_some() {
            return None;
        }
        if (char_ip & mask) != (map_ip & mask) {
            return None;
        }
        Some(Subnet { mask, char_ip, map_ip })
    }

    /// Read the LAN support configuration file. A missing or partly
    /// malformed file yields the entries that did parse; bad lines are
    /// only warned about, matching the old behavior.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let mut list = SubnetList::default();
        for (line_num, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            if !key.trim().eq_ignore_ascii_case("subnet") {
                continue;
            }
            match Self::parse_entry(value.trim()) {
                Some(subnet) => list.push(subnet),
                None => tracing::warn!(
                    "[subnet] [bad_entry] file={} line={}",
                    path.display(),
                    line_num + 1
                ),
            }
        }
        tracing::info!("[subnet] [loaded] file={} entries={}", path.display(), list.len());
        Ok(list)
    }
}
