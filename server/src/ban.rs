use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

pub type BanId = u32;

/// Expiration timestamp format used by the admin API and the ban list file.
pub const EXPIRATION_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanEntry {
    pub id: BanId,
    pub ip: IpAddr,
    /// Prefix length. Zero bans the single address.
    pub subnet: u8,
    #[serde(with = "expiration_format")]
    pub expiration: NaiveDateTime,
    pub comment: String,
}

impl BanEntry {
    pub fn matches(&self, address: &IpAddr, now: &NaiveDateTime) -> bool {
        if self.expiration <= *now {
            return false;
        }
        match (self.ip, address) {
            (IpAddr::V4(banned), IpAddr::V4(addr)) => {
                prefix_match(&banned.octets(), &addr.octets(), self.subnet)
            }
            (IpAddr::V6(banned), IpAddr::V6(addr)) => {
                prefix_match(&banned.octets(), &addr.octets(), self.subnet)
            }
            (IpAddr::V4(banned), IpAddr::V6(addr)) => addr
                .to_ipv4_mapped()
                .map(|addr| prefix_match(&banned.octets(), &addr.octets(), self.subnet))
                .unwrap_or(false),
            (IpAddr::V6(_), IpAddr::V4(_)) => false,
        }
    }
}

fn prefix_match(banned: &[u8], address: &[u8], subnet: u8) -> bool {
    let total_bits = banned.len() * 8;
    let bits = match subnet as usize {
        0 => total_bits,
        n => n.min(total_bits),
    };
    let whole = bits / 8;
    if banned[..whole] != address[..whole] {
        return false;
    }
    let rest = bits % 8;
    if rest == 0 {
        return true;
    }
    let mask = 0xffu8 << (8 - rest);
    banned[whole] & mask == address[whole] & mask
}

/// Admission blocklist consulted for every accepted connection.
pub trait BanRegistry {
    fn is_address_banned(&self, address: &IpAddr) -> bool;
    fn add_ban(
        &mut self,
        ip: IpAddr,
        subnet: u8,
        expiration: NaiveDateTime,
        comment: String,
    ) -> BanEntry;
    fn delete_ban(&mut self, id: BanId) -> bool;
    fn list_bans(&self) -> Vec<BanEntry>;
}

#[derive(Debug, Default)]
pub struct BanList {
    entries: Vec<BanEntry>,
    last_id: BanId,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<BanEntry>) -> Self {
        let last_id = entries.iter().map(|e| e.id).max().unwrap_or(0);
        Self { entries, last_id }
    }

    pub fn is_address_banned_at(&self, address: &IpAddr, now: &NaiveDateTime) -> bool {
        self.entries.iter().any(|entry| entry.matches(address, now))
    }
}

impl BanRegistry for BanList {
    fn is_address_banned(&self, address: &IpAddr) -> bool {
        self.is_address_banned_at(address, &Local::now().naive_local())
    }

    fn add_ban(
        &mut self,
        ip: IpAddr,
        subnet: u8,
        expiration: NaiveDateTime,
        comment: String,
    ) -> BanEntry {
        self.last_id += 1;
        let entry = BanEntry {
            id: self.last_id,
            ip,
            subnet,
            expiration,
            comment,
        };
        log::info!("Banned {}/{} until {}", ip, subnet, expiration);
        self.entries.push(entry.clone());
        entry
    }

    fn delete_ban(&mut self, id: BanId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }

    fn list_bans(&self) -> Vec<BanEntry> {
        self.entries.clone()
    }
}

mod expiration_format {
    use super::EXPIRATION_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format(EXPIRATION_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let s = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&s, EXPIRATION_FORMAT).map_err(serde::de::Error::custom)
    }
}
