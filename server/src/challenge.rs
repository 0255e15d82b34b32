//! Anti-spoofing challenge tokens handed out before a connect.
//!
//! A client has to echo the token it was given from the address it claims,
//! which proves it can receive packets there. The table is a fixed arena:
//! one record per base address, and a new address takes over the oldest
//! record.

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::{IpAddr, SocketAddr};

pub const MAX_CHALLENGES: usize = 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct ChallengeRecord {
    pub address: Option<IpAddr>,
    pub challenge: i32,
    pub time: u64,
}

#[derive(Debug)]
pub struct ChallengeTable {
    records: Vec<ChallengeRecord>,
    rng: StdRng,
}

impl ChallengeTable {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            records: vec![ChallengeRecord::default(); MAX_CHALLENGES],
            rng,
        }
    }

    /// Returns the live token for the requester's IP, issuing a new one over
    /// the oldest record when there is none.
    pub fn get_or_create(&mut self, address: SocketAddr, now: u64) -> i32 {
        let ip = address.ip();
        if let Some(record) = self.records.iter().find(|r| r.address == Some(ip)) {
            return record.challenge;
        }

        // Unused records sort before used ones, then by age.
        let oldest = self
            .records
            .iter()
            .enumerate()
            .min_by_key(|(_, r)| (r.address.is_some(), r.time))
            .map(|(i, _)| i)
            .unwrap_or(0);

        let challenge = self.rng.gen_range(1..i32::MAX);
        if let Some(evicted) = self.records[oldest].address {
            debug!("Challenge for {} replaced by {}", evicted, ip);
        }
        self.records[oldest] = ChallengeRecord {
            address: Some(ip),
            challenge,
            time: now,
        };
        challenge
    }

    /// The token on record for the requester's IP, if any.
    pub fn lookup(&self, address: SocketAddr) -> Option<i32> {
        let ip = address.ip();
        self.records
            .iter()
            .find(|r| r.address == Some(ip))
            .map(|r| r.challenge)
    }

    pub fn len(&self) -> usize {
        self.records.iter().filter(|r| r.address.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.records.len()
    }
}

impl Default for ChallengeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ChallengeTable {
        ChallengeTable::with_rng(StdRng::seed_from_u64(7))
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_same_address_gets_same_token() {
        let mut challenges = table();
        let first = challenges.get_or_create(addr("1.2.3.4:7777"), 10);
        let second = challenges.get_or_create(addr("1.2.3.4:7777"), 20);
        assert_eq!(first, second);
        assert_eq!(challenges.len(), 1);
    }

    #[test]
    fn test_port_is_ignored() {
        let mut challenges = table();
        let first = challenges.get_or_create(addr("1.2.3.4:7777"), 10);
        let other_port = challenges.get_or_create(addr("1.2.3.4:9999"), 20);
        assert_eq!(first, other_port);
        assert_eq!(challenges.lookup(addr("1.2.3.4:1")), Some(first));
    }

    #[test]
    fn test_tokens_are_positive() {
        let mut challenges = table();
        for i in 0..100u32 {
            let ip = format!("10.0.{}.{}:27901", i / 250, i % 250 + 1);
            assert!(challenges.get_or_create(addr(&ip), i as u64) > 0);
        }
    }

    fn indexed(i: usize) -> SocketAddr {
        addr(&format!("10.{}.{}.1:27901", i / 256, i % 256))
    }

    #[test]
    fn test_full_table_evicts_oldest() {
        let mut challenges = table();
        // Issue times out of step with record order; the oldest is 724,
        // then 641.
        let issued = |i: usize| 2000 + ((i as u64 + 300) * 37) % 1024;
        for i in 0..MAX_CHALLENGES {
            challenges.get_or_create(indexed(i), issued(i));
        }
        assert_eq!(challenges.len(), MAX_CHALLENGES);

        let newcomer = addr("192.168.0.1:27901");
        challenges.get_or_create(newcomer, 5000);

        assert_eq!(challenges.len(), MAX_CHALLENGES);
        assert!(challenges.lookup(newcomer).is_some());
        for i in 0..MAX_CHALLENGES {
            assert_eq!(challenges.lookup(indexed(i)).is_none(), i == 724, "record {}", i);
        }

        challenges.get_or_create(addr("192.168.0.2:27901"), 5001);
        assert!(challenges.lookup(indexed(641)).is_none());
        assert!(challenges.lookup(indexed(0)).is_some());
        assert!(challenges.lookup(newcomer).is_some());
    }

    #[test]
    fn test_lookup_without_record() {
        let challenges = table();
        assert!(challenges.is_empty());
        assert_eq!(challenges.capacity(), MAX_CHALLENGES);
        assert_eq!(challenges.lookup(addr("1.2.3.4:7777")), None);
    }
}
