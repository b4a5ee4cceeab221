//! Sector resonance: is the signal's sector moving with it?

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::domain::InstrumentId;

/// Latest quote of one shortlist member, as seen by the gatekeeper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerQuote {
    pub instrument: InstrumentId,
    pub sector: Option<String>,
    /// Percent change against the reference close.
    pub change_pct: f64,
}

/// Sector strength at one moment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResonanceSnapshot {
    pub peers: usize,
    /// Peers at or above the leader strength threshold.
    pub leaders: usize,
    /// Fraction of peers trading above the reference close.
    pub breadth: f64,
    pub computed_at: NaiveDateTime,
}

impl ResonanceSnapshot {
    pub fn compute(
        sector: &str,
        peers: &[PeerQuote],
        leader_strength_pct: f64,
        at: NaiveDateTime,
    ) -> Self {
        let members: Vec<&PeerQuote> = peers
            .iter()
            .filter(|p| p.sector.as_deref() == Some(sector))
            .collect();
        let leaders = members
            .iter()
            .filter(|p| p.change_pct >= leader_strength_pct)
            .count();
        let advancing = members.iter().filter(|p| p.change_pct > 0.0).count();
        let breadth = if members.is_empty() {
            0.0
        } else {
            advancing as f64 / members.len() as f64
        };
        Self {
            peers: members.len(),
            leaders,
            breadth,
            computed_at: at,
        }
    }
}

/// Per-sector snapshot cache with a time-to-live.
///
/// Age is measured on the session clock (signal timestamps), not wall time, so
/// replayed sessions behave like live ones.
pub struct ResonanceCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, ResonanceSnapshot>>,
}

impl ResonanceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cached snapshot if younger than the TTL, else `compute()` and cache it.
    pub fn get_or_compute(
        &self,
        sector: &str,
        now: NaiveDateTime,
        compute: impl FnOnce() -> ResonanceSnapshot,
    ) -> (ResonanceSnapshot, bool) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(snapshot) = entries.get(sector) {
            let age = now - snapshot.computed_at;
            if age >= Duration::zero() && age < self.ttl {
                return (*snapshot, true);
            }
        }
        let snapshot = compute();
        entries.insert(sector.to_string(), snapshot);
        (snapshot, false)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(10, minute, 0)
            .unwrap()
    }

    fn peer(id: &str, sector: &str, change_pct: f64) -> PeerQuote {
        PeerQuote {
            instrument: id.into(),
            sector: Some(sector.into()),
            change_pct,
        }
    }

    #[test]
    fn counts_only_same_sector_members() {
        let peers = vec![
            peer("a", "Banks", 6.0),
            peer("b", "Banks", 1.0),
            peer("c", "Banks", -1.0),
            peer("d", "Solar", 9.0),
        ];
        let s = ResonanceSnapshot::compute("Banks", &peers, 5.0, at(0));
        assert_eq!(s.peers, 3);
        assert_eq!(s.leaders, 1);
        assert!((s.breadth - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn cache_expires_after_ttl() {
        let cache = ResonanceCache::new(Duration::minutes(5));
        let first = ResonanceSnapshot::compute("Banks", &[], 5.0, at(0));
        let (_, hit) = cache.get_or_compute("Banks", at(0), || first);
        assert!(!hit);
        let (_, hit) = cache.get_or_compute("Banks", at(4), || unreachable!());
        assert!(hit);
        let (snap, hit) = cache.get_or_compute("Banks", at(5), || {
            ResonanceSnapshot::compute("Banks", &[], 5.0, at(5))
        });
        assert!(!hit);
        assert_eq!(snap.computed_at, at(5));
    }
}
