use serde::{Deserialize, Serialize};
use std::fmt;

/// Instrument identifier (exchange code, e.g. `600519.SH`).
///
/// Ordering is lexicographic and is the tie-break order everywhere a ranking
/// needs one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstrumentId(pub String);

impl InstrumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstrumentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for InstrumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Monotonic signal identifier, unique within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SignalId(pub u64);

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig-{}", self.0)
    }
}

/// Deterministic session identifier (trading date + master seed).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Derive a session id from the trading date and the master seed.
    ///
    /// Uses BLAKE3 so the id is stable across builds and platforms.
    pub fn derive(trading_date: chrono::NaiveDate, seed: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(trading_date.to_string().as_bytes());
        hasher.update(&seed.to_le_bytes());
        let hex = hasher.finalize().to_hex();
        Self(hex[..16].to_string())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn session_id_deterministic() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        assert_eq!(SessionId::derive(date, 42), SessionId::derive(date, 42));
    }

    #[test]
    fn session_id_changes_with_seed() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        assert_ne!(SessionId::derive(date, 42), SessionId::derive(date, 43));
    }

    #[test]
    fn instrument_ids_order_lexicographically() {
        let mut ids = vec![InstrumentId::from("600002"), InstrumentId::from("000001")];
        ids.sort();
        assert_eq!(ids[0].as_str(), "000001");
    }
}
