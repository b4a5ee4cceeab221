use serde::{Deserialize, Serialize};

use super::InstrumentId;

/// Trading venue of a listed instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Venue {
    /// Main board, either exchange.
    MainBoard,
    /// Growth board (wider price limits, restricted participation).
    GrowthBoard,
    /// Technology innovation board (restricted participation).
    TechBoard,
    /// Regional / over-the-counter venue.
    Regional,
}

/// Listing status as reported by the reference feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListingStatus {
    Listed,
    /// Newly listed; first sessions behave differently.
    NewListing,
    Delisting,
}

/// Static classification flag categories.
///
/// Each category is tri-state on the instrument: `Some(true)`, `Some(false)`,
/// or `None` when the reference feed does not carry the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FlagCategory {
    SpecialTreatment,
    Delisted,
    Suspended,
    RestrictedVenue,
}

impl FlagCategory {
    pub const ALL: [FlagCategory; 4] = [
        FlagCategory::SpecialTreatment,
        FlagCategory::Delisted,
        FlagCategory::Suspended,
        FlagCategory::RestrictedVenue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpecialTreatment => "special_treatment",
            Self::Delisted => "delisted",
            Self::Suspended => "suspended",
            Self::RestrictedVenue => "restricted_venue",
        }
    }
}

/// Classification flags; `None` means the category is unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationFlags {
    pub special_treatment: Option<bool>,
    pub delisted: Option<bool>,
    pub suspended: Option<bool>,
    pub restricted_venue: Option<bool>,
}

impl ClassificationFlags {
    /// All categories known and clear.
    pub fn clear() -> Self {
        Self {
            special_treatment: Some(false),
            delisted: Some(false),
            suspended: Some(false),
            restricted_venue: Some(false),
        }
    }

    pub fn get(&self, category: FlagCategory) -> Option<bool> {
        match category {
            FlagCategory::SpecialTreatment => self.special_treatment,
            FlagCategory::Delisted => self.delisted,
            FlagCategory::Suspended => self.suspended,
            FlagCategory::RestrictedVenue => self.restricted_venue,
        }
    }

    pub fn set(&mut self, category: FlagCategory, value: Option<bool>) {
        match category {
            FlagCategory::SpecialTreatment => self.special_treatment = value,
            FlagCategory::Delisted => self.delisted = value,
            FlagCategory::Suspended => self.suspended = value,
            FlagCategory::RestrictedVenue => self.restricted_venue = value,
        }
    }
}

/// Instrument reference data. Immutable within a session, refreshed daily.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: InstrumentId,
    pub name: String,
    pub venue: Venue,
    pub listing: ListingStatus,
    pub flags: ClassificationFlags,
    /// Industry sector used by sector resonance; `None` when unclassified.
    pub sector: Option<String>,
    /// Free-float market capitalisation in currency units.
    pub market_cap: Option<f64>,
}

impl Instrument {
    /// Listed main-board instrument with all flags known and clear.
    pub fn new(id: impl Into<InstrumentId>, sector: Option<&str>) -> Self {
        let id = id.into();
        Self {
            name: id.0.clone(),
            id,
            venue: Venue::MainBoard,
            listing: ListingStatus::Listed,
            flags: ClassificationFlags::clear(),
            sector: sector.map(String::from),
            market_cap: None,
        }
    }

    pub fn with_flag(mut self, category: FlagCategory, value: Option<bool>) -> Self {
        self.flags.set(category, value);
        self
    }

    pub fn with_market_cap(mut self, market_cap: f64) -> Self {
        self.market_cap = Some(market_cap);
        self
    }

    pub fn with_venue(mut self, venue: Venue) -> Self {
        self.venue = venue;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_instrument_has_clear_flags() {
        let inst = Instrument::new("600000", Some("Banks"));
        for category in FlagCategory::ALL {
            assert_eq!(inst.flags.get(category), Some(false));
        }
    }

    #[test]
    fn flag_builder_sets_unknown() {
        let inst = Instrument::new("600000", None).with_flag(FlagCategory::Suspended, None);
        assert_eq!(inst.flags.get(FlagCategory::Suspended), None);
        assert_eq!(inst.flags.get(FlagCategory::Delisted), Some(false));
    }

    #[test]
    fn instrument_serialization_roundtrip() {
        let inst = Instrument::new("000001", Some("Banks")).with_market_cap(2.1e11);
        let json = serde_json::to_string(&inst).unwrap();
        let back: Instrument = serde_json::from_str(&json).unwrap();
        assert_eq!(inst, back);
    }
}
