//! Reward catalog.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Something points can be exchanged for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reward {
    /// Coffee shop discount.
    CafeDiscount,
    /// Top-up on a transit card.
    TransitCharge,
    /// Donation made in the user's name.
    CharityDonation,
}

impl Reward {
    pub const ALL: [Reward; 3] = [
        Reward::CafeDiscount,
        Reward::TransitCharge,
        Reward::CharityDonation,
    ];

    /// Price in points.
    pub fn cost(&self) -> u64 {
        match self {
            Self::CafeDiscount => 300,
            Self::TransitCharge => 500,
            Self::CharityDonation => 1_000,
        }
    }

    pub fn slug(&self) -> &'static str {
        match self {
            Self::CafeDiscount => "cafe_discount",
            Self::TransitCharge => "transit_charge",
            Self::CharityDonation => "charity_donation",
        }
    }
}

impl fmt::Display for Reward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Unknown reward name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown reward: {0}")]
pub struct UnknownReward(pub String);

impl FromStr for Reward {
    type Err = UnknownReward;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|r| r.slug() == normalized)
            .ok_or_else(|| UnknownReward(s.to_string()))
    }
}
