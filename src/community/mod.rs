//! BGP community registry
//!
//! Well-known community tuples from the overlay's community registry and
//! the RTT-to-tier classification used by the latency prober.

pub mod manager;
pub mod mtu;
pub mod probe;

use serde::{Deserialize, Serialize};

/// ASN that scopes every registry community.
pub const COMMUNITY_ASN: u32 = 64511;

/// Upper RTT bound (ms) for each latency tier; tier 8 is everything above.
pub const LATENCY_THRESHOLDS_MS: [f64; 8] = [2.7, 7.3, 20.0, 55.0, 148.0, 403.0, 1097.0, 2981.0];

/// Classify a measured RTT into a latency tier (0..=8).
pub fn latency_to_tier(rtt_ms: f64) -> u8 {
    LATENCY_THRESHOLDS_MS
        .iter()
        .position(|t| rtt_ms < *t)
        .unwrap_or(8) as u8
}

/// Community tuple announcing a latency tier.
pub fn latency_community(tier: u8) -> (u32, u32) {
    (COMMUNITY_ASN, tier.min(8) as u32 + 1)
}

/// Latency tier encoded in a community tuple, if any.
pub fn tier_from_community(com: (u32, u32)) -> Option<u8> {
    if com.0 == COMMUNITY_ASN && (1..=9).contains(&com.1) {
        Some((com.1 - 1) as u8)
    } else {
        None
    }
}

/// Link bandwidth class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Bandwidth {
    #[serde(rename = "100k")]
    K100,
    #[serde(rename = "10m")]
    M10,
    #[serde(rename = "100m")]
    M100,
    #[serde(rename = "1g")]
    G1,
    #[serde(rename = "10g")]
    G10,
}

impl Bandwidth {
    pub const ALL: [Bandwidth; 5] = [
        Bandwidth::K100,
        Bandwidth::M10,
        Bandwidth::M100,
        Bandwidth::G1,
        Bandwidth::G10,
    ];

    // Registry values are historical and not ordered by magnitude.
    pub fn community(self) -> (u32, u32) {
        let value = match self {
            Bandwidth::M100 => 21,
            Bandwidth::G10 => 22,
            Bandwidth::G1 => 23,
            Bandwidth::K100 => 24,
            Bandwidth::M10 => 25,
        };
        (COMMUNITY_ASN, value)
    }

    pub fn from_community(com: (u32, u32)) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.community() == com)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Bandwidth::K100 => "100k",
            Bandwidth::M10 => "10m",
            Bandwidth::M100 => "100m",
            Bandwidth::G1 => "1g",
            Bandwidth::G10 => "10g",
        }
    }
}

/// Tunnel encryption class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Crypto {
    None,
    Unsafe,
    Encrypted,
    Latency,
}

impl Crypto {
    pub const ALL: [Crypto; 4] = [Crypto::None, Crypto::Unsafe, Crypto::Encrypted, Crypto::Latency];

    pub fn community(self) -> (u32, u32) {
        let value = match self {
            Crypto::None => 31,
            Crypto::Unsafe => 32,
            Crypto::Encrypted => 33,
            Crypto::Latency => 34,
        };
        (COMMUNITY_ASN, value)
    }

    pub fn from_community(com: (u32, u32)) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.community() == com)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Crypto::None => "none",
            Crypto::Unsafe => "unsafe",
            Crypto::Encrypted => "encrypted",
            Crypto::Latency => "latency",
        }
    }
}

/// Geographic region codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Region {
    #[serde(rename = "eu")]
    Eu,
    #[serde(rename = "na-e")]
    NaEast,
    #[serde(rename = "na-c")]
    NaCentral,
    #[serde(rename = "na-w")]
    NaWest,
    #[serde(rename = "ca")]
    CentralAmerica,
    #[serde(rename = "sa")]
    SouthAmerica,
    #[serde(rename = "af")]
    Africa,
    #[serde(rename = "as-s")]
    AsiaSouth,
    #[serde(rename = "as-se")]
    AsiaSoutheast,
    #[serde(rename = "as-e")]
    AsiaEast,
    #[serde(rename = "oc")]
    Oceania,
    #[serde(rename = "me")]
    MiddleEast,
    #[serde(rename = "as-n")]
    AsiaNorth,
}

impl Region {
    pub const ALL: [Region; 13] = [
        Region::Eu,
        Region::NaEast,
        Region::NaCentral,
        Region::NaWest,
        Region::CentralAmerica,
        Region::SouthAmerica,
        Region::Africa,
        Region::AsiaSouth,
        Region::AsiaSoutheast,
        Region::AsiaEast,
        Region::Oceania,
        Region::MiddleEast,
        Region::AsiaNorth,
    ];

    pub fn community(self) -> (u32, u32) {
        let value = match self {
            Region::Eu => 41,
            Region::NaEast => 42,
            Region::NaCentral => 43,
            Region::NaWest => 44,
            Region::CentralAmerica => 45,
            Region::SouthAmerica => 46,
            Region::Africa => 47,
            Region::AsiaSouth => 48,
            Region::AsiaSoutheast => 49,
            Region::AsiaEast => 50,
            Region::Oceania => 51,
            Region::MiddleEast => 52,
            Region::AsiaNorth => 53,
        };
        (COMMUNITY_ASN, value)
    }

    pub fn from_community(com: (u32, u32)) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.community() == com)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Region::Eu => "eu",
            Region::NaEast => "na-e",
            Region::NaCentral => "na-c",
            Region::NaWest => "na-w",
            Region::CentralAmerica => "ca",
            Region::SouthAmerica => "sa",
            Region::Africa => "af",
            Region::AsiaSouth => "as-s",
            Region::AsiaSoutheast => "as-se",
            Region::AsiaEast => "as-e",
            Region::Oceania => "oc",
            Region::MiddleEast => "me",
            Region::AsiaNorth => "as-n",
        }
    }
}

/// Routing-policy actions encoded as communities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    NoExport,
    NoAnnounce,
}

impl Action {
    pub const ALL: [Action; 2] = [Action::NoExport, Action::NoAnnounce];

    pub fn community(self) -> (u32, u32) {
        match self {
            Action::NoExport => (COMMUNITY_ASN, 65281),
            Action::NoAnnounce => (COMMUNITY_ASN, 65282),
        }
    }

    pub fn from_community(com: (u32, u32)) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.community() == com)
    }
}
