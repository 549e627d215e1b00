//! Overrides for place names that free-text search gets wrong.

/// Canonical search string and postal address for a known landmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LandmarkOverride {
    pub canonical: &'static str,
    pub address: &'static str,
}

const MYSORE_PALACE: LandmarkOverride = LandmarkOverride {
    canonical: "Mysore Palace, Mysuru, Karnataka",
    address: "Mysore Palace, Sayyaji Rao Road, Mysuru, Karnataka 570001",
};

const TAJ_MAHAL: LandmarkOverride = LandmarkOverride {
    canonical: "Taj Mahal, Agra, Uttar Pradesh",
    address: "Taj Mahal, Dharmapuri, Forest Colony, Tajganj, Agra, Uttar Pradesh 282001",
};

const GOLDEN_TEMPLE: LandmarkOverride = LandmarkOverride {
    canonical: "Harmandir Sahib, Amritsar, Punjab",
    address: "Golden Temple Road, Atta Mandi, Katra Ahluwalia, Amritsar, Punjab 143006",
};

const GATEWAY_OF_INDIA: LandmarkOverride = LandmarkOverride {
    canonical: "Gateway of India, Mumbai, Maharashtra",
    address: "Apollo Bandar, Colaba, Mumbai, Maharashtra 400001",
};

const CHARMINAR: LandmarkOverride = LandmarkOverride {
    canonical: "Charminar, Hyderabad, Telangana",
    address: "Charminar Road, Char Kaman, Ghansi Bazaar, Hyderabad, Telangana 500002",
};

/// Exact synonyms, matched after normalization.
const SYNONYMS: &[(&str, LandmarkOverride)] = &[
    ("mysure", MYSORE_PALACE),
    ("mysore", MYSORE_PALACE),
    ("mysuru", MYSORE_PALACE),
    ("mysore palace", MYSORE_PALACE),
    ("amba vilas", MYSORE_PALACE),
    ("amba vilas palace", MYSORE_PALACE),
    ("taj", TAJ_MAHAL),
    ("taj mahal", TAJ_MAHAL),
    ("tajmahal", TAJ_MAHAL),
    ("golden temple", GOLDEN_TEMPLE),
    ("harmandir sahib", GOLDEN_TEMPLE),
    ("darbar sahib", GOLDEN_TEMPLE),
    ("gateway of india", GATEWAY_OF_INDIA),
    ("gateway", GATEWAY_OF_INDIA),
    ("charminar", CHARMINAR),
    ("char minar", CHARMINAR),
];

pub fn lookup(name: &str) -> Option<&'static LandmarkOverride> {
    let normalized = normalize(name);
    SYNONYMS
        .iter()
        .find(|(synonym, _)| *synonym == normalized)
        .map(|(_, landmark)| landmark)
}

fn normalize(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
