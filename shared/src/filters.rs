//! Discovery filters and the fetch signature derived from them.
//!
//! `FilterState` only changes through [`FilterState::apply`], a pure reducer
//! over [`FilterAction`]s. Rejected actions leave the prior state untouched.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("invalid search radius '{0}': expected empty or a non-negative decimal")]
    InvalidRadius(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterState {
    pub country_code: Option<String>,
    pub state_code: Option<String>,
    pub spot_types: BTreeSet<String>,
    /// Raw radius input in km, kept as text so partial input like `"12."` survives.
    pub search_radius: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterAction {
    SetCountry(Option<String>),
    SetState(Option<String>),
    ToggleSpotType(String),
    SetRadius(String),
    Reset,
}

impl FilterState {
    pub fn apply(&self, action: FilterAction) -> Result<Self, FilterError> {
        let mut next = self.clone();
        match action {
            FilterAction::SetCountry(country) => {
                next.country_code = normalize_code(country);
                next.state_code = None;
            }
            FilterAction::SetState(state) => {
                next.state_code = normalize_code(state);
            }
            FilterAction::ToggleSpotType(spot_type) => {
                let spot_type = spot_type.trim().to_string();
                if !spot_type.is_empty() && !next.spot_types.remove(&spot_type) {
                    next.spot_types.insert(spot_type);
                }
            }
            FilterAction::SetRadius(input) => {
                if !is_valid_radius_input(&input) {
                    return Err(FilterError::InvalidRadius(input));
                }
                next.search_radius = input;
            }
            FilterAction::Reset => next = Self::default(),
        }
        Ok(next)
    }

    pub fn radius_km(&self) -> Option<f64> {
        if self.search_radius.is_empty() {
            return None;
        }
        self.search_radius.parse::<f64>().ok().filter(|r| r.is_finite())
    }

    pub fn spot_types_joined(&self) -> String {
        self.spot_types.iter().map(String::as_str).collect::<Vec<_>>().join(",")
    }
}

fn normalize_code(code: Option<String>) -> Option<String> {
    code.map(|c| c.trim().to_uppercase()).filter(|c| !c.is_empty())
}

/// Empty, or digits with at most one decimal point.
pub fn is_valid_radius_input(input: &str) -> bool {
    if input.is_empty() {
        return true;
    }
    let mut seen_dot = false;
    let mut seen_digit = false;
    for c in input.chars() {
        match c {
            '0'..='9' => seen_digit = true,
            '.' if !seen_dot => seen_dot = true,
            _ => return false,
        }
    }
    seen_digit
}

/// Deterministic signature of an effective query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchKey(String);

impl FetchKey {
    pub fn new(search_query: &str, filters: &FilterState, page: u32) -> Self {
        Self(format!(
            "{}|{}|{}|{}|{}",
            search_query.trim(),
            filters.country_code.as_deref().unwrap_or_default(),
            filters.state_code.as_deref().unwrap_or_default(),
            filters.spot_types_joined(),
            page
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FetchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn selecting_country_clears_state() {
        let state = FilterState::default()
            .apply(FilterAction::SetCountry(Some("in".into())))
            .unwrap()
            .apply(FilterAction::SetState(Some("KA".into())))
            .unwrap();
        assert_eq!(state.state_code.as_deref(), Some("KA"));

        let state = state
            .apply(FilterAction::SetCountry(Some("LK".into())))
            .unwrap();
        assert_eq!(state.country_code.as_deref(), Some("LK"));
        assert_eq!(state.state_code, None);
    }

    #[test]
    fn toggle_spot_type_adds_then_removes() {
        let state = FilterState::default()
            .apply(FilterAction::ToggleSpotType("beach".into()))
            .unwrap();
        assert!(state.spot_types.contains("beach"));
        let state = state
            .apply(FilterAction::ToggleSpotType("beach".into()))
            .unwrap();
        assert!(state.spot_types.is_empty());
    }

    #[test]
    fn radius_rejects_garbage_and_keeps_prior_state() {
        let state = FilterState::default()
            .apply(FilterAction::SetRadius("10".into()))
            .unwrap();

        let result = state.apply(FilterAction::SetRadius("12a".into()));
        assert_eq!(result, Err(FilterError::InvalidRadius("12a".into())));
        assert_eq!(state.search_radius, "10");

        let state = state.apply(FilterAction::SetRadius("12.5".into())).unwrap();
        assert_eq!(state.radius_km(), Some(12.5));

        let state = state.apply(FilterAction::SetRadius(String::new())).unwrap();
        assert_eq!(state.radius_km(), None);
    }

    #[test]
    fn radius_rejects_negative_and_double_dot() {
        assert!(!is_valid_radius_input("-1"));
        assert!(!is_valid_radius_input("1.2.3"));
        assert!(!is_valid_radius_input("."));
        assert!(is_valid_radius_input("12."));
    }

    #[test]
    fn reset_returns_default() {
        let state = FilterState::default()
            .apply(FilterAction::SetCountry(Some("IN".into())))
            .unwrap()
            .apply(FilterAction::Reset)
            .unwrap();
        assert_eq!(state, FilterState::default());
    }

    #[test]
    fn fetch_key_is_order_independent_for_spot_types() {
        let a = FilterState::default()
            .apply(FilterAction::ToggleSpotType("temple".into()))
            .unwrap()
            .apply(FilterAction::ToggleSpotType("beach".into()))
            .unwrap();
        let b = FilterState::default()
            .apply(FilterAction::ToggleSpotType("beach".into()))
            .unwrap()
            .apply(FilterAction::ToggleSpotType("temple".into()))
            .unwrap();
        assert_eq!(FetchKey::new("goa", &a, 1), FetchKey::new(" goa ", &b, 1));
        assert_ne!(FetchKey::new("goa", &a, 1), FetchKey::new("goa", &a, 2));
    }

    #[test]
    fn radius_does_not_affect_fetch_key() {
        let a = FilterState::default();
        let b = a.apply(FilterAction::SetRadius("5".into())).unwrap();
        assert_eq!(FetchKey::new("", &a, 1), FetchKey::new("", &b, 1));
    }

    proptest! {
        #[test]
        fn accepted_radius_always_parses(input in "[0-9]{1,4}(\\.[0-9]{0,3})?") {
            let state = FilterState::default().apply(FilterAction::SetRadius(input.clone())).unwrap();
            let parsed = state.radius_km().unwrap();
            prop_assert!(parsed >= 0.0);
        }

        #[test]
        fn radius_with_letters_is_rejected(prefix in "[0-9]{0,3}", letter in "[a-zA-Z]", suffix in "[0-9]{0,3}") {
            let input = format!("{prefix}{letter}{suffix}");
            let before = FilterState::default();
            prop_assert!(before.apply(FilterAction::SetRadius(input)).is_err());
        }
    }
}
