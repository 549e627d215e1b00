use std::cmp::Ordering;

use crate::model::{RankedLocale, ValidatedCoordinate};

/// Orders locales by distance when the user position is known, newest first
/// otherwise. Known distances always precede unknown ones.
///
/// Pure and stable: equal-rank elements keep their relative order, and a
/// final id comparison makes the order total.
#[must_use]
pub fn sort_locales(
    mut locales: Vec<RankedLocale>,
    user_location: Option<ValidatedCoordinate>,
) -> Vec<RankedLocale> {
    if user_location.is_some() {
        locales.sort_by(compare_by_distance);
    } else {
        locales.sort_by(compare_by_recency);
    }
    locales
}

pub fn compare_by_distance(a: &RankedLocale, b: &RankedLocale) -> Ordering {
    match (usable_distance(a), usable_distance(b)) {
        (Some(x), Some(y)) => x.total_cmp(&y).then_with(|| compare_by_recency(a, b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => compare_by_recency(a, b),
    }
}

pub fn compare_by_recency(a: &RankedLocale, b: &RankedLocale) -> Ordering {
    b.locale
        .created_at
        .cmp(&a.locale.created_at)
        .then_with(|| a.id().cmp(b.id()))
}

/// A distance only counts when the locale's coordinate is valid.
fn usable_distance(locale: &RankedLocale) -> Option<f64> {
    if locale.coordinate.is_none() {
        return None;
    }
    locale.distance_km.filter(|d| d.is_finite() && *d >= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Locale, UnixTimeMs};
    use proptest::prelude::*;

    fn ranked(id: &str, created: u64, coord: Option<(f64, f64)>, km: Option<f64>) -> RankedLocale {
        let mut locale = Locale::new(id, id, UnixTimeMs(created));
        if let Some((lat, lon)) = coord {
            locale = locale.with_coordinate(lat, lon);
        }
        let mut r = RankedLocale::new(locale);
        r.distance_km = km;
        r
    }

    fn ids(list: &[RankedLocale]) -> Vec<&str> {
        list.iter().map(|r| r.id().as_str()).collect()
    }

    fn user() -> Option<ValidatedCoordinate> {
        ValidatedCoordinate::new(12.97, 77.59).ok()
    }

    #[test]
    fn known_distance_precedes_unknown_regardless_of_value() {
        let sorted = sort_locales(
            vec![
                ranked("unknown-new", 900, None, None),
                ranked("far", 1, Some((28.6, 77.2)), Some(1_750.0)),
                ranked("near", 2, Some((12.3, 76.6)), Some(128.0)),
            ],
            user(),
        );
        assert_eq!(ids(&sorted), vec!["near", "far", "unknown-new"]);
    }

    #[test]
    fn unknown_distances_fall_back_to_newest_first() {
        let sorted = sort_locales(
            vec![
                ranked("old", 1, None, None),
                ranked("new", 5, None, None),
                ranked("mid", 3, None, None),
            ],
            user(),
        );
        assert_eq!(ids(&sorted), vec!["new", "mid", "old"]);
    }

    #[test]
    fn without_user_location_distance_is_ignored() {
        let sorted = sort_locales(
            vec![
                ranked("near-old", 1, Some((12.3, 76.6)), Some(1.0)),
                ranked("far-new", 9, Some((28.6, 77.2)), Some(900.0)),
            ],
            None,
        );
        assert_eq!(ids(&sorted), vec!["far-new", "near-old"]);
    }

    #[test]
    fn placeholder_coordinate_sorts_after_known_distances() {
        let sorted = sort_locales(
            vec![
                ranked("zero", 100, Some((0.0, 0.0)), Some(0.0)),
                ranked("real", 1, Some((12.3, 76.6)), Some(4_000.0)),
            ],
            user(),
        );
        assert_eq!(ids(&sorted), vec!["real", "zero"]);
    }

    #[test]
    fn ties_break_on_recency_then_id() {
        let sorted = sort_locales(
            vec![
                ranked("b", 1, Some((12.3, 76.6)), Some(5.0)),
                ranked("a", 1, Some((12.3, 76.6)), Some(5.0)),
                ranked("c", 2, Some((12.3, 76.6)), Some(5.0)),
            ],
            user(),
        );
        assert_eq!(ids(&sorted), vec!["c", "a", "b"]);
    }

    fn arb_ranked() -> impl Strategy<Value = RankedLocale> {
        (
            "[a-z]{1,6}",
            0u64..50,
            proptest::option::of((-95.0f64..95.0, -185.0f64..185.0)),
            proptest::option::of(0.0f64..5_000.0),
        )
            .prop_map(|(id, created, coord, km)| ranked(&id, created, coord, km))
    }

    proptest! {
        #[test]
        fn sorting_twice_is_identical(list in proptest::collection::vec(arb_ranked(), 0..30)) {
            let once = sort_locales(list, user());
            let twice = sort_locales(once.clone(), user());
            prop_assert_eq!(ids(&once), ids(&twice));
        }

        #[test]
        fn known_distances_form_a_sorted_prefix(list in proptest::collection::vec(arb_ranked(), 0..30)) {
            let sorted = sort_locales(list, user());
            let known: Vec<bool> = sorted.iter().map(|r| usable_distance(r).is_some()).collect();
            let boundary = known.iter().position(|k| !k).unwrap_or(known.len());
            prop_assert!(known[boundary..].iter().all(|k| !k));

            let distances: Vec<f64> = sorted[..boundary].iter().filter_map(usable_distance).collect();
            prop_assert!(distances.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
