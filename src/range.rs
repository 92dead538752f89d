//! Key ranges and the builder that turns user range specs into them.

use crate::error::{Result, StoreError};
use crate::types::Key;
use serde::{Deserialize, Serialize};
use std::ops::Bound;

/// One end of a range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub value: Key,
    /// Exclude `value` itself from the range.
    pub open: bool,
}

impl Endpoint {
    pub fn closed(value: impl Into<Key>) -> Self {
        Self {
            value: value.into(),
            open: false,
        }
    }

    pub fn open(value: impl Into<Key>) -> Self {
        Self {
            value: value.into(),
            open: true,
        }
    }

    fn as_bound(&self) -> Bound<&Key> {
        if self.open {
            Bound::Excluded(&self.value)
        } else {
            Bound::Included(&self.value)
        }
    }
}

/// A validated, non-empty-by-construction key range.
///
/// At most one end may be missing; use `None` where a scan covers every key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    lower: Option<Endpoint>,
    upper: Option<Endpoint>,
}

impl KeyRange {
    /// Range matching exactly one key.
    pub fn only(key: impl Into<Key>) -> Self {
        let key = key.into();
        Self {
            lower: Some(Endpoint::closed(key.clone())),
            upper: Some(Endpoint::closed(key)),
        }
    }

    /// Keys at or above (`open`: strictly above) `lower`.
    pub fn lower_bound(lower: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: Some(Endpoint {
                value: lower.into(),
                open,
            }),
            upper: None,
        }
    }

    /// Keys at or below (`open`: strictly below) `upper`.
    pub fn upper_bound(upper: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: None,
            upper: Some(Endpoint {
                value: upper.into(),
                open,
            }),
        }
    }

    /// Keys between `lower` and `upper`.
    ///
    /// Fails when `lower > upper`, or when they are equal and either end is open.
    pub fn bound(
        lower: impl Into<Key>,
        upper: impl Into<Key>,
        lower_open: bool,
        upper_open: bool,
    ) -> Result<Self> {
        let lower = lower.into();
        let upper = upper.into();
        if lower > upper {
            return Err(StoreError::InvalidRange(format!(
                "lower bound {} is greater than upper bound {}",
                lower, upper
            )));
        }
        if lower == upper && (lower_open || upper_open) {
            return Err(StoreError::InvalidRange(format!(
                "range around {} is empty",
                lower
            )));
        }
        Ok(Self {
            lower: Some(Endpoint {
                value: lower,
                open: lower_open,
            }),
            upper: Some(Endpoint {
                value: upper,
                open: upper_open,
            }),
        })
    }

    pub fn lower(&self) -> Option<&Endpoint> {
        self.lower.as_ref()
    }

    pub fn upper(&self) -> Option<&Endpoint> {
        self.upper.as_ref()
    }

    pub fn contains(&self, key: &Key) -> bool {
        let above = match &self.lower {
            Some(end) if end.open => key > &end.value,
            Some(end) => key >= &end.value,
            None => true,
        };
        let below = match &self.upper {
            Some(end) if end.open => key < &end.value,
            Some(end) => key <= &end.value,
            None => true,
        };
        above && below
    }

    pub(crate) fn lower_as_bound(&self) -> Bound<&Key> {
        self.lower
            .as_ref()
            .map(Endpoint::as_bound)
            .unwrap_or(Bound::Unbounded)
    }

    pub(crate) fn upper_as_bound(&self) -> Bound<&Key> {
        self.upper
            .as_ref()
            .map(Endpoint::as_bound)
            .unwrap_or(Bound::Unbounded)
    }
}

impl From<Key> for KeyRange {
    fn from(key: Key) -> Self {
        KeyRange::only(key)
    }
}

/// Bounds for `BTreeMap::range`, or `None` if they select nothing.
///
/// `BTreeMap::range` panics on inverted bounds, so every scan goes through here.
pub(crate) fn scan_bounds<'a>(
    lower: Bound<&'a Key>,
    upper: Bound<&'a Key>,
) -> Option<(Bound<&'a Key>, Bound<&'a Key>)> {
    let (lo, lo_open) = match lower {
        Bound::Included(k) => (k, false),
        Bound::Excluded(k) => (k, true),
        Bound::Unbounded => return Some((lower, upper)),
    };
    let (hi, hi_open) = match upper {
        Bound::Included(k) => (k, false),
        Bound::Excluded(k) => (k, true),
        Bound::Unbounded => return Some((lower, upper)),
    };
    if lo > hi || (lo == hi && (lo_open || hi_open)) {
        None
    } else {
        Some((lower, upper))
    }
}

/// A caller's range request: either end may be given, but not neither.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSpec {
    pub lower: Option<Endpoint>,
    pub upper: Option<Endpoint>,
}

impl RangeSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lower(mut self, value: impl Into<Key>, open: bool) -> Self {
        self.lower = Some(Endpoint {
            value: value.into(),
            open,
        });
        self
    }

    pub fn upper(mut self, value: impl Into<Key>, open: bool) -> Self {
        self.upper = Some(Endpoint {
            value: value.into(),
            open,
        });
        self
    }

    /// Build the engine range: bounded when both ends are present,
    /// half-open when only one is.
    pub fn to_key_range(&self) -> Result<KeyRange> {
        match (&self.lower, &self.upper) {
            (Some(lower), Some(upper)) => KeyRange::bound(
                lower.value.clone(),
                upper.value.clone(),
                lower.open,
                upper.open,
            ),
            (Some(lower), None) => Ok(KeyRange::lower_bound(lower.value.clone(), lower.open)),
            (None, Some(upper)) => Ok(KeyRange::upper_bound(upper.value.clone(), upper.open)),
            (None, None) => Err(StoreError::InvalidRange(
                "a range needs a lower or an upper bound".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_keeps_lower_below_upper() {
        let range = RangeSpec::new()
            .lower(5, false)
            .upper(10, true)
            .to_key_range()
            .unwrap();

        assert_eq!(range.lower().unwrap().value, Key::from(5));
        assert_eq!(range.upper().unwrap().value, Key::from(10));
        assert!(range.contains(&Key::from(5)));
        assert!(range.contains(&Key::from(7)));
        assert!(!range.contains(&Key::from(10)));
        assert!(!range.contains(&Key::from(3)));
    }

    #[test]
    fn test_half_open_ranges() {
        let above = RangeSpec::new().lower(5, true).to_key_range().unwrap();
        assert!(above.upper().is_none());
        assert!(!above.contains(&Key::from(5)));
        assert!(above.contains(&Key::from(1_000_000)));

        let below = RangeSpec::new().upper("m", false).to_key_range().unwrap();
        assert!(below.lower().is_none());
        assert!(below.contains(&Key::from("m")));
        assert!(below.contains(&Key::from(42)));
        assert!(!below.contains(&Key::from("n")));
    }

    #[test]
    fn test_missing_bounds_is_invalid() {
        let result = RangeSpec::new().to_key_range();
        assert!(matches!(result, Err(StoreError::InvalidRange(_))));
    }

    #[test]
    fn test_inverted_and_empty_bounds_rejected() {
        assert!(KeyRange::bound(10, 5, false, false).is_err());
        assert!(KeyRange::bound(5, 5, true, false).is_err());
        assert!(KeyRange::bound(5, 5, false, false).is_ok());
    }

    #[test]
    fn test_scan_bounds() {
        let five = Key::from(5);
        let six = Key::from(6);
        assert!(scan_bounds(Bound::Excluded(&five), Bound::Excluded(&five)).is_none());
        assert!(scan_bounds(Bound::Included(&six), Bound::Included(&five)).is_none());
        assert!(scan_bounds(Bound::Excluded(&five), Bound::Included(&six)).is_some());
        assert!(scan_bounds(Bound::Unbounded, Bound::Included(&five)).is_some());
    }
}
