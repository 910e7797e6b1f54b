//! Densely insertable ordering keys for sibling records.
//!
//! A `SortKey` is a list of non-negative integer components compared
//! lexicographically, with a strict prefix sorting before the longer key.
//! The string form zero-pads every component to eight digits and joins them
//! with `:`, so naive string comparison agrees with component comparison.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, error};

/// Smallest component value produced by key generation
pub const MIN_COMPONENT: u64 = 1;

/// Exclusive upper bound for generated components; keeps the string form eight digits wide
pub const MAX_COMPONENT: u64 = 100_000_000;

/// Trailing component appended when no existing component can be bumped
const APPEND_COMPONENT: u64 = 1000;

/// Zero-pad width of each component in the string form
const COMPONENT_WIDTH: usize = 8;

const SEPARATOR: char = ':';

/// Default retry bound for [`SortKey::between_unique`]
pub const DEFAULT_UNIQUE_ATTEMPTS: usize = 10;

/// Errors produced while generating sort keys
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SortKeyError {
    #[error("Cannot insert between identical keys {0}")]
    Identical(String),

    #[error("No room left in the key space near {0}")]
    Exhausted(String),
}

/// Result type for sort key generation
pub type SortKeyResult<T> = Result<T, SortKeyError>;

/// An ordered position among siblings
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct SortKey {
    components: Vec<u64>,
}

impl SortKey {
    pub fn from_components(components: Vec<u64>) -> Self {
        if components.is_empty() {
            return Self::default();
        }
        Self { components }
    }

    /// Key used when a list has no neighbours at all
    pub fn initial() -> Self {
        Self {
            components: vec![MAX_COMPONENT / 2],
        }
    }

    pub fn components(&self) -> &[u64] {
        &self.components
    }

    /// Order against a possibly missing key; a missing key always sorts last.
    pub fn compare(&self, other: Option<&SortKey>) -> Ordering {
        match other {
            Some(other) => self.cmp(other),
            None => Ordering::Less,
        }
    }

    /// A key strictly between `left` and `right`, in either argument order.
    pub fn between(left: &SortKey, right: &SortKey) -> SortKeyResult<SortKey> {
        let (lo, hi) = match left.cmp(right) {
            Ordering::Less => (left, right),
            Ordering::Greater => (right, left),
            Ordering::Equal => return Err(SortKeyError::Identical(left.to_string())),
        };

        let shared = lo.components.len().min(hi.components.len());
        for index in 0..shared {
            let (a, b) = (lo.components[index], hi.components[index]);
            if a == b {
                continue;
            }

            let diff = b - a;
            if diff > 1 {
                // Rounds up; stays within `b` for any u64 components
                let mut components = lo.components[..index].to_vec();
                components.push(a + (diff - diff / 2));
                return Ok(SortKey { components });
            }

            // Adjacent at `index`: anything above `lo` sharing lo[..=index] fits.
            return Ok(lo.successor_from(index + 1));
        }

        // `lo` is a strict prefix of `hi`
        let tail = descend_below(&hi.components[shared..])
            .ok_or_else(|| SortKeyError::Exhausted(format!("{}..{}", lo, hi)))?;
        let mut components = lo.components.clone();
        components.extend(tail);
        Ok(SortKey { components })
    }

    /// A key between two optional neighbours that does not collide with `pool`.
    ///
    /// With only a left neighbour the key follows it, with only a right
    /// neighbour it precedes it. Each collision narrows the range toward the
    /// given bound; after `max_attempts` retries the key space is considered
    /// exhausted and an error is returned rather than a colliding key.
    pub fn between_unique(
        left: Option<&SortKey>,
        right: Option<&SortKey>,
        pool: &[SortKey],
        max_attempts: usize,
    ) -> SortKeyResult<SortKey> {
        let mut lo = left.cloned();
        let mut hi = right.cloned();

        for attempt in 0..=max_attempts {
            let candidate = match (&lo, &hi) {
                (Some(lo), Some(hi)) => SortKey::between(lo, hi)?,
                (Some(lo), None) => lo.add(1),
                (None, Some(hi)) => hi.preceding()?,
                (None, None) => SortKey::initial(),
            };

            if !pool.contains(&candidate) {
                return Ok(candidate);
            }

            debug!(key = %candidate, attempt, "Sort key collided with an existing sibling");
            if left.is_some() {
                hi = Some(candidate);
            } else {
                lo = Some(candidate);
            }
        }

        let near = left.or(right).map(|k| k.to_string()).unwrap_or_default();
        error!(near = %near, max_attempts, "Sort key space exhausted");
        Err(SortKeyError::Exhausted(near))
    }

    /// An adjacent key: bumps the first component that stays within range by
    /// `delta` and drops the rest, or appends a trailing component if none can.
    pub fn add(&self, delta: i64) -> SortKey {
        let mut components = Vec::with_capacity(self.components.len() + 1);
        for &current in &self.components {
            let bumped = i64::try_from(current)
                .ok()
                .and_then(|c| c.checked_add(delta))
                .and_then(|v| u64::try_from(v).ok())
                .filter(|v| (MIN_COMPONENT..MAX_COMPONENT).contains(v));
            match bumped {
                Some(value) => {
                    components.push(value);
                    return SortKey { components };
                }
                None => components.push(current),
            }
        }
        components.push(APPEND_COMPONENT);
        SortKey { components }
    }

    /// A key strictly before this one
    pub fn preceding(&self) -> SortKeyResult<SortKey> {
        let candidate = self.add(-1);
        if candidate < *self {
            return Ok(candidate);
        }
        descend_below(&self.components)
            .map(|components| SortKey { components })
            .ok_or_else(|| SortKeyError::Exhausted(self.to_string()))
    }

    /// `count` evenly spaced single-component keys, used to renumber siblings
    pub fn spaced(count: usize) -> Vec<SortKey> {
        let step = (MAX_COMPONENT / (count as u64).saturating_add(1)).max(1);
        (1..=count as u64)
            .map(|i| SortKey {
                components: vec![i * step],
            })
            .collect()
    }

    /// Smallest-effort key above `self` that keeps `components[..keep]`
    fn successor_from(&self, keep: usize) -> SortKey {
        match self.components.get(keep) {
            Some(&next) if next < MAX_COMPONENT - 1 => {
                let mut components = self.components[..keep].to_vec();
                components.push(next + (MAX_COMPONENT - next) / 2);
                SortKey { components }
            }
            _ => {
                let mut components = self.components.clone();
                components.push(MAX_COMPONENT / 2);
                SortKey { components }
            }
        }
    }
}

/// A non-empty component list ordered strictly before `tail`, if one exists
fn descend_below(tail: &[u64]) -> Option<Vec<u64>> {
    let first = *tail.first()?;
    if first > MIN_COMPONENT {
        return Some(vec![MIN_COMPONENT + (first - MIN_COMPONENT) / 2]);
    }
    if tail.len() > 1 {
        // Keep `first` and descend into the rest; `[first]` alone is a smaller prefix.
        let mut components = vec![first];
        components.extend(descend_below(&tail[1..]).unwrap_or_default());
        return Some(components);
    }
    if first == MIN_COMPONENT {
        return Some(vec![0, MAX_COMPONENT / 2]);
    }
    None
}

impl Default for SortKey {
    fn default() -> Self {
        Self {
            components: vec![MIN_COMPONENT],
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", SEPARATOR)?;
            }
            write!(f, "{:0width$}", component, width = COMPONENT_WIDTH)?;
        }
        Ok(())
    }
}

impl FromStr for SortKey {
    type Err = std::convert::Infallible;

    /// Lenient parse: unreadable components become 0, an empty string the default key
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::default());
        }
        let components = s
            .split(SEPARATOR)
            .map(|part| part.trim().parse::<u64>().unwrap_or(0))
            .collect();
        Ok(Self::from_components(components))
    }
}

impl From<String> for SortKey {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(key) => key,
            Err(never) => match never {},
        }
    }
}

impl From<SortKey> for String {
    fn from(key: SortKey) -> Self {
        key.to_string()
    }
}

impl From<u64> for SortKey {
    fn from(value: u64) -> Self {
        Self {
            components: vec![value],
        }
    }
}

impl From<Vec<u64>> for SortKey {
    fn from(components: Vec<u64>) -> Self {
        Self::from_components(components)
    }
}
