use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wallet point amounts are integral minor units; there is no fractional
/// point anywhere in the ledger, so the representation is a plain i64.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Points(i64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PointsError {
    #[error("point amount must be positive, got {0}")]
    NonPositive(i64),
    #[error("point arithmetic overflow")]
    Overflow,
}

impl Points {
    pub const ZERO: Points = Points(0);

    /// Amount accepted from a client: strictly positive.
    pub fn positive(raw: i64) -> Result<Self, PointsError> {
        if raw <= 0 {
            return Err(PointsError::NonPositive(raw));
        }
        Ok(Self(raw))
    }

    /// Amount read back from the ledger; zero is legal (drained lot).
    pub fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Points) -> Result<Points, PointsError> {
        self.0
            .checked_add(other.0)
            .map(Points)
            .ok_or(PointsError::Overflow)
    }

    pub fn checked_sub(self, other: Points) -> Result<Points, PointsError> {
        self.0
            .checked_sub(other.0)
            .map(Points)
            .ok_or(PointsError::Overflow)
    }

    pub fn min(self, other: Points) -> Points {
        Points(self.0.min(other.0))
    }
}

impl std::fmt::Display for Points {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Points> for i64 {
    fn from(value: Points) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positive_rejects_zero_and_negative() {
        assert_eq!(Points::positive(0), Err(PointsError::NonPositive(0)));
        assert_eq!(Points::positive(-5), Err(PointsError::NonPositive(-5)));
        assert_eq!(Points::positive(100).unwrap().raw(), 100);
    }

    #[test]
    fn test_checked_arithmetic() {
        let a = Points::from_raw(i64::MAX);
        assert_eq!(a.checked_add(Points::from_raw(1)), Err(PointsError::Overflow));
        let b = Points::from_raw(150);
        assert_eq!(b.checked_sub(Points::from_raw(50)).unwrap().raw(), 100);
    }

    #[test]
    fn test_serde_transparent() {
        let v: Points = serde_json::from_str("1234").unwrap();
        assert_eq!(v.raw(), 1234);
        assert_eq!(serde_json::to_string(&v).unwrap(), "1234");
    }
}
