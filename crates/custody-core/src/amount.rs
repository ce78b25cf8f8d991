//! Precision-safe amount types for ledger accounting.
//!
//! Chains account in integer base units while orders and wallet reports use
//! decimal-adjusted values. `RawAmount` and `DisplayAmount` are distinct types
//! so a single computation can never mix the two; crossing between them goes
//! through an explicit, exact conversion with the coin's decimals.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};
use std::str::FromStr;

use crate::error::{CoreError, Result};

/// Largest number of decimals a `DisplayAmount` can represent exactly.
pub const MAX_DECIMALS: u32 = 28;

/// Decimal-adjusted amount (`raw / 10^decimals`).
///
/// Wraps `Decimal` so that display values cannot be added to raw
/// base-unit values by accident.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DisplayAmount(pub Decimal);

impl DisplayAmount {
    pub const ZERO: Self = Self(Decimal::ZERO);

    #[inline]
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    #[inline]
    pub fn inner(&self) -> Decimal {
        self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    #[inline]
    pub fn is_positive(&self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    /// Subtract, flooring at zero.
    #[inline]
    pub fn saturating_sub(self, rhs: Self) -> Self {
        if rhs.0 >= self.0 {
            Self::ZERO
        } else {
            Self(self.0 - rhs.0)
        }
    }

    /// Convert to raw base units.
    ///
    /// Fails if the value is negative, carries more fractional digits than
    /// `decimals`, or does not fit in `u128`. Never rounds.
    pub fn to_raw(&self, decimals: u32) -> Result<RawAmount> {
        if decimals > MAX_DECIMALS {
            return Err(CoreError::InvalidAmount(format!(
                "decimals {decimals} exceeds {MAX_DECIMALS}"
            )));
        }
        if self.0.is_sign_negative() && !self.0.is_zero() {
            return Err(CoreError::InvalidAmount(format!("negative amount {}", self.0)));
        }

        let normalized = self.0.normalize();
        let scale = normalized.scale();
        if scale > decimals {
            return Err(CoreError::PrecisionLoss {
                value: self.0.to_string(),
                decimals,
            });
        }

        let mantissa = u128::try_from(normalized.mantissa())
            .map_err(|_| CoreError::InvalidAmount(format!("negative amount {}", self.0)))?;
        let factor = 10u128
            .checked_pow(decimals - scale)
            .ok_or_else(|| CoreError::AmountOverflow(self.0.to_string()))?;
        mantissa
            .checked_mul(factor)
            .map(RawAmount)
            .ok_or_else(|| CoreError::AmountOverflow(self.0.to_string()))
    }
}

impl fmt::Display for DisplayAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DisplayAmount {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl From<Decimal> for DisplayAmount {
    fn from(d: Decimal) -> Self {
        Self(d)
    }
}

impl Add for DisplayAmount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for DisplayAmount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl Sum for DisplayAmount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, x| acc + x)
    }
}

/// Amount in raw chain base units (satoshi, wei, ...).
///
/// Always an integer. Serialized as a decimal string so 128-bit values
/// survive JSON consumers that parse numbers as doubles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RawAmount(pub u128);

impl RawAmount {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub fn new(value: u128) -> Self {
        Self(value)
    }

    #[inline]
    pub fn inner(&self) -> u128 {
        self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    #[inline]
    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }

    /// Convert to a decimal-adjusted amount: `raw / 10^decimals`, exactly.
    pub fn to_display(&self, decimals: u32) -> Result<DisplayAmount> {
        if decimals > MAX_DECIMALS {
            return Err(CoreError::InvalidAmount(format!(
                "decimals {decimals} exceeds {MAX_DECIMALS}"
            )));
        }
        let signed =
            i128::try_from(self.0).map_err(|_| CoreError::AmountOverflow(self.0.to_string()))?;
        Decimal::try_from_i128_with_scale(signed, decimals)
            .map(DisplayAmount)
            .map_err(|_| CoreError::AmountOverflow(self.0.to_string()))
    }
}

impl fmt::Display for RawAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RawAmount {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim()
            .parse::<u128>()
            .map(Self)
            .map_err(|e| CoreError::InvalidAmount(format!("{s}: {e}")))
    }
}

impl Serialize for RawAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RawAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_raw_to_display_exact() {
        let raw = RawAmount::new(1_234_567_890_000_000_000);
        let display = raw.to_display(18).unwrap();
        assert_eq!(display.inner(), dec!(1.23456789));
    }

    #[test]
    fn test_display_to_raw_exact() {
        let display = DisplayAmount::new(dec!(10.5));
        assert_eq!(display.to_raw(8).unwrap(), RawAmount::new(1_050_000_000));
        assert_eq!(
            DisplayAmount::new(dec!(10)).to_raw(0).unwrap(),
            RawAmount::new(10)
        );
    }

    #[test]
    fn test_display_to_raw_rejects_excess_precision() {
        let display = DisplayAmount::new(dec!(0.123456789));
        assert!(matches!(
            display.to_raw(8),
            Err(CoreError::PrecisionLoss { decimals: 8, .. })
        ));
    }

    #[test]
    fn test_display_to_raw_rejects_negative() {
        assert!(DisplayAmount::new(dec!(-1)).to_raw(8).is_err());
    }

    #[test]
    fn test_decimal_integrity_across_scales() {
        // decimal_value == raw_value / 10^decimals for a spread of magnitudes
        let raws = [0u128, 1, 7, 100_000_000, 2_100_000_000_000_000, 79_228_162_514];
        for decimals in [0u32, 2, 6, 8, 9, 18] {
            for raw in raws {
                let raw = RawAmount::new(raw);
                let display = raw.to_display(decimals).unwrap();
                let expected = Decimal::from_i128_with_scale(raw.inner() as i128, decimals);
                assert_eq!(display.inner(), expected);
                assert_eq!(display.to_raw(decimals).unwrap(), raw);
            }
        }
    }

    #[test]
    fn test_raw_overflow_reported() {
        let huge = RawAmount::new(u128::MAX);
        assert!(matches!(
            huge.to_display(18),
            Err(CoreError::AmountOverflow(_))
        ));
    }

    #[test]
    fn test_raw_amount_serializes_as_string() {
        let raw = RawAmount::new(340_282_366_920_938_463_463);
        let json = serde_json::to_string(&raw).unwrap();
        assert_eq!(json, "\"340282366920938463463\"");
        let back: RawAmount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn test_saturating_sub() {
        let a = DisplayAmount::new(dec!(1));
        let b = DisplayAmount::new(dec!(3));
        assert_eq!(a.saturating_sub(b), DisplayAmount::ZERO);
        assert_eq!(b.saturating_sub(a).inner(), dec!(2));
    }
}
