//! Fixed-point monetary amounts.
//!
//! Values are held as integer multiples of the minimum unit (10^-8). On the
//! wire an amount is a plain decimal number; it is canonicalised to eight
//! decimal places both for signing and for storage.

use crate::error::ChainError;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Number of decimal places carried by every amount.
pub const DECIMALS: u32 = 8;
/// Minimum units per whole coin.
pub const UNITS_PER_COIN: u64 = 100_000_000;
/// Largest amount that survives a round trip through an IEEE double exactly.
pub const MAX_UNITS: u64 = 9_000_000_000_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);
    /// The smallest representable non-zero amount (0.00000001).
    pub const MIN_UNIT: Amount = Amount(1);

    pub const fn from_units(units: u64) -> Self {
        Amount(units)
    }

    pub const fn from_coins(coins: u64) -> Self {
        Amount(coins * UNITS_PER_COIN)
    }

    pub fn units(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Converts a decimal number, rounding to the nearest minimum unit.
    pub fn from_f64(value: f64) -> Result<Self, ChainError> {
        if !value.is_finite() {
            return Err(ChainError::InvalidAmount(format!(
                "{} is not a finite number",
                value
            )));
        }
        if value < 0.0 {
            return Err(ChainError::InvalidAmount(format!(
                "{} is negative",
                value
            )));
        }
        let units = (value * UNITS_PER_COIN as f64).round();
        if units > MAX_UNITS as f64 {
            return Err(ChainError::InvalidAmount(format!(
                "{} exceeds the maximum amount",
                value
            )));
        }
        Ok(Amount(units as u64))
    }

    pub fn to_f64(&self) -> f64 {
        self.0 as f64 / UNITS_PER_COIN as f64
    }

    /// The eight-decimal rendering used in signing payloads and tx ids.
    pub fn to_fixed(&self) -> String {
        format!("{}.{:08}", self.0 / UNITS_PER_COIN, self.0 % UNITS_PER_COIN)
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0
            .checked_add(other.0)
            .filter(|sum| *sum <= MAX_UNITS)
            .map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    /// Fraction expressed in basis points, rounded down to the minimum unit.
    pub fn basis_points(self, bp: u32) -> Amount {
        Amount(((self.0 as u128 * bp as u128) / 10_000) as u64)
    }

    /// Sums a sequence, failing on overflow.
    pub fn try_sum<I: IntoIterator<Item = Amount>>(iter: I) -> Result<Amount, ChainError> {
        iter.into_iter().try_fold(Amount::ZERO, |acc, a| {
            acc.checked_add(a)
                .ok_or_else(|| ChainError::InvalidAmount("amount overflow".to_string()))
        })
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_fixed())
    }
}

impl FromStr for Amount {
    type Err = ChainError;

    /// Parses a plain decimal string exactly, without going through floats.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ChainError::InvalidAmount(format!("'{}' is not a decimal amount", s));
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        if frac.len() > DECIMALS as usize {
            return Err(ChainError::InvalidAmount(format!(
                "'{}' has more than {} decimal places",
                s, DECIMALS
            )));
        }
        let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| invalid())? };
        let frac_units: u64 = if frac.is_empty() {
            0
        } else {
            format!("{:0<8}", frac).parse().map_err(|_| invalid())?
        };
        whole
            .checked_mul(UNITS_PER_COIN)
            .and_then(|w| w.checked_add(frac_units))
            .filter(|u| *u <= MAX_UNITS)
            .map(Amount)
            .ok_or_else(|| ChainError::InvalidAmount(format!("'{}' exceeds the maximum amount", s)))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_f64())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Amount::from_f64(value).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_formatting() {
        assert_eq!(Amount::from_coins(3).to_fixed(), "3.00000000");
        assert_eq!(Amount::from_units(250_000_000).to_fixed(), "2.50000000");
        assert_eq!(Amount::MIN_UNIT.to_fixed(), "0.00000001");
    }

    #[test]
    fn test_from_f64_rounds_to_minimum_unit() {
        assert_eq!(Amount::from_f64(0.1).unwrap().units(), 10_000_000);
        assert_eq!(Amount::from_f64(97.5).unwrap().to_fixed(), "97.50000000");
        assert!(Amount::from_f64(-1.0).is_err());
        assert!(Amount::from_f64(f64::NAN).is_err());
    }

    #[test]
    fn test_parse_decimal_string() {
        assert_eq!("10".parse::<Amount>().unwrap(), Amount::from_coins(10));
        assert_eq!("0.025".parse::<Amount>().unwrap().units(), 2_500_000);
        assert!("1.123456789".parse::<Amount>().is_err());
        assert!("abc".parse::<Amount>().is_err());
        assert!(".".parse::<Amount>().is_err());
    }

    #[test]
    fn test_basis_points() {
        assert_eq!(
            Amount::from_coins(100).basis_points(250),
            "2.5".parse::<Amount>().unwrap()
        );
        assert_eq!(Amount::from_units(3).basis_points(250), Amount::ZERO);
    }

    #[test]
    fn test_json_is_a_plain_number() {
        let json = serde_json::to_string(&Amount::from_units(700_000_000)).unwrap();
        assert_eq!(json, "7.0");
        let back: Amount = serde_json::from_str("7.0").unwrap();
        assert_eq!(back, Amount::from_coins(7));
    }

    #[test]
    fn test_checked_arithmetic() {
        let ten = Amount::from_coins(10);
        let three = Amount::from_coins(3);
        assert_eq!(ten.checked_sub(three), Some(Amount::from_coins(7)));
        assert_eq!(three.checked_sub(ten), None);
        assert!(Amount::from_units(MAX_UNITS).checked_add(Amount::MIN_UNIT).is_none());
        assert_eq!(Amount::try_sum(vec![ten, three]).unwrap(), Amount::from_coins(13));
    }
}
