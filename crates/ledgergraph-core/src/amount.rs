//! Fixed-point ledger amounts.
//!
//! Amounts carry eight fractional digits (the ledger convention) and are
//! stored as integer base units ("sats"), so addition and subtraction are
//! exact. Division and multiplication round half-to-even at the eighth
//! fractional digit, the same rounding the ledger's own arithmetic applies
//! at every intermediate step. Reproducing that per-step rounding matters:
//! rounding only the final result yields different edge values.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::str::FromStr;

/// Fractional digits carried by every amount.
pub const FRACTIONAL_DIGITS: u32 = 8;

/// Base units per whole coin (10^8).
pub const UNITS_PER_COIN: i64 = 100_000_000;

/// A ledger value with eight fractional digits, stored in base units.
///
/// May be negative while a computation is in flight (e.g. an input balance
/// after fee subtraction); emitted edge values are always positive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_units(units: i64) -> Self {
        Amount(units)
    }

    pub const fn units(self) -> i64 {
        self.0
    }

    /// Convert a whole-coin value (as reported by the node's JSON) to base
    /// units, rounding half-to-even at the eighth fractional digit.
    pub fn from_coins(coins: f64) -> Self {
        Amount((coins * UNITS_PER_COIN as f64).round_ties_even() as i64)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// The fraction `self / pool`, rounded to eight fractional digits.
    ///
    /// Returns `None` when `pool` is zero.
    pub fn ratio(self, pool: Amount) -> Option<Fraction> {
        if pool.0 == 0 {
            return None;
        }
        let scaled = div_round_half_even(
            self.0 as i128 * UNITS_PER_COIN as i128,
            pool.0 as i128,
        );
        Some(Fraction(scaled as i64))
    }

    /// `self × fraction`, rounded to eight fractional digits.
    pub fn scale(self, fraction: Fraction) -> Amount {
        let scaled = div_round_half_even(
            self.0 as i128 * fraction.0 as i128,
            UNITS_PER_COIN as i128,
        );
        Amount(scaled as i64)
    }
}

/// An eight-digit fixed-point fraction, as produced by [`Amount::ratio`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fraction(i64);

impl Fraction {
    pub const ONE: Fraction = Fraction(UNITS_PER_COIN);
}

/// Integer division rounding half-to-even, matching the rounding mode the
/// ledger's reference arithmetic applies at each step.
fn div_round_half_even(num: i128, den: i128) -> i128 {
    debug_assert!(den > 0);
    let (mag, neg) = if num < 0 { (-num, true) } else { (num, false) };
    let quot = mag / den;
    let rem = mag % den;
    let quot = match (rem * 2).cmp(&den) {
        std::cmp::Ordering::Less => quot,
        std::cmp::Ordering::Greater => quot + 1,
        // Exactly half: round to the even neighbor.
        std::cmp::Ordering::Equal => {
            if quot % 2 == 0 {
                quot
            } else {
                quot + 1
            }
        }
    };
    if neg {
        -quot
    } else {
        quot
    }
}

impl Add for Amount {
    type Output = Amount;
    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Amount) {
        self.0 += rhs.0;
    }
}

impl Sub for Amount {
    type Output = Amount;
    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0 - rhs.0)
    }
}

impl SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Amount) {
        self.0 -= rhs.0;
    }
}

impl Neg for Amount {
    type Output = Amount;
    fn neg(self) -> Amount {
        Amount(-self.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, Add::add)
    }
}

impl fmt::Display for Amount {
    /// Formats with all eight fractional digits, e.g. `4.99990000`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let mag = self.0.unsigned_abs();
        write!(
            f,
            "{}{}.{:08}",
            sign,
            mag / UNITS_PER_COIN as u64,
            mag % UNITS_PER_COIN as u64
        )
    }
}

impl FromStr for Amount {
    type Err = ParseAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sign, s) = match s.strip_prefix('-') {
            Some(rest) => (-1i64, rest),
            None => (1i64, s),
        };
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if frac.len() > FRACTIONAL_DIGITS as usize {
            return Err(ParseAmountError(s.to_string()));
        }
        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| ParseAmountError(s.to_string()))?
        };
        let mut frac_units: i64 = 0;
        if !frac.is_empty() {
            frac_units = frac.parse().map_err(|_| ParseAmountError(s.to_string()))?;
            frac_units *= 10i64.pow(FRACTIONAL_DIGITS - frac.len() as u32);
        }
        Ok(Amount(sign * (whole * UNITS_PER_COIN + frac_units)))
    }
}

/// Error parsing the textual form of an [`Amount`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAmountError(String);

impl fmt::Display for ParseAmountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid amount: {}", self.0)
    }
}

impl std::error::Error for ParseAmountError {}

impl<'de> Deserialize<'de> for Amount {
    /// Node JSON carries values as decimal numbers (e.g. `6.25`).
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let coins = f64::deserialize(deserializer)?;
        Ok(Amount::from_coins(coins))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_coins_rounds_to_eight_digits() {
        assert_eq!(Amount::from_coins(6.25).units(), 625_000_000);
        assert_eq!(Amount::from_coins(4.9999).units(), 499_990_000);
        assert_eq!(Amount::from_coins(0.00000001).units(), 1);
    }

    #[test]
    fn test_display_pads_fraction() {
        assert_eq!(Amount::from_units(499_990_000).to_string(), "4.99990000");
        assert_eq!(Amount::from_units(1).to_string(), "0.00000001");
        assert_eq!(Amount::from_units(-150_000_000).to_string(), "-1.50000000");
    }

    #[test]
    fn test_parse_round_trips_display() {
        for units in [0i64, 1, 625_000_000, -42, 10_000_000_000] {
            let a = Amount::from_units(units);
            assert_eq!(a.to_string().parse::<Amount>().unwrap(), a);
        }
    }

    #[test]
    fn test_parse_short_fraction() {
        assert_eq!("5.25".parse::<Amount>().unwrap().units(), 525_000_000);
        assert_eq!("3".parse::<Amount>().unwrap().units(), 300_000_000);
    }

    #[test]
    fn test_parse_rejects_overlong_fraction() {
        assert!("1.000000001".parse::<Amount>().is_err());
    }

    #[test]
    fn test_div_rounds_half_to_even() {
        // 0.5 rounds to 0 (even), 1.5 rounds to 2 (even), 2.5 rounds to 2.
        assert_eq!(div_round_half_even(1, 2), 0);
        assert_eq!(div_round_half_even(3, 2), 2);
        assert_eq!(div_round_half_even(5, 2), 2);
        assert_eq!(div_round_half_even(-3, 2), -2);
    }

    #[test]
    fn test_ratio_and_scale() {
        let half = Amount::from_coins(1.0).ratio(Amount::from_coins(2.0)).unwrap();
        assert_eq!(Amount::from_coins(3.0).scale(half), Amount::from_coins(1.5));

        let whole = Amount::from_coins(7.0).ratio(Amount::from_coins(7.0)).unwrap();
        assert_eq!(whole, Fraction::ONE);
    }

    #[test]
    fn test_ratio_of_zero_pool_is_none() {
        assert!(Amount::from_coins(1.0).ratio(Amount::ZERO).is_none());
    }

    #[test]
    fn test_sum_is_exact() {
        let total: Amount = (0..1000).map(|_| Amount::from_units(1)).sum();
        assert_eq!(total.units(), 1000);
    }
}
