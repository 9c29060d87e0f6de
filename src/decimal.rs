//! Exact fixed-point decimals for aggregate decoding and combination.
//!
//! Everything downstream of the ring is computed here: divisions at the
//! configured calculation scale, Newton square roots for the standard
//! deviations, and the final half-up rounding to the result scale. No
//! floating point is involved anywhere.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use num_bigint::BigInt;
use num_traits::{One, Signed, Zero};
use thiserror::Error;

/// A decimal parse failure.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid decimal literal: {0:?}")]
pub struct ParseDecimalError(pub String);

/// An exact decimal: `unscaled * 10^-scale`.
#[derive(Debug, Clone)]
pub struct Decimal {
    unscaled: BigInt,
    scale: u32,
}

fn pow10(e: u32) -> BigInt {
    BigInt::from(10u8).pow(e)
}

/// Rounds `num / den` half-up (ties away from zero). `den` must be nonzero.
fn div_half_up(num: &BigInt, den: &BigInt) -> BigInt {
    let negative = num.is_negative() != den.is_negative();
    let (n, d) = (num.abs(), den.abs());
    let q = &n / &d;
    let r = &n - &q * &d;
    let q = if &r + &r >= d { q + 1u8 } else { q };
    if negative { -q } else { q }
}

/// Floor square root by Newton's method. `n` must be nonnegative.
fn isqrt(n: &BigInt) -> BigInt {
    if n.is_zero() || n.is_one() {
        return n.clone();
    }
    let mut x: BigInt = BigInt::one() << (n.bits() / 2 + 1) as usize;
    loop {
        let y: BigInt = (&x + n / &x) >> 1;
        if y >= x {
            return x;
        }
        x = y;
    }
}

impl Decimal {
    /// Builds a decimal from its unscaled integer and scale.
    pub fn new(unscaled: BigInt, scale: u32) -> Decimal {
        Decimal { unscaled, scale }
    }

    /// Zero at scale 0.
    pub fn zero() -> Decimal {
        Decimal::new(BigInt::ZERO, 0)
    }

    /// An integer value at scale 0.
    pub fn from_i64(v: i64) -> Decimal {
        Decimal::new(BigInt::from(v), 0)
    }

    /// The unscaled integer.
    pub fn unscaled(&self) -> &BigInt {
        &self.unscaled
    }

    /// The scale (digits after the point).
    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// Whether the value is exactly zero.
    pub fn is_zero(&self) -> bool {
        self.unscaled.is_zero()
    }

    /// Whether the value is below zero.
    pub fn is_negative(&self) -> bool {
        self.unscaled.is_negative()
    }

    /// Exact sum; the result carries the larger scale.
    pub fn add(&self, rhs: &Decimal) -> Decimal {
        let scale = self.scale.max(rhs.scale);
        Decimal::new(self.align(scale) + rhs.align(scale), scale)
    }

    /// Exact difference; the result carries the larger scale.
    pub fn sub(&self, rhs: &Decimal) -> Decimal {
        let scale = self.scale.max(rhs.scale);
        Decimal::new(self.align(scale) - rhs.align(scale), scale)
    }

    /// Exact product; scales add.
    pub fn mul(&self, rhs: &Decimal) -> Decimal {
        Decimal::new(&self.unscaled * &rhs.unscaled, self.scale + rhs.scale)
    }

    /// `self / rhs` rounded half-up at `scale`, or `None` for division by
    /// zero.
    pub fn div(&self, rhs: &Decimal, scale: u32) -> Option<Decimal> {
        if rhs.is_zero() {
            return None;
        }
        // self/rhs * 10^scale = unscaled_l * 10^(scale + s_r - s_l) / unscaled_r
        let e = scale as i64 + rhs.scale as i64 - self.scale as i64;
        let (num, den) = if e >= 0 {
            (&self.unscaled * pow10(e as u32), rhs.unscaled.clone())
        } else {
            (self.unscaled.clone(), &rhs.unscaled * pow10(-e as u32))
        };
        Some(Decimal::new(div_half_up(&num, &den), scale))
    }

    /// Re-rounds to `scale`, half-up.
    pub fn rescale(&self, scale: u32) -> Decimal {
        match scale.cmp(&self.scale) {
            Ordering::Equal => self.clone(),
            Ordering::Greater => {
                Decimal::new(&self.unscaled * pow10(scale - self.scale), scale)
            }
            Ordering::Less => {
                let den = pow10(self.scale - scale);
                Decimal::new(div_half_up(&self.unscaled, &den), scale)
            }
        }
    }

    /// Square root at `scale` via Newton's method. Negative inputs (possible
    /// only through rounding noise in variance combination) clamp to zero.
    pub fn sqrt(&self, scale: u32) -> Decimal {
        if self.is_negative() {
            return Decimal::new(BigInt::ZERO, scale);
        }
        // sqrt(u * 10^-s) at scale t is isqrt(u * 10^(2t - s)) * 10^-t.
        let e = 2 * scale as i64 - self.scale as i64;
        let n = if e >= 0 {
            &self.unscaled * pow10(e as u32)
        } else {
            &self.unscaled / pow10(-e as u32)
        };
        Decimal::new(isqrt(&n), scale)
    }

    fn align(&self, scale: u32) -> BigInt {
        debug_assert!(scale >= self.scale);
        &self.unscaled * pow10(scale - self.scale)
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Decimal) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Decimal {}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Decimal) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Decimal {
    fn cmp(&self, other: &Decimal) -> Ordering {
        let scale = self.scale.max(other.scale);
        self.align(scale).cmp(&other.align(scale))
    }
}

impl FromStr for Decimal {
    type Err = ParseDecimalError;

    fn from_str(s: &str) -> Result<Decimal, ParseDecimalError> {
        let err = || ParseDecimalError(s.to_string());
        let (sign, rest) = match s.strip_prefix('-') {
            Some(rest) => (-1, rest),
            None => (1, s.strip_prefix('+').unwrap_or(s)),
        };
        let (int_part, frac_part) = match rest.split_once('.') {
            Some((i, f)) => (i, f),
            None => (rest, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(err());
        }
        let digits: String = [int_part, frac_part].concat();
        if !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(err());
        }
        let unscaled: BigInt = digits.parse().map_err(|_| err())?;
        Ok(Decimal::new(unscaled * sign, frac_part.len() as u32))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.unscaled.abs().to_string();
        let sign = if self.unscaled.is_negative() { "-" } else { "" };
        if self.scale == 0 {
            return write!(f, "{sign}{digits}");
        }
        let scale = self.scale as usize;
        let digits = if digits.len() <= scale {
            format!("{}{}", "0".repeat(scale - digits.len() + 1), digits)
        } else {
            digits
        };
        let (int_part, frac_part) = digits.split_at(digits.len() - scale);
        write!(f, "{sign}{int_part}.{frac_part}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn parse_and_display_round_trip() {
        for s in ["0", "1", "-1", "12.34", "-0.05", "1000.000", "0.1"] {
            assert_eq!(dec(s).to_string(), s);
        }
        assert!("".parse::<Decimal>().is_err());
        assert!("1.2.3".parse::<Decimal>().is_err());
        assert!("abc".parse::<Decimal>().is_err());
        assert_eq!(dec("+5"), dec("5"));
    }

    #[test]
    fn arithmetic() {
        assert_eq!(dec("1.5").add(&dec("2.25")), dec("3.75"));
        assert_eq!(dec("1.5").sub(&dec("2.25")), dec("-0.75"));
        assert_eq!(dec("1.5").mul(&dec("-2")), dec("-3.0"));
        assert_eq!(dec("1").div(&dec("3"), 4).unwrap(), dec("0.3333"));
        assert_eq!(dec("2").div(&dec("3"), 4).unwrap(), dec("0.6667"));
        assert!(dec("1").div(&Decimal::zero(), 4).is_none());
    }

    #[test]
    fn half_up_rounding() {
        assert_eq!(dec("2.5").rescale(0), dec("3"));
        assert_eq!(dec("2.4").rescale(0), dec("2"));
        assert_eq!(dec("-2.5").rescale(0), dec("-3"));
        assert_eq!(dec("0.125").rescale(2), dec("0.13"));
        assert_eq!(dec("3").rescale(2), dec("3.00"));
    }

    #[test]
    fn square_roots() {
        assert_eq!(dec("4").sqrt(2), dec("2.00"));
        assert_eq!(dec("2").sqrt(4), dec("1.4142"));
        assert_eq!(dec("0.0001").sqrt(4), dec("0.0100"));
        assert_eq!(Decimal::zero().sqrt(3), dec("0.000"));
        // Rounding noise below zero clamps instead of panicking.
        assert_eq!(dec("-0.0001").sqrt(2), dec("0.00"));
    }

    #[test]
    fn ordering_ignores_scale() {
        assert_eq!(dec("1.0"), dec("1.00"));
        assert!(dec("1.01") > dec("1.0"));
        assert!(dec("-3") < dec("0.0"));
    }
}
