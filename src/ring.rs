//! Modular arithmetic over the configured ring `Z_m`.
//!
//! The modulus is fixed per deployment, so the representation is chosen once
//! at startup and reused for the whole process lifetime: the smallest of
//! `u32`, `u64` or arbitrary precision whose range holds `[0, m)`. Each word
//! representation additionally fixes one of three reduction strategies at
//! construction time instead of re-dispatching per element:
//!
//! * `m` is a power of two (including `2^32`/`2^64`, where `m` itself does not
//!   fit the word): wrapping ops plus a mask;
//! * `m` is at or below half the word range: `a + b` cannot overflow, plain
//!   add-then-reduce is safe;
//! * `m` is in the upper, unsigned-only half: sums and products are promoted
//!   through the double-width word before reduction.
//!
//! Elements travel on the wire in fixed-width big-endian form (4, 8 or
//! `ceil(bits(m-1)/8)` bytes).

use std::fmt::Debug;
use std::ops::{Add, BitAnd, Div, Rem, Sub};

use num_bigint::{BigInt, BigUint};
use num_integer::Integer;
use num_traits::{One, ToPrimitive, Zero};
use rand::{Rng, RngCore, distr::uniform::SampleUniform};
use thiserror::Error;

/// Errors raised while decoding ring elements from their wire form.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    /// The byte slice does not have the fixed element width.
    #[error("ring element has {got} bytes, expected {want}")]
    WrongSize {
        /// Bytes received.
        got: usize,
        /// Bytes required by the selected representation.
        want: usize,
    },
    /// The decoded value is not below the modulus.
    #[error("ring element {0} is not below the modulus")]
    OutOfRange(String),
}

/// Arithmetic in `Z_m` under one fixed representation.
///
/// The engine is generic over this trait; the concrete representation is
/// selected once by [`select_ring`] and monomorphized from there.
pub trait Ring: Clone + Debug + Send + Sync + 'static {
    /// One ring element.
    type Elem: Clone + PartialEq + Debug + Send + Sync + 'static;

    /// The additive identity.
    fn zero(&self) -> Self::Elem;
    /// The multiplicative identity.
    fn one(&self) -> Self::Elem;
    /// `(a + b) mod m`.
    fn add(&self, a: &Self::Elem, b: &Self::Elem) -> Self::Elem;
    /// `(a - b) mod m`.
    fn sub(&self, a: &Self::Elem, b: &Self::Elem) -> Self::Elem;
    /// `acc = (acc + x * y) mod m`.
    fn mul_acc(&self, acc: &mut Self::Elem, x: &Self::Elem, y: &Self::Elem);
    /// A uniformly random element of `[0, m)`.
    fn random<R: RngCore + ?Sized>(&self, rng: &mut R) -> Self::Elem;
    /// Reduces an arbitrary (possibly negative) integer into `[0, m)`.
    fn encode(&self, v: &BigInt) -> Self::Elem;
    /// The centered lift: values above `m / 2` decode as negative.
    fn lift_signed(&self, e: &Self::Elem) -> BigInt;
    /// Fixed element width in bytes on the wire.
    fn elem_size(&self) -> usize;
    /// Appends the big-endian fixed-width encoding of `e` to `dst`.
    fn write_elem(&self, e: &Self::Elem, dst: &mut Vec<u8>);
    /// Decodes one element from exactly [`Ring::elem_size`] bytes.
    fn read_elem(&self, src: &[u8]) -> Result<Self::Elem, RingError>;
}

/// An unsigned machine word usable as a ring element representation.
pub trait Word:
    Copy
    + Eq
    + Ord
    + Debug
    + Send
    + Sync
    + SampleUniform
    + Add<Output = Self>
    + Sub<Output = Self>
    + Div<Output = Self>
    + Rem<Output = Self>
    + BitAnd<Output = Self>
    + 'static
{
    /// The double-width word used for overflow-safe promotion.
    type Wide: Copy
        + Ord
        + Add<Output = Self::Wide>
        + std::ops::Mul<Output = Self::Wide>
        + Rem<Output = Self::Wide>;

    /// Word width in bits.
    const BITS: u32;
    /// The zero word.
    const ZERO: Self;
    /// The one word.
    const ONE: Self;
    /// The all-ones word.
    const MAX: Self;

    /// Wrapping addition.
    fn wrapping_add(self, other: Self) -> Self;
    /// Wrapping subtraction.
    fn wrapping_sub(self, other: Self) -> Self;
    /// Wrapping multiplication.
    fn wrapping_mul(self, other: Self) -> Self;
    /// Promotes into the double-width word.
    fn widen(self) -> Self::Wide;
    /// Truncates a double-width value known to fit.
    fn truncate(wide: Self::Wide) -> Self;
    /// Converts to an arbitrary-precision integer.
    fn to_biguint(self) -> BigUint;
    /// Converts from an arbitrary-precision integer, if it fits.
    fn from_biguint(v: &BigUint) -> Option<Self>;
    /// Draws a full-range random word.
    fn sample<R: RngCore + ?Sized>(rng: &mut R) -> Self;
    /// Appends the big-endian encoding.
    fn write_be(self, dst: &mut Vec<u8>);
    /// Reads from exactly `BITS / 8` bytes.
    fn read_be(src: &[u8]) -> Self;
}

impl Word for u32 {
    type Wide = u64;

    const BITS: u32 = 32;
    const ZERO: Self = 0;
    const ONE: Self = 1;
    const MAX: Self = u32::MAX;

    fn wrapping_add(self, other: Self) -> Self {
        u32::wrapping_add(self, other)
    }
    fn wrapping_sub(self, other: Self) -> Self {
        u32::wrapping_sub(self, other)
    }
    fn wrapping_mul(self, other: Self) -> Self {
        u32::wrapping_mul(self, other)
    }
    fn widen(self) -> u64 {
        self as u64
    }
    fn truncate(wide: u64) -> Self {
        wide as u32
    }
    fn to_biguint(self) -> BigUint {
        BigUint::from(self)
    }
    fn from_biguint(v: &BigUint) -> Option<Self> {
        v.to_u32()
    }
    fn sample<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        rng.next_u32()
    }
    fn write_be(self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.to_be_bytes());
    }
    fn read_be(src: &[u8]) -> Self {
        u32::from_be_bytes(src.try_into().expect("caller checks the width"))
    }
}

impl Word for u64 {
    type Wide = u128;

    const BITS: u32 = 64;
    const ZERO: Self = 0;
    const ONE: Self = 1;
    const MAX: Self = u64::MAX;

    fn wrapping_add(self, other: Self) -> Self {
        u64::wrapping_add(self, other)
    }
    fn wrapping_sub(self, other: Self) -> Self {
        u64::wrapping_sub(self, other)
    }
    fn wrapping_mul(self, other: Self) -> Self {
        u64::wrapping_mul(self, other)
    }
    fn widen(self) -> u128 {
        self as u128
    }
    fn truncate(wide: u128) -> Self {
        wide as u64
    }
    fn to_biguint(self) -> BigUint {
        BigUint::from(self)
    }
    fn from_biguint(v: &BigUint) -> Option<Self> {
        v.to_u64()
    }
    fn sample<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        rng.next_u64()
    }
    fn write_be(self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.to_be_bytes());
    }
    fn read_be(src: &[u8]) -> Self {
        u64::from_be_bytes(src.try_into().expect("caller checks the width"))
    }
}

/// The reduction strategy fixed at construction time.
#[derive(Clone, Copy, Debug)]
enum Mode<W> {
    /// `m = 2^k`: reduction is a mask. `m` itself may not fit the word.
    Pow2 { mask: W },
    /// `m <= 2^(BITS-1)`: `a + b` cannot overflow the word.
    Small { m: W },
    /// `m > 2^(BITS-1)`: sums and products go through the wide word.
    Large { m: W },
}

/// `Z_m` represented in a single machine word.
#[derive(Clone, Debug)]
pub struct WordRing<W: Word> {
    mode: Mode<W>,
    m_int: BigInt,
}

impl<W: Word> WordRing<W> {
    /// Builds a word ring for `m`, or `None` if `[0, m)` exceeds the word
    /// range.
    pub fn new(m: &BigUint) -> Option<Self> {
        if m.is_zero() || m.bits() > W::BITS as u64 + 1 {
            return None;
        }
        let m_int = BigInt::from(m.clone());
        if m.count_ones() == 1 {
            // Power of two. The mask is m - 1, which always fits the word,
            // even for m = 2^BITS.
            if m.bits() == W::BITS as u64 + 1 {
                return Some(WordRing {
                    mode: Mode::Pow2 { mask: W::MAX },
                    m_int,
                });
            }
            let mask = W::from_biguint(&(m - BigUint::one()))?;
            return Some(WordRing {
                mode: Mode::Pow2 { mask },
                m_int,
            });
        }
        // Not a power of two, so m < 2^BITS and m fits the word.
        let w = W::from_biguint(m)?;
        let half = W::MAX / (W::ONE + W::ONE) + W::ONE; // 2^(BITS-1)
        let mode = if w <= half {
            Mode::Small { m: w }
        } else {
            Mode::Large { m: w }
        };
        Some(WordRing { mode, m_int })
    }
}

impl<W: Word> Ring for WordRing<W> {
    type Elem = W;

    fn zero(&self) -> W {
        W::ZERO
    }

    fn one(&self) -> W {
        // m = 1 collapses the ring to {0}.
        match self.mode {
            Mode::Pow2 { mask } if mask == W::ZERO => W::ZERO,
            _ => W::ONE,
        }
    }

    fn add(&self, a: &W, b: &W) -> W {
        match self.mode {
            Mode::Pow2 { mask } => a.wrapping_add(*b) & mask,
            Mode::Small { m } => (*a + *b) % m,
            Mode::Large { m } => W::truncate((a.widen() + b.widen()) % m.widen()),
        }
    }

    fn sub(&self, a: &W, b: &W) -> W {
        match self.mode {
            Mode::Pow2 { mask } => a.wrapping_sub(*b) & mask,
            Mode::Small { m } | Mode::Large { m } => {
                if *a >= *b {
                    *a - *b
                } else {
                    m - (*b - *a)
                }
            }
        }
    }

    fn mul_acc(&self, acc: &mut W, x: &W, y: &W) {
        match self.mode {
            Mode::Pow2 { mask } => *acc = acc.wrapping_add(x.wrapping_mul(*y)) & mask,
            Mode::Small { m } | Mode::Large { m } => {
                *acc = W::truncate((acc.widen() + x.widen() * y.widen()) % m.widen());
            }
        }
    }

    fn random<R: RngCore + ?Sized>(&self, rng: &mut R) -> W {
        match self.mode {
            Mode::Pow2 { mask } => W::sample(rng) & mask,
            Mode::Small { m } | Mode::Large { m } => rng.random_range(W::ZERO..m),
        }
    }

    fn encode(&self, v: &BigInt) -> W {
        let r = v.mod_floor(&self.m_int);
        let r = r.to_biguint().expect("mod_floor result is nonnegative");
        W::from_biguint(&r).expect("reduced value fits the word")
    }

    fn lift_signed(&self, e: &W) -> BigInt {
        let u = BigInt::from(e.to_biguint());
        if &u + &u > self.m_int {
            u - &self.m_int
        } else {
            u
        }
    }

    fn elem_size(&self) -> usize {
        (W::BITS / 8) as usize
    }

    fn write_elem(&self, e: &W, dst: &mut Vec<u8>) {
        e.write_be(dst);
    }

    fn read_elem(&self, src: &[u8]) -> Result<W, RingError> {
        if src.len() != self.elem_size() {
            return Err(RingError::WrongSize {
                got: src.len(),
                want: self.elem_size(),
            });
        }
        let e = W::read_be(src);
        if BigInt::from(e.to_biguint()) >= self.m_int {
            return Err(RingError::OutOfRange(format!("{e:?}")));
        }
        Ok(e)
    }
}

/// `Z_m` over arbitrary-precision integers, for moduli beyond 64 bits.
#[derive(Clone, Debug)]
pub struct BigRing {
    m: BigUint,
    m_int: BigInt,
    elem_size: usize,
    /// Bits of `m - 1` in the top byte of the wire form, for rejection
    /// sampling. Zero means the top byte is fully used.
    top_bits: u32,
}

impl BigRing {
    /// Builds the arbitrary-precision ring for any positive `m`.
    pub fn new(m: &BigUint) -> Self {
        assert!(!m.is_zero(), "the modulus must be positive");
        let max = m - BigUint::one();
        let bits = max.bits().max(1);
        BigRing {
            m: m.clone(),
            m_int: BigInt::from(m.clone()),
            elem_size: bits.div_ceil(8) as usize,
            top_bits: (bits % 8) as u32,
        }
    }
}

impl Ring for BigRing {
    type Elem = BigUint;

    fn zero(&self) -> BigUint {
        BigUint::ZERO
    }

    fn one(&self) -> BigUint {
        if self.m.is_one() {
            BigUint::ZERO
        } else {
            BigUint::one()
        }
    }

    fn add(&self, a: &BigUint, b: &BigUint) -> BigUint {
        let s = a + b;
        if s >= self.m { s - &self.m } else { s }
    }

    fn sub(&self, a: &BigUint, b: &BigUint) -> BigUint {
        if a >= b { a - b } else { &self.m - (b - a) }
    }

    fn mul_acc(&self, acc: &mut BigUint, x: &BigUint, y: &BigUint) {
        *acc = (&*acc + x * y) % &self.m;
    }

    fn random<R: RngCore + ?Sized>(&self, rng: &mut R) -> BigUint {
        let mut buf = vec![0u8; self.elem_size];
        loop {
            rng.fill_bytes(&mut buf);
            if self.top_bits != 0 {
                buf[0] &= (1u16 << self.top_bits).wrapping_sub(1) as u8;
            }
            let v = BigUint::from_bytes_be(&buf);
            if v < self.m {
                return v;
            }
        }
    }

    fn encode(&self, v: &BigInt) -> BigUint {
        v.mod_floor(&self.m_int)
            .to_biguint()
            .expect("mod_floor result is nonnegative")
    }

    fn lift_signed(&self, e: &BigUint) -> BigInt {
        let u = BigInt::from(e.clone());
        if &u + &u > self.m_int {
            u - &self.m_int
        } else {
            u
        }
    }

    fn elem_size(&self) -> usize {
        self.elem_size
    }

    fn write_elem(&self, e: &BigUint, dst: &mut Vec<u8>) {
        let bytes = e.to_bytes_be();
        debug_assert!(bytes.len() <= self.elem_size);
        dst.resize(dst.len() + (self.elem_size - bytes.len()), 0);
        dst.extend_from_slice(&bytes);
    }

    fn read_elem(&self, src: &[u8]) -> Result<BigUint, RingError> {
        if src.len() != self.elem_size {
            return Err(RingError::WrongSize {
                got: src.len(),
                want: self.elem_size,
            });
        }
        let v = BigUint::from_bytes_be(src);
        if v >= self.m {
            return Err(RingError::OutOfRange(v.to_string()));
        }
        Ok(v)
    }
}

/// The representation chosen for a configured modulus.
#[derive(Clone, Debug)]
pub enum SelectedRing {
    /// `[0, m)` fits 32 bits.
    U32(WordRing<u32>),
    /// `[0, m)` fits 64 bits.
    U64(WordRing<u64>),
    /// Arbitrary precision.
    Big(BigRing),
}

/// Picks the smallest representation whose range holds `[0, m)`.
///
/// Called once at node startup; all arithmetic from then on runs through the
/// returned representation without further dispatch.
pub fn select_ring(m: &BigUint) -> SelectedRing {
    if let Some(r) = WordRing::<u32>::new(m) {
        SelectedRing::U32(r)
    } else if let Some(r) = WordRing::<u64>::new(m) {
        SelectedRing::U64(r)
    } else {
        SelectedRing::Big(BigRing::new(m))
    }
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;
    use num_traits::One;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    fn big(s: &str) -> BigUint {
        s.parse().unwrap()
    }

    /// One modulus per width x magnitude sub-case.
    fn all_case_moduli() -> Vec<BigUint> {
        vec![
            // u32: power of two, lower half, upper half, and the 2^32 edge.
            big("2147483648"),           // 2^31
            big("1000003"),              // small
            big("4294967291"),           // 2^32 - 5, upper half
            big("4294967296"),           // 2^32, pow2 at the boundary
            // u64 counterparts.
            big("9223372036854775808"),  // 2^63
            big("4611686018427387847"),  // below half
            big("18446744073709551557"), // 2^64 - 59, upper half
            big("18446744073709551616"), // 2^64
            // arbitrary precision counterparts.
            big("340282366920938463463374607431768211456"), // 2^128
            big("170141183460469231731687303715884105727"), // 2^127 - 1
            big("340282366920938463463374607431768211297"), // 2^128 - 159
        ]
    }

    fn check_ops(ring: &impl Ring, m: &BigUint, a: &BigUint, b: &BigUint) {
        let m_int = BigInt::from(m.clone());
        let ea = ring.encode(&BigInt::from(a.clone()));
        let eb = ring.encode(&BigInt::from(b.clone()));
        let sum = ring.add(&ea, &eb);
        assert_eq!(
            ring.encode(&BigInt::from((a + b) % m)),
            sum,
            "add mod {m}: {a} + {b}"
        );
        let diff = ring.sub(&ea, &eb);
        let expect = (BigInt::from(a.clone()) - BigInt::from(b.clone())).mod_floor(&m_int);
        assert_eq!(ring.encode(&expect), diff, "sub mod {m}: {a} - {b}");
        let mut acc = ring.one();
        ring.mul_acc(&mut acc, &ea, &eb);
        let expect = (BigUint::one() + a * b) % m;
        assert_eq!(
            ring.encode(&BigInt::from(expect)),
            acc,
            "mul_acc mod {m}: 1 + {a} * {b}"
        );
        // Wire round trip.
        let mut buf = Vec::new();
        ring.write_elem(&sum, &mut buf);
        assert_eq!(buf.len(), ring.elem_size());
        assert_eq!(ring.read_elem(&buf).unwrap(), sum);
    }

    fn check_modulus(m: &BigUint, a: &BigUint, b: &BigUint) {
        let a = a % m;
        let b = b % m;
        match select_ring(m) {
            SelectedRing::U32(r) => check_ops(&r, m, &a, &b),
            SelectedRing::U64(r) => check_ops(&r, m, &a, &b),
            SelectedRing::Big(r) => check_ops(&r, m, &a, &b),
        }
    }

    #[test]
    fn width_selection_is_smallest() {
        assert!(matches!(select_ring(&big("2")), SelectedRing::U32(_)));
        assert!(matches!(
            select_ring(&big("4294967296")),
            SelectedRing::U32(_)
        ));
        assert!(matches!(
            select_ring(&big("4294967297")),
            SelectedRing::U64(_)
        ));
        assert!(matches!(
            select_ring(&big("18446744073709551616")),
            SelectedRing::U64(_)
        ));
        assert!(matches!(
            select_ring(&big("18446744073709551617")),
            SelectedRing::Big(_)
        ));
    }

    #[test]
    fn wraparound_at_the_top() {
        // m - 1 plus 1 must wrap to zero for both the power-of-two modulus at
        // the signed boundary and its non-power-of-two neighbor.
        for m in [big("2147483648"), big("2147483649")] {
            let SelectedRing::U32(r) = select_ring(&m) else {
                panic!("expected a 32-bit ring for {m}");
            };
            let top = r.encode(&(BigInt::from(m.clone()) - 1));
            assert_eq!(r.add(&top, &r.one()), r.zero());
            assert_eq!(r.sub(&r.zero(), &r.one()), top);
        }
    }

    #[test]
    fn boundary_cases() {
        for m in all_case_moduli() {
            let max = &m - BigUint::one();
            check_modulus(&m, &max, &max);
            check_modulus(&m, &max, &BigUint::one());
            check_modulus(&m, &BigUint::ZERO, &max);
            check_modulus(&m, &(&max / 2u8), &(&max / 3u8));
        }
    }

    #[test]
    fn signed_lift_round_trips() {
        for m in all_case_moduli() {
            let neg = BigInt::from(-12345);
            match select_ring(&m) {
                SelectedRing::U32(r) => assert_eq!(r.lift_signed(&r.encode(&neg)), neg),
                SelectedRing::U64(r) => assert_eq!(r.lift_signed(&r.encode(&neg)), neg),
                SelectedRing::Big(r) => assert_eq!(r.lift_signed(&r.encode(&neg)), neg),
            }
        }
    }

    #[test]
    fn random_elements_are_in_range() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        for m in all_case_moduli() {
            for _ in 0..100 {
                let v = match select_ring(&m) {
                    SelectedRing::U32(r) => r.random(&mut rng).to_biguint(),
                    SelectedRing::U64(r) => r.random(&mut rng).to_biguint(),
                    SelectedRing::Big(r) => r.random(&mut rng),
                };
                assert!(v < m, "{v} >= {m}");
            }
        }
    }

    #[test]
    fn rejects_bad_wire_elements() {
        let SelectedRing::U32(r) = select_ring(&big("1000003")) else {
            panic!("expected a 32-bit ring");
        };
        assert!(matches!(
            r.read_elem(&[0, 0, 0]),
            Err(RingError::WrongSize { got: 3, want: 4 })
        ));
        assert!(matches!(
            r.read_elem(&u32::MAX.to_be_bytes()),
            Err(RingError::OutOfRange(_))
        ));
    }

    proptest! {
        #[test]
        fn matches_unbounded_arithmetic(
            case in 0usize..11,
            a in any::<u128>(),
            b in any::<u128>(),
        ) {
            let m = all_case_moduli()[case].clone();
            check_modulus(&m, &BigUint::from(a), &BigUint::from(b));
        }
    }
}
