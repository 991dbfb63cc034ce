//! Heap Integers
//!
//! Integers outside the inline 47-bit range are promoted to heap-allocated
//! BigInt payloads. Sign-magnitude representation with base-2^32 limbs,
//! little-endian limb order, no leading zero limbs (zero is an empty limb
//! vector with positive sign, so the representation is canonical).

use std::cmp::Ordering;

/// Arbitrary-precision signed integer payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigInt {
    /// False for negative values. Zero is always non-negative.
    non_negative: bool,
    /// Base-2^32 limbs, least significant first, no trailing zeros.
    limbs: Vec<u32>,
}

impl BigInt {
    pub fn zero() -> Self {
        BigInt {
            non_negative: true,
            limbs: Vec::new(),
        }
    }

    pub fn from_i64(n: i64) -> Self {
        // i64::MIN has no positive counterpart; widen through i128.
        let neg = n < 0;
        let mut mag = (n as i128).unsigned_abs() as u128;
        let mut limbs = Vec::new();
        while mag != 0 {
            limbs.push((mag & 0xFFFF_FFFF) as u32);
            mag >>= 32;
        }
        BigInt {
            non_negative: !neg || limbs.is_empty(),
            limbs,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.limbs.is_empty()
    }

    pub fn is_negative(&self) -> bool {
        !self.non_negative
    }

    /// Narrow back to i64 when the value fits.
    pub fn to_i64(&self) -> Option<i64> {
        let mut mag: u128 = 0;
        if self.limbs.len() > 3 {
            return None;
        }
        for (i, limb) in self.limbs.iter().enumerate() {
            mag |= (*limb as u128) << (32 * i);
        }
        if self.non_negative {
            if mag <= i64::MAX as u128 {
                Some(mag as i64)
            } else {
                None
            }
        } else if mag <= i64::MAX as u128 + 1 {
            Some((mag as i128).wrapping_neg() as i64)
        } else {
            None
        }
    }

    pub fn neg(&self) -> BigInt {
        if self.is_zero() {
            return self.clone();
        }
        BigInt {
            non_negative: !self.non_negative,
            limbs: self.limbs.clone(),
        }
    }

    pub fn add(&self, other: &BigInt) -> BigInt {
        if self.non_negative == other.non_negative {
            BigInt {
                non_negative: self.non_negative,
                limbs: add_mag(&self.limbs, &other.limbs),
            }
            .normalized()
        } else {
            match cmp_mag(&self.limbs, &other.limbs) {
                Ordering::Equal => BigInt::zero(),
                Ordering::Greater => BigInt {
                    non_negative: self.non_negative,
                    limbs: sub_mag(&self.limbs, &other.limbs),
                }
                .normalized(),
                Ordering::Less => BigInt {
                    non_negative: other.non_negative,
                    limbs: sub_mag(&other.limbs, &self.limbs),
                }
                .normalized(),
            }
        }
    }

    pub fn sub(&self, other: &BigInt) -> BigInt {
        self.add(&other.neg())
    }

    pub fn mul(&self, other: &BigInt) -> BigInt {
        if self.is_zero() || other.is_zero() {
            return BigInt::zero();
        }
        let mut limbs = vec![0u32; self.limbs.len() + other.limbs.len()];
        for (i, &a) in self.limbs.iter().enumerate() {
            let mut carry: u64 = 0;
            for (j, &b) in other.limbs.iter().enumerate() {
                let cur = limbs[i + j] as u64 + (a as u64) * (b as u64) + carry;
                limbs[i + j] = (cur & 0xFFFF_FFFF) as u32;
                carry = cur >> 32;
            }
            let mut k = i + other.limbs.len();
            while carry != 0 {
                let cur = limbs[k] as u64 + carry;
                limbs[k] = (cur & 0xFFFF_FFFF) as u32;
                carry = cur >> 32;
                k += 1;
            }
        }
        BigInt {
            non_negative: self.non_negative == other.non_negative,
            limbs,
        }
        .normalized()
    }

    pub fn cmp(&self, other: &BigInt) -> Ordering {
        match (self.non_negative, other.non_negative) {
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (true, true) => cmp_mag(&self.limbs, &other.limbs),
            (false, false) => cmp_mag(&other.limbs, &self.limbs),
        }
    }

    fn normalized(mut self) -> BigInt {
        while self.limbs.last() == Some(&0) {
            self.limbs.pop();
        }
        if self.limbs.is_empty() {
            self.non_negative = true;
        }
        self
    }
}

fn add_mag(a: &[u32], b: &[u32]) -> Vec<u32> {
    let (long, short) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    let mut out = Vec::with_capacity(long.len() + 1);
    let mut carry: u64 = 0;
    for i in 0..long.len() {
        let sum = long[i] as u64 + short.get(i).copied().unwrap_or(0) as u64 + carry;
        out.push((sum & 0xFFFF_FFFF) as u32);
        carry = sum >> 32;
    }
    if carry != 0 {
        out.push(carry as u32);
    }
    out
}

/// Subtract magnitudes; caller guarantees a >= b.
fn sub_mag(a: &[u32], b: &[u32]) -> Vec<u32> {
    debug_assert!(cmp_mag(a, b) != Ordering::Less);
    let mut out = Vec::with_capacity(a.len());
    let mut borrow: i64 = 0;
    for i in 0..a.len() {
        let mut diff = a[i] as i64 - b.get(i).copied().unwrap_or(0) as i64 - borrow;
        if diff < 0 {
            diff += 1 << 32;
            borrow = 1;
        } else {
            borrow = 0;
        }
        out.push(diff as u32);
    }
    while out.last() == Some(&0) {
        out.pop();
    }
    out
}

fn cmp_mag(a: &[u32], b: &[u32]) -> Ordering {
    if a.len() != b.len() {
        return a.len().cmp(&b.len());
    }
    for i in (0..a.len()).rev() {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

impl std::fmt::Display for BigInt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_zero() {
            return write!(f, "0");
        }
        // Repeated division by 10^9 produces decimal chunks most significant
        // last; format in reverse with zero-padded inner chunks.
        let mut limbs = self.limbs.clone();
        let mut chunks: Vec<u32> = Vec::new();
        while !limbs.is_empty() {
            let mut rem: u64 = 0;
            for limb in limbs.iter_mut().rev() {
                let cur = (rem << 32) | *limb as u64;
                *limb = (cur / 1_000_000_000) as u32;
                rem = cur % 1_000_000_000;
            }
            while limbs.last() == Some(&0) {
                limbs.pop();
            }
            chunks.push(rem as u32);
        }
        if !self.non_negative {
            write!(f, "-")?;
        }
        write!(f, "{}", chunks.last().unwrap())?;
        for chunk in chunks.iter().rev().skip(1) {
            write!(f, "{:09}", chunk)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i64_roundtrip() {
        for n in [0i64, 1, -1, 42, i64::MAX, i64::MIN, 1 << 46, -(1 << 46)] {
            let big = BigInt::from_i64(n);
            assert_eq!(big.to_i64(), Some(n), "roundtrip of {}", n);
        }
    }

    #[test]
    fn test_zero_is_canonical() {
        let z = BigInt::from_i64(0);
        assert!(z.is_zero());
        assert!(!z.is_negative());
        assert_eq!(z, BigInt::zero());
        assert_eq!(BigInt::from_i64(5).sub(&BigInt::from_i64(5)), BigInt::zero());
    }

    #[test]
    fn test_add_sub() {
        let a = BigInt::from_i64(i64::MAX);
        let b = BigInt::from_i64(i64::MAX);
        let sum = a.add(&b);
        assert_eq!(sum.to_i64(), None);
        assert_eq!(sum.sub(&b), a);
        assert_eq!(sum.to_string(), "18446744073709551614");
    }

    #[test]
    fn test_signed_add() {
        let a = BigInt::from_i64(100);
        let b = BigInt::from_i64(-250);
        assert_eq!(a.add(&b).to_i64(), Some(-150));
        assert_eq!(b.add(&a).to_i64(), Some(-150));
        assert_eq!(a.sub(&b).to_i64(), Some(350));
    }

    #[test]
    fn test_mul() {
        let a = BigInt::from_i64(1 << 40);
        let b = BigInt::from_i64(1 << 40);
        let prod = a.mul(&b);
        assert_eq!(prod.to_string(), (1u128 << 80).to_string());
        assert_eq!(a.mul(&BigInt::zero()), BigInt::zero());
        let neg = BigInt::from_i64(-3).mul(&BigInt::from_i64(7));
        assert_eq!(neg.to_i64(), Some(-21));
    }

    #[test]
    fn test_cmp() {
        let a = BigInt::from_i64(-5);
        let b = BigInt::from_i64(3);
        assert_eq!(a.cmp(&b), Ordering::Less);
        assert_eq!(b.cmp(&a), Ordering::Greater);
        assert_eq!(a.cmp(&BigInt::from_i64(-5)), Ordering::Equal);
        assert_eq!(
            BigInt::from_i64(-10).cmp(&BigInt::from_i64(-2)),
            Ordering::Less
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(BigInt::from_i64(0).to_string(), "0");
        assert_eq!(BigInt::from_i64(-42).to_string(), "-42");
        assert_eq!(
            BigInt::from_i64(i64::MIN).to_string(),
            i64::MIN.to_string()
        );
        // A value needing zero-padded middle chunks.
        let big = BigInt::from_i64(1_000_000_007).mul(&BigInt::from_i64(1_000_000_000));
        assert_eq!(big.to_string(), "1000000007000000000");
    }
}
