//! Arbitrary-precision unsigned integers
//!
//! Just enough big-number arithmetic for the TAP Diffie-Hellman handshake:
//! schoolbook add/sub/mul, Knuth algorithm D division and sliding-window
//! modular exponentiation.
//!
//! Values are stored as little-endian `u32` limbs (least significant first)
//! with no trailing zero limbs, so equality is structural.

use std::cmp::Ordering;
use std::fmt;
use zeroize::Zeroize;

const LIMB_BITS: usize = 32;
const BASE: u64 = 1 << LIMB_BITS;

/// Non-negative integer of arbitrary size
#[derive(Clone, PartialEq, Eq, Default, Zeroize)]
pub struct BigInteger {
    limbs: Vec<u32>,
}

impl BigInteger {
    /// Zero
    pub fn zero() -> Self {
        Self { limbs: Vec::new() }
    }

    /// One
    pub fn one() -> Self {
        Self::from_u64(1)
    }

    pub fn from_u64(value: u64) -> Self {
        Self::from_limbs(vec![value as u32, (value >> 32) as u32])
    }

    fn from_limbs(mut limbs: Vec<u32>) -> Self {
        trim(&mut limbs);
        Self { limbs }
    }

    /// Import an unsigned big-endian byte string
    pub fn from_bytes_be(bytes: &[u8]) -> Self {
        let mut limbs = Vec::with_capacity(bytes.len().div_ceil(4));
        for chunk in bytes.rchunks(4) {
            let mut limb = 0u32;
            for &b in chunk {
                limb = (limb << 8) | b as u32;
            }
            limbs.push(limb);
        }
        Self::from_limbs(limbs)
    }

    /// Export as exactly `len` big-endian bytes
    ///
    /// Shorter values are left-padded with zeros; longer values keep only
    /// their `len` least significant bytes.
    pub fn to_bytes_be(&self, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        for (i, slot) in out.iter_mut().rev().enumerate() {
            let limb = i / 4;
            if limb >= self.limbs.len() {
                break;
            }
            *slot = (self.limbs[limb] >> ((i % 4) * 8)) as u8;
        }
        out
    }

    /// Minimal big-endian encoding (empty for zero)
    pub fn to_bytes_be_trimmed(&self) -> Vec<u8> {
        self.to_bytes_be(self.bits().div_ceil(8))
    }

    pub fn is_zero(&self) -> bool {
        self.limbs.is_empty()
    }

    /// Number of significant bits
    pub fn bits(&self) -> usize {
        match self.limbs.last() {
            Some(top) => {
                (self.limbs.len() - 1) * LIMB_BITS + (LIMB_BITS - top.leading_zeros() as usize)
            }
            None => 0,
        }
    }

    /// Value of bit `i` (bit 0 is the least significant)
    pub fn bit(&self, i: usize) -> bool {
        match self.limbs.get(i / LIMB_BITS) {
            Some(limb) => (limb >> (i % LIMB_BITS)) & 1 == 1,
            None => false,
        }
    }

    pub fn add(&self, other: &Self) -> Self {
        let (long, short) = if self.limbs.len() >= other.limbs.len() {
            (&self.limbs, &other.limbs)
        } else {
            (&other.limbs, &self.limbs)
        };

        let mut out = Vec::with_capacity(long.len() + 1);
        let mut carry = 0u64;
        for (i, &a) in long.iter().enumerate() {
            let sum = a as u64 + *short.get(i).unwrap_or(&0) as u64 + carry;
            out.push(sum as u32);
            carry = sum >> LIMB_BITS;
        }
        if carry != 0 {
            out.push(carry as u32);
        }
        Self::from_limbs(out)
    }

    /// `|self - other|` plus a flag that is set when `other > self`
    pub fn sub(&self, other: &Self) -> (Self, bool) {
        match self.cmp(other) {
            Ordering::Less => (Self::from_limbs(sub_limbs(&other.limbs, &self.limbs)), true),
            _ => (Self::from_limbs(sub_limbs(&self.limbs, &other.limbs)), false),
        }
    }

    pub fn mul(&self, other: &Self) -> Self {
        if self.is_zero() || other.is_zero() {
            return Self::zero();
        }

        let mut out = vec![0u32; self.limbs.len() + other.limbs.len()];
        for (i, &a) in self.limbs.iter().enumerate() {
            let mut carry = 0u64;
            for (j, &b) in other.limbs.iter().enumerate() {
                let t = a as u64 * b as u64 + out[i + j] as u64 + carry;
                out[i + j] = t as u32;
                carry = t >> LIMB_BITS;
            }
            out[i + other.limbs.len()] = carry as u32;
        }
        Self::from_limbs(out)
    }

    /// Quotient and remainder
    ///
    /// # Panics
    ///
    /// Panics if `divisor` is zero.
    pub fn div_rem(&self, divisor: &Self) -> (Self, Self) {
        assert!(!divisor.is_zero(), "BigInteger division by zero");

        if self < divisor {
            return (Self::zero(), self.clone());
        }
        if divisor.limbs.len() == 1 {
            let (q, r) = div_rem_small(&self.limbs, divisor.limbs[0]);
            return (Self::from_limbs(q), Self::from_u64(r as u64));
        }

        let (q, r) = div_rem_knuth(&self.limbs, &divisor.limbs);
        (Self::from_limbs(q), Self::from_limbs(r))
    }

    /// `self mod modulus`
    pub fn modulo(&self, modulus: &Self) -> Self {
        self.div_rem(modulus).1
    }

    /// `self^exponent mod modulus` by left-to-right sliding window
    ///
    /// # Panics
    ///
    /// Panics if `modulus` is zero.
    pub fn mod_pow(&self, exponent: &Self, modulus: &Self) -> Self {
        assert!(!modulus.is_zero(), "BigInteger modulus is zero");

        let one = Self::one();
        if *modulus == one {
            return Self::zero();
        }
        if exponent.is_zero() {
            return one;
        }

        let base = self.modulo(modulus);
        let window = window_size(exponent.bits());

        // table[k] = base^(2k+1) mod m
        let base_sq = base.mul(&base).modulo(modulus);
        let mut table = Vec::with_capacity(1 << (window - 1));
        table.push(base);
        for k in 1..(1usize << (window - 1)) {
            let next = table[k - 1].mul(&base_sq).modulo(modulus);
            table.push(next);
        }

        let mut result = one;
        let mut i = exponent.bits();
        while i > 0 {
            let top = i - 1;
            if !exponent.bit(top) {
                result = result.mul(&result).modulo(modulus);
                i -= 1;
                continue;
            }

            // Longest window ending in a set bit
            let mut low = top.saturating_sub(window - 1);
            while !exponent.bit(low) {
                low += 1;
            }

            let mut value = 0usize;
            for k in (low..=top).rev() {
                value = (value << 1) | exponent.bit(k) as usize;
            }

            for _ in low..=top {
                result = result.mul(&result).modulo(modulus);
            }
            result = result.mul(&table[value >> 1]).modulo(modulus);
            i = low;
        }

        table.zeroize();
        result
    }
}

impl From<u64> for BigInteger {
    fn from(value: u64) -> Self {
        Self::from_u64(value)
    }
}

impl Ord for BigInteger {
    fn cmp(&self, other: &Self) -> Ordering {
        self.limbs
            .len()
            .cmp(&other.limbs.len())
            .then_with(|| self.limbs.iter().rev().cmp(other.limbs.iter().rev()))
    }
}

impl PartialOrd for BigInteger {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::LowerHex for BigInteger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.limbs.split_last() {
            None => write!(f, "0"),
            Some((top, rest)) => {
                write!(f, "{:x}", top)?;
                for limb in rest.iter().rev() {
                    write!(f, "{:08x}", limb)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for BigInteger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BigInteger(0x{:x})", self)
    }
}

fn trim(limbs: &mut Vec<u32>) {
    while limbs.last() == Some(&0) {
        limbs.pop();
    }
}

fn window_size(exponent_bits: usize) -> usize {
    match exponent_bits {
        0..=32 => 1,
        33..=128 => 3,
        129..=512 => 4,
        _ => 5,
    }
}

/// `a - b`, requires `a >= b`
fn sub_limbs(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(a.len());
    let mut borrow = 0i64;
    for (i, &x) in a.iter().enumerate() {
        let mut t = x as i64 - *b.get(i).unwrap_or(&0) as i64 - borrow;
        borrow = 0;
        if t < 0 {
            t += BASE as i64;
            borrow = 1;
        }
        out.push(t as u32);
    }
    debug_assert_eq!(borrow, 0);
    out
}

fn div_rem_small(u: &[u32], v: u32) -> (Vec<u32>, u32) {
    let mut q = vec![0u32; u.len()];
    let mut rem = 0u64;
    for i in (0..u.len()).rev() {
        let cur = (rem << LIMB_BITS) | u[i] as u64;
        q[i] = (cur / v as u64) as u32;
        rem = cur % v as u64;
    }
    (q, rem as u32)
}

fn shl_limbs(limbs: &[u32], shift: u32, extra: bool) -> Vec<u32> {
    let mut out = Vec::with_capacity(limbs.len() + 1);
    let mut carry = 0u32;
    for &limb in limbs {
        if shift == 0 {
            out.push(limb);
        } else {
            out.push((limb << shift) | carry);
            carry = limb >> (LIMB_BITS as u32 - shift);
        }
    }
    if extra {
        out.push(carry);
    }
    out
}

/// Knuth TAOCP vol. 2, 4.3.1 algorithm D. Requires `v.len() >= 2` and `u >= v`.
fn div_rem_knuth(u: &[u32], v: &[u32]) -> (Vec<u32>, Vec<u32>) {
    let n = v.len();
    let m = u.len() - n;

    // D1: normalize so the divisor's top limb has its high bit set
    let shift = v[n - 1].leading_zeros();
    let vn = shl_limbs(v, shift, false);
    let mut un = shl_limbs(u, shift, true);

    let mut q = vec![0u32; m + 1];
    let v_top = vn[n - 1] as u64;
    let v_next = vn[n - 2] as u64;

    for j in (0..=m).rev() {
        // D3: estimate the quotient digit
        let num = ((un[j + n] as u64) << LIMB_BITS) | un[j + n - 1] as u64;
        let mut qhat = num / v_top;
        let mut rhat = num % v_top;
        while qhat >= BASE || qhat * v_next > ((rhat << LIMB_BITS) | un[j + n - 2] as u64) {
            qhat -= 1;
            rhat += v_top;
            if rhat >= BASE {
                break;
            }
        }

        // D4: multiply and subtract
        let mut borrow = 0i64;
        let mut carry = 0u64;
        for i in 0..n {
            let p = qhat * vn[i] as u64 + carry;
            carry = p >> LIMB_BITS;
            let t = un[i + j] as i64 - borrow - (p & 0xffff_ffff) as i64;
            un[i + j] = t as u32;
            borrow = (t < 0) as i64;
        }
        let t = un[j + n] as i64 - borrow - carry as i64;
        un[j + n] = t as u32;

        // D6: add back when the estimate was one too large
        if t < 0 {
            qhat -= 1;
            let mut c = 0u64;
            for i in 0..n {
                let s = un[i + j] as u64 + vn[i] as u64 + c;
                un[i + j] = s as u32;
                c = s >> LIMB_BITS;
            }
            un[j + n] = un[j + n].wrapping_add(c as u32);
        }

        q[j] = qhat as u32;
    }

    // D8: unnormalize the remainder
    let mut r = vec![0u32; n];
    for i in 0..n {
        r[i] = if shift == 0 {
            un[i]
        } else {
            (un[i] >> shift) | (un[i + 1] << (LIMB_BITS as u32 - shift))
        };
    }
    (q, r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn big(hex_str: &str) -> BigInteger {
        BigInteger::from_bytes_be(&hex::decode(hex_str).unwrap())
    }

    #[test]
    fn test_mod_pow_small() {
        let two = BigInteger::from_u64(2);
        let result = two.mod_pow(&BigInteger::from_u64(10), &BigInteger::from_u64(1000));
        assert_eq!(result, BigInteger::from_u64(24));
    }

    #[test]
    fn test_mod_pow_edge_cases() {
        let m = BigInteger::from_u64(97);
        let b = BigInteger::from_u64(5);
        assert_eq!(b.mod_pow(&BigInteger::zero(), &m), BigInteger::one());
        assert_eq!(b.mod_pow(&BigInteger::from_u64(3), &BigInteger::one()), BigInteger::zero());
        assert_eq!(BigInteger::zero().mod_pow(&BigInteger::from_u64(3), &m), BigInteger::zero());
        // Fermat: 5^96 = 1 mod 97
        assert_eq!(b.mod_pow(&BigInteger::from_u64(96), &m), BigInteger::one());
    }

    #[test]
    fn test_mod_pow_large_vector() {
        let p = big(
            "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
             020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
             4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
             EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF",
        );
        let a = big("fedcba9876543210fedcba9876543210fedcba98");
        let e = BigInteger::from_u64(0x10001);
        let expected = big(
            "17f700dc329f90739a4d4e8c705f8b0467d7627753ef058bde6546cda1ea0581\
             9a16584cf84e2e1b0ba0d74c40ae6ff53297f99dfc2a26730a2b04ca8523100d\
             cfd132f3017f5206f37323a3618de60e2614ecef6c1dd2b4cde3d6789aaab21a\
             38200be51e99aa196632858b94a7f080aae6928eaedf996cc73383867a27519b",
        );
        assert_eq!(a.mod_pow(&e, &p), expected);
    }

    #[test]
    fn test_mul_and_div_vectors() {
        let a = big("fedcba9876543210fedcba9876543210fedcba98");
        let b = big("01234567890abcdef1234567");

        assert_eq!(
            a.mul(&b),
            big("0121fa00acd77d74247acc90b69643345a094100b60fa16ae400cd2ea3e20b28")
        );

        let (q, r) = a.div_rem(&b);
        assert_eq!(q, big("e00000007bde000d82"));
        assert_eq!(r, big("907108223a07ef6e6d414a"));
    }

    #[test]
    fn test_div_rem_small_divisor() {
        let n = big("0102030405060708090a0b0c0d0e0f");
        let (q, r) = n.div_rem(&BigInteger::from_u64(7));
        assert_eq!(q.mul(&BigInteger::from_u64(7)).add(&r), n);
        assert!(r < BigInteger::from_u64(7));
    }

    #[test]
    #[should_panic(expected = "division by zero")]
    fn test_div_by_zero_panics() {
        let _ = BigInteger::one().div_rem(&BigInteger::zero());
    }

    #[test]
    fn test_sub_reports_sign() {
        let a = BigInteger::from_u64(5);
        let b = BigInteger::from_u64(1 << 40);
        let (diff, negative) = a.sub(&b);
        assert!(negative);
        assert_eq!(diff, BigInteger::from_u64((1 << 40) - 5));

        let (diff, negative) = b.sub(&a);
        assert!(!negative);
        assert_eq!(diff, BigInteger::from_u64((1 << 40) - 5));

        let (diff, negative) = a.sub(&a);
        assert!(!negative);
        assert!(diff.is_zero());
    }

    #[test]
    fn test_add_carries_into_new_limb() {
        let a = BigInteger::from_u64(u32::MAX as u64);
        assert_eq!(a.add(&BigInteger::one()), BigInteger::from_u64(1 << 32));
    }

    #[test]
    fn test_byte_export_pads_and_truncates() {
        let n = BigInteger::from_bytes_be(&hex!("00 00 01 02 03"));
        assert_eq!(n, BigInteger::from_u64(0x010203));
        assert_eq!(n.to_bytes_be(5), hex!("00 00 01 02 03").to_vec());
        assert_eq!(n.to_bytes_be(2), hex!("02 03").to_vec());
        assert_eq!(n.to_bytes_be_trimmed(), hex!("01 02 03").to_vec());
        assert!(BigInteger::zero().to_bytes_be_trimmed().is_empty());
    }

    #[test]
    fn test_bits_and_ordering() {
        assert_eq!(BigInteger::zero().bits(), 0);
        assert_eq!(BigInteger::from_u64(1).bits(), 1);
        assert_eq!(BigInteger::from_u64(1 << 33).bits(), 34);
        assert!(BigInteger::from_u64(1 << 33) > BigInteger::from_u64(u32::MAX as u64));
        assert_eq!(format!("{:x}", BigInteger::from_u64(0x1_0000_00ab)), "1000000ab");
    }
}
