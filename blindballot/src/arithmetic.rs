//! Arbitrary-precision modular arithmetic for the RSA blind-signature protocol.

use crate::*;
use num_bigint::{BigInt, BigUint, RandBigInt, Sign};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::{CryptoRng, Rng};

/// Compute `base^exponent mod modulus` by square-and-multiply.
///
/// A base congruent to zero yields zero, as does a modulus of one.
pub fn mod_pow(
    base: &BigUint,
    exponent: &BigUint,
    modulus: &BigUint,
) -> Result<BigUint, ArithmeticError> {
    if modulus.is_zero() {
        return Err(ArithmeticError::ModulusTooSmall);
    }

    let mut base = base % modulus;
    if base.is_zero() {
        return Ok(BigUint::zero());
    }

    let mut result = BigUint::one() % modulus;
    for i in 0..exponent.bits() {
        if exponent.bit(i) {
            result = (result * &base) % modulus;
        }
        base = (&base * &base) % modulus;
    }

    Ok(result)
}

/// Compute the inverse of `a` modulo `m` with the extended Euclidean algorithm.
///
/// The result lies in `[0, m)`.
pub fn mod_inverse(a: &BigUint, m: &BigUint) -> Result<BigUint, ArithmeticError> {
    if m <= &BigUint::one() {
        return Err(ArithmeticError::ModulusTooSmall);
    }

    let a = a % m;
    if a.is_zero() {
        return Err(ArithmeticError::ZeroOperand);
    }

    let modulus = BigInt::from_biguint(Sign::Plus, m.clone());
    let (mut old_r, mut r) = (BigInt::from_biguint(Sign::Plus, a), modulus.clone());
    let (mut old_s, mut s) = (BigInt::one(), BigInt::zero());

    while !r.is_zero() {
        let q = old_r.div_floor(&r);

        let next_r = &old_r - &q * &r;
        old_r = std::mem::replace(&mut r, next_r);

        let next_s = &old_s - &q * &s;
        old_s = std::mem::replace(&mut s, next_s);
    }

    // old_r is gcd(a, m)
    if !old_r.is_one() {
        return Err(ArithmeticError::NotInvertible);
    }

    let inverse = old_s.mod_floor(&modulus);
    inverse
        .to_biguint()
        .ok_or(ArithmeticError::NotInvertible)
}

/// Sample a uniformly random value in `[1, modulus)` that is coprime to `modulus`.
pub fn random_coprime<R: Rng + CryptoRng>(
    rng: &mut R,
    modulus: &BigUint,
) -> Result<BigUint, ArithmeticError> {
    if modulus <= &BigUint::one() {
        return Err(ArithmeticError::ModulusTooSmall);
    }

    loop {
        let candidate = rng.gen_biguint_below(modulus);
        if !candidate.is_zero() && candidate.gcd(modulus).is_one() {
            return Ok(candidate);
        }
    }
}

/// Parse a hexadecimal big-endian unsigned integer (an optional `0x` prefix is accepted).
pub fn biguint_from_hex(hex: &str) -> Result<BigUint, Error> {
    let trimmed = hex.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if digits.is_empty() {
        return Err(Error::MalformedInput("empty hexadecimal value".to_owned()));
    }

    BigUint::parse_bytes(digits.as_bytes(), 16)
        .ok_or_else(|| Error::MalformedInput(format!("invalid hexadecimal value: {}", digits)))
}

/// Format a big integer as lowercase hexadecimal, without prefix or padding.
pub fn biguint_to_hex(value: &BigUint) -> String {
    value.to_str_radix(16)
}
