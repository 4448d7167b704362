//! Modular arithmetic over Z/2^32 and Z/2^64. An odd constant `k` has a
//! unique multiplicative inverse modulo the word size, which is what lets a
//! multiplier-obfuscated field be decoded by a second multiplication.

/// A 32- or 64-bit integer constant, width-tagged.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) enum Number {
    Int(i32),
    Long(i64),
}

impl Number {
    /// Invertible modulo the word size, i.e. odd.
    pub(crate) fn is_invertible(self) -> bool {
        match self {
            Number::Int(v) => v & 1 == 1,
            Number::Long(v) => v & 1 == 1,
        }
    }

    /// Modular inverse; meaningful only when `is_invertible()`.
    pub(crate) fn inverse(self) -> Number {
        match self {
            Number::Int(v) => Number::Int(invert32(v)),
            Number::Long(v) => Number::Long(invert64(v)),
        }
    }

    /// `k * k == 1`; such a constant decodes itself and carries no
    /// obfuscation information.
    pub(crate) fn is_self_inverse(self) -> bool {
        self.inverse() == self
    }
}

/// Inverse of an odd `k` modulo 2^32 by Newton iteration; each step doubles
/// the number of correct low bits.
pub(crate) fn invert32(k: i32) -> i32 {
    debug_assert!(k & 1 == 1);
    let k = k as u32;
    let mut x = k;
    for _ in 0..5 {
        x = x.wrapping_mul(2u32.wrapping_sub(k.wrapping_mul(x)));
    }
    x as i32
}

/// Inverse of an odd `k` modulo 2^64.
pub(crate) fn invert64(k: i64) -> i64 {
    debug_assert!(k & 1 == 1);
    let k = k as u64;
    let mut x = k;
    for _ in 0..6 {
        x = x.wrapping_mul(2u64.wrapping_sub(k.wrapping_mul(x)));
    }
    x as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_inverse_of_three() {
        assert_eq!(invert32(3), 1431655766);
    }

    #[test]
    fn inverse_round_trips_32() {
        for k in [1i32, 3, 5, -7, 0x1234_5671, i32::MAX, -1] {
            assert_eq!(k.wrapping_mul(invert32(k)), 1, "k = {k}");
            let value = 0x0BAD_F00Du32 as i32;
            assert_eq!(
                value.wrapping_mul(k).wrapping_mul(invert32(k)),
                value,
                "k = {k}"
            );
        }
    }

    #[test]
    fn inverse_round_trips_64() {
        for k in [1i64, 3, 5, -9, 0x1234_5678_9ABC_DEF1, i64::MIN + 1] {
            assert_eq!(k.wrapping_mul(invert64(k)), 1, "k = {k}");
        }
    }

    #[test]
    fn even_constants_are_not_invertible() {
        assert!(!Number::Int(4).is_invertible());
        assert!(!Number::Long(0).is_invertible());
        assert!(Number::Int(3).is_invertible());
    }

    #[test]
    fn one_is_self_inverse() {
        assert!(Number::Int(1).is_self_inverse());
        assert!(Number::Long(-1).is_self_inverse());
        assert!(!Number::Int(3).is_self_inverse());
    }
}
