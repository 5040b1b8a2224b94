use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdCodecError {
    /// An even multiplier has no inverse modulo 2^64
    #[error("id codec multiplier must be odd")]
    EvenPrime,
}

/// Reversible obfuscation of numeric payment IDs for external use.
///
/// `hide(x) = (x * prime) XOR xor mod 2^64`; `show` applies the modular
/// multiplicative inverse of `prime`. External IDs become non-enumerable
/// without revealing any entropy.
#[derive(Debug, Clone, Copy)]
pub struct IdCodec {
    prime: u64,
    inverse: u64,
    xor: u64,
}

impl IdCodec {
    pub fn new(prime: u64, xor: u64) -> Result<Self, IdCodecError> {
        if prime % 2 == 0 {
            return Err(IdCodecError::EvenPrime);
        }
        Ok(IdCodec {
            prime,
            inverse: mod_inverse_pow2(prime),
            xor,
        })
    }

    pub fn hide(&self, id: i64) -> i64 {
        ((id as u64).wrapping_mul(self.prime) ^ self.xor) as i64
    }

    pub fn show(&self, id: i64) -> i64 {
        ((id as u64 ^ self.xor).wrapping_mul(self.inverse)) as i64
    }
}

/// Inverse of an odd `n` modulo 2^64 by Newton iteration; each round doubles
/// the number of correct low bits, so five rounds from a 5-bit seed suffice.
fn mod_inverse_pow2(n: u64) -> u64 {
    let mut x = n.wrapping_mul(3) ^ 2;
    for _ in 0..5 {
        x = x.wrapping_mul(2u64.wrapping_sub(n.wrapping_mul(x)));
    }
    x
}
