//! Per-frame nonces for AEAD ciphers.

use crate::ProtocolError;

/// A big-endian counter that advances by a fixed step and wraps to zero
/// once it leaves its bit width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceCounter {
    value: u128,
    step: u128,
    bits: u32,
    len: usize,
}

impl NonceCounter {
    /// Builds a counter as wide as `initial`, starting at its value.
    ///
    /// `step` is big-endian too and at most as wide as `initial`.
    pub fn new(initial: &[u8], step: &[u8]) -> Result<Self, ProtocolError> {
        if initial.is_empty() || initial.len() > 16 || step.len() > 16 {
            return Err(ProtocolError::KeyMaterial("nonce counter wider than 128 bits"));
        }
        Ok(Self {
            value: be_to_u128(initial),
            step: be_to_u128(step),
            bits: initial.len() as u32 * 8,
            len: initial.len(),
        })
    }

    /// Narrows the wrap-around width below the byte width.
    pub fn with_bits(mut self, bits: u32) -> Self {
        self.bits = bits.clamp(1, self.len as u32 * 8);
        self.value &= self.mask();
        self
    }

    fn mask(&self) -> u128 {
        if self.bits >= 128 {
            u128::MAX
        } else {
            (1u128 << self.bits) - 1
        }
    }

    pub fn current(&self) -> Vec<u8> {
        self.value.to_be_bytes()[16 - self.len..].to_vec()
    }

    pub fn advance(&mut self) {
        self.value = match self.value.checked_add(self.step) {
            Some(next) if next <= self.mask() => next,
            _ => 0,
        };
    }
}

fn be_to_u128(bytes: &[u8]) -> u128 {
    bytes.iter().fold(0u128, |acc, &b| (acc << 8) | u128::from(b))
}

/// Where an AEAD module takes its nonces from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NonceSupply {
    /// The same nonce for every frame.
    Fixed(Vec<u8>),
    /// A fresh counter value for every frame.
    Counter(NonceCounter),
}

impl NonceSupply {
    /// Nonce for the next frame.
    pub fn next(&mut self) -> Vec<u8> {
        match self {
            Self::Fixed(nonce) => nonce.clone(),
            Self::Counter(counter) => {
                let nonce = counter.current();
                counter.advance();
                nonce
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Fixed(nonce) => nonce.len(),
            Self::Counter(counter) => counter.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_advances_by_step() {
        let mut supply = NonceSupply::Counter(NonceCounter::new(&[0, 0, 1], &[2]).unwrap());
        assert_eq!(supply.next(), vec![0, 0, 1]);
        assert_eq!(supply.next(), vec![0, 0, 3]);
        assert_eq!(supply.next(), vec![0, 0, 5]);
    }

    #[test]
    fn test_counter_wraps_to_zero_at_width() {
        let mut counter = NonceCounter::new(&[0xff, 0xfe], &[1]).unwrap();
        counter.advance();
        assert_eq!(counter.current(), vec![0xff, 0xff]);
        counter.advance();
        assert_eq!(counter.current(), vec![0, 0]);
    }

    #[test]
    fn test_counter_custom_bit_width_wraps_early() {
        let mut counter = NonceCounter::new(&[0, 6], &[1]).unwrap().with_bits(3);
        counter.advance();
        assert_eq!(counter.current(), vec![0, 7]);
        counter.advance();
        assert_eq!(counter.current(), vec![0, 0]);
    }

    #[test]
    fn test_full_width_counter_does_not_overflow() {
        let mut counter = NonceCounter::new(&[0xff; 16], &[1]).unwrap();
        counter.advance();
        assert_eq!(counter.current(), vec![0; 16]);
    }

    #[test]
    fn test_fixed_supply_repeats() {
        let mut supply = NonceSupply::Fixed(vec![7; 12]);
        assert_eq!(supply.next(), supply.next());
        assert_eq!(supply.len(), 12);
    }
}
