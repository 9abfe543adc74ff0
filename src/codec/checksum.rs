//! The two's-complement checksum used by every IPMI message field pair.

/// An accumulator for the IPMI two's-complement checksum.
pub struct Checksum {
    state: u8,
}

impl Default for Checksum {
    fn default() -> Self {
        Self::new()
    }
}

impl Checksum {
    pub fn new() -> Self {
        Self { state: 0 }
    }

    pub fn from_iter(data: impl Iterator<Item = u8>) -> u8 {
        let mut me = Self::default();
        data.for_each(|v| me.feed(v));
        me.finalize()
    }

    pub fn feed(&mut self, data: u8) {
        self.state = self.state.wrapping_add(data);
    }

    pub fn finalize(&self) -> u8 {
        (!self.state).wrapping_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_test() {
        let output = Checksum::from_iter([0x20, 0x06 << 2].into_iter());
        assert_eq!(0xC8, output);
    }

    #[test]
    fn checksum_is_self_inverse() {
        let data = [0x20u8, 0x18, 0x81, 0x04, 0x01];
        let cs = Checksum::from_iter(data.iter().copied());
        let with_checksum = data.iter().copied().chain(std::iter::once(cs));
        assert_eq!(Checksum::from_iter(with_checksum), 0);
    }
}
