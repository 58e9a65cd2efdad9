//! Weak rolling checksum (rsync style).

const CHAR_OFFSET: u32 = 31;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rollsum {
    count: u32,
    s1: u32,
    s2: u32,
}

impl Rollsum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of(data: &[u8]) -> Self {
        let mut sum = Self::new();
        sum.update(data);
        sum
    }

    pub fn update(&mut self, data: &[u8]) {
        for &b in data {
            self.s1 = self.s1.wrapping_add(b as u32 + CHAR_OFFSET);
            self.s2 = self.s2.wrapping_add(self.s1);
        }
        self.count = self.count.wrapping_add(data.len() as u32);
    }

    /// Slide the window by one byte.
    #[inline]
    pub fn rotate(&mut self, out: u8, inb: u8) {
        self.s1 = self.s1.wrapping_add(inb as u32).wrapping_sub(out as u32);
        self.s2 = self
            .s2
            .wrapping_add(self.s1)
            .wrapping_sub(self.count.wrapping_mul(out as u32 + CHAR_OFFSET));
    }

    #[inline]
    pub fn digest(&self) -> u32 {
        (self.s2 << 16) | (self.s1 & 0xffff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_matches_recompute() {
        let data: Vec<u8> = (0..200u32).map(|i| (i * 37 % 251) as u8).collect();
        let window = 16;
        let mut sum = Rollsum::of(&data[..window]);

        for i in 0..data.len() - window {
            sum.rotate(data[i], data[i + window]);
            assert_eq!(
                sum.digest(),
                Rollsum::of(&data[i + 1..i + 1 + window]).digest()
            );
        }
    }

    #[test]
    fn test_empty() {
        assert_eq!(Rollsum::of(&[]).digest(), 0);
    }
}
