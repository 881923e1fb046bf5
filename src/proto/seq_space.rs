/// Width of the sequence and acknowledgment fields on the wire.
///
/// Both peers must agree on the width. Narrow spaces wrap quickly, which is
/// fine: every comparison goes through [`SeqSpace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeqWidth {
    U16,
    #[default]
    U32,
}

impl SeqWidth {
    /// Bytes taken by one sequence field in the segment header.
    pub fn bytes(self) -> usize {
        match self {
            SeqWidth::U16 => 2,
            SeqWidth::U32 => 4,
        }
    }

    pub fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }
}

/// Serial-number arithmetic over a `2^bits` sequence space (RFC 1982).
///
/// ```text
///   ---------|-----------------|-----------------|---------
///           seq          seq + half        seq + 2^bits
///
///   values in (seq, seq + half) are "after" seq,
///   values in (seq + half, seq + 2^bits) are "before" it.
/// ```
///
/// Windows must stay strictly smaller than `half` or old and new data
/// become indistinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SeqSpace {
    mask: u32,
}

impl SeqSpace {
    pub fn new(width: SeqWidth) -> Self {
        let mask = match width {
            SeqWidth::U16 => u16::MAX as u32,
            SeqWidth::U32 => u32::MAX,
        };
        Self { mask }
    }

    pub fn mask(self) -> u32 {
        self.mask
    }

    /// Half of the space; the largest distance that still orders two numbers.
    pub fn half(self) -> u32 {
        (self.mask >> 1) + 1
    }

    pub fn add(self, seq: u32, n: u32) -> u32 {
        seq.wrapping_add(n) & self.mask
    }

    /// Forward distance from `from` to `to`, modulo the space.
    pub fn distance(self, from: u32, to: u32) -> u32 {
        to.wrapping_sub(from) & self.mask
    }

    pub fn lt(self, lhs: u32, rhs: u32) -> bool {
        let d = self.distance(lhs, rhs);
        d != 0 && d < self.half()
    }

    pub fn le(self, lhs: u32, rhs: u32) -> bool {
        lhs == rhs || self.lt(lhs, rhs)
    }

    /// `start < x < end`, all three taken modulo the space.
    #[cfg(test)]
    pub fn is_between(self, start: u32, x: u32, end: u32) -> bool {
        self.lt(start, x) && self.lt(x, end)
    }
}
