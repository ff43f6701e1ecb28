use crate::layout::CHECKSUM_SIZE;

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

/// Bitmap payload of one group. Bit `i` lives in byte `i / 8` at position
/// `i % 8`; a set bit marks a used block.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    bytes: Vec<u8>,
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitmap")
            .field("bits", &(self.bytes.len() * 8))
            .field("used", &self.count_used())
            .finish()
    }
}

impl Bitmap {
    /// An all-free bitmap of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0; len],
        }
    }

    pub fn parse(buf: &[u8]) -> Self {
        Self {
            bytes: buf.to_vec(),
        }
    }

    pub fn serialize(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bits(&self) -> u32 {
        (self.bytes.len() * 8) as u32
    }

    pub fn get(&self, bit: u32) -> State {
        if self.is_set(bit) {
            State::Used
        } else {
            State::Free
        }
    }

    fn is_set(&self, bit: u32) -> bool {
        assert!(bit < self.bits(), "bit {} outside bitmap", bit);
        (self.bytes[(bit / 8) as usize] >> (bit % 8)) & 1 == 1
    }

    pub fn set_reserved(&mut self, bit: u32) {
        assert!(bit < self.bits(), "bit {} outside bitmap", bit);
        self.bytes[(bit / 8) as usize] |= 1 << (bit % 8);
    }

    pub fn set_free(&mut self, bit: u32) {
        assert!(bit < self.bits(), "bit {} outside bitmap", bit);
        self.bytes[(bit / 8) as usize] &= !(1 << (bit % 8));
    }

    /// Marks `[start, end)` used.
    pub fn set_range(&mut self, start: u32, end: u32) {
        for bit in start..end {
            self.set_reserved(bit);
        }
    }

    /// Marks `[start, end)` free.
    pub fn clear_range(&mut self, start: u32, end: u32) {
        for bit in start..end {
            self.set_free(bit);
        }
    }

    /// Whether every bit of `[start, end)` is used (`used == true`) or free.
    pub fn is_range(&self, start: u32, end: u32, used: bool) -> bool {
        self.find_next(start, end, !used).is_none()
    }

    pub fn count_used(&self) -> u64 {
        self.bytes.iter().map(|b| b.count_ones() as u64).sum()
    }

    /// First bit in `[from, to)` whose state is `used`.
    pub fn find_next(&self, from: u32, to: u32, used: bool) -> Option<u32> {
        let to = to.min(self.bits());
        let mut bit = from;
        while bit < to {
            let byte = self.normalized(bit / 8, used);
            if bit % 8 == 0 && to - bit >= 8 {
                // Whole byte inside the range: skip it or pick its lowest match.
                if byte == 0 {
                    bit += 8;
                    continue;
                }
                return Some(bit + byte.trailing_zeros());
            }
            if (byte >> (bit % 8)) & 1 == 1 {
                return Some(bit);
            }
            bit += 1;
        }
        None
    }

    /// Last bit in `[from, to)` whose state is `used`.
    pub fn find_prev(&self, from: u32, to: u32, used: bool) -> Option<u32> {
        let to = to.min(self.bits());
        let mut end = to;
        while end > from {
            let bit = end - 1;
            let byte = self.normalized(bit / 8, used);
            if bit % 8 == 7 && end - from >= 8 {
                if byte == 0 {
                    end -= 8;
                    continue;
                }
                return Some((bit / 8) * 8 + 7 - byte.leading_zeros());
            }
            if (byte >> (bit % 8)) & 1 == 1 {
                return Some(bit);
            }
            end -= 1;
        }
        None
    }

    /// Byte `idx` with the bits matching `used` set.
    fn normalized(&self, idx: u32, used: bool) -> u8 {
        let byte = self.bytes[idx as usize];
        if used {
            byte
        } else {
            !byte
        }
    }
}

/// First-fit search for a free run of at least `min` bits in `[start, end)`.
/// Returns the run start and its length capped to `max`.
pub fn search_forward(bitmap: &Bitmap, start: u32, end: u32, min: u32, max: u32) -> Option<(u32, u32)> {
    let mut pos = start;
    while pos < end {
        let zero = bitmap.find_next(pos, end, false)?;
        let limit = end.min(zero.saturating_add(max));
        let run_end = bitmap.find_next(zero, limit, true).unwrap_or(limit);
        if run_end - zero >= min {
            return Some((zero, run_end - zero));
        }
        pos = run_end;
    }
    None
}

/// Mirror of [`search_forward`]: finds the free run of at least `min` bits
/// nearest to `end` inside `[start, end)` and returns the top `max` bits of it.
pub fn search_backward(bitmap: &Bitmap, start: u32, end: u32, min: u32, max: u32) -> Option<(u32, u32)> {
    let mut end = end;
    while end > start {
        let top = bitmap.find_prev(start, end, false)?;
        let floor = start.max((top + 1).saturating_sub(max));
        match bitmap.find_prev(floor, top + 1, true) {
            Some(busy) => {
                let len = top - busy;
                if len >= min {
                    return Some((busy + 1, len));
                }
                end = busy;
            }
            None => {
                let len = top + 1 - floor;
                if len >= min {
                    return Some((floor, len));
                }
                end = floor;
            }
        }
    }
    None
}

fn checksum(payload: &[u8]) -> u32 {
    crc32c::crc32c(payload)
}

/// Stores the checksum of the payload in the trailing bytes of `block`.
pub fn write_checksum(block: &mut [u8]) -> u32 {
    let split = block.len() - CHECKSUM_SIZE;
    let (payload, tail) = block.split_at_mut(split);
    let sum = checksum(payload);
    tail.copy_from_slice(&sum.to_le_bytes());
    sum
}

/// Reads the checksum stored in the trailing bytes of `block`.
pub fn stored_checksum(block: &[u8]) -> u32 {
    let mut tail = [0u8; CHECKSUM_SIZE];
    tail.copy_from_slice(&block[block.len() - CHECKSUM_SIZE..]);
    u32::from_le_bytes(tail)
}

pub fn verify_checksum(block: &[u8]) -> bool {
    if block.len() <= CHECKSUM_SIZE {
        return false;
    }
    checksum(&block[..block.len() - CHECKSUM_SIZE]) == stored_checksum(block)
}

/// Builds a full bitmap block from a payload.
pub fn seal(payload: &Bitmap, block_size: usize) -> Vec<u8> {
    let mut block = vec![0u8; block_size];
    block[..payload.bytes.len()].copy_from_slice(&payload.bytes);
    write_checksum(&mut block);
    block
}
