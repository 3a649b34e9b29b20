//! Bit-level helpers over allocation bitmaps.
//!
//! Bit `i` lives in byte `i / 8` at position `i % 8`. A set bit is an
//! allocated unit. The free functions operate on borrowed slices so the
//! same code serves in-memory maps and block images read from disk.

use sio_error::{Result, SioError};

/// Get bit `idx`. Bits past the end of `bitmap` read as allocated.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    bitmap
        .get((idx / 8) as usize)
        .map_or(true, |byte| (byte >> (idx % 8)) & 1 == 1)
}

/// Set bit `idx`. Out-of-range indices are ignored.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    if let Some(byte) = bitmap.get_mut((idx / 8) as usize) {
        *byte |= 1 << (idx % 8);
    }
}

/// Clear bit `idx`. Out-of-range indices are ignored.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    if let Some(byte) = bitmap.get_mut((idx / 8) as usize) {
        *byte &= !(1 << (idx % 8));
    }
}

/// Count zero bits among the first `count` bits.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let mut free: u32 = bitmap
        .iter()
        .take(full_bytes)
        .map(|byte| byte.count_zeros())
        .sum();
    let tail_bits = count % 8;
    if tail_bits > 0 {
        if let Some(byte) = bitmap.get(full_bytes) {
            let mask = (1_u8 << tail_bits) - 1;
            free += (!byte & mask).count_ones();
        }
    }
    free
}

/// First zero bit in `start..count`, wrapping to `0..start`.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    let start = if start >= count { 0 } else { start };
    scan_free(bitmap, start, count).or_else(|| scan_free(bitmap, 0, start))
}

fn scan_free(bitmap: &[u8], from: u32, to: u32) -> Option<u32> {
    let mut idx = from;
    while idx < to {
        // Skip whole allocated bytes.
        if idx % 8 == 0 && to - idx >= 8 && bitmap.get((idx / 8) as usize) == Some(&0xFF) {
            idx += 8;
            continue;
        }
        if !bitmap_get(bitmap, idx) {
            return Some(idx);
        }
        idx += 1;
    }
    None
}

/// Bytes needed to hold `units` bits.
#[must_use]
pub fn bytes_for_units(units: u32) -> usize {
    units.div_ceil(8) as usize
}

// ── Owned bitmap ────────────────────────────────────────────────────────────

/// Growable in-memory allocation map.
///
/// Invariant: `bits.len() == bytes_for_units(len)` and every bit at or past
/// `len` is zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawBitmap {
    bits: Vec<u8>,
    len: u32,
}

impl RawBitmap {
    /// All-free map of `len` units.
    #[must_use]
    pub fn new(len: u32) -> Self {
        Self {
            bits: vec![0; bytes_for_units(len)],
            len,
        }
    }

    /// Adopt an on-disk image. Extra trailing bytes are dropped and bits
    /// past `len` are cleared.
    pub fn from_bytes(mut bytes: Vec<u8>, len: u32) -> Result<Self> {
        let need = bytes_for_units(len);
        if bytes.len() < need {
            return Err(SioError::Corruption {
                unit: u64::from(len),
                detail: format!("bitmap image holds {} bytes, need {need}", bytes.len()),
            });
        }
        bytes.truncate(need);
        let mut map = Self { bits: bytes, len };
        map.clear_tail();
        Ok(map)
    }

    fn clear_tail(&mut self) {
        let tail_bits = self.len % 8;
        if tail_bits > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= (1_u8 << tail_bits) - 1;
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    fn check(&self, idx: u32) -> Result<()> {
        if idx >= self.len {
            return Err(SioError::OutOfRange {
                index: u64::from(idx),
                total: u64::from(self.len),
            });
        }
        Ok(())
    }

    /// Validate `start..start + count` against the map length.
    pub fn check_range(&self, start: u32, count: u32) -> Result<()> {
        let end = start.checked_add(count).ok_or(SioError::OutOfRange {
            index: u64::from(start) + u64::from(count),
            total: u64::from(self.len),
        })?;
        if end > self.len {
            return Err(SioError::OutOfRange {
                index: u64::from(end - 1),
                total: u64::from(self.len),
            });
        }
        Ok(())
    }

    pub fn get(&self, idx: u32) -> Result<bool> {
        self.check(idx)?;
        Ok(bitmap_get(&self.bits, idx))
    }

    pub fn set(&mut self, idx: u32) -> Result<()> {
        self.check(idx)?;
        bitmap_set(&mut self.bits, idx);
        Ok(())
    }

    pub fn clear(&mut self, idx: u32) -> Result<()> {
        self.check(idx)?;
        bitmap_clear(&mut self.bits, idx);
        Ok(())
    }

    /// Set `count` bits starting at `start`.
    pub fn set_range(&mut self, start: u32, count: u32) -> Result<()> {
        self.check_range(start, count)?;
        for idx in start..start + count {
            bitmap_set(&mut self.bits, idx);
        }
        Ok(())
    }

    /// Clear `count` bits starting at `start`.
    pub fn clear_range(&mut self, start: u32, count: u32) -> Result<()> {
        self.check_range(start, count)?;
        for idx in start..start + count {
            bitmap_clear(&mut self.bits, idx);
        }
        Ok(())
    }

    #[must_use]
    pub fn count_free(&self) -> u32 {
        bitmap_count_free(&self.bits, self.len)
    }

    #[must_use]
    pub fn count_allocated(&self) -> u32 {
        self.len - self.count_free()
    }

    #[must_use]
    pub fn find_free(&self, start: u32) -> Option<u32> {
        bitmap_find_free(&self.bits, self.len, start)
    }

    /// Lowest start of `n` consecutive free units.
    ///
    /// Jumps from one free unit to the next with the byte-skipping scan and
    /// restarts past the first allocated unit inside a candidate window.
    #[must_use]
    pub fn find_contiguous(&self, n: u32) -> Option<u32> {
        if n == 0 {
            return Some(0);
        }
        let mut from = 0;
        while let Some(start) = scan_free(&self.bits, from, self.len) {
            let end = start.checked_add(n).filter(|end| *end <= self.len)?;
            match (start..end).find(|idx| bitmap_get(&self.bits, *idx)) {
                Some(taken) => from = taken + 1,
                None => return Some(start),
            }
        }
        None
    }

    /// Maximal runs of allocated units as `(start, len)`, ascending.
    #[must_use]
    pub fn allocated_runs(&self) -> Vec<(u32, u32)> {
        let mut runs = Vec::new();
        let mut current: Option<(u32, u32)> = None;
        for idx in 0..self.len {
            if bitmap_get(&self.bits, idx) {
                current = Some(current.map_or((idx, 1), |(start, len)| (start, len + 1)));
            } else if let Some(run) = current.take() {
                runs.push(run);
            }
        }
        runs.extend(current);
        runs
    }

    /// Extend to `new_len` units. New units are free.
    pub fn grow(&mut self, new_len: u32) -> Result<()> {
        if new_len < self.len {
            return Err(SioError::InvalidArgument(format!(
                "cannot shrink bitmap from {} to {new_len}",
                self.len
            )));
        }
        self.bits.resize(bytes_for_units(new_len), 0);
        self.len = new_len;
        Ok(())
    }
}
