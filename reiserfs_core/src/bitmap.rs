//! Block allocation bitmap (spec.md §4.2), plus the original's exact
//! spread-vs-contiguous block-ownership test (`reiserfs_bitmap_block` in
//! `bitmap.c`), carried forward per SPEC_FULL.md §2.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

const START_MAGIC: u32 = 374_031;
const END_MAGIC: u32 = 7_786_472;

/// In-memory mirror of the on-disk allocation bitmap for one volume.
pub struct Bitmap {
    bits: Vec<u8>,
    bit_size: usize,
    set_bits: usize,
    /// Monotonic hint: no zero bit exists below this index. Advanced only
    /// by callers that allocate (spec.md: "advanced only on allocating
    /// callers").
    first_zero: usize,
    dirty: bool,
}

impl Bitmap {
    pub fn new(bit_size: usize) -> Self {
        let bytes = bit_size.div_ceil(8);
        Bitmap {
            bits: vec![0u8; bytes],
            bit_size,
            set_bits: 0,
            first_zero: 0,
            dirty: false,
        }
    }

    pub fn bit_size(&self) -> usize {
        self.bit_size
    }

    pub fn set_count(&self) -> usize {
        self.set_bits
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    #[track_caller]
    fn check_bit(&self, bit: usize) {
        assert!(bit < self.bit_size, "bit {bit} out of range (size {})", self.bit_size);
    }

    pub fn test(&self, bit: usize) -> bool {
        self.check_bit(bit);
        (self.bits[bit / 8] >> (bit % 8)) & 1 != 0
    }

    pub fn set(&mut self, bit: usize) {
        self.check_bit(bit);
        let byte = &mut self.bits[bit / 8];
        let mask = 1u8 << (bit % 8);
        if *byte & mask == 0 {
            *byte |= mask;
            self.set_bits += 1;
        }
    }

    pub fn clear(&mut self, bit: usize) {
        self.check_bit(bit);
        let byte = &mut self.bits[bit / 8];
        let mask = 1u8 << (bit % 8);
        if *byte & mask != 0 {
            *byte &= !mask;
            self.set_bits -= 1;
            if bit < self.first_zero {
                self.first_zero = bit;
            }
        }
    }

    /// Next zero bit at or after `start`, or `bit_size` on exhaustion.
    pub fn find_zero_from(&self, start: usize) -> usize {
        let begin = start.max(if start >= self.first_zero { self.first_zero } else { start });
        for bit in begin..self.bit_size {
            if !self.test(bit) {
                return bit;
            }
        }
        self.bit_size
    }

    /// Allocate the next free bit at or after `start`, setting it and
    /// advancing the `first_zero` hint.
    pub fn alloc_from(&mut self, start: usize) -> Option<usize> {
        let bit = self.find_zero_from(start);
        if bit >= self.bit_size {
            return None;
        }
        self.set(bit);
        self.first_zero = bit + 1;
        Some(bit)
    }

    pub fn expand(&mut self, new_bits: usize) {
        assert!(new_bits >= self.bit_size);
        self.bits.resize(new_bits.div_ceil(8), 0);
        self.bit_size = new_bits;
    }

    pub fn shrink(&mut self, new_bits: usize) {
        assert!(new_bits <= self.bit_size);
        for bit in new_bits..self.bit_size {
            if self.test(bit) {
                self.set_bits -= 1;
            }
        }
        self.bits.truncate(new_bits.div_ceil(8));
        self.bit_size = new_bits;
        if let Some(&last) = self.bits.last() {
            let used_bits_in_last_byte = self.bit_size % 8;
            if used_bits_in_last_byte != 0 {
                let mask = (1u8 << used_bits_in_last_byte) - 1;
                *self.bits.last_mut().unwrap() = last & mask;
            }
        }
        self.first_zero = self.first_zero.min(self.bit_size);
    }

    pub fn copy(&self) -> Bitmap {
        Bitmap {
            bits: self.bits.clone(),
            bit_size: self.bit_size,
            set_bits: self.set_bits,
            first_zero: self.first_zero,
            dirty: self.dirty,
        }
    }

    pub fn compare(&self, other: &Bitmap) -> bool {
        self.bit_size == other.bit_size && self.bits == other.bits
    }

    /// Bitwise OR in place.
    pub fn disjunction(&mut self, other: &Bitmap) {
        assert_eq!(self.bit_size, other.bit_size);
        self.set_bits = 0;
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a |= *b;
        }
        self.recount();
    }

    /// `self AND NOT other`, in place.
    pub fn delta(&mut self, other: &Bitmap) {
        assert_eq!(self.bit_size, other.bit_size);
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a &= !*b;
        }
        self.recount();
    }

    pub fn invert(&mut self) {
        for b in self.bits.iter_mut() {
            *b = !*b;
        }
        self.mask_trailing(0);
        self.recount();
    }

    pub fn zeros(&self) -> usize {
        self.bit_size - self.set_bits
    }

    pub fn ones(&self) -> usize {
        self.set_bits
    }

    fn recount(&mut self) {
        self.mask_trailing(0);
        self.set_bits = self.bits.iter().map(|b| b.count_ones() as usize).sum();
        self.first_zero = 0;
    }

    /// Zero the unused trailing bits of the last byte, regardless of
    /// padding convention (`pad` is only meaningful for `flush`'s
    /// historical "set trailing bits to 1" on-disk quirk; callers doing
    /// internal arithmetic always pass 0).
    fn mask_trailing(&mut self, pad: u8) {
        let used = self.bit_size % 8;
        if used == 0 || self.bits.is_empty() {
            return;
        }
        let keep_mask = (1u8 << used) - 1;
        let last = self.bits.last_mut().unwrap();
        if pad == 0 {
            *last &= keep_mask;
        } else {
            *last = (*last & keep_mask) | (!keep_mask);
        }
    }

    /// Serialize in the run-length format of spec.md §6 ("Bitmap save
    /// format"): magic, bit-size, extent-count, then alternating
    /// used/free run lengths starting with used, terminated by a magic.
    pub fn save<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(START_MAGIC)?;
        out.write_u32::<LittleEndian>(self.bit_size as u32)?;

        let mut runs: Vec<u32> = Vec::new();
        let mut cur_used = self.bit_size > 0 && self.test(0);
        let mut run_len: u32 = 0;
        // The format always starts with a "used" run, even if it is zero
        // length (bit 0 free) — matches reiserfsprogs' save format.
        if self.bit_size > 0 && !cur_used {
            runs.push(0);
            cur_used = true;
        }
        for bit in 0..self.bit_size {
            let set = self.test(bit);
            if set == cur_used {
                run_len += 1;
            } else {
                runs.push(run_len);
                cur_used = set;
                run_len = 1;
            }
        }
        if self.bit_size > 0 {
            runs.push(run_len);
        }

        out.write_u32::<LittleEndian>(runs.len() as u32)?;
        for r in &runs {
            out.write_u32::<LittleEndian>(*r)?;
        }
        out.write_u32::<LittleEndian>(END_MAGIC)?;
        Ok(())
    }

    pub fn load<R: Read>(input: &mut R) -> io::Result<Bitmap> {
        let magic = input.read_u32::<LittleEndian>()?;
        if magic != START_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad bitmap start magic"));
        }
        let bit_size = input.read_u32::<LittleEndian>()? as usize;
        let extent_count = input.read_u32::<LittleEndian>()?;

        let mut bm = Bitmap::new(bit_size);
        let mut bit = 0usize;
        let mut used = true;
        for _ in 0..extent_count {
            let run = input.read_u32::<LittleEndian>()? as usize;
            if used {
                for b in bit..(bit + run).min(bit_size) {
                    bm.set(b);
                }
            }
            bit += run;
            used = !used;
        }

        let end = input.read_u32::<LittleEndian>()?;
        if end != END_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad bitmap end magic"));
        }
        Ok(bm)
    }

    /// Does block `block` host bitmap data, given volume geometry? Ported
    /// bit-for-bit from `reiserfs_bitmap_block` in `bitmap.c`: contiguous
    /// layout packs all bitmap blocks right after the superblock block;
    /// spread layout puts one bitmap block at the start of every
    /// `8*blocksize`-block group, plus the one that immediately follows
    /// the superblock itself.
    pub fn is_bitmap_block(
        spread: bool,
        blocksize: u32,
        sb_block: u32,
        bmap_count: u32,
        block: u32,
    ) -> bool {
        if spread {
            let group = blocksize as u64 * 8;
            if block != 0 && (block as u64) % group == 0 {
                return true;
            }
            block == sb_block + 1
        } else {
            block > sb_block && block < sb_block + 1 + bmap_count
        }
    }

    /// Spread bitmaps are used whenever the superblock does not sit at
    /// the legacy block 2 (i.e. the modern 64K-offset layout).
    pub fn spread_layout(sb_block: u32) -> bool {
        sb_block != 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    #[test]
    fn set_clear_test() {
        let mut bm = Bitmap::new(100);
        assert!(!bm.test(5));
        bm.set(5);
        assert!(bm.test(5));
        assert_eq!(bm.set_count(), 1);
        bm.clear(5);
        assert!(!bm.test(5));
        assert_eq!(bm.set_count(), 0);
    }

    #[test]
    fn find_zero_from_respects_hint() {
        let mut bm = Bitmap::new(16);
        for b in 0..4 {
            bm.alloc_from(0);
            let _ = b;
        }
        assert_eq!(bm.find_zero_from(0), 4);
        bm.clear(1);
        // first_zero hint only advances on alloc, so clearing a low bit
        // must still be found by a scan starting below it.
        assert_eq!(bm.find_zero_from(0), 1);
    }

    #[test]
    fn shrink_masks_trailing_bits() {
        let mut bm = Bitmap::new(16);
        for b in 0..16 {
            bm.set(b);
        }
        bm.shrink(5);
        assert_eq!(bm.bit_size(), 5);
        assert_eq!(bm.set_count(), 5);
    }

    #[test]
    fn is_bitmap_block_contiguous() {
        assert!(Bitmap::is_bitmap_block(false, 4096, 16, 3, 17));
        assert!(Bitmap::is_bitmap_block(false, 4096, 16, 3, 19));
        assert!(!Bitmap::is_bitmap_block(false, 4096, 16, 3, 20));
        assert!(!Bitmap::is_bitmap_block(false, 4096, 16, 3, 16));
    }

    #[test]
    fn is_bitmap_block_spread() {
        let group = 4096u32 * 8;
        assert!(Bitmap::is_bitmap_block(true, 4096, 16, 0, group));
        assert!(Bitmap::is_bitmap_block(true, 4096, 16, 0, 17));
        assert!(!Bitmap::is_bitmap_block(true, 4096, 16, 0, 18));
    }

    quickcheck! {
        fn save_load_roundtrip(bits: Vec<bool>) -> bool {
            let mut bm = Bitmap::new(bits.len());
            for (i, b) in bits.iter().enumerate() {
                if *b { bm.set(i); }
            }
            let mut buf = Vec::new();
            bm.save(&mut buf).unwrap();
            let loaded = Bitmap::load(&mut &buf[..]).unwrap();
            loaded.bit_size() == bm.bit_size() && loaded.compare(&bm)
        }
    }
}
