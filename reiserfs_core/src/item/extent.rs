//! Extent item: an array of 32-bit block pointers, each covering one
//! block-size range of the file; a zero pointer is a sparse hole
//! (spec.md §3).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

pub const POINTER_LEN: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct Extent {
    pub pointers: Vec<u32>,
}

impl Extent {
    pub fn encoded_len(&self) -> usize {
        self.pointers.len() * POINTER_LEN
    }

    pub fn encode(&self, buf: &mut [u8]) {
        let mut w = &mut buf[0..self.encoded_len()];
        for p in &self.pointers {
            w.write_u32::<LittleEndian>(*p).unwrap();
        }
    }

    pub fn decode(buf: &[u8]) -> Extent {
        let mut r = buf;
        let mut pointers = Vec::with_capacity(buf.len() / POINTER_LEN);
        while r.len() >= POINTER_LEN {
            pointers.push(r.read_u32::<LittleEndian>().unwrap());
        }
        Extent { pointers }
    }

    /// `extent_check` (spec.md §4.6): length is a multiple of the pointer
    /// size and every nonzero pointer is within the device.
    pub fn check(len: usize, body: &[u8], device_blocks: u32) -> bool {
        if len % POINTER_LEN != 0 {
            return false;
        }
        let e = Extent::decode(&body[..len]);
        e.pointers.iter().all(|&p| p == 0 || p < device_blocks)
    }

    /// Zero every pointer matching `bad`, used by the repair engine's
    /// pass-1 leaf correction to drop ambiguous/out-of-bounds pointers.
    pub fn zero_matching(&mut self, mut bad: impl FnMut(u32) -> bool) -> usize {
        let mut zeroed = 0;
        for p in self.pointers.iter_mut() {
            if *p != 0 && bad(*p) {
                *p = 0;
                zeroed += 1;
            }
        }
        zeroed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_hole() {
        let e = Extent { pointers: vec![10, 0, 12] };
        let mut buf = vec![0u8; e.encoded_len()];
        e.encode(&mut buf);
        let back = Extent::decode(&buf);
        assert_eq!(back.pointers, e.pointers);
    }

    #[test]
    fn check_rejects_out_of_bounds() {
        let e = Extent { pointers: vec![5, 1000] };
        let mut buf = vec![0u8; e.encoded_len()];
        e.encode(&mut buf);
        assert!(!Extent::check(buf.len(), &buf, 100));
        assert!(Extent::check(buf.len(), &buf, 2000));
    }

    #[test]
    fn check_rejects_misaligned_length() {
        let buf = vec![0u8; 6];
        assert!(!Extent::check(6, &buf, 100));
    }
}
