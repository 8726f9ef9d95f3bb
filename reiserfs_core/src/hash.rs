//! Directory-entry name hashing: `tea`, `rupasov` ("yura"), and `r5`,
//! ported bit-for-bit from `libreiserfs/hash.c` (SPEC_FULL.md §2). Every
//! multi-byte load here must match the C source's little-endian-by-byte
//! construction exactly, independent of host endianness.

use strum_macros::{Display, EnumString};

/// Fixed offset of the `.` entry in every directory item.
pub const OFFSET_DOT: u32 = 1;
/// Fixed offset of the `..` entry in every directory item.
pub const OFFSET_DOT_DOT: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum HashKind {
    Tea,
    Rupasov,
    R5,
}

impl HashKind {
    pub fn all() -> [HashKind; 3] {
        [HashKind::Tea, HashKind::Rupasov, HashKind::R5]
    }

    pub fn hash(self, name: &[u8]) -> u32 {
        match self {
            HashKind::Tea => tea(name),
            HashKind::Rupasov => yura(name),
            HashKind::R5 => r5(name),
        }
    }
}

const DELTA: u32 = 0x9E37_79B9;
const FULLROUNDS: u32 = 10;
const PARTROUNDS: u32 = 6;

fn teacore(rounds: u32, h0: &mut u32, h1: &mut u32, a: u32, b: u32, c: u32, d: u32) {
    let mut sum: u32 = 0;
    let mut b0 = *h0;
    let mut b1 = *h1;
    for _ in 0..rounds {
        sum = sum.wrapping_add(DELTA);
        b0 = b0.wrapping_add(
            (b1 << 4).wrapping_add(a) ^ b1.wrapping_add(sum) ^ ((b1 >> 5).wrapping_add(b)),
        );
        b1 = b1.wrapping_add(
            (b0 << 4).wrapping_add(c) ^ b0.wrapping_add(sum) ^ ((b0 >> 5).wrapping_add(d)),
        );
    }
    *h0 = h0.wrapping_add(b0);
    *h1 = h1.wrapping_add(b1);
}

/// Keyed TEA hash (`reiserfs_hash_keyed`).
pub fn tea(msg: &[u8]) -> u32 {
    let mut h0: u32 = 0x9464_a485;
    let mut h1: u32 = 0x542e_1a94;

    let len0 = msg.len();
    let pad = {
        let l = len0 as u32;
        let mut p = l | (l << 8);
        p |= p << 16;
        p
    };

    let mut pos = 0usize;
    let mut remaining = len0;
    let mut a;
    let mut b;
    let mut c;
    let mut d;

    while remaining >= 16 {
        a = le32(&msg[pos..pos + 4]);
        b = le32(&msg[pos + 4..pos + 8]);
        c = le32(&msg[pos + 8..pos + 12]);
        d = le32(&msg[pos + 12..pos + 16]);
        teacore(PARTROUNDS, &mut h0, &mut h1, a, b, c, d);
        pos += 16;
        remaining -= 16;
    }

    let tail = &msg[pos..pos + remaining];
    if remaining >= 12 {
        a = le32(&tail[0..4]);
        b = le32(&tail[4..8]);
        c = le32(&tail[8..12]);
        d = pad;
        for &byte in &tail[12..remaining] {
            d = (d << 8) | byte as u32;
        }
    } else if remaining >= 8 {
        a = le32(&tail[0..4]);
        b = le32(&tail[4..8]);
        let mut cc = pad;
        for &byte in &tail[8..remaining] {
            cc = (cc << 8) | byte as u32;
        }
        c = cc;
        d = pad;
    } else if remaining >= 4 {
        a = le32(&tail[0..4]);
        let mut bb = pad;
        for &byte in &tail[4..remaining] {
            bb = (bb << 8) | byte as u32;
        }
        b = bb;
        c = pad;
        d = pad;
    } else {
        let mut aa = pad;
        for &byte in &tail[0..remaining] {
            aa = (aa << 8) | byte as u32;
        }
        a = aa;
        b = pad;
        c = pad;
        d = pad;
    }

    teacore(FULLROUNDS, &mut h0, &mut h1, a, b, c, d);
    h0 ^ h1
}

fn le32(b: &[u8]) -> u32 {
    (b[0] as u32) | (b[1] as u32) << 8 | (b[2] as u32) << 16 | (b[3] as u32) << 24
}

/// "Rupasov" / yura hash: a positional decimal-digit hash historically
/// used for filenames made of ASCII digits; `reiserfs_hash_yura`.
pub fn yura(msg: &[u8]) -> u32 {
    let len = msg.len();
    if len == 0 {
        return 0;
    }
    let digit = |c: u8| -> u32 { (c as i32 - 48) as u32 };
    // Positional weight for index i is 10^(len-1-i).
    let pow10 = |i: usize| -> u32 { 10u32.wrapping_pow((len - 1).saturating_sub(i) as u32) };

    let mut a = digit(msg[0]).wrapping_mul(pow10(0));
    for i in 1..len {
        a = a.wrapping_add(digit(msg[i]).wrapping_mul(pow10(i)));
    }
    for i in len..40 {
        a = a.wrapping_add(digit(b'0').wrapping_mul(pow10(i)));
    }
    for i in 40..256 {
        // The original continues the same positional construction with
        // `c = i` up through 255; unreachable for any real filename
        // (`NAME_MAX` is far below 256) but kept for fidelity with
        // hash.c's loop structure.
        a = a.wrapping_add((i as u32).wrapping_mul(pow10(i)));
    }

    a << 7
}

/// `reiserfs_hash_r5`: a simple multiplicative rolling hash.
pub fn r5(msg: &[u8]) -> u32 {
    let mut a: u32 = 0;
    for &byte in msg {
        a = a.wrapping_add((byte as i8 as i32 as u32) << 4);
        a = a.wrapping_add(((byte as i8 as i32) >> 4) as u32);
        a = a.wrapping_mul(11);
    }
    a
}

/// Mask applied to a hash before it's packed into a directory-entry offset
/// (the low 7 bits are reserved for the collision generation counter).
pub fn offset_hash(raw_hash: u32) -> u32 {
    raw_hash & !0x7f
}

/// `reiserfs_hash_correct`: validate (or infer) the hash function used for
/// `name` given its recorded directory-entry offset. `.`/`..` are special
/// and offset-fixed regardless of hash. If `known` is `None`, every family
/// is tried; more than one match is an ambiguity the caller must refuse to
/// resolve silently (spec.md §9 Open Questions).
pub fn detect(known: Option<HashKind>, name: &[u8], deh_offset: u32) -> Result<HashKind, DetectError> {
    if name == b"." {
        return if deh_offset == OFFSET_DOT {
            Ok(known.unwrap_or(HashKind::Tea))
        } else {
            Err(DetectError::Mismatch)
        };
    }
    if name == b".." {
        return if deh_offset == OFFSET_DOT_DOT {
            Ok(known.unwrap_or(HashKind::Tea))
        } else {
            Err(DetectError::Mismatch)
        };
    }

    if let Some(k) = known {
        return if offset_hash(k.hash(name)) == offset_hash(deh_offset) {
            Ok(k)
        } else {
            Err(DetectError::Mismatch)
        };
    }

    let matches: Vec<HashKind> = HashKind::all()
        .into_iter()
        .filter(|k| offset_hash(k.hash(name)) == offset_hash(deh_offset))
        .collect();

    match matches.len() {
        0 => Err(DetectError::Mismatch),
        1 => Ok(matches[0]),
        _ => Err(DetectError::Ambiguous),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectError {
    Mismatch,
    Ambiguous,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn r5_known_vector() {
        // r5("") == 0 trivially; spot check determinism and stability
        // rather than a magic external vector.
        assert_eq!(r5(b""), 0);
        let h1 = r5(b"hello");
        let h2 = r5(b"hello");
        assert_eq!(h1, h2);
        assert_ne!(r5(b"hello"), r5(b"world"));
    }

    #[test]
    fn tea_deterministic_and_sensitive() {
        let h1 = tea(b"hello.txt");
        let h2 = tea(b"hello.txt");
        assert_eq!(h1, h2);
        assert_ne!(tea(b"hello.txt"), tea(b"hello.tx"));
    }

    #[test]
    fn dot_entries_fixed_offset() {
        assert_eq!(detect(None, b".", OFFSET_DOT).unwrap(), HashKind::Tea);
        assert!(detect(None, b".", 999).is_err());
        assert_eq!(detect(None, b"..", OFFSET_DOT_DOT).unwrap(), HashKind::Tea);
    }

    #[test]
    fn detect_matches_recorded_hash() {
        let name = b"longer_name_for_hashing";
        let h = HashKind::Tea.hash(name);
        let found = detect(None, name, h).unwrap();
        assert_eq!(found, HashKind::Tea);
    }
}
