//! End-to-end: bit-field reads and writes over random words.
//!
//! Copies a random bit-stream field by field, for every width and initial
//! shift, and checks population counts survive the trip. A mismatch in any
//! width/offset combination shows up as a popcount delta.

use trailpack::bits::{bit_mask, read_bits64, write_bits64};

const NUM_WORDS: usize = 1000;

struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

/// Fill `dst` with random words; returns the total popcount.
fn random_bytes(dst: &mut [u8], num_words: usize, seed: u64) -> u32 {
    let mut rng = XorShift(seed);
    let mut popsum = 0;
    for w in 0..num_words {
        let val = rng.next();
        dst[w * 8..w * 8 + 8].copy_from_slice(&val.to_le_bytes());
        popsum += val.count_ones();
    }
    popsum
}

#[test]
fn popcount_survives_read_write_cycles() {
    let mut src = vec![0u8; (NUM_WORDS + 1) * 8];
    let mut dst = vec![0u8; (NUM_WORDS + 1) * 8];

    for round in 0..5u64 {
        let total_pop = random_bytes(&mut src, NUM_WORDS, 984_345 + round);
        for width in 1..=64u32 {
            for shift in 0..9u64 {
                // Bits below the starting shift never get copied.
                let skipped = (src[0] as u64 & bit_mask(shift as u32)).count_ones();

                dst.iter_mut().for_each(|b| *b = 0);
                let mut offs = shift;
                while offs < (NUM_WORDS as u64) * 64 {
                    let val = read_bits64(&src, offs, width);
                    write_bits64(&mut dst, offs, val);
                    assert_eq!(
                        read_bits64(&dst, offs, width),
                        val,
                        "width={width} shift={shift} offs={offs}"
                    );
                    offs += width as u64;
                }

                let mut popsum = 0;
                let mut offs = shift;
                while offs < (NUM_WORDS as u64) * 64 {
                    popsum += read_bits64(&dst, offs, width).count_ones();
                    offs += width as u64;
                }
                assert_eq!(
                    popsum,
                    total_pop - skipped,
                    "width={width} shift={shift}"
                );
            }
        }
    }
}

#[test]
fn masked_roundtrip_for_all_widths() {
    let mut rng = XorShift(0xCAFE);
    let mut buf = vec![0u8; 64];
    for width in 1..=64u32 {
        for offs in 0..128u64 {
            buf.iter_mut().for_each(|b| *b = 0);
            let x = rng.next();
            write_bits64(&mut buf, offs, x & bit_mask(width));
            assert_eq!(read_bits64(&buf, offs, width), x & bit_mask(width));
        }
    }
}
