use crate::layout::{BitmapBlock, BLOCK_BITS};

fn decompose(bit: usize) -> (usize, usize) {
    (bit / 64, bit % 64)
}

/// Find and set the first clear bit below `limit`, returning its index.
pub fn alloc_bit(bitmap_blk: &mut BitmapBlock, limit: usize) -> Option<usize> {
    let limit = limit.min(BLOCK_BITS);
    let (bits64_pos, inner_pos) = bitmap_blk
        .iter()
        .enumerate()
        .find(|(_, num)| **num != u64::MAX)
        .map(|(idx, num)| (idx, num.trailing_ones() as usize))?;
    // 第一个空位之前的位全部已占用，超出 limit 就说明本块已满。
    let bit = bits64_pos * 64 + inner_pos;
    if bit >= limit {
        return None;
    }
    bitmap_blk[bits64_pos] |= 1u64 << inner_pos;
    Some(bit)
}

/// Whether `bit` is set.
pub fn test_bit(bitmap_blk: &BitmapBlock, bit: usize) -> bool {
    let (bits64_pos, inner_pos) = decompose(bit);
    bitmap_blk[bits64_pos] >> inner_pos & 1 == 1
}

/// Clear `bit`, which must be set.
pub fn clear_bit(bitmap_blk: &mut BitmapBlock, bit: usize) {
    assert!(test_bit(bitmap_blk, bit), "free: block bit {bit} not allocated");
    let (bits64_pos, inner_pos) = decompose(bit);
    bitmap_blk[bits64_pos] ^= 1u64 << inner_pos;
}

/// Number of set bits below `limit`.
pub fn count_bits(bitmap_blk: &BitmapBlock, limit: usize) -> usize {
    let limit = limit.min(BLOCK_BITS);
    let full = limit / 64;
    let mut count: usize = bitmap_blk[..full].iter().map(|w| w.count_ones() as usize).sum();
    let rest = limit % 64;
    if rest != 0 {
        count += (bitmap_blk[full] & ((1u64 << rest) - 1)).count_ones() as usize;
    }
    count
}
