// Parallel LSD radix sort over fixed-stride records
//
// Both entry points run one counting pass per key byte, least significant
// first. Each pass splits the input into per-thread slices, builds private
// histograms, derives per-thread scatter offsets that preserve stability,
// and scatters through per-bucket coalescing buffers drawn from a shared
// memory pool. After `n_phases` passes the sorted data sits in `data` when
// the pass count is even, in `tmp` otherwise; the caller picks by parity.

use crate::memory::{MemoryPool, SharedPtr};
use std::sync::Arc;
use std::thread;

/// Records coalesced per bucket before a flush to the destination array
pub const RADIX_BUFFER_WIDTH: usize = 32;

/// Below `threads * this`, sorting falls back to a single-threaded pass
const MIN_RECS_PER_THREAD: usize = 1 << 12;

fn effective_threads(n_recs: usize, n_threads: u32) -> usize {
    let n_threads = n_threads.max(1) as usize;
    if n_recs < n_threads * MIN_RECS_PER_THREAD {
        1
    } else {
        n_threads
    }
}

/// Per-thread scatter start offsets: thread `t`'s slice of bucket `b`
/// begins after all lower buckets and after bucket `b` counts of threads
/// below `t`
fn scatter_offsets(histos: &[[usize; 256]]) -> Vec<[usize; 256]> {
    let mut offsets = vec![[0usize; 256]; histos.len()];
    let mut sum = 0usize;
    for b in 0..256 {
        for (t, h) in histos.iter().enumerate() {
            offsets[t][b] = sum;
            sum += h[b];
        }
    }
    offsets
}

// 64-bit variant - records are single u64 words

/// Sort `data` by its low `n_phases` bytes. `tmp` is the ping-pong buffer;
/// both slices cover exactly the records to sort.
pub fn radix_sort_u64(
    pool: &Arc<MemoryPool>,
    data: &mut [u64],
    tmp: &mut [u64],
    n_phases: u32,
    n_threads: u32,
) {
    debug_assert_eq!(data.len(), tmp.len());
    let n_threads = effective_threads(data.len(), n_threads);
    let mut src: &mut [u64] = data;
    let mut dst: &mut [u64] = tmp;
    for pass in 0..n_phases {
        pass_u64(pool, src, dst, pass * 8, n_threads);
        std::mem::swap(&mut src, &mut dst);
    }
}

fn pass_u64(pool: &Arc<MemoryPool>, src: &[u64], dst: &mut [u64], shift: u32, n_threads: usize) {
    let n = src.len();
    if n == 0 {
        return;
    }

    if n_threads == 1 {
        let mut counts = [0usize; 256];
        for &v in src {
            counts[((v >> shift) & 0xFF) as usize] += 1;
        }
        let mut pos = [0usize; 256];
        let mut sum = 0;
        for b in 0..256 {
            pos[b] = sum;
            sum += counts[b];
        }
        for &v in src {
            let b = ((v >> shift) & 0xFF) as usize;
            dst[pos[b]] = v;
            pos[b] += 1;
        }
        return;
    }

    let chunk = (n + n_threads - 1) / n_threads;
    let mut histos = vec![[0usize; 256]; src.chunks(chunk).len()];
    thread::scope(|s| {
        for (h, part) in histos.iter_mut().zip(src.chunks(chunk)) {
            s.spawn(move || {
                for &v in part {
                    h[((v >> shift) & 0xFF) as usize] += 1;
                }
            });
        }
    });

    let offsets = scatter_offsets(&histos);
    let dst_ptr = SharedPtr::new(dst.as_mut_ptr());
    thread::scope(|s| {
        for (offs, part) in offsets.into_iter().zip(src.chunks(chunk)) {
            let pool = Arc::clone(pool);
            s.spawn(move || scatter_u64(&pool, part, dst_ptr, shift, offs));
        }
    });
}

fn scatter_u64(
    pool: &Arc<MemoryPool>,
    part: &[u64],
    dst: SharedPtr<u64>,
    shift: u32,
    mut offs: [usize; 256],
) {
    let mut raw = pool.reserve();
    let buf: &mut [u64] =
        bytemuck::cast_slice_mut(&mut raw.as_mut_slice()[..256 * RADIX_BUFFER_WIDTH * 8]);
    let mut fill = [0u32; 256];

    for &v in part {
        let b = ((v >> shift) & 0xFF) as usize;
        buf[b * RADIX_BUFFER_WIDTH + fill[b] as usize] = v;
        fill[b] += 1;
        if fill[b] as usize == RADIX_BUFFER_WIDTH {
            // SAFETY: offsets of distinct buckets and threads are disjoint
            unsafe {
                std::ptr::copy_nonoverlapping(
                    buf.as_ptr().add(b * RADIX_BUFFER_WIDTH),
                    dst.get().add(offs[b]),
                    RADIX_BUFFER_WIDTH,
                );
            }
            offs[b] += RADIX_BUFFER_WIDTH;
            fill[b] = 0;
        }
    }
    for b in 0..256 {
        if fill[b] > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    buf.as_ptr().add(b * RADIX_BUFFER_WIDTH),
                    dst.get().add(offs[b]),
                    fill[b] as usize,
                );
            }
        }
    }
}

// Generic variant - fixed-stride records, key bytes at an offset

/// Sort fixed-stride records of `rec_size` bytes by `n_phases` key bytes
/// starting at `key_offset` within each record. Both byte slices cover
/// exactly `n_recs * rec_size` bytes.
#[allow(clippy::too_many_arguments)]
pub fn radix_sort_records(
    pool: &Arc<MemoryPool>,
    data: &mut [u8],
    tmp: &mut [u8],
    n_recs: usize,
    rec_size: usize,
    key_offset: usize,
    n_phases: u32,
    n_threads: u32,
) {
    debug_assert_eq!(data.len(), n_recs * rec_size);
    debug_assert_eq!(tmp.len(), n_recs * rec_size);
    let n_threads = effective_threads(n_recs, n_threads);
    let mut src: &mut [u8] = data;
    let mut dst: &mut [u8] = tmp;
    for pass in 0..n_phases {
        pass_records(
            pool,
            src,
            dst,
            rec_size,
            key_offset + pass as usize,
            n_threads,
        );
        std::mem::swap(&mut src, &mut dst);
    }
}

fn pass_records(
    pool: &Arc<MemoryPool>,
    src: &[u8],
    dst: &mut [u8],
    rec_size: usize,
    key_byte: usize,
    n_threads: usize,
) {
    let n = src.len() / rec_size;
    if n == 0 {
        return;
    }

    if n_threads == 1 {
        let mut counts = [0usize; 256];
        for rec in src.chunks_exact(rec_size) {
            counts[rec[key_byte] as usize] += 1;
        }
        let mut pos = [0usize; 256];
        let mut sum = 0;
        for b in 0..256 {
            pos[b] = sum;
            sum += counts[b];
        }
        for rec in src.chunks_exact(rec_size) {
            let b = rec[key_byte] as usize;
            dst[pos[b] * rec_size..(pos[b] + 1) * rec_size].copy_from_slice(rec);
            pos[b] += 1;
        }
        return;
    }

    let chunk_recs = (n + n_threads - 1) / n_threads;
    let chunk_bytes = chunk_recs * rec_size;
    let mut histos = vec![[0usize; 256]; src.chunks(chunk_bytes).len()];
    thread::scope(|s| {
        for (h, part) in histos.iter_mut().zip(src.chunks(chunk_bytes)) {
            s.spawn(move || {
                for rec in part.chunks_exact(rec_size) {
                    h[rec[key_byte] as usize] += 1;
                }
            });
        }
    });

    let offsets = scatter_offsets(&histos);
    let dst_ptr = SharedPtr::new(dst.as_mut_ptr());
    thread::scope(|s| {
        for (offs, part) in offsets.into_iter().zip(src.chunks(chunk_bytes)) {
            let pool = Arc::clone(pool);
            s.spawn(move || scatter_records(&pool, part, dst_ptr, rec_size, key_byte, offs));
        }
    });
}

fn scatter_records(
    pool: &Arc<MemoryPool>,
    part: &[u8],
    dst: SharedPtr<u8>,
    rec_size: usize,
    key_byte: usize,
    mut offs: [usize; 256],
) {
    let bucket_bytes = RADIX_BUFFER_WIDTH * rec_size;
    let mut raw = pool.reserve();
    let buf = &mut raw.as_mut_slice()[..256 * bucket_bytes];
    let mut fill = [0u32; 256];

    for rec in part.chunks_exact(rec_size) {
        let b = rec[key_byte] as usize;
        let at = b * bucket_bytes + fill[b] as usize * rec_size;
        buf[at..at + rec_size].copy_from_slice(rec);
        fill[b] += 1;
        if fill[b] as usize == RADIX_BUFFER_WIDTH {
            // SAFETY: offsets of distinct buckets and threads are disjoint
            unsafe {
                std::ptr::copy_nonoverlapping(
                    buf.as_ptr().add(b * bucket_bytes),
                    dst.get().add(offs[b] * rec_size),
                    bucket_bytes,
                );
            }
            offs[b] += RADIX_BUFFER_WIDTH;
            fill[b] = 0;
        }
    }
    for b in 0..256 {
        if fill[b] > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    buf.as_ptr().add(b * bucket_bytes),
                    dst.get().add(offs[b] * rec_size),
                    fill[b] as usize * rec_size,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(rec_size: usize) -> Arc<MemoryPool> {
        let part = 256 * RADIX_BUFFER_WIDTH * rec_size;
        MemoryPool::new(part * 8, part)
    }

    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }
    }

    #[test]
    fn test_u64_full_width_sort() {
        let pool = test_pool(8);
        let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);
        let mut data: Vec<u64> = (0..40_000).map(|_| rng.next()).collect();
        let mut tmp = vec![0u64; data.len()];
        let mut expected = data.clone();
        expected.sort_unstable();

        radix_sort_u64(&pool, &mut data, &mut tmp, 8, 4);
        // 8 passes: result back in data
        assert_eq!(data, expected);
    }

    #[test]
    fn test_u64_odd_pass_count_lands_in_tmp() {
        let pool = test_pool(8);
        let mut rng = XorShift(42);
        let mut data: Vec<u64> = (0..20_000).map(|_| rng.next() & 0xFF).collect();
        let mut tmp = vec![0u64; data.len()];
        let mut expected = data.clone();
        expected.sort_unstable();

        radix_sort_u64(&pool, &mut data, &mut tmp, 1, 4);
        assert_eq!(tmp, expected);
    }

    #[test]
    fn test_u64_partial_key_is_stable() {
        let pool = test_pool(8);
        let mut rng = XorShift(7);
        // Key in the low 2 bytes, original index in the high 4 bytes
        let mut data: Vec<u64> = (0..30_000u64)
            .map(|i| (i << 32) | (rng.next() & 0xFFFF))
            .collect();
        let mut tmp = vec![0u64; data.len()];

        radix_sort_u64(&pool, &mut data, &mut tmp, 2, 4);
        for w in data.windows(2) {
            let (ka, kb) = (w[0] & 0xFFFF, w[1] & 0xFFFF);
            assert!(ka <= kb);
            if ka == kb {
                assert!(w[0] >> 32 < w[1] >> 32, "equal keys must keep source order");
            }
        }
    }

    #[test]
    fn test_u64_small_input_single_thread_fallback() {
        let pool = test_pool(8);
        let mut data: Vec<u64> = vec![5, 3, 9, 1, 1, 8, 0, 2];
        let mut tmp = vec![0u64; data.len()];
        radix_sort_u64(&pool, &mut data, &mut tmp, 8, 16);
        assert_eq!(data, vec![0, 1, 1, 2, 3, 5, 8, 9]);
    }

    #[test]
    fn test_zero_phases_is_noop() {
        let pool = test_pool(8);
        let mut data: Vec<u64> = vec![3, 1, 2];
        let mut tmp = vec![0u64; 3];
        radix_sort_u64(&pool, &mut data, &mut tmp, 0, 4);
        assert_eq!(data, vec![3, 1, 2]);
    }

    #[test]
    fn test_records_sort_with_payload() {
        const REC: usize = 16;
        let pool = test_pool(REC);
        let mut rng = XorShift(1234);

        let n = 20_000usize;
        let mut data = vec![0u8; n * REC];
        for (i, rec) in data.chunks_exact_mut(REC).enumerate() {
            // 3 key bytes at offset 0, payload records the source index
            rec[..8].copy_from_slice(&(rng.next() & 0xFF_FFFF).to_le_bytes());
            rec[8..].copy_from_slice(&(i as u64).to_le_bytes());
        }
        let mut tmp = vec![0u8; n * REC];

        radix_sort_records(&pool, &mut data, &mut tmp, n, REC, 0, 3, 4);
        // 3 passes: result in tmp
        let mut prev_key = 0u64;
        let mut prev_idx = 0u64;
        for rec in tmp.chunks_exact(REC) {
            let key = u64::from_le_bytes(rec[..8].try_into().unwrap());
            let idx = u64::from_le_bytes(rec[8..].try_into().unwrap());
            assert!(key >= prev_key);
            if key == prev_key {
                assert!(idx > prev_idx, "equal keys must keep source order");
            }
            prev_key = key;
            prev_idx = idx;
        }
    }

    #[test]
    fn test_records_key_at_offset() {
        const REC: usize = 12;
        let pool = test_pool(REC);
        let n = 4_096usize;
        let mut data = vec![0u8; n * REC];
        for (i, rec) in data.chunks_exact_mut(REC).enumerate() {
            let v = (n - i) as u32;
            rec[4..8].copy_from_slice(&v.to_le_bytes());
        }
        let mut tmp = vec![0u8; n * REC];

        radix_sort_records(&pool, &mut data, &mut tmp, n, REC, 4, 4, 1);
        // 4 passes: result back in data
        let mut prev = 0u32;
        for rec in data.chunks_exact(REC) {
            let v = u32::from_le_bytes(rec[4..8].try_into().unwrap());
            assert!(v >= prev);
            prev = v;
        }
        assert_eq!(
            u32::from_le_bytes(data[4..8].try_into().unwrap()),
            1,
            "smallest key first"
        );
    }
}
