// Super-k-mer expansion: reconstructing overlapping k-mers (or k+x-mers)
// from a bin's packed byte stream.
//
// A record is one byte with the number of additional symbols, the first
// k-mer packed two bits per base MSB-first, then the extension symbols.
// When `k % 4 != 0` the extension reuses the unused low bits of the last
// k-mer byte, and a partially consumed byte is skipped at the end of the
// record so the next record starts byte-aligned.

use crate::kmer::{KmerWord, QualityKmer, REV_BYTE};
use crate::memory::{MemoryPool, SharedPtr};
use anyhow::{bail, Result};
use rkmc_common::EXPAND_BUFFER_RECS;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// K-mers with a quality-derived probability below this are not counted
const MIN_PROB_QUAL: f64 = 0.0;

#[inline]
fn next_symb(data: &[u8], pos: &mut usize, byte_shift: &mut u32) -> u64 {
    let symb = (data[*pos] >> *byte_shift) & 3;
    if *byte_shift == 0 {
        *pos += 1;
        *byte_shift = 6;
    } else {
        *byte_shift -= 2;
    }
    symb as u64
}

#[inline]
fn check_record(data: &[u8], pos: usize, additional: usize, kmer_len: u32) -> Result<()> {
    let rec_bytes = (additional + kmer_len as usize + 3) / 4;
    if pos + rec_bytes > data.len() {
        bail!("super-k-mer record overruns the bin buffer");
    }
    Ok(())
}

/// Load the leading k-mer of a record: bytes land in the top of the word,
/// then the word is bottom-justified and masked. Returns the byte shift at
/// which the extension continues; `pos` ends up on the extension byte.
fn load_first_kmer<const S: usize>(
    data: &[u8],
    pos: &mut usize,
    kmer_len: u32,
    kmer: &mut KmerWord<S>,
    mask: &KmerWord<S>,
) -> u32 {
    let kmer_bytes = ((kmer_len + 3) / 4) as usize;
    for i in 0..kmer_bytes {
        kmer.set_byte(8 * S - 1 - i, data[*pos + i]);
    }
    *pos += kmer_bytes;
    let byte_shift = 6 - (kmer_len % 4) * 2;
    if byte_shift != 6 {
        *pos -= 1;
    }
    let kmer_shr = S as u32 * 32 - kmer_len;
    if kmer_shr != 0 {
        kmer.shr(kmer_shr);
    }
    kmer.mask(mask);
    byte_shift
}

/// As `load_first_kmer`, also assembling the reverse complement from the
/// byte-reversal LUT
fn load_first_kmer_both<const S: usize>(
    data: &[u8],
    pos: &mut usize,
    kmer_len: u32,
    kmer: &mut KmerWord<S>,
    rev: &mut KmerWord<S>,
    mask: &KmerWord<S>,
) -> u32 {
    let kmer_bytes = ((kmer_len + 3) / 4) as usize;
    for i in 0..kmer_bytes {
        kmer.set_byte(8 * S - 1 - i, data[*pos + i]);
        rev.set_byte(i, REV_BYTE[data[*pos + i] as usize]);
    }
    *pos += kmer_bytes;
    let byte_shift = 6 - (kmer_len % 4) * 2;
    if byte_shift != 6 {
        *pos -= 1;
    }
    let kmer_shr = S as u32 * 32 - kmer_len;
    if kmer_shr != 0 {
        kmer.shr(kmer_shr);
    }
    kmer.mask(mask);
    rev.mask(mask);
    byte_shift
}

// Plain k-mers

/// Expand a bin into single-strand k-mers
pub fn expand_kmers_plain<const S: usize>(
    data: &[u8],
    out: &mut [KmerWord<S>],
    kmer_len: u32,
) -> Result<usize> {
    let kmer_mask = KmerWord::<S>::n_ones(kmer_len * 2);
    let mut kmer = KmerWord::<S>::zero();
    let mut pos = 0;
    let mut n = 0;

    while pos < data.len() {
        let additional = data[pos] as usize;
        pos += 1;
        check_record(data, pos, additional, kmer_len)?;
        if n + 1 + additional > out.len() {
            bail!("expanded records exceed the bin's metadata record count");
        }

        kmer.clear();
        let mut byte_shift = load_first_kmer(data, &mut pos, kmer_len, &mut kmer, &kmer_mask);
        out[n] = kmer;
        n += 1;
        for _ in 0..additional {
            let symb = next_symb(data, &mut pos, &mut byte_shift);
            kmer.shl_insert_2bits(symb);
            kmer.mask(&kmer_mask);
            out[n] = kmer;
            n += 1;
        }
        if byte_shift != 6 {
            pos += 1;
        }
    }
    Ok(n)
}

/// Expand a bin into canonical k-mers (minimum of k-mer and reverse
/// complement)
pub fn expand_kmers_canonical<const S: usize>(
    data: &[u8],
    out: &mut [KmerWord<S>],
    kmer_len: u32,
) -> Result<usize> {
    let kmer_mask = KmerWord::<S>::n_ones(kmer_len * 2);
    let rev_shift = (kmer_len - 1) * 2;
    let mut kmer = KmerWord::<S>::zero();
    let mut rev = KmerWord::<S>::zero();
    let mut pos = 0;
    let mut n = 0;

    while pos < data.len() {
        let additional = data[pos] as usize;
        pos += 1;
        check_record(data, pos, additional, kmer_len)?;
        if n + 1 + additional > out.len() {
            bail!("expanded records exceed the bin's metadata record count");
        }

        kmer.clear();
        rev.clear();
        let mut byte_shift =
            load_first_kmer_both(data, &mut pos, kmer_len, &mut kmer, &mut rev, &kmer_mask);
        out[n] = if kmer < rev { kmer } else { rev };
        n += 1;
        for _ in 0..additional {
            let symb = next_symb(data, &mut pos, &mut byte_shift);
            kmer.shl_insert_2bits(symb);
            kmer.mask(&kmer_mask);
            rev.shr_insert_2bits(3 - symb, rev_shift);
            out[n] = if kmer < rev { kmer } else { rev };
            n += 1;
        }
        if byte_shift != 6 {
            pos += 1;
        }
    }
    Ok(n)
}

// K+x-mers

/// Expand a bin into single-strand k+x-mers: runs of up to `max_x + 1`
/// chained symbols become one word, tagged with the extension length
pub fn expand_kxmers_plain<const S: usize>(
    data: &[u8],
    out: &mut [KmerWord<S>],
    kmer_len: u32,
    max_x: u32,
) -> Result<usize> {
    let kmer_mask = KmerWord::<S>::n_ones(kmer_len * 2);
    let kxmer_mask = KmerWord::<S>::n_ones((kmer_len + max_x) * 2);
    let tag_bit = (kmer_len + max_x) * 2;
    let mut kxmer = KmerWord::<S>::zero();
    let mut pos = 0;
    let mut n = 0;

    let mut emit = |n: &mut usize, out: &mut [KmerWord<S>], v: KmerWord<S>| -> Result<()> {
        if *n >= out.len() {
            bail!("expanded records exceed the bin's k+x-mer estimate");
        }
        out[*n] = v;
        *n += 1;
        Ok(())
    };

    while pos < data.len() {
        let mut additional = data[pos] as u32;
        pos += 1;
        check_record(data, pos, additional as usize, kmer_len)?;

        kxmer.clear();
        let mut byte_shift = load_first_kmer(data, &mut pos, kmer_len, &mut kxmer, &kmer_mask);

        let first_x = max_x.min(additional);
        for _ in 0..first_x {
            let symb = next_symb(data, &mut pos, &mut byte_shift);
            kxmer.shl_insert_2bits(symb);
        }
        kxmer.set_2bits(first_x as u64, tag_bit);
        emit(&mut n, out, kxmer)?;
        additional -= first_x;

        let kxmers_count = additional / (max_x + 1);
        let kxmer_rest = additional % (max_x + 1);

        for _ in 0..kxmers_count {
            for _ in 0..max_x + 1 {
                let symb = next_symb(data, &mut pos, &mut byte_shift);
                kxmer.shl_insert_2bits(symb);
            }
            kxmer.mask(&kxmer_mask);
            kxmer.set_2bits(max_x as u64, tag_bit);
            emit(&mut n, out, kxmer)?;
        }
        if kxmer_rest != 0 {
            let symb = next_symb(data, &mut pos, &mut byte_shift);
            kxmer.shl_insert_2bits(symb);
            kxmer.mask(&kmer_mask);
            for _ in 0..kxmer_rest - 1 {
                let symb = next_symb(data, &mut pos, &mut byte_shift);
                kxmer.shl_insert_2bits(symb);
            }
            kxmer.set_2bits(kxmer_rest as u64 - 1, tag_bit);
            emit(&mut n, out, kxmer)?;
        }
        if byte_shift != 6 {
            pos += 1;
        }
    }
    Ok(n)
}

struct SharedOut<'a, const S: usize> {
    ptr: SharedPtr<KmerWord<S>>,
    cap: usize,
    cursor: &'a AtomicUsize,
}

impl<const S: usize> SharedOut<'_, S> {
    /// Claim a range of the shared output with one atomic add, then copy
    /// the staged records into it
    fn append(&self, recs: &[KmerWord<S>]) -> Result<()> {
        let at = self.cursor.fetch_add(recs.len(), Ordering::Relaxed);
        if at + recs.len() > self.cap {
            bail!("expanded records exceed the bin's k+x-mer estimate");
        }
        // SAFETY: the claimed range [at, at + len) belongs to this call alone
        unsafe {
            std::ptr::copy_nonoverlapping(recs.as_ptr(), self.ptr.get().add(at), recs.len());
        }
        Ok(())
    }
}

/// Expand a bin into canonical k+x-mers, in parallel.
///
/// The byte range is cut into near-equal segments snapped to record starts;
/// each thread decodes into a private staging buffer and claims space in
/// `out` through an atomic cursor. The decoder tracks which strand is
/// currently smaller and starts a fresh k+x-mer whenever the orientation
/// flips, so every emitted word extends a canonical k-mer.
pub fn expand_kxmers_canonical<const S: usize>(
    data: &[u8],
    out: &mut [KmerWord<S>],
    kmer_len: u32,
    max_x: u32,
    n_threads: u32,
    pool: &Arc<MemoryPool>,
) -> Result<usize> {
    let n_threads = n_threads.max(1) as usize;
    let bytes_per_thread = (data.len() + n_threads - 1) / n_threads.max(1);

    // Segment boundaries, snapped to record starts
    let mut bounds = vec![0usize];
    let mut pos = 0;
    let mut thread_no = 0;
    while pos < data.len() {
        if (thread_no + 1) * bytes_per_thread <= pos {
            bounds.push(pos);
            thread_no += 1;
        }
        let additional = data[pos] as usize;
        check_record(data, pos + 1, additional, kmer_len)?;
        pos += 1 + (additional + kmer_len as usize + 3) / 4;
    }
    bounds.push(data.len());

    let cursor = AtomicUsize::new(0);
    let shared = SharedOut {
        ptr: SharedPtr::new(out.as_mut_ptr()),
        cap: out.len(),
        cursor: &cursor,
    };

    thread::scope(|s| -> Result<()> {
        let handles: Vec<_> = bounds
            .windows(2)
            .map(|w| {
                let (start, end) = (w[0], w[1]);
                let shared = &shared;
                let pool = Arc::clone(pool);
                s.spawn(move || {
                    expand_canonical_segment(data, start, end, kmer_len, max_x, shared, &pool)
                })
            })
            .collect();
        for h in handles {
            h.join().expect("expander thread panicked")?;
        }
        Ok(())
    })?;

    Ok(cursor.load(Ordering::Relaxed))
}

fn expand_canonical_segment<const S: usize>(
    data: &[u8],
    start: usize,
    end: usize,
    kmer_len: u32,
    max_x: u32,
    out: &SharedOut<'_, S>,
    pool: &Arc<MemoryPool>,
) -> Result<()> {
    let mut part = pool.reserve();
    let staging: &mut [KmerWord<S>] = bytemuck::cast_slice_mut(
        &mut part.as_mut_slice()[..EXPAND_BUFFER_RECS * KmerWord::<S>::BYTES],
    );

    let kmer_mask = KmerWord::<S>::n_ones(kmer_len * 2);
    let rev_shift = kmer_len * 2 - 2;
    let tag_bit = (kmer_len + max_x) * 2;
    let mut kmer = KmerWord::<S>::zero();
    let mut rev = KmerWord::<S>::zero();

    let mut bp = 0usize; // staged records
    let mut pos = start;

    // Record structure in [start, end) was validated by the boundary walk
    while pos < end {
        kmer.clear();
        rev.clear();
        let additional = data[pos] as u32;
        pos += 1;
        let mut byte_shift =
            load_first_kmer_both(data, &mut pos, kmer_len, &mut kmer, &mut rev, &kmer_mask);

        let mut kmer_lower = kmer < rev;
        let mut x = 0u32;
        staging[bp] = if kmer_lower { kmer } else { rev };

        let mut symbols_left = additional;
        while symbols_left > 0 {
            let symb = next_symb(data, &mut pos, &mut byte_shift);
            kmer.shl_insert_2bits(symb);
            kmer.mask(&kmer_mask);
            rev.shr_insert_2bits(3 - symb, rev_shift);
            symbols_left -= 1;

            if kmer_lower {
                if kmer < rev {
                    staging[bp].shl_insert_2bits(symb);
                    x += 1;
                    if x == max_x {
                        if symbols_left == 0 {
                            break;
                        }
                        staging[bp].set_2bits(x as u64, tag_bit);
                        bp += 1;
                        if bp >= EXPAND_BUFFER_RECS {
                            out.append(&staging[..bp])?;
                            bp = 0;
                        }
                        x = 0;

                        let symb = next_symb(data, &mut pos, &mut byte_shift);
                        kmer.shl_insert_2bits(symb);
                        kmer.mask(&kmer_mask);
                        rev.shr_insert_2bits(3 - symb, rev_shift);
                        symbols_left -= 1;

                        kmer_lower = kmer < rev;
                        staging[bp] = if kmer_lower { kmer } else { rev };
                    }
                } else {
                    // Orientation flipped: close the current k+x-mer and
                    // restart from the reverse strand
                    staging[bp].set_2bits(x as u64, tag_bit);
                    bp += 1;
                    if bp >= EXPAND_BUFFER_RECS {
                        out.append(&staging[..bp])?;
                        bp = 0;
                    }
                    x = 0;
                    kmer_lower = false;
                    staging[bp] = rev;
                }
            } else if kmer >= rev {
                // Extending the reverse strand prepends the complement
                // above the k-mer window
                staging[bp].set_2bits(3 - symb, kmer_len * 2 + x * 2);
                x += 1;
                if x == max_x {
                    if symbols_left == 0 {
                        break;
                    }
                    staging[bp].set_2bits(x as u64, tag_bit);
                    bp += 1;
                    if bp >= EXPAND_BUFFER_RECS {
                        out.append(&staging[..bp])?;
                        bp = 0;
                    }
                    x = 0;

                    let symb = next_symb(data, &mut pos, &mut byte_shift);
                    kmer.shl_insert_2bits(symb);
                    kmer.mask(&kmer_mask);
                    rev.shr_insert_2bits(3 - symb, rev_shift);
                    symbols_left -= 1;

                    kmer_lower = kmer < rev;
                    staging[bp] = if kmer_lower { kmer } else { rev };
                }
            } else {
                staging[bp].set_2bits(x as u64, tag_bit);
                bp += 1;
                if bp >= EXPAND_BUFFER_RECS {
                    out.append(&staging[..bp])?;
                    bp = 0;
                }
                x = 0;
                staging[bp] = kmer;
                kmer_lower = true;
            }
        }

        staging[bp].set_2bits(x as u64, tag_bit);
        bp += 1;
        if bp >= EXPAND_BUFFER_RECS {
            out.append(&staging[..bp])?;
            bp = 0;
        }
        if byte_shift != 6 {
            pos += 1;
        }
    }

    if bp > 0 {
        out.append(&staging[..bp])?;
    }
    Ok(())
}

// Quality-weighted k-mers

/// P(base correct) per rebased quality value
#[rustfmt::skip]
pub const PROB_QUAL: [f64; 94] = [
    0.2500000000000000, 0.2500000000000000, 0.3690426555198070, 0.4988127663727280,
    0.6018928294465030, 0.6837722339831620, 0.7488113568490420, 0.8004737685031120,
    0.8415106807538890, 0.8741074588205830, 0.9000000000000000, 0.9205671765275720,
    0.9369042655519810, 0.9498812766372730, 0.9601892829446500, 0.9683772233983160,
    0.9748811356849040, 0.9800473768503110, 0.9841510680753890, 0.9874107458820580,
    0.9900000000000000, 0.9920567176527570, 0.9936904265551980, 0.9949881276637270,
    0.9960189282944650, 0.9968377223398320, 0.9974881135684900, 0.9980047376850310,
    0.9984151068075390, 0.9987410745882060, 0.9990000000000000, 0.9992056717652760,
    0.9993690426555200, 0.9994988127663730, 0.9996018928294460, 0.9996837722339830,
    0.9997488113568490, 0.9998004737685030, 0.9998415106807540, 0.9998741074588210,
    0.9999000000000000, 0.9999205671765280, 0.9999369042655520, 0.9999498812766370,
    0.9999601892829450, 0.9999683772233980, 0.9999748811356850, 0.9999800473768500,
    0.9999841510680750, 0.9999874107458820, 0.9999900000000000, 0.9999920567176530,
    0.9999936904265550, 0.9999949881276640, 0.9999960189282940, 0.9999968377223400,
    0.9999974881135680, 0.9999980047376850, 0.9999984151068080, 0.9999987410745880,
    0.9999990000000000, 0.9999992056717650, 0.9999993690426560, 0.9999994988127660,
    0.9999996018928290, 0.9999996837722340, 0.9999997488113570, 0.9999998004737680,
    0.9999998415106810, 0.9999998741074590, 0.9999999000000000, 0.9999999205671770,
    0.9999999369042660, 0.9999999498812770, 0.9999999601892830, 0.9999999683772230,
    0.9999999748811360, 0.9999999800473770, 0.9999999841510680, 0.9999999874107460,
    0.9999999900000000, 0.9999999920567180, 0.9999999936904270, 0.9999999949881280,
    0.9999999960189280, 0.9999999968377220, 0.9999999974881140, 0.9999999980047380,
    0.9999999984151070, 0.9999999987410750, 0.9999999990000000, 0.9999999992056720,
    0.9999999993690430, 0.9999999994988130,
];

/// 1 / PROB_QUAL, used to slide the probability window over a read
#[rustfmt::skip]
pub const INV_PROB_QUAL: [f64; 94] = [
    4.0000000000000000, 4.0000000000000000, 2.7097138638119600, 2.0047602375372500,
    1.6614253419825500, 1.4624752955742600, 1.3354498310601800, 1.2492601748462100,
    1.1883390465158700, 1.1440241012807300, 1.1111111111111100, 1.0862868300084900,
    1.0673449110735400, 1.0527631448218000, 1.0414613220148200, 1.0326554320337200,
    1.0257660789563300, 1.0203588353185700, 1.0161041657513100, 1.0127497641386300,
    1.0101010101010100, 1.0080068832818700, 1.0063496369454600, 1.0050371177272600,
    1.0039969839853900, 1.0031723093832600, 1.0025182118938000, 1.0019992513458400,
    1.0015874090662800, 1.0012605123027600, 1.0010010010010000, 1.0007949596936500,
    1.0006313557030000, 1.0005014385482300, 1.0003982657229900, 1.0003163277976500,
    1.0002512517547400, 1.0001995660501600, 1.0001585144420900, 1.0001259083921100,
    1.0001000100010000, 1.0000794391335500, 1.0000630997157700, 1.0000501212353700,
    1.0000398123020100, 1.0000316237766300, 1.0000251194952900, 1.0000199530212600,
    1.0000158491831200, 1.0000125894126100, 1.0000100001000000, 1.0000079433454400,
    1.0000063096132600, 1.0000050118974600, 1.0000039810875500, 1.0000031622876600,
    1.0000025118927400, 1.0000019952663000, 1.0000015848957000, 1.0000012589270000,
    1.0000010000010000, 1.0000007943288700, 1.0000006309577400, 1.0000005011874800,
    1.0000003981073300, 1.0000003162278700, 1.0000002511887100, 1.0000001995262700,
    1.0000001584893400, 1.0000001258925600, 1.0000001000000100, 1.0000000794328300,
    1.0000000630957400, 1.0000000501187300, 1.0000000398107200, 1.0000000316227800,
    1.0000000251188600, 1.0000000199526200, 1.0000000158489300, 1.0000000125892500,
    1.0000000100000000, 1.0000000079432800, 1.0000000063095700, 1.0000000050118700,
    1.0000000039810700, 1.0000000031622800, 1.0000000025118900, 1.0000000019952600,
    1.0000000015848900, 1.0000000012589300, 1.0000000010000000, 1.0000000007943300,
    1.0000000006309600, 1.0000000005011900,
];

/// Expand a quality bin into k-mers weighted by the probability that all
/// their bases were read correctly. Records carry one byte per base:
/// the symbol in the top two bits, the rebased quality below.
pub fn expand_quality_kmers<const S: usize>(
    data: &[u8],
    out: &mut [QualityKmer<S>],
    kmer_len: u32,
    both_strands: bool,
) -> Result<usize> {
    let kmer_mask = KmerWord::<S>::n_ones(kmer_len * 2);
    let rev_shift = (kmer_len - 1) * 2;
    let mut kmer = KmerWord::<S>::zero();
    let mut rev = KmerWord::<S>::zero();
    let mut inv_probs: Vec<f64> = Vec::new();
    let mut pos = 0;
    let mut n = 0;

    while pos < data.len() {
        let additional = data[pos] as usize;
        pos += 1;
        if pos + kmer_len as usize + additional > data.len() {
            bail!("quality super-k-mer record overruns the bin buffer");
        }
        if n + 1 + additional > out.len() {
            bail!("expanded records exceed the bin's metadata record count");
        }

        inv_probs.clear();
        let mut prob = 1.0f64;
        for _ in 0..kmer_len {
            let symb = ((data[pos] >> 6) & 3) as u64;
            let qual = (data[pos] & 63) as usize;
            pos += 1;
            inv_probs.push(INV_PROB_QUAL[qual]);
            kmer.shl_insert_2bits(symb);
            rev.shr_insert_2bits(3 - symb, rev_shift);
            prob *= PROB_QUAL[qual];
        }
        kmer.mask(&kmer_mask);
        if prob >= MIN_PROB_QUAL {
            let word = if both_strands && rev < kmer { rev } else { kmer };
            out[n] = QualityKmer::new(word, prob as f32);
            n += 1;
        }
        for i in 0..additional {
            let symb = ((data[pos] >> 6) & 3) as u64;
            let qual = (data[pos] & 63) as usize;
            pos += 1;
            kmer.shl_insert_2bits(symb);
            kmer.mask(&kmer_mask);
            rev.shr_insert_2bits(3 - symb, rev_shift);
            prob *= PROB_QUAL[qual] * inv_probs[i];
            inv_probs.push(INV_PROB_QUAL[qual]);
            if prob >= MIN_PROB_QUAL {
                let word = if both_strands && rev < kmer { rev } else { kmer };
                out[n] = QualityKmer::new(word, prob as f32);
                n += 1;
            }
        }
    }
    Ok(n)
}
