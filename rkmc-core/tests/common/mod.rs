// Shared helpers for the bin-processing tests: a reference super-k-mer
// encoder standing in for the splitter, a decoder for compacted output,
// and brute-force k-mer counting to compare against.

#![allow(dead_code)]

use rkmc_core::{
    enqueue_closed_bins, run_sorters, BinFile, CompactedBin, CountingParams, PipelineQueues,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// ASCII DNA to 2-bit symbols
pub fn dna(s: &str) -> Vec<u8> {
    s.bytes()
        .map(|c| match c {
            b'A' | b'a' => 0,
            b'C' | b'c' => 1,
            b'G' | b'g' => 2,
            b'T' | b't' => 3,
            _ => panic!("non-ACGT base in test input"),
        })
        .collect()
}

/// Encode one read as a single super-k-mer record: the count of additional
/// symbols, then all symbols packed four per byte, MSB first. The extension
/// continues in the unused low bits of the last k-mer byte, exactly as the
/// splitter writes it.
pub fn encode_super_kmer(kmer_len: u32, symbols: &[u8]) -> Vec<u8> {
    assert!(symbols.len() >= kmer_len as usize);
    let additional = symbols.len() - kmer_len as usize;
    assert!(additional <= 255);

    let mut rec = vec![additional as u8];
    let mut byte = 0u8;
    let mut used = 0;
    for &s in symbols {
        byte = (byte << 2) | s;
        used += 1;
        if used == 4 {
            rec.push(byte);
            byte = 0;
            used = 0;
        }
    }
    if used > 0 {
        rec.push(byte << (2 * (4 - used)));
    }
    rec
}

/// Encode one read for quality-weighted counting: one byte per base,
/// symbol in the top two bits, quality below (capped at 63)
pub fn encode_quality_super_kmer(kmer_len: u32, symbols: &[u8], quals: &[u8]) -> Vec<u8> {
    assert_eq!(symbols.len(), quals.len());
    assert!(symbols.len() >= kmer_len as usize);
    let additional = symbols.len() - kmer_len as usize;
    assert!(additional <= 255);

    let mut rec = vec![additional as u8];
    for (&s, &q) in symbols.iter().zip(quals) {
        rec.push((s << 6) | q.min(63));
    }
    rec
}

/// Reverse complement of a 2-bit packed k-mer value
pub fn rc_value(kmer: u64, k: u32) -> u64 {
    let mut out = 0u64;
    for i in 0..k {
        let sym = (kmer >> (2 * i)) & 3;
        out = (out << 2) | (3 - sym);
    }
    out
}

pub fn canonical_value(kmer: u64, k: u32) -> u64 {
    kmer.min(rc_value(kmer, k))
}

/// Brute-force k-mer counts over whole reads
pub fn count_reads(reads: &[Vec<u8>], k: u32, canonical: bool) -> BTreeMap<u64, u64> {
    let mut counts = BTreeMap::new();
    for read in reads {
        for w in read.windows(k as usize) {
            let mut v = 0u64;
            for &s in w {
                v = (v << 2) | s as u64;
            }
            if canonical {
                v = canonical_value(v, k);
            }
            *counts.entry(v).or_insert(0) += 1;
        }
    }
    counts
}

/// Apply cutoffs and clamping the way the compactor reports them
pub fn expected_output(
    counts: &BTreeMap<u64, u64>,
    params: &CountingParams,
) -> (BTreeMap<u64, u64>, rkmc_core::OutputStats) {
    let mut emitted = BTreeMap::new();
    let mut stats = rkmc_core::OutputStats::default();
    for (&kmer, &count) in counts {
        stats.n_total += count;
        if count < params.cutoff_min as u64 {
            stats.n_cutoff_min += 1;
        } else if count > params.cutoff_max {
            stats.n_cutoff_max += 1;
        } else {
            stats.n_unique += 1;
            emitted.insert(kmer, count.min(params.counter_max));
        }
    }
    (emitted, stats)
}

/// Stand in for the splitter: write every read of a bin as one super-k-mer
/// record into a memory-backed bin file and describe the bin
fn describe_bin(queues: &PipelineQueues, params: &CountingParams, bin_id: u32, records: &[Vec<u8>], n_rec: u64) {
    let file = Arc::new(BinFile::in_memory());
    let mut size = 0u64;
    for rec in records {
        file.write(rec).unwrap();
        size += rec.len() as u64;
    }
    queues.bin_desc.insert(
        bin_id,
        Some(file),
        &format!("bin {}", bin_id),
        size,
        n_rec,
        n_rec, // worst-case k+x-mer estimate: one word per k-mer
        records.len() as u64,
        1 << 15,
        params.kmer_len,
    );
}

/// Run the whole bin-processing stage over in-memory bins and collect the
/// compacted outputs, sorted by bin id
pub fn run_pipeline(params: &CountingParams, bins: &[(u32, Vec<Vec<u8>>)]) -> Vec<CompactedBin> {
    let queues = PipelineQueues::new(params, vec![]);
    for (bin_id, reads) in bins {
        let records: Vec<Vec<u8>> = reads
            .iter()
            .map(|r| encode_super_kmer(params.kmer_len, r))
            .collect();
        let n_rec: u64 = reads
            .iter()
            .map(|r| (r.len() - params.kmer_len as usize + 1) as u64)
            .sum();
        describe_bin(&queues, params, *bin_id, &records, n_rec);
    }
    enqueue_closed_bins(&queues.bin_desc, &queues.bin_queue);
    run_sorters(params, &queues).unwrap();

    let mut out = Vec::new();
    while let Some(bin) = queues.kmer_queue.pop() {
        out.push(bin);
    }
    out.sort_by_key(|b| b.bin_id);
    out
}

/// As `run_pipeline`, but with quality-annotated reads
pub fn run_quality_pipeline(
    params: &CountingParams,
    bins: &[(u32, Vec<(Vec<u8>, Vec<u8>)>)],
) -> Vec<CompactedBin> {
    let queues = PipelineQueues::new(params, vec![]);
    for (bin_id, reads) in bins {
        let records: Vec<Vec<u8>> = reads
            .iter()
            .map(|(r, q)| encode_quality_super_kmer(params.kmer_len, r, q))
            .collect();
        let n_rec: u64 = reads
            .iter()
            .map(|(r, _)| (r.len() - params.kmer_len as usize + 1) as u64)
            .sum();
        describe_bin(&queues, params, *bin_id, &records, n_rec);
    }
    enqueue_closed_bins(&queues.bin_desc, &queues.bin_queue);
    run_sorters(params, &queues).unwrap();

    let mut out = Vec::new();
    while let Some(bin) = queues.kmer_queue.pop() {
        out.push(bin);
    }
    out.sort_by_key(|b| b.bin_id);
    out
}

/// Decode a compacted bin back into (k-mer value, integer count) pairs.
/// Entries are emitted in sorted order, so walking the LUT in prefix order
/// recovers the prefixes the suffix stream dropped.
pub fn decode_output(bin: &CompactedBin, params: &CountingParams) -> Vec<(u64, u64)> {
    let k = params.kmer_len;
    let suffix_symbols = k - params.lut_prefix_len;
    let suffix_bytes = (suffix_symbols / 4) as usize;
    let counter_bytes = rkmc_common::byte_log(params.cutoff_max)
        .min(rkmc_common::byte_log(params.counter_max)) as usize;

    let mut out = Vec::new();
    let stream = bin.suffix();
    let mut pos = 0;
    for (prefix, &n) in bin.lut().iter().enumerate() {
        for _ in 0..n {
            let mut suffix = 0u64;
            for _ in 0..suffix_bytes {
                suffix = (suffix << 8) | stream[pos] as u64;
                pos += 1;
            }
            let mut count = 0u64;
            for j in 0..counter_bytes {
                count |= (stream[pos] as u64) << (8 * j);
                pos += 1;
            }
            out.push(((prefix as u64) << (2 * suffix_symbols) | suffix, count));
        }
    }
    assert_eq!(pos, stream.len(), "suffix stream fully consumed");
    out
}

/// Decode a quality-weighted bin: counts are 4-byte floats
pub fn decode_quality_output(bin: &CompactedBin, params: &CountingParams) -> Vec<(u64, f32)> {
    let k = params.kmer_len;
    let suffix_symbols = k - params.lut_prefix_len;
    let suffix_bytes = (suffix_symbols / 4) as usize;

    let mut out = Vec::new();
    let stream = bin.suffix();
    let mut pos = 0;
    for (prefix, &n) in bin.lut().iter().enumerate() {
        for _ in 0..n {
            let mut suffix = 0u64;
            for _ in 0..suffix_bytes {
                suffix = (suffix << 8) | stream[pos] as u64;
                pos += 1;
            }
            let count = f32::from_le_bytes(stream[pos..pos + 4].try_into().unwrap());
            pos += 4;
            out.push(((prefix as u64) << (2 * suffix_symbols) | suffix, count));
        }
    }
    assert_eq!(pos, stream.len(), "suffix stream fully consumed");
    out
}
