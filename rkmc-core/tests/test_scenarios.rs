// End-to-end checks of the bin processing stage on small hand-checked
// inputs, covering plain, canonical, k+x-mer and quality-weighted runs.

mod common;

use common::{decode_output, decode_quality_output, dna, run_pipeline, run_quality_pipeline};
use rkmc_core::expander::PROB_QUAL;
use rkmc_core::CountingParams;

fn base_params(k: u32, lut: u32) -> CountingParams {
    CountingParams {
        kmer_len: k,
        lut_prefix_len: lut,
        max_x: 0,
        both_strands: false,
        use_quality: false,
        cutoff_min: 1,
        cutoff_max: 1_000_000_000,
        counter_max: 255,
        n_bins: 8,
        n_readers: 1,
        n_splitters: 1,
        n_sorters: 1,
        sorter_threads: Vec::new(),
        max_memory: 64 << 20,
        arena_size: 4 << 20,
    }
}

fn val(s: &str) -> u64 {
    dna(s).iter().fold(0u64, |v, &b| (v << 2) | b as u64)
}

#[test]
fn test_single_strand_with_min_cutoff() {
    let mut params = base_params(4, 4);
    params.cutoff_min = 2;

    let bins = vec![(0u32, vec![dna("ACGTACGT")])];
    let out = run_pipeline(&params, &bins);
    assert_eq!(out.len(), 1);

    // ACGT:2 survives; CGTA, GTAC, TACG fall below the cutoff
    assert_eq!(decode_output(&out[0], &params), vec![(val("ACGT"), 2)]);
    assert_eq!(out[0].stats.n_unique, 1);
    assert_eq!(out[0].stats.n_cutoff_min, 3);
    assert_eq!(out[0].stats.n_cutoff_max, 0);
    assert_eq!(out[0].stats.n_total, 5);
}

#[test]
fn test_canonical_counting() {
    let mut params = base_params(4, 4);
    params.both_strands = true;

    let bins = vec![(0u32, vec![dna("ACGTACGT")])];
    let out = run_pipeline(&params, &bins);

    // CGTA and TACG are reverse complements of each other; ACGT and GTAC
    // are their own reverse complements
    let decoded = decode_output(&out[0], &params);
    assert_eq!(
        decoded,
        vec![(val("ACGT"), 2), (val("CGTA"), 2), (val("GTAC"), 1)]
    );
    assert_eq!(out[0].stats.n_unique, 3);
    assert_eq!(out[0].stats.n_total, 5);
}

#[test]
fn test_kxmer_grouping_accumulates_one_kmer() {
    let mut params = base_params(5, 1);
    params.max_x = 2;

    let bins = vec![(0u32, vec![dna("AAAAAAA")])];
    let out = run_pipeline(&params, &bins);

    assert_eq!(decode_output(&out[0], &params), vec![(0, 3)]);
    assert_eq!(out[0].stats.n_unique, 1);
    assert_eq!(out[0].stats.n_total, 3);
}

#[test]
fn test_quality_weighted_counting() {
    let mut params = base_params(6, 2);
    params.both_strands = true;
    params.use_quality = true;

    let read = dna("ACGTAC");
    let quals = vec![40u8; 6];
    let bins = vec![(0u32, vec![(read, quals)])];
    let out = run_quality_pipeline(&params, &bins);

    let expected = 2.0 * PROB_QUAL[40].powi(6);
    let decoded = decode_quality_output(&out[0], &params);
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].0, val("ACGTAC"));
    assert!((decoded[0].1 as f64 - expected).abs() < 1e-3);
    assert_eq!(out[0].stats.n_unique, 1);
    assert_eq!(out[0].stats.n_total, 2);
}

#[test]
fn test_empty_bin() {
    let params = base_params(25, 5);
    let bins = vec![(3u32, vec![])];
    let out = run_pipeline(&params, &bins);

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].bin_id, 3);
    assert_eq!(out[0].stats.n_unique, 0);
    assert_eq!(out[0].stats.n_cutoff_min, 0);
    assert_eq!(out[0].stats.n_cutoff_max, 0);
    assert_eq!(out[0].stats.n_total, 0);
    assert!(out[0].suffix().is_empty());
    assert!(out[0].lut().iter().all(|&c| c == 0));
}

#[test]
fn test_counter_clamp() {
    let mut params = base_params(3, 3);
    params.counter_max = 5;

    let bins = vec![(0u32, vec![dna("AAAAAAAAAA")])];
    let out = run_pipeline(&params, &bins);

    // AAA occurs 8 times; the emitted counter clamps to 5
    assert_eq!(decode_output(&out[0], &params), vec![(0, 5)]);
    assert_eq!(out[0].stats.n_unique, 1);
    assert_eq!(out[0].stats.n_total, 8);
}

#[test]
fn test_cutoff_max_is_strict() {
    let mut params = base_params(4, 4);
    params.cutoff_max = 2;

    // ACGT occurs exactly twice: equal to the cutoff, still emitted
    let out = run_pipeline(&params, &[(0u32, vec![dna("ACGTACGT")])]);
    let decoded = decode_output(&out[0], &params);
    assert!(decoded.contains(&(val("ACGT"), 2)));
    assert_eq!(out[0].stats.n_cutoff_max, 0);

    // Three occurrences exceed it and are discarded
    let out = run_pipeline(&params, &[(0u32, vec![dna("ACGTACGTACGT")])]);
    let decoded = decode_output(&out[0], &params);
    assert!(!decoded.iter().any(|&(v, _)| v == val("ACGT")));
    assert_eq!(out[0].stats.n_cutoff_max, 1);
}
