//! Shared constants and the 2-bit nucleotide alphabet used across the rkmc
//! k-mer counting pipeline.

pub mod types;

pub use types::{
    byte_log, complement, rkmc_version, Base, ALIGNMENT, EXPAND_BUFFER_RECS, MAX_BINS, MAX_K,
    MAX_LUT_PREFIX, MAX_X, MIN_K,
};
