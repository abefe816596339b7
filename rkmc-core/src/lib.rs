//! Bin processing stage of the rkmc disk-based k-mer counter.
//!
//! An upstream splitter partitions reads into signature-addressed bins of
//! packed super-k-mers on disk. This crate turns each bin into a sorted,
//! compacted k-mer -> count table: a pool of workers expands the packed
//! records into k-mer (or k+x-mer) words inside a shared memory arena,
//! radix sorts them, merges equal k-mers while applying count cutoffs, and
//! publishes the suffix stream plus prefix LUT for the database writer.
//!
//! # Example
//!
//! ```no_run
//! use rkmc_core::{enqueue_closed_bins, run_sorters, CountingParams, PipelineQueues};
//!
//! # fn main() -> anyhow::Result<()> {
//! let params = CountingParams::default();
//! let queues = PipelineQueues::new(&params, vec![]);
//!
//! // ... the splitter fills queues.bin_desc and the bin files ...
//!
//! enqueue_closed_bins(&queues.bin_desc, &queues.bin_queue);
//! run_sorters(&params, &queues)?;
//!
//! while let Some(bin) = queues.kmer_queue.pop() {
//!     println!("bin {}: {} unique k-mers", bin.bin_id, bin.stats.n_unique);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bin_file;
pub mod expander;
pub mod kmer;
pub mod kxmer_set;
pub mod memory;
pub mod params;
pub mod pipeline;
pub mod queues;
pub mod radix;
pub mod sorter;

pub use bin_file::BinFile;
pub use kmer::{words_for_kmer, KmerWord, QualityKmer};
pub use memory::{BinArena, BinRole, BinSizes, MemoryMonitor, MemoryPool};
pub use params::{CountingParams, PipelineQueues};
pub use pipeline::{enqueue_closed_bins, run_sorters};
pub use queues::{
    BinDesc, BinDescEntry, BinItem, BinPart, BinPartQueue, BinQueue, CompactedBin,
    InputFilesQueue, KmerQueue, OutputStats, PartQueue, WorkQueue,
};
pub use sorter::{run_bin_sorter, BinSorter, KmerKind};
