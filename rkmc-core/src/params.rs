// Counting parameters and the shared structures wiring the stages together

use crate::kmer::words_for_kmer;
use crate::memory::{BinArena, MemoryMonitor, MemoryPool};
use crate::queues::{BinDesc, BinPartQueue, BinQueue, InputFilesQueue, KmerQueue, PartQueue};
use crate::radix::RADIX_BUFFER_WIDTH;
use anyhow::{bail, Result};
use rkmc_common::{EXPAND_BUFFER_RECS, MAX_BINS, MAX_K, MAX_LUT_PREFIX, MAX_X, MIN_K};
use std::path::PathBuf;
use std::sync::Arc;

/// All tuning knobs of the counting stage. Everything is injected here;
/// nothing is read from the environment.
#[derive(Debug, Clone)]
pub struct CountingParams {
    /// K-mer length
    pub kmer_len: u32,
    /// Count k+x-mers with extensions up to this length (0 disables them)
    pub max_x: u32,
    /// Count canonical k-mers (minimum of k-mer and reverse complement)
    pub both_strands: bool,
    /// Quality-weighted counting: counts are probability sums
    pub use_quality: bool,
    /// Discard k-mers occurring fewer times than this
    pub cutoff_min: u32,
    /// Discard k-mers occurring more times than this
    pub cutoff_max: u64,
    /// Clamp emitted counters to this value
    pub counter_max: u64,
    /// Symbols of each k-mer replaced by the prefix LUT
    pub lut_prefix_len: u32,
    /// Number of disk bins
    pub n_bins: u32,
    /// Reader threads (upstream, informs queue completion accounting)
    pub n_readers: u32,
    /// Splitter threads (upstream, informs queue completion accounting)
    pub n_splitters: u32,
    /// Bin sorter threads
    pub n_sorters: u32,
    /// Inner threads per sorter, for radix sort and parallel expansion;
    /// empty means one per sorter
    pub sorter_threads: Vec<u32>,
    /// Global RAM budget in bytes
    pub max_memory: u64,
    /// Size of the sorting arena in bytes
    pub arena_size: usize,
}

impl Default for CountingParams {
    fn default() -> Self {
        CountingParams {
            kmer_len: 25,
            max_x: 3,
            both_strands: true,
            use_quality: false,
            cutoff_min: 2,
            cutoff_max: 1_000_000_000,
            counter_max: 255,
            lut_prefix_len: 5,
            n_bins: 448,
            n_readers: 1,
            n_splitters: 1,
            n_sorters: num_cpus::get() as u32,
            sorter_threads: Vec::new(),
            max_memory: 4 << 30,
            arena_size: 256 << 20,
        }
    }
}

impl CountingParams {
    /// Extension length actually used: quality-weighted counting never
    /// groups into k+x-mers
    pub fn effective_max_x(&self) -> u32 {
        if self.use_quality {
            0
        } else {
            self.max_x
        }
    }

    /// Inner thread count of one sorter
    pub fn inner_threads(&self, thread_no: usize) -> u32 {
        self.sorter_threads.get(thread_no).copied().unwrap_or(1)
    }

    /// Refuse invalid configurations before any worker starts
    pub fn validate(&self) -> Result<()> {
        if self.kmer_len < MIN_K || self.kmer_len > MAX_K {
            bail!(
                "k-mer length {} outside the supported range [{}, {}]",
                self.kmer_len,
                MIN_K,
                MAX_K
            );
        }
        if self.max_x > MAX_X {
            bail!("max_x {} exceeds the supported maximum {}", self.max_x, MAX_X);
        }
        if self.cutoff_min < 1 {
            bail!("cutoff_min must be at least 1");
        }
        if self.cutoff_max < self.cutoff_min as u64 {
            bail!(
                "cutoff_max {} is below cutoff_min {}",
                self.cutoff_max,
                self.cutoff_min
            );
        }
        if self.counter_max < 1 {
            bail!("counter_max must be at least 1");
        }
        if self.lut_prefix_len < 1 || self.lut_prefix_len > self.kmer_len.min(MAX_LUT_PREFIX) {
            bail!(
                "lut_prefix_len {} outside [1, {}]",
                self.lut_prefix_len,
                self.kmer_len.min(MAX_LUT_PREFIX)
            );
        }
        if (self.kmer_len - self.lut_prefix_len) % 4 != 0 {
            bail!("k minus lut_prefix_len must be a multiple of 4 so suffixes pack into bytes");
        }
        if self.n_bins == 0 || self.n_bins > MAX_BINS {
            bail!("number of bins {} outside [1, {}]", self.n_bins, MAX_BINS);
        }
        if self.n_sorters < 1 {
            bail!("at least one sorter thread is required");
        }
        if !self.sorter_threads.is_empty() {
            if self.sorter_threads.len() != self.n_sorters as usize {
                bail!(
                    "sorter_threads has {} entries for {} sorters",
                    self.sorter_threads.len(),
                    self.n_sorters
                );
            }
            if self.sorter_threads.iter().any(|&t| t == 0) {
                bail!("inner thread counts must be at least 1");
            }
        }
        if self.arena_size == 0 {
            bail!("arena size must be non-zero");
        }
        Ok(())
    }
}

/// Queues, monitors and pools shared by every stage of the pipeline
pub struct PipelineQueues {
    pub input_files: Arc<InputFilesQueue>,
    pub part_queue: Arc<PartQueue>,
    pub bin_part_queue: Arc<BinPartQueue>,
    pub bin_queue: Arc<BinQueue>,
    pub kmer_queue: Arc<KmerQueue>,
    pub bin_desc: Arc<BinDesc>,
    pub memory: Arc<MemoryMonitor>,
    pub arena: Arc<BinArena>,
    pub radix_pool: Arc<MemoryPool>,
    pub expand_pool: Arc<MemoryPool>,
}

impl PipelineQueues {
    pub fn new(params: &CountingParams, input_files: Vec<PathBuf>) -> Self {
        let s = words_for_kmer(params.kmer_len, params.effective_max_x());
        let rec_size = if params.use_quality { 8 * s + 8 } else { 8 * s };

        // One scatter buffer per inner thread, one staging buffer per
        // expander thread, plus slack so threads never contend for parts
        let total_inner: usize = (0..params.n_sorters as usize)
            .map(|i| params.inner_threads(i) as usize)
            .sum();
        let radix_part = 256 * RADIX_BUFFER_WIDTH * rec_size;
        let expand_part = EXPAND_BUFFER_RECS * 8 * s;
        let n_parts = total_inner + params.n_sorters as usize;

        PipelineQueues {
            input_files: Arc::new(InputFilesQueue::new(input_files)),
            part_queue: Arc::new(PartQueue::new(params.n_readers)),
            bin_part_queue: Arc::new(BinPartQueue::new(params.n_splitters)),
            bin_queue: Arc::new(BinQueue::new(1)),
            kmer_queue: Arc::new(KmerQueue::new(params.n_sorters)),
            bin_desc: Arc::new(BinDesc::new()),
            memory: Arc::new(MemoryMonitor::new(params.max_memory)),
            arena: Arc::new(BinArena::new(params.arena_size, params.n_bins)),
            radix_pool: MemoryPool::new(radix_part * n_parts, radix_part),
            expand_pool: MemoryPool::new(expand_part * n_parts, expand_part),
        }
    }
}
