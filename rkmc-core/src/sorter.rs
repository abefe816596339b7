// Bin sorting workers: pop a bin, read its packed stream into the arena,
// expand, radix sort, compact equal k-mers, publish the result.

use crate::expander;
use crate::kmer::{words_for_kmer, KmerWord, QualityKmer};
use crate::kxmer_set::KxmerSet;
use crate::memory::{BinArena, BinRole, BinSizes, MemoryPool};
use crate::params::{CountingParams, PipelineQueues};
use crate::queues::{BinDesc, BinItem, BinQueue, CompactedBin, KmerQueue, OutputStats};
use crate::radix::{radix_sort_records, radix_sort_u64};
use anyhow::{bail, Context, Result};
use rkmc_common::byte_log;
use std::sync::Arc;

/// Which record flavor a run counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KmerKind {
    Plain,
    Quality,
}

/// Suffix and counter emission into the bin's output roles
struct CompactWriter<'a> {
    out: &'a mut [u8],
    pos: usize,
    lut: &'a mut [u64],
    suffix_bytes: usize,
    counter_bytes: usize,
    suffix_bits: u32,
}

impl CompactWriter<'_> {
    fn emit<const S: usize>(&mut self, kmer: &KmerWord<S>, count: u64) {
        self.lut[kmer.remove_suffix(self.suffix_bits) as usize] += 1;
        for j in (0..self.suffix_bytes).rev() {
            self.out[self.pos] = kmer.get_byte(j);
            self.pos += 1;
        }
        for j in 0..self.counter_bytes {
            self.out[self.pos] = (count >> (8 * j)) as u8;
            self.pos += 1;
        }
    }

    fn emit_quality<const S: usize>(&mut self, kmer: &KmerWord<S>, count: f32) {
        self.lut[kmer.remove_suffix(self.suffix_bits) as usize] += 1;
        for j in (0..self.suffix_bytes).rev() {
            self.out[self.pos] = kmer.get_byte(j);
            self.pos += 1;
        }
        self.out[self.pos..self.pos + 4].copy_from_slice(&count.to_le_bytes());
        self.pos += 4;
    }
}

/// Run-length collapse of bitwise-equal neighbours in the sorted k+x-mer
/// array; per-entry multiplicities land in `counters`. Returns the
/// compacted length. The buffer must be non-empty.
fn pre_compact_kxmers<const S: usize>(buffer: &mut [KmerWord<S>], counters: &mut [u32]) -> usize {
    let mut compacted = 0usize;
    let mut act = buffer[0];
    counters[0] = 1;
    for i in 1..buffer.len() {
        if buffer[i] == act {
            counters[compacted] += 1;
        } else {
            buffer[compacted] = act;
            compacted += 1;
            counters[compacted] = 1;
            act = buffer[i];
        }
    }
    buffer[compacted] = act;
    compacted + 1
}

pub struct BinSorter<const S: usize> {
    kmer_len: u32,
    max_x: u32,
    both_strands: bool,
    kind: KmerKind,
    cutoff_min: u64,
    cutoff_max: u64,
    counter_max: u64,
    lut_prefix_len: u32,
    n_threads: u32,

    bin_queue: Arc<BinQueue>,
    kmer_queue: Arc<KmerQueue>,
    bin_desc: Arc<BinDesc>,
    arena: Arc<BinArena>,
    radix_pool: Arc<MemoryPool>,
    expand_pool: Arc<MemoryPool>,

    sum_n_recs: u64,
    sum_n_plus_x_recs: u64,
}

impl<const S: usize> BinSorter<S> {
    pub fn new(params: &CountingParams, queues: &PipelineQueues, thread_no: usize) -> Self {
        let kind = if params.use_quality {
            KmerKind::Quality
        } else {
            KmerKind::Plain
        };
        BinSorter {
            kmer_len: params.kmer_len,
            max_x: params.effective_max_x(),
            both_strands: params.both_strands,
            kind,
            cutoff_min: params.cutoff_min as u64,
            cutoff_max: params.cutoff_max,
            counter_max: params.counter_max,
            lut_prefix_len: params.lut_prefix_len,
            n_threads: params.inner_threads(thread_no),
            bin_queue: Arc::clone(&queues.bin_queue),
            kmer_queue: Arc::clone(&queues.kmer_queue),
            bin_desc: Arc::clone(&queues.bin_desc),
            arena: Arc::clone(&queues.arena),
            radix_pool: Arc::clone(&queues.radix_pool),
            expand_pool: Arc::clone(&queues.expand_pool),
            sum_n_recs: 0,
            sum_n_plus_x_recs: 0,
        }
    }

    /// Total records and k+x-mer records this worker has sorted
    pub fn totals(&self) -> (u64, u64) {
        (self.sum_n_recs, self.sum_n_plus_x_recs)
    }

    /// Process bins until the queue drains, then mark the output queue
    pub fn process_bins(&mut self) -> Result<()> {
        let result = self.drain();
        self.kmer_queue.mark_completed();
        result
    }

    fn drain(&mut self) -> Result<()> {
        while let Some(item) = self.bin_queue.pop() {
            self.process_bin(item)
                .with_context(|| format!("processing of bin {} failed", item.bin_id))?;
        }
        Ok(())
    }

    fn rec_size(&self) -> usize {
        match self.kind {
            KmerKind::Plain => KmerWord::<S>::BYTES,
            KmerKind::Quality => QualityKmer::<S>::BYTES,
        }
    }

    /// Radix passes, i.e. key bytes of one record
    fn sorting_phases(&self) -> u32 {
        if self.kind == KmerKind::Plain && self.max_x > 0 {
            (self.kmer_len + self.max_x + 1).div_ceil(4)
        } else {
            self.kmer_len.div_ceil(4)
        }
    }

    fn counter_bytes(&self) -> usize {
        match self.kind {
            KmerKind::Plain => byte_log(self.cutoff_max).min(byte_log(self.counter_max)) as usize,
            KmerKind::Quality => 4,
        }
    }

    fn classify(&self, stats: &mut OutputStats, writer: &mut CompactWriter, kmer: &KmerWord<S>, count: u64) {
        stats.n_total += count;
        if count < self.cutoff_min {
            stats.n_cutoff_min += 1;
        } else if count > self.cutoff_max {
            stats.n_cutoff_max += 1;
        } else {
            stats.n_unique += 1;
            writer.emit(kmer, count.min(self.counter_max));
        }
    }

    fn classify_quality(
        &self,
        stats: &mut OutputStats,
        writer: &mut CompactWriter,
        kmer: &KmerWord<S>,
        count: f64,
    ) {
        if count < self.cutoff_min as f64 {
            stats.n_cutoff_min += 1;
        } else if count > self.cutoff_max as f64 {
            stats.n_cutoff_max += 1;
        } else {
            stats.n_unique += 1;
            writer.emit_quality(kmer, count.min(self.counter_max as f64) as f32);
        }
    }

    fn process_bin(&mut self, item: BinItem) -> Result<()> {
        let bin_id = item.bin_id;
        let entry = self
            .bin_desc
            .read(bin_id)
            .with_context(|| format!("bin {} is not described", bin_id))?;
        let size = item.size as usize;
        let n_rec = item.n_rec as usize;

        let rec_size = self.rec_size();
        let capacity = if self.kind == KmerKind::Plain && self.max_x > 0 {
            n_rec.max(entry.n_plus_x_recs as usize)
        } else {
            n_rec
        };
        let suffix_bytes = ((self.kmer_len - self.lut_prefix_len) / 4) as usize;
        let counter_bytes = self.counter_bytes();
        let lut_recs = 1usize << (2 * self.lut_prefix_len);
        let phases = self.sorting_phases();
        let with_counters = self.kind == KmerKind::Plain && self.max_x > 0;

        self.arena.init(
            bin_id,
            phases,
            BinSizes {
                file_size: size,
                kxmers_size: capacity * rec_size,
                out_buffer_size: n_rec * (suffix_bytes + counter_bytes),
                kxmer_counter_size: if with_counters { capacity * 4 } else { 0 },
                lut_size: lut_recs * 8,
            },
        );

        // Read the packed super-k-mer stream into its slot
        let mut input_file = self.arena.reserve(bin_id, BinRole::InputFile);
        if size > 0 {
            let file = entry
                .file
                .as_ref()
                .with_context(|| format!("bin {} has no backing file", bin_id))?;
            file.rewind()?;
            let read = file.read_into(&mut input_file.as_mut_slice()[..size])?;
            if read != size {
                bail!(
                    "temporary bin file is truncated: expected {} bytes, got {}",
                    size,
                    read
                );
            }
        }

        // Expand into k-mer / k+x-mer records
        let mut input_arr = self.arena.reserve(bin_id, BinRole::InputArray);
        let data = &input_file.as_slice()[..size];
        let n_expanded = match self.kind {
            KmerKind::Plain => {
                let out: &mut [KmerWord<S>] =
                    bytemuck::cast_slice_mut(&mut input_arr.as_mut_slice()[..capacity * rec_size]);
                match (self.max_x > 0, self.both_strands) {
                    (false, false) => expander::expand_kmers_plain(data, out, self.kmer_len)?,
                    (false, true) => expander::expand_kmers_canonical(data, out, self.kmer_len)?,
                    (true, false) => {
                        expander::expand_kxmers_plain(data, out, self.kmer_len, self.max_x)?
                    }
                    (true, true) => expander::expand_kxmers_canonical(
                        data,
                        out,
                        self.kmer_len,
                        self.max_x,
                        self.n_threads,
                        &self.expand_pool,
                    )?,
                }
            }
            KmerKind::Quality => {
                let out: &mut [QualityKmer<S>] =
                    bytemuck::cast_slice_mut(&mut input_arr.as_mut_slice()[..capacity * rec_size]);
                expander::expand_quality_kmers(data, out, self.kmer_len, self.both_strands)?
            }
        };
        drop(input_file);
        self.arena.free(bin_id, BinRole::InputFile);

        self.sum_n_recs += n_rec as u64;
        self.sum_n_plus_x_recs += n_expanded as u64;

        // Sort on the full key bytes
        let mut tmp_arr = self.arena.reserve(bin_id, BinRole::TmpArray);
        if n_expanded > 0 {
            if self.kind == KmerKind::Plain && S == 1 {
                let a: &mut [u64] =
                    bytemuck::cast_slice_mut(&mut input_arr.as_mut_slice()[..n_expanded * 8]);
                let b: &mut [u64] =
                    bytemuck::cast_slice_mut(&mut tmp_arr.as_mut_slice()[..n_expanded * 8]);
                radix_sort_u64(&self.radix_pool, a, b, phases, self.n_threads);
            } else {
                radix_sort_records(
                    &self.radix_pool,
                    &mut input_arr.as_mut_slice()[..n_expanded * rec_size],
                    &mut tmp_arr.as_mut_slice()[..n_expanded * rec_size],
                    n_expanded,
                    rec_size,
                    0,
                    phases,
                    self.n_threads,
                );
            }
        }
        let mut sorted = if phases % 2 == 1 { tmp_arr } else { input_arr };

        // Compact equal k-mers into (suffix, counter) pairs and the LUT
        let mut suffix = self.arena.reserve(bin_id, BinRole::Suffix);
        let mut lut_raw = self.arena.reserve(bin_id, BinRole::Lut);
        let mut stats = OutputStats::default();
        let suffix_size;
        {
            let lut: &mut [u64] = bytemuck::cast_slice_mut(lut_raw.as_mut_slice());
            lut.fill(0);
            let mut writer = CompactWriter {
                out: suffix.as_mut_slice(),
                pos: 0,
                lut,
                suffix_bytes,
                counter_bytes,
                suffix_bits: 2 * (self.kmer_len - self.lut_prefix_len),
            };

            match self.kind {
                KmerKind::Plain if self.max_x > 0 => {
                    if n_expanded > 0 {
                        let buffer: &mut [KmerWord<S>] = bytemuck::cast_slice_mut(
                            &mut sorted.as_mut_slice()[..n_expanded * rec_size],
                        );
                        let mut counters_raw = self.arena.reserve(bin_id, BinRole::KxmerCounters);
                        let counters: &mut [u32] = bytemuck::cast_slice_mut(
                            &mut counters_raw.as_mut_slice()[..capacity * 4],
                        );
                        let compacted = pre_compact_kxmers(buffer, counters);

                        let mut set =
                            KxmerSet::new(&buffer[..compacted], self.kmer_len, self.max_x);
                        set.build(compacted);

                        let (pos, mut kmer) = set.get_min().expect("tournament is non-empty");
                        let mut count = counters[pos] as u64;
                        while let Some((pos, next)) = set.get_min() {
                            if next == kmer {
                                count += counters[pos] as u64;
                            } else {
                                self.classify(&mut stats, &mut writer, &kmer, count);
                                kmer = next;
                                count = counters[pos] as u64;
                            }
                        }
                        self.classify(&mut stats, &mut writer, &kmer, count);
                    }
                    self.arena.free(bin_id, BinRole::KxmerCounters);
                }
                KmerKind::Plain => {
                    let buffer: &[KmerWord<S>] =
                        bytemuck::cast_slice(&sorted.as_slice()[..n_expanded * rec_size]);
                    if let Some((&first, rest)) = buffer.split_first() {
                        let mut act = first;
                        let mut count = 1u64;
                        for k in rest {
                            if *k == act {
                                count += 1;
                            } else {
                                self.classify(&mut stats, &mut writer, &act, count);
                                act = *k;
                                count = 1;
                            }
                        }
                        self.classify(&mut stats, &mut writer, &act, count);
                    }
                }
                KmerKind::Quality => {
                    let buffer: &[QualityKmer<S>] =
                        bytemuck::cast_slice(&sorted.as_slice()[..n_expanded * rec_size]);
                    stats.n_total = n_expanded as u64;
                    if let Some((first, rest)) = buffer.split_first() {
                        let mut act = first.word;
                        let mut count = first.quality as f64;
                        for rec in rest {
                            if rec.word == act {
                                count += rec.quality as f64;
                            } else {
                                self.classify_quality(&mut stats, &mut writer, &act, count);
                                act = rec.word;
                                count = rec.quality as f64;
                            }
                        }
                        self.classify_quality(&mut stats, &mut writer, &act, count);
                    }
                }
            }
            suffix_size = writer.pos;
        }

        log::debug!(
            "bin {}: {} records, {} unique, {} below cutoff, {} above cutoff, {} total",
            bin_id,
            n_expanded,
            stats.n_unique,
            stats.n_cutoff_min,
            stats.n_cutoff_max,
            stats.n_total
        );

        self.kmer_queue.push(CompactedBin::new(
            bin_id,
            stats,
            suffix,
            suffix_size,
            lut_raw,
            Arc::clone(&self.arena),
        ));

        drop(sorted);
        self.arena.free(bin_id, BinRole::InputArray);
        self.arena.free(bin_id, BinRole::TmpArray);
        Ok(())
    }
}

/// Run one sorter worker with the k-mer word width that fits this run's
/// `k` and `max_x`; each bin binds its monomorphic pipeline here, once.
pub fn run_bin_sorter(
    params: &CountingParams,
    queues: &PipelineQueues,
    thread_no: usize,
) -> Result<()> {
    match words_for_kmer(params.kmer_len, params.effective_max_x()) {
        1 => BinSorter::<1>::new(params, queues, thread_no).process_bins(),
        2 => BinSorter::<2>::new(params, queues, thread_no).process_bins(),
        3 => BinSorter::<3>::new(params, queues, thread_no).process_bins(),
        4 => BinSorter::<4>::new(params, queues, thread_no).process_bins(),
        n => bail!("unsupported k-mer width of {} words", n),
    }
}
