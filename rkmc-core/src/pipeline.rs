// Sorter pool orchestration

use crate::params::{CountingParams, PipelineQueues};
use crate::queues::{BinDesc, BinItem, BinQueue};
use crate::sorter::run_bin_sorter;
use anyhow::Result;
use std::thread;

/// Enqueue every described bin for sorting, in bin order, and close the
/// queue. Called once all splitter appends are done and the metadata is
/// frozen.
pub fn enqueue_closed_bins(bin_desc: &BinDesc, bin_queue: &BinQueue) {
    for bin_id in bin_desc.bin_ids() {
        if let Some(entry) = bin_desc.read(bin_id) {
            bin_queue.push(BinItem {
                bin_id,
                size: entry.size,
                n_rec: entry.n_rec,
            });
        }
    }
    bin_queue.mark_completed();
}

/// Run the bin sorter pool to completion. Returns the first fatal error;
/// remaining workers drain cooperatively before it propagates.
pub fn run_sorters(params: &CountingParams, queues: &PipelineQueues) -> Result<()> {
    params.validate()?;
    log::info!(
        "sorting bins: k={}, max_x={}, {} sorters",
        params.kmer_len,
        params.effective_max_x(),
        params.n_sorters
    );

    thread::scope(|s| {
        let handles: Vec<_> = (0..params.n_sorters as usize)
            .map(|i| s.spawn(move || run_bin_sorter(params, queues, i)))
            .collect();

        let mut result = Ok(());
        for h in handles {
            if let Err(e) = h.join().expect("sorter thread panicked") {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    })
}
