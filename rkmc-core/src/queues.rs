// Blocking queues and the bin description table that connect the pipeline
// stages.
//
// Every queue is the same monitor: a mutex-guarded deque, a condition
// variable, a live-writer count and FIFO order. `pop` blocks while the
// queue is empty and writers remain; once the last writer marks completion,
// drained consumers receive `None`.

use crate::bin_file::BinFile;
use crate::memory::{BinArena, BinRole, RawSlice};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};

pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
}

struct QueueState<T> {
    items: VecDeque<T>,
    n_writers: u32,
}

impl<T> WorkQueue<T> {
    pub fn new(n_writers: u32) -> Self {
        WorkQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                n_writers,
            }),
            not_empty: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) {
        let mut st = self.state.lock().unwrap();
        let was_empty = st.items.is_empty();
        st.items.push_back(item);
        if was_empty {
            self.not_empty.notify_all();
        }
    }

    /// Take the next item, waiting while the queue is empty and producers
    /// are still alive. `None` means the queue has drained for good.
    pub fn pop(&self) -> Option<T> {
        let mut st = self.state.lock().unwrap();
        while st.items.is_empty() && st.n_writers > 0 {
            st = self.not_empty.wait(st).unwrap();
        }
        st.items.pop_front()
    }

    /// One producer is done; the last call wakes all blocked consumers
    pub fn mark_completed(&self) {
        let mut st = self.state.lock().unwrap();
        st.n_writers = st.n_writers.saturating_sub(1);
        if st.n_writers == 0 {
            self.not_empty.notify_all();
        }
    }

    pub fn completed(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.items.is_empty() && st.n_writers == 0
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }
}

/// Queue of input sequence files awaiting the readers
pub struct InputFilesQueue {
    state: Mutex<(VecDeque<PathBuf>, bool)>,
}

impl InputFilesQueue {
    pub fn new(files: Vec<PathBuf>) -> Self {
        InputFilesQueue {
            state: Mutex::new((files.into(), false)),
        }
    }

    pub fn pop(&self) -> Option<PathBuf> {
        self.state.lock().unwrap().0.pop_front()
    }

    pub fn mark_completed(&self) {
        self.state.lock().unwrap().1 = true;
    }

    pub fn completed(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.0.is_empty() && st.1
    }
}

/// Raw chunk of an input file, produced by the readers
pub type PartQueue = WorkQueue<Vec<u8>>;

/// Packed super-k-mer part routed to a bin by the splitter
#[derive(Debug)]
pub struct BinPart {
    pub bin_id: u32,
    pub data: Vec<u8>,
}

pub type BinPartQueue = WorkQueue<BinPart>;

/// A closed bin ready for sorting
#[derive(Debug, Clone, Copy)]
pub struct BinItem {
    pub bin_id: u32,
    pub size: u64,
    pub n_rec: u64,
}

pub type BinQueue = WorkQueue<BinItem>;

/// Sorted, compacted output of one bin
pub type KmerQueue = WorkQueue<CompactedBin>;

// BinDesc - metadata for every bin

#[derive(Clone, Default)]
pub struct BinDescEntry {
    pub desc: String,
    pub file: Option<Arc<BinFile>>,
    pub size: u64,
    pub n_rec: u64,
    pub n_plus_x_recs: u64,
    pub n_super_kmers: u64,
    pub buffer_size: u32,
    pub kmer_len: u32,
}

/// Monotonic-append table of bin metadata. Several producers may add to the
/// same bin before it is closed; once a bin is enqueued for sorting its
/// entry is no longer written.
pub struct BinDesc {
    map: Mutex<BTreeMap<u32, BinDescEntry>>,
}

impl BinDesc {
    pub fn new() -> Self {
        BinDesc {
            map: Mutex::new(BTreeMap::new()),
        }
    }

    /// Accumulate sizes and record counts for a bin; the file handle,
    /// description and buffer geometry are set by whichever producer
    /// supplies them
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &self,
        bin_id: u32,
        file: Option<Arc<BinFile>>,
        desc: &str,
        size: u64,
        n_rec: u64,
        n_plus_x_recs: u64,
        n_super_kmers: u64,
        buffer_size: u32,
        kmer_len: u32,
    ) {
        let mut map = self.map.lock().unwrap();
        let e = map.entry(bin_id).or_default();
        if !desc.is_empty() {
            e.desc = desc.to_string();
            e.file = file;
        }
        e.size += size;
        e.n_rec += n_rec;
        e.n_plus_x_recs += n_plus_x_recs;
        e.n_super_kmers += n_super_kmers;
        if buffer_size != 0 {
            e.buffer_size = buffer_size;
            e.kmer_len = kmer_len;
        }
    }

    pub fn read(&self, bin_id: u32) -> Option<BinDescEntry> {
        self.map.lock().unwrap().get(&bin_id).cloned()
    }

    pub fn bin_ids(&self) -> Vec<u32> {
        self.map.lock().unwrap().keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().unwrap().is_empty()
    }
}

impl Default for BinDesc {
    fn default() -> Self {
        Self::new()
    }
}

// CompactedBin - what a bin worker publishes

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputStats {
    pub n_unique: u64,
    pub n_cutoff_min: u64,
    pub n_cutoff_max: u64,
    pub n_total: u64,
}

/// Suffix stream and prefix LUT of one compacted bin. The payload still
/// lives in the bin's arena reservation; dropping the value releases the
/// two output roles and with them, eventually, the reservation.
pub struct CompactedBin {
    pub bin_id: u32,
    pub stats: OutputStats,
    suffix: RawSlice,
    suffix_size: usize,
    lut: RawSlice,
    arena: Arc<BinArena>,
}

impl CompactedBin {
    pub fn new(
        bin_id: u32,
        stats: OutputStats,
        suffix: RawSlice,
        suffix_size: usize,
        lut: RawSlice,
        arena: Arc<BinArena>,
    ) -> Self {
        CompactedBin {
            bin_id,
            stats,
            suffix,
            suffix_size,
            lut,
            arena,
        }
    }

    /// Packed suffix bytes interleaved with counter bytes
    pub fn suffix(&self) -> &[u8] {
        &self.suffix.as_slice()[..self.suffix_size]
    }

    /// Prefix LUT: occurrence count per `lut_prefix_len`-symbol prefix
    pub fn lut(&self) -> &[u64] {
        bytemuck::cast_slice(self.lut.as_slice())
    }
}

impl Drop for CompactedBin {
    fn drop(&mut self) {
        self.arena.free(self.bin_id, BinRole::Suffix);
        self.arena.free(self.bin_id, BinRole::Lut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_queue_fifo_order() {
        let q: WorkQueue<u32> = WorkQueue::new(1);
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn test_queue_drains_after_completion() {
        let q: WorkQueue<u32> = WorkQueue::new(1);
        q.push(7);
        q.mark_completed();
        assert_eq!(q.pop(), Some(7));
        assert_eq!(q.pop(), None);
        assert!(q.completed());
    }

    #[test]
    fn test_queue_pop_blocks_until_push() {
        let q: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new(1));
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.pop());
        thread::sleep(Duration::from_millis(50));
        q.push(42);
        assert_eq!(handle.join().unwrap(), Some(42));
    }

    #[test]
    fn test_queue_multiple_writers() {
        let q: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new(3));

        let producers: Vec<_> = (0..3)
            .map(|i| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for j in 0..100 {
                        q.push(i * 100 + j);
                    }
                    q.mark_completed();
                })
            })
            .collect();

        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let mut n = 0;
                while q.pop().is_some() {
                    n += 1;
                }
                n
            })
        };

        for p in producers {
            p.join().unwrap();
        }
        assert_eq!(consumer.join().unwrap(), 300);
    }

    #[test]
    fn test_input_files_queue() {
        let q = InputFilesQueue::new(vec![PathBuf::from("a.fastq"), PathBuf::from("b.fastq")]);
        assert!(!q.completed());
        assert_eq!(q.pop(), Some(PathBuf::from("a.fastq")));
        q.mark_completed();
        assert!(!q.completed());
        assert_eq!(q.pop(), Some(PathBuf::from("b.fastq")));
        assert!(q.completed());
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_bin_desc_accumulates() {
        let bd = BinDesc::new();
        bd.insert(3, None, "", 100, 10, 12, 2, 0, 0);
        bd.insert(3, Some(Arc::new(BinFile::in_memory())), "bin3", 50, 5, 6, 1, 1 << 15, 25);
        bd.insert(3, None, "", 25, 2, 3, 1, 0, 0);

        let e = bd.read(3).unwrap();
        assert_eq!(e.desc, "bin3");
        assert!(e.file.is_some());
        assert_eq!(e.size, 175);
        assert_eq!(e.n_rec, 17);
        assert_eq!(e.n_plus_x_recs, 21);
        assert_eq!(e.n_super_kmers, 4);
        assert_eq!(e.buffer_size, 1 << 15);
        assert_eq!(e.kmer_len, 25);
        assert_eq!(bd.bin_ids(), vec![3]);
    }
}
