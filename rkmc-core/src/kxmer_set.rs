// Tournament enumerating k-mers, in order, from a sorted k+x-mer array
//
// A k+x-mer with extension x contains x+1 overlapping k-mers. The sorted
// array is grouped by extension tag and then by leading symbols; every
// group whose first `t - shr` symbols are fixed forms a stream that yields
// its k-mer windows in sorted order when read with a right shift of `shr`
// symbols. The tournament merges those streams, smallest k-mer first, ties
// broken by source position.

use crate::kmer::KmerWord;

struct Stream<const S: usize> {
    kmer: KmerWord<S>,
    pos: usize,
    end: usize,
    shr: u32,
}

pub struct KxmerSet<'a, const S: usize> {
    buffer: &'a [KmerWord<S>],
    kmer_len: u32,
    max_x: u32,
    kmer_mask: KmerWord<S>,
    heap: Vec<Stream<S>>,
}

impl<'a, const S: usize> KxmerSet<'a, S> {
    pub fn new(buffer: &'a [KmerWord<S>], kmer_len: u32, max_x: u32) -> Self {
        KxmerSet {
            buffer,
            kmer_len,
            max_x,
            kmer_mask: KmerWord::n_ones(kmer_len * 2),
            heap: Vec::new(),
        }
    }

    fn stream_kmer(&self, pos: usize, shr: u32) -> KmerWord<S> {
        let mut k = self.buffer[pos];
        k.shr(shr);
        k.mask(&self.kmer_mask);
        k
    }

    /// Register `[start, end)` as a stream whose k-mers drop the last
    /// `shr` symbols of each k+x-mer
    fn init_add(&mut self, start: usize, end: usize, shr: u32) {
        let stream = Stream {
            kmer: self.stream_kmer(start, shr),
            pos: start,
            end,
            shr,
        };
        self.heap.push(stream);
        self.sift_up(self.heap.len() - 1);
    }

    /// First position in `[start, end)` whose symbol at `offset` (counted
    /// from the top of a full-width k+x-mer, offset 0 being the tag) is at
    /// least `symb`
    fn find_first_symb_occur(&self, start: usize, end: usize, offset: u32, symb: u64) -> usize {
        let at_bit = (self.kmer_len + self.max_x - offset) * 2;
        let (mut lo, mut hi) = (start, end);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.buffer[mid].get_2bits(at_bit) < symb {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        hi
    }

    fn init_range(&mut self, start: usize, end: usize, offset: u32, depth: u32) {
        if start == end {
            return;
        }
        let shr = self.max_x + 1 - offset;
        self.init_add(start, end, shr);
        if depth > 1 {
            let mut pos = [start, 0, 0, 0, end];
            for i in 1..4 {
                pos[i] = self.find_first_symb_occur(pos[i - 1], end, offset, i as u64);
            }
            for i in 1..5 {
                self.init_range(pos[i - 1], pos[i], offset + 1, depth - 1);
            }
        }
    }

    /// Group the first `n` sorted entries by extension tag and register
    /// every sub-stream down to depth x+1 per group
    pub fn build(&mut self, n: usize) {
        let mut pos = [0, 0, 0, 0, n];
        for i in 1..4 {
            pos[i] = self.find_first_symb_occur(pos[i - 1], n, 0, i as u64);
        }
        for i in 1..5usize {
            // Tag values above max_x cannot occur; their groups are empty
            if pos[i - 1] == pos[i] {
                continue;
            }
            self.init_range(pos[i - 1], pos[i], self.max_x + 2 - i as u32, i as u32);
        }
    }

    /// Smallest current k-mer across all streams, with the buffer position
    /// its count lives at; `None` once every stream is exhausted
    pub fn get_min(&mut self) -> Option<(usize, KmerWord<S>)> {
        if self.heap.is_empty() {
            return None;
        }
        let result = (self.heap[0].pos, self.heap[0].kmer);

        let (pos, end, shr) = {
            let root = &self.heap[0];
            (root.pos + 1, root.end, root.shr)
        };
        if pos < end {
            let kmer = self.stream_kmer(pos, shr);
            let root = &mut self.heap[0];
            root.pos = pos;
            root.kmer = kmer;
            self.sift_down(0);
        } else {
            let last = self.heap.len() - 1;
            self.heap.swap(0, last);
            self.heap.pop();
            if !self.heap.is_empty() {
                self.sift_down(0);
            }
        }
        Some(result)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    #[inline]
    fn less(a: &Stream<S>, b: &Stream<S>) -> bool {
        (a.kmer, a.pos) < (b.kmer, b.pos)
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if Self::less(&self.heap[i], &self.heap[parent]) {
                self.heap.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let (l, r) = (2 * i + 1, 2 * i + 2);
            let mut smallest = i;
            if l < self.heap.len() && Self::less(&self.heap[l], &self.heap[smallest]) {
                smallest = l;
            }
            if r < self.heap.len() && Self::less(&self.heap[r], &self.heap[smallest]) {
                smallest = r;
            }
            if smallest == i {
                break;
            }
            self.heap.swap(i, smallest);
            i = smallest;
        }
    }
}
