// Application-managed memory: global budget monitor, fixed-part pool,
// and the per-bin arena that scratch space is carved from.

use rkmc_common::ALIGNMENT;
use std::cell::UnsafeCell;
use std::sync::{Arc, Condvar, Mutex};

/// Mutable view into pool- or arena-owned memory.
///
/// The owner hands out each range to exactly one worker at a time and keeps
/// ranges of live reservations disjoint, which is what makes the slice
/// accessors sound. The view stays valid until the corresponding role or
/// part is freed.
pub struct RawSlice {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for RawSlice {}

impl RawSlice {
    fn new(ptr: *mut u8, len: usize) -> Self {
        RawSlice { ptr, len }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the owning pool/arena guarantees exclusivity and validity
        // for the lifetime of the handout (see type-level comment)
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, plus `&mut self` prevents aliasing through this
        // handle
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }
}

/// Shared mutable pointer for threads that write disjoint ranges of one
/// destination buffer (radix scatter, expander flushes)
#[derive(Clone, Copy)]
pub(crate) struct SharedPtr<T>(*mut T);

// SAFETY: users derive disjoint write ranges per thread before touching the
// pointer (prefix sums in the radix sort, atomic range claims in the
// expander)
unsafe impl<T> Send for SharedPtr<T> {}
unsafe impl<T> Sync for SharedPtr<T> {}

impl<T> SharedPtr<T> {
    pub(crate) fn new(ptr: *mut T) -> Self {
        SharedPtr(ptr)
    }

    pub(crate) fn get(&self) -> *mut T {
        self.0
    }
}

fn alloc_limbs(n_bytes: usize) -> Box<[UnsafeCell<u64>]> {
    let n_limbs = (n_bytes + 7) / 8;
    (0..n_limbs).map(|_| UnsafeCell::new(0u64)).collect()
}

fn base_ptr(storage: &[UnsafeCell<u64>]) -> *mut u8 {
    storage.as_ptr() as *mut u64 as *mut u8
}

fn round_up(x: usize, to: usize) -> usize {
    (x + to - 1) / to * to
}

// MemoryMonitor - global RAM budget shared by all stages

pub struct MemoryMonitor {
    state: Mutex<MonitorState>,
    freed: Condvar,
}

struct MonitorState {
    max_memory: u64,
    in_use: u64,
}

impl MemoryMonitor {
    pub fn new(max_memory: u64) -> Self {
        MemoryMonitor {
            state: Mutex::new(MonitorState {
                max_memory,
                in_use: 0,
            }),
            freed: Condvar::new(),
        }
    }

    /// Account `n` bytes, waiting until the budget allows it
    pub fn increase(&self, n: u64) {
        let mut st = self.state.lock().unwrap();
        while st.in_use + n > st.max_memory {
            st = self.freed.wait(st).unwrap();
        }
        st.in_use += n;
    }

    /// Account `n` bytes; an over-budget request is admitted when nothing
    /// else is currently accounted, so a single oversized bin cannot wedge
    /// the pipeline
    pub fn force_increase(&self, n: u64) {
        let mut st = self.state.lock().unwrap();
        while st.in_use + n > st.max_memory && st.in_use != 0 {
            st = self.freed.wait(st).unwrap();
        }
        st.in_use += n;
    }

    pub fn decrease(&self, n: u64) {
        let mut st = self.state.lock().unwrap();
        st.in_use -= n;
        self.freed.notify_all();
    }

    pub fn usage(&self) -> (u64, u64) {
        let st = self.state.lock().unwrap();
        (st.max_memory, st.in_use)
    }
}

// MemoryPool - equally sized parts handed out from one backing buffer

/// Blocking pool of fixed-size scratch parts. Radix-sort scatter buffers and
/// expander staging buffers are drawn from here so the hot loops never
/// allocate.
pub struct MemoryPool {
    storage: Box<[UnsafeCell<u64>]>,
    part_size: usize,
    free: Mutex<Vec<u32>>,
    released: Condvar,
}

// SAFETY: parts are disjoint and each free-stack index is handed to at most
// one PoolPart at a time
unsafe impl Sync for MemoryPool {}

impl MemoryPool {
    pub fn new(total_size: usize, part_size: usize) -> Arc<Self> {
        // Parts keep 16-byte granularity so they can be viewed as words
        let part_size = round_up(part_size.max(16), 16);
        let n_parts = (total_size / part_size).max(1);
        Arc::new(MemoryPool {
            storage: alloc_limbs(n_parts * part_size),
            part_size,
            free: Mutex::new((0..n_parts as u32).collect()),
            released: Condvar::new(),
        })
    }

    pub fn part_size(&self) -> usize {
        self.part_size
    }

    /// Take one part, waiting until one is free
    pub fn reserve(&self) -> PoolPart<'_> {
        let mut free = self.free.lock().unwrap();
        let idx = loop {
            match free.pop() {
                Some(idx) => break idx,
                None => free = self.released.wait(free).unwrap(),
            }
        };
        let ptr = unsafe { base_ptr(&self.storage).add(idx as usize * self.part_size) };
        PoolPart {
            data: RawSlice::new(ptr, self.part_size),
            idx,
            pool: self,
        }
    }

    fn release(&self, idx: u32) {
        self.free.lock().unwrap().push(idx);
        self.released.notify_all();
    }
}

/// One pool part; returns itself to the pool on drop
pub struct PoolPart<'a> {
    data: RawSlice,
    idx: u32,
    pool: &'a MemoryPool,
}

impl PoolPart<'_> {
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data.as_mut_slice()
    }
}

impl Drop for PoolPart<'_> {
    fn drop(&mut self) {
        self.pool.release(self.idx);
    }
}

// BinArena - per-bin scratch regions carved from one contiguous buffer

/// The six roles a bin's reservation is split into. Roles may alias
/// (the sort's final destination shares space with either the input file
/// bytes or the record array, depending on pass parity); the worker uses
/// aliasing roles strictly one after another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinRole {
    InputFile = 0,
    InputArray = 1,
    TmpArray = 2,
    Suffix = 3,
    Lut = 4,
    KxmerCounters = 5,
}

const N_ROLES: usize = 6;

/// Space requirements of one bin, in bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct BinSizes {
    pub file_size: usize,
    pub kxmers_size: usize,
    pub out_buffer_size: usize,
    pub kxmer_counter_size: usize,
    pub lut_size: usize,
}

struct BinRegion {
    base: usize,
    req_size: usize,
    roles: [Option<(usize, usize)>; N_ROLES], // (offset, len) relative to buffer start
}

struct ArenaState {
    storage: Box<[UnsafeCell<u64>]>,
    total_size: usize,
    free_size: usize,
    // Address-ordered (offset, len) reservations, terminated by a
    // zero-length guard at `total_size`
    reserved: Vec<(usize, usize)>,
    // Reservations in insertion order: (bin_id, offset)
    insert_order: Vec<(u32, usize)>,
    bins: Vec<Option<BinRegion>>,
}

impl ArenaState {
    fn find_position(&self, req: usize) -> Option<usize> {
        // Prefer the gap right after the most recent reservation
        if let Some(&(_, last_off)) = self.insert_order.last() {
            if let Some(i) = self.reserved.iter().position(|&(off, _)| off == last_off) {
                let end = self.reserved[i].0 + self.reserved[i].1;
                if end + req <= self.reserved[i + 1].0 {
                    return Some(end);
                }
            }
        }
        let mut prev_end = 0usize;
        for &(off, len) in &self.reserved {
            if prev_end + req <= off {
                return Some(prev_end);
            }
            prev_end = off + len;
        }
        None
    }
}

/// One contiguous buffer shared by all live bins.
///
/// `init` blocks until a large enough gap exists, growing the buffer only
/// while no reservation is live. Freeing the last role of a bin removes its
/// reservation and wakes blocked callers.
pub struct BinArena {
    state: Mutex<ArenaState>,
    released: Condvar,
}

impl BinArena {
    pub fn new(total_size: usize, n_bins: u32) -> Self {
        let total_size = round_up(total_size, ALIGNMENT);
        BinArena {
            state: Mutex::new(ArenaState {
                storage: alloc_limbs(total_size),
                total_size,
                free_size: total_size,
                reserved: vec![(total_size, 0)],
                insert_order: Vec::new(),
                bins: (0..n_bins).map(|_| None).collect(),
            }),
            released: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().unwrap().total_size
    }

    pub fn free_bytes(&self) -> usize {
        self.state.lock().unwrap().free_size
    }

    /// Reserve scratch space for a bin and lay out its six roles.
    ///
    /// `sorting_phases` parity decides whether the sorted output lands in
    /// the same half as the record array or in the other one, and the
    /// layout mirrors that so the output buffer can reuse the half the sort
    /// vacates.
    pub fn init(&self, bin_id: u32, sorting_phases: u32, sizes: BinSizes) {
        let file_size = round_up(sizes.file_size.max(1), 8);
        let kxmers_size = round_up(sizes.kxmers_size, 8);
        let out_buffer_size = round_up(sizes.out_buffer_size, 8);
        let kxmer_counter_size = round_up(sizes.kxmer_counter_size, 8);
        let lut_size = round_up(sizes.lut_size, 8);

        let (part1, part2) = if sorting_phases % 2 == 0 {
            (
                kxmers_size + kxmer_counter_size,
                file_size.max(kxmers_size).max(out_buffer_size + lut_size),
            )
        } else {
            (
                (kxmers_size + kxmer_counter_size).max(file_size),
                kxmers_size.max(out_buffer_size + lut_size),
            )
        };
        let req = part1 + part2;

        let mut st = self.state.lock().unwrap();
        let base = loop {
            if let Some(pos) = st.find_position(req) {
                break pos;
            }
            // Growth is only possible while nothing is reserved
            if st.insert_order.is_empty() && req > st.total_size {
                let new_size = round_up(req, ALIGNMENT);
                st.storage = alloc_limbs(new_size);
                st.total_size = new_size;
                st.free_size = new_size;
                st.reserved = vec![(new_size, 0)];
                break 0;
            }
            st = self.released.wait(st).unwrap();
        };

        st.insert_order.push((bin_id, base));
        let at = st
            .reserved
            .iter()
            .position(|&(off, _)| base < off)
            .expect("guard entry missing");
        st.reserved.insert(at, (base, req));
        st.free_size -= req;

        let mut roles = [None; N_ROLES];
        if sorting_phases % 2 == 0 {
            roles[BinRole::InputFile as usize] = Some((base + part1, file_size));
            roles[BinRole::InputArray as usize] = Some((base, kxmers_size));
            roles[BinRole::TmpArray as usize] = Some((base + part1, kxmers_size));
        } else {
            roles[BinRole::InputFile as usize] = Some((base, file_size));
            roles[BinRole::InputArray as usize] = Some((base + part1, kxmers_size));
            roles[BinRole::TmpArray as usize] = Some((base, kxmers_size));
        }
        roles[BinRole::Suffix as usize] = Some((base + part1, out_buffer_size));
        roles[BinRole::Lut as usize] = Some((base + part1 + out_buffer_size, lut_size));
        if kxmer_counter_size != 0 {
            roles[BinRole::KxmerCounters as usize] = Some((base + kxmers_size, kxmer_counter_size));
        }

        st.bins[bin_id as usize] = Some(BinRegion {
            base,
            req_size: req,
            roles,
        });
    }

    /// View a role of a live bin
    pub fn reserve(&self, bin_id: u32, role: BinRole) -> RawSlice {
        let st = self.state.lock().unwrap();
        let region = st.bins[bin_id as usize]
            .as_ref()
            .expect("bin has no reservation");
        let (off, len) = region.roles[role as usize].expect("bin role already freed");
        RawSlice::new(unsafe { base_ptr(&st.storage).add(off) }, len)
    }

    /// Drop a role; the whole reservation is released once every role of
    /// the bin has been freed
    pub fn free(&self, bin_id: u32, role: BinRole) {
        let mut st = self.state.lock().unwrap();
        let Some(region) = st.bins[bin_id as usize].as_mut() else {
            return;
        };
        region.roles[role as usize] = None;
        if region.roles.iter().any(|r| r.is_some()) {
            return;
        }

        let base = region.base;
        let req = region.req_size;
        st.bins[bin_id as usize] = None;
        if let Some(i) = st
            .reserved
            .iter()
            .position(|&(off, len)| off == base && len == req)
        {
            st.reserved.remove(i);
        }
        if let Some(i) = st.insert_order.iter().position(|&(id, _)| id == bin_id) {
            st.insert_order.remove(i);
        }
        st.free_size += req;
        self.released.notify_all();
    }
}
