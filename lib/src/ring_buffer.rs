/// Fixed-capacity FIFO over an inline array.
///
/// Backs the PS/2-compatible input queues (one element per event) and the
/// per-socket UDP datagram rings (one element per byte, with
/// [`push_slice`](Self::push_slice) / [`pop_into`](Self::pop_into) moving
/// whole records at a time).
#[derive(Debug)]
pub struct RingBuffer<T, const N: usize> {
    data: [T; N],
    head: u32,
    tail: u32,
    count: u32,
}

impl<T: Copy, const N: usize> RingBuffer<T, N> {
    /// Const constructor for statics: every slot starts as `value`.
    #[inline(always)]
    pub const fn new_with(value: T) -> Self {
        Self {
            data: [value; N],
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    #[inline(always)]
    pub const fn len(&self) -> u32 {
        self.count
    }

    #[inline(always)]
    pub const fn capacity(&self) -> u32 {
        N as u32
    }

    #[inline(always)]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline(always)]
    pub const fn is_full(&self) -> bool {
        self.count >= N as u32
    }

    /// Slots still available for pushing.
    #[inline(always)]
    pub const fn free_space(&self) -> u32 {
        N as u32 - self.count
    }

    #[inline(always)]
    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.count = 0;
    }

    /// Push, dropping the oldest element when full.
    #[inline(always)]
    pub fn push_overwrite(&mut self, value: T) {
        if self.is_full() {
            self.tail = (self.tail + 1) % self.capacity();
            self.count -= 1;
        }
        self.data[self.head as usize] = value;
        self.head = (self.head + 1) % self.capacity();
        self.count += 1;
    }

    /// Push without overwrite; `false` when full.
    #[inline(always)]
    pub fn try_push(&mut self, value: T) -> bool {
        if self.is_full() {
            return false;
        }
        self.data[self.head as usize] = value;
        self.head = (self.head + 1) % self.capacity();
        self.count += 1;
        true
    }

    #[inline(always)]
    pub fn try_pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let value = self.data[self.tail as usize];
        self.tail = (self.tail + 1) % self.capacity();
        self.count -= 1;
        Some(value)
    }

    #[inline(always)]
    pub fn peek(&self) -> Option<&T> {
        if self.is_empty() {
            return None;
        }
        Some(&self.data[self.tail as usize])
    }

    /// Push every element of `values` or none of them.
    pub fn push_slice(&mut self, values: &[T]) -> bool {
        if values.len() > self.free_space() as usize {
            return false;
        }
        for &v in values {
            self.data[self.head as usize] = v;
            self.head = (self.head + 1) % self.capacity();
        }
        self.count += values.len() as u32;
        true
    }

    /// Pop up to `out.len()` elements into `out`; returns how many were moved.
    pub fn pop_into(&mut self, out: &mut [T]) -> usize {
        let n = out.len().min(self.count as usize);
        for slot in out.iter_mut().take(n) {
            *slot = self.data[self.tail as usize];
            self.tail = (self.tail + 1) % self.capacity();
        }
        self.count -= n as u32;
        n
    }

    /// Discard up to `n` of the oldest elements; returns how many were dropped.
    pub fn skip(&mut self, n: usize) -> usize {
        let n = n.min(self.count as usize);
        self.tail = ((self.tail as usize + n) % N) as u32;
        self.count -= n as u32;
        n
    }
}

impl<T: Copy + Default, const N: usize> RingBuffer<T, N> {
    #[inline(always)]
    pub fn new() -> Self {
        Self::new_with(T::default())
    }
}

impl<T: Copy + Default, const N: usize> Default for RingBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
