/// Fixed-capacity circular byte buffer over raw PTY output.
///
/// Writing more than the capacity retains only the trailing `capacity`
/// bytes. Reads copy the current contents out, oldest byte first. The
/// backing storage is allocated once; writes never allocate.
///
/// The buffer itself is not synchronized; owners wrap it in their own
/// mutex, kept separate from any other per-session state lock.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Vec<u8>,
    capacity: usize,
    write_pos: usize,
    len: usize,
}

pub const DEFAULT_CAPACITY: usize = 8 * 1024;

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RingBuffer {
    /// Create a buffer with the given capacity. Capacity is immutable for
    /// the life of the buffer.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity.max(1)],
            capacity: capacity.max(1),
            write_pos: 0,
            len: 0,
        }
    }

    /// Append data, overwriting the oldest bytes once full.
    pub fn write(&mut self, data: &[u8]) {
        // Only the trailing `capacity` bytes of an oversized write can
        // survive; skip the rest up front.
        let data = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };

        let start = self.write_pos;
        let end = start + data.len();
        if end <= self.capacity {
            self.buf[start..end].copy_from_slice(data);
        } else {
            let first = self.capacity - start;
            self.buf[start..].copy_from_slice(&data[..first]);
            self.buf[..data.len() - first].copy_from_slice(&data[first..]);
        }

        self.write_pos = end % self.capacity;
        self.len = (self.len + data.len()).min(self.capacity);
    }

    /// Copy out the full contents, oldest byte first.
    pub fn read(&self) -> Vec<u8> {
        self.get_last(self.len)
    }

    /// The most recent `min(n, len)` bytes, in arrival order.
    pub fn get_last(&self, n: usize) -> Vec<u8> {
        let n = n.min(self.len);
        if n == 0 {
            return Vec::new();
        }

        let start = if self.write_pos >= n {
            self.write_pos - n
        } else {
            self.capacity - (n - self.write_pos)
        };

        let mut out = Vec::with_capacity(n);
        if start + n <= self.capacity {
            out.extend_from_slice(&self.buf[start..start + n]);
        } else {
            out.extend_from_slice(&self.buf[start..]);
            out.extend_from_slice(&self.buf[..n - (self.capacity - start)]);
        }
        out
    }

    /// Reset length and position. Capacity is untouched.
    pub fn clear(&mut self) {
        self.write_pos = 0;
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
