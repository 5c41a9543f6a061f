//! Circular byte buffer holding the tail of a user's terminal output, so a
//! newly connected observer sees the current screen instead of nothing.

/// A fixed-capacity circular byte buffer.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Vec<u8>,
    capacity: usize,
    /// Write position (wraps around).
    write_pos: usize,
    /// Total bytes ever written (used to detect wrap).
    total_written: u64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            capacity,
            write_pos: 0,
            total_written: 0,
        }
    }

    /// Append, overwriting the oldest bytes once full.
    pub fn write(&mut self, data: &[u8]) {
        if self.capacity == 0 || data.is_empty() {
            return;
        }

        // Only the last `capacity` bytes of a large chunk can survive.
        let skip = data.len().saturating_sub(self.capacity);
        let data = &data[skip..];
        self.total_written += skip as u64;

        let first = data.len().min(self.capacity - self.write_pos);
        self.buf[self.write_pos..self.write_pos + first].copy_from_slice(&data[..first]);
        let rest = &data[first..];
        self.buf[..rest.len()].copy_from_slice(rest);

        self.write_pos = (self.write_pos + data.len()) % self.capacity;
        self.total_written += data.len() as u64;
    }

    /// All buffered bytes, oldest first.
    pub fn read_all(&self) -> Vec<u8> {
        if self.total_written <= self.capacity as u64 {
            return self.buf[..self.len()].to_vec();
        }
        let mut result = Vec::with_capacity(self.capacity);
        result.extend_from_slice(&self.buf[self.write_pos..]);
        result.extend_from_slice(&self.buf[..self.write_pos]);
        result
    }

    pub fn len(&self) -> usize {
        if self.total_written >= self.capacity as u64 {
            self.capacity
        } else {
            self.total_written as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
