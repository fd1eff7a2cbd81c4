/// Receives full frames from a [`FrameBuffer`].
pub(crate) trait FrameSink {
    fn flush_frame(&mut self, frame: &[u8]);
}

/// Packs encoded records into capacity-bounded frames for more efficient network I/O.
///
/// Records are separated by the configured separator inside a frame, so multiple records ride in a
/// single datagram and are trivially split apart by the remote server. A frame is handed to the
/// sink either when the next record would not fit, or when [`FrameBuffer::flush`] forces it out.
///
/// The buffer is owned exclusively by the delivery worker thread and needs no internal locking.
pub(crate) struct FrameBuffer<S> {
    sink: S,
    buf: Vec<u8>,
    capacity: usize,
    separator: Vec<u8>,
}

impl<S: FrameSink> FrameBuffer<S> {
    /// Creates a frame buffer with the given byte capacity and record separator.
    pub fn new(sink: S, capacity: usize, separator: &[u8]) -> Self {
        // NOTE: This is also validated in the builder, but we double check here: a separator as
        // large as the frame means the frame could never hold a second record.
        assert!(
            separator.len() < capacity,
            "separator length must be smaller than the frame capacity"
        );

        Self { sink, buf: Vec::with_capacity(capacity), capacity, separator: separator.to_vec() }
    }

    /// Appends one record, flushing the current frame first if the record would not fit.
    ///
    /// Returns `false`, without touching the frame, if the record alone exceeds the total
    /// capacity and can never be sent.
    pub fn add(&mut self, record: &[u8]) -> bool {
        if record.len() > self.capacity {
            return false;
        }

        let mut needed = record.len();
        if !self.buf.is_empty() {
            needed += self.separator.len();
        }

        if self.buf.len() + needed > self.capacity {
            self.flush();
        }

        if !self.buf.is_empty() {
            self.buf.extend_from_slice(&self.separator);
        }
        self.buf.extend_from_slice(record);

        true
    }

    /// Hands the current frame to the sink and resets. Flushing an empty frame is a no-op.
    pub fn flush(&mut self) {
        if !self.buf.is_empty() {
            self.sink.flush_frame(&self.buf);
            self.buf.clear();
        }
    }

    /// Returns the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg(test)]
    pub fn sink(&self) -> &S {
        &self.sink
    }
}
