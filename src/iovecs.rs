//! Helpers for doing vectored IO against a byte range that may be smaller
//! than the buffers being written.
//!
//! When flushing a piece to disk, the piece's blocks are handed to
//! `pwritev(2)` as a list of IO vectors. A piece may span multiple files, in
//! which case only a prefix of the buffers belongs to the file currently
//! being written. [`IoVecs`] splits the buffer list at an arbitrary byte
//! boundary, exposes the head for the syscall (trimming the buffer that
//! straddles the boundary), tracks partial write progress, and afterwards
//! yields the tail for the next file.

use nix::sys::uio::IoVec;

/// A view over a list of IO vectors, optionally bounded to a byte length.
///
/// The buffers between the consumption cursor and the bound are available
/// via [`IoVecs::buffers`]; [`IoVecs::advance`] moves the cursor over bytes
/// confirmed written; [`IoVecs::into_tail`] returns the buffers past the
/// bound, restoring the second half of a buffer the bound may have cut in
/// two.
pub struct IoVecs<'a> {
    bufs: &'a mut [IoVec<&'a [u8]>],
    /// The index of the first buffer not yet fully consumed by `advance`.
    start: usize,
    /// One past the index of the last buffer belonging to the bounded head.
    end: usize,
    /// Set if the byte bound cut a buffer in two.
    split: Option<Split<'a>>,
}

struct Split<'a> {
    /// The index of the buffer that was cut.
    idx: usize,
    /// The cut buffer's original contents.
    full: &'a [u8],
    /// The number of its bytes that belong to the head.
    head_len: usize,
}

impl<'a> IoVecs<'a> {
    /// Creates a view over all of the given buffers, with no byte bound.
    pub fn unbounded(bufs: &'a mut [IoVec<&'a [u8]>]) -> Self {
        let end = bufs.len();
        Self {
            bufs,
            start: 0,
            end,
            split: None,
        }
    }

    /// Creates a view whose head covers exactly `max_len` bytes of the given
    /// buffers, splitting a straddling buffer if necessary. If the buffers
    /// hold no more than `max_len` bytes this is the same as
    /// [`IoVecs::unbounded`].
    pub fn bounded(bufs: &'a mut [IoVec<&'a [u8]>], max_len: usize) -> Self {
        let mut total = 0;
        for i in 0..bufs.len() {
            let len = bufs[i].as_slice().len();
            if total + len > max_len {
                let head_len = max_len - total;
                if head_len == 0 {
                    // the bound falls exactly between two buffers
                    return Self {
                        bufs,
                        start: 0,
                        end: i,
                        split: None,
                    };
                }
                let full = full_slice(&bufs[i]);
                bufs[i] = IoVec::from_slice(&full[..head_len]);
                return Self {
                    bufs,
                    start: 0,
                    end: i + 1,
                    split: Some(Split {
                        idx: i,
                        full,
                        head_len,
                    }),
                };
            }
            total += len;
        }
        Self::unbounded(bufs)
    }

    /// The not yet consumed buffers of the head, ready to be passed to
    /// a vectored IO syscall.
    pub fn buffers(&self) -> &[IoVec<&'a [u8]>] {
        &self.bufs[self.start..self.end]
    }

    /// Consumes `n` bytes from the front of the head, trimming a partially
    /// written buffer.
    ///
    /// # Panics
    ///
    /// Panics if `n` is larger than the number of bytes remaining in the
    /// head.
    pub fn advance(&mut self, mut n: usize) {
        while n > 0 {
            assert!(
                self.start < self.end,
                "advanced past the end of the buffers"
            );
            let len = self.bufs[self.start].as_slice().len();
            if n >= len {
                n -= len;
                self.start += 1;
            } else {
                let remaining = full_slice(&self.bufs[self.start]);
                self.bufs[self.start] = IoVec::from_slice(&remaining[n..]);
                return;
            }
        }
    }

    /// Returns the buffers past the byte bound. If the bound cut a buffer in
    /// two, its second half is the first buffer of the tail.
    pub fn into_tail(self) -> &'a mut [IoVec<&'a [u8]>] {
        let Self {
            bufs, end, split, ..
        } = self;
        match split {
            Some(split) => {
                bufs[split.idx] =
                    IoVec::from_slice(&split.full[split.head_len..]);
                &mut bufs[split.idx..]
            }
            None => &mut bufs[end..],
        }
    }
}

/// Recovers the `'a` slice an iovec was constructed from.
fn full_slice<'a>(buf: &IoVec<&'a [u8]>) -> &'a [u8] {
    let slice = buf.as_slice();
    // SAFETY: every iovec in this module is built via `IoVec::from_slice`
    // from a slice that lives for 'a; the IoVec API merely erases that
    // lifetime.
    unsafe { std::slice::from_raw_parts(slice.as_ptr(), slice.len()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(bufs: &[IoVec<&[u8]>]) -> Vec<u8> {
        bufs.iter().flat_map(|b| b.as_slice().to_vec()).collect()
    }

    #[test]
    fn test_unbounded_exposes_everything() {
        let (a, b) = ([0u8, 1, 2, 3], [4u8, 5, 6, 7]);
        let mut bufs = [IoVec::from_slice(&a), IoVec::from_slice(&b)];
        let iovecs = IoVecs::unbounded(&mut bufs);
        assert_eq!(contents(iovecs.buffers()), (0..8).collect::<Vec<u8>>());
        assert!(iovecs.into_tail().is_empty());
    }

    #[test]
    fn test_bounded_at_buffer_boundary() {
        let (a, b) = ([0u8, 1, 2, 3], [4u8, 5, 6, 7]);
        let mut bufs = [IoVec::from_slice(&a), IoVec::from_slice(&b)];
        let iovecs = IoVecs::bounded(&mut bufs, 4);
        assert_eq!(contents(iovecs.buffers()), vec![0, 1, 2, 3]);
        assert_eq!(contents(iovecs.into_tail()), vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_bounded_mid_buffer() {
        let (a, b) = ([0u8, 1, 2, 3], [4u8, 5, 6, 7]);
        let mut bufs = [IoVec::from_slice(&a), IoVec::from_slice(&b)];
        let iovecs = IoVecs::bounded(&mut bufs, 6);
        assert_eq!(contents(iovecs.buffers()), vec![0, 1, 2, 3, 4, 5]);
        // the second half of the cut buffer must be restored in the tail
        assert_eq!(contents(iovecs.into_tail()), vec![6, 7]);
    }

    #[test]
    fn test_bound_larger_than_buffers() {
        let a = [0u8, 1, 2, 3];
        let mut bufs = [IoVec::from_slice(&a)];
        let iovecs = IoVecs::bounded(&mut bufs, 100);
        assert_eq!(contents(iovecs.buffers()), vec![0, 1, 2, 3]);
        assert!(iovecs.into_tail().is_empty());
    }

    #[test]
    fn test_advance_over_partial_writes() {
        let (a, b, c) = ([0u8, 1, 2], [3u8, 4, 5], [6u8, 7, 8]);
        let mut bufs = [
            IoVec::from_slice(&a),
            IoVec::from_slice(&b),
            IoVec::from_slice(&c),
        ];
        let mut iovecs = IoVecs::unbounded(&mut bufs);

        // a partial write covering the first buffer and part of the second
        iovecs.advance(4);
        assert_eq!(contents(iovecs.buffers()), vec![4, 5, 6, 7, 8]);

        // another partial write within the current front buffer
        iovecs.advance(1);
        assert_eq!(contents(iovecs.buffers()), vec![5, 6, 7, 8]);

        // consume the rest
        iovecs.advance(4);
        assert!(iovecs.buffers().is_empty());
    }

    #[test]
    #[should_panic(expected = "advanced past the end of the buffers")]
    fn test_advance_past_end_panics() {
        let a = [0u8, 1, 2];
        let mut bufs = [IoVec::from_slice(&a)];
        let mut iovecs = IoVecs::unbounded(&mut bufs);
        iovecs.advance(4);
    }

    #[test]
    fn test_advance_within_bounded_head() {
        let (a, b) = ([0u8, 1, 2, 3], [4u8, 5, 6, 7]);
        let mut bufs = [IoVec::from_slice(&a), IoVec::from_slice(&b)];
        let mut iovecs = IoVecs::bounded(&mut bufs, 6);

        // partially write into the cut buffer
        iovecs.advance(5);
        assert_eq!(contents(iovecs.buffers()), vec![5]);
        iovecs.advance(1);
        assert!(iovecs.buffers().is_empty());

        // the tail is unaffected by consumption of the head
        assert_eq!(contents(iovecs.into_tail()), vec![6, 7]);
    }
}
