//! Reference-counted, copy-on-write byte buffer, ported from
//! `copy_on_write_buffer.hpp`.
//!
//! `RtpPacketReceived` payloads and the bitstream a `PacketBuffer` is
//! assembling are both shared between components (the packet buffer holds
//! one reference while an emitted `AssembledFrame` holds another); any
//! mutator that observes a shared (`Arc::strong_count() > 1`) buffer clones
//! before writing, via [`Arc::make_mut`].

use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CowBuffer {
    inner: Arc<Vec<u8>>,
}

impl CowBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            inner: Arc::new(bytes.to_vec()),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Number of live references to the underlying storage. A value of `1`
    /// means the next mutation is free (no clone needed).
    pub fn share_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Mutable access; clones the backing storage first if it is shared.
    pub fn make_mut(&mut self) -> &mut Vec<u8> {
        Arc::make_mut(&mut self.inner)
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.make_mut().extend_from_slice(bytes);
    }

    pub fn push(&mut self, byte: u8) {
        self.make_mut().push(byte);
    }

    pub fn clear(&mut self) {
        self.make_mut().clear();
    }

    pub fn into_vec(self) -> Vec<u8> {
        Arc::try_unwrap(self.inner).unwrap_or_else(|shared| (*shared).clone())
    }
}

impl From<Vec<u8>> for CowBuffer {
    fn from(v: Vec<u8>) -> Self {
        Self { inner: Arc::new(v) }
    }
}

impl std::ops::Deref for CowBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_on_unshared_buffer_reuses_the_same_allocation() {
        let mut buf = CowBuffer::with_capacity(8);
        buf.extend_from_slice(&[1, 2, 3]);
        let ptr_before = buf.as_slice().as_ptr();
        buf.push(4);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4]);
        // Unshared (strong_count == 1) and within capacity: no clone, no
        // reallocation, same backing pointer.
        assert_eq!(ptr_before, buf.as_slice().as_ptr());
    }

    #[test]
    fn mutation_on_shared_buffer_clones_before_writing() {
        let mut a = CowBuffer::from_slice(&[1, 2, 3]);
        let b = a.clone();
        assert_eq!(a.share_count(), 2);

        a.push(4);

        assert_eq!(a.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(b.as_slice(), &[1, 2, 3]);
        assert_eq!(a.share_count(), 1);
        assert_eq!(b.share_count(), 1);
    }
}
