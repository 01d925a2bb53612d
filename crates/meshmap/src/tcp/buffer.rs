use crate::{error::ProtocolError, wire::{LEN_PREFIX_SIZE, MAX_FRAME_PAYLOAD}};

/// Contiguous byte region with paired read and write cursors.
///
/// One instance serves as a session's inbound staging area (socket appends at
/// the write cursor, the framer consumes at the read cursor) and another as
/// its outbound area (producers frame entries at the write cursor, the socket
/// drains at the read cursor). Compaction preserves unread bytes at the
/// front. Capacity is `packet_size + max_entry_size`, so one maximum-size
/// entry can always be staged beyond a full packet's worth.
///
/// Frame-writer protocol: [`begin_frame`] reserves the two length-prefix
/// bytes, the externalizer stages the payload, [`end_frame`] backpatches the
/// unsigned-16 prefix. A zero-byte payload rewinds the reservation.
pub struct FramedBuf {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl FramedBuf {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: vec![0; capacity], read_pos: 0, write_pos: 0 }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn readable(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    #[inline]
    pub fn readable_len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    #[inline]
    pub fn writable(&mut self) -> &mut [u8] {
        let w = self.write_pos;
        &mut self.buf[w..]
    }

    #[inline]
    pub fn writable_len(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    #[inline]
    pub fn advance_read(&mut self, n: usize) {
        debug_assert!(n <= self.readable_len());
        self.read_pos += n;
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    #[inline]
    pub fn advance_write(&mut self, n: usize) {
        debug_assert!(n <= self.writable_len());
        self.write_pos += n;
    }

    /// Moves unread bytes to the front, reclaiming consumed space.
    pub fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        self.buf.copy_within(self.read_pos..self.write_pos, 0);
        self.write_pos -= self.read_pos;
        self.read_pos = 0;
    }

    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    #[inline]
    pub fn put_u8(&mut self, v: u8) {
        self.put_slice(&[v]);
    }

    #[inline]
    pub fn put_u16(&mut self, v: u16) {
        self.put_slice(&v.to_be_bytes());
    }

    #[inline]
    pub fn put_u64(&mut self, v: u64) {
        self.put_slice(&v.to_be_bytes());
    }

    /// Panics when the staged bytes exceed the remaining capacity; producers
    /// must respect the max-entry-size headroom contract.
    #[inline]
    pub fn put_slice(&mut self, src: &[u8]) {
        assert!(
            src.len() <= self.writable_len(),
            "staged {} bytes with only {} writable",
            src.len(),
            self.writable_len()
        );
        let w = self.write_pos;
        self.buf[w..w + src.len()].copy_from_slice(src);
        self.write_pos += src.len();
    }

    #[inline]
    pub fn take_u8(&mut self) -> Option<u8> {
        let v = *self.readable().first()?;
        self.advance_read(1);
        Some(v)
    }

    #[inline]
    pub fn take_u16(&mut self) -> Option<u16> {
        let bytes: [u8; 2] = self.readable().get(..2)?.try_into().ok()?;
        self.advance_read(2);
        Some(u16::from_be_bytes(bytes))
    }

    #[inline]
    pub fn take_u64(&mut self) -> Option<u64> {
        let bytes: [u8; 8] = self.readable().get(..8)?.try_into().ok()?;
        self.advance_read(8);
        Some(u64::from_be_bytes(bytes))
    }

    #[inline]
    pub(crate) fn write_pos(&self) -> usize {
        self.write_pos
    }

    /// Discards everything staged past `mark`.
    #[inline]
    pub(crate) fn rewind_write(&mut self, mark: usize) {
        debug_assert!(mark >= self.read_pos && mark <= self.write_pos);
        self.write_pos = mark;
    }

    /// Reserves the length prefix; returns the mark to pass to [`end_frame`].
    #[inline]
    pub fn begin_frame(&mut self) -> usize {
        let mark = self.write_pos;
        self.put_slice(&[0, 0]);
        mark
    }

    /// Backpatches the prefix reserved at `mark`. Returns `Ok(false)` and
    /// rewinds the reservation when nothing was staged (a declined entry).
    pub fn end_frame(&mut self, mark: usize, max_entry_size: usize) -> Result<bool, ProtocolError> {
        let payload = self.write_pos - mark - LEN_PREFIX_SIZE;
        if payload == 0 {
            self.rewind_write(mark);
            return Ok(false);
        }
        let max = max_entry_size.min(MAX_FRAME_PAYLOAD);
        if payload > max {
            self.rewind_write(mark);
            return Err(ProtocolError::EntryTooLarge { size: payload, max });
        }
        self.buf[mark..mark + LEN_PREFIX_SIZE].copy_from_slice(&(payload as u16).to_be_bytes());
        Ok(true)
    }
}

impl std::fmt::Debug for FramedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedBuf")
            .field("capacity", &self.buf.len())
            .field("read_pos", &self.read_pos)
            .field("write_pos", &self.write_pos)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_is_backpatched() {
        let mut buf = FramedBuf::with_capacity(64);
        let mark = buf.begin_frame();
        buf.put_slice(b"hello");
        assert!(buf.end_frame(mark, 32).unwrap());
        assert_eq!(buf.readable(), &[0, 5, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn declined_entry_rewinds_the_reservation() {
        let mut buf = FramedBuf::with_capacity(64);
        buf.put_u16(0xbeef);
        let before = buf.readable_len();
        let mark = buf.begin_frame();
        assert!(!buf.end_frame(mark, 32).unwrap());
        assert_eq!(buf.readable_len(), before);
    }

    #[test]
    fn oversized_entry_is_rejected_and_rewound() {
        let mut buf = FramedBuf::with_capacity(128);
        let mark = buf.begin_frame();
        buf.put_slice(&[0u8; 40]);
        let err = buf.end_frame(mark, 32).unwrap_err();
        assert_eq!(err, ProtocolError::EntryTooLarge { size: 40, max: 32 });
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_limit_boundary() {
        let mut buf = FramedBuf::with_capacity(70_000);
        let mark = buf.begin_frame();
        buf.put_slice(&vec![7u8; 65_535]);
        assert!(buf.end_frame(mark, 65_535).unwrap());
        assert_eq!(buf.readable()[..2], [0xff, 0xff]);

        let mut buf = FramedBuf::with_capacity(70_000);
        let mark = buf.begin_frame();
        buf.put_slice(&vec![7u8; 65_536]);
        assert!(matches!(
            buf.end_frame(mark, 65_535),
            Err(ProtocolError::EntryTooLarge { size: 65_536, .. })
        ));
    }

    #[test]
    fn compact_preserves_unread_bytes() {
        let mut buf = FramedBuf::with_capacity(8);
        buf.put_slice(&[1, 2, 3, 4, 5, 6]);
        buf.advance_read(4);
        assert_eq!(buf.writable_len(), 2);
        buf.compact();
        assert_eq!(buf.readable(), &[5, 6]);
        assert_eq!(buf.writable_len(), 6);
    }

    #[test]
    fn cursors_reset_when_fully_consumed() {
        let mut buf = FramedBuf::with_capacity(4);
        buf.put_slice(&[1, 2, 3, 4]);
        buf.advance_read(4);
        assert!(buf.is_empty());
        assert_eq!(buf.writable_len(), 4);
    }

    #[test]
    fn big_endian_accessors_roundtrip() {
        let mut buf = FramedBuf::with_capacity(32);
        buf.put_u8(9);
        buf.put_u16(0x1234);
        buf.put_u64(0x0102_0304_0506_0708);
        assert_eq!(buf.take_u8(), Some(9));
        assert_eq!(buf.take_u16(), Some(0x1234));
        assert_eq!(buf.take_u64(), Some(0x0102_0304_0506_0708));
        assert_eq!(buf.take_u8(), None);
    }

    #[test]
    fn partial_take_leaves_cursor_alone() {
        let mut buf = FramedBuf::with_capacity(8);
        buf.put_u8(1);
        assert_eq!(buf.take_u16(), None);
        assert_eq!(buf.readable_len(), 1);
    }
}
