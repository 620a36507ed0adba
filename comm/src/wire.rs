//! Message envelope and wire framing.
//!
//! Every frame on a plexus connection is one [`Message`]: routing header
//! followed by a list of length-prefixed opaque parts.
//!
//! ## Wire format
//!
//! All integers little-endian:
//!
//! ```text
//! [src: i64][dst: i64][channel: i32][part_count: u16]
//! { [len: u64][bytes: len] } * part_count
//! ```
//!
//! A `len == 0` part decodes to an empty buffer. `src == -1` flags a
//! *system command*: `channel` is then a command id and the first part the
//! command's argument bytes.

use {
    crate::error::{CommError, Result},
    std::io::{Read, Write},
};

/// Sentinel `src`/`dst` value marking a system command frame.
pub const SYS_COMMAND: i64 = -1;

/// Fixed size of the frame header (src + dst + channel + part count).
pub const HEADER_LEN: usize = 8 + 8 + 4 + 2;

// ── Cursor codec ────────────────────────────────────────────────────────────

/// Append-only buffer encoder with explicit write methods.
///
/// Replaces pointer-offset arithmetic with a cursor the codec owns; the
/// same methods serve every frame producer in the crate.
#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    /// Create an empty encoder.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Create an encoder with preallocated capacity.
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    /// Append a `u16`.
    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a `u64`.
    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Append an `i32`.
    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Append an `i64`.
    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Append raw bytes with no length prefix.
    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Append a `u64` length prefix followed by the bytes.
    pub fn write_len_bytes(&mut self, v: &[u8]) {
        self.write_u64(v.len() as u64);
        self.write_bytes(v);
    }

    /// Consume the encoder, yielding the buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Bounds-checked cursor decoder over a byte slice.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Wrap a byte slice for decoding.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                CommError::MalformedFrame(format!(
                    "need {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    /// Read a `u16`.
    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    /// Read a `u64`.
    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Read an `i32`.
    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    /// Read an `i64`.
    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Read exactly `n` raw bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Read a `u64` length prefix followed by that many bytes.
    pub fn read_len_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u64()? as usize;
        self.take(len)
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }
}

// ── Message ─────────────────────────────────────────────────────────────────

/// One routed message: header plus an ordered list of opaque byte parts.
///
/// Consumption is cursor-based: [`Message::rewind`] then repeated
/// [`Message::next_part`] calls, mirroring how producers pushed the parts.
/// `Clone` yields the deep copy used for cross-thread fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Full node id of the sender, or [`SYS_COMMAND`].
    pub src: i64,
    /// Full node id of the destination, or [`SYS_COMMAND`].
    pub dst: i64,
    /// Application channel, or a command id for system commands.
    pub channel: i32,
    parts: Vec<Vec<u8>>,
    cursor: usize,
}

impl Message {
    /// Create an empty message on the given channel.
    pub fn new(channel: i32) -> Self {
        Self {
            src: 0,
            dst: 0,
            channel,
            parts: Vec::new(),
            cursor: 0,
        }
    }

    /// Create a message with one payload part.
    pub fn with_payload(src: i64, dst: i64, channel: i32, data: Vec<u8>) -> Self {
        let mut m = Self::new(channel);
        m.src = src;
        m.dst = dst;
        m.push(data);
        m
    }

    /// Create a system command frame carrying one argument part.
    pub fn command(cmd_id: i32, params: &[u8]) -> Self {
        let mut m = Self::new(cmd_id);
        m.src = SYS_COMMAND;
        m.dst = SYS_COMMAND;
        m.push(params.to_vec());
        m
    }

    /// True when this frame is a system command rather than node traffic.
    pub fn is_sys_command(&self) -> bool {
        self.src == SYS_COMMAND
    }

    /// Append an owned byte part.
    pub fn push(&mut self, data: Vec<u8>) {
        self.parts.push(data);
    }

    /// Append a UTF-8 string part.
    pub fn push_str(&mut self, s: &str) {
        self.parts.push(s.as_bytes().to_vec());
    }

    /// Number of parts.
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// True when the message carries no parts.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Sum of all part sizes in bytes.
    pub fn total_size(&self) -> usize {
        self.parts.iter().map(Vec::len).sum()
    }

    /// Reset the consumption cursor to the first part.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Consume and return the next part.
    pub fn next_part(&mut self) -> Result<&[u8]> {
        let i = self.cursor;
        if i >= self.parts.len() {
            return Err(CommError::PartOverflow);
        }
        self.cursor = i + 1;
        Ok(&self.parts[i])
    }

    /// Consume the next part as UTF-8 text, tolerating a trailing NUL.
    pub fn next_str(&mut self) -> Result<&str> {
        let i = self.cursor;
        if i >= self.parts.len() {
            return Err(CommError::PartOverflow);
        }
        self.cursor = i + 1;
        let s = std::str::from_utf8(&self.parts[i])
            .map_err(|e| CommError::MalformedFrame(format!("non-utf8 part: {e}")))?;
        Ok(s.trim_end_matches('\0'))
    }

    /// Borrow a part without advancing the cursor.
    pub fn part(&self, i: usize) -> Option<&[u8]> {
        self.parts.get(i).map(Vec::as_slice)
    }

    // ── Framing ─────────────────────────────────────────────────────────

    /// Encode the full frame to bytes.
    ///
    /// The part count travels as a `u16`; a message with more parts than
    /// that can carry is rejected rather than truncated into a frame that
    /// would desynchronize the stream.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let nb_parts = u16::try_from(self.parts.len()).map_err(|_| {
            CommError::MalformedFrame(format!("{} parts exceed the frame limit", self.parts.len()))
        })?;
        let mut enc = Encoder::with_capacity(HEADER_LEN.saturating_add(self.total_size()));
        enc.write_i64(self.src);
        enc.write_i64(self.dst);
        enc.write_i32(self.channel);
        enc.write_u16(nb_parts);
        for part in &self.parts {
            enc.write_len_bytes(part);
        }
        Ok(enc.into_bytes())
    }

    /// Decode a full frame from bytes. Inverse of [`Message::encode`].
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(data);
        let src = dec.read_i64()?;
        let dst = dec.read_i64()?;
        let channel = dec.read_i32()?;
        let nb_parts = dec.read_u16()?;
        let mut parts = Vec::with_capacity(nb_parts as usize);
        for _ in 0..nb_parts {
            parts.push(dec.read_len_bytes()?.to_vec());
        }
        Ok(Self {
            src,
            dst,
            channel,
            parts,
            cursor: 0,
        })
    }

    /// Write the frame to a byte stream.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.encode()?)?;
        w.flush()?;
        Ok(())
    }

    /// Read one frame from a byte stream, blocking until complete.
    ///
    /// A clean EOF on the header boundary surfaces as
    /// [`CommError::ConnectionClosed`]; part sizes are validated against
    /// `max_frame_size` before allocation.
    pub fn read_from<R: Read>(r: &mut R, max_frame_size: usize) -> Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        read_exact_or_closed(r, &mut header)?;
        let mut dec = Decoder::new(&header);
        let src = dec.read_i64()?;
        let dst = dec.read_i64()?;
        let channel = dec.read_i32()?;
        let nb_parts = dec.read_u16()?;

        let mut parts = Vec::with_capacity(nb_parts as usize);
        for _ in 0..nb_parts {
            let mut len_buf = [0u8; 8];
            read_exact_or_closed(r, &mut len_buf)?;
            let len = u64::from_le_bytes(len_buf) as usize;
            if len > max_frame_size {
                return Err(CommError::FrameTooLarge {
                    size: len,
                    max: max_frame_size,
                });
            }
            let mut part = vec![0u8; len];
            if len > 0 {
                read_exact_or_closed(r, &mut part)?;
            }
            parts.push(part);
        }
        Ok(Self {
            src,
            dst,
            channel,
            parts,
            cursor: 0,
        })
    }
}

fn read_exact_or_closed<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    match r.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(CommError::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_parts() {
        let mut m = Message::new(7);
        m.src = (3i64 << 32) | 1;
        m.dst = (4i64 << 32) | 9;
        m.push(vec![1, 2, 3]);
        m.push(Vec::new());
        m.push_str("hello");
        let decoded = Message::decode(&m.encode().unwrap()).unwrap();
        assert_eq!(decoded, m);
        assert_eq!(decoded.part(1).unwrap(), &[] as &[u8]);
    }

    #[test]
    fn test_roundtrip_empty() {
        let m = Message::new(0);
        let decoded = Message::decode(&m.encode().unwrap()).unwrap();
        assert_eq!(decoded.part_count(), 0);
        assert_eq!(decoded, m);
    }

    #[test]
    fn test_roundtrip_many_sizes() {
        for sizes in [vec![0usize], vec![1, 0, 1024], vec![65_537, 3]] {
            let mut m = Message::new(-5);
            m.src = 12;
            m.dst = 13;
            for (i, n) in sizes.iter().enumerate() {
                m.push(vec![i as u8; *n]);
            }
            let decoded = Message::decode(&m.encode().unwrap()).unwrap();
            assert_eq!(decoded, m);
        }
    }

    #[test]
    fn test_stream_roundtrip() {
        let mut m = Message::with_payload(1, 2, 3, vec![9; 100]);
        m.push_str("tail");
        let bytes = m.encode().unwrap();
        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = Message::read_from(&mut cursor, 1 << 20).unwrap();
        assert_eq!(decoded, m);
    }

    #[test]
    fn test_sys_command_flag() {
        let m = Message::command(4, b"payload");
        assert!(m.is_sys_command());
        assert_eq!(m.channel, 4);
        let mut decoded = Message::decode(&m.encode().unwrap()).unwrap();
        assert!(decoded.is_sys_command());
        assert_eq!(decoded.next_str().unwrap(), "payload");
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let m = Message::with_payload(1, 2, 3, vec![0; 64]);
        let bytes = m.encode().unwrap();
        assert!(Message::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_oversized_part_rejected() {
        let m = Message::with_payload(1, 2, 3, vec![0; 128]);
        let bytes = m.encode().unwrap();
        let mut cursor = std::io::Cursor::new(bytes);
        let err = Message::read_from(&mut cursor, 16).unwrap_err();
        assert!(matches!(err, CommError::FrameTooLarge { size: 128, .. }));
    }

    #[test]
    fn test_cursor_overflow() {
        let mut m = Message::with_payload(0, 0, 0, vec![1]);
        m.next_part().unwrap();
        assert!(matches!(m.next_part(), Err(CommError::PartOverflow)));
        m.rewind();
        assert!(m.next_part().is_ok());
    }

    #[test]
    fn test_decoder_bounds() {
        let mut dec = Decoder::new(&[1, 0]);
        assert_eq!(dec.read_u16().unwrap(), 1);
        assert!(dec.read_u64().is_err());
    }

    #[test]
    fn test_too_many_parts_rejected() {
        let mut m = Message::new(0);
        for _ in 0..=u16::MAX as usize {
            m.push(Vec::new());
        }
        assert!(matches!(m.encode(), Err(CommError::MalformedFrame(_))));
        let mut sink = Vec::new();
        assert!(m.write_to(&mut sink).is_err());
        assert!(sink.is_empty());

        let mut ok = Message::new(0);
        ok.push(vec![1]);
        assert!(ok.encode().is_ok());
    }
}
