//! Length-prefixed multipart framing for TCP messages.
//!
//! Wire format: `[u32 frame count]` then, per frame, `[u32 length][bytes]`.
//! All integers are big-endian.

use std::io::{self, Read, Write};
use std::ops::Range;

/// Upper bound on frames per message.
pub const MAX_FRAMES: usize = 16;

/// Messages with more than [`MAX_FRAMES`] frames, up to this many, are
/// skipped by [`MultipartReader`]. Beyond it the stream is treated as corrupt.
pub const MAX_SKIPPABLE_FRAMES: usize = 4096;

/// Upper bound on a single frame: 64 MiB.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// One message: an ordered list of opaque frames.
pub type Multipart = Vec<Vec<u8>>;

/// Encode a multipart message into a single buffer.
pub fn encode_multipart<F: AsRef<[u8]>>(frames: &[F]) -> io::Result<Vec<u8>> {
    if frames.len() > MAX_FRAMES {
        return Err(invalid(format!("too many frames: {}", frames.len())));
    }

    let body: usize = frames.iter().map(|f| 4 + f.as_ref().len()).sum();
    let mut buf = Vec::with_capacity(4 + body);
    buf.extend_from_slice(&(frames.len() as u32).to_be_bytes());
    for frame in frames {
        let frame = frame.as_ref();
        if frame.len() > MAX_FRAME_LEN {
            return Err(invalid(format!("frame too large: {} bytes", frame.len())));
        }
        buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buf.extend_from_slice(frame);
    }
    Ok(buf)
}

/// Write a multipart message to a stream.
pub fn write_multipart<W: Write, F: AsRef<[u8]>>(writer: &mut W, frames: &[F]) -> io::Result<()> {
    let buf = encode_multipart(frames)?;
    writer.write_all(&buf)?;
    writer.flush()
}

/// Read one multipart message from a blocking stream.
pub fn read_multipart<R: Read>(reader: &mut R) -> io::Result<Multipart> {
    let count = read_len(reader)?;
    if count > MAX_FRAMES {
        return Err(invalid(format!("too many frames: {}", count)));
    }

    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let len = read_len(reader)?;
        if len > MAX_FRAME_LEN {
            return Err(invalid(format!("frame too large: {} bytes", len)));
        }
        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame)?;
        frames.push(frame);
    }
    Ok(frames)
}

fn read_len<R: Read>(reader: &mut R) -> io::Result<usize> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    Ok(u32::from_be_bytes(len_buf) as usize)
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// True for the error kinds a socket read timeout produces.
pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Incremental multipart decoder for sockets with a read timeout.
///
/// A timeout in the middle of a message keeps the partial bytes buffered, so
/// the next call resumes where the last one stopped. Well-formed messages
/// carrying too many frames are consumed and dropped; see [`skipped`].
///
/// [`skipped`]: MultipartReader::skipped
pub struct MultipartReader<R> {
    inner: R,
    buf: Vec<u8>,
    skipped: usize,
}

impl<R: Read> MultipartReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            skipped: 0,
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Number of over-long messages dropped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Read until one message is complete or the underlying read times out.
    ///
    /// Returns `Ok(None)` on timeout and `UnexpectedEof` when the peer closed.
    pub fn poll_message(&mut self) -> io::Result<Option<Multipart>> {
        let mut chunk = [0u8; 8192];
        loop {
            if let Some(message) = self.try_decode()? {
                return Ok(Some(message));
            }
            match self.inner.read(&mut chunk) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if is_timeout(&e) => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn try_decode(&mut self) -> io::Result<Option<Multipart>> {
        loop {
            let Some(count) = peek_len(&self.buf, 0) else {
                return Ok(None);
            };
            if count > MAX_SKIPPABLE_FRAMES {
                return Err(invalid(format!("too many frames: {}", count)));
            }
            let Some(spans) = frame_spans(&self.buf, count)? else {
                return Ok(None);
            };
            let end = spans.last().map_or(4, |span| span.end);

            if count > MAX_FRAMES {
                self.buf.drain(..end);
                self.skipped += 1;
                continue;
            }

            let frames: Multipart = spans.into_iter().map(|span| self.buf[span].to_vec()).collect();
            self.buf.drain(..end);
            return Ok(Some(frames));
        }
    }
}

/// Byte ranges of the `count` frames following the header at the start of
/// `buf`, or `None` while the message is still incomplete.
fn frame_spans(buf: &[u8], count: usize) -> io::Result<Option<Vec<Range<usize>>>> {
    let mut offset = 4;
    let mut spans = Vec::with_capacity(count.min(MAX_FRAMES));
    for _ in 0..count {
        let Some(len) = peek_len(buf, offset) else {
            return Ok(None);
        };
        if len > MAX_FRAME_LEN {
            return Err(invalid(format!("frame too large: {} bytes", len)));
        }
        offset += 4;
        if buf.len() < offset + len {
            return Ok(None);
        }
        spans.push(offset..offset + len);
        offset += len;
    }
    Ok(Some(spans))
}

fn peek_len(buf: &[u8], at: usize) -> Option<usize> {
    let bytes: [u8; 4] = buf.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Hands out at most `step` bytes per read, then reports a timeout once.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
        timed_out: bool,
    }

    impl Read for Trickle {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            if !self.timed_out {
                self.timed_out = true;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.timed_out = false;
            let end = (self.pos + self.step).min(self.data.len());
            let n = (end - self.pos).min(out.len());
            out[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn blocking_roundtrip() {
        let mut buf = Vec::new();
        write_multipart(&mut buf, &[b"/scene/cube".as_slice(), b"\x01\x02".as_slice()]).unwrap();

        let mut cursor = Cursor::new(buf);
        let frames = read_multipart(&mut cursor).unwrap();
        assert_eq!(frames, vec![b"/scene/cube".to_vec(), vec![1, 2]]);
    }

    #[test]
    fn empty_frames_survive() {
        let buf = encode_multipart(&[Vec::<u8>::new(), vec![7]]).unwrap();
        let frames = read_multipart(&mut Cursor::new(buf)).unwrap();
        assert_eq!(frames, vec![vec![], vec![7]]);
    }

    #[test]
    fn rejects_too_many_frames() {
        let frames = vec![vec![0u8]; MAX_FRAMES + 1];
        assert!(encode_multipart(&frames).is_err());

        let mut bogus = Vec::new();
        bogus.extend_from_slice(&((MAX_FRAMES as u32) + 1).to_be_bytes());
        let err = read_multipart(&mut Cursor::new(bogus)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn incremental_reader_resumes_after_timeouts() {
        let mut data = encode_multipart(&[b"/a/location".as_slice(), b"xyz".as_slice()]).unwrap();
        data.extend(encode_multipart(&[b">PUB".as_slice(), b"p".as_slice()]).unwrap());
        let mut reader = MultipartReader::new(Trickle {
            data,
            pos: 0,
            step: 3,
            timed_out: false,
        });

        let mut messages = Vec::new();
        for _ in 0..200 {
            match reader.poll_message() {
                Ok(Some(m)) => messages.push(m),
                Ok(None) => {}
                Err(e) => {
                    assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);
                    break;
                }
            }
        }

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0][0], b"/a/location".to_vec());
        assert_eq!(messages[1][0], b">PUB".to_vec());
    }

    /// Encodes without the frame-count check, like a foreign peer might.
    fn raw_message(frames: &[&[u8]]) -> Vec<u8> {
        let mut buf = (frames.len() as u32).to_be_bytes().to_vec();
        for frame in frames {
            buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
            buf.extend_from_slice(frame);
        }
        buf
    }

    #[test]
    fn incremental_reader_skips_overlong_messages() {
        let wide = vec![b"x".as_slice(); MAX_FRAMES + 1];
        let mut data = raw_message(&wide);
        data.extend(encode_multipart(&[b"/a/value".as_slice(), b"1".as_slice()]).unwrap());
        let mut reader = MultipartReader::new(Trickle {
            data,
            pos: 0,
            step: 5,
            timed_out: false,
        });

        let mut messages = Vec::new();
        for _ in 0..200 {
            match reader.poll_message() {
                Ok(Some(m)) => messages.push(m),
                Ok(None) => {}
                Err(e) => {
                    assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);
                    break;
                }
            }
        }

        assert_eq!(messages, vec![vec![b"/a/value".to_vec(), b"1".to_vec()]]);
        assert_eq!(reader.skipped(), 1);
    }

    #[test]
    fn incremental_reader_rejects_absurd_frame_count() {
        let header = ((MAX_SKIPPABLE_FRAMES as u32) + 1).to_be_bytes().to_vec();
        let mut reader = MultipartReader::new(Cursor::new(header));
        let err = reader.poll_message().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn incremental_reader_reports_eof() {
        let mut reader = MultipartReader::new(Cursor::new(Vec::<u8>::new()));
        let err = reader.poll_message().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
