//! Frame codec: delimits and validates host↔radio frames on a raw byte stream.
//!
//! Wire format: `0x94 0xC3 <len_msb> <len_lsb> <payload...>`, `len <= 512`.
//! The decoder is a stateful feed over arbitrary-sized chunks; it never
//! assumes chunk boundaries line up with frame boundaries, and resyncs past
//! garbage bytes by scanning for the next magic pair.

use crate::error::{CoreError, CoreResult, MAX_PAYLOAD_LEN};

const MAGIC_0: u8 = 0x94;
const MAGIC_1: u8 = 0xC3;
const HEADER_LEN: usize = 4;

/// Prepend the magic+length header to a payload. Fails synchronously if the
/// payload is over budget; nothing is partially written.
pub fn encode(payload: &[u8]) -> CoreResult<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(CoreError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(MAGIC_0);
    frame.push(MAGIC_1);
    frame.push((payload.len() >> 8) as u8);
    frame.push((payload.len() & 0xFF) as u8);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Incremental decoder over a single input byte stream. Not safe to share
/// across concurrent feeds — the spec requires a single serialized stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of freshly-arrived bytes, returning every complete
    /// payload it completes, in on-wire order. Bytes preceding the next
    /// magic pair are silently discarded (resynchronization); an
    /// over-budget declared length drops the in-progress frame and resumes
    /// scanning for the next magic pair.
    pub fn decode_stream(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        loop {
            // Resync: drop bytes until we see the magic pair at index 0. A
            // lone trailing MAGIC_0 byte isn't garbage yet — it may pair with
            // MAGIC_1 at the start of the next chunk — so it's kept buffered
            // instead of being discarded with the rest.
            let Some(start) = find_magic(&self.buf) else {
                if self.buf.last() == Some(&MAGIC_0) {
                    let last = self.buf.len() - 1;
                    self.buf.drain(0..last);
                } else {
                    self.buf.clear();
                }
                break;
            };
            if start > 0 {
                self.buf.drain(0..start);
            }

            if self.buf.len() < HEADER_LEN {
                break;
            }
            let len = ((self.buf[2] as usize) << 8) | (self.buf[3] as usize);

            if len > MAX_PAYLOAD_LEN {
                // Drop the bogus header and keep scanning past it.
                self.buf.drain(0..2);
                continue;
            }

            if self.buf.len() < HEADER_LEN + len {
                break;
            }

            let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
            self.buf.drain(0..HEADER_LEN + len);
            out.push(payload);
        }

        out
    }
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w[0] == MAGIC_0 && w[1] == MAGIC_1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_single_frame() {
        let payload = b"hello".to_vec();
        let frame = encode(&payload).unwrap();
        let mut decoder = FrameDecoder::new();
        let out = decoder.decode_stream(&frame);
        assert_eq!(out, vec![payload]);
    }

    #[test]
    fn rejects_oversize_payload_on_encode() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(matches!(encode(&payload), Err(CoreError::PayloadTooLarge { .. })));
    }

    #[test]
    fn discards_garbage_before_resyncing() {
        let payload = b"abc".to_vec();
        let frame = encode(&payload).unwrap();
        let mut noisy = vec![0x00, 0x11, 0x94, 0x22]; // stray magic-0 byte, no match
        noisy.extend_from_slice(&frame);

        let mut decoder = FrameDecoder::new();
        let out = decoder.decode_stream(&noisy);
        assert_eq!(out, vec![payload]);
    }

    #[test]
    fn splits_frames_across_chunk_boundaries() {
        let payload = b"split-me".to_vec();
        let frame = encode(&payload).unwrap();
        let mut decoder = FrameDecoder::new();

        let mut out = Vec::new();
        for byte in &frame {
            out.extend(decoder.decode_stream(&[*byte]));
        }
        assert_eq!(out, vec![payload]);
    }

    #[test]
    fn drops_in_progress_frame_when_declared_length_is_over_budget() {
        let mut bogus = vec![MAGIC_0, MAGIC_1, 0xFF, 0xFF]; // len = 65535
        let good_payload = b"recovered".to_vec();
        bogus.extend_from_slice(&encode(&good_payload).unwrap());

        let mut decoder = FrameDecoder::new();
        let out = decoder.decode_stream(&bogus);
        assert_eq!(out, vec![good_payload]);
    }

    #[test]
    fn emits_multiple_frames_from_one_chunk_in_order() {
        let a = encode(b"one").unwrap();
        let b = encode(b"two").unwrap();
        let mut combined = a.clone();
        combined.extend_from_slice(&b);

        let mut decoder = FrameDecoder::new();
        let out = decoder.decode_stream(&combined);
        assert_eq!(out, vec![b"one".to_vec(), b"two".to_vec()]);
    }
}
