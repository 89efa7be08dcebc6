//! Incremental frame reassembly for arbitrarily fragmented byte streams.
//!
//! TCP delivers a byte stream, not messages. [`MessageReassembler`] keeps every
//! byte that has not been consumed yet in an ordered backlog, parses length
//! headers once they are complete, and fills one [`PendingMessage`] at a time.
//! Completed payloads are handed out in arrival order, whatever the size of
//! the chunks that were fed in.

use std::collections::VecDeque;

use crate::framing::{FrameError, LONG_LENGTH_BYTES, decode_length, header_len};

/// Payload buffer of the frame currently being filled.
#[derive(Debug)]
pub struct PendingMessage {
    data: Vec<u8>,
    target: usize,
}

impl PendingMessage {
    /// Create an empty message expecting `target` payload bytes.
    ///
    /// The buffer grows with the data actually received so a peer cannot make
    /// us reserve the full declared length up front.
    pub fn new(target: usize) -> Self {
        Self {
            data: Vec::new(),
            target,
        }
    }

    /// Move as many bytes as this message still needs from the front of
    /// `backlog`. Returns the number of bytes taken.
    pub fn fill_from(&mut self, backlog: &mut VecDeque<u8>) -> usize {
        let take = self.missing_bytes().min(backlog.len());
        self.data.extend(backlog.drain(..take));
        take
    }

    /// Bytes still required before the message is complete.
    pub fn missing_bytes(&self) -> usize {
        self.target - self.data.len()
    }

    /// Whether all declared payload bytes have arrived.
    pub fn is_complete(&self) -> bool {
        self.data.len() == self.target
    }

    /// Declared payload length.
    pub fn target_len(&self) -> usize {
        self.target
    }

    /// Consume the message and return its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.data
    }
}

/// Turns a fragmented byte stream into complete frame payloads.
///
/// One reassembler belongs to exactly one connection's read path; it needs no
/// locking of its own.
#[derive(Debug, Default)]
pub struct MessageReassembler {
    backlog: VecDeque<u8>,
    pending: Option<PendingMessage>,
    poisoned: bool,
}

impl MessageReassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` to the backlog and call `on_frame` for every frame that
    /// completes, in order.
    ///
    /// An oversized or negative length header poisons the reassembler: the
    /// error is returned now and on every later call, because a
    /// length-prefixed stream has no point to resynchronize on.
    pub fn feed_with<F>(&mut self, bytes: &[u8], mut on_frame: F) -> Result<(), FrameError>
    where
        F: FnMut(Vec<u8>),
    {
        if self.poisoned {
            return Err(FrameError::StreamCorrupted);
        }

        self.backlog.extend(bytes);

        loop {
            if self.pending.is_none() {
                match self.take_header() {
                    Ok(Some(len)) => self.pending = Some(PendingMessage::new(len)),
                    Ok(None) => return Ok(()),
                    Err(e) => {
                        self.poisoned = true;
                        self.backlog.clear();
                        return Err(e);
                    }
                }
            }

            let Some(pending) = self.pending.as_mut() else {
                return Ok(());
            };
            pending.fill_from(&mut self.backlog);

            if !pending.is_complete() {
                return Ok(());
            }
            if let Some(done) = self.pending.take() {
                on_frame(done.into_payload());
            }
        }
    }

    /// Feed `bytes` and collect the frames they complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        let mut frames = Vec::new();
        self.feed_with(bytes, |frame| frames.push(frame))?;
        Ok(frames)
    }

    /// Number of received bytes not yet consumed by a header or payload.
    pub fn buffered_len(&self) -> usize {
        self.backlog.len()
    }

    /// Whether a frame header has been read and its payload is still filling.
    pub fn has_pending_message(&self) -> bool {
        self.pending.is_some()
    }

    /// Bytes missing from the pending frame, or 0 if none is active.
    pub fn missing_bytes(&self) -> usize {
        self.pending.as_ref().map_or(0, PendingMessage::missing_bytes)
    }

    /// Whether a framing error has made this stream unusable.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Parse a header from the front of the backlog. Bytes are only consumed
    /// once the whole header is present.
    fn take_header(&mut self) -> Result<Option<usize>, FrameError> {
        let Some(&first) = self.backlog.front() else {
            return Ok(None);
        };
        let needed = header_len(first);
        if self.backlog.len() < needed {
            return Ok(None);
        }

        let long_length = if needed > 1 {
            let mut len_buf = [0u8; LONG_LENGTH_BYTES];
            for (slot, byte) in len_buf.iter_mut().zip(self.backlog.iter().skip(1)) {
                *slot = *byte;
            }
            Some(len_buf)
        } else {
            None
        };

        let len = decode_length(first, long_length)?;
        self.backlog.drain(..needed);
        Ok(Some(len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{LONG_LENGTH_SENTINEL, MAX_MESSAGE_LENGTH, encode_frame};

    fn test_bytes_with_length_header(len: usize) -> Vec<u8> {
        let payload: Vec<u8> = (0..len).map(|i| (100 + i) as u8).collect();
        encode_frame(&payload).unwrap()
    }

    fn three_message_stream() -> Vec<u8> {
        let mut stream = Vec::new();
        stream.extend(test_bytes_with_length_header(6));
        stream.extend(test_bytes_with_length_header(4));
        stream.extend(test_bytes_with_length_header(10));
        assert_eq!(stream.len(), 6 + 4 + 10 + 3);
        stream
    }

    fn feed_in_chunks(stream: &[u8], splits: &[usize]) -> Vec<Vec<u8>> {
        let mut reassembler = MessageReassembler::new();
        let mut frames = Vec::new();
        let mut offset = 0;
        for &size in splits {
            let end = (offset + size).min(stream.len());
            frames.extend(reassembler.feed(&stream[offset..end]).unwrap());
            offset = end;
        }
        if offset < stream.len() {
            frames.extend(reassembler.feed(&stream[offset..]).unwrap());
        }
        frames
    }

    fn feed_in_fixed_chunks(stream: &[u8], chunk: usize) -> Vec<Vec<u8>> {
        let mut reassembler = MessageReassembler::new();
        let mut frames = Vec::new();
        for piece in stream.chunks(chunk) {
            frames.extend(reassembler.feed(piece).unwrap());
        }
        assert_eq!(reassembler.buffered_len(), 0);
        assert!(!reassembler.has_pending_message());
        frames
    }

    #[test]
    fn test_collect_three_messages_from_uneven_chunks() {
        let frames = feed_in_chunks(&three_message_stream(), &[7, 7, 8, 1]);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].len(), 6);
        assert_eq!(frames[1].len(), 4);
        assert_eq!(frames[2].len(), 10);
    }

    #[test]
    fn test_fragmentation_does_not_change_output() {
        let mut stream = three_message_stream();
        stream.extend(test_bytes_with_length_header(300));
        stream.extend(test_bytes_with_length_header(0));
        stream.extend(test_bytes_with_length_header(254));

        let all_at_once = feed_in_fixed_chunks(&stream, stream.len());
        assert_eq!(all_at_once.len(), 6);

        for chunk in [1, 2, 5, 7, 11, 255, 304] {
            assert_eq!(
                feed_in_fixed_chunks(&stream, chunk),
                all_at_once,
                "chunk size {chunk} produced different frames"
            );
        }
    }

    #[test]
    fn test_frame_spanning_many_feeds() {
        let stream = test_bytes_with_length_header(1000);
        let mut reassembler = MessageReassembler::new();

        assert!(reassembler.feed(&stream[..1]).unwrap().is_empty());
        assert!(!reassembler.has_pending_message(), "Header is still incomplete");
        assert_eq!(reassembler.buffered_len(), 1);

        assert!(reassembler.feed(&stream[1..5]).unwrap().is_empty());
        assert!(reassembler.has_pending_message());
        assert_eq!(reassembler.missing_bytes(), 1000);

        assert!(reassembler.feed(&stream[5..600]).unwrap().is_empty());
        assert_eq!(reassembler.missing_bytes(), 405);

        let frames = reassembler.feed(&stream[600..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], stream[5..]);
    }

    #[test]
    fn test_partial_long_header_keeps_bytes() {
        let stream = test_bytes_with_length_header(400);
        let mut reassembler = MessageReassembler::new();

        reassembler.feed(&stream[..3]).unwrap();
        assert_eq!(reassembler.buffered_len(), 3, "No header byte may be dropped");

        let frames = reassembler.feed(&stream[3..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 400);
    }

    #[test]
    fn test_feed_with_reports_frames_in_order() {
        let mut stream = Vec::new();
        for text in ["A", "B", "C"] {
            stream.extend(encode_frame(text.as_bytes()).unwrap());
        }
        let mut seen = Vec::new();
        let mut reassembler = MessageReassembler::new();
        reassembler
            .feed_with(&stream, |frame| seen.push(String::from_utf8(frame).unwrap()))
            .unwrap();
        assert_eq!(seen, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_oversize_declaration_is_fatal() {
        let mut header = vec![LONG_LENGTH_SENTINEL];
        header.extend_from_slice(&(MAX_MESSAGE_LENGTH as i32 + 1).to_le_bytes());

        let mut reassembler = MessageReassembler::new();
        let result = reassembler.feed(&header);
        assert!(matches!(
            result,
            Err(FrameError::MessageTooLarge { size: 134_217_729, .. })
        ));
        assert!(reassembler.is_poisoned());
        assert_eq!(reassembler.buffered_len(), 0);

        let later = reassembler.feed(&encode_frame(b"ok").unwrap());
        assert!(
            matches!(later, Err(FrameError::StreamCorrupted)),
            "A poisoned stream must not resynchronize"
        );
    }

    #[test]
    fn test_pending_message_fill() {
        let mut backlog: VecDeque<u8> = (1..=10).collect();
        let mut pending = PendingMessage::new(4);
        assert_eq!(pending.fill_from(&mut backlog), 4);
        assert!(pending.is_complete());
        assert_eq!(backlog.len(), 6);
        assert_eq!(pending.into_payload(), vec![1, 2, 3, 4]);
    }
}
