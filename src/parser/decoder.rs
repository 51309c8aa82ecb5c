use serde::Serialize;

use crate::format::token::{decode_header, MemoryEvent, Token};
use crate::format::{ByteReader, ReadError};
use crate::types::Timestamp;
use crate::{Error, Result};

/// Resumable position inside one stream. Always lies on a token boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamCursor {
    pub position: usize,
    /// Running timestamp after the token preceding `position`.
    pub base: Timestamp,
}

struct Peeked {
    event: MemoryEvent,
    next: StreamCursor,
}

/// Pull decoder over one per-thread token stream.
///
/// `peek` decodes the next token without consuming it; `advance` commits the
/// peeked token. Errors leave the committed position untouched.
pub struct StreamDecoder<'a> {
    index: usize,
    bytes: &'a [u8],
    cursor: StreamCursor,
    peeked: Option<Peeked>,
}

impl<'a> StreamDecoder<'a> {
    pub fn new(index: usize, bytes: &'a [u8]) -> Self {
        Self {
            index,
            bytes,
            cursor: StreamCursor::default(),
            peeked: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn cursor(&self) -> StreamCursor {
        self.cursor
    }

    /// Bytes committed so far.
    pub fn position(&self) -> usize {
        self.cursor.position
    }

    pub fn peek(&mut self) -> Result<Option<&MemoryEvent>> {
        if self.peeked.is_none() {
            if self.cursor.position >= self.bytes.len() {
                return Ok(None);
            }
            let peeked = self.decode()?;
            self.peeked = Some(peeked);
        }
        Ok(self.peeked.as_ref().map(|peeked| &peeked.event))
    }

    /// Commits the last peeked token and returns it.
    pub fn advance(&mut self) -> Option<MemoryEvent> {
        let peeked = self.peeked.take()?;
        self.cursor = peeked.next;
        Some(peeked.event)
    }

    /// Decodes and commits the next token.
    pub fn next_event(&mut self) -> Result<Option<MemoryEvent>> {
        self.peek()?;
        Ok(self.advance())
    }

    /// Moves to a recorded cursor. The cursor must lie on a token boundary.
    pub fn reset(&mut self, cursor: StreamCursor) {
        self.cursor = cursor;
        self.peeked = None;
    }

    fn decode(&self) -> Result<Peeked> {
        let offset = self.cursor.position;
        let mut reader = ByteReader::new(&self.bytes[offset..]);
        let header = decode_header(&mut reader).map_err(|err| self.token_error(err, offset))?;

        let previous = self.cursor.base;
        let mut timestamp = previous
            .checked_add_signed(header.delta)
            .filter(|_| header.delta >= 0)
            .ok_or(Error::TimestampRegress {
                stream: self.index,
                previous,
                timestamp: previous.wrapping_add(header.delta as u64),
            })?;

        let token =
            Token::decode_payload(header.kind, &mut reader).map_err(|err| self.token_error(err, offset))?;
        if let Token::TimeDelta { base } = token {
            if base < timestamp {
                return Err(Error::TimestampRegress {
                    stream: self.index,
                    previous: timestamp,
                    timestamp: base,
                });
            }
            timestamp = base;
        }

        Ok(Peeked {
            event: MemoryEvent {
                timestamp,
                thread: header.thread,
                stream: self.index,
                offset,
                token,
            },
            next: StreamCursor {
                position: offset + reader.position(),
                base: timestamp,
            },
        })
    }

    fn token_error(&self, err: ReadError, offset: usize) -> Error {
        match err {
            ReadError::Short => Error::TruncatedToken {
                stream: self.index,
                offset,
            },
            ReadError::Invalid(reason) => Error::MalformedToken {
                stream: self.index,
                offset,
                reason,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::token::encode_header;
    use crate::format::{TokenKind, TokenWriter};
    use crate::types::MiscKind;

    fn present() -> Token {
        Token::Misc(MiscKind::Present)
    }

    #[test]
    fn peek_does_not_consume() -> Result<()> {
        let mut writer = TokenWriter::new(3);
        writer.push(100, &present()).push(150, &present());
        let bytes = writer.into_bytes();
        let mut decoder = StreamDecoder::new(0, &bytes);

        assert_eq!(decoder.peek()?.map(|e| e.timestamp), Some(100));
        assert_eq!(decoder.peek()?.map(|e| e.timestamp), Some(100));
        assert_eq!(decoder.position(), 0);
        let first = decoder.advance().unwrap();
        assert_eq!((first.timestamp, first.thread, first.offset), (100, 3, 0));
        let second = decoder.next_event()?.unwrap();
        assert_eq!(second.timestamp, 150);
        assert_eq!(decoder.next_event()?, None);
        assert_eq!(decoder.position(), bytes.len());
        Ok(())
    }

    #[test]
    fn reset_replays_from_cursor() -> Result<()> {
        let mut writer = TokenWriter::new(0);
        writer
            .push(10, &present())
            .push(20, &present())
            .push(30, &present());
        let bytes = writer.into_bytes();
        let mut decoder = StreamDecoder::new(0, &bytes);
        decoder.next_event()?;
        let cursor = decoder.cursor();
        decoder.next_event()?;
        decoder.next_event()?;
        decoder.reset(cursor);
        assert_eq!(decoder.next_event()?.map(|e| e.timestamp), Some(20));
        Ok(())
    }

    #[test]
    fn negative_delta_is_regress() {
        let mut writer = TokenWriter::new(0);
        writer.push(50, &present()).push(40, &present());
        let bytes = writer.into_bytes();
        let mut decoder = StreamDecoder::new(2, &bytes);
        decoder.next_event().unwrap();
        assert!(matches!(
            decoder.peek(),
            Err(Error::TimestampRegress {
                stream: 2,
                previous: 50,
                timestamp: 40
            })
        ));
    }

    #[test]
    fn time_delta_resynchronises_base() -> Result<()> {
        let mut writer = TokenWriter::new(0);
        writer
            .push(5, &present())
            .push(5, &Token::TimeDelta { base: 1_000 })
            .push(1_010, &present());
        let bytes = writer.into_bytes();
        let mut decoder = StreamDecoder::new(0, &bytes);
        let stamps: Vec<Timestamp> = std::iter::from_fn(|| decoder.next_event().ok().flatten())
            .map(|e| e.timestamp)
            .collect();
        assert_eq!(stamps, vec![5, 1_000, 1_010]);
        Ok(())
    }

    #[test]
    fn time_delta_below_running_time_is_regress() {
        let mut writer = TokenWriter::new(0);
        writer
            .push(500, &present())
            .push(500, &Token::TimeDelta { base: 100 });
        let bytes = writer.into_bytes();
        let mut decoder = StreamDecoder::new(0, &bytes);
        decoder.next_event().unwrap();
        assert!(matches!(decoder.peek(), Err(Error::TimestampRegress { .. })));
    }

    #[test]
    fn short_tail_is_truncated_and_bad_kind_is_malformed() {
        let mut writer = TokenWriter::new(0);
        writer.push(1, &Token::PhysicalFree { address: 0x1000 });
        let mut bytes = writer.into_bytes();
        bytes.truncate(bytes.len() - 3);
        let mut decoder = StreamDecoder::new(0, &bytes);
        assert!(matches!(
            decoder.peek(),
            Err(Error::TruncatedToken { stream: 0, offset: 0 })
        ));

        let mut bad = Vec::new();
        encode_header(&mut bad, TokenKind::Misc, 0, 0);
        bad[0] = 0x1f;
        let mut decoder = StreamDecoder::new(1, &bad);
        assert!(matches!(
            decoder.peek(),
            Err(Error::MalformedToken { stream: 1, .. })
        ));
    }
}
