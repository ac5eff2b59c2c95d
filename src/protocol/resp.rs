//! RESP ingestion parser
//!
//! Samples arrive as triples of RESP frames: a series name, a timestamp,
//! and a value. Scalars use `+` (string) or `:` (integer) framing;
//! multi-column values use a `*N` array of scalars. Timestamps are raw
//! nanosecond counts or basic ISO 8601.
//!
//! ```text
//! +cpu host=a\r\n
//! +20200101T000000\r\n
//! +3.14\r\n
//! ```
//!
//! The parser is incremental: `parse_next` may be fed arbitrary byte chunks
//! and holds incomplete lines until more data arrives.

use crate::storage::Session;
use crate::types::{parse_timestamp, ParamId, Sample, Timestamp};

use super::{IngestError, ParseError};

/// Longest tuple value accepted from the wire.
const MAX_TUPLE_LEN: usize = 64;

enum RespState {
    Series,
    Timestamp {
        paramid: ParamId,
    },
    Value {
        paramid: ParamId,
        timestamp: Timestamp,
    },
    Tuple {
        paramid: ParamId,
        timestamp: Timestamp,
        remaining: usize,
        values: Vec<f64>,
    },
}

/// Streaming RESP parser bound to one ingestion session.
pub struct RespParser<'a> {
    session: &'a Session,
    buf: Vec<u8>,
    state: RespState,
}

impl<'a> RespParser<'a> {
    pub fn new(session: &'a Session) -> Self {
        Self {
            session,
            buf: Vec::new(),
            state: RespState::Series,
        }
    }

    /// Feed a chunk of bytes into the parser.
    ///
    /// Returns on the first malformed frame or rejected sample; the parser
    /// should be discarded after an error.
    pub fn parse_next(&mut self, bytes: &[u8]) -> Result<(), IngestError> {
        self.buf.extend_from_slice(bytes);
        let mut buf = std::mem::take(&mut self.buf);
        let mut start = 0;
        let result = loop {
            let Some(rel) = find_crlf(&buf[start..]) else {
                break Ok(());
            };
            let line_end = start + rel;
            let outcome = self.handle_line(&buf[start..line_end]);
            start = line_end + 2;
            if let Err(err) = outcome {
                break Err(err);
            }
        };
        buf.drain(..start);
        self.buf = buf;
        result
    }

    fn handle_line(&mut self, line: &[u8]) -> Result<(), IngestError> {
        let (control, payload) = match line.split_first() {
            Some((control, payload)) => (*control, payload),
            None => {
                return Err(ParseError::UnexpectedByte {
                    byte: b'\r',
                    context: "frame header",
                }
                .into())
            }
        };
        let payload = std::str::from_utf8(payload).map_err(|_| ParseError::Utf8)?;
        // The state is left at `Series` on error; an errored parser is
        // discarded by its owner, never resumed
        let state = std::mem::replace(&mut self.state, RespState::Series);
        self.state = match state {
            RespState::Series => {
                if control != b'+' {
                    return Err(ParseError::UnexpectedByte {
                        byte: control,
                        context: "series name",
                    }
                    .into());
                }
                let paramid = self.session.series_to_param_id(payload)?;
                RespState::Timestamp { paramid }
            }
            RespState::Timestamp { paramid } => {
                let timestamp = match control {
                    b'+' | b':' => parse_timestamp(payload)
                        .ok_or_else(|| ParseError::BadTimestamp(payload.to_string()))?,
                    other => {
                        return Err(ParseError::UnexpectedByte {
                            byte: other,
                            context: "timestamp",
                        }
                        .into())
                    }
                };
                RespState::Value { paramid, timestamp }
            }
            RespState::Value { paramid, timestamp } => match control {
                b'+' | b':' => {
                    let value = parse_value(payload)?;
                    self.session.write(&Sample::float(paramid, timestamp, value))?;
                    RespState::Series
                }
                b'*' => {
                    let count: usize = payload
                        .parse()
                        .map_err(|_| ParseError::BadArray(payload.to_string()))?;
                    if count == 0 || count > MAX_TUPLE_LEN {
                        return Err(ParseError::BadArray(payload.to_string()).into());
                    }
                    RespState::Tuple {
                        paramid,
                        timestamp,
                        remaining: count,
                        values: Vec::with_capacity(count),
                    }
                }
                other => {
                    return Err(ParseError::UnexpectedByte {
                        byte: other,
                        context: "value",
                    }
                    .into())
                }
            },
            RespState::Tuple {
                paramid,
                timestamp,
                remaining,
                mut values,
            } => {
                if control != b'+' && control != b':' {
                    return Err(ParseError::UnexpectedByte {
                        byte: control,
                        context: "tuple element",
                    }
                    .into());
                }
                values.push(parse_value(payload)?);
                if remaining == 1 {
                    self.session
                        .write(&Sample::tuple(paramid, timestamp, values))?;
                    RespState::Series
                } else {
                    RespState::Tuple {
                        paramid,
                        timestamp,
                        remaining: remaining - 1,
                        values,
                    }
                }
            }
        };
        Ok(())
    }
}

fn parse_value(payload: &str) -> Result<f64, ParseError> {
    payload
        .parse::<f64>()
        .map_err(|_| ParseError::BadValue(payload.to_string()))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}
