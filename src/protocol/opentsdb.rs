//! OpenTSDB telnet-style ingestion parser
//!
//! One command per line:
//!
//! ```text
//! put <metric> <timestamp> <value> [<tag>=<value> ...]
//! ```
//!
//! Timestamps are seconds or milliseconds since the epoch (per the OpenTSDB
//! wire convention) and are widened to nanoseconds. Lines are independent,
//! so a malformed line never poisons the parser.

use crate::storage::Session;
use crate::types::{Sample, Timestamp};

use super::{IngestError, ParseError};

const SECONDS_CUTOFF: u64 = 10_000_000_000;
const MILLIS_CUTOFF: u64 = 10_000_000_000_000;

/// Streaming telnet parser bound to one ingestion session.
pub struct TelnetParser<'a> {
    session: &'a Session,
    buf: Vec<u8>,
}

impl<'a> TelnetParser<'a> {
    pub fn new(session: &'a Session) -> Self {
        Self {
            session,
            buf: Vec::new(),
        }
    }

    /// Feed a chunk of bytes into the parser, processing every complete
    /// line. Returns on the first malformed line or rejected sample;
    /// because lines are independent, the caller may keep feeding the same
    /// parser after an error.
    pub fn parse_next(&mut self, bytes: &[u8]) -> Result<(), IngestError> {
        self.buf.extend_from_slice(bytes);
        let mut buf = std::mem::take(&mut self.buf);
        let mut start = 0;
        let result = loop {
            let Some(rel) = buf[start..].iter().position(|&b| b == b'\n') else {
                break Ok(());
            };
            let mut line_end = start + rel;
            if line_end > start && buf[line_end - 1] == b'\r' {
                line_end -= 1;
            }
            let outcome = self.handle_line(&buf[start..line_end]);
            start = start + rel + 1;
            if let Err(err) = outcome {
                break Err(err);
            }
        };
        buf.drain(..start);
        self.buf = buf;
        result
    }

    fn handle_line(&mut self, line: &[u8]) -> Result<(), IngestError> {
        let line = std::str::from_utf8(line).map_err(|_| ParseError::Utf8)?;
        let mut tokens = line.split_whitespace();
        let command = match tokens.next() {
            Some(command) => command,
            None => return Ok(()), // blank line
        };
        if command != "put" {
            return Err(ParseError::BadCommand(command.to_string()).into());
        }
        let metric = tokens
            .next()
            .ok_or_else(|| ParseError::BadCommand(line.to_string()))?;
        let timestamp = tokens
            .next()
            .and_then(|t| t.parse::<u64>().ok())
            .map(widen_timestamp)
            .ok_or_else(|| ParseError::BadTimestamp(line.to_string()))?;
        let value: f64 = tokens
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ParseError::BadValue(line.to_string()))?;

        let mut series = String::from(metric);
        for tag in tokens {
            if !tag.contains('=') {
                return Err(ParseError::BadCommand(line.to_string()).into());
            }
            series.push(' ');
            series.push_str(tag);
        }
        let paramid = self.session.series_to_param_id(&series)?;
        self.session.write(&Sample::float(paramid, timestamp, value))?;
        Ok(())
    }
}

fn widen_timestamp(ts: u64) -> Timestamp {
    if ts < SECONDS_CUTOFF {
        ts * 1_000_000_000
    } else if ts < MILLIS_CUTOFF {
        ts * 1_000_000
    } else {
        ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{create_database, Connection, FineTuneParams, QueryRequest};
    use crate::types::{ApiEndpoint, SampleValue};
    use std::sync::Arc;

    fn test_session(dir: &std::path::Path) -> (Arc<Connection>, Session) {
        create_database(dir, 1, 1024, false).unwrap();
        let con = Connection::open(dir, FineTuneParams::default()).unwrap();
        let session = con.create_session();
        (con, session)
    }

    fn select_all(session: &Session, metric: &str) -> Vec<Sample> {
        let request = QueryRequest::parse(
            format!(r#"{{"select": "{}"}}"#, metric).as_bytes(),
            ApiEndpoint::Query,
        )
        .unwrap();
        session.execute(&request).map(|s| s.unwrap()).collect()
    }

    #[test]
    fn parses_put_lines_with_tags() {
        let tmp = tempfile::tempdir().unwrap();
        let (_con, session) = test_session(tmp.path());
        let mut parser = TelnetParser::new(&session);
        parser
            .parse_next(b"put sys.cpu.user 1577836800 42.5 host=web1 cpu=0\n")
            .unwrap();
        let samples = select_all(&session, "sys.cpu.user");
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].timestamp, 1_577_836_800_000_000_000);
        assert_eq!(samples[0].value, SampleValue::Float(42.5));
    }

    #[test]
    fn widens_second_and_millisecond_timestamps() {
        assert_eq!(widen_timestamp(1_577_836_800), 1_577_836_800_000_000_000);
        assert_eq!(widen_timestamp(1_577_836_800_123), 1_577_836_800_123_000_000);
        assert_eq!(
            widen_timestamp(1_577_836_800_000_000_000),
            1_577_836_800_000_000_000
        );
    }

    #[test]
    fn handles_crlf_and_chunked_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let (_con, session) = test_session(tmp.path());
        let mut parser = TelnetParser::new(&session);
        let message = b"put m 100 1.0 host=a\r\nput m 200 2.0 host=a\r\n";
        for chunk in message.chunks(7) {
            parser.parse_next(chunk).unwrap();
        }
        assert_eq!(select_all(&session, "m").len(), 2);
    }

    #[test]
    fn blank_lines_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let (_con, session) = test_session(tmp.path());
        let mut parser = TelnetParser::new(&session);
        parser.parse_next(b"\n\r\n").unwrap();
    }

    #[test]
    fn rejects_malformed_lines_but_stays_usable() {
        let tmp = tempfile::tempdir().unwrap();
        let (_con, session) = test_session(tmp.path());
        let mut parser = TelnetParser::new(&session);

        assert!(matches!(
            parser.parse_next(b"version\n").unwrap_err(),
            IngestError::Parse(ParseError::BadCommand(_))
        ));
        assert!(matches!(
            parser.parse_next(b"put m abc 1.0\n").unwrap_err(),
            IngestError::Parse(ParseError::BadTimestamp(_))
        ));
        assert!(matches!(
            parser.parse_next(b"put m 100 xyz\n").unwrap_err(),
            IngestError::Parse(ParseError::BadValue(_))
        ));

        // Lines are independent: the same parser keeps working
        parser.parse_next(b"put m 100 1.0 host=a\n").unwrap();
        assert_eq!(select_all(&session, "m").len(), 1);
    }
}
