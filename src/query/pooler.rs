//! Streaming query results pooler
//!
//! A `QueryResultsPooler` adapts one engine cursor to the HTTP response
//! writer: the writer pushes the query text in with `append`, arms the
//! operation with `start`, then pulls formatted bytes out with `read_some`
//! at its own pace. The pooler owns the session and the cursor for the
//! whole life of the request.

use std::collections::VecDeque;

use crate::query::formatter::OutputFormatter;
use crate::storage::{Cursor, QueryRequest, Session, StorageError};
use crate::types::{ApiEndpoint, Sample};

use super::QueryError;

/// Default read-buffer capacity, in sample records.
pub const DEFAULT_RDBUF_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Started,
    Draining,
    Closed,
    Errored,
}

/// One streaming read operation over the engine.
#[derive(Debug)]
pub struct QueryResultsPooler {
    session: Session,
    endpoint: ApiEndpoint,
    query_text: Vec<u8>,
    cursor: Option<Cursor>,
    formatter: Option<OutputFormatter>,
    /// Decoded samples pulled from the cursor, waiting to be formatted
    rdbuf: VecDeque<Sample>,
    rdbuf_size: usize,
    state: State,
    cursor_done: bool,
    error: Option<StorageError>,
    error_produced: bool,
}

impl QueryResultsPooler {
    pub fn new(session: Session, rdbuf_size: usize, endpoint: ApiEndpoint) -> Self {
        Self {
            session,
            endpoint,
            query_text: Vec::new(),
            cursor: None,
            formatter: None,
            rdbuf: VecDeque::new(),
            rdbuf_size: rdbuf_size.max(1),
            state: State::Created,
            cursor_done: false,
            error: None,
            error_produced: false,
        }
    }

    /// Accumulate query text. Legal only before `start`.
    pub fn append(&mut self, data: &[u8]) -> Result<(), QueryError> {
        if self.state != State::Created {
            return Err(QueryError::AlreadyStarted);
        }
        self.query_text.extend_from_slice(data);
        Ok(())
    }

    /// Parse the accumulated query text, open the cursor, and pick the
    /// output formatter. Calling `start` twice fails with `AlreadyStarted`.
    pub fn start(&mut self) -> Result<(), QueryError> {
        if self.state != State::Created {
            return Err(QueryError::AlreadyStarted);
        }
        let request = QueryRequest::parse(&self.query_text, self.endpoint)?;
        let output = match &request {
            QueryRequest::Select { output, .. } => *output,
            _ => Default::default(),
        };
        self.formatter = Some(OutputFormatter::select(self.endpoint, output));
        self.cursor = Some(self.session.execute(&request));
        self.state = State::Started;
        Ok(())
    }

    /// Formatter chosen by `start`, if any.
    pub fn formatter(&self) -> Option<OutputFormatter> {
        self.formatter
    }

    /// Pull formatted bytes. Returns `(bytes_written, complete)`; only whole
    /// formatted samples are written, and `complete` means the cursor is
    /// exhausted and the internal buffer has drained.
    pub fn read_some(&mut self, buf: &mut [u8]) -> Result<(usize, bool), QueryError> {
        match self.state {
            State::Created => return Err(QueryError::NotStarted),
            State::Closed => return Ok((0, true)),
            State::Errored if self.error_produced => return Ok((0, true)),
            _ => {}
        }
        let Some(formatter) = self.formatter else {
            return Err(QueryError::NotStarted);
        };

        let mut written = 0;
        loop {
            self.refill();
            while let Some(sample) = self.rdbuf.front() {
                match formatter.format(&self.session, &mut buf[written..], sample)? {
                    Some(n) => {
                        written += n;
                        self.rdbuf.pop_front();
                    }
                    None if written == 0 => {
                        // The record can never fit; bail out instead of
                        // making the caller retry forever.
                        return Err(QueryError::Formatter);
                    }
                    None => return self.finish_read(written, buf),
                }
            }
            if self.cursor_done {
                return self.finish_read(written, buf);
            }
        }
    }

    /// Release the cursor and session promptly. Idempotent.
    pub fn close(&mut self) {
        self.cursor = None;
        self.rdbuf.clear();
        self.state = State::Closed;
    }

    /// First non-success status seen from the cursor.
    pub fn get_error(&self) -> Option<&StorageError> {
        self.error.as_ref()
    }

    /// Message of the first non-success status seen from the cursor.
    pub fn get_error_message(&self) -> Option<String> {
        self.error.as_ref().map(|err| err.to_string())
    }

    fn refill(&mut self) {
        if self.cursor_done || !self.rdbuf.is_empty() {
            return;
        }
        let Some(cursor) = self.cursor.as_mut() else {
            self.cursor_done = true;
            return;
        };
        while self.rdbuf.len() < self.rdbuf_size {
            match cursor.next() {
                Some(Ok(sample)) => self.rdbuf.push_back(sample),
                Some(Err(err)) => {
                    self.error = Some(err);
                    self.state = State::Errored;
                    self.cursor_done = true;
                    break;
                }
                None => {
                    self.cursor_done = true;
                    break;
                }
            }
        }
    }

    fn finish_read(&mut self, written: usize, buf: &mut [u8]) -> Result<(usize, bool), QueryError> {
        let drained = self.rdbuf.is_empty() && self.cursor_done;
        if !drained {
            if self.state == State::Started {
                self.state = State::Draining;
            }
            return Ok((written, false));
        }
        if let Some(error) = &self.error {
            if !self.error_produced {
                // Deliver the error text exactly once, after all formatted
                // bytes have been flushed.
                let message = format!("-{}\r\n", error);
                let available = buf.len() - written;
                let n = message.len().min(available);
                buf[written..written + n].copy_from_slice(&message.as_bytes()[..n]);
                self.error_produced = true;
                return Ok((written + n, true));
            }
            return Ok((written, true));
        }
        self.state = State::Closed;
        self.cursor = None;
        Ok((written, true))
    }

    #[cfg(test)]
    pub(crate) fn start_with_cursor(&mut self, cursor: Cursor, formatter: OutputFormatter) {
        assert_eq!(self.state, State::Created);
        self.cursor = Some(cursor);
        self.formatter = Some(formatter);
        self.state = State::Started;
    }
}

impl Drop for QueryResultsPooler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{create_database, Connection, FineTuneParams};
    use std::sync::Arc;

    fn test_connection(dir: &std::path::Path) -> Arc<Connection> {
        create_database(dir, 1, 1024, false).unwrap();
        Connection::open(dir, FineTuneParams::default()).unwrap()
    }

    fn ingest(con: &Arc<Connection>, metric: &str, count: u64) {
        let session = con.create_session();
        let id = session
            .series_to_param_id(&format!("{} host=a", metric))
            .unwrap();
        for ts in 1..=count {
            session
                .write(&Sample::float(id, ts * 1000, ts as f64))
                .unwrap();
        }
    }

    fn query_pooler(con: &Arc<Connection>, metric: &str) -> QueryResultsPooler {
        let mut pooler =
            QueryResultsPooler::new(con.create_session(), DEFAULT_RDBUF_SIZE, ApiEndpoint::Query);
        pooler
            .append(format!(r#"{{"select": "{}"}}"#, metric).as_bytes())
            .unwrap();
        pooler
    }

    fn drain(pooler: &mut QueryResultsPooler, chunk_size: usize) -> String {
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk_size];
        loop {
            let (n, complete) = pooler.read_some(&mut buf).unwrap();
            out.extend_from_slice(&buf[..n]);
            if complete {
                break;
            }
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn read_before_start_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let con = test_connection(tmp.path());
        let mut pooler = query_pooler(&con, "cpu");
        let mut buf = [0u8; 64];
        assert!(matches!(
            pooler.read_some(&mut buf).unwrap_err(),
            QueryError::NotStarted
        ));
    }

    #[test]
    fn append_after_start_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let con = test_connection(tmp.path());
        let mut pooler = query_pooler(&con, "cpu");
        pooler.start().unwrap();
        assert!(matches!(
            pooler.append(b"more").unwrap_err(),
            QueryError::AlreadyStarted
        ));
    }

    #[test]
    fn double_start_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let con = test_connection(tmp.path());
        let mut pooler = query_pooler(&con, "cpu");
        pooler.start().unwrap();
        assert!(matches!(
            pooler.start().unwrap_err(),
            QueryError::AlreadyStarted
        ));
    }

    #[test]
    fn start_rejects_malformed_query_text() {
        let tmp = tempfile::tempdir().unwrap();
        let con = test_connection(tmp.path());
        let mut pooler =
            QueryResultsPooler::new(con.create_session(), DEFAULT_RDBUF_SIZE, ApiEndpoint::Query);
        pooler.append(b"not json").unwrap();
        assert!(matches!(
            pooler.start().unwrap_err(),
            QueryError::Parse(_)
        ));
    }

    #[test]
    fn drains_all_samples_as_whole_records() {
        let tmp = tempfile::tempdir().unwrap();
        let con = test_connection(tmp.path());
        ingest(&con, "cpu", 10);

        let mut pooler = query_pooler(&con, "cpu");
        pooler.start().unwrap();
        let big = drain(&mut pooler, 4096);
        assert_eq!(big.lines().count(), 10);

        // A tiny destination buffer yields the same byte stream: records
        // are held back rather than split.
        let mut pooler = query_pooler(&con, "cpu");
        pooler.start().unwrap();
        let small = drain(&mut pooler, 64);
        assert_eq!(small, big);
    }

    #[test]
    fn record_larger_than_the_whole_buffer_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let con = test_connection(tmp.path());
        ingest(&con, "cpu", 1);

        let mut pooler = query_pooler(&con, "cpu");
        pooler.start().unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            pooler.read_some(&mut buf).unwrap_err(),
            QueryError::Formatter
        ));
    }

    #[test]
    fn empty_result_completes_immediately() {
        let tmp = tempfile::tempdir().unwrap();
        let con = test_connection(tmp.path());
        let mut pooler = query_pooler(&con, "nothing");
        pooler.start().unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(pooler.read_some(&mut buf).unwrap(), (0, true));
        // Closed poolers keep reporting completion
        assert_eq!(pooler.read_some(&mut buf).unwrap(), (0, true));
    }

    #[test]
    fn cursor_error_is_reported_exactly_once() {
        let tmp = tempfile::tempdir().unwrap();
        let con = test_connection(tmp.path());
        let session = con.create_session();
        let id = session.series_to_param_id("cpu host=a").unwrap();

        let mut pooler =
            QueryResultsPooler::new(con.create_session(), DEFAULT_RDBUF_SIZE, ApiEndpoint::Query);
        pooler.start_with_cursor(
            Cursor::failing(
                vec![Sample::float(id, 1000, 1.0)],
                StorageError::UnknownSeries(7),
            ),
            OutputFormatter::CsvQuery,
        );

        let mut buf = [0u8; 256];
        let (n, complete) = pooler.read_some(&mut buf).unwrap();
        let text = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(complete);
        assert!(text.starts_with("cpu host=a,"), "data flushed before error: {}", text);
        assert!(text.contains("unknown series id 7"));

        // The error is not repeated, but stays visible through get_error
        assert_eq!(pooler.read_some(&mut buf).unwrap(), (0, true));
        assert!(matches!(
            pooler.get_error(),
            Some(StorageError::UnknownSeries(7))
        ));
        assert!(pooler
            .get_error_message()
            .unwrap()
            .contains("unknown series id 7"));
    }

    #[test]
    fn close_is_idempotent_and_terminal() {
        let tmp = tempfile::tempdir().unwrap();
        let con = test_connection(tmp.path());
        ingest(&con, "cpu", 3);
        let mut pooler = query_pooler(&con, "cpu");
        pooler.start().unwrap();
        pooler.close();
        pooler.close();
        let mut buf = [0u8; 64];
        assert_eq!(pooler.read_some(&mut buf).unwrap(), (0, true));
    }
}
