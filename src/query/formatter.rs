//! Output formatters for the query pipeline
//!
//! One enum variant per response representation, chosen once when a pooler
//! starts. Formatting a sample either writes the whole record into the
//! caller's span or reports that it did not fit; a record is never split.

use crate::storage::{QueryOutput, Session};
use crate::types::{format_timestamp, ApiEndpoint, Sample, SampleValue};

use super::QueryError;

/// Response formatter selected from the API endpoint tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormatter {
    CsvQuery,
    JsonQuery,
    Suggest,
    Search,
}

impl OutputFormatter {
    /// Pick the formatter for an endpoint and requested output shape.
    pub fn select(endpoint: ApiEndpoint, output: QueryOutput) -> Self {
        match endpoint {
            ApiEndpoint::Query => match output {
                QueryOutput::Csv => OutputFormatter::CsvQuery,
                QueryOutput::Json => OutputFormatter::JsonQuery,
            },
            ApiEndpoint::Suggest => OutputFormatter::Suggest,
            ApiEndpoint::Search => OutputFormatter::Search,
        }
    }

    /// Content type of the produced stream.
    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormatter::CsvQuery => "text/csv",
            OutputFormatter::JsonQuery => "application/json",
            OutputFormatter::Suggest | OutputFormatter::Search => "text/plain",
        }
    }

    /// Render one sample into `out`.
    ///
    /// Returns `Ok(Some(len))` on success, `Ok(None)` if the whole record
    /// does not fit into `out` (the caller retries with a drained buffer).
    pub fn format(
        &self,
        session: &Session,
        out: &mut [u8],
        sample: &Sample,
    ) -> Result<Option<usize>, QueryError> {
        let record = self.render(session, sample)?;
        if record.len() > out.len() {
            return Ok(None);
        }
        out[..record.len()].copy_from_slice(record.as_bytes());
        Ok(Some(record.len()))
    }

    fn render(&self, session: &Session, sample: &Sample) -> Result<String, QueryError> {
        match self {
            OutputFormatter::Suggest | OutputFormatter::Search => match &sample.value {
                SampleValue::Blob(bytes) => {
                    let name = std::str::from_utf8(bytes)
                        .map_err(|_| QueryError::Parse("series name is not UTF-8".to_string()))?;
                    Ok(format!("{}\r\n", name))
                }
                _ => {
                    let name = self.series_name(session, sample)?;
                    Ok(format!("{}\r\n", name))
                }
            },
            OutputFormatter::CsvQuery => {
                let name = self.series_name(session, sample)?;
                let value = match &sample.value {
                    SampleValue::Float(v) => v.to_string(),
                    SampleValue::Tuple(vs) => vs
                        .iter()
                        .map(f64::to_string)
                        .collect::<Vec<_>>()
                        .join(" "),
                    SampleValue::Blob(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                };
                Ok(format!(
                    "{},{},{}\r\n",
                    name,
                    format_timestamp(sample.timestamp),
                    value
                ))
            }
            OutputFormatter::JsonQuery => {
                let name = self.series_name(session, sample)?;
                let value = match &sample.value {
                    SampleValue::Float(v) => serde_json::json!(v),
                    SampleValue::Tuple(vs) => serde_json::json!(vs),
                    SampleValue::Blob(bytes) => {
                        serde_json::json!(String::from_utf8_lossy(bytes).into_owned())
                    }
                };
                let record = serde_json::json!({
                    "series": name,
                    "timestamp": format_timestamp(sample.timestamp),
                    "value": value,
                });
                Ok(format!("{}\n", record))
            }
        }
    }

    fn series_name(&self, session: &Session, sample: &Sample) -> Result<String, QueryError> {
        session
            .param_id_to_series(sample.paramid)
            .ok_or_else(|| crate::storage::StorageError::UnknownSeries(sample.paramid).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{create_database, Connection, FineTuneParams};
    use std::sync::Arc;

    fn test_session(dir: &std::path::Path) -> (Arc<Connection>, Session) {
        create_database(dir, 1, 1024, false).unwrap();
        let con = Connection::open(dir, FineTuneParams::default()).unwrap();
        let session = con.create_session();
        (con, session)
    }

    #[test]
    fn selects_by_endpoint_and_output() {
        assert_eq!(
            OutputFormatter::select(ApiEndpoint::Query, QueryOutput::Csv),
            OutputFormatter::CsvQuery
        );
        assert_eq!(
            OutputFormatter::select(ApiEndpoint::Query, QueryOutput::Json),
            OutputFormatter::JsonQuery
        );
        assert_eq!(
            OutputFormatter::select(ApiEndpoint::Suggest, QueryOutput::Csv),
            OutputFormatter::Suggest
        );
        assert_eq!(
            OutputFormatter::select(ApiEndpoint::Search, QueryOutput::Csv),
            OutputFormatter::Search
        );
    }

    #[test]
    fn csv_rows_carry_series_timestamp_value() {
        let tmp = tempfile::tempdir().unwrap();
        let (_con, session) = test_session(tmp.path());
        let id = session.series_to_param_id("cpu host=a").unwrap();
        let sample = Sample::float(id, 1_577_836_800_000_000_000, 3.14);

        let mut out = [0u8; 128];
        let n = OutputFormatter::CsvQuery
            .format(&session, &mut out, &sample)
            .unwrap()
            .unwrap();
        assert_eq!(
            std::str::from_utf8(&out[..n]).unwrap(),
            "cpu host=a,20200101T000000.000000000,3.14\r\n"
        );
    }

    #[test]
    fn json_rows_are_valid_json_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let (_con, session) = test_session(tmp.path());
        let id = session.series_to_param_id("cpu host=a").unwrap();
        let sample = Sample::tuple(id, 1000, vec![1.0, 2.0]);

        let mut out = [0u8; 256];
        let n = OutputFormatter::JsonQuery
            .format(&session, &mut out, &sample)
            .unwrap()
            .unwrap();
        let value: serde_json::Value =
            serde_json::from_slice(&out[..n]).expect("each row is one JSON document");
        assert_eq!(value["series"], "cpu host=a");
        assert_eq!(value["value"], serde_json::json!([1.0, 2.0]));
    }

    #[test]
    fn suggest_rows_emit_the_blob_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let (_con, session) = test_session(tmp.path());
        let sample = Sample::blob(1, b"cpu host=a".to_vec());

        let mut out = [0u8; 64];
        let n = OutputFormatter::Suggest
            .format(&session, &mut out, &sample)
            .unwrap()
            .unwrap();
        assert_eq!(std::str::from_utf8(&out[..n]).unwrap(), "cpu host=a\r\n");
    }

    #[test]
    fn records_that_do_not_fit_are_held_back() {
        let tmp = tempfile::tempdir().unwrap();
        let (_con, session) = test_session(tmp.path());
        let id = session.series_to_param_id("cpu host=a").unwrap();
        let sample = Sample::float(id, 1000, 3.14);

        let mut out = [0u8; 4];
        assert_eq!(
            OutputFormatter::CsvQuery
                .format(&session, &mut out, &sample)
                .unwrap(),
            None
        );
    }

    #[test]
    fn unknown_series_ids_are_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let (_con, session) = test_session(tmp.path());
        let sample = Sample::float(999, 1000, 3.14);
        let mut out = [0u8; 64];
        assert!(OutputFormatter::CsvQuery
            .format(&session, &mut out, &sample)
            .is_err());
    }
}
