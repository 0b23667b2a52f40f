//! CSV row driver and schema parsers.
//!
//! [`documents`] walks the rows of an in-memory CSV file in order and hands
//! each one to a [`RecordParser`], yielding only the rows that produced a
//! document.

use csv::{ByteRecordsIntoIter, ReaderBuilder, StringRecord};
use thiserror::Error;

use crate::model::IndexableDoc;

pub mod weather;

pub use weather::WeatherParser;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("csv read failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("row {row} is missing column {column}")]
    MissingColumn { row: u64, column: &'static str },
    #[error("invalid date/time '{value}': {source}")]
    InvalidDate {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("invalid leadtime '{0}'")]
    InvalidLeadtime(String),
}

/// Maps one CSV record of a fixed schema to an optional document.
///
/// `Ok(None)` means the row is intentionally skipped (repeated header,
/// observation rows and the like).
pub trait RecordParser: Send + Sync {
    fn delimiter(&self) -> u8;

    fn parse(&self, record: &StringRecord, row: u64) -> Result<Option<IndexableDoc>, ParseError>;
}

/// Iterator over the documents of one CSV file.
pub struct Documents<'a, P: ?Sized> {
    records: ByteRecordsIntoIter<&'a [u8]>,
    parser: &'a P,
    row: u64,
}

/// Iterate the documents produced by `parser` over `raw`, in file order.
///
/// The file has no quoting and a variable number of columns per row; bytes
/// that are not valid UTF-8 are replaced rather than failing the row.
pub fn documents<'a, P>(raw: &'a [u8], parser: &'a P) -> Documents<'a, P>
where
    P: RecordParser + ?Sized,
{
    let reader = ReaderBuilder::new()
        .delimiter(parser.delimiter())
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .from_reader(raw);
    Documents {
        records: reader.into_byte_records(),
        parser,
        row: 0,
    }
}

impl<P: ?Sized> Documents<'_, P> {
    /// Number of physical records read so far.
    pub fn rows_read(&self) -> u64 {
        self.row
    }
}

impl<P> Iterator for Documents<'_, P>
where
    P: RecordParser + ?Sized,
{
    type Item = Result<IndexableDoc, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let record = match self.records.next()? {
                Ok(record) => StringRecord::from_byte_record_lossy(record),
                Err(err) => return Some(Err(err.into())),
            };
            self.row += 1;
            match self.parser.parse(&record, self.row) {
                Ok(Some(doc)) => return Some(Ok(doc)),
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}
