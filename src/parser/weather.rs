//! Parser for the semicolon-separated MOS weather forecast files.

use chrono::{Duration, NaiveDateTime};
use csv::StringRecord;
use once_cell::sync::Lazy;

use super::{ParseError, RecordParser};
use crate::model::{FieldValue, IndexableDoc};

pub const INDEX: &str = "weather";
pub const DOC_TYPE: &str = "forecast";
pub const DELIMITER: u8 = b';';
pub const FORECAST_DATETIME: &str = "forecastdatetime";

/// First-column value of the header line repeated at the top of each file.
const FIRST_HEADER_VALUE: &str = "PROJECT";
/// Leadtime marking an observation row rather than a forecast.
const OBSERVATION: &str = "OBS";
/// Largest leadtime a five-character column can carry.
const MAX_LEADTIME: i64 = 99_999;

/// Column order of the weather files.
pub const HEADERS: &[&str] = &[
    "PROJECT", "MODEL", "LOCATION", "DATE", "TIME", "LEADTIME", "TTT", "TX",
    "TN", "Td", "PPPP", "DD", "FF", "FX1", "FX3", "FX6",
    "mN", "sN", "N", "mNeff", "sNeff", "Neff", "mNlm", "Nlm",
    "Nh", "Nm", "mNl", "Nl", "N230", "RH", "VV", "wwM",
    "wwM3", "wwM6", "wwP", "wwP3", "wwP6", "wwZ", "wwD", "wwC",
    "wwT", "wwL", "wwS", "wwF", "wwZ3", "wwD3", "wwC3", "wwT3",
    "wwL3", "wwF3", "wwS3", "wwZ6", "wwD6", "wwC6", "wwT6", "wwL6",
    "wwF6", "wwS6", "wwZh", "wwDh", "wwCh", "wwTh", "wwLh", "wwFh",
    "wwSh", "wwMh", "wwPh", "DRR1", "RR1", "RR6", "RRd", "SunD1",
    "jSun1", "RSunD", "RN2Sd", "Rad1h", "RRad1", "PVV10", "RRh", "D_T2m",
    "D_XT", "D_NT", "D_Td", "DPPPP", "DDD10", "DFF10", "D_N", "D_CT3",
    "D_CT6", "CH", "CM", "CL", "D_RH", "SR3T", "SR6T", "TG",
    "PX125", "PX140", "PX155",
];

const PROJECT: usize = 0;
const LOCATION: usize = 2;
const DATE: usize = 3;
const TIME: usize = 4;
const LEADTIME: usize = 5;

// Field names are stored lowercase to keep queries simple.
static FIELD_NAMES: Lazy<Vec<String>> =
    Lazy::new(|| HEADERS.iter().map(|h| h.to_lowercase()).collect());

/// Epoch seconds of a forecast: `date` (`yyyy-MM-dd`) and `time` (`HH:mm`)
/// read as UTC, plus `leadtime / 100` hours.
pub fn forecast_epoch_seconds(date: &str, time: &str, leadtime: &str) -> Result<i64, ParseError> {
    let formatted = format!("{}|{}", date.trim(), time.trim());
    let base = NaiveDateTime::parse_from_str(&formatted, "%Y-%m-%d|%H:%M").map_err(|source| {
        ParseError::InvalidDate {
            value: formatted.clone(),
            source,
        }
    })?;
    let lead: i64 = leadtime
        .trim()
        .parse()
        .ok()
        .filter(|l: &i64| l.abs() <= MAX_LEADTIME)
        .ok_or_else(|| ParseError::InvalidLeadtime(leadtime.to_string()))?;
    let forecast = base + Duration::hours(lead / 100);
    Ok(forecast.and_utc().timestamp())
}

/// Weather schema parser. Stateless; one instance serves every file.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeatherParser;

impl WeatherParser {
    fn column<'r>(record: &'r StringRecord, index: usize, row: u64) -> Result<&'r str, ParseError> {
        record.get(index).ok_or(ParseError::MissingColumn {
            row,
            column: HEADERS[index],
        })
    }
}

impl RecordParser for WeatherParser {
    fn delimiter(&self) -> u8 {
        DELIMITER
    }

    fn parse(&self, record: &StringRecord, row: u64) -> Result<Option<IndexableDoc>, ParseError> {
        if record.get(PROJECT).map(str::trim) == Some(FIRST_HEADER_VALUE) {
            return Ok(None);
        }
        if record.get(LEADTIME).map(str::trim) == Some(OBSERVATION) {
            return Ok(None);
        }

        let forecast = forecast_epoch_seconds(
            Self::column(record, DATE, row)?,
            Self::column(record, TIME, row)?,
            Self::column(record, LEADTIME, row)?,
        )?;
        let location = Self::column(record, LOCATION, row)?.trim();

        let mut doc = IndexableDoc::new(INDEX, DOC_TYPE, format!("{}|{}", location, forecast));
        doc.add(FORECAST_DATETIME, forecast);

        for (i, raw) in record.iter().enumerate().take(HEADERS.len()) {
            let value = raw.trim();
            if value.is_empty() {
                continue;
            }
            let field = if i == LOCATION || i == LEADTIME {
                // numeric-looking, but identifiers
                FieldValue::from(value)
            } else {
                value
                    .parse::<i32>()
                    .map(FieldValue::I32)
                    .unwrap_or_else(|_| FieldValue::from(value))
            };
            doc.add(FIELD_NAMES[i].as_str(), field);
        }
        Ok(Some(doc))
    }
}
