//! Delimited tick file reading.

use crate::normalizer::{Normalizer, ParseContext, ParseTick};
use csv::{ReaderBuilder, StringRecord, Trim};
use regex::Regex;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tickbar_core::config::IngestConfig;
use tickbar_core::{Error, RecordError, Result, Tick};

static TAQ_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"TAQ_([A-Za-z0-9]+)_\d{6}").expect("valid regex"));
static CONTRACT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z]{1,2}\d{3,4})").expect("valid regex"));

/// Symbol named by a tick file, e.g. `TAQ_IF2309_202309.csv` or `rb2401_20240102.csv`.
pub fn symbol_from_path(path: &Path) -> Option<String> {
    let name = path.file_stem()?.to_str()?;
    TAQ_NAME
        .captures(name)
        .or_else(|| CONTRACT_NAME.captures(name))
        .map(|caps| caps[1].to_string())
}

/// Expand directories to their `*.csv` files, sorted. Files pass through.
pub fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found = Vec::new();
            for entry in std::fs::read_dir(path)? {
                let entry_path = entry?.path();
                let is_csv = entry_path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map_or(false, |e| e.eq_ignore_ascii_case("csv"));
                if entry_path.is_file() && is_csv {
                    found.push(entry_path);
                }
            }
            found.sort();
            files.extend(found);
        } else {
            files.push(path.clone());
        }
    }
    Ok(files)
}

/// Row-by-row tick reader over one delimited source.
pub struct TickReader<R = File> {
    reader: csv::Reader<R>,
    normalizer: Normalizer,
    record: StringRecord,
    rows_read: u64,
}

impl TickReader<File> {
    /// Open a tick file and bind its header.
    pub fn open(path: &Path, config: &IngestConfig) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(file, config)
    }
}

impl<R: Read> TickReader<R> {
    pub fn from_reader(source: R, config: &IngestConfig) -> Result<Self> {
        let delimiter = u8::try_from(config.delimiter)
            .ok()
            .filter(u8::is_ascii)
            .ok_or_else(|| Error::config(format!("delimiter {:?} is not ASCII", config.delimiter)))?;

        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(source);
        let header = reader
            .headers()
            .map_err(|e| Error::csv(format!("cannot read header: {e}")))?
            .clone();
        let normalizer = Normalizer::new(config.format, &header)?;

        Ok(Self {
            reader,
            normalizer,
            record: StringRecord::new(),
            rows_read: 0,
        })
    }

    /// Next row as a tick or a row rejection; `None` at end of input.
    /// I/O failures are fatal for the file.
    pub fn next_tick(
        &mut self,
        ctx: &ParseContext<'_>,
    ) -> Result<Option<std::result::Result<Tick, RecordError>>> {
        match self.reader.read_record(&mut self.record) {
            Ok(false) => Ok(None),
            Ok(true) => {
                self.rows_read += 1;
                Ok(Some(self.normalizer.parse(&self.record, ctx)))
            }
            Err(e) if e.is_io_error() => Err(Error::csv(e.to_string())),
            Err(e) => {
                self.rows_read += 1;
                Ok(Some(Err(RecordError::malformed(e.to_string()))))
            }
        }
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tickbar_calendar::SessionCalendar;
    use tickbar_core::config::{CalendarConfig, TickFormat};
    use tickbar_core::RejectReason;

    #[test]
    fn test_symbol_from_path() {
        assert_eq!(
            symbol_from_path(Path::new("/data/TAQ_IF2309_202309.csv")).as_deref(),
            Some("IF2309")
        );
        assert_eq!(
            symbol_from_path(Path::new("rb2401_20240102.csv")).as_deref(),
            Some("rb2401")
        );
        assert_eq!(symbol_from_path(Path::new("ticks.csv")), None);
    }

    #[test]
    fn test_expand_inputs_sorted_csv_only() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.csv", "a.csv", "notes.txt"] {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }
        let extra = PathBuf::from("single.csv");
        let files = expand_inputs(&[dir.path().to_path_buf(), extra.clone()]).unwrap();
        assert_eq!(
            files,
            vec![dir.path().join("a.csv"), dir.path().join("b.csv"), extra]
        );
    }

    #[test]
    fn test_reader_rows_and_rejects() {
        let data = "TradingDate|TradingTime|LastPrice|TotalVolume\n\
                    20230901|09:30:00|4000|10\n\
                    20230901|09:30:01|bad|11\n\
                    20230901|09:30:02|4001\n";
        let config = IngestConfig {
            format: TickFormat::TaqL2,
            delimiter: '|',
            ..IngestConfig::default()
        };
        let cal = SessionCalendar::from_config(&CalendarConfig::default()).unwrap();
        let symbols = BTreeSet::new();
        let ctx = ParseContext {
            default_symbol: Some("IF2309"),
            trading_day: None,
            symbols: &symbols,
            calendar: &cal,
        };

        let mut reader = TickReader::from_reader(data.as_bytes(), &config).unwrap();
        let first = reader.next_tick(&ctx).unwrap().unwrap().unwrap();
        assert_eq!(first.cum_volume, 10);
        let second = reader.next_tick(&ctx).unwrap().unwrap().unwrap_err();
        assert_eq!(second.reason, RejectReason::Parse);
        let third = reader.next_tick(&ctx).unwrap().unwrap().unwrap_err();
        assert_eq!(third.reason, RejectReason::MalformedRecord);
        assert!(reader.next_tick(&ctx).unwrap().is_none());
        assert_eq!(reader.rows_read(), 3);
    }

    #[test]
    fn test_header_mismatch_is_format_error() {
        let data = "InstrumentID,UpdateTime\nrb2401,21:00:00\n";
        let config = IngestConfig {
            format: TickFormat::TaqL2,
            ..IngestConfig::default()
        };
        assert!(matches!(
            TickReader::from_reader(data.as_bytes(), &config),
            Err(Error::Format(_))
        ));
    }
}
