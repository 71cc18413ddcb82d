use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use tracing::{debug, info};

use crate::domain::Record;
use crate::error::AqError;
use crate::fs_util::{append_durable, ensure_parent, write_atomic};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// A row that can be appended to a store.
pub trait CsvRow {
    fn to_fields(&self) -> Vec<String>;
}

/// Resume key reconstructed from the last row of a store.
pub trait CheckpointKey: Sized {
    fn from_last_row(header: &StringRecord, row: &StringRecord) -> Result<Self, String>;
}

/// Where a satellite run left off: the last committed (location, date).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointState {
    pub location: String,
    pub date: NaiveDate,
}

impl CheckpointKey for CheckpointState {
    fn from_last_row(header: &StringRecord, row: &StringRecord) -> Result<Self, String> {
        let location = field(header, row, "location")?;
        let date = field(header, row, "date")?;
        let date = NaiveDate::parse_from_str(date.trim(), DATE_FORMAT)
            .map_err(|err| format!("unparseable date {date:?}: {err}"))?;
        Ok(Self {
            location: location.to_string(),
            date,
        })
    }
}

pub fn field<'a>(header: &StringRecord, row: &'a StringRecord, name: &str) -> Result<&'a str, String> {
    header
        .iter()
        .position(|column| column == name)
        .and_then(|index| row.get(index))
        .ok_or_else(|| format!("missing {name} column"))
}

/// True when anything follows the first line.
fn holds_rows(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .position(|byte| *byte == b'\n')
        .is_some_and(|end| end + 1 < bytes.len())
}

impl CsvRow for Record {
    fn to_fields(&self) -> Vec<String> {
        let mut fields = Vec::with_capacity(self.values.len() + 2);
        fields.push(self.date.format(DATE_FORMAT).to_string());
        fields.extend(self.values.iter().map(|value| format_value(*value)));
        fields.push(self.location.clone());
        fields
    }
}

pub fn format_value(value: Option<f64>) -> String {
    match value {
        Some(value) if value.is_finite() => value.to_string(),
        _ => String::new(),
    }
}

/// Append-only CSV output that doubles as the only durable resume state.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: Utf8PathBuf,
    header: Vec<String>,
    min_bytes: u64,
}

impl CheckpointStore {
    pub fn new(path: impl Into<Utf8PathBuf>, header: Vec<String>, min_bytes: u64) -> Self {
        Self {
            path: path.into(),
            header,
            min_bytes,
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn read_last_unit(&self) -> Result<Option<CheckpointState>, AqError> {
        self.read_last()
    }

    /// Parses the whole store and decodes its last row. Any parse failure,
    /// including a final row without its terminating newline, is reported as
    /// [`AqError::CorruptCheckpoint`]. A valid store no larger than the
    /// resume threshold yields `None` but is left in place.
    pub fn read_last<K: CheckpointKey>(&self) -> Result<Option<K>, AqError> {
        let Some(bytes) = self.read_bytes()? else {
            return Ok(None);
        };
        if !holds_rows(&bytes) {
            return Ok(None);
        }
        if bytes.last() != Some(&b'\n') {
            return Err(self.corrupt("final row is not newline-terminated".to_string()));
        }
        let mut last = None;
        let header = self.scan(&bytes, |record| last = Some(record))?;
        let Some(row) = last else {
            return Ok(None);
        };
        let key = K::from_last_row(&header, &row).map_err(|reason| self.corrupt(reason))?;
        if bytes.len() as u64 <= self.min_bytes {
            debug!(path = %self.path, size = bytes.len(), "store below resume threshold");
            return Ok(None);
        }
        Ok(Some(key))
    }

    /// Every data row, validated the same way as [`Self::read_last`].
    pub fn read_rows(&self) -> Result<Vec<StringRecord>, AqError> {
        let Some(bytes) = self.read_bytes()? else {
            return Err(AqError::Filesystem(format!("{} does not exist", self.path)));
        };
        let mut rows = Vec::new();
        if holds_rows(&bytes) {
            if bytes.last() != Some(&b'\n') {
                return Err(self.corrupt("final row is not newline-terminated".to_string()));
            }
            self.scan(&bytes, |record| rows.push(record))?;
        }
        Ok(rows)
    }

    fn read_bytes(&self) -> Result<Option<Vec<u8>>, AqError> {
        match fs::read(self.path.as_std_path()) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(AqError::Filesystem(format!("read {}: {err}", self.path))),
        }
    }

    fn scan<F: FnMut(StringRecord)>(&self, bytes: &[u8], mut visit: F) -> Result<StringRecord, AqError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(bytes);
        let header = reader
            .headers()
            .map_err(|err| self.corrupt(err.to_string()))?
            .clone();
        if header.iter().ne(self.header.iter().map(String::as_str)) {
            return Err(self.corrupt(format!(
                "header {:?} does not match expected {:?}",
                header.iter().collect::<Vec<_>>(),
                self.header
            )));
        }
        for record in reader.records() {
            visit(record.map_err(|err| self.corrupt(err.to_string()))?);
        }
        Ok(header)
    }

    fn corrupt(&self, reason: String) -> AqError {
        AqError::CorruptCheckpoint {
            path: self.path.to_string(),
            reason,
        }
    }

    pub fn discard(&self) -> Result<(), AqError> {
        match fs::remove_file(self.path.as_std_path()) {
            Ok(()) => {
                info!(path = %self.path, "discarded checkpoint store");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AqError::Filesystem(format!(
                "failed to delete {}: {err}; remove it manually",
                self.path
            ))),
        }
    }

    /// Writes the header when the store is missing or holds nothing past its
    /// first line. Existing rows are never rewritten. Returns true when a
    /// fresh header was written.
    pub fn ensure_header(&self) -> Result<bool, AqError> {
        if self.read_bytes()?.is_some_and(|bytes| holds_rows(&bytes)) {
            return Ok(false);
        }
        let bytes = self.serialize(std::iter::once(self.header.clone()))?;
        write_atomic(self.path.as_std_path(), &bytes)?;
        debug!(path = %self.path, "created store with header");
        Ok(true)
    }

    /// Appends rows as one durable write. Never rewrites existing content.
    pub fn append<R: CsvRow>(&self, rows: &[R]) -> Result<usize, AqError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let width = self.header.len();
        let fields = rows
            .iter()
            .map(|row| {
                let fields = row.to_fields();
                if fields.len() != width {
                    return Err(AqError::Filesystem(format!(
                        "row has {} fields, store expects {width}",
                        fields.len()
                    )));
                }
                Ok(fields)
            })
            .collect::<Result<Vec<_>, AqError>>()?;
        let bytes = self.serialize(fields)?;
        ensure_parent(self.path.as_std_path())?;
        append_durable(self.path.as_std_path(), &bytes)?;
        Ok(rows.len())
    }

    fn serialize<I: IntoIterator<Item = Vec<String>>>(&self, rows: I) -> Result<Vec<u8>, AqError> {
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(Vec::new());
        for row in rows {
            writer
                .write_record(&row)
                .map_err(|err| AqError::Filesystem(err.to_string()))?;
        }
        writer
            .into_inner()
            .map_err(|err| AqError::Filesystem(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn store(dir: &tempfile::TempDir) -> CheckpointStore {
        store_with_threshold(dir, 20)
    }

    fn store_with_threshold(dir: &tempfile::TempDir, min_bytes: u64) -> CheckpointStore {
        let path = Utf8PathBuf::from_path_buf(dir.path().join("out.csv")).unwrap();
        CheckpointStore::new(
            path,
            vec!["date".to_string(), "NO2".to_string(), "location".to_string()],
            min_bytes,
        )
    }

    fn record(day: u32, value: Option<f64>, location: &str) -> Record {
        Record {
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            values: vec![value],
            location: location.to_string(),
        }
    }

    #[test]
    fn missing_store_has_no_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(store(&dir).read_last_unit().unwrap(), None);
    }

    #[test]
    fn header_only_store_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(store.ensure_header().unwrap());
        assert_eq!(store.read_last_unit().unwrap(), None);
        assert!(store.ensure_header().unwrap());
    }

    #[test]
    fn last_row_is_the_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.ensure_header().unwrap();
        store
            .append(&[record(1, Some(0.5), "A, Delhi"), record(2, None, "A, Delhi")])
            .unwrap();
        assert!(!store.ensure_header().unwrap());
        let state = store.read_last_unit().unwrap().unwrap();
        assert_eq!(state.location, "A, Delhi");
        assert_eq!(state.date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());

        let text = fs::read_to_string(store.path().as_std_path()).unwrap();
        assert_eq!(
            text,
            "date,NO2,location\n2024-01-01,0.5,\"A, Delhi\"\n2024-01-02,,\"A, Delhi\"\n"
        );
    }

    #[test]
    fn threshold_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let content = "date,NO2,location\n2024-01-01,0.5,A\n";
        fs::write(dir.path().join("out.csv"), content).unwrap();
        let size = content.len() as u64;
        assert_eq!(store_with_threshold(&dir, size).read_last_unit().unwrap(), None);
        assert!(store_with_threshold(&dir, size - 1).read_last_unit().unwrap().is_some());
    }

    #[test]
    fn small_store_with_rows_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_threshold(&dir, 50);
        let content = "date,NO2,location\n2023-12-31,9.5,Loc A\n";
        fs::write(store.path().as_std_path(), content).unwrap();
        assert_eq!(store.read_last_unit().unwrap(), None);
        assert!(!store.ensure_header().unwrap());
        store.append(&[record(1, Some(1.0), "Loc A")]).unwrap();
        assert_eq!(store.read_rows().unwrap().len(), 2);
    }

    #[test]
    fn unterminated_final_row_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        fs::write(
            store.path().as_std_path(),
            "date,NO2,location\n2024-01-01,1.5,Loc A\n2024-01-02,2.5,Lo",
        )
        .unwrap();
        assert_matches!(
            store.read_last_unit(),
            Err(AqError::CorruptCheckpoint { .. })
        );
        assert_matches!(store.read_rows(), Err(AqError::CorruptCheckpoint { .. }));
    }

    #[test]
    fn ragged_rows_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        fs::write(
            store.path().as_std_path(),
            "date,NO2,location\n2024-01-01,0.5,A\n2024-01-02,0.5\n",
        )
        .unwrap();
        assert_matches!(
            store.read_last_unit(),
            Err(AqError::CorruptCheckpoint { .. })
        );
    }

    #[test]
    fn bad_date_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        fs::write(
            store.path().as_std_path(),
            "date,NO2,location\nyesterday,0.5,A\n",
        )
        .unwrap();
        assert_matches!(
            store.read_last_unit(),
            Err(AqError::CorruptCheckpoint { .. })
        );
        store.discard().unwrap();
        assert!(!store.path().as_std_path().exists());
    }
}
