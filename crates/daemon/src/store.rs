use std::{
    collections::HashMap,
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};

use air_fusion_core::{ensure_dir_exists, replace_file, sibling_temp_path};
use parquet::{
    basic::{LogicalType, Repetition, Type as PhysicalType},
    errors::ParquetError,
    file::{
        properties::WriterProperties,
        reader::{FileReader, SerializedFileReader},
        writer::SerializedFileWriter,
    },
    record::{Field, RecordWriter, Row},
    schema::types::Type,
};
use parquet_derive::ParquetRecordWriter;
use slog::{debug, info, Logger};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::sync::Mutex;

use crate::{CanonicalRecord, Parameter, Provenance, RecordKey, SourceTag, WeatherContext};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("parquet error: {0}")]
    Parquet(#[from] ParquetError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("batch rejected: {0}")]
    InvalidRecord(String),
    #[error("stored row {row} unreadable: {reason}")]
    Corrupt { row: usize, reason: String },
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Merge into the existing table, newer rows replace older ones with the same key
    AppendMerge,
    /// Replace the whole table with the batch
    Overwrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitSummary {
    pub incoming: usize,
    pub inserted: usize,
    /// Incoming rows that superseded an earlier row with the same key
    pub replaced: usize,
    pub total_rows: usize,
}

/// One row of the persisted table
#[derive(Debug, ParquetRecordWriter)]
struct StoredRecord {
    timestamp: String,
    source: String,
    location_name: String,
    latitude: f64,
    longitude: f64,
    parameter: String,
    value: f64,
    unit: String,
    provenance: String,
    category_index: Option<i64>,
    temperature: Option<f64>,
    humidity: Option<f64>,
    wind_speed: Option<f64>,
    wind_direction: Option<f64>,
    pressure: Option<f64>,
    quality_flag: Option<String>,
}

impl StoredRecord {
    fn from_record(record: &CanonicalRecord) -> Result<Self, StoreError> {
        let timestamp = record
            .timestamp
            .format(&Rfc3339)
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
        Ok(Self {
            timestamp,
            source: record.source.as_str().to_string(),
            location_name: record.location_name.clone(),
            latitude: record.latitude,
            longitude: record.longitude,
            parameter: record.parameter.as_str().to_string(),
            value: record.value,
            unit: record.unit.clone(),
            provenance: record.provenance.as_str().to_string(),
            category_index: record.category_index,
            temperature: record.weather.temperature,
            humidity: record.weather.humidity,
            wind_speed: record.weather.wind_speed,
            wind_direction: record.weather.wind_direction,
            pressure: record.weather.pressure,
            quality_flag: record.quality_flag.clone(),
        })
    }
}

fn string_column(name: &str, repetition: Repetition) -> Result<Type, ParquetError> {
    Type::primitive_type_builder(name, PhysicalType::BYTE_ARRAY)
        .with_repetition(repetition)
        .with_logical_type(Some(LogicalType::String))
        .build()
}

fn double_column(name: &str, repetition: Repetition) -> Result<Type, ParquetError> {
    Type::primitive_type_builder(name, PhysicalType::DOUBLE)
        .with_repetition(repetition)
        .build()
}

/// Column order matches `StoredRecord`
pub fn create_record_schema() -> Result<Type, ParquetError> {
    use Repetition::{OPTIONAL, REQUIRED};

    let fields = vec![
        string_column("timestamp", REQUIRED)?,
        string_column("source", REQUIRED)?,
        string_column("location_name", REQUIRED)?,
        double_column("latitude", REQUIRED)?,
        double_column("longitude", REQUIRED)?,
        string_column("parameter", REQUIRED)?,
        double_column("value", REQUIRED)?,
        string_column("unit", REQUIRED)?,
        string_column("provenance", REQUIRED)?,
        Type::primitive_type_builder("category_index", PhysicalType::INT64)
            .with_repetition(OPTIONAL)
            .build()?,
        double_column("temperature", OPTIONAL)?,
        double_column("humidity", OPTIONAL)?,
        double_column("wind_speed", OPTIONAL)?,
        double_column("wind_direction", OPTIONAL)?,
        double_column("pressure", OPTIONAL)?,
        string_column("quality_flag", OPTIONAL)?,
    ];

    Type::group_type_builder("air_quality")
        .with_fields(fields.into_iter().map(Arc::new).collect())
        .build()
}

fn validate(record: &CanonicalRecord) -> Result<(), String> {
    if !record.timestamp.offset().is_utc() {
        return Err(format!(
            "{} {} at {}: timestamp is not UTC",
            record.location_name, record.parameter, record.timestamp
        ));
    }
    if !record.latitude.is_finite() || !record.longitude.is_finite() {
        return Err(format!(
            "{} {}: non-finite coordinate",
            record.location_name, record.parameter
        ));
    }
    if !record.value.is_finite() {
        return Err(format!(
            "{} {} at {}: non-finite value",
            record.location_name, record.parameter, record.timestamp
        ));
    }
    Ok(())
}

fn optional_double(field: &Field) -> Result<Option<f64>, String> {
    match field {
        Field::Null => Ok(None),
        Field::Double(v) => Ok(Some(*v)),
        Field::Float(v) => Ok(Some(*v as f64)),
        Field::Long(v) => Ok(Some(*v as f64)),
        other => Err(format!("expected a number, found {}", other)),
    }
}

fn row_to_record(row: &Row) -> Result<CanonicalRecord, String> {
    let columns: HashMap<&str, &Field> = row
        .get_column_iter()
        .map(|(name, field)| (name.as_str(), field))
        .collect();
    let column = |name: &str| {
        columns
            .get(name)
            .copied()
            .ok_or_else(|| format!("missing column {}", name))
    };
    let string = |name: &str| match column(name)? {
        Field::Str(s) => Ok(s.clone()),
        other => Err(format!("{}: expected a string, found {}", name, other)),
    };
    let optional_string = |name: &str| match column(name)? {
        Field::Null => Ok(None),
        Field::Str(s) => Ok(Some(s.clone())),
        other => Err(format!("{}: expected a string, found {}", name, other)),
    };
    let double = |name: &str| {
        optional_double(column(name)?)
            .map_err(|e| format!("{}: {}", name, e))?
            .ok_or_else(|| format!("{}: unexpected null", name))
    };
    let optional = |name: &str| optional_double(column(name)?).map_err(|e| format!("{}: {}", name, e));

    let timestamp = OffsetDateTime::parse(&string("timestamp")?, &Rfc3339)
        .map_err(|e| format!("timestamp: {}", e))?;
    let category_index = match column("category_index")? {
        Field::Null => None,
        Field::Long(v) => Some(*v),
        other => return Err(format!("category_index: expected an integer, found {}", other)),
    };

    Ok(CanonicalRecord {
        timestamp,
        source: string("source")?
            .parse::<SourceTag>()
            .map_err(|e| e.to_string())?,
        location_name: string("location_name")?,
        latitude: double("latitude")?,
        longitude: double("longitude")?,
        parameter: string("parameter")?
            .parse::<Parameter>()
            .map_err(|e| e.to_string())?,
        value: double("value")?,
        unit: string("unit")?,
        provenance: string("provenance")?
            .parse::<Provenance>()
            .map_err(|e| e.to_string())?,
        category_index,
        weather: WeatherContext {
            temperature: optional("temperature")?,
            humidity: optional("humidity")?,
            wind_speed: optional("wind_speed")?,
            wind_direction: optional("wind_direction")?,
            pressure: optional("pressure")?,
        },
        quality_flag: optional_string("quality_flag")?,
    })
}

fn read_table(path: &Path) -> Result<Vec<CanonicalRecord>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = SerializedFileReader::new(File::open(path)?)?;
    let mut records = Vec::new();
    for (index, row) in reader.get_row_iter(None)?.enumerate() {
        let row = row?;
        let record =
            row_to_record(&row).map_err(|reason| StoreError::Corrupt { row: index, reason })?;
        records.push(record);
    }
    Ok(records)
}

fn write_table(path: &Path, records: &[CanonicalRecord]) -> Result<(), StoreError> {
    let rows = records
        .iter()
        .map(StoredRecord::from_record)
        .collect::<Result<Vec<_>, _>>()?;

    let temp = sibling_temp_path(path);
    let written = (|| -> Result<(), StoreError> {
        let file = File::create(&temp)?;
        let props = WriterProperties::builder().build();
        let mut writer =
            SerializedFileWriter::new(file, Arc::new(create_record_schema()?), Arc::new(props))?;
        if !rows.is_empty() {
            let mut row_group = writer.next_row_group()?;
            rows.as_slice().write_to_row_group(&mut row_group)?;
            row_group.close()?;
        }
        writer.close()?;
        Ok(())
    })();

    if let Err(e) = written {
        let _ = std::fs::remove_file(&temp);
        return Err(e);
    }
    replace_file(&temp, path)?;
    Ok(())
}

/// Last write wins per key; the result is stably sorted by timestamp
fn merge(existing: Vec<CanonicalRecord>, batch: Vec<CanonicalRecord>) -> (Vec<CanonicalRecord>, usize, usize) {
    let mut rows: Vec<CanonicalRecord> = Vec::with_capacity(existing.len() + batch.len());
    let mut index: HashMap<RecordKey, usize> = HashMap::new();

    for record in existing {
        match index.get(&record.key()) {
            Some(&i) => rows[i] = record,
            None => {
                index.insert(record.key(), rows.len());
                rows.push(record);
            }
        }
    }

    let (mut inserted, mut replaced) = (0, 0);
    for record in batch {
        match index.get(&record.key()) {
            Some(&i) => {
                rows[i] = record;
                replaced += 1;
            }
            None => {
                index.insert(record.key(), rows.len());
                rows.push(record);
                inserted += 1;
            }
        }
    }

    rows.sort_by_key(|r| r.timestamp);
    (rows, inserted, replaced)
}

fn persist(
    path: &Path,
    batch: Vec<CanonicalRecord>,
    mode: WriteMode,
) -> Result<CommitSummary, StoreError> {
    let incoming = batch.len();
    let existing = match mode {
        WriteMode::AppendMerge => read_table(path)?,
        WriteMode::Overwrite => Vec::new(),
    };
    let (rows, inserted, replaced) = merge(existing, batch);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !ensure_dir_exists(parent) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("cannot create {}", parent.display()),
            )));
        }
    }
    write_table(path, &rows)?;

    Ok(CommitSummary {
        incoming,
        inserted,
        replaced,
        total_rows: rows.len(),
    })
}

/// Parquet-backed table of canonical records with a single writer
pub struct TimeSeriesStore {
    path: PathBuf,
    lock: Mutex<()>,
    logger: Logger,
}

impl TimeSeriesStore {
    pub fn new(path: impl Into<PathBuf>, logger: Logger) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
            logger,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validate, merge and persist `batch`.
    ///
    /// A single invalid record rejects the whole batch and leaves the table
    /// as it was. The new table replaces the old one in one rename.
    pub async fn commit(
        &self,
        batch: Vec<CanonicalRecord>,
        mode: WriteMode,
    ) -> Result<CommitSummary, StoreError> {
        for record in &batch {
            validate(record).map_err(StoreError::InvalidRecord)?;
        }

        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        // parquet I/O is blocking
        let summary =
            tokio::task::spawn_blocking(move || persist(&path, batch, mode)).await??;
        info!(
            self.logger,
            "committed {} rows ({} new, {} replaced), table holds {}",
            summary.incoming,
            summary.inserted,
            summary.replaced,
            summary.total_rows
        );
        Ok(summary)
    }

    pub async fn load(&self) -> Result<Vec<CanonicalRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        let records = tokio::task::spawn_blocking(move || read_table(&path)).await??;
        debug!(self.logger, "loaded {} rows from {}", records.len(), self.path.display());
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::{o, Discard};
    use time::macros::{datetime, offset};

    fn record(timestamp: OffsetDateTime, parameter: Parameter, value: f64) -> CanonicalRecord {
        CanonicalRecord {
            timestamp,
            source: SourceTag::OpenAq,
            location_name: "Queens College".to_string(),
            latitude: 40.7366,
            longitude: -73.8222,
            parameter,
            value,
            unit: "µg/m³".to_string(),
            provenance: Provenance::Observation,
            category_index: None,
            weather: WeatherContext::default(),
            quality_flag: None,
        }
    }

    fn store(dir: &tempfile::TempDir) -> TimeSeriesStore {
        TimeSeriesStore::new(dir.path().join("air_quality.parquet"), Logger::root(Discard, o!()))
    }

    #[tokio::test]
    async fn round_trips_every_column() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let mut full = record(datetime!(2024-08-12 12:00 UTC), Parameter::O3, 68.66);
        full.source = SourceTag::OpenWeatherForecast;
        full.provenance = Provenance::Forecast;
        full.category_index = Some(2);
        full.weather = WeatherContext {
            temperature: Some(27.3),
            humidity: Some(61.0),
            wind_speed: Some(4.1),
            wind_direction: Some(200.0),
            pressure: None,
        };
        full.quality_flag = Some("V".to_string());

        store.commit(vec![full.clone()], WriteMode::AppendMerge).await.unwrap();
        assert_eq!(store.load().await.unwrap(), vec![full]);
    }

    #[tokio::test]
    async fn appending_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let batch = vec![
            record(datetime!(2024-08-12 11:00 UTC), Parameter::Pm25, 8.4),
            record(datetime!(2024-08-12 10:00 UTC), Parameter::Pm25, 7.9),
        ];

        let first = store.commit(batch.clone(), WriteMode::AppendMerge).await.unwrap();
        assert_eq!(first.inserted, 2);
        let second = store.commit(batch, WriteMode::AppendMerge).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.replaced, 2);
        assert_eq!(second.total_rows, 2);

        let rows = store.load().await.unwrap();
        assert!(rows.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn newer_value_replaces_older() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let t = datetime!(2024-08-12 10:00 UTC);
        store
            .commit(vec![record(t, Parameter::No2, 20.0)], WriteMode::AppendMerge)
            .await
            .unwrap();
        store
            .commit(vec![record(t, Parameter::No2, 21.5)], WriteMode::AppendMerge)
            .await
            .unwrap();

        let rows = store.load().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 21.5);
    }

    #[tokio::test]
    async fn overwrite_replaces_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store
            .commit(
                vec![
                    record(datetime!(2024-08-12 10:00 UTC), Parameter::No2, 20.0),
                    record(datetime!(2024-08-12 11:00 UTC), Parameter::No2, 22.0),
                ],
                WriteMode::AppendMerge,
            )
            .await
            .unwrap();
        let summary = store
            .commit(
                vec![record(datetime!(2024-08-13 10:00 UTC), Parameter::O3, 30.0)],
                WriteMode::Overwrite,
            )
            .await
            .unwrap();
        assert_eq!(summary.total_rows, 1);
        let rows = store.load().await.unwrap();
        assert_eq!(rows[0].parameter, Parameter::O3);
    }

    #[tokio::test]
    async fn invalid_batch_leaves_table_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let good = record(datetime!(2024-08-12 10:00 UTC), Parameter::Pm10, 12.0);
        store.commit(vec![good.clone()], WriteMode::AppendMerge).await.unwrap();

        let bad_value = vec![
            record(datetime!(2024-08-12 11:00 UTC), Parameter::Pm10, 13.0),
            record(datetime!(2024-08-12 12:00 UTC), Parameter::Pm10, f64::NAN),
        ];
        let result = store.commit(bad_value, WriteMode::Overwrite).await;
        assert!(matches!(result, Err(StoreError::InvalidRecord(_))));

        let local = record(
            datetime!(2024-08-12 06:00 -4),
            Parameter::Pm10,
            13.0,
        );
        assert_eq!(local.timestamp.offset(), offset!(-4));
        let result = store.commit(vec![local], WriteMode::AppendMerge).await;
        assert!(matches!(result, Err(StoreError::InvalidRecord(_))));

        assert_eq!(store.load().await.unwrap(), vec![good]);
    }

    #[tokio::test]
    async fn missing_table_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store(&dir).load().await.unwrap().is_empty());
    }

    #[test]
    fn merge_keeps_equal_timestamps_in_arrival_order() {
        let t = datetime!(2024-08-12 10:00 UTC);
        let batch = vec![
            record(t, Parameter::No2, 1.0),
            record(t, Parameter::O3, 2.0),
            record(t, Parameter::Co, 3.0),
        ];
        let (rows, inserted, replaced) = merge(Vec::new(), batch);
        assert_eq!((inserted, replaced), (3, 0));
        let order: Vec<_> = rows.iter().map(|r| r.parameter).collect();
        assert_eq!(order, vec![Parameter::No2, Parameter::O3, Parameter::Co]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn commit_leaves_the_runtime_free() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                }
            })
        };

        let batch = (0..500)
            .map(|i| {
                record(
                    datetime!(2024-08-12 00:00 UTC) + time::Duration::minutes(i),
                    Parameter::Pm25,
                    i as f64,
                )
            })
            .collect();
        store.commit(batch, WriteMode::AppendMerge).await.unwrap();
        // the single runtime thread kept running other tasks during the write
        assert!(ticks.load(Ordering::SeqCst) > 0);

        let before_load = ticks.load(Ordering::SeqCst);
        assert_eq!(store.load().await.unwrap().len(), 500);
        assert!(ticks.load(Ordering::SeqCst) > before_load);
        ticker.abort();
    }
}
