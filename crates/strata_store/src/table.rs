//! Table catalog: on-disk layout, metadata, and the engine façade that
//! hands out exclusive table writers.
//!
//! Layout per table under the engine root:
//!
//! ```text
//! <root>/<table>/_meta.json          column set, partitioning, row counts
//! <root>/<table>/<col>.sym           symbol dictionary (SYMBOL columns)
//! <root>/<table>/<partition>/<col>.d packed fixed-width data, or var blob
//! <root>/<table>/<partition>/<col>.i 8-byte offsets (var columns only)
//! <root>/<table>/<partition>/<col>.top first row the column exists at
//! ```

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::copy::CopyPublisher;
use crate::fileio;
use crate::line::EntityType;
use crate::symbol;
use crate::writer::TableWriter;

pub const INT_NULL: i32 = i32::MIN;
pub const LONG_NULL: i64 = i64::MIN;
pub const TIMESTAMP_COLUMN: &str = "timestamp";

/// Storage type of one column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Boolean,
    Byte,
    Short,
    Char,
    Int,
    Long,
    Date,
    Timestamp,
    Float,
    Double,
    Symbol,
    String,
    Long256,
    Binary,
}

impl ColumnType {
    /// Bytes per value for fixed-width types; `None` for var-width.
    pub fn fixed_size(self) -> Option<usize> {
        Some(match self {
            ColumnType::Boolean | ColumnType::Byte => 1,
            ColumnType::Short | ColumnType::Char => 2,
            ColumnType::Int | ColumnType::Symbol | ColumnType::Float => 4,
            ColumnType::Long | ColumnType::Date | ColumnType::Timestamp | ColumnType::Double => 8,
            ColumnType::Long256 => 32,
            ColumnType::String | ColumnType::Binary => return None,
        })
    }

    pub fn is_var(self) -> bool {
        matches!(self, ColumnType::String | ColumnType::Binary)
    }

    /// Bytes of the length header that prefixes each var value.
    pub fn var_header_size(self) -> usize {
        match self {
            ColumnType::String => 4,
            ColumnType::Binary => 8,
            _ => 0,
        }
    }
}

/// Column type used when an entity with a new name auto-creates its column.
pub fn default_column_type(entity: EntityType) -> ColumnType {
    match entity {
        EntityType::Tag | EntityType::CachedTag => ColumnType::Symbol,
        EntityType::Float => ColumnType::Double,
        EntityType::Integer => ColumnType::Long,
        EntityType::String => ColumnType::String,
        EntityType::Boolean => ColumnType::Boolean,
        EntityType::Long256 => ColumnType::Long256,
    }
}

const BANNED_NAME_CHARS: &[char] = &[
    '?', '.', ',', '\'', '"', '\\', '/', ':', ')', '(', '+', '-', '*', '%', '~', '\0',
];

/// Whether `name` is acceptable as a table or column name.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(' ')
        && !name.ends_with(' ')
        && !name.chars().any(|c| BANNED_NAME_CHARS.contains(&c) || c.is_control())
}

/// Partitioning scheme for new tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionBy {
    None,
    Day,
}

impl std::str::FromStr for PartitionBy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "none" => Ok(PartitionBy::None),
            "day" => Ok(PartitionBy::Day),
            other => anyhow::bail!("unknown partitioning {other:?}"),
        }
    }
}

const MICROS_PER_DAY: i64 = 86_400_000_000;

/// Directory name of the partition holding `timestamp_us`.
pub fn partition_name(by: PartitionBy, timestamp_us: i64) -> String {
    match by {
        PartitionBy::None => "default".to_string(),
        PartitionBy::Day => {
            let days = timestamp_us.div_euclid(MICROS_PER_DAY);
            let (y, m, d) = civil_from_days(days);
            format!("{y:04}-{m:02}-{d:02}")
        }
    }
}

/// Inclusive lower bound of the partition holding `timestamp_us`.
pub fn partition_floor(by: PartitionBy, timestamp_us: i64) -> i64 {
    match by {
        PartitionBy::None => i64::MIN,
        PartitionBy::Day => timestamp_us.div_euclid(MICROS_PER_DAY) * MICROS_PER_DAY,
    }
}

// Days-since-epoch to proleptic Gregorian date.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub col_type: ColumnType,
    #[serde(default)]
    pub indexed: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub name: String,
    pub row_count: u64,
    pub min_ts: i64,
    pub max_ts: i64,
}

/// Table metadata, persisted as `_meta.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableMeta {
    pub name: String,
    pub columns: Vec<ColumnMeta>,
    pub timestamp_index: usize,
    pub partition_by: PartitionBy,
    pub partitions: Vec<PartitionMeta>,
    pub txn: u64,
    pub symbol_cache: bool,
    pub symbol_capacity: u32,
}

impl TableMeta {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn load(table_dir: &Path) -> anyhow::Result<Self> {
        let path = table_dir.join("_meta.json");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("could not read table meta [path={}]", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("invalid table meta [path={}]", path.display()))
    }

    pub fn store(&self, table_dir: &Path) -> anyhow::Result<()> {
        let path = table_dir.join("_meta.json");
        let text = serde_json::to_string_pretty(self).context("serialize table meta")?;
        // Write-then-rename so readers never observe a torn meta file.
        let tmp = table_dir.join("_meta.json.tmp");
        std::fs::write(&tmp, text)
            .with_context(|| format!("could not write table meta [path={}]", tmp.display()))?;
        std::fs::rename(&tmp, &path).context("rename table meta")?;
        Ok(())
    }

    /// Total committed rows across partitions.
    pub fn row_count(&self) -> u64 {
        self.partitions.iter().map(|p| p.row_count).sum()
    }

    /// Highest committed timestamp, or `LONG_NULL` for an empty table.
    pub fn max_timestamp(&self) -> i64 {
        self.partitions.last().map(|p| p.max_ts).unwrap_or(LONG_NULL)
    }
}

/// Shape of a table to create.
#[derive(Clone, Debug)]
pub struct TableStructure {
    pub name: String,
    pub columns: Vec<(String, ColumnType)>,
    pub partition_by: PartitionBy,
    pub symbol_cache: bool,
    pub symbol_capacity: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableStatus {
    Exists,
    DoesNotExist,
    Reserved,
}

/// Why a writer could not be produced.
#[derive(Debug)]
pub enum WriterError {
    /// The writer is held elsewhere; the caller may retry later.
    Busy,
    Other(anyhow::Error),
}

impl std::fmt::Display for WriterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriterError::Busy => write!(f, "table writer is in use"),
            WriterError::Other(err) => write!(f, "{err:#}"),
        }
    }
}

impl std::error::Error for WriterError {}

/// The storage engine: owns the data directory, arbitrates writer exclusivity
/// and carries the out-of-order copy queue handle that table writers publish
/// rewrite work to.
pub struct Engine {
    root: PathBuf,
    writer_locks: Mutex<HashSet<String>>,
    copy: CopyPublisher,
}

impl Engine {
    pub fn open(root: impl Into<PathBuf>, copy: CopyPublisher) -> anyhow::Result<Arc<Self>> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create data dir [path={}]", root.display()))?;
        Ok(Arc::new(Self {
            root,
            writer_locks: Mutex::new(HashSet::new()),
            copy,
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn copy_publisher(&self) -> &CopyPublisher {
        &self.copy
    }

    pub fn table_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn status(&self, name: &str) -> TableStatus {
        let dir = self.table_dir(name);
        if !dir.exists() {
            return TableStatus::DoesNotExist;
        }
        if dir.join("_meta.json").exists() {
            TableStatus::Exists
        } else {
            TableStatus::Reserved
        }
    }

    /// Create a table directory with its metadata and symbol dictionaries.
    /// The designated timestamp column is appended after the caller's columns.
    pub fn create_table(&self, structure: &TableStructure) -> anyhow::Result<()> {
        anyhow::ensure!(
            valid_name(&structure.name),
            "table name contains invalid characters [name={}]",
            structure.name
        );
        let mut columns = Vec::with_capacity(structure.columns.len() + 1);
        for (name, col_type) in &structure.columns {
            anyhow::ensure!(
                valid_name(name),
                "column name contains invalid characters [table={}, column={name}]",
                structure.name
            );
            columns.push(ColumnMeta {
                name: name.clone(),
                col_type: *col_type,
                indexed: false,
            });
        }
        let timestamp_index = columns.len();
        columns.push(ColumnMeta {
            name: TIMESTAMP_COLUMN.to_string(),
            col_type: ColumnType::Timestamp,
            indexed: false,
        });

        let dir = self.table_dir(&structure.name);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create table dir [path={}]", dir.display()))?;
        for col in &columns {
            if col.col_type == ColumnType::Symbol {
                fileio::open_rw(&symbol::sym_file(&dir, &col.name))?;
            }
        }
        let meta = TableMeta {
            name: structure.name.clone(),
            columns,
            timestamp_index,
            partition_by: structure.partition_by,
            partitions: Vec::new(),
            txn: 0,
            symbol_cache: structure.symbol_cache,
            symbol_capacity: structure.symbol_capacity,
        };
        meta.store(&dir)?;
        tracing::info!(table = %structure.name, "table created");
        Ok(())
    }

    /// Acquire the exclusive writer for a table.
    pub fn writer(self: &Arc<Self>, name: &str) -> Result<TableWriter, WriterError> {
        if !self.try_reserve_writer(name) {
            return Err(WriterError::Busy);
        }
        match TableWriter::open(Arc::clone(self), name, true) {
            Ok(writer) => Ok(writer),
            Err(err) => {
                self.release_writer_reservation(name);
                Err(WriterError::Other(err))
            }
        }
    }

    /// Reserve writer exclusivity without opening files. The ingestion
    /// pipeline reserves once per active table and opens lazily on the
    /// owning writer thread.
    pub(crate) fn try_reserve_writer(&self, name: &str) -> bool {
        self.writer_locks.lock().unwrap().insert(name.to_string())
    }

    pub(crate) fn release_writer_reservation(&self, name: &str) {
        self.writer_locks.lock().unwrap().remove(name);
    }

    /// Open the writer under a reservation taken with
    /// [`Self::try_reserve_writer`]; the reservation stays held on close.
    pub(crate) fn open_reserved_writer(self: &Arc<Self>, name: &str) -> anyhow::Result<TableWriter> {
        debug_assert!(self.writer_locks.lock().unwrap().contains(name));
        TableWriter::open(Arc::clone(self), name, false)
    }

    /// Snapshot of the table metadata as a reader sees it.
    pub fn reader_meta(&self, name: &str) -> anyhow::Result<TableMeta> {
        TableMeta::load(&self.table_dir(name))
    }

    /// Read one column of one partition, materializing nulls for the rows
    /// above the column top (and for columns with no files at all).
    pub fn read_column(
        &self,
        table: &str,
        partition: &str,
        column: &str,
    ) -> anyhow::Result<ColumnData> {
        let meta = self.reader_meta(table)?;
        let col = meta
            .columns
            .iter()
            .find(|c| c.name == column)
            .with_context(|| format!("no such column [table={table}, column={column}]"))?;
        let part = meta
            .partitions
            .iter()
            .find(|p| p.name == partition)
            .with_context(|| format!("no such partition [table={table}, partition={partition}]"))?;
        let dir = self.table_dir(table).join(partition);
        read_column_data(&dir, &col.name, col.col_type, part.row_count)
    }

    /// Read the dictionary of a symbol column.
    pub fn read_symbols(&self, table: &str, column: &str) -> anyhow::Result<Vec<String>> {
        symbol::read_dictionary(&symbol::sym_file(&self.table_dir(table), column))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("root", &self.root).finish()
    }
}

/// Materialized column values for inspection and tests.
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnData {
    Bool(Vec<bool>),
    Byte(Vec<i8>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Sym(Vec<i32>),
    Long256(Vec<[u8; 32]>),
    Str(Vec<Option<String>>),
    Bin(Vec<Option<Vec<u8>>>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Bool(v) => v.len(),
            ColumnData::Byte(v) => v.len(),
            ColumnData::Short(v) => v.len(),
            ColumnData::Int(v) => v.len(),
            ColumnData::Long(v) => v.len(),
            ColumnData::Float(v) => v.len(),
            ColumnData::Double(v) => v.len(),
            ColumnData::Sym(v) => v.len(),
            ColumnData::Long256(v) => v.len(),
            ColumnData::Str(v) => v.len(),
            ColumnData::Bin(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_longs(&self) -> &[i64] {
        match self {
            ColumnData::Long(v) => v,
            other => panic!("not a long column: {other:?}"),
        }
    }

    pub fn as_doubles(&self) -> &[f64] {
        match self {
            ColumnData::Double(v) => v,
            other => panic!("not a double column: {other:?}"),
        }
    }

    pub fn as_syms(&self) -> &[i32] {
        match self {
            ColumnData::Sym(v) => v,
            other => panic!("not a symbol column: {other:?}"),
        }
    }

    pub fn as_strs(&self) -> &[Option<String>] {
        match self {
            ColumnData::Str(v) => v,
            other => panic!("not a string column: {other:?}"),
        }
    }
}

/// How many leading rows of the partition predate the column. Mirrors the
/// merge planner's convention: an explicit `.top` wins, a present data file
/// means zero, and a fully absent column sits entirely above the top.
pub fn src_data_top(dir: &Path, column: &str, row_count: u64) -> anyhow::Result<u64> {
    let top_path = dir.join(format!("{column}.top"));
    if top_path.exists() {
        let file = File::open(&top_path)
            .with_context(|| format!("could not open [file={}]", top_path.display()))?;
        return Ok(fileio::read_i64_at(&file, 0)? as u64);
    }
    if dir.join(format!("{column}.d")).exists() {
        return Ok(0);
    }
    Ok(row_count)
}

fn read_column_data(
    dir: &Path,
    column: &str,
    col_type: ColumnType,
    row_count: u64,
) -> anyhow::Result<ColumnData> {
    let top = src_data_top(dir, column, row_count)? as usize;
    let rows = row_count as usize;
    let file_rows = rows - top.min(rows);

    if col_type.is_var() {
        return read_var_column(dir, column, col_type, top, file_rows);
    }

    let size = col_type.fixed_size().unwrap();
    let data = if file_rows > 0 {
        std::fs::read(dir.join(format!("{column}.d")))
            .with_context(|| format!("could not read column [column={column}]"))?
    } else {
        Vec::new()
    };
    anyhow::ensure!(
        data.len() >= file_rows * size,
        "column file too short [column={column}, rows={file_rows}]"
    );

    macro_rules! fixed {
        ($variant:ident, $ty:ty, $null:expr, $size:expr) => {{
            let mut out: Vec<$ty> = vec![$null; top];
            for row in 0..file_rows {
                let at = row * $size;
                out.push(<$ty>::from_le_bytes(data[at..at + $size].try_into().unwrap()));
            }
            ColumnData::$variant(out)
        }};
    }

    Ok(match col_type {
        ColumnType::Boolean => {
            let mut out = vec![false; top];
            out.extend(data[..file_rows].iter().map(|&b| b == 1));
            ColumnData::Bool(out)
        }
        ColumnType::Byte => fixed!(Byte, i8, 0, 1),
        ColumnType::Short | ColumnType::Char => fixed!(Short, i16, 0, 2),
        ColumnType::Int => fixed!(Int, i32, INT_NULL, 4),
        ColumnType::Symbol => fixed!(Sym, i32, -1, 4),
        ColumnType::Float => fixed!(Float, f32, f32::NAN, 4),
        ColumnType::Long | ColumnType::Date | ColumnType::Timestamp => {
            fixed!(Long, i64, LONG_NULL, 8)
        }
        ColumnType::Double => fixed!(Double, f64, f64::NAN, 8),
        ColumnType::Long256 => {
            let mut out = vec![[0u8; 32]; top];
            for row in 0..file_rows {
                let at = row * 32;
                let mut v = [0u8; 32];
                v.copy_from_slice(&data[at..at + 32]);
                out.push(v);
            }
            ColumnData::Long256(out)
        }
        ColumnType::String | ColumnType::Binary => unreachable!(),
    })
}

fn read_var_column(
    dir: &Path,
    column: &str,
    col_type: ColumnType,
    top: usize,
    file_rows: usize,
) -> anyhow::Result<ColumnData> {
    let (index, data) = if file_rows > 0 {
        (
            std::fs::read(dir.join(format!("{column}.i")))
                .with_context(|| format!("could not read column index [column={column}]"))?,
            std::fs::read(dir.join(format!("{column}.d")))
                .with_context(|| format!("could not read column [column={column}]"))?,
        )
    } else {
        (Vec::new(), Vec::new())
    };
    anyhow::ensure!(
        index.len() >= file_rows * 8,
        "column index too short [column={column}, rows={file_rows}]"
    );

    let entry = |row: usize| -> usize {
        i64::from_le_bytes(index[row * 8..row * 8 + 8].try_into().unwrap()) as usize
    };

    match col_type {
        ColumnType::String => {
            let mut out: Vec<Option<String>> = vec![None; top];
            for row in 0..file_rows {
                let at = entry(row);
                let len = i32::from_le_bytes(data[at..at + 4].try_into().unwrap());
                if len < 0 {
                    out.push(None);
                } else {
                    let bytes = &data[at + 4..at + 4 + len as usize * 2];
                    let units: Vec<u16> = bytes
                        .chunks_exact(2)
                        .map(|c| u16::from_le_bytes([c[0], c[1]]))
                        .collect();
                    out.push(Some(String::from_utf16_lossy(&units)));
                }
            }
            Ok(ColumnData::Str(out))
        }
        ColumnType::Binary => {
            let mut out: Vec<Option<Vec<u8>>> = vec![None; top];
            for row in 0..file_rows {
                let at = entry(row);
                let len = i64::from_le_bytes(data[at..at + 8].try_into().unwrap());
                if len < 0 {
                    out.push(None);
                } else {
                    out.push(Some(data[at + 8..at + 8 + len as usize].to_vec()));
                }
            }
            Ok(ColumnData::Bin(out))
        }
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_names_by_day() {
        assert_eq!(partition_name(PartitionBy::None, 12345), "default");
        assert_eq!(partition_name(PartitionBy::Day, 0), "1970-01-01");
        // 2021-03-01T12:00:00Z
        assert_eq!(
            partition_name(PartitionBy::Day, 1_614_600_000_000_000),
            "2021-03-01"
        );
        // Negative timestamps floor toward earlier days.
        assert_eq!(partition_name(PartitionBy::Day, -1), "1969-12-31");
    }

    #[test]
    fn name_validation() {
        assert!(valid_name("weather"));
        assert!(valid_name("cpu_0"));
        assert!(!valid_name(""));
        assert!(!valid_name("a.b"));
        assert!(!valid_name("a/b"));
        assert!(!valid_name("a+b"));
        assert!(!valid_name(" a"));
    }

    #[test]
    fn default_types_per_entity() {
        assert_eq!(default_column_type(EntityType::Tag), ColumnType::Symbol);
        assert_eq!(default_column_type(EntityType::Float), ColumnType::Double);
        assert_eq!(default_column_type(EntityType::Integer), ColumnType::Long);
        assert_eq!(default_column_type(EntityType::String), ColumnType::String);
        assert_eq!(
            default_column_type(EntityType::Boolean),
            ColumnType::Boolean
        );
        assert_eq!(
            default_column_type(EntityType::Long256),
            ColumnType::Long256
        );
    }
}
