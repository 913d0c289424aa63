//! The per-table column writer.
//!
//! Rows accumulate in a columnar pending batch; commit sorts the batch by
//! designated timestamp, appends the in-order tail directly, and routes
//! anything that lands at or below a partition's max timestamp through the
//! out-of-order merge planner. Exactly one thread drives a writer at a time;
//! exclusivity is arbitrated by the engine's lock registry.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};

use crate::fileio;
use crate::ooo::{self, ActiveColumn, Block, CommitColumn, MergeBlock, OpenColumnCtx, OpenMode};
use crate::copy::PartitionCtl;
use crate::symbol;
use crate::table::{
    valid_name, ColumnMeta, ColumnType, Engine, PartitionMeta, TableMeta, INT_NULL, LONG_NULL,
    partition_name, partition_floor,
};

/// One staged cell value. Strings are collected as owned values because the
/// source buffer (the queue slot) is released before commit.
#[derive(Clone, Debug)]
enum Cell {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Sym(i32),
    Str(String),
    Long256([u8; 32]),
}

struct RowState {
    ts: i64,
    cells: Vec<Option<Cell>>,
}

pub struct TableWriter {
    engine: Arc<Engine>,
    dir: PathBuf,
    meta: TableMeta,
    symbols: Vec<Option<SymbolWriter>>,
    pending_ts: Vec<i64>,
    pending: Vec<CommitColumn>,
    pending_rows: usize,
    row: Option<RowState>,
    active: Option<ActivePartition>,
    owns_lock: bool,
}

struct ActivePartition {
    name: String,
    columns: Vec<Option<ActiveColumn>>,
}

/// Append-side symbol dictionary for one column.
struct SymbolWriter {
    file: File,
    map: HashMap<String, i32>,
    count: i32,
    write_pos: u64,
}

impl SymbolWriter {
    fn open(dir: &std::path::Path, column: &str) -> anyhow::Result<Self> {
        let path = symbol::sym_file(dir, column);
        let entries = symbol::read_dictionary(&path)?;
        let file = fileio::open_rw(&path)?;
        let write_pos = file.metadata().context("sym file metadata")?.len();
        let mut map = HashMap::with_capacity(entries.len());
        for (id, value) in entries.into_iter().enumerate() {
            map.insert(value, id as i32);
        }
        let count = map.len() as i32;
        Ok(Self {
            file,
            map,
            count,
            write_pos,
        })
    }

    fn resolve_add(&mut self, value: &str) -> anyhow::Result<i32> {
        if let Some(&id) = self.map.get(value) {
            return Ok(id);
        }
        let id = self.count;
        let bytes = symbol::encode_entry(value);
        self.file
            .write_all_at(&bytes, self.write_pos)
            .context("append symbol")?;
        self.write_pos += bytes.len() as u64;
        self.map.insert(value.to_string(), id);
        self.count += 1;
        Ok(id)
    }
}

impl TableWriter {
    pub(crate) fn open(engine: Arc<Engine>, name: &str, owns_lock: bool) -> anyhow::Result<Self> {
        let dir = engine.table_dir(name);
        let meta = TableMeta::load(&dir)?;
        let mut symbols = Vec::with_capacity(meta.columns.len());
        for col in &meta.columns {
            if col.col_type == ColumnType::Symbol {
                symbols.push(Some(SymbolWriter::open(&dir, &col.name)?));
            } else {
                symbols.push(None);
            }
        }
        let pending = meta.columns.iter().map(|c| empty_column(c.col_type)).collect();
        Ok(Self {
            engine,
            dir,
            meta,
            symbols,
            pending_ts: Vec::new(),
            pending,
            pending_rows: 0,
            row: None,
            active: None,
            owns_lock,
        })
    }

    pub fn metadata(&self) -> &TableMeta {
        &self.meta
    }

    pub fn table_name(&self) -> &str {
        &self.meta.name
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.meta.column_index(name)
    }

    pub fn column_type(&self, col: usize) -> ColumnType {
        self.meta.columns[col].col_type
    }

    pub fn row_count(&self) -> u64 {
        self.meta.row_count()
    }

    pub fn max_timestamp(&self) -> i64 {
        self.meta.max_timestamp()
    }

    pub fn pending_rows(&self) -> usize {
        self.pending_rows
    }

    /// Open a new row at `ts` (microseconds).
    pub fn new_row(&mut self, ts: i64) -> anyhow::Result<()> {
        if self.row.is_some() {
            bail!("previous row neither appended nor cancelled");
        }
        self.row = Some(RowState {
            ts,
            cells: vec![None; self.meta.columns.len()],
        });
        Ok(())
    }

    pub fn cancel_row(&mut self) {
        self.row = None;
    }

    fn put(&mut self, col: usize, expect: &[ColumnType], cell: Cell) -> anyhow::Result<()> {
        let actual = self
            .meta
            .columns
            .get(col)
            .map(|c| c.col_type)
            .with_context(|| format!("no such column [index={col}]"))?;
        if !expect.contains(&actual) {
            bail!(
                "column type mismatch [table={}, column={}, type={actual:?}]",
                self.meta.name,
                self.meta.columns[col].name
            );
        }
        let row = self.row.as_mut().context("no open row")?;
        row.cells[col] = Some(cell);
        Ok(())
    }

    pub fn put_long(&mut self, col: usize, v: i64) -> anyhow::Result<()> {
        self.put(col, &[ColumnType::Long], Cell::Long(v))
    }

    pub fn put_int(&mut self, col: usize, v: i32) -> anyhow::Result<()> {
        self.put(col, &[ColumnType::Int], Cell::Int(v))
    }

    pub fn put_short(&mut self, col: usize, v: i16) -> anyhow::Result<()> {
        self.put(col, &[ColumnType::Short], Cell::Short(v))
    }

    pub fn put_byte(&mut self, col: usize, v: i8) -> anyhow::Result<()> {
        self.put(col, &[ColumnType::Byte], Cell::Byte(v))
    }

    pub fn put_bool(&mut self, col: usize, v: bool) -> anyhow::Result<()> {
        self.put(col, &[ColumnType::Boolean], Cell::Bool(v))
    }

    pub fn put_float(&mut self, col: usize, v: f32) -> anyhow::Result<()> {
        self.put(col, &[ColumnType::Float], Cell::Float(v))
    }

    pub fn put_double(&mut self, col: usize, v: f64) -> anyhow::Result<()> {
        self.put(col, &[ColumnType::Double], Cell::Double(v))
    }

    pub fn put_timestamp(&mut self, col: usize, v: i64) -> anyhow::Result<()> {
        self.put(col, &[ColumnType::Timestamp], Cell::Long(v))
    }

    pub fn put_date(&mut self, col: usize, v: i64) -> anyhow::Result<()> {
        self.put(col, &[ColumnType::Date], Cell::Long(v))
    }

    /// Resolve a symbol value against the dictionary (appending when new)
    /// and stage its id.
    pub fn put_sym_value(&mut self, col: usize, value: &str) -> anyhow::Result<()> {
        let id = match self.symbols.get_mut(col).and_then(Option::as_mut) {
            Some(writer) => writer.resolve_add(value)?,
            None => bail!(
                "column is not a symbol [table={}, index={col}]",
                self.meta.name
            ),
        };
        self.put(col, &[ColumnType::Symbol], Cell::Sym(id))
    }

    /// Stage an already-resolved dictionary id.
    pub fn put_sym_index(&mut self, col: usize, id: i32) -> anyhow::Result<()> {
        let known = self
            .symbols
            .get(col)
            .and_then(Option::as_ref)
            .map(|w| w.count)
            .unwrap_or(0);
        if id < 0 || id >= known {
            bail!(
                "symbol id out of range [table={}, id={id}, known={known}]",
                self.meta.name
            );
        }
        self.put(col, &[ColumnType::Symbol], Cell::Sym(id))
    }

    pub fn put_str(&mut self, col: usize, value: &str) -> anyhow::Result<()> {
        self.put(col, &[ColumnType::String], Cell::Str(value.to_string()))
    }

    /// Parse and stage a `0x…` hex literal as a 256-bit value.
    pub fn put_long256(&mut self, col: usize, value: &str) -> anyhow::Result<()> {
        let parsed = parse_long256(value)?;
        self.put(col, &[ColumnType::Long256], Cell::Long256(parsed))
    }

    /// Seal the open row into the pending batch.
    pub fn append_row(&mut self) -> anyhow::Result<()> {
        let row = self.row.take().context("no open row")?;
        for (col, pending) in self.pending.iter_mut().enumerate() {
            let cell = if col == self.meta.timestamp_index {
                Some(Cell::Long(row.ts))
            } else {
                row.cells[col].clone()
            };
            push_cell(pending, self.meta.columns[col].col_type, cell)?;
        }
        self.pending_ts.push(row.ts);
        self.pending_rows += 1;
        Ok(())
    }

    /// Add a column. Existing rows, committed or pending, read as null; the
    /// on-disk representation is the column-top convention.
    pub fn add_column(&mut self, name: &str, col_type: ColumnType) -> anyhow::Result<()> {
        if !valid_name(name) {
            bail!(
                "invalid column name [table={}, columnName={name}]",
                self.meta.name
            );
        }
        if self.meta.column_index(name).is_some() {
            bail!("column exists [table={}, columnName={name}]", self.meta.name);
        }
        self.meta.columns.push(ColumnMeta {
            name: name.to_string(),
            col_type,
            indexed: false,
        });
        let mut column = empty_column(col_type);
        for _ in 0..self.pending_rows {
            push_cell(&mut column, col_type, None)?;
        }
        self.pending.push(column);
        if col_type == ColumnType::Symbol {
            self.symbols.push(Some(SymbolWriter::open(&self.dir, name)?));
        } else {
            self.symbols.push(None);
        }
        if let Some(active) = self.active.as_mut() {
            active.columns.push(None);
        }
        if let Some(row) = self.row.as_mut() {
            row.cells.push(None);
        }
        self.meta.store(&self.dir)?;
        tracing::info!(table = %self.meta.name, column = %name, ?col_type, "column added");
        Ok(())
    }

    /// Commit every pending row.
    pub fn commit(&mut self) -> anyhow::Result<u64> {
        self.commit_rows(0)
    }

    /// Commit pending rows except those within `hysteresis_us` of the newest
    /// pending timestamp; recent rows stay buffered to amortize rewrites.
    pub fn commit_with_hysteresis(&mut self, hysteresis_us: i64) -> anyhow::Result<u64> {
        self.commit_rows(hysteresis_us)
    }

    fn commit_rows(&mut self, hysteresis_us: i64) -> anyhow::Result<u64> {
        if self.row.is_some() {
            bail!("cannot commit with an open row");
        }
        if self.pending_rows == 0 {
            return Ok(0);
        }

        let cutoff = if hysteresis_us > 0 {
            let max_pending = *self.pending_ts.iter().max().unwrap();
            max_pending - hysteresis_us
        } else {
            i64::MAX
        };

        let mut order: Vec<usize> = (0..self.pending_rows)
            .filter(|&i| self.pending_ts[i] <= cutoff)
            .collect();
        if order.is_empty() {
            return Ok(0);
        }
        let retained: Vec<usize> = (0..self.pending_rows)
            .filter(|&i| self.pending_ts[i] > cutoff)
            .collect();
        order.sort_by_key(|&i| self.pending_ts[i]);

        let committed_ts: Vec<i64> = order.iter().map(|&i| self.pending_ts[i]).collect();
        let committed: Vec<Arc<CommitColumn>> = self
            .pending
            .iter()
            .map(|col| Arc::new(permute(col, &order)))
            .collect();

        // Rebuild the pending batch from the rows kept back, arrival order.
        let kept_ts: Vec<i64> = retained.iter().map(|&i| self.pending_ts[i]).collect();
        let kept: Vec<CommitColumn> = self
            .pending
            .iter()
            .map(|col| permute(col, &retained))
            .collect();
        self.pending = kept;
        self.pending_ts = kept_ts;
        self.pending_rows = retained.len();

        // Partition groups over the sorted batch.
        let mut groups: Vec<(String, usize, usize)> = Vec::new();
        let by = self.meta.partition_by;
        let mut lo = 0usize;
        for i in 1..committed_ts.len() {
            if partition_floor(by, committed_ts[i]) != partition_floor(by, committed_ts[lo]) {
                groups.push((partition_name(by, committed_ts[lo]), lo, i - 1));
                lo = i;
            }
        }
        groups.push((partition_name(by, committed_ts[lo]), lo, committed_ts.len() - 1));

        // A batch that reaches at or below the table's max timestamp is an
        // out-of-order commit: every group of it goes through the planner,
        // appends included. Purely in-order batches append directly.
        let ooo_commit = committed_ts[0] <= self.meta.max_timestamp();
        for (name, lo, hi) in groups {
            self.commit_group(&name, lo, hi, ooo_commit, &committed, &committed_ts)?;
        }
        self.meta.store(&self.dir)?;
        Ok(committed_ts.len() as u64)
    }

    fn commit_group(
        &mut self,
        name: &str,
        lo: usize,
        hi: usize,
        ooo_commit: bool,
        committed: &[Arc<CommitColumn>],
        ts: &[i64],
    ) -> anyhow::Result<()> {
        let group_min = ts[lo];
        match self.meta.partitions.iter().position(|p| p.name == name) {
            Some(pi) => {
                let is_last = pi == self.meta.partitions.len() - 1;
                if group_min > self.meta.partitions[pi].max_ts {
                    match (ooo_commit, is_last) {
                        (false, true) => self.append_direct(name, lo, hi, committed, ts),
                        (true, true) => {
                            self.plan_group(OpenMode::LastPartitionAppend, pi, lo, hi, committed, ts)
                        }
                        (_, false) => {
                            self.plan_group(OpenMode::MidPartitionAppend, pi, lo, hi, committed, ts)
                        }
                    }
                } else {
                    let mode = if is_last {
                        OpenMode::LastPartitionMerge
                    } else {
                        OpenMode::MidPartitionMerge
                    };
                    self.plan_group(mode, pi, lo, hi, committed, ts)
                }
            }
            None => {
                let past_all = self
                    .meta
                    .partitions
                    .last()
                    .map(|p| group_min > p.max_ts)
                    .unwrap_or(true);
                if past_all && !ooo_commit {
                    self.append_direct(name, lo, hi, committed, ts)
                } else {
                    self.plan_new_partition(name, lo, hi, committed, ts)
                }
            }
        }
    }

    /// In-order tail append: bytes go straight onto the column files.
    fn append_direct(
        &mut self,
        name: &str,
        lo: usize,
        hi: usize,
        committed: &[Arc<CommitColumn>],
        ts: &[i64],
    ) -> anyhow::Result<()> {
        let dir = self.dir.join(name);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create partition dir [path={}]", dir.display()))?;
        let existing_rows = self
            .meta
            .partitions
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.row_count)
            .unwrap_or(0);

        if self.active.as_ref().map(|a| a.name.as_str()) != Some(name) {
            self.active = Some(ActivePartition {
                name: name.to_string(),
                columns: vec![None; self.meta.columns.len()],
            });
        }

        for ci in 0..self.meta.columns.len() {
            let col_type = self.meta.columns[ci].col_type;
            let col_name = self.meta.columns[ci].name.clone();

            // A column appearing in an already-populated partition starts at
            // the current row count; rows before it read as null.
            let d_path = dir.join(format!("{col_name}.d"));
            if existing_rows > 0 && !d_path.exists() {
                let top_path = dir.join(format!("{col_name}.top"));
                if !top_path.exists() {
                    let top = fileio::open_rw(&top_path)?;
                    fileio::write_i64_at(&top, 0, existing_rows as i64)?;
                }
            }

            let files = self.active_column(&dir, ci)?;
            let column = &committed[ci];
            if col_type.is_var() {
                let index_file = &files.fix;
                let data_file = files.var.as_ref().unwrap();
                let index_at = index_file.metadata()?.len();
                let mut data_at = data_file.metadata()?.len();
                let mut index_buf = Vec::with_capacity((hi - lo + 1) * 8);
                for r in lo..=hi {
                    index_buf.extend_from_slice(&(data_at as i64).to_le_bytes());
                    let value = column.var_value(r as u64);
                    data_file
                        .write_all_at(value, data_at)
                        .context("append var column")?;
                    data_at += value.len() as u64;
                }
                index_file
                    .write_all_at(&index_buf, index_at)
                    .context("append var index")?;
            } else {
                let bytes = column.fixed_slice(lo as u64, hi as u64);
                let at = files.fix.metadata()?.len();
                files
                    .fix
                    .write_all_at(bytes, at)
                    .context("append column")?;
            }
        }

        let rows = (hi - lo + 1) as u64;
        match self.meta.partitions.iter_mut().find(|p| p.name == name) {
            Some(p) => {
                p.row_count += rows;
                p.max_ts = ts[hi];
            }
            None => {
                self.meta.partitions.push(PartitionMeta {
                    name: name.to_string(),
                    row_count: rows,
                    min_ts: ts[lo],
                    max_ts: ts[hi],
                });
                self.meta.partitions.sort_by(|a, b| a.min_ts.cmp(&b.min_ts));
            }
        }
        Ok(())
    }

    /// Backfill a whole partition that never existed, through the planner.
    fn plan_new_partition(
        &mut self,
        name: &str,
        lo: usize,
        hi: usize,
        committed: &[Arc<CommitColumn>],
        ts: &[i64],
    ) -> anyhow::Result<()> {
        let dir = self.dir.join(name);
        let txn = self.meta.txn + 1;
        let ctl = PartitionCtl::new(self.meta.columns.len());
        let ctx = OpenColumnCtx {
            mode: OpenMode::NewPartitionAppend,
            partition_dir: &dir,
            txn,
            src_data_max: 0,
            ooo_lo: lo as u64,
            ooo_hi: hi as u64,
            prefix: Block::NONE,
            merge: MergeBlock::NONE,
            suffix: Block::NONE,
            merge_index: None,
            publisher: self.engine.copy_publisher(),
            partition: Arc::clone(&ctl),
        };
        plan_columns(&ctx, &self.meta, committed, None, &ctl);
        ctl.wait()?;

        self.meta.partitions.push(PartitionMeta {
            name: name.to_string(),
            row_count: (hi - lo + 1) as u64,
            min_ts: ts[lo],
            max_ts: ts[hi],
        });
        self.meta.partitions.sort_by(|a, b| a.min_ts.cmp(&b.min_ts));
        self.meta.txn = txn;
        Ok(())
    }

    /// Route a group through the merge planner, wait for the copy pool, and
    /// swap the rewritten partition in.
    fn plan_group(
        &mut self,
        mode: OpenMode,
        pi: usize,
        lo: usize,
        hi: usize,
        committed: &[Arc<CommitColumn>],
        ts: &[i64],
    ) -> anyhow::Result<()> {
        let name = self.meta.partitions[pi].name.clone();
        let src_data_max = self.meta.partitions[pi].row_count;
        let dir = self.dir.join(&name);
        let txn = self.meta.txn + 1;

        let (prefix, merge, suffix, merge_index) = if mode.is_merge() {
            let data_ts = read_ts_column(
                &dir,
                &self.meta.columns[self.meta.timestamp_index].name,
                src_data_max,
            )?;
            let (p, m, s) = ooo::classify(&data_ts, &ts[lo..=hi], lo as u64);
            let index = (m.kind == ooo::BlockType::Merge).then(|| {
                Arc::new(ooo::build_merge_index(&data_ts, &ts[lo..=hi], lo as u64, &m))
            });
            (p, m, s, index)
        } else {
            (Block::NONE, MergeBlock::NONE, Block::NONE, None)
        };

        let ctl = PartitionCtl::new(self.meta.columns.len());
        let ctx = OpenColumnCtx {
            mode,
            partition_dir: &dir,
            txn,
            src_data_max,
            ooo_lo: lo as u64,
            ooo_hi: hi as u64,
            prefix,
            merge,
            suffix,
            merge_index,
            publisher: self.engine.copy_publisher(),
            partition: Arc::clone(&ctl),
        };
        let touches_active = self.active.as_ref().is_some_and(|a| a.name == name);
        let active = if touches_active { self.active.take() } else { None };
        plan_columns(&ctx, &self.meta, committed, active.as_ref(), &ctl);
        ctl.wait()?;

        if mode.is_merge() {
            // The writer's open files for this partition are stale now;
            // `active` is dropped instead of restored.
            swap_partition(&self.dir, &name, txn)?;
        } else if let Some(active) = active {
            self.active = Some(active);
        }

        let rows = (hi - lo + 1) as u64;
        let p = &mut self.meta.partitions[pi];
        p.row_count += rows;
        p.min_ts = p.min_ts.min(ts[lo]);
        p.max_ts = p.max_ts.max(ts[hi]);
        self.meta.txn = txn;
        tracing::debug!(
            table = %self.meta.name,
            partition = %name,
            rows,
            ?mode,
            "partition rewrite complete"
        );
        Ok(())
    }

    fn active_column(&mut self, dir: &std::path::Path, ci: usize) -> anyhow::Result<&ActiveColumn> {
        let col = &self.meta.columns[ci];
        let active = self.active.as_mut().unwrap();
        if active.columns[ci].is_none() {
            let files = if col.col_type.is_var() {
                ActiveColumn {
                    fix: Arc::new(fileio::open_rw(&dir.join(format!("{}.i", col.name)))?),
                    var: Some(Arc::new(fileio::open_rw(&dir.join(format!("{}.d", col.name)))?)),
                }
            } else {
                ActiveColumn {
                    fix: Arc::new(fileio::open_rw(&dir.join(format!("{}.d", col.name)))?),
                    var: None,
                }
            };
            active.columns[ci] = Some(files);
        }
        Ok(active.columns[ci].as_ref().unwrap())
    }
}

impl Drop for TableWriter {
    fn drop(&mut self) {
        if self.owns_lock {
            self.engine.release_writer_reservation(&self.meta.name);
        }
    }
}

impl std::fmt::Debug for TableWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableWriter")
            .field("table", &self.meta.name)
            .field("pending_rows", &self.pending_rows)
            .finish()
    }
}

/// Plan every column of a partition operation, keeping the latch accounting
/// intact when a column fails before publishing anything.
fn plan_columns(
    ctx: &OpenColumnCtx<'_>,
    meta: &TableMeta,
    committed: &[Arc<CommitColumn>],
    active: Option<&ActivePartition>,
    ctl: &Arc<PartitionCtl>,
) {
    for (ci, col) in meta.columns.iter().enumerate() {
        let active_col = active.and_then(|a| a.columns[ci].as_ref());
        if let Err(err) = ooo::open_column(ctx, col, &committed[ci], active_col) {
            tracing::error!(
                table = %meta.name,
                column = %col.name,
                error = %format!("{err:#}"),
                "column rewrite planning failed"
            );
            ctl.fail(format!("{}: {err:#}", col.name));
            ctl.column_done();
        }
    }
}

/// Replace the live partition directory with its staged rewrite.
fn swap_partition(table_dir: &std::path::Path, partition: &str, txn: u64) -> anyhow::Result<()> {
    let live = table_dir.join(partition);
    let staged = ooo::staged_partition_dir(&live, txn);
    let retired = table_dir.join(format!("{partition}.gc{txn}"));
    std::fs::rename(&live, &retired).context("retire partition")?;
    std::fs::rename(&staged, &live).context("activate rewritten partition")?;
    std::fs::remove_dir_all(&retired).context("remove retired partition")?;
    Ok(())
}

fn read_ts_column(
    dir: &std::path::Path,
    ts_column: &str,
    rows: u64,
) -> anyhow::Result<Vec<i64>> {
    let bytes = std::fs::read(dir.join(format!("{ts_column}.d")))
        .with_context(|| format!("read timestamp column [path={}]", dir.display()))?;
    anyhow::ensure!(
        bytes.len() >= rows as usize * 8,
        "timestamp column too short [path={}]",
        dir.display()
    );
    Ok(bytes[..rows as usize * 8]
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

fn empty_column(col_type: ColumnType) -> CommitColumn {
    if col_type.is_var() {
        CommitColumn::Var {
            index: vec![0],
            data: Vec::new(),
        }
    } else {
        CommitColumn::Fixed {
            size: col_type.fixed_size().unwrap(),
            data: Vec::new(),
        }
    }
}

fn push_cell(
    column: &mut CommitColumn,
    col_type: ColumnType,
    cell: Option<Cell>,
) -> anyhow::Result<()> {
    match column {
        CommitColumn::Fixed { data, .. } => {
            match (col_type, cell) {
                (ColumnType::Boolean, Some(Cell::Bool(v))) => data.push(u8::from(v)),
                (ColumnType::Boolean, None) => data.push(0),
                (ColumnType::Byte, Some(Cell::Byte(v))) => data.push(v as u8),
                (ColumnType::Byte, None) => data.push(0),
                (ColumnType::Short, Some(Cell::Short(v))) => {
                    data.extend_from_slice(&v.to_le_bytes())
                }
                (ColumnType::Short | ColumnType::Char, None) => {
                    data.extend_from_slice(&0i16.to_le_bytes())
                }
                (ColumnType::Int, Some(Cell::Int(v))) => data.extend_from_slice(&v.to_le_bytes()),
                (ColumnType::Int, None) => data.extend_from_slice(&INT_NULL.to_le_bytes()),
                (ColumnType::Symbol, Some(Cell::Sym(v))) => {
                    data.extend_from_slice(&v.to_le_bytes())
                }
                (ColumnType::Symbol, None) => data.extend_from_slice(&(-1i32).to_le_bytes()),
                (ColumnType::Float, Some(Cell::Float(v))) => {
                    data.extend_from_slice(&v.to_le_bytes())
                }
                (ColumnType::Float, None) => data.extend_from_slice(&f32::NAN.to_le_bytes()),
                (
                    ColumnType::Long | ColumnType::Date | ColumnType::Timestamp,
                    Some(Cell::Long(v)),
                ) => data.extend_from_slice(&v.to_le_bytes()),
                (ColumnType::Long | ColumnType::Date | ColumnType::Timestamp, None) => {
                    data.extend_from_slice(&LONG_NULL.to_le_bytes())
                }
                (ColumnType::Double, Some(Cell::Double(v))) => {
                    data.extend_from_slice(&v.to_le_bytes())
                }
                (ColumnType::Double, None) => data.extend_from_slice(&f64::NAN.to_le_bytes()),
                (ColumnType::Long256, Some(Cell::Long256(v))) => data.extend_from_slice(&v),
                (ColumnType::Long256, None) => {
                    for _ in 0..4 {
                        data.extend_from_slice(&LONG_NULL.to_le_bytes());
                    }
                }
                (col_type, cell) => {
                    bail!("cell does not match column [type={col_type:?}, cell={cell:?}]")
                }
            }
            Ok(())
        }
        CommitColumn::Var { index, data } => {
            match (col_type, cell) {
                (ColumnType::String, Some(Cell::Str(v))) => {
                    let units: Vec<u16> = v.encode_utf16().collect();
                    data.extend_from_slice(&(units.len() as i32).to_le_bytes());
                    for unit in units {
                        data.extend_from_slice(&unit.to_le_bytes());
                    }
                }
                (ColumnType::String, None) => data.extend_from_slice(&(-1i32).to_le_bytes()),
                (ColumnType::Binary, None) => data.extend_from_slice(&(-1i64).to_le_bytes()),
                (col_type, cell) => {
                    bail!("cell does not match column [type={col_type:?}, cell={cell:?}]")
                }
            }
            index.push(data.len() as i64);
            Ok(())
        }
    }
}

/// Rebuild a column with rows in `order`.
fn permute(column: &CommitColumn, order: &[usize]) -> CommitColumn {
    match column {
        CommitColumn::Fixed { size, data } => {
            let mut out = Vec::with_capacity(order.len() * size);
            for &row in order {
                out.extend_from_slice(&data[row * size..(row + 1) * size]);
            }
            CommitColumn::Fixed {
                size: *size,
                data: out,
            }
        }
        CommitColumn::Var { index, data } => {
            let mut out_index = Vec::with_capacity(order.len() + 1);
            let mut out = Vec::new();
            out_index.push(0i64);
            for &row in order {
                let value = &data[index[row] as usize..index[row + 1] as usize];
                out.extend_from_slice(value);
                out_index.push(out.len() as i64);
            }
            CommitColumn::Var {
                index: out_index,
                data: out,
            }
        }
    }
}

/// Parse a `0x…` hex literal into a little-endian 256-bit value.
pub fn parse_long256(text: &str) -> anyhow::Result<[u8; 32]> {
    let hex = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .with_context(|| format!("invalid long256 literal {text:?}"))?;
    anyhow::ensure!(
        !hex.is_empty() && hex.len() <= 64,
        "invalid long256 literal {text:?}"
    );
    let mut out = [0u8; 32];
    let mut nibbles: Vec<u8> = Vec::with_capacity(hex.len());
    for b in hex.bytes() {
        let nibble = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => bail!("invalid long256 literal {text:?}"),
        };
        nibbles.push(nibble);
    }
    // Walk from the least significant nibble.
    for (i, nibble) in nibbles.iter().rev().enumerate() {
        out[i / 2] |= nibble << ((i % 2) * 4);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copy::CopyPublisher;
    use crate::table::{ColumnData, TableStructure, PartitionBy};

    fn test_engine(tag: &str) -> (Arc<Engine>, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "strata-writer-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let engine = Engine::open(&dir, CopyPublisher::inline_only()).unwrap();
        (engine, dir)
    }

    fn weather_structure() -> TableStructure {
        TableStructure {
            name: "weather".to_string(),
            columns: vec![
                ("loc".to_string(), ColumnType::Symbol),
                ("temp".to_string(), ColumnType::Double),
            ],
            partition_by: PartitionBy::None,
            symbol_cache: true,
            symbol_capacity: 256,
        }
    }

    #[test]
    fn append_commit_read_back() {
        let (engine, dir) = test_engine("basic");
        engine.create_table(&weather_structure()).unwrap();
        let mut writer = engine.writer("weather").unwrap();

        for (ts, temp) in [(1_000i64, 21.5f64), (2_000, 22.0)] {
            writer.new_row(ts).unwrap();
            writer.put_sym_value(0, "eu").unwrap();
            writer.put_double(1, temp).unwrap();
            writer.append_row().unwrap();
        }
        assert_eq!(writer.commit().unwrap(), 2);
        assert_eq!(writer.row_count(), 2);
        assert_eq!(writer.max_timestamp(), 2_000);

        assert_eq!(
            engine.read_column("weather", "default", "timestamp").unwrap(),
            ColumnData::Long(vec![1_000, 2_000])
        );
        assert_eq!(
            engine.read_column("weather", "default", "temp").unwrap(),
            ColumnData::Double(vec![21.5, 22.0])
        );
        assert_eq!(
            engine.read_column("weather", "default", "loc").unwrap(),
            ColumnData::Sym(vec![0, 0])
        );
        assert_eq!(engine.read_symbols("weather", "loc").unwrap(), vec!["eu"]);
        drop(writer);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn out_of_order_batch_merges_into_partition() {
        let (engine, dir) = test_engine("ooo");
        engine.create_table(&weather_structure()).unwrap();
        let mut writer = engine.writer("weather").unwrap();

        for ts in [100i64, 200, 300] {
            writer.new_row(ts).unwrap();
            writer.put_double(1, ts as f64).unwrap();
            writer.append_row().unwrap();
        }
        writer.commit().unwrap();

        for ts in [150i64, 250] {
            writer.new_row(ts).unwrap();
            writer.put_double(1, ts as f64).unwrap();
            writer.append_row().unwrap();
        }
        writer.commit().unwrap();

        assert_eq!(
            engine.read_column("weather", "default", "timestamp").unwrap(),
            ColumnData::Long(vec![100, 150, 200, 250, 300])
        );
        assert_eq!(
            engine.read_column("weather", "default", "temp").unwrap(),
            ColumnData::Double(vec![100.0, 150.0, 200.0, 250.0, 300.0])
        );
        drop(writer);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn late_column_reads_null_above_top_and_merges() {
        let (engine, dir) = test_engine("top");
        engine.create_table(&weather_structure()).unwrap();
        let mut writer = engine.writer("weather").unwrap();

        writer.new_row(100).unwrap();
        writer.put_double(1, 1.0).unwrap();
        writer.append_row().unwrap();
        writer.commit().unwrap();

        writer.add_column("hum", ColumnType::Long).unwrap();
        writer.new_row(300).unwrap();
        writer.put_long(2, 80).unwrap();
        writer.append_row().unwrap();
        writer.commit().unwrap();

        assert_eq!(
            engine.read_column("weather", "default", "hum").unwrap(),
            ColumnData::Long(vec![LONG_NULL, 80])
        );

        // An out-of-order row forces a rewrite across the column top.
        writer.new_row(200).unwrap();
        writer.put_long(2, 70).unwrap();
        writer.append_row().unwrap();
        writer.commit().unwrap();

        assert_eq!(
            engine.read_column("weather", "default", "timestamp").unwrap(),
            ColumnData::Long(vec![100, 200, 300])
        );
        assert_eq!(
            engine.read_column("weather", "default", "hum").unwrap(),
            ColumnData::Long(vec![LONG_NULL, 70, 80])
        );
        drop(writer);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn hysteresis_keeps_recent_rows_buffered() {
        let (engine, dir) = test_engine("hyst");
        engine.create_table(&weather_structure()).unwrap();
        let mut writer = engine.writer("weather").unwrap();

        for ts in [1_000i64, 5_000, 9_000] {
            writer.new_row(ts).unwrap();
            writer.put_double(1, 1.0).unwrap();
            writer.append_row().unwrap();
        }
        // Cutoff is 9_000 - 4_000: the 9_000 row stays pending.
        assert_eq!(writer.commit_with_hysteresis(4_000).unwrap(), 2);
        assert_eq!(writer.pending_rows(), 1);
        assert_eq!(writer.row_count(), 2);
        assert_eq!(writer.commit().unwrap(), 1);
        assert_eq!(writer.row_count(), 3);
        drop(writer);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn string_columns_round_trip_through_merge() {
        let (engine, dir) = test_engine("strings");
        let structure = TableStructure {
            name: "logs".to_string(),
            columns: vec![("msg".to_string(), ColumnType::String)],
            partition_by: PartitionBy::None,
            symbol_cache: true,
            symbol_capacity: 256,
        };
        engine.create_table(&structure).unwrap();
        let mut writer = engine.writer("logs").unwrap();

        for (ts, msg) in [(100i64, "first"), (300, "third")] {
            writer.new_row(ts).unwrap();
            writer.put_str(0, msg).unwrap();
            writer.append_row().unwrap();
        }
        writer.commit().unwrap();

        writer.new_row(200).unwrap();
        writer.put_str(0, "second").unwrap();
        writer.append_row().unwrap();
        writer.commit().unwrap();

        assert_eq!(
            engine.read_column("logs", "default", "msg").unwrap(),
            ColumnData::Str(vec![
                Some("first".to_string()),
                Some("second".to_string()),
                Some("third".to_string()),
            ])
        );
        drop(writer);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn day_partitions_split_and_backfill() {
        let (engine, dir) = test_engine("days");
        let structure = TableStructure {
            name: "metrics".to_string(),
            columns: vec![("v".to_string(), ColumnType::Long)],
            partition_by: PartitionBy::Day,
            symbol_cache: true,
            symbol_capacity: 256,
        };
        engine.create_table(&structure).unwrap();
        let mut writer = engine.writer("metrics").unwrap();

        let day = 86_400_000_000i64;
        for ts in [100, 2 * day + 100, 2 * day + 200] {
            writer.new_row(ts).unwrap();
            writer.put_long(0, ts).unwrap();
            writer.append_row().unwrap();
        }
        writer.commit().unwrap();
        assert_eq!(writer.metadata().partitions.len(), 2);

        // Backfill a day in the gap plus a merge into day 0.
        for ts in [day + 50, 200] {
            writer.new_row(ts).unwrap();
            writer.put_long(0, ts).unwrap();
            writer.append_row().unwrap();
        }
        writer.commit().unwrap();

        let names: Vec<String> = writer
            .metadata()
            .partitions
            .iter()
            .map(|p| p.name.clone())
            .collect();
        assert_eq!(names, vec!["1970-01-01", "1970-01-02", "1970-01-03"]);
        assert_eq!(
            engine.read_column("metrics", "1970-01-01", "v").unwrap(),
            ColumnData::Long(vec![100, 200])
        );
        assert_eq!(
            engine.read_column("metrics", "1970-01-02", "v").unwrap(),
            ColumnData::Long(vec![day + 50])
        );

        // A mixed batch: merge into the first day plus an append onto the
        // open last partition, all within one out-of-order commit.
        for ts in [50, 2 * day + 300] {
            writer.new_row(ts).unwrap();
            writer.put_long(0, ts).unwrap();
            writer.append_row().unwrap();
        }
        writer.commit().unwrap();
        assert_eq!(
            engine.read_column("metrics", "1970-01-01", "v").unwrap(),
            ColumnData::Long(vec![50, 100, 200])
        );
        assert_eq!(
            engine.read_column("metrics", "1970-01-03", "v").unwrap(),
            ColumnData::Long(vec![2 * day + 100, 2 * day + 200, 2 * day + 300])
        );
        drop(writer);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn long256_literals_parse_little_endian() {
        let v = parse_long256("0x1f").unwrap();
        assert_eq!(v[0], 0x1f);
        assert!(v[1..].iter().all(|&b| b == 0));
        let v = parse_long256("0xabcd").unwrap();
        assert_eq!(v[0], 0xcd);
        assert_eq!(v[1], 0xab);
        assert!(parse_long256("0x").is_err());
        assert!(parse_long256("123").is_err());
    }
}
