//! Out-of-order partition merge planning.
//!
//! Invoked per column when a commit carries timestamps at or below the
//! partition's max. The planner classifies the batch against the on-disk
//! rows into prefix / merge / suffix blocks, sizes and maps the destination
//! files, handles columns that came into existence late (column top), and
//! publishes one copy task per block. Merge rewrites stage into a
//! `<partition>.<txn>` directory that the committing writer swaps in once
//! the partition latch drops.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use crate::copy::{
    self, ColumnCtl, ColumnResources, CopyPublisher, CopyTask, PartitionCtl,
};
use crate::fileio::{self, FileSlot, SharedMmap};
use crate::table::{self, ColumnMeta, ColumnType, INT_NULL, LONG_NULL};

/// Block classification within a partition rewrite.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockType {
    None,
    Oo,
    Data,
    Merge,
}

/// A prefix or suffix block: a contiguous row range from one source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Block {
    pub kind: BlockType,
    pub lo: u64,
    pub hi: u64,
}

impl Block {
    pub const NONE: Block = Block {
        kind: BlockType::None,
        lo: 0,
        hi: 0,
    };

    pub fn rows(&self) -> u64 {
        match self.kind {
            BlockType::None => 0,
            _ => self.hi - self.lo + 1,
        }
    }
}

/// The middle block: interleaved rows from both sources, or the remainder of
/// a single source when the other is exhausted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeBlock {
    pub kind: BlockType,
    pub data_lo: u64,
    pub data_hi: u64,
    pub ooo_lo: u64,
    pub ooo_hi: u64,
}

impl MergeBlock {
    pub const NONE: MergeBlock = MergeBlock {
        kind: BlockType::None,
        data_lo: 0,
        data_hi: 0,
        ooo_lo: 0,
        ooo_hi: 0,
    };

    pub fn data_rows(&self) -> u64 {
        match self.kind {
            BlockType::Data | BlockType::Merge => self.data_hi - self.data_lo + 1,
            _ => 0,
        }
    }

    pub fn ooo_rows(&self) -> u64 {
        match self.kind {
            BlockType::Merge => self.ooo_hi - self.ooo_lo + 1,
            _ => 0,
        }
    }

    pub fn rows(&self) -> u64 {
        self.data_rows() + self.ooo_rows()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    MidPartitionAppend,
    LastPartitionAppend,
    MidPartitionMerge,
    LastPartitionMerge,
    NewPartitionAppend,
}

impl OpenMode {
    pub fn is_merge(self) -> bool {
        matches!(self, OpenMode::MidPartitionMerge | OpenMode::LastPartitionMerge)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeSource {
    Data,
    Ooo,
}

/// One row of the merge interleave order, in table-row coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeRef {
    pub source: MergeSource,
    pub row: u64,
}

/// A commit batch column, sorted by designated timestamp. This is the
/// planner's out-of-order source memory.
#[derive(Clone, Debug)]
pub enum CommitColumn {
    Fixed {
        size: usize,
        data: Vec<u8>,
    },
    Var {
        /// `rows + 1` offsets into `data`; entry `i` is where value `i`
        /// starts, the last entry is the data length.
        index: Vec<i64>,
        data: Vec<u8>,
    },
}

impl CommitColumn {
    pub fn rows(&self) -> u64 {
        match self {
            CommitColumn::Fixed { size, data } => (data.len() / size) as u64,
            CommitColumn::Var { index, .. } => (index.len() - 1) as u64,
        }
    }

    /// Packed bytes of rows `lo..=hi`.
    pub fn fixed_slice(&self, lo: u64, hi: u64) -> &[u8] {
        match self {
            CommitColumn::Fixed { size, data } => {
                &data[lo as usize * size..(hi as usize + 1) * size]
            }
            CommitColumn::Var { .. } => panic!("fixed_slice on var column"),
        }
    }

    /// Header-plus-payload bytes of one var value.
    pub fn var_value(&self, row: u64) -> &[u8] {
        match self {
            CommitColumn::Var { index, data } => {
                &data[index[row as usize] as usize..index[row as usize + 1] as usize]
            }
            CommitColumn::Fixed { .. } => panic!("var_value on fixed column"),
        }
    }

    /// Total var bytes of rows `lo..=hi`.
    pub fn var_len_bytes(&self, lo: u64, hi: u64) -> u64 {
        match self {
            CommitColumn::Var { index, .. } => {
                (index[hi as usize + 1] - index[lo as usize]) as u64
            }
            CommitColumn::Fixed { .. } => 0,
        }
    }
}

/// Split an out-of-order batch against the partition's timestamps.
///
/// `data_ts` are the on-disk designated timestamps, `ooo_ts` the sorted
/// batch timestamps for this partition, `ooo_base` the batch row of
/// `ooo_ts[0]`. The caller guarantees `ooo_ts` reaches at or below the
/// partition max (pure tail appends never get here).
pub fn classify(
    data_ts: &[i64],
    ooo_ts: &[i64],
    ooo_base: u64,
) -> (Block, MergeBlock, Block) {
    let rows = data_ts.len() as u64;
    let n = ooo_ts.len() as u64;
    let data_min = data_ts[0];
    let data_max = *data_ts.last().unwrap();
    let ooo_min = ooo_ts[0];
    let ooo_max = *ooo_ts.last().unwrap();

    // Everything lands before the partition: no interleave at all.
    if ooo_max < data_min {
        let prefix = Block {
            kind: BlockType::Oo,
            lo: ooo_base,
            hi: ooo_base + n - 1,
        };
        let suffix = Block {
            kind: BlockType::Data,
            lo: 0,
            hi: rows - 1,
        };
        return (prefix, MergeBlock::NONE, suffix);
    }

    // Prefix: the head of whichever source starts earlier.
    let (prefix, data_from, ooo_from) = if data_min < ooo_min {
        let d1 = data_ts.partition_point(|&ts| ts < ooo_min) as u64;
        (
            Block {
                kind: BlockType::Data,
                lo: 0,
                hi: d1 - 1,
            },
            d1,
            0u64,
        )
    } else if ooo_min < data_min {
        let o1 = ooo_ts.partition_point(|&ts| ts < data_min) as u64;
        (
            Block {
                kind: BlockType::Oo,
                lo: ooo_base,
                hi: ooo_base + o1 - 1,
            },
            0,
            o1,
        )
    } else {
        (Block::NONE, 0, 0)
    };

    // Suffix: batch rows past the partition max stay out-of-line.
    let (suffix, ooo_to) = if ooo_max > data_max {
        let o2 = ooo_ts.partition_point(|&ts| ts <= data_max) as u64;
        (
            Block {
                kind: BlockType::Oo,
                lo: ooo_base + o2,
                hi: ooo_base + n - 1,
            },
            o2,
        )
    } else {
        (Block::NONE, n)
    };

    let merge = if ooo_from < ooo_to {
        MergeBlock {
            kind: BlockType::Merge,
            data_lo: data_from,
            data_hi: rows - 1,
            ooo_lo: ooo_base + ooo_from,
            ooo_hi: ooo_base + ooo_to - 1,
        }
    } else {
        // The batch never reaches into the remaining data rows; they are
        // copied straight through.
        MergeBlock {
            kind: BlockType::Data,
            data_lo: data_from,
            data_hi: rows - 1,
            ooo_lo: 0,
            ooo_hi: 0,
        }
    };

    (prefix, merge, suffix)
}

/// Interleave order for a `Merge` block. On equal timestamps the on-disk row
/// wins, keeping the rewrite stable.
pub fn build_merge_index(
    data_ts: &[i64],
    ooo_ts: &[i64],
    ooo_base: u64,
    merge: &MergeBlock,
) -> Vec<MergeRef> {
    if merge.kind != BlockType::Merge {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(merge.rows() as usize);
    let mut d = merge.data_lo;
    let mut o = merge.ooo_lo;
    while d <= merge.data_hi && o <= merge.ooo_hi {
        let data_v = data_ts[d as usize];
        let ooo_v = ooo_ts[(o - ooo_base) as usize];
        if data_v <= ooo_v {
            out.push(MergeRef {
                source: MergeSource::Data,
                row: d,
            });
            d += 1;
        } else {
            out.push(MergeRef {
                source: MergeSource::Ooo,
                row: o,
            });
            o += 1;
        }
    }
    while d <= merge.data_hi {
        out.push(MergeRef {
            source: MergeSource::Data,
            row: d,
        });
        d += 1;
    }
    while o <= merge.ooo_hi {
        out.push(MergeRef {
            source: MergeSource::Ooo,
            row: o,
        });
        o += 1;
    }
    out
}

/// The table writer's open files for one column of the active partition.
/// `fix` is `<col>.d` for fixed columns and `<col>.i` for var columns.
#[derive(Clone, Debug)]
pub struct ActiveColumn {
    pub fix: Arc<File>,
    pub var: Option<Arc<File>>,
}

/// Everything a single column's planning needs from the commit.
pub struct OpenColumnCtx<'a> {
    pub mode: OpenMode,
    pub partition_dir: &'a Path,
    pub txn: u64,
    pub src_data_max: u64,
    pub ooo_lo: u64,
    pub ooo_hi: u64,
    pub prefix: Block,
    pub merge: MergeBlock,
    pub suffix: Block,
    pub merge_index: Option<Arc<Vec<MergeRef>>>,
    pub publisher: &'a CopyPublisher,
    pub partition: Arc<PartitionCtl>,
}

impl OpenColumnCtx<'_> {
    fn ooo_rows(&self) -> u64 {
        self.ooo_hi - self.ooo_lo + 1
    }

    fn txn_dir(&self) -> PathBuf {
        staged_partition_dir(self.partition_dir, self.txn)
    }
}

/// Staging directory of a partition rewrite.
pub fn staged_partition_dir(partition_dir: &Path, txn: u64) -> PathBuf {
    let mut name = partition_dir.as_os_str().to_os_string();
    name.push(format!(".{txn}"));
    PathBuf::from(name)
}

/// Plan one column of a partition operation and publish its copy tasks.
///
/// All file opening, sizing and mapping happens here; once planning
/// succeeds the block tasks are published (or run inline) and completion is
/// reported through the partition latch. On error nothing is published and
/// the caller accounts the column itself.
pub fn open_column(
    ctx: &OpenColumnCtx<'_>,
    column: &ColumnMeta,
    ooo: &Arc<CommitColumn>,
    active: Option<&ActiveColumn>,
) -> anyhow::Result<()> {
    let tasks = match ctx.mode {
        OpenMode::NewPartitionAppend => plan_new_partition(ctx, column, ooo)?,
        OpenMode::MidPartitionAppend | OpenMode::LastPartitionAppend => {
            plan_append(ctx, column, ooo, active)?
        }
        OpenMode::MidPartitionMerge | OpenMode::LastPartitionMerge => {
            if column.col_type.is_var() {
                plan_merge_var(ctx, column, ooo, active)?
            } else {
                plan_merge_fixed(ctx, column, ooo, active)?
            }
        }
    };
    for task in tasks {
        publish_copy_task(ctx.publisher, task);
    }
    Ok(())
}

/// Queue a copy task, falling back to executing it inline on this thread
/// when the outbound queue is full. Work is never dropped.
fn publish_copy_task(publisher: &CopyPublisher, task: CopyTask) {
    if let Err(task) = publisher.try_publish(task) {
        copy::execute(task);
    }
}

fn open_col_file(dir: &Path, column: &str, suffix: &str) -> anyhow::Result<FileSlot> {
    Ok(FileSlot::owned(fileio::open_rw(
        &dir.join(format!("{column}.{suffix}")),
    )?))
}

/// Write `<col>.top` in `dir`.
fn write_column_top(dir: &Path, column: &str, top: u64) -> anyhow::Result<()> {
    let file = fileio::open_rw(&dir.join(format!("{column}.top")))?;
    fileio::write_i64_at(&file, 0, top as i64)
}

/// Fill `count` values at `offset` with the column type's null pattern.
///
/// # Safety
/// Caller must own the byte range exclusively, as with `SharedMmap::write_at`.
pub unsafe fn set_null(col_type: ColumnType, map: &SharedMmap, offset: usize, count: usize) {
    match col_type {
        ColumnType::Boolean | ColumnType::Byte => map.fill_with(offset, [0u8], count),
        ColumnType::Short | ColumnType::Char => map.fill_with(offset, 0i16.to_le_bytes(), count),
        ColumnType::Int => map.fill_with(offset, INT_NULL.to_le_bytes(), count),
        ColumnType::Float => map.fill_with(offset, f32::NAN.to_le_bytes(), count),
        ColumnType::Symbol => map.fill_with(offset, (-1i32).to_le_bytes(), count),
        ColumnType::Long | ColumnType::Date | ColumnType::Timestamp => {
            map.fill_with(offset, LONG_NULL.to_le_bytes(), count)
        }
        ColumnType::Double => map.fill_with(offset, f64::NAN.to_le_bytes(), count),
        ColumnType::Long256 | ColumnType::String | ColumnType::Binary => {}
    }
}

/// Size of the var value whose header sits at byte `offset` of an open file.
/// Reads the length header and skips the payload: STRING is `i32` plus two
/// bytes per unit, BINARY `i64` plus the byte count.
fn var_end_from_file(
    file: &File,
    col_type: ColumnType,
    last_value_offset: i64,
) -> anyhow::Result<i64> {
    let at = last_value_offset as u64;
    if col_type == ColumnType::String {
        let len = fileio::read_i32_at(file, at)?;
        if len < 1 {
            Ok(last_value_offset + 4)
        } else {
            Ok(last_value_offset + 4 + len as i64 * 2)
        }
    } else {
        let len = fileio::read_i64_at(file, at)?;
        if len < 1 {
            Ok(last_value_offset + 8)
        } else {
            Ok(last_value_offset + 8 + len)
        }
    }
}

/// Append the batch to a partition that does not exist yet.
fn plan_new_partition(
    ctx: &OpenColumnCtx<'_>,
    column: &ColumnMeta,
    ooo: &Arc<CommitColumn>,
) -> anyhow::Result<Vec<CopyTask>> {
    std::fs::create_dir_all(ctx.partition_dir).with_context(|| {
        format!("create partition dir [path={}]", ctx.partition_dir.display())
    })?;
    let rows = ctx.ooo_rows();

    if column.col_type.is_var() {
        let fix = open_col_file(ctx.partition_dir, &column.name, "i")?;
        let var = open_col_file(ctx.partition_dir, &column.name, "d")?;
        let fix_map = SharedMmap::map_rw(&fix.file, rows * 8)?;
        let var_map = SharedMmap::map_rw(&var.file, ooo.var_len_bytes(ctx.ooo_lo, ctx.ooo_hi))?;
        let ctl = ColumnCtl::new(
            1,
            ColumnResources {
                dst_maps: vec![Arc::clone(&fix_map), Arc::clone(&var_map)],
                src_maps: Vec::new(),
                files: vec![fix, var],
            },
            Arc::clone(&ctx.partition),
        );
        return Ok(vec![oo_task(ctx, column, ooo, fix_map, 0, Some((var_map, 0)), 0, ctl)]);
    }

    let size = column.col_type.fixed_size().unwrap();
    let fix = open_col_file(ctx.partition_dir, &column.name, "d")?;
    let fix_map = SharedMmap::map_rw(&fix.file, rows * size as u64)?;
    let mut files = vec![fix];
    if column.indexed {
        files.push(open_col_file(ctx.partition_dir, &column.name, "k")?);
        files.push(open_col_file(ctx.partition_dir, &column.name, "v")?);
    }
    let ctl = ColumnCtl::new(
        1,
        ColumnResources {
            dst_maps: vec![Arc::clone(&fix_map)],
            src_maps: Vec::new(),
            files,
        },
        Arc::clone(&ctx.partition),
    );
    Ok(vec![oo_task(ctx, column, ooo, fix_map, 0, None, 0, ctl)])
}

/// Append the batch past the existing rows of a partition, in place.
fn plan_append(
    ctx: &OpenColumnCtx<'_>,
    column: &ColumnMeta,
    ooo: &Arc<CommitColumn>,
    active: Option<&ActiveColumn>,
) -> anyhow::Result<Vec<CopyTask>> {
    let mut top = table::src_data_top(ctx.partition_dir, &column.name, ctx.src_data_max)?;
    if top == ctx.src_data_max && top > 0 {
        // The column is created by this very append; record where it starts.
        write_column_top(ctx.partition_dir, &column.name, top)?;
    }
    let rows = ctx.ooo_rows();
    let dst_len = rows + ctx.src_data_max - top;

    if column.col_type.is_var() {
        let (fix, var) = match active {
            Some(a) => (FileSlot::shared(&a.fix), FileSlot::shared(a.var.as_ref().unwrap())),
            None => (
                open_col_file(ctx.partition_dir, &column.name, "i")?,
                open_col_file(ctx.partition_dir, &column.name, "d")?,
            ),
        };
        let fix_map = SharedMmap::map_rw(&fix.file, dst_len * 8)?;
        let fix_offset = ((ctx.src_data_max - top) * 8) as usize;
        let var_offset = if fix_offset > 0 {
            var_end_from_file(&var.file, column.col_type, fix_map.read_i64(fix_offset - 8))?
                as usize
        } else {
            0
        };
        let var_size = var_offset as u64 + ooo.var_len_bytes(ctx.ooo_lo, ctx.ooo_hi);
        let var_map = SharedMmap::map_rw(&var.file, var_size)?;
        let ctl = ColumnCtl::new(
            1,
            ColumnResources {
                dst_maps: vec![Arc::clone(&fix_map), Arc::clone(&var_map)],
                src_maps: Vec::new(),
                files: vec![fix, var],
            },
            Arc::clone(&ctx.partition),
        );
        return Ok(vec![oo_task(
            ctx,
            column,
            ooo,
            fix_map,
            fix_offset,
            Some((var_map, var_offset)),
            ctx.src_data_max - top,
            ctl,
        )]);
    }

    let size = column.col_type.fixed_size().unwrap();
    let fix = match active {
        Some(a) => FileSlot::shared(&a.fix),
        None => open_col_file(ctx.partition_dir, &column.name, "d")?,
    };
    let fix_map = SharedMmap::map_rw(&fix.file, dst_len * size as u64)?;
    let fix_offset = (ctx.src_data_max - top) as usize * size;
    let mut files = vec![fix];
    if column.indexed {
        files.push(open_col_file(ctx.partition_dir, &column.name, "k")?);
        files.push(open_col_file(ctx.partition_dir, &column.name, "v")?);
    }
    let ctl = ColumnCtl::new(
        1,
        ColumnResources {
            dst_maps: vec![Arc::clone(&fix_map)],
            src_maps: Vec::new(),
            files,
        },
        Arc::clone(&ctx.partition),
    );
    Ok(vec![oo_task(ctx, column, ooo, fix_map, fix_offset, None, 0, ctl)])
}

/// Build the single Oo-block task shared by the append planners.
#[allow(clippy::too_many_arguments)]
fn oo_task(
    ctx: &OpenColumnCtx<'_>,
    column: &ColumnMeta,
    ooo: &Arc<CommitColumn>,
    dst_fix: Arc<SharedMmap>,
    dst_fix_offset: usize,
    dst_var: Option<(Arc<SharedMmap>, usize)>,
    dst_row: u64,
    ctl: Arc<ColumnCtl>,
) -> CopyTask {
    let (dst_var, dst_var_offset) = match dst_var {
        Some((map, offset)) => (Some(map), offset),
        None => (None, 0),
    };
    CopyTask {
        block: BlockType::Oo,
        col_type: column.col_type,
        merge_index: None,
        ooo: Some(Arc::clone(ooo)),
        ooo_lo: ctx.ooo_lo,
        ooo_hi: ctx.ooo_hi,
        src_fix: None,
        src_fix_offset: 0,
        src_var: None,
        src_var_offset: 0,
        src_lo: 0,
        src_hi: 0,
        src_row_shift: 0,
        dst_fix,
        dst_fix_offset,
        dst_var,
        dst_var_offset,
        dst_row,
        ctl,
    }
}

/// Rewrite a partition by merging the batch with its fixed-width column.
fn plan_merge_fixed(
    ctx: &OpenColumnCtx<'_>,
    column: &ColumnMeta,
    ooo: &Arc<CommitColumn>,
    active: Option<&ActiveColumn>,
) -> anyhow::Result<Vec<CopyTask>> {
    let size = column.col_type.fixed_size().unwrap();
    let txn_dir = ctx.txn_dir();
    std::fs::create_dir_all(&txn_dir)
        .with_context(|| format!("create staging dir [path={}]", txn_dir.display()))?;

    let src_slot = match active {
        Some(a) => FileSlot::shared(&a.fix),
        None => open_col_file(ctx.partition_dir, &column.name, "d")?,
    };

    let mut top = table::src_data_top(ctx.partition_dir, &column.name, ctx.src_data_max)?;
    let mut prefix = ctx.prefix;
    let mut suffix = ctx.suffix;
    let mut src_row_shift = 0u64;
    let src_fix_offset;
    let src_map;

    if top > 0 {
        let actual = (ctx.src_data_max - top) as usize * size;
        let max_bytes = ctx.src_data_max as usize * size;
        if top > prefix.hi || prefix.kind == BlockType::Oo {
            // The rewrite reaches into the null region: extend the source
            // down so every table row is physically addressable, then treat
            // the column as having no top.
            src_map = SharedMmap::map_rw(&src_slot.file, (actual + max_bytes) as u64)?;
            unsafe {
                // SAFETY: the extension region is untouched by anything else
                // until the copy tasks run, and they only read it.
                set_null(column.col_type, &src_map, actual, top as usize);
                if actual > 0 {
                    let original = src_map.read_at(0, actual).to_vec();
                    src_map.write_at(max_bytes, &original);
                }
            }
            src_fix_offset = actual;
            top = 0;
        } else {
            // The nulls sit wholly inside a data prefix; keep them virtual
            // and carry the top over to the rewritten partition.
            write_column_top(&txn_dir, &column.name, top)?;
            src_map = SharedMmap::map_rw(&src_slot.file, actual as u64)?;
            src_fix_offset = 0;
            src_row_shift = top;
            if prefix.kind == BlockType::Data {
                prefix.hi -= top;
            }
            if suffix.kind == BlockType::Data {
                suffix.lo -= top;
                suffix.hi -= top;
            }
        }
    } else {
        src_map = SharedMmap::map_rw(&src_slot.file, ctx.src_data_max * size as u64)?;
        src_fix_offset = 0;
    }

    let dst_len = ctx.ooo_rows() + ctx.src_data_max - top;
    let dst_slot = open_col_file(&txn_dir, &column.name, "d")?;
    let dst_map = SharedMmap::map_rw(&dst_slot.file, dst_len * size as u64)?;

    let append_offset_1 = prefix.rows() as usize * size;
    let append_offset_2 = append_offset_1 + ctx.merge.rows() as usize * size;

    let mut files = vec![src_slot, dst_slot];
    if column.indexed {
        files.push(open_col_file(&txn_dir, &column.name, "k")?);
        files.push(open_col_file(&txn_dir, &column.name, "v")?);
    }

    let part_count = [prefix.kind, ctx.merge.kind, suffix.kind]
        .iter()
        .filter(|k| **k != BlockType::None)
        .count() as i32;
    let ctl = ColumnCtl::new(
        part_count,
        ColumnResources {
            dst_maps: vec![Arc::clone(&dst_map)],
            src_maps: vec![Arc::clone(&src_map)],
            files,
        },
        Arc::clone(&ctx.partition),
    );

    let mut tasks = Vec::with_capacity(part_count as usize);
    let mut push = |block: BlockType, lo: u64, hi: u64, dst_offset: usize, shift: u64| {
        tasks.push(CopyTask {
            block,
            col_type: column.col_type,
            merge_index: ctx.merge_index.clone(),
            ooo: Some(Arc::clone(ooo)),
            ooo_lo: if block == BlockType::Oo { lo } else { ctx.merge.ooo_lo },
            ooo_hi: if block == BlockType::Oo { hi } else { ctx.merge.ooo_hi },
            src_fix: Some(Arc::clone(&src_map)),
            src_fix_offset,
            src_var: None,
            src_var_offset: 0,
            src_lo: if block == BlockType::Data { lo } else { 0 },
            src_hi: if block == BlockType::Data { hi } else { 0 },
            src_row_shift: shift,
            dst_fix: Arc::clone(&dst_map),
            dst_fix_offset: dst_offset,
            dst_var: None,
            dst_var_offset: 0,
            dst_row: 0,
            ctl: Arc::clone(&ctl),
        });
    };

    if prefix.kind != BlockType::None {
        push(prefix.kind, prefix.lo, prefix.hi, 0, 0);
    }
    match ctx.merge.kind {
        BlockType::Merge => push(BlockType::Merge, 0, 0, append_offset_1, src_row_shift),
        BlockType::Data => push(
            BlockType::Data,
            ctx.merge.data_lo.saturating_sub(src_row_shift),
            ctx.merge.data_hi - src_row_shift,
            append_offset_1,
            0,
        ),
        _ => {}
    }
    if suffix.kind != BlockType::None {
        push(suffix.kind, suffix.lo, suffix.hi, append_offset_2, 0);
    }
    Ok(tasks)
}

/// Rewrite a partition by merging the batch with a var-width column.
fn plan_merge_var(
    ctx: &OpenColumnCtx<'_>,
    column: &ColumnMeta,
    ooo: &Arc<CommitColumn>,
    active: Option<&ActiveColumn>,
) -> anyhow::Result<Vec<CopyTask>> {
    let txn_dir = ctx.txn_dir();
    std::fs::create_dir_all(&txn_dir)
        .with_context(|| format!("create staging dir [path={}]", txn_dir.display()))?;
    let header = column.col_type.var_header_size();

    let (fix_slot, var_slot) = match active {
        Some(a) => (
            FileSlot::shared(&a.fix),
            FileSlot::shared(a.var.as_ref().unwrap()),
        ),
        None => (
            open_col_file(ctx.partition_dir, &column.name, "i")?,
            open_col_file(ctx.partition_dir, &column.name, "d")?,
        ),
    };

    let mut top = table::src_data_top(ctx.partition_dir, &column.name, ctx.src_data_max)?;
    let mut prefix = ctx.prefix;
    let mut suffix = ctx.suffix;
    let mut src_row_shift = 0u64;
    let src_fix_offset;
    let src_fix_map;
    let src_var_map;

    if top > 0 {
        let actual = (ctx.src_data_max - top) as usize * 8;
        if top > prefix.hi || prefix.kind == BlockType::Oo {
            // Extend down: append null sentinels to the var blob and build a
            // complete index (nulls first, then the original entries) after
            // the original one.
            src_fix_map =
                SharedMmap::map_rw(&fix_slot.file, (actual + ctx.src_data_max as usize * 8) as u64)?;
            let var_size = if actual > 0 {
                var_end_from_file(
                    &var_slot.file,
                    column.col_type,
                    src_fix_map.read_i64(actual - 8),
                )? as usize
            } else {
                0
            };
            src_var_map =
                SharedMmap::map_rw(&var_slot.file, (var_size + top as usize * header) as u64)?;
            unsafe {
                // SAFETY: nothing reads these regions until the tasks run.
                if column.col_type == ColumnType::String {
                    src_var_map.fill_with(var_size, (-1i32).to_le_bytes(), top as usize);
                } else {
                    src_var_map.fill_with(var_size, (-1i64).to_le_bytes(), top as usize);
                }
                for k in 0..top as usize {
                    let entry = (var_size + k * header) as i64;
                    src_fix_map.write_at(actual + k * 8, &entry.to_le_bytes());
                }
                if actual > 0 {
                    let original = src_fix_map.read_at(0, actual).to_vec();
                    src_fix_map.write_at(actual + top as usize * 8, &original);
                }
            }
            src_fix_offset = actual;
            top = 0;
        } else {
            write_column_top(&txn_dir, &column.name, top)?;
            src_fix_map = SharedMmap::map_rw(&fix_slot.file, actual as u64)?;
            let var_size = if actual > 0 {
                var_end_from_file(
                    &var_slot.file,
                    column.col_type,
                    src_fix_map.read_i64(actual - 8),
                )? as usize
            } else {
                0
            };
            src_var_map = SharedMmap::map_rw(&var_slot.file, var_size.max(1) as u64)?;
            src_fix_offset = 0;
            src_row_shift = top;
            if prefix.kind == BlockType::Data {
                prefix.hi -= top;
            }
            if suffix.kind == BlockType::Data {
                suffix.lo -= top;
                suffix.hi -= top;
            }
        }
    } else {
        src_fix_map = SharedMmap::map_rw(&fix_slot.file, ctx.src_data_max * 8)?;
        let var_size = if ctx.src_data_max > 0 {
            var_end_from_file(
                &var_slot.file,
                column.col_type,
                src_fix_map.read_i64((ctx.src_data_max as usize - 1) * 8),
            )? as usize
        } else {
            0
        };
        src_var_map = SharedMmap::map_rw(&var_slot.file, var_size.max(1) as u64)?;
        src_fix_offset = 0;
    }

    // Var bytes of a file-row range, walking entries value by value (the
    // extended index is not monotonic across its null region).
    let data_var_len = |lo: u64, hi: u64| -> u64 {
        let mut total = 0u64;
        for row in lo..=hi {
            let entry = src_fix_map.read_i64(src_fix_offset + row as usize * 8);
            total += copy::var_value_len(column.col_type, &src_var_map, entry as usize) as u64;
        }
        total
    };

    let prefix_var = match prefix.kind {
        BlockType::Oo => ooo.var_len_bytes(prefix.lo, prefix.hi),
        BlockType::Data => data_var_len(prefix.lo, prefix.hi),
        _ => 0,
    };
    let merge_var = match ctx.merge.kind {
        BlockType::Merge => {
            ooo.var_len_bytes(ctx.merge.ooo_lo, ctx.merge.ooo_hi)
                + data_var_len(
                    ctx.merge.data_lo - src_row_shift,
                    ctx.merge.data_hi - src_row_shift,
                )
        }
        BlockType::Data => data_var_len(
            ctx.merge.data_lo.saturating_sub(src_row_shift),
            ctx.merge.data_hi - src_row_shift,
        ),
        _ => 0,
    };
    let suffix_var = match suffix.kind {
        BlockType::Oo => ooo.var_len_bytes(suffix.lo, suffix.hi),
        BlockType::Data => data_var_len(suffix.lo, suffix.hi),
        _ => 0,
    };

    let dst_len = ctx.ooo_rows() + ctx.src_data_max - top;
    let dst_fix_slot = open_col_file(&txn_dir, &column.name, "i")?;
    let dst_fix_map = SharedMmap::map_rw(&dst_fix_slot.file, dst_len * 8)?;
    let dst_var_slot = open_col_file(&txn_dir, &column.name, "d")?;
    let dst_var_map =
        SharedMmap::map_rw(&dst_var_slot.file, prefix_var + merge_var + suffix_var)?;

    let part_count = [prefix.kind, ctx.merge.kind, suffix.kind]
        .iter()
        .filter(|k| **k != BlockType::None)
        .count() as i32;
    let ctl = ColumnCtl::new(
        part_count,
        ColumnResources {
            dst_maps: vec![Arc::clone(&dst_fix_map), Arc::clone(&dst_var_map)],
            src_maps: vec![Arc::clone(&src_fix_map), Arc::clone(&src_var_map)],
            files: vec![fix_slot, var_slot, dst_fix_slot, dst_var_slot],
        },
        Arc::clone(&ctx.partition),
    );

    let mut tasks = Vec::with_capacity(part_count as usize);
    let mut push = |block: BlockType, lo: u64, hi: u64, dst_row: u64, var_offset: u64, shift: u64| {
        tasks.push(CopyTask {
            block,
            col_type: column.col_type,
            merge_index: ctx.merge_index.clone(),
            ooo: Some(Arc::clone(ooo)),
            ooo_lo: if block == BlockType::Oo { lo } else { ctx.merge.ooo_lo },
            ooo_hi: if block == BlockType::Oo { hi } else { ctx.merge.ooo_hi },
            src_fix: Some(Arc::clone(&src_fix_map)),
            src_fix_offset,
            src_var: Some(Arc::clone(&src_var_map)),
            src_var_offset: 0,
            src_lo: if block == BlockType::Data { lo } else { 0 },
            src_hi: if block == BlockType::Data { hi } else { 0 },
            src_row_shift: shift,
            dst_fix: Arc::clone(&dst_fix_map),
            dst_fix_offset: 0,
            dst_var: Some(Arc::clone(&dst_var_map)),
            dst_var_offset: var_offset as usize,
            dst_row,
            ctl: Arc::clone(&ctl),
        });
    };

    let merge_dst_row = prefix.rows();
    let suffix_dst_row = merge_dst_row + ctx.merge.rows();
    if prefix.kind != BlockType::None {
        push(prefix.kind, prefix.lo, prefix.hi, 0, 0, 0);
    }
    match ctx.merge.kind {
        BlockType::Merge => push(
            BlockType::Merge,
            0,
            0,
            merge_dst_row,
            prefix_var,
            src_row_shift,
        ),
        BlockType::Data => push(
            BlockType::Data,
            ctx.merge.data_lo.saturating_sub(src_row_shift),
            ctx.merge.data_hi - src_row_shift,
            merge_dst_row,
            prefix_var,
            0,
        ),
        _ => {}
    }
    if suffix.kind != BlockType::None {
        push(
            suffix.kind,
            suffix.lo,
            suffix.hi,
            suffix_dst_row,
            prefix_var + merge_var,
            0,
        );
    }
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_interleaved_batch() {
        // Disk [100, 200, 300], batch [150, 250]: data prefix, merge to the
        // end of the partition, no suffix.
        let (prefix, merge, suffix) = classify(&[100, 200, 300], &[150, 250], 0);
        assert_eq!(
            prefix,
            Block {
                kind: BlockType::Data,
                lo: 0,
                hi: 0
            }
        );
        assert_eq!(merge.kind, BlockType::Merge);
        assert_eq!((merge.data_lo, merge.data_hi), (1, 2));
        assert_eq!((merge.ooo_lo, merge.ooo_hi), (0, 1));
        assert_eq!(suffix.kind, BlockType::None);

        let index = build_merge_index(&[100, 200, 300], &[150, 250], 0, &merge);
        let order: Vec<(MergeSource, u64)> = index.iter().map(|r| (r.source, r.row)).collect();
        assert_eq!(
            order,
            vec![
                (MergeSource::Ooo, 0),
                (MergeSource::Data, 1),
                (MergeSource::Ooo, 1),
                (MergeSource::Data, 2),
            ]
        );
    }

    #[test]
    fn batch_before_partition_needs_no_merge() {
        let (prefix, merge, suffix) = classify(&[100, 200], &[10, 20], 5);
        assert_eq!(
            prefix,
            Block {
                kind: BlockType::Oo,
                lo: 5,
                hi: 6
            }
        );
        assert_eq!(merge.kind, BlockType::None);
        assert_eq!(
            suffix,
            Block {
                kind: BlockType::Data,
                lo: 0,
                hi: 1
            }
        );
    }

    #[test]
    fn batch_straddling_both_ends() {
        // Disk [100, 200], batch [50, 300]: Oo prefix, straight data copy,
        // Oo suffix.
        let (prefix, merge, suffix) = classify(&[100, 200], &[50, 300], 0);
        assert_eq!(prefix.kind, BlockType::Oo);
        assert_eq!((prefix.lo, prefix.hi), (0, 0));
        assert_eq!(merge.kind, BlockType::Data);
        assert_eq!((merge.data_lo, merge.data_hi), (0, 1));
        assert_eq!(suffix.kind, BlockType::Oo);
        assert_eq!((suffix.lo, suffix.hi), (1, 1));
    }

    #[test]
    fn equal_timestamps_keep_disk_rows_first() {
        let (_, merge, _) = classify(&[100, 200], &[100, 200], 0);
        let index = build_merge_index(&[100, 200], &[100, 200], 0, &merge);
        let order: Vec<(MergeSource, u64)> = index.iter().map(|r| (r.source, r.row)).collect();
        assert_eq!(
            order,
            vec![
                (MergeSource::Data, 0),
                (MergeSource::Ooo, 0),
                (MergeSource::Data, 1),
                (MergeSource::Ooo, 1),
            ]
        );
    }

    #[test]
    fn merge_rewrite_produces_exact_sizes_and_order() {
        let dir = std::env::temp_dir().join(format!(
            "strata-ooo-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let pdir = dir.join("default");
        std::fs::create_dir_all(&pdir).unwrap();
        let file = fileio::open_rw(&pdir.join("v.d")).unwrap();
        for (i, v) in [10i64, 20, 30].iter().enumerate() {
            fileio::write_i64_at(&file, i as u64 * 8, *v).unwrap();
        }
        drop(file);

        let data_ts = [10i64, 20, 30];
        let ooo_ts = [15i64, 25];
        let (prefix, merge, suffix) = classify(&data_ts, &ooo_ts, 0);
        let merge_index = Arc::new(build_merge_index(&data_ts, &ooo_ts, 0, &merge));
        let mut data = Vec::new();
        for v in ooo_ts {
            data.extend_from_slice(&v.to_le_bytes());
        }
        let ooo = Arc::new(CommitColumn::Fixed { size: 8, data });

        let ctl = PartitionCtl::new(1);
        let publisher = CopyPublisher::inline_only();
        let ctx = OpenColumnCtx {
            mode: OpenMode::MidPartitionMerge,
            partition_dir: &pdir,
            txn: 1,
            src_data_max: 3,
            ooo_lo: 0,
            ooo_hi: 1,
            prefix,
            merge,
            suffix,
            merge_index: Some(merge_index),
            publisher: &publisher,
            partition: Arc::clone(&ctl),
        };
        let column = ColumnMeta {
            name: "v".to_string(),
            col_type: ColumnType::Long,
            indexed: false,
        };
        open_column(&ctx, &column, &ooo, None).unwrap();
        ctl.wait().unwrap();

        // dst rows == batch rows + (src_data_max - src_data_top), bytes exact.
        let staged = staged_partition_dir(&pdir, 1);
        let bytes = std::fs::read(staged.join("v.d")).unwrap();
        assert_eq!(bytes.len(), 5 * 8);
        let values: Vec<i64> = bytes
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(values, vec![10, 15, 20, 25, 30]);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn null_patterns_round_trip() {
        let dir = std::env::temp_dir().join(format!(
            "strata-nulls-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let file = fileio::open_rw(&dir.join("n.d")).unwrap();
        let map = SharedMmap::map_rw(&file, 64).unwrap();

        unsafe { set_null(ColumnType::Int, &map, 0, 4) };
        for i in 0..4 {
            let v = i32::from_le_bytes(map.read_at(i * 4, 4).try_into().unwrap());
            assert_eq!(v, INT_NULL);
        }
        unsafe { set_null(ColumnType::Symbol, &map, 0, 4) };
        for i in 0..4 {
            let v = i32::from_le_bytes(map.read_at(i * 4, 4).try_into().unwrap());
            assert_eq!(v, -1);
        }
        unsafe { set_null(ColumnType::Long, &map, 0, 4) };
        for i in 0..4 {
            assert_eq!(map.read_i64(i * 8), LONG_NULL);
        }
        unsafe { set_null(ColumnType::Double, &map, 0, 4) };
        for i in 0..4 {
            let v = f64::from_bits(map.read_i64(i * 8) as u64);
            assert!(v.is_nan());
        }
        unsafe { set_null(ColumnType::Float, &map, 0, 4) };
        for i in 0..4 {
            let v = f32::from_le_bytes(map.read_at(i * 4, 4).try_into().unwrap());
            assert!(v.is_nan());
        }
        unsafe { set_null(ColumnType::Boolean, &map, 0, 8) };
        assert!(map.read_at(0, 8).iter().all(|&b| b == 0));
        unsafe { set_null(ColumnType::Short, &map, 0, 4) };
        assert!(map.read_at(0, 8).iter().all(|&b| b == 0));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn dst_len_matches_the_size_law() {
        // dst rows == batch rows + (src_data_max - src_data_top) regardless
        // of how the blocks split.
        let data: Vec<i64> = (0..10).map(|i| 100 + i * 10).collect();
        let ooo: Vec<i64> = vec![95, 125, 155, 500];
        let (prefix, merge, suffix) = classify(&data, &ooo, 0);
        let total = prefix.rows() + merge.rows() + suffix.rows();
        assert_eq!(total, ooo.len() as u64 + data.len() as u64);
    }
}
