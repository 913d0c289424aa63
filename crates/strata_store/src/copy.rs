//! Out-of-order copy execution.
//!
//! The merge planner publishes one `CopyTask` per partition-rewrite block.
//! Tasks are drained by a small worker pool; when the outbound queue is full
//! the planner runs the copy inline on its own thread, so a rewrite always
//! makes forward progress. Completion is tracked by two counters: parts
//! within a column, then columns within the partition, which releases the
//! committing writer's latch.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TryRecvError, TrySendError};
use std::sync::{Arc, Condvar, Mutex};

use crate::fileio::{FileSlot, SharedMmap};
use crate::ooo::{BlockType, CommitColumn, MergeRef, MergeSource};
use crate::pool::Job;
use crate::table::ColumnType;

/// One block copy of a partition rewrite.
pub struct CopyTask {
    pub block: BlockType,
    pub col_type: ColumnType,
    /// Interleave order for `Merge` blocks, in table-row coordinates.
    pub merge_index: Option<Arc<Vec<MergeRef>>>,

    // Out-of-order source: the commit batch column.
    pub ooo: Option<Arc<CommitColumn>>,
    pub ooo_lo: u64,
    pub ooo_hi: u64,

    // On-disk source, mapped by the planner. Row coordinates in `src_lo`/
    // `src_hi` are file rows; merge-index rows are table rows and are
    // shifted down by `src_row_shift` (the column top) before addressing.
    pub src_fix: Option<Arc<SharedMmap>>,
    pub src_fix_offset: usize,
    pub src_var: Option<Arc<SharedMmap>>,
    pub src_var_offset: usize,
    pub src_lo: u64,
    pub src_hi: u64,
    pub src_row_shift: u64,

    // Destination mappings and append offsets.
    pub dst_fix: Arc<SharedMmap>,
    pub dst_fix_offset: usize,
    pub dst_var: Option<Arc<SharedMmap>>,
    pub dst_var_offset: usize,
    /// Row position of this block in the destination, for var index entries.
    pub dst_row: u64,

    pub ctl: Arc<ColumnCtl>,
}

impl std::fmt::Debug for CopyTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyTask")
            .field("block", &self.block)
            .field("col_type", &self.col_type)
            .finish()
    }
}

/// Everything that must stay alive (and get flushed/closed) until the last
/// part of a column lands.
#[derive(Default)]
pub struct ColumnResources {
    pub dst_maps: Vec<Arc<SharedMmap>>,
    pub src_maps: Vec<Arc<SharedMmap>>,
    pub files: Vec<FileSlot>,
}

/// Per-column completion state: counts outstanding block copies, then
/// releases the column's file resources and notifies the partition.
pub struct ColumnCtl {
    parts: AtomicI32,
    resources: Mutex<Option<ColumnResources>>,
    partition: Arc<PartitionCtl>,
}

impl ColumnCtl {
    pub fn new(parts: i32, resources: ColumnResources, partition: Arc<PartitionCtl>) -> Arc<Self> {
        Arc::new(Self {
            parts: AtomicI32::new(parts),
            resources: Mutex::new(Some(resources)),
            partition,
        })
    }

    pub fn partition(&self) -> &Arc<PartitionCtl> {
        &self.partition
    }

    /// Mark one block done. The last block flushes destination mappings,
    /// drops source mappings (unmapping them) and closes planner-owned
    /// files, then counts the column down on the partition.
    pub fn part_done(&self) {
        if self.parts.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let resources = self.resources.lock().unwrap().take();
        if let Some(resources) = resources {
            for map in &resources.dst_maps {
                if let Err(err) = map.flush() {
                    self.partition.fail(format!("column flush failed: {err:#}"));
                }
            }
            drop(resources);
        }
        self.partition.column_done();
    }
}

/// Per-partition completion latch the committing writer waits on.
pub struct PartitionCtl {
    remaining: Mutex<usize>,
    done: Condvar,
    error: Mutex<Option<String>>,
}

impl PartitionCtl {
    pub fn new(columns: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: Mutex::new(columns),
            done: Condvar::new(),
            error: Mutex::new(None),
        })
    }

    pub fn column_done(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.done.notify_all();
        }
    }

    /// Record the first failure; the rewrite still drains so resources are
    /// released before the writer observes the error.
    pub fn fail(&self, message: String) {
        let mut error = self.error.lock().unwrap();
        if error.is_none() {
            *error = Some(message);
        }
    }

    /// Block until every column completed, then surface any recorded error.
    pub fn wait(&self) -> anyhow::Result<()> {
        let mut remaining = self.remaining.lock().unwrap();
        while *remaining > 0 {
            remaining = self.done.wait(remaining).unwrap();
        }
        drop(remaining);
        match self.error.lock().unwrap().take() {
            None => Ok(()),
            Some(message) => Err(anyhow::anyhow!(message)),
        }
    }
}

/// Producer handle for the copy queue.
#[derive(Clone)]
pub struct CopyPublisher {
    tx: Option<SyncSender<CopyTask>>,
}

impl CopyPublisher {
    /// A publisher with no queue behind it; every task runs inline. Used by
    /// standalone writers and tests.
    pub fn inline_only() -> Self {
        Self { tx: None }
    }

    /// Queue the task, or hand it back when the queue is full or gone so the
    /// caller can run it inline. Work is never dropped.
    pub fn try_publish(&self, task: CopyTask) -> Result<(), CopyTask> {
        match &self.tx {
            None => Err(task),
            Some(tx) => match tx.try_send(task) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => Err(task),
            },
        }
    }
}

impl std::fmt::Debug for CopyPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyPublisher")
            .field("queued", &self.tx.is_some())
            .finish()
    }
}

/// Build the bounded copy queue and its shared consumer end.
pub fn copy_queue(capacity: usize) -> (CopyPublisher, Arc<Mutex<Receiver<CopyTask>>>) {
    let (tx, rx) = sync_channel(capacity.max(1));
    (CopyPublisher { tx: Some(tx) }, Arc::new(Mutex::new(rx)))
}

/// Worker-pool job draining the copy queue. Workers compete for tasks.
pub struct CopyJob {
    rx: Arc<Mutex<Receiver<CopyTask>>>,
}

impl CopyJob {
    pub fn new(rx: Arc<Mutex<Receiver<CopyTask>>>) -> Self {
        Self { rx }
    }
}

impl Job for CopyJob {
    fn run(&mut self, _worker_id: usize) -> bool {
        let mut busy = false;
        loop {
            let task = match self.rx.lock().unwrap().try_recv() {
                Ok(task) => task,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            };
            execute(task);
            busy = true;
        }
        busy
    }
}

/// Run one block copy and account for it. Copy failures are recorded on the
/// partition latch; completion always counts down so the writer never hangs.
pub fn execute(task: CopyTask) {
    let ctl = Arc::clone(&task.ctl);
    if let Err(err) = run_copy(&task) {
        ctl.partition().fail(format!("{err:#}"));
    }
    drop(task);
    ctl.part_done();
}

fn run_copy(task: &CopyTask) -> anyhow::Result<()> {
    if task.col_type.is_var() {
        copy_var(task)
    } else {
        copy_fixed(task)
    }
}

fn copy_fixed(task: &CopyTask) -> anyhow::Result<()> {
    let size = task.col_type.fixed_size().unwrap();
    match task.block {
        BlockType::Oo => {
            let ooo = task.ooo.as_ref().unwrap();
            let bytes = ooo.fixed_slice(task.ooo_lo, task.ooo_hi);
            // SAFETY: the planner assigns this block a window no other task
            // of the column overlaps.
            unsafe { task.dst_fix.write_at(task.dst_fix_offset, bytes) };
        }
        BlockType::Data => {
            let src = task.src_fix.as_ref().unwrap();
            let rows = (task.src_hi - task.src_lo + 1) as usize;
            let bytes = src.read_at(task.src_fix_offset + task.src_lo as usize * size, rows * size);
            // SAFETY: disjoint destination window, as above.
            unsafe { task.dst_fix.write_at(task.dst_fix_offset, bytes) };
        }
        BlockType::Merge => {
            let ooo = task.ooo.as_ref().unwrap();
            let src = task.src_fix.as_ref().unwrap();
            let index = task.merge_index.as_ref().unwrap();
            let mut at = task.dst_fix_offset;
            for merge_ref in index.iter() {
                let bytes = match merge_ref.source {
                    MergeSource::Ooo => ooo.fixed_slice(merge_ref.row, merge_ref.row),
                    MergeSource::Data => {
                        let row = (merge_ref.row - task.src_row_shift) as usize;
                        src.read_at(task.src_fix_offset + row * size, size)
                    }
                };
                // SAFETY: sequential writes within this block's window.
                unsafe { task.dst_fix.write_at(at, bytes) };
                at += size;
            }
        }
        BlockType::None => {}
    }
    Ok(())
}

fn copy_var(task: &CopyTask) -> anyhow::Result<()> {
    let dst_var = task.dst_var.as_ref().unwrap();
    let mut var_at = task.dst_var_offset;
    let mut row = task.dst_row as usize;

    let write_value = |bytes: &[u8], var_at: &mut usize, row: &mut usize| {
        // SAFETY: each block owns disjoint index and data windows; rows and
        // var offsets advance monotonically inside the block.
        unsafe {
            task.dst_fix
                .write_at(*row * 8, &(*var_at as i64).to_le_bytes());
            dst_var.write_at(*var_at, bytes);
        }
        *var_at += bytes.len();
        *row += 1;
    };

    match task.block {
        BlockType::Oo => {
            let ooo = task.ooo.as_ref().unwrap();
            for r in task.ooo_lo..=task.ooo_hi {
                write_value(ooo.var_value(r), &mut var_at, &mut row);
            }
        }
        BlockType::Data => {
            for r in task.src_lo..=task.src_hi {
                let bytes = data_var_value(task, r)?;
                write_value(bytes, &mut var_at, &mut row);
            }
        }
        BlockType::Merge => {
            let ooo = task.ooo.as_ref().unwrap();
            let index = task.merge_index.as_ref().unwrap();
            for merge_ref in index.iter() {
                let bytes = match merge_ref.source {
                    MergeSource::Ooo => ooo.var_value(merge_ref.row),
                    MergeSource::Data => data_var_value(task, merge_ref.row - task.src_row_shift)?,
                };
                write_value(bytes, &mut var_at, &mut row);
            }
        }
        BlockType::None => {}
    }
    Ok(())
}

/// Header-plus-payload bytes of a var value at file row `row`.
fn data_var_value(task: &CopyTask, row: u64) -> anyhow::Result<&[u8]> {
    let fix = task.src_fix.as_ref().unwrap();
    let var = task.src_var.as_ref().unwrap();
    let entry = fix.read_i64(task.src_fix_offset + row as usize * 8);
    anyhow::ensure!(entry >= 0, "corrupt var index entry [row={row}]");
    let at = task.src_var_offset + entry as usize;
    let total = var_value_len(task.col_type, var, at);
    Ok(var.read_at(at, total))
}

/// Total stored bytes of the var value whose header sits at `at`.
pub fn var_value_len(col_type: ColumnType, map: &SharedMmap, at: usize) -> usize {
    match col_type {
        ColumnType::String => {
            let len = i32::from_le_bytes(map.read_at(at, 4).try_into().unwrap());
            if len < 1 {
                4
            } else {
                4 + len as usize * 2
            }
        }
        _ => {
            let len = map.read_i64(at);
            if len < 1 {
                8
            } else {
                8 + len as usize
            }
        }
    }
}
