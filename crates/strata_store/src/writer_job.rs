//! The writer-thread job: drains the dispatch queue, applies rows through
//! the table writer, and participates in rebalance and release handshakes.

use std::sync::Arc;

use anyhow::{bail, Context};

use crate::catalog::{micros_now, millis_now, TableUpdateDetails, WriterSlot};
use crate::event::{EventDecoder, EventKind};
use crate::line::{EntityType, NULL_TIMESTAMP};
use crate::pool::Job;
use crate::queue::{ConsumerCursor, DispatchQueue, SubNext};
use crate::scheduler::Scheduler;
use crate::table::{default_column_type, valid_name, ColumnType, Engine};

pub struct WriterJob {
    worker_id: i32,
    scheduler: Arc<Scheduler>,
    engine: Arc<Engine>,
    queue: Arc<DispatchQueue>,
    cursor: Arc<ConsumerCursor>,
    assigned_tables: Vec<Arc<TableUpdateDetails>>,
    last_maintenance_ms: i64,
}

impl WriterJob {
    pub fn new(worker_id: usize, scheduler: Arc<Scheduler>) -> Self {
        let queue = Arc::clone(scheduler.queue());
        let cursor = queue.consumer(worker_id);
        let engine = Arc::clone(scheduler.engine());
        Self {
            worker_id: worker_id as i32,
            scheduler,
            engine,
            queue,
            cursor,
            assigned_tables: Vec::new(),
            last_maintenance_ms: 0,
        }
    }

    fn drain_queue(&mut self) -> bool {
        let mut busy = false;
        loop {
            let seq = match self.queue.next_sub(&self.cursor) {
                SubNext::Slot(seq) => seq,
                SubNext::Empty => return busy,
            };
            busy = true;
            let kind = self.queue.event(seq).kind;
            let processed = match kind {
                EventKind::Row { writer_thread_id } => {
                    if writer_thread_id == self.worker_id {
                        let table = Arc::clone(self.queue.event(seq).table.as_ref().unwrap());
                        if !table.assigned_to_job() {
                            table.set_assigned_to_job(true);
                            self.assigned_tables.push(Arc::clone(&table));
                            tracing::info!(
                                table = %table.name(),
                                thread = self.worker_id,
                                "assigned table to writer thread"
                            );
                        }
                        self.apply_event(&table, seq);
                    }
                    true
                }
                EventKind::Rebalance {
                    from_thread_id,
                    to_thread_id,
                } => self.process_rebalance(seq, from_thread_id, to_thread_id),
                EventKind::ReleaseWriter => self.process_release_writer(seq),
                EventKind::Incomplete => {
                    debug_assert!(false, "consumer observed an incomplete slot");
                    true
                }
            };
            // Not releasing the cursor makes the queue hand us the same slot
            // again; the unfinished handover is retried on the next run, and
            // reporting idle lets the pool back off in the meantime.
            if processed {
                self.queue.done_sub(&self.cursor, seq);
            } else {
                return false;
            }
        }
    }

    fn process_rebalance(&mut self, seq: u64, from: i32, to: i32) -> bool {
        if to == self.worker_id {
            // Declared owner, but the previous owner must finish first. The
            // release store on the flag is the handover point.
            let event = self.queue.event(seq);
            if event
                .rebalance_released
                .load(std::sync::atomic::Ordering::Acquire)
            {
                tracing::info!(
                    thread = self.worker_id,
                    table = %event.table.as_ref().unwrap().name(),
                    "rebalance cycle, new thread ready"
                );
                return true;
            }
            return false;
        }

        if from == self.worker_id {
            let table = Arc::clone(self.queue.event(seq).table.as_ref().unwrap());
            self.assigned_tables.retain(|t| !Arc::ptr_eq(t, &table));
            table.switch_threads(self.scheduler.config().commit_hysteresis_us);
            tracing::info!(
                thread = self.worker_id,
                table = %table.name(),
                "rebalance cycle, old thread finished"
            );
            self.queue
                .event(seq)
                .rebalance_released
                .store(true, std::sync::atomic::Ordering::Release);
        }
        true
    }

    fn process_release_writer(&mut self, seq: u64) -> bool {
        let event = self.queue.event(seq);
        let table = event.table.as_ref().unwrap();
        let catalog = self.scheduler.catalog().read().unwrap();
        if table.writer_thread_id() != self.worker_id {
            return true;
        }
        if catalog.active.contains_key(table.name()) {
            // The table went active again before we got here.
            return true;
        }
        tracing::info!(
            table = %table.name(),
            idle_since_ms = table.last_line_epoch_ms(),
            "releasing writer"
        );
        table.commit_and_close(self.scheduler.config().commit_hysteresis_us);
        if table.is_reserved() {
            self.engine.release_writer_reservation(table.name());
            table.set_reserved(false);
        }
        true
    }

    /// Decode a row event and feed it to the table writer. Failures cancel
    /// the open row; the event is consumed either way.
    fn apply_event(&self, table: &Arc<TableUpdateDetails>, seq: u64) {
        let buf = self.queue.event(seq).buf();
        let mut slot = table.writer_slot().lock().unwrap();
        if let Err(err) = self.apply_row(table, &mut slot, buf) {
            if let Some(writer) = slot.writer.as_mut() {
                writer.cancel_row();
            }
            tracing::error!(
                table = %table.name(),
                error = %format!("{err:#}"),
                "could not write line protocol measurement"
            );
        }
    }

    fn apply_row(
        &self,
        table: &Arc<TableUpdateDetails>,
        slot: &mut WriterSlot,
        buf: &[u8],
    ) -> anyhow::Result<()> {
        let cfg = self.scheduler.config();
        let writer = slot.open(&self.engine, table.name())?;

        let mut decoder = EventDecoder::new(buf);
        let mut timestamp = decoder.get_i64();
        if timestamp == NULL_TIMESTAMP {
            timestamp = micros_now();
        }
        let n_entities = decoder.get_i32();
        writer.new_row(timestamp)?;
        let first_entity_pos = decoder.pos();

        let mut entity = 0;
        while entity < n_entities {
            let col_ref = decoder.get_i32();
            let (col_index, entity_type) = if col_ref >= 0 {
                let entity_type = EntityType::from_tag(decoder.get_u8())
                    .context("unknown entity type in event buffer")?;
                (col_ref as usize, entity_type)
            } else {
                let name = decoder.get_str((-col_ref) as usize)?;
                let entity_type = EntityType::from_tag(decoder.get_u8())
                    .context("unknown entity type in event buffer")?;
                match writer.column_index(name) {
                    Some(index) => (index, entity_type),
                    None => {
                        // Cannot create a column with an open row; cancel,
                        // create, and replay the entities from the start.
                        writer.cancel_row();
                        if !valid_name(name) {
                            bail!(
                                "invalid column name [table={}, columnName={name}]",
                                writer.table_name()
                            );
                        }
                        let name = name.to_string();
                        writer.add_column(&name, default_column_type(entity_type))?;
                        decoder.rewind_to(first_entity_pos);
                        entity = 0;
                        writer.new_row(timestamp)?;
                        continue;
                    }
                }
            };

            match entity_type {
                EntityType::Tag => {
                    let len = decoder.get_i32() as usize;
                    let value = decoder.get_str(len)?;
                    writer.put_sym_value(col_index, value)?;
                }
                EntityType::CachedTag => {
                    let sym = decoder.get_i32();
                    writer.put_sym_index(col_index, sym)?;
                }
                EntityType::Integer => {
                    let v = decoder.get_i64();
                    match writer.column_type(col_index) {
                        ColumnType::Long => writer.put_long(col_index, v)?,
                        ColumnType::Int => {
                            if v < i32::MIN as i64 || v > i32::MAX as i64 {
                                bail!(
                                    "line protocol integer is out of int bounds [columnIndex={col_index}, v={v}]"
                                );
                            }
                            writer.put_int(col_index, v as i32)?;
                        }
                        ColumnType::Short => {
                            if v < i16::MIN as i64 || v > i16::MAX as i64 {
                                bail!(
                                    "line protocol integer is out of short bounds [columnIndex={col_index}, v={v}]"
                                );
                            }
                            writer.put_short(col_index, v as i16)?;
                        }
                        ColumnType::Byte => {
                            if v < i8::MIN as i64 || v > i8::MAX as i64 {
                                bail!(
                                    "line protocol integer is out of byte bounds [columnIndex={col_index}, v={v}]"
                                );
                            }
                            writer.put_byte(col_index, v as i8)?;
                        }
                        ColumnType::Timestamp => writer.put_timestamp(col_index, v)?,
                        ColumnType::Date => writer.put_date(col_index, v)?,
                        other => {
                            bail!("expected a line protocol integer [columnType={other:?}]")
                        }
                    }
                }
                EntityType::Float => {
                    let v = decoder.get_f64();
                    match writer.column_type(col_index) {
                        ColumnType::Double => writer.put_double(col_index, v)?,
                        ColumnType::Float => writer.put_float(col_index, v as f32)?,
                        other => {
                            bail!("expected a line protocol float [columnType={other:?}]")
                        }
                    }
                }
                EntityType::Boolean => {
                    let v = decoder.get_u8();
                    writer.put_bool(col_index, v == 1)?;
                }
                EntityType::String => {
                    let len = decoder.get_i32() as usize;
                    let value = decoder.get_str(len)?;
                    writer.put_str(col_index, value)?;
                }
                EntityType::Long256 => {
                    let len = decoder.get_i32() as usize;
                    let value = decoder.get_str(len)?;
                    writer.put_long256(col_index, value)?;
                }
            }
            entity += 1;
        }

        writer.append_row()?;
        slot.n_uncommitted += 1;
        if slot.n_uncommitted >= cfg.max_uncommitted_rows {
            let writer = slot.writer.as_mut().unwrap();
            writer.commit_with_hysteresis(cfg.commit_hysteresis_us)?;
            slot.n_uncommitted = 0;
        }
        Ok(())
    }

    fn maintenance(&mut self) {
        let now = millis_now();
        let cfg = self.scheduler.config();
        if now - self.last_maintenance_ms < cfg.maintenance_interval_ms {
            return;
        }
        self.last_maintenance_ms = now;
        for table in &self.assigned_tables {
            let mut slot = table.writer_slot().lock().unwrap();
            if (slot.n_uncommitted > 0 || cfg.commit_hysteresis_us > 0) && slot.writer.is_some() {
                if let Err(err) = slot.writer.as_mut().unwrap().commit() {
                    tracing::error!(
                        table = %table.name(),
                        error = %format!("{err:#}"),
                        "maintenance commit failed"
                    );
                }
                slot.n_uncommitted = 0;
            }
        }
    }
}

impl Job for WriterJob {
    fn run(&mut self, _worker_id: usize) -> bool {
        let busy = self.drain_queue();
        self.maintenance();
        busy
    }

    fn on_close(&mut self) {
        tracing::info!(thread = self.worker_id, "line protocol writer closing");
        // Finish what is left in the queue before letting go of the tables.
        for _ in 0..self.queue.capacity() {
            if !self.drain_queue() {
                break;
            }
        }
        let hysteresis = self.scheduler.config().commit_hysteresis_us;
        for table in self.assigned_tables.drain(..) {
            table.commit_and_close(hysteresis);
        }
    }
}

impl std::fmt::Debug for WriterJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterJob")
            .field("worker_id", &self.worker_id)
            .field("assigned_tables", &self.assigned_tables.len())
            .finish()
    }
}
