//! Queue slot payloads.
//!
//! A slot carries either a serialized measurement row bound for one writer
//! thread, or a control command (rebalance handover, writer release). Row
//! payloads live in a fixed-capacity buffer that is reused for the life of
//! the queue; nothing on the publish path allocates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::catalog::TableUpdateDetails;
use crate::line::{EntityValue, EntityType, ParsedLine};
use crate::symbol::{IoLocalTable, SymbolCache, SYM_NOT_FOUND};
use crate::table::Engine;

/// Slot discriminant. `Incomplete` is the reserved-but-unwritten state;
/// producers always overwrite it before releasing the publisher sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Incomplete,
    Row { writer_thread_id: i32 },
    Rebalance { from_thread_id: i32, to_thread_id: i32 },
    ReleaseWriter,
}

pub struct MeasurementEvent {
    pub kind: EventKind,
    pub table: Option<Arc<TableUpdateDetails>>,
    /// Handover flag for rebalance events. The "from" writer stores true with
    /// release ordering once it has committed and closed its writer; the "to"
    /// writer spins on an acquire load before adopting the table.
    pub rebalance_released: AtomicBool,
    pub(crate) buf: Vec<u8>,
}

/// Event buffer sized so any line within `max_measurement_size` fits after
/// re-encoding (column refs, type tags, length headers).
pub fn buf_capacity(max_measurement_size: usize) -> usize {
    (max_measurement_size / 4) * 13 + 16
}

impl MeasurementEvent {
    pub fn new(buf_capacity: usize) -> Self {
        Self {
            kind: EventKind::Incomplete,
            table: None,
            rebalance_released: AtomicBool::new(false),
            buf: Vec::with_capacity(buf_capacity),
        }
    }

    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    /// Serialize a parsed line into this slot and mark it for the table's
    /// current writer thread. Column names known to the worker's local cache
    /// are written as indexes; unknown names travel as UTF-8 for the writer
    /// to resolve. Tag values that hit the symbol cache degrade to a plain
    /// dictionary id.
    pub fn create_row(
        &mut self,
        engine: &Engine,
        table: &Arc<TableUpdateDetails>,
        line: &ParsedLine<'_>,
        local: &mut IoLocalTable,
        unused_caches: &mut Vec<SymbolCache>,
    ) {
        self.kind = EventKind::Incomplete;
        self.table = Some(Arc::clone(table));
        self.buf.clear();
        put_i64(&mut self.buf, line.timestamp);
        put_i32(&mut self.buf, line.entities.len() as i32);
        for entity in &line.entities {
            let col_index = local.column_index(engine, table.name(), &entity.name);
            if col_index < 0 {
                let name = entity.name.as_bytes();
                put_i32(&mut self.buf, -(name.len() as i32));
                self.buf.extend_from_slice(name);
            } else {
                put_i32(&mut self.buf, col_index);
            }
            match &entity.value {
                EntityValue::Tag(value) => {
                    let sym = local.symbol_index(
                        table.table_dir(),
                        col_index,
                        value,
                        unused_caches,
                    );
                    if sym != SYM_NOT_FOUND {
                        self.buf.push(EntityType::CachedTag as u8);
                        put_i32(&mut self.buf, sym);
                    } else {
                        self.buf.push(EntityType::Tag as u8);
                        put_i32(&mut self.buf, value.len() as i32);
                        self.buf.extend_from_slice(value.as_bytes());
                    }
                }
                EntityValue::Integer(v) => {
                    self.buf.push(EntityType::Integer as u8);
                    put_i64(&mut self.buf, *v);
                }
                EntityValue::Float(v) => {
                    self.buf.push(EntityType::Float as u8);
                    put_i64(&mut self.buf, v.to_bits() as i64);
                }
                EntityValue::Boolean(v) => {
                    self.buf.push(EntityType::Boolean as u8);
                    self.buf.push(u8::from(*v));
                }
                EntityValue::Str(value) => {
                    self.buf.push(EntityType::String as u8);
                    put_i32(&mut self.buf, value.len() as i32);
                    self.buf.extend_from_slice(value.as_bytes());
                }
                EntityValue::Long256(value) => {
                    self.buf.push(EntityType::Long256 as u8);
                    put_i32(&mut self.buf, value.len() as i32);
                    self.buf.extend_from_slice(value.as_bytes());
                }
            }
        }
        self.kind = EventKind::Row {
            writer_thread_id: table.writer_thread_id(),
        };
    }

    pub fn create_rebalance(
        &mut self,
        from_thread_id: i32,
        to_thread_id: i32,
        table: &Arc<TableUpdateDetails>,
    ) {
        self.table = Some(Arc::clone(table));
        self.rebalance_released.store(false, Ordering::Release);
        self.kind = EventKind::Rebalance {
            from_thread_id,
            to_thread_id,
        };
    }

    pub fn create_release_writer(&mut self, table: &Arc<TableUpdateDetails>) {
        self.table = Some(Arc::clone(table));
        self.kind = EventKind::ReleaseWriter;
    }
}

fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Sequential reader over a row event buffer, with rewind support for the
/// writer's cancel-and-retry path when it creates a missing column.
pub struct EventDecoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> EventDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn rewind_to(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn get_u8(&mut self) -> u8 {
        let v = self.buf[self.pos];
        self.pos += 1;
        v
    }

    pub fn get_i32(&mut self) -> i32 {
        let v = i32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        v
    }

    pub fn get_i64(&mut self) -> i64 {
        let v = i64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        v
    }

    pub fn get_f64(&mut self) -> f64 {
        f64::from_bits(self.get_i64() as u64)
    }

    pub fn get_bytes(&mut self, len: usize) -> &'a [u8] {
        let v = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        v
    }

    /// Borrow `len` bytes as a string. Producers only serialize validated
    /// UTF-8, so a failure here means a corrupted slot.
    pub fn get_str(&mut self, len: usize) -> anyhow::Result<&'a str> {
        std::str::from_utf8(self.get_bytes(len))
            .map_err(|_| anyhow::anyhow!("invalid UTF8 in event buffer"))
    }
}
