// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::TraceError;
use crate::host::HostRuntime;
use crate::record::EventRecord;
use crate::{abi, Guid};

/// `SchemaKeyView` is the borrowed form of a schema cache key. It is
/// built straight from a record without allocating: the name points into
/// the record's extended data, which is only valid for the duration of
/// one callback. Keys that enter the cache must be internalized first so
/// the name points at owned memory and does not dangle.
///
/// Only events logged with the TraceLogging API carry a name; all other
/// events are distinguished by their descriptor fields alone.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SchemaKeyView<'a> {
    pub provider: Guid,
    pub name: &'a str,
    pub id: u16,
    pub version: u8,
    pub opcode: u8,
    pub level: u8,
    pub keyword: u64,
}

fn mix_step(
    h: u64,
    value: u64) -> u64 {
    h ^ (h << 5).wrapping_add(h >> 2).wrapping_add(value)
}

fn mix_name(
    name: &str) -> u64 {
    /* FNV-1a over the name bytes */
    let mut h: u64 = 0xcbf29ce484222325;

    for b in name.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }

    h
}

impl<'a> SchemaKeyView<'a> {
    pub fn from_record(
        record: &'a EventRecord) -> Self {
        Self {
            provider: record.provider_id(),
            name: record.trace_logger_name(),
            id: record.id(),
            version: record.version(),
            opcode: record.opcode(),
            level: record.level(),
            keyword: record.keyword(),
        }
    }

    /// Shift-add-xor mix over every field. Not cryptographic; good
    /// enough for the small sets we deal with, and stable across builds
    /// so cached lookups behave the same everywhere.
    pub fn mix(&self) -> u64 {
        let mut h: u64 = 2166136261;

        h = mix_step(h, self.provider.data1 as u64);
        h = mix_step(h, self.provider.data2 as u64);
        h = mix_step(h, self.provider.data3 as u64);
        h = mix_step(h, u64::from_be_bytes(self.provider.data4));
        h = mix_step(h, mix_name(self.name));
        h = mix_step(h, self.id as u64);
        h = mix_step(h, self.version as u64);
        h = mix_step(h, self.opcode as u64);
        h = mix_step(h, self.level as u64);
        h = mix_step(h, self.keyword);

        h
    }

    /// Copies the view into an owned key whose name backing lives with
    /// the key itself. Equality and `mix` are preserved.
    pub fn internalize(&self) -> SchemaKey {
        SchemaKey {
            provider: self.provider,
            name: self.name.to_owned(),
            id: self.id,
            version: self.version,
            opcode: self.opcode,
            level: self.level,
            keyword: self.keyword,
        }
    }
}

/// The owned form of a schema cache key. The name view is recomputed on
/// access from the owned backing string, so it can never alias foreign
/// memory once the key is stored.
#[derive(Clone, Debug)]
pub struct SchemaKey {
    provider: Guid,
    name: String,
    id: u16,
    version: u8,
    opcode: u8,
    level: u8,
    keyword: u64,
}

impl SchemaKey {
    pub fn view(&self) -> SchemaKeyView<'_> {
        SchemaKeyView {
            provider: self.provider,
            name: &self.name,
            id: self.id,
            version: self.version,
            opcode: self.opcode,
            level: self.level,
            keyword: self.keyword,
        }
    }

    pub fn mix(&self) -> u64 {
        self.view().mix()
    }
}

impl PartialEq for SchemaKey {
    fn eq(
        &self,
        other: &Self) -> bool {
        self.view() == other.view()
    }
}

impl Eq for SchemaKey {}

/// `Schema` pairs the identity of an event shape with the opaque
/// metadata blob returned by the host. Instances are owned by the
/// locator cache and handed out as shared read-only references.
pub struct Schema {
    key: SchemaKey,
    blob: Box<[u8]>,
}

impl Schema {
    fn new(
        key: SchemaKey,
        blob: Box<[u8]>) -> Self {
        Self {
            key,
            blob,
        }
    }

    pub fn provider_id(&self) -> Guid {
        self.key.provider
    }

    pub fn event_name(&self) -> &str {
        &self.key.name
    }

    pub fn event_id(&self) -> u16 {
        self.key.id
    }

    pub fn version(&self) -> u8 {
        self.key.version
    }

    pub fn opcode(&self) -> u8 {
        self.key.opcode
    }

    pub fn level(&self) -> u8 {
        self.key.level
    }

    pub fn keyword(&self) -> u64 {
        self.key.keyword
    }

    /// The raw metadata blob, for use by property readers.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }
}

struct CacheSlot {
    mix: u64,
    index: usize,
}

struct LocatorCache {
    buckets: Vec<Vec<CacheSlot>>,
    mask: u64,
    entries: Vec<(SchemaKey, Rc<Schema>)>,
}

/// Fetches and caches event schemas from the host metadata query.
///
/// The cache is keyed on the full event identity because different
/// versions or opcodes of the same (provider, id) genuinely have
/// different schemas. Entries live for the lifetime of the trace and
/// are never evicted. The locator is only touched from the dispatch
/// thread, so interior mutability without locking is sufficient.
pub struct SchemaLocator {
    cache: RefCell<LocatorCache>,
}

const BUCKET_COUNT: usize = 256;

impl SchemaLocator {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);

        for _ in 0..BUCKET_COUNT {
            buckets.push(Vec::new());
        }

        Self {
            cache: RefCell::new(LocatorCache {
                buckets,
                mask: (BUCKET_COUNT - 1) as u64,
                entries: Vec::new(),
            }),
        }
    }

    /// The number of distinct event shapes seen so far.
    pub fn len(&self) -> usize {
        self.cache.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retrieves the schema for a record from the cache, falling back
    /// to the host metadata query on the first sighting of an event
    /// shape. Failed lookups are not cached.
    pub fn get_schema(
        &self,
        record: &EventRecord,
        host: &dyn HostRuntime) -> Result<Rc<Schema>, TraceError> {
        let key = SchemaKeyView::from_record(record);
        let mix = key.mix();

        let mut cache = self.cache.borrow_mut();
        let bucket_index = (mix & cache.mask) as usize;

        for slot in &cache.buckets[bucket_index] {
            if slot.mix != mix {
                continue;
            }

            let (stored, schema) = &cache.entries[slot.index];

            if stored.view() == key {
                return Ok(schema.clone());
            }
        }

        /* Cache miss, fetch the schema from the host */
        let blob = query_schema(record, host)?;

        let stored = key.internalize();
        let schema = Rc::new(Schema::new(stored.clone(), blob));
        let index = cache.entries.len();

        cache.entries.push((stored, schema.clone()));
        cache.buckets[bucket_index].push(CacheSlot {
            mix,
            index,
        });

        Ok(schema)
    }
}

impl Default for SchemaLocator {
    fn default() -> Self {
        Self::new()
    }
}

fn schema_not_found(
    record: &EventRecord,
    status: u32) -> TraceError {
    TraceError::SchemaNotFound {
        provider: record.provider_id(),
        event_id: record.id(),
        status,
    }
}

/// Two-phase metadata query: probe with an empty buffer to learn the
/// required size, then fill. The only acceptable status for the probe
/// is the buffer-too-small signal.
fn query_schema(
    record: &EventRecord,
    host: &dyn HostRuntime) -> Result<Box<[u8]>, TraceError> {
    let mut size: u32 = 0;

    let status = host.get_event_metadata(record, &mut [], &mut size);

    if status != abi::ERROR_INSUFFICIENT_BUFFER {
        return Err(schema_not_found(record, status));
    }

    let mut buffer = vec![0u8; size as usize];

    let status = host.get_event_metadata(record, &mut buffer, &mut size);

    if status != abi::ERROR_SUCCESS {
        return Err(schema_not_found(record, status));
    }

    Ok(buffer.into_boxed_slice())
}
