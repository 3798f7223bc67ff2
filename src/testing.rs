// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

/*
 * Test support: synthetic records, a minimal property-table schema
 * format with a matching reader, and a scripted host runtime. These are
 * exported so client code can exercise its own callbacks and filters
 * without a live session.
 */

use std::sync::Mutex;

use crate::abi;
use crate::error::TraceError;
use crate::host::{
    ConsumerHandle,
    EnableRequest,
    HostRuntime,
    SessionHandle,
    TraceStats,
};
use crate::perfinfo::GroupMask;
use crate::record::{EventRecord, InType, PropertyReader, PropertyView};
use crate::schema::Schema;
use crate::trace::TraceProperties;
use crate::Guid;

/// Builds a packed EVENT_RECORD for testing. Header fields are set
/// through the builder; property payloads are appended in schema order
/// with the `add_*` methods.
pub struct RecordBuilder {
    provider: Guid,
    id: u16,
    version: u8,
    opcode: u8,
    level: u8,
    keyword: u64,
    process_id: u32,
    thread_id: u32,
    timestamp: u64,
    event_name: Option<String>,
    extensions: Vec<(u16, Vec<u8>)>,
    user_data: Vec<u8>,
}

impl RecordBuilder {
    pub fn new(
        provider: Guid,
        id: u16,
        version: u8,
        opcode: u8) -> Self {
        Self {
            provider,
            id,
            version,
            opcode,
            level: 0,
            keyword: 0,
            process_id: 0,
            thread_id: 0,
            timestamp: 0,
            event_name: None,
            extensions: Vec::new(),
            user_data: Vec::new(),
        }
    }

    pub fn with_level(
        mut self,
        level: u8) -> Self {
        self.level = level;
        self
    }

    pub fn with_keyword(
        mut self,
        keyword: u64) -> Self {
        self.keyword = keyword;
        self
    }

    pub fn with_process_id(
        mut self,
        process_id: u32) -> Self {
        self.process_id = process_id;
        self
    }

    pub fn with_thread_id(
        mut self,
        thread_id: u32) -> Self {
        self.thread_id = thread_id;
        self
    }

    pub fn with_timestamp(
        mut self,
        timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attaches a TraceLogging self-describing name block so the record
    /// carries its event name in extended data.
    pub fn with_event_name(
        mut self,
        name: &str) -> Self {
        self.event_name = Some(name.to_owned());
        self
    }

    /// Attaches an arbitrary extended data item.
    pub fn with_raw_extension(
        mut self,
        ext_type: u16,
        data: Vec<u8>) -> Self {
        self.extensions.push((ext_type, data));
        self
    }

    pub fn add_u8(
        &mut self,
        value: u8) {
        self.user_data.push(value);
    }

    pub fn add_u16(
        &mut self,
        value: u16) {
        self.user_data.extend_from_slice(&value.to_ne_bytes());
    }

    pub fn add_u32(
        &mut self,
        value: u32) {
        self.user_data.extend_from_slice(&value.to_ne_bytes());
    }

    pub fn add_u64(
        &mut self,
        value: u64) {
        self.user_data.extend_from_slice(&value.to_ne_bytes());
    }

    /// Appends a NUL terminated UTF-16 string property.
    pub fn add_unicode_string(
        &mut self,
        value: &str) {
        for unit in value.encode_utf16() {
            self.user_data.extend_from_slice(&unit.to_le_bytes());
        }

        self.user_data.extend_from_slice(&0u16.to_le_bytes());
    }

    /// Appends a NUL terminated ANSI string property.
    pub fn add_ansi_string(
        &mut self,
        value: &str) {
        self.user_data.extend_from_slice(value.as_bytes());
        self.user_data.push(0);
    }

    /// Appends a counted UTF-16 string property: a u16 code-unit count
    /// followed by the units, no terminator.
    pub fn add_counted_string(
        &mut self,
        value: &str) {
        let units: Vec<u16> = value.encode_utf16().collect();

        self.user_data
            .extend_from_slice(&(units.len() as u16).to_le_bytes());

        for unit in units {
            self.user_data.extend_from_slice(&unit.to_le_bytes());
        }
    }

    fn name_block(
        name: &str) -> Vec<u8> {
        /*
         * TraceLogging metadata block: u16 total size, one extension
         * byte with its high bit unset, the UTF-8 name, a NUL.
         */
        let size = (2 + 1 + name.len() + 1) as u16;
        let mut block = Vec::with_capacity(size as usize);

        block.extend_from_slice(&size.to_le_bytes());
        block.push(0u8);
        block.extend_from_slice(name.as_bytes());
        block.push(0u8);

        block
    }

    pub fn pack(self) -> SynthRecord {
        let mut extension_data: Vec<Vec<u8>> = Vec::new();
        let mut extension_types: Vec<u16> = Vec::new();

        if let Some(name) = &self.event_name {
            extension_types.push(abi::EVENT_HEADER_EXT_TYPE_EVENT_SCHEMA_TL);
            extension_data.push(Self::name_block(name));
        }

        for (ext_type, data) in self.extensions {
            extension_types.push(ext_type);
            extension_data.push(data);
        }

        let mut items: Vec<abi::EVENT_HEADER_EXTENDED_DATA_ITEM> =
            Vec::with_capacity(extension_data.len());

        for (ext_type, data) in
            extension_types.iter().zip(extension_data.iter()) {
            items.push(abi::EVENT_HEADER_EXTENDED_DATA_ITEM {
                Reserved1: 0,
                ExtType: *ext_type,
                Linkage: 0,
                DataSize: data.len() as u16,
                DataPtr: data.as_ptr(),
            });
        }

        let user_data = self.user_data;

        let record = Box::new(abi::EVENT_RECORD {
            EventHeader: abi::EVENT_HEADER {
                Size: 0,
                HeaderType: 0,
                Flags: 0,
                EventProperty: 0,
                ThreadId: self.thread_id,
                ProcessId: self.process_id,
                TimeStamp: self.timestamp,
                ProviderId: self.provider,
                EventDescriptor: abi::EVENT_DESCRIPTOR {
                    Id: self.id,
                    Version: self.version,
                    Channel: 0,
                    Level: self.level,
                    Opcode: self.opcode,
                    Task: 0,
                    Keyword: self.keyword,
                },
                KernelTime: 0,
                UserTime: 0,
                ActivityId: Guid::default(),
            },
            ProcessorIndex: 0,
            LoggerId: 0,
            ExtendedDataCount: items.len() as u16,
            UserDataLength: user_data.len() as u16,
            ExtendedData: if items.is_empty() {
                std::ptr::null()
            } else {
                items.as_ptr()
            },
            UserData: if user_data.is_empty() {
                std::ptr::null()
            } else {
                user_data.as_ptr()
            },
            UserContext: std::ptr::null(),
        });

        SynthRecord {
            record,
            _user_data: user_data,
            _items: items,
            _extension_data: extension_data,
        }
    }
}

/// A packed synthetic record with owned backing storage. The interior
/// pointers target heap allocations owned by this value, so moving it
/// is safe.
pub struct SynthRecord {
    record: Box<abi::EVENT_RECORD>,
    _user_data: Vec<u8>,
    _items: Vec<abi::EVENT_HEADER_EXTENDED_DATA_ITEM>,
    _extension_data: Vec<Vec<u8>>,
}

impl SynthRecord {
    pub fn as_record(&self) -> &EventRecord {
        unsafe { EventRecord::from_abi(&*self.record) }
    }
}

/* The raw pointers only target the record's own storage */
unsafe impl Send for SynthRecord {}
unsafe impl Sync for SynthRecord {}

/// Describes the properties of a synthetic event shape and serializes
/// them into a schema blob the `TableReader` understands: a u16 entry
/// count, then per entry a u16 name length, the UTF-8 name, the u16
/// TDH in-type, and a u16 fixed size (zero for variable length).
pub struct SchemaTable {
    entries: Vec<(String, InType)>,
}

impl SchemaTable {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn field(
        mut self,
        name: &str,
        in_type: InType) -> Self {
        self.entries.push((name.to_owned(), in_type));
        self
    }

    pub fn to_blob(&self) -> Vec<u8> {
        let mut blob = Vec::new();

        blob.extend_from_slice(&(self.entries.len() as u16).to_le_bytes());

        for (name, in_type) in &self.entries {
            blob.extend_from_slice(&(name.len() as u16).to_le_bytes());
            blob.extend_from_slice(name.as_bytes());
            blob.extend_from_slice(&in_type.raw().to_le_bytes());

            let size = in_type.fixed_size().unwrap_or(0) as u16;
            blob.extend_from_slice(&size.to_le_bytes());
        }

        blob
    }
}

impl Default for SchemaTable {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_table(
    blob: &[u8]) -> Option<Vec<(String, InType, usize)>> {
    if blob.len() < 2 {
        return None;
    }

    let count = u16::from_le_bytes([blob[0], blob[1]]) as usize;
    let mut offset = 2;
    let mut entries = Vec::with_capacity(count);

    for _ in 0..count {
        if offset + 2 > blob.len() {
            return None;
        }

        let name_len =
            u16::from_le_bytes([blob[offset], blob[offset + 1]]) as usize;
        offset += 2;

        if offset + name_len + 4 > blob.len() {
            return None;
        }

        let name = std::str::from_utf8(&blob[offset..offset + name_len])
            .ok()?
            .to_owned();
        offset += name_len;

        let raw =
            u16::from_le_bytes([blob[offset], blob[offset + 1]]);
        offset += 2;

        let size =
            u16::from_le_bytes([blob[offset], blob[offset + 1]]) as usize;
        offset += 2;

        entries.push((name, InType::from_raw(raw)?, size));
    }

    Some(entries)
}

/// Walks user data sequentially, skipping earlier fields by their fixed
/// or scanned length, the stand-in for the TDH property parser in
/// tests.
pub struct TableReader;

fn variable_length(
    in_type: InType,
    data: &[u8]) -> usize {
    match in_type {
        InType::UnicodeString => {
            let mut length = 0;

            for chunk in data.chunks_exact(2) {
                length += 2;

                if chunk[0] == 0 && chunk[1] == 0 {
                    break;
                }
            }

            length
        },

        InType::AnsiString => {
            match data.iter().position(|b| *b == 0) {
                Some(i) => i + 1,
                None => data.len(),
            }
        },

        InType::CountedString => {
            if data.len() < 2 {
                return data.len();
            }

            2 + u16::from_le_bytes([data[0], data[1]]) as usize * 2
        },

        InType::CountedAnsiString => {
            if data.len() < 2 {
                return data.len();
            }

            2 + u16::from_le_bytes([data[0], data[1]]) as usize
        },

        /* Binary and anything else take the rest of the payload */
        _ => data.len(),
    }
}

impl PropertyReader for TableReader {
    fn find_property<'a>(
        &self,
        record: &'a EventRecord,
        schema: &Schema,
        name: &str) -> Option<PropertyView<'a>> {
        let entries = parse_table(schema.blob())?;
        let data = record.user_data();
        let mut offset = 0;

        for (entry_name, in_type, size) in entries {
            if offset > data.len() {
                return None;
            }

            let remaining = &data[offset..];

            let length = if size > 0 {
                size
            } else {
                variable_length(in_type, remaining)
            };

            if entry_name == name {
                let end = (offset + length).min(data.len());

                return Some(PropertyView {
                    data: &data[offset..end],
                    in_type,
                });
            }

            offset += length;
        }

        None
    }
}

/// A session started against the capture host, as the host saw it.
#[derive(Clone, Debug)]
pub struct StartedSession {
    pub name: String,
    pub properties: TraceProperties,
    pub kernel_flags: u32,
}

struct CaptureState {
    sessions: Vec<StartedSession>,
    enables: Vec<EnableRequest>,
    group_masks: Vec<GroupMask>,
    schemas: Vec<((Guid, u16), Vec<u8>)>,
    names: Vec<(String, Guid)>,
    records: Vec<SynthRecord>,
    metadata_calls: u64,
    buffers_delivered: u32,
    events_delivered: u64,
    stopped: bool,
    park: bool,
    start_failure: Option<u32>,
    enable_failure: Option<u32>,
    system_logger: bool,
    next_handle: u64,
}

/// A scripted host runtime. Records every control call for assertions,
/// serves registered schema blobs through the two-phase metadata query,
/// and delivers queued synthetic records from `process_events`.
pub struct CaptureHost {
    state: Mutex<CaptureState>,
}

impl CaptureHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CaptureState {
                sessions: Vec::new(),
                enables: Vec::new(),
                group_masks: Vec::new(),
                schemas: Vec::new(),
                names: Vec::new(),
                records: Vec::new(),
                metadata_calls: 0,
                buffers_delivered: 0,
                events_delivered: 0,
                stopped: false,
                park: false,
                start_failure: None,
                enable_failure: None,
                system_logger: true,
                next_handle: 1,
            }),
        }
    }

    /// Registers the schema blob served for (provider, event id).
    pub fn add_schema(
        &self,
        provider: Guid,
        event_id: u16,
        blob: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .schemas
            .push(((provider, event_id), blob));
    }

    pub fn add_provider_name(
        &self,
        name: &str,
        guid: Guid) {
        self.state
            .lock()
            .unwrap()
            .names
            .push((name.to_owned(), guid));
    }

    /// Queues a record for delivery on the next `process_events`.
    pub fn queue_record(
        &self,
        record: SynthRecord) {
        self.state.lock().unwrap().records.push(record);
    }

    /// Makes `process_events` block after draining the queue until the
    /// session is stopped, like a live pump.
    pub fn park_until_stopped(&self) {
        self.state.lock().unwrap().park = true;
    }

    pub fn fail_next_start(
        &self,
        status: u32) {
        self.state.lock().unwrap().start_failure = Some(status);
    }

    pub fn fail_next_enable(
        &self,
        status: u32) {
        self.state.lock().unwrap().enable_failure = Some(status);
    }

    pub fn set_system_logger_support(
        &self,
        supported: bool) {
        self.state.lock().unwrap().system_logger = supported;
    }

    pub fn sessions(&self) -> Vec<StartedSession> {
        self.state.lock().unwrap().sessions.clone()
    }

    pub fn enable_requests(&self) -> Vec<EnableRequest> {
        self.state.lock().unwrap().enables.clone()
    }

    pub fn group_masks(&self) -> Vec<GroupMask> {
        self.state.lock().unwrap().group_masks.clone()
    }

    /// The number of metadata size probes the host has served.
    pub fn metadata_calls(&self) -> u64 {
        self.state.lock().unwrap().metadata_calls
    }

    pub fn stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }
}

impl Default for CaptureHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostRuntime for CaptureHost {
    fn start_session(
        &self,
        name: &str,
        properties: &TraceProperties,
        kernel_flags: u32) -> Result<SessionHandle, TraceError> {
        let mut state = self.state.lock().unwrap();

        if let Some(status) = state.start_failure.take() {
            return Err(TraceError::from_status(status, "StartTraceW"));
        }

        state.sessions.push(StartedSession {
            name: name.to_owned(),
            properties: properties.clone(),
            kernel_flags,
        });

        state.stopped = false;

        let handle = state.next_handle;
        state.next_handle += 1;

        Ok(handle)
    }

    fn stop_session(
        &self,
        _handle: SessionHandle,
        _name: &str) -> u32 {
        self.state.lock().unwrap().stopped = true;

        abi::ERROR_SUCCESS
    }

    fn enable_provider(
        &self,
        _handle: SessionHandle,
        request: &EnableRequest) -> u32 {
        let mut state = self.state.lock().unwrap();

        if let Some(status) = state.enable_failure.take() {
            return status;
        }

        state.enables.push(request.clone());

        abi::ERROR_SUCCESS
    }

    fn set_trace_information(
        &self,
        _handle: SessionHandle,
        mask: &GroupMask) -> u32 {
        self.state.lock().unwrap().group_masks.push(*mask);

        abi::ERROR_SUCCESS
    }

    fn open_session(
        &self,
        _name: &str) -> Result<ConsumerHandle, TraceError> {
        let mut state = self.state.lock().unwrap();

        let handle = state.next_handle;
        state.next_handle += 1;

        Ok(handle)
    }

    fn process_events(
        &self,
        _handle: ConsumerHandle,
        callback: &mut dyn FnMut(&EventRecord)) -> u32 {
        /* Take the queue without holding the lock across callbacks */
        let records = {
            let mut state = self.state.lock().unwrap();

            if !state.records.is_empty() {
                state.buffers_delivered += 1;
            }

            std::mem::take(&mut state.records)
        };

        for record in &records {
            if self.state.lock().unwrap().stopped {
                break;
            }

            self.state.lock().unwrap().events_delivered += 1;

            callback(record.as_record());
        }

        let park = self.state.lock().unwrap().park;

        if park {
            while !self.state.lock().unwrap().stopped {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }

        abi::ERROR_SUCCESS
    }

    fn close_session(
        &self,
        _handle: ConsumerHandle) -> u32 {
        abi::ERROR_SUCCESS
    }

    fn get_event_metadata(
        &self,
        record: &EventRecord,
        buffer: &mut [u8],
        size: &mut u32) -> u32 {
        let mut state = self.state.lock().unwrap();

        let key = (record.provider_id(), record.id());

        if buffer.is_empty() {
            state.metadata_calls += 1;
        }

        let blob = match state.schemas.iter().find(|(k, _)| *k == key) {
            Some((_, blob)) => blob,
            None => { return abi::ERROR_NOT_FOUND; },
        };

        if buffer.len() < blob.len() {
            *size = blob.len() as u32;
            return abi::ERROR_INSUFFICIENT_BUFFER;
        }

        buffer[..blob.len()].copy_from_slice(blob);
        *size = blob.len() as u32;

        abi::ERROR_SUCCESS
    }

    fn query_stats(
        &self,
        _handle: SessionHandle,
        _name: &str) -> Result<TraceStats, TraceError> {
        let state = self.state.lock().unwrap();

        Ok(TraceStats {
            buffers_read: state.buffers_delivered,
            buffers_lost: 0,
            events_total: state.events_delivered,
            events_handled: 0,
            events_lost: 0,
        })
    }

    fn resolve_provider_name(
        &self,
        name: &str) -> Result<Guid, TraceError> {
        let state = self.state.lock().unwrap();

        state
            .names
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, guid)| *guid)
            .ok_or(TraceError::InvalidParameter)
    }

    fn supports_system_logger(&self) -> bool {
        self.state.lock().unwrap().system_logger
    }
}
