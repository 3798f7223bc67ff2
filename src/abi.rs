// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

/*
 * Hand-declared ETW ABI surface. The structures are byte-compatible with
 * the evntrace/evntcons definitions so records handed to us by the OS can
 * be read in place. Only the imports are compile-gated, the layouts are
 * needed everywhere for synthetic records in tests.
 */

use crate::Guid;

type RawHandle = *mut std::os::raw::c_void;

#[cfg(target_os = "windows")]
#[link(name = "advapi32")]
extern "system" {
    pub fn StartTraceW(
        tracehandle: *mut u64,
        instancename: *const u16,
        properties: *mut EVENT_TRACE_PROPERTIES) -> u32;

    pub fn ControlTraceW(
        tracehandle: u64,
        instancename: *const u16,
        properties: *mut EVENT_TRACE_PROPERTIES,
        controlcode: u32) -> u32;

    pub fn EnableTraceEx2(
        tracehandle: u64,
        provider: *const Guid,
        controlcode: u32,
        level: u8,
        matchanykeyword: u64,
        matchallkeyword: u64,
        timeout: u32,
        parameters: *const ENABLE_TRACE_PARAMETERS) -> u32;

    pub fn OpenTraceW(
        logfile: *const EVENT_TRACE_LOGFILE) -> u64;

    pub fn ProcessTrace(
        tracehandles: *const u64,
        count: u32,
        starttime: *const u64,
        endtime: *const u64) -> u32;

    pub fn CloseTrace(
        handle: u64) -> u32;

    pub fn TraceSetInformation(
        sessionhandle: u64,
        informationclass: i32,
        traceinformation: *const u8,
        informationlength: u32) -> u32;

    pub fn QueryTraceW(
        tracehandle: u64,
        instancename: *const u16,
        properties: *mut EVENT_TRACE_PROPERTIES) -> u32;
}

#[cfg(target_os = "windows")]
#[link(name = "kernel32")]
extern "system" {
    pub fn GetLastError() -> u32;

    pub fn GetActiveProcessorCount(
        group: u16) -> u32;
}

#[cfg(target_os = "windows")]
#[link(name = "tdh")]
extern "system" {
    pub fn TdhGetEventInformation(
        record: *const EVENT_RECORD,
        contextcount: u32,
        context: *const std::ffi::c_void,
        buffer: *mut u8,
        buffersize: *mut u32) -> u32;

    pub fn TdhEnumerateProviders(
        buffer: *mut u8,
        buffersize: *mut u32) -> u32;
}

pub const ERROR_SUCCESS: u32 = 0;
pub const ERROR_ACCESS_DENIED: u32 = 5;
pub const ERROR_INVALID_PARAMETER: u32 = 87;
pub const ERROR_INSUFFICIENT_BUFFER: u32 = 122;
pub const ERROR_ALREADY_EXISTS: u32 = 183;
pub const ERROR_NOT_FOUND: u32 = 1168;
pub const ERROR_CANCELLED: u32 = 1223;
pub const ERROR_CTX_CLOSE_PENDING: u32 = 7007;

pub const EVENT_TRACE_CONTROL_STOP: u32 = 1;
pub const EVENT_TRACE_CONTROL_QUERY: u32 = 0;
pub const EVENT_TRACE_CONTROL_FLUSH: u32 = 3;

pub const WNODE_FLAG_TRACED_GUID: u32 = 131072;

pub const EVENT_TRACE_REAL_TIME_MODE: u32 = 256;
pub const EVENT_TRACE_NO_PER_PROCESSOR_BUFFERING: u32 = 268435456;
pub const EVENT_TRACE_SYSTEM_LOGGER_MODE: u32 = 33554432;
pub const EVENT_TRACE_INDEPENDENT_SESSION_MODE: u32 = 134217728;

pub const PROCESS_TRACE_MODE_REAL_TIME: u32 = 256;
pub const PROCESS_TRACE_MODE_RAW_TIMESTAMP: u32 = 4096;
pub const PROCESS_TRACE_MODE_EVENT_RECORD: u32 = 268435456;

pub const EVENT_FILTER_TYPE_EVENT_ID: u32 = 0x80000200;

pub const EVENT_CONTROL_CODE_DISABLE_PROVIDER: u32 = 0;
pub const EVENT_CONTROL_CODE_ENABLE_PROVIDER: u32 = 1;
pub const EVENT_CONTROL_CODE_CAPTURE_STATE: u32 = 2;

/* EnableProperty bits, the "trace flags" of a provider */
pub const EVENT_ENABLE_PROPERTY_SID: u32 = 1u32;
pub const EVENT_ENABLE_PROPERTY_TS_ID: u32 = 2u32;
pub const EVENT_ENABLE_PROPERTY_STACK_TRACE: u32 = 4u32;
pub const EVENT_ENABLE_PROPERTY_PSM_KEY: u32 = 8u32;
pub const EVENT_ENABLE_PROPERTY_IGNORE_KEYWORD_0: u32 = 16u32;
pub const EVENT_ENABLE_PROPERTY_PROVIDER_GROUP: u32 = 32u32;
pub const EVENT_ENABLE_PROPERTY_ENABLE_KEYWORD_0: u32 = 64u32;
pub const EVENT_ENABLE_PROPERTY_PROCESS_START_KEY: u32 = 128u32;
pub const EVENT_ENABLE_PROPERTY_EVENT_KEY: u32 = 256u32;
pub const EVENT_ENABLE_PROPERTY_EXCLUDE_INPRIVATE: u32 = 512u32;
pub const EVENT_ENABLE_PROPERTY_ENABLE_SILOS: u32 = 1024u32;
pub const EVENT_ENABLE_PROPERTY_SOURCE_CONTAINER_TRACKING: u32 = 2048u32;

pub const EVENT_HEADER_EXT_TYPE_RELATED_ACTIVITYID: u16 = 1u16;
pub const EVENT_HEADER_EXT_TYPE_SID: u16 = 2u16;
pub const EVENT_HEADER_EXT_TYPE_TS_ID: u16 = 3u16;
pub const EVENT_HEADER_EXT_TYPE_STACK_TRACE32: u16 = 5u16;
pub const EVENT_HEADER_EXT_TYPE_STACK_TRACE64: u16 = 6u16;
pub const EVENT_HEADER_EXT_TYPE_EVENT_SCHEMA_TL: u16 = 11u16;
pub const EVENT_HEADER_EXT_TYPE_PROV_TRAITS: u16 = 12u16;
pub const EVENT_HEADER_EXT_TYPE_PROCESS_START_KEY: u16 = 13u16;
pub const EVENT_HEADER_EXT_TYPE_CONTAINER_ID: u16 = 16u16;

pub const TRACE_LEVEL_CRITICAL: u8 = 1;
pub const TRACE_LEVEL_ERROR: u8 = 2;
pub const TRACE_LEVEL_WARNING: u8 = 3;
pub const TRACE_LEVEL_INFORMATION: u8 = 4;
pub const TRACE_LEVEL_VERBOSE: u8 = 5;

/* TRACE_INFO_CLASS value accepted by TraceSetInformation for group masks */
pub const TRACE_SYSTEM_TRACE_ENABLE_FLAGS_INFO: i32 = 4;

pub const KERNEL_LOGGER_NAME: &str = "NT Kernel Logger";

/* A session buffer is capped at 1 MB by the OS */
pub const MAX_BUFFER_SIZE_KB: u32 = 1024;

pub fn wide_string(
    name: &str) -> Vec<u16> {
    let mut name_wide: Vec<u16> = Vec::new();

    for c in name.chars() {
        name_wide.push(c as u16);
    }

    name_wide.push(0_u16);

    name_wide
}

/// Builds the payload of an EVENT_FILTER_TYPE_EVENT_ID descriptor:
/// an EVENT_FILTER_EVENT_ID structure with FilterIn set and the
/// given event ids appended.
pub fn build_event_id_filter(
    ids: &[u16]) -> Vec<u8> {
    let mut data = Vec::new();

    /* Filter in */
    data.push(1u8);

    /* Reserved */
    data.push(0u8);

    /* Count */
    let count = ids.len() as u16;
    data.extend_from_slice(&count.to_ne_bytes());

    for id in ids {
        data.extend_from_slice(&id.to_ne_bytes());
    }

    data
}

#[repr(C)]
#[allow(non_snake_case)]
pub struct WNODE_HEADER {
    pub BufferSize: u32,
    pub ProviderId: u32,
    pub HistoricalContext: u64,
    pub TimeStamp: i64,
    pub Guid: Guid,
    pub ClientContext: u32,
    pub Flags: u32,
}

impl Default for WNODE_HEADER {
    fn default() -> Self {
        Self {
            BufferSize: std::mem::size_of::<EVENT_TRACE_PROPERTIES>() as u32,
            ProviderId: 0,
            HistoricalContext: 0,
            TimeStamp: 0,
            Guid: Guid::default(),
            ClientContext: 1,
            Flags: WNODE_FLAG_TRACED_GUID,
        }
    }
}

#[repr(C)]
#[allow(non_snake_case)]
pub struct EVENT_TRACE_PROPERTIES {
    pub Wnode: WNODE_HEADER,
    pub BufferSize: u32,
    pub MinimumBuffers: u32,
    pub MaximumBuffers: u32,
    pub MaximumFileSize: u32,
    pub LogFileMode: u32,
    pub FlushTimer: u32,
    pub EnableFlags: u32,
    pub FlushThreshold: i32,
    pub NumberOfBuffers: u32,
    pub FreeBuffers: u32,
    pub EventsLost: u32,
    pub BuffersWritten: u32,
    pub LogBuffersLost: u32,
    pub RealTimeBuffersLost: u32,
    pub LoggerThreadId: RawHandle,
    pub LogFileNameOffset: u32,
    pub LoggerNameOffset: u32,
    /* Extension values, must align to 8-bytes */
    pub LoggerName: [u8; 1024],
}

impl Default for EVENT_TRACE_PROPERTIES {
    fn default() -> Self {
        Self {
            Wnode: WNODE_HEADER::default(),
            BufferSize: 64,
            MinimumBuffers: 0,
            MaximumBuffers: 0,
            MaximumFileSize: 0,
            LogFileMode: EVENT_TRACE_REAL_TIME_MODE,
            FlushTimer: 0,
            EnableFlags: 0,
            FlushThreshold: 0,
            NumberOfBuffers: 0,
            FreeBuffers: 0,
            EventsLost: 0,
            BuffersWritten: 0,
            LogBuffersLost: 0,
            RealTimeBuffersLost: 0,
            LoggerThreadId: std::ptr::null_mut(),
            LogFileNameOffset: 0,
            LoggerNameOffset: 120,
            LoggerName: [0; 1024],
        }
    }
}

#[repr(C)]
#[allow(non_snake_case)]
pub struct TRACE_LOGFILE_HEADER {
    pub BufferSize: u32,
    pub Version: u32,
    pub ProviderVersion: u32,
    pub NumberOfProcessors: u32,
    pub EndTime: u64,
    pub TimerResolution: u32,
    pub MaximumFileSize: u32,
    pub LogFileMode: u32,
    pub BuffersWritten: u32,
    pub StartBuffers: u32,
    pub PointerSize: u32,
    pub EventsLost: u32,
    pub CpuSpeedInMhz: u32,
    pub LoggerName: *const u16,
    pub LogFileName: *const u16,
    pub TimeZone: [u8; 172],
    pub BootTime: u64,
    pub PerfFreq: u64,
    pub StartTime: u64,
    pub ReservedFlags: u32,
    pub BuffersLost: u32,
}

impl Default for TRACE_LOGFILE_HEADER {
    fn default() -> TRACE_LOGFILE_HEADER {
        TRACE_LOGFILE_HEADER {
            BufferSize: 0,
            Version: 0,
            ProviderVersion: 0,
            NumberOfProcessors: 0,
            EndTime: 0,
            TimerResolution: 0,
            MaximumFileSize: 0,
            LogFileMode: 0,
            BuffersWritten: 0,
            StartBuffers: 0,
            PointerSize: 0,
            EventsLost: 0,
            CpuSpeedInMhz: 0,
            LoggerName: std::ptr::null(),
            LogFileName: std::ptr::null(),
            TimeZone: [0; 172],
            BootTime: 0,
            PerfFreq: 0,
            StartTime: 0,
            ReservedFlags: 0,
            BuffersLost: 0,
        }
    }
}

#[repr(C)]
#[allow(non_snake_case)]
pub struct EVENT_TRACE_HEADER {
    pub Size: u16,
    pub FieldTypeFlags: u16,
    pub Version: u32,
    pub ThreadId: u32,
    pub ProcessId: u32,
    pub TimeStamp: u64,
    pub Guid: Guid,
    pub ClientContext: u32,
    pub Flags: u32,
}

impl Default for EVENT_TRACE_HEADER {
    fn default() -> EVENT_TRACE_HEADER {
        EVENT_TRACE_HEADER {
            Size: 0,
            FieldTypeFlags: 0,
            Version: 0,
            ThreadId: 0,
            ProcessId: 0,
            TimeStamp: 0,
            Guid: Guid::default(),
            ClientContext: 0,
            Flags: 0,
        }
    }
}

#[repr(C)]
#[allow(non_snake_case)]
pub struct EVENT_TRACE {
    pub Header: EVENT_TRACE_HEADER,
    pub InstanceId: u32,
    pub ParentInstanceId: u32,
    pub ParentGuid: Guid,
    pub MofData: *const u8,
    pub MofLength: u32,
    pub ProcessorIndex: u16,
    pub LoggerId: u16,
}

impl Default for EVENT_TRACE {
    fn default() -> EVENT_TRACE {
        EVENT_TRACE {
            Header: EVENT_TRACE_HEADER::default(),
            InstanceId: 0,
            ParentInstanceId: 0,
            ParentGuid: Guid::default(),
            MofData: std::ptr::null(),
            MofLength: 0,
            ProcessorIndex: 0,
            LoggerId: 0,
        }
    }
}

#[repr(C)]
#[allow(non_snake_case)]
pub struct EVENT_TRACE_LOGFILE {
    pub LogFileName: *const u16,
    pub LoggerName: *const u16,
    pub CurrentTime: u64,
    pub BuffersRead: u32,
    pub ProcessTraceMode: u32,
    pub CurrentEvent: EVENT_TRACE,
    pub LogFileHeader: TRACE_LOGFILE_HEADER,
    pub BufferCallback: extern "system" fn(*const TRACE_LOGFILE_HEADER) -> u32,
    pub BufferSize: u32,
    pub Filled: u32,
    pub EventsLost: u32,
    pub EventRecordCallback: extern "system" fn(*const EVENT_RECORD),
    pub IsKernelTrace: u32,
    pub Context: *const std::ffi::c_void,
}

#[repr(C)]
#[allow(non_snake_case)]
pub struct EVENT_FILTER_DESCRIPTOR {
    pub Filter: *const u8,
    pub Size: u32,
    pub Type: u32,
}

impl Default for EVENT_FILTER_DESCRIPTOR {
    fn default() -> Self {
        Self {
            Filter: std::ptr::null(),
            Size: 0,
            Type: 0,
        }
    }
}

#[repr(C)]
#[allow(non_snake_case)]
pub struct ENABLE_TRACE_PARAMETERS {
    pub Version: u32,
    pub EnableProperty: u32,
    pub ControlFlags: u32,
    pub SourceId: Guid,
    pub EnableFilterDesc: *const EVENT_FILTER_DESCRIPTOR,
    pub FilterDescCount: u32,
}

impl Default for ENABLE_TRACE_PARAMETERS {
    fn default() -> Self {
        Self {
            Version: 2,
            EnableProperty: 0,
            ControlFlags: 0,
            SourceId: Guid::default(),
            EnableFilterDesc: std::ptr::null(),
            FilterDescCount: 0,
        }
    }
}

#[repr(C)]
#[allow(non_snake_case)]
#[derive(Default, Clone, Copy)]
pub struct EVENT_DESCRIPTOR {
    pub Id: u16,
    pub Version: u8,
    pub Channel: u8,
    pub Level: u8,
    pub Opcode: u8,
    pub Task: u16,
    pub Keyword: u64,
}

#[repr(C)]
#[allow(non_snake_case)]
pub struct EVENT_HEADER {
    pub Size: u16,
    pub HeaderType: u16,
    pub Flags: u16,
    pub EventProperty: u16,
    pub ThreadId: u32,
    pub ProcessId: u32,
    pub TimeStamp: u64,
    pub ProviderId: Guid,
    pub EventDescriptor: EVENT_DESCRIPTOR,
    pub KernelTime: u32,
    pub UserTime: u32,
    pub ActivityId: Guid,
}

#[repr(C)]
#[allow(non_snake_case)]
pub struct EVENT_HEADER_EXTENDED_DATA_ITEM {
    pub Reserved1: u16,
    pub ExtType: u16,
    pub Linkage: u16,
    pub DataSize: u16,
    pub DataPtr: *const u8,
}

#[repr(C)]
#[allow(non_snake_case)]
pub struct EVENT_RECORD {
    pub EventHeader: EVENT_HEADER,
    pub ProcessorIndex: u16,
    pub LoggerId: u16,
    pub ExtendedDataCount: u16,
    pub UserDataLength: u16,
    pub ExtendedData: *const EVENT_HEADER_EXTENDED_DATA_ITEM,
    pub UserData: *const u8,
    pub UserContext: *const std::ffi::c_void,
}

impl EVENT_RECORD {
    pub fn user_data_slice(&self) -> &[u8] {
        if self.UserData.is_null() || self.UserDataLength == 0 {
            return &[];
        }

        unsafe {
            std::slice::from_raw_parts(
                self.UserData,
                self.UserDataLength as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_filter_layout() {
        let data = build_event_id_filter(&[7937, 42]);

        /* FilterIn, reserved, count, then the ids */
        assert_eq!(1u8, data[0]);
        assert_eq!(0u8, data[1]);
        assert_eq!(2u16, u16::from_ne_bytes([data[2], data[3]]));
        assert_eq!(7937u16, u16::from_ne_bytes([data[4], data[5]]));
        assert_eq!(42u16, u16::from_ne_bytes([data[6], data[7]]));
    }

    #[test]
    fn wide_strings_are_terminated() {
        let wide = wide_string("abc");

        assert_eq!(vec![97u16, 98u16, 99u16, 0u16], wide);
    }
}
