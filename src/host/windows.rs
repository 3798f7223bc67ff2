// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use twox_hash::XxHash64;

use crate::abi;
use crate::error::TraceError;
use crate::host::{ConsumerHandle, EnableRequest, HostRuntime, SessionHandle, TraceStats};
use crate::perfinfo::GroupMask;
use crate::record::EventRecord;
use crate::trace::TraceProperties;
use crate::Guid;

/// The real ETW host. Consumer handles are bookkeeping only: the OS
/// consumer is opened inside `process_events` because ETW binds the
/// record callback at OpenTraceW time.
pub struct EtwHost {
    consumers: Mutex<HashMap<u64, String, BuildHasherDefault<XxHash64>>>,
    next_consumer: AtomicU64,
}

impl EtwHost {
    pub fn new() -> Self {
        Self {
            consumers: Mutex::new(HashMap::default()),
            next_consumer: AtomicU64::new(1),
        }
    }
}

impl Default for EtwHost {
    fn default() -> Self {
        Self::new()
    }
}

extern "system" fn buffer_callback(
    _header: *const abi::TRACE_LOGFILE_HEADER) -> u32 {
    1
}

extern "system" fn record_callback(
    record: *const abi::EVENT_RECORD) {
    unsafe {
        let raw = &*record;

        if raw.UserContext.is_null() {
            return;
        }

        /* Recover the dispatcher closure from the consumer context */
        let callback =
            raw.UserContext as *mut &mut dyn FnMut(&EventRecord);

        (*callback)(EventRecord::from_abi(record));
    }
}

fn build_properties(
    properties: &TraceProperties,
    kernel_flags: u32) -> abi::EVENT_TRACE_PROPERTIES {
    let mut native = abi::EVENT_TRACE_PROPERTIES::default();

    native.BufferSize = properties.buffer_size_kb;
    native.MinimumBuffers = properties.min_buffers;
    native.MaximumBuffers = properties.max_buffers;
    native.FlushTimer = properties.flush_timer_seconds;
    native.LogFileMode = properties.log_file_mode;
    native.EnableFlags = kernel_flags;

    native
}

impl HostRuntime for EtwHost {
    fn start_session(
        &self,
        name: &str,
        properties: &TraceProperties,
        kernel_flags: u32) -> Result<SessionHandle, TraceError> {
        let trace_name = abi::wide_string(name);
        let mut native = build_properties(properties, kernel_flags);
        let mut handle: u64 = 0;

        unsafe {
            /* Stop any previously running instance */
            abi::ControlTraceW(
                0,
                trace_name.as_ptr(),
                &mut native,
                abi::EVENT_TRACE_CONTROL_STOP);

            let mut native = build_properties(properties, kernel_flags);

            let status = abi::StartTraceW(
                &mut handle,
                trace_name.as_ptr(),
                &mut native);

            if status != abi::ERROR_SUCCESS {
                return Err(TraceError::from_status(status, "StartTraceW"));
            }
        }

        tracing::debug!(name, handle, "trace session started");

        Ok(handle)
    }

    fn stop_session(
        &self,
        handle: SessionHandle,
        _name: &str) -> u32 {
        let mut native = abi::EVENT_TRACE_PROPERTIES::default();

        unsafe {
            abi::ControlTraceW(
                handle,
                std::ptr::null(),
                &mut native,
                abi::EVENT_TRACE_CONTROL_STOP)
        }
    }

    fn enable_provider(
        &self,
        handle: SessionHandle,
        request: &EnableRequest) -> u32 {
        let mut parameters = abi::ENABLE_TRACE_PARAMETERS::default();
        let mut descriptor = abi::EVENT_FILTER_DESCRIPTOR::default();

        parameters.SourceId = request.guid;
        parameters.EnableProperty = request.trace_flags;

        /* Filter descriptor memory must outlive the enable call */
        let filter = abi::build_event_id_filter(&request.event_ids);

        if !request.event_ids.is_empty() {
            descriptor.Type = abi::EVENT_FILTER_TYPE_EVENT_ID;
            descriptor.Filter = filter.as_ptr();
            descriptor.Size = filter.len() as u32;

            parameters.EnableFilterDesc = &descriptor;
            parameters.FilterDescCount = 1;
        }

        let status = unsafe {
            abi::EnableTraceEx2(
                handle,
                &request.guid,
                abi::EVENT_CONTROL_CODE_ENABLE_PROVIDER,
                request.level,
                request.any,
                request.all,
                0,
                &parameters)
        };

        if status != abi::ERROR_SUCCESS {
            return status;
        }

        if request.capture_state {
            unsafe {
                abi::EnableTraceEx2(
                    handle,
                    &request.guid,
                    abi::EVENT_CONTROL_CODE_CAPTURE_STATE,
                    request.level,
                    request.any,
                    request.all,
                    0,
                    std::ptr::null())
            }
        } else {
            status
        }
    }

    fn set_trace_information(
        &self,
        handle: SessionHandle,
        mask: &GroupMask) -> u32 {
        unsafe {
            abi::TraceSetInformation(
                handle,
                abi::TRACE_SYSTEM_TRACE_ENABLE_FLAGS_INFO,
                mask.masks().as_ptr() as *const u8,
                std::mem::size_of_val(mask.masks()) as u32)
        }
    }

    fn open_session(
        &self,
        name: &str) -> Result<ConsumerHandle, TraceError> {
        let handle = self.next_consumer.fetch_add(1, Ordering::Relaxed);

        self.consumers
            .lock()
            .unwrap()
            .insert(handle, name.to_owned());

        Ok(handle)
    }

    fn process_events(
        &self,
        handle: ConsumerHandle,
        callback: &mut dyn FnMut(&EventRecord)) -> u32 {
        let name = match self.consumers.lock().unwrap().get(&handle) {
            Some(name) => name.clone(),
            None => { return abi::ERROR_INVALID_PARAMETER; },
        };

        let log_name = abi::wide_string(&name);
        let mut callback = callback;

        let context = &mut callback
            as *mut &mut dyn FnMut(&EventRecord)
            as *const std::ffi::c_void;

        let log = abi::EVENT_TRACE_LOGFILE {
            LogFileName: std::ptr::null(),
            LoggerName: log_name.as_ptr(),
            CurrentTime: 0,
            BuffersRead: 0,
            ProcessTraceMode: abi::PROCESS_TRACE_MODE_EVENT_RECORD |
                abi::PROCESS_TRACE_MODE_REAL_TIME |
                abi::PROCESS_TRACE_MODE_RAW_TIMESTAMP,
            CurrentEvent: abi::EVENT_TRACE::default(),
            LogFileHeader: abi::TRACE_LOGFILE_HEADER::default(),
            BufferCallback: buffer_callback,
            BufferSize: 0,
            Filled: 0,
            EventsLost: 0,
            EventRecordCallback: record_callback,
            IsKernelTrace: 0,
            Context: context,
        };

        unsafe {
            let trace = abi::OpenTraceW(&log);

            if trace == u64::MAX {
                return abi::GetLastError();
            }

            let status = abi::ProcessTrace(
                &trace,
                1,
                std::ptr::null(),
                std::ptr::null());

            abi::CloseTrace(trace);

            status
        }
    }

    fn close_session(
        &self,
        handle: ConsumerHandle) -> u32 {
        self.consumers.lock().unwrap().remove(&handle);

        abi::ERROR_SUCCESS
    }

    fn get_event_metadata(
        &self,
        record: &EventRecord,
        buffer: &mut [u8],
        size: &mut u32) -> u32 {
        let pointer = if buffer.is_empty() {
            std::ptr::null_mut()
        } else {
            buffer.as_mut_ptr()
        };

        unsafe {
            abi::TdhGetEventInformation(
                record.raw(),
                0,
                std::ptr::null(),
                pointer,
                size)
        }
    }

    fn query_stats(
        &self,
        handle: SessionHandle,
        _name: &str) -> Result<TraceStats, TraceError> {
        let mut native = abi::EVENT_TRACE_PROPERTIES::default();

        let status = unsafe {
            abi::ControlTraceW(
                handle,
                std::ptr::null(),
                &mut native,
                abi::EVENT_TRACE_CONTROL_QUERY)
        };

        if status != abi::ERROR_SUCCESS {
            return Err(TraceError::from_status(status, "ControlTraceW"));
        }

        Ok(TraceStats {
            buffers_read: native.BuffersWritten,
            buffers_lost: native.RealTimeBuffersLost,
            events_total: 0,
            events_handled: 0,
            events_lost: native.EventsLost,
        })
    }

    fn resolve_provider_name(
        &self,
        name: &str) -> Result<Guid, TraceError> {
        /* TdhEnumerateProviders is two-phase like the metadata query */
        let mut size: u32 = 0;

        let status = unsafe {
            abi::TdhEnumerateProviders(std::ptr::null_mut(), &mut size)
        };

        if status != abi::ERROR_INSUFFICIENT_BUFFER {
            return Err(TraceError::from_status(
                status,
                "TdhEnumerateProviders"));
        }

        let mut buffer = vec![0u8; size as usize];

        let status = unsafe {
            abi::TdhEnumerateProviders(buffer.as_mut_ptr(), &mut size)
        };

        if status != abi::ERROR_SUCCESS {
            return Err(TraceError::from_status(
                status,
                "TdhEnumerateProviders"));
        }

        /*
         * PROVIDER_ENUMERATION_INFO:
         *   u32 NumberOfProviders, u32 Reserved,
         *   TRACE_PROVIDER_INFO[]: Guid, u32 SchemaSource, u32 NameOffset
         */
        if buffer.len() < 8 {
            return Err(TraceError::InvalidParameter);
        }

        let count = u32::from_ne_bytes(buffer[0..4].try_into().unwrap());
        let entry_size = std::mem::size_of::<Guid>() + 8;

        for i in 0..count as usize {
            let offset = 8 + i * entry_size;

            if offset + entry_size > buffer.len() {
                break;
            }

            let name_offset = u32::from_ne_bytes(
                buffer[offset + entry_size - 4..offset + entry_size]
                    .try_into()
                    .unwrap()) as usize;

            if name_offset >= buffer.len() {
                continue;
            }

            /* Provider names are stored as NUL terminated UTF-16 */
            let mut units = Vec::new();

            for chunk in buffer[name_offset..].chunks_exact(2) {
                let unit = u16::from_le_bytes([chunk[0], chunk[1]]);

                if unit == 0 {
                    break;
                }

                units.push(unit);
            }

            let candidate = String::from_utf16_lossy(&units);

            if candidate.eq_ignore_ascii_case(name) {
                let guid = unsafe {
                    std::ptr::read_unaligned(
                        buffer[offset..].as_ptr() as *const Guid)
                };

                return Ok(guid);
            }
        }

        tracing::warn!(name, "provider name not found");

        Err(TraceError::InvalidParameter)
    }
}
