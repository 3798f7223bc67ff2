// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use twox_hash::XxHash64;

use crate::abi;
use crate::error::{check_status, TraceError};
use crate::filter::predicate::FilterContext;
use crate::host::{EnableRequest, HostRuntime, SessionHandle, TraceStats};
use crate::perfinfo::GroupMask;
use crate::provider::{KernelProvider, Provider};
use crate::record::{
    ErrorCallback,
    EventCallback,
    EventRecord,
    MetadataCallback,
    NoopReader,
    PropertyReader,
    RecordError,
    TypedRecord,
};
use crate::schema::SchemaLocator;

/// Session properties applied when the session is created. Must be set
/// before `open`.
#[derive(Clone, Debug)]
pub struct TraceProperties {
    /// Per-buffer size in KB. The host caps this at 1024.
    pub buffer_size_kb: u32,
    pub min_buffers: u32,
    pub max_buffers: u32,
    /// Forced-flush period in seconds; zero disables the flush timer.
    pub flush_timer_seconds: u32,
    /// EVENT_TRACE_* log file mode bits.
    pub log_file_mode: u32,
}

impl Default for TraceProperties {
    fn default() -> Self {
        Self {
            buffer_size_kb: 64,
            min_buffers: 0,
            max_buffers: 0,
            flush_timer_seconds: 0,
            log_file_mode: abi::EVENT_TRACE_REAL_TIME_MODE,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TraceState {
    Constructed,
    Configured,
    Open,
    Running,
    Stopped,
    Disposed,
}

/// Stops a running trace from another thread. The pump thread blocks
/// inside `start`; a stop handle is how any other thread makes the pump
/// return. Stopping is idempotent.
pub struct StopHandle {
    host: Arc<dyn HostRuntime>,
    session: SessionHandle,
    name: String,
}

impl StopHandle {
    pub fn stop(&self) -> Result<(), TraceError> {
        let status = self.host.stop_session(self.session, &self.name);

        if status != abi::ERROR_SUCCESS {
            /* Best-effort: the session may already be gone */
            tracing::debug!(status, "remote stop returned non-success");
        }

        Ok(())
    }
}

struct TraceCore {
    name: String,
    host: Arc<dyn HostRuntime>,
    properties: TraceProperties,
    providers: Vec<Provider>,
    locator: SchemaLocator,
    reader: Box<dyn PropertyReader>,
    default_metadata: Option<MetadataCallback>,
    default_event: Option<EventCallback>,
    default_error: Option<ErrorCallback>,
    events_handled: Arc<AtomicU64>,
    session: SessionHandle,
    state: TraceState,
    kernel_flags: u32,
    group_mask: Option<GroupMask>,
}

impl TraceCore {
    fn new(
        name: &str,
        host: Arc<dyn HostRuntime>) -> Self {
        Self {
            name: name.to_owned(),
            host,
            properties: TraceProperties::default(),
            providers: Vec::new(),
            locator: SchemaLocator::new(),
            reader: Box::new(NoopReader),
            default_metadata: None,
            default_event: None,
            default_error: None,
            events_handled: Arc::new(AtomicU64::new(0)),
            session: 0,
            state: TraceState::Constructed,
            kernel_flags: 0,
            group_mask: None,
        }
    }

    fn set_trace_properties(
        &mut self,
        properties: &TraceProperties) -> Result<(), TraceError> {
        match self.state {
            TraceState::Constructed | TraceState::Configured => { },
            _ => { return Err(TraceError::InvalidParameter); },
        }

        let mut properties = properties.clone();

        if properties.buffer_size_kb > abi::MAX_BUFFER_SIZE_KB {
            properties.buffer_size_kb = abi::MAX_BUFFER_SIZE_KB;
        }

        self.properties = properties;
        self.state = TraceState::Configured;

        Ok(())
    }

    fn open(&mut self) -> Result<(), TraceError> {
        match self.state {
            TraceState::Constructed | TraceState::Configured => { },
            TraceState::Open => { return Ok(()); },
            _ => { return Err(TraceError::InvalidParameter); },
        }

        self.session = self.host.start_session(
            &self.name,
            &self.properties,
            self.kernel_flags)?;

        if let Some(mask) = &self.group_mask {
            check_status(
                self.host.set_trace_information(self.session, mask),
                "TraceSetInformation")?;
        }

        self.state = TraceState::Open;

        Ok(())
    }

    fn stop_handle(&mut self) -> Result<StopHandle, TraceError> {
        self.open()?;

        Ok(StopHandle {
            host: Arc::clone(&self.host),
            session: self.session,
            name: self.name.clone(),
        })
    }

    /// Builds the per-GUID union of every provider's enablement
    /// parameters. ETW admits one enablement per (session, GUID), so
    /// providers sharing a GUID must not compete for parameters.
    fn build_enable_requests(&self) -> Vec<EnableRequest> {
        let mut index: HashMap<crate::Guid, usize, BuildHasherDefault<XxHash64>> =
            HashMap::default();
        let mut requests: Vec<EnableRequest> = Vec::new();

        for provider in &self.providers {
            let slot = match index.get(&provider.guid()) {
                Some(slot) => *slot,
                None => {
                    index.insert(provider.guid(), requests.len());

                    requests.push(EnableRequest {
                        guid: provider.guid(),
                        level: 0,
                        any: 0,
                        all: 0,
                        trace_flags: 0,
                        event_ids: Vec::new(),
                        capture_state: false,
                    });

                    requests.len() - 1
                },
            };

            let request = &mut requests[slot];

            request.level |= provider.level();
            request.any |= provider.any();
            request.all |= provider.all();
            request.trace_flags |= provider.trace_flags();
            request.capture_state |= provider.rundown_requested();

            for id in provider.filter_event_ids() {
                if !request.event_ids.contains(&id) {
                    request.event_ids.push(id);
                }
            }
        }

        requests
    }

    fn start(&mut self) -> Result<(), TraceError> {
        if self.state == TraceState::Running {
            return Err(TraceError::InvalidParameter);
        }

        self.open()?;

        for provider in &mut self.providers {
            provider.resolve(&*self.host)?;
        }

        for request in self.build_enable_requests() {
            check_status(
                self.host.enable_provider(self.session, &request),
                "EnableTraceEx2")?;

            tracing::debug!(
                provider = %request.guid,
                level = request.level,
                events = request.event_ids.len(),
                "provider enabled");
        }

        let consumer = self.host.open_session(&self.name)?;

        self.state = TraceState::Running;

        tracing::debug!(name = %self.name, "entering event pump");

        let host = Arc::clone(&self.host);
        let host_ref: &dyn HostRuntime = &*host;
        let providers = &mut self.providers;
        let locator = &self.locator;
        let reader = &*self.reader;
        let default_metadata = &mut self.default_metadata;
        let default_event = &mut self.default_event;
        let default_error = &mut self.default_error;
        let events_handled = Arc::clone(&self.events_handled);
        let mut errors = Vec::new();

        let mut dispatch = |record: &EventRecord| {
            events_handled.fetch_add(1, Ordering::Relaxed);

            dispatch_record(
                record,
                providers,
                locator,
                host_ref,
                reader,
                default_metadata,
                default_event,
                default_error,
                &mut errors);
        };

        let status = self.host.process_events(consumer, &mut dispatch);

        self.state = TraceState::Stopped;
        self.host.close_session(consumer);

        tracing::debug!(name = %self.name, status, "event pump returned");

        match status {
            abi::ERROR_SUCCESS |
            abi::ERROR_CANCELLED |
            abi::ERROR_CTX_CLOSE_PENDING => Ok(()),
            other => Err(TraceError::from_status(other, "ProcessTrace")),
        }
    }

    fn stop(&mut self) -> Result<(), TraceError> {
        if self.session == 0 {
            /* Stop before the session ever existed */
            self.state = TraceState::Disposed;
            return Ok(());
        }

        let status = self.host.stop_session(self.session, &self.name);

        if status != abi::ERROR_SUCCESS {
            /* Best-effort: repeated stops are expected to no-op */
            tracing::debug!(status, "stop returned non-success");
        }

        if self.state != TraceState::Disposed {
            self.state = TraceState::Stopped;
        }

        Ok(())
    }

    fn query_stats(&self) -> Result<TraceStats, TraceError> {
        let mut stats = self.host.query_stats(self.session, &self.name)?;

        stats.events_handled = self.events_handled.load(Ordering::Relaxed);

        Ok(stats)
    }

    fn buffers_processed(&self) -> u64 {
        match self.query_stats() {
            Ok(stats) => stats.buffers_read as u64,
            Err(_) => 0,
        }
    }
}

impl Drop for TraceCore {
    fn drop(&mut self) {
        if self.state != TraceState::Disposed {
            let _ = self.stop();
            self.state = TraceState::Disposed;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn dispatch_record(
    record: &EventRecord,
    providers: &mut [Provider],
    locator: &SchemaLocator,
    host: &dyn HostRuntime,
    reader: &dyn PropertyReader,
    default_metadata: &mut Option<MetadataCallback>,
    default_event: &mut Option<EventCallback>,
    default_error: &mut Option<ErrorCallback>,
    errors: &mut Vec<anyhow::Error>) {
    let guid = record.provider_id();
    let mut matched = false;

    /* Metadata chains run before schema lookup and regardless of it */
    for provider in providers.iter_mut() {
        if provider.guid() == guid {
            matched = true;
            provider.dispatch_metadata(record);
        }
    }

    if !matched {
        dispatch_default(
            record,
            locator,
            host,
            reader,
            default_metadata,
            default_event,
            default_error);
        return;
    }

    match locator.get_schema(record, host) {
        Ok(schema) => {
            let typed = TypedRecord::new(record, &schema, reader);
            let context = FilterContext::new(locator, host, reader);

            /* Every matching provider sees the event, in insertion order */
            for provider in providers.iter_mut() {
                if provider.guid() == guid {
                    provider.dispatch_event(&typed, &context, errors);
                }
            }
        },
        Err(error) => {
            let message = error.to_string();
            let record_error = RecordError::new(&message, record);

            for provider in providers.iter_mut() {
                if provider.guid() == guid {
                    provider.dispatch_error(&record_error);
                }
            }

            notify_default_error(default_error, &record_error);
        },
    }
}

/// Handles a record whose provider GUID has no registered provider:
/// the trace's default metadata callback always fires, the default
/// event callback fires when the schema resolves, and the default
/// error callback otherwise.
fn dispatch_default(
    record: &EventRecord,
    locator: &SchemaLocator,
    host: &dyn HostRuntime,
    reader: &dyn PropertyReader,
    default_metadata: &mut Option<MetadataCallback>,
    default_event: &mut Option<EventCallback>,
    default_error: &mut Option<ErrorCallback>) {
    if let Some(callback) = default_metadata {
        if let Err(e) = (callback)(record) {
            let message = e.to_string();

            notify_default_error(
                default_error,
                &RecordError::new(&message, record));
        }
    }

    if default_event.is_none() {
        return;
    }

    match locator.get_schema(record, host) {
        Ok(schema) => {
            let typed = TypedRecord::new(record, &schema, reader);

            if let Some(callback) = default_event {
                if let Err(e) = (callback)(&typed) {
                    let message = e.to_string();

                    notify_default_error(
                        default_error,
                        &RecordError::new(&message, record));
                }
            }
        },
        Err(error) => {
            let message = error.to_string();

            notify_default_error(
                default_error,
                &RecordError::new(&message, record));
        },
    }
}

fn notify_default_error(
    default_error: &mut Option<ErrorCallback>,
    error: &RecordError) {
    match default_error {
        Some(callback) => (callback)(error),
        None => {
            tracing::warn!(
                message = error.message(),
                "unhandled trace error");
        },
    }
}

fn generated_name() -> String {
    format!("etw_collect_{}", std::process::id())
}

/// An owned user trace session.
///
/// `start` blocks the calling thread: that thread becomes the event
/// pump. Use a `StopHandle` from another thread to make it return.
pub struct UserTrace {
    core: TraceCore,
}

impl UserTrace {
    /// Constructs a user trace with a generated session name, backed by
    /// the real ETW host.
    #[cfg(target_os = "windows")]
    pub fn new() -> Self {
        Self::named(&generated_name())
    }

    /// Constructs a named user trace backed by the real ETW host.
    #[cfg(target_os = "windows")]
    pub fn named(
        name: &str) -> Self {
        Self::with_host(
            name,
            Arc::new(crate::host::windows::EtwHost::new()))
    }

    /// Constructs a user trace over an explicit host runtime.
    pub fn with_host(
        name: &str,
        host: Arc<dyn HostRuntime>) -> Self {
        let name = if name.is_empty() {
            generated_name()
        } else {
            name.to_owned()
        };

        Self {
            core: TraceCore::new(&name, host),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Sets the session properties. Must precede `open`.
    pub fn set_trace_properties(
        &mut self,
        properties: &TraceProperties) -> Result<(), TraceError> {
        self.core.set_trace_properties(properties)
    }

    /// Installs the property reader used for typed reads and property
    /// predicates.
    pub fn set_property_reader(
        &mut self,
        reader: Box<dyn PropertyReader>) {
        self.core.reader = reader;
    }

    /// Attaches a provider to this trace. Configuration of providers
    /// is frozen once the trace starts.
    pub fn enable(
        &mut self,
        provider: Provider) {
        self.core.providers.push(provider);
    }

    /// Called with a header-only view of records whose provider GUID
    /// has no registered provider.
    pub fn default_metadata(
        &mut self,
        callback: impl FnMut(&EventRecord) -> anyhow::Result<()> + 'static) {
        self.core.default_metadata = Some(Box::new(callback));
    }

    pub fn default_event(
        &mut self,
        callback: impl FnMut(&TypedRecord<'_>) -> anyhow::Result<()> + 'static) {
        self.core.default_event = Some(Box::new(callback));
    }

    pub fn default_error(
        &mut self,
        callback: impl FnMut(&RecordError<'_>) + 'static) {
        self.core.default_error = Some(Box::new(callback));
    }

    /// Registers the session with the host without starting the pump.
    /// Optional; `start` opens the session if this was skipped.
    pub fn open(&mut self) -> Result<(), TraceError> {
        self.core.open()
    }

    /// Enables the attached providers and blocks pumping events until
    /// the session is stopped.
    pub fn start(&mut self) -> Result<(), TraceError> {
        self.core.start()
    }

    /// Stops the session from the owning thread. Safe to call
    /// repeatedly and before `start`.
    pub fn stop(&mut self) -> Result<(), TraceError> {
        self.core.stop()
    }

    /// Returns a handle that stops this trace from another thread,
    /// opening the session first if needed.
    pub fn stop_handle(&mut self) -> Result<StopHandle, TraceError> {
        self.core.stop_handle()
    }

    pub fn query_stats(&self) -> Result<TraceStats, TraceError> {
        self.core.query_stats()
    }

    pub fn buffers_processed(&self) -> u64 {
        self.core.buffers_processed()
    }
}

/// An owned kernel trace session. Kernel providers are selected by
/// legacy enable flags or by a PERFINFO group mask; both are unioned
/// across providers and applied at session setup.
pub struct KernelTrace {
    core: TraceCore,
}

impl KernelTrace {
    #[cfg(target_os = "windows")]
    pub fn new() -> Self {
        Self::named(&generated_name())
    }

    #[cfg(target_os = "windows")]
    pub fn named(
        name: &str) -> Self {
        Self::with_host(
            name,
            Arc::new(crate::host::windows::EtwHost::new()))
    }

    /// Constructs a kernel trace over an explicit host runtime. On
    /// hosts without system-logger support the session name is forced
    /// to the single kernel logger name.
    pub fn with_host(
        name: &str,
        host: Arc<dyn HostRuntime>) -> Self {
        let name = if !host.supports_system_logger() {
            abi::KERNEL_LOGGER_NAME.to_owned()
        } else if name.is_empty() {
            generated_name()
        } else {
            name.to_owned()
        };

        Self {
            core: TraceCore::new(&name, host),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn set_trace_properties(
        &mut self,
        properties: &TraceProperties) -> Result<(), TraceError> {
        self.core.set_trace_properties(properties)
    }

    pub fn set_property_reader(
        &mut self,
        reader: Box<dyn PropertyReader>) {
        self.core.reader = reader;
    }

    /// Attaches a kernel provider. Its enable flags and group mask are
    /// unioned into the session's, its dispatch joins the provider set.
    pub fn enable(
        &mut self,
        provider: KernelProvider) {
        let (provider, flags, mask) = provider.into_parts();

        self.core.kernel_flags |= flags;

        if let Some(mask) = mask {
            match &mut self.core.group_mask {
                Some(existing) => existing.union(&mask),
                None => { self.core.group_mask = Some(mask); },
            }
        }

        self.core.providers.push(provider);
    }

    pub fn default_metadata(
        &mut self,
        callback: impl FnMut(&EventRecord) -> anyhow::Result<()> + 'static) {
        self.core.default_metadata = Some(Box::new(callback));
    }

    pub fn default_event(
        &mut self,
        callback: impl FnMut(&TypedRecord<'_>) -> anyhow::Result<()> + 'static) {
        self.core.default_event = Some(Box::new(callback));
    }

    pub fn default_error(
        &mut self,
        callback: impl FnMut(&RecordError<'_>) + 'static) {
        self.core.default_error = Some(Box::new(callback));
    }

    pub fn open(&mut self) -> Result<(), TraceError> {
        self.core.open()
    }

    pub fn start(&mut self) -> Result<(), TraceError> {
        self.core.start()
    }

    pub fn stop(&mut self) -> Result<(), TraceError> {
        self.core.stop()
    }

    pub fn stop_handle(&mut self) -> Result<StopHandle, TraceError> {
        self.core.stop_handle()
    }

    pub fn query_stats(&self) -> Result<TraceStats, TraceError> {
        self.core.query_stats()
    }

    pub fn buffers_processed(&self) -> u64 {
        self.core.buffers_processed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::predicate::{and_all_of, id_is, opcode_is, or_any_of};
    use crate::filter::EventFilter;
    use crate::perfinfo;
    use crate::record::InType;
    use crate::sharing::Writable;
    use crate::testing::{CaptureHost, RecordBuilder, SchemaTable, TableReader};
    use crate::Guid;

    const POWERSHELL: Guid =
        Guid::from_u128(0xa0c1853b_5c40_4b15_8766_3cf1c58f985a);
    const IMAGE_LOAD: Guid =
        Guid::from_u128(0x2cb15d1d_5fc1_11d2_abe1_00a0c911f518);
    const UNKNOWN: Guid =
        Guid::from_u128(0x9e814aad_3204_11d2_9a82_006008a86939);

    fn empty_schema(
        host: &CaptureHost,
        provider: Guid,
        id: u16) {
        host.add_schema(provider, id, SchemaTable::new().to_blob());
    }

    #[test]
    fn powershell_filter_by_event_id() {
        let host = Arc::new(CaptureHost::new());

        empty_schema(&host, POWERSHELL, 7937);
        empty_schema(&host, POWERSHELL, 42);

        host.queue_record(RecordBuilder::new(POWERSHELL, 7937, 1, 0).pack());
        host.queue_record(RecordBuilder::new(POWERSHELL, 42, 1, 0).pack());

        let mut provider = Provider::new(POWERSHELL);
        provider.set_any(0xf001_0000_0000_03ff);

        let count = Writable::new(0);
        let hits = count.clone();

        let mut filter = EventFilter::for_event_id(7937);

        filter.on_event(move |record| {
            assert_eq!(7937, record.schema().event_id());
            *hits.borrow_mut() += 1;
            Ok(())
        });

        provider.add_filter(filter);

        let mut trace = UserTrace::with_host("ps_test", host.clone());
        trace.enable(provider);
        trace.start().unwrap();

        assert_eq!(1, *count.borrow());

        let requests = host.enable_requests();

        assert_eq!(1, requests.len());
        assert_eq!(0xf001_0000_0000_03ff, requests[0].any);
        assert_eq!(vec![7937u16], requests[0].event_ids);
    }

    #[test]
    fn kernel_image_load_opcode_filter() {
        let host = Arc::new(CaptureHost::new());

        empty_schema(&host, IMAGE_LOAD, 0);

        for opcode in [10u8, 20u8, 10u8] {
            host.queue_record(
                RecordBuilder::new(IMAGE_LOAD, 0, 2, opcode).pack());
        }

        let mut provider = KernelProvider::new(0x4, IMAGE_LOAD);

        let opcodes = Writable::new(Vec::new());
        let seen = opcodes.clone();

        let mut filter = EventFilter::new(opcode_is(10));

        filter.on_event(move |record| {
            seen.borrow_mut().push(record.opcode());
            Ok(())
        });

        provider.add_filter(filter);

        let mut trace = KernelTrace::with_host("kernel_test", host.clone());
        trace.enable(provider);
        trace.start().unwrap();

        assert_eq!(vec![10u8, 10u8], *opcodes.borrow());
        assert_eq!(0x4, host.sessions()[0].kernel_flags);
    }

    #[test]
    fn or_admits_and_rejects() {
        let host = Arc::new(CaptureHost::new());

        empty_schema(&host, POWERSHELL, 1);
        host.queue_record(RecordBuilder::new(POWERSHELL, 1, 0, 0).pack());

        let or_count = Writable::new(0);
        let and_count = Writable::new(0);

        let mut provider = Provider::new(POWERSHELL);

        let hits = or_count.clone();
        let mut or_filter = EventFilter::new(or_any_of(vec![
            id_is(1),
            id_is(2),
            opcode_is(1),
            opcode_is(2),
        ]));
        or_filter.on_event(move |_record| {
            *hits.borrow_mut() += 1;
            Ok(())
        });
        provider.add_filter(or_filter);

        let hits = and_count.clone();
        let mut and_filter = EventFilter::new(and_all_of(vec![
            id_is(1),
            id_is(2),
            opcode_is(1),
            opcode_is(2),
        ]));
        and_filter.on_event(move |_record| {
            *hits.borrow_mut() += 1;
            Ok(())
        });
        provider.add_filter(and_filter);

        let mut trace = UserTrace::with_host("vectors", host.clone());
        trace.enable(provider);
        trace.start().unwrap();

        assert_eq!(1, *or_count.borrow());
        assert_eq!(0, *and_count.borrow());
    }

    #[test]
    fn shared_guid_providers_enable_once_with_unions() {
        let host = Arc::new(CaptureHost::new());

        let mut first = Provider::new(POWERSHELL);
        first.set_level(0x04);
        first.set_any(0x10);

        let mut second = Provider::new(POWERSHELL);
        second.set_level(0x08);
        second.set_any(0x20);

        let mut trace = UserTrace::with_host("unions", host.clone());
        trace.enable(first);
        trace.enable(second);
        trace.start().unwrap();

        let requests = host.enable_requests();

        assert_eq!(1, requests.len());
        assert_eq!(POWERSHELL, requests[0].guid);
        assert_eq!(0x0C, requests[0].level);
        assert_eq!(0x30, requests[0].any);
    }

    #[test]
    fn shared_guid_providers_both_dispatch_in_order() {
        let host = Arc::new(CaptureHost::new());

        empty_schema(&host, POWERSHELL, 1);
        host.queue_record(RecordBuilder::new(POWERSHELL, 1, 0, 0).pack());

        let order = Writable::new(Vec::new());

        let mut trace = UserTrace::with_host("ordering", host.clone());

        for tag in ["first", "second"] {
            let order = order.clone();
            let mut provider = Provider::new(POWERSHELL);

            provider.on_event(move |_record| {
                order.borrow_mut().push(tag);
                Ok(())
            });

            trace.enable(provider);
        }

        trace.start().unwrap();

        assert_eq!(vec!["first", "second"], *order.borrow());
    }

    #[test]
    fn default_chain_for_unknown_provider() {
        let host = Arc::new(CaptureHost::new());

        empty_schema(&host, POWERSHELL, 5);

        host.queue_record(
            RecordBuilder::new(POWERSHELL, 5, 1, 0)
                .with_process_id(99)
                .pack());
        host.queue_record(RecordBuilder::new(UNKNOWN, 6, 0, 0).pack());

        let metadata = Writable::new(Vec::new());
        let events = Writable::new(Vec::new());
        let errors = Writable::new(Vec::new());

        let mut trace = UserTrace::with_host("defaults", host.clone());

        let seen = metadata.clone();
        trace.default_metadata(move |record| {
            seen.borrow_mut().push((record.id(), record.process_id()));
            Ok(())
        });

        let seen = events.clone();
        trace.default_event(move |record| {
            seen.borrow_mut().push(record.id());
            Ok(())
        });

        let seen = errors.clone();
        trace.default_error(move |error| {
            assert!(!error.message().is_empty());
            seen.borrow_mut().push(error.message().to_string());
        });

        trace.start().unwrap();

        /* Metadata fires for both, event only where the schema resolves */
        assert_eq!(vec![(5, 99), (6, 0)], *metadata.borrow());
        assert_eq!(vec![5u16], *events.borrow());
        assert_eq!(1, errors.borrow().len());
    }

    #[test]
    fn identical_shapes_query_metadata_once() {
        let host = Arc::new(CaptureHost::new());

        host.add_schema(
            POWERSHELL,
            3,
            SchemaTable::new()
                .field("Count", InType::UInt32)
                .to_blob());

        for _ in 0..2 {
            let mut builder = RecordBuilder::new(POWERSHELL, 3, 1, 0);
            builder.add_u32(5);
            host.queue_record(builder.pack());
        }

        let values = Writable::new(Vec::new());
        let seen = values.clone();

        let mut provider = Provider::new(POWERSHELL);
        provider.on_event(move |record| {
            seen.borrow_mut().push(record.get_u32("Count")?);
            Ok(())
        });

        let mut trace = UserTrace::with_host("cache", host.clone());
        trace.set_property_reader(Box::new(TableReader));
        trace.enable(provider);
        trace.start().unwrap();

        assert_eq!(vec![5u32, 5u32], *values.borrow());
        assert_eq!(1, host.metadata_calls());
    }

    #[test]
    fn schema_failure_routes_error_chains() {
        let host = Arc::new(CaptureHost::new());

        /* No schema registered for this shape */
        host.queue_record(RecordBuilder::new(POWERSHELL, 8, 0, 0).pack());

        let order = Writable::new(Vec::new());

        let mut provider = Provider::new(POWERSHELL);

        let seen = order.clone();
        let mut filter = EventFilter::for_event_id(8);
        filter.on_error(move |error| {
            assert!(!error.message().is_empty());
            seen.borrow_mut().push("filter");
        });
        provider.add_filter(filter);

        let seen = order.clone();
        provider.on_error(move |error| {
            assert_eq!(8, error.record().id());
            seen.borrow_mut().push("provider");
        });

        let mut trace = UserTrace::with_host("errors", host.clone());

        let seen = order.clone();
        trace.default_error(move |_error| {
            seen.borrow_mut().push("trace");
        });

        trace.enable(provider);
        trace.start().unwrap();

        assert_eq!(vec!["filter", "provider", "trace"], *order.borrow());
    }

    #[test]
    fn stop_from_another_thread() {
        let host = Arc::new(CaptureHost::new());
        host.park_until_stopped();

        let mut trace = UserTrace::with_host("parked", host.clone());
        let handle = trace.stop_handle().unwrap();

        let stopper = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            handle.stop().unwrap();

            /* Stopping again is harmless */
            handle.stop().unwrap();
        });

        trace.start().unwrap();
        stopper.join().unwrap();

        assert!(host.stopped());
    }

    #[test]
    fn stop_before_start_is_a_no_op() {
        let host = Arc::new(CaptureHost::new());
        let mut trace = UserTrace::with_host("idle", host.clone());

        trace.stop().unwrap();
        trace.stop().unwrap();

        assert!(host.sessions().is_empty());
    }

    #[test]
    fn buffer_size_is_clamped() {
        let host = Arc::new(CaptureHost::new());
        let mut trace = UserTrace::with_host("clamped", host.clone());

        trace
            .set_trace_properties(&TraceProperties {
                buffer_size_kb: 4096,
                ..Default::default()
            })
            .unwrap();
        trace.open().unwrap();

        assert_eq!(1024, host.sessions()[0].properties.buffer_size_kb);

        /* Too late once the session exists */
        assert!(trace
            .set_trace_properties(&TraceProperties::default())
            .is_err());
    }

    #[test]
    fn enable_failure_is_a_configuration_error() {
        let host = Arc::new(CaptureHost::new());

        host.fail_next_enable(abi::ERROR_ACCESS_DENIED);

        empty_schema(&host, POWERSHELL, 1);
        host.queue_record(RecordBuilder::new(POWERSHELL, 1, 0, 0).pack());

        let count = Writable::new(0);
        let hits = count.clone();

        let mut provider = Provider::new(POWERSHELL);
        provider.on_event(move |_record| {
            *hits.borrow_mut() += 1;
            Ok(())
        });

        let mut trace = UserTrace::with_host("denied", host.clone());
        trace.enable(provider);

        assert!(matches!(trace.start(), Err(TraceError::NeedsElevation)));

        /* The pump never ran */
        assert_eq!(0, *count.borrow());
    }

    #[test]
    fn start_failure_is_translated() {
        let host = Arc::new(CaptureHost::new());

        host.fail_next_start(abi::ERROR_ALREADY_EXISTS);

        let mut trace = UserTrace::with_host("duplicate", host.clone());

        assert!(matches!(
            trace.start(),
            Err(TraceError::SessionAlreadyRegistered)));
    }

    #[test]
    fn kernel_group_masks_union_and_write_once() {
        let host = Arc::new(CaptureHost::new());

        let mut profile = GroupMask::new();
        profile.add(perfinfo::PERF_PROFILE);

        let mut cswitch = GroupMask::new();
        cswitch.add(perfinfo::PERF_CONTEXT_SWITCH);

        let mut trace = KernelTrace::with_host("masks", host.clone());
        trace.enable(KernelProvider::with_group_mask(IMAGE_LOAD, profile));
        trace.enable(KernelProvider::with_group_mask(UNKNOWN, cswitch));
        trace.open().unwrap();

        let masks = host.group_masks();

        assert_eq!(1, masks.len());
        assert_eq!(0x6, masks[0].masks()[1]);
    }

    #[test]
    fn kernel_name_forced_on_legacy_hosts() {
        let host = Arc::new(CaptureHost::new());
        host.set_system_logger_support(false);

        let trace = KernelTrace::with_host("custom_name", host.clone());

        assert_eq!(abi::KERNEL_LOGGER_NAME, trace.name());
    }

    #[test]
    fn providers_by_name_resolve_at_start() {
        let host = Arc::new(CaptureHost::new());

        host.add_provider_name("Microsoft-Windows-PowerShell", POWERSHELL);
        empty_schema(&host, POWERSHELL, 2);
        host.queue_record(RecordBuilder::new(POWERSHELL, 2, 0, 0).pack());

        let count = Writable::new(0);
        let hits = count.clone();

        let mut provider = Provider::by_name("Microsoft-Windows-PowerShell");
        provider.on_event(move |_record| {
            *hits.borrow_mut() += 1;
            Ok(())
        });

        let mut trace = UserTrace::with_host("named", host.clone());
        trace.enable(provider);
        trace.start().unwrap();

        assert_eq!(POWERSHELL, host.enable_requests()[0].guid);
        assert_eq!(1, *count.borrow());
    }

    #[test]
    fn unknown_provider_names_fail_start() {
        let host = Arc::new(CaptureHost::new());

        let mut trace = UserTrace::with_host("unresolved", host.clone());
        trace.enable(Provider::by_name("No-Such-Provider"));

        assert!(matches!(trace.start(), Err(TraceError::InvalidParameter)));
    }

    #[test]
    fn rundown_requests_capture_state() {
        let host = Arc::new(CaptureHost::new());

        let mut provider = Provider::new(POWERSHELL);
        provider.enable_rundown_events();

        let mut trace = UserTrace::with_host("rundown", host.clone());
        trace.enable(provider);
        trace.start().unwrap();

        assert!(host.enable_requests()[0].capture_state);
    }

    #[test]
    fn stats_surface_host_counters() {
        let host = Arc::new(CaptureHost::new());

        empty_schema(&host, POWERSHELL, 1);

        for _ in 0..2 {
            host.queue_record(RecordBuilder::new(POWERSHELL, 1, 0, 0).pack());
        }

        let mut provider = Provider::new(POWERSHELL);
        provider.on_event(|_record| Ok(()));

        let mut trace = UserTrace::with_host("stats", host.clone());
        trace.enable(provider);
        trace.start().unwrap();

        let stats = trace.query_stats().unwrap();

        assert_eq!(2, stats.events_handled);
        assert_eq!(2, stats.events_total);
        assert_eq!(1, trace.buffers_processed());
    }
}
