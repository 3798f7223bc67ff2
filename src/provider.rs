// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::error::TraceError;
use crate::filter::predicate::FilterContext;
use crate::filter::EventFilter;
use crate::host::HostRuntime;
use crate::perfinfo::GroupMask;
use crate::record::{
    ErrorCallback,
    EventCallback,
    EventRecord,
    MetadataCallback,
    RecordError,
    TypedRecord,
};
use crate::Guid;

/// A convenient default for `set_any`: request every keyword.
pub const ALL_BITS_SET: u64 = u64::MAX;

/// Describes one user provider and its configuration: identity, keyword
/// masks, level, trace flags, filters and callback chains.
///
/// Providers are configured before the owning trace starts; the trace
/// treats the provider set and each filter list as frozen once the
/// dispatch loop is running.
pub struct Provider {
    guid: Guid,
    name: Option<String>,
    level: u8,
    any: u64,
    all: u64,
    trace_flags: u32,
    rundown: bool,
    filters: Vec<EventFilter>,
    metadata_callbacks: Vec<MetadataCallback>,
    event_callbacks: Vec<EventCallback>,
    error_callbacks: Vec<ErrorCallback>,
}

impl Provider {
    /// Constructs a provider identified by GUID.
    pub fn new(
        guid: Guid) -> Self {
        Self {
            guid,
            name: None,
            level: crate::abi::TRACE_LEVEL_VERBOSE,
            any: 0,
            all: 0,
            trace_flags: 0,
            rundown: false,
            filters: Vec::new(),
            metadata_callbacks: Vec::new(),
            event_callbacks: Vec::new(),
            error_callbacks: Vec::new(),
        }
    }

    /// Constructs a provider identified by its symbolic name. The name
    /// is resolved through the host when the trace starts.
    pub fn by_name(
        name: &str) -> Self {
        let mut provider = Self::new(Guid::default());
        provider.name = Some(name.to_owned());
        provider
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_level(
        &mut self,
        level: u8) {
        self.level = level;
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn set_any(
        &mut self,
        any: u64) {
        self.any = any;
    }

    pub fn any(&self) -> u64 {
        self.any
    }

    pub fn set_all(
        &mut self,
        all: u64) {
        self.all = all;
    }

    pub fn all(&self) -> u64 {
        self.all
    }

    /// Sets the EnableProperty word passed through to the host. Known
    /// bits are the EVENT_ENABLE_PROPERTY constants; unknown bits pass
    /// through verbatim.
    pub fn set_trace_flags(
        &mut self,
        trace_flags: u32) {
        self.trace_flags = trace_flags;
    }

    pub fn trace_flags(&self) -> u32 {
        self.trace_flags
    }

    /// Requests that the provider log its rundown state when enabled.
    pub fn enable_rundown_events(&mut self) {
        self.rundown = true;
    }

    pub fn rundown_requested(&self) -> bool {
        self.rundown
    }

    pub fn add_filter(
        &mut self,
        filter: EventFilter) {
        self.filters.push(filter);
    }

    /// Adds a callback invoked with a header-only view for every record
    /// routed to this provider, before schema lookup.
    pub fn on_metadata(
        &mut self,
        callback: impl FnMut(&EventRecord) -> anyhow::Result<()> + 'static) {
        self.metadata_callbacks.push(Box::new(callback));
    }

    pub fn on_event(
        &mut self,
        callback: impl FnMut(&TypedRecord<'_>) -> anyhow::Result<()> + 'static) {
        self.event_callbacks.push(Box::new(callback));
    }

    pub fn on_error(
        &mut self,
        callback: impl FnMut(&RecordError<'_>) + 'static) {
        self.error_callbacks.push(Box::new(callback));
    }

    /// The union of the filters' event ids, registered natively by the
    /// owning trace.
    pub(crate) fn filter_event_ids<'a>(
        &'a self) -> impl Iterator<Item = u16> + 'a {
        self.filters.iter().flat_map(|f| f.event_ids().iter().copied())
    }

    /// Resolves a name-identified provider to its GUID.
    pub(crate) fn resolve(
        &mut self,
        host: &dyn HostRuntime) -> Result<(), TraceError> {
        if !self.guid.is_zero() {
            return Ok(());
        }

        match &self.name {
            Some(name) => {
                self.guid = host.resolve_provider_name(name)?;
                Ok(())
            },
            None => Err(TraceError::InvalidParameter),
        }
    }

    pub(crate) fn dispatch_metadata(
        &mut self,
        record: &EventRecord) {
        let mut failures = Vec::new();

        for callback in &mut self.metadata_callbacks {
            if let Err(e) = (callback)(record) {
                failures.push(e);
            }
        }

        for failure in &failures {
            let message = failure.to_string();
            let error = RecordError::new(&message, record);

            self.notify_own_error(&error);
        }
    }

    pub(crate) fn dispatch_event(
        &mut self,
        record: &TypedRecord,
        context: &FilterContext,
        errors: &mut Vec<anyhow::Error>) {
        /* Filters first, in insertion order */
        for filter in &mut self.filters {
            filter.dispatch(record, context, errors);
        }

        /* Then the provider's own chain */
        errors.clear();

        for callback in &mut self.event_callbacks {
            if let Err(e) = (callback)(record) {
                errors.push(e);
            }
        }

        for error in errors.iter() {
            let message = error.to_string();
            let error = RecordError::new(&message, record.record());

            self.notify_own_error(&error);
        }
    }

    /// Routes a schema or decode failure through the error chains:
    /// every filter's, then the provider's own.
    pub(crate) fn dispatch_error(
        &mut self,
        error: &RecordError) {
        for filter in &mut self.filters {
            filter.notify_error(error);
        }

        self.notify_own_error(error);
    }

    fn notify_own_error(
        &mut self,
        error: &RecordError) {
        if self.error_callbacks.is_empty() {
            tracing::warn!(
                provider = %self.guid,
                message = error.message(),
                "unhandled provider error");
            return;
        }

        for callback in &mut self.error_callbacks {
            (callback)(error);
        }
    }
}

/// A kernel provider: the shared provider dispatch plus the kernel
/// enablement selector, either legacy enable flags or a PERFINFO group
/// mask.
pub struct KernelProvider {
    provider: Provider,
    enable_flags: u32,
    group_mask: Option<GroupMask>,
}

impl KernelProvider {
    /// Constructs a flag-based kernel provider for hosts that accept
    /// EnableFlags directly.
    pub fn new(
        flags: u32,
        guid: Guid) -> Self {
        Self {
            provider: Provider::new(guid),
            enable_flags: flags,
            group_mask: None,
        }
    }

    /// Constructs a group-mask kernel provider. The mask is written
    /// once at session setup.
    pub fn with_group_mask(
        guid: Guid,
        mask: GroupMask) -> Self {
        Self {
            provider: Provider::new(guid),
            enable_flags: 0,
            group_mask: Some(mask),
        }
    }

    pub fn guid(&self) -> Guid {
        self.provider.guid()
    }

    pub fn enable_flags(&self) -> u32 {
        self.enable_flags
    }

    pub fn group_mask(&self) -> Option<&GroupMask> {
        self.group_mask.as_ref()
    }

    pub fn add_filter(
        &mut self,
        filter: EventFilter) {
        self.provider.add_filter(filter);
    }

    pub fn on_metadata(
        &mut self,
        callback: impl FnMut(&EventRecord) -> anyhow::Result<()> + 'static) {
        self.provider.on_metadata(callback);
    }

    pub fn on_event(
        &mut self,
        callback: impl FnMut(&TypedRecord<'_>) -> anyhow::Result<()> + 'static) {
        self.provider.on_event(callback);
    }

    pub fn on_error(
        &mut self,
        callback: impl FnMut(&RecordError<'_>) + 'static) {
        self.provider.on_error(callback);
    }

    pub(crate) fn into_parts(
        self) -> (Provider, u32, Option<GroupMask>) {
        (self.provider, self.enable_flags, self.group_mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUID: Guid = Guid::from_u128(0x2cb15d1d_5fc1_11d2_abe1_00a0c911f518);

    #[test]
    fn setters() {
        let mut provider = Provider::new(GUID);

        provider.set_level(0x4);
        provider.set_any(0x10);
        provider.set_all(0x20);
        provider.set_trace_flags(crate::abi::EVENT_ENABLE_PROPERTY_STACK_TRACE);
        provider.enable_rundown_events();

        assert_eq!(GUID, provider.guid());
        assert_eq!(0x4, provider.level());
        assert_eq!(0x10, provider.any());
        assert_eq!(0x20, provider.all());
        assert_eq!(0x4, provider.trace_flags());
        assert!(provider.rundown_requested());
    }

    #[test]
    fn filter_event_ids_union() {
        let mut provider = Provider::new(GUID);

        provider.add_filter(EventFilter::for_event_id(1));
        provider.add_filter(EventFilter::for_event_ids(&[2, 3]));

        let ids: Vec<u16> = provider.filter_event_ids().collect();

        assert_eq!(vec![1, 2, 3], ids);
    }

    #[test]
    fn kernel_provider_variants() {
        let flags = KernelProvider::new(0x4, GUID);

        assert_eq!(0x4, flags.enable_flags());
        assert!(flags.group_mask().is_none());

        let mut mask = GroupMask::new();
        mask.add(crate::perfinfo::PERF_PROFILE);

        let masked = KernelProvider::with_group_mask(GUID, mask);

        assert_eq!(0, masked.enable_flags());
        assert_eq!(Some(&mask), masked.group_mask());
    }
}
