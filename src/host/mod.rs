// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::error::TraceError;
use crate::perfinfo::GroupMask;
use crate::record::EventRecord;
use crate::trace::TraceProperties;
use crate::Guid;

#[cfg(target_os = "windows")]
pub mod windows;

pub type SessionHandle = u64;
pub type ConsumerHandle = u64;

/// Session statistics surfaced by the host. The host maintains these
/// live; stopping a session does not reset them.
#[derive(Default, Clone, Copy, Debug)]
pub struct TraceStats {
    pub buffers_read: u32,
    pub buffers_lost: u32,
    pub events_total: u64,
    pub events_handled: u64,
    pub events_lost: u32,
}

/// One native provider enablement. A trace issues exactly one of these
/// per provider GUID, with the union of every in-process provider's
/// parameters for that GUID.
#[derive(Clone, Debug)]
pub struct EnableRequest {
    pub guid: Guid,
    pub level: u8,
    pub any: u64,
    pub all: u64,
    pub trace_flags: u32,
    pub event_ids: Vec<u16>,
    pub capture_state: bool,
}

/// The host runtime the library sits on. On Windows this is the ETW API
/// surface; tests substitute a scripted implementation.
///
/// `process_events` blocks the calling thread and delivers raw records
/// to the callback until the session is stopped; it is the only blocking
/// call in the library.
pub trait HostRuntime: Send + Sync {
    fn start_session(
        &self,
        name: &str,
        properties: &TraceProperties,
        kernel_flags: u32) -> Result<SessionHandle, TraceError>;

    /// Stops a session by handle. Returns the raw status; stopping an
    /// already stopped session is not an error worth surfacing.
    fn stop_session(
        &self,
        handle: SessionHandle,
        name: &str) -> u32;

    fn enable_provider(
        &self,
        handle: SessionHandle,
        request: &EnableRequest) -> u32;

    fn set_trace_information(
        &self,
        handle: SessionHandle,
        mask: &GroupMask) -> u32;

    fn open_session(
        &self,
        name: &str) -> Result<ConsumerHandle, TraceError>;

    fn process_events(
        &self,
        handle: ConsumerHandle,
        callback: &mut dyn FnMut(&EventRecord)) -> u32;

    fn close_session(
        &self,
        handle: ConsumerHandle) -> u32;

    /// Two-phase metadata query. Called with an empty buffer to learn
    /// the required size, then again with a buffer of that size.
    fn get_event_metadata(
        &self,
        record: &EventRecord,
        buffer: &mut [u8],
        size: &mut u32) -> u32;

    fn query_stats(
        &self,
        handle: SessionHandle,
        name: &str) -> Result<TraceStats, TraceError>;

    /// Resolves a provider's symbolic name to its GUID.
    fn resolve_provider_name(
        &self,
        name: &str) -> Result<Guid, TraceError>;

    /// Whether the host supports system loggers outside the single
    /// kernel session. Older hosts force the kernel session name.
    fn supports_system_logger(&self) -> bool {
        true
    }
}
