// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod compare;
pub mod predicate;

use crate::record::{ErrorCallback, EventCallback, RecordError, TypedRecord};

use predicate::{BoxedPredicate, FilterContext};

/// Filters events before they reach callbacks. A filter carries an
/// optional predicate, an optional set of event ids, and its own event
/// and error callback lists.
///
/// Event ids do double duty: the union of all filters' ids on a provider
/// is registered natively with the host so unwanted events are dropped
/// in the kernel, and the ids are checked again in process so behavior
/// does not depend on host-side filter support.
pub struct EventFilter {
    predicate: Option<BoxedPredicate>,
    event_ids: Vec<u16>,
    event_callbacks: Vec<EventCallback>,
    error_callbacks: Vec<ErrorCallback>,
}

impl EventFilter {
    /// Constructs a filter that admits events matching the predicate.
    pub fn new(
        predicate: BoxedPredicate) -> Self {
        Self {
            predicate: Some(predicate),
            event_ids: Vec::new(),
            event_callbacks: Vec::new(),
            error_callbacks: Vec::new(),
        }
    }

    /// Constructs a filter for a single event id.
    pub fn for_event_id(
        event_id: u16) -> Self {
        Self::for_event_ids(&[event_id])
    }

    /// Constructs a filter for a set of event ids.
    pub fn for_event_ids(
        event_ids: &[u16]) -> Self {
        Self {
            predicate: None,
            event_ids: event_ids.to_vec(),
            event_callbacks: Vec::new(),
            error_callbacks: Vec::new(),
        }
    }

    /// Combines event ids with a predicate; both must admit a record
    /// for callbacks to fire.
    pub fn with_predicate(
        mut self,
        predicate: BoxedPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Adds a callback invoked for each admitted event.
    pub fn on_event(
        &mut self,
        callback: impl FnMut(&TypedRecord<'_>) -> anyhow::Result<()> + 'static) {
        self.event_callbacks.push(Box::new(callback));
    }

    /// Adds a callback invoked when handling an event fails.
    pub fn on_error(
        &mut self,
        callback: impl FnMut(&RecordError<'_>) + 'static) {
        self.error_callbacks.push(Box::new(callback));
    }

    /// The event ids this filter contributes to native registration.
    pub fn event_ids(&self) -> &[u16] {
        &self.event_ids
    }

    fn admits(
        &self,
        record: &TypedRecord,
        context: &FilterContext) -> bool {
        if !self.event_ids.is_empty() &&
           !self.event_ids.contains(&record.id()) {
            return false;
        }

        match &self.predicate {
            Some(predicate) => predicate.matches(record.record(), context),
            None => true,
        }
    }

    pub(crate) fn dispatch(
        &mut self,
        record: &TypedRecord,
        context: &FilterContext,
        errors: &mut Vec<anyhow::Error>) {
        if !self.admits(record, context) {
            return;
        }

        errors.clear();

        for callback in &mut self.event_callbacks {
            if let Err(e) = (callback)(record) {
                errors.push(e);
            }
        }

        for error in errors.iter() {
            let message = error.to_string();
            let error = RecordError::new(&message, record.record());

            self.notify_error(&error);
        }
    }

    pub(crate) fn notify_error(
        &mut self,
        error: &RecordError) {
        if self.error_callbacks.is_empty() {
            tracing::warn!(
                message = error.message(),
                "unhandled event filter error");
            return;
        }

        for callback in &mut self.error_callbacks {
            (callback)(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::NoopReader;
    use crate::schema::SchemaLocator;
    use crate::sharing::Writable;
    use crate::testing::{CaptureHost, RecordBuilder, SchemaTable};
    use crate::Guid;

    use predicate::id_is;

    const PROVIDER: Guid = Guid::from_u128(0x41ee9f36_5a4e_4138_bc0e_2141a84eb089);

    fn schema_for(host: &CaptureHost, id: u16) -> std::rc::Rc<crate::Schema> {
        host.add_schema(PROVIDER, id, SchemaTable::new().to_blob());

        let record = RecordBuilder::new(PROVIDER, id, 0, 0).pack();
        let locator = SchemaLocator::new();

        locator.get_schema(record.as_record(), host).unwrap()
    }

    #[test]
    fn event_ids_and_predicate_both_gate() {
        let host = CaptureHost::new();
        let schema = schema_for(&host, 10);
        let locator = SchemaLocator::new();
        let reader = NoopReader;
        let context = FilterContext::new(&locator, &host, &reader);

        let count = Writable::new(0);
        let hits = count.clone();

        let mut filter = EventFilter::for_event_id(10)
            .with_predicate(id_is(10));

        filter.on_event(move |_record| {
            *hits.borrow_mut() += 1;
            Ok(())
        });

        let mut errors = Vec::new();

        let matching = RecordBuilder::new(PROVIDER, 10, 0, 0).pack();
        let typed = TypedRecord::new(
            matching.as_record(),
            &schema,
            &reader);
        filter.dispatch(&typed, &context, &mut errors);

        let other = RecordBuilder::new(PROVIDER, 11, 0, 0).pack();
        let typed = TypedRecord::new(
            other.as_record(),
            &schema,
            &reader);
        filter.dispatch(&typed, &context, &mut errors);

        assert_eq!(1, *count.borrow());
    }

    #[test]
    fn callbacks_fire_in_registration_order() {
        let host = CaptureHost::new();
        let schema = schema_for(&host, 1);
        let locator = SchemaLocator::new();
        let reader = NoopReader;
        let context = FilterContext::new(&locator, &host, &reader);

        let order = Writable::new(Vec::new());

        let mut filter = EventFilter::for_event_id(1);

        for tag in ["first", "second", "third"] {
            let order = order.clone();

            filter.on_event(move |_record| {
                order.borrow_mut().push(tag);
                Ok(())
            });
        }

        let record = RecordBuilder::new(PROVIDER, 1, 0, 0).pack();
        let typed = TypedRecord::new(record.as_record(), &schema, &reader);
        let mut errors = Vec::new();

        filter.dispatch(&typed, &context, &mut errors);

        assert_eq!(vec!["first", "second", "third"], *order.borrow());
    }

    #[test]
    fn callback_failures_reach_error_callbacks() {
        let host = CaptureHost::new();
        let schema = schema_for(&host, 1);
        let locator = SchemaLocator::new();
        let reader = NoopReader;
        let context = FilterContext::new(&locator, &host, &reader);

        let messages = Writable::new(Vec::new());
        let seen = messages.clone();

        let mut filter = EventFilter::for_event_id(1);

        filter.on_event(|_record| {
            anyhow::bail!("boom");
        });
        filter.on_error(move |error| {
            seen.borrow_mut().push(error.message().to_string());
        });

        let record = RecordBuilder::new(PROVIDER, 1, 0, 0).pack();
        let typed = TypedRecord::new(record.as_record(), &schema, &reader);
        let mut errors = Vec::new();

        filter.dispatch(&typed, &context, &mut errors);

        assert_eq!(vec!["boom".to_string()], *messages.borrow());
    }
}
