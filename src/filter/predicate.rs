// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::filter::compare;
use crate::filter::compare::{CaseInsensitive, CaseSensitive, UnitCompare};
use crate::host::HostRuntime;
use crate::record::{EventRecord, InType, PropertyReader, PropertyView};
use crate::schema::SchemaLocator;

/// Everything a predicate may consult besides the record itself: the
/// trace's schema locator, its host runtime, and its property reader.
/// Built by the dispatcher per trace; predicates only borrow it.
pub struct FilterContext<'a> {
    locator: &'a SchemaLocator,
    host: &'a dyn HostRuntime,
    reader: &'a dyn PropertyReader,
}

impl<'a> FilterContext<'a> {
    pub fn new(
        locator: &'a SchemaLocator,
        host: &'a dyn HostRuntime,
        reader: &'a dyn PropertyReader) -> Self {
        Self {
            locator,
            host,
            reader,
        }
    }

    /// Locates a named property of the record, resolving the schema
    /// through the locator cache first.
    pub fn property_view<'r>(
        &self,
        record: &'r EventRecord,
        name: &str) -> Option<PropertyView<'r>> {
        let schema = self.locator.get_schema(record, self.host).ok()?;

        self.reader.find_property(record, &schema, name)
    }
}

/// An event predicate. Predicates form a value tree: combinators own
/// their children, so a tree built once stays valid for the lifetime of
/// the trace it is handed to.
pub trait Predicate {
    fn matches(
        &self,
        record: &EventRecord,
        context: &FilterContext) -> bool;
}

pub type BoxedPredicate = Box<dyn Predicate>;

// Leaves
// ------------------------------------------------------------------------

struct AnyEvent;

impl Predicate for AnyEvent {
    fn matches(
        &self,
        _record: &EventRecord,
        _context: &FilterContext) -> bool {
        true
    }
}

/// Accepts every event.
pub fn any_event() -> BoxedPredicate {
    Box::new(AnyEvent)
}

struct IdIs(u16);

impl Predicate for IdIs {
    fn matches(
        &self,
        record: &EventRecord,
        _context: &FilterContext) -> bool {
        record.id() == self.0
    }
}

/// Accepts events with the given event id.
pub fn id_is(
    id: u16) -> BoxedPredicate {
    Box::new(IdIs(id))
}

struct OpcodeIs(u8);

impl Predicate for OpcodeIs {
    fn matches(
        &self,
        record: &EventRecord,
        _context: &FilterContext) -> bool {
        record.opcode() == self.0
    }
}

/// Accepts events with the given opcode.
pub fn opcode_is(
    opcode: u8) -> BoxedPredicate {
    Box::new(OpcodeIs(opcode))
}

struct VersionIs(u8);

impl Predicate for VersionIs {
    fn matches(
        &self,
        record: &EventRecord,
        _context: &FilterContext) -> bool {
        record.version() == self.0
    }
}

/// Accepts events with the given descriptor version.
pub fn version_is(
    version: u8) -> BoxedPredicate {
    Box::new(VersionIs(version))
}

struct ProcessIdIs(u32);

impl Predicate for ProcessIdIs {
    fn matches(
        &self,
        record: &EventRecord,
        _context: &FilterContext) -> bool {
        record.process_id() == self.0
    }
}

/// Accepts events emitted by the given process.
pub fn process_id_is(
    process_id: u32) -> BoxedPredicate {
    Box::new(ProcessIdIs(process_id))
}

// Combinators
// ------------------------------------------------------------------------

struct Not(BoxedPredicate);

impl Predicate for Not {
    fn matches(
        &self,
        record: &EventRecord,
        context: &FilterContext) -> bool {
        !self.0.matches(record, context)
    }
}

pub fn not(
    inner: BoxedPredicate) -> BoxedPredicate {
    Box::new(Not(inner))
}

struct AndAllOf(Vec<BoxedPredicate>);

impl Predicate for AndAllOf {
    fn matches(
        &self,
        record: &EventRecord,
        context: &FilterContext) -> bool {
        /* Short-circuits left to right in list order */
        self.0.iter().all(|p| p.matches(record, context))
    }
}

pub fn and(
    a: BoxedPredicate,
    b: BoxedPredicate) -> BoxedPredicate {
    and_all_of(vec![a, b])
}

pub fn and_all_of(
    children: Vec<BoxedPredicate>) -> BoxedPredicate {
    Box::new(AndAllOf(children))
}

struct OrAnyOf(Vec<BoxedPredicate>);

impl Predicate for OrAnyOf {
    fn matches(
        &self,
        record: &EventRecord,
        context: &FilterContext) -> bool {
        /* Short-circuits left to right in list order */
        self.0.iter().any(|p| p.matches(record, context))
    }
}

pub fn or(
    a: BoxedPredicate,
    b: BoxedPredicate) -> BoxedPredicate {
    or_any_of(vec![a, b])
}

pub fn or_any_of(
    children: Vec<BoxedPredicate>) -> BoxedPredicate {
    Box::new(OrAnyOf(children))
}

// Property predicates
// ------------------------------------------------------------------------

/// A typed expected value for `property_is`.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I32(i32),
    I64(i64),
}

struct PropertyIs {
    name: String,
    expected: PropertyValue,
}

impl Predicate for PropertyIs {
    fn matches(
        &self,
        record: &EventRecord,
        context: &FilterContext) -> bool {
        let view = match context.property_view(record, &self.name) {
            Some(view) => view,
            None => { return false; },
        };

        match self.expected {
            PropertyValue::U8(v) => view.try_get_u8() == Some(v),
            PropertyValue::U16(v) => view.try_get_u16() == Some(v),
            PropertyValue::U32(v) => view.try_get_u32() == Some(v),
            PropertyValue::U64(v) => view.try_get_u64() == Some(v),
            PropertyValue::I32(v) => view.try_get_i32() == Some(v),
            PropertyValue::I64(v) => view.try_get_i64() == Some(v),
        }
    }
}

/// Accepts events whose named property decodes to the expected value.
pub fn property_is(
    name: &str,
    expected: PropertyValue) -> BoxedPredicate {
    Box::new(PropertyIs {
        name: name.into(),
        expected,
    })
}

#[derive(Clone, Copy)]
enum StringOp {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
}

struct PropertyString {
    name: String,
    needle: String,
    op: StringOp,
    insensitive: bool,
}

fn run_op<T, A, B, C>(
    haystack: A,
    needle: B,
    comparer: &C,
    op: StringOp) -> bool
where
    A: Iterator<Item = T> + Clone,
    B: Iterator<Item = T> + Clone,
    C: UnitCompare<T> {
    match op {
        StringOp::Equals => compare::equals(haystack, needle, comparer),
        StringOp::Contains => compare::contains(haystack, needle, comparer),
        StringOp::StartsWith => compare::starts_with(haystack, needle, comparer),
        StringOp::EndsWith => compare::ends_with(haystack, needle, comparer),
    }
}

fn run_wide_op<A>(
    haystack: A,
    needle: &str,
    op: StringOp,
    insensitive: bool) -> bool
where
    A: Iterator<Item = u16> + Clone {
    if insensitive {
        run_op(haystack, compare::wide(needle), &CaseInsensitive, op)
    } else {
        run_op(haystack, compare::wide(needle), &CaseSensitive, op)
    }
}

fn run_ansi_op<A>(
    haystack: A,
    needle: &str,
    op: StringOp,
    insensitive: bool) -> bool
where
    A: Iterator<Item = u8> + Clone {
    let needle = needle.as_bytes().iter().copied();

    if insensitive {
        run_op(haystack, needle, &CaseInsensitive, op)
    } else {
        run_op(haystack, needle, &CaseSensitive, op)
    }
}

impl Predicate for PropertyString {
    fn matches(
        &self,
        record: &EventRecord,
        context: &FilterContext) -> bool {
        let view = match context.property_view(record, &self.name) {
            Some(view) => view,
            None => { return false; },
        };

        match view.in_type {
            InType::UnicodeString => run_wide_op(
                compare::null_terminated_wide(view.data),
                &self.needle,
                self.op,
                self.insensitive),

            InType::CountedString => run_wide_op(
                compare::counted_wide(view.data),
                &self.needle,
                self.op,
                self.insensitive),

            InType::AnsiString => run_ansi_op(
                compare::null_terminated_ansi(view.data),
                &self.needle,
                self.op,
                self.insensitive),

            InType::CountedAnsiString => run_ansi_op(
                compare::counted_ansi(view.data),
                &self.needle,
                self.op,
                self.insensitive),

            _ => false,
        }
    }
}

fn property_string(
    name: &str,
    needle: &str,
    op: StringOp,
    insensitive: bool) -> BoxedPredicate {
    Box::new(PropertyString {
        name: name.into(),
        needle: needle.into(),
        op,
        insensitive,
    })
}

pub fn property_equals(
    name: &str,
    needle: &str) -> BoxedPredicate {
    property_string(name, needle, StringOp::Equals, false)
}

pub fn property_iequals(
    name: &str,
    needle: &str) -> BoxedPredicate {
    property_string(name, needle, StringOp::Equals, true)
}

pub fn property_contains(
    name: &str,
    needle: &str) -> BoxedPredicate {
    property_string(name, needle, StringOp::Contains, false)
}

pub fn property_icontains(
    name: &str,
    needle: &str) -> BoxedPredicate {
    property_string(name, needle, StringOp::Contains, true)
}

pub fn property_starts_with(
    name: &str,
    needle: &str) -> BoxedPredicate {
    property_string(name, needle, StringOp::StartsWith, false)
}

pub fn property_istarts_with(
    name: &str,
    needle: &str) -> BoxedPredicate {
    property_string(name, needle, StringOp::StartsWith, true)
}

pub fn property_ends_with(
    name: &str,
    needle: &str) -> BoxedPredicate {
    property_string(name, needle, StringOp::EndsWith, false)
}

pub fn property_iends_with(
    name: &str,
    needle: &str) -> BoxedPredicate {
    property_string(name, needle, StringOp::EndsWith, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{InType, NoopReader};
    use crate::sharing::Writable;
    use crate::testing::{CaptureHost, RecordBuilder, SchemaTable};
    use crate::Guid;

    const PROVIDER: Guid = Guid::from_u128(0x88154140_f63a_4028_8826_b0028614d67b);

    struct Counting {
        hits: Writable<u32>,
        result: bool,
    }

    impl Predicate for Counting {
        fn matches(
            &self,
            _record: &EventRecord,
            _context: &FilterContext) -> bool {
            *self.hits.borrow_mut() += 1;
            self.result
        }
    }

    fn counting(
        hits: &Writable<u32>,
        result: bool) -> BoxedPredicate {
        Box::new(Counting {
            hits: hits.clone(),
            result,
        })
    }

    fn with_context(check: impl FnOnce(&FilterContext)) {
        let locator = SchemaLocator::new();
        let host = CaptureHost::new();
        let reader = NoopReader;
        let context = FilterContext::new(&locator, &host, &reader);

        check(&context);
    }

    #[test]
    fn header_leaves() {
        let record = RecordBuilder::new(PROVIDER, 7937, 1, 20)
            .with_process_id(4242)
            .pack();
        let record = record.as_record();

        with_context(|context| {
            assert!(any_event().matches(record, context));
            assert!(id_is(7937).matches(record, context));
            assert!(!id_is(42).matches(record, context));
            assert!(opcode_is(20).matches(record, context));
            assert!(!opcode_is(10).matches(record, context));
            assert!(version_is(1).matches(record, context));
            assert!(process_id_is(4242).matches(record, context));
            assert!(!process_id_is(1).matches(record, context));
        });
    }

    #[test]
    fn boolean_composition() {
        let record = RecordBuilder::new(PROVIDER, 1, 0, 0).pack();
        let record = record.as_record();

        with_context(|context| {
            assert!(!not(any_event()).matches(record, context));
            assert!(and(id_is(1), version_is(0)).matches(record, context));
            assert!(!and(id_is(1), version_is(9)).matches(record, context));
            assert!(or(id_is(9), id_is(1)).matches(record, context));
            assert!(!or(id_is(9), id_is(8)).matches(record, context));
        });
    }

    #[test]
    fn and_all_of_short_circuits_in_order() {
        let record = RecordBuilder::new(PROVIDER, 1, 0, 0).pack();
        let record = record.as_record();

        let first = Writable::new(0);
        let second = Writable::new(0);

        let tree = and_all_of(vec![
            counting(&first, false),
            counting(&second, true),
        ]);

        with_context(|context| {
            assert!(!tree.matches(record, context));
        });

        assert_eq!(1, *first.borrow());
        assert_eq!(0, *second.borrow());
    }

    #[test]
    fn or_any_of_short_circuits_in_order() {
        let record = RecordBuilder::new(PROVIDER, 1, 0, 0).pack();
        let record = record.as_record();

        let first = Writable::new(0);
        let second = Writable::new(0);

        let tree = or_any_of(vec![
            counting(&first, true),
            counting(&second, true),
        ]);

        with_context(|context| {
            assert!(tree.matches(record, context));
        });

        assert_eq!(1, *first.borrow());
        assert_eq!(0, *second.borrow());
    }

    #[test]
    fn property_predicates() {
        let host = CaptureHost::new();

        host.add_schema(
            PROVIDER,
            1,
            SchemaTable::new()
                .field("ImageName", InType::UnicodeString)
                .field("ProcessId", InType::UInt32)
                .to_blob());

        let mut builder = RecordBuilder::new(PROVIDER, 1, 0, 0);
        builder.add_unicode_string("C:\\Windows\\notepad.exe");
        builder.add_u32(77);
        let record = builder.pack();
        let record = record.as_record();

        let locator = SchemaLocator::new();
        let reader = crate::testing::TableReader;
        let context = FilterContext::new(&locator, &host, &reader);

        assert!(property_is("ProcessId", PropertyValue::U32(77))
            .matches(record, &context));
        assert!(!property_is("ProcessId", PropertyValue::U32(78))
            .matches(record, &context));

        assert!(property_equals("ImageName", "C:\\Windows\\notepad.exe")
            .matches(record, &context));
        assert!(!property_equals("ImageName", "c:\\windows\\NOTEPAD.EXE")
            .matches(record, &context));
        assert!(property_iequals("ImageName", "c:\\windows\\NOTEPAD.EXE")
            .matches(record, &context));

        assert!(property_icontains("ImageName", "notepad")
            .matches(record, &context));
        assert!(property_starts_with("ImageName", "C:\\")
            .matches(record, &context));
        assert!(property_iends_with("ImageName", ".EXE")
            .matches(record, &context));
        assert!(!property_ends_with("ImageName", ".dll")
            .matches(record, &context));

        /* Unknown properties never match */
        assert!(!property_equals("Missing", "x").matches(record, &context));
    }
}
