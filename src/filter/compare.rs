// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

/*
 * Iterator based text comparison for filter predicates. Comparisons are
 * generic over the code unit (u8 for ANSI, u16 for UTF-16) and over a
 * unit comparer selecting case sensitivity. Case-insensitive comparison
 * upper-cases single code points only, full locale folding is not
 * attempted.
 */

/// Compares two code units for equality.
pub trait UnitCompare<T> {
    fn same(
        &self,
        a: T,
        b: T) -> bool;
}

#[derive(Default, Clone, Copy)]
pub struct CaseSensitive;

impl UnitCompare<u8> for CaseSensitive {
    fn same(
        &self,
        a: u8,
        b: u8) -> bool {
        a == b
    }
}

impl UnitCompare<u16> for CaseSensitive {
    fn same(
        &self,
        a: u16,
        b: u16) -> bool {
        a == b
    }
}

#[derive(Default, Clone, Copy)]
pub struct CaseInsensitive;

fn upper_wide(
    unit: u16) -> u16 {
    match char::from_u32(unit as u32) {
        Some(c) => {
            let mut upper = c.to_uppercase();
            let first = upper.next().unwrap_or(c);

            /* Multi-codepoint expansions keep the original unit */
            if upper.next().is_none() && (first as u32) <= 0xFFFF {
                first as u16
            } else {
                unit
            }
        },
        None => unit,
    }
}

impl UnitCompare<u8> for CaseInsensitive {
    fn same(
        &self,
        a: u8,
        b: u8) -> bool {
        a.to_ascii_uppercase() == b.to_ascii_uppercase()
    }
}

impl UnitCompare<u16> for CaseInsensitive {
    fn same(
        &self,
        a: u16,
        b: u16) -> bool {
        upper_wide(a) == upper_wide(b)
    }
}

pub fn equals<T, A, B, C>(
    mut a: A,
    mut b: B,
    comparer: &C) -> bool
where
    A: Iterator<Item = T>,
    B: Iterator<Item = T>,
    C: UnitCompare<T> {
    loop {
        match (a.next(), b.next()) {
            (None, None) => { return true; },
            (Some(x), Some(y)) => {
                if !comparer.same(x, y) {
                    return false;
                }
            },
            _ => { return false; },
        }
    }
}

fn prefix_matches<T, A, B, C>(
    mut haystack: A,
    mut needle: B,
    comparer: &C) -> bool
where
    A: Iterator<Item = T>,
    B: Iterator<Item = T>,
    C: UnitCompare<T> {
    loop {
        match needle.next() {
            None => { return true; },
            Some(n) => {
                match haystack.next() {
                    Some(h) => {
                        if !comparer.same(h, n) {
                            return false;
                        }
                    },
                    _ => { return false; },
                }
            },
        }
    }
}

/// Searches for `needle` anywhere in `haystack`. An empty needle is
/// found in any input, including an empty one.
pub fn contains<T, A, B, C>(
    haystack: A,
    needle: B,
    comparer: &C) -> bool
where
    A: Iterator<Item = T> + Clone,
    B: Iterator<Item = T> + Clone,
    C: UnitCompare<T> {
    if needle.clone().next().is_none() {
        return true;
    }

    let mut start = haystack;

    loop {
        if prefix_matches(start.clone(), needle.clone(), comparer) {
            return true;
        }

        if start.next().is_none() {
            return false;
        }
    }
}

/// Tests whether `haystack` begins with `needle`. A needle longer than
/// the haystack never matches; the haystack is not read past its end.
pub fn starts_with<T, A, B, C>(
    haystack: A,
    needle: B,
    comparer: &C) -> bool
where
    A: Iterator<Item = T> + Clone,
    B: Iterator<Item = T> + Clone,
    C: UnitCompare<T> {
    let haystack_len = haystack.clone().count();
    let needle_len = needle.clone().count();

    /* Always starts with an empty needle */
    if needle_len == 0 {
        return true;
    }

    if needle_len > haystack_len {
        return false;
    }

    equals(haystack.take(needle_len), needle, comparer)
}

/// Tests whether `haystack` ends with `needle`.
pub fn ends_with<T, A, B, C>(
    haystack: A,
    needle: B,
    comparer: &C) -> bool
where
    A: Iterator<Item = T> + Clone,
    B: Iterator<Item = T> + Clone,
    C: UnitCompare<T> {
    let haystack_len = haystack.clone().count();
    let needle_len = needle.clone().count();

    /* Always ends with an empty needle */
    if needle_len == 0 {
        return true;
    }

    if needle_len > haystack_len {
        return false;
    }

    equals(haystack.skip(haystack_len - needle_len), needle, comparer)
}

// View adapters
// ------------------------------------------------------------------------

/// Wide view of a counted string property: a u16 code-unit count prefix
/// followed by that many UTF-16 units.
pub fn counted_wide(
    data: &[u8]) -> impl Iterator<Item = u16> + Clone + '_ {
    let count = if data.len() >= 2 {
        u16::from_le_bytes([data[0], data[1]]) as usize
    } else {
        0
    };

    let body = if data.len() >= 2 { &data[2..] } else { &[] as &[u8] };

    body.chunks_exact(2)
        .take(count)
        .map(to_u16)
}

/// Byte view of a counted ANSI string property.
pub fn counted_ansi(
    data: &[u8]) -> impl Iterator<Item = u8> + Clone + '_ {
    let count = if data.len() >= 2 {
        u16::from_le_bytes([data[0], data[1]]) as usize
    } else {
        0
    };

    let body = if data.len() >= 2 { &data[2..] } else { &[] as &[u8] };

    body.iter().copied().take(count)
}

/// Wide view of a null-terminated string property. The length is the
/// declared byte length over the element size, minus the terminator.
pub fn null_terminated_wide(
    data: &[u8]) -> impl Iterator<Item = u16> + Clone + '_ {
    let units = (data.len() / 2).saturating_sub(1);

    data.chunks_exact(2)
        .take(units)
        .map(to_u16)
}

/// Byte view of a null-terminated ANSI string property.
pub fn null_terminated_ansi(
    data: &[u8]) -> impl Iterator<Item = u8> + Clone + '_ {
    let units = data.len().saturating_sub(1);

    data.iter().copied().take(units)
}

/// UTF-16 view of a needle supplied as &str.
pub fn wide(
    text: &str) -> impl Iterator<Item = u16> + Clone + '_ {
    text.encode_utf16()
}

fn to_u16(
    chunk: &[u8]) -> u16 {
    u16::from_le_bytes([chunk[0], chunk[1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(text: &str) -> impl Iterator<Item = u8> + Clone + '_ {
        text.as_bytes().iter().copied()
    }

    #[test]
    fn equals_cases() {
        assert!(equals(bytes("abc"), bytes("abc"), &CaseSensitive));
        assert!(!equals(bytes("abc"), bytes("ABC"), &CaseSensitive));
        assert!(equals(bytes("abc"), bytes("ABC"), &CaseInsensitive));
        assert!(!equals(bytes("abc"), bytes("ab"), &CaseSensitive));
        assert!(equals(bytes(""), bytes(""), &CaseSensitive));
    }

    #[test]
    fn contains_empty_needle_always_matches() {
        assert!(contains(bytes("anything"), bytes(""), &CaseSensitive));
        assert!(contains(bytes(""), bytes(""), &CaseSensitive));
    }

    #[test]
    fn contains_finds_interior_matches() {
        assert!(contains(bytes("powershell"), bytes("shell"), &CaseSensitive));
        assert!(contains(bytes("powershell"), bytes("SHELL"), &CaseInsensitive));
        assert!(!contains(bytes("powershell"), bytes("shells"), &CaseSensitive));
        assert!(!contains(bytes(""), bytes("x"), &CaseSensitive));
    }

    #[test]
    fn starts_with_length_mismatch() {
        assert!(starts_with(bytes("abc"), bytes("ab"), &CaseSensitive));
        assert!(!starts_with(bytes("ab"), bytes("abc"), &CaseSensitive));
        assert!(starts_with(bytes("abc"), bytes(""), &CaseSensitive));
        assert!(!starts_with(bytes(""), bytes("a"), &CaseSensitive));
    }

    #[test]
    fn ends_with_length_mismatch() {
        assert!(ends_with(bytes("abc"), bytes("bc"), &CaseSensitive));
        assert!(!ends_with(bytes("bc"), bytes("abc"), &CaseSensitive));
        assert!(ends_with(bytes("abc"), bytes(""), &CaseSensitive));
        assert!(ends_with(bytes("abc"), bytes("BC"), &CaseInsensitive));
    }

    #[test]
    fn counted_wide_honors_prefix() {
        /* Count of 2, three units present */
        let mut data = vec![2u8, 0u8];
        for unit in [b'h' as u16, b'i' as u16, b'!' as u16] {
            data.extend_from_slice(&unit.to_le_bytes());
        }

        let units: Vec<u16> = counted_wide(&data).collect();

        assert_eq!(vec![b'h' as u16, b'i' as u16], units);
    }

    #[test]
    fn counted_wide_short_input() {
        assert_eq!(0, counted_wide(&[5u8]).count());
        assert_eq!(0, counted_wide(&[]).count());
    }

    #[test]
    fn null_terminated_wide_excludes_terminator() {
        let mut data = Vec::new();
        for unit in [b'o' as u16, b'k' as u16, 0u16] {
            data.extend_from_slice(&unit.to_le_bytes());
        }

        let units: Vec<u16> = null_terminated_wide(&data).collect();

        assert_eq!(vec![b'o' as u16, b'k' as u16], units);
    }

    #[test]
    fn null_terminated_ansi_excludes_terminator() {
        let data = [b'o', b'k', 0u8];

        let bytes: Vec<u8> = null_terminated_ansi(&data).collect();

        assert_eq!(vec![b'o', b'k'], bytes);
    }

    #[test]
    fn wide_comparisons() {
        let mut data = Vec::new();
        for unit in "Chrome.exe".encode_utf16() {
            data.extend_from_slice(&unit.to_le_bytes());
        }
        data.extend_from_slice(&0u16.to_le_bytes());

        assert!(equals(
            null_terminated_wide(&data),
            wide("chrome.EXE"),
            &CaseInsensitive));
        assert!(starts_with(
            null_terminated_wide(&data),
            wide("Chrome"),
            &CaseSensitive));
        assert!(ends_with(
            null_terminated_wide(&data),
            wide(".exe"),
            &CaseSensitive));
    }
}
