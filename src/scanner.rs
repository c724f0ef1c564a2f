//! Byte-pattern scanning.
//!
//! Signatures are written as "combo strings": space-separated tokens that are
//! either two hex digits (a literal byte) or `?`/`??` (any byte). A compiled
//! [`Pattern`] keeps the literal bytes and a parallel wildcard mask, so every
//! byte value stays usable as a literal.
//!
//! Searching uses Boyer-Moore-Horspool. The bad-character table is built only
//! from the pattern bytes after the last wildcard, which keeps every shift safe
//! no matter what the wildcard positions match.

use std::str::FromStr;

use tracing::trace;

use crate::error::{Error, Result};
use crate::image::PeImage;

/// A compiled byte pattern with wildcard support.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    bytes: Vec<u8>,
    /// `true` where the byte must match literally.
    mask: Vec<bool>,
}

impl Pattern {
    /// Compile a combo string such as `"48 8B 05 ? ? ? ? C3"`.
    pub fn parse(combo: &str) -> Result<Self> {
        let mut bytes = Vec::with_capacity((combo.len() + 1) / 3);
        let mut mask = Vec::with_capacity(bytes.capacity());

        for (position, token) in combo.split_whitespace().enumerate() {
            match token {
                "?" | "??" => {
                    bytes.push(0);
                    mask.push(false);
                }
                _ if token.len() == 2 && token.bytes().all(|b| b.is_ascii_hexdigit()) => {
                    // Two validated hex digits cannot fail to parse
                    let value = u8::from_str_radix(token, 16).map_err(|_| {
                        Error::InvalidPatternToken {
                            token: token.to_string(),
                            position,
                        }
                    })?;
                    bytes.push(value);
                    mask.push(true);
                }
                _ => {
                    return Err(Error::InvalidPatternToken {
                        token: token.to_string(),
                        position,
                    })
                }
            }
        }

        if bytes.is_empty() {
            return Err(Error::EmptyPattern);
        }

        Ok(Self { bytes, mask })
    }

    /// Build a pattern from literal bytes (no wildcards).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::EmptyPattern);
        }
        Ok(Self {
            bytes: bytes.to_vec(),
            mask: vec![true; bytes.len()],
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Literal byte values; wildcard positions hold zero.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether position `index` is a wildcard.
    pub fn is_wildcard(&self, index: usize) -> bool {
        !self.mask[index]
    }

    /// Whether the pattern matches `window` (which must be `len()` bytes).
    #[inline]
    fn matches(&self, window: &[u8]) -> bool {
        (0..self.bytes.len())
            .rev()
            .all(|i| !self.mask[i] || self.bytes[i] == window[i])
    }

    /// Build the 256-entry shift table.
    ///
    /// The default shift is the distance from the last byte to the last
    /// wildcard before it (or the full length when there is none); literal
    /// bytes after that wildcard shorten the shift for their value.
    fn shift_table(&self) -> [usize; 256] {
        let last = self.bytes.len() - 1;
        let last_wildcard = (0..last).rev().find(|&i| !self.mask[i]);

        let (default, first) = match last_wildcard {
            Some(idx) => (last - idx, idx + 1),
            None => (self.bytes.len(), 0),
        };

        let mut table = [default; 256];
        for idx in first..last {
            table[self.bytes[idx] as usize] = last - idx;
        }
        table
    }

    /// Offset of the first match in `haystack`.
    pub fn find(&self, haystack: &[u8]) -> Option<usize> {
        self.find_from(haystack, 0, &self.shift_table())
    }

    /// Every match in `haystack`, in order. Overlapping matches are reported.
    pub fn find_iter<'p, 'h>(&'p self, haystack: &'h [u8]) -> Matches<'p, 'h> {
        Matches {
            pattern: self,
            haystack,
            table: self.shift_table(),
            next: 0,
        }
    }

    fn find_from(&self, haystack: &[u8], start: usize, table: &[usize; 256]) -> Option<usize> {
        let len = self.bytes.len();
        let last = len - 1;
        let mut pos = start;

        while pos + len <= haystack.len() {
            if self.matches(&haystack[pos..pos + len]) {
                return Some(pos);
            }
            pos += table[haystack[pos + last] as usize];
        }

        None
    }
}

impl FromStr for Pattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, byte) in self.bytes.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if self.mask[i] {
                write!(f, "{:02X}", byte)?;
            } else {
                f.write_str("?")?;
            }
        }
        Ok(())
    }
}

/// Iterator over all matches of a [`Pattern`].
pub struct Matches<'p, 'h> {
    pattern: &'p Pattern,
    haystack: &'h [u8],
    table: [usize; 256],
    next: usize,
}

impl Iterator for Matches<'_, '_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let found = self
            .pattern
            .find_from(self.haystack, self.next, &self.table)?;
        self.next = found + 1;
        Some(found)
    }
}

/// Scan a section's raw bytes and return the raw file offset of the first match.
///
/// A missing section is treated like a miss.
pub fn scan_section(image: &PeImage, section_name: &str, pattern: &Pattern) -> Option<usize> {
    let Some(section) = image.section(section_name) else {
        trace!(section = section_name, "section not present, nothing to scan");
        return None;
    };

    let start = section.pointer_to_raw_data as usize;
    let found = pattern.find(image.section_data(section)).map(|off| start + off);
    trace!(section = section_name, %pattern, ?found, "scanned section");
    found
}

/// Raw file offsets of every match inside a section.
pub fn scan_section_all(image: &PeImage, section_name: &str, pattern: &Pattern) -> Vec<usize> {
    let Some(section) = image.section(section_name) else {
        return Vec::new();
    };

    let start = section.pointer_to_raw_data as usize;
    pattern
        .find_iter(image.section_data(section))
        .map(|off| start + off)
        .collect()
}
