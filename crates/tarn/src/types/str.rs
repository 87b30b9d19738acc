//! Immutable interned strings.
//!
//! Text is stored as UTF-8. Indexing by codepoint needs a fixed-width view, which is
//! built on first use and cached for the lifetime of the string. The width of that view
//! is decided once, at creation, from the largest codepoint present.

use std::cell::OnceCell;

use strum::IntoStaticStr;

use crate::heap::ObjFlags;

/// Storage width of a string's codepoint array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr)]
pub enum StrWidth {
    /// All codepoints below 0x80; the UTF-8 bytes double as the codepoint array.
    Ascii,
    /// Largest codepoint below 0x100.
    Ucs1,
    /// Largest codepoint below 0x10000.
    Ucs2,
    Ucs4,
}

impl StrWidth {
    fn classify(text: &str) -> Self {
        let max = text.chars().map(u32::from).max().unwrap_or(0);
        match max {
            0..0x80 => Self::Ascii,
            0x80..0x100 => Self::Ucs1,
            0x100..0x1_0000 => Self::Ucs2,
            _ => Self::Ucs4,
        }
    }

    /// Header flag recording this width.
    #[must_use]
    pub fn flag(self) -> ObjFlags {
        match self {
            Self::Ascii => ObjFlags::STR_ASCII,
            Self::Ucs1 => ObjFlags::STR_UCS1,
            Self::Ucs2 => ObjFlags::STR_UCS2,
            Self::Ucs4 => ObjFlags::STR_UCS4,
        }
    }
}

/// Fixed-width codepoint array of a non-ASCII string.
#[derive(Debug)]
enum CodePoints {
    Ucs1(Box<[u8]>),
    Ucs2(Box<[u16]>),
    Ucs4(Box<[u32]>),
}

#[derive(Debug)]
pub struct Str {
    text: Box<str>,
    width: StrWidth,
    codes: OnceCell<CodePoints>,
}

impl Str {
    #[must_use]
    pub fn new(text: &str) -> Self {
        Self {
            width: StrWidth::classify(text),
            text: text.into(),
            codes: OnceCell::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    #[inline]
    #[must_use]
    pub fn width(&self) -> StrWidth {
        self.width
    }

    /// Length in bytes of the UTF-8 form.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.text.len()
    }

    /// Length in codepoints.
    #[must_use]
    pub fn len(&self) -> usize {
        match self.width {
            StrWidth::Ascii => self.text.len(),
            _ => match self.codes() {
                Some(CodePoints::Ucs1(c)) => c.len(),
                Some(CodePoints::Ucs2(c)) => c.len(),
                Some(CodePoints::Ucs4(c)) => c.len(),
                None => 0,
            },
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Codepoint at `index`, or `None` past the end.
    #[must_use]
    pub fn codepoint_at(&self, index: usize) -> Option<char> {
        let code = match self.width {
            StrWidth::Ascii => u32::from(*self.text.as_bytes().get(index)?),
            _ => match self.codes()? {
                CodePoints::Ucs1(c) => u32::from(*c.get(index)?),
                CodePoints::Ucs2(c) => u32::from(*c.get(index)?),
                CodePoints::Ucs4(c) => *c.get(index)?,
            },
        };
        char::from_u32(code)
    }

    /// Whether the fixed-width view has been built yet.
    #[must_use]
    pub fn codes_ready(&self) -> bool {
        self.width == StrWidth::Ascii || self.codes.get().is_some()
    }

    fn codes(&self) -> Option<&CodePoints> {
        if self.width == StrWidth::Ascii {
            return None;
        }
        Some(self.codes.get_or_init(|| {
            let chars = self.text.chars().map(u32::from);
            match self.width {
                StrWidth::Ucs1 => CodePoints::Ucs1(chars.map(|c| c as u8).collect()),
                StrWidth::Ucs2 => CodePoints::Ucs2(chars.map(|c| c as u16).collect()),
                _ => CodePoints::Ucs4(chars.collect()),
            }
        }))
    }

    /// Approximate bytes owned by this string, including a built codepoint array.
    #[must_use]
    pub fn estimate_size(&self) -> usize {
        let codes = match self.width {
            StrWidth::Ascii => 0,
            StrWidth::Ucs1 => self.text.len(),
            StrWidth::Ucs2 => self.text.len() * 2,
            StrWidth::Ucs4 => self.text.len() * 4,
        };
        self.text.len() + codes
    }
}

/// sdbm hash over raw bytes, used for strings and byte buffers.
#[must_use]
pub fn sdbm_hash(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |hash, &b| {
        u32::from(b)
            .wrapping_add(hash << 6)
            .wrapping_add(hash << 16)
            .wrapping_sub(hash)
    })
}

/// Python-style quoted representation of `text`.
#[must_use]
pub fn string_repr(text: &str) -> String {
    let quote = if text.contains('\'') && !text.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(text.len() + 2);
    out.push(quote);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7F => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_follows_largest_codepoint() {
        assert_eq!(Str::new("abc").width(), StrWidth::Ascii);
        assert_eq!(Str::new("caf\u{e9}").width(), StrWidth::Ucs1);
        assert_eq!(Str::new("\u{3b1}\u{3b2}").width(), StrWidth::Ucs2);
        assert_eq!(Str::new("a\u{1F600}").width(), StrWidth::Ucs4);
    }

    #[test]
    fn codepoint_access_is_by_character() {
        let s = Str::new("h\u{e9}llo\u{1F600}");
        assert!(!s.codes_ready());
        assert_eq!(s.len(), 6);
        assert!(s.codes_ready());
        assert_eq!(s.codepoint_at(1), Some('\u{e9}'));
        assert_eq!(s.codepoint_at(5), Some('\u{1F600}'));
        assert_eq!(s.codepoint_at(6), None);
    }

    #[test]
    fn sdbm_matches_reference_values() {
        assert_eq!(sdbm_hash(b""), 0);
        assert_eq!(sdbm_hash(b"a"), 97);
        // 98 + (97 << 6) + (97 << 16) - 97
        assert_eq!(sdbm_hash(b"ab"), 98 + (97 << 6) + (97 << 16) - 97);
    }

    #[test]
    fn repr_picks_quotes() {
        assert_eq!(string_repr("hi"), "'hi'");
        assert_eq!(string_repr("it's"), "\"it's\"");
        assert_eq!(string_repr("a\nb"), "'a\\nb'");
    }
}
