/// Immutable byte buffer. Hashed with the same function as strings, but never interned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bytes(Box<[u8]>);

impl Bytes {
    #[must_use]
    pub fn new(data: &[u8]) -> Self {
        Self(data.into())
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `b'...'` representation with non-printable bytes escaped.
    #[must_use]
    pub fn repr(&self) -> String {
        let mut out = String::with_capacity(self.0.len() + 3);
        out.push_str("b'");
        for &b in self.0.iter() {
            match b {
                b'\\' => out.push_str("\\\\"),
                b'\'' => out.push_str("\\'"),
                b'\n' => out.push_str("\\n"),
                b'\r' => out.push_str("\\r"),
                b'\t' => out.push_str("\\t"),
                0x20..0x7F => out.push(char::from(b)),
                _ => out.push_str(&format!("\\x{b:02x}")),
            }
        }
        out.push('\'');
        out
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(data: Vec<u8>) -> Self {
        Self(data.into_boxed_slice())
    }
}
