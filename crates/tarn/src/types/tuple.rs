use crate::value::Value;

/// Immutable sequence of values.
///
/// The hash is computed by the heap on first use and cached in the object header, but
/// only when every element is hashable.
#[derive(Debug, Clone, Default)]
pub struct Tuple(Vec<Value>);

impl Tuple {
    #[must_use]
    pub fn new(items: Vec<Value>) -> Self {
        Self(items)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Value] {
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

    #[must_use]
    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.get(index).copied()
    }
}

/// Folds element hashes into a tuple hash.
///
/// Seeded from the length; each step multiplies the running value before mixing in the
/// next element, so `(a, b)` and `(b, a)` differ.
#[must_use]
pub fn fold_tuple_hash(len: usize, element_hashes: impl IntoIterator<Item = u32>) -> u32 {
    element_hashes
        .into_iter()
        .fold(len as u32, |acc, h| acc.wrapping_mul(1_000_003) ^ h)
}
