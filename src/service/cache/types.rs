use std::sync::Arc;

/// A cached lookup result. `Negative` remembers that the key does not exist.
#[derive(PartialEq, Debug, Clone)]
pub enum CacheEntry<T> {
    Positive(Arc<T>),
    Negative,
}

impl<T> CacheEntry<T> {
    pub fn value(&self) -> Option<Arc<T>> {
        match self {
            CacheEntry::Positive(value) => Some(value.clone()),
            CacheEntry::Negative => None,
        }
    }
}
