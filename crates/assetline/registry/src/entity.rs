use std::fmt;
use std::hash::Hash;

/// An externally owned object that can live in a [`GatedCollection`].
///
/// The collection holds `Arc<E>` handles and never clones the entity itself;
/// compare-and-swap updates compare handle identity.
///
/// [`GatedCollection`]: crate::GatedCollection
pub trait Entity: Send + Sync + 'static {
    /// Unique identifier with value equality.
    type Key: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static;

    fn key(&self) -> Self::Key;
}
