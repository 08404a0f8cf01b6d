use std::sync::Arc;

/// Opaque reference to a caller-defined placeholder resource, shown while a
/// load is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaceholderRef(pub u32);

/// A reusable display slot that loaded images are delivered to.
///
/// The loader writes the slot's current-key tag before dispatching a load
/// and reads it back at delivery time; a result whose URL no longer matches
/// the tag is dropped silently. This is what keeps a recycled slot (say, a
/// list row scrolled to a new item) from briefly showing the previous item's
/// image.
///
/// Implementations must make the tag visible across threads, and are
/// responsible for routing `display` calls onto their own UI context: the
/// loader invokes every method except synchronous-hit deliveries from worker
/// threads.
pub trait DisplayTarget: Send + Sync {
    /// The decoded asset type this target can display.
    type Asset;

    /// The URL this target is currently bound to, if any.
    fn current_tag(&self) -> Option<Arc<str>>;

    /// Rebinds this target to a new URL.
    fn set_current_tag(&self, tag: Arc<str>);

    /// Shows a decoded asset.
    fn display(&self, asset: Self::Asset);

    /// Shows a caller-chosen placeholder.
    fn display_placeholder(&self, placeholder: PlaceholderRef);
}
