//! The Event Type Catalog: a process-wide bijection between
//! an event's Rust type and its stable wire tag.
//!
//! Registration happens once, at startup, before the catalog is handed to a
//! [`crate::registry::Registry`]. This is explicit, injected state, not a
//! global singleton. During normal operation
//! the catalog is read-only; the engine itself dispatches purely off
//! [`crate::action::TaggedEvent::event_tag`] and never consults the catalog,
//! so a missing registration never blocks dispatch. The catalog exists for
//! external interfaces (trigger validation, the live debug channel's
//! `EVENT_METADATA_UPDATE`) that need to go the other way, from a wire tag
//! back to a human-readable event kind name.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use crate::ids::EventTag;

/// A process-wide bijection between event identity and wire tag.
#[derive(Default)]
pub struct EventCatalog {
    by_type: HashMap<TypeId, (EventTag, &'static str)>,
    by_tag: HashMap<EventTag, TypeId>,
}

impl EventCatalog {
    /// An empty catalog with no tags registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the wire tag for event type `T`. `type_name` is a
    /// human-readable label used only for debug-channel metadata.
    ///
    /// Returns an error if `tag` is already bound to a *different* type.
    /// The catalog is a bijection, not a multimap.
    pub fn register<T: Any>(
        &mut self,
        tag: impl Into<EventTag>,
        type_name: &'static str,
    ) -> Result<(), String> {
        let tag = tag.into();
        let type_id = TypeId::of::<T>();
        if let Some(existing) = self.by_tag.get(&tag) {
            if *existing != type_id {
                return Err(format!(
                    "event tag {tag:?} is already registered to a different event type"
                ));
            }
        }
        self.by_tag.insert(tag.clone(), type_id);
        self.by_type.insert(type_id, (tag, type_name));
        Ok(())
    }

    /// The wire tag registered for event type `T`, if any.
    pub fn tag_of<T: Any>(&self) -> Option<&EventTag> {
        self.by_type.get(&TypeId::of::<T>()).map(|(tag, _)| tag)
    }

    /// True if `tag` is a known, registered wire tag.
    pub fn contains_tag(&self, tag: &EventTag) -> bool {
        self.by_tag.contains_key(tag)
    }

    /// All registered tags, for debug-channel metadata snapshots.
    pub fn tags(&self) -> impl Iterator<Item = &EventTag> {
        self.by_tag.keys()
    }
}
