//! Opaque string identifiers used throughout the runtime.
//!
//! `MachineId`, `StateName`, and `EventTag` are thin, cheaply-cloneable
//! wrappers around `Arc<str>`. Keeping them as distinct types (rather than
//! passing bare `String`s around) stops a machine id from being handed to an
//! API that expects a state name, while still round-tripping through the
//! persistence port as plain strings.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

macro_rules! opaque_string_id {
    ($name:ident, $doc:expr) => {
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[doc = $doc]
        pub struct $name(Arc<str>);

        impl $name {
            /// Borrow the wrapped string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:?})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(Arc::from(s))
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(Arc::from(s.into_boxed_str()))
            }
        }

        impl From<&String> for $name {
            fn from(s: &String) -> Self {
                Self(Arc::from(s.as_str()))
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Ok(Self::from(s))
            }
        }
    };
}

opaque_string_id!(MachineId, "Opaque identifier for a single machine, stable for its lifetime.");
opaque_string_id!(StateName, "Opaque name of a declared state.");
opaque_string_id!(EventTag, "Opaque wire tag an event is dispatched under.");

impl EventTag {
    /// Wire tag of the synthetic timeout event.
    pub const TIMEOUT: &'static str = "TIMEOUT";

    /// The tag of the synthetic timeout event.
    pub fn timeout() -> Self {
        Self::from(Self::TIMEOUT)
    }
}
