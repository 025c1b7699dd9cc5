//! Shared State model.
//!
//! A Shared State is a plain struct per component type: rendering data only,
//! no callbacks or live references. Both peers hold a copy. The wire form is
//! a [`FieldMap`] (field name → [`StateValue`]), ordered so encoding is
//! deterministic.
//!
//! Diffing is by value at field granularity. List and map fields are compared
//! as whole values and resent in full when any element changes; element-level
//! patching is left as an extension point.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::error::StateError;
use crate::value::StateValue;

/// Field name → value, in name order.
pub type FieldMap = BTreeMap<String, StateValue>;

/// Serializable component state shared by server and client.
///
/// Usually declared through [`shared_state!`](crate::shared_state).
pub trait SharedState: Default + Clone + PartialEq + Debug + Send + Sync + 'static {
    /// Connector type name sent to the client when the component first syncs.
    const TYPE_NAME: &'static str;

    /// Full field map of the current state.
    fn to_fields(&self) -> FieldMap;

    /// Overwrite the named fields. May leave `self` partially updated on
    /// error; use [`apply_atomic`] when that matters.
    fn apply_fields(&mut self, fields: &FieldMap) -> Result<(), StateError>;
}

/// Incremental or full state payload for one component in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDiff {
    /// `true` when `fields` is the complete state (first sync or resync).
    pub full: bool,
    pub fields: FieldMap,
}

impl StateDiff {
    pub fn full(fields: FieldMap) -> Self {
        Self { full: true, fields }
    }

    pub fn partial(fields: FieldMap) -> Self {
        Self { full: false, fields }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

/// Fields of `current` whose value differs from `previous`.
pub fn diff_fields(previous: &FieldMap, current: &FieldMap) -> FieldMap {
    current
        .iter()
        .filter(|(name, value)| !previous.get(*name).is_some_and(|old| old.same_as(value)))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Apply `fields` to `state` all-or-nothing.
pub fn apply_atomic<S: SharedState>(state: &mut S, fields: &FieldMap) -> Result<(), StateError> {
    let mut next = state.clone();
    next.apply_fields(fields)?;
    *state = next;
    Ok(())
}

/// Declare a Shared State struct with per-field defaults.
///
/// Derives `Debug`, `Clone` and `PartialEq`, implements `Default` from the
/// given defaults and implements [`SharedState`] with the struct name as the
/// connector type name.
///
/// ```
/// trellis_core::shared_state! {
///     pub struct PanelState {
///         pub caption: Option<String> = None,
///         pub visible: bool = true,
///     }
/// }
/// ```
#[macro_export]
macro_rules! shared_state {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$fmeta:meta])*
                $fvis:vis $field:ident : $ty:ty = $default:expr
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        $vis struct $name {
            $(
                $(#[$fmeta])*
                $fvis $field: $ty,
            )*
        }

        impl ::core::default::Default for $name {
            fn default() -> Self {
                Self {
                    $( $field: $default, )*
                }
            }
        }

        impl $crate::state::SharedState for $name {
            const TYPE_NAME: &'static str = stringify!($name);

            fn to_fields(&self) -> $crate::state::FieldMap {
                let mut fields = $crate::state::FieldMap::new();
                $(
                    fields.insert(
                        ::std::string::String::from(stringify!($field)),
                        $crate::value::IntoStateValue::into_state_value(
                            ::core::clone::Clone::clone(&self.$field),
                        ),
                    );
                )*
                fields
            }

            fn apply_fields(
                &mut self,
                fields: &$crate::state::FieldMap,
            ) -> ::core::result::Result<(), $crate::error::StateError> {
                for (name, value) in fields {
                    match name.as_str() {
                        $(
                            stringify!($field) => {
                                self.$field = $crate::value::FromStateValue::from_state_value(value)
                                    .map_err(|e| e.for_field(name))?;
                            }
                        )*
                        other => {
                            return ::core::result::Result::Err(
                                $crate::error::StateError::UnknownField(other.to_string()),
                            );
                        }
                    }
                }
                ::core::result::Result::Ok(())
            }
        }
    };
}
