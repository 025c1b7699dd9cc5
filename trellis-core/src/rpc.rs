//! RPC interface contracts.
//!
//! An interface is an enum whose variants are its methods. `ClientRpc`
//! interfaces are invoked by the server and handled by a client connector;
//! `ServerRpc` interfaces go the other way. Calls are fire-and-forget: no
//! return values, and calls on one interface instance keep their order.
//!
//! Wire form:
//! ```text
//! RpcCall { interface: "TreeGridClientRpc", method: "SetExpanded", args: [Str("k1")] }
//! ```
//!
//! Dispatch never inspects types at call time: [`RpcDispatchTable`] resolves
//! `(interface, method)` to a decoder + handler when the handler is
//! registered.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{BoxError, RpcError};
use crate::key::ComponentKey;
use crate::tracker::ConnectorHandle;
use crate::value::{FromStateValue, StateValue};

/// One queued method invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCall {
    pub interface: String,
    pub method: String,
    pub args: Vec<StateValue>,
}

impl RpcCall {
    pub fn new(
        interface: impl Into<String>,
        method: impl Into<String>,
        args: Vec<StateValue>,
    ) -> Self {
        Self {
            interface: interface.into(),
            method: method.into(),
            args,
        }
    }
}

/// A typed RPC interface. Implemented by [`rpc_interface!`](crate::rpc_interface).
pub trait RpcInterface: Sized + Debug + Send + 'static {
    const NAME: &'static str;
    const METHODS: &'static [&'static str];

    fn method(&self) -> &'static str;

    /// Positional arguments in declaration order.
    fn into_args(self) -> Vec<StateValue>;

    fn decode(method: &str, args: &[StateValue]) -> Result<Self, RpcError>;

    fn into_call(self) -> RpcCall {
        let method = self.method();
        RpcCall::new(Self::NAME, method, self.into_args())
    }
}

/// Server → client interface.
pub trait ClientRpc: RpcInterface {}

/// Client → server interface.
pub trait ServerRpc: RpcInterface {}

/// Decode one positional argument. Used by the generated `decode`.
pub fn decode_arg<T: FromStateValue>(
    interface: &str,
    method: &str,
    argument: &str,
    value: Option<&StateValue>,
) -> Result<T, RpcError> {
    let Some(value) = value else {
        return Err(RpcError::ArgumentType {
            interface: interface.to_string(),
            method: method.to_string(),
            argument: argument.to_string(),
            source: crate::error::ValueError::new("argument", "nothing"),
        });
    };
    T::from_state_value(value).map_err(|source| RpcError::ArgumentType {
        interface: interface.to_string(),
        method: method.to_string(),
        argument: argument.to_string(),
        source,
    })
}

/// Declare an RPC interface enum.
///
/// ```
/// use trellis_core::rpc::RpcInterface;
///
/// trellis_core::rpc_interface! {
///     /// Server-to-client calls for a chart.
///     pub enum ChartClientRpc: ClientRpc {
///         Highlight { series: String, index: u32 },
///         ClearHighlight {},
///     }
/// }
///
/// let call = ChartClientRpc::Highlight { series: "a".into(), index: 2 }.into_call();
/// assert_eq!(call.method, "Highlight");
/// assert_eq!(call.args.len(), 2);
/// ```
#[macro_export]
macro_rules! rpc_interface {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident : $kind:ident {
            $(
                $(#[$vmeta:meta])*
                $variant:ident { $( $arg:ident : $ty:ty ),* $(,)? }
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        $vis enum $name {
            $(
                $(#[$vmeta])*
                $variant { $( $arg: $ty ),* },
            )*
        }

        impl $crate::rpc::RpcInterface for $name {
            const NAME: &'static str = stringify!($name);
            const METHODS: &'static [&'static str] = &[$(stringify!($variant)),*];

            fn method(&self) -> &'static str {
                match self {
                    $( Self::$variant { .. } => stringify!($variant), )*
                }
            }

            fn into_args(self) -> ::std::vec::Vec<$crate::value::StateValue> {
                match self {
                    $(
                        Self::$variant { $( $arg ),* } => ::std::vec![
                            $( $crate::value::IntoStateValue::into_state_value($arg) ),*
                        ],
                    )*
                }
            }

            #[allow(unused_mut, unused_variables)]
            fn decode(
                method: &str,
                args: &[$crate::value::StateValue],
            ) -> ::core::result::Result<Self, $crate::error::RpcError> {
                match method {
                    $(
                        stringify!($variant) => {
                            let names: &[&str] = &[$(stringify!($arg)),*];
                            if args.len() != names.len() {
                                return ::core::result::Result::Err($crate::error::RpcError::Arity {
                                    interface: Self::NAME.to_string(),
                                    method: method.to_string(),
                                    expected: names.len(),
                                    found: args.len(),
                                });
                            }
                            let mut args = args.iter();
                            ::core::result::Result::Ok(Self::$variant {
                                $(
                                    $arg: $crate::rpc::decode_arg::<$ty>(
                                        Self::NAME,
                                        method,
                                        stringify!($arg),
                                        args.next(),
                                    )?,
                                )*
                            })
                        }
                    )*
                    other => ::core::result::Result::Err($crate::error::RpcError::UnknownMethod {
                        interface: Self::NAME.to_string(),
                        method: other.to_string(),
                    }),
                }
            }
        }

        impl $crate::rpc::$kind for $name {}
    };
}

/// Type-erased handler stored in a dispatch table.
pub type RpcHandler<T> = Arc<dyn Fn(&mut T, &RpcCall) -> Result<(), RpcError> + Send + Sync>;

/// `(interface, method)` → handler, filled at registration time.
pub struct RpcDispatchTable<T> {
    handlers: HashMap<String, HashMap<String, RpcHandler<T>>>,
}

impl<T: 'static> RpcDispatchTable<T> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for every method of `R`.
    ///
    /// Registering the same interface again replaces the previous handlers.
    pub fn register<R, F>(&mut self, handler: F)
    where
        R: RpcInterface,
        F: Fn(&mut T, R) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let mut methods: HashMap<String, RpcHandler<T>> = HashMap::with_capacity(R::METHODS.len());

        for method in R::METHODS {
            let handler = Arc::clone(&handler);
            let decode_and_call: RpcHandler<T> = Arc::new(move |target: &mut T, call: &RpcCall| {
                let rpc = R::decode(&call.method, &call.args)?;
                handler(target, rpc).map_err(|e| RpcError::Handler {
                    interface: call.interface.clone(),
                    method: call.method.clone(),
                    message: e.to_string(),
                })
            });
            methods.insert((*method).to_string(), decode_and_call);
        }

        if self.handlers.insert(R::NAME.to_string(), methods).is_some() {
            log::warn!("Replacing RPC handlers for {}", R::NAME);
        }
    }

    /// Look up the handler for `call`.
    pub fn resolve(&self, call: &RpcCall) -> Result<RpcHandler<T>, RpcError> {
        self.handlers
            .get(call.interface.as_str())
            .and_then(|methods| methods.get(call.method.as_str()))
            .cloned()
            .ok_or_else(|| RpcError::NotRegistered {
                interface: call.interface.clone(),
                method: call.method.clone(),
            })
    }

    pub fn is_registered(&self, interface: &str) -> bool {
        self.handlers.contains_key(interface)
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl<T: 'static> Default for RpcDispatchTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Typed sender for one interface on one bound component or connector.
///
/// Calls made after the key is unbound are dropped.
pub struct RpcProxy<R> {
    handle: ConnectorHandle,
    _interface: PhantomData<fn(R)>,
}

impl<R: RpcInterface> RpcProxy<R> {
    pub(crate) fn new(handle: ConnectorHandle) -> Self {
        Self {
            handle,
            _interface: PhantomData,
        }
    }

    /// Queue `rpc` for the next outgoing message. Returns `false` if dropped.
    pub fn call(&self, rpc: R) -> bool {
        self.handle.enqueue_rpc(rpc.into_call())
    }

    pub fn key(&self) -> Option<&ComponentKey> {
        self.handle.key()
    }

    pub fn is_attached(&self) -> bool {
        self.handle.is_attached()
    }
}

impl<R> Clone for RpcProxy<R> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _interface: PhantomData,
        }
    }
}
