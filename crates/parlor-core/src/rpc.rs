//! Name-addressed RPC without reflection.
//!
//! Each room type (and the registry itself) declares its callable surface
//! as an explicit registration table: method name, parameter descriptors,
//! handler function. [`MethodMapBuilder`] validates the table once at
//! construction time and the resulting [`MethodMap`] is immutable.
//! [`dispatch`] resolves an untyped JSON payload plus ambient call context
//! into the handler's arguments, failing with a structured [`RpcError`]
//! before the handler runs if anything about the call shape is wrong.

use std::any::Any;
use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::conn::ConnHandle;
use crate::error::RpcError;

/// Outcome of one RPC call: an optional result value to push back, or a
/// failure. Handler failures other than `Domain` are dispatch-layer errors.
pub type RpcResult = Result<Option<Value>, RpcError>;

/// Declared parameter of an RPC method.
#[derive(Clone, Debug)]
pub enum ParamDef {
    /// Bound from the caller's payload; `default` is a JSON literal used
    /// when the payload omits the parameter.
    Payload {
        name: &'static str,
        default: Option<&'static str>,
    },
    /// Never bound from the payload: filled by the invocation machinery
    /// with the current connection handle. A same-named payload key is
    /// accepted by validation but has no effect.
    Connection { name: &'static str },
}

impl ParamDef {
    pub fn payload(name: &'static str) -> Self {
        Self::Payload {
            name,
            default: None,
        }
    }

    pub fn with_default(name: &'static str, default: &'static str) -> Self {
        Self::Payload {
            name,
            default: Some(default),
        }
    }

    pub fn connection(name: &'static str) -> Self {
        Self::Connection { name }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Payload { name, .. } | Self::Connection { name } => name,
        }
    }
}

/// Ambient values available to a call. The WebSocket path supplies the
/// current connection; the HTTP path supplies nothing, so connection-typed
/// parameters cannot be satisfied there.
#[derive(Clone, Copy, Default)]
pub struct CallCtx<'a> {
    pub conn: Option<&'a ConnHandle>,
}

impl<'a> CallCtx<'a> {
    pub fn empty() -> Self {
        Self { conn: None }
    }

    pub fn with_conn(conn: &'a ConnHandle) -> Self {
        Self { conn: Some(conn) }
    }
}

/// Arguments resolved by [`dispatch`], handed to the handler.
pub struct CallArgs<'a> {
    method: &'a str,
    values: HashMap<&'static str, Value>,
    conn: Option<&'a ConnHandle>,
}

impl<'a> CallArgs<'a> {
    /// Coerce a payload parameter to its declared type.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, RpcError> {
        let value = self.values.get(name).ok_or_else(|| {
            RpcError::Internal(format!(
                "parameter '{name}' was not declared for method {}",
                self.method
            ))
        })?;
        serde_json::from_value(value.clone()).map_err(|err| RpcError::InvalidParameter {
            method: self.method.to_string(),
            param: name.to_string(),
            detail: err.to_string(),
        })
    }

    /// Like [`CallArgs::get`], but JSON null (or an absent declaration)
    /// coerces to `None`.
    pub fn opt<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, RpcError> {
        match self.values.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|err| RpcError::InvalidParameter {
                    method: self.method.to_string(),
                    param: name.to_string(),
                    detail: err.to_string(),
                }),
        }
    }

    /// The ambient connection handle.
    pub fn conn(&self) -> Result<&ConnHandle, RpcError> {
        self.conn.ok_or_else(|| RpcError::MissingRequiredParameter {
            method: self.method.to_string(),
            param: "connection".to_string(),
        })
    }
}

/// Typed handler registered for one method of receiver type `R`.
pub type HandlerFn<R> = fn(&mut R, &CallArgs<'_>) -> RpcResult;

type ErasedHandler = Box<dyn Fn(&mut dyn Any, &CallArgs<'_>) -> RpcResult + Send + Sync>;

struct MethodEntry {
    params: Vec<ParamDef>,
    handler: ErasedHandler,
}

/// Immutable table of externally callable method names. Built once per
/// receiver type; never re-scanned at runtime.
pub struct MethodMap {
    entries: HashMap<&'static str, MethodEntry>,
}

impl MethodMap {
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.entries.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Collects `(name, params, handler)` registrations for receiver type `R`
/// and validates them into a [`MethodMap`]. A name collision fails the
/// whole build with [`RpcError::DuplicateMethodName`].
pub struct MethodMapBuilder<R> {
    entries: Vec<(&'static str, MethodEntry)>,
    _receiver: std::marker::PhantomData<fn(&mut R)>,
}

impl<R: 'static> MethodMapBuilder<R> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            _receiver: std::marker::PhantomData,
        }
    }

    pub fn method(
        mut self,
        name: &'static str,
        params: Vec<ParamDef>,
        handler: HandlerFn<R>,
    ) -> Self {
        let erased: ErasedHandler = Box::new(move |receiver, args| {
            let receiver = receiver.downcast_mut::<R>().ok_or_else(|| {
                RpcError::Internal(format!("receiver type mismatch for method {name}"))
            })?;
            handler(receiver, args)
        });
        self.entries.push((
            name,
            MethodEntry {
                params,
                handler: erased,
            },
        ));
        self
    }

    pub fn build(self) -> Result<MethodMap, RpcError> {
        let mut entries = HashMap::with_capacity(self.entries.len());
        for (name, entry) in self.entries {
            if entries.insert(name, entry).is_some() {
                return Err(RpcError::DuplicateMethodName(name.to_string()));
            }
        }
        Ok(MethodMap { entries })
    }
}

impl<R: 'static> Default for MethodMapBuilder<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve and invoke `method` against `receiver`.
///
/// Order of failure checks: unknown method name, unknown payload keys,
/// then per-parameter resolution (payload value, else default literal,
/// else ambient context). The handler only runs once every declared
/// parameter is satisfied; its own failures propagate untouched.
pub fn dispatch(
    map: &MethodMap,
    method: &str,
    params: Option<&Value>,
    ctx: CallCtx<'_>,
    receiver: &mut dyn Any,
) -> RpcResult {
    let entry = map.entries.get(method).ok_or_else(|| RpcError::UnknownMethod {
        method: method.to_string(),
    })?;

    // Guard against silent typos: every payload key must name a declared
    // parameter.
    if let Some(Value::Object(payload)) = params {
        for key in payload.keys() {
            if !entry.params.iter().any(|p| p.name() == key) {
                let expected = entry
                    .params
                    .iter()
                    .map(ParamDef::name)
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(RpcError::UnknownParameter {
                    method: method.to_string(),
                    param: key.clone(),
                    expected,
                });
            }
        }
    }

    let mut values = HashMap::with_capacity(entry.params.len());
    for param in &entry.params {
        match param {
            ParamDef::Connection { name } => {
                if ctx.conn.is_none() {
                    return Err(RpcError::MissingRequiredParameter {
                        method: method.to_string(),
                        param: name.to_string(),
                    });
                }
            }
            ParamDef::Payload { name, default } => {
                if let Some(value) = params.and_then(|p| p.get(*name)) {
                    values.insert(*name, value.clone());
                } else if let Some(literal) = default {
                    let value = serde_json::from_str(literal).map_err(|err| {
                        RpcError::Internal(format!(
                            "bad default literal for parameter '{name}' of {method}: {err}"
                        ))
                    })?;
                    values.insert(*name, value);
                } else {
                    return Err(RpcError::MissingRequiredParameter {
                        method: method.to_string(),
                        param: name.to_string(),
                    });
                }
            }
        }
    }

    let args = CallArgs {
        method,
        values,
        conn: ctx.conn,
    };
    (entry.handler)(receiver, &args)
}
