//! Request-scoped metadata: the environment a request carries through the
//! server and the router.
//!
//! - [`Env`]: remote/server addresses, scheme, router mount trail, original
//!   URI, and route parameters.
//! - [`Params`]: query-string and path-capture parameters.
//! - [`Extensions`]: a type-erased map for anything else a handler needs.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    net::SocketAddr,
};

use crate::http::{Scheme, Uri};

type AnyValue = Box<dyn Any + Send + Sync>;

/// Values keyed by their type, for whatever a request carries beyond the
/// fixed [`Env`] fields. The server puts a [`TlsInfo`](crate::net::TlsInfo)
/// here for requests that arrived over HTTPS.
#[derive(Default)]
pub struct Extensions(HashMap<TypeId, AnyValue>);

fn unbox<T: 'static>(value: AnyValue) -> Option<T> {
    value.downcast::<T>().ok().map(|v| *v)
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, handing back any earlier value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.0.insert(TypeId::of::<T>(), Box::new(value)).and_then(unbox)
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.0.get(&TypeId::of::<T>())?.downcast_ref()
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.0.remove(&TypeId::of::<T>()).and_then(unbox)
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.0.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Extensions({} values)", self.0.len())
    }
}

/// A parameter value: a single occurrence, or every occurrence in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Single(String),
    Multi(Vec<String>),
}

impl ParamValue {
    /// The first value.
    pub fn first(&self) -> &str {
        match self {
            ParamValue::Single(v) => v,
            ParamValue::Multi(vs) => vs.first().map_or("", String::as_str),
        }
    }

    /// Every value, in order of occurrence.
    pub fn all(&self) -> Vec<&str> {
        match self {
            ParamValue::Single(v) => vec![v.as_str()],
            ParamValue::Multi(vs) => vs.iter().map(String::as_str).collect(),
        }
    }
}

/// Named request parameters (query string and path captures).
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Params {
    map: HashMap<String, ParamValue>,
}

impl Params {
    /// Create a new empty parameters map
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Set a parameter, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map
            .insert(key.into(), ParamValue::Single(value.into()));
    }

    /// Add one more occurrence of a parameter; repeated keys collapse into
    /// an ordered list.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        match self.map.entry(key.into()) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(ParamValue::Single(value));
            }
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                let values = match slot.get_mut() {
                    ParamValue::Multi(values) => {
                        values.push(value);
                        return;
                    }
                    ParamValue::Single(first) => vec![std::mem::take(first), value],
                };
                slot.insert(ParamValue::Multi(values));
            }
        }
    }

    /// Get the first value of a parameter
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(ParamValue::first)
    }

    /// Get the full value of a parameter
    pub fn get_value(&self, key: &str) -> Option<&ParamValue> {
        self.map.get(key)
    }

    /// Remove a parameter from the map
    pub fn remove(&mut self, key: &str) -> Option<ParamValue> {
        self.map.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Copies every parameter from `other` over this map.
    pub fn merge(&mut self, other: &Params) {
        for (k, v) in &other.map {
            self.map.insert(k.clone(), v.clone());
        }
    }
}

/// The environment of a request: connection metadata and routing state.
#[derive(Debug, Default)]
pub struct Env {
    /// Address of the peer that sent the request.
    pub remote_addr: Option<SocketAddr>,
    /// Local address the request arrived on.
    pub server_addr: Option<SocketAddr>,
    /// Identity the server answers with.
    pub server_name: Option<String>,
    /// Scheme of the listener; overrides the request URI's scheme.
    pub scheme: Option<Scheme>,
    /// Path prefixes matched by mounted routers, outermost first.
    pub context: Vec<String>,
    /// Captures from mounted prefixes.
    pub context_params: Params,
    /// The request URI before any mount rewrote its path.
    pub original_uri: Option<Uri>,
    /// Query parameters merged with route captures.
    pub params: Params,
    /// Route captures in pattern order.
    pub args: Vec<String>,
    pub extensions: Extensions,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    /// The joined mount trail, e.g. `/api/v1`.
    pub fn context_path(&self) -> String {
        self.context.concat()
    }
}
