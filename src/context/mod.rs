//! Per-request context passed down the middleware chain.
//!
//! Middleware earlier in the chain can leave typed values in the
//! [`Extensions`] map for later layers, e.g. the host's auth layer inserts an
//! [`AuthenticatedUser`] that the metrics middleware attaches to slow-request
//! records.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use crate::Request;

/// Type-erased map keyed by value type.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, returning the previous value of the same type.
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// Identity of the caller, as established by the host's auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Per-request context: the request plus typed extensions.
pub struct Context {
    request: Request,
    extensions: Extensions,
}

impl Context {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            extensions: Extensions::new(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Shorthand for the [`AuthenticatedUser`] extension.
    pub fn user(&self) -> Option<&str> {
        self.extensions
            .get::<AuthenticatedUser>()
            .map(|u| u.0.as_str())
    }
}
