use std::any::TypeId;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::key::{CacheKey, KeyBuilder, safe_path_segment};
use crate::serialize::{Bincode, Serializer};
use crate::store::Store;

/// How a cached instance was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Built<T> {
    /// The constructor ran and the resulting state was persisted.
    Fresh(T),
    /// The state was restored from the store; the constructor (and its
    /// side effects) did not run.
    Restored(T),
}

impl<T> Built<T> {
    pub fn into_inner(self) -> T {
        match self {
            Built::Fresh(value) | Built::Restored(value) => value,
        }
    }

    pub fn is_restored(&self) -> bool {
        matches!(self, Built::Restored(_))
    }
}

/// Applies the memoization pipeline to object construction.
///
/// Each concrete type is registered exactly once via
/// [`register`](Self::register); the registration fixes the type's stable
/// identity (its fully qualified name) which names both the on-disk cache
/// tree and the scope of every derived key. Construction then goes
/// through the returned [`CachedCtor`]: on a hit the instance state is
/// deserialized without running the constructor, on a miss the constructor
/// runs and its result is persisted.
///
/// Registering the same type twice — the composition equivalent of
/// stacking the adapter across an inheritance chain — would make the
/// recorded keys ambiguous between the two registrations, and fails fast
/// with [`Error::AlreadyRegistered`] before any instance is built. A type
/// that needs both caching and further specialization gets an explicit
/// wrapper type with its own registration.
pub struct InstanceCache<S = Bincode> {
    root: PathBuf,
    include_module_path: bool,
    serializer: Arc<S>,
    registered: Mutex<FxHashMap<String, TypeId>>,
}

impl InstanceCache<Bincode> {
    /// Creates an adapter rooted at `root` with the default serializer,
    /// folding module paths into the cache tree names.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_serializer(root, true, Bincode)
    }
}

impl<S: Serializer> InstanceCache<S> {
    /// Creates an adapter with an explicit serializer.
    ///
    /// `include_module_path` controls whether the module path of a
    /// registered type is folded into its cache tree name; keeping it
    /// disambiguates same-named types across modules and survives
    /// refactors that move call sites but not the type.
    pub fn with_serializer(
        root: impl Into<PathBuf>,
        include_module_path: bool,
        serializer: S,
    ) -> Self {
        InstanceCache {
            root: root.into(),
            include_module_path,
            serializer: Arc::new(serializer),
            registered: Mutex::new(FxHashMap::default()),
        }
    }

    /// Registers `T` and returns the cached constructor for it.
    ///
    /// The identity recorded for `T` is `std::any::type_name::<T>()`,
    /// fixed here once and for all. Fails with
    /// [`Error::AlreadyRegistered`] when `T` is already routed through
    /// this adapter.
    pub fn register<T, A, C>(&self, ctor: C) -> Result<CachedCtor<T, A, C, S>>
    where
        T: Serialize + DeserializeOwned + 'static,
        A: Serialize,
        C: Fn(A) -> T,
    {
        let identity = std::any::type_name::<T>().to_string();
        let type_id = TypeId::of::<T>();

        let mut registered = self.registered.lock().unwrap();
        if registered.contains_key(&identity) || registered.values().any(|id| *id == type_id) {
            return Err(Error::AlreadyRegistered(identity));
        }
        registered.insert(identity.clone(), type_id);
        drop(registered);

        let dir_name = if self.include_module_path {
            safe_path_segment(&identity)
        } else {
            identity.rsplit("::").next().unwrap_or(&identity).to_string()
        };
        let store = Store::new(self.root.join(dir_name))?;
        tracing::debug!(identity = %identity, root = %store.root().display(), "registered cached type");

        Ok(CachedCtor {
            identity,
            ctor,
            store,
            serializer: Arc::clone(&self.serializer),
            _marker: PhantomData,
        })
    }
}

/// A registered cached constructor for one concrete type.
pub struct CachedCtor<T, A, C, S = Bincode> {
    identity: String,
    ctor: C,
    store: Store,
    serializer: Arc<S>,
    _marker: PhantomData<fn(A) -> T>,
}

impl<T, A, C, S> CachedCtor<T, A, C, S>
where
    T: Serialize + DeserializeOwned,
    A: Serialize,
    C: Fn(A) -> T,
    S: Serializer,
{
    /// The stable identity fixed at registration.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Builds or restores the instance for `args`.
    ///
    /// On a hit the constructor does not run; the persisted state is
    /// deserialized directly.
    pub fn build(&self, args: A) -> Result<Built<T>> {
        let key = self.key_for(&args)?;
        match self.store.get(&key, self.serializer.as_ref()) {
            Ok(state) => return Ok(Built::Restored(state)),
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }

        let instance = (self.ctor)(args);
        self.store.put(&key, &instance, self.serializer.as_ref())?;
        Ok(Built::Fresh(instance))
    }

    /// Whether a persisted instance exists for `args`.
    pub fn has_key(&self, args: &A) -> Result<bool> {
        Ok(self.store.exists(&self.key_for(args)?))
    }

    /// Removes the persisted instance for `args`, returning whether one
    /// existed.
    pub fn remove(&self, args: &A) -> Result<bool> {
        self.store.remove(&self.key_for(args)?)
    }

    fn key_for(&self, args: &A) -> Result<CacheKey> {
        let mut builder = KeyBuilder::new(&self.identity);
        builder.write_arg("ctor_args", args, self.serializer.as_ref())?;
        Ok(builder.build())
    }
}
