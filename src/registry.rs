//! Discriminator → constructor tables for the open step and
//! assertion families.
//!
//! Every variant type implements a family marker trait
//! ([`crate::step::StepType`] or [`crate::assertion::AssertionType`])
//! and exposes a descriptor built with [`TypeDescriptor::of`]. Built-in
//! variants add their descriptor to [`BUILTIN_STEPS`] or
//! [`BUILTIN_ASSERTIONS`] next to their definition; the process-wide
//! registries are assembled lazily from those slices on first use and
//! can be extended at runtime with [`register_step_type`] /
//! [`register_assertion_type`].
//!
//! Discriminators default to the type name with the family suffix
//! stripped and lower-cased (`EqualsAssertion` → `equals`). A type can
//! override this with its `DISCRIMINATOR` constant.

use crate::assertion::{AssertionOperation, AssertionType};
use crate::error::{Error, Result};
use crate::step::{StepBehavior, StepType};
use linkme::distributed_slice;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{LazyLock, PoisonError, RwLock};
use tracing::{debug, error};

/// A family of polymorphic document types.
pub trait Family: 'static {
    /// Trait object every member is boxed into.
    type Object: ?Sized + Send + Sync;

    /// Human readable name used in errors.
    const NAME: &'static str;

    /// Suffix stripped from type names when deriving a discriminator.
    const SUFFIX: &'static str;
}

/// Marker for the step family.
#[derive(Debug)]
pub enum Steps {}

impl Family for Steps {
    type Object = dyn StepBehavior;
    const NAME: &'static str = "step";
    const SUFFIX: &'static str = "Step";
}

/// Marker for the assertion family.
#[derive(Debug)]
pub enum Assertions {}

impl Family for Assertions {
    type Object = dyn AssertionOperation;
    const NAME: &'static str = "assertion";
    const SUFFIX: &'static str = "Assertion";
}

/// Builds one family member from the named fields of its JSON object
/// (the `type` key and shared fields already removed).
pub type Constructor<F> = fn(Map<String, Value>) -> Result<Box<<F as Family>::Object>>;

pub struct TypeDescriptor<F: Family> {
    pub discriminator: String,
    pub type_name: &'static str,
    constructor: Constructor<F>,
}

impl<F: Family> TypeDescriptor<F> {
    pub fn new(
        type_name: &'static str,
        explicit: Option<&'static str>,
        constructor: Constructor<F>,
    ) -> Self {
        let discriminator = match explicit {
            Some(name) => name.to_lowercase(),
            None => derive_discriminator(type_name, F::SUFFIX),
        };
        Self {
            discriminator,
            type_name,
            constructor,
        }
    }

    /// Construct an instance. Missing required fields and type
    /// mismatches surface as [`Error::InvalidDefinition`].
    pub fn construct(&self, args: Map<String, Value>) -> Result<Box<F::Object>> {
        (self.constructor)(args).map_err(|e| match e {
            Error::InvalidDefinition {
                family, message, ..
            } => Error::InvalidDefinition {
                family,
                discriminator: self.discriminator.clone(),
                message,
            },
            other => other,
        })
    }
}

impl TypeDescriptor<Steps> {
    pub fn of<T: StepType>() -> Self {
        Self::new(std::any::type_name::<T>(), T::DISCRIMINATOR, |args| {
            let step: T = from_args::<Steps, T>(args)?;
            Ok(Box::new(step) as Box<dyn StepBehavior>)
        })
    }
}

impl TypeDescriptor<Assertions> {
    pub fn of<T: AssertionType>() -> Self {
        Self::new(std::any::type_name::<T>(), T::DISCRIMINATOR, |args| {
            let operation: T = from_args::<Assertions, T>(args)?;
            Ok(Box::new(operation) as Box<dyn AssertionOperation>)
        })
    }
}

impl<F: Family> Clone for TypeDescriptor<F> {
    fn clone(&self) -> Self {
        Self {
            discriminator: self.discriminator.clone(),
            type_name: self.type_name,
            constructor: self.constructor,
        }
    }
}

impl<F: Family> fmt::Debug for TypeDescriptor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("family", &F::NAME)
            .field("discriminator", &self.discriminator)
            .field("type_name", &self.type_name)
            .finish()
    }
}

pub struct TypeRegistry<F: Family> {
    descriptors: BTreeMap<String, TypeDescriptor<F>>,
    _family: PhantomData<F>,
}

impl<F: Family> TypeRegistry<F> {
    pub fn new() -> Self {
        Self {
            descriptors: BTreeMap::new(),
            _family: PhantomData,
        }
    }

    pub fn register(&mut self, descriptor: TypeDescriptor<F>) -> Result<()> {
        if let Some(existing) = self.descriptors.get(&descriptor.discriminator) {
            return Err(Error::DuplicateType {
                family: F::NAME,
                discriminator: descriptor.discriminator,
                existing: existing.type_name,
                incoming: descriptor.type_name,
            });
        }
        debug!(
            "Registered {} type '{}' ({})",
            F::NAME,
            descriptor.discriminator,
            descriptor.type_name
        );
        self.descriptors
            .insert(descriptor.discriminator.clone(), descriptor);
        Ok(())
    }

    pub fn register_types(
        &mut self,
        descriptors: impl IntoIterator<Item = TypeDescriptor<F>>,
    ) -> Result<()> {
        descriptors
            .into_iter()
            .try_for_each(|descriptor| self.register(descriptor))
    }

    /// Look up a descriptor. Discriminators are case-insensitive.
    pub fn get_descriptor(&self, discriminator: &str) -> Result<&TypeDescriptor<F>> {
        self.descriptors
            .get(&discriminator.to_lowercase())
            .ok_or_else(|| Error::UnknownType {
                family: F::NAME,
                discriminator: discriminator.to_string(),
            })
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &TypeDescriptor<F>> {
        self.descriptors.values()
    }

    pub fn construct(
        &self,
        discriminator: &str,
        args: Map<String, Value>,
    ) -> Result<Box<F::Object>> {
        self.get_descriptor(discriminator)?.construct(args)
    }
}

impl<F: Family> Default for TypeRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Family> fmt::Debug for TypeRegistry<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.descriptors.values()).finish()
    }
}

/// Built-in step variants, populated at link time.
#[distributed_slice]
pub static BUILTIN_STEPS: [fn() -> TypeDescriptor<Steps>];

/// Built-in assertion operators, populated at link time.
#[distributed_slice]
pub static BUILTIN_ASSERTIONS: [fn() -> TypeDescriptor<Assertions>];

static STEP_TYPES: LazyLock<RwLock<TypeRegistry<Steps>>> =
    LazyLock::new(|| RwLock::new(builtin(&BUILTIN_STEPS)));

static ASSERTION_TYPES: LazyLock<RwLock<TypeRegistry<Assertions>>> =
    LazyLock::new(|| RwLock::new(builtin(&BUILTIN_ASSERTIONS)));

fn builtin<F: Family>(entries: &[fn() -> TypeDescriptor<F>]) -> TypeRegistry<F> {
    let mut registry = TypeRegistry::new();
    for descriptor in entries.iter().map(|entry| entry()) {
        if let Err(e) = registry.register(descriptor) {
            error!("Failed to register built-in {} type: {}", F::NAME, e);
        }
    }
    registry
}

/// Build a step from its discriminator and remaining fields.
pub fn construct_step(
    discriminator: &str,
    args: Map<String, Value>,
) -> Result<Box<dyn StepBehavior>> {
    // the lock is released before constructing: composite steps
    // build their children through this same function
    let descriptor = STEP_TYPES
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get_descriptor(discriminator)?
        .clone();
    descriptor.construct(args)
}

/// Build an assertion operation from its discriminator and remaining
/// fields.
pub fn construct_assertion(
    discriminator: &str,
    args: Map<String, Value>,
) -> Result<Box<dyn AssertionOperation>> {
    let descriptor = ASSERTION_TYPES
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get_descriptor(discriminator)?
        .clone();
    descriptor.construct(args)
}

/// Canonical discriminator of a registered step type.
pub fn step_discriminator(name: &str) -> Result<String> {
    STEP_TYPES
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get_descriptor(name)
        .map(|d| d.discriminator.clone())
}

pub fn register_step_type<T: StepType>() -> Result<()> {
    STEP_TYPES
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .register(TypeDescriptor::<Steps>::of::<T>())
}

pub fn register_assertion_type<T: AssertionType>() -> Result<()> {
    ASSERTION_TYPES
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .register(TypeDescriptor::<Assertions>::of::<T>())
}

/// All registered step descriptors, sorted by discriminator.
pub fn step_descriptors() -> Vec<TypeDescriptor<Steps>> {
    STEP_TYPES
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .descriptors()
        .cloned()
        .collect()
}

/// All registered assertion descriptors, sorted by discriminator.
pub fn assertion_descriptors() -> Vec<TypeDescriptor<Assertions>> {
    ASSERTION_TYPES
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .descriptors()
        .cloned()
        .collect()
}

/// `jtest::flow::ForLoopStep` with suffix `Step` → `forloop`.
pub fn derive_discriminator(type_name: &str, suffix: &str) -> String {
    let base = type_name.split('<').next().unwrap_or(type_name);
    let short = base.rsplit("::").next().unwrap_or(base);
    let stripped = match short.strip_suffix(suffix) {
        Some(rest) if !rest.is_empty() => rest,
        _ => short,
    };
    stripped.to_lowercase()
}

fn from_args<F: Family, T: DeserializeOwned>(args: Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(args)).map_err(|e| Error::InvalidDefinition {
        family: F::NAME,
        discriminator: derive_discriminator(std::any::type_name::<T>(), F::SUFFIX),
        message: e.to_string(),
    })
}
