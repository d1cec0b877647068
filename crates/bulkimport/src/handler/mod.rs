//! Row handlers and their named dependencies.
//!
//! A job stores only the name of its handler and the names of its
//! dependencies. Both the submitting process and the worker build the same
//! [`HandlerRegistry`] and resolve those names when they need them.

pub mod builtin;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::HandlerError;
use crate::job::Job;
use crate::reader::Row;

/// What a successful row did to the target data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowAction {
    Create,
    Update,
    #[default]
    None,
}

/// Structured result of one handler call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowResult {
    pub status_code: u16,
    pub action: RowAction,
    pub error: Option<String>,
}

impl RowResult {
    pub fn ok() -> Self {
        Self {
            status_code: 200,
            action: RowAction::None,
            error: None,
        }
    }

    pub fn created() -> Self {
        Self {
            action: RowAction::Create,
            ..Self::ok()
        }
    }

    pub fn updated() -> Self {
        Self {
            action: RowAction::Update,
            ..Self::ok()
        }
    }

    pub fn rejected(status_code: u16, error: impl Into<String>) -> Self {
        Self {
            status_code,
            action: RowAction::None,
            error: Some(error.into()),
        }
    }

    /// Any 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Caller-supplied logic run once per content row.
///
/// `index` is the 1-based position among content rows of the file.
/// Returning `Err` or panicking marks the row as a system error; the
/// job carries on with the next row.
pub trait RowHandler: Send + Sync {
    fn handle(&self, row: &Row, index: u64, deps: &Dependencies) -> Result<RowResult, HandlerError>;
}

impl<F> RowHandler for F
where
    F: Fn(&Row, u64, &Dependencies) -> Result<RowResult, HandlerError> + Send + Sync,
{
    fn handle(
        &self,
        row: &Row,
        index: u64,
        deps: &Dependencies,
    ) -> Result<RowResult, HandlerError> {
        self(row, index, deps)
    }
}

/// A resolved dependency value.
pub type Resolved = Arc<dyn Any + Send + Sync>;

/// Builds a named dependency for a job. Called once per chunk.
pub trait DependencyProvider: Send + Sync {
    fn resolve(&self, job: &Job) -> Result<Resolved, HandlerError>;
}

impl<F> DependencyProvider for F
where
    F: Fn(&Job) -> Result<Resolved, HandlerError> + Send + Sync,
{
    fn resolve(&self, job: &Job) -> Result<Resolved, HandlerError> {
        self(job)
    }
}

/// Dependencies resolved for the current chunk, by name.
#[derive(Default, Clone)]
pub struct Dependencies {
    values: HashMap<String, Resolved>,
}

impl Dependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Resolved) {
        self.values.insert(name.into(), value);
    }

    /// Borrows a dependency as `T`. `None` if absent or of another type.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<&T> {
        self.values.get(name).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_arc<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.values
            .get(name)
            .and_then(|v| Arc::clone(v).downcast::<T>().ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.values.keys().collect();
        names.sort();
        f.debug_struct("Dependencies").field("names", &names).finish()
    }
}

/// Named handlers and dependency providers.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn RowHandler>>,
    providers: HashMap<String, Arc<dyn DependencyProvider>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the handlers in [`builtin`].
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register(&mut registry);
        registry
    }

    pub fn register_handler<H>(&mut self, name: impl Into<String>, handler: H) -> &mut Self
    where
        H: RowHandler + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn register_dependency<P>(&mut self, name: impl Into<String>, provider: P) -> &mut Self
    where
        P: DependencyProvider + 'static,
    {
        self.providers.insert(name.into(), Arc::new(provider));
        self
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn RowHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn has_dependency(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the first name in `names` with no registered provider.
    pub fn missing_dependency<'a>(&self, names: &'a [String]) -> Option<&'a str> {
        names
            .iter()
            .find(|name| !self.has_dependency(name))
            .map(String::as_str)
    }

    /// Resolves every named dependency for `job`.
    pub fn resolve(&self, names: &[String], job: &Job) -> Result<Dependencies, HandlerError> {
        let mut deps = Dependencies::new();
        for name in names {
            let provider = self
                .providers
                .get(name)
                .ok_or_else(|| HandlerError::UnknownDependency(name.clone()))?;

            let value = catch_unwind(AssertUnwindSafe(|| provider.resolve(job)))
                .map_err(|payload| HandlerError::Panicked(panic_message(payload.as_ref())))?
                .map_err(|e| HandlerError::Dependency {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            deps.insert(name.clone(), value);
        }
        Ok(deps)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut providers: Vec<_> = self.providers.keys().collect();
        providers.sort();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handler_names())
            .field("dependencies", &providers)
            .finish()
    }
}

/// How one row ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Success(RowAction),
    /// Non-2xx result; carries the handler's message if it gave one.
    Rejected(Option<String>),
    /// The handler returned `Err` or panicked.
    SystemError(String),
}

/// Calls a handler with the row boundary as the failure boundary.
pub struct RowInvoker {
    handler: Arc<dyn RowHandler>,
}

impl RowInvoker {
    pub fn new(handler: Arc<dyn RowHandler>) -> Self {
        Self { handler }
    }

    pub fn invoke(&self, row: &Row, index: u64, deps: &Dependencies) -> RowOutcome {
        match catch_unwind(AssertUnwindSafe(|| self.handler.handle(row, index, deps))) {
            Ok(Ok(result)) if result.is_success() => RowOutcome::Success(result.action),
            Ok(Ok(result)) => RowOutcome::Rejected(result.error.filter(|e| !e.is_empty())),
            Ok(Err(e)) => RowOutcome::SystemError(e.to_string()),
            Err(payload) => {
                let error = HandlerError::Panicked(panic_message(payload.as_ref()));
                RowOutcome::SystemError(error.to_string())
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
