//! Templates: named, parameterised step sequences invoked with the
//! `use` step.

use crate::context::{ContextChanges, VariableContext, CTX, THIS};
use crate::error::{Error, Result as ConfigResult};
use crate::path::VariablePath;
use crate::registry::{Steps, TypeDescriptor, BUILTIN_STEPS};
use crate::step::{run_steps, Runtime, Step, StepBehavior, StepOutcome, StepType};
use crate::token::{resolve_string, resolve_value};
use anyhow::{Context, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use linkme::distributed_slice;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Declaration of one template parameter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Template {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub params: IndexMap<String, ParamSpec>,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Caller target path → expression evaluated in the template's
    /// context after its steps ran.
    #[serde(default)]
    pub output: IndexMap<String, Value>,
}

impl Template {
    /// Combine resolved `with` arguments with the declared
    /// parameters: defaults fill gaps, required parameters must be
    /// present, and declared types are checked. Undeclared arguments
    /// pass through unchanged.
    pub fn bind(&self, args: Map<String, Value>) -> ConfigResult<Map<String, Value>> {
        let mut bound = args;
        for (name, spec) in &self.params {
            let value = match bound.shift_remove(name) {
                Some(value) => value,
                None => match &spec.default {
                    Some(default) => default.clone(),
                    None if spec.required => {
                        return Err(Error::MissingParameter {
                            template: self.name.clone(),
                            param: name.clone(),
                        })
                    }
                    None => continue,
                },
            };
            let value = match spec.kind.as_deref() {
                Some(kind) => coerce(kind, value).map_err(|actual| Error::ParameterType {
                    template: self.name.clone(),
                    param: name.clone(),
                    expected: kind.to_string(),
                    actual,
                })?,
                None => value,
            };
            bound.insert(name.clone(), value);
        }
        Ok(bound)
    }
}

/// Check `value` against a declared parameter type. Numeric and
/// boolean strings are converted; anything else that does not fit is
/// returned as the offending type name.
fn coerce(kind: &str, value: Value) -> std::result::Result<Value, String> {
    let mismatch = |v: &Value| crate::assertion::describe_type(v).to_string();
    match (kind.to_lowercase().as_str(), value) {
        ("any", v) | (_, v @ Value::Null) => Ok(v),
        ("string", v @ (Value::String(_) | Value::Number(_) | Value::Bool(_))) => Ok(v),
        ("number", v @ Value::Number(_)) => Ok(v),
        ("integer", Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(Value::Number(n)),
        ("number" | "integer", Value::String(s)) => {
            let parsed = serde_json::from_str::<Value>(s.trim()).ok();
            match parsed {
                Some(Value::Number(n)) if kind.eq_ignore_ascii_case("number") || n.is_i64() || n.is_u64() => {
                    Ok(Value::Number(n))
                }
                _ => Err(mismatch(&Value::String(s))),
            }
        }
        ("boolean", v @ Value::Bool(_)) => Ok(v),
        ("boolean", Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(mismatch(&Value::String(s))),
        },
        ("object", v @ Value::Object(_)) => Ok(v),
        ("array", v @ Value::Array(_)) => Ok(v),
        ("string" | "number" | "integer" | "boolean" | "object" | "array", v) => Err(mismatch(&v)),
        // unknown type names are not checked
        (_, v) => Ok(v),
    }
}

/// A template collection document:
/// `{ "version": ..., "components": { "templates": [...] } }`.
#[derive(Debug, Deserialize)]
pub struct TemplateCollection {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub components: Components,
}

#[derive(Debug, Default, Deserialize)]
pub struct Components {
    #[serde(default)]
    pub templates: Vec<Template>,
}

impl TemplateCollection {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("failed to parse template collection")
    }
}

/// Templates by name. Later insertions replace earlier ones.
#[derive(Debug, Default)]
pub struct TemplateStore {
    templates: IndexMap<String, Arc<Template>>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, template: Template) {
        let name = template.name.clone();
        if self.templates.insert(name.clone(), Arc::new(template)).is_some() {
            warn!("Template '{}' overwritten by a later definition", name);
        } else {
            debug!("Loaded template '{}'", name);
        }
    }

    pub fn load(&mut self, collection: TemplateCollection) {
        for template in collection.components.templates {
            self.insert(template);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Template>> {
        self.templates.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Suite-local templates layered over the global ones.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    local: Arc<TemplateStore>,
    global: Arc<TemplateStore>,
}

impl TemplateCatalog {
    pub fn new(global: Arc<TemplateStore>) -> Self {
        Self {
            local: Arc::new(TemplateStore::new()),
            global,
        }
    }

    pub fn with_local(mut self, local: TemplateStore) -> Self {
        self.local = Arc::new(local);
        self
    }

    pub fn get(&self, name: &str) -> ConfigResult<Arc<Template>> {
        self.local
            .get(name)
            .or_else(|| self.global.get(name))
            .ok_or_else(|| Error::TemplateNotFound(name.to_string()))
    }
}

/// Invokes a template.
///
/// `with` is resolved in the caller, bound to the template parameters
/// and placed in the `ctx` root of an isolated context that shares
/// `env` and starts from a copy of `globals`. After the template steps
/// ran, each `output` entry is resolved there and written to the
/// caller at its target path; the outputs also become `this`.
#[derive(Debug, Clone, Deserialize)]
pub struct UseStep {
    pub template: String,
    #[serde(default)]
    pub with: Map<String, Value>,
}

impl StepType for UseStep {}

#[distributed_slice(BUILTIN_STEPS)]
static REGISTER_USE: fn() -> TypeDescriptor<Steps> = TypeDescriptor::<Steps>::of::<UseStep>;

#[async_trait]
impl StepBehavior for UseStep {
    async fn execute(&self, rt: &Runtime, ctx: &mut VariableContext) -> Result<StepOutcome> {
        let name = resolve_string(&self.template, ctx);
        let template = rt.templates.get(&name)?;

        let args = match resolve_value(&Value::Object(self.with.clone()), ctx) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let params = template.bind(args)?;

        let mut sub = ctx.isolated();
        for (key, value) in params {
            sub.set_path(&VariablePath::child(CTX, &key), value)?;
        }

        debug!("Expanding template '{}'", name);
        let inner = run_steps(&template.steps, rt, &mut sub)
            .await
            .with_context(|| format!("template '{name}'"))?;

        let mut outputs = Map::new();
        let mut changes = ContextChanges::default();
        for (target, expr) in &template.output {
            let value = resolve_value(expr, &sub);
            let path = VariablePath::parse(target)?;
            let change = ctx.set_path(&path, value.clone())?;
            changes.record(&path, change);
            outputs.insert(target.clone(), value);
        }
        for line in sub.take_diagnostics() {
            ctx.log(line);
        }
        ctx.set_root(THIS, Value::Object(outputs.clone()))?;

        Ok(StepOutcome::passed()
            .with_details(json!({ "template": name, "outputs": outputs }))
            .with_changes(changes)
            .with_inner(inner))
    }
}
