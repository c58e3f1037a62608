//! Condition registry and compiler

use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{builtin, Condition, ConditionSpec};
use crate::config_error;
use crate::core::context::RequestContext;
use crate::core::error::GatewayResult;

/// Compiles one kind of condition spec
///
/// Constructors receive the engine so composite kinds can compile nested specs through
/// the same registry.
pub trait ConditionConstructor: Send + Sync {
    fn compile(&self, spec: &ConditionSpec, engine: &ConditionEngine) -> GatewayResult<Condition>;
}

/// JSON type accepted for a condition parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Array,
    Object,
    StringOrArray,
    Any,
}

impl ParamType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
            ParamType::StringOrArray => value.is_string() || value.is_array(),
            ParamType::Any => true,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            ParamType::String => "a string",
            ParamType::Number => "a number",
            ParamType::Boolean => "a boolean",
            ParamType::Array => "an array",
            ParamType::Object => "an object",
            ParamType::StringOrArray => "a string or an array",
            ParamType::Any => "any value",
        }
    }
}

#[derive(Debug, Clone)]
struct ParamSpec {
    name: String,
    kind: ParamType,
    required: bool,
}

/// Parameter schema for custom conditions, checked once at compile time
#[derive(Debug, Clone, Default)]
pub struct ConditionSchema {
    params: Vec<ParamSpec>,
}

impl ConditionSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required<S: Into<String>>(mut self, name: S, kind: ParamType) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional<S: Into<String>>(mut self, name: S, kind: ParamType) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    pub fn validate(&self, condition: &str, params: &Map<String, Value>) -> GatewayResult<()> {
        for param in &self.params {
            match params.get(&param.name) {
                Some(value) if !param.kind.accepts(value) => {
                    return Err(config_error!(
                        "Condition '{}': parameter '{}' must be {}",
                        condition,
                        param.name,
                        param.kind.describe()
                    ));
                }
                None if param.required => {
                    return Err(config_error!(
                        "Condition '{}': missing required parameter '{}'",
                        condition,
                        param.name
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Adapts a plain handler function into a constructor
struct HandlerConstructor<F> {
    schema: Option<ConditionSchema>,
    handler: Arc<F>,
}

impl<F> ConditionConstructor for HandlerConstructor<F>
where
    F: Fn(&RequestContext, &Map<String, Value>) -> bool + Send + Sync + 'static,
{
    fn compile(&self, spec: &ConditionSpec, _engine: &ConditionEngine) -> GatewayResult<Condition> {
        if let Some(schema) = &self.schema {
            schema.validate(&spec.name, &spec.params)?;
        }

        let handler = Arc::clone(&self.handler);
        let params = spec.params.clone();
        Ok(Condition::leaf(spec.name.clone(), move |ctx| Ok(handler(ctx, &params))))
    }
}

/// Registry of condition kinds
pub struct ConditionEngine {
    constructors: RwLock<HashMap<String, Arc<dyn ConditionConstructor>>>,
}

impl ConditionEngine {
    /// Create an empty engine
    pub fn new() -> Self {
        Self {
            constructors: RwLock::new(HashMap::new()),
        }
    }

    /// Create an engine with all built-in conditions registered
    pub fn with_builtin() -> Self {
        let engine = Self::new();
        builtin::register_builtin(&engine);
        engine
    }

    /// Register a constructor, replacing any previous registration of the name
    pub fn register_constructor<S: Into<String>>(&self, name: S, constructor: Arc<dyn ConditionConstructor>) {
        let name = name.into();
        let mut constructors = self.constructors.write();
        if constructors.insert(name.clone(), constructor).is_some() {
            warn!(condition = %name, "Condition registration replaced an existing one");
        } else {
            debug!(condition = %name, "Registered condition");
        }
    }

    /// Register a custom condition from a handler receiving the request and the
    /// condition's parameters
    pub fn register<S, F>(&self, name: S, schema: Option<ConditionSchema>, handler: F)
    where
        S: Into<String>,
        F: Fn(&RequestContext, &Map<String, Value>) -> bool + Send + Sync + 'static,
    {
        self.register_constructor(
            name,
            Arc::new(HandlerConstructor {
                schema,
                handler: Arc::new(handler),
            }),
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.read().contains_key(name)
    }

    /// Registered condition names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Compile a spec; no spec means `always`
    pub fn compile(&self, spec: Option<&ConditionSpec>) -> GatewayResult<Condition> {
        let Some(spec) = spec else {
            return Ok(Condition::Always);
        };

        // Released before compiling so composites can re-enter the registry.
        let constructor = self.constructors.read().get(&spec.name).cloned();
        match constructor {
            Some(constructor) => constructor.compile(spec, self),
            None => Err(config_error!("Unknown condition '{}'", spec.name)),
        }
    }

    pub fn compile_all(&self, specs: &[ConditionSpec]) -> GatewayResult<Vec<Condition>> {
        specs.iter().map(|spec| self.compile(Some(spec))).collect()
    }

    /// Compile and evaluate in one step
    pub fn evaluate(&self, spec: Option<&ConditionSpec>, ctx: &RequestContext) -> GatewayResult<bool> {
        self.compile(spec)?.evaluate(ctx)
    }
}

impl Default for ConditionEngine {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl fmt::Debug for ConditionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionEngine")
            .field("conditions", &self.names())
            .finish()
    }
}
