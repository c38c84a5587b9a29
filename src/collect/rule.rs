//! Rule trees: root generators and named parse rules
//!
//! A rule is either native Rust code or script source text evaluated by an
//! injected [`ScriptEngine`]. Both are called through the same synchronous
//! interface, so the worker pool never knows which kind it is running.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::error::CrawlError;
use super::request::{Request, RequestSeed};

// ============================================================================
// Parse Context & Output
// ============================================================================

/// Input handed to a parse rule
pub struct CrawlerContext<'a> {
    /// Decoded page body
    pub body: &'a str,

    /// The request that produced the body
    pub request: &'a Request,
}

impl<'a> CrawlerContext<'a> {
    pub fn new(body: &'a str, request: &'a Request) -> Self {
        Self { body, request }
    }

    /// Seed a child request for another rule of the same task
    pub fn follow(&self, url: impl Into<String>, rule_name: impl Into<String>) -> RequestSeed {
        RequestSeed::new(url, rule_name)
    }

    /// Build a data record tagged with the owning task
    pub fn cell(&self) -> DataCell {
        DataCell::new(self.request.task_name())
            .with("url", Value::String(self.request.url.clone()))
    }
}

/// A storable record produced by a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataCell {
    pub data: serde_json::Map<String, Value>,
}

impl DataCell {
    /// Key holding the owning task name
    pub const TASK_KEY: &'static str = "Task";

    pub fn new(task_name: &str) -> Self {
        let mut data = serde_json::Map::new();
        data.insert(Self::TASK_KEY.to_string(), Value::String(task_name.to_string()));
        Self { data }
    }

    /// Add a field
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Owning task, if the record carries one
    pub fn task_name(&self) -> Option<&str> {
        self.data.get(Self::TASK_KEY).and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

/// One output item of a parse rule
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    /// A record routed to the task's storage
    Data(DataCell),

    /// Anything else; logged by the sink, never stored
    Value(Value),
}

impl From<DataCell> for Item {
    fn from(cell: DataCell) -> Self {
        Self::Data(cell)
    }
}

/// Output of a parse rule
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseResult {
    pub requests: Vec<RequestSeed>,
    pub items: Vec<Item>,
}

impl ParseResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request(mut self, seed: RequestSeed) -> Self {
        self.requests.push(seed);
        self
    }

    pub fn with_item(mut self, item: impl Into<Item>) -> Self {
        self.items.push(item.into());
        self
    }
}

// ============================================================================
// Script Engine
// ============================================================================

/// Sandboxed evaluator for scripted tasks
///
/// Implementations live outside this crate. The root script yields request
/// seeds; a parse script sees the body and request and yields a result.
pub trait ScriptEngine: Send + Sync {
    fn eval_root(&self, source: &str) -> Result<Vec<RequestSeed>, CrawlError>;

    fn eval_parse(
        &self,
        source: &str,
        ctx: &CrawlerContext<'_>,
    ) -> Result<ParseResult, CrawlError>;
}

// ============================================================================
// Rule Functions
// ============================================================================

pub type NativeRoot = Arc<dyn Fn() -> Result<Vec<RequestSeed>, CrawlError> + Send + Sync>;

pub type NativeParse =
    Arc<dyn Fn(&CrawlerContext<'_>) -> Result<ParseResult, CrawlError> + Send + Sync>;

/// Root request generator
#[derive(Clone)]
pub enum RootFn {
    Native(NativeRoot),
    Scripted {
        source: String,
        engine: Arc<dyn ScriptEngine>,
    },
}

impl RootFn {
    pub fn call(&self) -> Result<Vec<RequestSeed>, CrawlError> {
        match self {
            Self::Native(f) => f(),
            Self::Scripted { source, engine } => engine.eval_root(source),
        }
    }
}

/// Parse function of a single rule
#[derive(Clone)]
pub enum ParseFn {
    Native(NativeParse),
    Scripted {
        source: String,
        engine: Arc<dyn ScriptEngine>,
    },
}

impl ParseFn {
    pub fn call(&self, ctx: &CrawlerContext<'_>) -> Result<ParseResult, CrawlError> {
        match self {
            Self::Native(f) => f(ctx),
            Self::Scripted { source, engine } => engine.eval_parse(source, ctx),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Native(_) => "native",
            Self::Scripted { .. } => "scripted",
        }
    }
}

/// A named parse rule
#[derive(Clone)]
pub struct Rule {
    pub parse: ParseFn,
}

impl Rule {
    pub fn native<F>(f: F) -> Self
    where
        F: Fn(&CrawlerContext<'_>) -> Result<ParseResult, CrawlError> + Send + Sync + 'static,
    {
        Self {
            parse: ParseFn::Native(Arc::new(f)),
        }
    }

    pub fn scripted(source: impl Into<String>, engine: Arc<dyn ScriptEngine>) -> Self {
        Self {
            parse: ParseFn::Scripted {
                source: source.into(),
                engine,
            },
        }
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule").field("kind", &self.parse.kind()).finish()
    }
}

// ============================================================================
// Rule Tree
// ============================================================================

/// A task's root generator plus its named rules
#[derive(Clone)]
pub struct RuleTree {
    root: RootFn,
    trunk: HashMap<String, Rule>,
}

impl RuleTree {
    pub fn new(root: RootFn) -> Self {
        Self {
            root,
            trunk: HashMap::new(),
        }
    }

    /// Tree with a native root generator
    pub fn native_root<F>(f: F) -> Self
    where
        F: Fn() -> Result<Vec<RequestSeed>, CrawlError> + Send + Sync + 'static,
    {
        Self::new(RootFn::Native(Arc::new(f)))
    }

    /// Register a rule under a name
    pub fn with_rule(mut self, name: impl Into<String>, rule: Rule) -> Self {
        self.trunk.insert(name.into(), rule);
        self
    }

    /// Initial request batch
    pub fn root(&self) -> Result<Vec<RequestSeed>, CrawlError> {
        self.root.call()
    }

    pub fn rule(&self, name: &str) -> Option<&Rule> {
        self.trunk.get(name)
    }

    pub fn rule_names(&self) -> impl Iterator<Item = &str> {
        self.trunk.keys().map(String::as_str)
    }
}

impl fmt::Debug for RuleTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleTree")
            .field("rules", &self.trunk.keys().collect::<Vec<_>>())
            .finish()
    }
}
