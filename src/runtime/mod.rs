//! The language-runtime seam.
//!
//! The server core treats the evaluated language as a black box behind
//! [`LanguageRuntime`]: read source into forms, evaluate a form against a
//! mutable dynamic context, answer namespace queries. The context carries
//! redirectable standard streams and a cooperative [`CancelToken`] the
//! runtime is expected to poll at read boundaries.

pub mod sexp;

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

/// A runtime value; forms are values too (code is data).
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
    Sym(String),
    List(Vec<Value>),
}

impl Value {
    /// Reader-readable rendering: strings quoted and escaped, everything
    /// else in literal form.
    pub fn print(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Str(text) => {
                let mut out = String::with_capacity(text.len() + 2);
                out.push('"');
                for ch in text.chars() {
                    match ch {
                        '"' => out.push_str("\\\""),
                        '\\' => out.push_str("\\\\"),
                        '\n' => out.push_str("\\n"),
                        '\t' => out.push_str("\\t"),
                        '\r' => out.push_str("\\r"),
                        ch => out.push(ch),
                    }
                }
                out.push('"');
                out
            }
            Value::Sym(name) => name.clone(),
            Value::List(items) => {
                let rendered: Vec<String> = items.iter().map(Value::print).collect();
                format!("({})", rendered.join(" "))
            }
        }
    }

    /// Human rendering: strings unquoted, everything else as [`print`].
    pub fn display(&self) -> String {
        match self {
            Value::Str(text) => text.clone(),
            other => other.print(),
        }
    }
}

/// Evaluation failure. `ex`/`root-ex` type names feed the eval-error
/// response slots; [`Display`](std::fmt::Display) is the diagnostic sent to
/// the error stream.
#[derive(Clone, Debug, Error)]
pub enum EvalError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("unable to resolve symbol: {0}")]
    Undefined(String),
    #[error("arithmetic error: {0}")]
    Arithmetic(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("wrong number of arguments to {0}")]
    Arity(String),
    #[error("io error during evaluation: {0}")]
    Io(String),
    #[error("evaluation interrupted")]
    Interrupted,
    /// Escape hatch for embedded runtimes with their own exception types.
    #[error("{message}")]
    Other {
        ex: String,
        root_ex: String,
        message: String,
    },
}

impl EvalError {
    pub fn ex_name(&self) -> String {
        match self {
            EvalError::Syntax(_) => "SyntaxError".to_string(),
            EvalError::Undefined(_) => "UndefinedSymbol".to_string(),
            EvalError::Arithmetic(_) => "ArithmeticError".to_string(),
            EvalError::Type(_) => "TypeError".to_string(),
            EvalError::Arity(_) => "ArityError".to_string(),
            EvalError::Io(_) => "IoError".to_string(),
            EvalError::Interrupted => "Interrupted".to_string(),
            EvalError::Other { ex, .. } => ex.clone(),
        }
    }

    pub fn root_ex_name(&self) -> String {
        match self {
            EvalError::Other { root_ex, .. } => root_ex.clone(),
            other => other.ex_name(),
        }
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, EvalError::Interrupted)
    }
}

impl From<io::Error> for EvalError {
    fn from(err: io::Error) -> EvalError {
        EvalError::Io(err.to_string())
    }
}

/// Cooperative cancellation signal shared between the interrupt handler and
/// the worker evaluating code.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Poll point: `Err(EvalError::Interrupted)` once cancelled.
    pub fn check(&self) -> Result<(), EvalError> {
        if self.is_cancelled() {
            Err(EvalError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Blocking line source backing `read-line`; `Ok(None)` means the source is
/// closed.
pub trait ReadLine {
    fn read_line(&mut self) -> io::Result<Option<String>>;
}

/// The dynamic context a form is evaluated in. Mutations are merged back
/// into the session snapshot by the evaluator on completion.
pub struct EvalContext<'a> {
    pub ns: &'a mut String,
    pub results: &'a [Option<Value>; 3],
    pub last_error: &'a Option<String>,
    pub vars: &'a mut BTreeMap<String, Value>,
    pub stdout: &'a mut dyn io::Write,
    pub stderr: &'a mut dyn io::Write,
    pub stdin: &'a mut dyn ReadLine,
    pub cancel: &'a CancelToken,
}

/// The embedded language runtime driven by `eval` requests.
pub trait LanguageRuntime: Send + Sync {
    /// Read source text into a sequence of forms.
    fn read_forms(&self, code: &str) -> Result<Vec<Value>, EvalError>;

    /// Evaluate one form against the given dynamic context.
    fn eval(&self, form: &Value, ctx: &mut EvalContext<'_>) -> Result<Value, EvalError>;

    /// Whether the named namespace exists.
    fn ns_exists(&self, ns: &str) -> bool;
}
