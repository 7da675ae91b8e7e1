//! A small s-expression runtime behind the [`LanguageRuntime`] seam.
//!
//! Enough language to exercise the server end to end: integer arithmetic,
//! string building, standard-stream I/O, `def`-style session bindings,
//! `loop`/`recur` with a cancellation poll per iteration, and `in-ns`. Not a
//! real language; the seam is the product, this is the demonstration.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

use super::{EvalContext, EvalError, LanguageRuntime, Value};

const SLEEP_SLICE: Duration = Duration::from_millis(5);

pub struct SexpRuntime {
    namespaces: Mutex<BTreeSet<String>>,
}

impl Default for SexpRuntime {
    fn default() -> Self {
        let mut namespaces = BTreeSet::new();
        namespaces.insert("user".to_string());
        Self {
            namespaces: Mutex::new(namespaces),
        }
    }
}

impl SexpRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn eval_list(&self, items: &[Value], ctx: &mut EvalContext<'_>) -> Result<Value, EvalError> {
        let Some((head, args)) = items.split_first() else {
            return Ok(Value::List(Vec::new()));
        };
        let Value::Sym(name) = head else {
            return Err(EvalError::Type(format!(
                "cannot apply {}",
                head.print()
            )));
        };
        match name.as_str() {
            "+" | "-" | "*" | "/" => self.eval_arithmetic(name, args, ctx),
            "=" => {
                let values = self.eval_args(args, ctx)?;
                let equal = values.windows(2).all(|pair| pair[0] == pair[1]);
                Ok(Value::Bool(equal))
            }
            "str" => {
                let values = self.eval_args(args, ctx)?;
                let text: String = values.iter().map(Value::display).collect();
                Ok(Value::Str(text))
            }
            "print" | "println" => {
                let values = self.eval_args(args, ctx)?;
                let rendered: Vec<String> = values.iter().map(Value::display).collect();
                let line = rendered.join(" ");
                if name == "println" {
                    writeln!(ctx.stdout, "{line}")?;
                } else {
                    write!(ctx.stdout, "{line}")?;
                }
                Ok(Value::Nil)
            }
            "read-line" => {
                if !args.is_empty() {
                    return Err(EvalError::Arity("read-line".to_string()));
                }
                match ctx.stdin.read_line()? {
                    Some(line) => Ok(Value::Str(line)),
                    None => Ok(Value::Nil),
                }
            }
            "do" => {
                let mut result = Value::Nil;
                for form in args {
                    result = self.eval(form, ctx)?;
                }
                Ok(result)
            }
            "def" => {
                let [Value::Sym(binding), form] = args else {
                    return Err(EvalError::Syntax("def expects a symbol and a form".into()));
                };
                let value = self.eval(form, ctx)?;
                ctx.vars.insert(binding.clone(), value);
                Ok(Value::Sym(binding.clone()))
            }
            "in-ns" => {
                let [form] = args else {
                    return Err(EvalError::Arity("in-ns".to_string()));
                };
                let target = match self.eval(form, ctx)? {
                    Value::Sym(name) | Value::Str(name) => name,
                    other => {
                        return Err(EvalError::Type(format!(
                            "in-ns expects a name, got {}",
                            other.print()
                        )));
                    }
                };
                self.namespaces
                    .lock()
                    .expect("namespace set lock poisoned")
                    .insert(target.clone());
                *ctx.ns = target.clone();
                Ok(Value::Sym(target))
            }
            "quote" => {
                let [form] = args else {
                    return Err(EvalError::Arity("quote".to_string()));
                };
                Ok(form.clone())
            }
            "sleep-ms" => {
                let [form] = args else {
                    return Err(EvalError::Arity("sleep-ms".to_string()));
                };
                let Value::Int(total) = self.eval(form, ctx)? else {
                    return Err(EvalError::Type("sleep-ms expects an integer".into()));
                };
                let mut remaining = Duration::from_millis(total.max(0) as u64);
                while !remaining.is_zero() {
                    ctx.cancel.check()?;
                    let slice = remaining.min(SLEEP_SLICE);
                    std::thread::sleep(slice);
                    remaining -= slice;
                }
                Ok(Value::Nil)
            }
            "loop" => self.eval_loop(args, ctx),
            "recur" => Err(EvalError::Syntax("recur outside loop".into())),
            _ => Err(EvalError::Undefined(name.clone())),
        }
    }

    fn eval_loop(&self, args: &[Value], ctx: &mut EvalContext<'_>) -> Result<Value, EvalError> {
        let Some((bindings, body)) = args.split_first() else {
            return Err(EvalError::Syntax("loop expects a binding vector".into()));
        };
        match bindings {
            Value::List(items) if items.is_empty() => {}
            _ => {
                return Err(EvalError::Syntax(
                    "loop bindings are not supported; use (loop [] ...)".into(),
                ));
            }
        }
        loop {
            ctx.cancel.check()?;
            let mut result = Value::Nil;
            let mut recurred = false;
            for form in body {
                if is_recur(form) {
                    recurred = true;
                    break;
                }
                result = self.eval(form, ctx)?;
            }
            if !recurred {
                return Ok(result);
            }
        }
    }

    fn eval_arithmetic(
        &self,
        op: &str,
        args: &[Value],
        ctx: &mut EvalContext<'_>,
    ) -> Result<Value, EvalError> {
        let mut operands = Vec::with_capacity(args.len());
        for form in args {
            match self.eval(form, ctx)? {
                Value::Int(n) => operands.push(n),
                other => {
                    return Err(EvalError::Type(format!(
                        "{op} expects integers, got {}",
                        other.print()
                    )));
                }
            }
        }
        let overflow = || EvalError::Arithmetic("integer overflow".to_string());
        let result = match op {
            "+" => operands
                .iter()
                .try_fold(0i64, |acc, n| acc.checked_add(*n))
                .ok_or_else(overflow)?,
            "*" => operands
                .iter()
                .try_fold(1i64, |acc, n| acc.checked_mul(*n))
                .ok_or_else(overflow)?,
            "-" => match operands.split_first() {
                None => return Err(EvalError::Arity("-".to_string())),
                Some((first, [])) => first.checked_neg().ok_or_else(overflow)?,
                Some((first, rest)) => rest
                    .iter()
                    .try_fold(*first, |acc, n| acc.checked_sub(*n))
                    .ok_or_else(overflow)?,
            },
            "/" => match operands.split_first() {
                None | Some((_, [])) => return Err(EvalError::Arity("/".to_string())),
                Some((first, rest)) => {
                    let mut acc = *first;
                    for n in rest {
                        if *n == 0 {
                            return Err(EvalError::Arithmetic("divide by zero".to_string()));
                        }
                        acc = acc.checked_div(*n).ok_or_else(overflow)?;
                    }
                    acc
                }
            },
            _ => unreachable!("dispatched on arithmetic ops only"),
        };
        Ok(Value::Int(result))
    }

    fn eval_args(
        &self,
        args: &[Value],
        ctx: &mut EvalContext<'_>,
    ) -> Result<Vec<Value>, EvalError> {
        args.iter().map(|form| self.eval(form, ctx)).collect()
    }
}

fn is_recur(form: &Value) -> bool {
    matches!(form, Value::List(items)
        if matches!(items.first(), Some(Value::Sym(name)) if name == "recur"))
}

impl LanguageRuntime for SexpRuntime {
    fn read_forms(&self, code: &str) -> Result<Vec<Value>, EvalError> {
        Reader::new(code).read_all()
    }

    fn eval(&self, form: &Value, ctx: &mut EvalContext<'_>) -> Result<Value, EvalError> {
        ctx.cancel.check()?;
        match form {
            Value::Nil | Value::Bool(_) | Value::Int(_) | Value::Str(_) => Ok(form.clone()),
            Value::Sym(name) => match name.as_str() {
                "*1" => Ok(ctx.results[0].clone().unwrap_or(Value::Nil)),
                "*2" => Ok(ctx.results[1].clone().unwrap_or(Value::Nil)),
                "*3" => Ok(ctx.results[2].clone().unwrap_or(Value::Nil)),
                "*e" => Ok(ctx
                    .last_error
                    .clone()
                    .map(Value::Str)
                    .unwrap_or(Value::Nil)),
                _ => ctx
                    .vars
                    .get(name)
                    .cloned()
                    .ok_or_else(|| EvalError::Undefined(name.clone())),
            },
            Value::List(items) => self.eval_list(items, ctx),
        }
    }

    fn ns_exists(&self, ns: &str) -> bool {
        self.namespaces
            .lock()
            .expect("namespace set lock poisoned")
            .contains(ns)
    }
}

/// Recursive-descent reader for the s-expression surface syntax.
struct Reader<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Reader<'a> {
    fn new(code: &'a str) -> Self {
        Self {
            chars: code.chars().peekable(),
        }
    }

    fn read_all(mut self) -> Result<Vec<Value>, EvalError> {
        let mut forms = Vec::new();
        loop {
            self.skip_whitespace();
            if self.chars.peek().is_none() {
                return Ok(forms);
            }
            forms.push(self.read_form()?);
        }
    }

    fn read_form(&mut self) -> Result<Value, EvalError> {
        self.skip_whitespace();
        match self.chars.peek() {
            None => Err(EvalError::Syntax("unexpected end of input".into())),
            Some('(') => self.read_list(')'),
            Some('[') => self.read_list(']'),
            Some(')') | Some(']') => Err(EvalError::Syntax("unmatched closing delimiter".into())),
            Some('"') => self.read_string(),
            Some(_) => self.read_atom(),
        }
    }

    fn read_list(&mut self, close: char) -> Result<Value, EvalError> {
        self.chars.next();
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.chars.peek() {
                None => {
                    return Err(EvalError::Syntax(format!("expected '{close}'")));
                }
                Some(ch) if *ch == close => {
                    self.chars.next();
                    return Ok(Value::List(items));
                }
                Some(_) => items.push(self.read_form()?),
            }
        }
    }

    fn read_string(&mut self) -> Result<Value, EvalError> {
        self.chars.next();
        let mut text = String::new();
        loop {
            match self.chars.next() {
                None => return Err(EvalError::Syntax("unterminated string".into())),
                Some('"') => return Ok(Value::Str(text)),
                Some('\\') => match self.chars.next() {
                    Some('"') => text.push('"'),
                    Some('\\') => text.push('\\'),
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    other => {
                        return Err(EvalError::Syntax(format!(
                            "unknown escape: \\{}",
                            other.map(String::from).unwrap_or_default()
                        )));
                    }
                },
                Some(ch) => text.push(ch),
            }
        }
    }

    fn read_atom(&mut self) -> Result<Value, EvalError> {
        let mut atom = String::new();
        while let Some(ch) = self.chars.peek() {
            if ch.is_whitespace() || matches!(ch, '(' | ')' | '[' | ']' | '"' | ',') {
                break;
            }
            atom.push(*ch);
            self.chars.next();
        }
        debug_assert!(!atom.is_empty(), "read_atom called at a delimiter");
        match atom.as_str() {
            "nil" => Ok(Value::Nil),
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => {
                let numeric = atom.strip_prefix('-').unwrap_or(&atom);
                if !numeric.is_empty() && numeric.chars().all(|ch| ch.is_ascii_digit()) {
                    atom.parse::<i64>()
                        .map(Value::Int)
                        .map_err(|_| EvalError::Syntax(format!("integer out of range: {atom}")))
                } else {
                    Ok(Value::Sym(atom))
                }
            }
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.chars.peek() {
            if ch.is_whitespace() || *ch == ',' {
                self.chars.next();
            } else {
                break;
            }
        }
    }
}
