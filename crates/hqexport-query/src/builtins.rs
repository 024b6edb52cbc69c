//! Built-in operators and functions.
//!
//! Spellings match what query files actually contain, including the
//! hyphenated names (`str2date`, `selected-at`, `count-selected`).
//! The URL helpers return unevaluated expressions so the calling
//! `Apply` re-evaluates them against the current record (macro
//! expansion).

use crate::env::{BuiltinsFrame, Env};
use crate::error::EvalError;
use crate::ir::Expr;
use crate::value::{BuiltinFn, Value};
use hqexport_types::checkpoint::parse_timestamp;
use serde_json::Value as J;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::rc::Rc;
use uuid::Uuid;

/// Environment frame holding every built-in function.
#[must_use]
pub fn builtins_env() -> Env {
    let mut names: HashMap<String, Value> = HashMap::new();

    for op in ["+", "-", "*", "/", "//"] {
        register(&mut names, op, move |_, args| arith(op, args));
    }
    for op in [">", ">=", "<", "<="] {
        register(&mut names, op, move |_, args| compare(op, args));
    }

    register(&mut names, "len", |_, args| {
        let v = json_arg("len", args, 0)?;
        let n = match &v {
            J::String(s) => s.chars().count(),
            J::Array(a) => a.len(),
            J::Object(o) => o.len(),
            other => {
                return Err(EvalError::Type(format!("len() of non-collection {other}")));
            }
        };
        Ok(Value::Json(J::from(n)))
    });

    register(&mut names, "bool", |_, args| {
        arity("bool", args, 1)?;
        Ok(Value::bool(args[0].truthy()?))
    });

    register(&mut names, "str2bool", |_, args| {
        let v = json_arg("str2bool", args, 0)?;
        let b = match v {
            J::Bool(b) => b,
            J::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "t" | "1"),
            _ => false,
        };
        Ok(Value::bool(b))
    });

    register(&mut names, "str2num", |_, args| {
        let v = json_arg("str2num", args, 0)?;
        match v {
            J::Number(n) => Ok(Value::Json(J::Number(n))),
            J::String(s) => {
                let t = s.trim();
                if let Ok(i) = t.parse::<i64>() {
                    Ok(Value::Json(J::from(i)))
                } else if let Ok(f) = t.parse::<f64>() {
                    Ok(Value::Json(J::from(f)))
                } else {
                    Err(EvalError::Type(format!("str2num: '{s}' is not a number")))
                }
            }
            other => Err(EvalError::Type(format!("str2num of {other}"))),
        }
    });

    register(&mut names, "str2date", |_, args| {
        let v = json_arg("str2date", args, 0)?;
        match v {
            J::Null => Ok(Value::null()),
            J::String(s) => {
                let ts = parse_timestamp(&s)
                    .ok_or_else(|| EvalError::Type(format!("str2date: '{s}' is not a date")))?;
                Ok(Value::string(ts.format("%Y-%m-%dT%H:%M:%S").to_string()))
            }
            other => Err(EvalError::Type(format!("str2date of {other}"))),
        }
    });

    register(&mut names, "bool2int", |_, args| {
        arity("bool2int", args, 1)?;
        Ok(Value::Json(J::from(i64::from(args[0].truthy()?))))
    });

    register(&mut names, "json2str", |_, args| {
        let v = json_arg("json2str", args, 0)?;
        serde_json::to_string(&v)
            .map(Value::string)
            .map_err(|e| EvalError::Type(format!("json2str: {e}")))
    });

    register(&mut names, "format-uuid", |_, args| {
        let v = json_arg("format-uuid", args, 0)?;
        let J::String(s) = v else {
            return Ok(Value::null());
        };
        match Uuid::try_parse(s.trim()) {
            Ok(u) => Ok(Value::string(u.hyphenated().to_string())),
            Err(_) => Ok(Value::null()),
        }
    });

    register(&mut names, "selected", |_, args| {
        let hay = json_arg("selected", args, 0)?;
        let needle = str_arg("selected", args, 1)?;
        let J::String(hay) = hay else {
            return Ok(Value::bool(false));
        };
        Ok(Value::bool(hay.split_whitespace().any(|w| w == needle)))
    });

    register(&mut names, "selected-at", |_, args| {
        let hay = str_arg("selected-at", args, 0)?;
        let idx = int_arg("selected-at", args, 1)?;
        let words: Vec<&str> = hay.split_whitespace().collect();
        let idx = if idx < 0 { idx + words.len() as i64 } else { idx };
        match usize::try_from(idx).ok().and_then(|i| words.get(i)) {
            Some(w) => Ok(Value::string((*w).to_owned())),
            None => Ok(Value::null()),
        }
    });

    register(&mut names, "count-selected", |_, args| {
        let v = json_arg("count-selected", args, 0)?;
        let n = match v {
            J::String(s) => s.split_whitespace().count(),
            _ => 0,
        };
        Ok(Value::Json(J::from(n)))
    });

    register(&mut names, "substr", |_, args| {
        let s = str_arg("substr", args, 0)?;
        let start = int_arg("substr", args, 1)?;
        let end = int_arg("substr", args, 2)?;
        let chars: Vec<char> = s.chars().collect();
        let Ok(start) = usize::try_from(start) else {
            return Ok(Value::null());
        };
        let Ok(end) = usize::try_from(end) else {
            return Ok(Value::null());
        };
        if start > chars.len() {
            return Ok(Value::null());
        }
        let end = end.min(chars.len());
        let slice: String = chars[start..end.max(start)].iter().collect();
        Ok(Value::string(slice))
    });

    register(&mut names, "sha1", |_, args| {
        let v = json_arg("sha1", args, 0)?;
        let text = match v {
            J::String(s) => s,
            other => serde_json::to_string(&other)
                .map_err(|e| EvalError::Type(format!("sha1: {e}")))?,
        };
        let digest = Sha1::digest(text.as_bytes());
        Ok(Value::string(format!("{digest:x}")))
    });

    register(&mut names, "unique", |_, args| {
        let v = json_arg("unique", args, 0)?;
        match v {
            J::Array(items) => {
                let mut out: Vec<J> = Vec::new();
                for item in items {
                    if !out.contains(&item) {
                        out.push(item);
                    }
                }
                Ok(Value::Json(J::Array(out)))
            }
            other => Ok(Value::Json(other)),
        }
    });

    register(&mut names, "join", |_, args| {
        let sep = str_arg("join", args, 0)?;
        let parts: Vec<String> = if args.len() == 2 {
            match json_arg("join", args, 1)? {
                J::Array(items) => items.iter().map(stringify).collect(),
                other => vec![stringify(&other)],
            }
        } else {
            args[1..]
                .iter()
                .map(|a| a.clone().into_json().map(|v| stringify(&v)))
                .collect::<Result<_, _>>()?
        };
        Ok(Value::string(parts.join(&sep)))
    });

    register(&mut names, "default", |_, args| {
        arity("default", args, 2)?;
        let v = args[0].clone().into_json()?;
        let empty = matches!(&v, J::Null) || matches!(&v, J::String(s) if s.is_empty());
        if empty {
            Ok(args[1].clone())
        } else {
            Ok(Value::Json(v))
        }
    });

    register(&mut names, "template", |_, args| {
        let fmt = str_arg("template", args, 0)?;
        let mut out = String::with_capacity(fmt.len());
        let mut rest = fmt.as_str();
        let mut fills = args[1..].iter();
        while let Some(pos) = rest.find("{}") {
            out.push_str(&rest[..pos]);
            match fills.next() {
                Some(v) => out.push_str(&stringify(&v.clone().into_json()?)),
                None => {
                    return Err(EvalError::Type(format!(
                        "template '{fmt}' has more placeholders than arguments"
                    )));
                }
            }
            rest = &rest[pos + 2..];
        }
        out.push_str(rest);
        Ok(Value::string(out))
    });

    register(&mut names, "or", |_, args| {
        for arg in args {
            let v = arg.clone().into_json()?;
            let empty = matches!(&v, J::Null) || matches!(&v, J::String(s) if s.is_empty());
            if !empty {
                return Ok(Value::Json(v));
            }
        }
        Ok(Value::null())
    });

    register(&mut names, "filter_empty", |_, args| {
        let v = json_arg("filter_empty", args, 0)?;
        match v {
            J::Array(items) => {
                let kept: Vec<J> = items
                    .into_iter()
                    .filter(|i| !matches!(i, J::Null) && !matches!(i, J::String(s) if s.is_empty()))
                    .collect();
                Ok(Value::Json(J::Array(kept)))
            }
            other => Ok(Value::Json(other)),
        }
    });

    register(&mut names, "form_url", |_, _args| {
        Ok(url_node("{}/a/{}/reports/form_data/{}/", None))
    });

    register(&mut names, "case_url", |_, _args| {
        Ok(url_node("{}/a/{}/reports/case_data/{}/", None))
    });

    register(&mut names, "attachment_url", |_, args| {
        let name = json_arg("attachment_url", args, 0)?;
        if matches!(name, J::Null) {
            return Ok(Value::null());
        }
        Ok(url_node(
            "{}/a/{}/api/form/attachment/{}/{}",
            Some(Expr::Lit(name)),
        ))
    });

    Env::new(BuiltinsFrame::new(names))
}

fn register(
    names: &mut HashMap<String, Value>,
    name: &str,
    f: impl Fn(&Env, &[Value]) -> Result<Value, EvalError> + 'static,
) {
    let f: BuiltinFn = Rc::new(f);
    names.insert(name.to_owned(), Value::Fn(name.to_owned(), f));
}

/// Build the unevaluated template call the URL helpers expand to.
/// Base URL, project, and document id come from the environment at
/// re-evaluation time.
fn url_node(fmt: &str, extra: Option<Expr>) -> Value {
    let mut args = vec![
        Expr::lit_str(fmt),
        Expr::reference("commcarehq_base_url"),
        Expr::reference("$.domain"),
        Expr::reference("$.id"),
    ];
    if let Some(e) = extra {
        args.push(e);
    }
    Value::Node(Box::new(Expr::Apply {
        func: Box::new(Expr::reference("template")),
        args,
    }))
}

fn arity(name: &str, args: &[Value], n: usize) -> Result<(), EvalError> {
    if args.len() == n {
        Ok(())
    } else {
        Err(EvalError::Type(format!(
            "{name} takes {n} argument(s), got {}",
            args.len()
        )))
    }
}

fn json_arg(name: &str, args: &[Value], i: usize) -> Result<J, EvalError> {
    args.get(i)
        .ok_or_else(|| EvalError::Type(format!("{name}: missing argument {i}")))?
        .clone()
        .into_json()
}

fn str_arg(name: &str, args: &[Value], i: usize) -> Result<String, EvalError> {
    match json_arg(name, args, i)? {
        J::String(s) => Ok(s),
        other => Err(EvalError::Type(format!(
            "{name}: argument {i} must be a string, got {other}"
        ))),
    }
}

fn int_arg(name: &str, args: &[Value], i: usize) -> Result<i64, EvalError> {
    match json_arg(name, args, i)? {
        J::Number(n) => n
            .as_i64()
            .ok_or_else(|| EvalError::Type(format!("{name}: argument {i} must be an integer"))),
        other => Err(EvalError::Type(format!(
            "{name}: argument {i} must be an integer, got {other}"
        ))),
    }
}

fn num(name: &str, v: &J) -> Result<f64, EvalError> {
    match v {
        J::Number(n) => n
            .as_f64()
            .ok_or_else(|| EvalError::Type(format!("{name}: number out of range"))),
        other => Err(EvalError::Type(format!("{name} of non-number {other}"))),
    }
}

fn arith(op: &str, args: &[Value]) -> Result<Value, EvalError> {
    arity(op, args, 2)?;
    let a = args[0].clone().into_json()?;
    let b = args[1].clone().into_json()?;

    if op == "+" {
        if let (J::String(a), J::String(b)) = (&a, &b) {
            return Ok(Value::string(format!("{a}{b}")));
        }
    }

    let (x, y) = (num(op, &a)?, num(op, &b)?);
    let result = match op {
        "+" => J::from(x + y),
        "-" => J::from(x - y),
        "*" => J::from(x * y),
        "/" => {
            if y == 0.0 {
                return Err(EvalError::Type("division by zero".into()));
            }
            J::from(x / y)
        }
        "//" => {
            if y == 0.0 {
                return Err(EvalError::Type("division by zero".into()));
            }
            J::from((x / y).floor() as i64)
        }
        _ => unreachable!("unknown arithmetic operator"),
    };
    Ok(Value::Json(result))
}

fn compare(op: &str, args: &[Value]) -> Result<Value, EvalError> {
    arity(op, args, 2)?;
    let a = args[0].clone().into_json()?;
    let b = args[1].clone().into_json()?;
    let ord = match (&a, &b) {
        (J::Number(_), J::Number(_)) => num(op, &a)?
            .partial_cmp(&num(op, &b)?)
            .ok_or_else(|| EvalError::Type(format!("{op}: values are not comparable")))?,
        (J::String(a), J::String(b)) => a.cmp(b),
        _ => {
            return Err(EvalError::Type(format!(
                "{op}: cannot compare {a} with {b}"
            )));
        }
    };
    let keep = match op {
        ">" => ord.is_gt(),
        ">=" => ord.is_ge(),
        "<" => ord.is_lt(),
        "<=" => ord.is_le(),
        _ => unreachable!("unknown comparison operator"),
    };
    Ok(Value::bool(keep))
}

fn stringify(v: &J) -> String {
    match v {
        J::Null => String::new(),
        J::String(s) => s.clone(),
        other => other.to_string(),
    }
}
