//! Path expressions over JSON records.
//!
//! Supports the subset query files actually use: `$`, dotted child
//! steps, `..name` descendant search, `[n]` indexing, and `*` / `[*]`
//! wildcards. Parsed paths are interned in a thread-local cache since
//! the same handful of paths is looked up once per record.

use crate::error::EvalError;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Root,
    Child(String),
    Descendant(String),
    Index(usize),
    Wildcard,
}

/// A parsed path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    segments: Vec<Segment>,
}

/// One match: the value found and its dotted location relative to the
/// root, e.g. `form.repeat[1].name`.
#[derive(Debug, Clone, PartialEq)]
pub struct PathMatch {
    pub value: serde_json::Value,
    pub path: String,
}

thread_local! {
    static PARSE_CACHE: RefCell<HashMap<String, Rc<JsonPath>>> = RefCell::new(HashMap::new());
}

/// Parse a path, consulting the cache first.
pub fn parse_cached(src: &str) -> Result<Rc<JsonPath>, EvalError> {
    if let Some(hit) = PARSE_CACHE.with(|c| c.borrow().get(src).cloned()) {
        return Ok(hit);
    }
    let parsed = Rc::new(JsonPath::parse(src)?);
    PARSE_CACHE.with(|c| {
        c.borrow_mut().insert(src.to_owned(), parsed.clone());
    });
    Ok(parsed)
}

impl JsonPath {
    pub fn parse(src: &str) -> Result<Self, EvalError> {
        let bad = |detail: &str| EvalError::BadPath {
            path: src.to_owned(),
            detail: detail.to_owned(),
        };
        let src_t = src.trim();
        if src_t.is_empty() {
            return Err(bad("empty path"));
        }

        let mut segments = Vec::new();
        let chars: Vec<char> = src_t.chars().collect();
        let mut i = 0;

        if chars[i] == '$' {
            segments.push(Segment::Root);
            i += 1;
        }

        while i < chars.len() {
            match chars[i] {
                '.' => {
                    if i + 1 < chars.len() && chars[i + 1] == '.' {
                        i += 2;
                        let name = read_name(&chars, &mut i);
                        if name.is_empty() {
                            return Err(bad("'..' must be followed by a name"));
                        }
                        segments.push(Segment::Descendant(name));
                    } else {
                        i += 1;
                        if i < chars.len() && chars[i] == '*' {
                            segments.push(Segment::Wildcard);
                            i += 1;
                        } else {
                            let name = read_name(&chars, &mut i);
                            if name.is_empty() {
                                return Err(bad("'.' must be followed by a name"));
                            }
                            segments.push(Segment::Child(name));
                        }
                    }
                }
                '[' => {
                    i += 1;
                    let start = i;
                    while i < chars.len() && chars[i] != ']' {
                        i += 1;
                    }
                    if i == chars.len() {
                        return Err(bad("unterminated '['"));
                    }
                    let inner: String = chars[start..i].iter().collect();
                    i += 1;
                    if inner.trim() == "*" {
                        segments.push(Segment::Wildcard);
                    } else {
                        let idx: usize = inner
                            .trim()
                            .parse()
                            .map_err(|_| bad("index must be a non-negative integer or '*'"))?;
                        segments.push(Segment::Index(idx));
                    }
                }
                '*' if segments.is_empty() => {
                    segments.push(Segment::Wildcard);
                    i += 1;
                }
                _ => {
                    if !segments.is_empty() {
                        return Err(bad("expected '.', '[', or end of path"));
                    }
                    let name = read_name(&chars, &mut i);
                    segments.push(Segment::Child(name));
                }
            }
        }

        if segments.is_empty() {
            return Err(bad("path has no segments"));
        }
        Ok(Self { segments })
    }

    /// `true` if the path begins at the document root (`$`).
    #[must_use]
    pub fn starts_at_root(&self) -> bool {
        matches!(self.segments.first(), Some(Segment::Root))
    }

    /// Leftmost child name, for root-only restriction checks.
    #[must_use]
    pub fn first_child_name(&self) -> Option<&str> {
        match self.segments.first() {
            Some(Segment::Child(n)) => Some(n),
            _ => None,
        }
    }

    /// Find every match of this path in `root`, in document order.
    #[must_use]
    pub fn find(&self, root: &serde_json::Value) -> Vec<PathMatch> {
        let mut current = vec![PathMatch {
            value: root.clone(),
            path: String::new(),
        }];
        for segment in &self.segments {
            let mut next = Vec::new();
            match segment {
                Segment::Root => {
                    next.push(PathMatch {
                        value: root.clone(),
                        path: String::new(),
                    });
                }
                Segment::Child(name) => {
                    for m in &current {
                        if let serde_json::Value::Object(obj) = &m.value {
                            if let Some(v) = obj.get(name) {
                                next.push(PathMatch {
                                    value: v.clone(),
                                    path: join_path(&m.path, name),
                                });
                            }
                        }
                    }
                }
                Segment::Index(idx) => {
                    for m in &current {
                        if let serde_json::Value::Array(items) = &m.value {
                            if let Some(v) = items.get(*idx) {
                                next.push(PathMatch {
                                    value: v.clone(),
                                    path: format!("{}[{idx}]", m.path),
                                });
                            }
                        }
                    }
                }
                Segment::Wildcard => {
                    for m in &current {
                        match &m.value {
                            serde_json::Value::Object(obj) => {
                                for (k, v) in obj {
                                    next.push(PathMatch {
                                        value: v.clone(),
                                        path: join_path(&m.path, k),
                                    });
                                }
                            }
                            serde_json::Value::Array(items) => {
                                for (i, v) in items.iter().enumerate() {
                                    next.push(PathMatch {
                                        value: v.clone(),
                                        path: format!("{}[{i}]", m.path),
                                    });
                                }
                            }
                            _ => {}
                        }
                    }
                }
                Segment::Descendant(name) => {
                    for m in &current {
                        descend(&m.value, &m.path, name, &mut next);
                    }
                }
            }
            current = next;
            if current.is_empty() {
                break;
            }
        }
        current
    }
}

fn read_name(chars: &[char], i: &mut usize) -> String {
    let start = *i;
    while *i < chars.len() && chars[*i] != '.' && chars[*i] != '[' {
        *i += 1;
    }
    chars[start..*i].iter().collect()
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}.{name}")
    }
}

fn descend(value: &serde_json::Value, path: &str, name: &str, out: &mut Vec<PathMatch>) {
    match value {
        serde_json::Value::Object(obj) => {
            for (k, v) in obj {
                let child_path = join_path(path, k);
                if k == name {
                    out.push(PathMatch {
                        value: v.clone(),
                        path: child_path.clone(),
                    });
                }
                descend(v, &child_path, name, out);
            }
        }
        serde_json::Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                descend(v, &format!("{path}[{i}]"), name, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(path: &str, doc: serde_json::Value) -> Vec<serde_json::Value> {
        JsonPath::parse(path)
            .unwrap()
            .find(&doc)
            .into_iter()
            .map(|m| m.value)
            .collect()
    }

    #[test]
    fn root_and_child() {
        let doc = json!({"form": {"name": "intake"}});
        assert_eq!(values("$", doc.clone()), vec![doc.clone()]);
        assert_eq!(values("$.form.name", doc.clone()), vec![json!("intake")]);
        assert_eq!(values("form.name", doc), vec![json!("intake")]);
    }

    #[test]
    fn missing_child_is_no_match() {
        assert!(values("form.age", json!({"form": {"name": "x"}})).is_empty());
    }

    #[test]
    fn index_and_wildcard() {
        let doc = json!({"repeat": [{"n": 1}, {"n": 2}]});
        assert_eq!(values("repeat[1].n", doc.clone()), vec![json!(2)]);
        assert_eq!(
            values("repeat[*].n", doc),
            vec![json!(1), json!(2)]
        );
    }

    #[test]
    fn descendant_search() {
        let doc = json!({"form": {"a": {"q": 1}, "b": [{"q": 2}]}});
        assert_eq!(values("form..q", doc), vec![json!(1), json!(2)]);
    }

    #[test]
    fn at_prefixed_names_are_plain_names() {
        let doc = json!({"case": {"@case_id": "abc"}});
        assert_eq!(values("case.@case_id", doc), vec![json!("abc")]);
    }

    #[test]
    fn match_paths_are_relative() {
        let doc = json!({"form": {"repeat": [{"n": 1}]}});
        let matches = JsonPath::parse("form.repeat[*]").unwrap().find(&doc);
        assert_eq!(matches[0].path, "form.repeat[0]");
    }

    #[test]
    fn parse_errors() {
        assert!(JsonPath::parse("").is_err());
        assert!(JsonPath::parse("a[").is_err());
        assert!(JsonPath::parse("a[x]").is_err());
        assert!(JsonPath::parse("a.").is_err());
    }

    #[test]
    fn cache_returns_same_parse() {
        let a = parse_cached("form.name").unwrap();
        let b = parse_cached("form.name").unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }
}
