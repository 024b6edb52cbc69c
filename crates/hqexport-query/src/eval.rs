//! Expression evaluation.
//!
//! Map, FlatMap, and Filter return restartable sequences and never
//! touch their source during construction; pulling K items from the
//! result pulls at most K items from the source.

use crate::env::Env;
use crate::error::EvalError;
use crate::ir::{Expr, RefTarget};
use crate::value::{unwrap_value, value_into_iter, RestartableSeq, SeqIter, Value};
use hqexport_types::sqltype::SqlType;
use hqexport_types::table::{Row, TableRows, TableSpec};
use serde_json::Value as J;

/// Evaluate an expression under an environment.
pub fn eval(expr: &Expr, env: &Env) -> Result<Value, EvalError> {
    match expr {
        Expr::Lit(v) => Ok(Value::Json(v.clone())),

        Expr::Ref(RefTarget::Name(name)) => env.lookup(name),
        Expr::Ref(RefTarget::Expr(inner)) => {
            let target = unwrap_value(eval(inner, env)?)?.into_json()?;
            match target {
                J::String(name) => env.lookup(&name),
                other => Err(EvalError::Type(format!(
                    "reference target must be a name, got {other}"
                ))),
            }
        }

        Expr::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval(item, env)?);
            }
            // Lists stay lists: a one-element list must not collapse
            // the way a one-match path lookup does.
            let mut json_items = Vec::with_capacity(values.len());
            for v in values {
                json_items.push(v.into_json()?);
            }
            Ok(Value::Json(J::Array(json_items)))
        }

        Expr::Apply { func, args } => eval_apply(expr, func, args, env),

        Expr::Map { source, body, name } => Ok(Value::Seq(lazy_loop(
            env,
            source,
            body,
            name.as_deref(),
            LoopKind::Map,
        ))),
        Expr::FlatMap { source, body, name } => Ok(Value::Seq(lazy_loop(
            env,
            source,
            body,
            name.as_deref(),
            LoopKind::FlatMap,
        ))),
        Expr::Filter {
            source,
            predicate,
            name,
        } => Ok(Value::Seq(lazy_loop(
            env,
            source,
            predicate,
            name.as_deref(),
            LoopKind::Filter,
        ))),

        Expr::Bind { name, value, body } => {
            let bound = eval(value, env)?;
            let child = env.bind(name, bound)?;
            eval(body, &child)
        }

        Expr::Emit {
            table,
            headings,
            source,
            missing_value,
            data_types,
        } => eval_emit(env, table, headings, source, missing_value.as_deref(), data_types),
    }
}

fn eval_apply(
    whole: &Expr,
    func: &Expr,
    args: &[Expr],
    env: &Env,
) -> Result<Value, EvalError> {
    let callee = unwrap_value(eval(func, env)?)?;
    let Value::Fn(_, f) = callee else {
        return Err(EvalError::NotCallable(callee.render()));
    };

    let mut arg_values = Vec::with_capacity(args.len());
    for arg in args {
        arg_values.push(unwrap_value(eval(arg, env)?)?);
    }

    let result = f(env, &arg_values).map_err(|e| decorate(whole, env, e))?;
    match result {
        // Macro expansion: helpers may return an expression to
        // evaluate against the current record.
        Value::Node(node) => eval(&node, env).map_err(|e| decorate(whole, env, e)),
        other => Ok(other),
    }
}

/// Attach the failing expression and document id to an `Apply` error.
fn decorate(expr: &Expr, env: &Env, err: EvalError) -> EvalError {
    if matches!(err, EvalError::InExpr { .. }) {
        return err;
    }
    let doc_id = env
        .lookup("id")
        .ok()
        .and_then(|v| unwrap_value(v).ok())
        .and_then(|v| v.into_json().ok())
        .map_or_else(|| "???".to_owned(), |v| stringify_scalar(&v));
    EvalError::InExpr {
        expr: expr.to_string(),
        doc_id,
        source: Box::new(err),
    }
}

#[derive(Clone, Copy)]
enum LoopKind {
    Map,
    FlatMap,
    Filter,
}

fn lazy_loop(
    env: &Env,
    source: &Expr,
    body: &Expr,
    name: Option<&str>,
    kind: LoopKind,
) -> RestartableSeq {
    let env = env.clone();
    let source = source.clone();
    let body = body.clone();
    let name = name.map(ToOwned::to_owned);
    RestartableSeq::new(move || {
        let items = match eval(&source, &env) {
            Ok(v) => value_into_iter(v),
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        let env = env.clone();
        let body = body.clone();
        let name = name.clone();
        match kind {
            LoopKind::Map => Box::new(items.map(move |item| {
                let child = item_env(&env, name.as_deref(), item?)?;
                eval(&body, &child.1)
            })),
            LoopKind::FlatMap => Box::new(items.flat_map(move |item| -> SeqIter {
                let result = item
                    .and_then(|item| item_env(&env, name.as_deref(), item))
                    .and_then(|(_, child)| eval(&body, &child));
                match result {
                    Ok(v) => value_into_iter(v),
                    Err(e) => Box::new(std::iter::once(Err(e))),
                }
            })),
            LoopKind::Filter => Box::new(items.filter_map(move |item| {
                let result = item.and_then(|item| {
                    let (item, child) = item_env(&env, name.as_deref(), item)?;
                    let keep = eval(&body, &child)?.truthy()?;
                    Ok((item, keep))
                });
                match result {
                    Ok((item, true)) => Some(Ok(item)),
                    Ok((_, false)) => None,
                    Err(e) => Some(Err(e)),
                }
            })),
        }
    })
}

/// Environment for one loop item: named binding when a name is given,
/// otherwise the item replaces the path-lookup root.
fn item_env(env: &Env, name: Option<&str>, item: Value) -> Result<(Value, Env), EvalError> {
    match name {
        Some(n) => {
            let child = env.bind(n, item.clone())?;
            Ok((item, child))
        }
        None => {
            let json = item.clone().into_json()?;
            let child = env.replace(json)?;
            Ok((item, child))
        }
    }
}

fn eval_emit(
    env: &Env,
    table: &str,
    headings: &[Expr],
    source: &Expr,
    missing_value: Option<&str>,
    data_types: &[Expr],
) -> Result<Value, EvalError> {
    let mut heading_names = Vec::with_capacity(headings.len());
    for h in headings {
        let v = unwrap_value(eval(h, env)?)?.into_json()?;
        heading_names.push(stringify_scalar(&v));
    }

    let mut types = Vec::with_capacity(data_types.len());
    for dt in data_types {
        let v = unwrap_value(eval(dt, env)?)?.into_json()?;
        let J::String(name) = v else {
            return Err(EvalError::Parse(format!(
                "data type must be a string, got {v}"
            )));
        };
        let t = SqlType::parse(&name)
            .ok_or_else(|| EvalError::Parse(format!("unknown data type '{name}'")))?;
        types.push(t);
    }

    let row_env = env.clone();
    let row_source = source.clone();
    let missing = missing_value.map(ToOwned::to_owned);
    let rows = TableRows::new(move || {
        let items = match eval(&row_source, &row_env) {
            Ok(v) => value_into_iter(v),
            Err(e) => {
                return Box::new(std::iter::once(Err(anyhow::Error::new(e))));
            }
        };
        let missing = missing.clone();
        Box::new(items.map(move |item| match item {
            Ok(item) => coerce_row(item, missing.as_deref()).map_err(anyhow::Error::new),
            Err(e) => Err(anyhow::Error::new(e)),
        }))
    });

    let spec = TableSpec {
        name: table.to_owned(),
        headings: heading_names,
        data_types: types,
        rows,
    };
    env.emit_table(&spec)?;
    Ok(Value::null())
}

/// Split one source item into cells.
fn coerce_row(item: Value, missing: Option<&str>) -> Result<Row, EvalError> {
    let cells: Vec<Value> = match item {
        Value::Seq(seq) => seq.materialize()?,
        Value::Json(J::Array(items)) => items.into_iter().map(Value::Json).collect(),
        other => vec![other],
    };
    Ok(cells.into_iter().map(|c| coerce_cell(c, missing)).collect())
}

/// Coerce one cell. Never fails: coercion problems degrade to an
/// empty string and a warning, so one bad cell does not abort a
/// multi-hour pull.
fn coerce_cell(cell: Value, missing: Option<&str>) -> J {
    let missing_cell = || missing.map_or(J::Null, |m| J::String(m.to_owned()));
    match cell {
        Value::Seq(seq) => match seq.materialize() {
            Ok(items) => coerce_cell_list(items, missing),
            Err(e) => {
                tracing::warn!(error = %e, "cell coercion failed, writing empty string");
                J::String(String::new())
            }
        },
        Value::Json(J::Array(items)) => {
            coerce_cell_list(items.into_iter().map(Value::Json).collect(), missing)
        }
        Value::Json(J::Null) => missing_cell(),
        Value::Json(v) => v,
        other => {
            tracing::warn!(value = %other.render(), "cannot coerce value to a cell");
            J::String(String::new())
        }
    }
}

fn coerce_cell_list(items: Vec<Value>, missing: Option<&str>) -> J {
    match items.len() {
        0 => missing.map_or(J::Null, |m| J::String(m.to_owned())),
        1 => coerce_cell(items.into_iter().next().expect("length checked"), missing),
        _ => {
            let parts: Vec<String> = items
                .into_iter()
                .map(|i| stringify_scalar(&coerce_cell(i, missing)))
                .collect();
            J::String(parts.join(", "))
        }
    }
}

fn stringify_scalar(v: &J) -> String {
    match v {
        J::Null => String::new(),
        J::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::builtins_env;
    use crate::emitter::EmitterFrame;
    use crate::env::{DictFrame, JsonPathFrame};
    use crate::ir::parse_query;
    use hqexport_types::writer::{TableWriter, WriterError};
    use serde_json::json;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[derive(Default)]
    struct CapturingWriter {
        tables: Vec<(String, Vec<String>, Vec<Row>)>,
    }

    impl TableWriter for CapturingWriter {
        fn write_table(&mut self, table: &TableSpec) -> Result<(), WriterError> {
            let rows = table.rows.collect().map_err(WriterError::Other)?;
            self.tables
                .push((table.name.clone(), table.headings.clone(), rows));
            Ok(())
        }
    }

    fn record_env(record: serde_json::Value) -> (Env, Rc<RefCell<CapturingWriter>>) {
        let writer = Rc::new(RefCell::new(CapturingWriter::default()));
        let sink: Rc<RefCell<dyn TableWriter>> = writer.clone();
        let env = builtins_env()
            .or_else(Env::new(DictFrame::empty()))
            .or_else(Env::new(EmitterFrame::new(sink)))
            .or_else(Env::new(JsonPathFrame::new(record)));
        (env, writer)
    }

    fn eval_json(expr: &Expr, env: &Env) -> serde_json::Value {
        unwrap_value(eval(expr, env).unwrap())
            .unwrap()
            .into_json()
            .unwrap()
    }

    #[test]
    fn literals_and_refs() {
        let (env, _) = record_env(json!({"form": {"name": "intake"}}));
        assert_eq!(eval_json(&Expr::Lit(json!(5)), &env), json!(5));
        assert_eq!(
            eval_json(&Expr::reference("form.name"), &env),
            json!("intake")
        );
    }

    #[test]
    fn reference_through_expression() {
        let (env, _) = record_env(json!({"x": 9}));
        let expr = Expr::Ref(RefTarget::Expr(Box::new(Expr::lit_str("x"))));
        assert_eq!(eval_json(&expr, &env), json!(9));
    }

    #[test]
    fn one_element_list_stays_a_list() {
        let (env, _) = record_env(json!({}));
        let expr = Expr::List(vec![Expr::Lit(json!("only"))]);
        assert_eq!(eval_json(&expr, &env), json!(["only"]));
    }

    #[test]
    fn apply_unwraps_path_lookup_args() {
        let (env, _) = record_env(json!({"form": {"val": "3"}}));
        let expr = Expr::Apply {
            func: Box::new(Expr::reference("str2num")),
            args: vec![Expr::reference("form.val")],
        };
        assert_eq!(eval_json(&expr, &env), json!(3));
    }

    #[test]
    fn apply_errors_carry_doc_id_and_expression() {
        let (env, _) = record_env(json!({"id": "doc7", "form": {"val": "oops"}}));
        let expr = Expr::Apply {
            func: Box::new(Expr::reference("str2num")),
            args: vec![Expr::reference("form.val")],
        };
        match eval(&expr, &env) {
            Err(EvalError::InExpr { expr, doc_id, .. }) => {
                assert_eq!(doc_id, "doc7");
                assert!(expr.contains("str2num"));
            }
            other => panic!("expected decorated error, got {other:?}"),
        }
    }

    #[test]
    fn map_replaces_root_without_name() {
        let (env, _) = record_env(json!({}));
        let expr = Expr::Map {
            source: Box::new(Expr::Lit(json!([{"n": 1}, {"n": 2}]))),
            body: Box::new(Expr::reference("n")),
            name: None,
        };
        assert_eq!(eval_json(&expr, &env), json!([1, 2]));
    }

    #[test]
    fn map_binds_name_when_given() {
        let (env, _) = record_env(json!({}));
        let expr = Expr::Map {
            source: Box::new(Expr::Lit(json!([1, 2]))),
            body: Box::new(Expr::Apply {
                func: Box::new(Expr::reference("+")),
                args: vec![Expr::reference("item"), Expr::Lit(json!(10))],
            }),
            name: Some("item".into()),
        };
        // named binding lands in the dict frame; path root is untouched
        assert_eq!(eval_json(&expr, &env), json!([11.0, 12.0]));
    }

    #[test]
    fn flatmap_flattens_one_level() {
        let (env, _) = record_env(json!({}));
        let expr = Expr::FlatMap {
            source: Box::new(Expr::Lit(json!([{"xs": [1, 2]}, {"xs": [3]}]))),
            body: Box::new(Expr::reference("xs[*]")),
            name: None,
        };
        assert_eq!(eval_json(&expr, &env), json!([1, 2, 3]));
    }

    #[test]
    fn filter_keeps_truthy() {
        let (env, _) = record_env(json!({}));
        let expr = Expr::Filter {
            source: Box::new(Expr::Lit(json!([{"keep": true}, {"keep": false}, {"keep": true}]))),
            predicate: Box::new(Expr::reference("keep")),
            name: None,
        };
        let out = eval_json(&expr, &env);
        assert_eq!(out.as_array().unwrap().len(), 2);
    }

    #[test]
    fn map_pulls_no_more_than_consumed() {
        let pulls = Rc::new(Cell::new(0));
        let counter = pulls.clone();
        let source = Value::Seq(RestartableSeq::new(move || {
            let counter = counter.clone();
            Box::new((0..100).map(move |n| {
                counter.set(counter.get() + 1);
                Ok(Value::Json(json!({"n": n})))
            }))
        }));
        let (env, _) = record_env(json!({}));
        let env = env.bind("src", source).unwrap();
        let expr = Expr::Map {
            source: Box::new(Expr::reference("src")),
            body: Box::new(Expr::reference("n")),
            name: None,
        };
        let Value::Seq(seq) = eval(&expr, &env).unwrap() else {
            panic!("map must return a sequence");
        };
        let first_two: Vec<_> = seq.iter().take(2).collect();
        assert_eq!(first_two.len(), 2);
        assert!(pulls.get() <= 3, "pulled {} items for 2 consumed", pulls.get());
    }

    #[test]
    fn failure_past_consumption_point_is_not_raised() {
        let source = Value::Seq(RestartableSeq::new(|| {
            Box::new((0..10).map(|n| {
                if n < 3 {
                    Ok(Value::Json(json!({"n": n})))
                } else {
                    Err(EvalError::External("boom".into()))
                }
            }))
        }));
        let (env, _) = record_env(json!({}));
        let env = env.bind("src", source).unwrap();
        let expr = Expr::Map {
            source: Box::new(Expr::reference("src")),
            body: Box::new(Expr::reference("n")),
            name: None,
        };
        let Value::Seq(seq) = eval(&expr, &env).unwrap() else {
            panic!("map must return a sequence");
        };
        assert!(seq.iter().take(3).all(|r| r.is_ok()));
    }

    #[test]
    fn emit_hands_rows_to_the_writer() {
        let (env, writer) = record_env(json!({}));
        let expr = Expr::Emit {
            table: "t".into(),
            headings: vec![Expr::lit_str("foo")],
            source: Box::new(Expr::Map {
                source: Box::new(Expr::Lit(json!([{"foo": 1}, {"foo": 2}]))),
                body: Box::new(Expr::reference("foo")),
                name: None,
            }),
            missing_value: None,
            data_types: vec![],
        };
        eval(&expr, &env).unwrap();
        let tables = &writer.borrow().tables;
        assert_eq!(tables.len(), 1);
        let (name, headings, rows) = &tables[0];
        assert_eq!(name, "t");
        assert_eq!(headings, &vec!["foo".to_owned()]);
        assert_eq!(rows, &vec![vec![json!(1)], vec![json!(2)]]);
    }

    #[test]
    fn emit_missing_value_fills_empty_lookups() {
        let (env, writer) = record_env(json!({}));
        let expr = Expr::Emit {
            table: "t".into(),
            headings: vec![Expr::lit_str("a"), Expr::lit_str("b")],
            source: Box::new(Expr::Map {
                source: Box::new(Expr::Lit(json!([{"a": "x"}]))),
                body: Box::new(Expr::List(vec![
                    Expr::reference("a"),
                    Expr::reference("b"),
                ])),
                name: None,
            }),
            missing_value: Some("---".into()),
            data_types: vec![],
        };
        eval(&expr, &env).unwrap();
        let rows = &writer.borrow().tables[0].2;
        assert_eq!(rows, &vec![vec![json!("x"), json!("---")]]);
    }

    #[test]
    fn emit_joins_list_cells() {
        let (env, writer) = record_env(json!({}));
        let expr = Expr::Emit {
            table: "t".into(),
            headings: vec![Expr::lit_str("tags")],
            source: Box::new(Expr::Map {
                source: Box::new(Expr::Lit(json!([{"tags": ["a", "b", "c"]}]))),
                body: Box::new(Expr::List(vec![Expr::reference("tags")])),
                name: None,
            }),
            missing_value: None,
            data_types: vec![],
        };
        eval(&expr, &env).unwrap();
        let rows = &writer.borrow().tables[0].2;
        assert_eq!(rows, &vec![vec![json!("a, b, c")]]);
    }

    #[test]
    fn emit_rejects_unknown_data_type() {
        let (env, _) = record_env(json!({}));
        let expr = Expr::Emit {
            table: "t".into(),
            headings: vec![Expr::lit_str("a")],
            source: Box::new(Expr::Lit(json!([]))),
            missing_value: None,
            data_types: vec![Expr::lit_str("varchar")],
        };
        assert!(matches!(eval(&expr, &env), Err(EvalError::Parse(_))));
    }

    #[test]
    fn form_url_macro_expands_against_the_record() {
        let (env, _) = record_env(json!({"domain": "d", "id": "42"}));
        let env = env
            .bind("commcarehq_base_url", Value::string("https://x"))
            .unwrap();
        let expr = Expr::Apply {
            func: Box::new(Expr::reference("form_url")),
            args: vec![],
        };
        assert_eq!(
            eval_json(&expr, &env),
            json!("https://x/a/d/reports/form_data/42/")
        );
    }

    #[test]
    fn case_url_and_attachment_url_expand() {
        let (env, _) = record_env(json!({"domain": "d", "id": "7"}));
        let env = env
            .bind("commcarehq_base_url", Value::string("https://x"))
            .unwrap();
        let case = Expr::Apply {
            func: Box::new(Expr::reference("case_url")),
            args: vec![],
        };
        assert_eq!(eval_json(&case, &env), json!("https://x/a/d/reports/case_data/7/"));

        let attachment = Expr::Apply {
            func: Box::new(Expr::reference("attachment_url")),
            args: vec![Expr::lit_str("photo.jpg")],
        };
        assert_eq!(
            eval_json(&attachment, &env),
            json!("https://x/a/d/api/form/attachment/7/photo.jpg")
        );
    }

    #[test]
    fn parsed_query_evaluates_end_to_end() {
        let (env, writer) = record_env(json!({}));
        let src = Value::Seq(RestartableSeq::from_values(vec![
            Value::Json(json!({"id": 1, "foo": 1})),
            Value::Json(json!({"id": 2, "foo": 2})),
        ]));
        let env = env.bind("docs", src).unwrap();
        let query = parse_query(
            r#"{"Emit": {
                "table": "t",
                "headings": [{"Lit": "foo"}],
                "source": {"Map": {"source": {"Ref": "docs"}, "body": {"Ref": "foo"}}}
            }}"#,
        )
        .unwrap();
        eval(&query, &env).unwrap();
        let rows = &writer.borrow().tables[0].2;
        assert_eq!(rows, &vec![vec![json!(1)], vec![json!(2)]]);
    }
}
