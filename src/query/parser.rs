//! Query parsing: REM statement extensions plus a SQL SELECT subset.
//!
//! The REM extensions are dispatched on the first keyword:
//!
//! - `LOOKUP '<key>' IN <schema>`
//! - `SEARCH '<text>' IN <schema> [TOP k]`
//! - `TRAVERSE FROM '<uuid>' [OUT|IN|BOTH] [DEPTH n] [TYPE '<t>']`
//!
//! Everything else goes through `sqlparser`. Supported SELECT surface:
//! conjunctive WHERE (`=`, `IN`, `<`, `<=`, `>`, `>=`, `LIKE 'prefix%'`,
//! `IS [NOT] NULL`), `ORDER BY col [ASC|DESC]`, `LIMIT n`, `COUNT(*)`.
//! No joins, no subqueries.

use crate::query::plan::{OrderBy, Predicate, PredicateOp, Projection, QueryPlan};
use crate::types::{DatabaseError, Result};
use sqlparser::ast;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use uuid::Uuid;

/// Default top-k for `SEARCH` statements.
const DEFAULT_TOP_K: usize = 10;

/// Default traversal depth and result cap.
const DEFAULT_DEPTH: usize = 2;
const DEFAULT_TRAVERSE_LIMIT: usize = 100;

/// Parse a query string into an (unplanned) plan tree.
pub fn parse(sql: &str) -> Result<QueryPlan> {
    let trimmed = sql.trim();
    let keyword = trimmed
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_uppercase();

    match keyword.as_str() {
        "LOOKUP" => parse_lookup(trimmed),
        "SEARCH" => parse_search(trimmed),
        "TRAVERSE" => parse_traverse(trimmed),
        "SELECT" => parse_select(trimmed),
        _ => Err(DatabaseError::BadQuery(format!(
            "expected LOOKUP, SEARCH, TRAVERSE or SELECT, got: {keyword}"
        ))),
    }
}

/// Split a statement into quoted literals and bare tokens.
fn lex(rest: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = rest.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '\'' {
            chars.next();
            let mut literal = String::new();
            loop {
                match chars.next() {
                    Some('\'') => break,
                    Some(ch) => literal.push(ch),
                    None => {
                        return Err(DatabaseError::BadQuery("unterminated string".to_string()))
                    }
                }
            }
            tokens.push(Token::Literal(literal));
        } else {
            let mut word = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() {
                    break;
                }
                word.push(ch);
                chars.next();
            }
            tokens.push(Token::Word(word));
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Token {
    Word(String),
    Literal(String),
}

impl Token {
    fn literal(&self) -> Option<&str> {
        match self {
            Token::Literal(s) => Some(s),
            Token::Word(_) => None,
        }
    }

    fn word_upper(&self) -> Option<String> {
        match self {
            Token::Word(w) => Some(w.to_uppercase()),
            Token::Literal(_) => None,
        }
    }
}

fn parse_lookup(statement: &str) -> Result<QueryPlan> {
    let tokens = lex(&statement[6..])?;
    let key = tokens
        .first()
        .and_then(Token::literal)
        .ok_or_else(|| DatabaseError::BadQuery("LOOKUP needs a quoted key".to_string()))?;

    match (tokens.get(1).and_then(Token::word_upper).as_deref(), tokens.get(2)) {
        (Some("IN"), Some(Token::Word(schema))) => Ok(QueryPlan::Lookup {
            schema: schema.clone(),
            key: key.to_string(),
        }),
        _ => Err(DatabaseError::BadQuery(
            "LOOKUP '<key>' IN <schema>".to_string(),
        )),
    }
}

fn parse_search(statement: &str) -> Result<QueryPlan> {
    let tokens = lex(&statement[6..])?;
    let query_text = tokens
        .first()
        .and_then(Token::literal)
        .ok_or_else(|| DatabaseError::BadQuery("SEARCH needs a quoted query".to_string()))?;

    let schema = match (tokens.get(1).and_then(Token::word_upper).as_deref(), tokens.get(2)) {
        (Some("IN"), Some(Token::Word(schema))) => schema.clone(),
        _ => {
            return Err(DatabaseError::BadQuery(
                "SEARCH '<text>' IN <schema> [TOP k]".to_string(),
            ))
        }
    };

    let mut top_k = DEFAULT_TOP_K;
    if let Some("TOP") = tokens.get(3).and_then(Token::word_upper).as_deref() {
        top_k = tokens
            .get(4)
            .and_then(|t| match t {
                Token::Word(w) => w.parse().ok(),
                Token::Literal(_) => None,
            })
            .ok_or_else(|| DatabaseError::BadQuery("TOP needs a number".to_string()))?;
    }

    Ok(QueryPlan::Search {
        schema,
        query_text: query_text.to_string(),
        top_k,
        ef: None,
    })
}

fn parse_traverse(statement: &str) -> Result<QueryPlan> {
    let tokens = lex(&statement[8..])?;
    if tokens.first().and_then(Token::word_upper).as_deref() != Some("FROM") {
        return Err(DatabaseError::BadQuery(
            "TRAVERSE FROM '<uuid>' [OUT|IN|BOTH] [DEPTH n] [TYPE '<t>']".to_string(),
        ));
    }
    let start = tokens
        .get(1)
        .and_then(Token::literal)
        .ok_or_else(|| DatabaseError::BadQuery("TRAVERSE needs a quoted uuid".to_string()))?;
    let start_id = Uuid::parse_str(start)
        .map_err(|_| DatabaseError::BadQuery(format!("invalid uuid: {start}")))?;

    let mut direction = crate::graph::TraversalDirection::Out;
    let mut depth = DEFAULT_DEPTH;
    let mut edge_type = None;

    let mut i = 2;
    while i < tokens.len() {
        match tokens[i].word_upper().as_deref() {
            Some("OUT") => direction = crate::graph::TraversalDirection::Out,
            Some("IN") => direction = crate::graph::TraversalDirection::In,
            Some("BOTH") => direction = crate::graph::TraversalDirection::Both,
            Some("DEPTH") => {
                i += 1;
                depth = tokens
                    .get(i)
                    .and_then(|t| match t {
                        Token::Word(w) => w.parse().ok(),
                        Token::Literal(_) => None,
                    })
                    .ok_or_else(|| DatabaseError::BadQuery("DEPTH needs a number".to_string()))?;
            }
            Some("TYPE") => {
                i += 1;
                edge_type = Some(
                    tokens
                        .get(i)
                        .and_then(Token::literal)
                        .ok_or_else(|| {
                            DatabaseError::BadQuery("TYPE needs a quoted edge type".to_string())
                        })?
                        .to_string(),
                );
            }
            _ => {
                return Err(DatabaseError::BadQuery(format!(
                    "unexpected token in TRAVERSE: {:?}",
                    tokens[i]
                )))
            }
        }
        i += 1;
    }

    Ok(QueryPlan::Traverse {
        start_id,
        direction,
        depth,
        edge_type,
        limit: DEFAULT_TRAVERSE_LIMIT,
    })
}

fn parse_select(statement: &str) -> Result<QueryPlan> {
    let statements = Parser::parse_sql(&GenericDialect {}, statement)
        .map_err(|e| DatabaseError::BadQuery(format!("parse error: {e}")))?;
    let statement = match statements.as_slice() {
        [ast::Statement::Query(query)] => query,
        _ => return Err(DatabaseError::BadQuery("expected one SELECT".to_string())),
    };

    let select = match statement.body.as_ref() {
        ast::SetExpr::Select(select) => select,
        _ => return Err(DatabaseError::BadQuery("expected a plain SELECT".to_string())),
    };
    if select.from.len() != 1 {
        return Err(DatabaseError::BadQuery(
            "exactly one FROM table required (no joins)".to_string(),
        ));
    }
    if !select.from[0].joins.is_empty() {
        return Err(DatabaseError::BadQuery("joins are not supported".to_string()));
    }
    let group_by_empty = matches!(
        &select.group_by,
        ast::GroupByExpr::Expressions(exprs, ..) if exprs.is_empty()
    );
    if !group_by_empty || select.having.is_some() {
        return Err(DatabaseError::BadQuery(
            "GROUP BY / HAVING are not supported".to_string(),
        ));
    }

    let schema = match &select.from[0].relation {
        ast::TableFactor::Table { name, .. } => name.to_string(),
        _ => return Err(DatabaseError::BadQuery("FROM must name a schema".to_string())),
    };

    let projection = parse_projection(&select.projection)?;

    let predicates = match &select.selection {
        Some(expr) => parse_conjunction(expr)?,
        None => Vec::new(),
    };

    let order_by = match &statement.order_by {
        Some(order) => {
            let exprs = &order.exprs;
            if exprs.len() > 1 {
                return Err(DatabaseError::BadQuery(
                    "ORDER BY supports a single column".to_string(),
                ));
            }
            match exprs.first() {
                Some(item) => Some(OrderBy {
                    column: column_name(&item.expr)?,
                    descending: item.asc == Some(false),
                }),
                None => None,
            }
        }
        None => None,
    };

    let limit = match &statement.limit {
        Some(ast::Expr::Value(ast::Value::Number(n, _))) => Some(n.parse().map_err(|_| {
            DatabaseError::BadQuery(format!("invalid LIMIT: {n}"))
        })?),
        Some(other) => {
            return Err(DatabaseError::BadQuery(format!(
                "unsupported LIMIT expression: {other}"
            )))
        }
        None => None,
    };

    Ok(QueryPlan::Sql {
        schema,
        projection,
        predicates,
        order_by,
        limit,
        index_column: None,
    })
}

fn parse_projection(items: &[ast::SelectItem]) -> Result<Projection> {
    if items.len() == 1 {
        match &items[0] {
            ast::SelectItem::Wildcard(_) => return Ok(Projection::All),
            ast::SelectItem::UnnamedExpr(ast::Expr::Function(function)) => {
                if function.name.to_string().eq_ignore_ascii_case("count") {
                    return Ok(Projection::CountStar);
                }
                return Err(DatabaseError::BadQuery(format!(
                    "unsupported function: {}",
                    function.name
                )));
            }
            _ => {}
        }
    }

    let mut columns = Vec::new();
    for item in items {
        match item {
            ast::SelectItem::UnnamedExpr(expr) => columns.push(column_name(expr)?),
            other => {
                return Err(DatabaseError::BadQuery(format!(
                    "unsupported projection: {other}"
                )))
            }
        }
    }
    Ok(Projection::Columns(columns))
}

fn parse_conjunction(expr: &ast::Expr) -> Result<Vec<Predicate>> {
    match expr {
        ast::Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            let mut predicates = parse_conjunction(left)?;
            predicates.extend(parse_conjunction(right)?);
            Ok(predicates)
        }
        ast::Expr::Nested(inner) => parse_conjunction(inner),
        other => Ok(vec![parse_predicate(other)?]),
    }
}

fn parse_predicate(expr: &ast::Expr) -> Result<Predicate> {
    match expr {
        ast::Expr::BinaryOp { left, op, right } => {
            let column = column_name(left)?;
            let value = literal_value(right)?;
            let op = match op {
                ast::BinaryOperator::Eq => PredicateOp::Eq(value),
                ast::BinaryOperator::Lt => PredicateOp::Lt(value),
                ast::BinaryOperator::LtEq => PredicateOp::Lte(value),
                ast::BinaryOperator::Gt => PredicateOp::Gt(value),
                ast::BinaryOperator::GtEq => PredicateOp::Gte(value),
                other => {
                    return Err(DatabaseError::BadQuery(format!(
                        "unsupported operator: {other}"
                    )))
                }
            };
            Ok(Predicate { column, op })
        }
        ast::Expr::InList {
            expr,
            list,
            negated: false,
        } => {
            let column = column_name(expr)?;
            let values = list.iter().map(literal_value).collect::<Result<Vec<_>>>()?;
            Ok(Predicate {
                column,
                op: PredicateOp::In(values),
            })
        }
        ast::Expr::Like {
            negated: false,
            expr,
            pattern,
            ..
        } => {
            let column = column_name(expr)?;
            let pattern = match literal_value(pattern)? {
                serde_json::Value::String(s) => s,
                other => {
                    return Err(DatabaseError::BadQuery(format!(
                        "LIKE needs a string pattern, got {other}"
                    )))
                }
            };
            // Only prefix patterns are indexable; anything else is rejected
            // rather than silently scanned.
            let Some(prefix) = pattern.strip_suffix('%') else {
                return Err(DatabaseError::BadQuery(
                    "LIKE supports only 'prefix%' patterns".to_string(),
                ));
            };
            if prefix.contains('%') || prefix.contains('_') {
                return Err(DatabaseError::BadQuery(
                    "LIKE supports only 'prefix%' patterns".to_string(),
                ));
            }
            Ok(Predicate {
                column,
                op: PredicateOp::LikePrefix(prefix.to_string()),
            })
        }
        ast::Expr::IsNull(inner) => Ok(Predicate {
            column: column_name(inner)?,
            op: PredicateOp::IsNull,
        }),
        ast::Expr::IsNotNull(inner) => Ok(Predicate {
            column: column_name(inner)?,
            op: PredicateOp::IsNotNull,
        }),
        other => Err(DatabaseError::BadQuery(format!(
            "unsupported predicate: {other}"
        ))),
    }
}

fn column_name(expr: &ast::Expr) -> Result<String> {
    match expr {
        ast::Expr::Identifier(ident) => Ok(ident.value.clone()),
        ast::Expr::CompoundIdentifier(parts) => Ok(parts
            .iter()
            .map(|p| p.value.clone())
            .collect::<Vec<_>>()
            .join(".")),
        other => Err(DatabaseError::BadQuery(format!(
            "expected a column name, got {other}"
        ))),
    }
}

fn literal_value(expr: &ast::Expr) -> Result<serde_json::Value> {
    match expr {
        ast::Expr::Value(value) => match value {
            ast::Value::SingleQuotedString(s) | ast::Value::DoubleQuotedString(s) => {
                Ok(serde_json::Value::String(s.clone()))
            }
            ast::Value::Number(n, _) => n
                .parse::<f64>()
                .map(|f| serde_json::json!(f))
                .map_err(|_| DatabaseError::BadQuery(format!("invalid number: {n}"))),
            ast::Value::Boolean(b) => Ok(serde_json::Value::Bool(*b)),
            ast::Value::Null => Ok(serde_json::Value::Null),
            other => Err(DatabaseError::BadQuery(format!(
                "unsupported literal: {other}"
            ))),
        },
        ast::Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => match literal_value(expr)? {
            serde_json::Value::Number(n) => {
                let f = n.as_f64().unwrap_or(0.0);
                Ok(serde_json::json!(-f))
            }
            other => Err(DatabaseError::BadQuery(format!(
                "cannot negate {other}"
            ))),
        },
        other => Err(DatabaseError::BadQuery(format!(
            "expected a literal, got {other}"
        ))),
    }
}
