//! Compile a normalized query plus facets into a parameterized predicate.
//!
//! The predicate is a boolean SQL expression over the shared projection
//! columns every search source exposes (`full_text`, `search_title`,
//! `search_author`, `size_bucket`, `rating`, ...). Values never appear in the
//! SQL text; each `?` has exactly one entry in `params`, in order.

use crate::model::types::{Facets, Scope};
use crate::search::normalize::{
    Combiner, Criterion, CriterionField, CriterionOp, NormalizedQuery, Term, TermOp, WordToken,
};
use rusqlite::ToSql;
use rusqlite::types::ToSqlOutput;

/// Predicate that selects nothing. Compiled whenever no condition narrows the
/// catalog, so an empty or purely negative query never scans everything.
pub const ALWAYS_FALSE_SQL: &str = "1 = 0";

/// A bound value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParam {
    Text(String),
    Integer(i64),
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            SqlParam::Text(s) => s.to_sql(),
            SqlParam::Integer(i) => i.to_sql(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPredicate {
    pub sql: String,
    pub params: Vec<SqlParam>,
    /// FTS5 expression over the inclusive word terms, used only for ranking.
    pub match_expr: Option<String>,
}

impl CompiledPredicate {
    pub fn always_false() -> Self {
        Self {
            sql: ALWAYS_FALSE_SQL.to_string(),
            params: Vec::new(),
            match_expr: None,
        }
    }

    pub fn is_always_false(&self) -> bool {
        self.sql == ALWAYS_FALSE_SQL
    }

    pub fn placeholder_count(&self) -> usize {
        count_placeholders(&self.sql)
    }
}

pub(crate) fn count_placeholders(sql: &str) -> usize {
    sql.matches('?').count()
}

#[derive(Default)]
struct Conditions {
    clauses: Vec<String>,
    params: Vec<SqlParam>,
    anchored: bool,
}

impl Conditions {
    fn push(&mut self, clause: String, params: Vec<SqlParam>, anchors: bool) {
        self.clauses.push(clause);
        self.params.extend(params);
        self.anchored |= anchors;
    }
}

/// Compile `query` and `facets` into one predicate.
pub fn compile(query: &NormalizedQuery, facets: &Facets) -> CompiledPredicate {
    let mut conds = Conditions::default();
    let mut match_expr = None;

    match query {
        NormalizedQuery::Words(tokens) => {
            for token in tokens {
                let (clause, params) = word_condition(token);
                conds.push(clause, params, token.op.is_inclusive());
            }
            match_expr = fts_match_expr(tokens);
        }
        NormalizedQuery::Criteria(criteria) => compile_criteria(criteria, &mut conds),
    }

    compile_facets(facets, &mut conds);

    if !conds.anchored {
        tracing::debug!("no anchoring condition; compiling always-false predicate");
        return CompiledPredicate::always_false();
    }

    CompiledPredicate {
        sql: conds.clauses.join(" AND "),
        params: conds.params,
        match_expr,
    }
}

fn word_condition(token: &WordToken) -> (String, Vec<SqlParam>) {
    let params: Vec<SqlParam> = token
        .alternatives
        .iter()
        .map(|t| SqlParam::Text(word_pattern(t)))
        .collect();

    let clause = match (token.op, token.is_group()) {
        (TermOp::Excluded, false) => r"full_text NOT LIKE ? ESCAPE '\'".to_string(),
        (_, false) => r"full_text LIKE ? ESCAPE '\'".to_string(),
        (op, true) => {
            let alternatives = vec![r"full_text LIKE ? ESCAPE '\'"; params.len()].join(" OR ");
            if op == TermOp::Excluded {
                format!("NOT ({alternatives})")
            } else {
                format!("({alternatives})")
            }
        }
    };
    (clause, params)
}

/// `% WORD %` for whole words, `% WORD%` for prefixes.
fn word_pattern(term: &Term) -> String {
    let escaped = escape_like(&term.text);
    if term.prefix {
        format!("% {escaped}%")
    } else {
        format!("% {escaped} %")
    }
}

fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// OR of the inclusive terms as quoted FTS5 phrases.
fn fts_match_expr(tokens: &[WordToken]) -> Option<String> {
    let phrases: Vec<String> = tokens
        .iter()
        .filter(|t| t.op.is_inclusive())
        .flat_map(|t| t.alternatives.iter())
        .map(|term| {
            let quoted = format!("\"{}\"", term.text.replace('"', "\"\""));
            if term.prefix { format!("{quoted}*") } else { quoted }
        })
        .collect();
    (!phrases.is_empty()).then(|| phrases.join(" OR "))
}

fn field_column(field: CriterionField) -> &'static str {
    match field {
        CriterionField::Author => "search_author",
        CriterionField::Title => "search_title",
        CriterionField::Series => "search_series",
        CriterionField::Genre => "search_genre",
        CriterionField::Year => "year",
        CriterionField::Language => "search_lang",
    }
}

/// A `<>` criterion only removes rows, so like an excluded word it does
/// not anchor a query on its own.
fn criterion_anchors(criterion: &Criterion) -> bool {
    criterion.op != CriterionOp::NotEquals
}

fn compile_criteria(criteria: &[Criterion], conds: &mut Conditions) {
    // OR-linked criteria batch per column, in first-seen column order.
    type Member = (String, Vec<SqlParam>, bool);
    let mut or_groups: Vec<(CriterionField, Vec<Member>)> = Vec::new();

    for criterion in criteria {
        let Some((clause, params)) = criterion_condition(criterion) else {
            continue;
        };
        let anchors = criterion_anchors(criterion);
        match criterion.combiner {
            Combiner::And => conds.push(clause, params, anchors),
            Combiner::Or => {
                let member = (clause, params, anchors);
                match or_groups.iter_mut().find(|(f, _)| *f == criterion.field) {
                    Some((_, members)) => members.push(member),
                    None => or_groups.push((criterion.field, vec![member])),
                }
            }
        }
    }

    for (_, mut members) in or_groups {
        if members.len() == 1 {
            let (clause, params, anchors) = members.remove(0);
            conds.push(clause, params, anchors);
            continue;
        }
        // Any non-anchoring alternative lets the whole group match broadly.
        let anchors = members.iter().all(|(_, _, anchors)| *anchors);
        let mut clauses = Vec::with_capacity(members.len());
        let mut params = Vec::new();
        for (clause, member_params, _) in members {
            clauses.push(clause);
            params.extend(member_params);
        }
        conds.push(format!("({})", clauses.join(" OR ")), params, anchors);
    }
}

fn criterion_condition(criterion: &Criterion) -> Option<(String, Vec<SqlParam>)> {
    let column = field_column(criterion.field);

    if criterion.field.is_numeric() {
        let Ok(value) = criterion.value.trim().parse::<i64>() else {
            tracing::warn!(
                field = ?criterion.field,
                value = %criterion.value,
                "ignoring non-numeric criterion value"
            );
            return None;
        };
        let clause = match criterion.op {
            CriterionOp::Contains | CriterionOp::Equals => format!("{column} = ?"),
            CriterionOp::NotEquals => format!("({column} IS NULL OR {column} <> ?)"),
            CriterionOp::AtMost => format!("{column} <= ?"),
            CriterionOp::AtLeast => format!("{column} >= ?"),
        };
        return Some((clause, vec![SqlParam::Integer(value)]));
    }

    let value = &criterion.value;
    Some(match criterion.op {
        CriterionOp::Contains => (
            format!(r"{column} LIKE ? ESCAPE '\'"),
            vec![SqlParam::Text(format!("%{}%", escape_like(value)))],
        ),
        CriterionOp::Equals => (format!("{column} = ?"), vec![SqlParam::Text(value.clone())]),
        CriterionOp::NotEquals => (
            format!(r"COALESCE({column}, '') NOT LIKE ? ESCAPE '\'"),
            vec![SqlParam::Text(format!("%{}%", escape_like(value)))],
        ),
        CriterionOp::AtMost => (format!("{column} <= ?"), vec![SqlParam::Text(value.clone())]),
        CriterionOp::AtLeast => (format!("{column} >= ?"), vec![SqlParam::Text(value.clone())]),
    })
}

fn compile_facets(facets: &Facets, conds: &mut Conditions) {
    if let Some(lang) = facets.language.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
        conds.push(
            "search_lang = ?".to_string(),
            vec![SqlParam::Text(lang.to_uppercase())],
            false,
        );
    }

    if let Some(bucket) = facets.size_bucket {
        conds.push(
            "size_bucket = ?".to_string(),
            vec![SqlParam::Text(bucket.as_str().to_string())],
            true,
        );
    }

    if !facets.ratings.is_empty() {
        let placeholders = vec!["?"; facets.ratings.len()].join(", ");
        conds.push(
            format!("rating IN ({placeholders})"),
            facets
                .ratings
                .iter()
                .map(|r| SqlParam::Integer(i64::from(*r)))
                .collect(),
            true,
        );
    }

    match facets.scope {
        Some(Scope::Series(id)) => {
            conds.push("series_id = ?".to_string(), vec![SqlParam::Integer(id)], true);
        }
        Some(Scope::Author(id)) => {
            conds.push("author_id = ?".to_string(), vec![SqlParam::Integer(id)], true);
        }
        None => {}
    }
}
