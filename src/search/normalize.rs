//! Query normalization: raw text into word tokens or field criteria.
//!
//! A query is read in exactly one of two modes. If any `field<op>value`
//! fragment is present the whole query is treated as criteria and free words
//! are ignored; otherwise it is split into word tokens with `+`/`-` prefixes,
//! `*` prefix wildcards and `( … )` alternative groups.

use once_cell::sync::Lazy;
use regex::Regex;
use smallvec::SmallVec;
use unicode_normalization::UnicodeNormalization;

/// How a word token participates in matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TermOp {
    /// `+word`
    Required,
    /// bare `word`; ANDed like a required term.
    Optional,
    /// `-word`
    Excluded,
}

impl TermOp {
    pub fn is_inclusive(self) -> bool {
        !matches!(self, TermOp::Excluded)
    }
}

/// One searchable unit, already folded to the catalog's search form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Term {
    /// Upper-cased words separated by single spaces.
    pub text: String,
    /// `word*`: match any word starting with `text`.
    pub prefix: bool,
}

/// A term, or a group of alternatives, with the operator they share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordToken {
    pub op: TermOp,
    pub alternatives: SmallVec<[Term; 1]>,
}

impl WordToken {
    pub fn is_group(&self) -> bool {
        self.alternatives.len() > 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CriterionField {
    Author,
    Title,
    Series,
    Genre,
    Year,
    Language,
}

impl CriterionField {
    fn from_key(key: &str) -> Option<Self> {
        match key.to_lowercase().as_str() {
            "author" | "автор" => Some(CriterionField::Author),
            "title" | "название" => Some(CriterionField::Title),
            "series" | "серия" => Some(CriterionField::Series),
            "genre" | "жанр" => Some(CriterionField::Genre),
            "year" | "год" => Some(CriterionField::Year),
            "lang" | "язык" => Some(CriterionField::Language),
            _ => None,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, CriterionField::Year)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CriterionOp {
    /// `field:value`
    Contains,
    /// `field=value`
    Equals,
    /// `field<>value`
    NotEquals,
    /// `field<=value`
    AtMost,
    /// `field>=value`
    AtLeast,
}

impl CriterionOp {
    fn from_symbol(sym: &str) -> Option<Self> {
        match sym {
            ":" => Some(CriterionOp::Contains),
            "=" => Some(CriterionOp::Equals),
            "<>" => Some(CriterionOp::NotEquals),
            "<=" => Some(CriterionOp::AtMost),
            ">=" => Some(CriterionOp::AtLeast),
            _ => None,
        }
    }
}

/// How a criterion joins its neighbours on the same column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Combiner {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Criterion {
    pub field: CriterionField,
    /// Value in search form (see [`fold_search_text`]), or the raw text for
    /// numeric fields.
    pub value: String,
    pub op: CriterionOp,
    pub combiner: Combiner,
}

/// Output of [`normalize`]: exactly one of the two forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedQuery {
    Words(Vec<WordToken>),
    Criteria(Vec<Criterion>),
}

impl NormalizedQuery {
    pub fn is_empty(&self) -> bool {
        match self {
            NormalizedQuery::Words(t) => t.is_empty(),
            NormalizedQuery::Criteria(c) => c.is_empty(),
        }
    }
}

static CRITERIA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:^|[\s|])(author|автор|title|название|series|серия|genre|жанр|year|год|lang|язык)\s*(<>|<=|>=|=|:)",
    )
    .expect("criteria pattern compiles")
});

/// Normalize raw query text.
pub fn normalize(raw: &str) -> NormalizedQuery {
    let text: String = raw.nfc().collect();
    match extract_criteria(&text) {
        Some(criteria) => {
            tracing::debug!(count = criteria.len(), "query_mode_criteria");
            NormalizedQuery::Criteria(criteria)
        }
        None => NormalizedQuery::Words(tokenize_words(&text)),
    }
}

/// Fold text the way the catalog's search columns are stored: NFC, upper
/// case, punctuation turned into spaces, whitespace collapsed.
pub fn fold_search_text(text: &str) -> String {
    let folded: String = text
        .nfc()
        .flat_map(char::to_uppercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Returns `None` when the text holds no criteria syntax at all.
fn extract_criteria(text: &str) -> Option<Vec<Criterion>> {
    let heads: Vec<(usize, usize, CriterionField, CriterionOp)> = CRITERIA_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let key = caps.get(1)?;
            let op = caps.get(2)?;
            Some((
                key.start(),
                op.end(),
                CriterionField::from_key(key.as_str())?,
                CriterionOp::from_symbol(op.as_str())?,
            ))
        })
        .collect();

    if heads.is_empty() {
        return None;
    }

    let mut parsed: Vec<(Criterion, bool)> = Vec::with_capacity(heads.len());
    for (i, &(_, value_start, field, op)) in heads.iter().enumerate() {
        let value_end = heads.get(i + 1).map_or(text.len(), |next| next.0);
        let mut value = text[value_start..value_end].trim();
        let or_next = value.ends_with('|');
        value = value.trim_end_matches('|').trim();
        if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            value = value[1..value.len() - 1].trim();
        }

        let folded = if field.is_numeric() {
            value.to_string()
        } else {
            fold_search_text(value)
        };
        if folded.is_empty() {
            tracing::debug!(?field, "dropping criterion with empty value");
            continue;
        }
        parsed.push((
            Criterion {
                field,
                value: folded,
                op,
                combiner: Combiner::And,
            },
            or_next,
        ));
    }

    let links: Vec<bool> = parsed.iter().map(|(_, or_next)| *or_next).collect();
    let criteria = parsed
        .into_iter()
        .enumerate()
        .map(|(i, (mut c, or_next))| {
            let linked_from_prev = i > 0 && links[i - 1];
            if or_next || linked_from_prev {
                c.combiner = Combiner::Or;
            }
            c
        })
        .collect();
    Some(criteria)
}

fn tokenize_words(text: &str) -> Vec<WordToken> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        if chars[i].is_whitespace() {
            i += 1;
            continue;
        }

        let op = match chars[i] {
            '+' => {
                i += 1;
                TermOp::Required
            }
            '-' => {
                i += 1;
                TermOp::Excluded
            }
            _ => TermOp::Optional,
        };

        if i < chars.len() && chars[i] == '(' {
            let close = chars[i + 1..].iter().position(|&c| c == ')');
            if let Some(offset) = close {
                let inner: String = chars[i + 1..i + 1 + offset].iter().collect();
                let alternatives: SmallVec<[Term; 1]> =
                    inner.split_whitespace().filter_map(fold_term).collect();
                if alternatives.is_empty() {
                    tracing::debug!("dropping empty group");
                } else {
                    tokens.push(WordToken { op, alternatives });
                }
                i += offset + 2;
                continue;
            }
            // Unbalanced: fall through and read the fragment as a plain word.
        }

        let start = i;
        while i < chars.len() && !chars[i].is_whitespace() {
            i += 1;
        }
        let word: String = chars[start..i].iter().collect();
        if let Some(term) = fold_term(&word) {
            tokens.push(WordToken {
                op,
                alternatives: SmallVec::from_elem(term, 1),
            });
        }
    }

    tokens
}

/// Fold one raw word into a [`Term`]; `None` if nothing searchable remains.
fn fold_term(word: &str) -> Option<Term> {
    let word = word.trim_matches(|c| c == '(' || c == ')');
    let prefix = word.ends_with('*');
    let text = fold_search_text(word.trim_end_matches('*'));
    if text.is_empty() {
        None
    } else {
        Some(Term { text, prefix })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(q: &str) -> Vec<WordToken> {
        match normalize(q) {
            NormalizedQuery::Words(t) => t,
            other => panic!("expected words, got {other:?}"),
        }
    }

    fn criteria(q: &str) -> Vec<Criterion> {
        match normalize(q) {
            NormalizedQuery::Criteria(c) => c,
            other => panic!("expected criteria, got {other:?}"),
        }
    }

    fn term(text: &str) -> Term {
        Term {
            text: text.into(),
            prefix: false,
        }
    }

    #[test]
    fn prefixes_map_to_operators() {
        let t = words("+толстой -детство война");
        assert_eq!(t.len(), 3);
        assert_eq!(t[0].op, TermOp::Required);
        assert_eq!(t[0].alternatives[0], term("ТОЛСТОЙ"));
        assert_eq!(t[1].op, TermOp::Excluded);
        assert_eq!(t[1].alternatives[0], term("ДЕТСТВО"));
        assert_eq!(t[2].op, TermOp::Optional);
    }

    #[test]
    fn star_marks_prefix_terms() {
        let t = words("фантаст*");
        assert_eq!(
            t[0].alternatives[0],
            Term {
                text: "ФАНТАСТ".into(),
                prefix: true
            }
        );
    }

    #[test]
    fn groups_share_the_surrounding_operator() {
        let t = words("-(детство отрочество) +(война мир)");
        assert_eq!(t.len(), 2);
        assert_eq!(t[0].op, TermOp::Excluded);
        assert_eq!(
            t[0].alternatives.as_slice(),
            &[term("ДЕТСТВО"), term("ОТРОЧЕСТВО")]
        );
        assert!(t[1].is_group());
        assert_eq!(t[1].op, TermOp::Required);
    }

    #[test]
    fn unbalanced_group_becomes_literal_words() {
        let t = words("(война мир");
        assert_eq!(t.len(), 2);
        assert_eq!(t[0].alternatives[0], term("ВОЙНА"));
        assert!(!t[0].is_group());
        assert_eq!(t[1].alternatives[0], term("МИР"));
    }

    #[test]
    fn empty_group_and_bare_operators_are_dropped() {
        assert!(words("() + -").is_empty());
        assert_eq!(words("() дюна").len(), 1);
    }

    #[test]
    fn inner_punctuation_keeps_a_phrase() {
        let t = words("Собачье-сердце");
        assert_eq!(t[0].alternatives[0], term("СОБАЧЬЕ СЕРДЦЕ"));
    }

    #[test]
    fn criteria_take_precedence_over_words() {
        let c = criteria("война author:толстой");
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].field, CriterionField::Author);
        assert_eq!(c[0].value, "ТОЛСТОЙ");
        assert_eq!(c[0].op, CriterionOp::Contains);
        assert_eq!(c[0].combiner, Combiner::And);
    }

    #[test]
    fn criteria_values_run_to_the_next_key() {
        let c = criteria("title:война и мир year>=1860");
        assert_eq!(c.len(), 2);
        assert_eq!(c[0].value, "ВОЙНА И МИР");
        assert_eq!(c[1].field, CriterionField::Year);
        assert_eq!(c[1].op, CriterionOp::AtLeast);
        assert_eq!(c[1].value, "1860");
    }

    #[test]
    fn pipe_links_criteria_with_or() {
        let c = criteria("author:толстой | author:чехов genre=проза");
        assert_eq!(c.len(), 3);
        assert_eq!(c[0].combiner, Combiner::Or);
        assert_eq!(c[1].combiner, Combiner::Or);
        assert_eq!(c[2].combiner, Combiner::And);
        assert_eq!(c[2].op, CriterionOp::Equals);
    }

    #[test]
    fn russian_keys_and_quotes() {
        let c = criteria("автор=\"Лев Толстой\" серия<>эпопея");
        assert_eq!(c[0].field, CriterionField::Author);
        assert_eq!(c[0].value, "ЛЕВ ТОЛСТОЙ");
        assert_eq!(c[1].field, CriterionField::Series);
        assert_eq!(c[1].op, CriterionOp::NotEquals);
    }

    #[test]
    fn empty_criterion_values_are_dropped() {
        let c = criteria("author: title:дюна");
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].field, CriterionField::Title);
    }

    #[test]
    fn key_inside_a_word_is_not_criteria() {
        let t = words("coauthor:x");
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].alternatives[0], term("COAUTHOR X"));
    }

    #[test]
    fn fold_search_text_matches_catalog_form() {
        assert_eq!(fold_search_text("  Лев  Толстой, «Война и мир»!"), "ЛЕВ ТОЛСТОЙ ВОЙНА И МИР");
        assert_eq!(fold_search_text("---"), "");
    }
}
