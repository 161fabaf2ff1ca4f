use crate::error::{Result, StoreError};
use crate::permission::Authorizations;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Maximum parenthesis nesting accepted in a label expression.
const MAX_LABEL_DEPTH: usize = 32;

/// Bytes allowed in an unquoted token (and in tokens parsed from an
/// authorization string).
pub(crate) fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b':' | b'/')
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisibilityExpr {
    Token(String),
    And(Vec<VisibilityExpr>),
    Or(Vec<VisibilityExpr>),
}

impl VisibilityExpr {
    pub fn evaluate(&self, auths: &Authorizations) -> bool {
        match self {
            VisibilityExpr::Token(token) => auths.contains(token),
            VisibilityExpr::And(terms) => terms.iter().all(|t| t.evaluate(auths)),
            VisibilityExpr::Or(terms) => terms.iter().any(|t| t.evaluate(auths)),
        }
    }

    fn collect_tokens<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            VisibilityExpr::Token(token) => {
                out.insert(token.as_str());
            }
            VisibilityExpr::And(terms) | VisibilityExpr::Or(terms) => {
                for term in terms {
                    term.collect_tokens(out);
                }
            }
        }
    }
}

/// A validated access-label expression attached to a cell.
///
/// `a&b`, `a|(b&c)`, `"with space"&x`. The empty expression is unrestricted
/// and visible to every reader. Labels compare and order by their expression
/// text, which is also how the store sorts cells sharing a column.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VisibilityLabel {
    expression: String,
    root: Option<Arc<VisibilityExpr>>,
}

impl VisibilityLabel {
    pub fn parse(expression: impl Into<String>) -> Result<Self> {
        let expression = expression.into();
        if expression.is_empty() {
            return Ok(Self::unrestricted());
        }
        let root = Parser::new(&expression).parse()?;
        Ok(Self {
            expression,
            root: Some(Arc::new(root)),
        })
    }

    pub fn parse_bytes(expression: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(expression).map_err(|e| StoreError::InvalidVisibility {
            expression: String::from_utf8_lossy(expression).into_owned(),
            position: e.valid_up_to(),
            reason: "label is not valid UTF-8".into(),
        })?;
        Self::parse(text)
    }

    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn is_unrestricted(&self) -> bool {
        self.root.is_none()
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn expr(&self) -> Option<&VisibilityExpr> {
        self.root.as_deref()
    }

    pub fn evaluate(&self, auths: &Authorizations) -> bool {
        match &self.root {
            None => true,
            Some(root) => root.evaluate(auths),
        }
    }

    /// Distinct tokens referenced anywhere in the expression.
    pub fn tokens(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        if let Some(root) = &self.root {
            root.collect_tokens(&mut out);
        }
        out
    }

    /// Renders `token` so it can be embedded in an expression, quoting and
    /// escaping when it contains bytes outside the unquoted token set.
    pub fn quote(token: &str) -> String {
        if !token.is_empty() && token.bytes().all(is_token_byte) {
            return token.to_string();
        }
        let mut out = String::with_capacity(token.len() + 2);
        out.push('"');
        for c in token.chars() {
            if c == '"' || c == '\\' {
                out.push('\\');
            }
            out.push(c);
        }
        out.push('"');
        out
    }
}

impl PartialEq for VisibilityLabel {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for VisibilityLabel {}

impl Hash for VisibilityLabel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.expression.hash(state);
    }
}

impl PartialOrd for VisibilityLabel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VisibilityLabel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.expression.as_bytes().cmp(other.expression.as_bytes())
    }
}

impl fmt::Debug for VisibilityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VisibilityLabel({:?})", self.expression)
    }
}

impl fmt::Display for VisibilityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl TryFrom<String> for VisibilityLabel {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl TryFrom<&str> for VisibilityLabel {
    type Error = StoreError;

    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<VisibilityLabel> for String {
    fn from(label: VisibilityLabel) -> Self {
        label.expression
    }
}

struct Parser<'a> {
    expression: &'a str,
    input: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(expression: &'a str) -> Self {
        Self {
            expression,
            input: expression.as_bytes(),
            pos: 0,
            depth: 0,
        }
    }

    fn parse(mut self) -> Result<VisibilityExpr> {
        let root = self.parse_expr()?;
        match self.peek() {
            None => Ok(root),
            Some(b')') => Err(self.error("unbalanced closing parenthesis")),
            Some(c) => Err(self.error(format!("unexpected character '{}'", c as char))),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn error(&self, reason: impl Into<String>) -> StoreError {
        StoreError::InvalidVisibility {
            expression: self.expression.to_string(),
            position: self.pos,
            reason: reason.into(),
        }
    }

    fn parse_expr(&mut self) -> Result<VisibilityExpr> {
        let mut terms = vec![self.parse_term()?];
        let mut operator = None;
        while let Some(op @ (b'&' | b'|')) = self.peek() {
            match operator {
                Some(prev) if prev != op => {
                    return Err(self.error("cannot mix '&' and '|' without parentheses"));
                }
                _ => operator = Some(op),
            }
            self.pos += 1;
            terms.push(self.parse_term()?);
        }
        Ok(match operator {
            Some(b'&') => VisibilityExpr::And(terms),
            Some(_) => VisibilityExpr::Or(terms),
            None => terms.remove(0),
        })
    }

    fn parse_term(&mut self) -> Result<VisibilityExpr> {
        match self.peek() {
            None => Err(self.error("expected a token")),
            Some(b'(') => {
                self.depth += 1;
                if self.depth > MAX_LABEL_DEPTH {
                    return Err(self.error(format!(
                        "nesting exceeds maximum depth of {MAX_LABEL_DEPTH}"
                    )));
                }
                self.pos += 1;
                if self.peek() == Some(b')') {
                    return Err(self.error("empty parentheses"));
                }
                let inner = self.parse_expr()?;
                if self.peek() != Some(b')') {
                    return Err(self.error("unclosed parenthesis"));
                }
                self.pos += 1;
                self.depth -= 1;
                Ok(inner)
            }
            Some(b'"') => self.parse_quoted(),
            Some(c) if is_token_byte(c) => {
                let start = self.pos;
                while self.peek().is_some_and(is_token_byte) {
                    self.pos += 1;
                }
                Ok(VisibilityExpr::Token(
                    self.expression[start..self.pos].to_string(),
                ))
            }
            Some(b'&' | b'|') => Err(self.error("operator without a left operand")),
            Some(b')') => Err(self.error("expected a token before ')'")),
            Some(c) => Err(self.error(format!("unexpected character '{}'", c as char))),
        }
    }

    fn parse_quoted(&mut self) -> Result<VisibilityExpr> {
        let open = self.pos;
        self.pos += 1;
        let mut token = Vec::new();
        loop {
            match self.peek() {
                None => {
                    self.pos = open;
                    return Err(self.error("unterminated quoted token"));
                }
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(c @ (b'"' | b'\\')) => token.push(c),
                        _ => return Err(self.error("invalid escape in quoted token")),
                    }
                    self.pos += 1;
                }
                Some(c) => {
                    token.push(c);
                    self.pos += 1;
                }
            }
        }
        if token.is_empty() {
            self.pos = open;
            return Err(self.error("empty quoted token"));
        }
        String::from_utf8(token)
            .map(VisibilityExpr::Token)
            .map_err(|_| self.error("quoted token is not valid UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::{VisibilityExpr, VisibilityLabel};
    use crate::error::{StoreError, StoreErrorCode};
    use crate::permission::Authorizations;
    use proptest::prelude::*;

    fn auths(tokens: &[&str]) -> Authorizations {
        Authorizations::new(tokens.iter().copied()).expect("auths")
    }

    fn position_of(err: StoreError) -> usize {
        match err {
            StoreError::InvalidVisibility { position, .. } => position,
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_label_is_unrestricted() {
        let label = VisibilityLabel::parse("").expect("empty");
        assert!(label.is_unrestricted());
        assert!(label.evaluate(&Authorizations::empty()));
        assert_eq!(label, VisibilityLabel::unrestricted());
    }

    #[test]
    fn parses_conjunctions_disjunctions_and_groups() {
        let label = VisibilityLabel::parse("admin|(audit&eu)").expect("parse");
        assert_eq!(
            label.expr(),
            Some(&VisibilityExpr::Or(vec![
                VisibilityExpr::Token("admin".into()),
                VisibilityExpr::And(vec![
                    VisibilityExpr::Token("audit".into()),
                    VisibilityExpr::Token("eu".into()),
                ]),
            ]))
        );
        assert!(label.evaluate(&auths(&["admin"])));
        assert!(label.evaluate(&auths(&["audit", "eu"])));
        assert!(!label.evaluate(&auths(&["audit"])));
        assert!(!label.evaluate(&Authorizations::empty()));
    }

    #[test]
    fn quoted_tokens_unescape() {
        let label = VisibilityLabel::parse(r#""dept one"&"say \"hi\"\\""#).expect("parse");
        let tokens: Vec<&str> = label.tokens().into_iter().collect();
        assert_eq!(tokens, vec!["dept one", "say \"hi\"\\"]);
        assert!(label.evaluate(&auths(&["dept one", "say \"hi\"\\"])));
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in [
            "a&", "&a", "a|b&c", "()", "(a", "a)", "a b", "\"open", "\"\"", "a&&b", r#""\q""#,
        ] {
            let err = VisibilityLabel::parse(bad).expect_err(bad);
            assert_eq!(err.code(), StoreErrorCode::InvalidVisibilityLabel, "{bad}");
        }
    }

    #[test]
    fn error_positions_point_at_fault() {
        assert_eq!(position_of(VisibilityLabel::parse("a|b&c").unwrap_err()), 3);
        assert_eq!(position_of(VisibilityLabel::parse("a)").unwrap_err()), 1);
        assert_eq!(position_of(VisibilityLabel::parse("x&\"open").unwrap_err()), 2);
    }

    #[test]
    fn nesting_depth_is_bounded() {
        let deep = format!("{}a{}", "(".repeat(40), ")".repeat(40));
        assert!(VisibilityLabel::parse(deep).is_err());
        let shallow = format!("{}a{}", "(".repeat(8), ")".repeat(8));
        assert!(VisibilityLabel::parse(shallow).is_ok());
    }

    #[test]
    fn parse_bytes_requires_utf8() {
        assert!(VisibilityLabel::parse_bytes(b"public").is_ok());
        assert!(VisibilityLabel::parse_bytes(&[b'"', 0xff, b'"']).is_err());
    }

    #[test]
    fn quote_only_when_needed() {
        assert_eq!(VisibilityLabel::quote("plain.token"), "plain.token");
        assert_eq!(VisibilityLabel::quote("two words"), "\"two words\"");
        assert_eq!(VisibilityLabel::quote("a\"b"), "\"a\\\"b\"");
        let label = VisibilityLabel::parse(VisibilityLabel::quote("two words")).expect("quoted");
        assert!(label.evaluate(&auths(&["two words"])));
    }

    #[test]
    fn string_conversions_validate() {
        let label: VisibilityLabel = String::from("a&b").try_into().expect("valid");
        assert_eq!(String::from(label.clone()), "a&b");
        assert!(VisibilityLabel::try_from("a&|b").is_err());
    }

    proptest! {
        #[test]
        fn conjunction_of_tokens_needs_every_token(
            tokens in prop::collection::btree_set("[a-z]{1,6}", 1..5),
            drop_idx in any::<prop::sample::Index>(),
        ) {
            let tokens: Vec<String> = tokens.into_iter().collect();
            let label = VisibilityLabel::parse(tokens.join("&")).expect("and-label");
            let all = Authorizations::new(tokens.iter().map(String::as_str)).expect("all");
            prop_assert!(label.evaluate(&all));

            let dropped = drop_idx.index(tokens.len());
            let partial = Authorizations::new(
                tokens.iter().enumerate().filter(|(i, _)| *i != dropped).map(|(_, t)| t.as_str()),
            ).expect("partial");
            prop_assert!(!label.evaluate(&partial));
        }

        #[test]
        fn disjunction_needs_any_token(
            tokens in prop::collection::btree_set("[a-z]{1,6}", 1..5),
            pick in any::<prop::sample::Index>(),
        ) {
            let tokens: Vec<String> = tokens.into_iter().collect();
            let label = VisibilityLabel::parse(tokens.join("|")).expect("or-label");
            let one = Authorizations::new([tokens[pick.index(tokens.len())].as_str()]).expect("one");
            prop_assert!(label.evaluate(&one));
            prop_assert!(!label.evaluate(&Authorizations::empty()));
        }
    }
}
