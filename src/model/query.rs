//! A narrowed simfil-like query evaluator over a tile's features.
//!
//! Grounded on §4.4/§9's description of the simfil query environment; per
//! the Open Question resolution in `DESIGN.md`, this implements only the
//! grammar needed for scenario 1 in spec.md §8 (`geo() within bbox(...)`,
//! attribute field comparisons, boolean connectives) rather than a general
//! simfil-compatible language. Compilation errors are reported as
//! diagnostics rather than propagated as an `Err`, per §4.4's failure
//! semantics ("Simfil compilation error -> returned as diagnostics; does
//! not throw").

use crate::error::Result;
use crate::model::feature_id::FeatureId;
use crate::model::layer::{Feature, TileFeatureLayer};
use crate::model::object::NodeValue;

#[derive(Clone, Debug, Default)]
pub struct QueryDiagnostics {
    pub compile_error: Option<String>,
    pub trace: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct QueryOutcome {
    pub matched: Vec<FeatureId>,
    pub diagnostics: QueryDiagnostics,
}

#[derive(Clone, Debug, PartialEq)]
enum Literal {
    Number(f64),
    Str(String),
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Expr {
    GeoWithinBbox { west: f64, south: f64, east: f64, north: f64 },
    FieldCmp { field: String, op: CmpOp, literal: Literal },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

struct Tokenizer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    src: &'a str,
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    LParen,
    RParen,
    Comma,
    Dot,
    And,
    Or,
    Not,
    Op(CmpOp),
}

impl<'a> Tokenizer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            chars: src.char_indices().peekable(),
            src,
        }
    }

    fn tokenize(mut self) -> std::result::Result<Vec<Token>, String> {
        let mut tokens = Vec::new();
        while let Some(&(i, c)) = self.chars.peek() {
            if c.is_whitespace() {
                self.chars.next();
                continue;
            }
            match c {
                '(' => {
                    self.chars.next();
                    tokens.push(Token::LParen);
                }
                ')' => {
                    self.chars.next();
                    tokens.push(Token::RParen);
                }
                ',' => {
                    self.chars.next();
                    tokens.push(Token::Comma);
                }
                '.' => {
                    self.chars.next();
                    tokens.push(Token::Dot);
                }
                '&' => {
                    self.chars.next();
                    self.expect_char('&')?;
                    tokens.push(Token::And);
                }
                '|' => {
                    self.chars.next();
                    self.expect_char('|')?;
                    tokens.push(Token::Or);
                }
                '!' => {
                    self.chars.next();
                    if self.peek_char() == Some('=') {
                        self.chars.next();
                        tokens.push(Token::Op(CmpOp::Ne));
                    } else {
                        tokens.push(Token::Not);
                    }
                }
                '=' => {
                    self.chars.next();
                    self.expect_char('=')?;
                    tokens.push(Token::Op(CmpOp::Eq));
                }
                '>' => {
                    self.chars.next();
                    if self.peek_char() == Some('=') {
                        self.chars.next();
                        tokens.push(Token::Op(CmpOp::Ge));
                    } else {
                        tokens.push(Token::Op(CmpOp::Gt));
                    }
                }
                '<' => {
                    self.chars.next();
                    if self.peek_char() == Some('=') {
                        self.chars.next();
                        tokens.push(Token::Op(CmpOp::Le));
                    } else {
                        tokens.push(Token::Op(CmpOp::Lt));
                    }
                }
                '"' | '\'' => {
                    tokens.push(Token::Str(self.read_string(c)?));
                }
                _ if c.is_ascii_digit() || (c == '-' && self.looks_like_number()) => {
                    tokens.push(Token::Number(self.read_number()));
                }
                _ if c.is_alphabetic() || c == '_' => {
                    let start = i;
                    let end = self.read_ident_end();
                    tokens.push(Token::Ident(self.src[start..end].to_string()));
                }
                other => return Err(format!("unexpected character '{other}'")),
            }
        }
        Ok(tokens)
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn expect_char(&mut self, expected: char) -> std::result::Result<(), String> {
        match self.chars.next() {
            Some((_, c)) if c == expected => Ok(()),
            _ => Err(format!("expected '{expected}'")),
        }
    }

    fn looks_like_number(&self) -> bool {
        let mut clone = self.chars.clone();
        clone.next();
        matches!(clone.peek(), Some((_, c)) if c.is_ascii_digit())
    }

    fn read_number(&mut self) -> f64 {
        let start = self.chars.peek().unwrap().0;
        if self.peek_char() == Some('-') {
            self.chars.next();
        }
        let mut end = start + 1;
        while let Some(&(i, c)) = self.chars.peek() {
            if c.is_ascii_digit() || c == '.' {
                self.chars.next();
                end = i + c.len_utf8();
            } else {
                break;
            }
        }
        self.src[start..end].parse().unwrap_or(0.0)
    }

    fn read_ident_end(&mut self) -> usize {
        let mut end = self.chars.peek().unwrap().0;
        while let Some(&(i, c)) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.chars.next();
                end = i + c.len_utf8();
            } else {
                break;
            }
        }
        end
    }

    fn read_string(&mut self, quote: char) -> std::result::Result<String, String> {
        self.chars.next();
        let mut out = String::new();
        loop {
            match self.chars.next() {
                Some((_, c)) if c == quote => return Ok(out),
                Some((_, c)) => out.push(c),
                None => return Err("unterminated string literal".to_string()),
            }
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, tok: &Token) -> std::result::Result<(), String> {
        match self.next() {
            Some(t) if &t == tok => Ok(()),
            other => Err(format!("expected {tok:?}, got {other:?}")),
        }
    }

    fn parse_expr(&mut self) -> std::result::Result<Expr, String> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> std::result::Result<Expr, String> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> std::result::Result<Expr, String> {
        let mut lhs = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.parse_not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> std::result::Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> std::result::Result<Expr, String> {
        if self.peek() == Some(&Token::LParen) {
            self.next();
            let inner = self.parse_expr()?;
            self.expect(&Token::RParen)?;
            return Ok(inner);
        }
        match self.next() {
            Some(Token::Ident(name)) if name == "geo" => {
                self.expect(&Token::LParen)?;
                self.expect(&Token::RParen)?;
                match self.next() {
                    Some(Token::Ident(kw)) if kw == "within" => {}
                    other => return Err(format!("expected 'within', got {other:?}")),
                }
                match self.next() {
                    Some(Token::Ident(kw)) if kw == "bbox" => {}
                    other => return Err(format!("expected 'bbox', got {other:?}")),
                }
                self.expect(&Token::LParen)?;
                let west = self.expect_number()?;
                self.expect(&Token::Comma)?;
                let south = self.expect_number()?;
                self.expect(&Token::Comma)?;
                let east = self.expect_number()?;
                self.expect(&Token::Comma)?;
                let north = self.expect_number()?;
                self.expect(&Token::RParen)?;
                Ok(Expr::GeoWithinBbox { west, south, east, north })
            }
            Some(Token::Ident(name)) => {
                let op = match self.next() {
                    Some(Token::Op(op)) => op,
                    other => return Err(format!("expected comparison operator, got {other:?}")),
                };
                let literal = match self.next() {
                    Some(Token::Number(n)) => Literal::Number(n),
                    Some(Token::Str(s)) => Literal::Str(s),
                    other => return Err(format!("expected literal, got {other:?}")),
                };
                Ok(Expr::FieldCmp { field: name, op, literal })
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }

    fn expect_number(&mut self) -> std::result::Result<f64, String> {
        match self.next() {
            Some(Token::Number(n)) => Ok(n),
            other => Err(format!("expected number, got {other:?}")),
        }
    }
}

fn parse(src: &str) -> std::result::Result<Expr, String> {
    let tokens = Tokenizer::new(src).tokenize()?;
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err("trailing tokens after expression".to_string());
    }
    Ok(expr)
}

fn eval_expr(expr: &Expr, feature: &Feature, layer: &TileFeatureLayer) -> bool {
    match expr {
        Expr::GeoWithinBbox { west, south, east, north } => feature.geometry.within_bbox(*west, *south, *east, *north),
        Expr::FieldCmp { field, op, literal } => eval_field_cmp(field, *op, literal, feature, layer),
        Expr::And(a, b) => eval_expr(a, feature, layer) && eval_expr(b, feature, layer),
        Expr::Or(a, b) => eval_expr(a, feature, layer) || eval_expr(b, feature, layer),
        Expr::Not(a) => !eval_expr(a, feature, layer),
    }
}

fn eval_field_cmp(field: &str, op: CmpOp, literal: &Literal, feature: &Feature, layer: &TileFeatureLayer) -> bool {
    let Some(id) = layer.find_string(field) else {
        return false;
    };
    let Some(value) = feature.attributes.get(id) else {
        return false;
    };
    match (value, literal) {
        (NodeValue::Int64(v), Literal::Number(n)) => compare_f64(*v as f64, *n, op),
        (NodeValue::Float64(v), Literal::Number(n)) => compare_f64(*v, *n, op),
        (NodeValue::String(sid), Literal::Str(s)) => {
            let Some(resolved) = layer.resolve_string_pub(*sid) else {
                return false;
            };
            compare_str(&resolved, s, op)
        }
        _ => false,
    }
}

fn compare_f64(a: f64, b: f64, op: CmpOp) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Gt => a > b,
        CmpOp::Ge => a >= b,
        CmpOp::Lt => a < b,
        CmpOp::Le => a <= b,
    }
}

fn compare_str(a: &str, b: &str, op: CmpOp) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Gt => a > b,
        CmpOp::Ge => a >= b,
        CmpOp::Lt => a < b,
        CmpOp::Le => a <= b,
    }
}

/// Runs `query` over every feature in `layer`. Compilation errors surface
/// through `QueryDiagnostics::compile_error` rather than as an `Err`, per
/// §4.4.
pub fn evaluate(layer: &TileFeatureLayer, query: &str) -> Result<QueryOutcome> {
    let expr = match parse(query) {
        Ok(expr) => expr,
        Err(message) => {
            return Ok(QueryOutcome {
                matched: Vec::new(),
                diagnostics: QueryDiagnostics {
                    compile_error: Some(message),
                    trace: Vec::new(),
                },
            });
        }
    };
    let mut matched = Vec::new();
    let mut trace = Vec::new();
    for feature in layer.features() {
        let feature = feature?;
        let is_match = eval_expr(&expr, &feature, layer);
        trace.push(format!("{}: {}", feature.id, is_match));
        if is_match {
            matched.push(feature.id.clone());
        }
    }
    Ok(QueryOutcome {
        matched,
        diagnostics: QueryDiagnostics { compile_error: None, trace },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::feature_id::{IdPartValue, NamedIdPart};
    use crate::model::info::{FeatureTypeInfo, IdComposition, IdPart, IdPartDataType, LayerInfo, LayerType, Version};
    use crate::model::string_pool::StringPool;
    use crate::model::TileId;
    use std::sync::{Arc, RwLock};

    fn way_layer_info() -> Arc<LayerInfo> {
        Arc::new(LayerInfo {
            layer_id: "WayLayer".to_string(),
            layer_type: LayerType::Features,
            feature_types: vec![FeatureTypeInfo {
                name: "Way".to_string(),
                unique_id_compositions: vec![IdComposition {
                    parts: vec![
                        IdPart {
                            name: "areaId".to_string(),
                            datatype: IdPartDataType::Str,
                            is_optional: false,
                        },
                        IdPart {
                            name: "wayId".to_string(),
                            datatype: IdPartDataType::I64,
                            is_optional: false,
                        },
                    ],
                }],
            }],
            zoom_levels: vec![],
            coverage: None,
            can_read: true,
            can_write: true,
            version: Version::new(1, 0, 0),
        })
    }

    #[test]
    fn scenario_1_bbox_query_matches() {
        let layer_info = way_layer_info();
        let pool = Arc::new(RwLock::new(StringPool::new("node-a")));
        let mut layer = TileFeatureLayer::new(TileId::new(0, 0, 0), "node-a", "Tropico", layer_info, pool);
        layer
            .set_prefix(vec![NamedIdPart {
                name: "areaId".to_string(),
                value: IdPartValue::Str("TheBestArea".to_string()),
                is_optional: false,
            }])
            .unwrap();
        let feature_addr = layer
            .new_feature(
                "Way",
                vec![NamedIdPart {
                    name: "wayId".to_string(),
                    value: IdPartValue::I64(42),
                    is_optional: false,
                }],
            )
            .unwrap();
        let geom = layer.new_geometry(crate::model::geometry::GeometryType::Line);
        layer.append_point(geom, (41.0, 10.0, 0.0)).unwrap();
        layer.append_point(geom, (43.0, 11.0, 0.0)).unwrap();
        let collection = layer.new_geometry_collection();
        layer.push_geometry_to_collection(collection, geom).unwrap();
        layer.set_feature_geometry(feature_addr, collection).unwrap();

        let outcome = evaluate(&layer, "geo() within bbox(40,9,45,12)").unwrap();
        assert!(outcome.diagnostics.compile_error.is_none());
        assert_eq!(outcome.matched.len(), 1);
    }

    #[test]
    fn unparseable_query_reports_diagnostics_not_error() {
        let layer_info = way_layer_info();
        let pool = Arc::new(RwLock::new(StringPool::new("node-a")));
        let layer = TileFeatureLayer::new(TileId::new(0, 0, 0), "node-a", "Tropico", layer_info, pool);
        let outcome = evaluate(&layer, "geo( within").unwrap();
        assert!(outcome.diagnostics.compile_error.is_some());
        assert!(outcome.matched.is_empty());
    }
}
