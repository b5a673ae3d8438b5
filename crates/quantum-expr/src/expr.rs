use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value as JsonValue};
use std::fmt;
use thiserror::Error;

/// Symbol used by the editor for a mandatory argument that has no value yet.
///
/// Inline evaluations carry it in their result slot until a result arrives.
pub const MISSING: &str = "Missing";

/// An immutable, recursively nested MathJSON-like value.
///
/// The same type is used for the stored cell expression and for the payloads
/// exchanged with the computer-algebra backend.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Number(f64),
    Symbol(String),
    /// String literal (`"'text'"` or `{"str": "text"}` in MathJSON).
    String(String),
    /// Function application, e.g. `["Add", 3, "x"]`.
    Function { head: String, args: Vec<Expr> },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExprError {
    #[error("expression cannot contain booleans")]
    Boolean,
    #[error("expression cannot be null")]
    Null,
    #[error("function application must have a head")]
    EmptyFunction,
    #[error("function head must be a symbol, found {0}")]
    InvalidHead(String),
    #[error("invalid number literal: {0}")]
    InvalidNumber(String),
    #[error("unsupported expression object: {0}")]
    UnsupportedObject(String),
}

impl Expr {
    pub fn number(value: f64) -> Self {
        Expr::Number(value)
    }

    pub fn symbol(name: impl Into<String>) -> Self {
        Expr::Symbol(name.into())
    }

    pub fn string(text: impl Into<String>) -> Self {
        Expr::String(text.into())
    }

    pub fn function(head: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Function {
            head: head.into(),
            args,
        }
    }

    /// The pending-result placeholder.
    pub fn missing() -> Self {
        Expr::Symbol(MISSING.to_string())
    }

    /// Returns true for `"Missing"` and `["Missing", ...]`.
    pub fn is_missing(&self) -> bool {
        match self {
            Expr::Symbol(name) => name == MISSING,
            Expr::Function { head, .. } => head == MISSING,
            _ => false,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Expr::Symbol(name) => Some(name),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Expr::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn head(&self) -> Option<&str> {
        match self {
            Expr::Function { head, .. } => Some(head),
            _ => None,
        }
    }

    pub fn args(&self) -> &[Expr] {
        match self {
            Expr::Function { args, .. } => args,
            _ => &[],
        }
    }

    /// Follows `path` (argument indices) from this node.
    pub fn at_path(&self, path: &[usize]) -> Option<&Expr> {
        let mut node = self;
        for &idx in path {
            node = node.args().get(idx)?;
        }
        Some(node)
    }

    pub fn at_path_mut(&mut self, path: &[usize]) -> Option<&mut Expr> {
        let mut node = self;
        for &idx in path {
            node = match node {
                Expr::Function { args, .. } => args.get_mut(idx)?,
                _ => return None,
            };
        }
        Some(node)
    }

    /// Replaces the node at `path`. Returns false if the path does not exist.
    pub fn replace_at(&mut self, path: &[usize], value: Expr) -> bool {
        match self.at_path_mut(path) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn from_json(value: &JsonValue) -> Result<Self, ExprError> {
        match value {
            JsonValue::Null => Err(ExprError::Null),
            JsonValue::Bool(_) => Err(ExprError::Boolean),
            JsonValue::Number(n) => n
                .as_f64()
                .map(Expr::Number)
                .ok_or_else(|| ExprError::InvalidNumber(n.to_string())),
            JsonValue::String(text) => Ok(Self::from_atom(text)),
            JsonValue::Array(items) => Self::from_items(items),
            JsonValue::Object(map) => Self::from_object(map),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ExprError> {
        let value: JsonValue = serde_json::from_str(json)
            .map_err(|err| ExprError::UnsupportedObject(err.to_string()))?;
        Self::from_json(&value)
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Expr::Number(value) => number_to_json(*value),
            Expr::Symbol(name) => {
                if is_reserved_atom(name) {
                    let mut map = Map::new();
                    map.insert("sym".to_string(), JsonValue::String(name.clone()));
                    JsonValue::Object(map)
                } else {
                    JsonValue::String(name.clone())
                }
            }
            Expr::String(text) => JsonValue::String(format!("'{text}'")),
            Expr::Function { head, args } => {
                let mut items = Vec::with_capacity(args.len() + 1);
                items.push(JsonValue::String(head.clone()));
                items.extend(args.iter().map(Expr::to_json));
                JsonValue::Array(items)
            }
        }
    }

    fn from_atom(text: &str) -> Self {
        match text {
            "NaN" => Expr::Number(f64::NAN),
            "+Infinity" => Expr::Number(f64::INFINITY),
            "-Infinity" => Expr::Number(f64::NEG_INFINITY),
            _ if text.len() >= 2 && text.starts_with('\'') && text.ends_with('\'') => {
                Expr::String(text[1..text.len() - 1].to_string())
            }
            _ => Expr::Symbol(text.to_string()),
        }
    }

    fn from_items(items: &[JsonValue]) -> Result<Self, ExprError> {
        let (head, rest) = items.split_first().ok_or(ExprError::EmptyFunction)?;
        let head = match head {
            JsonValue::String(name) => name.clone(),
            other => return Err(ExprError::InvalidHead(other.to_string())),
        };
        let args = rest
            .iter()
            .map(Expr::from_json)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Expr::Function { head, args })
    }

    fn from_object(map: &Map<String, JsonValue>) -> Result<Self, ExprError> {
        if let Some(num) = map.get("num") {
            return match num {
                JsonValue::Number(n) => n
                    .as_f64()
                    .map(Expr::Number)
                    .ok_or_else(|| ExprError::InvalidNumber(n.to_string())),
                JsonValue::String(text) => parse_number_literal(text).map(Expr::Number),
                other => Err(ExprError::InvalidNumber(other.to_string())),
            };
        }
        if let Some(JsonValue::String(name)) = map.get("sym") {
            return Ok(Expr::Symbol(name.clone()));
        }
        if let Some(JsonValue::String(text)) = map.get("str") {
            return Ok(Expr::String(text.clone()));
        }
        if let Some(JsonValue::Array(items)) = map.get("fn") {
            return Self::from_items(items);
        }
        Err(ExprError::UnsupportedObject(
            JsonValue::Object(map.clone()).to_string(),
        ))
    }
}

fn parse_number_literal(text: &str) -> Result<f64, ExprError> {
    // MathJSON allows a trailing `n` (bignum) or `d` (decimal) marker.
    let trimmed = text
        .strip_suffix('n')
        .or_else(|| text.strip_suffix('d'))
        .unwrap_or(text);
    match trimmed {
        "NaN" => Ok(f64::NAN),
        "+Infinity" | "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        _ => trimmed
            .parse::<f64>()
            .map_err(|_| ExprError::InvalidNumber(text.to_string())),
    }
}

fn number_to_json(value: f64) -> JsonValue {
    if value.is_nan() {
        return JsonValue::String("NaN".to_string());
    }
    if value.is_infinite() {
        let text = if value > 0.0 { "+Infinity" } else { "-Infinity" };
        return JsonValue::String(text.to_string());
    }
    if value.fract() == 0.0 && value.abs() < 9.007_199_254_740_992e15 {
        return JsonValue::Number(Number::from(value as i64));
    }
    Number::from_f64(value)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

/// Atoms whose bare-string spelling would be read back as something other than a symbol.
fn is_reserved_atom(name: &str) -> bool {
    matches!(name, "NaN" | "+Infinity" | "-Infinity")
        || (name.len() >= 2 && name.starts_with('\'') && name.ends_with('\''))
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::Number(value)
    }
}

impl From<&str> for Expr {
    fn from(value: &str) -> Self {
        Expr::Symbol(value.to_string())
    }
}

impl Serialize for Expr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Expr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = JsonValue::deserialize(deserializer)?;
        Expr::from_json(&raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_mathjson_shorthand_and_object_forms() {
        let expr = Expr::from_json(&json!(["Add", 3, "x", {"num": "2.5d"}, "'hi'"])).unwrap();
        assert_eq!(
            expr,
            Expr::function(
                "Add",
                vec![
                    Expr::number(3.0),
                    Expr::symbol("x"),
                    Expr::number(2.5),
                    Expr::string("hi"),
                ]
            )
        );

        let expr = Expr::from_json(&json!({"fn": ["Sin", {"sym": "y"}]})).unwrap();
        assert_eq!(expr, Expr::function("Sin", vec![Expr::symbol("y")]));
    }

    #[test]
    fn special_number_spellings() {
        assert!(Expr::from_json(&json!("NaN")).unwrap().as_number().unwrap().is_nan());
        assert_eq!(
            Expr::from_json(&json!("-Infinity")).unwrap(),
            Expr::number(f64::NEG_INFINITY)
        );
        assert_eq!(Expr::number(f64::INFINITY).to_json(), json!("+Infinity"));
    }

    #[test]
    fn rejects_values_outside_the_expression_model() {
        assert_eq!(Expr::from_json(&json!(true)), Err(ExprError::Boolean));
        assert_eq!(Expr::from_json(&json!(null)), Err(ExprError::Null));
        assert_eq!(Expr::from_json(&json!([])), Err(ExprError::EmptyFunction));
        assert!(matches!(
            Expr::from_json(&json!([["Inverse", "Sin"], "x"])),
            Err(ExprError::InvalidHead(_))
        ));
        assert!(matches!(
            Expr::from_json(&json!({"dict": {}})),
            Err(ExprError::UnsupportedObject(_))
        ));
    }

    #[test]
    fn reserved_symbol_names_stay_symbols_through_json() {
        let sym = Expr::symbol("NaN");
        let back = Expr::from_json(&sym.to_json()).unwrap();
        assert_eq!(back, sym);
    }

    #[test]
    fn integral_numbers_serialize_without_fraction() {
        assert_eq!(Expr::number(5.0).to_json(), json!(5));
        assert_eq!(Expr::number(0.5).to_json(), json!(0.5));
    }

    #[test]
    fn path_replacement() {
        let mut expr = Expr::function(
            "Equal",
            vec![Expr::function("Add", vec![3.0.into(), 2.0.into()]), Expr::missing()],
        );
        assert!(expr.at_path(&[1]).unwrap().is_missing());
        assert!(expr.replace_at(&[1], Expr::number(5.0)));
        assert_eq!(expr.at_path(&[1]), Some(&Expr::number(5.0)));
        assert!(!expr.replace_at(&[0, 5], Expr::number(1.0)));
    }
}
