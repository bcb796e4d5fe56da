use serde_json::{Map, Number, Value};

use odb_types::json::json_equals;

/// Value produced while evaluating an expression.
///
/// Scalars read from the JSON context are unwrapped into their own variants;
/// lists and maps stay as JSON. `Float` may hold NaN or infinities, which
/// plain JSON numbers cannot.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Value>),
    Object(Map<String, Value>),
}

impl ExprValue {
    /// Numeric view of the value, if it is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Truth value used by `if` and `validate` rules: `null` and zero are
    /// false, everything else is true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f as i64 != 0,
            _ => true,
        }
    }

    /// Collapse a one-element list into its element.
    pub fn expand_single(self) -> Self {
        match self {
            Self::Array(items) if items.len() == 1 => Self::from(&items[0]),
            other => other,
        }
    }

    /// Plain string form: strings unquoted, numbers in decimal, lists and
    /// maps as JSON, `null` as `None`.
    pub fn to_plain_string(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(b.to_string()),
            Self::Int(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::Str(s) => Some(s.clone()),
            Self::Array(_) | Self::Object(_) => Some(self.to_json().to_string()),
        }
    }

    /// JSON form. Non-finite floats become `null`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::Number((*i).into()),
            Self::Float(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
            Self::Str(s) => Value::String(s.clone()),
            Self::Array(items) => Value::Array(items.clone()),
            Self::Object(m) => Value::Object(m.clone()),
        }
    }

    /// Loose equality: numbers compare by value (as integers when both are
    /// integral), lists and maps structurally, other kinds never match.
    pub fn loose_eq(&self, other: &Self) -> bool {
        if let (Some(a), Some(b)) = (self.as_f64(), other.as_f64()) {
            if let (Some(x), Some(y)) = (integral(self), integral(other)) {
                return x == y;
            }
            return a == b;
        }
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Array(_), Self::Array(_)) | (Self::Object(_), Self::Object(_)) => {
                json_equals(&self.to_json(), &other.to_json())
            }
            _ => false,
        }
    }
}

/// Integer value of an integral number.
pub(crate) fn integral(v: &ExprValue) -> Option<i64> {
    match v {
        ExprValue::Int(i) => Some(*i),
        ExprValue::Float(f) if f.is_finite() && *f == f.ceil() => Some(*f as i64),
        _ => None,
    }
}

impl From<&Value> for ExprValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::Str(s.clone()),
            Value::Array(items) => Self::Array(items.clone()),
            Value::Object(m) => Self::Object(m.clone()),
        }
    }
}

impl From<&str> for ExprValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<i64> for ExprValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unwraps_scalars() {
        assert_eq!(ExprValue::from(&json!(3)), ExprValue::Int(3));
        assert_eq!(ExprValue::from(&json!(1.5)), ExprValue::Float(1.5));
        assert_eq!(ExprValue::from(&json!("a")), ExprValue::Str("a".into()));
        assert_eq!(ExprValue::from(&json!(null)), ExprValue::Null);
    }

    #[test]
    fn truthiness() {
        assert!(!ExprValue::Null.is_truthy());
        assert!(!ExprValue::Int(0).is_truthy());
        assert!(!ExprValue::Float(0.4).is_truthy());
        assert!(ExprValue::Int(2).is_truthy());
        assert!(ExprValue::Str(String::new()).is_truthy());
        assert!(ExprValue::Array(vec![]).is_truthy());
    }

    #[test]
    fn loose_equality() {
        assert!(ExprValue::Int(1).loose_eq(&ExprValue::Float(1.0)));
        assert!(!ExprValue::Int(1).loose_eq(&ExprValue::Str("1".into())));
        assert!(ExprValue::Null.loose_eq(&ExprValue::Null));
        assert!(ExprValue::from(&json!([1, "a"])).loose_eq(&ExprValue::from(&json!([1.0, "a"]))));
    }

    #[test]
    fn expand_single_element_list() {
        assert_eq!(ExprValue::from(&json!(["x"])).expand_single(), ExprValue::Str("x".into()));
        assert_eq!(
            ExprValue::from(&json!(["x", "y"])).expand_single(),
            ExprValue::from(&json!(["x", "y"]))
        );
    }

    #[test]
    fn non_finite_float_to_null() {
        assert_eq!(ExprValue::Float(f64::NAN).to_json(), Value::Null);
        assert_eq!(ExprValue::Float(2.5).to_json(), json!(2.5));
    }
}
