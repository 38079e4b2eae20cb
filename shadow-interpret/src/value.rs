#![forbid(unsafe_code)]

use std::fmt;

use shadow_ast::CType;
use shadow_core::Ratio;

/// A runtime value. `Float` is kept exact; only C's integer conversions
/// (truncating division, `%`, assignment to `int`) lose precision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Int(i128),
    Float(Ratio),
    Array(Vec<Ratio>),
}

impl Value {
    pub fn float(n: i128) -> Self {
        Value::Float(Ratio::integer(n))
    }

    pub fn array(items: impl IntoIterator<Item = i128>) -> Self {
        Value::Array(items.into_iter().map(Ratio::integer).collect())
    }

    /// Numeric value of a scalar.
    pub fn as_ratio(&self) -> Option<Ratio> {
        match self {
            Value::Int(i) => Ratio::new(*i, 1),
            Value::Float(r) => Some(*r),
            Value::Array(_) => None,
        }
    }

    pub fn truthy(&self) -> Option<bool> {
        self.as_ratio().map(|r| !r.is_zero())
    }

    pub fn bool(b: bool) -> Self {
        Value::Int(b as i128)
    }

    /// Conversion on assignment to a variable of type `ty`.
    pub fn coerce(self, ty: CType) -> Value {
        match (ty, self) {
            (CType::Int | CType::Bool, Value::Float(r)) => Value::Int(r.numer() / r.denom()),
            (CType::Float | CType::Double, Value::Int(i)) => Value::float(i),
            (_, v) => v,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(r) => write!(f, "{r}"),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, r) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{r}")?;
                }
                f.write_str("]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_assignment_truncates_toward_zero() {
        let r = Ratio::new(-7, 2).unwrap();
        assert_eq!(Value::Float(r).coerce(CType::Int), Value::Int(-3));
        assert_eq!(Value::Int(2).coerce(CType::Float), Value::float(2));
    }
}
