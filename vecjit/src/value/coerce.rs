//! Total coercion table between the numeric/logical value kinds.
//!
//! `integer <-> double <-> logical` conversions are always defined and
//! preserve NA; `character -> numeric` is the one direction that can fail,
//! with a [`crate::error::VecjitError::TypeError`].

use super::vector::Vector;
use super::{is_na_double, na_double, Value, NA_INTEGER, NA_LOGICAL};
use crate::error::{VResult, VecjitError};

/// Coerce `self` to the vector kind `T` selects, preserving NA at each
/// element independently of its neighbors.
pub trait CoerceTo<T> {
    fn coerce(&self) -> VResult<Vector<T>>;
}

impl CoerceTo<f64> for Value {
    fn coerce(&self) -> VResult<Vector<f64>> {
        match self {
            Value::Double(v) => Ok(v.clone()),
            Value::Integer(v) => Ok(Vector::from_vec(
                v.as_slice()
                    .iter()
                    .map(|&x| if x == NA_INTEGER { na_double() } else { x as f64 })
                    .collect(),
            )),
            Value::Logical(v) => Ok(Vector::from_vec(
                v.as_slice()
                    .iter()
                    .map(|&x| {
                        if x == NA_LOGICAL {
                            na_double()
                        } else {
                            x as f64
                        }
                    })
                    .collect(),
            )),
            other => Err(VecjitError::TypeError {
                expected: "double".into(),
                got: other.vtype().name().into(),
            }),
        }
    }
}

impl CoerceTo<i64> for Value {
    fn coerce(&self) -> VResult<Vector<i64>> {
        match self {
            Value::Integer(v) => Ok(v.clone()),
            Value::Double(v) => Ok(Vector::from_vec(
                v.as_slice()
                    .iter()
                    .map(|&x| {
                        if is_na_double(x) || x.is_nan() {
                            NA_INTEGER
                        } else {
                            x as i64
                        }
                    })
                    .collect(),
            )),
            Value::Logical(v) => Ok(Vector::from_vec(
                v.as_slice()
                    .iter()
                    .map(|&x| if x == NA_LOGICAL { NA_INTEGER } else { x as i64 })
                    .collect(),
            )),
            other => Err(VecjitError::TypeError {
                expected: "integer".into(),
                got: other.vtype().name().into(),
            }),
        }
    }
}

impl CoerceTo<u8> for Value {
    fn coerce(&self) -> VResult<Vector<u8>> {
        match self {
            Value::Logical(v) => Ok(v.clone()),
            Value::Integer(v) => Ok(Vector::from_vec(
                v.as_slice()
                    .iter()
                    .map(|&x| {
                        if x == NA_INTEGER {
                            NA_LOGICAL
                        } else {
                            (x != 0) as u8
                        }
                    })
                    .collect(),
            )),
            Value::Double(v) => Ok(Vector::from_vec(
                v.as_slice()
                    .iter()
                    .map(|&x| {
                        if is_na_double(x) || x.is_nan() {
                            NA_LOGICAL
                        } else {
                            (x != 0.0) as u8
                        }
                    })
                    .collect(),
            )),
            other => Err(VecjitError::TypeError {
                expected: "logical".into(),
                got: other.vtype().name().into(),
            }),
        }
    }
}

/// Integer addition that returns `NA_INTEGER` on overflow instead of
/// trapping, matching the "Overflow yields NA" invariant.
pub fn checked_add_i64(a: i64, b: i64) -> i64 {
    if a == NA_INTEGER || b == NA_INTEGER {
        return NA_INTEGER;
    }
    a.checked_add(b).unwrap_or(NA_INTEGER)
}

pub fn checked_mul_i64(a: i64, b: i64) -> i64 {
    if a == NA_INTEGER || b == NA_INTEGER {
        return NA_INTEGER;
    }
    a.checked_mul(b).unwrap_or(NA_INTEGER)
}

pub fn checked_sub_i64(a: i64, b: i64) -> i64 {
    if a == NA_INTEGER || b == NA_INTEGER {
        return NA_INTEGER;
    }
    a.checked_sub(b).unwrap_or(NA_INTEGER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_overflow_yields_na_not_trap() {
        assert_eq!(checked_add_i64(i64::MAX, 1), NA_INTEGER);
        assert_eq!(checked_mul_i64(i64::MAX, 2), NA_INTEGER);
    }

    #[test]
    fn integer_to_double_preserves_na() {
        let v = Value::Integer(Vector::from_vec(vec![1, NA_INTEGER, 3]));
        let d: Vector<f64> = v.coerce().unwrap();
        assert_eq!(d.as_slice()[0], 1.0);
        assert!(is_na_double(d.as_slice()[1]));
        assert_eq!(d.as_slice()[2], 3.0);
    }

    #[test]
    fn character_to_numeric_is_a_type_error() {
        let v = Value::Character(Vector::from_vec(vec![1u32]));
        let r: VResult<Vector<f64>> = v.coerce();
        assert!(matches!(r, Err(VecjitError::TypeError { .. })));
    }
}
