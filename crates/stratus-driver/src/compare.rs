//! Ordering and equality semantics for query evaluation.
//!
//! Numeric values coerce along int → long → double → decimal; strings are
//! ordinal; binary, arrays and maps support equality only. SQL NULL, JSON
//! null and EMPTY are "special": they order at a caller-chosen end, with
//! EMPTY below both nulls, and are equal only to themselves.

use std::cmp::Ordering;

use bigdecimal::BigDecimal;

use crate::error::Error;
use crate::value::{FieldValue, MapValue};

/// One key of a sort: field name, direction, and where specials go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub field: String,
    pub descending: bool,
    pub nulls_first: bool,
}

impl SortSpec {
    pub fn asc(field: &str) -> Self {
        SortSpec {
            field: field.to_string(),
            descending: false,
            nulls_first: false,
        }
    }

    pub fn desc(field: &str) -> Self {
        SortSpec {
            field: field.to_string(),
            descending: true,
            nulls_first: true,
        }
    }
}

const EMPTY: FieldValue = FieldValue::Empty;

/// Rank among the special values: EMPTY < JSON null < SQL NULL.
fn special_rank(v: &FieldValue) -> Option<u8> {
    match v {
        FieldValue::Empty => Some(0),
        FieldValue::JsonNull => Some(1),
        FieldValue::Null => Some(2),
        _ => None,
    }
}

/// Compare two values, sending specials to the end selected by `null_rank`
/// (positive: specials order above every normal value; negative: below).
///
/// Fails with [`Error::ComparisonNotSupported`] for type pairs that have no
/// order (binary, arrays, maps, and any remaining cross-type pair).
pub(crate) fn query_compare(
    a: &FieldValue,
    b: &FieldValue,
    null_rank: i8,
) -> Result<Ordering, Error> {
    match (special_rank(a), special_rank(b)) {
        (Some(ra), Some(rb)) => Ok(ra.cmp(&rb)),
        (Some(_), None) => Ok(if null_rank > 0 {
            Ordering::Greater
        } else {
            Ordering::Less
        }),
        (None, Some(_)) => Ok(if null_rank > 0 {
            Ordering::Less
        } else {
            Ordering::Greater
        }),
        (None, None) => compare_atomics(a, b),
    }
}

/// Compare under a [`SortSpec`]: `descending` flips the order of normal
/// values; special values obey `nulls_first` directly and keep their
/// relative ranks, so they stay contiguous at the chosen end.
pub(crate) fn compare_total_order(
    a: &FieldValue,
    b: &FieldValue,
    spec: &SortSpec,
) -> Result<Ordering, Error> {
    match (special_rank(a), special_rank(b)) {
        (Some(ra), Some(rb)) => Ok(ra.cmp(&rb)),
        (Some(_), None) => Ok(if spec.nulls_first {
            Ordering::Less
        } else {
            Ordering::Greater
        }),
        (None, Some(_)) => Ok(if spec.nulls_first {
            Ordering::Greater
        } else {
            Ordering::Less
        }),
        (None, None) => {
            let ord = compare_atomics(a, b)?;
            Ok(if spec.descending { ord.reverse() } else { ord })
        }
    }
}

/// Compare two rows under a sort key list. A row missing a sort field
/// contributes EMPTY for that key.
pub(crate) fn compare_rows(
    a: &MapValue,
    b: &MapValue,
    specs: &[SortSpec],
) -> Result<Ordering, Error> {
    for spec in specs {
        let av = a.get(&spec.field).unwrap_or(&EMPTY);
        let bv = b.get(&spec.field).unwrap_or(&EMPTY);
        match compare_total_order(av, bv, spec)? {
            Ordering::Equal => continue,
            other => return Ok(other),
        }
    }
    Ok(Ordering::Equal)
}

fn compare_atomics(a: &FieldValue, b: &FieldValue) -> Result<Ordering, Error> {
    use FieldValue::*;
    match (a, b) {
        (Integer(x), Integer(y)) => Ok(x.cmp(y)),
        (Integer(x), Long(y)) => Ok((*x as i64).cmp(y)),
        (Long(x), Integer(y)) => Ok(x.cmp(&(*y as i64))),
        (Long(x), Long(y)) => Ok(x.cmp(y)),

        (Double(x), Double(y)) => Ok(x.total_cmp(y)),
        (Integer(x), Double(y)) => Ok((*x as f64).total_cmp(y)),
        (Long(x), Double(y)) => Ok((*x as f64).total_cmp(y)),
        (Double(x), Integer(y)) => Ok(x.total_cmp(&(*y as f64))),
        (Double(x), Long(y)) => Ok(x.total_cmp(&(*y as f64))),

        (Decimal(x), Decimal(y)) => Ok(x.cmp(y)),
        (Integer(x), Decimal(y)) => Ok(BigDecimal::from(*x as i64).cmp(y)),
        (Long(x), Decimal(y)) => Ok(BigDecimal::from(*x).cmp(y)),
        (Decimal(x), Integer(y)) => Ok(x.cmp(&BigDecimal::from(*y as i64))),
        (Decimal(x), Long(y)) => Ok(x.cmp(&BigDecimal::from(*y))),
        (Double(x), Decimal(y)) => Ok(compare_double_decimal(*x, y)),
        (Decimal(x), Double(y)) => Ok(compare_double_decimal(*y, x).reverse()),

        (String(x), String(y)) => Ok(x.as_bytes().cmp(y.as_bytes())),
        (Boolean(x), Boolean(y)) => Ok(x.cmp(y)),
        (Timestamp(x), Timestamp(y)) => Ok(x.cmp(y)),

        _ => Err(Error::ComparisonNotSupported(format!(
            "cannot order {a:?} against {b:?}"
        ))),
    }
}

/// Double against exact decimal. NaN sorts above every number; infinities
/// sort outside any finite decimal; finite doubles convert exactly.
fn compare_double_decimal(d: f64, dec: &BigDecimal) -> Ordering {
    if d.is_nan() {
        return Ordering::Greater;
    }
    if d == f64::INFINITY {
        return Ordering::Greater;
    }
    if d == f64::NEG_INFINITY {
        return Ordering::Less;
    }
    match BigDecimal::try_from(d) {
        Ok(exact) => exact.cmp(dec),
        // try_from only fails on non-finite input, handled above
        Err(_) => Ordering::Greater,
    }
}

/// Structural equality under query semantics.
///
/// Numerics compare across widths; specials equal only the same special;
/// maps require key-set equality plus per-key value equality; any other
/// cross-type pair is unequal (never an error).
pub(crate) fn query_equals(a: &FieldValue, b: &FieldValue) -> bool {
    use FieldValue::*;
    match (a, b) {
        (Null, Null) | (JsonNull, JsonNull) | (Empty, Empty) => true,
        (String(x), String(y)) => x == y,
        (Boolean(x), Boolean(y)) => x == y,
        (Timestamp(x), Timestamp(y)) => x == y,
        (Binary(x), Binary(y)) => x == y,
        (Array(x), Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(u, v)| query_equals(u, v))
        }
        (Map(x), Map(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| match y.get(k) {
                    Some(w) => query_equals(v, w),
                    None => false,
                })
        }
        _ if a.is_numeric() && b.is_numeric() => {
            matches!(compare_atomics(a, b), Ok(Ordering::Equal))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmp(a: FieldValue, b: FieldValue) -> Ordering {
        query_compare(&a, &b, 1).unwrap()
    }

    // ── numeric coercion ───────────────────────────────────────────────

    #[test]
    fn cross_width_integers() {
        assert_eq!(cmp(5.into(), FieldValue::Long(5)), Ordering::Equal);
        assert_eq!(cmp(5.into(), FieldValue::Long(6)), Ordering::Less);
        assert_eq!(
            cmp(FieldValue::Long(i64::MAX), 1.into()),
            Ordering::Greater
        );
    }

    #[test]
    fn integer_against_double() {
        assert_eq!(cmp(2.into(), FieldValue::Double(2.0)), Ordering::Equal);
        assert_eq!(cmp(2.into(), FieldValue::Double(2.5)), Ordering::Less);
    }

    #[test]
    fn decimal_is_exact_against_double() {
        // 0.1 as a double is not exactly 1/10
        let tenth: BigDecimal = "0.1".parse().unwrap();
        let ord = cmp(FieldValue::Double(0.1), FieldValue::Decimal(tenth));
        assert_eq!(ord, Ordering::Greater);
    }

    #[test]
    fn nan_and_infinities_against_decimal() {
        let one: BigDecimal = "1".parse().unwrap();
        assert_eq!(
            cmp(FieldValue::Double(f64::NAN), FieldValue::Decimal(one.clone())),
            Ordering::Greater
        );
        assert_eq!(
            cmp(
                FieldValue::Double(f64::NEG_INFINITY),
                FieldValue::Decimal(one.clone())
            ),
            Ordering::Less
        );
        assert_eq!(
            cmp(FieldValue::Decimal(one), FieldValue::Double(f64::INFINITY)),
            Ordering::Less
        );
    }

    // ── specials ───────────────────────────────────────────────────────

    #[test]
    fn null_rank_places_specials() {
        assert_eq!(
            query_compare(&FieldValue::Null, &1.into(), 1).unwrap(),
            Ordering::Greater
        );
        assert_eq!(
            query_compare(&FieldValue::Null, &1.into(), -1).unwrap(),
            Ordering::Less
        );
    }

    #[test]
    fn empty_sorts_below_both_nulls() {
        assert_eq!(
            cmp(FieldValue::Empty, FieldValue::JsonNull),
            Ordering::Less
        );
        assert_eq!(cmp(FieldValue::Empty, FieldValue::Null), Ordering::Less);
        assert_eq!(cmp(FieldValue::JsonNull, FieldValue::Null), Ordering::Less);
    }

    #[test]
    fn descending_does_not_move_specials() {
        let spec = SortSpec {
            field: "a".into(),
            descending: true,
            nulls_first: false,
        };
        // Specials stay at the "last" end even though order is descending.
        assert_eq!(
            compare_total_order(&FieldValue::Null, &1.into(), &spec).unwrap(),
            Ordering::Greater
        );
        // Normal values flip.
        assert_eq!(
            compare_total_order(&1.into(), &2.into(), &spec).unwrap(),
            Ordering::Greater
        );
    }

    // ── unordered types ────────────────────────────────────────────────

    #[test]
    fn binary_has_equality_but_no_order() {
        let a = FieldValue::Binary(vec![1, 2]);
        let b = FieldValue::Binary(vec![1, 2]);
        assert!(query_equals(&a, &b));
        assert!(query_compare(&a, &b, 1).is_err());
    }

    #[test]
    fn cross_type_compare_fails_equality_is_false() {
        let s: FieldValue = "1".into();
        let n: FieldValue = 1.into();
        assert!(query_compare(&s, &n, 1).is_err());
        assert!(!query_equals(&s, &n));
    }

    // ── structural equality ────────────────────────────────────────────

    #[test]
    fn map_equality_is_key_set_based() {
        let a = MapValue::new().with("x", 1).with("y", 2);
        let b = MapValue::new().with("y", 2).with("x", FieldValue::Long(1));
        assert!(query_equals(&FieldValue::Map(a), &FieldValue::Map(b)));
    }

    #[test]
    fn array_equality_is_positional() {
        let a = FieldValue::Array(vec![1.into(), 2.into()]);
        let b = FieldValue::Array(vec![2.into(), 1.into()]);
        assert!(!query_equals(&a, &b));
    }

    #[test]
    fn specials_equal_only_themselves() {
        assert!(!query_equals(&FieldValue::Null, &FieldValue::JsonNull));
        assert!(!query_equals(&FieldValue::Empty, &FieldValue::Null));
        assert!(query_equals(&FieldValue::Empty, &FieldValue::Empty));
    }

    // ── row comparison ─────────────────────────────────────────────────

    #[test]
    fn rows_compare_by_spec_order() {
        let specs = vec![SortSpec::asc("a"), SortSpec::desc("b")];
        let r1 = MapValue::new().with("a", 1).with("b", 9);
        let r2 = MapValue::new().with("a", 1).with("b", 3);
        // a ties; b descending puts 9 before 3
        assert_eq!(compare_rows(&r1, &r2, &specs).unwrap(), Ordering::Less);
    }

    #[test]
    fn nulls_sort_contiguously_at_the_configured_end() {
        let specs = vec![SortSpec::asc("a")];
        let mut rows: Vec<MapValue> = vec![
            MapValue::new().with("a", 3),
            MapValue::new().with("a", FieldValue::Null),
            MapValue::new().with("a", 1),
            MapValue::new().with("a", FieldValue::JsonNull),
            MapValue::new().with("a", 2),
        ];
        rows.sort_by(|x, y| compare_rows(x, y, &specs).unwrap());
        let is_special: Vec<bool> = rows
            .iter()
            .map(|r| r.get("a").unwrap().is_special())
            .collect();
        // nulls_first = false: both null flavors together at the tail.
        assert_eq!(is_special, vec![false, false, false, true, true]);
    }

    #[test]
    fn missing_sort_field_is_empty() {
        let specs = vec![SortSpec::asc("a")];
        let with_a = MapValue::new().with("a", 1);
        let without = MapValue::new().with("b", 1);
        // EMPTY sorts after normal values when nulls_first is false
        assert_eq!(
            compare_rows(&without, &with_a, &specs).unwrap(),
            Ordering::Greater
        );
    }
}
