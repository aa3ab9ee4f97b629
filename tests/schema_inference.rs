use bulketl::{coerce, infer_value_type, literal_type, InferredType, TableSchema};
use serde_json::{json, Value};

use InferredType::*;

fn fold(values: &[Value]) -> InferredType {
    let mut schema = TableSchema::new();
    for v in values {
        schema.observe("c", v);
    }
    schema.type_of("c").unwrap()
}

/// Heap's algorithm; small inputs only.
fn permutations(values: &[Value]) -> Vec<Vec<Value>> {
    fn go(k: usize, a: &mut Vec<Value>, out: &mut Vec<Vec<Value>>) {
        if k <= 1 {
            out.push(a.clone());
            return;
        }
        for i in 0..k {
            go(k - 1, a, out);
            if k % 2 == 0 { a.swap(i, k - 1) } else { a.swap(0, k - 1) }
        }
    }
    let mut a = values.to_vec();
    let mut out = Vec::new();
    go(a.len(), &mut a, &mut out);
    out
}

#[test]
fn widening_follows_the_lattice() {
    assert_eq!(Boolean.join(Integer), Integer);
    assert_eq!(Integer.join(String), String);
    assert_eq!(Timestamp.join(Null), Timestamp);
    assert_eq!(Timestamp.join(Integer), String);
    assert_eq!(Integer.join(Float), Float);
    assert_eq!(Null.join(Null), Null);

    assert_eq!(fold(&[json!(true), json!(3)]), Integer);
    assert_eq!(fold(&[json!(3), json!("abc")]), String);
    assert_eq!(fold(&[json!("2024-01-05"), Value::Null]), Timestamp);
    assert_eq!(fold(&[json!("2024-01-05T10:00:00Z"), json!(17)]), String);
}

#[test]
fn inference_is_order_independent() {
    let multisets = vec![
        vec![json!(true), json!(1), json!("2.5"), Value::Null],
        vec![json!("2024-01-05"), Value::Null, json!(""), json!("2024-02-01 10:11:12")],
        vec![json!("2024-01-05"), json!(4), json!(false)],
        vec![json!(1), json!("x"), json!(2.0), json!(true)],
    ];
    for values in multisets {
        let expected = fold(&values);
        for p in permutations(&values) {
            assert_eq!(fold(&p), expected, "order {p:?} disagrees");
        }
    }
}

#[test]
fn join_is_commutative_associative_and_null_is_identity() {
    let all = [Null, Boolean, Integer, Float, String, Timestamp];
    for a in all {
        assert_eq!(a.join(Null), a);
        assert_eq!(a.join(a), a);
        for b in all {
            assert_eq!(a.join(b), b.join(a), "{a} vs {b}");
            for c in all {
                assert_eq!(a.join(b).join(c), a.join(b.join(c)), "{a} {b} {c}");
            }
        }
    }
}

#[test]
fn strings_are_typed_by_their_literal_form() {
    assert_eq!(literal_type(""), Null);
    assert_eq!(literal_type("  "), Null);
    assert_eq!(literal_type("TRUE"), Boolean);
    assert_eq!(literal_type("-42"), Integer);
    assert_eq!(literal_type("007"), String);
    assert_eq!(literal_type("99999999999999999999"), String);
    assert_eq!(literal_type("3.25"), Float);
    assert_eq!(literal_type("1e5"), Float);
    assert_eq!(literal_type("2024-01-05T10:00:00+02:00"), Timestamp);
    assert_eq!(literal_type("2024-01-05"), Timestamp);
    assert_eq!(literal_type("2024-13-05"), String);
    assert_eq!(literal_type("gid://shop/Product/1"), String);

    assert_eq!(infer_value_type(&json!(1.5)), Float);
    assert_eq!(infer_value_type(&json!({"a": 1})), String);
    assert_eq!(infer_value_type(&json!([1, 2])), String);
}

#[test]
fn columns_keep_insertion_order() {
    let mut schema = TableSchema::new();
    schema.observe("b", &json!(1));
    schema.observe("a", &json!("x"));
    schema.observe("b", &json!("y"));
    let names: Vec<&str> = schema.columns().iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, ["b", "a"]);
    assert_eq!(schema.type_of("b"), Some(String));
    assert_eq!(schema.index_of("a"), Some(1));
}

#[test]
fn coercion_renders_cells_in_the_final_type() {
    assert_eq!(coerce(&json!(true), Integer), json!(1));
    assert_eq!(coerce(&json!("false"), Integer), json!(0));
    assert_eq!(coerce(&json!("12"), Integer), json!(12));
    assert_eq!(coerce(&json!(5), Float), json!(5.0));
    assert_eq!(coerce(&json!("7.5"), Float), json!(7.5));
    assert_eq!(coerce(&json!("True"), Boolean), json!(true));
    assert_eq!(coerce(&json!(3), String), json!("3"));
    assert_eq!(coerce(&json!({"a": 1}), String), json!("{\"a\":1}"));
    assert_eq!(coerce(&json!(""), String), Value::Null);
    assert_eq!(coerce(&Value::Null, Integer), Value::Null);
}

#[test]
fn floats_out_of_range_stay_text() {
    assert_eq!(literal_type("1e400"), String);
    assert_eq!(literal_type("-2.5E999"), String);
    assert_eq!(literal_type("1e300"), Float);

    let column = [json!("1.5"), json!("1e400")];
    assert_eq!(fold(&column), String);
    assert_eq!(coerce(&column[1], fold(&column)), json!("1e400"));
    assert_eq!(coerce(&json!("1e400"), Float), json!("1e400"));
}
