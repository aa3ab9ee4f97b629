#[path = "common/mod.rs"]
mod common;

use bulketl::{
    gid_type, InferredType, KeyKind, MaterializeError, OrphanPolicy, ReconstructError, Reconstructor,
    RecordLayout, SpillConfig, TableMaterializer,
};
use common::*;
use serde_json::{json, Value};

/// Route every line and append it, the way one endpoint pipeline does.
fn build(lines: &[String], layout: RecordLayout, spill: SpillConfig) -> TableMaterializer {
    let mut recon = Reconstructor::new(layout.clone(), OrphanPolicy::FailFast);
    let mut mat = TableMaterializer::new(layout, spill);
    for line in lines {
        if let Some(rec) = recon.route(line).unwrap() {
            let table = rec.type_tag.clone();
            let _ = mat.append(&table, rec);
        }
    }
    mat
}

#[test]
fn type_comes_from_the_global_id() {
    assert_eq!(gid_type("gid://shop/ProductVariant/42").as_deref(), Some("ProductVariant"));
    assert_eq!(gid_type("gid://shop/Product/1?x=y").as_deref(), Some("Product"));
    assert_eq!(gid_type("42"), None);
}

#[test]
fn children_get_a_foreign_key_to_their_parent() {
    let work = tempfile::tempdir().unwrap();
    let mut mat = build(&product_export(), RecordLayout::default(), SpillConfig::new(work.path(), 1000));
    assert_eq!(mat.table_names(), ["Product", "ProductVariant"]);

    let tables = mat.finalize_all();
    assert_eq!(tables.len(), 2);
    let products = tables[0].1.as_ref().unwrap();
    let variants = tables[1].1.as_ref().unwrap();

    assert_eq!(products.primary_key(), "id");
    assert!(products.foreign_key().is_none());
    assert_eq!(products.row_count(), 2);

    let fk = variants.foreign_key().unwrap();
    assert_eq!(fk.column, "parent_id");
    assert_eq!(fk.parent_table, "Product");
    assert_eq!(variants.columns()[0].name, "id");
    assert_eq!(variants.columns()[1].name, "parent_id");
    assert!(variants.column_index("__parentId").is_none());

    let rows = variants.collect_rows().unwrap();
    let fk_col = variants.column_index("parent_id").unwrap();
    let parents: Vec<&Value> = rows.iter().map(|r| &r[fk_col]).collect();
    assert_eq!(
        parents,
        [&json!("gid://shop/Product/1"), &json!("gid://shop/Product/1"), &json!("gid://shop/Product/2")]
    );
}

#[test]
fn cells_are_coerced_to_the_final_column_type() {
    let work = tempfile::tempdir().unwrap();
    let mut mat = build(&product_export(), RecordLayout::default(), SpillConfig::new(work.path(), 1000));
    let products = mat.finalize("Product").unwrap();
    let variants = mat.finalize("ProductVariant").unwrap();

    assert_eq!(products.column_type("price"), Some(InferredType::Integer));
    assert_eq!(products.column_type("published"), Some(InferredType::Boolean));
    assert_eq!(products.column_type("createdAt"), Some(InferredType::Timestamp));
    assert_eq!(variants.column_type("inventory"), Some(InferredType::Float));
    assert_eq!(variants.column_type("barcode"), Some(InferredType::String));

    let rows = products.collect_rows().unwrap();
    let price = products.column_index("price").unwrap();
    assert_eq!(rows[0][price], json!(10));
    assert_eq!(rows[1][price], json!(12));

    let rows = variants.collect_rows().unwrap();
    let inv = variants.column_index("inventory").unwrap();
    assert_eq!(rows[0][inv], json!(5.0));
    assert_eq!(rows[1][inv], json!(7.5));
    assert_eq!(rows[2][inv], Value::Null);
    let barcode = variants.column_index("barcode").unwrap();
    assert_eq!(rows[2][barcode], json!("007"));
}

#[test]
fn missing_cells_are_padded_with_null() {
    let work = tempfile::tempdir().unwrap();
    let mut mat = build(&product_export(), RecordLayout::default(), SpillConfig::new(work.path(), 1000));
    let products = mat.finalize("Product").unwrap();
    let rows = products.collect_rows().unwrap();

    for row in &rows {
        assert_eq!(row.len(), products.columns().len());
    }
    let created = products.column_index("createdAt").unwrap();
    let published = products.column_index("published").unwrap();
    assert_eq!(rows[0][created], Value::Null);
    assert_eq!(rows[1][created], json!("2024-01-05T10:00:00Z"));
    assert_eq!(rows[0][published], json!(true));
    assert_eq!(rows[1][published], Value::Null);
}

#[test]
fn padding_holds_across_a_spill_boundary() {
    let work = tempfile::tempdir().unwrap();
    let spill_dir = work.path().join("spill");
    let layout = RecordLayout::default().with_type_field("__typename");
    let lines: Vec<String> = vec![
        json!({"__typename": "Order", "id": 1, "a": 1}).to_string(),
        json!({"__typename": "Order", "id": 2, "a": 2}).to_string(),
        json!({"__typename": "Order", "id": 3, "a": "3.5", "b": "x"}).to_string(),
        json!({"__typename": "Order", "id": 4, "b": "y"}).to_string(),
        json!({"__typename": "Order", "id": 5, "c": true}).to_string(),
    ];
    let mut mat = build(&lines, layout, SpillConfig::new(&spill_dir, 2));
    assert!(!file_names(&spill_dir).is_empty(), "expected buffered rows on disk");

    let orders = mat.finalize("Order").unwrap();
    let names: Vec<&str> = orders.columns().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["id", "a", "b", "c"]);
    assert_eq!(orders.column_type("a"), Some(InferredType::Float));

    let rows = orders.collect_rows().unwrap();
    assert_eq!(
        rows,
        vec![
            vec![json!(1), json!(1.0), Value::Null, Value::Null],
            vec![json!(2), json!(2.0), Value::Null, Value::Null],
            vec![json!(3), json!(3.5), json!("x"), Value::Null],
            vec![json!(4), Value::Null, json!("y"), Value::Null],
            vec![json!(5), Value::Null, Value::Null, json!(true)],
        ]
    );

    // rows can be read more than once
    assert_eq!(orders.rows().count(), 5);
    drop(orders);
    assert!(file_names(&spill_dir).is_empty(), "spill files are removed with the table");
}

#[test]
fn orphans_fail_fast_or_are_counted() {
    let lines = vec![
        json!({"id": "gid://shop/ProductVariant/11", "__parentId": "gid://shop/Product/1"}).to_string(),
        json!({"id": "gid://shop/Product/1"}).to_string(),
    ];

    let mut strict = Reconstructor::new(RecordLayout::default(), OrphanPolicy::FailFast);
    let err = strict.route(&lines[0]).unwrap_err();
    assert_eq!(
        err,
        ReconstructError::Orphan {
            table: "ProductVariant".into(),
            id: Some("gid://shop/ProductVariant/11".into()),
            parent_id: "gid://shop/Product/1".into(),
        }
    );

    let mut lenient = Reconstructor::new(RecordLayout::default(), OrphanPolicy::SkipAndCount);
    assert!(lenient.route(&lines[0]).unwrap().is_none());
    assert!(lenient.route(&lines[1]).unwrap().is_some());
    assert_eq!(lenient.orphans_skipped(), vec![("ProductVariant".to_string(), 1)]);
    assert_eq!(lenient.total_orphans(), 1);
    assert_eq!(lenient.records_routed(), 1);
}

#[test]
fn a_child_type_under_two_parent_tables_is_rejected() {
    let mut recon = Reconstructor::new(RecordLayout::default(), OrphanPolicy::FailFast);
    let lines = [
        json!({"id": "gid://shop/Product/1"}).to_string(),
        json!({"id": "gid://shop/Collection/9"}).to_string(),
        json!({"id": "gid://shop/Image/1", "__parentId": "gid://shop/Product/1"}).to_string(),
        json!({"id": "gid://shop/Image/2", "__parentId": "gid://shop/Collection/9"}).to_string(),
    ];
    for l in &lines[..3] {
        recon.route(l).unwrap();
    }
    let err = recon.route(&lines[3]).unwrap_err();
    assert!(matches!(err, ReconstructError::ParentConflict { ref table, .. } if table == "Image"));
}

#[test]
fn ids_shared_across_types_resolve_to_the_known_parent_table() {
    let work = tempfile::tempdir().unwrap();
    let layout = RecordLayout::default().with_type_field("type");
    let lines = vec![
        json!({"type": "A", "id": 1}).to_string(),
        json!({"type": "B", "id": 1, "__parentId": 1}).to_string(),
        json!({"type": "B", "id": 2, "__parentId": 1}).to_string(),
    ];

    let mut recon = Reconstructor::new(layout.clone(), OrphanPolicy::FailFast);
    let parents: Vec<Option<String>> =
        lines.iter().map(|l| recon.route(l).unwrap().unwrap().parent_table).collect();
    assert_eq!(parents, [None, Some("A".to_string()), Some("A".to_string())]);

    let mut mat = build(&lines, layout, SpillConfig::new(work.path(), 1000));
    let b = mat.finalize("B").unwrap();
    assert_eq!(b.foreign_key().unwrap().parent_table, "A");
    assert_eq!(b.collect_rows().unwrap(), vec![vec![json!(1), json!(1)], vec![json!(2), json!(1)]]);
}

#[test]
fn parent_references_that_are_not_identifiers_are_rejected() {
    let layout = RecordLayout::default().with_type_field("type");
    let mut recon = Reconstructor::new(layout, OrphanPolicy::SkipAndCount);
    recon.route(&json!({"type": "A", "id": "a1"}).to_string()).unwrap();
    for (i, parent) in [json!(""), json!(false), json!({"id": "a1"})].into_iter().enumerate() {
        let line = json!({"type": "B", "id": "b1", "__parentId": parent}).to_string();
        let err = recon.route(&line).unwrap_err();
        assert!(
            matches!(err, ReconstructError::Decode { line, ref message } if line == i as u64 + 2 && message.contains("__parentId")),
            "{err:?}"
        );
    }
    // null still means "no parent"
    let top = recon.route(&json!({"type": "B", "id": "b2", "__parentId": null}).to_string()).unwrap().unwrap();
    assert!(top.parent_id.is_none());
}

#[test]
fn a_data_field_named_like_the_foreign_key_does_not_replace_it() {
    let work = tempfile::tempdir().unwrap();
    let layout = RecordLayout::default().with_type_field("type");
    let lines = vec![
        json!({"type": "Customer", "id": "c1"}).to_string(),
        json!({"type": "Address", "id": "a1", "__parentId": "c1", "parent_id": "other", "city": "Oslo"}).to_string(),
        json!({"type": "Address", "id": "a2", "__parentId": "c1", "parent_id": "other"}).to_string(),
    ];
    let mut mat = build(&lines, layout, SpillConfig::new(work.path(), 1000));
    let addresses = mat.finalize("Address").unwrap();
    let names: Vec<&str> = addresses.columns().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["id", "parent_id", "city"]);
    assert_eq!(
        addresses.collect_rows().unwrap(),
        vec![vec![json!("a1"), json!("c1"), json!("Oslo")], vec![json!("a2"), json!("c1"), Value::Null]]
    );
}

#[test]
fn undecodable_and_unclassified_lines_are_errors() {
    let mut recon = Reconstructor::new(RecordLayout::default(), OrphanPolicy::SkipAndCount);
    assert!(matches!(recon.route("{not json"), Err(ReconstructError::Decode { line: 1, .. })));
    assert!(matches!(recon.route("[1,2]"), Err(ReconstructError::Decode { line: 2, .. })));
    assert_eq!(recon.route(r#"{"id": 5}"#).unwrap_err(), ReconstructError::Unclassified { line: 3 });
}

#[test]
fn a_row_without_primary_key_fails_only_its_table() {
    let work = tempfile::tempdir().unwrap();
    let layout = RecordLayout::default().with_type_field("__typename");
    let lines = vec![
        json!({"__typename": "Customer", "id": "c1", "name": "Ann"}).to_string(),
        json!({"__typename": "Order", "id": "o1", "total": 3}).to_string(),
        json!({"__typename": "Order", "total": 4}).to_string(),
        json!({"__typename": "Order", "id": "o3", "total": 5}).to_string(),
    ];
    let mut mat = build(&lines, layout, SpillConfig::new(work.path(), 1000));
    let mut results = mat.finalize_all().into_iter();

    let (name, customers) = results.next().unwrap();
    assert_eq!(name, "Customer");
    assert_eq!(customers.unwrap().row_count(), 1);

    let (name, orders) = results.next().unwrap();
    assert_eq!(name, "Order");
    assert_eq!(
        orders.unwrap_err(),
        MaterializeError::MissingKey { table: "Order".into(), key: KeyKind::Primary, row: 1 }
    );
}

#[test]
fn mixing_parented_and_unparented_rows_fails_the_table() {
    let work = tempfile::tempdir().unwrap();
    let layout = RecordLayout::default().with_type_field("__typename");
    let lines = vec![
        json!({"__typename": "Note", "id": "n1"}).to_string(),
        json!({"__typename": "Customer", "id": "c1"}).to_string(),
        json!({"__typename": "Note", "id": "n2", "__parentId": "c1"}).to_string(),
    ];
    let mut mat = build(&lines, layout, SpillConfig::new(work.path(), 1000));
    let err = mat.finalize("Note").unwrap_err();
    assert!(matches!(err, MaterializeError::MissingKey { key: KeyKind::Foreign, .. }));
    assert!(mat.finalize("Customer").is_ok());
    assert!(matches!(mat.finalize("Nope"), Err(MaterializeError::UnknownTable(_))));
}

#[test]
fn numeric_ids_link_parents_too() {
    let work = tempfile::tempdir().unwrap();
    let layout = RecordLayout::default()
        .with_type_field("kind")
        .with_parent_field("owner")
        .with_foreign_key_column("owner_id");
    let lines = vec![
        json!({"kind": "Account", "id": 7}).to_string(),
        json!({"kind": "Login", "id": 70, "owner": 7, "at": "2024-03-01 08:00:00"}).to_string(),
    ];
    let mut mat = build(&lines, layout, SpillConfig::new(work.path(), 1000));
    mat.finalize("Account").unwrap();
    let logins = mat.finalize("Login").unwrap();
    assert_eq!(logins.foreign_key().unwrap().column, "owner_id");
    assert_eq!(logins.column_type("owner_id"), Some(InferredType::Integer));
    assert_eq!(logins.column_type("at"), Some(InferredType::Timestamp));
    assert_eq!(logins.collect_rows().unwrap(), vec![vec![json!(70), json!(7), json!("2024-03-01 08:00:00")]]);
}

#[test]
fn observed_columns_join_the_table_schema() {
    let work = tempfile::tempdir().unwrap();
    let mut mat = TableMaterializer::new(RecordLayout::default(), SpillConfig::new(work.path(), 10));
    assert_eq!(mat.observe("Product", "price", &json!("9")), InferredType::Integer);
    assert_eq!(mat.observe("Product", "price", &json!(9.5)), InferredType::Float);
    assert_eq!(mat.column_type("Product", "price"), Some(InferredType::Float));

    let products = mat.finalize("Product").unwrap();
    assert_eq!(products.row_count(), 0);
    assert_eq!(products.columns().len(), 2);
    assert!(products.collect_rows().unwrap().is_empty());
}
