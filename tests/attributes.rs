use std::collections::BTreeMap;

use n5_hdf5::container::NativeType;
use n5_hdf5::{
    AttributeKind, AttributeValue, DataType, DatasetAttributes, Error, FileContainer,
    N5Compression, N5Hdf5Store, N5Reader, N5Writer, N5_JSON_ROOT_KEY, StoreOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

fn writer() -> N5Hdf5Store<FileContainer> {
    env_logger::try_init().ok();
    let store = N5Hdf5Store::open_writer(FileContainer::in_memory(), StoreOptions::default())
        .expect("open in-memory writer");
    store.create_group("group").expect("create group");
    store
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Resolution {
    unit: String,
    values: Vec<f64>,
    nested: Option<Box<Resolution>>,
}

#[test]
fn test_primitive_round_trip() {
    let store = writer();
    store.set_attribute("group", "bool", true).expect("set");
    store.set_attribute("group", "i8", -3i8).expect("set");
    store.set_attribute("group", "i16", -300i16).expect("set");
    store.set_attribute("group", "i32", 70_000i32).expect("set");
    store.set_attribute("group", "i64", i64::MIN).expect("set");
    store.set_attribute("group", "u64", u64::MAX).expect("set");
    store.set_attribute("group", "f32", 0.25f32).expect("set");
    store.set_attribute("group", "f64", std::f64::consts::PI).expect("set");
    store.set_attribute("group", "string", "value").expect("set");

    assert_eq!(
        store.get_attribute_json("group", "bool").expect("get"),
        Some(json!(true))
    );
    assert_eq!(store.get_attribute::<i8>("group", "i8").expect("get"), Some(-3));
    assert_eq!(store.get_attribute::<i16>("group", "i16").expect("get"), Some(-300));
    assert_eq!(store.get_attribute::<i32>("group", "i32").expect("get"), Some(70_000));
    assert_eq!(store.get_attribute::<i64>("group", "i64").expect("get"), Some(i64::MIN));
    assert_eq!(store.get_attribute::<u64>("group", "u64").expect("get"), Some(u64::MAX));
    assert_eq!(store.get_attribute::<f32>("group", "f32").expect("get"), Some(0.25));
    assert_eq!(
        store.get_attribute::<f64>("group", "f64").expect("get"),
        Some(std::f64::consts::PI)
    );
    assert_eq!(
        store.get_attribute::<String>("group", "string").expect("get").as_deref(),
        Some("value")
    );
    assert_eq!(store.get_attribute::<i32>("group", "absent").expect("get"), None);
    assert_eq!(store.get_attribute::<i32>("absent", "i32").expect("get"), None);
}

#[test]
fn test_array_round_trip() {
    let store = writer();
    store.set_attribute("group", "u8s", vec![1u8, 2, 3]).expect("set");
    store.set_attribute("group", "f32s", vec![0.5f32, -1.5]).expect("set");
    store.set_attribute("group", "strings", vec!["a", "b"]).expect("set");
    store
        .set_attribute("group", "matrix", vec![vec![1i64, 2], vec![3, 4], vec![5, 6]])
        .expect("set");

    assert_eq!(
        store.get_attribute::<Vec<u8>>("group", "u8s").expect("get"),
        Some(vec![1, 2, 3])
    );
    assert_eq!(
        store.get_attribute::<Vec<f32>>("group", "f32s").expect("get"),
        Some(vec![0.5, -1.5])
    );
    assert_eq!(
        store.get_attribute::<Vec<String>>("group", "strings").expect("get"),
        Some(vec!["a".to_string(), "b".to_string()])
    );
    assert_eq!(
        store.get_attribute::<Vec<Vec<i64>>>("group", "matrix").expect("get"),
        Some(vec![vec![1, 2], vec![3, 4], vec![5, 6]])
    );
}

#[test]
fn test_structured_round_trip() {
    let store = writer();
    let resolution = Resolution {
        unit: "nm".into(),
        values: vec![4.0, 4.0, 40.0],
        nested: Some(Box::new(Resolution {
            unit: "um".into(),
            values: vec![],
            nested: None,
        })),
    };
    store
        .set_attribute(
            "group",
            "resolution",
            AttributeValue::json(&resolution).expect("serialize"),
        )
        .expect("set");
    assert_eq!(
        store.get_attribute::<Resolution>("group", "resolution").expect("get"),
        Some(resolution)
    );
    assert_eq!(
        store.get_attribute::<String>("group", "resolution/nested/unit").expect("get").as_deref(),
        Some("um")
    );
    assert_eq!(
        store.get_attribute::<f64>("group", "resolution/values[2]").expect("get"),
        Some(40.0)
    );
}

#[test]
fn test_string_is_returned_literally() {
    let store = writer();
    store.set_attribute("group", "key", "a string").expect("set");
    assert_eq!(
        store.get_attribute::<String>("group", "key").expect("get").as_deref(),
        Some("a string")
    );
    assert_eq!(
        store.get_attribute_json("group", "key").expect("get"),
        Some(json!("a string"))
    );
}

#[test]
fn test_json_looking_string_is_ambiguous() {
    let store = writer();
    store.set_attribute("group", "braces", "{     }").expect("set");

    // typed read keeps the literal
    assert_eq!(
        store.get_attribute::<String>("group", "braces").expect("get").as_deref(),
        Some("{     }")
    );
    // the JSON views cannot tell it from an empty object
    assert_eq!(
        store.get_attribute_json("group", "braces").expect("get"),
        Some(json!({}))
    );
    assert_eq!(store.get_attributes("group").expect("get all")["braces"], json!({}));
    assert_eq!(
        store.list_attributes("group").expect("list")["braces"],
        AttributeKind::Object
    );
}

#[test]
fn test_get_attributes_merges_stores() {
    let store = writer();
    let attrs = DatasetAttributes::new(vec![8, 4], vec![4, 2], DataType::Float32, N5Compression::gzip())
        .expect("valid attributes");
    store.create_dataset("group/data", &attrs).expect("create dataset");
    store.set_attribute("group/data", "scale", 2.5f64).expect("set");
    store
        .set_attribute("group/data", "meta", json!({"origin": [0, 0]}))
        .expect("set");
    store.set_attribute("group/data", "text", "[1, 2]").expect("set");
    // stored attributes cannot shadow the dataset's own
    store.set_attribute("group/data", "dimensions", vec![1u64]).expect("set");

    let all = store.get_attributes("group/data").expect("get all");
    assert_eq!(all["scale"], json!(2.5));
    assert_eq!(all["meta"], json!({"origin": [0, 0]}));
    assert_eq!(all["text"], json!([1, 2]));
    assert_eq!(all["dimensions"], json!([8, 4]));
    assert_eq!(all["blockSize"], json!([4, 2]));
    assert_eq!(all["dataType"], json!("float32"));
    assert_eq!(all["compression"], json!({"type": "raw"}));
    assert!(!all.contains_key(N5_JSON_ROOT_KEY));

    // a derived key only wins when it fits the requested type
    assert_eq!(
        store.get_attribute::<Vec<u64>>("group/data", "dimensions").expect("get"),
        Some(vec![8, 4])
    );
}

#[test]
fn test_list_attributes() {
    let store = writer();
    store.set_attribute("group", "n", 1u16).expect("set");
    store.set_attribute("group", "arr", vec![1.0f64]).expect("set");
    store.set_attribute("group", "m", vec![vec![1i8]]).expect("set");
    store.set_attribute("group", "s", "plain").expect("set");
    store.set_attribute("group", "obj", json!({"a": null})).expect("set");
    store.set_attribute("group", "objs", json!([{"a": 1}])).expect("set");
    store.set_attribute("group", "nested/int", json!(3)).expect("set");

    let kinds = store.list_attributes("group").expect("list");
    let expected: BTreeMap<String, AttributeKind> = [
        ("n", AttributeKind::Scalar(NativeType::Uint16)),
        ("arr", AttributeKind::Array(NativeType::Float64)),
        ("m", AttributeKind::Matrix(NativeType::Int8)),
        ("s", AttributeKind::Scalar(NativeType::VarString)),
        ("obj", AttributeKind::Object),
        ("objs", AttributeKind::ObjectArray),
        ("nested", AttributeKind::Object),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    assert_eq!(kinds, expected);
}

#[test]
fn test_root_key_replaces_attributes() {
    let store = writer();
    store.set_attribute("group", "old", 1i32).expect("set");
    store
        .set_attribute("group", "/", json!({"a": 1, "b": [true]}))
        .expect("set");
    assert_eq!(store.get_attribute::<i32>("group", "old").expect("get"), None);
    assert_eq!(store.get_attribute::<i32>("group", "a").expect("get"), Some(1));
    assert_eq!(
        store.get_attribute_json("group", "").expect("get"),
        Some(json!({"a": 1, "b": [true]}))
    );
}

#[test]
fn test_overwrite_switches_store() {
    let store = writer();
    store.set_attribute("group", "k", json!({"x": 1})).expect("set");
    store.set_attribute("group", "k", 5i32).expect("set");
    assert_eq!(store.get_attribute::<i32>("group", "k").expect("get"), Some(5));
    assert_eq!(store.get_attributes("group").expect("get all")["k"], json!(5));

    store.set_attribute("group", "k", json!({"y": 2})).expect("set");
    assert_eq!(
        store.get_attribute_json("group", "k").expect("get"),
        Some(json!({"y": 2}))
    );
}

#[test]
fn test_remove_attributes() {
    let store = writer();
    store.set_attribute("group", "a", 1i32).expect("set");
    store.set_attribute("group", "b", json!({"c": 1, "d": 2})).expect("set");
    assert!(store.remove_attribute("group", "a").expect("remove"));
    assert!(!store.remove_attribute("group", "a").expect("remove"));
    assert!(store.remove_attributes("group", &["b/c", "missing"]).expect("remove"));
    assert_eq!(
        store.get_attribute_json("group", "b").expect("get"),
        Some(json!({"d": 2}))
    );
    store
        .set_attribute("group", "b", serde_json::Value::Null)
        .expect("null removes");
    assert_eq!(store.get_attribute_json("group", "b").expect("get"), None);
    assert!(!store.remove_attribute("absent", "a").expect("remove"));
}

#[test]
fn test_set_attributes_map() {
    let store = writer();
    let attributes: BTreeMap<String, AttributeValue> = [
        ("x".to_string(), AttributeValue::from(1u8)),
        ("y".to_string(), AttributeValue::from(json!({"z": "w"}))),
    ]
    .into_iter()
    .collect();
    store.set_attributes("group", attributes).expect("set");
    assert_eq!(store.get_attribute::<u8>("group", "x").expect("get"), Some(1));
    assert_eq!(
        store.get_attribute::<String>("group", "y/z").expect("get").as_deref(),
        Some("w")
    );
}

#[test]
fn test_attributes_on_missing_path() {
    let store = writer();
    assert!(matches!(
        store.set_attribute("nowhere", "k", 1i32),
        Err(Error::NotFound(_))
    ));
    assert!(!store.exists("nowhere").expect("exists"));
    assert!(matches!(store.list_attributes("nowhere"), Err(Error::NotFound(_))));
}

#[test]
fn test_narrowing_is_unsupported() {
    let store = writer();
    store.set_attribute("group", "big", 1i64 << 40).expect("set");
    assert!(matches!(
        store.get_attribute::<i32>("group", "big"),
        Err(Error::Unsupported(_))
    ));
    assert_eq!(
        store.get_attribute::<i64>("group", "big").expect("get"),
        Some(1 << 40)
    );
}

#[test]
fn test_non_finite_floats() {
    let store = writer();
    store.set_attribute("group", "inf", f64::INFINITY).expect("set");
    store.set_attribute("group", "nan", f64::NAN).expect("set");
    store
        .set_attribute("group", "array", vec![f32::NEG_INFINITY, 2.5, f32::NAN])
        .expect("set");
    store
        .set_attribute(
            "group",
            "matrix",
            vec![vec![f64::NAN, 1.0], vec![f64::INFINITY, f64::NEG_INFINITY]],
        )
        .expect("set");

    assert_eq!(
        store.get_attribute::<f64>("group", "inf").expect("get"),
        Some(f64::INFINITY)
    );
    assert!(store
        .get_attribute::<f64>("group", "nan")
        .expect("get")
        .expect("present")
        .is_nan());

    let array = store
        .get_attribute::<Vec<f32>>("group", "array")
        .expect("get")
        .expect("present");
    assert_eq!(array[..2], [f32::NEG_INFINITY, 2.5]);
    assert!(array[2].is_nan());

    let matrix = store
        .get_attribute::<Vec<Vec<f64>>>("group", "matrix")
        .expect("get")
        .expect("present");
    assert_eq!(matrix.len(), 2);
    assert!(matrix[0][0].is_nan());
    assert_eq!(matrix[0][1], 1.0);
    assert_eq!(matrix[1], [f64::INFINITY, f64::NEG_INFINITY]);
}

#[test]
fn test_matrix_without_columns() {
    let store = writer();
    store
        .set_attribute("group", "empty_rows", vec![Vec::<i32>::new(), vec![]])
        .expect("set");
    assert_eq!(
        store
            .get_attribute::<Vec<Vec<i32>>>("group", "empty_rows")
            .expect("get"),
        Some(vec![vec![], vec![]])
    );
    assert_eq!(
        store.get_attribute_json("group", "empty_rows").expect("get"),
        Some(json!([[], []]))
    );
}
