use lunar_literal::{parse, Key, Value};
use pretty_assertions::assert_eq;

#[test]
fn reserialized_table_keeps_its_mappings() {
    let original = parse(r#"{1, 2, x="y"}"#).unwrap();
    let text = original.to_string();
    assert_eq!(text, r#"{1, 2, x = "y"}"#);

    let reparsed = parse(&text).unwrap();
    assert_eq!(reparsed, original);

    let table = reparsed.as_table().unwrap();
    assert_eq!(table.get_int(1), Some(&Value::from(1)));
    assert_eq!(table.get_int(2), Some(&Value::from(2)));
    assert_eq!(table.get_str("x"), Some(&Value::from("y")));
}

#[test]
fn reserialization_is_stable_for_serializer_output() {
    // Shape produced by a debuggee-side serializer for a game entity.
    let text = r#"{name = "player", pos = {x = 10.5, y = -3}, inventory = {"sword", "shield"}, ["hit points"] = 100, parent = nil --[[ref]], update = function() --[[..skipped..]] end, [0x10] = "hex", flags = {true, false}, speed = math.huge}"#;
    let value = parse(text).unwrap();
    let first = value.to_string();
    let second = parse(&first).unwrap().to_string();
    assert_eq!(first, second);

    let table = value.as_table().unwrap();
    let keys: Vec<String> = table.iter().map(|(k, _)| k.label()).collect();
    assert_eq!(
        keys,
        vec![
            "name",
            "pos",
            "inventory",
            "hit points",
            "parent",
            "update",
            "16",
            "flags",
            "speed"
        ]
    );
    assert_eq!(table.get(&Key::Integer(16)), Some(&Value::from("hex")));
}

#[test]
fn values_render_as_json() {
    let value = parse(r#"{1, 2, x = "y", nested = {"a", "b"}, ref = nil --[[ref t1]]}"#).unwrap();
    let json = serde_json::to_value(&value).unwrap();
    assert_eq!(
        json,
        serde_json::json!({
            "1": 1,
            "2": 2,
            "x": "y",
            "nested": ["a", "b"],
            "ref": {"$ref": "t1"}
        })
    );

    let seq = parse("{10, 20}").unwrap();
    assert_eq!(serde_json::to_value(&seq).unwrap(), serde_json::json!([10, 20]));
}
