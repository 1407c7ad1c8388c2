use lapin::types::{AMQPValue, FieldArray, FieldTable, ShortString};
use serde_json::{Map, Number, Value};

use crate::contracts::Headers;

/// Flattens a broker field table into JSON-valued headers.
pub fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), amqp_to_json(value)))
        .collect()
}

pub fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(ShortString::from(key.clone()), json_to_amqp(value));
    }
    table
}

fn amqp_to_json(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(n) => Value::from(*n),
        AMQPValue::ShortShortUInt(n) => Value::from(*n),
        AMQPValue::ShortInt(n) => Value::from(*n),
        AMQPValue::ShortUInt(n) => Value::from(*n),
        AMQPValue::LongInt(n) => Value::from(*n),
        AMQPValue::LongUInt(n) => Value::from(*n),
        AMQPValue::LongLongInt(n) => Value::from(*n),
        AMQPValue::Timestamp(n) => Value::from(*n),
        AMQPValue::Float(n) => float_value(f64::from(*n)),
        AMQPValue::Double(n) => float_value(*n),
        AMQPValue::ShortString(s) => Value::String(s.as_str().to_string()),
        AMQPValue::LongString(s) => Value::String(s.to_string()),
        AMQPValue::FieldArray(array) => {
            Value::Array(array.as_slice().iter().map(amqp_to_json).collect())
        }
        AMQPValue::FieldTable(table) => Value::Object(
            table
                .inner()
                .iter()
                .map(|(key, value)| (key.as_str().to_string(), amqp_to_json(value)))
                .collect::<Map<String, Value>>(),
        ),
        _ => Value::Null,
    }
}

fn float_value(n: f64) -> Value {
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

fn json_to_amqp(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => AMQPValue::LongLongInt(i),
            (None, Some(f)) => AMQPValue::Double(f),
            (None, None) => AMQPValue::LongString(n.to_string().into()),
        },
        Value::String(s) => AMQPValue::LongString(s.clone().into()),
        Value::Array(items) => AMQPValue::FieldArray(FieldArray::from(
            items.iter().map(json_to_amqp).collect::<Vec<_>>(),
        )),
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, value) in map {
                table.insert(ShortString::from(key.clone()), json_to_amqp(value));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_broker_headers_flatten() {
        let mut table = FieldTable::default();
        table.insert("request_id".into(), AMQPValue::LongString("abc".into()));
        table.insert("attempt".into(), AMQPValue::LongInt(2));
        table.insert("urgent".into(), AMQPValue::Boolean(true));

        let headers = from_field_table(&table);
        assert_eq!(headers["request_id"], json!("abc"));
        assert_eq!(headers["attempt"], json!(2));
        assert_eq!(headers["urgent"], json!(true));
    }

    #[test]
    fn test_outgoing_headers_keep_strings_and_numbers() {
        let mut headers = Headers::new();
        headers.insert("request_id".to_string(), json!("abc"));
        headers.insert("attempt".to_string(), json!(3));

        let table = to_field_table(&headers);
        let inner = table.inner();
        assert!(matches!(
            inner.get(&ShortString::from("request_id")),
            Some(AMQPValue::LongString(s)) if s.to_string() == "abc"
        ));
        assert!(matches!(inner.get(&ShortString::from("attempt")), Some(AMQPValue::LongLongInt(3))));
    }
}
