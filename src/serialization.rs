use crate::error::InfraError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;

/// Turns structured values into the bytes stored in large-object columns.
pub trait Serializer: Send + Sync + fmt::Debug {
    fn content_type(&self) -> &'static str;

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, InfraError>;

    fn deserialize(&self, data: &[u8]) -> Result<Value, InfraError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, InfraError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, data: &[u8]) -> Result<Value, InfraError> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedObject {
    pub type_name: String,
    pub data: Vec<u8>,
}

pub fn serialize_object<T: Serialize + ?Sized>(
    serializer: &dyn Serializer,
    value: &T,
) -> Result<SerializedObject, InfraError> {
    let value = serde_json::to_value(value)?;
    Ok(SerializedObject {
        type_name: short_type_name::<T>().to_string(),
        data: serializer.serialize(&value)?,
    })
}

pub fn deserialize_object<T: DeserializeOwned>(
    serializer: &dyn Serializer,
    data: &[u8],
) -> Result<T, InfraError> {
    let value = serializer.deserialize(data)?;
    Ok(serde_json::from_value(value)?)
}

/// Last path segment of the type name, without generic arguments' paths.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Position {
        index: i64,
    }

    #[test]
    fn json_objects_keep_their_type_name() {
        let serialized = serialize_object(&JsonSerializer, &Position { index: 7 }).unwrap();
        assert_eq!(serialized.type_name, "Position");
        assert_eq!(serialized.data, br#"{"index":7}"#.to_vec());

        let back: Position = deserialize_object(&JsonSerializer, &serialized.data).unwrap();
        assert_eq!(back, Position { index: 7 });
    }

    #[test]
    fn garbage_is_a_json_error() {
        let err = deserialize_object::<Position>(&JsonSerializer, b"not json").unwrap_err();
        assert!(matches!(err, InfraError::Json(_)));
    }
}
