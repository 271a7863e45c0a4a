//! Record encoding for object and measurement tables.

use crate::error::{DaoError, DaoResult};
use crate::object::{Measurements, SegmentedObject};

/// Converts records to and from the string values stored in tables.
pub trait ObjectSerializer: Send + Sync {
    fn serialize_object(&self, object: &SegmentedObject) -> DaoResult<String>;
    fn deserialize_object(&self, record: &str) -> DaoResult<SegmentedObject>;
    fn serialize_measurements(&self, measurements: &Measurements) -> DaoResult<String>;
    fn deserialize_measurements(&self, record: &str) -> DaoResult<Measurements>;
}

/// Compact single-line JSON records.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl ObjectSerializer for JsonSerializer {
    fn serialize_object(&self, object: &SegmentedObject) -> DaoResult<String> {
        serde_json::to_string(object).map_err(|e| DaoError::serialization(format!("object {}", object.id), e))
    }

    fn deserialize_object(&self, record: &str) -> DaoResult<SegmentedObject> {
        serde_json::from_str(record).map_err(|e| DaoError::serialization("object record", e))
    }

    fn serialize_measurements(&self, measurements: &Measurements) -> DaoResult<String> {
        serde_json::to_string(measurements)
            .map_err(|e| DaoError::serialization(format!("measurements of {}", measurements.object_id), e))
    }

    fn deserialize_measurements(&self, record: &str) -> DaoResult<Measurements> {
        serde_json::from_str(record).map_err(|e| DaoError::serialization("measurement record", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ObjectId;

    #[test]
    fn test_object_record_keeps_relations() {
        let mut obj = SegmentedObject::new(ObjectId::new(2, 7), 2, 1, 3);
        obj.parent_id = Some(ObjectId::new(2, 1));
        obj.previous_id = Some(ObjectId::new(1, 7));
        obj.track_head_id = Some(ObjectId::new(0, 7));

        let record = JsonSerializer.serialize_object(&obj).unwrap();
        let back = JsonSerializer.deserialize_object(&record).unwrap();
        assert_eq!(back.id, obj.id);
        assert_eq!(back.parent_id, obj.parent_id);
        assert_eq!(back.previous_id, obj.previous_id);
        assert_eq!(back.next_id, None);
        assert_eq!(back.track_head(), ObjectId::new(0, 7));
    }

    #[test]
    fn test_garbage_record_is_error() {
        let err = JsonSerializer.deserialize_object("{\"id\":").unwrap_err();
        assert!(matches!(err, DaoError::Serialization { .. }));
    }
}
