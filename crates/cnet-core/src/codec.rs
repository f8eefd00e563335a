//! Wire codec for job messages and result payloads.
//!
//! Messages are flat JSON objects. Job arguments may hold values JSON has no
//! native form for; those implement [`WireEncode`] and are lowered to a stable
//! JSON representation before the message is built (geometries as WKT,
//! numeric arrays as nested lists).

use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};

use crate::models::JobMessage;
use crate::{Error, Result};

/// Lowering of a non-primitive value into its wire representation.
pub trait WireEncode {
    fn to_wire(&self) -> JsonValue;
}

impl WireEncode for JsonValue {
    fn to_wire(&self) -> JsonValue {
        self.clone()
    }
}

impl WireEncode for f64 {
    fn to_wire(&self) -> JsonValue {
        // NaN and infinities have no JSON number form.
        serde_json::Number::from_f64(*self)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
    }
}

impl<T: WireEncode> WireEncode for [T] {
    fn to_wire(&self) -> JsonValue {
        JsonValue::Array(self.iter().map(WireEncode::to_wire).collect())
    }
}

impl<T: WireEncode> WireEncode for Vec<T> {
    fn to_wire(&self) -> JsonValue {
        self.as_slice().to_wire()
    }
}

impl<T: WireEncode> WireEncode for Option<T> {
    fn to_wire(&self) -> JsonValue {
        match self {
            Some(v) => v.to_wire(),
            None => JsonValue::Null,
        }
    }
}

/// Row-major two-dimensional numeric array.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    pub shape: (usize, usize),
    pub data: Vec<f64>,
}

impl NdArray {
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        let len = rows.checked_mul(cols).ok_or_else(|| {
            Error::InvalidInput(format!("array shape ({}, {}) is too large", rows, cols))
        })?;
        if len != data.len() {
            return Err(Error::InvalidInput(format!(
                "array of shape ({}, {}) needs {} values, got {}",
                rows,
                cols,
                len,
                data.len()
            )));
        }
        Ok(Self {
            shape: (rows, cols),
            data,
        })
    }
}

impl WireEncode for NdArray {
    fn to_wire(&self) -> JsonValue {
        let (_, cols) = self.shape;
        if cols == 0 {
            return JsonValue::Array(Vec::new());
        }
        JsonValue::Array(self.data.chunks(cols).map(|row| row.to_wire()).collect())
    }
}

/// Planar geometry carried as WKT.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point { x: f64, y: f64 },
    PointZ { x: f64, y: f64, z: f64 },
    Polygon(Vec<(f64, f64)>),
}

impl Geometry {
    /// Well-known-text form.
    pub fn to_wkt(&self) -> String {
        match self {
            Geometry::Point { x, y } => format!("POINT ({} {})", x, y),
            Geometry::PointZ { x, y, z } => format!("POINT Z ({} {} {})", x, y, z),
            Geometry::Polygon(ring) => {
                let coords: Vec<String> = ring.iter().map(|(x, y)| format!("{} {}", x, y)).collect();
                format!("POLYGON (({}))", coords.join(", "))
            }
        }
    }

    /// Extended WKT with an SRID prefix, accepted by PostGIS text input.
    pub fn to_ewkt(&self, srid: i32) -> String {
        format!("SRID={};{}", srid, self.to_wkt())
    }
}

impl WireEncode for Geometry {
    fn to_wire(&self) -> JsonValue {
        JsonValue::String(self.to_wkt())
    }
}

/// Lower a list of encodable values into message `args`.
pub fn encode_args<T: WireEncode + ?Sized>(values: &[&T]) -> Vec<JsonValue> {
    values.iter().map(|v| v.to_wire()).collect()
}

/// Lower named encodable values into message `kwargs`.
pub fn encode_kwargs<'a, T, I>(pairs: I) -> Map<String, JsonValue>
where
    T: WireEncode + ?Sized + 'a,
    I: IntoIterator<Item = (&'a str, &'a T)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_wire()))
        .collect()
}

/// Encode a job message for the processing queue.
pub fn encode_message(msg: &JobMessage) -> Result<String> {
    Ok(serde_json::to_string(msg)?)
}

/// Decode a job message popped from a queue.
pub fn decode_message(raw: &str) -> Result<JobMessage> {
    serde_json::from_str(raw).map_err(|e| Error::Serialization(format!("job message: {}", e)))
}

/// Decode any queue payload into a typed record.
pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ImagePath, TargetId, TargetKind, Walltime};
    use serde_json::json;

    fn edge_message() -> JobMessage {
        JobMessage {
            id: TargetId::Edge(1, 2),
            along: TargetKind::Edge,
            func: "matcher.subpixel.subpixel_register_edge".to_string(),
            args: vec![json!(5)],
            kwargs: Map::from_iter([("size_x".to_string(), json!(100))]),
            walltime: Walltime::new("00:30:00").unwrap(),
            image_path: Some(ImagePath::Edge("/a.cub".into(), "/b.cub".into())),
            param_step: 1,
            config: json!({"redis": {"basename": "run"}}),
        }
    }

    #[test]
    fn test_encode_message_wire_schema() {
        let raw = encode_message(&edge_message()).unwrap();
        let v: JsonValue = serde_json::from_str(&raw).unwrap();

        assert_eq!(v["id"], json!([1, 2]));
        assert_eq!(v["along"], "edge");
        assert_eq!(v["func"], "matcher.subpixel.subpixel_register_edge");
        assert_eq!(v["args"], json!([5]));
        assert_eq!(v["kwargs"]["size_x"], 100);
        assert_eq!(v["walltime"], "00:30:00");
        assert_eq!(v["image_path"], json!(["/a.cub", "/b.cub"]));
        assert_eq!(v["param_step"], 1);
        assert_eq!(v["config"]["redis"]["basename"], "run");
    }

    #[test]
    fn test_image_path_omitted_when_absent() {
        let mut msg = edge_message();
        msg.id = TargetId::Row(42);
        msg.along = TargetKind::Point;
        msg.image_path = None;

        let raw = encode_message(&msg).unwrap();
        let v: JsonValue = serde_json::from_str(&raw).unwrap();
        assert!(v.get("image_path").is_none());
        assert_eq!(v["id"], 42);
    }

    #[test]
    fn test_decode_message_interprets_id_by_kind() {
        let raw = encode_message(&edge_message()).unwrap();
        assert_eq!(decode_message(&raw).unwrap(), edge_message());

        let row = r#"{"id": 9, "along": "measure", "func": "f", "walltime": "01:00:00", "config": {}}"#;
        let msg = decode_message(row).unwrap();
        assert_eq!(msg.id, TargetId::Row(9));
        assert_eq!(msg.param_step, 1);
        assert!(msg.args.is_empty());
    }

    #[test]
    fn test_decode_rejects_bad_walltime() {
        let raw = r#"{"id": 1, "along": "node", "func": "f", "walltime": "later", "config": {}}"#;
        assert!(matches!(decode_message(raw), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_geometry_wkt() {
        assert_eq!(Geometry::Point { x: 1.5, y: -2.0 }.to_wkt(), "POINT (1.5 -2)");
        assert_eq!(
            Geometry::PointZ { x: 1.0, y: 2.0, z: 3.0 }.to_ewkt(949900),
            "SRID=949900;POINT Z (1 2 3)"
        );
        let square = Geometry::Polygon(vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 0.0)]);
        assert_eq!(square.to_wire(), json!("POLYGON ((0 0, 1 0, 1 1, 0 0))"));
    }

    #[test]
    fn test_ndarray_to_nested_lists() {
        let arr = NdArray::new(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(arr.to_wire(), json!([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]));
        assert!(NdArray::new(2, 2, vec![1.0]).is_err());
    }

    #[test]
    fn test_ndarray_oversized_shape_is_rejected() {
        let err = NdArray::new(usize::MAX, 2, vec![1.0]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(ref m) if m.contains("too large")));
    }

    #[test]
    fn test_non_finite_float_becomes_null() {
        assert_eq!(f64::NAN.to_wire(), JsonValue::Null);
        assert_eq!(vec![1.0, f64::INFINITY].to_wire(), json!([1.0, null]));
    }

    #[test]
    fn test_encode_kwargs_mixes_geometries() {
        let geom = Geometry::Point { x: 0.0, y: 0.0 };
        let n = json!(3);
        let pairs: Vec<(&str, &dyn WireEncode)> = vec![("geom", &geom), ("n", &n)];
        let kwargs = encode_kwargs(pairs);
        assert_eq!(kwargs["geom"], "POINT (0 0)");
        assert_eq!(kwargs["n"], 3);
    }
}
