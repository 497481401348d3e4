//! Conversion between shapes and their flat wire JSON form.
//!
//! Every shape travels as one JSON object:
//! ```text
//! { "id": "…", "type": "Rect", "x": 100, "y": 100, "rotation": 0,
//!   "scaleX": 1, "scaleY": 1, "zIndex": 0, "visible": true, "locked": false,
//!   "fill": "#ffffff" | null, "stroke": "#000000", "strokeWidth": 2,
//!   "opacity": 1, "lineCap": "butt", "lineJoin": "miter", "dash": [],
//!   …variant fields…, "children": [ … ] (groups only) }
//! ```
//! `rotation` is in radians. The factory rejects unknown types and missing or
//! ill-typed required fields instead of building a partially valid shape.

use super::{
    Ellipse, Group, LineCap, LineJoin, LocalTransform, Polyline, Rectangle, SerializableColor,
    Shape, ShapeError, ShapeId, ShapeKind, ShapeSnapshot, ShapeStyle, Smoothing, Text,
};
use kurbo::Point;
use serde_json::{Map, Value, json};

// Shape type identifiers
pub const TYPE_RECT: &str = "Rect";
pub const TYPE_CIRCLE: &str = "Circle";
pub const TYPE_PATH: &str = "Path";
pub const TYPE_TEXT: &str = "Text";
pub const TYPE_GROUP: &str = "Group";

// Accepted aliases
const TYPE_ELLIPSE_ALIAS: &str = "Ellipse";
const TYPE_POLYLINE_ALIAS: &str = "Polyline";

// Common keys
const KEY_ID: &str = "id";
const KEY_TYPE: &str = "type";
const KEY_X: &str = "x";
const KEY_Y: &str = "y";
const KEY_ROTATION: &str = "rotation";
const KEY_SCALE_X: &str = "scaleX";
const KEY_SCALE_Y: &str = "scaleY";
const KEY_Z_INDEX: &str = "zIndex";
const KEY_VISIBLE: &str = "visible";
const KEY_LOCKED: &str = "locked";

// Style keys
const KEY_FILL: &str = "fill";
const KEY_STROKE: &str = "stroke";
const KEY_STROKE_WIDTH: &str = "strokeWidth";
const KEY_OPACITY: &str = "opacity";
const KEY_LINE_CAP: &str = "lineCap";
const KEY_LINE_JOIN: &str = "lineJoin";
const KEY_DASH: &str = "dash";

// Rect keys
const KEY_WIDTH: &str = "width";
const KEY_HEIGHT: &str = "height";
const KEY_CORNER_RADIUS: &str = "cornerRadius";

// Circle keys
const KEY_RADIUS: &str = "radius";

// Path keys
const KEY_POINTS: &str = "points";
const KEY_SMOOTHING: &str = "smoothing";
const KEY_CLOSED: &str = "closed";

// Text keys
const KEY_TEXT: &str = "text";
const KEY_CONTENT_ALIAS: &str = "content";
const KEY_FONT_SIZE: &str = "fontSize";
const KEY_FONT_FAMILY: &str = "fontFamily";
const KEY_LINE_HEIGHT: &str = "lineHeight";
const KEY_BOLD: &str = "bold";
const KEY_ITALIC: &str = "italic";

// Group keys
const KEY_CHILDREN: &str = "children";

fn invalid(field: &str, reason: impl Into<String>) -> ShapeError {
    ShapeError::InvalidField {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn get_f64(map: &Map<String, Value>, key: &str) -> Result<Option<f64>, ShapeError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) if v.is_finite() => Ok(Some(v)),
            _ => Err(invalid(key, "not a finite number")),
        },
        Some(_) => Err(invalid(key, "expected a number")),
    }
}

fn require_f64(map: &Map<String, Value>, key: &'static str) -> Result<f64, ShapeError> {
    get_f64(map, key)?.ok_or(ShapeError::MissingField(key))
}

fn get_bool(map: &Map<String, Value>, key: &str) -> Result<Option<bool>, ShapeError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(invalid(key, "expected a boolean")),
    }
}

fn get_str<'a>(map: &'a Map<String, Value>, key: &str) -> Result<Option<&'a str>, ShapeError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(invalid(key, "expected a string")),
    }
}

fn get_color(map: &Map<String, Value>, key: &str) -> Result<Option<SerializableColor>, ShapeError> {
    get_str(map, key)?
        .map(|s| SerializableColor::parse(s).ok_or_else(|| invalid(key, format!("bad color {s}"))))
        .transpose()
}

fn get_enum<T: serde::de::DeserializeOwned>(
    map: &Map<String, Value>,
    key: &str,
) -> Result<Option<T>, ShapeError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|e| invalid(key, e.to_string())),
    }
}

fn parse_point(value: &Value) -> Option<Point> {
    match value {
        Value::Array(pair) if pair.len() == 2 => {
            Some(Point::new(pair[0].as_f64()?, pair[1].as_f64()?))
        }
        Value::Object(obj) => Some(Point::new(
            obj.get(KEY_X)?.as_f64()?,
            obj.get(KEY_Y)?.as_f64()?,
        )),
        _ => None,
    }
    .filter(|p| p.x.is_finite() && p.y.is_finite())
}

fn parse_points(map: &Map<String, Value>) -> Result<Vec<Point>, ShapeError> {
    let raw = match map.get(KEY_POINTS) {
        None | Some(Value::Null) => return Err(ShapeError::MissingField(KEY_POINTS)),
        Some(Value::Array(raw)) => raw,
        Some(_) => return Err(invalid(KEY_POINTS, "expected an array")),
    };
    raw.iter()
        .enumerate()
        .map(|(i, v)| parse_point(v).ok_or_else(|| invalid(KEY_POINTS, format!("bad point at {i}"))))
        .collect()
}

fn style_from_json(map: &Map<String, Value>) -> Result<ShapeStyle, ShapeError> {
    let defaults = ShapeStyle::default();
    let fill = match map.get(KEY_FILL) {
        None | Some(Value::Null) => None,
        Some(_) => get_color(map, KEY_FILL)?,
    };
    let dash = match map.get(KEY_DASH) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_f64().ok_or_else(|| invalid(KEY_DASH, "expected numbers")))
            .collect::<Result<_, _>>()?,
        Some(_) => return Err(invalid(KEY_DASH, "expected an array")),
    };
    Ok(ShapeStyle {
        fill,
        stroke: get_color(map, KEY_STROKE)?.unwrap_or(defaults.stroke),
        stroke_width: get_f64(map, KEY_STROKE_WIDTH)?.unwrap_or(defaults.stroke_width),
        opacity: get_f64(map, KEY_OPACITY)?.unwrap_or(defaults.opacity),
        line_cap: get_enum::<LineCap>(map, KEY_LINE_CAP)?.unwrap_or_default(),
        line_join: get_enum::<LineJoin>(map, KEY_LINE_JOIN)?.unwrap_or_default(),
        dash,
    })
}

/// Build a shape (and, for groups, its whole subtree) from wire JSON.
pub fn shape_from_json(value: &Value) -> Result<ShapeSnapshot, ShapeError> {
    let map = value.as_object().ok_or(ShapeError::NotAnObject)?;

    let type_tag = get_str(map, KEY_TYPE)?.ok_or(ShapeError::MissingField(KEY_TYPE))?;
    let id = get_str(map, KEY_ID)?.ok_or(ShapeError::MissingField(KEY_ID))?;
    if id.is_empty() {
        return Err(invalid(KEY_ID, "empty id"));
    }

    let mut children = Vec::new();
    let kind = match type_tag {
        TYPE_RECT => ShapeKind::Rect(Rectangle {
            width: require_f64(map, KEY_WIDTH)?,
            height: require_f64(map, KEY_HEIGHT)?,
            corner_radius: get_f64(map, KEY_CORNER_RADIUS)?.unwrap_or(0.0),
        }),
        TYPE_CIRCLE | TYPE_ELLIPSE_ALIAS => ShapeKind::Circle(Ellipse {
            radius: require_f64(map, KEY_RADIUS)?,
        }),
        TYPE_PATH | TYPE_POLYLINE_ALIAS => ShapeKind::Path(Polyline {
            points: parse_points(map)?,
            smoothing: get_enum::<Smoothing>(map, KEY_SMOOTHING)?.unwrap_or_default(),
            closed: get_bool(map, KEY_CLOSED)?.unwrap_or(false),
        }),
        TYPE_TEXT => {
            let content = match get_str(map, KEY_TEXT)? {
                Some(s) => s,
                None => get_str(map, KEY_CONTENT_ALIAS)?.ok_or(ShapeError::MissingField(KEY_TEXT))?,
            };
            ShapeKind::Text(Text {
                content: content.to_string(),
                font_size: get_f64(map, KEY_FONT_SIZE)?.unwrap_or(Text::DEFAULT_FONT_SIZE),
                font_family: get_str(map, KEY_FONT_FAMILY)?
                    .unwrap_or(Text::DEFAULT_FONT_FAMILY)
                    .to_string(),
                line_height: get_f64(map, KEY_LINE_HEIGHT)?.unwrap_or(Text::DEFAULT_LINE_HEIGHT),
                bold: get_bool(map, KEY_BOLD)?.unwrap_or(false),
                italic: get_bool(map, KEY_ITALIC)?.unwrap_or(false),
            })
        }
        TYPE_GROUP => {
            if let Some(raw) = map.get(KEY_CHILDREN) {
                let raw = raw
                    .as_array()
                    .ok_or_else(|| invalid(KEY_CHILDREN, "expected an array"))?;
                for child in raw {
                    children.push(shape_from_json(child)?);
                }
            }
            ShapeKind::Group(Group::new(
                children.iter().map(|c| c.shape.id.clone()).collect(),
            ))
        }
        other => return Err(ShapeError::UnknownType(other.to_string())),
    };

    let shape = Shape {
        id: ShapeId::from(id),
        transform: LocalTransform {
            x: get_f64(map, KEY_X)?.unwrap_or(0.0),
            y: get_f64(map, KEY_Y)?.unwrap_or(0.0),
            rotation: get_f64(map, KEY_ROTATION)?.unwrap_or(0.0),
            scale_x: get_f64(map, KEY_SCALE_X)?.unwrap_or(1.0),
            scale_y: get_f64(map, KEY_SCALE_Y)?.unwrap_or(1.0),
        },
        style: style_from_json(map)?,
        visible: get_bool(map, KEY_VISIBLE)?.unwrap_or(true),
        locked: get_bool(map, KEY_LOCKED)?.unwrap_or(false),
        z_index: get_f64(map, KEY_Z_INDEX)?.unwrap_or(0.0) as i32,
        parent: None,
        kind,
    };
    Ok(ShapeSnapshot { shape, children })
}

/// Serialize a shape subtree to wire JSON.
pub fn shape_to_json(snapshot: &ShapeSnapshot) -> Value {
    let shape = &snapshot.shape;
    let mut map = Map::new();
    map.insert(KEY_ID.into(), json!(shape.id.as_str()));
    map.insert(KEY_TYPE.into(), json!(shape.type_tag()));
    map.insert(KEY_X.into(), json!(shape.transform.x));
    map.insert(KEY_Y.into(), json!(shape.transform.y));
    map.insert(KEY_ROTATION.into(), json!(shape.transform.rotation));
    map.insert(KEY_SCALE_X.into(), json!(shape.transform.scale_x));
    map.insert(KEY_SCALE_Y.into(), json!(shape.transform.scale_y));
    map.insert(KEY_Z_INDEX.into(), json!(shape.z_index));
    map.insert(KEY_VISIBLE.into(), json!(shape.visible));
    map.insert(KEY_LOCKED.into(), json!(shape.locked));

    let style = &shape.style;
    map.insert(KEY_FILL.into(), json!(style.fill.map(|c| c.to_hex())));
    map.insert(KEY_STROKE.into(), json!(style.stroke.to_hex()));
    map.insert(KEY_STROKE_WIDTH.into(), json!(style.stroke_width));
    map.insert(KEY_OPACITY.into(), json!(style.opacity));
    map.insert(KEY_LINE_CAP.into(), json!(style.line_cap));
    map.insert(KEY_LINE_JOIN.into(), json!(style.line_join));
    map.insert(KEY_DASH.into(), json!(style.dash));

    match &shape.kind {
        ShapeKind::Rect(rect) => {
            map.insert(KEY_WIDTH.into(), json!(rect.width));
            map.insert(KEY_HEIGHT.into(), json!(rect.height));
            map.insert(KEY_CORNER_RADIUS.into(), json!(rect.corner_radius));
        }
        ShapeKind::Circle(ellipse) => {
            map.insert(KEY_RADIUS.into(), json!(ellipse.radius));
        }
        ShapeKind::Path(line) => {
            let points: Vec<[f64; 2]> = line.points.iter().map(|p| [p.x, p.y]).collect();
            map.insert(KEY_POINTS.into(), json!(points));
            map.insert(KEY_SMOOTHING.into(), json!(line.smoothing));
            map.insert(KEY_CLOSED.into(), json!(line.closed));
        }
        ShapeKind::Text(text) => {
            map.insert(KEY_TEXT.into(), json!(text.content));
            map.insert(KEY_FONT_SIZE.into(), json!(text.font_size));
            map.insert(KEY_FONT_FAMILY.into(), json!(text.font_family));
            map.insert(KEY_LINE_HEIGHT.into(), json!(text.line_height));
            map.insert(KEY_BOLD.into(), json!(text.bold));
            map.insert(KEY_ITALIC.into(), json!(text.italic));
        }
        ShapeKind::Group(_) => {
            let children: Vec<Value> = snapshot.children.iter().map(shape_to_json).collect();
            map.insert(KEY_CHILDREN.into(), Value::Array(children));
        }
    }
    Value::Object(map)
}

/// Overlay update fields onto a shape's wire JSON. Identity keys are ignored.
pub fn merge_fields(target: &mut Value, fields: &Map<String, Value>) {
    let Some(map) = target.as_object_mut() else {
        return;
    };
    for (key, value) in fields {
        if key == KEY_ID || key == KEY_TYPE || key == "shapeId" {
            continue;
        }
        map.insert(key.clone(), value.clone());
    }
}
