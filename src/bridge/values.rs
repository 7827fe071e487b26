//! `create` / `createComponent`: host value construction by type tag.
//!
//! Values are tagged maps (`{ type: "vector3d", x, y, z }`) the host maps
//! onto its own types. Unknown tags and unusable arguments give `Null`.

use uuid::Uuid;

use crate::value::HostValue;

/// `server.create(tag, ...args)`.
pub fn create(tag: &str, args: &[HostValue]) -> HostValue {
    match tag {
        "uuid" => uuid(args),
        "vector3d" => vector3d(args).unwrap_or_default(),
        "vector3i" => vector3i(args).unwrap_or_default(),
        "transform" => transform("transform", args),
        "message" => message(args),
        other => {
            log::warn!("create: unknown type '{other}'");
            HostValue::Null
        }
    }
}

/// `server.createComponent(tag, ...args)`.
pub fn create_component(tag: &str, args: &[HostValue]) -> HostValue {
    match tag {
        "transform" => transform("transformComponent", args),
        other => {
            log::warn!("createComponent: unknown type '{other}'");
            HostValue::Null
        }
    }
}

fn uuid(args: &[HostValue]) -> HostValue {
    match args.first() {
        None | Some(HostValue::Null) => HostValue::String(Uuid::new_v4().to_string()),
        Some(HostValue::String(text)) => match Uuid::parse_str(text) {
            Ok(id) => HostValue::String(id.to_string()),
            Err(e) => {
                log::warn!("create('uuid'): invalid uuid '{text}': {e}");
                HostValue::Null
            }
        },
        Some(_) => HostValue::Null,
    }
}

fn tagged(tag: &str, fields: impl IntoIterator<Item = (&'static str, HostValue)>) -> HostValue {
    HostValue::map(std::iter::once(("type", HostValue::from(tag))).chain(fields))
}

fn xyz(tag: &str, x: f64, y: f64, z: f64) -> HostValue {
    tagged(
        tag,
        [
            ("x", HostValue::Float(x)),
            ("y", HostValue::Float(y)),
            ("z", HostValue::Float(z)),
        ],
    )
}

fn components(value: &HostValue) -> Option<(f64, f64, f64)> {
    Some((
        value.get("x")?.as_f64()?,
        value.get("y")?.as_f64()?,
        value.get("z")?.as_f64()?,
    ))
}

fn numbers(args: &[HostValue]) -> Option<Vec<f64>> {
    args.iter().map(HostValue::as_f64).collect()
}

/// `(x, y, z)`, `({x, y, z})`, `(yaw, pitch)` in radians as a unit
/// direction, or `()` for the zero vector.
fn vector3d(args: &[HostValue]) -> Option<HostValue> {
    if let [single] = args {
        let (x, y, z) = components(single)?;
        return Some(xyz("vector3d", x, y, z));
    }
    match numbers(args)?.as_slice() {
        [] => Some(xyz("vector3d", 0.0, 0.0, 0.0)),
        [yaw, pitch] => Some(xyz(
            "vector3d",
            -yaw.sin() * pitch.cos(),
            pitch.sin(),
            yaw.cos() * pitch.cos(),
        )),
        [x, y, z] => Some(xyz("vector3d", *x, *y, *z)),
        _ => None,
    }
}

fn ixyz(x: f64, y: f64, z: f64) -> HostValue {
    tagged(
        "vector3i",
        [
            ("x", HostValue::Int(x.floor() as i64)),
            ("y", HostValue::Int(y.floor() as i64)),
            ("z", HostValue::Int(z.floor() as i64)),
        ],
    )
}

/// `(x, y, z)` floored, `({x, y, z})`, or `()` for the origin.
fn vector3i(args: &[HostValue]) -> Option<HostValue> {
    if let [single] = args {
        let (x, y, z) = components(single)?;
        return Some(ixyz(x, y, z));
    }
    match numbers(args)?.as_slice() {
        [] => Some(ixyz(0.0, 0.0, 0.0)),
        [x, y, z] => Some(ixyz(*x, *y, *z)),
        _ => None,
    }
}

fn as_vector(value: Option<&HostValue>) -> HostValue {
    value
        .and_then(components)
        .map_or_else(|| xyz("vector3d", 0.0, 0.0, 0.0), |(x, y, z)| xyz("vector3d", x, y, z))
}

fn transform(tag: &str, args: &[HostValue]) -> HostValue {
    tagged(
        tag,
        [("position", as_vector(args.first())), ("rotation", as_vector(args.get(1)))],
    )
}

fn message(args: &[HostValue]) -> HostValue {
    let text = match args.first() {
        Some(HostValue::String(s)) => s.clone(),
        Some(HostValue::Int(i)) => i.to_string(),
        Some(HostValue::Float(f)) => f.to_string(),
        Some(HostValue::Bool(b)) => b.to_string(),
        _ => String::new(),
    };
    tagged("message", [("text", HostValue::String(text))])
}
