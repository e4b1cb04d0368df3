//! Coercion between caller memory and stored field representations, in
//! both directions, with the error taxonomy the format prescribes.

use crate::codec::field::{FieldSpec, FieldValue};
use crate::errors::{Error, ErrorKind, Result};
use crate::stream::buffer::{BufferData, SourceDestBuffer};
use crate::types::FloatPrecision;

/// 2^63 as f64, the first double not representable as i64.
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

/// A value as fetched from caller memory, before write-side coercion.
pub(crate) enum SourceValue {
    Int(i64),
    Float(f64),
    Str(String),
}

/// Fetches the `record`-th element from a source buffer.
pub(crate) fn fetch(buffer: &SourceDestBuffer, record: usize) -> SourceValue {
    let slot = record * buffer.stride;
    match &buffer.data {
        BufferData::I8(data) => SourceValue::Int(i64::from(data.read()[slot])),
        BufferData::I16(data) => SourceValue::Int(i64::from(data.read()[slot])),
        BufferData::I32(data) => SourceValue::Int(i64::from(data.read()[slot])),
        BufferData::I64(data) => SourceValue::Int(data.read()[slot]),
        BufferData::F32(data) => SourceValue::Float(f64::from(data.read()[slot])),
        BufferData::F64(data) => SourceValue::Float(data.read()[slot]),
        BufferData::UString(data) => SourceValue::Str(data.read()[slot].clone()),
    }
}

/// Coerces a fetched value into the stored representation of its field,
/// validating bounds before any packet-buffer mutation.
pub(crate) fn stage(
    path: &str,
    spec: &FieldSpec,
    buffer: &SourceDestBuffer,
    value: SourceValue,
) -> Result<FieldValue> {
    match spec {
        FieldSpec::Integer { min, max } => {
            let v = match value {
                SourceValue::Int(v) => v,
                SourceValue::Float(f) => {
                    if !buffer.do_conversion {
                        return Err(conversion_required(path));
                    }
                    trunc_to_i64(f, path)?
                }
                SourceValue::Str(_) => return Err(expecting_numeric(path)),
            };
            check_raw_bounds(v, *min, *max, path)?;
            Ok(FieldValue::I64(v))
        }
        FieldSpec::ScaledInteger { min, max, scale, offset } => {
            let raw = match value {
                SourceValue::Int(v) => v,
                SourceValue::Float(f) => {
                    if buffer.do_scaling {
                        let raw = ((f - offset) / scale).round();
                        if !raw.is_finite() || raw < -I64_BOUND || raw >= I64_BOUND {
                            return Err(Error::new(
                                ErrorKind::Real64TooLarge,
                                format!("unscaled value {raw} of {path:?} overflows i64"),
                            ));
                        }
                        raw as i64
                    } else {
                        if !buffer.do_conversion {
                            return Err(conversion_required(path));
                        }
                        trunc_to_i64(f, path)?
                    }
                }
                SourceValue::Str(_) => return Err(expecting_numeric(path)),
            };
            check_raw_bounds(raw, *min, *max, path)?;
            Ok(FieldValue::I64(raw))
        }
        FieldSpec::Float { precision, min, max } => {
            let f = match value {
                SourceValue::Int(v) => i64_to_f64_exact(v, path)?,
                SourceValue::Float(f) => f,
                SourceValue::Str(_) => return Err(expecting_numeric(path)),
            };
            if !(f >= *min && f <= *max) {
                return Err(Error::new(
                    ErrorKind::ValueOutOfBounds,
                    format!("value {f} of {path:?} outside [{min}, {max}]"),
                ));
            }
            match precision {
                FloatPrecision::Single => {
                    let g = f as f32;
                    if f.is_finite() && !g.is_finite() {
                        return Err(Error::new(
                            ErrorKind::Real64TooLarge,
                            format!("value {f} of {path:?} overflows f32"),
                        ));
                    }
                    Ok(FieldValue::F32(g))
                }
                FloatPrecision::Double => Ok(FieldValue::F64(f)),
            }
        }
        FieldSpec::UString => match value {
            SourceValue::Str(s) => Ok(FieldValue::Str(s)),
            _ => Err(expecting_ustring(path)),
        },
    }
}

/// Delivers a decoded value into the `record`-th slot of a destination
/// buffer, applying the requested conversions and scaling.
pub(crate) fn deliver(
    path: &str,
    spec: &FieldSpec,
    buffer: &SourceDestBuffer,
    record: usize,
    value: FieldValue,
) -> Result<()> {
    let slot = record * buffer.stride;
    match value {
        FieldValue::I64(raw) => match &buffer.data {
            BufferData::F32(data) => {
                let scaled = scaled_delivery(spec, buffer, raw);
                let out = if let Some(x) = scaled {
                    let g = x as f32;
                    if x.is_finite() && !g.is_finite() {
                        return Err(Error::new(
                            ErrorKind::ScaledValueNotRepresentable,
                            format!("scaled value {x} of {path:?} overflows f32"),
                        ));
                    }
                    g
                } else {
                    i64_to_f32_exact(raw, path)?
                };
                data.write()[slot] = out;
                Ok(())
            }
            BufferData::F64(data) => {
                let out = match scaled_delivery(spec, buffer, raw) {
                    Some(x) => x,
                    None => i64_to_f64_exact(raw, path)?,
                };
                data.write()[slot] = out;
                Ok(())
            }
            BufferData::UString(_) => Err(expecting_numeric(path)),
            _ => store_int(&buffer.data, slot, raw, ErrorKind::ValueNotRepresentable, path),
        },
        FieldValue::F32(g) => match &buffer.data {
            BufferData::F32(data) => {
                data.write()[slot] = g;
                Ok(())
            }
            BufferData::F64(data) => {
                data.write()[slot] = f64::from(g);
                Ok(())
            }
            BufferData::UString(_) => Err(expecting_numeric(path)),
            _ => {
                if !buffer.do_conversion {
                    return Err(conversion_required(path));
                }
                let v = trunc_to_i64(f64::from(g), path)?;
                store_int(&buffer.data, slot, v, ErrorKind::Real64TooLarge, path)
            }
        },
        FieldValue::F64(f) => match &buffer.data {
            BufferData::F64(data) => {
                data.write()[slot] = f;
                Ok(())
            }
            BufferData::F32(data) => {
                if !buffer.do_conversion {
                    return Err(conversion_required(path));
                }
                let g = f as f32;
                if f.is_finite() && !g.is_finite() {
                    return Err(Error::new(
                        ErrorKind::Real64TooLarge,
                        format!("value {f} of {path:?} overflows f32"),
                    ));
                }
                data.write()[slot] = g;
                Ok(())
            }
            BufferData::UString(_) => Err(expecting_numeric(path)),
            _ => {
                if !buffer.do_conversion {
                    return Err(conversion_required(path));
                }
                let v = trunc_to_i64(f, path)?;
                store_int(&buffer.data, slot, v, ErrorKind::Real64TooLarge, path)
            }
        },
        FieldValue::Str(s) => match &buffer.data {
            BufferData::UString(data) => {
                data.write()[slot] = s;
                Ok(())
            }
            _ => Err(expecting_ustring(path)),
        },
    }
}

/// The scaled representation when the field is a ScaledInteger and the
/// buffer asked for scaling; raw delivery otherwise.
fn scaled_delivery(spec: &FieldSpec, buffer: &SourceDestBuffer, raw: i64) -> Option<f64> {
    match spec {
        FieldSpec::ScaledInteger { scale, offset, .. } if buffer.do_scaling => {
            Some((raw as f64).mul_add(*scale, *offset))
        }
        _ => None,
    }
}

fn store_int(
    data: &BufferData,
    slot: usize,
    v: i64,
    kind: ErrorKind,
    path: &str,
) -> Result<()> {
    let narrow = |err_ty: &str| {
        Error::new(kind, format!("value {v} of {path:?} does not fit {err_ty}"))
    };
    match data {
        BufferData::I8(data) => {
            let x = i8::try_from(v).map_err(|_| narrow("i8"))?;
            data.write()[slot] = x;
            Ok(())
        }
        BufferData::I16(data) => {
            let x = i16::try_from(v).map_err(|_| narrow("i16"))?;
            data.write()[slot] = x;
            Ok(())
        }
        BufferData::I32(data) => {
            let x = i32::try_from(v).map_err(|_| narrow("i32"))?;
            data.write()[slot] = x;
            Ok(())
        }
        BufferData::I64(data) => {
            data.write()[slot] = v;
            Ok(())
        }
        _ => Err(Error::internal("integer store into a non-integer buffer")),
    }
}

fn conversion_required(path: &str) -> Error {
    Error::new(
        ErrorKind::ConversionRequired,
        format!("{path:?} needs do_conversion for this coercion"),
    )
}

fn expecting_numeric(path: &str) -> Error {
    Error::new(ErrorKind::ExpectingNumeric, format!("{path:?} binds a numeric field"))
}

fn expecting_ustring(path: &str) -> Error {
    Error::new(ErrorKind::ExpectingUString, format!("{path:?} binds a string field"))
}

fn check_raw_bounds(v: i64, min: i64, max: i64, path: &str) -> Result<()> {
    if v < min || v > max {
        return Err(Error::new(
            ErrorKind::ValueOutOfBounds,
            format!("value {v} of {path:?} outside [{min}, {max}]"),
        ));
    }
    Ok(())
}

/// Truncation toward zero, the float-to-integer rounding the format uses.
fn trunc_to_i64(f: f64, path: &str) -> Result<i64> {
    if !f.is_finite() {
        return Err(Error::new(
            ErrorKind::Real64TooLarge,
            format!("non-finite value of {path:?} cannot convert to an integer"),
        ));
    }
    let t = f.trunc();
    if t < -I64_BOUND || t >= I64_BOUND {
        return Err(Error::new(
            ErrorKind::Real64TooLarge,
            format!("value {f} of {path:?} overflows i64"),
        ));
    }
    Ok(t as i64)
}

fn i64_to_f64_exact(v: i64, path: &str) -> Result<f64> {
    let f = v as f64;
    if f >= I64_BOUND || (f as i64) != v {
        return Err(Error::new(
            ErrorKind::ScaledValueNotRepresentable,
            format!("integer {v} of {path:?} is not exactly representable as f64"),
        ));
    }
    Ok(f)
}

fn i64_to_f32_exact(v: i64, path: &str) -> Result<f32> {
    let g = v as f32;
    if !g.is_finite() || i128::from(g as i64) != i128::from(v) || f64::from(g) >= I64_BOUND {
        return Err(Error::new(
            ErrorKind::ScaledValueNotRepresentable,
            format!("integer {v} of {path:?} is not exactly representable as f32"),
        ));
    }
    Ok(g)
}
