//! Declarative parameter schemas.
//!
//! Each endpoint lists its fields as a `&'static [ParamSpec]`. The
//! dispatcher checks presence, JSON type and range once; handlers then read
//! through [`Params`] without re-validating.

use serde_json::{Map, Value};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Kind {
    Int { min: i64, max: i64 },
    Float { min: f64, max: f64 },
    Bool,
    /// Any string when `one_of` is empty.
    Str { one_of: &'static [&'static str] },
    Array { max_len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: Kind,
    pub required: bool,
    /// Reported when the value is out of range. A generic message naming
    /// the field is used otherwise.
    pub range_msg: Option<&'static str>,
}

impl ParamSpec {
    const fn of(name: &'static str, kind: Kind) -> Self {
        Self {
            name,
            kind,
            required: false,
            range_msg: None,
        }
    }

    pub const fn int(name: &'static str, min: i64, max: i64) -> Self {
        Self::of(name, Kind::Int { min, max })
    }

    pub const fn float(name: &'static str, min: f64, max: f64) -> Self {
        Self::of(name, Kind::Float { min, max })
    }

    pub const fn bool(name: &'static str) -> Self {
        Self::of(name, Kind::Bool)
    }

    pub const fn str(name: &'static str) -> Self {
        Self::of(name, Kind::Str { one_of: &[] })
    }

    pub const fn one_of(name: &'static str, values: &'static [&'static str]) -> Self {
        Self::of(name, Kind::Str { one_of: values })
    }

    pub const fn array(name: &'static str, max_len: usize) -> Self {
        Self::of(name, Kind::Array { max_len })
    }

    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub const fn range_msg(mut self, msg: &'static str) -> Self {
        self.range_msg = Some(msg);
        self
    }

    fn type_name(&self) -> &'static str {
        match self.kind {
            Kind::Int { .. } => "an integer",
            Kind::Float { .. } => "a number",
            Kind::Bool => "a boolean",
            Kind::Str { .. } => "a string",
            Kind::Array { .. } => "an array",
        }
    }

    fn out_of_range(&self) -> String {
        match (self.range_msg, self.kind) {
            (Some(msg), _) => msg.to_owned(),
            (None, Kind::Int { min, max }) => {
                format!("Parameter {} must be {}-{}", self.name, min, max)
            }
            (None, Kind::Float { min, max }) => {
                format!("Parameter {} must be {}-{}", self.name, min, max)
            }
            (None, Kind::Str { one_of }) => {
                format!("Parameter {} must be one of: {}", self.name, one_of.join(", "))
            }
            (None, Kind::Array { max_len }) => {
                format!("Parameter {} allows at most {} items", self.name, max_len)
            }
            (None, Kind::Bool) => format!("Invalid parameter: {}", self.name),
        }
    }

    /// `Err(message)` names the offending field.
    fn check(&self, value: Option<&Value>) -> core::result::Result<(), String> {
        let Some(value) = value.filter(|v| !v.is_null()) else {
            return if self.required {
                Err(format!("Missing required parameter: {}", self.name))
            } else {
                Ok(())
            };
        };
        let wrong_type = || format!("Parameter {} must be {}", self.name, self.type_name());
        let in_range = match self.kind {
            Kind::Int { min, max } => {
                let n = match value.as_i64() {
                    Some(n) => n,
                    // 45.0 is accepted as an integer, 45.5 is not
                    None => match value.as_f64() {
                        Some(f) if f.fract() == 0.0 => f as i64,
                        _ => return Err(wrong_type()),
                    },
                };
                (min..=max).contains(&n)
            }
            Kind::Float { min, max } => {
                let f = value.as_f64().ok_or_else(wrong_type)?;
                f.is_finite() && f >= min && f <= max
            }
            Kind::Bool => {
                value.as_bool().ok_or_else(wrong_type)?;
                true
            }
            Kind::Str { one_of } => {
                let s = value.as_str().ok_or_else(wrong_type)?;
                one_of.is_empty() || one_of.contains(&s)
            }
            Kind::Array { max_len } => value.as_array().ok_or_else(wrong_type)?.len() <= max_len,
        };
        if in_range { Ok(()) } else { Err(self.out_of_range()) }
    }
}

/// Validate `params` against `specs`. An absent or `null` params value is
/// treated as an empty object.
pub fn validate<'a>(
    specs: &[ParamSpec],
    params: &'a Value,
) -> core::result::Result<Params<'a>, String> {
    static EMPTY: std::sync::OnceLock<Map<String, Value>> = std::sync::OnceLock::new();
    let map = match params {
        Value::Object(m) => m,
        Value::Null => EMPTY.get_or_init(Map::new),
        _ => return Err("Parameters must be an object".to_owned()),
    };
    for spec in specs {
        spec.check(map.get(spec.name))?;
    }
    Ok(Params { map })
}

/// Validated parameter view.
#[derive(Debug, Clone, Copy)]
pub struct Params<'a> {
    map: &'a Map<String, Value>,
}

impl<'a> Params<'a> {
    pub fn has(&self, name: &str) -> bool {
        self.map.get(name).is_some_and(|v| !v.is_null())
    }

    pub fn raw(&self, name: &str) -> Option<&'a Value> {
        self.map.get(name).filter(|v| !v.is_null())
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        let v = self.raw(name)?;
        v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.raw(name)?.as_f64()
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.raw(name)?.as_bool()
    }

    pub fn str(&self, name: &str) -> Option<&'a str> {
        self.raw(name)?.as_str()
    }

    pub fn array(&self, name: &str) -> Option<&'a Vec<Value>> {
        self.raw(name)?.as_array()
    }

    /// Integer field declared `required` in the endpoint schema.
    pub fn req_i64(&self, name: &'static str) -> Result<i64> {
        self.i64(name).ok_or(Error::InvalidArg("missing required parameter"))
    }

    pub fn req_bool(&self, name: &'static str) -> Result<bool> {
        self.bool(name).ok_or(Error::InvalidArg("missing required parameter"))
    }

    pub fn req_str(&self, name: &'static str) -> Result<&'a str> {
        self.str(name).ok_or(Error::InvalidArg("missing required parameter"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const FAN_SET: &[ParamSpec] = &[
        ParamSpec::int("id", 0, 3).required().range_msg("Invalid fan ID"),
        ParamSpec::int("duty", 0, 100).required().range_msg("Duty must be 0-100"),
    ];

    #[test]
    fn missing_required_names_field() {
        let p = json!({"duty": 50});
        assert_eq!(
            validate(FAN_SET, &p).unwrap_err(),
            "Missing required parameter: id"
        );
    }

    #[test]
    fn range_message_is_used() {
        let p = json!({"id": 0, "duty": 101});
        assert_eq!(validate(FAN_SET, &p).unwrap_err(), "Duty must be 0-100");
        let p = json!({"id": 7, "duty": 10});
        assert_eq!(validate(FAN_SET, &p).unwrap_err(), "Invalid fan ID");
    }

    #[test]
    fn wrong_type_is_rejected() {
        let p = json!({"id": "zero", "duty": 10});
        assert_eq!(
            validate(FAN_SET, &p).unwrap_err(),
            "Parameter id must be an integer"
        );
    }

    #[test]
    fn null_params_behave_as_empty() {
        let specs = [ParamSpec::int("id", 0, 3)];
        let p = validate(&specs, &Value::Null).unwrap();
        assert!(!p.has("id"));
        assert!(validate(&specs, &json!([1, 2])).is_err());
    }

    #[test]
    fn enum_strings() {
        let specs = [ParamSpec::one_of("mode", &["off", "auto"])];
        assert!(validate(&specs, &json!({"mode": "auto"})).is_ok());
        assert_eq!(
            validate(&specs, &json!({"mode": "turbo"})).unwrap_err(),
            "Parameter mode must be one of: off, auto"
        );
    }

    #[test]
    fn whole_floats_pass_as_int() {
        let p = json!({"id": 1.0, "duty": 40});
        let v = validate(FAN_SET, &p).unwrap();
        assert_eq!(v.i64("id"), Some(1));
        assert!(validate(FAN_SET, &json!({"id": 1.5, "duty": 40})).is_err());
    }
}
