//! Tagged property values stored in a material's custom property bag

use std::fmt;
use std::str::FromStr;

use glam::{Mat4, Vec2, Vec3, Vec4};

/// A shader property value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropertyValue {
    Float(f32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Mat4(Mat4),
    Int(i32),
}

/// Tag of a [`PropertyValue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    Float,
    Vec2,
    Vec3,
    Vec4,
    Mat4,
    Int,
}

impl PropertyKind {
    /// Keyword used in shader description files
    pub fn keyword(&self) -> &'static str {
        match self {
            PropertyKind::Float => "float",
            PropertyKind::Vec2 => "vec2",
            PropertyKind::Vec3 => "vec3",
            PropertyKind::Vec4 => "vec4",
            PropertyKind::Mat4 => "mat4",
            PropertyKind::Int => "int",
        }
    }

    /// Number of scalar components
    pub fn component_count(&self) -> usize {
        match self {
            PropertyKind::Float | PropertyKind::Int => 1,
            PropertyKind::Vec2 => 2,
            PropertyKind::Vec3 => 3,
            PropertyKind::Vec4 => 4,
            PropertyKind::Mat4 => 16,
        }
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPropertyKind(pub String);

impl fmt::Display for UnknownPropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown property type '{}'", self.0)
    }
}

impl std::error::Error for UnknownPropertyKind {}

impl FromStr for PropertyKind {
    type Err = UnknownPropertyKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "float" => Ok(PropertyKind::Float),
            "vec2" => Ok(PropertyKind::Vec2),
            "vec3" => Ok(PropertyKind::Vec3),
            "vec4" => Ok(PropertyKind::Vec4),
            "mat4" => Ok(PropertyKind::Mat4),
            "int" => Ok(PropertyKind::Int),
            other => Err(UnknownPropertyKind(other.to_string())),
        }
    }
}

impl PropertyValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::Float(_) => PropertyKind::Float,
            PropertyValue::Vec2(_) => PropertyKind::Vec2,
            PropertyValue::Vec3(_) => PropertyKind::Vec3,
            PropertyValue::Vec4(_) => PropertyKind::Vec4,
            PropertyValue::Mat4(_) => PropertyKind::Mat4,
            PropertyValue::Int(_) => PropertyKind::Int,
        }
    }

    /// Build a value of `kind` from textual components.
    ///
    /// Returns `None` when the count is wrong or a component does not parse.
    /// `mat4` components are column-major.
    pub fn parse_components(kind: PropertyKind, components: &[&str]) -> Option<Self> {
        if components.len() != kind.component_count() {
            return None;
        }
        if kind == PropertyKind::Int {
            return components[0].parse().ok().map(PropertyValue::Int);
        }
        let floats = components
            .iter()
            .map(|c| c.parse::<f32>())
            .collect::<Result<Vec<_>, _>>()
            .ok()?;
        Some(match kind {
            PropertyKind::Float => PropertyValue::Float(floats[0]),
            PropertyKind::Vec2 => PropertyValue::Vec2(Vec2::from_slice(&floats)),
            PropertyKind::Vec3 => PropertyValue::Vec3(Vec3::from_slice(&floats)),
            PropertyKind::Vec4 => PropertyValue::Vec4(Vec4::from_slice(&floats)),
            PropertyKind::Mat4 => PropertyValue::Mat4(Mat4::from_cols_slice(&floats)),
            PropertyKind::Int => unreachable!("handled above"),
        })
    }

    /// Components in the order [`PropertyValue::parse_components`] reads them
    pub fn components(&self) -> Vec<String> {
        match self {
            PropertyValue::Float(v) => vec![v.to_string()],
            PropertyValue::Vec2(v) => v.to_array().iter().map(f32::to_string).collect(),
            PropertyValue::Vec3(v) => v.to_array().iter().map(f32::to_string).collect(),
            PropertyValue::Vec4(v) => v.to_array().iter().map(f32::to_string).collect(),
            PropertyValue::Mat4(m) => m.to_cols_array().iter().map(f32::to_string).collect(),
            PropertyValue::Int(v) => vec![v.to_string()],
        }
    }
}

/// Rust types that map onto exactly one [`PropertyValue`] arm
pub trait Property: Sized + Copy {
    const KIND: PropertyKind;

    fn from_value(value: &PropertyValue) -> Option<Self>;

    fn into_value(self) -> PropertyValue;
}

macro_rules! impl_property {
    ($ty:ty, $arm:ident) => {
        impl Property for $ty {
            const KIND: PropertyKind = PropertyKind::$arm;

            fn from_value(value: &PropertyValue) -> Option<Self> {
                match value {
                    PropertyValue::$arm(v) => Some(*v),
                    _ => None,
                }
            }

            fn into_value(self) -> PropertyValue {
                PropertyValue::$arm(self)
            }
        }

        impl From<$ty> for PropertyValue {
            fn from(value: $ty) -> Self {
                PropertyValue::$arm(value)
            }
        }
    };
}

impl_property!(f32, Float);
impl_property!(Vec2, Vec2);
impl_property!(Vec3, Vec3);
impl_property!(Vec4, Vec4);
impl_property!(Mat4, Mat4);
impl_property!(i32, Int);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_implicit_conversion() {
        let value = PropertyValue::Int(3);
        assert_eq!(i32::from_value(&value), Some(3));
        assert_eq!(f32::from_value(&value), None);
        assert_eq!(Vec4::from_value(&PropertyValue::Vec3(Vec3::ONE)), None);
    }

    #[test]
    fn test_parse_components() {
        assert_eq!(
            PropertyValue::parse_components(PropertyKind::Vec3, &["1", "0.5", "-2"]),
            Some(PropertyValue::Vec3(Vec3::new(1.0, 0.5, -2.0)))
        );
        assert_eq!(
            PropertyValue::parse_components(PropertyKind::Int, &["7"]),
            Some(PropertyValue::Int(7))
        );
        assert_eq!(PropertyValue::parse_components(PropertyKind::Int, &["7.5"]), None);
        assert_eq!(PropertyValue::parse_components(PropertyKind::Vec2, &["1"]), None);
        assert_eq!(PropertyValue::parse_components(PropertyKind::Float, &["abc"]), None);
    }

    #[test]
    fn test_mat4_components_are_column_major() {
        let m = Mat4::from_translation(Vec3::new(4.0, 5.0, 6.0));
        let components = PropertyValue::Mat4(m).components();
        assert_eq!(&components[12..15], &["4", "5", "6"]);
        let refs: Vec<&str> = components.iter().map(String::as_str).collect();
        assert_eq!(
            PropertyValue::parse_components(PropertyKind::Mat4, &refs),
            Some(PropertyValue::Mat4(m))
        );
    }

    #[test]
    fn test_kind_keywords() {
        for kind in [
            PropertyKind::Float,
            PropertyKind::Vec2,
            PropertyKind::Vec3,
            PropertyKind::Vec4,
            PropertyKind::Mat4,
            PropertyKind::Int,
        ] {
            assert_eq!(kind.keyword().parse::<PropertyKind>(), Ok(kind));
        }
        assert!("double".parse::<PropertyKind>().is_err());
    }
}
