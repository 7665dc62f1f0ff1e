//! Shader definitions and their canonical text form

use std::collections::HashMap;
use std::fmt;

use crate::material::{PropertyValue, ShaderPass};

/// A named shader: ordered passes plus default property values.
///
/// The first pass is the canonical forward pass.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShaderDef {
    pub name: String,
    pub passes: Vec<ShaderPass>,
    pub default_properties: HashMap<String, PropertyValue>,
}

impl ShaderDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_pass(mut self, pass: ShaderPass) -> Self {
        self.passes.push(pass);
        self
    }

    pub fn with_property(mut self, name: &str, value: impl Into<PropertyValue>) -> Self {
        self.default_properties.insert(name.to_string(), value.into());
        self
    }

    pub fn pass(&self, name: &str) -> Option<&ShaderPass> {
        self.passes.iter().find(|p| p.name == name)
    }

    pub fn pass_index(&self, name: &str) -> Option<usize> {
        self.passes.iter().position(|p| p.name == name)
    }

    /// Render the definition in the shader description format
    pub fn to_source(&self) -> String {
        self.to_string()
    }
}

/// Quote a token, escaping `"` and `\`
pub(crate) fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Write a token bare when the tokenizer reads it back unchanged, quoted otherwise
pub(crate) fn token(value: &str) -> std::borrow::Cow<'_, str> {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\\');
    if needs_quotes {
        quote(value).into()
    } else {
        value.into()
    }
}

impl fmt::Display for ShaderDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "shader {}", quote(&self.name))?;
        for pass in &self.passes {
            writeln!(f, "pass {}", quote(&pass.name))?;
            if !pass.vertex_shader.is_empty() {
                writeln!(f, "  vertex {}", quote(&pass.vertex_shader))?;
            }
            if !pass.fragment_shader.is_empty() {
                writeln!(f, "  fragment {}", quote(&pass.fragment_shader))?;
            }
            for define in &pass.defines {
                writeln!(f, "  define {}", token(define))?;
            }
            writeln!(f, "end")?;
        }

        let mut names: Vec<&String> = self.default_properties.keys().collect();
        names.sort();
        for name in names {
            let value = &self.default_properties[name];
            writeln!(
                f,
                "property {} {} {}",
                token(name),
                value.kind(),
                value.components().join(" ")
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("a \"b\" \\c"), "\"a \\\"b\\\" \\\\c\"");
    }

    #[test]
    fn test_token_quotes_only_when_needed() {
        assert_eq!(token("USE_NORMAL_MAP"), "USE_NORMAL_MAP");
        assert_eq!(token("tint color"), "\"tint color\"");
        assert_eq!(token("a\\b"), "\"a\\\\b\"");
        assert_eq!(token(""), "\"\"");
    }

    #[test]
    fn test_display_is_sorted_and_canonical() {
        let def = ShaderDef::new("Glass")
            .with_pass(ShaderPass::new("Forward", "shaders/glass_vert.spv", "shaders/glass_frag.spv"))
            .with_property("roughness", 0.1f32)
            .with_property("baseColor", Vec4::new(1.0, 1.0, 1.0, 0.5));

        let expected = "shader \"Glass\"\n\
                        pass \"Forward\"\n  \
                        vertex \"shaders/glass_vert.spv\"\n  \
                        fragment \"shaders/glass_frag.spv\"\n\
                        end\n\
                        property baseColor vec4 1 1 1 0.5\n\
                        property roughness float 0.1\n";
        assert_eq!(def.to_source(), expected);
    }
}
