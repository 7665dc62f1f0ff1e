//! Parser for shader description files.
//!
//! The format is line oriented with whitespace-separated tokens; blank lines
//! and lines starting with `#` are ignored. Tokens may be double-quoted to
//! contain spaces, with `\"` and `\\` as escapes.
//!
//! ```text
//! shader "Terrain"
//! pass "Forward"
//!   vertex "shaders/terrain_vert.spv"
//!   fragment "shaders/terrain_frag.spv"
//!   define USE_NORMAL_MAP
//! end
//! property baseColor vec4 0.4 0.6 0.3 1
//! ```
//!
//! Malformed directives are skipped. Only structural problems that would make
//! the result ambiguous reject the whole file.

use thiserror::Error;

use crate::material::{PropertyKind, PropertyValue, ShaderDef, ShaderPass};

/// Errors that reject a shader description
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: 'pass' before any 'shader' directive")]
    PassBeforeShader { line: usize },
    #[error("line {line}: pass '{name}' is declared twice")]
    DuplicatePass { line: usize, name: String },
    #[error("line {line}: unterminated quoted string")]
    UnterminatedQuote { line: usize },
}

/// Split a line into tokens, unquoting quoted ones
fn tokenize(line: &str, line_no: usize) -> Result<Vec<String>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let mut token = String::new();
        if c == '"' {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some(escaped) => token.push(escaped),
                        None => break,
                    },
                    '"' => {
                        closed = true;
                        break;
                    }
                    other => token.push(other),
                }
            }
            if !closed {
                return Err(ParseError::UnterminatedQuote { line: line_no });
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }

    Ok(tokens)
}

/// Parse a shader description.
///
/// The returned definition may have an empty name when the source contains
/// no `shader` directive; callers decide whether to commit it.
pub fn parse_shader(source: &str) -> Result<ShaderDef, ParseError> {
    let mut shader = ShaderDef::default();
    let mut seen_shader = false;
    let mut current_pass: Option<usize> = None;

    let source = source.strip_prefix('\u{feff}').unwrap_or(source);

    for (index, raw_line) in source.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let tokens = tokenize(line, line_no)?;
        let Some((directive, args)) = tokens.split_first() else {
            continue;
        };

        match directive.as_str() {
            "shader" => match args.first() {
                Some(name) => {
                    shader.name = name.clone();
                    seen_shader = true;
                }
                None => log::warn!("line {line_no}: 'shader' without a name, skipped"),
            },
            "pass" => {
                if !seen_shader {
                    return Err(ParseError::PassBeforeShader { line: line_no });
                }
                let name = args.first().cloned().unwrap_or_default();
                if shader.pass(&name).is_some() {
                    return Err(ParseError::DuplicatePass {
                        line: line_no,
                        name,
                    });
                }
                shader.passes.push(ShaderPass {
                    name,
                    ..Default::default()
                });
                current_pass = Some(shader.passes.len() - 1);
            }
            "vertex" | "fragment" | "define" => {
                let (Some(pass_index), Some(value)) = (current_pass, args.first()) else {
                    log::debug!("line {line_no}: '{directive}' outside a pass, skipped");
                    continue;
                };
                let pass = &mut shader.passes[pass_index];
                match directive.as_str() {
                    "vertex" => pass.vertex_shader = value.clone(),
                    "fragment" => pass.fragment_shader = value.clone(),
                    _ => pass.defines.push(value.clone()),
                }
            }
            "end" => current_pass = None,
            "property" => {
                if let Some((name, value)) = parse_property(args, line_no) {
                    shader.default_properties.insert(name, value);
                }
            }
            other => log::debug!("line {line_no}: unknown directive '{other}', skipped"),
        }
    }

    Ok(shader)
}

fn parse_property(args: &[String], line_no: usize) -> Option<(String, PropertyValue)> {
    let [name, kind, values @ ..] = args else {
        log::warn!("line {line_no}: 'property' needs a name and a type, skipped");
        return None;
    };

    let kind: PropertyKind = match kind.parse() {
        Ok(kind) => kind,
        Err(e) => {
            log::warn!("line {line_no}: {e}, property '{name}' skipped");
            return None;
        }
    };

    let count = kind.component_count();
    if values.len() < count {
        log::warn!(
            "line {line_no}: property '{name}' expects {count} values, found {}",
            values.len()
        );
        return None;
    }
    if values.len() > count {
        log::debug!("line {line_no}: extra values after property '{name}' ignored");
    }

    let components: Vec<&str> = values[..count].iter().map(String::as_str).collect();
    match PropertyValue::parse_components(kind, &components) {
        Some(value) => Some((name.clone(), value)),
        None => {
            log::warn!("line {line_no}: property '{name}' has malformed {kind} values, skipped");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Mat4, Vec2, Vec3, Vec4};

    const TERRAIN: &str = r#"
shader "Terrain"
pass "Forward"
  vertex "shaders/terrain_vert.spv"
  fragment "shaders/terrain_frag.spv"
  define USE_NORMAL_MAP
end
property baseColor vec4 0.4 0.6 0.3 1
property metallic float 0
property roughness float 0.9
"#;

    #[test]
    fn test_tokenize_quotes() {
        let tokens = tokenize(r#"pass "Shadow Caster"  extra"#, 1).unwrap();
        assert_eq!(tokens, vec!["pass", "Shadow Caster", "extra"]);

        let tokens = tokenize(r#"vertex "a\"b\\c""#, 1).unwrap();
        assert_eq!(tokens, vec!["vertex", "a\"b\\c"]);

        assert_eq!(
            tokenize(r#"shader "open"#, 4),
            Err(ParseError::UnterminatedQuote { line: 4 })
        );
    }

    #[test]
    fn test_parse_terrain() {
        let shader = parse_shader(TERRAIN).unwrap();
        assert_eq!(shader.name, "Terrain");
        assert_eq!(shader.passes.len(), 1);

        let pass = &shader.passes[0];
        assert_eq!(pass.name, "Forward");
        assert_eq!(pass.vertex_shader, "shaders/terrain_vert.spv");
        assert_eq!(pass.fragment_shader, "shaders/terrain_frag.spv");
        assert_eq!(pass.defines, vec!["USE_NORMAL_MAP"]);
        assert!(!pass.is_materialized());

        assert_eq!(
            shader.default_properties["baseColor"],
            PropertyValue::Vec4(Vec4::new(0.4, 0.6, 0.3, 1.0))
        );
        assert_eq!(shader.default_properties["roughness"], PropertyValue::Float(0.9));
        assert_eq!(shader.default_properties["metallic"], PropertyValue::Float(0.0));
    }

    #[test]
    fn test_crlf_comments_and_blank_lines() {
        let source = "# leading comment\r\n\r\nshader \"Water Surface\"\r\n   # indented comment\r\npass \"Forward\"\r\ndefine WAVES\r\nend\r\n";
        let shader = parse_shader(source).unwrap();
        assert_eq!(shader.name, "Water Surface");
        assert_eq!(shader.passes[0].defines, vec!["WAVES"]);
    }

    #[test]
    fn test_pass_scoped_directives_after_end_are_ignored() {
        let source = "shader \"S\"\npass \"A\"\nend\nvertex \"late.spv\"\ndefine LATE\n";
        let shader = parse_shader(source).unwrap();
        assert!(shader.passes[0].vertex_shader.is_empty());
        assert!(shader.passes[0].defines.is_empty());
    }

    #[test]
    fn test_pass_before_shader_rejects() {
        assert_eq!(
            parse_shader("pass \"Forward\"\nshader \"X\"\n"),
            Err(ParseError::PassBeforeShader { line: 1 })
        );
    }

    #[test]
    fn test_duplicate_pass_rejects() {
        let result = parse_shader("shader \"X\"\npass \"A\"\nend\npass \"A\"\n");
        assert!(matches!(result, Err(ParseError::DuplicatePass { line: 4, .. })));
    }

    #[test]
    fn test_bad_properties_are_skipped() {
        let source = "shader \"X\"\n\
                      property a double 1\n\
                      property b vec3 1 2\n\
                      property c int 1.5\n\
                      property d vec2 1 2 3\n\
                      property\n\
                      frobnicate 12\n";
        let shader = parse_shader(source).unwrap();
        assert_eq!(shader.default_properties.len(), 1);
        assert_eq!(
            shader.default_properties["d"],
            PropertyValue::Vec2(Vec2::new(1.0, 2.0))
        );
    }

    #[test]
    fn test_all_property_kinds() {
        let source = "shader \"K\"\n\
                      property f float 1.5\n\
                      property v2 vec2 1 2\n\
                      property v3 vec3 1 2 3\n\
                      property v4 vec4 1 2 3 4\n\
                      property m mat4 1 0 0 0 0 1 0 0 0 0 1 0 5 6 7 1\n\
                      property i int -3\n";
        let shader = parse_shader(source).unwrap();
        let props = &shader.default_properties;
        assert_eq!(props["f"], PropertyValue::Float(1.5));
        assert_eq!(props["v3"], PropertyValue::Vec3(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(
            props["m"],
            PropertyValue::Mat4(Mat4::from_translation(Vec3::new(5.0, 6.0, 7.0)))
        );
        assert_eq!(props["i"], PropertyValue::Int(-3));
    }

    #[test]
    fn test_missing_name_yields_empty_definition() {
        let shader = parse_shader("# nothing here\nproperty a float 1\n").unwrap();
        assert!(shader.name.is_empty());
    }

    #[test]
    fn test_round_trip() {
        let original = parse_shader(TERRAIN).unwrap();
        let reparsed = parse_shader(&original.to_source()).unwrap();
        assert_eq!(original, reparsed);
    }

    #[test]
    fn test_round_trip_keeps_quoted_tokens() {
        let source = "shader \"Q\"\n\
                      pass \"Forward\"\n\
                      define \"A B\"\n\
                      define \"C\\\"D\"\n\
                      end\n\
                      property \"tint color\" float 1\n";
        let original = parse_shader(source).unwrap();
        assert_eq!(original.passes[0].defines, vec!["A B", "C\"D"]);
        assert!(original.default_properties.contains_key("tint color"));

        let reparsed = parse_shader(&original.to_source()).unwrap();
        assert_eq!(original, reparsed);
    }
}
