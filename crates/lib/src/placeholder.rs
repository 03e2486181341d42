//! Placeholder parsing and substitution for build-time argument values.
//!
//! Build arguments may reference values that aren't known until a run is
//! underway, most importantly the tag another artifact in the same run
//! resolves to. Values are split into literal and placeholder segments,
//! then each placeholder is replaced through a [`Resolver`].
//!
//! # Placeholder Formats
//!
//! - `$${artifact:<name>}` - the resolved tag of another artifact
//! - `$${env:<VAR>}` - a variable from the build's environment snapshot
//!
//! # Shell Variables
//!
//! Single `$` characters pass through unchanged, so values like `$HOME` are
//! handed to the backend as-is.
//!
//! # Escaping
//!
//! Use `$$$` before `{` to produce a literal `$${` sequence.
//!
//! # Example
//!
//! ```
//! use dockyard_lib::placeholder::{parse, Segment, Placeholder};
//!
//! let segments = parse("$${artifact:base}-slim").unwrap();
//! assert_eq!(segments, vec![
//!     Segment::Placeholder(Placeholder::Artifact("base".to_string())),
//!     Segment::Literal("-slim".to_string()),
//! ]);
//! ```

use thiserror::Error;

/// One `$${kind:name}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
  /// `$${artifact:<name>}` - resolved tag of another artifact
  Artifact(String),

  /// `$${env:<VAR>}` - environment variable
  Env(String),
}

/// Piece of a build-arg value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  /// Text copied through unchanged
  Literal(String),

  /// Reference replaced at substitution time
  Placeholder(Placeholder),
}

/// Errors from parsing a value or resolving one of its references.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
  #[error("unclosed placeholder at position {0}")]
  Unclosed(usize),

  #[error("unknown placeholder type: {0}")]
  UnknownType(String),

  #[error("malformed placeholder: {0}")]
  Malformed(String),

  #[error("unresolved artifact: {0}")]
  UnresolvedArtifact(String),
}

/// Trait for resolving placeholder values during build-arg evaluation.
pub trait Resolver {
  /// Resolve the tag of another artifact by name.
  fn resolve_artifact(&self, name: &str) -> Result<String, PlaceholderError>;

  /// Resolve an environment variable.
  fn resolve_env(&self, var: &str) -> Result<String, PlaceholderError>;
}

/// Split `input` into literal and placeholder segments.
///
/// # Errors
///
/// Fails on an unclosed `$${`, an unknown kind, or a reference missing its
/// `kind:` prefix or name.
pub fn parse(input: &str) -> Result<Vec<Segment>, PlaceholderError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut chars = input.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    if ch != '$' {
      literal.push(ch);
      continue;
    }

    match chars.peek() {
      Some((_, '$')) => {
        chars.next();

        match chars.peek() {
          Some((_, '$')) => {
            chars.next();

            if let Some((_, '{')) = chars.peek() {
              // $$${ -> literal $${
              literal.push_str("$${");
              chars.next();
            } else {
              literal.push_str("$$$");
            }
          }
          Some((_, '{')) => {
            chars.next();

            if !literal.is_empty() {
              segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }

            let mut content = String::new();
            let mut found_close = false;

            for (_, c) in chars.by_ref() {
              if c == '}' {
                found_close = true;
                break;
              }
              content.push(c);
            }

            if !found_close {
              return Err(PlaceholderError::Unclosed(pos));
            }

            segments.push(Segment::Placeholder(parse_placeholder_content(&content)?));
          }
          _ => literal.push_str("$$"),
        }
      }
      // A lone $ is literal
      _ => literal.push('$'),
    }
  }

  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }

  Ok(segments)
}

/// Parse the content inside a placeholder (everything between `{` and `}`).
fn parse_placeholder_content(content: &str) -> Result<Placeholder, PlaceholderError> {
  let (kind, rest) = content
    .split_once(':')
    .ok_or_else(|| PlaceholderError::Malformed(format!("missing colon in '{content}'")))?;

  // Image names may themselves contain ':' (registry ports), so the rest is
  // taken verbatim.
  if rest.is_empty() {
    return Err(PlaceholderError::Malformed(format!("empty reference in '{content}'")));
  }

  match kind {
    "artifact" => Ok(Placeholder::Artifact(rest.to_string())),
    "env" => Ok(Placeholder::Env(rest.to_string())),
    _ => Err(PlaceholderError::UnknownType(kind.to_string())),
  }
}

/// Substitute all placeholders in a string using the provided resolver.
///
/// # Errors
///
/// Returns an error if parsing fails or if any placeholder cannot be resolved.
pub fn substitute(input: &str, resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let segments = parse(input)?;
  substitute_segments(&segments, resolver)
}

/// Substitute placeholders in pre-parsed segments.
pub fn substitute_segments(segments: &[Segment], resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let mut result = String::new();

  for segment in segments {
    match segment {
      Segment::Literal(s) => result.push_str(s),
      Segment::Placeholder(Placeholder::Artifact(name)) => result.push_str(&resolver.resolve_artifact(name)?),
      Segment::Placeholder(Placeholder::Env(var)) => result.push_str(&resolver.resolve_env(var)?),
    }
  }

  Ok(result)
}

/// Collect the artifact names referenced by a string, in order of appearance.
pub fn artifact_references(input: &str) -> Result<Vec<String>, PlaceholderError> {
  Ok(
    parse(input)?
      .into_iter()
      .filter_map(|segment| match segment {
        Segment::Placeholder(Placeholder::Artifact(name)) => Some(name),
        _ => None,
      })
      .collect(),
  )
}
