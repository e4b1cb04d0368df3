use crate::errors::{Error, ErrorKind, Result};

/// One step of a `/`-separated element path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PathComponent<'a> {
    /// A structure child, addressed by element name.
    Name(&'a str),
    /// A vector child, addressed by position.
    Index(usize),
}

/// Element names start with a letter or underscore and continue with
/// letters, digits, or underscores.
#[must_use]
pub(crate) fn is_valid_element_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Splits a path into components, accepting an optional leading `/`.
///
/// # Errors
/// Returns `BadPathName` on empty paths, empty components, or components
/// that are neither identifiers nor decimal indices.
pub(crate) fn parse_path(path: &str) -> Result<(bool, Vec<PathComponent<'_>>)> {
    let (absolute, rest) = match path.strip_prefix('/') {
        Some(rest) => (true, rest),
        None => (false, path),
    };
    if rest.is_empty() {
        if absolute {
            // "/" names the root itself.
            return Ok((true, Vec::new()));
        }
        return Err(Error::new(ErrorKind::BadPathName, "empty path"));
    }
    let mut components = Vec::new();
    for piece in rest.split('/') {
        if piece.is_empty() {
            return Err(Error::new(
                ErrorKind::BadPathName,
                format!("empty component in path {path:?}"),
            ));
        }
        if piece.bytes().all(|b| b.is_ascii_digit()) {
            let index: usize = piece.parse().map_err(|_| {
                Error::new(ErrorKind::BadPathName, format!("index too large in path {path:?}"))
            })?;
            components.push(PathComponent::Index(index));
        } else if is_valid_element_name(piece) {
            components.push(PathComponent::Name(piece));
        } else {
            return Err(Error::new(
                ErrorKind::BadPathName,
                format!("invalid element name {piece:?} in path {path:?}"),
            ));
        }
    }
    Ok((absolute, components))
}

/// Canonical relative form used when comparing buffer paths against
/// prototype field paths.
#[must_use]
pub(crate) fn normalize(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}
