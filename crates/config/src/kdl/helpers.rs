//! KDL parsing helper functions.
//!
//! Common utilities for extracting values from KDL nodes.

use anyhow::{anyhow, Result};

/// Convert a byte offset to line and column numbers (1-indexed)
pub fn offset_to_line_col(content: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in content.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// Helper to get a string entry from a KDL node
pub fn get_string_entry(node: &kdl::KdlNode, name: &str) -> Option<String> {
    node.children()
        .and_then(|children| children.get(name))
        .and_then(|n| n.entries().first())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

/// Helper to get an integer entry from a KDL node
pub fn get_int_entry(node: &kdl::KdlNode, name: &str) -> Option<i128> {
    node.children()
        .and_then(|children| children.get(name))
        .and_then(|n| n.entries().first())
        .and_then(|e| e.value().as_integer())
}

/// Helper to get a boolean entry from a KDL node
pub fn get_bool_entry(node: &kdl::KdlNode, name: &str) -> Option<bool> {
    node.children()
        .and_then(|children| children.get(name))
        .and_then(|n| n.entries().first())
        .and_then(|e| e.value().as_bool())
}

/// Helper to get the first argument of a node as a string
pub fn get_first_arg_string(node: &kdl::KdlNode) -> Option<String> {
    node.entries()
        .first()
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

/// All positional string arguments of a child node, e.g. a command line
pub fn get_string_args(node: &kdl::KdlNode, name: &str) -> Option<Vec<String>> {
    node.children().and_then(|children| children.get(name)).map(|n| {
        n.entries()
            .iter()
            .filter(|e| e.name().is_none())
            .filter_map(|e| e.value().as_string().map(|s| s.to_string()))
            .collect()
    })
}

/// All positional integer arguments of a child node
pub fn get_int_args(node: &kdl::KdlNode, name: &str) -> Result<Option<Vec<u16>>> {
    let Some(child) = node.children().and_then(|children| children.get(name)) else {
        return Ok(None);
    };

    child
        .entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| {
            let value = e
                .value()
                .as_integer()
                .ok_or_else(|| anyhow!("'{}' expects integer arguments", name))?;
            u16::try_from(value).map_err(|_| anyhow!("'{}' value {} is out of range", name, value))
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

/// Integer entry converted to an unsigned field type
pub fn get_unsigned_entry<T: TryFrom<i128>>(node: &kdl::KdlNode, name: &str) -> Result<Option<T>> {
    match get_int_entry(node, name) {
        Some(value) => T::try_from(value)
            .map(Some)
            .map_err(|_| anyhow!("'{}' value {} is out of range", name, value)),
        None => Ok(None),
    }
}
