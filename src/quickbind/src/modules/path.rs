//! The `path` builtin namespace. Pure string manipulation over
//! forward-slash paths; backslashes normalise away so compiled module ids
//! behave the same on every platform.

use quickbind_reflect::{describe, wrap1, wrap2, Registry};

pub fn is_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    if bytes.is_empty() {
        return false;
    }
    if bytes[0] == b'/' || bytes[0] == b'\\' {
        return true;
    }
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}

pub fn normalize(path: &str) -> String {
    if path.is_empty() {
        return String::from(".");
    }
    let cleaned = path.replace('\\', "/");
    let absolute = is_absolute(path);

    let mut segments: Vec<&str> = Vec::new();
    for segment in cleaned.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|s| *s != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return String::from(if absolute { "/" } else { "." });
    }

    let mut out = String::new();
    if absolute && cleaned.starts_with('/') {
        out.push('/');
    } else if !absolute && !cleaned.starts_with('.') {
        out.push_str("./");
    }
    out.push_str(&segments.join("/"));
    out
}

pub fn dirname(path: &str) -> String {
    let normalized = normalize(path);
    match normalized.rfind('/') {
        None => String::from("."),
        Some(0) => String::from("/"),
        Some(pos) => normalized[..pos].to_string(),
    }
}

pub fn basename(path: &str) -> String {
    let normalized = normalize(path);
    match normalized.rfind('/') {
        None => normalized,
        Some(pos) => normalized[pos + 1..].to_string(),
    }
}

pub fn extname(path: &str) -> String {
    let name = basename(path);
    match name.rfind('.') {
        None | Some(0) => String::new(),
        Some(pos) => name[pos..].to_string(),
    }
}

pub fn join(a: &str, b: &str) -> String {
    if b.is_empty() {
        return normalize(a);
    }
    if is_absolute(b) {
        return normalize(b);
    }
    normalize(&format!("{a}/{b}"))
}

pub fn register(registry: &Registry) {
    let string = registry.string_type();
    let boolean = registry.bool_type();
    let ns = registry.namespace("path");

    let f = ns.function(
        "isAbsolute",
        boolean,
        &[("path", string.clone())],
        wrap1(|path: &String| is_absolute(path)),
    );
    describe(&f)
        .desc("Checks if a path is an absolute path")
        .param(0, "path", "The path to check")
        .returns("True if the path is absolute");

    let f = ns.function(
        "normalize",
        string.clone(),
        &[("path", string.clone())],
        wrap1(|path: &String| normalize(path)),
    );
    describe(&f)
        .desc("Normalizes a path")
        .param(0, "path", "The path to normalize")
        .returns("The normalized path");

    let f = ns.function(
        "dirname",
        string.clone(),
        &[("path", string.clone())],
        wrap1(|path: &String| dirname(path)),
    );
    describe(&f)
        .desc("Gets the directory name of a path")
        .param(0, "path", "The path to inspect")
        .returns("The directory portion of the path");

    let f = ns.function(
        "basename",
        string.clone(),
        &[("path", string.clone())],
        wrap1(|path: &String| basename(path)),
    );
    describe(&f)
        .desc("Gets the final segment of a path")
        .param(0, "path", "The path to inspect")
        .returns("The file name portion of the path");

    let f = ns.function(
        "extname",
        string.clone(),
        &[("path", string.clone())],
        wrap1(|path: &String| extname(path)),
    );
    describe(&f)
        .desc("Gets the extension of a path, dot included")
        .param(0, "path", "The path to inspect")
        .returns("The extension, or an empty string");

    let f = ns.function(
        "join",
        string.clone(),
        &[("base", string.clone()), ("tail", string)],
        wrap2(|a: &String, b: &String| join(a, b)),
    );
    describe(&f)
        .desc("Joins two path segments and normalizes the result")
        .param(0, "base", "The leading segment")
        .param(1, "tail", "The trailing segment")
        .returns("The joined path");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_segments() {
        assert_eq!(normalize("a//b/./c"), "./a/b/c");
        assert_eq!(normalize("a/b/../c"), "./a/c");
        assert_eq!(normalize("/a/../b"), "/b");
        assert_eq!(normalize("../x"), "../x");
        assert_eq!(normalize(""), ".");
    }

    #[test]
    fn dirname_and_basename_split() {
        assert_eq!(dirname("./a/b/c.ts"), "./a/b");
        assert_eq!(basename("./a/b/c.ts"), "c.ts");
        assert_eq!(extname("./a/b/c.ts"), ".ts");
        assert_eq!(extname("./a/b/noext"), "");
    }

    #[test]
    fn join_respects_absolute_tails() {
        assert_eq!(join("a", "b"), "./a/b");
        assert_eq!(join("a", "/b"), "/b");
    }
}
