//! Attribute paths address into a JSON attribute document.
//!
//! A path is a `/`-separated list of object keys, each optionally followed by `[i]` array
//! indices, e.g. `a/b[2]/c`. A backslash escapes the next character. `.` and `..` segments
//! are resolved; empty segments are ignored.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Key(String),
    Index(usize),
}

fn push_segment(tokens: &mut Vec<Token>, segment: &mut String, literal: &mut bool) {
    let s = std::mem::take(segment);
    if std::mem::replace(literal, false) {
        tokens.push(Token::Key(s));
    } else if s == ".." {
        tokens.pop();
    } else if !s.is_empty() && s != "." {
        tokens.push(Token::Key(s));
    }
}

/// Split an attribute path into tokens.
pub fn parse(path: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut segment = String::new();
    // set when the segment contains an escaped character
    let mut literal = false;
    let mut chars = path.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    segment.push(next);
                    literal = true;
                }
            }
            '/' => push_segment(&mut tokens, &mut segment, &mut literal),
            '[' => {
                let mut lookahead = chars.clone();
                let digits: String = lookahead
                    .by_ref()
                    .take_while(|c| *c != ']')
                    .collect::<String>();
                let closed = chars.as_str().len() > digits.len();
                match digits.parse::<usize>() {
                    Ok(index) if closed && digits.bytes().all(|b| b.is_ascii_digit()) => {
                        if !segment.is_empty() || literal {
                            push_segment(&mut tokens, &mut segment, &mut literal);
                        }
                        tokens.push(Token::Index(index));
                        chars = lookahead;
                    }
                    _ => segment.push(c),
                }
            }
            _ => segment.push(c),
        }
    }
    push_segment(&mut tokens, &mut segment, &mut literal);
    tokens
}

/// Whether `key` needs to be resolved as a path rather than used as a plain attribute name.
pub fn is_path(key: &str) -> bool {
    if key.contains('\\') {
        return true;
    }
    let tokens = parse(key);
    tokens.len() > 1 || tokens.iter().any(|t| matches!(t, Token::Index(_)))
}

/// Look up the value at `tokens` below `root`.
pub fn get<'a>(root: &'a Value, tokens: &[Token]) -> Option<&'a Value> {
    tokens.iter().try_fold(root, |value, token| match token {
        Token::Key(k) => value.as_object()?.get(k),
        Token::Index(i) => value.as_array()?.get(*i),
    })
}

/// Store `value` at `tokens` below `root`, creating objects and arrays as needed.
///
/// Intermediate values of the wrong kind are replaced; arrays are padded with nulls.
pub fn insert(root: &mut Value, tokens: &[Token], value: Value) {
    let Some((first, rest)) = tokens.split_first() else {
        *root = value;
        return;
    };
    match first {
        Token::Key(k) => {
            if let Value::Object(map) = root {
                insert(map.entry(k.clone()).or_insert(Value::Null), rest, value);
                return;
            }
            let mut child = Value::Null;
            insert(&mut child, rest, value);
            let mut map = Map::new();
            map.insert(k.clone(), child);
            *root = Value::Object(map);
        }
        Token::Index(i) => {
            if let Value::Array(values) = root {
                if values.len() <= *i {
                    values.resize(*i + 1, Value::Null);
                }
                insert(&mut values[*i], rest, value);
                return;
            }
            let mut values = vec![Value::Null; *i + 1];
            insert(&mut values[*i], rest, value);
            *root = Value::Array(values);
        }
    }
}

/// Remove and return the value at `tokens` below `root`.
pub fn remove(root: &mut Value, tokens: &[Token]) -> Option<Value> {
    let (last, parents) = tokens.split_last()?;
    let parent = parents.iter().try_fold(root, |value, token| match token {
        Token::Key(k) => value.as_object_mut()?.get_mut(k),
        Token::Index(i) => value.as_array_mut()?.get_mut(*i),
    })?;
    match last {
        Token::Key(k) => parent.as_object_mut()?.remove(k),
        Token::Index(i) => {
            let values = parent.as_array_mut()?;
            (*i < values.len()).then(|| values.remove(*i))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn key(k: &str) -> Token {
        Token::Key(k.to_string())
    }

    #[test]
    fn parse_paths() {
        assert_eq!(parse("a"), vec![key("a")]);
        assert_eq!(parse("/a//b/"), vec![key("a"), key("b")]);
        assert_eq!(
            parse("a/b[2][0]/c"),
            vec![key("a"), key("b"), Token::Index(2), Token::Index(0), key("c")]
        );
        assert_eq!(parse("[3]"), vec![Token::Index(3)]);
        assert_eq!(parse("a/./b/../c"), vec![key("a"), key("c")]);
        assert!(parse("").is_empty());
        assert!(parse("/").is_empty());
    }

    #[test]
    fn parse_escapes() {
        assert_eq!(parse(r"a\/b"), vec![key("a/b")]);
        assert_eq!(parse(r"a\[0]"), vec![key("a[0]")]);
        assert_eq!(parse(r"\.."), vec![key("..")]);
        // not an index
        assert_eq!(parse("a[x]"), vec![key("a[x]")]);
        assert_eq!(parse("a[1"), vec![key("a[1")]);
    }

    #[test]
    fn path_detection() {
        assert!(!is_path("name"));
        assert!(!is_path("/name"));
        assert!(is_path("a/b"));
        assert!(is_path("a[0]"));
        assert!(is_path(r"a\b"));
    }

    #[test]
    fn insert_and_get() {
        let mut root = Value::Null;
        insert(&mut root, &parse("a/b[1]"), json!(5));
        assert_eq!(root, json!({"a": {"b": [null, 5]}}));
        insert(&mut root, &parse("a/c"), json!("x"));
        assert_eq!(get(&root, &parse("a/c")), Some(&json!("x")));
        assert_eq!(get(&root, &parse("a/b[1]")), Some(&json!(5)));
        assert_eq!(get(&root, &parse("a/b[7]")), None);
        assert_eq!(get(&root, &[]), Some(&root));

        // a scalar in the way is replaced
        insert(&mut root, &parse("a/c/d"), json!(true));
        assert_eq!(root["a"]["c"], json!({"d": true}));
    }

    #[test]
    fn remove_values() {
        let mut root = json!({"a": {"b": [1, 2, 3]}, "c": 4});
        assert_eq!(remove(&mut root, &parse("a/b[1]")), Some(json!(2)));
        assert_eq!(remove(&mut root, &parse("c")), Some(json!(4)));
        assert_eq!(remove(&mut root, &parse("missing/x")), None);
        assert_eq!(remove(&mut root, &[]), None);
        assert_eq!(root, json!({"a": {"b": [1, 3]}}));
    }
}
