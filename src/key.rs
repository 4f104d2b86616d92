//! Cache key formatting
//!
//! Keys are built from a template and positional arguments, printf style:
//! `format_key("user:%d:profile", &[&42])` gives `user:42:profile`.

use std::fmt::{Display, Write};

/// Substitute `args` into `tag` positionally.
///
/// `%s`, `%d` and `%v` (and `{}`) each consume the next argument, `%%` is a
/// literal percent sign. A placeholder with no argument left is kept as
/// written and surplus arguments are ignored.
pub fn format_key(tag: &str, args: &[&dyn Display]) -> String {
    if args.is_empty() {
        return tag.to_owned();
    }

    let mut key = String::with_capacity(tag.len() + args.len() * 8);
    let mut args = args.iter();
    let mut chars = tag.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, chars.peek().copied()) {
            ('%', Some('%')) => {
                chars.next();
                key.push('%');
            }
            ('%', Some(verb @ ('s' | 'd' | 'v'))) => {
                chars.next();
                match args.next() {
                    Some(arg) => {
                        let _ = write!(key, "{arg}");
                    }
                    None => {
                        key.push('%');
                        key.push(verb);
                    }
                }
            }
            ('{', Some('}')) => {
                chars.next();
                match args.next() {
                    Some(arg) => {
                        let _ = write!(key, "{arg}");
                    }
                    None => key.push_str("{}"),
                }
            }
            (c, _) => key.push(c),
        }
    }

    key
}
