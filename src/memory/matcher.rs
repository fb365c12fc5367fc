//! Evaluates RFC 4515 string filters against in-memory entries.
//!
//! Comparisons are ASCII case-insensitive for every attribute, which is
//! what most directory schemas use for the attributes that show up in
//! filters. Extensible matches are not supported.

use std::cmp::Ordering;

use crate::directory::DirectoryEntry;


#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equal(String, Vec<u8>),
    Approx(String, Vec<u8>),
    GreaterOrEqual(String, Vec<u8>),
    LessOrEqual(String, Vec<u8>),
    Present(String),
    Substring {
        attribute: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        last: Option<Vec<u8>>,
    },
}
impl Filter {
    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        let owned;
        let text = if text.starts_with('(') {
            text
        } else {
            owned = format!("({})", text);
            owned.as_str()
        };

        let bytes = text.as_bytes();
        let mut pos = 0;
        let filter = parse_filter(bytes, &mut pos)?;
        if pos != bytes.len() {
            return Err(format!("trailing data at offset {}", pos));
        }
        Ok(filter)
    }

    pub fn matches(&self, entry: &DirectoryEntry) -> bool {
        match self {
            Self::And(parts) => parts.iter().all(|p| p.matches(entry)),
            Self::Or(parts) => parts.iter().any(|p| p.matches(entry)),
            Self::Not(inner) => !inner.matches(entry),
            Self::Present(attribute) => {
                attribute.eq_ignore_ascii_case("objectClass") || values(entry, attribute).len() > 0
            },
            Self::Equal(attribute, wanted)|Self::Approx(attribute, wanted) => values(entry, attribute)
                .iter()
                .any(|v| compare(v, wanted) == Ordering::Equal),
            Self::GreaterOrEqual(attribute, bound) => values(entry, attribute)
                .iter()
                .any(|v| compare(v, bound) != Ordering::Less),
            Self::LessOrEqual(attribute, bound) => values(entry, attribute)
                .iter()
                .any(|v| compare(v, bound) != Ordering::Greater),
            Self::Substring { attribute, initial, any, last } => values(entry, attribute)
                .iter()
                .any(|v| substring_matches(v, initial.as_deref(), any, last.as_deref())),
        }
    }
}

fn values<'e>(entry: &'e DirectoryEntry, attribute: &str) -> &'e [Vec<u8>] {
    entry.get(attribute).unwrap_or(&[])
}

fn compare(left: &[u8], right: &[u8]) -> Ordering {
    let left = left.iter().map(|b| b.to_ascii_lowercase());
    let right = right.iter().map(|b| b.to_ascii_lowercase());
    left.cmp(right)
}

fn substring_matches(value: &[u8], initial: Option<&[u8]>, any: &[Vec<u8>], last: Option<&[u8]>) -> bool {
    let value = value.to_ascii_lowercase();
    let mut rest: &[u8] = &value;

    if let Some(initial) = initial {
        let initial = initial.to_ascii_lowercase();
        if !rest.starts_with(&initial) {
            return false;
        }
        rest = &rest[initial.len()..];
    }

    let last = last.map(|l| l.to_ascii_lowercase());
    if let Some(last) = &last {
        if rest.len() < last.len() || !rest.ends_with(last) {
            return false;
        }
        rest = &rest[..rest.len()-last.len()];
    }

    for piece in any {
        let piece = piece.to_ascii_lowercase();
        match find_bytes(rest, &piece) {
            Some(index) => rest = &rest[index+piece.len()..],
            None => return false,
        }
    }
    true
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}


fn expect(bytes: &[u8], pos: &mut usize, wanted: u8) -> Result<(), String> {
    if bytes.get(*pos) != Some(&wanted) {
        return Err(format!("expected {:?} at offset {}", wanted as char, *pos));
    }
    *pos += 1;
    Ok(())
}

fn parse_filter(bytes: &[u8], pos: &mut usize) -> Result<Filter, String> {
    expect(bytes, pos, b'(')?;
    let filter = match bytes.get(*pos) {
        Some(b'&') => {
            *pos += 1;
            Filter::And(parse_list(bytes, pos)?)
        },
        Some(b'|') => {
            *pos += 1;
            Filter::Or(parse_list(bytes, pos)?)
        },
        Some(b'!') => {
            *pos += 1;
            Filter::Not(Box::new(parse_filter(bytes, pos)?))
        },
        Some(_) => parse_item(bytes, pos)?,
        None => return Err("unexpected end of filter".to_owned()),
    };
    expect(bytes, pos, b')')?;
    Ok(filter)
}

fn parse_list(bytes: &[u8], pos: &mut usize) -> Result<Vec<Filter>, String> {
    let mut parts = Vec::new();
    while bytes.get(*pos) == Some(&b'(') {
        parts.push(parse_filter(bytes, pos)?);
    }
    Ok(parts)
}

fn parse_item(bytes: &[u8], pos: &mut usize) -> Result<Filter, String> {
    let start = *pos;
    let end = bytes[start..].iter()
        .position(|b| *b == b')')
        .map(|i| start + i)
        .ok_or_else(|| "unterminated comparison".to_owned())?;
    *pos = end;
    let item = &bytes[start..end];

    let op_index = item.iter()
        .position(|b| matches!(*b, b'=' | b'~' | b'<' | b'>' | b':'))
        .ok_or_else(|| "comparison without operator".to_owned())?;
    let attribute = std::str::from_utf8(&item[..op_index])
        .map_err(|_| "attribute name is not UTF-8".to_owned())?
        .trim()
        .to_owned();
    if attribute.is_empty() {
        return Err("empty attribute name".to_owned());
    }

    let (operator, raw_value) = match item[op_index] {
        b'=' => ("=", &item[op_index+1..]),
        b':' => return Err("extensible match is not supported".to_owned()),
        other => {
            if item.get(op_index + 1) != Some(&b'=') {
                return Err(format!("unknown operator {:?}", other as char));
            }
            match other {
                b'~' => ("~=", &item[op_index+2..]),
                b'<' => ("<=", &item[op_index+2..]),
                _ => (">=", &item[op_index+2..]),
            }
        },
    };

    let filter = match operator {
        "~=" => Filter::Approx(attribute, unescape(raw_value)?),
        "<=" => Filter::LessOrEqual(attribute, unescape(raw_value)?),
        ">=" => Filter::GreaterOrEqual(attribute, unescape(raw_value)?),
        _ => {
            if raw_value == b"*" {
                Filter::Present(attribute)
            } else if raw_value.contains(&b'*') {
                let pieces: Vec<&[u8]> = raw_value.split(|b| *b == b'*').collect();
                let initial = pieces[0];
                let last = pieces[pieces.len()-1];
                let mut any = Vec::new();
                for piece in &pieces[1..pieces.len()-1] {
                    if piece.len() > 0 {
                        any.push(unescape(piece)?);
                    }
                }
                Filter::Substring {
                    attribute,
                    initial: if initial.is_empty() { None } else { Some(unescape(initial)?) },
                    any,
                    last: if last.is_empty() { None } else { Some(unescape(last)?) },
                }
            } else {
                Filter::Equal(attribute, unescape(raw_value)?)
            }
        },
    };
    Ok(filter)
}

/// Resolves `\XX` escapes in an assertion value.
fn unescape(raw: &[u8]) -> Result<Vec<u8>, String> {
    let mut value = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' {
            let hex = raw.get(i+1..i+3)
                .ok_or_else(|| "truncated escape".to_owned())?;
            let hex = std::str::from_utf8(hex)
                .map_err(|_| "invalid escape".to_owned())?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| format!("invalid escape \\{}", hex))?;
            value.push(byte);
            i += 3;
        } else {
            value.push(raw[i]);
            i += 1;
        }
    }
    Ok(value)
}


#[cfg(test)]
mod tests {
    use super::Filter;
    use crate::directory::DirectoryEntry;
    use crate::filter::{add_range_constraint, escape};

    fn person(uid: &str, cn: &str) -> DirectoryEntry {
        DirectoryEntry::new(format!("uid={},ou=people,dc=example,dc=com", uid))
            .with_value("objectClass", "person")
            .with_value("uid", uid)
            .with_value("cn", cn)
    }

    #[test]
    fn test_parse_shapes() {
        assert_eq!(Filter::parse("(uid=jdoe)").unwrap(), Filter::Equal("uid".to_owned(), b"jdoe".to_vec()));
        assert_eq!(Filter::parse("uid=*").unwrap(), Filter::Present("uid".to_owned()));
        assert_eq!(
            Filter::parse("(cn=a\\2a*b*c)").unwrap(),
            Filter::Substring {
                attribute: "cn".to_owned(),
                initial: Some(b"a*".to_vec()),
                any: vec![b"b".to_vec()],
                last: Some(b"c".to_vec()),
            },
        );
        assert!(Filter::parse("(&(uid=a)").is_err());
        assert!(Filter::parse("(uid:dn:=a)").is_err());
        assert!(Filter::parse("(uid=a)(cn=b)").is_err());
    }

    #[test]
    fn test_matching() {
        let entry = person("jdoe", "John Doe");
        assert!(Filter::parse("(&(objectClass=PERSON)(uid=jdoe))").unwrap().matches(&entry));
        assert!(Filter::parse("(|(uid=nobody)(cn=john*))").unwrap().matches(&entry));
        assert!(Filter::parse("(!(mail=*))").unwrap().matches(&entry));
        assert!(Filter::parse("(cn=*n D*)").unwrap().matches(&entry));
        assert!(!Filter::parse("(cn=*xyz*)").unwrap().matches(&entry));
        assert!(Filter::parse("(uid>=jd)").unwrap().matches(&entry));
        assert!(!Filter::parse("(uid<=jd)").unwrap().matches(&entry));
        assert!(Filter::parse(&format!("(cn={})", escape("John Doe"))).unwrap().matches(&entry));
    }

    #[test]
    fn test_range_constraints_narrow() {
        let people: Vec<DirectoryEntry> = ["a", "b", "c", "d", "e"].iter()
            .map(|uid| person(uid, uid))
            .collect();
        let count = |filter: &str| {
            let parsed = Filter::parse(filter).unwrap();
            people.iter().filter(|p| parsed.matches(p)).count()
        };

        let mut previous = count("(objectClass=person)");
        for boundary in ["a", "b", "c", "d", "e"] {
            let inclusive = count(&add_range_constraint("(objectClass=person)", "uid", boundary, false));
            let strict = count(&add_range_constraint("(objectClass=person)", "uid", boundary, true));
            assert!(inclusive <= previous);
            assert_eq!(strict, inclusive - 1);
            previous = inclusive;
        }
        assert_eq!(previous, 1);
    }
}
