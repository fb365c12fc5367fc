use crate::request::SearchScope;


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Rdn {
    pub key: String,
    pub value: Vec<u8>,
}
impl Rdn {
    pub fn new(key: String, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
        }
    }

    /// Case-folded copy for comparisons; surrounding spaces are dropped.
    fn normalized(&self) -> Self {
        let key = self.key.trim().to_ascii_lowercase();
        let value = trim_spaces(&self.value).to_ascii_lowercase();
        Self::new(key, value)
    }
}

fn trim_spaces(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != b' ').unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| *b != b' ').map(|i| i + 1).unwrap_or(start);
    &bytes[start..end]
}


/// Splits a DN into its RDNs, leaf first (RFC 4514).
///
/// Multi-valued RDNs (`+`) are kept as one opaque value.
pub fn dn_to_rdns(dn: &str) -> Option<Vec<Rdn>> {
    if dn.trim().len() == 0 {
        return Some(Vec::with_capacity(0));
    }

    let tokens = tokenize(dn)?;

    let pieces = split_at_unescaped_commas(&tokens);
    let mut rdns = Vec::with_capacity(pieces.len());
    for piece in pieces {
        let (key_tokens, value_tokens) = split_at_first_unescaped_equals(&piece)?;
        let key_bytes = tokens_to_bytes(&key_tokens);
        let rear_bytes = tokens_to_bytes(&value_tokens);

        let key_string = String::from_utf8(key_bytes).ok()?;
        rdns.push(Rdn::new(key_string, rear_bytes));
    }

    Some(rdns)
}

/// Normalized RDN sequence used to compare DNs.
pub fn dn_key(dn: &str) -> Option<Vec<Rdn>> {
    let rdns = dn_to_rdns(dn)?;
    Some(rdns.iter().map(|rdn| rdn.normalized()).collect())
}

/// Whether an entry with normalized RDNs `entry` lies within `scope` of the
/// base with normalized RDNs `base`.
pub fn in_scope(entry: &[Rdn], base: &[Rdn], scope: SearchScope) -> bool {
    if entry.len() < base.len() || !entry.ends_with(base) {
        return false;
    }
    match scope {
        SearchScope::Base => entry.len() == base.len(),
        SearchScope::OneLevel => entry.len() == base.len() + 1,
        SearchScope::Subtree => true,
    }
}

#[derive(Clone, Copy, Debug, Hash, Eq, Ord, PartialEq, PartialOrd)]
enum Token<'a> {
    UnescapedSlice(&'a str),
    EscapedByte(u8),
}

/// Tokenizes the given DN string.
///
/// Used to abstract away escapes.
fn tokenize(dn: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();

    let mut current_start = 0;
    loop {
        let next_backslash = match find_from(dn, '\\', current_start) {
            Some(nb) => nb,
            None => {
                let rest_slice = &dn[current_start..];
                if rest_slice.len() > 0 {
                    tokens.push(Token::UnescapedSlice(rest_slice));
                }
                break;
            },
        };

        // eat the part until the backslash
        let eaten = &dn[current_start..next_backslash];
        tokens.push(Token::UnescapedSlice(eaten));

        // what follows the backslash?
        match dn[next_backslash+1..].chars().nth(0) {
            None => {
                // backslash at the end is invalid
                return None;
            },
            Some(c) => {
                if [' ', '"', '#', '+', ',', ';', '<', '=', '>', '\\'].binary_search(&c).is_ok() {
                    tokens.push(Token::EscapedByte(c as u8));

                    // continue after that escaped character
                    current_start = next_backslash + 2;
                } else if c.is_ascii_hexdigit() {
                    // okay, do we have another hex digit?
                    let c2 = dn[next_backslash+2..].chars().nth(0)?;
                    if !c2.is_ascii_hexdigit() {
                        // a string like "\A%"
                        return None;
                    }
                    let hex_slice = &dn[next_backslash+1..next_backslash+3];
                    let hex_value = u8::from_str_radix(hex_slice, 16).ok()?;
                    tokens.push(Token::EscapedByte(hex_value));

                    // continue after the second hex digit
                    current_start = next_backslash + 3;
                } else {
                    // not a valid escape
                    return None;
                }
            },
        }
    }

    Some(tokens)
}


fn find_from(haystack: &str, needle: char, offset: usize) -> Option<usize> {
    haystack[offset..]
        .find(needle)
        .map(|i| i + offset)
}

fn split_at_unescaped_commas<'a>(tokens: &[Token<'a>]) -> Vec<Vec<Token<'a>>> {
    let mut pieces = Vec::new();
    let mut current_piece = Vec::new();
    for token in tokens {
        match token {
            Token::EscapedByte(_) => {
                current_piece.push(*token);
            },
            Token::UnescapedSlice(s) => {
                let mut rest: &str = s;
                while let Some(comma_index) = rest.find(',') {
                    let before = &rest[..comma_index];
                    if before.len() > 0 {
                        current_piece.push(Token::UnescapedSlice(before));
                    }
                    let push_me = std::mem::replace(&mut current_piece, Vec::new());
                    pieces.push(push_me);
                    rest = &rest[comma_index+1..];
                }
                if rest.len() > 0 {
                    current_piece.push(Token::UnescapedSlice(rest));
                }
            },
        }
    }
    if current_piece.len() > 0 {
        pieces.push(current_piece);
    }
    pieces
}

fn split_at_first_unescaped_equals<'a>(tokens: &[Token<'a>]) -> Option<(Vec<Token<'a>>, Vec<Token<'a>>)> {
    let mut front_pieces = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        match token {
            Token::EscapedByte(_) => {
                front_pieces.push(*token);
            },
            Token::UnescapedSlice(s) => {
                match s.find('=') {
                    None => {
                        front_pieces.push(*token);
                    },
                    Some(equals_index) => {
                        let before = &s[..equals_index];
                        let after = &s[equals_index+1..];

                        if before.len() > 0 {
                            front_pieces.push(Token::UnescapedSlice(before));
                        }

                        // handle the rest
                        let mut rear_pieces = Vec::new();
                        if after.len() > 0 {
                            rear_pieces.push(Token::UnescapedSlice(after));
                        }
                        for rest_piece in tokens.iter().skip(i + 1) {
                            rear_pieces.push(*rest_piece);
                        }

                        return Some((front_pieces, rear_pieces));
                    },
                }
            },
        }
    }

    // no unescaped equals found
    None
}

fn tokens_to_bytes(tokens: &[Token]) -> Vec<u8> {
    let mut ret = Vec::new();
    for token in tokens {
        match token {
            Token::EscapedByte(b) => ret.push(*b),
            Token::UnescapedSlice(slice) => ret.extend_from_slice(slice.as_bytes()),
        }
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::{dn_key, dn_to_rdns, in_scope};
    use crate::request::SearchScope;

    #[test]
    fn test_dn_to_rdns() {
        let rdns = dn_to_rdns("").unwrap();
        assert_eq!(rdns.len(), 0);

        let rdns = dn_to_rdns("C=QQ").unwrap();
        assert_eq!(rdns.len(), 1);
        assert_eq!(rdns[0].key, "C");
        assert_eq!(rdns[0].value, b"QQ");

        let rdns = dn_to_rdns("cn=Doe\\, John,ou=people,dc=example,dc=com").unwrap();
        assert_eq!(rdns.len(), 4);
        assert_eq!(rdns[0].value, b"Doe, John");
        assert_eq!(rdns[3].key, "dc");

        let rdns = dn_to_rdns("cn=a\\2Bb\\3d,dc=x").unwrap();
        assert_eq!(rdns[0].value, b"a+b=");

        assert!(dn_to_rdns("cn=broken\\").is_none());
        assert!(dn_to_rdns("cn=bad\\q,dc=x").is_none());
        assert!(dn_to_rdns("noequals").is_none());
    }

    #[test]
    fn test_scope() {
        let base = dn_key("ou=People, DC=Example,DC=com").unwrap();
        let child = dn_key("uid=jdoe,ou=people,dc=example,dc=com").unwrap();
        let grandchild = dn_key("cn=x,uid=jdoe,ou=people,dc=example,dc=com").unwrap();
        let elsewhere = dn_key("uid=jdoe,ou=groups,dc=example,dc=com").unwrap();

        assert!(in_scope(&base, &base, SearchScope::Base));
        assert!(!in_scope(&child, &base, SearchScope::Base));
        assert!(in_scope(&child, &base, SearchScope::OneLevel));
        assert!(!in_scope(&grandchild, &base, SearchScope::OneLevel));
        assert!(in_scope(&grandchild, &base, SearchScope::Subtree));
        assert!(!in_scope(&elsewhere, &base, SearchScope::Subtree));
    }
}
