//! Building and rewriting RFC 4515 string filters.

use unicase::UniCase;

use crate::config::EngineConfig;


/// Escapes a single comparison operand. Never apply this to a whole filter.
pub fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\5c"),
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\0' => escaped.push_str("\\00"),
            other => escaped.push(other),
        }
    }
    escaped
}


/// Narrows `filter` to entries whose `attribute` is at least `boundary`
/// (or strictly greater if `strict`).
///
/// LDAP has no `>` operator, so the strict form is written as
/// `(!(attribute<=boundary))`.
pub fn add_range_constraint(filter: &str, attribute: &str, boundary: &str, strict: bool) -> String {
    let escaped_boundary = escape(boundary);
    let clause = if strict {
        format!("(!({}<={}))", attribute, escaped_boundary)
    } else {
        format!("({}>={})", attribute, escaped_boundary)
    };

    let filter = filter.trim();
    if is_single_clause(filter) {
        if filter.starts_with("(&") {
            // splice into the existing conjunction
            format!("{}{})", &filter[..filter.len()-1], clause)
        } else {
            format!("(&{}{})", filter, clause)
        }
    } else {
        format!("(&({}){})", filter, clause)
    }
}


/// Whether `filter` is exactly one parenthesized clause, e.g. `(cn=x)` or
/// `(|(a=b)(c=d))` but not `(a=b)(c=d)` or `cn=x`.
fn is_single_clause(filter: &str) -> bool {
    if !filter.starts_with('(') || !filter.ends_with(')') {
        return false;
    }

    let mut depth = 0usize;
    let mut escaped = false;
    for (i, c) in filter.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '(' => depth += 1,
            ')' => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
                if depth == 0 {
                    return i == filter.len() - 1;
                }
            },
            _ => {},
        }
    }
    false
}


/// Lists the attribute descriptions mentioned in a filter, in order of
/// appearance.
pub fn filter_attributes(filter: &str) -> Vec<String> {
    let mut attributes = Vec::new();
    let mut escaped = false;
    let chars: Vec<(usize, char)> = filter.char_indices().collect();
    for (pos, &(start, c)) in chars.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
            continue;
        }
        if c != '(' {
            continue;
        }

        // read up to the first operator or parenthesis
        let name_start = start + 1;
        let mut name_end = filter.len();
        let mut terminator = None;
        for &(i, nc) in &chars[pos+1..] {
            if matches!(nc, '=' | '~' | '<' | '>' | ':' | '(' | ')') {
                name_end = i;
                terminator = Some(nc);
                break;
            }
        }
        let Some(terminator) = terminator else { continue };
        if terminator == '(' || terminator == ')' {
            continue;
        }
        let name = filter[name_start..name_end].trim();
        if name.is_empty() {
            continue;
        }
        attributes.push(name.to_owned());
    }
    attributes
}


/// Picks the attribute used for range chunking: the first configured
/// candidate that the filter mentions, or the configured default.
pub fn detect_sort_attribute(filter: &str, config: &EngineConfig) -> String {
    let mentioned: Vec<UniCase<String>> = filter_attributes(filter)
        .into_iter()
        .map(UniCase::new)
        .collect();
    for candidate in &config.sort_attribute_candidates {
        if mentioned.contains(&UniCase::new(candidate.clone())) {
            return candidate.clone();
        }
    }
    config.default_sort_attribute.clone()
}


#[cfg(test)]
mod tests {
    use super::{add_range_constraint, detect_sort_attribute, escape, filter_attributes, is_single_clause};
    use crate::config::EngineConfig;

    #[test]
    fn test_escape() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("a*b"), "a\\2ab");
        assert_eq!(escape("(x)"), "\\28x\\29");
        assert_eq!(escape("back\\slash"), "back\\5cslash");
        assert_eq!(escape("nul\0"), "nul\\00");
        assert_eq!(escape("\\*"), "\\5c\\2a");
    }

    #[test]
    fn test_escape_never_leaves_specials() {
        for value in ["*", "((", "))", "\0\0", "a\\(b*)c\0", "\\28", "Müller (ext)"] {
            let once = escape(value);
            let twice = escape(&once);
            for out in [&once, &twice] {
                assert!(!out.contains('('));
                assert!(!out.contains(')'));
                assert!(!out.contains('*'));
                assert!(!out.contains('\0'));
            }
        }
    }

    #[test]
    fn test_single_clause() {
        assert!(is_single_clause("(cn=x)"));
        assert!(is_single_clause("(|(a=b)(c=d))"));
        assert!(is_single_clause("(cn=a\\29b)"));
        assert!(!is_single_clause("(a=b)(c=d)"));
        assert!(!is_single_clause("cn=x"));
        assert!(!is_single_clause("(cn=x"));
    }

    #[test]
    fn test_range_constraint_shapes() {
        assert_eq!(
            add_range_constraint("(&(objectClass=person)(mail=*))", "uid", "jdoe", false),
            "(&(objectClass=person)(mail=*)(uid>=jdoe))",
        );
        assert_eq!(
            add_range_constraint("(|(cn=a*)(cn=b*))", "cn", "b", false),
            "(&(|(cn=a*)(cn=b*))(cn>=b))",
        );
        assert_eq!(
            add_range_constraint("(objectClass=person)", "uid", "a(b)", false),
            "(&(objectClass=person)(uid>=a\\28b\\29))",
        );
        assert_eq!(
            add_range_constraint("objectClass=person", "uid", "m", false),
            "(&(objectClass=person)(uid>=m))",
        );
        assert_eq!(
            add_range_constraint("(objectClass=person)", "uid", "m", true),
            "(&(objectClass=person)(!(uid<=m)))",
        );
    }

    #[test]
    fn test_range_constraint_repeated() {
        let once = add_range_constraint("(objectClass=person)", "uid", "b", false);
        let twice = add_range_constraint(&once, "uid", "d", false);
        assert_eq!(twice, "(&(objectClass=person)(uid>=b)(uid>=d))");
    }

    #[test]
    fn test_filter_attributes() {
        assert_eq!(
            filter_attributes("(&(objectClass=person)(!(mail=*))(sn~=smith)(uidNumber>=100)(cn:dn:=x))"),
            vec!["objectClass", "mail", "sn", "uidNumber", "cn"],
        );
        assert_eq!(filter_attributes("(cn=a\\28sn=b\\29)"), vec!["cn"]);
    }

    #[test]
    fn test_detect_sort_attribute() {
        let config = EngineConfig::default();
        assert_eq!(detect_sort_attribute("(&(cn=a*)(uid=*))", &config), "uid");
        assert_eq!(detect_sort_attribute("(&(objectClass=person)(sn=S*)(mail=*))", &config), "sn");
        assert_eq!(detect_sort_attribute("(MAIL=*@example.com)", &config), "mail");
        assert_eq!(detect_sort_attribute("(objectClass=person)", &config), "uid");
        // a candidate name inside a value does not count
        assert_eq!(detect_sort_attribute("(description=cn=admins)", &config), "uid");

        let config = EngineConfig {
            sort_attribute_candidates: vec!["employeeNumber".to_owned()],
            default_sort_attribute: "cn".to_owned(),
            ..EngineConfig::default()
        };
        assert_eq!(detect_sort_attribute("(employeeNumber>=5)", &config), "employeeNumber");
        assert_eq!(detect_sort_attribute("(uid=x)", &config), "cn");
    }
}
