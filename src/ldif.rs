use std::borrow::Cow;
use std::fmt;

use base64::Engine;
use tracing::warn;

use crate::directory::DirectoryEntry;


fn normalize_newlines<'a>(ldif: &'a str) -> Cow<'a, str> {
    if ldif.contains("\r\n") {
        Cow::Owned(ldif.replace("\r\n", "\n"))
    } else {
        Cow::Borrowed(ldif)
    }
}

fn join_continuations<'a>(ldif: &'a str) -> Cow<'a, str> {
    if ldif.contains("\n ") {
        Cow::Owned(ldif.replace("\n ", ""))
    } else {
        Cow::Borrowed(ldif)
    }
}

fn strip_comments<'a>(ldif: &'a str) -> Cow<'a, str> {
    if ldif.starts_with('#') || ldif.contains("\n#") {
        let mut uncommented = String::with_capacity(ldif.len());
        let mut first_line = true;
        for ln in ldif.split('\n') {
            if ln.starts_with('#') {
                continue;
            }

            if first_line {
                first_line = false;
            } else {
                uncommented.push('\n');
            }
            uncommented.push_str(ln);
        }
        Cow::Owned(uncommented)
    } else {
        Cow::Borrowed(ldif)
    }
}

fn compress_newlines<'a>(ldif: &'a str) -> Cow<'a, str> {
    if ldif.contains("\n\n\n") {
        let mut compressed = ldif.replace("\n\n\n", "\n\n");
        while compressed.contains("\n\n\n") {
            compressed = compressed.replace("\n\n\n", "\n\n");
        }
        Cow::Owned(compressed)
    } else {
        Cow::Borrowed(ldif)
    }
}

fn cut_str_to_max(s: &str, mut max_bytes: usize) -> &str {
    if max_bytes >= s.len() {
        return s;
    }
    while !s.is_char_boundary(max_bytes) {
        max_bytes -= 1;
    }
    &s[0..max_bytes]
}


/// Reads content records from an LDIF document.
///
/// Records without a `dn` line (such as a lone `version: 1`) are skipped;
/// so are lines that cannot be decoded.
pub fn parse_ldif(ldif: &str) -> Vec<DirectoryEntry> {
    // normalize LDIF
    let normalized = normalize_newlines(ldif);
    let joined = join_continuations(&*normalized);
    let stripped = strip_comments(&*joined);
    let compressed = compress_newlines(&*stripped);

    // each record is now separated by "\n\n"
    let mut records: Vec<DirectoryEntry> = Vec::new();
    for record in compressed.split("\n\n") {
        if record.trim().is_empty() {
            continue;
        }

        let mut dn = None;
        let mut key_to_values: Vec<(String, Vec<u8>)> = Vec::new();

        // and each attribute in the record by "\n"
        for attribute in record.split('\n') {
            if attribute.is_empty() {
                continue;
            }

            // split at the attribute name
            let Some((key, rest)) = attribute.split_once(':') else {
                warn!(line = %cut_str_to_max(attribute, 64), "skipping LDIF line missing colon");
                continue;
            };

            // how many colons?
            let value = if rest.is_empty() {
                // empty value
                Vec::with_capacity(0)
            } else if let Some(mut base64_str) = rest.strip_prefix(':') {
                // base64
                // strip off additional spaces
                base64_str = base64_str.trim_matches(' ');

                // decode
                match base64::engine::general_purpose::STANDARD.decode(base64_str) {
                    Ok(bs) => bs,
                    Err(_) => {
                        warn!(value = %cut_str_to_max(base64_str, 64), "skipping invalid base64 value");
                        continue;
                    },
                }
            } else if rest.starts_with('<') {
                warn!(key, "skipping URL-valued LDIF attribute");
                continue;
            } else {
                // plain
                // strip off additional spaces
                rest.trim_matches(' ').as_bytes().to_vec()
            };

            if key.eq_ignore_ascii_case("dn") {
                match String::from_utf8(value) {
                    Ok(s) => dn = Some(s),
                    Err(_) => warn!("skipping LDIF record with non-UTF-8 DN"),
                }
            } else {
                key_to_values.push((key.to_owned(), value));
            }
        }

        let Some(dn) = dn else {
            if !key_to_values.iter().all(|(k, _)| k.eq_ignore_ascii_case("version")) {
                warn!(record = %cut_str_to_max(record, 64), "skipping LDIF record missing required \"dn\" line");
            }
            continue;
        };

        let mut entry = DirectoryEntry::new(dn);
        for (key, value) in key_to_values {
            entry.push_value(key, value);
        }
        records.push(entry);
    }

    records
}


fn needs_base64(value: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(value) else { return true };
    text.starts_with(' ')
        || text.starts_with(':')
        || text.starts_with('<')
        || text.ends_with(' ')
        || text.contains(['\0', '\n', '\r'])
}

fn write_line<W: fmt::Write>(writer: &mut W, key: &str, value: &[u8]) -> fmt::Result {
    if needs_base64(value) {
        writeln!(writer, "{}:: {}", key, base64::engine::general_purpose::STANDARD.encode(value))
    } else {
        // needs_base64 already rejected non-UTF-8
        writeln!(writer, "{}: {}", key, String::from_utf8_lossy(value))
    }
}

/// Writes entries as LDIF content records, separated by blank lines.
pub fn write_ldif<W: fmt::Write>(writer: &mut W, entries: &[DirectoryEntry]) -> fmt::Result {
    for (i, entry) in entries.iter().enumerate() {
        if i > 0 {
            writeln!(writer)?;
        }
        write_line(writer, "dn", entry.dn.as_bytes())?;
        for (key, values) in &entry.attributes {
            for value in values {
                write_line(writer, key, value)?;
            }
        }
    }
    Ok(())
}
