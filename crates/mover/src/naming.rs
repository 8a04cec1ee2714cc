//! Collision names.
//!
//! `trace1.pcap` becomes `trace1-dup1.pcap`, `trace1-dup2.pcap`, ... The marker
//! goes before the first extension so `trace.pcap.gz` keeps its suffixes.

const DUP_MARKER: &str = "-dup";

/// Returns the `n`-th alternative name for `name` (`n >= 1`).
///
/// Alternatives are always derived from the logical name, so renaming an
/// already-renamed file does not stack markers.
pub fn collision_name(name: &str, n: u32) -> String {
    let logical = logical_name(name);
    let (stem, ext) = split_ext(&logical);
    match ext {
        Some(ext) => format!("{stem}{DUP_MARKER}{n}.{ext}"),
        None => format!("{stem}{DUP_MARKER}{n}"),
    }
}

/// Strips a collision marker, returning the name the artifact arrived with.
pub fn logical_name(name: &str) -> String {
    let (stem, ext) = split_ext(name);
    let base = match stem.rfind(DUP_MARKER) {
        Some(pos) if pos > 0 => {
            let digits = &stem[pos + DUP_MARKER.len()..];
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                &stem[..pos]
            } else {
                stem
            }
        }
        _ => stem,
    };
    match ext {
        Some(ext) => format!("{base}.{ext}"),
        None => base.to_string(),
    }
}

/// Splits at the first dot after position 0 (leading dots belong to the stem).
fn split_ext(name: &str) -> (&str, Option<&str>) {
    let first = name.chars().next().map_or(0, char::len_utf8);
    match name[first..].find('.') {
        Some(pos) => (&name[..first + pos], Some(&name[first + pos + 1..])),
        None => (name, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alternative_names() {
        assert_eq!(collision_name("trace1.pcap", 1), "trace1-dup1.pcap");
        assert_eq!(collision_name("trace1.pcap", 12), "trace1-dup12.pcap");
        assert_eq!(collision_name("trace.pcap.gz", 2), "trace-dup2.pcap.gz");
        assert_eq!(collision_name("README", 1), "README-dup1");
    }

    #[test]
    fn renaming_a_renamed_file_does_not_stack() {
        assert_eq!(collision_name("trace1-dup1.pcap", 2), "trace1-dup2.pcap");
    }

    #[test]
    fn logical_name_round_trips() {
        for name in ["trace1.pcap", "MAH11-20250101-120000.pcap", "a.b.c", "plain"] {
            assert_eq!(logical_name(&collision_name(name, 3)), name);
            assert_eq!(logical_name(name), name);
        }
    }

    #[test]
    fn logical_name_ignores_lookalikes() {
        assert_eq!(logical_name("trace-dupx.pcap"), "trace-dupx.pcap");
        assert_eq!(logical_name("trace-dup.pcap"), "trace-dup.pcap");
        assert_eq!(logical_name("-dup1.pcap"), "-dup1.pcap");
    }

    #[test]
    fn leading_dot_is_part_of_stem() {
        assert_eq!(split_ext(".hidden"), (".hidden", None));
        assert_eq!(split_ext(".hidden.pcap"), (".hidden", Some("pcap")));
        assert_eq!(split_ext("x"), ("x", None));
        assert_eq!(split_ext(""), ("", None));
    }
}
