pub(crate) fn enabled() -> bool {
    std::env::var("SNIPL_DEBUG")
        .map(|v| !v.is_empty())
        .unwrap_or(false)
}

/// Hex dump of a wire buffer when `SNIPL_DEBUG` is set.
pub(crate) fn dump_hex(label: &str, bytes: &[u8]) {
    if !enabled() {
        return;
    }
    let out = format_dump(label, bytes);

    #[cfg(feature = "tracing")]
    tracing::trace!("{out}");

    #[cfg(not(feature = "tracing"))]
    eprintln!("{out}");
}

fn format_dump(label: &str, bytes: &[u8]) -> String {
    let mut out = String::with_capacity(label.len() + bytes.len() * 3 + 16);
    out.push_str(label);
    out.push_str(" (");
    out.push_str(&bytes.len().to_string());
    out.push_str("):");
    for (i, b) in bytes.iter().enumerate() {
        // 16 bytes per line
        if i % 16 == 0 && i > 0 {
            out.push_str("\n   ");
        }
        out.push(' ');
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_breaks_lines_every_sixteen_bytes() {
        let bytes: Vec<u8> = (0u8..18).collect();
        let out = format_dump("send", &bytes);
        assert!(out.starts_with("send (18): 00 01"));
        assert_eq!(out.lines().count(), 2);
        assert!(out.ends_with(" 10 11"));
    }
}
