//! Small string helpers shared by the event log and the shell.

/// Render a string with non-printable characters escaped, so tracee-supplied
/// argv entries can't mangle the terminal.
pub fn escaped(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            c if c.is_control() => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// The final component of a path, like basename(1).
pub fn base_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

pub fn join(args: &[String]) -> String {
    args.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_name_strips_directories() {
        assert_eq!(base_name("/usr/bin/true"), "true");
        assert_eq!(base_name("true"), "true");
        assert_eq!(base_name("/trailing/"), "");
    }

    #[test]
    fn escaped_keeps_printables() {
        assert_eq!(escaped("ls -l"), "ls -l");
        assert_eq!(escaped("a\tb\n"), "a\\tb\\n");
        assert_eq!(escaped("\x1b[31m"), "\\x1b[31m");
    }
}
