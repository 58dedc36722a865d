/// Join chunk texts in order with a blank line between them.
pub fn join_parts<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts
        .into_iter()
        .map(str::trim_end)
        .filter(|part| !part.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Renumber `N.` / `N)` list items sequentially across the whole text.
pub fn renumber_list(text: &str) -> String {
    let mut next = 1;
    let mut out = Vec::new();

    for line in text.lines() {
        match split_list_marker(line) {
            Some((indent, rest)) => {
                out.push(format!("{}{}. {}", indent, next, rest));
                next += 1;
            }
            None => out.push(line.to_string()),
        }
    }
    out.join("\n")
}

/// Split `"  12. item"` into `("  ", "item")`; nested items are left alone.
fn split_list_marker(line: &str) -> Option<(&str, &str)> {
    let body = line.trim_start();
    let indent = &line[..line.len() - body.len()];
    if indent.len() > 1 {
        return None;
    }

    let digits = body.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let after = &body[digits..];
    let mut chars = after.chars();
    match (chars.next(), chars.next()) {
        (Some('.') | Some(')'), Some(c)) if c.is_whitespace() => Some((indent, after[1..].trim_start())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_are_blank_line_separated() {
        assert_eq!(join_parts(["first\n", "", "second"]), "first\n\nsecond");
    }

    #[test]
    fn numbering_continues_across_parts() {
        let joined = join_parts(["1. alpha\n2. beta", "1. gamma\n   detail\n2) delta"]);
        assert_eq!(
            renumber_list(&joined),
            "1. alpha\n2. beta\n\n3. gamma\n   detail\n4. delta"
        );
    }

    #[test]
    fn non_list_lines_are_untouched() {
        assert_eq!(renumber_list("2024 was a year\n1.5 is a number"), "2024 was a year\n1.5 is a number");
    }
}
