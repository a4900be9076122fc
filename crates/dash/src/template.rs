// `$identifier$` substitution for SegmentTemplate URLs.

/// Values available to template substitution for one segment.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateValues<'a> {
    pub representation_id: Option<&'a str>,
    pub bandwidth: Option<u64>,
    pub number: Option<u64>,
    pub time: Option<u64>,
}

/// Expands `$RepresentationID$`, `$Bandwidth$`, `$Number$`, `$Time$` and
/// `$$` escapes, honoring `%0Nd` width formatting tags.
///
/// Unknown identifiers are left verbatim so a malformed template fails at
/// request time with a useful URL rather than silently dropping text.
pub fn fill_template(template: &str, values: &TemplateValues<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('$') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('$') else {
            // Unbalanced: keep the remainder untouched.
            out.push('$');
            rest = after;
            break;
        };
        let tag = &after[..end];
        rest = &after[end + 1..];
        if tag.is_empty() {
            out.push('$');
            continue;
        }
        let (identifier, width) = split_format(tag);
        let substituted = match identifier {
            "RepresentationID" => values.representation_id.map(|id| id.to_string()),
            "Bandwidth" => values.bandwidth.map(|b| format_number(b, width)),
            "Number" => values.number.map(|n| format_number(n, width)),
            "Time" => values.time.map(|t| format_number(t, width)),
            _ => None,
        };
        match substituted {
            Some(value) => out.push_str(&value),
            None => {
                out.push('$');
                out.push_str(tag);
                out.push('$');
            }
        }
    }
    out.push_str(rest);
    out
}

/// Splits `Number%05d` into (`Number`, Some(5)).
fn split_format(tag: &str) -> (&str, Option<usize>) {
    let Some((identifier, format)) = tag.split_once('%') else {
        return (tag, None);
    };
    let width = format
        .strip_prefix('0')
        .and_then(|f| f.strip_suffix('d'))
        .and_then(|digits| digits.parse().ok());
    (identifier, width)
}

fn format_number(value: u64, width: Option<usize>) -> String {
    match width {
        Some(width) => format!("{value:0width$}"),
        None => value.to_string(),
    }
}
