/// Single-line rendering of an error for logs, at most `max_len` bytes plus a marker.
/// Echoed response bodies and backtraces are dropped.
pub fn compact_error_message(message: &str, max_len: usize) -> String {
    let head = message.split("Stack backtrace:").next().unwrap_or(message);
    let head = match head.split_once(" text: ") {
        Some((prefix, _)) => format!("{prefix} text=<omitted>"),
        None => head.to_string(),
    };
    let collapsed = head.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.len() <= max_len {
        return collapsed;
    }
    let mut cut = max_len;
    while !collapsed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...(truncated)", &collapsed[..cut])
}
