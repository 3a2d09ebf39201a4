use std::fs;
use std::path::Path;

/// Parse one `.env` line into a key/value pair. Quotes and trailing `#` comments are stripped.
fn parse_env_line(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let (key, value) = trimmed.split_once('=')?;
    let key = key.trim().trim_start_matches("export ").trim();
    if key.is_empty() {
        return None;
    }

    let value_no_comment = value.split('#').next().unwrap_or("").trim();
    let parsed = if value_no_comment.len() >= 2
        && ((value_no_comment.starts_with('"') && value_no_comment.ends_with('"'))
            || (value_no_comment.starts_with('\'') && value_no_comment.ends_with('\'')))
    {
        &value_no_comment[1..value_no_comment.len() - 1]
    } else {
        value_no_comment
    };
    Some((key, parsed))
}

/// Load `.env` from the working directory. Variables already present in the process
/// environment win over file values.
pub fn load_dot_env() {
    let path = Path::new(".env");
    if !path.exists() {
        return;
    }

    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[ENV] Failed to read .env: {}", e);
            return;
        }
    };

    for (key, value) in content.lines().filter_map(parse_env_line) {
        if std::env::var_os(key).is_some() {
            continue;
        }
        std::env::set_var(key, value);
    }
}

pub fn parse_bool_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::{parse_bool_flag, parse_env_line};

    #[test]
    fn test_parse_env_line_strips_quotes_and_comments() {
        assert_eq!(
            parse_env_line("ETH_RPC_URL=\"http://localhost:8545\" # local"),
            Some(("ETH_RPC_URL", "http://localhost:8545"))
        );
        assert_eq!(parse_env_line("export TARGET_MODE=1"), Some(("TARGET_MODE", "1")));
        assert_eq!(parse_env_line("# comment"), None);
        assert_eq!(parse_env_line("   "), None);
    }

    #[test]
    fn test_parse_bool_flag_accepts_common_truthy_values() {
        for raw in ["1", "true", "YES", " on "] {
            assert!(parse_bool_flag(raw), "{raw}");
        }
        for raw in ["0", "false", "", "enabled"] {
            assert!(!parse_bool_flag(raw), "{raw}");
        }
    }
}
