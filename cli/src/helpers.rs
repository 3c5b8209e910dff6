//! Helper functions and constants
//!
//! Contains error formatting, script loading and output formatting.

use std::io::Read;
use std::path::Path;

use figpad_protocol::{PrintMessage, ScriptFailure};

// ============================================================================
// Application Constants
// ============================================================================

/// Log filter used when `RUST_LOG` does not say otherwise
pub const DEFAULT_LOG_FILTER: &str = "figpad=info";

/// Script path that means standard input
pub const STDIN_PATH: &str = "-";

// ============================================================================
// Error Formatting
// ============================================================================

/// Format a user-friendly error for file access
pub fn error_io(path: &Path, error: &std::io::Error) -> String {
    format!("Failed to read {}: {}", path.display(), error)
}

/// Format a user-friendly error for runtime setup
pub fn error_runtime(details: &str) -> String {
    format!("Failed to start the runtime: {}", details)
}

/// Describe a failed script: the user stack when there is one, otherwise
/// `name: message`
pub fn format_failure(failure: &ScriptFailure) -> String {
    if let Some(stack) = failure.user_stack.as_deref().filter(|s| !s.is_empty()) {
        if failure.name.is_empty() || failure.name == "Error" {
            return stack.to_string();
        }
        return format!("{}: {}", failure.name, stack);
    }
    if failure.name.is_empty() {
        failure.message.clone()
    } else {
        format!("{}: {}", failure.name, failure.message)
    }
}

// ============================================================================
// Script Loading and Output
// ============================================================================

/// Read the script at `path`, or standard input for `-`
pub fn read_script(path: &Path) -> Result<String, String> {
    if path.as_os_str() == STDIN_PATH {
        let mut source = String::new();
        std::io::stdin()
            .read_to_string(&mut source)
            .map_err(|e| error_io(path, &e))?;
        return Ok(source);
    }
    std::fs::read_to_string(path).map_err(|e| error_io(path, &e))
}

/// Line of the script a print came from, if the position is known
pub fn print_line(message: &PrintMessage) -> Option<u32> {
    message
        .src_pos
        .is_known()
        .then(|| message.src_pos.line.saturating_sub(message.src_line_offset))
        .filter(|line| *line > 0)
}

/// Terminal form of a print message
pub fn format_print(message: &PrintMessage) -> String {
    let text = if message.message.is_empty() {
        figpad_script_host::render(&message.args)
    } else {
        message.message.clone()
    };
    match print_line(message) {
        Some(line) => format!("{:>4} │ {}", line, text),
        None => format!("     │ {}", text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figpad_protocol::{Cloned, RequestId, SourcePos};

    fn print(line: u32, args: Vec<Cloned>) -> PrintMessage {
        PrintMessage {
            message: String::new(),
            args,
            req_id: RequestId::new("r1"),
            src_pos: SourcePos { line, column: 3 },
            src_line_offset: 5,
        }
    }

    #[test]
    fn print_lines_are_relative_to_the_script() {
        let message = print(8, vec![Cloned::String("hi".into()), Cloned::Number(2.0)]);
        assert_eq!(print_line(&message), Some(3));
        assert_eq!(format_print(&message), "   3 │ hi 2");
    }

    #[test]
    fn unknown_position_has_no_line() {
        let message = print(0, vec![Cloned::Bool(true)]);
        assert_eq!(print_line(&message), None);
        assert_eq!(format_print(&message), "     │ true");
    }

    #[test]
    fn failures_prefer_the_user_stack() {
        let failure = ScriptFailure {
            name: "TypeError".into(),
            message: "x is undefined".into(),
            user_stack: Some("x is undefined\n    at main (<input>:9)".into()),
            cancelled: false,
        };
        assert_eq!(
            format_failure(&failure),
            "TypeError: x is undefined\n    at main (<input>:9)"
        );

        let failure = ScriptFailure {
            user_stack: None,
            ..failure
        };
        assert_eq!(format_failure(&failure), "TypeError: x is undefined");
    }

    #[test]
    fn missing_script_names_the_path() {
        let err = read_script(Path::new("/nonexistent/script.js")).unwrap_err();
        assert!(err.starts_with("Failed to read /nonexistent/script.js"));
    }
}
