//! Stack trace parsing for source positions

use figpad_protocol::{SourcePos, StackFrame};

/// Parse the `at ...` lines of an engine stack trace.
///
/// Accepts `at name (file:line)`, `at name (file:line:col)` and
/// `at file:line[:col]`. Frames without a line number (native code) are
/// skipped.
pub fn user_frames(stack: &str) -> Vec<StackFrame> {
    stack.lines().filter_map(parse_frame).collect()
}

fn parse_frame(line: &str) -> Option<StackFrame> {
    let rest = line.trim().strip_prefix("at ")?;
    let (function, location) = match rest.rfind(" (") {
        Some(i) if rest.ends_with(')') => (Some(&rest[..i]), &rest[i + 2..rest.len() - 1]),
        _ => (None, rest),
    };

    let (head, last) = location.rsplit_once(':')?;
    let last: u32 = last.parse().ok()?;
    let (file, line, column) = match head.rsplit_once(':') {
        Some((file, l)) => match l.parse::<u32>() {
            Ok(line) => (file, line, last),
            Err(_) => (head, last, 0),
        },
        None => (head, last, 0),
    };
    if line == 0 {
        return None;
    }

    Some(StackFrame {
        function: function
            .filter(|f| !f.is_empty() && *f != "<anonymous>")
            .map(str::to_string),
        file: file.to_string(),
        line,
        column,
    })
}

/// First known position, skipping `offset` innermost frames
pub fn first_source_pos(frames: &[StackFrame], offset: usize) -> Option<SourcePos> {
    frames.iter().skip(offset).find(|f| f.line > 0).map(|f| SourcePos {
        line: f.line,
        column: f.column,
    })
}

/// Name of the function wrapping a script's body
pub const MAIN_FUNCTION: &str = "__script_main";

/// Drop the script's main frame along with any host frames outside it.
/// Without a main frame, only the outermost frame is dropped.
pub fn without_main(mut frames: Vec<StackFrame>) -> Vec<StackFrame> {
    match frames
        .iter()
        .position(|f| f.function.as_deref() == Some(MAIN_FUNCTION))
    {
        Some(main) => frames.truncate(main),
        None => {
            frames.pop();
        }
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    const STACK: &str = "Error: boom\n    at inner (<input>:14:9)\n    at map (native)\n    at <anonymous> (<input>:20)\n    at __script_main (<input>:22:3)\n";

    #[test]
    fn parses_named_and_anonymous_frames() {
        let frames = user_frames(STACK);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].function.as_deref(), Some("inner"));
        assert_eq!((frames[0].line, frames[0].column), (14, 9));
        assert_eq!(frames[1].function, None);
        assert_eq!((frames[1].line, frames[1].column), (20, 0));
    }

    #[test]
    fn bare_location_frame() {
        let frames = user_frames("    at <input>:7:2");
        assert_eq!(frames[0].file, "<input>");
        assert_eq!(frames[0].line, 7);
    }

    #[test]
    fn source_pos_respects_offset() {
        let frames = user_frames(STACK);
        assert_eq!(first_source_pos(&frames, 0), Some(SourcePos { line: 14, column: 9 }));
        assert_eq!(first_source_pos(&frames, 1), Some(SourcePos { line: 20, column: 0 }));
        assert_eq!(first_source_pos(&frames, 5), None);
    }

    #[test]
    fn main_frame_is_dropped() {
        let frames = without_main(user_frames(STACK));
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.function.as_deref() != Some("__script_main")));
    }

    #[test]
    fn host_frames_outside_main_are_dropped() {
        let stack = "    at f (<input>:9:5)\n    at __script_main (<input>:10:1)\n    at start (<prelude>:300:7)\n    at dispatch (<prelude>:410:3)";
        let frames = without_main(user_frames(stack));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].function.as_deref(), Some("f"));
    }
}
