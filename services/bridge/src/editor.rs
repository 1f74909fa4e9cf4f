//! Editor-facing surface: the user command set and the output sinks.
//!
//! The editor plumbing itself (rendering, key mappings) lives outside this
//! crate; it drives the session with parsed [`UserCommand`]s and receives
//! output through the three sink traits.

/// Console text sink. Text is printed verbatim; callers append newlines.
pub trait Console {
    fn print(&mut self, text: &str);
}

/// The stepping-position indicator.
pub trait FrameView {
    fn show(&mut self, file: &str, line: u32);
    fn hide(&mut self);
}

/// The variable-inspection buffer.
pub trait VarView {
    fn update(&mut self, text: &str, dirty: bool);
}

/// A parsed editor command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    Attach,
    /// Historical spelling, kept for compatibility with existing keymaps.
    Dettach,
    Break { name: String, line: u32 },
    Clear { name: String, line: u32 },
    Disable { bp_id: u32 },
    Enable { bp_id: u32 },
    Continue,
    Step,
    StepIn,
    StepOut,
    Print { expression: String },
    Backtrace,
    FoldVar { line: u32 },
    Quit,
    SigInt,
    SymCompletion,
    /// A known command with arguments that did not parse.
    InvalidArguments,
    /// `foldvar` with a non-numeric argument.
    NotALineNumber,
    /// Not a command we know.
    Ignored,
}

/// Parse one command line. The caller is expected to have echoed the raw
/// line to the console already.
pub fn parse_command(line: &str) -> UserCommand {
    let line = line.trim();
    let (cmd, args) = match line.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (line, ""),
    };
    match cmd {
        "attach" => UserCommand::Attach,
        "dettach" => UserCommand::Dettach,
        "break" => match parse_name_line(args) {
            Some((name, line)) => UserCommand::Break { name, line },
            None => UserCommand::InvalidArguments,
        },
        "clear" => match parse_name_line(args) {
            Some((name, line)) => UserCommand::Clear { name, line },
            None => UserCommand::InvalidArguments,
        },
        "disable" => match parse_bp_id(args) {
            Some(bp_id) => UserCommand::Disable { bp_id },
            None => UserCommand::InvalidArguments,
        },
        "enable" => match parse_bp_id(args) {
            Some(bp_id) => UserCommand::Enable { bp_id },
            None => UserCommand::InvalidArguments,
        },
        "continue" => UserCommand::Continue,
        "step" => UserCommand::Step,
        "stepin" => UserCommand::StepIn,
        "stepout" => UserCommand::StepOut,
        "print" => {
            if args.is_empty() {
                UserCommand::InvalidArguments
            } else {
                UserCommand::Print {
                    expression: args.to_owned(),
                }
            }
        }
        "backtrace" => UserCommand::Backtrace,
        "foldvar" => {
            let mut words = args.split_whitespace();
            match (words.next(), words.next()) {
                (Some(first), None) => match first.parse::<u32>() {
                    Ok(line) => UserCommand::FoldVar { line },
                    Err(_) => UserCommand::NotALineNumber,
                },
                _ => UserCommand::InvalidArguments,
            }
        }
        "quit" => UserCommand::Quit,
        "sigint" => UserCommand::SigInt,
        "symcompletion" => UserCommand::SymCompletion,
        _ => UserCommand::Ignored,
    }
}

/// Split a `fname:lnum` argument. Lines are 1-based; 0 is rejected.
fn parse_name_line(args: &str) -> Option<(String, u32)> {
    let (name, line) = args.rsplit_once(':')?;
    if name.is_empty() {
        return None;
    }
    let line = line.parse::<u32>().ok()?;
    if line == 0 {
        return None;
    }
    Some((name.to_owned(), line))
}

/// Breakpoint ids must be a single integer argument, validated before
/// anything reaches the wire.
fn parse_bp_id(args: &str) -> Option<u32> {
    let mut words = args.split_whitespace();
    match (words.next(), words.next()) {
        (Some(first), None) => first.parse::<u32>().ok(),
        _ => None,
    }
}
