//! Quote-aware command line splitting.
//!
//! Commands are never handed to a shell, so this is the only place a command
//! line turns into an argv. Single and double quotes group words and are
//! stripped; a quote of the other kind inside a quoted run is literal. There is
//! no backslash escaping. Only spaces separate words; callers reject other
//! whitespace before getting here.

pub fn split_args(command_line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in command_line.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None if ch == '"' || ch == '\'' => quote = Some(ch),
            None if ch == ' ' => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            None => current.push(ch),
        }
    }

    if !current.is_empty() {
        args.push(current);
    }
    args
}
