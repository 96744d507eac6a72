//! Parser for bot commands in comment text.
//!
//! This is a pure parser: it extracts intended mutations from unstructured
//! comment text and never touches the model. Only lines that mention the
//! trigger (`@homu` by default) are scanned; every recognized verb on such a
//! line takes effect, in order of appearance.

use super::types::{Approver, Command, Delegate, Parsed};

/// Parses every bot command found in a comment body.
///
/// # Arguments
///
/// * `body` - The comment text
/// * `trigger` - The trigger name without the `@` prefix (e.g. `"homu"`)
///
/// # Parsing Rules
///
/// - The trigger `@{trigger}` is case-insensitive (like GitHub mentions) and
///   must sit at a word boundary (not preceded by an alphanumeric char)
/// - Only lines containing the trigger are scanned; all whitespace-separated
///   words on such a line are candidate verbs
/// - Unknown words are ignored; recognized verbs with bad arguments yield
///   [`Parsed::Malformed`]
/// - `r+` / `r=USER` consume a following word as a SHA argument only when it
///   looks like one (at least 4 hex characters)
pub fn parse_commands(body: &str, trigger: &str) -> Vec<Parsed> {
    let mut out = Vec::new();

    for line in body.lines() {
        if !mentions_trigger(line, trigger) {
            continue;
        }

        let words: Vec<&str> = line.split_whitespace().collect();
        let mut i = 0;
        while i < words.len() {
            let word = words[i];
            let lookahead = words.get(i + 1).copied();
            if let Some((parsed, consumed_arg)) = parse_word(word, lookahead) {
                out.push(parsed);
                if consumed_arg {
                    i += 1;
                }
            }
            i += 1;
        }
    }

    out
}

/// Returns true if the line mentions `@{trigger}` at a word boundary.
fn mentions_trigger(line: &str, trigger: &str) -> bool {
    let needle = format!("@{}", trigger);
    let mut search_pos = 0;

    while search_pos < line.len() {
        let Some(at_pos) = line[search_pos..].find('@') else {
            return false;
        };
        let abs_pos = search_pos + at_pos;

        if let Some(candidate) = line.get(abs_pos..abs_pos + needle.len())
            && candidate.eq_ignore_ascii_case(&needle)
        {
            // Left boundary: start of line or a non-alphanumeric char.
            let left_ok = abs_pos == 0
                || !line[..abs_pos]
                    .chars()
                    .next_back()
                    .is_some_and(|c| c.is_alphanumeric());
            // Right boundary: end of line or a non-mention char, so that
            // "@homubot" does not match trigger "homu".
            let after = abs_pos + needle.len();
            let right_ok = !line[after..]
                .chars()
                .next()
                .is_some_and(|c| c.is_alphanumeric() || c == '-' || c == '_');
            if left_ok && right_ok {
                return true;
            }
        }

        search_pos = abs_pos + 1;
    }
    false
}

/// Attempts to parse one word as a verb.
///
/// Returns the parse outcome and whether the lookahead word was consumed as
/// an argument.
fn parse_word(word: &str, lookahead: Option<&str>) -> Option<(Parsed, bool)> {
    match word {
        "r+" => {
            let (sha, consumed) = take_sha_arg(lookahead);
            Some((
                Parsed::Command(Command::Approve {
                    approver: Approver::Commenter,
                    sha,
                }),
                consumed,
            ))
        }
        "r-" => Some((Parsed::Command(Command::Unapprove), false)),
        "try" => Some((Parsed::Command(Command::SetTry(true)), false)),
        "try-" => Some((Parsed::Command(Command::SetTry(false)), false)),
        "rollup" => Some((Parsed::Command(Command::SetRollup(true)), false)),
        "rollup-" => Some((Parsed::Command(Command::SetRollup(false)), false)),
        "retry" => Some((Parsed::Command(Command::Retry), false)),
        "force" => Some((Parsed::Command(Command::Force), false)),
        "clean" => Some((Parsed::Command(Command::Clean), false)),
        "delegate+" => Some((Parsed::Command(Command::Delegation(Delegate::Author)), false)),
        "delegate-" => Some((Parsed::Command(Command::Delegation(Delegate::Revoke)), false)),
        _ => {
            if let Some(user) = word.strip_prefix("r=") {
                let parsed = if user.is_empty() {
                    (
                        Parsed::Malformed {
                            word: word.to_string(),
                            reason: "`r=` requires a user name".to_string(),
                        },
                        false,
                    )
                } else {
                    let (sha, consumed) = take_sha_arg(lookahead);
                    (
                        Parsed::Command(Command::Approve {
                            approver: Approver::Named(user.to_string()),
                            sha,
                        }),
                        consumed,
                    )
                };
                Some(parsed)
            } else if let Some(num) = word.strip_prefix("p=") {
                let parsed = match num.parse::<i32>() {
                    Ok(n) => Parsed::Command(Command::Priority(n)),
                    Err(_) => Parsed::Malformed {
                        word: word.to_string(),
                        reason: format!("`{}` is not a valid integer priority", num),
                    },
                };
                Some((parsed, false))
            } else if let Some(user) = word.strip_prefix("delegate=") {
                let parsed = if user.is_empty() {
                    Parsed::Malformed {
                        word: word.to_string(),
                        reason: "`delegate=` requires a user name".to_string(),
                    }
                } else {
                    Parsed::Command(Command::Delegation(Delegate::Named(user.to_string())))
                };
                Some((parsed, false))
            } else {
                // Unknown word: not a command at all.
                None
            }
        }
    }
}

/// Consumes the lookahead word as a SHA argument if it plausibly is one.
fn take_sha_arg(lookahead: Option<&str>) -> (Option<String>, bool) {
    match lookahead {
        Some(w) if w.len() >= 4 && w.chars().all(|c| c.is_ascii_hexdigit()) => {
            (Some(w.to_string()), true)
        }
        _ => (None, false),
    }
}
