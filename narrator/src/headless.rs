//! Line-oriented session loop.
//!
//! - `[type] text` sends `text` as that call type (`dialogue`, `action`,
//!   `travel`, ...); plain lines are narrative turns
//! - Lines starting with `#` are commands
//! - All other output is narrative or session state

use narrator_core::{CallType, NarratorError, NarratorSession, Turn};
use std::io::{self, BufRead, Write};

const HELP: &str = "\
  #quit           - Exit
  #status         - Show scene, context size and costs
  #sticky         - Show the loaded context
  #clear          - Drop the loaded context
  #roll <result>  - Report the result of a requested roll
  #profile <text> - Replace the player profile
  #help           - Show this help
  [type] <text>   - Send a turn of the given type (dialogue, action, travel)
  (anything else is sent as a narrative turn)";

/// Run the session until `#quit` or end of input.
pub async fn run_headless(session: NarratorSession, open: bool) -> Result<(), NarratorError> {
    println!("=== Narrator ===");
    print_status(&session)?;
    println!();
    println!("Commands:");
    println!("{HELP}");
    println!();

    if open {
        send(&session, CallType::SessionOpen, "Begin the session.").await;
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                eprintln!("Error reading input: {e}");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('#') {
            let (name, rest) = command
                .split_once(char::is_whitespace)
                .map_or((command, ""), |(n, r)| (n, r.trim()));
            match name {
                "quit" | "exit" => {
                    println!("Goodbye!");
                    break;
                }
                "status" => print_status(&session)?,
                "sticky" => {
                    let text = session.try_with(|o| o.sticky().format_for_prompt())?;
                    if text.is_empty() {
                        println!("[STICKY] (empty)");
                    } else {
                        println!("[STICKY]\n{text}");
                    }
                }
                "clear" => {
                    session.try_with(|o| o.clear_context())?;
                    println!("[CLEARED] Loaded context dropped");
                }
                "roll" if !rest.is_empty() => {
                    send(&session, CallType::RollResult, &format!("Roll result: {rest}")).await;
                }
                "roll" => println!("[ERROR] Usage: #roll <result>"),
                "profile" if !rest.is_empty() => {
                    session.try_with(|o| o.set_profile(rest))?;
                    println!("[PROFILE] Updated");
                }
                "profile" => println!("[ERROR] Usage: #profile <text>"),
                "help" => println!("[HELP]\n{HELP}"),
                _ => println!("[ERROR] Unknown command. Type #help for help."),
            }
            stdout.flush().ok();
            continue;
        }

        let (call_type, text) = parse_turn(line);
        send(&session, call_type, text).await;
    }

    Ok(())
}

/// Split an optional `[type]` prefix off a line.
fn parse_turn(line: &str) -> (CallType, &str) {
    line.strip_prefix('[')
        .and_then(|rest| rest.split_once(']'))
        .map(|(kind, text)| (CallType::from(kind), text.trim()))
        .unwrap_or((CallType::Narrative, line))
}

async fn send(session: &NarratorSession, call_type: CallType, text: &str) {
    let mut stdout = io::stdout();
    print!("[PROCESSING]");
    stdout.flush().ok();

    let result = session.submit(call_type, text).await;

    // Clear the processing indicator
    print!("\r            \r");
    stdout.flush().ok();

    match result {
        Ok(turn) => print_turn(&turn),
        Err(e) => println!("[ERROR] {e}"),
    }

    if let Ok(true) = session.try_with(|o| o.profile_due()) {
        println!("[PROFILE] Refresh due: send #profile <text>");
    }
}

fn print_turn(turn: &Turn) {
    println!("[NARRATOR]");
    for para in turn.narrative.split("\n\n") {
        println!("{para}");
    }
    println!();

    if turn.metadata.awaiting_roll {
        println!(
            "[ROLL] {} roll requested: reply with #roll <result>",
            turn.metadata.roll_type.as_deref().unwrap_or("a")
        );
    }
    if turn.attempts > 1 {
        println!("[ATTEMPTS] {} ({:?})", turn.attempts, turn.transitions);
    }
    if !turn.unresolved.is_empty() {
        let gaps: Vec<&str> = turn.unresolved.iter().map(|g| g.description.as_str()).collect();
        println!("[GAPS] {}", gaps.join("; "));
    }
}

fn print_status(session: &NarratorSession) -> Result<(), NarratorError> {
    session.try_with(|o| {
        let scene = o.scene();
        let sticky = o.sticky().snapshot();
        let totals = o.totals();
        println!("[STATUS]");
        println!("  Date: {}", or_unset(&scene.date));
        println!("  Location: {}", or_unset(&scene.location));
        println!(
            "  Loaded: {} characters, {} events, {} laws ({}/{} tokens)",
            sticky.character_ids.len(),
            sticky.event_ids.len(),
            sticky.law_ids.len(),
            sticky.estimated_tokens,
            sticky.budget
        );
        if let Some(roll) = &scene.pending_roll_type {
            println!("  Pending roll: {roll}");
        }
        println!(
            "  Turns: {}, calls: {} router / {} generation, cost: ${:.4}",
            totals.turns, totals.router_calls, totals.generation_calls, totals.cost_usd
        );
    })
}

fn or_unset(value: &str) -> &str {
    if value.is_empty() {
        "(unset)"
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_turn_prefix() {
        let (call_type, text) = parse_turn("[dialogue] Good morrow, Majesty");
        assert_eq!(call_type, CallType::Dialogue);
        assert_eq!(text, "Good morrow, Majesty");
    }

    #[test]
    fn test_parse_turn_plain() {
        let (call_type, text) = parse_turn("I look out of the window");
        assert_eq!(call_type, CallType::Narrative);
        assert_eq!(text, "I look out of the window");
    }
}
