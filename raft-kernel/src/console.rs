//! Operator console command parsing.
//!
//! The console reads one command per line from stdin while the node runs.
//! Commands are case-insensitive and each has a one-letter alias.

use anyhow::{anyhow, Result};

pub const HELP: &str = "\
commands:
  STATUS (s)                 node id, role, term, last and committed key
  LOG (l)                    dump the in-memory log
  DELAY (d) <ms> [jitter]    delay outbound peer messages by ms + rand(0..=jitter)
  HELP (h)                   this text
  EXIT (e)                   stop the node";

#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Status,
    Log,
    Delay { ms: u64, jitter: u64 },
    Help,
    Exit,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Err(anyhow!("empty command"));
        };

        let cmd = first.to_uppercase();
        let normalized = match cmd.as_str() {
            "S" => "STATUS",
            "L" => "LOG",
            "D" => "DELAY",
            "H" => "HELP",
            "E" => "EXIT",
            other => other,
        };

        match (normalized, &parts[1..]) {
            ("STATUS", []) => Ok(ConsoleCommand::Status),
            ("LOG", []) => Ok(ConsoleCommand::Log),
            ("HELP", []) => Ok(ConsoleCommand::Help),
            ("EXIT", []) => Ok(ConsoleCommand::Exit),
            ("DELAY", [ms]) => Ok(ConsoleCommand::Delay {
                ms: parse_millis(ms)?,
                jitter: 0,
            }),
            ("DELAY", [ms, jitter]) => Ok(ConsoleCommand::Delay {
                ms: parse_millis(ms)?,
                jitter: parse_millis(jitter)?,
            }),
            ("DELAY", _) => Err(anyhow!("DELAY takes one or two arguments: DELAY <ms> [jitter]")),
            ("STATUS" | "LOG" | "HELP" | "EXIT", _) => {
                Err(anyhow!("{normalized} takes no arguments"))
            }
            _ => Err(anyhow!(
                "invalid command. Try: STATUS/s, LOG/l, DELAY/d <ms> [jitter], HELP/h, EXIT/e"
            )),
        }
    }
}

fn parse_millis(value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| anyhow!("expected milliseconds, got {value:?}"))
}
