//! The replicated application and the task that drives it.
//!
//! The node loop never calls the application directly. It sends
//! [`AppRequest`]s over a channel and, for client-originated requests, gets
//! an [`AppResponse`] back through another one.

use std::collections::BTreeMap;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::message::ClientId;

/// Result of running one command against the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppOutcome {
    pub output: String,
    pub accepted: bool,
}

impl AppOutcome {
    pub fn accepted(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            accepted: true,
        }
    }

    pub fn rejected(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            accepted: false,
        }
    }
}

/// A deterministic state machine fed by the log.
///
/// `undo` is called with the same payload that `process` saw, newest first,
/// when a replicated entry is truncated away.
pub trait Application: Send + 'static {
    fn process(&mut self, input: &str) -> AppOutcome;
    fn undo(&mut self, input: &str) -> AppOutcome;
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppAction {
    Apply,
    Undo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppRequest {
    /// Set when a client is waiting for the outcome.
    pub client: Option<ClientId>,
    pub need_sync: bool,
    pub action: AppAction,
    pub payload: String,
}

impl AppRequest {
    /// A client write; the outcome goes back to the node loop.
    pub fn for_client(client: ClientId, need_sync: bool, payload: impl Into<String>) -> Self {
        Self {
            client: Some(client),
            need_sync,
            action: AppAction::Apply,
            payload: payload.into(),
        }
    }

    /// An entry replicated from the leader; nobody waits for it.
    pub fn replicated(payload: impl Into<String>) -> Self {
        Self {
            client: None,
            need_sync: false,
            action: AppAction::Apply,
            payload: payload.into(),
        }
    }

    pub fn undo(payload: impl Into<String>) -> Self {
        Self {
            client: None,
            need_sync: false,
            action: AppAction::Undo,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppResponse {
    pub client: ClientId,
    pub need_sync: bool,
    pub output: String,
    pub accepted: bool,
}

/// Runs `app` until the request channel closes.
pub fn spawn_application<A: Application>(
    mut app: A,
    mut requests: UnboundedReceiver<AppRequest>,
    responses: UnboundedSender<AppResponse>,
) -> JoinHandle<A> {
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            let outcome = match request.action {
                AppAction::Apply => app.process(&request.payload),
                AppAction::Undo => app.undo(&request.payload),
            };
            debug!(
                action = ?request.action,
                payload = %request.payload,
                accepted = outcome.accepted,
                "application handled request"
            );

            let Some(client) = request.client else {
                if !outcome.accepted {
                    warn!(payload = %request.payload, output = %outcome.output, "replicated command rejected");
                }
                continue;
            };
            let response = AppResponse {
                client,
                need_sync: request.need_sync,
                output: outcome.output,
                accepted: outcome.accepted,
            };
            if responses.send(response).is_err() {
                break;
            }
        }
        app
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum KvCommand<'a> {
    Set { key: &'a str, value: &'a str },
    Get { key: &'a str },
    Del { key: &'a str },
}

impl<'a> KvCommand<'a> {
    fn parse(input: &'a str) -> Result<Self, String> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        match *parts.as_slice() {
            [cmd, key, value] if cmd.eq_ignore_ascii_case("set") => Ok(Self::Set { key, value }),
            [cmd, key] if cmd.eq_ignore_ascii_case("get") => Ok(Self::Get { key }),
            [cmd, key] if cmd.eq_ignore_ascii_case("del") => Ok(Self::Del { key }),
            _ => Err(format!(
                "invalid command {input:?}. Try: set <key> <value>, get <key>, del <key>"
            )),
        }
    }
}

/// Key-value application with `set`, `get` and `del`.
///
/// Every accepted mutation pushes the value it replaced onto a journal so
/// that `undo` can put it back.
#[derive(Debug, Default)]
pub struct KvStore {
    data: BTreeMap<String, String>,
    journal: Vec<(String, Option<String>)>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }
}

impl Application for KvStore {
    fn process(&mut self, input: &str) -> AppOutcome {
        match KvCommand::parse(input) {
            Ok(KvCommand::Set { key, value }) => {
                let old = self.data.insert(key.to_string(), value.to_string());
                self.journal.push((key.to_string(), old));
                AppOutcome::accepted(format!("{key} = {value}"))
            }
            Ok(KvCommand::Get { key }) => match self.get(key) {
                Some(value) => AppOutcome::accepted(value),
                None => AppOutcome::accepted(format!("{key} not found")),
            },
            Ok(KvCommand::Del { key }) => {
                let old = self.data.remove(key);
                let output = match &old {
                    Some(_) => format!("{key} deleted"),
                    None => format!("{key} not found"),
                };
                self.journal.push((key.to_string(), old));
                AppOutcome::accepted(output)
            }
            Err(msg) => AppOutcome::rejected(msg),
        }
    }

    fn undo(&mut self, input: &str) -> AppOutcome {
        match KvCommand::parse(input) {
            Ok(KvCommand::Get { .. }) => AppOutcome::accepted("nothing to undo"),
            Ok(KvCommand::Set { key, .. }) | Ok(KvCommand::Del { key }) => {
                let Some(pos) = self.journal.iter().rposition(|(k, _)| k == key) else {
                    return AppOutcome::rejected(format!("no journal entry for {key}"));
                };
                let (_, previous) = self.journal.remove(pos);
                match previous {
                    Some(value) => {
                        self.data.insert(key.to_string(), value.clone());
                        AppOutcome::accepted(format!("{key} restored to {value}"))
                    }
                    None => {
                        self.data.remove(key);
                        AppOutcome::accepted(format!("{key} removed"))
                    }
                }
            }
            Err(msg) => AppOutcome::rejected(msg),
        }
    }

    fn describe(&self) -> String {
        if self.data.is_empty() {
            return "(empty)".to_string();
        }
        self.data
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_del() {
        let mut kv = KvStore::new();
        assert_eq!(kv.process("set a 1"), AppOutcome::accepted("a = 1"));
        assert_eq!(kv.process("GET a"), AppOutcome::accepted("1"));
        assert_eq!(kv.process("del a"), AppOutcome::accepted("a deleted"));
        assert_eq!(kv.get("a"), None);
    }

    #[test]
    fn malformed_commands_are_rejected() {
        let mut kv = KvStore::new();
        assert!(!kv.process("").accepted);
        assert!(!kv.process("set a").accepted);
        assert!(!kv.process("put a 1").accepted);
        assert_eq!(kv.describe(), "(empty)");
    }

    #[test]
    fn undo_newest_first_restores_state() {
        let mut kv = KvStore::new();
        kv.process("set a 1");
        kv.process("set a 2");
        kv.process("del a");
        kv.process("set b 7");

        kv.undo("set b 7");
        kv.undo("del a");
        assert_eq!(kv.get("a"), Some("2"));
        assert_eq!(kv.get("b"), None);

        kv.undo("set a 2");
        assert_eq!(kv.get("a"), Some("1"));
        kv.undo("set a 1");
        assert_eq!(kv.describe(), "(empty)");
    }

    #[test]
    fn undo_without_history_is_rejected() {
        let mut kv = KvStore::new();
        assert!(!kv.undo("set a 1").accepted);
        assert!(kv.undo("get a").accepted);
    }

    #[tokio::test]
    async fn task_replies_only_to_clients() {
        let (req_tx, req_rx) = tokio::sync::mpsc::unbounded_channel();
        let (resp_tx, mut resp_rx) = tokio::sync::mpsc::unbounded_channel();
        let task = spawn_application(KvStore::new(), req_rx, resp_tx);

        req_tx.send(AppRequest::replicated("set a 1")).unwrap();
        req_tx.send(AppRequest::for_client(4, true, "get a")).unwrap();
        drop(req_tx);

        let response = resp_rx.recv().await.expect("client response");
        assert_eq!(
            response,
            AppResponse {
                client: 4,
                need_sync: true,
                output: "1".to_string(),
                accepted: true,
            }
        );

        let kv = task.await.unwrap();
        assert_eq!(kv.get("a"), Some("1"));
        assert!(resp_rx.recv().await.is_none());
    }
}
