//! Messages exchanged between the node loop and its collaborators.
//!
//! [`Message`] is the peer protocol record. [`Inbound`] and [`Outbound`] are
//! what the transport hands to and takes from the node loop, [`StoreOrder`]
//! goes to storage. On the wire every frame is one JSON [`Envelope`] per
//! line, written and read with [`write_message`] / [`read_message`].

use std::io;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::log::{LogKey, Term};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Cluster member id; also the member's position in the address list.
pub type NodeId = u64;

/// Transport-assigned id of a waiting client connection.
pub type ClientId = u64;

/// Closed set of peer protocol message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Heartbeat,
    AppendLog,
    AppendLogReply,
    Commit,
    Vote,
    VoteReply,
    PreVote,
    PreVoteReply,
}

/// Peer protocol message.
///
/// Field meaning depends on the kind. For `AppendLog` the pair
/// (`second_last_log_key`, `last_log_key`) is (previous key, proposed key).
/// A rejecting `AppendLogReply` carries the follower's tail in
/// `second_last_log_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub from: NodeId,
    pub to: Vec<NodeId>,
    pub term: Term,
    #[serde(default)]
    pub agree: bool,
    #[serde(default)]
    pub last_log_key: LogKey,
    #[serde(default)]
    pub second_last_log_key: LogKey,
    #[serde(default)]
    pub payload: String,
}

impl Message {
    pub fn new(kind: MessageType, from: NodeId, term: Term) -> Self {
        Self {
            kind,
            from,
            to: Vec::new(),
            term,
            agree: false,
            last_log_key: LogKey::NONE,
            second_last_log_key: LogKey::NONE,
            payload: String::new(),
        }
    }

    pub fn to(mut self, to: impl Into<Vec<NodeId>>) -> Self {
        self.to = to.into();
        self
    }

    pub fn agree(mut self, agree: bool) -> Self {
        self.agree = agree;
        self
    }

    pub fn keys(mut self, last: LogKey, second_last: LogKey) -> Self {
        self.last_log_key = last;
        self.second_last_log_key = second_last;
        self
    }

    pub fn last(mut self, last: LogKey) -> Self {
        self.last_log_key = last;
        self
    }

    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }
}

/// A client write as seen by the node loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientWrite {
    pub client: ClientId,
    /// The write must be replicated through the log before it is answered.
    pub sync: bool,
    pub payload: String,
}

/// Final answer to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientReply {
    pub client: ClientId,
    pub ok: bool,
    pub output: String,
}

impl ClientReply {
    pub fn ok(client: ClientId, output: impl Into<String>) -> Self {
        Self {
            client,
            ok: true,
            output: output.into(),
        }
    }

    pub fn failed(client: ClientId, output: impl Into<String>) -> Self {
        Self {
            client,
            ok: false,
            output: output.into(),
        }
    }
}

/// What the transport delivers into the node loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    FromNode(Message),
    FromClient(ClientWrite),
}

/// What the node loop hands to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Peer-directed protocol message; deliver to every id in `to` except the sender.
    NodeReply(Message),
    ClientReply(ClientReply),
}

/// Instructions for the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOrder {
    /// Rewrite the metadata file with this serialized `Meta`.
    Meta(String),
    /// Append the committed range `[start, end]` to the log file.
    Flush { start: LogKey, end: LogKey },
}

/// One line on the TCP wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    Node(Message),
    Client { sync: bool, payload: String },
    Reply(ClientReply),
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_schema_uses_documented_field_names() {
        let msg = Message::new(MessageType::AppendLog, 1, 4)
            .to(vec![0, 2])
            .keys(LogKey::new(4, 1), LogKey::new(4, 0))
            .payload("set a 1");
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "append_log");
        assert_eq!(json["from"], 1);
        assert_eq!(json["to"], serde_json::json!([0, 2]));
        assert_eq!(json["last_log_key"]["index"], 1);
        assert_eq!(json["second_last_log_key"]["term"], 4);
        assert_eq!(json["payload"], "set a 1");
    }

    #[test]
    fn missing_optional_fields_take_sentinels() {
        let msg: Message =
            serde_json::from_str(r#"{"type":"heartbeat","from":2,"to":[],"term":3}"#).unwrap();
        assert!(!msg.agree);
        assert_eq!(msg.last_log_key, LogKey::NONE);
        assert_eq!(msg.second_last_log_key, LogKey::NONE);
    }

    #[tokio::test]
    async fn envelope_travels_over_a_line_stream() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);
        let envelope = Envelope::Node(
            Message::new(MessageType::Commit, 0, 2).last(LogKey::new(2, 7)),
        );

        write_message(&mut writer, &envelope)
            .await
            .expect("write envelope");
        let parsed = read_message::<_, Envelope>(&mut reader)
            .await
            .expect("read envelope")
            .expect("expected envelope");

        assert_eq!(envelope, parsed);
    }
}
