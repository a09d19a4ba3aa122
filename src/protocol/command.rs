use bytes::{Buf, Bytes};

use super::packet::Command;

/// Parsed command from client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Query(String),
    InitDb(String),
    Quit,
    Ping,
    ChangeUser,
    ProcessKill(u32),
    FieldList { table: String, wildcard: String },
    Other(Command),
}

impl ClientCommand {
    /// Parse command from packet payload
    pub fn parse(payload: &Bytes) -> Self {
        let Some(&first) = payload.first() else {
            return ClientCommand::Other(Command::Unknown);
        };

        let cmd = Command::from(first);
        let data = &payload[1..];

        match cmd {
            Command::Query => ClientCommand::Query(String::from_utf8_lossy(data).to_string()),
            Command::InitDb => ClientCommand::InitDb(String::from_utf8_lossy(data).to_string()),
            Command::Quit => ClientCommand::Quit,
            Command::Ping => ClientCommand::Ping,
            Command::ChangeUser => ClientCommand::ChangeUser,
            Command::ProcessKill if data.len() >= 4 => {
                let mut buf = data;
                ClientCommand::ProcessKill(buf.get_u32_le())
            }
            Command::FieldList => {
                // Table name is null-terminated, followed by optional wildcard
                let null_pos = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                let table = String::from_utf8_lossy(&data[..null_pos]).to_string();
                let wildcard = if null_pos + 1 < data.len() {
                    String::from_utf8_lossy(&data[null_pos + 1..]).to_string()
                } else {
                    String::new()
                };
                ClientCommand::FieldList { table, wildcard }
            }
            other => ClientCommand::Other(other),
        }
    }

    /// Raw command byte of this command
    pub fn command(&self) -> Command {
        match self {
            ClientCommand::Query(_) => Command::Query,
            ClientCommand::InitDb(_) => Command::InitDb,
            ClientCommand::Quit => Command::Quit,
            ClientCommand::Ping => Command::Ping,
            ClientCommand::ChangeUser => Command::ChangeUser,
            ClientCommand::ProcessKill(_) => Command::ProcessKill,
            ClientCommand::FieldList { .. } => Command::FieldList,
            ClientCommand::Other(cmd) => *cmd,
        }
    }
}
