//! Backend reply tracking
//!
//! A [`ReplyTracker`] follows the packets a backend sends for the commands
//! written to it and knows when a reply is complete. Routers never inspect
//! raw packets to find the end of a result set; they ask the [`Reply`].

use std::collections::VecDeque;

use super::handshake::{is_eof_packet, read_lenenc_int, EofPacket, ErrPacket, OkPacket};
use super::packet::{capabilities::CLIENT_PROTOCOL_41, status, Command, Packet};

/// How far a reply has progressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    /// Waiting for the first packet of a (possibly next) result
    Start,
    /// Reply is complete
    Done,
    /// Reading column definitions
    RsetColDef,
    /// Column definitions read, waiting for their EOF
    RsetColDefEof,
    /// Reading rows
    RsetRows,
    /// Reading parameter and column definitions of a prepared statement
    Prepare,
    /// Server requested a LOCAL INFILE upload
    LoadData,
}

/// What the last processed packet was
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Ok,
    Err,
    Eof,
    ColumnCount,
    ColumnDef,
    ColumnDefEof,
    Row,
    LocalInfile,
    PrepareOk,
    Other,
}

/// State of the reply to one command
#[derive(Debug, Clone)]
pub struct Reply {
    command: Command,
    state: ReplyState,
    last_kind: PacketKind,
    error: Option<ErrPacket>,
    field_count: u64,
    defs_left: u64,
    prepare_groups: Vec<u64>,
    rows_read: u64,
    result_sets: u32,
    server_status: u16,
    packets: u64,
    bytes: u64,
}

impl Reply {
    fn new(command: Command) -> Self {
        Self {
            command,
            state: if command.expects_reply() {
                ReplyState::Start
            } else {
                ReplyState::Done
            },
            last_kind: PacketKind::Other,
            error: None,
            field_count: 0,
            defs_left: 0,
            prepare_groups: Vec::new(),
            rows_read: 0,
            result_sets: 0,
            server_status: 0,
            packets: 0,
            bytes: 0,
        }
    }

    fn idle() -> Self {
        let mut reply = Self::new(Command::Sleep);
        reply.state = ReplyState::Done;
        reply
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn state(&self) -> ReplyState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == ReplyState::Done
    }

    /// Kind of the packet that was processed last
    pub fn last_kind(&self) -> PacketKind {
        self.last_kind
    }

    pub fn error(&self) -> Option<&ErrPacket> {
        self.error.as_ref()
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    pub fn field_count(&self) -> u64 {
        self.field_count
    }

    /// Number of completed result sets (multi-statement replies have several)
    pub fn result_sets(&self) -> u32 {
        self.result_sets
    }

    /// Status flags of the last OK or EOF packet
    pub fn server_status(&self) -> u16 {
        self.server_status
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    fn process(&mut self, packet: &Packet) {
        let payload = &packet.payload[..];
        self.packets += 1;
        self.bytes += payload.len() as u64;

        match self.state {
            ReplyState::Start => self.process_first(payload),
            ReplyState::RsetColDef => {
                self.last_kind = PacketKind::ColumnDef;
                self.defs_left = self.defs_left.saturating_sub(1);
                if self.defs_left == 0 {
                    self.state = ReplyState::RsetColDefEof;
                }
            }
            ReplyState::RsetColDefEof => {
                if is_eof_packet(payload) {
                    self.last_kind = PacketKind::ColumnDefEof;
                    self.state = ReplyState::RsetRows;
                } else {
                    // Backend skipped the EOF; this is already a row
                    self.state = ReplyState::RsetRows;
                    self.process_row(payload);
                }
            }
            ReplyState::RsetRows => self.process_row(payload),
            ReplyState::Prepare => {
                let done_group = match self.prepare_groups.first_mut() {
                    Some(left) if *left > 0 => {
                        *left -= 1;
                        self.last_kind = PacketKind::ColumnDef;
                        false
                    }
                    _ => {
                        self.last_kind = PacketKind::ColumnDefEof;
                        true
                    }
                };
                if done_group {
                    self.prepare_groups.remove(0);
                }
                if self.prepare_groups.is_empty() {
                    self.state = ReplyState::Done;
                }
            }
            ReplyState::LoadData | ReplyState::Done => {
                self.last_kind = PacketKind::Other;
            }
        }
    }

    fn process_first(&mut self, payload: &[u8]) {
        let Some(&first) = payload.first() else {
            self.last_kind = PacketKind::Other;
            self.state = ReplyState::Done;
            return;
        };

        if first == 0xFF {
            self.last_kind = PacketKind::Err;
            self.error = ErrPacket::parse(payload, CLIENT_PROTOCOL_41);
            self.state = ReplyState::Done;
            return;
        }

        match self.command {
            Command::Statistics => {
                self.last_kind = PacketKind::Other;
                self.state = ReplyState::Done;
            }
            Command::FieldList => {
                if is_eof_packet(payload) {
                    self.last_kind = PacketKind::Eof;
                    if let Some(eof) = EofPacket::parse(payload) {
                        self.server_status = eof.status_flags;
                    }
                    self.state = ReplyState::Done;
                } else {
                    self.last_kind = PacketKind::ColumnDef;
                }
            }
            Command::StmtPrepare if first == 0x00 && payload.len() >= 9 => {
                self.last_kind = PacketKind::PrepareOk;
                let columns = u16::from_le_bytes([payload[5], payload[6]]) as u64;
                let params = u16::from_le_bytes([payload[7], payload[8]]) as u64;
                self.prepare_groups = [params, columns].into_iter().filter(|&n| n > 0).collect();
                self.state = if self.prepare_groups.is_empty() {
                    ReplyState::Done
                } else {
                    ReplyState::Prepare
                };
            }
            _ if first == 0x00 => {
                self.last_kind = PacketKind::Ok;
                if let Some(ok) = OkPacket::parse(payload) {
                    self.server_status = ok.status_flags;
                }
                self.finish_result();
            }
            _ if first == 0xFB => {
                self.last_kind = PacketKind::LocalInfile;
                self.state = ReplyState::LoadData;
            }
            _ => {
                let mut buf = payload;
                self.last_kind = PacketKind::ColumnCount;
                self.field_count = read_lenenc_int(&mut buf).unwrap_or(0);
                self.defs_left = self.field_count;
                self.state = if self.field_count == 0 {
                    ReplyState::RsetColDefEof
                } else {
                    ReplyState::RsetColDef
                };
            }
        }
    }

    fn process_row(&mut self, payload: &[u8]) {
        if is_eof_packet(payload) {
            self.last_kind = PacketKind::Eof;
            if let Some(eof) = EofPacket::parse(payload) {
                self.server_status = eof.status_flags;
            }
            self.finish_result();
        } else if payload.first() == Some(&0xFF) {
            self.last_kind = PacketKind::Err;
            self.error = ErrPacket::parse(payload, CLIENT_PROTOCOL_41);
            self.state = ReplyState::Done;
        } else {
            self.last_kind = PacketKind::Row;
            self.rows_read += 1;
        }
    }

    fn finish_result(&mut self) {
        self.result_sets += 1;
        self.state = if self.server_status & status::SERVER_MORE_RESULTS_EXIST != 0 {
            ReplyState::Start
        } else {
            ReplyState::Done
        };
    }
}

/// Follows the replies of one backend connection
#[derive(Debug)]
pub struct ReplyTracker {
    current: Reply,
    pending: VecDeque<Command>,
}

impl Default for ReplyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyTracker {
    pub fn new() -> Self {
        Self {
            current: Reply::idle(),
            pending: VecDeque::new(),
        }
    }

    /// Record a packet written to the backend
    pub fn on_write(&mut self, packet: &Packet) {
        if self.current.state == ReplyState::LoadData {
            // Raw file data; the empty packet ends the upload
            if packet.payload.is_empty() {
                self.current.state = ReplyState::Start;
            }
            return;
        }

        let command = packet.command_byte().map(Command::from).unwrap_or(Command::Unknown);
        if !command.expects_reply() {
            return;
        }

        if self.current.is_complete() && self.pending.is_empty() {
            self.current = Reply::new(command);
        } else {
            self.pending.push_back(command);
        }
    }

    /// Process a packet read from the backend
    pub fn on_read(&mut self, packet: &Packet) -> &Reply {
        if self.current.is_complete() {
            if let Some(command) = self.pending.pop_front() {
                self.current = Reply::new(command);
            }
        }
        self.current.process(packet);
        &self.current
    }

    pub fn reply(&self) -> &Reply {
        &self.current
    }

    /// True when no reply is outstanding
    pub fn is_idle(&self) -> bool {
        self.current.is_complete() && self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::resultset::{column_definition, text_row};

    fn query(sql: &str) -> Packet {
        let mut payload = vec![0x03];
        payload.extend_from_slice(sql.as_bytes());
        Packet::new(0, payload)
    }

    fn eof(status_flags: u16) -> Packet {
        EofPacket::new(status_flags).encode(0)
    }

    #[test]
    fn test_ok_reply() {
        let mut tracker = ReplyTracker::new();
        tracker.on_write(&query("INSERT INTO t VALUES (1)"));
        assert!(!tracker.is_idle());

        let ok = OkPacket::new().encode(1, CLIENT_PROTOCOL_41);
        let reply = tracker.on_read(&ok);
        assert!(reply.is_complete());
        assert!(reply.is_ok());
        assert_eq!(reply.last_kind(), PacketKind::Ok);
        assert!(tracker.is_idle());
    }

    #[test]
    fn test_err_reply() {
        let mut tracker = ReplyTracker::new();
        tracker.on_write(&query("SELECT nope"));
        let err = ErrPacket::new(1054, "42S22", "Unknown column").encode(1, CLIENT_PROTOCOL_41);
        let reply = tracker.on_read(&err);
        assert!(reply.is_complete());
        assert_eq!(reply.error().map(|e| e.error_code), Some(1054));
    }

    #[test]
    fn test_resultset_reply() {
        let mut tracker = ReplyTracker::new();
        tracker.on_write(&query("SELECT a, b FROM t"));

        assert_eq!(tracker.on_read(&Packet::new(1, vec![2])).state(), ReplyState::RsetColDef);
        tracker.on_read(&column_definition(2, "", "t", "a"));
        let reply = tracker.on_read(&column_definition(3, "", "t", "b"));
        assert_eq!(reply.state(), ReplyState::RsetColDefEof);

        let reply = tracker.on_read(&eof(0));
        assert_eq!(reply.last_kind(), PacketKind::ColumnDefEof);
        assert_eq!(reply.state(), ReplyState::RsetRows);

        let reply = tracker.on_read(&text_row(5, &[Some("1"), None]));
        assert_eq!(reply.last_kind(), PacketKind::Row);

        let reply = tracker.on_read(&eof(status::SERVER_STATUS_AUTOCOMMIT));
        assert!(reply.is_complete());
        assert_eq!(reply.rows_read(), 1);
        assert_eq!(reply.field_count(), 2);
    }

    #[test]
    fn test_multi_result_reply() {
        let mut tracker = ReplyTracker::new();
        tracker.on_write(&query("CALL p()"));

        let more = OkPacket::new().with_status(status::SERVER_MORE_RESULTS_EXIST);
        let reply = tracker.on_read(&more.encode(1, CLIENT_PROTOCOL_41));
        assert!(!reply.is_complete());
        assert_eq!(reply.state(), ReplyState::Start);

        let reply = tracker.on_read(&OkPacket::new().encode(2, CLIENT_PROTOCOL_41));
        assert!(reply.is_complete());
        assert_eq!(reply.result_sets(), 2);
    }

    #[test]
    fn test_load_data_reply() {
        let mut tracker = ReplyTracker::new();
        tracker.on_write(&query("LOAD DATA LOCAL INFILE 'x' INTO TABLE t"));

        let reply = tracker.on_read(&Packet::new(1, b"\xFBx".to_vec()));
        assert_eq!(reply.state(), ReplyState::LoadData);

        tracker.on_write(&Packet::new(2, b"1,2\n".to_vec()));
        assert_eq!(tracker.reply().state(), ReplyState::LoadData);
        tracker.on_write(&Packet::new(3, Vec::new()));
        assert_eq!(tracker.reply().state(), ReplyState::Start);

        let reply = tracker.on_read(&OkPacket::new().encode(4, CLIENT_PROTOCOL_41));
        assert!(reply.is_complete());
    }

    #[test]
    fn test_field_list_single_eof() {
        let mut tracker = ReplyTracker::new();
        tracker.on_write(&Packet::new(0, b"\x04t\0".to_vec()));
        tracker.on_read(&column_definition(1, "", "t", "a"));
        let reply = tracker.on_read(&eof(0));
        assert!(reply.is_complete());
    }

    #[test]
    fn test_prepare_reply() {
        let mut tracker = ReplyTracker::new();
        tracker.on_write(&Packet::new(0, b"\x16SELECT ? FROM t".to_vec()));

        // stmt id 1, 1 column, 1 param
        let prepare_ok = Packet::new(1, vec![0x00, 1, 0, 0, 0, 1, 0, 1, 0, 0, 0, 0]);
        assert_eq!(tracker.on_read(&prepare_ok).state(), ReplyState::Prepare);
        tracker.on_read(&column_definition(2, "", "", "?"));
        tracker.on_read(&eof(0));
        tracker.on_read(&column_definition(4, "", "t", "a"));
        let reply = tracker.on_read(&eof(0));
        assert!(reply.is_complete());
    }

    #[test]
    fn test_pipelined_commands() {
        let mut tracker = ReplyTracker::new();
        tracker.on_write(&query("SET a=1"));
        tracker.on_write(&query("SET b=1"));
        // Commands without a reply are not tracked
        tracker.on_write(&Packet::new(0, vec![0x19, 1, 0, 0, 0]));

        assert!(tracker.on_read(&OkPacket::new().encode(1, CLIENT_PROTOCOL_41)).is_complete());
        assert!(!tracker.is_idle());
        assert!(tracker.on_read(&OkPacket::new().encode(1, CLIENT_PROTOCOL_41)).is_complete());
        assert!(tracker.is_idle());
    }
}
