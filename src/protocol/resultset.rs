use bytes::{BufMut, Bytes, BytesMut};

use super::handshake::{put_lenenc_int, put_lenenc_str, read_lenenc_str, EofPacket};
use super::packet::{status, Packet};

/// MYSQL_TYPE_VAR_STRING
const TYPE_VAR_STRING: u8 = 0xFD;

/// Column count packet that starts a result set
pub fn column_count(sequence_id: u8, count: u64) -> Packet {
    let mut buf = BytesMut::with_capacity(9);
    put_lenenc_int(&mut buf, count);
    Packet::new(sequence_id, buf.freeze())
}

/// Protocol 4.1 column definition for a VARCHAR column
pub fn column_definition(sequence_id: u8, schema: &str, table: &str, name: &str) -> Packet {
    let mut buf = BytesMut::new();
    put_lenenc_str(&mut buf, b"def");
    put_lenenc_str(&mut buf, schema.as_bytes());
    put_lenenc_str(&mut buf, table.as_bytes());
    put_lenenc_str(&mut buf, table.as_bytes());
    put_lenenc_str(&mut buf, name.as_bytes());
    put_lenenc_str(&mut buf, name.as_bytes());
    buf.put_u8(0x0C);
    buf.put_u16_le(0x21); // utf8_general_ci
    buf.put_u32_le(256);
    buf.put_u8(TYPE_VAR_STRING);
    buf.put_u16_le(0); // flags
    buf.put_u8(0); // decimals
    buf.put_u16_le(0); // filler
    Packet::new(sequence_id, buf.freeze())
}

/// Text protocol row, `None` encodes SQL NULL
pub fn text_row(sequence_id: u8, values: &[Option<&str>]) -> Packet {
    let mut buf = BytesMut::new();
    for value in values {
        match value {
            Some(v) => put_lenenc_str(&mut buf, v.as_bytes()),
            None => buf.put_u8(0xFB),
        }
    }
    Packet::new(sequence_id, buf.freeze())
}

/// Parse a text protocol row into its column values
pub fn parse_text_row(payload: &[u8]) -> Option<Vec<Option<Bytes>>> {
    let mut buf = payload;
    let mut values = Vec::new();
    while !buf.is_empty() {
        values.push(read_lenenc_str(&mut buf)?);
    }
    Some(values)
}

/// Build a complete single-column text result set starting at `first_seq`
pub fn single_column_resultset(first_seq: u8, column: &str, rows: &[String]) -> Vec<Packet> {
    let mut seq = first_seq;
    let mut next = || {
        let s = seq;
        seq = seq.wrapping_add(1);
        s
    };

    let mut packets = Vec::with_capacity(rows.len() + 4);
    packets.push(column_count(next(), 1));
    packets.push(column_definition(next(), "", "", column));
    packets.push(EofPacket::new(status::SERVER_STATUS_AUTOCOMMIT).encode(next()));
    for row in rows {
        packets.push(text_row(next(), &[Some(row.as_str())]));
    }
    packets.push(EofPacket::new(status::SERVER_STATUS_AUTOCOMMIT).encode(next()));
    packets
}
