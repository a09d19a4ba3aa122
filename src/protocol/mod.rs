pub mod codec;
pub mod command;
pub mod handshake;
pub mod packet;
pub mod reply;
pub mod resultset;

pub use codec::{CodecError, PacketCodec};
pub use command::ClientCommand;
pub use handshake::{
    check_native_token, compute_auth_response, is_eof_packet, is_err_packet, is_ok_packet,
    is_ssl_request, native_token_from_sha1, new_scramble, password_double_sha1, password_sha1,
    AuthSwitchRequest, ChangeUserRequest, EofPacket, ErrPacket, HandshakeResponse,
    InitialHandshake, OkPacket, CLEAR_PASSWORD_PLUGIN, DIALOG_PLUGIN, NATIVE_PASSWORD_PLUGIN,
    SCRAMBLE_LEN,
};
pub use packet::{capabilities, status, Command, Packet, MAX_PACKET_SIZE};
pub use reply::{PacketKind, Reply, ReplyState, ReplyTracker};
