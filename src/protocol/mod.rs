pub mod codec;
pub mod handshake;
pub mod packet;

pub use codec::PacketCodec;
pub use handshake::{
    compute_auth_response, is_eof_packet, is_err_packet, is_local_infile_packet, is_ok_packet,
    ok_status_flags, ErrPacket, HandshakeResponse, InitialHandshake, OkPacket,
};
pub use packet::{
    capabilities, is_multi_statement, parse_length_encoded_int, status, Command, Packet,
};
