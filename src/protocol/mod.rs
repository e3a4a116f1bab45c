pub mod auth;
pub mod codec;
pub mod compress;
pub mod handshake;
pub mod packet;
pub mod wire;

pub use auth::AuthPlugin;
pub use codec::PayloadCodec;
pub use handshake::{
    is_auth_more_data, is_auth_switch, is_eof_packet, is_err_packet, is_ok_packet,
    AuthSwitchRequest, ErrPacket, HandshakeResponse, InitialHandshake, OkPacket,
};
pub use packet::{capabilities, Command, Packet, MAX_PACKET_SIZE, PACKET_HEADER_SIZE};
pub use wire::{LenEnc, PayloadReader, PayloadWriter};
