//! JSON-lines command/status protocol between the master and device modules.

pub mod codec;
pub mod server;

pub use codec::{
    decode_command, decode_status, encode_line, salvage_command_id, CommandMessage, DecodeError,
    StatusMessage,
};
pub use server::{CommandServer, StatusSender, StatusWriter};
