pub mod control_messages;
pub mod ip_packet;
pub mod wire_header;
