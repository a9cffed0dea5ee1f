//! This module contains utilities for testing code that works with raw datagrams and paths. They
//!  are used for testing the protocol engine itself, but they are also exported for testing
//!  applications that plug in their own packet sources or path senders.

pub mod packet;
pub mod path_sender;
pub mod packet_source;
