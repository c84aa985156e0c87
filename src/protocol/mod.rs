//! KNXnet/IP protocol implementation.
//!
//! This module contains the wire codec for KNXnet/IP frames: the common
//! 6-octet header, host protocol address information (HPAI), and the service
//! structures exchanged by a client connection.

pub mod constants;
pub mod frame;
pub mod services;

pub use constants::*;
pub use frame::{Hpai, KnxnetIpFrame, KnxnetIpHeader};
pub use services::*;
