//! KNX addressing types.
//!
//! Only the individual (physical) address is needed by the connection engine:
//! a tunneling server assigns one for the lifetime of the session.

pub mod individual;

pub use individual::IndividualAddress;
