//! coregrid-proto — wire protocol for the coregrid workload manager.
//!
//! # Components
//!
//! - **`version`**: Protocol versions and negotiation
//! - **`pack`**: Big-endian pack/unpack primitives
//! - **`header`**: Message header, framing and the `Message` trait
//! - **`acct`**: Accounting records in the vector and fixed-id layouts
//! - **`alloc_info`**: Allocation-info request
//! - **`registration`**: Node registration status
//! - **`step_stat`**: Step statistics response

pub mod acct;
pub mod alloc_info;
pub mod error;
pub mod header;
pub mod pack;
pub mod registration;
pub mod step_stat;
pub mod version;

pub use acct::{LEGACY_TRES, decode_acct, encode_acct};
pub use alloc_info::AllocInfoRequest;
pub use error::{ProtoError, ProtoResult};
pub use header::{Header, HeaderFlags, Message, MessageType, decode_message, encode_message, frame, unframe};
pub use pack::{Packer, Unpacker};
pub use registration::{NodeRegistration, RunningStep};
pub use step_stat::StepStatResponse;
pub use version::ProtocolVersion;
