//! # Core Framing Components
//!
//! Buffers, the USC envelope codec and session binding.
//!
//! ## Components
//! - **IoBuffer**: fixed-capacity byte region with in-place shifts
//! - **Envelope**: 8-byte USC header codec
//! - **Deframer**: receive-side envelope stripper
//!
//! ## Wire Format
//! ```text
//! [Ver|Op(1)] [Security(1)] [AppId(2)] [AppSession(2)] [Length(2)] [Payload(N)]
//! ```

pub mod buffer;
pub mod envelope;
pub mod session;
