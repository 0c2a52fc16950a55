//! Identity codec: page codes, QR payloads and page classification.
//!
//! This crate provides:
//! - [`code`]: the `t0020p03v1` text form and the `extra`/`scrap` sentinels
//! - [`qr`]: fixed-width corner payloads with a check digit
//! - [`classify`]: the Known/Extra/Unknown/Collision/Discarded policy

pub mod classify;
pub mod code;
pub mod qr;

pub use classify::{SlotOccupant, Verdict, classify};
pub use code::{EXTRA_TEXT, PageCode, SCRAP_TEXT, Tpv};
pub use qr::{Corner, DecodedPayload, PAYLOAD_LEN, decode, decode_page, encode};
