//! # Annex-B Reassembly and Parameter Sets
//!
//! Turns an arbitrarily chunked H.264 byte stream back into NAL units,
//! classifies them, and keeps the SPS/PPS pair the decoder needs before it
//! can start.

pub mod nal;
pub mod params;
pub mod reassembler;
