//! SPS/PPS cache and the decoder configuration built from it.

use bytes::Bytes;
use h264_reader::nal::sps::SeqParameterSet;
use h264_reader::rbsp;
use std::fmt;

use super::nal::{self, START_CODE};

/// Codec-specific data handed to the decoder at configure time.
///
/// Both parameter sets keep a 4-byte Annex-B start code.
#[derive(Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    sps: Bytes,
    pps: Bytes,
}

impl DecoderConfig {
    /// Build from start-code-stripped SPS and PPS payloads.
    pub fn new(sps: &[u8], pps: &[u8]) -> Self {
        DecoderConfig {
            sps: nal::with_start_code(sps),
            pps: nal::with_start_code(pps),
        }
    }

    /// SPS with start code.
    pub fn sps(&self) -> &Bytes {
        &self.sps
    }

    /// PPS with start code.
    pub fn pps(&self) -> &Bytes {
        &self.pps
    }

    /// SPS followed by PPS, as one Annex-B blob.
    pub fn annex_b(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.sps.len() + self.pps.len());
        out.extend_from_slice(&self.sps);
        out.extend_from_slice(&self.pps);
        out
    }

    fn sps_nal(&self) -> &[u8] {
        &self.sps[START_CODE.len()..]
    }

    /// `profile_idc` from the SPS, if present.
    pub fn profile_idc(&self) -> Option<u8> {
        self.sps_nal().get(1).copied()
    }

    /// `level_idc` from the SPS, if present.
    pub fn level_idc(&self) -> Option<u8> {
        self.sps_nal().get(3).copied()
    }

    /// RFC 6381 codec string, e.g. `avc1.42C01F`.
    pub fn codec_string(&self) -> Option<String> {
        let constraints = self.sps_nal().get(2)?;
        Some(format!(
            "avc1.{:02X}{:02X}{:02X}",
            self.profile_idc()?,
            constraints,
            self.level_idc()?
        ))
    }

    /// Cropped picture dimensions decoded from the SPS.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        let rbsp = rbsp::decode_nal(self.sps_nal()).ok()?;
        let sps = SeqParameterSet::from_bits(rbsp::BitReader::new(&*rbsp)).ok()?;
        sps.pixel_dimensions().ok()
    }
}

impl fmt::Debug for DecoderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderConfig")
            .field("sps_len", &self.sps.len())
            .field("pps_len", &self.pps.len())
            .field("codec", &self.codec_string())
            .finish()
    }
}

/// Parameter sets seen so far on the stream.
///
/// Starts `Pending` and becomes `Complete` once both an SPS and a PPS have
/// arrived. Later parameter sets replace the matching half of the config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterSets {
    Pending { sps: Option<Bytes>, pps: Option<Bytes> },
    Complete(DecoderConfig),
}

impl Default for ParameterSets {
    fn default() -> Self {
        ParameterSets::Pending {
            sps: None,
            pps: None,
        }
    }
}

impl ParameterSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an SPS payload (start code stripped).
    pub fn update_sps(&mut self, payload: Bytes) -> Option<&DecoderConfig> {
        let next = match std::mem::take(self) {
            ParameterSets::Pending { pps: Some(pps), .. } => {
                ParameterSets::Complete(DecoderConfig::new(&payload, &pps))
            }
            ParameterSets::Pending { pps: None, .. } => ParameterSets::Pending {
                sps: Some(payload),
                pps: None,
            },
            ParameterSets::Complete(config) => ParameterSets::Complete(DecoderConfig {
                sps: nal::with_start_code(&payload),
                pps: config.pps,
            }),
        };
        *self = next;
        self.config()
    }

    /// Record a PPS payload (start code stripped).
    pub fn update_pps(&mut self, payload: Bytes) -> Option<&DecoderConfig> {
        let next = match std::mem::take(self) {
            ParameterSets::Pending { sps: Some(sps), .. } => {
                ParameterSets::Complete(DecoderConfig::new(&sps, &payload))
            }
            ParameterSets::Pending { sps: None, .. } => ParameterSets::Pending {
                sps: None,
                pps: Some(payload),
            },
            ParameterSets::Complete(config) => ParameterSets::Complete(DecoderConfig {
                sps: config.sps,
                pps: nal::with_start_code(&payload),
            }),
        };
        *self = next;
        self.config()
    }

    /// The complete configuration, once both halves are known.
    pub fn config(&self) -> Option<&DecoderConfig> {
        match self {
            ParameterSets::Complete(config) => Some(config),
            ParameterSets::Pending { .. } => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, ParameterSets::Complete(_))
    }
}
