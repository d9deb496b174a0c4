//! Whether physically contiguous blocks of one map output may be coalesced
//! into a single fetch request.

use crate::config;

/// The facts the decision is made from. All of them come straight from the
/// shuffle descriptor and the read configuration; nothing here does I/O.
#[derive(Debug, Clone, Copy)]
pub struct EligibilityInputs {
    pub batch_fetch_requested: bool,
    /// The record encoding survives relocation, so concatenated blocks decode
    /// like the concatenation of their records.
    pub serializer_relocatable: bool,
    pub compression_enabled: bool,
    /// The codec decodes concatenated streams as the concatenation of their
    /// contents. Irrelevant when compression is off.
    pub codec_concatenatable: bool,
    /// The old transfer protocol reports coalesced responses without
    /// per-block boundaries, which breaks accounting downstream.
    pub legacy_fetch_protocol: bool,
}

/// Coalescing is allowed only when requested, the serializer relocates, the
/// codec (if any) concatenates, and the transfer protocol is not the legacy
/// one. Conservative on every doubt: a wrong `false` costs performance, a
/// wrong `true` corrupts the stream.
pub fn batch_fetch_eligible(inputs: &EligibilityInputs) -> bool {
    let eligible = inputs.batch_fetch_requested
        && inputs.serializer_relocatable
        && (!inputs.compression_enabled || inputs.codec_concatenatable)
        && !inputs.legacy_fetch_protocol;
    if !eligible && inputs.batch_fetch_requested && config::verbose() {
        eprintln!(
            "contiguous block coalescing requested but disabled: {}",
            ineligibility_reason(inputs)
        );
    }
    eligible
}

fn ineligibility_reason(inputs: &EligibilityInputs) -> &'static str {
    if !inputs.serializer_relocatable {
        "serializer does not support relocation"
    } else if inputs.compression_enabled && !inputs.codec_concatenatable {
        "codec does not support stream concatenation"
    } else if inputs.legacy_fetch_protocol {
        "legacy fetch protocol has no per-block boundaries"
    } else {
        "not requested"
    }
}
