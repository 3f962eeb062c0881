use crate::model::config::{Generation, ModelConfig, SourceCount};

/// Stem identifiers for source separation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StemId {
    Drums,
    Bass,
    Other,
    Vocals,
    Guitar,
    Piano,
}

impl StemId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StemId::Drums => "drums",
            StemId::Bass => "bass",
            StemId::Other => "other",
            StemId::Vocals => "vocals",
            StemId::Guitar => "guitar",
            StemId::Piano => "piano",
        }
    }
}

/// A known pretrained checkpoint.
#[derive(Debug)]
pub struct ModelInfo {
    pub id: &'static str,
    pub generation: Generation,
    /// Output order of the final decoders.
    pub stems: &'static [StemId],
    /// Safetensors key prefix of the weights, empty for unprefixed files.
    pub signature: &'static str,
    /// Checkpoint sections served by an external bottleneck, skipped on load.
    pub external_prefixes: &'static [&'static str],
}

impl ModelInfo {
    pub fn config(&self) -> Option<ModelConfig> {
        let sources = SourceCount::from_count(self.stems.len())?;
        Some(ModelConfig::new(self.generation, sources))
    }
}

use StemId::*;

/// Keys belonging to the cross-domain transformer of the 4-stage models.
const TRANSFORMER_PREFIXES: &[&str] = &[
    "crosstransformer",
    "channel_upsampler",
    "channel_downsampler",
    "channel_upsampler_t",
    "channel_downsampler_t",
];

pub const HTDEMUCS: ModelInfo = ModelInfo {
    id: HTDEMUCS_ID,
    generation: Generation::Hybrid,
    stems: &[Drums, Bass, Other, Vocals],
    signature: "955717e8",
    external_prefixes: TRANSFORMER_PREFIXES,
};

pub const HTDEMUCS_6S: ModelInfo = ModelInfo {
    id: HTDEMUCS_6S_ID,
    generation: Generation::Hybrid,
    stems: &[Drums, Bass, Other, Vocals, Guitar, Piano],
    signature: "5c90dfd2",
    external_prefixes: TRANSFORMER_PREFIXES,
};

pub const HDEMUCS_MMI: ModelInfo = ModelInfo {
    id: HDEMUCS_MMI_ID,
    generation: Generation::HybridShared,
    stems: &[Drums, Bass, Other, Vocals],
    signature: "75fc33f5",
    external_prefixes: &[],
};

pub const ALL_MODELS: &[&ModelInfo] = &[&HTDEMUCS, &HTDEMUCS_6S, &HDEMUCS_MMI];

pub const HTDEMUCS_ID: &str = "htdemucs";
pub const HTDEMUCS_6S_ID: &str = "htdemucs_6s";
pub const HDEMUCS_MMI_ID: &str = "hdemucs_mmi";

pub fn find(id: &str) -> Option<&'static ModelInfo> {
    ALL_MODELS.iter().copied().find(|m| m.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_configs() {
        let six = find("htdemucs_6s").and_then(ModelInfo::config).unwrap();
        assert_eq!(six.sources, SourceCount::Six);
        assert_eq!(six.freq_channels_out(), 24);
        let mmi = find(HDEMUCS_MMI_ID).and_then(ModelInfo::config).unwrap();
        assert_eq!(mmi.generation, Generation::HybridShared);
        assert!(HDEMUCS_MMI.external_prefixes.is_empty());
        assert!(find("htdemucs_ft").is_none());
    }

    #[test]
    fn stem_names_are_unique() {
        let names: Vec<&str> = HTDEMUCS_6S.stems.iter().map(StemId::as_str).collect();
        let mut sorted = names.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), names.len());
    }
}
