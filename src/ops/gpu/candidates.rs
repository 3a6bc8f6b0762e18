//! Kernel configuration candidates for the GPU backend.
//!
//! For a given operator and input shape/layout the generator enumerates the
//! finite search space the autotuner will benchmark. Generation is
//! deterministic: identical inputs always yield identical, identically
//! ordered candidates. Order is only an iteration order; ranking is
//! established empirically on the device.

use crate::desc::{TensorDescriptor, TensorLayout};
use crate::error::Error;

/// Kernel family a configuration belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// Direct (non-transformed) kernel.
    Direct,
}

/// Tiling/vectorization parameters selecting one kernel variant.
///
/// A value type: comparable, hashable, cheap to copy, safe to cache. The
/// "must autotune" state is expressed by callers as
/// `Option<KernelConfiguration>` being `None`, never by a sentinel field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelConfiguration {
    /// Kernel family.
    pub algorithm: Algorithm,
    /// Output positions computed per work item along the tiled axis.
    pub tile_w: u32,
    /// Input-channel group factor.
    pub group_c: u32,
    /// Output-vector width; zero means no output vectorization.
    pub vec_k: u32,
}

/// Ordered candidate configurations, grouped by algorithm.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateSet {
    groups: Vec<(Algorithm, Vec<KernelConfiguration>)>,
}

impl CandidateSet {
    /// Appends a `(algorithm, configurations)` group.
    pub fn push_group(&mut self, algorithm: Algorithm, configs: Vec<KernelConfiguration>) {
        self.groups.push((algorithm, configs));
    }

    /// Groups in generation order.
    pub fn groups(&self) -> &[(Algorithm, Vec<KernelConfiguration>)] {
        &self.groups
    }

    /// All candidates in generation order, groups flattened.
    pub fn iter(&self) -> impl Iterator<Item = &KernelConfiguration> {
        self.groups.iter().flat_map(|(_, cfgs)| cfgs.iter())
    }

    /// Total candidate count across all groups.
    pub fn len(&self) -> usize {
        self.groups.iter().map(|(_, cfgs)| cfgs.len()).sum()
    }

    /// True when no group holds any candidate.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tile widths of every candidate, in order. Shape inference uses these
    /// to pad the time axis of sequence-packed inputs.
    pub fn tile_widths(&self) -> impl Iterator<Item = u32> + '_ {
        self.iter().map(|c| c.tile_w)
    }
}

/// Enumerates the fully-connected kernel configurations worth benchmarking
/// for this input/filter/output combination.
///
/// - Spatial input with a non-unit filter: a single candidate whose tile
///   width amortizes at least 64 output rows per tile.
/// - Spatial input with a unit (1×1) filter: a family of channel-group
///   factors 4, 8, 16; factor `8·2^i` gates enumeration of the next step,
///   so configurations the hardware cannot execute without padding overhead
///   are pruned.
/// - Sequence-packed input: tile widths 1..=8 at output-vector width 4,
///   then tile widths 1..=4 at width 8 — the wider tier only when every
///   declared output's feature extent is divisible by 8, reflecting the
///   device's vector alignment requirement.
pub fn fully_connected_candidates(
    input: &TensorDescriptor,
    filter: &TensorDescriptor,
    outputs: &[TensorDescriptor],
) -> Result<CandidateSet, Error> {
    let (fh, fw) = (filter.height(), filter.width());
    let mut set = CandidateSet::default();
    match input.layout() {
        TensorLayout::Nchw => {
            let (ic, ih, iw) = (input.channels(), input.height(), input.width());
            if ih != 1 || iw != 1 || fh != 1 || fw != 1 {
                let tile = 64usize.div_ceil(ih.max(1)).min(iw.max(1)) as u32;
                set.push_group(
                    Algorithm::Direct,
                    vec![KernelConfiguration {
                        algorithm: Algorithm::Direct,
                        tile_w: tile,
                        group_c: 4,
                        vec_k: 4,
                    }],
                );
            } else {
                // Degenerate fully-connected as 1x1 convolution.
                let mut configs = Vec::new();
                let mut gate = 8usize;
                for i in 0..3u32 {
                    configs.push(KernelConfiguration {
                        algorithm: Algorithm::Direct,
                        tile_w: 1,
                        group_c: 1 << (2 + i),
                        vec_k: 0,
                    });
                    if ic % gate != 0 {
                        break;
                    }
                    gate <<= 1;
                }
                set.push_group(Algorithm::Direct, configs);
            }
        }
        TensorLayout::Mkt => {
            let align8 = outputs.iter().all(|o| o.channels() % 8 == 0);
            let mut configs = Vec::new();
            let mut tiles = 8u32;
            let mut vec_k = 4u32;
            for _ in 0..2 {
                for j in 0..tiles {
                    configs.push(KernelConfiguration {
                        algorithm: Algorithm::Direct,
                        tile_w: j + 1,
                        group_c: 4,
                        vec_k,
                    });
                }
                if !align8 {
                    break;
                }
                tiles = 4;
                vec_k = 8;
            }
            set.push_group(Algorithm::Direct, configs);
        }
        TensorLayout::ChanVec4 => return Err(Error::UnsupportedLayout),
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::DataType;

    fn nchw(c: usize, h: usize, w: usize) -> TensorDescriptor {
        TensorDescriptor::nchw(DataType::F32, 1, c, h, w)
    }

    fn filt(n: usize, c: usize, h: usize, w: usize) -> TensorDescriptor {
        TensorDescriptor::nchw(DataType::F32, n, c, h, w)
    }

    #[test]
    fn spatial_non_unit_filter_yields_one_candidate() {
        let input = nchw(16, 9, 40);
        let filter = filt(32, 16, 9, 40);
        let out = nchw(32, 1, 1);
        let set = fully_connected_candidates(&input, &filter, &[out]).unwrap();
        assert_eq!(set.len(), 1);
        let cfg = *set.iter().next().unwrap();
        // ceil(64/9) = 8, below the input width of 40.
        assert_eq!((cfg.tile_w, cfg.group_c, cfg.vec_k), (8, 4, 4));
    }

    #[test]
    fn spatial_tile_clamps_to_input_width() {
        let input = nchw(16, 2, 5);
        let filter = filt(8, 16, 2, 5);
        let out = nchw(8, 1, 1);
        let set = fully_connected_candidates(&input, &filter, &[out]).unwrap();
        let cfg = *set.iter().next().unwrap();
        // ceil(64/2) = 32 exceeds the width, so the tile is the width.
        assert_eq!(cfg.tile_w, 5);
    }

    #[test]
    fn unit_filter_prunes_on_channel_divisibility() {
        // 24 channels: divisible by 8 but not 16 -> the gate admits the
        // second candidate and stops the third.
        let set =
            fully_connected_candidates(&nchw(24, 1, 1), &filt(10, 24, 1, 1), &[nchw(10, 1, 1)])
                .unwrap();
        assert_eq!(set.len(), 2);
        let groups: Vec<u32> = set.iter().map(|c| c.group_c).collect();
        assert_eq!(groups, vec![4, 8]);

        // 7 channels fail the first gate: only the base candidate survives.
        let set =
            fully_connected_candidates(&nchw(7, 1, 1), &filt(10, 7, 1, 1), &[nchw(10, 1, 1)])
                .unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.iter().next().unwrap().group_c, 4);

        // 32 channels pass both gates: the full family.
        let set =
            fully_connected_candidates(&nchw(32, 1, 1), &filt(10, 32, 1, 1), &[nchw(10, 1, 1)])
                .unwrap();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn mkt_wide_tier_requires_aligned_outputs() {
        let input = TensorDescriptor::mkt(DataType::F32, 1, 64, 10);
        let filter = filt(96, 64, 1, 1);
        let aligned = TensorDescriptor::mkt(DataType::F32, 1, 96, 10);
        let set = fully_connected_candidates(&input, &filter, &[aligned]).unwrap();
        assert_eq!(set.len(), 12);
        let widths: Vec<u32> = set.iter().map(|c| c.vec_k).collect();
        assert_eq!(&widths[..8], &[4; 8]);
        assert_eq!(&widths[8..], &[8; 4]);

        let ragged = TensorDescriptor::mkt(DataType::F32, 1, 100, 10);
        let set = fully_connected_candidates(&input, &filter, &[ragged]).unwrap();
        assert_eq!(set.len(), 8);
        assert!(set.iter().all(|c| c.vec_k == 4));
    }

    #[test]
    fn generation_is_deterministic() {
        let input = TensorDescriptor::mkt(DataType::F32, 2, 48, 7);
        let filter = filt(64, 48, 1, 1);
        let out = TensorDescriptor::mkt(DataType::F32, 2, 64, 7);
        let a = fully_connected_candidates(&input, &filter, &[out]).unwrap();
        let b = fully_connected_candidates(&input, &filter, &[out]).unwrap();
        assert_eq!(a, b);
    }
}
