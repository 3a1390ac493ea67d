//! Which frames each frame may attend to

use serde::{Deserialize, Serialize};

/// Cross-frame attention topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttentionTopology {
    /// Every frame reads frame 0
    #[default]
    AnchorFirst,
    /// Frame i reads frame i-1
    Chain,
    /// Every frame reads every other frame
    Full,
    /// Frame i reads frame 0 and frame i-1
    AnchorChain,
}

/// A key/value source a frame may read
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AttentionSource {
    /// Frame at this index within the batch
    Frame(usize),
    /// Anchor carried over from a previous batch
    Carried(usize),
}

/// Per-frame attention sources of one batch, fixed for its lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionLinkSet {
    links: Vec<Vec<AttentionSource>>,
}

impl AttentionLinkSet {
    /// Links for `frames` in-batch frames plus `carried` anchors from earlier
    /// batches, which every frame reads first
    pub fn build(topology: AttentionTopology, frames: usize, carried: usize) -> Self {
        let links = (0..frames)
            .map(|i| {
                let mut sources: Vec<AttentionSource> =
                    (0..carried).map(AttentionSource::Carried).collect();
                let in_batch: Vec<usize> = match topology {
                    AttentionTopology::AnchorFirst => (i > 0).then_some(0).into_iter().collect(),
                    AttentionTopology::Chain => i.checked_sub(1).into_iter().collect(),
                    AttentionTopology::Full => (0..frames).filter(|&j| j != i).collect(),
                    AttentionTopology::AnchorChain => match i {
                        0 => vec![],
                        1 => vec![0],
                        _ => vec![0, i - 1],
                    },
                };
                sources.extend(in_batch.into_iter().map(AttentionSource::Frame));
                sources
            })
            .collect();
        Self { links }
    }

    /// Sources frame `frame` reads, in concatenation order
    pub fn sources(&self, frame: usize) -> &[AttentionSource] {
        self.links.get(frame).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// In-batch frames some frame reads, ascending
    pub fn referenced_frames(&self) -> Vec<usize> {
        let mut frames: Vec<usize> = self
            .links
            .iter()
            .flatten()
            .filter_map(|source| match source {
                AttentionSource::Frame(j) => Some(*j),
                AttentionSource::Carried(_) => None,
            })
            .collect();
        frames.sort_unstable();
        frames.dedup();
        frames
    }
}
