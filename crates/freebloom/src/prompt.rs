//! Per-frame prompts and prompt sequencers
//!
//! A [`PromptSequencer`] expands one base prompt into one description per
//! frame. The animator treats it as a pure function and checks the length of
//! what comes back with [`check_sequence`] before touching the model.

use std::path::Path;
use std::sync::Arc;

use crate::error::{AnimateError, SequencerError};

/// Text of one frame, immutable once sequenced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    index: usize,
    text: Arc<str>,
}

impl Prompt {
    pub fn new(index: usize, text: impl Into<Arc<str>>) -> Self {
        Self {
            index,
            text: text.into(),
        }
    }

    /// Global frame index
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Expands a base prompt into an ordered per-frame sequence
pub trait PromptSequencer: Send + Sync {
    fn sequence(&self, base_prompt: &str, frame_count: usize) -> Result<Vec<String>, SequencerError>;
}

/// Validate a sequencer's output and index it
pub fn check_sequence(texts: Vec<String>, frame_count: usize) -> Result<Vec<Prompt>, AnimateError> {
    if texts.len() != frame_count {
        return Err(AnimateError::Sequencing {
            expected: frame_count,
            actual: texts.len(),
        });
    }
    Ok(texts
        .into_iter()
        .enumerate()
        .map(|(i, text)| Prompt::new(i, text))
        .collect())
}

/// Returns a fixed list of prompts, ignoring the base prompt
///
/// Useful for replaying a sequence produced elsewhere, such as a JSON array
/// written by an LLM director.
#[derive(Debug, Clone)]
pub struct ScriptedSequencer {
    prompts: Vec<String>,
}

impl ScriptedSequencer {
    pub fn new(prompts: Vec<String>) -> Self {
        Self { prompts }
    }

    /// Parse a JSON array of strings
    pub fn from_json(source: &str) -> Result<Self, SequencerError> {
        let prompts: Vec<String> = serde_json::from_str(source)?;
        Ok(Self::new(prompts))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SequencerError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| SequencerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&source)
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

impl PromptSequencer for ScriptedSequencer {
    fn sequence(&self, _base_prompt: &str, _frame_count: usize) -> Result<Vec<String>, SequencerError> {
        Ok(self.prompts.clone())
    }
}

/// Spreads ordered stage phrases evenly over the frames
///
/// Frame `i` of `n` gets stage `i * stages / n`, so every stage covers a
/// contiguous run of frames.
#[derive(Debug, Clone)]
pub struct StagedSequencer {
    stages: Vec<String>,
}

impl StagedSequencer {
    pub fn new<S: Into<String>>(stages: impl IntoIterator<Item = S>) -> Self {
        Self {
            stages: stages.into_iter().map(Into::into).collect(),
        }
    }
}

impl PromptSequencer for StagedSequencer {
    fn sequence(&self, base_prompt: &str, frame_count: usize) -> Result<Vec<String>, SequencerError> {
        if self.stages.is_empty() {
            return Ok(vec![base_prompt.to_string(); frame_count]);
        }
        Ok((0..frame_count)
            .map(|i| {
                let stage = &self.stages[i * self.stages.len() / frame_count];
                if base_prompt.is_empty() {
                    stage.clone()
                } else {
                    format!("{base_prompt}, {stage}")
                }
            })
            .collect())
    }
}
