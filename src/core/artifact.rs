//! Artifacts emitted by the engine and the collections that receive them.
//!
//! The engine never stores what it discovers: every basic block and
//! cross-reference is handed to an `ArtifactCollection` the moment it is
//! observed, in discovery order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use tracing::info;

use crate::core::basic_block::BasicBlock;
use crate::core::reference::{CallXref, JumpXref, MemoryReadXref, MemoryWriteXref};
use crate::error::{AnalysisError, Result};

/// One observed fact about the program.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifact {
    BasicBlock(BasicBlock),
    Call(CallXref),
    Jump(JumpXref),
    MemoryRead(MemoryReadXref),
    MemoryWrite(MemoryWriteXref),
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Artifact::BasicBlock(bb) => write!(f, "{}", bb),
            Artifact::Call(x) => write!(f, "{}", x),
            Artifact::Jump(x) => write!(f, "{}", x),
            Artifact::MemoryRead(x) => write!(f, "{}", x),
            Artifact::MemoryWrite(x) => write!(f, "{}", x),
        }
    }
}

impl From<BasicBlock> for Artifact {
    fn from(v: BasicBlock) -> Self {
        Artifact::BasicBlock(v)
    }
}

impl From<CallXref> for Artifact {
    fn from(v: CallXref) -> Self {
        Artifact::Call(v)
    }
}

impl From<JumpXref> for Artifact {
    fn from(v: JumpXref) -> Self {
        Artifact::Jump(v)
    }
}

impl From<MemoryReadXref> for Artifact {
    fn from(v: MemoryReadXref) -> Self {
        Artifact::MemoryRead(v)
    }
}

impl From<MemoryWriteXref> for Artifact {
    fn from(v: MemoryWriteXref) -> Self {
        Artifact::MemoryWrite(v)
    }
}

/// Sink for emitted artifacts.
///
/// A failing `record` (e.g. a broken output stream) aborts the exploration
/// that produced the artifact.
pub trait ArtifactCollection {
    fn record(&mut self, artifact: Artifact) -> Result<()>;

    fn add_basic_block(&mut self, block: BasicBlock) -> Result<()> {
        self.record(block.into())
    }

    fn add_call_xref(&mut self, xref: CallXref) -> Result<()> {
        self.record(xref.into())
    }

    fn add_jump_xref(&mut self, xref: JumpXref) -> Result<()> {
        self.record(xref.into())
    }

    fn add_memory_read_xref(&mut self, xref: MemoryReadXref) -> Result<()> {
        self.record(xref.into())
    }

    fn add_memory_write_xref(&mut self, xref: MemoryWriteXref) -> Result<()> {
        self.record(xref.into())
    }
}

impl<C: ArtifactCollection + ?Sized> ArtifactCollection for &mut C {
    fn record(&mut self, artifact: Artifact) -> Result<()> {
        (**self).record(artifact)
    }
}

/// Ordered in-memory artifact list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLog {
    artifacts: Vec<Artifact>,
}

impl ArtifactLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn into_artifacts(self) -> Vec<Artifact> {
        self.artifacts
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn basic_blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.artifacts.iter().filter_map(|a| match a {
            Artifact::BasicBlock(b) => Some(b),
            _ => None,
        })
    }

    pub fn call_xrefs(&self) -> impl Iterator<Item = &CallXref> {
        self.artifacts.iter().filter_map(|a| match a {
            Artifact::Call(x) => Some(x),
            _ => None,
        })
    }

    pub fn jump_xrefs(&self) -> impl Iterator<Item = &JumpXref> {
        self.artifacts.iter().filter_map(|a| match a {
            Artifact::Jump(x) => Some(x),
            _ => None,
        })
    }

    pub fn memory_read_xrefs(&self) -> impl Iterator<Item = &MemoryReadXref> {
        self.artifacts.iter().filter_map(|a| match a {
            Artifact::MemoryRead(x) => Some(x),
            _ => None,
        })
    }

    pub fn memory_write_xrefs(&self) -> impl Iterator<Item = &MemoryWriteXref> {
        self.artifacts.iter().filter_map(|a| match a {
            Artifact::MemoryWrite(x) => Some(x),
            _ => None,
        })
    }
}

impl ArtifactCollection for ArtifactLog {
    fn record(&mut self, artifact: Artifact) -> Result<()> {
        self.artifacts.push(artifact);
        Ok(())
    }
}

/// Reports each artifact as a `tracing` event and keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingArtifactCollection;

impl ArtifactCollection for LoggingArtifactCollection {
    fn record(&mut self, artifact: Artifact) -> Result<()> {
        info!(artifact = %artifact, "artifact");
        Ok(())
    }
}

/// Writes one JSON object per artifact, newline separated.
#[derive(Debug)]
pub struct JsonLinesCollection<W: Write> {
    writer: W,
    written: usize,
}

impl<W: Write> JsonLinesCollection<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }

    /// Flush and return the underlying writer.
    pub fn into_inner(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

impl<W: Write> ArtifactCollection for JsonLinesCollection<W> {
    fn record(&mut self, artifact: Artifact) -> Result<()> {
        serde_json::to_writer(&mut self.writer, &artifact)
            .map_err(|e| AnalysisError::Io(std::io::Error::other(e)))?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }
}
