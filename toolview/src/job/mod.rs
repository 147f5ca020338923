//! Job descriptors and artifact resolution

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Backend job identifier
pub type JobId = u64;

/// What a job produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Assembly,
    #[serde(alias = "cam")]
    ToolpathGeneration,
    #[serde(alias = "sim")]
    Simulation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    /// Success or failure; the job will not change any more
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Kind of a job result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtefactKind {
    #[serde(alias = "fcstd")]
    SourceModel,
    #[serde(alias = "gcode")]
    ToolpathText,
    #[serde(alias = "sim-mesh")]
    SimulationMesh,
    Log,
}

impl std::fmt::Display for ArtefactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtefactKind::SourceModel => write!(f, "source-model"),
            ArtefactKind::ToolpathText => write!(f, "toolpath-text"),
            ArtefactKind::SimulationMesh => write!(f, "simulation-mesh"),
            ArtefactKind::Log => write!(f, "log"),
        }
    }
}

/// Reference to a fetchable job result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtefactRef {
    #[serde(alias = "type")]
    pub kind: ArtefactKind,
    /// URL the artifact bytes can be fetched from
    #[serde(alias = "signed_url")]
    pub locator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, alias = "sha256", skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Job snapshot as returned by the job API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(alias = "type")]
    pub kind: JobKind,
    pub status: JobStatus,
    pub created_at: String,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metrics: HashMap<String, serde_json::Value>,
    /// Results in the order the backend produced them
    #[serde(default, deserialize_with = "null_as_default")]
    pub artefacts: Vec<ArtefactRef>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Job {
    /// First artifact of the requested kind.
    ///
    /// `None` means the result has not been produced yet.
    pub fn resolve(&self, kind: ArtefactKind) -> Option<&ArtefactRef> {
        resolve(&self.artefacts, kind)
    }

    pub fn has_artefact(&self, kind: ArtefactKind) -> bool {
        self.resolve(kind).is_some()
    }

    /// UI actions this snapshot allows
    pub fn permitted_actions(&self) -> JobActions {
        let has_toolpath = self.has_artefact(ArtefactKind::ToolpathText);
        JobActions {
            generate_toolpath: self.kind == JobKind::Assembly && !has_toolpath,
            start_simulation: has_toolpath,
            view_simulation: self.has_artefact(ArtefactKind::SimulationMesh),
            download_toolpath: has_toolpath,
        }
    }
}

/// First match by kind in list order
pub fn resolve(artefacts: &[ArtefactRef], kind: ArtefactKind) -> Option<&ArtefactRef> {
    artefacts.iter().find(|a| a.kind == kind)
}

/// Which job actions the UI may offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct JobActions {
    pub generate_toolpath: bool,
    pub start_simulation: bool,
    pub view_simulation: bool,
    pub download_toolpath: bool,
}
