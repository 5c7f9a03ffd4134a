//! Loading of per-level policy documents

use std::path::{Path, PathBuf};

use super::error::{FieldError, PolicyError};
use super::schema;
use super::types::{PolicyDocument, PolicyLevel};

/// Project-level policy location, relative to a workspace
pub const PROJECT_POLICY_PATH: &str = ".aibox/policy.toml";

/// The parsed documents of one policy hierarchy
#[derive(Debug, Clone)]
pub struct PolicyHierarchy {
    pub org: PolicyDocument,
    pub team: Option<PolicyDocument>,
    pub project: Option<PolicyDocument>,
}

impl PolicyHierarchy {
    /// Present levels, least specific first
    pub fn levels(&self) -> Vec<(PolicyLevel, &PolicyDocument)> {
        let mut levels = vec![(PolicyLevel::Org, &self.org)];
        if let Some(team) = &self.team {
            levels.push((PolicyLevel::Team, team));
        }
        if let Some(project) = &self.project {
            levels.push((PolicyLevel::Project, project));
        }
        levels
    }

    /// Validate every present level, prefixing errors with the level name
    pub fn validate(&self) -> Vec<FieldError> {
        self.levels()
            .into_iter()
            .flat_map(|(level, doc)| {
                schema::validate(doc)
                    .into_iter()
                    .map(move |e| e.with_level(level))
            })
            .collect()
    }
}

/// Loads policy documents from disk
pub struct PolicyStore;

impl PolicyStore {
    /// Load one document. An explicitly given path that does not exist is an error.
    pub fn load(path: &Path) -> Result<PolicyDocument, PolicyError> {
        if !path.exists() {
            return Err(PolicyError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|source| PolicyError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let parsed = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        } else {
            toml::from_str(&content).map_err(|e| e.to_string())
        };

        let doc = parsed.map_err(|message| PolicyError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        tracing::debug!("Loaded policy document from {}", path.display());
        Ok(doc)
    }

    /// Load the org/team/project hierarchy.
    ///
    /// `org` is required; an absent or empty team/project path yields `None`
    /// for that level.
    pub fn load_hierarchy(
        org: Option<&Path>,
        team: Option<&Path>,
        project: Option<&Path>,
    ) -> Result<PolicyHierarchy, PolicyError> {
        let org_path = non_empty(org).ok_or(PolicyError::OrgPolicyRequired)?;
        let org = Self::load(org_path)?;

        let team = non_empty(team).map(Self::load).transpose()?;
        let project = non_empty(project).map(Self::load).transpose()?;

        tracing::info!(
            "Loaded policy hierarchy (team: {}, project: {})",
            team.is_some(),
            project.is_some()
        );

        Ok(PolicyHierarchy { org, team, project })
    }

    /// Project policy path for a workspace, if the file exists
    pub fn project_policy_for(workspace: &Path) -> Option<PathBuf> {
        let path = workspace.join(PROJECT_POLICY_PATH);
        path.exists().then_some(path)
    }
}

fn non_empty(path: Option<&Path>) -> Option<&Path> {
    path.filter(|p| !p.as_os_str().is_empty())
}
