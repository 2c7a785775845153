use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of resource a collaboration room is scoped to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Page,
    Database,
    Task,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Page => "page",
            ResourceType::Database => "database",
            ResourceType::Task => "task",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = crate::CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "page" => Ok(ResourceType::Page),
            "database" => Ok(ResourceType::Database),
            "task" => Ok(ResourceType::Task),
            other => Err(crate::CollabError::protocol(format!(
                "unknown resource type '{}'",
                other
            ))),
        }
    }
}

/// The room a resource session is joined to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub workspace_id: String,
    pub resource_type: ResourceType,
    pub resource_id: String,
}

impl ResourceIdentity {
    pub fn new(
        workspace_id: impl Into<String>,
        resource_type: ResourceType,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            resource_type,
            resource_id: resource_id.into(),
        }
    }

    /// Endpoint path of the room: `ws/collab/<workspace>/<type>/<id>/`
    pub fn room_path(&self) -> String {
        format!(
            "ws/collab/{}/{}/{}/",
            self.workspace_id, self.resource_type, self.resource_id
        )
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.workspace_id, self.resource_type, self.resource_id
        )
    }
}
