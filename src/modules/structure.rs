use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::modules::world::{AgentId, Position};

pub type StructureId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StructureKind {
    Basic,
    Block,
    Programmable,
}

impl StructureKind {
    pub const fn label(self) -> &'static str {
        match self {
            StructureKind::Basic => "basic",
            StructureKind::Block => "block",
            StructureKind::Programmable => "programmable",
        }
    }

    /// Programmable structures need one transistor besides the Qi cost.
    pub const fn needs_transistor(self) -> bool {
        matches!(self, StructureKind::Programmable)
    }
}

impl fmt::Display for StructureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for StructureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "basic" => Ok(StructureKind::Basic),
            "block" => Ok(StructureKind::Block),
            "programmable" => Ok(StructureKind::Programmable),
            other => Err(format!(
                "unknown structure kind '{}', use basic|block|programmable",
                other
            )),
        }
    }
}

/// A placed structure. The owner is an id into the world's agent registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Structure {
    pub id: StructureId,
    pub kind: StructureKind,
    pub position: Position,
    pub owner: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<Vec<u8>>,
}
