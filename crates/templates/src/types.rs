use serde::{Deserialize, Serialize};

/// What a template injects into a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    /// Freeform instructions written to the workspace `CLAUDE.md`.
    Instructions,
    /// A `SKILL.md` document with YAML frontmatter.
    Skill,
    /// Strict-JSON MCP server definition carrying `command` and `args`.
    McpServer,
    /// A slash-command markdown file.
    Command,
}

impl TemplateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Instructions => "instructions",
            Self::Skill => "skill",
            Self::McpServer => "mcp_server",
            Self::Command => "command",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "instructions" => Some(Self::Instructions),
            "skill" => Some(Self::Skill),
            "mcp_server" => Some(Self::McpServer),
            "command" => Some(Self::Command),
            _ => None,
        }
    }
}

/// A catalog entry. `(name, kind)` is unique; the same name may exist in
/// two different kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigTemplate {
    pub id: String,
    pub name: String,
    pub kind: TemplateKind,
    pub description: Option<String>,
    pub content: String,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// Create input.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTemplate {
    pub name: String,
    pub kind: TemplateKind,
    #[serde(default)]
    pub description: Option<String>,
    pub content: String,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplatePatch {
    pub name: Option<String>,
    pub kind: Option<TemplateKind>,
    pub description: Option<String>,
    pub content: Option<String>,
}
